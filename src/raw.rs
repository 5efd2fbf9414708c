#![allow(non_camel_case_types)]
#![allow(dead_code)]

//! Hand-maintained ELF declarations for the shared-object symbol sweep.
//!
//! libc covers `dl_iterate_phdr`, `dl_phdr_info` and the program headers;
//! the dynamic-section and dynsym shapes below are the few pieces it does
//! not export. Layouts per the System V gABI, 64-bit class.

use libc::c_ulong;

/// One entry of the `PT_DYNAMIC` segment. The `d_un` union is collapsed
/// to its value arm; both arms are a 64-bit word.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Elf64_Dyn {
    pub d_tag: i64,
    pub d_val: u64,
}

/// One dynamic-symbol-table entry.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Elf64_Sym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

pub const PT_DYNAMIC: u32 = 2;

pub const DT_NULL: i64 = 0;
pub const DT_HASH: i64 = 4;
pub const DT_STRTAB: i64 = 5;
pub const DT_SYMTAB: i64 = 6;
pub const DT_GNU_HASH: i64 = 0x6fff_fef5;

pub const STT_FUNC: u8 = 2;
pub const SHN_UNDEF: u16 = 0;

/// auxv key for the vDSO load address.
pub const AT_SYSINFO_EHDR: c_ulong = 33;

/// Low nibble of `st_info` is the symbol type.
pub fn elf64_st_type(info: u8) -> u8 {
    info & 0xf
}
