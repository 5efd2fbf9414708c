//! Symbol-table stream dumper.
//!
//! Emitted as the prologue of both profile streams so the offline tools
//! can map the raw addresses in samples and allocation events back to
//! names. Consumers rely on the prologue + final-marker bracketing.
//!
//! ```text
//! symtab         := prologue sym*
//! prologue       := 'l' 'j' 's' version reserved
//! version        := <BYTE>
//! reserved       := <BYTE> <BYTE> <BYTE>
//! sym            := sym-lua | sym-cfunc | sym-trace | sym-final
//! sym-lua        := sym-header sym-addr sym-chunk sym-line
//! sym-cfunc      := sym-header sym-addr sym-name
//! sym-trace      := sym-header traceno trace-addr sym-addr sym-line
//! sym-final      := sym-header
//! sym-header     := <BYTE>
//! sym-chunk      := string
//! sym-name       := string
//! string         := string-len string-payload
//! string-len     := <ULEB128>
//! string-payload := <BYTE> {string-len}
//! ```
//!
//! `sym-header` is `[F U U U U U T T]` (hi to lo): two bits of symbol
//! kind, five unused bits, and the top bit marking the final sentinel.

use std::ffi::CStr;
use std::ptr;

use libc;
use libc::{c_char, c_int, c_void, dl_phdr_info, size_t};

use raw;
use vm::{SymbolRecord, Vm};
use wbuf::Wbuf;

pub const SYMTAB_VERSION: u8 = 0x2;

pub const SYMTAB_LFUNC: u8 = 0;
pub const SYMTAB_CFUNC: u8 = 1;
pub const SYMTAB_TRACE: u8 = 2;
pub const SYMTAB_FINAL: u8 = 0x80;

const LJS_HEADER: [u8; 7] = [b'l', b'j', b's', SYMTAB_VERSION, 0x0, 0x0, 0x0];

/// Dumps the symbol table into `out`: prologue, one record per function
/// prototype (and trace) on the GC root chain, then — when `lib_adds` is
/// given — one record per exported function of each loaded shared object,
/// then the final sentinel.
///
/// `lib_adds` is the host-symbol cursor: it carries the loader's load
/// counter from the previous dump, so objects that are already in the
/// stream are not emitted twice. Pass `None` to skip host symbols
/// entirely.
pub fn dump(out: &mut Wbuf, vm: &dyn Vm, lib_adds: Option<&mut u64>) {
    out.addn(&LJS_HEADER);

    vm.visit_symbols(&mut |sym| match sym {
        SymbolRecord::Proto {
            addr,
            chunk,
            first_line,
        } => {
            out.addbyte(SYMTAB_LFUNC);
            out.addu64(addr);
            out.addstring(chunk);
            out.addu64(first_line);
        }
        SymbolRecord::Trace {
            traceno,
            mcode,
            proto,
            line,
        } => {
            out.addbyte(SYMTAB_TRACE);
            out.addu64(traceno);
            out.addu64(mcode);
            out.addu64(proto);
            out.addu64(line);
        }
    });

    if let Some(lib_adds) = lib_adds {
        dump_shared_objects(out, lib_adds);
    }

    out.addbyte(SYMTAB_FINAL);
}

struct Resolver<'a> {
    out: &'a mut Wbuf,
    /// Load base of the vDSO, which has no backing file and is skipped.
    vdso_base: u64,
    /// Loader load-counter value at the previous dump.
    prev_adds: u64,
    /// Loader load-counter value observed on this pass.
    seen_adds: u64,
    cur_lib: u64,
}

fn dump_shared_objects(out: &mut Wbuf, lib_adds: &mut u64) {
    let vdso_base = unsafe { libc::getauxval(raw::AT_SYSINFO_EHDR) } as u64;
    let mut resolver = Resolver {
        out,
        vdso_base,
        prev_adds: *lib_adds,
        seen_adds: *lib_adds,
        cur_lib: 0,
    };

    unsafe {
        libc::dl_iterate_phdr(
            Some(resolve_symbolnames),
            &mut resolver as *mut Resolver as *mut c_void,
        );
    }

    *lib_adds = resolver.seen_adds;
}

unsafe extern "C" fn resolve_symbolnames(
    info: *mut dl_phdr_info,
    _size: size_t,
    data: *mut c_void,
) -> c_int {
    let conf = &mut *(data as *mut Resolver);
    let info = &*info;

    // The loader bumps dlpi_adds once per object it has ever mapped in;
    // stashing it lets the next pass know where this one stopped.
    conf.seen_adds = info.dlpi_adds as u64;

    conf.cur_lib += 1;
    if conf.cur_lib <= conf.prev_adds {
        // Already covered by a previous dump.
        return 0;
    }
    if info.dlpi_addr as u64 == conf.vdso_base {
        return 0;
    }

    dump_object(conf.out, info);
    0
}

/// Walks one loaded object's dynamic section and emits a C-function
/// record per exported function symbol.
unsafe fn dump_object(out: &mut Wbuf, info: &dl_phdr_info) {
    let mut dynamic: *const raw::Elf64_Dyn = ptr::null();
    for i in 0..info.dlpi_phnum as isize {
        let phdr = &*info.dlpi_phdr.offset(i);
        if phdr.p_type == raw::PT_DYNAMIC {
            dynamic =
                (info.dlpi_addr as u64).wrapping_add(phdr.p_vaddr) as usize as *const raw::Elf64_Dyn;
            break;
        }
    }
    if dynamic.is_null() {
        return;
    }

    let mut symtab: u64 = 0;
    let mut strtab: u64 = 0;
    let mut sysv_hash: u64 = 0;
    let mut gnu_hash: u64 = 0;

    // NOTE(unsafe): the dynamic loader relocates these entries in place,
    // so d_val already holds absolute addresses for loaded objects.
    let mut entry = dynamic;
    while (*entry).d_tag != raw::DT_NULL {
        match (*entry).d_tag {
            raw::DT_SYMTAB => symtab = (*entry).d_val,
            raw::DT_STRTAB => strtab = (*entry).d_val,
            raw::DT_HASH => sysv_hash = (*entry).d_val,
            raw::DT_GNU_HASH => gnu_hash = (*entry).d_val,
            _ => {}
        }
        entry = entry.offset(1);
    }
    if symtab == 0 || strtab == 0 {
        return;
    }

    // The dynsym section carries no explicit length; it has to be sized
    // through whichever hash table the object ships.
    let symcount = if sysv_hash != 0 {
        sysv_symbol_count(sysv_hash as usize as *const u32)
    } else if gnu_hash != 0 {
        gnu_symbol_count(gnu_hash as usize as *const u32)
    } else {
        return;
    };

    let syms = symtab as usize as *const raw::Elf64_Sym;
    for i in 0..symcount {
        let sym = &*syms.add(i);
        if raw::elf64_st_type(sym.st_info) != raw::STT_FUNC
            || sym.st_name == 0
            || sym.st_shndx == raw::SHN_UNDEF
            || sym.st_value == 0
        {
            continue;
        }

        let name = CStr::from_ptr((strtab as usize + sym.st_name as usize) as *const c_char);
        out.addbyte(SYMTAB_CFUNC);
        out.addu64((info.dlpi_addr as u64).wrapping_add(sym.st_value));
        out.addstring(name.to_bytes());
    }
}

/// SysV hash header is `[nbucket, nchain, ...]` and nchain equals the
/// number of dynsym entries.
unsafe fn sysv_symbol_count(hash: *const u32) -> usize {
    *hash.add(1) as usize
}

/// GNU hash tables do not store a symbol count. The highest chain start
/// across all buckets is located, then that chain is walked until an
/// entry with the low bit set terminates it; the last visited index plus
/// one is the count.
unsafe fn gnu_symbol_count(hash: *const u32) -> usize {
    let nbuckets = *hash as usize;
    let symoffset = *hash.add(1) as usize;
    let bloom_size = *hash.add(2) as usize;

    // Header is four u32 words, then `bloom_size` 64-bit bloom words.
    let buckets = (hash.add(4) as *const u8).add(bloom_size * 8) as *const u32;
    let chain = buckets.add(nbuckets);

    let mut last = 0usize;
    for i in 0..nbuckets {
        let start = *buckets.add(i) as usize;
        if start > last {
            last = start;
        }
    }
    if last < symoffset {
        // Nothing is hashed; only the unhashed prefix exists.
        return symoffset;
    }

    while *chain.add(last - symoffset) & 1 == 0 {
        last += 1;
    }
    last + 1
}
