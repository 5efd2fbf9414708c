//! Memory-event profiler.
//!
//! Records every allocation, reallocation and free that passes through
//! the runtime allocator, attributing each event to its source context.
//!
//! ```text
//! stream         := symtab memprof
//! memprof        := prologue event* epilogue
//! prologue       := 'l' 'j' 'm' version reserved
//! version        := <BYTE>
//! reserved       := <BYTE> <BYTE> <BYTE>
//! event          := event-alloc | event-realloc | event-free
//! event-alloc    := event-header loc? naddr nsize
//! event-realloc  := event-header loc? oaddr osize naddr nsize
//! event-free     := event-header loc? oaddr osize
//! event-header   := <BYTE>
//! loc            := loc-lua | loc-c
//! loc-lua        := sym-addr line-no
//! loc-c          := sym-addr
//! epilogue       := event-header
//! ```
//!
//! `event-header` is `[F U U U S S E E]` (hi to lo): two bits of event
//! type, two bits of allocation source, three unused bits, and the top
//! bit marking the final epilogue header. Internal-source events carry no
//! location.

use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};

use libc::c_void;

use error::{Error, Result};
use symtab;
use vm::{self, AllocEvent, AllocSource, Vm};
use wbuf::{OnStop, StreamFlags, Wbuf, Writer};

pub const LJM_FORMAT_VERSION: u8 = 0x1;

/// Allocation events, low two header bits. A reallocation is the union
/// of an allocation and a free.
pub const AEVENT_ALLOC: u8 = 1;
pub const AEVENT_FREE: u8 = 2;
pub const AEVENT_REALLOC: u8 = AEVENT_ALLOC | AEVENT_FREE;

/// Allocation sources, next two header bits.
pub const ASOURCE_INT: u8 = 1 << 2;
pub const ASOURCE_LFUNC: u8 = 2 << 2;
pub const ASOURCE_CFUNC: u8 = 3 << 2;

pub const LJM_EPILOGUE_HEADER: u8 = 0x80;

const LJM_HEADER: [u8; 7] = [b'l', b'j', b'm', LJM_FORMAT_VERSION, 0x0, 0x0, 0x0];

/// Memory-profiler options. The buffer and both callbacks are required;
/// the buffer memory stays owned by the caller and is handed back through
/// `on_stop`.
#[derive(Clone, Copy)]
pub struct Options {
    /// Context for the writer and the on_stop callback.
    pub ctx: *mut c_void,
    /// Staging buffer for stream data.
    pub buf: *mut u8,
    /// The buffer's size.
    pub len: usize,
    /// Writer for profile events. Must be AS-safe: it runs inside the
    /// allocator tap.
    pub writer: Option<Writer>,
    /// Callback on profiler stopping; owns cleanup of `ctx`.
    pub on_stop: Option<OnStop>,
    /// Also dump C symbols of loaded shared objects into the symtab.
    pub host_symbols: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            ctx: ::std::ptr::null_mut(),
            buf: ::std::ptr::null_mut(),
            len: 0,
            writer: None,
            on_stop: None,
            host_symbols: false,
        }
    }
}

enum_from_primitive! {
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Idle = 0,
    Profile = 1,
    /// The stream died inside the allocator tap; the latched errno is
    /// reported by the next `stop`.
    Halt = 2,
}
}

struct Memprof {
    state: AtomicU32,
    vm: Option<&'static dyn Vm>,
    out: Wbuf,
    ctx: *mut c_void,
    buf: *mut u8,
    on_stop: Option<OnStop>,
    host_symbols: bool,
    lib_adds: u64,
    saved_errno: i32,
}

/// One memory profiler per process; see the crate docs for the
/// threading contract.
static mut MEMPROF: Memprof = Memprof {
    state: AtomicU32::new(State::Idle as u32),
    vm: None,
    out: Wbuf::INIT,
    ctx: ::std::ptr::null_mut(),
    buf: ::std::ptr::null_mut(),
    on_stop: None,
    host_symbols: false,
    lib_adds: 0,
    saved_errno: 0,
};

fn instance() -> &'static mut Memprof {
    unsafe { &mut MEMPROF }
}

fn state_of(mp: &Memprof) -> State {
    use enum_primitive::FromPrimitive;
    State::from_u32(mp.state.load(Ordering::Acquire)).unwrap_or(State::Idle)
}

/// Starts the memory profiler: validates the options, writes the symbol
/// table and the stream prologue, then installs the allocator tap.
pub fn start(vm: &'static dyn Vm, opt: &Options) -> Result<()> {
    let mp = instance();

    if state_of(mp) != State::Idle {
        return Err(Error::AlreadyRunning);
    }

    let (writer, on_stop) = match (opt.writer, opt.on_stop) {
        (Some(writer), Some(on_stop)) => (writer, on_stop),
        _ => return Err(Error::Misuse),
    };
    if opt.buf.is_null() || opt.len == 0 {
        return Err(Error::Misuse);
    }

    mp.vm = Some(vm);
    mp.ctx = opt.ctx;
    mp.buf = opt.buf;
    mp.on_stop = Some(on_stop);
    mp.host_symbols = opt.host_symbols;
    mp.saved_errno = 0;
    mp.out.init(writer, opt.ctx, opt.buf, opt.len);

    {
        let lib_adds = if mp.host_symbols {
            Some(&mut mp.lib_adds)
        } else {
            None
        };
        symtab::dump(&mut mp.out, vm, lib_adds);
    }
    mp.out.addn(&LJM_HEADER);

    if mp.out.test_flag(StreamFlags::ERRIO | StreamFlags::STOP) {
        let errno = mp.out.errno();
        // The callback owns the caller context even when start fails
        // after configuration; its own status is ignored here.
        on_stop(mp.ctx, mp.buf);
        mp.out.terminate();
        mp.vm = None;
        mp.on_stop = None;
        return Err(Error::io_from_raw(errno));
    }

    vm.set_alloc_hook(Some(memprof_hook));
    mp.state.store(State::Profile as u32, Ordering::Release);
    debug!("memprof started");
    Ok(())
}

/// Stops the memory profiler: removes the allocator tap, writes the
/// epilogue, flushes, and hands the buffer back through `on_stop`.
pub fn stop(vm: &dyn Vm) -> Result<()> {
    let mp = instance();

    let state = state_of(mp);
    if state == State::Idle {
        return Err(Error::NotRunning);
    }
    let started = match mp.vm {
        Some(started) => started,
        None => return Err(Error::NotRunning),
    };
    if !vm::same_vm(started, vm) {
        return Err(Error::Misuse);
    }

    started.set_alloc_hook(None);
    mp.vm = None;
    let on_stop = mp.on_stop.take();

    // Re-read: an event may have latched Halt between the check above
    // and the hook removal.
    if state_of(mp) == State::Halt {
        // The wbuf was terminated when the tap hit the failure; only the
        // context hand-back and the latched errno are left.
        mp.state.store(State::Idle as u32, Ordering::Release);
        let errno = mem::replace(&mut mp.saved_errno, 0);
        if let Some(on_stop) = on_stop {
            on_stop(mp.ctx, mp.buf);
        }
        return Err(Error::io_from_raw(errno));
    }

    mp.state.store(State::Idle as u32, Ordering::Release);

    mp.out.addbyte(LJM_EPILOGUE_HEADER);
    mp.out.flush();

    let cb_status = match on_stop {
        Some(on_stop) => on_stop(mp.ctx, mp.buf),
        None => 0,
    };
    if mp.out.test_flag(StreamFlags::ERRIO | StreamFlags::STOP) || cb_status != 0 {
        let errno = mp.out.errno();
        mp.out.terminate();
        return Err(Error::io_from_raw(errno));
    }

    mp.out.terminate();
    debug!("memprof stopped");
    Ok(())
}

/// Allocator tap. Runs on the VM thread, inside the allocator, so the
/// same AS-safety rules as the sampling handler apply: no allocation, no
/// locks, no logging.
fn memprof_hook(event: &AllocEvent) {
    let mp = instance();

    if state_of(mp) != State::Profile {
        return;
    }
    let vm = match mp.vm {
        Some(vm) => vm,
        None => return,
    };

    let source = vm.alloc_source();
    stream_event(&mut mp.out, event, &source);

    if mp.out.test_flag(StreamFlags::ERRIO | StreamFlags::STOP) {
        mp.saved_errno = mp.out.errno();
        mp.out.terminate();
        mp.state.store(State::Halt as u32, Ordering::Release);
    }
}

fn stream_event(out: &mut Wbuf, event: &AllocEvent, source: &AllocSource) {
    let event_bits = match *event {
        AllocEvent::Alloc { .. } => AEVENT_ALLOC,
        AllocEvent::Realloc { .. } => AEVENT_REALLOC,
        AllocEvent::Free { .. } => AEVENT_FREE,
    };
    let source_bits = match *source {
        AllocSource::Internal => ASOURCE_INT,
        AllocSource::Lua { .. } => ASOURCE_LFUNC,
        AllocSource::C { .. } => ASOURCE_CFUNC,
    };
    out.addbyte(event_bits | source_bits);

    match *source {
        AllocSource::Internal => {}
        AllocSource::Lua { sym, line } => {
            out.addu64(sym);
            out.addu64(line);
        }
        AllocSource::C { sym } => out.addu64(sym),
    }

    match *event {
        AllocEvent::Alloc { naddr, nsize } => {
            out.addu64(naddr);
            out.addu64(nsize);
        }
        AllocEvent::Realloc {
            oaddr,
            osize,
            naddr,
            nsize,
        } => {
            out.addu64(oaddr);
            out.addu64(osize);
            out.addu64(naddr);
            out.addu64(nsize);
        }
        AllocEvent::Free { oaddr, osize } => {
            out.addu64(oaddr);
            out.addu64(osize);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use libc;
    use libc::c_void;

    use super::*;
    use leb128;
    use testsync::lock;
    use vm::mock::MockVm;
    use vm::{AllocEvent, AllocSource};

    struct TestCtx {
        data: Vec<u8>,
        buf: Vec<u8>,
        on_stop_calls: usize,
        fail_writes: AtomicBool,
    }

    impl TestCtx {
        fn new() -> Box<TestCtx> {
            Box::new(TestCtx {
                data: Vec::new(),
                buf: vec![0u8; 4096],
                on_stop_calls: 0,
                fail_writes: AtomicBool::new(false),
            })
        }

        fn options(&mut self) -> Options {
            Options {
                ctx: self as *mut TestCtx as *mut c_void,
                buf: self.buf.as_mut_ptr(),
                len: self.buf.len(),
                writer: Some(test_writer),
                on_stop: Some(test_on_stop),
                host_symbols: false,
            }
        }
    }

    fn test_writer(data: &mut *const u8, len: usize, ctx: *mut c_void) -> usize {
        let ctx = unsafe { &mut *(ctx as *mut TestCtx) };
        if ctx.fail_writes.load(Ordering::SeqCst) {
            unsafe {
                *libc::__errno_location() = libc::EIO;
            }
            return 0;
        }
        let chunk = unsafe { ::std::slice::from_raw_parts(*data, len) };
        ctx.data.extend_from_slice(chunk);
        len
    }

    fn test_on_stop(ctx: *mut c_void, _buf: *mut u8) -> i32 {
        let ctx = unsafe { &mut *(ctx as *mut TestCtx) };
        ctx.on_stop_calls += 1;
        0
    }

    fn take_u64(bytes: &[u8], pos: &mut usize) -> u64 {
        let (v, n) = leb128::read_u64(&bytes[*pos..]).unwrap();
        *pos += n;
        v
    }

    #[test]
    fn option_validation() {
        let _guard = lock();
        let vm = MockVm::new().leaked();

        assert_eq!(start(vm, &Options::default()), Err(Error::Misuse));

        let mut ctx = TestCtx::new();
        let mut opt = ctx.options();
        opt.writer = None;
        assert_eq!(start(vm, &opt), Err(Error::Misuse));

        let mut opt = ctx.options();
        opt.buf = ::std::ptr::null_mut();
        assert_eq!(start(vm, &opt), Err(Error::Misuse));

        assert_eq!(stop(vm), Err(Error::NotRunning));
    }

    #[test]
    fn event_stream_roundtrip() {
        let _guard = lock();
        let vm = MockVm::new().leaked();
        let mut ctx = TestCtx::new();

        assert_eq!(start(vm, &ctx.options()), Ok(()));
        assert!(vm.hook_installed());
        assert_eq!(start(vm, &ctx.options()), Err(Error::AlreadyRunning));

        vm.set_alloc_source(AllocSource::Internal);
        vm.fire(AllocEvent::Alloc {
            naddr: 0x1000,
            nsize: 64,
        });

        vm.set_alloc_source(AllocSource::Lua {
            sym: 0xdead,
            line: 7,
        });
        vm.fire(AllocEvent::Realloc {
            oaddr: 0x1000,
            osize: 64,
            naddr: 0x2000,
            nsize: 128,
        });

        vm.set_alloc_source(AllocSource::C { sym: 0xbeef });
        vm.fire(AllocEvent::Free {
            oaddr: 0x2000,
            osize: 128,
        });

        assert_eq!(stop(vm), Ok(()));
        assert!(!vm.hook_installed());
        assert_eq!(ctx.on_stop_calls, 1);

        let bytes = &ctx.data;
        // Empty guest symtab, then the memprof prologue.
        assert_eq!(&bytes[..8], &[0x6c, 0x6a, 0x73, 0x02, 0, 0, 0, 0x80]);
        assert_eq!(&bytes[8..15], &[0x6c, 0x6a, 0x6d, 0x01, 0, 0, 0]);

        let mut pos = 15;

        assert_eq!(bytes[pos], AEVENT_ALLOC | ASOURCE_INT);
        pos += 1;
        assert_eq!(take_u64(bytes, &mut pos), 0x1000);
        assert_eq!(take_u64(bytes, &mut pos), 64);

        assert_eq!(bytes[pos], AEVENT_REALLOC | ASOURCE_LFUNC);
        pos += 1;
        assert_eq!(take_u64(bytes, &mut pos), 0xdead);
        assert_eq!(take_u64(bytes, &mut pos), 7);
        assert_eq!(take_u64(bytes, &mut pos), 0x1000);
        assert_eq!(take_u64(bytes, &mut pos), 64);
        assert_eq!(take_u64(bytes, &mut pos), 0x2000);
        assert_eq!(take_u64(bytes, &mut pos), 128);

        assert_eq!(bytes[pos], AEVENT_FREE | ASOURCE_CFUNC);
        pos += 1;
        assert_eq!(take_u64(bytes, &mut pos), 0xbeef);
        assert_eq!(take_u64(bytes, &mut pos), 0x2000);
        assert_eq!(take_u64(bytes, &mut pos), 128);

        assert_eq!(bytes[pos], LJM_EPILOGUE_HEADER);
        assert_eq!(pos + 1, bytes.len());
    }

    #[test]
    fn wrong_vm_stop_is_misuse() {
        let _guard = lock();
        let vm = MockVm::new().leaked();
        let other = MockVm::new().leaked();
        let mut ctx = TestCtx::new();

        assert_eq!(start(vm, &ctx.options()), Ok(()));
        assert_eq!(stop(other), Err(Error::Misuse));
        assert_eq!(stop(vm), Ok(()));
    }

    #[test]
    fn writer_failure_halts_and_surfaces_at_stop() {
        let _guard = lock();
        let vm = MockVm::new().leaked();
        let mut ctx = TestCtx::new();
        // A tiny buffer so every event forces a flush.
        ctx.buf = vec![0u8; 16];

        assert_eq!(start(vm, &ctx.options()), Ok(()));

        ctx.fail_writes.store(true, Ordering::SeqCst);
        for _ in 0..8 {
            vm.fire(AllocEvent::Alloc {
                naddr: 0x1000,
                nsize: 64,
            });
        }

        match stop(vm) {
            Err(Error::Io { inner }) => assert_eq!(inner, ::nix::errno::Errno::EIO),
            other => panic!("expected io error, got {:?}", other),
        }
        assert_eq!(ctx.on_stop_calls, 1);
        assert!(!vm.hook_installed());

        // The singleton is reusable after the failed run.
        ctx.fail_writes.store(false, Ordering::SeqCst);
        let opts = ctx.options();
        assert_eq!(start(vm, &opts), Ok(()));
        assert_eq!(stop(vm), Ok(()));
    }
}
