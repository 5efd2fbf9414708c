//! Sampling profiler.
//!
//! A periodic timer delivers SIGPROF to the profiled thread; the handler
//! reads the vmstate word, bumps the per-state counters and — in the
//! streaming modes — emits one sample record with the guest and host
//! call stacks.
//!
//! ```text
//! stream          := symtab sysprof
//! sysprof         := prologue sample* epilogue
//! prologue        := 'l' 'j' 'p' version reserved
//! version         := <BYTE>
//! reserved        := <BYTE> <BYTE> <BYTE>
//! sample          := sample-guest | sample-host | sample-trace
//! sample-guest    := sample-header stack-lua stack-host
//! sample-host     := sample-header stack-host
//! sample-trace    := sample-header traceno sym-addr line-no
//! sample-header   := <BYTE>
//! stack-lua       := frame-lua* frame-lua-last
//! stack-host      := frame-host* frame-host-last
//! frame-lua       := frame-lfunc | frame-cfunc | frame-ffunc
//! frame-lfunc     := frame-header sym-addr line-no
//! frame-cfunc     := frame-header exec-addr
//! frame-ffunc     := frame-header ffid
//! frame-lua-last  := frame-header
//! frame-host      := exec-addr
//! frame-host-last := <ULEB128> (zero)
//! epilogue        := sample-header
//! ```
//!
//! `sample-header` is `[F U U U E E E E]` (hi to lo): four bits of
//! vmstate, three unused bits, and the top bit marking the epilogue.
//! `frame-header` is `[F U U U U U E E]`: two bits of frame type and the
//! top bit marking the end of the guest stack.

pub mod timer;

use std::sync::atomic::{AtomicU32, Ordering};

use enum_primitive::FromPrimitive;
use libc;
use libc::{c_int, c_void, siginfo_t};

use self::timer::{ProfileTimer, TimerOpts};
use error::{Error, Result};
use symtab;
use vm::{self, Counters, GuestFrame, Vm, VmState};
use wbuf::{OnStop, StreamFlags, Wbuf, Writer};

pub const LJP_FORMAT_VERSION: u8 = 0x1;

const LJP_HEADER: [u8; 7] = [b'l', b'j', b'p', LJP_FORMAT_VERSION, 0x0, 0x0, 0x0];

pub const LJP_FRAME_LFUNC: u8 = 1;
pub const LJP_FRAME_CFUNC: u8 = 2;
pub const LJP_FRAME_FFUNC: u8 = 3;
pub const LJP_FRAME_LUA_LAST: u8 = 0x80;
/// The host stack is a bare address list, so its terminator is an
/// encoded zero word rather than a frame header.
pub const LJP_FRAME_HOST_LAST: u64 = 0;

pub const LJP_EPILOGUE_BYTE: u8 = 0x80;

const LJP_VMSTATE_MASK: u32 = (1 << 4) - 1;

/// Default sampling interval, in milliseconds.
pub const DEFAULT_INTERVAL: u64 = 11;

/// Frames belonging to the sampler itself, stripped from the head of
/// every host backtrace: the kernel signal trampoline (2), the handler,
/// `record_sample`, the host streamer and the backtracer's own frame.
/// Recalibrate when the handler call chain changes.
const HANDLER_STACK_DEPTH: usize = 6;

const BACKTRACE_BUF_SIZE: usize = 512;

/// Host-stack backtracer. Fills `addr_buf` with return addresses
/// starting from the innermost frame and returns how many were written.
/// Must be AS-safe.
pub type Backtracer = fn(addr_buf: &mut [usize]) -> usize;

enum_from_primitive! {
/// Profiling mode.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum Mode {
    /// Counters only; no stream is written.
    Default = 0,
    /// Counters plus per-tick samples carrying only the top guest frame
    /// and a capped prefix of the host stack.
    Leaf = 1,
    /// Counters plus per-tick samples with the full guest and host
    /// stacks.
    Callgraph = 2,
}
}

/// Profiler configuration, validated by [`configure`].
///
/// The staging buffer stays owned by the caller; it is handed back
/// through `on_stop`, which runs exactly once per successful `start`.
#[derive(Clone, Copy)]
pub struct Config {
    pub mode: Mode,
    /// Sampling interval in milliseconds; 0 selects the default (11 ms).
    pub interval: u64,
    /// Stream writer; required for the streaming modes. Must be AS-safe.
    pub writer: Option<Writer>,
    /// Staging buffer for stream data; required for the streaming modes.
    pub buf: *mut u8,
    pub buf_len: usize,
    /// Callback on profiler stopping; required for the streaming modes.
    pub on_stop: Option<OnStop>,
    /// Host-stack backtracer; `None` selects the platform `backtrace(3)`.
    pub backtracer: Option<Backtracer>,
    /// Also dump C symbols of loaded shared objects into the symtab.
    pub host_symbols: bool,
}

impl Config {
    pub const INIT: Config = Config {
        mode: Mode::Default,
        interval: 0,
        writer: None,
        buf: ::std::ptr::null_mut(),
        buf_len: 0,
        on_stop: None,
        backtracer: None,
        host_symbols: false,
    };
}

impl Default for Config {
    fn default() -> Config {
        Config::INIT
    }
}

enum_from_primitive! {
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    /// No configuration has been accepted yet.
    Unconfigured = 0,
    /// Configured and stopped.
    Idle = 1,
    /// Sampling.
    Profile = 2,
    /// The stream died inside the handler; the latched errno is reported
    /// by the next `stop`.
    Halt = 3,
}
}

/// One platform profiler per process. The signal handler takes no user
/// data, so a process-wide record is the only way to bridge handler and
/// facade; the facade is the only writer outside the handler, and the
/// handler only flips `state` on the error transition.
struct Sysprof {
    /// Written with release stores by the facade (and the handler's Halt
    /// transition), read with acquire loads in the handler.
    state: AtomicU32,
    vm: Option<&'static dyn Vm>,
    /// Thread the VM runs on; samples are only valid there.
    thread: libc::pthread_t,
    out: Wbuf,
    counters: Counters,
    cfg: Config,
    ctx: *mut c_void,
    timer: Option<ProfileTimer>,
    lib_adds: u64,
    saved_errno: i32,
}

static mut SYSPROF: Sysprof = Sysprof {
    state: AtomicU32::new(State::Unconfigured as u32),
    vm: None,
    thread: 0,
    out: Wbuf::INIT,
    counters: Counters::ZERO,
    cfg: Config::INIT,
    ctx: ::std::ptr::null_mut(),
    timer: None,
    lib_adds: 0,
    saved_errno: 0,
};

fn instance() -> &'static mut Sysprof {
    unsafe { &mut SYSPROF }
}

fn state_of(sp: &Sysprof) -> State {
    State::from_u32(sp.state.load(Ordering::Acquire)).unwrap_or(State::Unconfigured)
}

fn stream_is_needed(sp: &Sysprof) -> bool {
    sp.cfg.mode != Mode::Default
}

/// Default backtracer: the platform `backtrace(3)`.
///
/// XXX: `backtrace` is AS-safe only once libgcc is resident; the first
/// ever call may dlopen it. `configure` makes a warm-up call on the slow
/// path so the handler never pays that cost.
fn default_backtracer(addr_buf: &mut [usize]) -> usize {
    let depth = unsafe {
        libc::backtrace(
            addr_buf.as_mut_ptr() as *mut *mut c_void,
            addr_buf.len() as c_int,
        )
    };
    if depth > 0 {
        depth as usize
    } else {
        0
    }
}

/// Validates and stores a configuration. Legal from the unconfigured and
/// idle states only.
pub fn configure(cfg: Config) -> Result<()> {
    let sp = instance();

    match state_of(sp) {
        State::Unconfigured | State::Idle => {}
        _ => return Err(Error::AlreadyRunning),
    }

    if cfg.mode != Mode::Default
        && (cfg.buf.is_null() || cfg.buf_len == 0 || cfg.writer.is_none() || cfg.on_stop.is_none())
    {
        return Err(Error::Misuse);
    }

    sp.cfg = cfg;
    if sp.cfg.interval == 0 {
        sp.cfg.interval = DEFAULT_INTERVAL;
    }
    if sp.cfg.backtracer.is_none() {
        let mut warmup = [0usize; 1];
        default_backtracer(&mut warmup);
        sp.cfg.backtracer = Some(default_backtracer);
    }

    sp.state.store(State::Idle as u32, Ordering::Release);
    debug!(
        "sysprof configured: mode {:?}, interval {} msec",
        sp.cfg.mode, sp.cfg.interval
    );
    Ok(())
}

/// Starts sampling the given VM on the calling thread. `ctx` is passed
/// through to the writer and `on_stop`.
pub fn start(vm: &'static dyn Vm, ctx: *mut c_void) -> Result<()> {
    let sp = instance();

    match state_of(sp) {
        State::Unconfigured => return Err(Error::Misuse),
        State::Idle => {}
        _ => return Err(Error::AlreadyRunning),
    }

    sp.vm = Some(vm);
    sp.thread = unsafe { libc::pthread_self() };
    sp.ctx = ctx;
    sp.counters = Counters::ZERO;
    sp.saved_errno = 0;

    if stream_is_needed(sp) {
        let writer = match sp.cfg.writer {
            Some(writer) => writer,
            None => return Err(Error::Misuse),
        };
        sp.out.init(writer, ctx, sp.cfg.buf, sp.cfg.buf_len);
    }

    sp.state.store(State::Profile as u32, Ordering::Release);

    if stream_is_needed(sp) {
        stream_prologue(sp);
        if sp.out.test_flag(StreamFlags::ERRIO | StreamFlags::STOP) {
            // on_stop may clobber errno; latch it first. Its own status
            // is ignored on this unwind path.
            let errno = sp.out.errno();
            if let Some(on_stop) = sp.cfg.on_stop {
                on_stop(ctx, sp.cfg.buf);
            }
            sp.out.terminate();
            sp.vm = None;
            sp.state.store(State::Idle as u32, Ordering::Release);
            return Err(Error::io_from_raw(errno));
        }
    }

    let timer = ProfileTimer::start(&TimerOpts {
        interval_msec: sp.cfg.interval,
        handler: sysprof_signal_handler,
    });
    let timer = match timer {
        Ok(timer) => timer,
        Err(err) => {
            warn!("sysprof timer setup failed: {}", err);
            let errno = err.raw_errno();
            if let Some(on_stop) = sp.cfg.on_stop {
                on_stop(ctx, sp.cfg.buf);
            }
            sp.out.terminate();
            sp.vm = None;
            sp.state.store(State::Idle as u32, Ordering::Release);
            return Err(Error::io_from_raw(errno));
        }
    };
    sp.timer = Some(timer);

    debug!("sysprof started");
    Ok(())
}

/// Stops sampling. Returns the latched I/O error if the stream died
/// while profiling.
pub fn stop(vm: &dyn Vm) -> Result<()> {
    let sp = instance();

    let state = state_of(sp);
    match state {
        State::Unconfigured | State::Idle => return Err(Error::NotRunning),
        State::Profile | State::Halt => {}
    }
    let started = match sp.vm {
        Some(started) => started,
        None => return Err(Error::NotRunning),
    };
    if !vm::same_vm(started, vm) {
        return Err(Error::Misuse);
    }

    // After this returns no further handler invocation is pending, so
    // the facade owns the profiler record again.
    if let Some(timer) = sp.timer.take() {
        timer.stop();
    }
    sp.vm = None;

    // Re-read: a last tick may have latched Halt between the check above
    // and the timer teardown.
    if state_of(sp) == State::Halt {
        sp.state.store(State::Idle as u32, Ordering::Release);
        let errno = ::std::mem::replace(&mut sp.saved_errno, 0);
        // The wbuf was terminated in the handler; only the context
        // hand-back is left.
        if let Some(on_stop) = sp.cfg.on_stop {
            on_stop(sp.ctx, sp.cfg.buf);
        }
        return Err(Error::io_from_raw(errno));
    }

    sp.state.store(State::Idle as u32, Ordering::Release);

    if stream_is_needed(sp) {
        stream_epilogue(sp);
        sp.out.flush();

        let cb_status = match sp.cfg.on_stop {
            Some(on_stop) => on_stop(sp.ctx, sp.cfg.buf),
            None => 0,
        };
        if sp.out.test_flag(StreamFlags::ERRIO | StreamFlags::STOP) || cb_status != 0 {
            let errno = sp.out.errno();
            sp.out.terminate();
            return Err(Error::io_from_raw(errno));
        }
        sp.out.terminate();
    }

    debug!("sysprof stopped");
    Ok(())
}

/// Copies out the counters of the last run. Legal when idle only;
/// intermediate reads while profiling are not defined.
pub fn report() -> Result<Counters> {
    let sp = instance();
    if state_of(sp) != State::Idle {
        return Err(Error::Misuse);
    }
    Ok(sp.counters)
}

/* -- Signal handler ------------------------------------------------------ */

extern "C" fn sysprof_signal_handler(_sig: c_int, _info: *mut siginfo_t, _uctx: *mut c_void) {
    let sp = instance();

    match state_of(sp) {
        State::Profile => record_sample(sp),
        // A tick racing a stop, or delivered after the stream died:
        // observing the stale state here is harmless.
        State::Idle | State::Halt => {}
        State::Unconfigured => debug_assert!(false, "sampling signal while unconfigured"),
    }
}

fn record_sample(sp: &mut Sysprof) {
    let vm = match sp.vm {
        Some(vm) => vm,
        None => return,
    };

    // The sample must be taken on the thread running the VM; the timer
    // is armed with SIGEV_THREAD_ID, so anything else is a setup bug.
    debug_assert!(unsafe { libc::pthread_equal(libc::pthread_self(), sp.thread) } != 0);

    let raw = vm.vmstate_raw();
    // Negative words are ~VmState encodings; nonnegative words are trace
    // numbers, folded into the trace state.
    let wide = !(raw as u32);
    let vmstate = if wide < VmState::Trace as u32 {
        wide
    } else {
        VmState::Trace as u32
    };

    sp.counters.bump(vmstate);
    sp.counters.samples += 1;
    if let Some(ref timer) = sp.timer {
        sp.counters.overruns += timer.overrun();
    }

    if !stream_is_needed(sp) {
        return;
    }

    stream_event(sp, vm, vmstate, raw);

    if sp.out.test_flag(StreamFlags::ERRIO | StreamFlags::STOP) {
        sp.saved_errno = sp.out.errno();
        sp.out.terminate();
        sp.state.store(State::Halt as u32, Ordering::Release);
    }
}

/* -- Sample streaming ---------------------------------------------------- */

fn stream_prologue(sp: &mut Sysprof) {
    let vm = match sp.vm {
        Some(vm) => vm,
        None => return,
    };
    {
        let lib_adds = if sp.cfg.host_symbols {
            Some(&mut sp.lib_adds)
        } else {
            None
        };
        symtab::dump(&mut sp.out, vm, lib_adds);
    }
    sp.out.addn(&LJP_HEADER);
}

fn stream_epilogue(sp: &mut Sysprof) {
    sp.out.addbyte(LJP_EPILOGUE_BYTE);
}

fn stream_event(sp: &mut Sysprof, vm: &dyn Vm, vmstate: u32, raw: i32) {
    debug_assert_eq!(vmstate & LJP_VMSTATE_MASK, vmstate);
    sp.out.addbyte(vmstate as u8);

    match VmState::from_u32(vmstate) {
        Some(VmState::Lfunc) | Some(VmState::Ffunc) | Some(VmState::Cfunc) => {
            stream_backtrace_guest(sp, vm);
            stream_backtrace_host(sp);
        }
        Some(VmState::Trace) => stream_trace(sp, vm, raw),
        Some(_) => stream_backtrace_host(sp),
        None => debug_assert!(false, "vmstate out of range"),
    }
}

/// Walks the guest frame chain backwards from the topmost frame to the
/// stack base, skipping the dummy error-marker frames.
fn stream_backtrace_guest(sp: &mut Sysprof, vm: &dyn Vm) {
    let leaf_only = sp.cfg.mode == Mode::Leaf;
    let out = &mut sp.out;

    let bot = vm.bot_frame();
    let mut frame = match vm.top_frame() {
        Some(top) => top,
        None => {
            out.addbyte(LJP_FRAME_LUA_LAST);
            return;
        }
    };

    while frame.addr() > bot.addr() {
        if !vm.frame_is_dummy(frame) {
            match vm.frame_func(frame) {
                GuestFrame::Lua { proto, first_line } => {
                    out.addbyte(LJP_FRAME_LFUNC);
                    out.addu64(proto);
                    out.addu64(first_line);
                }
                GuestFrame::C { addr } => {
                    out.addbyte(LJP_FRAME_CFUNC);
                    out.addu64(addr);
                }
                GuestFrame::Fast { ffid } => {
                    out.addbyte(LJP_FRAME_FFUNC);
                    out.addu64(ffid);
                }
            }
            if leaf_only {
                break;
            }
        }
        frame = vm.frame_prev(frame);
    }

    out.addbyte(LJP_FRAME_LUA_LAST);
}

fn stream_backtrace_host(sp: &mut Sysprof) {
    // Handler-owned scratch; the sampling signal is blocked while its
    // own handler runs, so there is exactly one user at a time.
    static mut BACKTRACE_BUF: [usize; BACKTRACE_BUF_SIZE] = [0; BACKTRACE_BUF_SIZE];

    let backtracer = match sp.cfg.backtracer {
        Some(backtracer) => backtracer,
        None => return,
    };

    let max_depth = if sp.cfg.mode == Mode::Leaf {
        HANDLER_STACK_DEPTH + 1
    } else {
        BACKTRACE_BUF_SIZE
    };

    let depth = unsafe {
        ::std::cmp::min(backtracer(&mut BACKTRACE_BUF[..max_depth]), max_depth)
    };

    for i in ::std::cmp::min(HANDLER_STACK_DEPTH, depth)..depth {
        let addr = unsafe { BACKTRACE_BUF[i] };
        sp.out.addu64(addr as u64);
    }
    sp.out.addu64(LJP_FRAME_HOST_LAST);
}

fn stream_trace(sp: &mut Sysprof, vm: &dyn Vm, raw: i32) {
    let traceno = if raw >= 0 { raw as u32 } else { 0 };
    let info = vm.trace_info(traceno);
    sp.out.addu64(traceno as u64);
    sp.out.addu64(info.proto);
    sp.out.addu64(info.line);
}

/* -- Test support -------------------------------------------------------- */

/// Tears the singleton back to its pristine state so lifecycle tests can
/// assert the unconfigured transitions in any order.
#[cfg(test)]
pub(crate) fn reset_for_tests() {
    let sp = instance();
    if let Some(timer) = sp.timer.take() {
        timer.stop();
    }
    sp.state.store(State::Unconfigured as u32, Ordering::Release);
    sp.vm = None;
    sp.thread = 0;
    sp.out.terminate();
    sp.counters = Counters::ZERO;
    sp.cfg = Config::INIT;
    sp.ctx = ::std::ptr::null_mut();
    sp.lib_adds = 0;
    sp.saved_errno = 0;
}
