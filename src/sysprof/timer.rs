//! POSIX interval timer delivering the sampling signal.
//!
//! The timer is created with `SIGEV_THREAD_ID` so SIGPROF lands on the
//! profiled thread and nowhere else, and so the kernel's overrun
//! accounting is available for the `overruns` counter. The handler is
//! installed without `SA_NODEFER`: SIGPROF stays blocked for the duration
//! of its own handler, which keeps samples from interleaving.

use std::mem;
use std::ptr;

use libc;
use libc::{c_int, c_void, itimerspec, pid_t, siginfo_t, syscall, timespec, timer_t, SYS_gettid};
use nix::errno::Errno;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// The sampling signal handler shape required by `SA_SIGINFO`.
pub type SignalHandler = extern "C" fn(c_int, *mut siginfo_t, *mut c_void);

pub struct TimerOpts {
    pub interval_msec: u64,
    pub handler: SignalHandler,
}

#[derive(Debug, Fail)]
pub enum TimerError {
    #[fail(display = "Unable to install the SIGPROF handler: {}", inner)]
    Sigaction { inner: ::nix::Error },
    #[fail(
        display = "timer_create failed: {:?}. The kernel may limit the number
              of per-process timers (RLIMIT_SIGPENDING et al).",
        inner
    )]
    Create { inner: Errno },
    #[fail(display = "timer_settime failed: {:?}", inner)]
    Arm { inner: Errno },
}

impl TimerError {
    pub(crate) fn raw_errno(&self) -> i32 {
        match *self {
            TimerError::Sigaction { ref inner } => match *inner {
                ::nix::Error::Sys(errno) => errno as i32,
                _ => 0,
            },
            TimerError::Create { inner } | TimerError::Arm { inner } => inner as i32,
        }
    }
}

pub struct ProfileTimer {
    timer: timer_t,
}

impl ProfileTimer {
    /// Installs the handler and arms the periodic timer on the calling
    /// thread.
    pub fn start(opts: &TimerOpts) -> Result<ProfileTimer, TimerError> {
        let action = SigAction::new(
            SigHandler::SigAction(opts.handler),
            // SA_RESTART keeps the profiled program's slow syscalls from
            // failing with EINTR on every tick.
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe {
            sigaction(Signal::SIGPROF, &action)
                .map_err(|inner| TimerError::Sigaction { inner })?;
        }

        let mut sev: libc::sigevent = unsafe { mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_THREAD_ID;
        sev.sigev_signo = libc::SIGPROF;
        sev.sigev_notify_thread_id = unsafe { syscall(SYS_gettid) as pid_t };

        let mut timer: timer_t = ptr::null_mut();
        // NOTE(unsafe): plain syscalls over zero-initialized out-params.
        let rc = unsafe { libc::timer_create(libc::CLOCK_MONOTONIC, &mut sev, &mut timer) };
        if rc != 0 {
            disarm_handler();
            return Err(TimerError::Create {
                inner: Errno::last(),
            });
        }

        let interval = timespec {
            tv_sec: (opts.interval_msec / 1000) as libc::time_t,
            tv_nsec: ((opts.interval_msec % 1000) * 1_000_000) as libc::c_long,
        };
        let spec = itimerspec {
            it_interval: interval,
            it_value: interval,
        };
        let rc = unsafe { libc::timer_settime(timer, 0, &spec, ptr::null_mut()) };
        if rc != 0 {
            let inner = Errno::last();
            unsafe {
                libc::timer_delete(timer);
            }
            disarm_handler();
            return Err(TimerError::Arm { inner });
        }

        Ok(ProfileTimer { timer })
    }

    /// Ticks missed because the previous signal had not been delivered
    /// yet. AS-safe; called from the handler.
    pub fn overrun(&self) -> u64 {
        let n = unsafe { libc::timer_getoverrun(self.timer) };
        if n > 0 {
            n as u64
        } else {
            0
        }
    }

    /// Disarms the timer and detaches the handler. Once this returns, no
    /// further handler invocation is pending.
    pub fn stop(self) {
        unsafe {
            libc::timer_delete(self.timer);
        }
        disarm_handler();
    }
}

/// SIGPROF goes to ignore, not default: a tick already queued when the
/// timer dies must not terminate the process.
fn disarm_handler() {
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        let _ = sigaction(Signal::SIGPROF, &action);
    }
}
