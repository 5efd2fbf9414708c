//! File-backed profiling sessions.
//!
//! The facade APIs take raw buffers and AS-safe callbacks; this layer is
//! the convenience wiring an embedder actually wants: parse a mode
//! character and an interval, open an output file, allocate the staging
//! buffer, and wire a `write(2)`-based writer with the full retry
//! protocol. The writer runs under the sampling signal handler, which is
//! why it sticks to raw file descriptors instead of buffered streams.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;

use libc;
use libc::{c_int, c_void};
use nix::errno::Errno;

use error::{Error, Result};
use memprof;
use sysprof::{self, Mode};
use vm::{Counters, Vm};

/// Staging-buffer size. Yep, 8Mb: tuned in order not to bother the
/// platform with too frequent flushes.
pub const STREAM_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Default output path when none is given.
pub const DEFAULT_OUTPUT: &'static str = "sysprof.bin";

/// Parsed session options.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Options {
    pub mode: Mode,
    /// Sampling interval in milliseconds.
    pub interval: u64,
    pub path: PathBuf,
}

impl Options {
    /// Builds options from the script-level shape: a mode character
    /// (`'D'`, `'L'` or `'C'`), an optional positive interval and an
    /// optional output path.
    pub fn parse(mode: char, interval: Option<u64>, path: Option<&Path>) -> Result<Options> {
        let mode = match mode {
            'D' => Mode::Default,
            'L' => Mode::Leaf,
            'C' => Mode::Callgraph,
            _ => return Err(Error::Misuse),
        };
        let interval = match interval {
            None => sysprof::DEFAULT_INTERVAL,
            Some(0) => return Err(Error::Misuse),
            Some(interval) => interval,
        };
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT));
        Ok(Options {
            mode,
            interval,
            path,
        })
    }
}

/// Writer context: the output descriptor plus the staging buffer it
/// serves. Allocated at session start, reclaimed by `file_on_stop`.
struct SessionCtx {
    fd: c_int,
    buf: Vec<u8>,
}

/// Default stream writer: `write(2)` to the session descriptor, retrying
/// short writes and EINTR. On a hard failure the data pointer is nulled,
/// ending the stream; the unwritten tail is dropped as a whole.
fn file_writer(data: &mut *const u8, len: usize, ctx: *mut c_void) -> usize {
    let ctx = unsafe { &mut *(ctx as *mut SessionCtx) };
    let start = *data;
    let mut total = 0usize;

    while total < len {
        let rc = unsafe {
            libc::write(
                ctx.fd,
                start.add(total) as *const c_void,
                len - total,
            )
        };
        if rc <= 0 {
            if rc < 0 && Errno::last() == Errno::EINTR {
                continue;
            }
            *data = ptr::null();
            return total;
        }
        total += rc as usize;
    }

    *data = start;
    total
}

/// Default on-stop callback: closes the descriptor and frees the session
/// context.
fn file_on_stop(ctx: *mut c_void, _buf: *mut u8) -> i32 {
    if ctx.is_null() {
        return 0;
    }
    let ctx = unsafe { Box::from_raw(ctx as *mut SessionCtx) };
    unsafe { libc::close(ctx.fd) }
}

fn open_output(path: &Path) -> Result<c_int> {
    let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Misuse)?;
    let fd = unsafe {
        libc::open(
            cpath.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
            0o644 as libc::c_uint,
        )
    };
    if fd < 0 {
        warn!("unable to open {:?} for the profile stream", path);
        return Err(Error::Io {
            inner: Errno::last(),
        });
    }
    Ok(fd)
}

fn new_ctx(fd: c_int) -> (*mut SessionCtx, *mut u8, usize) {
    let mut ctx = Box::new(SessionCtx {
        fd,
        buf: vec![0u8; STREAM_BUFFER_SIZE],
    });
    let buf = ctx.buf.as_mut_ptr();
    let len = ctx.buf.len();
    (Box::into_raw(ctx), buf, len)
}

impl sysprof::Config {
    /// Streaming configuration with the session file sink prewired:
    /// opens `path` and wires the `write(2)` writer plus the closing
    /// `on_stop` over an owned 8 MiB staging buffer.
    ///
    /// Returns the config together with the context pointer to pass to
    /// `sysprof::start`. Once a `start` succeeds, `on_stop` reclaims the
    /// sink; if the config is abandoned before that, invoke the config's
    /// own `on_stop` with the context to close the file and free the
    /// buffer.
    pub fn with_file_sink(mode: Mode, interval: u64, path: &Path) -> Result<(sysprof::Config, *mut c_void)> {
        let fd = open_output(path)?;
        let (ctx, buf, buf_len) = new_ctx(fd);
        Ok((
            sysprof::Config {
                mode,
                interval,
                writer: Some(file_writer),
                buf,
                buf_len,
                on_stop: Some(file_on_stop),
                backtracer: None,
                host_symbols: false,
            },
            ctx as *mut c_void,
        ))
    }
}

impl memprof::Options {
    /// Memory-profiler options with the session file sink prewired; the
    /// same ownership rules as `Config::with_file_sink` apply, with the
    /// context carried inside the options.
    pub fn with_file_sink(path: &Path) -> Result<memprof::Options> {
        let fd = open_output(path)?;
        let (ctx, buf, len) = new_ctx(fd);
        Ok(memprof::Options {
            ctx: ctx as *mut c_void,
            buf,
            len,
            writer: Some(file_writer),
            on_stop: Some(file_on_stop),
            host_symbols: false,
        })
    }
}

/// A file-backed sampling-profiler session.
pub struct SysprofSession;

impl SysprofSession {
    /// Starts a session writing to `opts.path`.
    ///
    /// Counters-only sessions open no sink at all; the streaming modes
    /// own the file and the staging buffer until [`SysprofSession::stop`].
    pub fn start(vm: &'static dyn Vm, opts: &Options) -> Result<()> {
        if opts.mode == Mode::Default {
            sysprof::configure(sysprof::Config {
                mode: opts.mode,
                interval: opts.interval,
                ..Default::default()
            })?;
            return sysprof::start(vm, ptr::null_mut());
        }

        let (cfg, ctx) = sysprof::Config::with_file_sink(opts.mode, opts.interval, &opts.path)?;
        if let Err(err) = sysprof::configure(cfg) {
            file_on_stop(ctx, ptr::null_mut());
            return Err(err);
        }

        match sysprof::start(vm, ctx) {
            Ok(()) => Ok(()),
            // Post-configuration failures already handed the context back
            // through on_stop and closed the file with it.
            Err(err @ Error::Io { .. }) => Err(err),
            Err(err) => {
                file_on_stop(ctx, ptr::null_mut());
                Err(err)
            }
        }
    }

    pub fn stop(vm: &dyn Vm) -> Result<()> {
        sysprof::stop(vm)
    }

    pub fn report() -> Result<Counters> {
        sysprof::report()
    }
}

/// A file-backed memory-profiler session.
pub struct MemprofSession;

impl MemprofSession {
    /// Starts a session writing to `path`.
    pub fn start(vm: &'static dyn Vm, path: &Path) -> Result<()> {
        let opt = memprof::Options::with_file_sink(path)?;

        match memprof::start(vm, &opt) {
            Ok(()) => Ok(()),
            Err(err @ Error::Io { .. }) => Err(err),
            Err(err) => {
                file_on_stop(opt.ctx, ptr::null_mut());
                Err(err)
            }
        }
    }

    pub fn stop(vm: &dyn Vm) -> Result<()> {
        memprof::stop(vm)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    use super::*;
    use sysprof::Mode;
    use testsync::lock;
    use vm::mock::MockVm;
    use vm::{AllocEvent, VmState};

    fn scratch_path(tag: &str) -> PathBuf {
        let mut path = ::std::env::temp_dir();
        path.push(format!("ljprof-{}-{}.bin", tag, ::std::process::id()));
        path
    }

    fn spin(duration: Duration) {
        fn fib(n: u64) -> u64 {
            if n <= 1 {
                n
            } else {
                fib(n - 1) + fib(n - 2)
            }
        }
        let deadline = Instant::now() + duration;
        let mut acc = 0u64;
        while Instant::now() < deadline {
            acc = acc.wrapping_add(fib(20));
        }
        assert!(acc > 0);
    }

    #[test]
    fn option_parsing() {
        let opts = Options::parse('C', Some(5), None).unwrap();
        assert_eq!(opts.mode, Mode::Callgraph);
        assert_eq!(opts.interval, 5);
        assert_eq!(opts.path, PathBuf::from(DEFAULT_OUTPUT));

        assert_eq!(
            Options::parse('D', None, None).unwrap().interval,
            ::sysprof::DEFAULT_INTERVAL
        );
        assert_eq!(Options::parse('L', None, None).unwrap().mode, Mode::Leaf);

        assert_eq!(Options::parse('x', None, None), Err(Error::Misuse));
        assert_eq!(Options::parse('C', Some(0), None), Err(Error::Misuse));
    }

    #[test]
    fn counters_only_session_opens_no_sink() {
        let _guard = lock();
        ::sysprof::reset_for_tests();
        let vm = MockVm::new().leaked();
        vm.set_vmstate(VmState::Interp);

        let path = scratch_path("default");
        let _ = fs::remove_file(&path);
        let opts = Options {
            mode: Mode::Default,
            interval: 2,
            path: path.clone(),
        };

        assert_eq!(SysprofSession::start(vm, &opts), Ok(()));
        spin(Duration::from_millis(40));
        assert_eq!(SysprofSession::stop(vm), Ok(()));

        let counters = SysprofSession::report().unwrap();
        assert_eq!(counters.samples, counters.vmstate_total());
        assert!(!path.exists(), "counters-only session created a file");
    }

    #[test]
    fn callgraph_session_writes_a_stream_file() {
        let _guard = lock();
        ::sysprof::reset_for_tests();
        let vm = MockVm::new().leaked();
        vm.set_vmstate(VmState::Gc);

        let path = scratch_path("callgraph");
        let opts = Options {
            mode: Mode::Callgraph,
            interval: 2,
            path: path.clone(),
        };

        assert_eq!(SysprofSession::start(vm, &opts), Ok(()));
        spin(Duration::from_millis(100));
        assert_eq!(SysprofSession::stop(vm), Ok(()));

        let bytes = fs::read(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(
            &bytes[..15],
            &[
                0x6c, 0x6a, 0x73, 0x02, 0x00, 0x00, 0x00, 0x80, 0x6c, 0x6a, 0x70, 0x01, 0x00,
                0x00, 0x00,
            ][..]
        );
        assert_ne!(bytes[bytes.len() - 1] & 0x80, 0);
        assert!(SysprofSession::report().unwrap().samples >= 1);
    }

    #[test]
    fn memprof_session_writes_a_stream_file() {
        let _guard = lock();
        let vm = MockVm::new().leaked();

        let path = scratch_path("memprof");
        assert_eq!(MemprofSession::start(vm, &path), Ok(()));

        vm.fire(AllocEvent::Alloc {
            naddr: 0x1000,
            nsize: 32,
        });
        vm.fire(AllocEvent::Free {
            oaddr: 0x1000,
            osize: 32,
        });

        assert_eq!(MemprofSession::stop(vm), Ok(()));

        let bytes = fs::read(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(
            &bytes[..15],
            &[
                0x6c, 0x6a, 0x73, 0x02, 0x00, 0x00, 0x00, 0x80, 0x6c, 0x6a, 0x6d, 0x01, 0x00,
                0x00, 0x00,
            ][..]
        );
        assert_eq!(bytes[bytes.len() - 1], ::memprof::LJM_EPILOGUE_HEADER);
    }

    #[test]
    fn abandoned_file_sink_is_reclaimed_by_its_own_on_stop() {
        let _guard = lock();

        let path = scratch_path("sink");
        let opt = ::memprof::Options::with_file_sink(&path).unwrap();
        assert!(opt.writer.is_some());
        assert!(!opt.buf.is_null());

        // Never started: the prewired on_stop closes the file and frees
        // the context.
        let on_stop = opt.on_stop.unwrap();
        assert_eq!(on_stop(opt.ctx, opt.buf), 0);
        assert!(path.exists());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_directory_fails_with_io() {
        let _guard = lock();
        ::sysprof::reset_for_tests();
        let vm = MockVm::new().leaked();

        let opts = Options {
            mode: Mode::Callgraph,
            interval: 2,
            path: PathBuf::from("/nonexistent-dir/ljprof.bin"),
        };
        match SysprofSession::start(vm, &opts) {
            Err(Error::Io { .. }) => {}
            other => panic!("expected io error, got {:?}", other),
        }
    }
}
