use nix::errno::Errno;

pub type Result<T> = ::std::result::Result<T, Error>;

/// Every facade entry point reports failures through this taxonomy. The
/// signal handler never returns errors; a writer failure observed there is
/// latched and surfaces as `Io` from the next `stop` call.
#[derive(Clone, Copy, Debug, Fail, PartialEq)]
pub enum Error {
    #[fail(
        display = "Invalid profiler configuration or usage: an unknown mode, a
              streaming mode without a buffer/writer/on_stop, an operation
              issued in the wrong lifecycle state, or a stop for a VM other
              than the one that was started."
    )]
    Misuse,
    #[fail(
        display = "A profiler of this kind is already running. Only one sysprof
              and one memprof may be active per process at a time."
    )]
    AlreadyRunning,
    #[fail(display = "The profiler is not running.")]
    NotRunning,
    #[fail(
        display = "Profile stream I/O failed: {:?}. Raised when the injected
              writer reports a hard failure, when on_stop returns nonzero, or
              when the output sink cannot be opened.",
        inner
    )]
    Io { inner: Errno },
    #[fail(display = "Out of memory while starting the profiler.")]
    Oom,
}

impl Error {
    /// I/O failures carry the errno recorded at the point of failure.
    pub fn errno(&self) -> Option<Errno> {
        match *self {
            Error::Io { inner } => Some(inner),
            _ => None,
        }
    }

    pub(crate) fn io_from_raw(errno: i32) -> Error {
        Error::Io {
            inner: Errno::from_i32(errno),
        }
    }
}
