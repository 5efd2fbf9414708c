//! Fixed-capacity staging buffer for the profile streams.
//!
//! Both profiling engines append from a signal handler, so every path in
//! here is async-signal-safe: no allocation, no locks, no panics. Errors
//! are sticky flags instead of `Result`s; once the stream is dead, appends
//! silently drop their bytes and the recorded errno stays readable until
//! the facade collects it.

use std::ptr;
use std::slice;

use libc::c_void;
use nix::errno::Errno;

use leb128;

bitflags! {
    /// Sticky stream-failure flags.
    pub struct StreamFlags: u32 {
        /// The writer reported a hard I/O failure (returned 0 without EINTR).
        const ERRIO = 0x1;
        /// The writer signalled end-of-stream by nulling the data pointer.
        const STOP = 0x2;
    }
}

/// Writer callback invoked on flush.
///
/// Receives a pointer to the staged bytes and their length, returns the
/// number of bytes consumed. A short return gets the callback re-invoked
/// with the remainder. Returning 0 with errno == EINTR retries the same
/// chunk; returning 0 with any other errno marks the stream failed.
/// Setting `*data` to null ends the stream. Must be AS-safe: it can run
/// under the sampling signal handler.
pub type Writer = fn(data: &mut *const u8, len: usize, ctx: *mut c_void) -> usize;

/// Profiler-stop callback. Receives the writer context and the stream
/// buffer back; owns whatever cleanup the caller needs. Returns zero on
/// success, nonzero is treated as an I/O failure.
pub type OnStop = fn(ctx: *mut c_void, buf: *mut u8) -> i32;

/// Write buffer over caller-supplied memory.
///
/// The buffer memory is borrowed for the lifetime of a profiling run and
/// handed back through the `OnStop` callback; `Wbuf` itself never frees it.
pub struct Wbuf {
    writer: Option<Writer>,
    ctx: *mut c_void,
    buf: *mut u8,
    size: usize,
    pos: usize,
    flags: StreamFlags,
    saved_errno: i32,
}

impl Wbuf {
    /// A terminated buffer, usable as the const initializer of the
    /// profiler singletons. Every append against it is a no-op.
    pub const INIT: Wbuf = Wbuf {
        writer: None,
        ctx: ptr::null_mut(),
        buf: ptr::null_mut(),
        size: 0,
        pos: 0,
        flags: StreamFlags { bits: 0 },
        saved_errno: 0,
    };

    pub fn init(&mut self, writer: Writer, ctx: *mut c_void, buf: *mut u8, size: usize) {
        self.writer = Some(writer);
        self.ctx = ctx;
        self.buf = buf;
        self.size = size;
        self.pos = 0;
        self.flags = StreamFlags::empty();
        self.saved_errno = 0;
    }

    /// Drops the buffer reference and inhibits all further operations.
    pub fn terminate(&mut self) {
        self.writer = None;
        self.ctx = ptr::null_mut();
        self.buf = ptr::null_mut();
        self.size = 0;
        self.pos = 0;
    }

    pub fn test_flag(&self, mask: StreamFlags) -> bool {
        self.flags.intersects(mask)
    }

    /// Errno recorded when the stream died; 0 if it never failed.
    pub fn errno(&self) -> i32 {
        self.saved_errno
    }

    /// The writer context, as passed to `init`.
    pub fn ctx(&self) -> *mut c_void {
        self.ctx
    }

    /// The staging memory, for handing back through `OnStop`. Null once
    /// the buffer has been terminated.
    pub fn buf_ptr(&self) -> *mut u8 {
        self.buf
    }

    fn left(&self) -> usize {
        self.size - self.pos
    }

    fn is_dead(&self) -> bool {
        self.flags
            .intersects(StreamFlags::ERRIO | StreamFlags::STOP)
            || self.buf.is_null()
    }

    pub fn addbyte(&mut self, b: u8) {
        if self.is_dead() {
            return;
        }
        if self.left() < 1 {
            self.flush_buf();
            if self.is_dead() {
                return;
            }
        }
        unsafe {
            *self.buf.add(self.pos) = b;
        }
        self.pos += 1;
    }

    /// Appends `v` in ULEB128 encoding.
    pub fn addu64(&mut self, v: u64) {
        if self.is_dead() {
            return;
        }
        if self.left() < leb128::MAX_LEN {
            self.flush_buf();
            if self.is_dead() {
                return;
            }
            if self.left() < leb128::MAX_LEN {
                // Staging area smaller than one worst-case integer: bounce
                // through a scratch buffer and let addn chunk it.
                let mut scratch = [0u8; leb128::MAX_LEN];
                let n = leb128::write_u64(&mut scratch, v);
                self.addn(&scratch[..n]);
                return;
            }
        }
        let tail = unsafe { slice::from_raw_parts_mut(self.buf.add(self.pos), self.left()) };
        self.pos += leb128::write_u64(tail, v);
    }

    pub fn addn(&mut self, src: &[u8]) {
        if self.is_dead() {
            return;
        }
        if self.left() < src.len() {
            self.flush_buf();
        }
        // Payloads larger than the whole staging area (long chunk names)
        // are pushed through in buffer-sized slices.
        let mut src = src;
        while !src.is_empty() {
            if self.is_dead() {
                return;
            }
            if self.left() == 0 {
                self.flush_buf();
                continue;
            }
            let n = ::std::cmp::min(src.len(), self.left());
            unsafe {
                ptr::copy_nonoverlapping(src.as_ptr(), self.buf.add(self.pos), n);
            }
            self.pos += n;
            src = &src[n..];
        }
    }

    /// Appends a length-prefixed string: ULEB128 byte count, then the raw
    /// bytes, no NUL terminator.
    pub fn addstring(&mut self, s: &[u8]) {
        self.addu64(s.len() as u64);
        self.addn(s);
    }

    pub fn flush(&mut self) {
        if self.is_dead() {
            return;
        }
        self.flush_buf();
    }

    fn flush_buf(&mut self) {
        let len = self.pos;
        if len == 0 {
            return;
        }
        let writer = match self.writer {
            Some(w) => w,
            None => return,
        };

        let mut data: *const u8 = self.buf;
        let mut left = len;
        while left > 0 {
            let written = writer(&mut data, left, self.ctx);

            if data.is_null() {
                // End-of-stream requested by the writer. The staging
                // memory stays with us for the on_stop hand-back.
                self.saved_errno = Errno::last() as i32;
                self.flags.insert(StreamFlags::STOP);
                return;
            }
            if written == 0 {
                if Errno::last() == Errno::EINTR {
                    // Interrupted before anything was consumed: retry the
                    // same chunk unchanged.
                    continue;
                }
                self.saved_errno = Errno::last() as i32;
                self.flags.insert(StreamFlags::ERRIO);
                return;
            }

            // Short write: re-invoke with the remainder.
            let written = ::std::cmp::min(written, left);
            left -= written;
            data = unsafe { data.add(written) };
        }

        self.pos = 0;
    }
}
