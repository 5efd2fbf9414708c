//! In-process profilers for a Lua-family VM: a sampling profiler
//! (`sysprof`), a memory-event profiler (`memprof`), the symbol-table
//! dumper both of them stream as their prologue, and the AS-safe write
//! buffer they share.
//!
//! The VM itself is injected through the [`vm::Vm`] contract; output
//! sinks are injected as writer callbacks. Exactly one profiler of each
//! kind may run per process, on the single thread that runs the VM.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate enum_primitive;
extern crate failure;
#[macro_use]
extern crate failure_derive;
extern crate libc;
#[macro_use]
extern crate log;
extern crate nix;
extern crate serde;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate static_assertions;
extern crate strum;
#[macro_use]
extern crate strum_macros;

#[cfg(test)]
extern crate env_logger;
#[cfg(test)]
#[macro_use]
extern crate memoffset;
#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;
#[cfg(test)]
extern crate rand;

pub mod error;
pub mod leb128;
pub mod memprof;
mod raw;
pub mod session;
pub mod symtab;
pub mod sysprof;
pub mod vm;
pub mod wbuf;

pub use error::{Error, Result};
pub use sysprof::{Backtracer, Config, Mode};
pub use vm::{AllocEvent, AllocSource, Counters, GuestFrame, Vm, VmState};
pub use wbuf::{OnStop, StreamFlags, Wbuf, Writer};
