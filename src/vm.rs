//! Contract between the profilers and the host runtime.
//!
//! The runtime is an external collaborator: it hands the crate a
//! [`Vm`] handle supplying the vmstate word, the guest frame chain, the
//! GC-root symbol sweep, trace resolution and allocator attribution.
//! Everything reachable from the sampling signal handler must be AS-safe
//! on the runtime's side: no allocation, no locks, no re-entry into the
//! profiled VM.

use std::mem::size_of;

/// Number of distinct VM states. The per-state counter array and the
/// sample-header encoding both index by this enumeration, so its order is
/// part of the stream format.
pub const VMSTATE_COUNT: usize = 10;

enum_from_primitive! {
/// What the runtime was doing at the instant of a sample.
#[repr(u32)]
#[derive(Clone, Copy, Debug, EnumIter, Eq, PartialEq, PartialOrd, Ord, Serialize, ToString)]
pub enum VmState {
    /// Interpreter prologue / dispatch.
    #[strum(to_string = "INTERP")]
    Interp = 0,
    /// Executing an interpreted function.
    #[strum(to_string = "LFUNC")]
    Lfunc = 1,
    /// Executing a runtime-builtin fast function.
    #[strum(to_string = "FFUNC")]
    Ffunc = 2,
    /// Executing a native function called from the VM.
    #[strum(to_string = "CFUNC")]
    Cfunc = 3,
    /// Garbage collection.
    #[strum(to_string = "GC")]
    Gc = 4,
    /// Trace exit handling.
    #[strum(to_string = "EXIT")]
    Exit = 5,
    /// JIT recording.
    #[strum(to_string = "RECORD")]
    Record = 6,
    /// JIT optimization.
    #[strum(to_string = "OPT")]
    Opt = 7,
    /// JIT assembling.
    #[strum(to_string = "ASM")]
    Asm = 8,
    /// Running JIT-compiled code.
    #[strum(to_string = "TRACE")]
    Trace = 9,
}
}

/// Per-run sample counters, one 64-bit slot per VM state plus the sample
/// and timer-overrun totals.
///
/// The signal handler bumps the per-state slots by raw index, so the
/// array layout is load-bearing: slot order matches the [`VmState`]
/// discriminants and the first slot sits at offset zero.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Counters {
    vmst: [u64; VMSTATE_COUNT],
    pub samples: u64,
    pub overruns: u64,
}

const_assert_eq!(size_of::<Counters>(), (VMSTATE_COUNT + 2) * 8);

impl Counters {
    pub const ZERO: Counters = Counters {
        vmst: [0; VMSTATE_COUNT],
        samples: 0,
        overruns: 0,
    };

    pub fn get(&self, state: VmState) -> u64 {
        self.vmst[state as usize]
    }

    /// Sum over all per-state slots; equals `samples` after a clean run.
    pub fn vmstate_total(&self) -> u64 {
        self.vmst.iter().sum()
    }

    /// Signal-handler side increment by raw state index. Out-of-range
    /// indices are dropped rather than risking a panic in the handler.
    pub(crate) fn bump(&mut self, index: u32) {
        if let Some(slot) = self.vmst.get_mut(index as usize) {
            *slot += 1;
        }
    }

    pub fn vmst_interp(&self) -> u64 {
        self.get(VmState::Interp)
    }
    pub fn vmst_lfunc(&self) -> u64 {
        self.get(VmState::Lfunc)
    }
    pub fn vmst_ffunc(&self) -> u64 {
        self.get(VmState::Ffunc)
    }
    pub fn vmst_cfunc(&self) -> u64 {
        self.get(VmState::Cfunc)
    }
    pub fn vmst_gc(&self) -> u64 {
        self.get(VmState::Gc)
    }
    pub fn vmst_exit(&self) -> u64 {
        self.get(VmState::Exit)
    }
    pub fn vmst_record(&self) -> u64 {
        self.get(VmState::Record)
    }
    pub fn vmst_opt(&self) -> u64 {
        self.get(VmState::Opt)
    }
    pub fn vmst_asm(&self) -> u64 {
        self.get(VmState::Asm)
    }
    pub fn vmst_trace(&self) -> u64 {
        self.get(VmState::Trace)
    }
}

/// Opaque handle to one slot of the guest frame chain. The runtime maps
/// it to whatever its frame representation is; the profiler only compares
/// the carried address against the stack base while walking.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameRef(pub usize);

impl FrameRef {
    pub fn addr(&self) -> usize {
        self.0
    }
}

/// One resolved guest frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum GuestFrame {
    /// An interpreted function: its prototype address and first line.
    Lua { proto: u64, first_line: u64 },
    /// A native function: its code address.
    C { addr: u64 },
    /// A runtime builtin, identified by a small integer id.
    Fast { ffid: u64 },
}

/// One record of the GC-root symbol sweep.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SymbolRecord<'a> {
    /// A function prototype: address, chunk name, first line.
    Proto {
        addr: u64,
        chunk: &'a [u8],
        first_line: u64,
    },
    /// A JIT trace: number, machine-code address, starting prototype and
    /// line.
    Trace {
        traceno: u64,
        mcode: u64,
        proto: u64,
        line: u64,
    },
}

/// Resolution of a currently-running trace for trace samples.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TraceInfo {
    pub proto: u64,
    pub line: u64,
}

/// Attribution of one allocator event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AllocSource {
    /// Runtime-internal allocation; carries no location.
    Internal,
    /// Allocation from interpreted code: symbol address and line.
    Lua { sym: u64, line: u64 },
    /// Allocation from a native function call context: symbol address.
    C { sym: u64 },
}

/// One heap event as reported by the runtime allocator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AllocEvent {
    Alloc {
        naddr: u64,
        nsize: u64,
    },
    Realloc {
        oaddr: u64,
        osize: u64,
        naddr: u64,
        nsize: u64,
    },
    Free {
        oaddr: u64,
        osize: u64,
    },
}

/// Allocator event tap installed by the memory profiler. Runs on the VM
/// thread, inside the allocator.
pub type AllocHook = fn(&AllocEvent);

/// Host-runtime access used by both profilers.
///
/// A single VM may be profiled at a time, addressed as `&'static dyn Vm`:
/// the signal handler needs a lifetime-free handle, and a process-wide
/// runtime lives for the duration of the process in practice.
///
/// Methods reached from the sampling handler (`vmstate_raw`, the frame
/// chain accessors, `trace_info`) must be AS-safe.
pub trait Vm {
    /// The raw vmstate word. Nonnegative values mean "executing JIT trace
    /// N"; negative values are bitwise-NOT encodings of a [`VmState`]
    /// index.
    fn vmstate_raw(&self) -> i32;

    /// Topmost guest frame of the current coroutine, or `None` when no
    /// guest code is on the stack.
    fn top_frame(&self) -> Option<FrameRef>;

    /// The stack-base sentinel. Frames at or below this address are not
    /// part of the chain.
    fn bot_frame(&self) -> FrameRef;

    /// The frame preceding `frame` in the chain, at a lower address.
    fn frame_prev(&self, frame: FrameRef) -> FrameRef;

    /// Dummy frames are internal error markers (their frame object is the
    /// coroutine itself) and are skipped by the walker.
    fn frame_is_dummy(&self, frame: FrameRef) -> bool;

    fn frame_func(&self, frame: FrameRef) -> GuestFrame;

    /// Forward-only sweep over the GC root chain, yielding a record per
    /// function prototype and, when the runtime has a JIT, per trace. No
    /// ownership of the objects is taken.
    fn visit_symbols(&self, visit: &mut dyn FnMut(SymbolRecord));

    /// Resolves a running trace for the trace-sample body.
    fn trace_info(&self, traceno: u32) -> TraceInfo;

    /// Attribution context for the allocation event being reported.
    fn alloc_source(&self) -> AllocSource;

    /// Installs or removes the allocator event tap.
    fn set_alloc_hook(&self, hook: Option<AllocHook>);
}

/// VM identity check for `stop`: compares the data pointers behind two
/// trait handles.
pub(crate) fn same_vm(a: &dyn Vm, b: &dyn Vm) -> bool {
    a as *const dyn Vm as *const () == b as *const dyn Vm as *const ()
}

#[cfg(test)]
pub(crate) mod mock {
    //! A scripted in-memory runtime for exercising the profilers without
    //! a real VM. State reads are atomic so the fixture stays safe under
    //! the sampling signal handler.

    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Mutex;

    use super::*;

    pub enum MockSymbol {
        Proto {
            addr: u64,
            chunk: Vec<u8>,
            first_line: u64,
        },
        Trace {
            traceno: u64,
            mcode: u64,
            proto: u64,
            line: u64,
        },
    }

    pub struct MockFrame {
        pub func: GuestFrame,
        pub dummy: bool,
    }

    pub struct MockVm {
        state: AtomicI32,
        frames: Vec<MockFrame>,
        symbols: Vec<MockSymbol>,
        source: Mutex<AllocSource>,
        hook: Mutex<Option<AllocHook>>,
        trace: TraceInfo,
    }

    impl MockVm {
        pub fn new() -> Self {
            MockVm {
                state: AtomicI32::new(!(VmState::Interp as i32)),
                frames: Vec::new(),
                symbols: Vec::new(),
                source: Mutex::new(AllocSource::Internal),
                hook: Mutex::new(None),
                trace: TraceInfo { proto: 0, line: 0 },
            }
        }

        /// Leaked fixture handle, as the profilers want a 'static VM.
        pub fn leaked(self) -> &'static MockVm {
            Box::leak(Box::new(self))
        }

        pub fn set_vmstate(&self, state: VmState) {
            self.state.store(!(state as i32), Ordering::SeqCst);
        }

        pub fn set_trace_running(&self, traceno: u32) {
            self.state.store(traceno as i32, Ordering::SeqCst);
        }

        pub fn with_frames(mut self, frames: Vec<MockFrame>) -> Self {
            self.frames = frames;
            self
        }

        pub fn with_symbols(mut self, symbols: Vec<MockSymbol>) -> Self {
            self.symbols = symbols;
            self
        }

        pub fn with_trace(mut self, trace: TraceInfo) -> Self {
            self.trace = trace;
            self
        }

        pub fn set_alloc_source(&self, source: AllocSource) {
            *self.source.lock().unwrap() = source;
        }

        /// Reports one allocator event through the installed tap, the way
        /// the runtime allocator would.
        pub fn fire(&self, event: AllocEvent) {
            let hook = *self.hook.lock().unwrap();
            if let Some(hook) = hook {
                hook(&event);
            }
        }

        pub fn hook_installed(&self) -> bool {
            self.hook.lock().unwrap().is_some()
        }
    }

    impl Vm for MockVm {
        fn vmstate_raw(&self) -> i32 {
            self.state.load(Ordering::SeqCst)
        }

        fn top_frame(&self) -> Option<FrameRef> {
            if self.frames.is_empty() {
                None
            } else {
                Some(FrameRef(self.frames.len()))
            }
        }

        fn bot_frame(&self) -> FrameRef {
            FrameRef(0)
        }

        fn frame_prev(&self, frame: FrameRef) -> FrameRef {
            FrameRef(frame.0 - 1)
        }

        fn frame_is_dummy(&self, frame: FrameRef) -> bool {
            self.frames[frame.0 - 1].dummy
        }

        fn frame_func(&self, frame: FrameRef) -> GuestFrame {
            self.frames[frame.0 - 1].func
        }

        fn visit_symbols(&self, visit: &mut dyn FnMut(SymbolRecord)) {
            for sym in &self.symbols {
                match *sym {
                    MockSymbol::Proto {
                        addr,
                        ref chunk,
                        first_line,
                    } => visit(SymbolRecord::Proto {
                        addr,
                        chunk,
                        first_line,
                    }),
                    MockSymbol::Trace {
                        traceno,
                        mcode,
                        proto,
                        line,
                    } => visit(SymbolRecord::Trace {
                        traceno,
                        mcode,
                        proto,
                        line,
                    }),
                }
            }
        }

        fn trace_info(&self, _traceno: u32) -> TraceInfo {
            self.trace
        }

        fn alloc_source(&self) -> AllocSource {
            *self.source.lock().unwrap()
        }

        fn set_alloc_hook(&self, hook: Option<AllocHook>) {
            *self.hook.lock().unwrap() = hook;
        }
    }
}
