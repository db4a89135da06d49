//! A compact bytecode VM which the JIT compiles code for.
//!
//! The VM is deliberately minimal: it has no parser, no garbage collector and only supports table
//! metatables for `__index`/`__newindex`. It exists so that the trace compiler has an
//! interpreter to record from and to fall back to.

use std::error::Error;
use thiserror::Error;

pub mod bc;
pub mod builtins;
pub mod heap;
pub(crate) mod interp;
pub mod obj;
pub mod value;

use crate::{
    mt::MT,
    params::{JitParams, OptFlags},
};
use bc::Pc;
use builtins::FfClosures;
use heap::Heap;
use obj::{Closure, Proto, Table, TableError};
use value::{GcPtr, TValue};

/// The number of value slots in the VM stack. The stack is never reallocated, which means that
/// pointers into it (held by running traces) stay valid.
pub const STACK_SLOTS: usize = 1 << 16;

/// Slots kept free above a frame for calls and builtin results.
pub(crate) const STACK_EXTRA: usize = 8;

/// A runtime error raised by a script.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("attempt to {op} a {ty} value")]
    Type { op: &'static str, ty: &'static str },
    #[error("attempt to compare {0} with {1}")]
    Compare(&'static str, &'static str),
    #[error("attempt to call a {0} value")]
    Call(&'static str),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("stack overflow")]
    StackOverflow,
    #[error("assertion failed!")]
    Assert,
    #[error("bad argument #{arg} to '{name}' ({msg})")]
    BadArgument {
        arg: usize,
        name: String,
        msg: String,
    },
    #[error("loop in gettable")]
    IndexLoop,
    #[error("'{0}' metamethods are not supported")]
    Metamethod(&'static str),
}

/// The interpreter state the JIT needs to see at a given instruction.
pub(crate) struct VmState<'a> {
    /// The instruction about to be executed.
    pub(crate) pc: Pc,
    /// The stack index of the current frame's base.
    pub(crate) base: usize,
    pub(crate) stack: &'a [TValue],
    pub(crate) heap: &'a mut Heap,
    pub(crate) globals: GcPtr<Table>,
    pub(crate) ffc: &'a FfClosures,
    /// The number of arguments the current function was called with.
    pub(crate) nargs: usize,
}

impl VmState<'_> {
    /// The value of slot `s` of the current frame.
    pub(crate) fn slot(&self, s: isize) -> TValue {
        self.stack[(self.base as isize + s) as usize]
    }
}

/// The outcome of running a trace: where the interpreter resumes.
#[derive(Debug)]
pub(crate) struct ExitState {
    pub(crate) pc: Pc,
    pub(crate) base: usize,
    pub(crate) multres: usize,
}

pub struct Vm {
    pub(crate) heap: Box<Heap>,
    pub(crate) stack: Box<[TValue]>,
    pub(crate) globals: GcPtr<Table>,
    pub(crate) ffc: FfClosures,
    pub(crate) mt: MT,
}

impl Vm {
    /// Create a VM whose JIT is configured from the environment (`UJ_JIT_PARAMS`, `UJ_JIT_OPT`,
    /// `UJD_LOG`).
    pub fn new() -> Result<Self, Box<dyn Error>> {
        Ok(Self::with_mt(MT::new()?))
    }

    /// Create a VM with explicit JIT settings, ignoring the environment.
    pub fn with_params(jit: bool, params: JitParams, opt: OptFlags) -> Self {
        Self::with_mt(MT::with_params(jit, params, opt))
    }

    fn with_mt(mt: MT) -> Self {
        let mut heap = Box::new(Heap::new());
        let globals = heap.new_table(0, 0);
        let ffc = builtins::open_libs(&mut heap, globals);
        Vm {
            heap,
            stack: vec![TValue::NIL; STACK_SLOTS].into_boxed_slice(),
            globals,
            ffc,
            mt,
        }
    }

    pub fn heap(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn mt(&self) -> &MT {
        &self.mt
    }

    pub fn mt_mut(&mut self) -> &mut MT {
        &mut self.mt
    }

    /// Throw away every compiled trace.
    pub fn flush_traces(&mut self) {
        self.mt.flushall(&mut self.heap);
    }

    /// Flush trace `traceno` (and, for a root trace, its side traces).
    pub fn flush_trace(&mut self, traceno: u16) {
        self.mt.flush(traceno, &mut self.heap);
    }

    pub fn globals(&self) -> GcPtr<Table> {
        self.globals
    }

    pub fn set_global(&mut self, name: &str, v: TValue) {
        let k = TValue::str(self.heap.intern(name));
        // String keys are never nil or NaN.
        self.globals.as_mut().set(&k, v).ok();
    }

    pub fn get_global(&mut self, name: &str) -> TValue {
        let k = TValue::str(self.heap.intern(name));
        self.globals.get(&k)
    }

    /// Create a closure of `proto`.
    pub fn closure(&mut self, proto: GcPtr<Proto>) -> GcPtr<Closure> {
        self.heap.new_closure(proto)
    }

    /// Call `f` with `args`, returning all of its results.
    pub fn call(&mut self, f: GcPtr<Closure>, args: &[TValue]) -> Result<Vec<TValue>, VmError> {
        self.stack[0] = TValue::func(f);
        self.stack[1] = TValue::link_c();
        self.stack[2..2 + args.len()].copy_from_slice(args);
        match f.proto() {
            Some(p) => self.execute(2, p.pc_at(0), args.len()),
            None => {
                let rs = builtins::call(&mut self.heap, f.ffid, &self.ffc, args)?;
                Ok(rs.into_vec())
            }
        }
    }
}
