//! A trace-based JIT for a small register-based bytecode VM.
//!
//! The VM ([vm]) interprets bytecode and counts how often loops and calls execute. When a location
//! becomes hot, the [MT] records the bytecode the interpreter executes into a linear SSA trace,
//! optimises it and assembles it into x86_64 machine code which the interpreter then enters
//! directly. When a guard in the machine code fails, the interpreter's state is rebuilt from a
//! snapshot and interpretation continues.

#![allow(clippy::type_complexity)]
#![allow(clippy::upper_case_acronyms)]
#![allow(clippy::comparison_chain)]
#![allow(clippy::new_without_default)]

pub(crate) mod compile;
mod location;
mod log;
pub(crate) mod mt;
pub mod params;
pub mod vm;

pub use self::compile::trace::TraceLink;
pub use self::log::stats::JitStats;
pub use self::mt::{JitState, TraceInfo, MT};
