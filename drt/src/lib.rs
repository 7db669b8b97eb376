//! A runtime for mixed-mode execution: the stubs and runtime support that let interpreted and
//! compiled managed code call each other, call native functions, and fall back from compiled
//! code to the interpreter.
//!
//! The main pieces are:
//!
//!   * [callconv] and [moveorder]: where arguments live under each calling convention, and how to
//!     shuffle them from one convention to another.
//!   * [adapter]: the i2c/c2i adapter pairs that translate between the interpreter's stack-based
//!     convention and the compiled register convention.
//!   * [native_wrapper]: the wrappers that call native functions from managed code.
//!   * [frame]: walking the stack through every kind of frame.
//!   * [regsave]: the all-registers save area used by runtime stubs.
//!   * [deopt]: replacing a compiled frame by the interpreter frames it stands for.
//!
//! Generated code targets the abstract register machine of [masm], which is run by
//! [masm::sim::Machine] over the simulated address space of [mem].

#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

use thiserror::Error;

pub mod abi;
pub mod adapter;
pub mod callconv;
pub mod codecache;
pub mod deferred;
pub mod deopt;
pub mod frame;
pub mod heap;
mod log;
pub mod masm;
pub mod mem;
pub mod method;
pub mod moveorder;
pub mod native;
pub mod native_wrapper;
pub mod regsave;
pub mod runtime;
pub mod safepoint;
pub mod stubs;
pub mod sync;
#[cfg(any(test, feature = "drt_testing"))]
pub mod testing;
pub mod thread;

pub use log::Verbosity;
pub use runtime::{Runtime, RuntimeBuilder};
pub use thread::ThreadContext;

/// A failure to generate or install code.
#[derive(Debug, Error)]
pub enum CodeGenError {
    /// The code cache has no room left. The method can't be linked until space is freed.
    #[error("code cache full: cannot install {name} ({size} bytes)")]
    CodeCacheFull { name: String, size: u64 },
    /// A native method was called before a native function was registered for it.
    #[error("no native function is bound to {0}")]
    UnboundNative(String),
}

/// A failure to create a [Runtime].
#[derive(Debug, Error)]
pub enum RuntimeBuildError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("cannot map memory: {0}")]
    Mmap(#[from] std::io::Error),
    #[error("cannot generate runtime stubs: {0}")]
    CodeGen(#[from] CodeGenError),
}
