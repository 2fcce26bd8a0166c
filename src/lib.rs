#![deny(unsafe_code)]

//! Checkpoint and restore for a WebAssembly interpreter.
//!
//! A suspended [`ExecEnv`] is captured into portable snapshot records
//! ([`snapshot`]), framed into a [`CheckpointImage`] and written to a file or
//! a TCP stream. Restoring rebuilds the module instance, every frame and its
//! label stack, then replays the guest's files and sockets against the new
//! host. [`CheckpointContext`] drives both directions.

pub mod error;
mod leb128;
mod byte_iter;
pub mod types;
pub mod opcodes;
pub mod module;
mod validator;
pub mod blocks;
pub mod memory;
pub mod instance;
pub mod exec_env;
pub mod interp;
pub mod wasi;
pub mod shim;
pub mod gateway;
pub mod quiesce;
pub mod snapshot;
pub mod image;
pub mod config;
pub mod orchestrator;
pub mod host;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use crate::config::{Policy, RunningMode, RuntimeConfig};
pub use crate::error::Error;
pub use crate::exec_env::ExecEnv;
pub use crate::host::host_imports;
pub use crate::image::CheckpointImage;
pub use crate::instance::{instantiate, Imports, InstanceOptions, ModuleInstance};
pub use crate::interp::{invoke, resume, ExecHooks, NoHooks, Outcome};
pub use crate::module::Module;
pub use crate::orchestrator::{CheckpointContext, CheckpointState};
pub use crate::snapshot::Snapshot;
pub use crate::types::{ValType, WasmValue};

// Opcode-level tracing, compiled out unless wasm_debug is enabled
#[cfg(feature = "wasm_debug")]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        tracing::trace!($($arg)*);
    };
}

#[cfg(not(feature = "wasm_debug"))]
macro_rules! debug_println {
    ($($arg:tt)*) => {};
}

pub(crate) use debug_println;

/// Lock, ignoring poison.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
