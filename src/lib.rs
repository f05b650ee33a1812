#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(unknown_lints)]
#![allow(clippy::bool_assert_comparison)]
#![allow(clippy::collapsible_if)]
#![allow(clippy::comparison_chain)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::doc_lazy_continuation)]
#![allow(clippy::if_same_then_else)]
#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]
#![allow(clippy::option_map_unit_fn)]
#![allow(clippy::uninlined_format_args)]

pub mod common;

pub mod env;
pub mod fds;
pub mod flog;
pub mod fork_exec;
pub mod null_terminated_array;
pub mod pipe;
pub mod proc;
pub mod redirection;
pub mod threads;

pub use crate::env::Env;
pub use crate::fds::{FdMode, FileDescriptor};
pub use crate::fork_exec::SpawnBackend;
pub use crate::pipe::{DirectedPipe, InputPipe, OutputPipe, Pipe, WriteSource};
pub use crate::proc::{
    Command, Input, Output, ProcResult, ProcStatus, Process, ProcessBuilder, ProcessError,
    ResultError,
};

#[cfg(test)]
mod tests;
