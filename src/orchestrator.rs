//! The `run` entry point: attempt loop, options and the shared [`Registry`].
//!
//! Implementation details are split into submodules under `src/orchestrator/`.

pub mod builder;
pub mod context;
pub mod core;
mod execution;
pub mod options;
mod policy;
mod preflight;

pub use builder::RegistryBuilder;
pub use context::AttemptContext;
pub use core::Registry;
pub use options::{AlwaysRetry, Backoff, Fallback, RetryIf, RetryIfAsync, RetryPolicy, RunOptions};
