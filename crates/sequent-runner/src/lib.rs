#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sequent-runner** – Pipeline composition and runners for Sequent.
//!
//! A [`System`] declares which process follows which (`a | b | c` as
//! chains of names); runners instantiate one [`ProcessApplication`] per
//! distinct process over a shared recorder and drive the graph:
//!
//! - [`SingleThreadedRunner`] drives followers synchronously until the
//!   whole graph is quiescent; deterministic, for tests and tooling.
//! - [`MultiThreadedRunner`] gives each process its own worker task,
//!   woken by prompts with a polling fallback.
//! - [`ProcessWorker`] drives one `(process, pipeline)` pair against the
//!   shared database; one worker per OS process plus an external
//!   [`PromptTransport`] yields the multi-process deployment.
//!
//! Prompts are fire-and-forget latency hints: losing one falls back to
//! polling, duplicates are idempotent wakeups. Correctness only ever
//! comes from the durable logs and tracking records.
//!
//! [`ProcessApplication`]: sequent_process::ProcessApplication

mod factory;
mod prompt;
mod runner;
mod system;

pub use factory::{build_mapper, build_recorder};
pub use prompt::{InProcessTransport, Prompt, PromptTransport};
pub use runner::{MultiThreadedRunner, ProcessSpec, ProcessWorker, SingleThreadedRunner};
pub use system::System;

use sequent_process::ProcessError;
use sequent_store_core::RecorderError;

/// Errors surfaced by system construction and runners.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// A pipeline references a process with no registered specification.
    #[error("no specification registered for process '{0}'")]
    UnknownProcess(String),
    /// Settings could not be turned into components.
    #[error("configuration error: {0}")]
    Config(String),
    /// A recorder could not be constructed.
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    /// A process failed while being driven.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// A worker task ended abnormally.
    #[error("worker for process '{0}' ended abnormally")]
    WorkerFailed(String),
}
