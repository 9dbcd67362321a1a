//! Run execution for simlab.
//!
//! A [`RunScheduler`] fans an experiment plan out across a fixed-size pool
//! of worker threads. Each worker drives one [`SimRunner`] at a time: the
//! runner resolves its manifest through the shared [`DatasetCache`], loads
//! guest code through its worker's [`BehaviorBridge`], and steps the kernel
//! wrapper while accumulating per-tick snapshots. Guest failures are
//! normalized into diagnostics by the `diag` module; terminal statuses and
//! step snapshots land on disk through the [`RunSink`].

pub mod bridge;
pub mod dataset;
pub mod diag;
pub mod kernel;
pub mod runner;
pub mod scheduler;
pub mod sink;

pub use bridge::{BehaviorBridge, BridgeError, InterpreterStatus, LoadKind, LoadedBehavior};
pub use dataset::{DatasetCache, FetchBytes, HttpFetcher, LoadedDataset};
pub use kernel::{scan_for_stop, KernelWrapper, SimulationComponents};
pub use runner::{MetricReport, RunRequest, RunnerControl, RunnerStatus, SimRunner};
pub use scheduler::{
    ExperimentHandle, ExperimentSubmission, QueuedRunSpec, RunCompletion, RunHandle, RunScheduler,
    SIMLAB_WORKER_MAX_ENV,
};
pub use sink::{ExperimentManifestRecord, JsonlRunSink, RunSink, RunStatusRow, StepRow};
