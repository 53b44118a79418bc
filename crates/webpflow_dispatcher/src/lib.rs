//! Dispatcher for the webpflow conversion pipeline.
//!
//! Owns the batch/job identifiers, the worker registry, and the result
//! channel. Upload endpoints call [`Dispatcher::ingest_upload`] and
//! [`Dispatcher::start_job`], then drain completions through
//! [`Dispatcher::next_result`].

pub mod config;
pub mod dispatcher;

pub use config::DispatcherConfig;
pub use dispatcher::{
    Dispatcher, JobOutcome, JobRecord, JobSpec, NextResult, WorkerRecord, WorkerStatus,
};
