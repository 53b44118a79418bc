//! Worker node for the webpflow conversion pipeline.
//!
//! Registers with the dispatcher, receives job payloads over the
//! framed TCP protocol, runs the conversion engine, and streams the
//! result bundles back.

pub mod config;
pub mod convert;
pub mod worker;

pub use config::WorkerConfig;
pub use convert::{ConversionRequest, Converter, CwebpConverter};
pub use worker::WorkerServer;
