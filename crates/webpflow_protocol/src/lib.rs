//! Shared wire protocol and transports for the webpflow pipeline.
//!
//! This crate is a dependency of both the dispatcher and the workers:
//! the dispatcher uses it for its TCP/UDP servers and the message
//! model, the worker for the matching clients plus its own control
//! server.
//!
//! Wire format:
//! ```text
//! [4 bytes: header length, big-endian]
//! [N bytes: JSON header]
//! [M bytes: binary payload, present when the header carries byte_length]
//! ```

pub mod defaults;
pub mod error;
pub mod event;
pub mod files;
pub mod tcp;
pub mod types;
pub mod udp;

pub use error::{ProtocolError, TransportError};
pub use event::Event;
pub use types::{
    current_time, decode_message, encode_message, validate_version, Ack, BatchId, FileFrame,
    FileOptions, Heartbeat, ImageType, ImagesReady, JobError, JobId, JobStage, JobStatus, NewBatch,
    Registration, Shutdown, SizeType, StartJob, WireMessage, WorkerId, PROTOCOL_VERSION,
};
