//! Wire message model for the conversion pipeline.
//!
//! Message flow:
//!     Worker -> Dispatcher: `new_convertor` (register worker)
//!     Dispatcher -> Worker: `ack` (worker is registered, carries its id)
//!     Worker -> Dispatcher: `heartbeat` (UDP, every 2 s)
//!     Dispatcher -> Worker: `new_batch` (clears worker state)
//!     Dispatcher -> Worker: `new_job` (a job is one file)
//!     Worker -> Dispatcher: `images_ready` (zip of converted variants)
//!     Worker -> Dispatcher: `job_error`
//!     Either -> Either: `shutdown`

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ProtocolError, Result};

pub const PROTOCOL_VERSION: u32 = 1;

fn protocol_version() -> u32 {
    PROTOCOL_VERSION
}

/// Seconds since the Unix epoch, as carried in heartbeat messages.
pub fn current_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("SystemTime before UNIX_EPOCH - check system clock")
        .as_secs_f64()
}

// ============================================================================
// Identifier newtypes
// ============================================================================

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
            Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Batch identifier, dispatcher-monotonic across a run.
    BatchId
);
id_type!(
    /// Job identifier, unique within its batch.
    JobId
);
id_type!(
    /// Worker identifier, assigned by the dispatcher at registration.
    WorkerId
);

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Complex,
    Graphic,
    Product,
    #[default]
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeType {
    Banner,
    Content,
    Thumbnail,
    Icon,
    Other,
}

/// Which stage of job processing produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    Convert,
    Zip,
    #[default]
    Unknown,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Convert => "convert",
            JobStage::Zip => "zip",
            JobStage::Unknown => "unknown",
        }
    }
}

/// Lifecycle of a job record on the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Done,
    Error,
}

// ============================================================================
// FileOptions
// ============================================================================

/// Conversion options for an image. Each of these can be specified by
/// the caller per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOptions {
    pub lossless: bool,
    pub text_focus: bool,
    pub has_text: bool,

    #[serde(rename = "type")]
    pub image_type: ImageType,

    pub crop_size_w: Option<u32>,
    pub crop_size_h: Option<u32>,
    pub crop_top_x: Option<u32>,
    pub crop_top_y: Option<u32>,
    pub crop_w: Option<u32>,
    pub crop_h: Option<u32>,

    /// `None` when the caller requested an explicit size instead.
    pub size_type: Option<SizeType>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            lossless: false,
            text_focus: false,
            has_text: false,
            image_type: ImageType::Default,
            crop_size_w: None,
            crop_size_h: None,
            crop_top_x: None,
            crop_top_y: None,
            crop_w: None,
            crop_h: None,
            size_type: Some(SizeType::Content),
            width: None,
            height: None,
        }
    }
}

impl FileOptions {
    /// True if all six crop parameters are set.
    pub fn has_crop(&self) -> bool {
        self.crop_size_w.is_some()
            && self.crop_size_h.is_some()
            && self.crop_top_x.is_some()
            && self.crop_top_y.is_some()
            && self.crop_w.is_some()
            && self.crop_h.is_some()
    }

    /// True if an explicit width or height is set.
    pub fn has_explicit_size(&self) -> bool {
        self.width.is_some() || self.height.is_some()
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Worker -> Dispatcher registration message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub host: String,
    pub port: u16,
}

/// Dispatcher -> Worker after the dispatcher registers the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub id: WorkerId,
}

/// Dispatcher -> Worker to clear state for a new batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBatch {
    pub batch_id: BatchId,
    /// Always false today; reserved for letting workers drain their
    /// queue before switching.
    #[serde(default)]
    pub finish_jobs: bool,
}

/// Dispatcher -> Worker to start a new conversion job. Carries the
/// input image as the frame payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartJob {
    #[serde(default = "protocol_version")]
    pub v: u32,
    pub batch_id: BatchId,
    pub job_id: JobId,
    pub filename: String,
    #[serde(default)]
    pub options: FileOptions,
    pub byte_length: u64,
    /// Filled in by the receiving server once the payload is persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_path: Option<PathBuf>,
}

/// Worker -> Dispatcher with the converted bundle as the frame payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagesReady {
    #[serde(default = "protocol_version")]
    pub v: u32,
    pub batch_id: BatchId,
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub format: String,
    pub filename: String,
    pub content_type: String,
    pub byte_length: u64,
    /// Filled in by the receiving server: files extracted from the bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<PathBuf>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_path: Option<PathBuf>,
}

/// Error report from worker to dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    #[serde(default = "protocol_version")]
    pub v: u32,
    pub batch_id: BatchId,
    pub job_id: JobId,
    pub w_id: WorkerId,
    #[serde(default)]
    pub stage: JobStage,
    pub error: String,
    pub traceback: String,
    #[serde(default)]
    pub retryable: bool,
}

/// UDP heartbeat from worker to dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: WorkerId,
    pub time: f64,
}

/// Shutdown signal. Only worker -> dispatcher in practice, kept
/// symmetric for testing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shutdown {
    pub host: String,
    pub port: u16,
}

/// Every message on the wire, dispatched by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    NewConvertor(Registration),
    Ack(Ack),
    NewBatch(NewBatch),
    NewJob(StartJob),
    ImagesReady(ImagesReady),
    JobError(JobError),
    Heartbeat(Heartbeat),
    Shutdown(Shutdown),
}

impl WireMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::NewConvertor(_) => "new_convertor",
            WireMessage::Ack(_) => "ack",
            WireMessage::NewBatch(_) => "new_batch",
            WireMessage::NewJob(_) => "new_job",
            WireMessage::ImagesReady(_) => "images_ready",
            WireMessage::JobError(_) => "job_error",
            WireMessage::Heartbeat(_) => "heartbeat",
            WireMessage::Shutdown(_) => "shutdown",
        }
    }
}

/// Reject any header that declares a version other than ours.
///
/// Messages without a `v` field predate versioning and are accepted.
pub fn validate_version(header: &serde_json::Value) -> Result<()> {
    match header.get("v") {
        None => Ok(()),
        Some(v) if v.is_null() => Ok(()),
        Some(v) if v.as_u64() == Some(PROTOCOL_VERSION as u64) => Ok(()),
        Some(v) => Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            got: v.as_u64().unwrap_or(0),
        }),
    }
}

/// Decode a JSON header into a typed message, checking the version first.
pub fn decode_message(bytes: &[u8]) -> Result<WireMessage> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    validate_version(&value)?;
    Ok(serde_json::from_value(value)?)
}

pub fn encode_message(msg: &WireMessage) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

// ============================================================================
// File frames
// ============================================================================

/// An encoded header plus binary payload, ready to stream over TCP.
#[derive(Debug, Clone)]
pub struct FileFrame {
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
}

impl FileFrame {
    pub fn new(msg: &WireMessage, payload: Vec<u8>) -> Result<Self> {
        Ok(Self {
            header: encode_message(msg)?,
            payload,
        })
    }

    /// Build a `new_job` frame carrying the input image.
    ///
    /// Fails locally, before any I/O, when the input file is missing.
    pub fn start_job(
        batch_id: BatchId,
        job_id: JobId,
        input_file: &Path,
        options: FileOptions,
    ) -> Result<Self> {
        if !input_file.exists() {
            return Err(ProtocolError::MissingInput(input_file.to_path_buf()));
        }
        let payload = fs::read(input_file)?;
        let filename = basename(input_file);
        let msg = WireMessage::NewJob(StartJob {
            v: PROTOCOL_VERSION,
            batch_id,
            job_id,
            filename,
            options,
            byte_length: payload.len() as u64,
            saved_path: None,
        });
        Self::new(&msg, payload)
    }

    /// Build an `images_ready` frame carrying the converted bundle.
    pub fn images_ready(
        batch_id: BatchId,
        job_id: JobId,
        worker_id: WorkerId,
        zip_file: &Path,
    ) -> Result<Self> {
        if !zip_file.exists() {
            return Err(ProtocolError::MissingInput(zip_file.to_path_buf()));
        }
        let payload = fs::read(zip_file)?;
        let filename = basename(zip_file);
        let msg = WireMessage::ImagesReady(ImagesReady {
            v: PROTOCOL_VERSION,
            batch_id,
            job_id,
            worker_id,
            format: "zip".to_string(),
            filename,
            content_type: "application/zip".to_string(),
            byte_length: payload.len() as u64,
            paths: None,
            saved_path: None,
        });
        Self::new(&msg, payload)
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.bin".to_string())
}
