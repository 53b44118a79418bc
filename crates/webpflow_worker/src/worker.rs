//! Worker node: registration, control channel, batch switching, and
//! the serial job loop.
//!
//! Three threads: the TCP control server (which also receives job
//! payloads), the heartbeat emitter, and the job processor. Jobs run
//! strictly in arrival order; a batch switch aborts the running
//! conversion through the shared batch-switch event and drops
//! everything still queued.

use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use webpflow_protocol::defaults::{HEARTBEAT_INTERVAL, QUEUE_POLL};
use webpflow_protocol::{
    tcp, udp, BatchId, Event, FileFrame, JobError, JobId, JobStage, NewBatch, Registration,
    StartJob, WireMessage, WorkerId, PROTOCOL_VERSION,
};

use crate::config::WorkerConfig;
use crate::convert::{ConversionRequest, Converter, CwebpConverter};

const REGISTRATION_ATTEMPTS: u32 = 4;
const REGISTRATION_ACK_TIMEOUT: Duration = Duration::from_secs(10);

enum QueueItem {
    NewBatch(NewBatch),
    NewJob(StartJob),
}

#[derive(Default)]
struct WorkerState {
    batch_id: Option<BatchId>,
    worker_id: Option<WorkerId>,
}

enum JobRun {
    Completed(usize),
    /// A batch switch or shutdown fired mid-job; the result is dropped.
    Abandoned,
}

struct JobFailure {
    stage: JobStage,
    error: String,
    traceback: String,
}

impl JobFailure {
    fn new(stage: JobStage, err: anyhow::Error) -> Self {
        Self {
            stage,
            error: format!("{err:#}"),
            traceback: format!("{err:?}"),
        }
    }
}

struct Shared {
    config: WorkerConfig,
    converter: Box<dyn Converter>,
    state: Mutex<WorkerState>,
    shutdown: Event,
    batch_switch: Event,
    registered: Event,
    queue_tx: Sender<QueueItem>,
    queue_rx: Receiver<QueueItem>,
}

/// Worker process that receives and executes conversion jobs.
pub struct WorkerServer {
    shared: Arc<Shared>,
}

impl WorkerServer {
    pub fn new(config: WorkerConfig) -> Self {
        Self::with_converter(config, Box::new(CwebpConverter))
    }

    pub fn with_converter(config: WorkerConfig, converter: Box<dyn Converter>) -> Self {
        let (queue_tx, queue_rx) = unbounded();
        Self {
            shared: Arc::new(Shared {
                config,
                converter,
                state: Mutex::new(WorkerState::default()),
                shutdown: Event::new(),
                batch_switch: Event::new(),
                registered: Event::new(),
                queue_tx,
                queue_rx,
            }),
        }
    }

    pub fn shutdown_event(&self) -> Event {
        self.shared.shutdown.clone()
    }

    /// Run until shutdown. Exits with an error when registration with
    /// the dispatcher never succeeds.
    pub fn run(&self) -> Result<()> {
        let config = &self.shared.config;
        config
            .ensure_directories()
            .context("failed to prepare worker directories")?;
        info!("Starting worker at {}:{}", config.host, config.port);

        let listener = tcp::bind_listener(&config.host, config.port)
            .with_context(|| format!("failed to bind TCP {}:{}", config.host, config.port))?;
        {
            let shared = Arc::clone(&self.shared);
            let handler: Arc<tcp::Handler> = Arc::new(move |msg| shared.handle_message(msg));
            let storage = config.jobs_dir.clone();
            let shutdown = self.shared.shutdown.clone();
            thread::Builder::new()
                .name("worker-tcp".to_string())
                .spawn(move || tcp::serve(listener, storage, shutdown, handler))
                .context("failed to spawn TCP server thread")?;
        }

        let worker_id = match self.register_with_dispatcher() {
            Ok(id) => id,
            Err(e) => {
                self.shared.shutdown.set();
                return Err(e);
            }
        };

        {
            let host = config.dispatcher_host.clone();
            let port = config.dispatcher_udp_port;
            let shutdown = self.shared.shutdown.clone();
            thread::Builder::new()
                .name("worker-heartbeat".to_string())
                .spawn(move || {
                    udp::send_heartbeats(worker_id, &host, port, shutdown, HEARTBEAT_INTERVAL)
                })
                .context("failed to spawn heartbeat thread")?;
        }

        self.shared.process_jobs();
        info!("Worker stopped");
        Ok(())
    }

    fn register_with_dispatcher(&self) -> Result<WorkerId> {
        let config = &self.shared.config;
        for attempt in 0..REGISTRATION_ATTEMPTS {
            let msg = WireMessage::NewConvertor(Registration {
                host: config.host.clone(),
                port: config.port,
            });
            if let Err(e) =
                tcp::send_message(&config.dispatcher_host, config.dispatcher_tcp_port, &msg)
            {
                warn!("Registration attempt {} failed: {}", attempt, e);
                continue;
            }

            if self.shared.registered.wait_timeout(REGISTRATION_ACK_TIMEOUT) {
                if let Some(id) = self.shared.lock_state().worker_id {
                    info!("Registered as worker {}", id);
                    return Ok(id);
                }
            }
        }
        anyhow::bail!(
            "no ack from dispatcher at {}:{} after {} attempts",
            config.dispatcher_host,
            config.dispatcher_tcp_port,
            REGISTRATION_ATTEMPTS
        )
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_message(&self, msg: WireMessage) {
        match msg {
            WireMessage::Shutdown(_) => {
                info!("Shutdown requested over TCP");
                self.shutdown.set();
            }
            WireMessage::Ack(ack) => {
                self.lock_state().worker_id = Some(ack.id);
                self.registered.set();
            }
            WireMessage::NewBatch(batch) => {
                self.apply_batch_switch(&batch);
                let _ = self.queue_tx.send(QueueItem::NewBatch(batch));
            }
            WireMessage::NewJob(job) => {
                if self.lock_state().batch_id == Some(job.batch_id) {
                    let _ = self.queue_tx.send(QueueItem::NewJob(job));
                } else {
                    debug!(
                        "Dropping job {} for stale batch {}",
                        job.job_id, job.batch_id
                    );
                }
            }
            other => warn!("Unhandled message: {}", other.type_name()),
        }
    }

    /// Switch to a new batch: raise the abort event for the running
    /// conversion, reset the output directory, and drop everything
    /// still queued. Idempotent; the job loop re-applies it when it
    /// drains the marker and only then clears the event.
    fn apply_batch_switch(&self, batch: &NewBatch) {
        self.lock_state().batch_id = Some(batch.batch_id);
        self.batch_switch.set();

        if self.config.output_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&self.config.output_dir) {
                error!("Failed to clear output directory: {}", e);
            }
        }
        if let Err(e) = fs::create_dir_all(&self.config.output_dir) {
            error!("Failed to create output directory: {}", e);
        }

        while self.queue_rx.try_recv().is_ok() {}

        info!("Switched to batch {}", batch.batch_id);
    }

    /// Serial job loop: one conversion at a time, in arrival order.
    fn process_jobs(&self) {
        while !self.shutdown.is_set() {
            match self.queue_rx.recv_timeout(QUEUE_POLL) {
                Ok(QueueItem::NewBatch(batch)) => {
                    self.apply_batch_switch(&batch);
                    self.batch_switch.clear();
                }
                Ok(QueueItem::NewJob(job)) => {
                    if self.lock_state().batch_id != Some(job.batch_id) {
                        continue;
                    }
                    self.process_single_job(&job);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn process_single_job(&self, job: &StartJob) {
        let (worker_id, batch_id) = {
            let state = self.lock_state();
            match (state.worker_id, state.batch_id) {
                (Some(worker_id), Some(batch_id)) => (worker_id, batch_id),
                _ => return,
            }
        };
        let job_id = job.job_id;
        info!("Processing job {}", job_id);

        let out_dir = self.config.output_dir.join(job_id.to_string());
        match self.run_job(job, batch_id, job_id, worker_id, &out_dir) {
            Ok(JobRun::Completed(count)) => info!("Job {} complete: {} files", job_id, count),
            Ok(JobRun::Abandoned) => debug!("Job {} abandoned after batch switch", job_id),
            Err(failure) => {
                error!(
                    "Job {} failed at {}: {}",
                    job_id,
                    failure.stage.as_str(),
                    failure.error
                );
                let report = WireMessage::JobError(JobError {
                    v: PROTOCOL_VERSION,
                    batch_id,
                    job_id,
                    w_id: worker_id,
                    stage: failure.stage,
                    error: failure.error,
                    traceback: failure.traceback,
                    retryable: false,
                });
                if let Err(e) = tcp::send_message(
                    &self.config.dispatcher_host,
                    self.config.dispatcher_tcp_port,
                    &report,
                ) {
                    error!("Failed to report job {} error: {}", job_id, e);
                }
            }
        }
    }

    fn run_job(
        &self,
        job: &StartJob,
        batch_id: BatchId,
        job_id: JobId,
        worker_id: WorkerId,
        out_dir: &Path,
    ) -> std::result::Result<JobRun, JobFailure> {
        let input_file = job.saved_path.clone().ok_or_else(|| {
            JobFailure::new(
                JobStage::Unknown,
                anyhow::anyhow!("new_job carried no payload path"),
            )
        })?;

        fs::create_dir_all(out_dir).map_err(|e| {
            JobFailure::new(
                JobStage::Unknown,
                anyhow::Error::new(e).context("failed to create job output directory"),
            )
        })?;

        let request = ConversionRequest {
            input_file,
            output_dir: out_dir.to_path_buf(),
            options: job.options.clone(),
        };
        let outputs = self
            .converter
            .convert(&request, &self.batch_switch, &self.shutdown)
            .map_err(|e| JobFailure::new(JobStage::Convert, e))?;

        if self.batch_switch.is_set() || self.shutdown.is_set() {
            return Ok(JobRun::Abandoned);
        }

        let bundle = self
            .config
            .output_dir
            .join(format!("result-{}-{}.zip", worker_id, job_id));
        zip_directory(out_dir, &bundle).map_err(|e| JobFailure::new(JobStage::Zip, e))?;

        let frame = FileFrame::images_ready(batch_id, job_id, worker_id, &bundle)
            .map_err(|e| JobFailure::new(JobStage::Zip, anyhow::Error::new(e)))?;
        tcp::send_file(
            &self.config.dispatcher_host,
            self.config.dispatcher_tcp_port,
            &frame,
        )
        .map_err(|e| JobFailure::new(JobStage::Unknown, anyhow::Error::new(e)))?;

        Ok(JobRun::Completed(outputs.len()))
    }
}

/// Bundle the flat contents of `dir` into a ZIP archive at `dest`.
fn zip_directory(dir: &Path, dest: &Path) -> Result<()> {
    let file =
        File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default();

    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    entries.sort();

    for path in entries {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        writer.start_file(name, options)?;
        let mut src = File::open(&path)?;
        io::copy(&mut src, &mut writer)?;
    }
    writer.finish()?;
    Ok(())
}
