//! Dispatcher control plane: worker registry, load-aware scheduler,
//! batch lifecycle, and dead-worker reassignment.
//!
//! One mutex covers workers, jobs and the batch counters; TCP and UDP
//! sends always happen outside it. Three background threads serve the
//! control socket, the heartbeat socket, and the liveness monitor.

use std::collections::HashMap;
use std::fs;
use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use webpflow_protocol::defaults::MONITOR_PERIOD;
use webpflow_protocol::files::extract_files;
use webpflow_protocol::types::current_time;
use webpflow_protocol::{
    tcp, udp, Ack, BatchId, Event, FileFrame, FileOptions, ImagesReady, JobError, JobId, JobStatus,
    NewBatch, Registration, Shutdown, WireMessage, WorkerId,
};

use crate::config::DispatcherConfig;

/// Identity and load state of one registered worker.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub host: String,
    pub port: u16,
    pub last_heartbeat: f64,
    pub status: WorkerStatus,
    pub active_jobs: Vec<JobId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Alive,
    /// Set on heartbeat timeout. Dead workers are never resurrected in
    /// a run; a returning worker re-registers under a new id.
    Dead,
}

/// Caller-submitted description of one conversion job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub input_file: PathBuf,
    pub options: FileOptions,
    /// Set when resubmitting or reassigning; fresh jobs get the next id.
    pub job_id: Option<JobId>,
}

/// One conversion unit within the current batch.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: JobId,
    pub batch_id: BatchId,
    pub spec: JobSpec,
    pub worker: Option<WorkerId>,
    pub status: JobStatus,
    pub error: Option<String>,
}

/// Completed-job notification delivered to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOutcome {
    Images {
        batch_id: BatchId,
        job_id: JobId,
        urls: Vec<String>,
    },
    JobError {
        batch_id: BatchId,
        job_id: JobId,
        error: String,
        traceback: String,
    },
}

/// Outcome of one `next_result` poll.
#[derive(Debug, Clone, PartialEq)]
pub enum NextResult {
    Result(JobOutcome),
    /// The timeout elapsed with the batch still incomplete.
    Timeout,
    /// Every expected job of the batch has been delivered.
    EndOfBatch,
}

#[derive(Default)]
struct DispatcherState {
    workers: HashMap<WorkerId, WorkerRecord>,
    next_worker_id: u64,
    batch_id: u64,
    next_job_id: u64,
    jobs: HashMap<JobId, JobRecord>,
    total_jobs: usize,
    completed_jobs: usize,
}

struct ResultsChannel {
    tx: Sender<JobOutcome>,
    rx: Receiver<JobOutcome>,
}

impl ResultsChannel {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }
}

struct Shared {
    config: DispatcherConfig,
    state: Mutex<DispatcherState>,
    results: Mutex<ResultsChannel>,
    shutdown: Event,
}

/// Handle to the running dispatcher. Clone is cheap and shares state.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    fn new(config: DispatcherConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(DispatcherState::default()),
                results: Mutex::new(ResultsChannel::new()),
                shutdown: Event::new(),
            }),
        }
    }

    /// Prepare directories, bind both sockets, and spawn the background
    /// threads.
    pub fn start(config: DispatcherConfig) -> Result<Self> {
        config
            .ensure_directories()
            .context("failed to prepare dispatcher directories")?;
        let dispatcher = Self::new(config);
        dispatcher.spawn_threads()?;
        Ok(dispatcher)
    }

    fn spawn_threads(&self) -> Result<()> {
        let config = &self.shared.config;
        let listener = tcp::bind_listener(&config.tcp_host, config.tcp_port).with_context(|| {
            format!("failed to bind TCP {}:{}", config.tcp_host, config.tcp_port)
        })?;
        let udp_socket = UdpSocket::bind((config.tcp_host.as_str(), config.udp_port))
            .with_context(|| {
                format!("failed to bind UDP {}:{}", config.tcp_host, config.udp_port)
            })?;

        {
            let shared = Arc::clone(&self.shared);
            let handler: Arc<tcp::Handler> = Arc::new(move |msg| shared.handle_tcp_message(msg));
            let storage = config.results_dir.clone();
            let shutdown = self.shared.shutdown.clone();
            thread::Builder::new()
                .name("dispatcher-tcp".to_string())
                .spawn(move || tcp::serve(listener, storage, shutdown, handler))
                .context("failed to spawn TCP server thread")?;
        }

        {
            let shared = Arc::clone(&self.shared);
            let handler: Arc<udp::Handler> = Arc::new(move |msg| shared.handle_heartbeat(msg));
            let shutdown = self.shared.shutdown.clone();
            thread::Builder::new()
                .name("dispatcher-udp".to_string())
                .spawn(move || udp::serve(udp_socket, shutdown, handler))
                .context("failed to spawn UDP server thread")?;
        }

        {
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name("dispatcher-monitor".to_string())
                .spawn(move || shared.monitor_loop())
                .context("failed to spawn liveness monitor thread")?;
        }

        info!(
            "Dispatcher started on {}:{} (heartbeats on udp {})",
            config.tcp_host, config.tcp_port, config.udp_port
        );
        Ok(())
    }

    /// Start a new batch, discarding all prior job state, and notify
    /// every known worker (best-effort).
    pub fn new_batch(&self) -> BatchId {
        let (batch_id, workers) = {
            let mut state = self.shared.lock_state();
            state.batch_id += 1;
            state.jobs.clear();
            state.next_job_id = 0;
            state.total_jobs = 0;
            state.completed_jobs = 0;
            let workers: Vec<(String, u16)> = state
                .workers
                .values()
                .map(|w| (w.host.clone(), w.port))
                .collect();
            (BatchId::new(state.batch_id), workers)
        };

        *self.shared.lock_results() = ResultsChannel::new();

        let msg = WireMessage::NewBatch(NewBatch {
            batch_id,
            finish_jobs: false,
        });
        for (host, port) in workers {
            if let Err(e) = tcp::send_message(&host, port, &msg) {
                warn!("Failed to notify worker {}:{} of new batch: {}", host, port, e);
            }
        }

        batch_id
    }

    /// Record how many jobs the current batch is expected to produce.
    ///
    /// Without this the batch never reports complete and `next_result`
    /// never signals end-of-stream.
    pub fn set_job_count(&self, count: usize) {
        self.shared.lock_state().total_jobs = count;
    }

    pub fn is_batch_complete(&self) -> bool {
        let state = self.shared.lock_state();
        state.total_jobs > 0 && state.completed_jobs >= state.total_jobs
    }

    /// Dispatch a job to the least-loaded alive worker.
    ///
    /// Returns false only when no alive worker exists. A failed TCP
    /// send still counts as dispatched: the job stays `running` and the
    /// liveness monitor reassigns it once the worker times out.
    pub fn start_job(&self, spec: JobSpec) -> bool {
        self.shared.start_job(spec)
    }

    /// Wait up to `timeout` for the next completed job of the current
    /// batch.
    pub fn next_result(&self, timeout: Duration) -> NextResult {
        if self.is_batch_complete() {
            return NextResult::EndOfBatch;
        }
        let rx = self.shared.lock_results().rx.clone();
        match rx.recv_timeout(timeout) {
            Ok(outcome) => {
                self.shared.lock_state().completed_jobs += 1;
                NextResult::Result(outcome)
            }
            Err(_) => NextResult::Timeout,
        }
    }

    /// Intake one uploaded file (single image or ZIP of images).
    ///
    /// Starts a new batch, extracts the inputs under
    /// `extracted/{batch}`, renumbers them by job id, writes a
    /// manifest, and records the expected job count. Returns the specs
    /// ready for `start_job`; callers adjust per-job options before
    /// submitting.
    pub fn ingest_upload(&self, upload: &Path) -> Result<(BatchId, Vec<JobSpec>)> {
        let batch_id = self.new_batch();

        let ext = upload
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
            .unwrap_or_default();
        let stored = self
            .shared
            .config
            .upload_dir
            .join(format!("{}{}", batch_id, ext));
        if upload != stored {
            fs::copy(upload, &stored)
                .with_context(|| format!("failed to store upload {}", upload.display()))?;
        }

        let dest = self.shared.config.extract_dir.join(batch_id.to_string());
        let raw_images = extract_files(&stored, &dest);
        if raw_images.is_empty() {
            anyhow::bail!("no valid images found in {}", upload.display());
        }

        let mut manifest = serde_json::Map::new();
        let mut specs = Vec::new();
        for (job_id, raw_path) in raw_images.iter().enumerate() {
            let original_name = raw_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let ext = raw_path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
                .unwrap_or_default();
            let new_path = dest.join(format!("{}{}", job_id, ext));
            if *raw_path != new_path {
                fs::rename(raw_path, &new_path).with_context(|| {
                    format!("failed to renumber {}", raw_path.display())
                })?;
            }
            manifest.insert(
                job_id.to_string(),
                json!({ "original_name": original_name, "original_ext": ext }),
            );
            specs.push(JobSpec {
                input_file: new_path,
                options: FileOptions::default(),
                job_id: Some(JobId::new(job_id as u64)),
            });
        }

        fs::write(
            dest.join("manifest.json"),
            serde_json::to_vec_pretty(&manifest)?,
        )
        .context("failed to write manifest")?;

        self.set_job_count(specs.len());
        Ok((batch_id, specs))
    }

    /// Trigger cooperative shutdown and tell every known worker.
    pub fn shutdown(&self) {
        self.shared.shutdown.set();
        let workers: Vec<(String, u16)> = self
            .shared
            .lock_state()
            .workers
            .values()
            .map(|w| (w.host.clone(), w.port))
            .collect();
        let msg = WireMessage::Shutdown(Shutdown {
            host: self.shared.config.tcp_host.clone(),
            port: self.shared.config.tcp_port,
        });
        for (host, port) in workers {
            if let Err(e) = tcp::send_message(&host, port, &msg) {
                debug!("Failed to notify worker {}:{} of shutdown: {}", host, port, e);
            }
        }
    }

    pub fn shutdown_event(&self) -> Event {
        self.shared.shutdown.clone()
    }

    /// Block until shutdown is requested.
    pub fn wait_for_shutdown(&self) {
        while !self.shared.shutdown.wait_timeout(Duration::from_secs(60)) {}
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_results(&self) -> MutexGuard<'_, ResultsChannel> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_result(&self, outcome: JobOutcome) {
        let _ = self.lock_results().tx.send(outcome);
    }

    fn handle_tcp_message(&self, msg: WireMessage) {
        match msg {
            WireMessage::Shutdown(_) => {
                info!("Shutdown requested over TCP");
                self.shutdown.set();
            }
            WireMessage::NewConvertor(reg) => self.register_worker(reg),
            WireMessage::ImagesReady(ready) => self.handle_job_complete(ready),
            WireMessage::JobError(err) => self.handle_job_error(err),
            other => warn!("Unhandled message: {}", other.type_name()),
        }
    }

    fn register_worker(&self, reg: Registration) {
        if reg.host.is_empty() || reg.port == 0 {
            return;
        }

        let worker_id = {
            let mut state = self.lock_state();
            let existing = state
                .workers
                .iter()
                .find(|(_, w)| w.host == reg.host && w.port == reg.port)
                .map(|(id, _)| *id);
            match existing {
                // Same endpoint re-registering: keep the record and
                // re-ack its id so a lost ack doesn't strand the worker.
                Some(id) => id,
                None => {
                    let id = WorkerId::new(state.next_worker_id);
                    state.next_worker_id += 1;
                    state.workers.insert(
                        id,
                        WorkerRecord {
                            host: reg.host.clone(),
                            port: reg.port,
                            last_heartbeat: current_time(),
                            status: WorkerStatus::Alive,
                            active_jobs: Vec::new(),
                        },
                    );
                    info!("Registered worker {} at {}:{}", id, reg.host, reg.port);
                    id
                }
            }
        };

        let ack = WireMessage::Ack(Ack { id: worker_id });
        if let Err(e) = tcp::send_message(&reg.host, reg.port, &ack) {
            error!("Failed to ack worker {}: {}", worker_id, e);
        }
    }

    fn handle_job_complete(&self, ready: ImagesReady) {
        {
            let mut state = self.lock_state();
            if ready.batch_id.as_u64() != state.batch_id {
                debug!(
                    "Discarding images_ready for stale batch {} (current {})",
                    ready.batch_id, state.batch_id
                );
                return;
            }
            if !state.workers.contains_key(&ready.worker_id) {
                warn!("images_ready from unknown worker {}", ready.worker_id);
                return;
            }
            if let Some(job) = state.jobs.get_mut(&ready.job_id) {
                job.status = JobStatus::Done;
            }
            if let Some(worker) = state.workers.get_mut(&ready.worker_id) {
                worker.active_jobs.retain(|id| *id != ready.job_id);
            }
        }

        let urls: Vec<String> = ready
            .paths
            .unwrap_or_default()
            .iter()
            .filter_map(|p| p.file_name())
            .map(|name| {
                format!(
                    "/api/files/{}/output/{}/{}",
                    ready.batch_id,
                    ready.job_id,
                    name.to_string_lossy()
                )
            })
            .collect();

        self.push_result(JobOutcome::Images {
            batch_id: ready.batch_id,
            job_id: ready.job_id,
            urls,
        });
    }

    fn handle_job_error(&self, report: JobError) {
        {
            let mut state = self.lock_state();
            if report.batch_id.as_u64() != state.batch_id {
                debug!(
                    "Discarding job_error for stale batch {} (current {})",
                    report.batch_id, state.batch_id
                );
                return;
            }
            if let Some(job) = state.jobs.get_mut(&report.job_id) {
                job.status = JobStatus::Error;
                job.error = Some(report.error.clone());
            }
            if let Some(worker) = state.workers.get_mut(&report.w_id) {
                worker.active_jobs.retain(|id| *id != report.job_id);
            }
        }

        self.push_result(JobOutcome::JobError {
            batch_id: report.batch_id,
            job_id: report.job_id,
            error: report.error,
            traceback: report.traceback,
        });
    }

    fn handle_heartbeat(&self, msg: WireMessage) {
        let WireMessage::Heartbeat(beat) = msg else {
            return;
        };
        let mut state = self.lock_state();
        match state.workers.get_mut(&beat.worker_id) {
            // A dead worker must re-register; its heartbeats are ignored.
            Some(worker) if worker.status == WorkerStatus::Alive => {
                worker.last_heartbeat = beat.time;
            }
            Some(_) => debug!("Ignoring heartbeat from dead worker {}", beat.worker_id),
            None => debug!("Ignoring heartbeat from unknown worker {}", beat.worker_id),
        }
    }

    fn start_job(&self, spec: JobSpec) -> bool {
        let (job_id, batch_id, host, port) = {
            let mut state = self.lock_state();

            let mut alive: Vec<(usize, WorkerId)> = state
                .workers
                .iter()
                .filter(|(_, w)| w.status == WorkerStatus::Alive)
                .map(|(id, w)| (w.active_jobs.len(), *id))
                .collect();
            if alive.is_empty() {
                return false;
            }
            // Shortest queue wins; ties go to the smallest worker id.
            alive.sort();
            let (_, worker_id) = alive[0];

            let job_id = match spec.job_id {
                Some(id) => id,
                None => {
                    let id = JobId::new(state.next_job_id);
                    state.next_job_id += 1;
                    id
                }
            };
            let batch_id = BatchId::new(state.batch_id);

            let worker = state
                .workers
                .get_mut(&worker_id)
                .expect("selected worker disappeared under the lock");
            worker.active_jobs.push(job_id);
            let host = worker.host.clone();
            let port = worker.port;

            let mut record_spec = spec.clone();
            record_spec.job_id = Some(job_id);
            state.jobs.insert(
                job_id,
                JobRecord {
                    job_id,
                    batch_id,
                    spec: record_spec,
                    worker: Some(worker_id),
                    status: JobStatus::Running,
                    error: None,
                },
            );

            (job_id, batch_id, host, port)
        };

        // Stream the input outside the lock. A failed send leaves the
        // job running; the liveness monitor reassigns it when the
        // worker's heartbeat times out.
        match FileFrame::start_job(batch_id, job_id, &spec.input_file, spec.options) {
            Ok(frame) => {
                if let Err(e) = tcp::send_file(&host, port, &frame) {
                    error!("Failed to dispatch job {}: {}", job_id, e);
                }
            }
            Err(e) => error!("Failed to build new_job frame for job {}: {}", job_id, e),
        }
        true
    }

    fn monitor_loop(&self) {
        loop {
            if self.shutdown.wait_timeout(MONITOR_PERIOD) {
                break;
            }
            let orphaned = self.sweep_dead_workers(current_time());
            for spec in orphaned {
                // Reassignment reuses the recorded spec. With no alive
                // worker left this drops the attempt; the job stays
                // running and the caller may resubmit.
                self.start_job(spec);
            }
        }
    }

    /// Mark workers past the heartbeat timeout dead and drain their
    /// running jobs for reassignment.
    fn sweep_dead_workers(&self, now: f64) -> Vec<JobSpec> {
        let timeout = self.config.heartbeat_timeout.as_secs_f64();
        let mut orphaned = Vec::new();

        let mut state = self.lock_state();
        let DispatcherState { workers, jobs, .. } = &mut *state;
        for (worker_id, worker) in workers.iter_mut() {
            if worker.status == WorkerStatus::Dead {
                continue;
            }
            if now - worker.last_heartbeat < timeout {
                continue;
            }
            warn!(
                "Worker {} at {}:{} is dead; last heartbeat {:.1}s ago",
                worker_id,
                worker.host,
                worker.port,
                now - worker.last_heartbeat
            );
            worker.status = WorkerStatus::Dead;
            for job_id in worker.active_jobs.drain(..) {
                if let Some(job) = jobs.get(&job_id) {
                    if job.status == JobStatus::Running {
                        orphaned.push(job.spec.clone());
                    }
                }
            }
        }
        orphaned
    }
}
