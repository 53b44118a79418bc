//! End-to-end tests: a real dispatcher against scripted workers built
//! from the protocol crate's plumbing.

use std::fs;
use std::io::Write;
use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use webpflow_dispatcher::{Dispatcher, DispatcherConfig, JobOutcome, JobSpec, NextResult};
use webpflow_protocol::files::find_free_tcp_port;
use webpflow_protocol::{
    tcp, udp, BatchId, Event, FileFrame, FileOptions, JobId, Registration, WireMessage, WorkerId,
};

#[derive(Debug, Clone, PartialEq)]
enum WorkerSaw {
    Ack(WorkerId),
    Batch(BatchId),
    Job(BatchId, JobId),
}

/// A minimal in-process worker: accepts control frames, optionally
/// answers every job with a one-file bundle.
struct ScriptedWorker {
    port: u16,
    events: mpsc::Receiver<WorkerSaw>,
    shutdown: Event,
}

impl ScriptedWorker {
    fn spawn(dispatcher_port: u16, respond: bool, workdir: &Path) -> Self {
        let listener = tcp::bind_listener("127.0.0.1", 0).unwrap();
        let port = listener.local_addr().unwrap().port();
        let shutdown = Event::new();
        let (tx, events) = mpsc::channel();
        let worker_id = Arc::new(Mutex::new(None::<WorkerId>));

        let handler: Arc<tcp::Handler> = {
            let worker_id = Arc::clone(&worker_id);
            let workdir = workdir.to_path_buf();
            Arc::new(move |msg| match msg {
                WireMessage::Ack(ack) => {
                    *worker_id.lock().unwrap() = Some(ack.id);
                    let _ = tx.send(WorkerSaw::Ack(ack.id));
                }
                WireMessage::NewBatch(batch) => {
                    let _ = tx.send(WorkerSaw::Batch(batch.batch_id));
                }
                WireMessage::NewJob(job) => {
                    let _ = tx.send(WorkerSaw::Job(job.batch_id, job.job_id));
                    if respond {
                        let id = worker_id.lock().unwrap().expect("job before ack");
                        let bundle = write_bundle(&workdir, id, job.job_id);
                        let frame =
                            FileFrame::images_ready(job.batch_id, job.job_id, id, &bundle).unwrap();
                        let _ = tcp::send_file("127.0.0.1", dispatcher_port, &frame);
                    }
                }
                _ => {}
            })
        };

        let storage = workdir.join(format!("jobs-{port}"));
        let server_shutdown = shutdown.clone();
        thread::spawn(move || tcp::serve(listener, storage, server_shutdown, handler));

        Self {
            port,
            events,
            shutdown,
        }
    }

    fn register(&self, dispatcher_port: u16) -> WorkerId {
        let msg = WireMessage::NewConvertor(Registration {
            host: "127.0.0.1".to_string(),
            port: self.port,
        });
        tcp::send_message("127.0.0.1", dispatcher_port, &msg).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(WorkerSaw::Ack(id)) => return id,
                Ok(_) => continue,
                Err(e) => panic!("no ack from dispatcher: {e}"),
            }
        }
    }

    fn expect_job(&self, timeout: Duration) -> (BatchId, JobId) {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(WorkerSaw::Job(batch, job)) => return (batch, job),
                Ok(_) => continue,
                Err(e) => panic!("no job delivered: {e}"),
            }
        }
    }

    fn expect_batch(&self, timeout: Duration) -> BatchId {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(WorkerSaw::Batch(batch)) => return batch,
                Ok(_) => continue,
                Err(e) => panic!("no new_batch delivered: {e}"),
            }
        }
    }
}

impl Drop for ScriptedWorker {
    fn drop(&mut self) {
        self.shutdown.set();
    }
}

fn write_bundle(dir: &Path, worker: WorkerId, job: JobId) -> PathBuf {
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fs::create_dir_all(dir).unwrap();
    let path = dir.join(format!("result-{}-{}.zip", worker, job));
    let file = fs::File::create(&path).unwrap();
    let mut writer = ZipWriter::new(file);
    writer
        .start_file("0.webp", SimpleFileOptions::default())
        .unwrap();
    writer.write_all(b"converted webp bytes").unwrap();
    writer.finish().unwrap();
    path
}

fn free_udp_port() -> u16 {
    UdpSocket::bind(("127.0.0.1", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn start_dispatcher(dir: &Path, heartbeat_timeout: Duration) -> (Dispatcher, u16, u16) {
    let tcp_port = find_free_tcp_port("127.0.0.1", 40000, 2000).unwrap();
    let udp_port = free_udp_port();
    let config = DispatcherConfig {
        tcp_host: "127.0.0.1".to_string(),
        tcp_port,
        udp_port,
        upload_dir: dir.join("uploads"),
        extract_dir: dir.join("extracted"),
        results_dir: dir.join("results"),
        heartbeat_timeout,
    };
    let dispatcher = Dispatcher::start(config).unwrap();
    (dispatcher, tcp_port, udp_port)
}

fn wait_for_images(dispatcher: &Dispatcher, timeout: Duration) -> (BatchId, JobId, Vec<String>) {
    let deadline = Instant::now() + timeout;
    loop {
        match dispatcher.next_result(Duration::from_millis(500)) {
            NextResult::Result(JobOutcome::Images {
                batch_id,
                job_id,
                urls,
            }) => return (batch_id, job_id, urls),
            NextResult::Result(JobOutcome::JobError { error, .. }) => {
                panic!("job failed: {error}")
            }
            NextResult::Timeout if Instant::now() < deadline => continue,
            other => panic!("no images result before timeout: {other:?}"),
        }
    }
}

#[test]
fn happy_path_single_upload() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, tcp_port, _udp) = start_dispatcher(dir.path(), Duration::from_secs(60));

    let worker = ScriptedWorker::spawn(tcp_port, true, dir.path());
    let worker_id = worker.register(tcp_port);
    assert_eq!(worker_id, WorkerId::new(0));

    let upload = dir.path().join("photo.png");
    fs::write(&upload, b"ten by ten png").unwrap();
    let (batch_id, specs) = dispatcher.ingest_upload(&upload).unwrap();
    assert_eq!(batch_id, BatchId::new(1));
    assert_eq!(specs.len(), 1);

    for spec in specs {
        assert!(dispatcher.start_job(spec));
    }

    let (result_batch, result_job, urls) = wait_for_images(&dispatcher, Duration::from_secs(30));
    assert_eq!(result_batch, BatchId::new(1));
    assert_eq!(result_job, JobId::new(0));
    assert_eq!(urls, vec!["/api/files/1/output/0/0.webp".to_string()]);

    assert!(dispatcher.is_batch_complete());
    assert_eq!(
        dispatcher.next_result(Duration::from_millis(100)),
        NextResult::EndOfBatch
    );

    dispatcher.shutdown();
}

#[test]
fn jobs_balance_across_two_workers() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, tcp_port, _udp) = start_dispatcher(dir.path(), Duration::from_secs(60));

    let worker_a = ScriptedWorker::spawn(tcp_port, false, dir.path());
    let worker_b = ScriptedWorker::spawn(tcp_port, false, dir.path());
    assert_eq!(worker_a.register(tcp_port), WorkerId::new(0));
    assert_eq!(worker_b.register(tcp_port), WorkerId::new(1));

    let input = dir.path().join("input.png");
    fs::write(&input, b"png bytes").unwrap();
    for _ in 0..3 {
        assert!(dispatcher.start_job(JobSpec {
            input_file: input.clone(),
            options: FileOptions::default(),
            job_id: None,
        }));
    }

    // Both empty: A wins the tie on id. Then B, then A again.
    let wait = Duration::from_secs(5);
    assert_eq!(worker_a.expect_job(wait).1, JobId::new(0));
    assert_eq!(worker_b.expect_job(wait).1, JobId::new(1));
    assert_eq!(worker_a.expect_job(wait).1, JobId::new(2));

    dispatcher.shutdown();
}

#[test]
fn version_mismatch_is_dropped_without_state_change() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, tcp_port, _udp) = start_dispatcher(dir.path(), Duration::from_secs(60));

    // A frame declaring v:2 must be logged and dropped.
    let header = br#"{"type":"job_error","v":2,"batch_id":1,"job_id":0,"w_id":0,"error":"x","traceback":"t"}"#;
    let mut stream = std::net::TcpStream::connect(("127.0.0.1", tcp_port)).unwrap();
    stream
        .write_all(&(header.len() as u32).to_be_bytes())
        .unwrap();
    stream.write_all(header).unwrap();
    drop(stream);

    assert_eq!(
        dispatcher.next_result(Duration::from_millis(300)),
        NextResult::Timeout
    );

    // The dispatcher stays healthy: a worker can still register.
    let worker = ScriptedWorker::spawn(tcp_port, false, dir.path());
    assert_eq!(worker.register(tcp_port), WorkerId::new(0));

    dispatcher.shutdown();
}

#[test]
fn batch_switch_discards_prior_results() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, tcp_port, _udp) = start_dispatcher(dir.path(), Duration::from_secs(60));

    let worker = ScriptedWorker::spawn(tcp_port, false, dir.path());
    let worker_id = worker.register(tcp_port);

    let upload = dir.path().join("one.png");
    fs::write(&upload, b"png bytes").unwrap();
    let (first_batch, specs) = dispatcher.ingest_upload(&upload).unwrap();
    assert_eq!(worker.expect_batch(Duration::from_secs(5)), first_batch);
    for spec in specs {
        dispatcher.start_job(spec);
    }
    worker.expect_job(Duration::from_secs(5));

    // A second upload supersedes the first batch.
    let (second_batch, specs) = dispatcher.ingest_upload(&upload).unwrap();
    assert_eq!(worker.expect_batch(Duration::from_secs(5)), second_batch);

    // A late result for the first batch is discarded silently.
    let bundle = write_bundle(dir.path(), worker_id, JobId::new(0));
    let stale =
        FileFrame::images_ready(first_batch, JobId::new(0), worker_id, &bundle).unwrap();
    tcp::send_file("127.0.0.1", tcp_port, &stale).unwrap();
    assert_eq!(
        dispatcher.next_result(Duration::from_millis(500)),
        NextResult::Timeout
    );

    // The current batch still flows.
    for spec in specs {
        dispatcher.start_job(spec);
    }
    let fresh =
        FileFrame::images_ready(second_batch, JobId::new(0), worker_id, &bundle).unwrap();
    tcp::send_file("127.0.0.1", tcp_port, &fresh).unwrap();
    let (result_batch, _, _) = wait_for_images(&dispatcher, Duration::from_secs(10));
    assert_eq!(result_batch, second_batch);

    dispatcher.shutdown();
}

#[test]
fn dead_worker_jobs_are_reassigned() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, tcp_port, udp_port) = start_dispatcher(dir.path(), Duration::from_secs(1));

    // Worker A never heartbeats and never answers; worker B does both.
    let worker_a = ScriptedWorker::spawn(tcp_port, false, dir.path());
    let worker_b = ScriptedWorker::spawn(tcp_port, true, dir.path());
    let a_id = worker_a.register(tcp_port);
    let b_id = worker_b.register(tcp_port);
    assert_eq!(a_id, WorkerId::new(0));

    let beat_shutdown = worker_b.shutdown.clone();
    thread::spawn(move || {
        udp::send_heartbeats(
            b_id,
            "127.0.0.1",
            udp_port,
            beat_shutdown,
            Duration::from_millis(200),
        )
    });

    let upload = dir.path().join("one.png");
    fs::write(&upload, b"png bytes").unwrap();
    let (batch_id, specs) = dispatcher.ingest_upload(&upload).unwrap();
    for spec in specs {
        assert!(dispatcher.start_job(spec));
    }

    // The tie goes to A; A sits on the job until the monitor declares
    // it dead and hands the job to B.
    worker_a.expect_job(Duration::from_secs(5));
    let (reassigned_batch, reassigned_job) = worker_b.expect_job(Duration::from_secs(15));
    assert_eq!(reassigned_batch, batch_id);
    assert_eq!(reassigned_job, JobId::new(0));

    let (result_batch, result_job, _) = wait_for_images(&dispatcher, Duration::from_secs(15));
    assert_eq!(result_batch, batch_id);
    assert_eq!(result_job, JobId::new(0));

    dispatcher.shutdown();
}
