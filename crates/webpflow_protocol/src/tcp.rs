//! Framed TCP transport for control messages and file payloads.
//!
//! Wire format:
//!     [4 bytes: header length, big-endian]
//!     [N bytes: JSON header]
//!     [M bytes: binary payload, present when the header carries byte_length]

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::fs;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

use crate::defaults::{ACCEPT_POLL, CONNECT_TIMEOUT, MAX_HEADER_LEN, RECV_TIMEOUT, SEND_TIMEOUT};
use crate::error::{ProtocolError, TransportError};
use crate::event::Event;
use crate::files::extract_files;
use crate::types::{decode_message, encode_message, FileFrame, WireMessage};

/// Callback invoked with each decoded (and payload-augmented) message.
pub type Handler = dyn Fn(WireMessage) + Send + Sync;

fn connect(host: &str, port: u16) -> Result<TcpStream, TransportError> {
    let wrap = |source: io::Error| TransportError::Connect {
        host: host.to_string(),
        port,
        source,
    };
    let addr: SocketAddr = (host, port)
        .to_socket_addrs()
        .map_err(wrap)?
        .next()
        .ok_or_else(|| {
            wrap(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no address resolved",
            ))
        })?;
    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(wrap)?;
    stream.set_write_timeout(Some(SEND_TIMEOUT)).map_err(wrap)?;
    Ok(stream)
}

fn write_frame(writer: &mut impl Write, header: &[u8], payload: &[u8]) -> io::Result<()> {
    writer.write_u32::<BigEndian>(header.len() as u32)?;
    writer.write_all(header)?;
    writer.write_all(payload)?;
    Ok(())
}

/// Send a header-only message over a fresh connection.
pub fn send_message(host: &str, port: u16, msg: &WireMessage) -> Result<(), TransportError> {
    let header = encode_message(msg)?;
    let mut stream = connect(host, port)?;
    write_frame(&mut stream, &header, &[]).map_err(|source| TransportError::Send {
        host: host.to_string(),
        port,
        source,
    })
}

/// Stream a header + file payload over a fresh connection.
pub fn send_file(host: &str, port: u16, frame: &FileFrame) -> Result<(), TransportError> {
    let mut stream = connect(host, port)?;
    write_frame(&mut stream, &frame.header, &frame.payload).map_err(|source| {
        TransportError::Send {
            host: host.to_string(),
            port,
            source,
        }
    })
}

/// Read exactly `n` bytes; a peer close mid-frame is a hard error.
pub fn recv_exact(reader: &mut impl Read, n: usize) -> Result<Vec<u8>, TransportError> {
    let mut buf = vec![0u8; n];
    let mut got = 0;
    while got < n {
        match reader.read(&mut buf[got..]) {
            Ok(0) => return Err(TransportError::ShortRead { got, expected: n }),
            Ok(k) => got += k,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::Io(e)),
        }
    }
    Ok(buf)
}

/// Bind a listener for [`serve`], leaving it in non-blocking mode so
/// the accept loop can poll the shutdown event.
pub fn bind_listener(host: &str, port: u16) -> io::Result<TcpListener> {
    let listener = TcpListener::bind((host, port))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Accept loop: one short-lived handler thread per connection, each
/// completing after a single framed message.
pub fn serve(listener: TcpListener, storage_dir: PathBuf, shutdown: Event, handler: Arc<Handler>) {
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    info!("TCP server listening on {}", local);

    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                if shutdown.is_set() {
                    break;
                }
                let storage_dir = storage_dir.clone();
                let handler = Arc::clone(&handler);
                thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, &storage_dir, &*handler) {
                        warn!("Invalid message from {}: {}", addr, e);
                    }
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if shutdown.wait_timeout(ACCEPT_POLL) {
                    break;
                }
            }
            Err(e) => {
                if shutdown.is_set() {
                    break;
                }
                error!("Accept failed: {}", e);
                if shutdown.wait_timeout(ACCEPT_POLL) {
                    break;
                }
            }
        }
    }

    info!("TCP server shutting down");
}

fn handle_connection(
    mut stream: TcpStream,
    storage_dir: &Path,
    handler: &Handler,
) -> Result<(), TransportError> {
    stream.set_read_timeout(Some(RECV_TIMEOUT))?;

    let prefix = recv_exact(&mut stream, 4)?;
    let header_len = BigEndian::read_u32(&prefix);
    if header_len > MAX_HEADER_LEN {
        return Err(ProtocolError::HeaderTooLarge(header_len).into());
    }

    let header_bytes = recv_exact(&mut stream, header_len as usize)?;
    let mut msg = decode_message(&header_bytes)?;
    debug!("Received {}", msg.type_name());

    match &mut msg {
        WireMessage::NewJob(job) => {
            let payload = recv_exact(&mut stream, job.byte_length as usize)?;
            match persist_payload(
                storage_dir,
                &job.filename,
                &job.batch_id.to_string(),
                &job.job_id.to_string(),
                &payload,
            )? {
                SavedPayload::File(path) => job.saved_path = Some(path),
                SavedPayload::Extracted { dir, files } => {
                    job.saved_path = Some(dir);
                    // A zipped job input is unusual but legal; expose
                    // the extracted files the same way images_ready does.
                    job.filename = files
                        .first()
                        .map(|p| {
                            p.file_name()
                                .map(|n| n.to_string_lossy().into_owned())
                                .unwrap_or_default()
                        })
                        .unwrap_or(job.filename.clone());
                }
            }
        }
        WireMessage::ImagesReady(ready) => {
            let payload = recv_exact(&mut stream, ready.byte_length as usize)?;
            match persist_payload(
                storage_dir,
                &ready.filename,
                &ready.batch_id.to_string(),
                &ready.job_id.to_string(),
                &payload,
            )? {
                SavedPayload::File(path) => ready.saved_path = Some(path),
                SavedPayload::Extracted { dir, files } => {
                    ready.paths = Some(files);
                    ready.saved_path = Some(dir);
                }
            }
        }
        _ => {}
    }

    handler(msg);
    Ok(())
}

enum SavedPayload {
    File(PathBuf),
    Extracted { dir: PathBuf, files: Vec<PathBuf> },
}

/// Persist an inbound payload under the server's storage directory.
///
/// Plain images are written as `storage/{filename}`; ZIP bundles are
/// written and then extracted under `storage/{batch}/{job}/`; anything
/// else is written verbatim.
fn persist_payload(
    storage_dir: &Path,
    filename: &str,
    batch: &str,
    job: &str,
    payload: &[u8],
) -> Result<SavedPayload, TransportError> {
    fs::create_dir_all(storage_dir).map_err(TransportError::Io)?;

    let name = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.bin".to_string());
    let ext = Path::new(&name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());

    match ext.as_deref() {
        Some("zip") => {
            let zip_path = storage_dir.join(&name);
            fs::write(&zip_path, payload).map_err(TransportError::Io)?;
            let dest = storage_dir.join(batch).join(job);
            let files = extract_files(&zip_path, &dest);
            Ok(SavedPayload::Extracted { dir: dest, files })
        }
        _ => {
            let out_path = storage_dir.join(&name);
            fs::write(&out_path, payload).map_err(TransportError::Io)?;
            Ok(SavedPayload::File(out_path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BatchId, FileOptions, JobId, Registration, WorkerId};
    use std::io::Cursor;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Server {
        port: u16,
        shutdown: Event,
        rx: mpsc::Receiver<WireMessage>,
    }

    fn start_server(storage: PathBuf) -> Server {
        let listener = bind_listener("127.0.0.1", 0).unwrap();
        let port = listener.local_addr().unwrap().port();
        let shutdown = Event::new();
        let (tx, rx) = mpsc::channel();
        let handler: Arc<Handler> = Arc::new(move |msg| {
            let _ = tx.send(msg);
        });
        let server_shutdown = shutdown.clone();
        thread::spawn(move || serve(listener, storage, server_shutdown, handler));
        Server { port, shutdown, rx }
    }

    #[test]
    fn recv_exact_reads_the_requested_bytes() {
        let mut reader = Cursor::new(b"abcdef".to_vec());
        assert_eq!(recv_exact(&mut reader, 4).unwrap(), b"abcd");
        assert_eq!(recv_exact(&mut reader, 2).unwrap(), b"ef");
    }

    #[test]
    fn recv_exact_errors_on_short_input() {
        let mut reader = Cursor::new(b"abc".to_vec());
        let err = recv_exact(&mut reader, 10).unwrap_err();
        assert!(matches!(
            err,
            TransportError::ShortRead {
                got: 3,
                expected: 10
            }
        ));
    }

    #[test]
    fn frame_prefix_is_big_endian() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"{\"a\":1}", b"xyz").unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 7]);
        assert_eq!(&buf[4..11], b"{\"a\":1}");
        assert_eq!(&buf[11..], b"xyz");
    }

    #[test]
    fn server_delivers_control_messages() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(dir.path().to_path_buf());

        let msg = WireMessage::NewConvertor(Registration {
            host: "127.0.0.1".to_string(),
            port: 9999,
        });
        send_message("127.0.0.1", server.port, &msg).unwrap();

        let received = server.rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(received, msg);
        server.shutdown.set();
    }

    #[test]
    fn server_persists_image_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path().join("storage");
        let server = start_server(storage.clone());

        let input = dir.path().join("photo.png");
        fs::write(&input, b"fake png").unwrap();
        let frame = FileFrame::start_job(
            BatchId::new(1),
            JobId::new(0),
            &input,
            FileOptions::default(),
        )
        .unwrap();
        send_file("127.0.0.1", server.port, &frame).unwrap();

        let received = server.rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let WireMessage::NewJob(job) = received else {
            panic!("expected new_job");
        };
        let saved = job.saved_path.expect("payload should be persisted");
        assert_eq!(saved, storage.join("photo.png"));
        assert_eq!(fs::read(&saved).unwrap(), b"fake png");
        server.shutdown.set();
    }

    #[test]
    fn server_extracts_zip_payloads() {
        use std::io::Write as _;
        use zip::write::SimpleFileOptions;
        use zip::ZipWriter;

        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path().join("storage");
        let server = start_server(storage.clone());

        let bundle = dir.path().join("result-0-3.zip");
        {
            let file = fs::File::create(&bundle).unwrap();
            let mut writer = ZipWriter::new(file);
            writer
                .start_file("0.webp", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"webp bytes").unwrap();
            writer.finish().unwrap();
        }

        let frame =
            FileFrame::images_ready(BatchId::new(2), JobId::new(3), WorkerId::new(0), &bundle)
                .unwrap();
        send_file("127.0.0.1", server.port, &frame).unwrap();

        let received = server.rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let WireMessage::ImagesReady(ready) = received else {
            panic!("expected images_ready");
        };
        let paths = ready.paths.expect("zip should be extracted");
        assert_eq!(paths.len(), 1);
        assert!(paths[0].ends_with("0.webp"));
        assert!(ready
            .saved_path
            .unwrap()
            .ends_with(Path::new("2").join("3")));
        server.shutdown.set();
    }

    #[test]
    fn server_drops_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(dir.path().to_path_buf());

        let header = br#"{"type":"heartbeat","v":2,"worker_id":0,"time":1.0}"#;
        let mut stream = TcpStream::connect(("127.0.0.1", server.port)).unwrap();
        write_frame(&mut stream, header, &[]).unwrap();
        drop(stream);

        assert!(server.rx.recv_timeout(Duration::from_millis(500)).is_err());
        server.shutdown.set();
    }

    #[test]
    fn server_drops_oversized_headers() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(dir.path().to_path_buf());

        let mut stream = TcpStream::connect(("127.0.0.1", server.port)).unwrap();
        stream.write_u32::<BigEndian>(MAX_HEADER_LEN + 1).unwrap();
        drop(stream);

        assert!(server.rx.recv_timeout(Duration::from_millis(500)).is_err());
        server.shutdown.set();
    }
}
