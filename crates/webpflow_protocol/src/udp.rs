//! UDP transport for worker heartbeats.
//!
//! Workers send fire-and-forget datagrams to the dispatcher every
//! couple of seconds; the dispatcher uses them to detect dead workers
//! and reassign their jobs.

use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::defaults::UDP_RECV_TIMEOUT;
use crate::event::Event;
use crate::types::{current_time, decode_message, encode_message, Heartbeat, WireMessage, WorkerId};

/// Callback invoked with each decoded datagram.
pub type Handler = dyn Fn(WireMessage) + Send + Sync;

/// Send a JSON message over UDP (fire-and-forget).
pub fn send_udp(host: &str, port: u16, msg: &WireMessage) {
    let bytes = match encode_message(msg) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("UDP encode failed: {}", e);
            return;
        }
    };
    let result = UdpSocket::bind(("0.0.0.0", 0)).and_then(|socket| socket.send_to(&bytes, (host, port)));
    if let Err(e) = result {
        debug!("UDP send failed to {}:{}: {}", host, port, e);
    }
}

/// Worker -> Dispatcher heartbeats until shutdown.
pub fn send_heartbeats(
    worker_id: WorkerId,
    dispatcher_host: &str,
    dispatcher_udp_port: u16,
    shutdown: Event,
    interval: Duration,
) {
    info!(
        "Starting heartbeat sender: {} -> {}:{}",
        worker_id, dispatcher_host, dispatcher_udp_port
    );

    loop {
        let beat = WireMessage::Heartbeat(Heartbeat {
            worker_id,
            time: current_time(),
        });
        send_udp(dispatcher_host, dispatcher_udp_port, &beat);
        if shutdown.wait_timeout(interval) {
            break;
        }
    }

    info!("Heartbeat sender stopped");
}

/// Receive loop for heartbeat datagrams.
///
/// Decode failures are logged and dropped; there are no retries and no
/// reassembly.
pub fn serve(socket: UdpSocket, shutdown: Event, handler: Arc<Handler>) {
    if let Err(e) = socket.set_read_timeout(Some(UDP_RECV_TIMEOUT)) {
        error!("Failed to set UDP read timeout: {}", e);
        return;
    }
    let local = socket
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    info!("UDP server listening on {}", local);

    let mut buf = [0u8; 4096];
    while !shutdown.is_set() {
        match socket.recv_from(&mut buf) {
            Ok((len, addr)) => match decode_message(&buf[..len]) {
                Ok(msg) => handler(msg),
                Err(e) => warn!("Invalid datagram from {}: {}", addr, e),
            },
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                if shutdown.is_set() {
                    break;
                }
                error!("UDP recv failed: {}", e);
            }
        }
    }

    info!("UDP server shutting down");
}
