//! Canonical defaults shared by the dispatcher and worker binaries.

use std::time::Duration;

pub const DISPATCHER_TCP_PORT: u16 = 5055;
pub const DISPATCHER_UDP_PORT: u16 = 5056;
pub const WORKER_TCP_PORT: u16 = 5057;
/// How far past the configured worker port the free-port probe looks.
pub const PORT_PROBE_RANGE: u16 = 100;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const SEND_TIMEOUT: Duration = Duration::from_secs(30);
pub const RECV_TIMEOUT: Duration = Duration::from_secs(30);

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
pub const MONITOR_PERIOD: Duration = Duration::from_secs(2);

/// Framed headers larger than this are rejected as malformed.
pub const MAX_HEADER_LEN: u32 = 10_000_000;

/// Accept-loop poll interval; bounds shutdown latency on the listeners.
pub const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// UDP receive timeout; bounds shutdown latency on the heartbeat listener.
pub const UDP_RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Job queue pop timeout on the worker.
pub const QUEUE_POLL: Duration = Duration::from_secs(1);
