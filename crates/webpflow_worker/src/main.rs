//! Webpflow worker binary.
//!
//! Usage:
//!     webpflow-worker --port 5057 --dispatcher-host 127.0.0.1

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webpflow_protocol::defaults::PORT_PROBE_RANGE;
use webpflow_protocol::files::find_free_tcp_port;
use webpflow_worker::{WorkerConfig, WorkerServer};

#[derive(Parser, Debug)]
#[command(
    name = "webpflow-worker",
    about = "Conversion worker for the webpflow pipeline"
)]
struct Args {
    /// Worker bind address
    #[arg(long)]
    host: Option<String>,

    /// Worker TCP port (probes upward when busy)
    #[arg(short, long)]
    port: Option<u16>,

    /// Dispatcher host
    #[arg(long)]
    dispatcher_host: Option<String>,

    /// Dispatcher TCP port
    #[arg(long)]
    dispatcher_port: Option<u16>,

    /// Dispatcher UDP heartbeat port
    #[arg(long)]
    dispatcher_udp_port: Option<u16>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "webpflow_worker=debug,webpflow_protocol=debug"
    } else {
        "webpflow_worker=info,webpflow_protocol=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = WorkerConfig::load();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(host) = args.dispatcher_host {
        config.dispatcher_host = host;
    }
    if let Some(port) = args.dispatcher_port {
        config.dispatcher_tcp_port = port;
    }
    if let Some(port) = args.dispatcher_udp_port {
        config.dispatcher_udp_port = port;
    }

    let port = find_free_tcp_port(&config.host, config.port, PORT_PROBE_RANGE)?;
    if port != config.port {
        tracing::info!("Port {} busy, using {}", config.port, port);
        config.port = port;
    }

    tracing::info!("Starting webpflow worker");
    tracing::info!("  Listening: {}:{}", config.host, config.port);
    tracing::info!(
        "  Dispatcher: {}:{} (udp {})",
        config.dispatcher_host,
        config.dispatcher_tcp_port,
        config.dispatcher_udp_port
    );

    let server = WorkerServer::new(config);
    let shutdown = server.shutdown_event();
    ctrlc::set_handler(move || {
        tracing::info!("Interrupted");
        shutdown.set();
    })?;

    server.run()
}
