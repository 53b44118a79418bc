//! Webpflow dispatcher binary.
//!
//! Usage:
//!     webpflow-dispatcher --host 127.0.0.1 --tcp-port 5055 --udp-port 5056

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webpflow_dispatcher::{Dispatcher, DispatcherConfig};

#[derive(Parser, Debug)]
#[command(
    name = "webpflow-dispatcher",
    about = "Control plane for the webpflow conversion pipeline"
)]
struct Args {
    /// Bind address for both sockets
    #[arg(long)]
    host: Option<String>,

    /// TCP control/transfer port
    #[arg(long)]
    tcp_port: Option<u16>,

    /// UDP heartbeat port
    #[arg(long)]
    udp_port: Option<u16>,

    /// Seconds without a heartbeat before a worker is declared dead
    #[arg(long)]
    heartbeat_timeout: Option<f64>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "webpflow_dispatcher=debug,webpflow_protocol=debug"
    } else {
        "webpflow_dispatcher=info,webpflow_protocol=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = DispatcherConfig::load();
    if let Some(host) = args.host {
        config.tcp_host = host;
    }
    if let Some(port) = args.tcp_port {
        config.tcp_port = port;
    }
    if let Some(port) = args.udp_port {
        config.udp_port = port;
    }
    if let Some(timeout) = args.heartbeat_timeout {
        config.heartbeat_timeout = std::time::Duration::from_secs_f64(timeout);
    }

    tracing::info!("Starting webpflow dispatcher");
    tracing::info!("  TCP: {}:{}", config.tcp_host, config.tcp_port);
    tracing::info!("  UDP: {}:{}", config.tcp_host, config.udp_port);

    let dispatcher = Dispatcher::start(config)?;

    let handle = dispatcher.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Interrupted");
        handle.shutdown();
    })?;

    dispatcher.wait_for_shutdown();
    Ok(())
}
