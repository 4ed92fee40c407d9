//! Worker binary: bind, register with the master, serve until shutdown.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use gkv_peer::PeerClient;
use gkv_table::DEFAULT_PENDING_LIMIT;
use gkv_worker::{serve, Worker, WorkerOptions};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gkv-worker", about = "GridKV worker process")]
struct Args {
    /// Master address, host:port.
    #[arg(long)]
    master: String,

    /// Listening port; -1 or 0 picks a free port.
    #[arg(long, default_value_t = -1)]
    port: i32,

    /// Host advertised to the master.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Pending entries per shard before an inline flush.
    #[arg(long, default_value_t = DEFAULT_PENDING_LIMIT)]
    pending_limit: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("build runtime")?;
    let worker = Worker::new(WorkerOptions {
        pending_limit: args.pending_limit,
    });

    let bind_port = if args.port <= 0 { 0 } else { args.port as u16 };
    let listener = runtime
        .block_on(TcpListener::bind(("0.0.0.0", bind_port)))
        .with_context(|| format!("bind port {bind_port}"))?;
    let local = listener.local_addr().context("local addr")?;
    info!(addr = %local, master = %args.master, "worker listening");

    let serve_worker = Arc::clone(&worker);
    runtime.spawn(serve(listener, serve_worker));

    // Announce ourselves, then block until the master calls back with
    // Initialize. Registration order across workers is up to the master.
    let master = PeerClient::connect(args.master.clone());
    master
        .register(&args.host, local.port())
        .context("register with master")?;
    worker.wait_for_registration();
    info!(id = worker.self_id()?, "worker registered");

    match worker.wait_for_shutdown() {
        Ok(()) => {
            info!("worker shut down cleanly");
            Ok(())
        }
        Err(err) => {
            error!(%err, "worker terminated");
            std::process::exit(1);
        }
    }
}
