#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use hermes_sidecar::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "hermes-sidecar",
    about = "Load-aware service mesh sidecar with credit-based admission"
)]
struct Cli {
    /// Path to sidecar config file (.toml or .json); defaults apply when missing
    #[arg(short, long, default_value = "sidecar.toml")]
    config: PathBuf,

    /// Inbound listen address (traffic to the local app)
    #[arg(long)]
    inbound_listen: Option<String>,

    /// Outbound listen address (calls made by the local app)
    #[arg(long)]
    outbound_listen: Option<String>,

    /// Admin API listen address (for health/metrics)
    #[arg(long)]
    admin_listen: Option<String>,

    /// Runtime worker threads (defaults to available parallelism)
    #[arg(long)]
    workers: Option<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = cli.workers.filter(|n| *n > 0).unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    });

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        inbound_listen: cli.inbound_listen,
        outbound_listen: cli.outbound_listen,
        admin_listen: cli.admin_listen,
    }))
}
