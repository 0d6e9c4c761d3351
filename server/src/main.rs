use std::{net::SocketAddr, process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use rand::{rngs::StdRng, SeedableRng};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use udht_logic::{
    cancel::{CancelHandle, CancelToken},
    config::{LookupConfig, RoutingConfig, SystemConfig, TimingConfig},
    KademliaNode,
};
use udht_transport::{create_node, UdpSender};

const EXIT_BAD_CONFIG: u8 = 2;
const EXIT_BIND_FAILED: u8 = 3;

#[derive(Parser, Debug)]
#[clap(about = "Kademlia distributed hash table node")]
struct Args {
    /// UDP port to bind
    #[clap(short, long)]
    port: u16,

    /// Seed endpoints (`ip:port`), repeatable
    #[clap(short, long)]
    bootstrap: Vec<String>,

    /// Externally visible `ip:port`, when it differs from the bound one
    #[clap(long)]
    advertise: Option<String>,

    /// Bucket size / replication width
    #[clap(long, default_value_t = 20)]
    k: usize,

    /// Lookup concurrency
    #[clap(long, default_value_t = 3)]
    alpha: u32,

    /// Per-request deadline in milliseconds
    #[clap(long, default_value_t = 5000)]
    request_timeout_ms: u64,

    /// Attempt budget of the retrying send helper
    #[clap(long, default_value_t = 3)]
    max_retries: u32,

    /// Bucket refresh cadence in seconds
    #[clap(long, default_value_t = 5 * 60)]
    refresh_interval_secs: u64,

    /// Contact liveness window in seconds
    #[clap(long, default_value_t = 15 * 60)]
    liveness_window_secs: u64,
}

fn parse_endpoint(text: &str) -> Result<SocketAddr, String> {
    text.parse()
        .map_err(|x| format!("invalid endpoint {text:?}: {x}"))
}

fn build_config(args: &Args) -> Result<(SystemConfig, Vec<SocketAddr>, Option<SocketAddr>), String> {
    if args.k == 0 {
        return Err("k must be at least 1".into());
    }
    if args.alpha == 0 {
        return Err("alpha must be at least 1".into());
    }

    let seeds = args
        .bootstrap
        .iter()
        .map(|x| parse_endpoint(x))
        .collect::<Result<Vec<_>, _>>()?;
    let advertise = args.advertise.as_deref().map(parse_endpoint).transpose()?;

    let config = SystemConfig {
        routing: RoutingConfig {
            bucket_size: args.k,
        },
        lookup: LookupConfig {
            parallelism: args.alpha,
        },
        timing: TimingConfig {
            request_timeout: Duration::from_millis(args.request_timeout_ms),
            max_retries: args.max_retries,
            refresh_interval: Duration::from_secs(args.refresh_interval_secs),
            liveness_window: Duration::from_secs(args.liveness_window_secs),
        },
        ..Default::default()
    };
    Ok((config, seeds, advertise))
}

async fn maintenance(node: Arc<KademliaNode<UdpSender>>, mut shutdown: CancelToken) {
    let mut rng = StdRng::from_entropy();
    let mut interval = tokio::time::interval(node.config().timing.refresh_interval);
    interval.tick().await; // the first tick fires immediately
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => node.refresh(&mut rng).await,
        }
    }
    info!("Maintenance task stopped");
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Clap itself exits with code 2 on unparsable arguments
    let args = Args::parse();
    let (config, seeds, advertise) = match build_config(&args) {
        Ok(x) => x,
        Err(x) => {
            error!("Bad configuration: {x}");
            return ExitCode::from(EXIT_BAD_CONFIG);
        }
    };

    let shutdown = CancelHandle::new();
    let listen: SocketAddr = ([0, 0, 0, 0], args.port).into();
    let node = match create_node(config, listen, advertise, shutdown.token()).await {
        Ok(x) => x,
        Err(x) => {
            error!("Cannot bind UDP port {}: {x}", args.port);
            return ExitCode::from(EXIT_BIND_FAILED);
        }
    };

    if !seeds.is_empty() {
        node.bootstrap(&seeds).await;
        match node.publish_self().await {
            Ok(report) => info!(
                "Announced own endpoint to {}/{} peers",
                report.acknowledged, report.attempted
            ),
            Err(x) => warn!("Failed to announce own endpoint: {x}"),
        }
    }

    tokio::spawn(maintenance(node.clone(), shutdown.token()));

    info!("Node {} running, ctrl-c to stop", node.id());
    if let Err(x) = tokio::signal::ctrl_c().await {
        error!("Cannot wait for the interrupt signal: {x}");
    }
    info!("Shutting down");
    shutdown.cancel();

    ExitCode::SUCCESS
}
