use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use rand::seq::SliceRandom;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use hyperspace::{KadId, Keypair, MemoryNetwork, Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "hyperspace")]
#[command(author, version, about = "Simulate an overlay over an in-memory network", long_about = None)]
struct Args {
    /// Nodes to spawn, the first acting as seed.
    #[arg(short, long, default_value = "16")]
    nodes: usize,

    /// Lookups for random targets once the overlay has settled.
    #[arg(short, long, default_value = "32")]
    lookups: usize,

    #[arg(short, long, default_value = "2")]
    k: usize,

    #[arg(short, long, default_value = "3")]
    siblings: usize,

    /// Time given to joins between steps, in milliseconds.
    #[arg(long, default_value = "500")]
    settle_ms: u64,
}

async fn bootstrap(seed: &Node, node: &Node) -> Result<()> {
    let (conn, offer) = seed.create_offer().await?;
    let answer = node.accept_offer(offer).await?;
    seed.apply_answer(conn, answer).await?;
    node.wait_for_connection(Duration::from_secs(5)).await
}

async fn simulate(args: &Args) -> Result<()> {
    let config = NodeConfig {
        k: args.k,
        siblings: args.siblings,
        ..NodeConfig::default()
    };
    let settle = Duration::from_millis(args.settle_ms);
    let network = MemoryNetwork::new();

    let mut nodes: Vec<Node> = Vec::with_capacity(args.nodes);
    for _ in 0..args.nodes {
        let (transport, events) = network.endpoint().await;
        let node = Node::start(Keypair::generate(), config.clone(), transport, events)?;
        if let Some(seed) = nodes.first() {
            bootstrap(seed, &node)
                .await
                .with_context(|| format!("bootstrapping {}", node.identity().short()))?;
            tokio::time::sleep(settle).await;
        }
        nodes.push(node);
    }
    tokio::time::sleep(settle).await;
    info!(
        nodes = nodes.len(),
        links = network.open_links().await,
        "overlay settled"
    );

    let mut answered = 0usize;
    for _ in 0..args.lookups {
        let (from, target) = {
            let mut rng = rand::thread_rng();
            let mut bytes = [0u8; 32];
            rng.fill(&mut bytes);
            (nodes.choose(&mut rng), KadId::from_bytes(bytes))
        };
        let Some(from) = from else { break };
        match from.lookup(target).await {
            Ok(found) => {
                answered += 1;
                info!(
                    from = %from.identity().short(),
                    target = %target.short(),
                    closest = %found.closest.short(),
                    hops = found.hops,
                    siblings = found.siblings.len(),
                    "lookup answered"
                );
            }
            Err(e) => warn!(from = %from.identity().short(), error = %e, "lookup failed"),
        }
    }
    info!(answered, requested = args.lookups, "lookups done");

    for node in &nodes {
        let snap = node.snapshot().await?;
        info!(
            node = %snap.identity.short(),
            siblings = snap.siblings.len(),
            table = snap.table_len,
            open = snap.open_connections,
            buckets = ?snap.buckets,
            cached_paths = snap.cached_paths,
            "routing snapshot"
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    // Graceful shutdown on Ctrl+C
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, exiting gracefully");
        }
        result = simulate(&args) => result?,
    }

    Ok(())
}
