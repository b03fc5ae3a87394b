//! feedmux-sim: Runs a swarm of in-memory nodes and reports convergence.
//!
//! Every node joins every root key with its own fresh feeds, then the
//! simulator waits until each session holds every feed of its group and has
//! nothing left in flight.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use feedmux_core::memory::{MemoryNetwork, MemoryReplicator, MemoryStore};
use feedmux_core::{GroupSession, MuxConfig, Muxer, RootKey, SessionOptions, SessionStatus};

#[derive(Parser, Debug)]
#[command(name = "feedmux-sim")]
#[command(about = "Simulate feed multiplexing over an in-memory swarm")]
struct Args {
    /// Number of nodes
    #[arg(short, long, default_value_t = 3)]
    nodes: usize,

    /// Feeds each node creates per root key
    #[arg(short, long, default_value_t = 1)]
    feeds_per_node: usize,

    /// Number of root keys every node joins
    #[arg(short, long, default_value_t = 2)]
    roots: u8,

    /// Announce grace period in milliseconds (overrides FEEDMUX_ANNOUNCE_GRACE_MS)
    #[arg(long)]
    grace_ms: Option<u64>,

    /// Give up waiting for convergence after this many milliseconds
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    /// Reject runs that would report convergence without exchanging a feed.
    fn validate(&self) -> Result<()> {
        if self.nodes < 2 {
            bail!("need at least 2 nodes, got {}", self.nodes);
        }
        if self.roots == 0 {
            bail!("need at least 1 root key");
        }
        if self.feeds_per_node == 0 {
            bail!("need at least 1 feed per node");
        }
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionReport {
    name: String,
    root_key: String,
    status: SessionStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary {
    nodes: usize,
    roots: u8,
    expected_feeds: usize,
    converged: bool,
    elapsed_ms: u128,
    connections: usize,
    events: BTreeMap<&'static str, usize>,
    sessions: Vec<SessionReport>,
}

async fn wait_converged(session: &GroupSession, feeds: usize, deadline: Instant) -> bool {
    let mut status = session.watch();
    let remaining = deadline.saturating_duration_since(Instant::now());
    let waited = tokio::time::timeout(
        remaining,
        status.wait_for(|s| s.feeds == feeds && s.is_quiescent()),
    )
    .await;
    matches!(waited, Ok(Ok(_)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,feedmux_core=debug"
    } else {
        "info,feedmux_core=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    args.validate()?;

    let mut config = MuxConfig::from_env().context("invalid FEEDMUX_* environment")?;
    if let Some(ms) = args.grace_ms {
        config = config.with_announce_grace(Duration::from_millis(ms));
    }
    info!(
        "Simulating {} node(s), {} root(s), {} feed(s) per node per root",
        args.nodes, args.roots, args.feeds_per_node
    );

    let counts: Arc<Mutex<BTreeMap<&'static str, usize>>> = Arc::new(Mutex::new(BTreeMap::new()));
    let network = MemoryNetwork::new();
    let started = Instant::now();

    let mut muxers = Vec::with_capacity(args.nodes);
    let mut subscriptions = Vec::with_capacity(args.nodes);
    let mut sessions = Vec::new();

    for node in 0..args.nodes {
        let store = MemoryStore::new();
        let replicator = Arc::new(MemoryReplicator::new(Arc::clone(&store)));
        let muxer = Muxer::with_config(network.node(), replicator, config.clone());

        let counts = Arc::clone(&counts);
        subscriptions.push(muxer.subscribe(move |event| {
            *counts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .entry(event.kind())
                .or_insert(0) += 1;
        }));

        for root in 0..args.roots {
            let root_key = RootKey::from_bytes([root.wrapping_add(1); 32]);
            let name = format!("n{}r{}", node, root);
            let session = muxer
                .join(root_key, SessionOptions::named(name))
                .await
                .with_context(|| format!("node {} failed to join root {}", node, root))?;

            for n in 0..args.feeds_per_node {
                let feed = store.create();
                feed.append(format!("node {} root {} feed {}", node, root, n));
                session.add_feed(feed);
            }
            sessions.push(session);
        }
        muxers.push(muxer);
    }

    let expected = args.nodes * args.feeds_per_node;
    let deadline = Instant::now() + Duration::from_millis(args.timeout_ms);
    let waits = sessions
        .iter()
        .map(|session| wait_converged(session, expected, deadline));
    let converged = futures::future::join_all(waits).await.into_iter().all(|ok| ok);
    let elapsed = started.elapsed();

    if converged {
        info!("Converged in {:?}", elapsed);
    } else {
        warn!("Did not converge within {} ms", args.timeout_ms);
    }

    let summary = Summary {
        nodes: args.nodes,
        roots: args.roots,
        expected_feeds: expected,
        converged,
        elapsed_ms: elapsed.as_millis(),
        connections: network.connection_count(),
        events: counts.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        sessions: sessions
            .iter()
            .map(|s| SessionReport {
                name: s.name().to_string(),
                root_key: s.root_key().short(),
                status: s.status(),
            })
            .collect(),
    };

    for muxer in &muxers {
        if let Err(e) = muxer.close().await {
            warn!("Failed to close muxer: {}", e);
        }
    }
    drop(subscriptions);

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if !converged {
        bail!("simulation did not converge");
    }
    Ok(())
}
