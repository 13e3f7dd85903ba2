//! In-process replication simulation.
//!
//! Starts N nodes sharing one store and one `LocalBus`, creates sessions on
//! random nodes, loads them everywhere, then applies random writes from
//! random nodes. At the end every replica is compared with the store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sessmesh_core::{
    KeyValueBackend, LocalBus, ManagerConfig, NodeId, SessionNode, SessionReplica, UpdateMode,
};

#[derive(clap::Args, Debug)]
pub struct Args {
    /// Number of nodes
    #[arg(long, default_value = "3")]
    nodes: usize,

    /// Number of sessions
    #[arg(long, default_value = "10")]
    sessions: usize,

    /// Total attribute writes across all nodes
    #[arg(long, default_value = "100")]
    writes: usize,

    /// Distinct attribute names per session
    #[arg(long, default_value = "5")]
    keys: usize,

    /// Use deferred updates, flushing after every write
    #[arg(long)]
    deferred: bool,

    /// Pause between writes (ms); 0 lets writes from different nodes race
    #[arg(long, default_value = "2")]
    delay_ms: u64,

    /// Time to let the bus drain before checking (ms)
    #[arg(long, default_value = "250")]
    settle_ms: u64,

    /// RNG seed for a reproducible run
    #[arg(long)]
    seed: Option<u64>,
}

pub async fn run(args: &Args, mut config: ManagerConfig, backend: Arc<dyn KeyValueBackend>) -> Result<()> {
    anyhow::ensure!(
        args.nodes > 0 && args.sessions > 0 && args.keys > 0,
        "need at least one node, session and key"
    );
    if args.deferred {
        config.update_mode = UpdateMode::Deferred;
    }
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let bus = Arc::new(LocalBus::new(config.bus_capacity));
    let mut nodes = Vec::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let node = SessionNode::start_with_id(
            config.clone(),
            NodeId::from(format!("sim-{i}").as_str()),
            Arc::clone(&backend),
            bus.clone(),
        )
        .await
        .with_context(|| format!("starting node sim-{i}"))?;
        nodes.push(node);
    }

    println!("sessmesh simulation");
    println!("   Nodes:     {}", args.nodes);
    println!("   Sessions:  {}", args.sessions);
    println!("   Writes:    {}", args.writes);
    println!("   Mode:      {:?} / {:?}", config.update_mode, config.encoding);
    println!();

    // Every node holds every session.
    let mut replicas: Vec<Vec<Arc<SessionReplica>>> = Vec::with_capacity(args.sessions);
    for _ in 0..args.sessions {
        let home = &nodes[rng.gen_range(0..nodes.len())];
        let session = home.manager().create_new(None);
        home.manager().complete_request(&session).await?;
        let mut row = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let replica = node
                .manager()
                .find_or_load(session.id())
                .await
                .with_context(|| format!("loading {} on {}", session.id(), node.node_id()))?;
            row.push(replica);
        }
        replicas.push(row);
    }

    let started = Instant::now();
    let mut failures = 0usize;
    for n in 0..args.writes {
        let row = &replicas[rng.gen_range(0..replicas.len())];
        let node = rng.gen_range(0..nodes.len());
        let replica = &row[node];
        let key = format!("k{}", rng.gen_range(0..args.keys));
        let result = if rng.gen_bool(0.2) {
            replica.remove_attribute(&key).await
        } else {
            replica.set_attribute(&key, serde_json::json!({ "write": n, "node": node })).await
        };
        let result = match result {
            Ok(()) => nodes[node].manager().complete_request(replica).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            failures += 1;
            tracing::warn!(session = %replica.id(), "Write failed: {e}");
        }
        if args.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
        }
    }
    let elapsed = started.elapsed();
    tokio::time::sleep(Duration::from_millis(args.settle_ms)).await;

    let mut diverged = 0usize;
    for row in &replicas {
        let Some(first) = row.first() else { continue };
        let stored = first.store().read_all().await?;
        for replica in row {
            for k in 0..args.keys {
                let key = format!("k{k}");
                if replica.get_attribute(&key).await.as_ref() != stored.get(&key) {
                    diverged += 1;
                    tracing::warn!(session = %replica.id(), key = %key, "Replica differs from store");
                }
            }
        }
    }

    let mut applied = 0;
    let mut suppressed = 0;
    let mut decode_errors = 0;
    for node in &nodes {
        let m = node.manager().metrics();
        applied += m.applied;
        suppressed += m.suppressed;
        decode_errors += m.decode_errors;
    }

    println!("Results");
    println!("   Write phase:    {:.2?} ({} failed)", elapsed, failures);
    println!("   Applied:        {applied}");
    println!("   Suppressed:     {suppressed}");
    println!("   Decode errors:  {decode_errors}");
    println!("   Bus drops:      {}", bus.dropped());
    println!("   Divergent keys: {diverged}");
    if diverged == 0 {
        println!("   All replicas converged.");
    }

    for node in nodes {
        node.shutdown();
    }
    Ok(())
}
