//! cdc-fanout demo
//!
//! Runs a manager over the in-memory feed, drives a task that keeps
//! modifying the collection, and logs what the listeners receive until
//! Ctrl+C.

use clap::Parser;
use fanout_core::prelude::*;
use fanout_engine::{store_from_config, ChangeStreamManager, ChannelListener, MemoryChangeFeed};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "cdc-fanout")]
#[command(about = "Partitioned change-stream fan-out demo")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "CDC_FANOUT_CONFIG")]
    config: Option<String>,

    /// Watched collection (overrides the configuration)
    #[arg(long)]
    collection: Option<String>,

    /// Number of partitions (overrides the configuration)
    #[arg(short, long)]
    partitions: Option<u32>,

    /// Routing key field (overrides the configuration)
    #[arg(long)]
    key_name: Option<String>,

    /// Delay between two generated modifications, in milliseconds
    #[arg(long, default_value_t = 500)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = FanoutConfig::load(args.config.as_deref())?;
    if let Some(collection) = args.collection {
        config.collection_name = collection;
    }
    if let Some(partitions) = args.partitions {
        config.number_of_partitions = partitions;
    }
    if let Some(key_name) = args.key_name {
        config.key_name = key_name;
    }

    init_tracing(&config.observability.log_level, &config.observability.log_format);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        collection = %config.collection_name,
        partitions = config.number_of_partitions,
        "Starting cdc-fanout"
    );

    let feed = MemoryChangeFeed::new(&config.collection_name);
    let store = store_from_config(&config)?;
    let manager = ChangeStreamManager::new(config, Arc::new(feed.clone()), store).await?;

    let (listener, rx) = ChannelListener::new("demo_channel", 256);
    manager.register_listener_to_all_partitions(Arc::new(listener));

    manager.start().await?;

    let cancel = CancellationToken::new();
    let modifier = tokio::spawn(modify(feed, Duration::from_millis(args.interval_ms.max(1)), cancel.clone()));
    let consumer = tokio::spawn(consume(rx, manager.router().clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    cancel.cancel();
    if let Err(e) = modifier.await {
        warn!(error = %e, "Modification task failed");
    }
    manager.stop().await?;
    drop(manager);

    match tokio::time::timeout(Duration::from_secs(5), consumer).await {
        Ok(Ok(totals)) => info!(?totals, "Changes received per operation"),
        Ok(Err(e)) => warn!(error = %e, "Consumer task failed"),
        Err(_) => warn!("Consumer did not drain in time"),
    }
    Ok(())
}

fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Insert, update and delete documents until cancelled
async fn modify(feed: MemoryChangeFeed, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    let mut live: VecDeque<Value> = VecDeque::new();
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tick += 1;

        let outcome = match (tick % 5, live.back().cloned(), live.front().cloned()) {
            (3, Some(id), _) => {
                let mut set = Map::new();
                set.insert("revision".to_string(), json!(tick));
                feed.update(&id, set, vec![]).await.map(|_| ())
            }
            (0, _, Some(id)) => {
                live.pop_front();
                feed.delete(&id).await.map(|_| ())
            }
            _ => feed
                .insert(json!({"name": format!("document-{}", tick), "revision": 0}))
                .await
                .map(|id| live.push_back(id)),
        };
        if let Err(e) = outcome {
            warn!(error = %e, "Modification failed");
        }
    }
}

/// Log received changes; returns counts per operation type
async fn consume(mut rx: mpsc::Receiver<ChangeEvent>, router: PartitionRouter) -> BTreeMap<String, u64> {
    let mut totals = BTreeMap::new();
    while let Some(event) = rx.recv().await {
        info!(
            operation = %event.operation_type,
            document_id = %event.document_id(),
            partition = ?router.route(&event),
            "Listener received change"
        );
        *totals.entry(event.operation_type.to_string()).or_insert(0) += 1;
    }
    totals
}
