//! Change stream manager
//!
//! Owns one worker per partition of a collection's feed. Construction checks
//! the partition count against the committed cluster config; `start` and
//! `stop` drive all workers with bounded waits; listener registration is
//! routed to the workers of the requested partitions.

use crate::context;
use crate::worker::ChangeStreamWorker;
use async_trait::async_trait;
use fanout_core::prelude::*;
use fanout_core::{ClusterConfig, ErrorContext, ErrorContextExt, WatchOptions};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Fans one collection feed out over N partition workers
pub struct ChangeStreamManager {
    id: String,
    config: FanoutConfig,
    router: PartitionRouter,
    cluster_config: ClusterConfig,
    workers: BTreeMap<u32, ChangeStreamWorker>,
    running: AtomicBool,
}

impl ChangeStreamManager {
    /// Validate the partition count against the store and build the workers
    ///
    /// Fails with `FanoutError::ConfigMismatch` when the collection was
    /// already partitioned with a different count.
    pub async fn new(
        config: FanoutConfig,
        feed: Arc<dyn ChangeFeed>,
        store: Arc<dyn ConfigStore>,
    ) -> Result<Self> {
        let id = context::next_manager_id(&config.database_name, &config.collection_name);
        let collection = config.collection_name.clone();
        let requested = config.number_of_partitions;

        let existing = store
            .find_cluster_config(&collection)
            .await
            .with_context(ErrorContext::new("manager", "find_cluster_config").with_collection(&collection))?;
        if let Some(existing) = existing {
            check_partitions(&existing, requested)?;
        }
        config.validate()?;

        let cluster_config = store
            .get_or_init_cluster_config(&collection, requested)
            .await
            .with_context(ErrorContext::new("manager", "get_or_init_cluster_config").with_collection(&collection))?;
        // another process may have committed a config in between
        check_partitions(&cluster_config, requested)?;

        let router = PartitionRouter::new(&config.key_name, cluster_config.partitions);
        let workers = (0..cluster_config.partitions)
            .map(|partition| {
                let worker = ChangeStreamWorker::new(
                    context::worker_id(&id, partition),
                    collection.clone(),
                    partition,
                    watch_options(&config, &router, partition),
                    Arc::clone(&feed),
                    Arc::clone(&store),
                );
                (partition, worker)
            })
            .collect();

        info!(
            manager_id = %id,
            collection = %collection,
            partitions = cluster_config.partitions,
            key_name = %config.key_name,
            feed = feed.name(),
            store = store.name(),
            "Created change stream manager"
        );

        Ok(Self {
            id,
            config,
            router,
            cluster_config,
            workers,
            running: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    pub fn cluster_config(&self) -> &ClusterConfig {
        &self.cluster_config
    }

    pub fn router(&self) -> &PartitionRouter {
        &self.router
    }

    pub fn partitions(&self) -> u32 {
        self.cluster_config.partitions
    }

    pub fn worker(&self, partition: u32) -> Option<&ChangeStreamWorker> {
        self.workers.get(&partition)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start every worker and wait until each one is streaming
    ///
    /// On failure all workers are stopped again and the first cause is
    /// returned wrapped in `FanoutError::StartFailure`.
    pub async fn start(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(FanoutError::lifecycle(format!(
                "Manager {} is already running",
                self.id
            )));
        }
        info!(manager_id = %self.id, partitions = self.partitions(), "Starting change stream manager");

        match self.start_workers().await {
            Ok(()) => {
                self.running.store(true, Ordering::SeqCst);
                info!(manager_id = %self.id, "Change stream manager started");
                Ok(())
            }
            Err(cause) => {
                error!(manager_id = %self.id, error = %cause, "Failed to start workers, stopping");
                if let Err(e) = self.stop().await {
                    error!(manager_id = %self.id, error = %e, "Failed to stop after start failure");
                }
                Err(FanoutError::start_failure(cause))
            }
        }
    }

    async fn start_workers(&self) -> Result<()> {
        for worker in self.workers.values() {
            worker.start()?;
        }

        let timeout = self.config.init_timeout;
        let outcomes = join_all(
            self.workers
                .values()
                .map(|worker| worker.await_initialization(timeout)),
        )
        .await;

        for (worker, outcome) in self.workers.values().zip(outcomes) {
            if !outcome? {
                warn!(
                    manager_id = %self.id,
                    worker_id = %worker.id(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Worker not initialized within timeout, state unknown"
                );
                if self.config.fail_on_init_timeout {
                    return Err(FanoutError::timeout(
                        format!("initialization of {}", worker.id()),
                        timeout.as_millis() as u64,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Stop every worker, waiting at most `shutdown_timeout` for each
    pub async fn stop(&self) -> Result<()> {
        info!(manager_id = %self.id, "Stopping change stream manager");

        let timeout = self.config.shutdown_timeout;
        let outcomes = join_all(self.workers.values().map(|worker| worker.stop(timeout))).await;
        let lagging = outcomes.iter().filter(|stopped| !**stopped).count();

        self.running.store(false, Ordering::SeqCst);
        if lagging > 0 {
            warn!(manager_id = %self.id, lagging, "Some workers did not confirm shutdown");
        } else {
            info!(manager_id = %self.id, "Change stream manager stopped");
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Listener routing
    // ------------------------------------------------------------------------

    /// Register a listener on the given partitions
    ///
    /// Unknown partitions are skipped with a warning.
    pub fn register_listener(&self, listener: Arc<dyn ChangeListener>, partitions: &[u32]) {
        for &partition in partitions {
            match self.workers.get(&partition) {
                Some(worker) => worker.register(Arc::clone(&listener)),
                None => warn!(
                    manager_id = %self.id,
                    partition,
                    listener = %listener.name(),
                    "No worker for partition, listener not registered"
                ),
            }
        }
    }

    pub fn register_listener_to_all_partitions(&self, listener: Arc<dyn ChangeListener>) {
        for worker in self.workers.values() {
            worker.register(Arc::clone(&listener));
        }
    }

    /// Deregister a listener from the given partitions
    pub fn deregister_listener(&self, listener: &Arc<dyn ChangeListener>, partitions: &[u32]) {
        for &partition in partitions {
            match self.workers.get(&partition) {
                Some(worker) => worker.deregister(listener),
                None => warn!(
                    manager_id = %self.id,
                    partition,
                    listener = %listener.name(),
                    "No worker for partition, nothing to deregister"
                ),
            }
        }
    }

    /// Deregister a listener from every partition it is registered on
    pub fn deregister_listener_from_all_partitions(&self, listener: &Arc<dyn ChangeListener>) {
        for worker in self.workers.values() {
            if worker.has_registered_listener(listener) {
                worker.deregister(listener);
            }
        }
    }

    /// Check whether a listener is registered on a partition
    pub fn has_registered_listener(&self, listener: &Arc<dyn ChangeListener>, partition: u32) -> bool {
        self.workers
            .get(&partition)
            .map(|worker| worker.has_registered_listener(listener))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Lifecycle for ChangeStreamManager {
    async fn start(&self) -> Result<()> {
        ChangeStreamManager::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        ChangeStreamManager::stop(self).await
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn check_partitions(existing: &ClusterConfig, requested: u32) -> Result<()> {
    if existing.partitions != requested {
        return Err(FanoutError::ConfigMismatch {
            feed: existing.collection.clone(),
            existing: existing.partitions,
            requested,
        });
    }
    Ok(())
}

/// Subscription of one partition: its predicate, ANDed with the user filter
fn watch_options(config: &FanoutConfig, router: &PartitionRouter, partition: u32) -> WatchOptions {
    let predicate = router.predicate(partition);
    let filter = match &config.match_filter {
        Some(user) => Expr::and(vec![user.clone(), predicate]),
        None => predicate,
    };

    let mut options = WatchOptions::new(filter).with_max_await(config.max_await);
    options.full_document = config.full_document;
    options.full_document_before_change = config.full_document_before_change;
    options
}
