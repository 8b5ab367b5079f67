//! Partition worker
//!
//! A worker owns one partition of the feed. It loads (or creates) the
//! partition's checkpoint, opens a cursor filtered to the partition, and
//! runs the tail loop on its own task: poll, fan out to listeners, persist
//! the cursor position whenever it moved.
//!
//! ```text
//! Created ──start──► Initializing ──cursor open──► Streaming ──stop──► Stopping ──► Stopped
//!                         │
//!                         └──checkpoint/open failure──► Failed
//! ```

use crate::backoff::ErrorBackoff;
use crate::listener::ListenerSet;
use fanout_core::prelude::*;
use fanout_core::{ErrorContext, ErrorContextExt, FanoutMetrics, WatchOptions};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Initializing,
    Streaming,
    Stopping,
    Stopped,
    /// Startup failed; the task has exited
    Failed,
}

impl WorkerState {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

/// Tails one partition of a change feed
pub struct ChangeStreamWorker {
    id: String,
    collection: String,
    partition: u32,
    feed: Arc<dyn ChangeFeed>,
    store: Arc<dyn ConfigStore>,
    options: WatchOptions,
    backoff: ErrorBackoff,
    listeners: Arc<ListenerSet>,
    metrics: FanoutMetrics,
    state: Arc<watch::Sender<WorkerState>>,
    initialized: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<FanoutError>>>,
    cancel: CancellationToken,
}

impl ChangeStreamWorker {
    /// Create a worker; `options.filter` must already select the partition
    pub fn new(
        id: impl Into<String>,
        collection: impl Into<String>,
        partition: u32,
        options: WatchOptions,
        feed: Arc<dyn ChangeFeed>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        let collection = collection.into();
        let (state, _) = watch::channel(WorkerState::Created);
        Self {
            id: id.into(),
            metrics: FanoutMetrics::new(collection.clone(), partition),
            collection,
            partition,
            feed,
            store,
            options,
            backoff: ErrorBackoff::default(),
            listeners: Arc::new(ListenerSet::new()),
            state: Arc::new(state),
            initialized: Arc::new(AtomicBool::new(false)),
            failure: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
        }
    }

    /// Builder: set the backoff between failed iterations
    pub fn with_backoff(mut self, backoff: ErrorBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn options(&self) -> &WatchOptions {
        &self.options
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Spawn the worker task
    ///
    /// Returns as soon as the task is spawned; use `await_initialization` to
    /// wait for the cursor to open. A worker can be started once.
    pub fn start(&self) -> Result<()> {
        let started = self.state.send_if_modified(|state| {
            if *state == WorkerState::Created {
                *state = WorkerState::Initializing;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(FanoutError::lifecycle(format!(
                "Worker {} cannot start from state {:?}",
                self.id,
                self.state()
            )));
        }

        let task = WorkerTask {
            collection: self.collection.clone(),
            partition: self.partition,
            feed: Arc::clone(&self.feed),
            store: Arc::clone(&self.store),
            options: self.options.clone(),
            backoff: self.backoff.clone(),
            listeners: Arc::clone(&self.listeners),
            metrics: self.metrics.clone(),
            state: Arc::clone(&self.state),
            initialized: Arc::clone(&self.initialized),
            failure: Arc::clone(&self.failure),
            cancel: self.cancel.clone(),
        };
        let span = info_span!(
            "change_stream_worker",
            worker_id = %self.id,
            collection = %self.collection,
            partition = self.partition,
        );
        tokio::spawn(task.run().instrument(span));

        debug!(worker_id = %self.id, "Worker task spawned");
        Ok(())
    }

    /// Wait until the cursor opened for the first time
    ///
    /// `Ok(true)` once streaming has begun, `Ok(false)` when `timeout`
    /// elapsed (or the worker stopped before its cursor opened), `Err` with
    /// the startup error when the worker failed.
    pub async fn await_initialization(&self, timeout: Duration) -> Result<bool> {
        let mut rx = self.state.subscribe();
        let outcome = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| !matches!(state, WorkerState::Created | WorkerState::Initializing)),
        )
        .await
        .map(|waited| waited.map(|state| *state));

        match outcome {
            Err(_) => {
                warn!(
                    worker_id = %self.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Worker did not initialize in time"
                );
                Ok(false)
            }
            Ok(Err(_)) => Err(FanoutError::Internal(format!(
                "State channel of worker {} closed",
                self.id
            ))),
            Ok(Ok(WorkerState::Failed)) => {
                let cause = self.failure.lock().ok().and_then(|mut slot| slot.take());
                Err(cause.unwrap_or_else(|| {
                    FanoutError::lifecycle(format!("Worker {} failed during startup", self.id))
                }))
            }
            Ok(Ok(_)) => Ok(self.initialized.load(Ordering::SeqCst)),
        }
    }

    /// Request a stop and wait for the loop to finish its iteration
    ///
    /// Returns false when the worker did not stop within `timeout`; the
    /// request stays in place and the task exits at its next iteration.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let mut requested = false;
        self.state.send_if_modified(|state| match state {
            WorkerState::Created => {
                *state = WorkerState::Stopped;
                true
            }
            WorkerState::Initializing | WorkerState::Streaming => {
                *state = WorkerState::Stopping;
                requested = true;
                true
            }
            _ => false,
        });
        self.cancel.cancel();

        if self.state().is_terminal() {
            return true;
        }
        if requested {
            info!(worker_id = %self.id, "Stopping worker");
        }

        let mut rx = self.state.subscribe();
        let outcome = tokio::time::timeout(timeout, rx.wait_for(|state| state.is_terminal()))
            .await
            .map(|_| ());
        match outcome {
            Ok(()) => {
                info!(worker_id = %self.id, "Worker stopped");
                true
            }
            Err(_) => {
                warn!(
                    worker_id = %self.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Worker did not stop in time"
                );
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    /// Register a listener; registering it again is a no-op
    pub fn register(&self, listener: Arc<dyn ChangeListener>) {
        let name = listener.name().to_string();
        if self.listeners.register(listener) {
            debug!(worker_id = %self.id, listener = %name, "Registered listener");
            self.metrics.set_listeners(self.listeners.len());
        } else {
            debug!(worker_id = %self.id, listener = %name, "Listener already registered");
        }
    }

    /// Deregister a listener, warning when it was not registered
    pub fn deregister(&self, listener: &Arc<dyn ChangeListener>) {
        if self.listeners.deregister(listener) {
            debug!(worker_id = %self.id, listener = %listener.name(), "Deregistered listener");
            self.metrics.set_listeners(self.listeners.len());
        } else {
            warn!(
                worker_id = %self.id,
                listener = %listener.name(),
                "Listener to deregister was not registered"
            );
        }
    }

    pub fn has_registered_listener(&self, listener: &Arc<dyn ChangeListener>) -> bool {
        self.listeners.contains(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Drop for ChangeStreamWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Worker Task
// ============================================================================

/// Everything the spawned loop owns
struct WorkerTask {
    collection: String,
    partition: u32,
    feed: Arc<dyn ChangeFeed>,
    store: Arc<dyn ConfigStore>,
    options: WatchOptions,
    backoff: ErrorBackoff,
    listeners: Arc<ListenerSet>,
    metrics: FanoutMetrics,
    state: Arc<watch::Sender<WorkerState>>,
    initialized: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<FanoutError>>>,
    cancel: CancellationToken,
}

/// Position bookkeeping of the running loop
struct Checkpoint {
    id: Uuid,
    persisted: Option<ResumeToken>,
}

impl WorkerTask {
    async fn run(self) {
        let initialized = AssertUnwindSafe(self.initialize())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(FanoutError::Internal(format!(
                    "worker initialization panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });
        let (mut checkpoint, mut cursor) = match initialized {
            Ok(ready) => ready,
            Err(e) => {
                error!(error = %e, "Worker failed to initialize");
                self.metrics.record_error(e.kind());
                if let Ok(mut slot) = self.failure.lock() {
                    *slot = Some(e);
                }
                self.state.send_replace(WorkerState::Failed);
                return;
            }
        };

        if cursor.is_some() {
            self.initialized.store(true, Ordering::SeqCst);
            self.state.send_if_modified(|state| {
                if *state == WorkerState::Initializing {
                    *state = WorkerState::Streaming;
                    true
                } else {
                    false
                }
            });
            info!(resume_token = ?checkpoint.persisted, "Worker initialized, streaming changes");
        }

        let mut failures: u32 = 0;
        while !self.cancel.is_cancelled() {
            let caught = AssertUnwindSafe(self.iterate(&mut checkpoint, &mut cursor))
                .catch_unwind()
                .await;
            let outcome = match caught {
                Ok(result) => result,
                Err(panic) => {
                    // the cursor may be half-advanced, reopen from the persisted position
                    cursor = None;
                    Err(FanoutError::Internal(format!(
                        "change stream iteration panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                }
            };
            match outcome {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    self.metrics.record_error(e.kind());
                    error!(
                        error = %e,
                        recoverable = e.is_recoverable(),
                        consecutive_failures = failures,
                        "Error in change stream iteration"
                    );

                    let delay = self.backoff.delay(failures);
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.state.send_replace(WorkerState::Stopped);
        info!(resume_token = ?checkpoint.persisted, "Worker loop finished");
    }

    /// Load the checkpoint and open the first cursor
    async fn initialize(&self) -> Result<(Checkpoint, Option<Box<dyn ChangeCursor>>)> {
        let stored = self
            .store
            .get_or_init_checkpoint(&self.collection, self.partition)
            .await
            .with_context(
                ErrorContext::new("worker", "get_or_init_checkpoint")
                    .with_collection(&self.collection)
                    .with_partition(self.partition),
            )?;
        debug!(checkpoint_id = %stored.id, resume_token = ?stored.resume_token, "Loaded checkpoint");

        let checkpoint = Checkpoint {
            id: stored.id,
            persisted: stored.resume_token,
        };
        if self.cancel.is_cancelled() {
            return Ok((checkpoint, None));
        }

        let cursor = self.open_cursor(checkpoint.persisted.clone()).await?;
        Ok((checkpoint, Some(cursor)))
    }

    /// Open a cursor, falling back to a fresh subscription when the feed
    /// no longer knows the resume token
    async fn open_cursor(&self, resume_after: Option<ResumeToken>) -> Result<Box<dyn ChangeCursor>> {
        let options = self.options.clone().resume_after(resume_after);
        match self.feed.open_cursor(&options).await {
            Err(FanoutError::ResumeTokenRejected { token, message }) => {
                warn!(
                    resume_token = %token,
                    reason = %message,
                    "Resume token rejected by the feed, starting a fresh subscription"
                );
                self.metrics.record_error("resume_token_rejected");
                self.feed.open_cursor(&options.resume_after(None)).await
            }
            other => other,
        }
    }

    /// One pass of the tail loop: poll, dispatch, checkpoint
    async fn iterate(
        &self,
        checkpoint: &mut Checkpoint,
        cursor: &mut Option<Box<dyn ChangeCursor>>,
    ) -> Result<()> {
        if cursor.is_none() {
            let reopened = self.open_cursor(checkpoint.persisted.clone()).await?;
            self.metrics.record_cursor_reopen();
            info!(resume_token = ?checkpoint.persisted, "Reopened change cursor");
            *cursor = Some(reopened);
        }
        let Some(active) = cursor.as_mut() else {
            return Ok(());
        };

        let polled = {
            let _timer = self.metrics.time_poll();
            active.try_next().await
        };
        let event = match polled {
            Ok(event) => event,
            Err(e) => {
                // reopened from the last persisted token on the next iteration
                *cursor = None;
                return Err(e);
            }
        };

        match event {
            Some(event) => self.dispatch(&event).await,
            None => trace!("No change in this poll"),
        }

        let current = active.resume_token();
        if let Some(token) = current {
            if checkpoint.persisted.as_ref() != Some(&token) {
                self.store.update_resume_token(checkpoint.id, &token).await?;
                self.metrics.record_checkpoint();
                trace!(resume_token = %token, "Persisted checkpoint");
                checkpoint.persisted = Some(token);
            }
        }
        Ok(())
    }

    /// Deliver one event to every listener registered right now
    async fn dispatch(&self, event: &ChangeEvent) {
        let listeners = self.listeners.snapshot();
        info!(
            operation = %event.operation_type,
            document_key = %event.document_key,
            listeners = listeners.len(),
            "Received change"
        );
        debug!(
            full_document = ?event.full_document,
            update_description = ?event.update_description,
            "Change payload"
        );

        let delivery = async {
            for listener in listeners.iter() {
                listener.handle(event).await;
            }
        };
        if AssertUnwindSafe(delivery).catch_unwind().await.is_err() {
            error!(
                operation = %event.operation_type,
                document_key = %event.document_key,
                "Listener panicked, remaining listeners skipped for this change"
            );
            self.metrics.record_listener_panic();
        }
        self.metrics.record_dispatch(event.operation_type.as_str());
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
