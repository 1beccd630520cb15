//! A pool of isolated embedding workers.
//!
//! The pool owns `pool_size` worker slots. Each slot tracks its worker with a
//! [`WorkerStateMachine`] and serializes calls through a channel mutex, so a
//! worker never has more than one request in flight.
//!
//! - `embed` picks the next `Ready` worker round-robin and waits up to
//!   `ready_wait_timeout` for one if none is ready, then fails with
//!   [`EmbedError::PoolUnavailable`].
//! - After each call the worker's counters are checked. Reaching
//!   `max_files_before_restart` or `max_worker_memory_mb` moves it to
//!   `Restarting` straight away (so nothing new is routed to it) and a background
//!   task replaces it once the in-flight call has drained.
//! - Timeouts, crashes and protocol errors move the worker to `Error` and
//!   schedule the same replacement.
//! - A periodic health check pings idle workers and replaces unresponsive ones.
//! - Pool-level failures go through the configured [`docsearch_retry`] profile
//!   before they reach the caller.
//!
//! Restarts of one slot are serialized by a per-slot mutex.
use crate::config::{EmbedConfig, PoolConfig};
use crate::error::{EmbedError, Result};
use crate::launcher::{LaunchedWorker, WorkerIo, WorkerLauncher, WorkerProcess};
use crate::model::EmbedRole;
use crate::protocol::{WorkerRequest, WorkerResponse};
use crate::state_machine::{WorkerState, WorkerStateMachine};
use crate::worker::process_memory;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docsearch_retry::RetryExecutor;
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info, warn};

/// Anything that turns texts into vectors. The indexer and search service
/// depend on this rather than on the pool directly.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String], role: EmbedRole) -> Result<Vec<Vec<f32>>>;

    /// Release workers. Later `embed` calls fail.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Snapshot of one worker, as reported by [`EmbedderPool::get_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    pub id: usize,
    pub state: WorkerState,
    pub files_processed_since_spawn: u64,
    /// Resident memory in bytes, when the worker runs in its own process.
    pub memory_usage_estimate: u64,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub pid: Option<u32>,
    pub time_in_ready: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub workers: Vec<WorkerRecord>,
    pub ready_workers: usize,
    pub total_restarts: u32,
    pub embeds_served: u64,
    pub model: Option<String>,
    pub dimension: Option<usize>,
    pub launcher: String,
}

struct SlotStatus {
    machine: WorkerStateMachine,
    files_processed_since_spawn: u64,
    memory_usage_estimate: u64,
    last_health_check_at: Option<DateTime<Utc>>,
    restart_count: u32,
    pid: Option<u32>,
}

struct WorkerSlot {
    id: usize,
    /// Held for the duration of a request/response exchange.
    io: tokio::sync::Mutex<Option<WorkerIo>>,
    process: Mutex<Option<WorkerProcess>>,
    status: Mutex<SlotStatus>,
    restart_lock: tokio::sync::Mutex<()>,
    /// Set from scheduling until the restart task finishes.
    restart_pending: AtomicBool,
}

impl WorkerSlot {
    fn new(id: usize) -> Self {
        Self {
            id,
            io: tokio::sync::Mutex::new(None),
            process: Mutex::new(None),
            status: Mutex::new(SlotStatus {
                machine: WorkerStateMachine::new(id),
                files_processed_since_spawn: 0,
                memory_usage_estimate: 0,
                last_health_check_at: None,
                restart_count: 0,
                pid: None,
            }),
            restart_lock: tokio::sync::Mutex::new(()),
            restart_pending: AtomicBool::new(false),
        }
    }

    fn status(&self) -> MutexGuard<'_, SlotStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn process(&self) -> MutexGuard<'_, Option<WorkerProcess>> {
        self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> WorkerState {
        self.status().machine.state()
    }

    fn transition(&self, to: WorkerState) -> Result<()> {
        self.status().machine.transition(to)
    }

    fn ensure_ready(&self) -> Result<()> {
        self.status().machine.ensure_ready()
    }

    /// Move a `Ready` worker to `to`. Returns false if it was not ready.
    fn leave_ready(&self, to: WorkerState) -> bool {
        let mut status = self.status();
        status.machine.state() == WorkerState::Ready && status.machine.transition(to).is_ok()
    }

    fn kill_process(&self) {
        if let Some(mut process) = self.process().take() {
            process.kill();
        }
    }

    fn record(&self) -> WorkerRecord {
        let status = self.status();
        WorkerRecord {
            id: self.id,
            state: status.machine.state(),
            files_processed_since_spawn: status.files_processed_since_spawn,
            memory_usage_estimate: status.memory_usage_estimate,
            last_health_check_at: status.last_health_check_at,
            restart_count: status.restart_count,
            pid: status.pid,
            time_in_ready: status.machine.time_in(WorkerState::Ready),
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    embed_config: EmbedConfig,
    launcher: Arc<dyn WorkerLauncher>,
    slots: RwLock<Vec<Arc<WorkerSlot>>>,
    cursor: AtomicUsize,
    correlation: AtomicU64,
    embeds_served: AtomicU64,
    ready: Notify,
    disposed: AtomicBool,
    model_info: Mutex<Option<(String, usize)>>,
}

pub struct EmbedderPool {
    inner: Arc<PoolInner>,
    retry: RetryExecutor<EmbedError>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl EmbedderPool {
    pub fn new(
        embed_config: EmbedConfig,
        config: PoolConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        let retry = config.retry.executor("embedder pool");
        Self {
            inner: Arc::new(PoolInner {
                config,
                embed_config,
                launcher,
                slots: RwLock::new(Vec::new()),
                cursor: AtomicUsize::new(0),
                correlation: AtomicU64::new(1),
                embeds_served: AtomicU64::new(0),
                ready: Notify::new(),
                disposed: AtomicBool::new(false),
                model_info: Mutex::new(None),
            }),
            retry,
            monitor: Mutex::new(None),
        }
    }

    /// Spawn `pool_size` workers and start health monitoring.
    ///
    /// Succeeds when at least one worker reaches `Ready`. Workers that fail to
    /// start stay in `Error` and are retried by the health check or the next
    /// `embed` call.
    ///
    /// # Errors
    ///
    /// - [`EmbedError::InvalidConfig`] for a zero pool size or a second call
    /// - the first worker's start-up error when no worker became ready
    pub async fn initialize(&self, pool_size: usize) -> Result<()> {
        if pool_size == 0 {
            return Err(EmbedError::invalid_config("pool size must be at least 1"));
        }
        self.inner.embed_config.validate()?;
        let slots: Vec<Arc<WorkerSlot>> = {
            let mut guard = self.inner.slots.write().unwrap_or_else(PoisonError::into_inner);
            if !guard.is_empty() {
                return Err(EmbedError::invalid_config("pool already initialized"));
            }
            *guard = (0..pool_size).map(|id| Arc::new(WorkerSlot::new(id))).collect();
            guard.clone()
        };

        info!(
            "Starting {} embedding workers ({}, model {})",
            pool_size,
            self.inner.launcher.describe(),
            self.inner.embed_config.model_name()
        );
        let results = join_all(slots.iter().map(|slot| self.inner.spawn_worker(slot))).await;
        let ready = results.iter().filter(|r| r.is_ok()).count();
        info!("Embedder pool initialized: {}/{} workers ready", ready, pool_size);

        if let Some(period) = self.inner.config.health_check_interval() {
            let handle = tokio::spawn(health_monitor(Arc::downgrade(&self.inner), period));
            *self.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }

        match results.into_iter().find_map(|r| r.err()) {
            Some(first_error) if ready == 0 => Err(first_error),
            _ => Ok(()),
        }
    }

    /// Embed `texts` on one worker. Vectors come back in input order.
    ///
    /// # Errors
    ///
    /// - [`EmbedError::PoolUnavailable`] when no worker became ready in time
    /// - [`EmbedError::PoolDisposed`] after [`EmbedderPool::dispose`]
    /// - [`EmbedError::Model`] when the model rejected the batch
    /// - a process fault when retries are exhausted
    pub async fn embed(&self, texts: &[String], role: EmbedRole) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let inner = &self.inner;
        self.retry
            .execute(move |_| inner.embed_once(texts, role))
            .await
            .map_err(|e| {
                let attempts = e.attempts();
                e.into_source().unwrap_or(EmbedError::PoolUnavailable {
                    waited: self.inner.config.ready_wait_timeout() * attempts.max(1),
                })
            })
    }

    pub fn get_stats(&self) -> PoolStats {
        let workers: Vec<WorkerRecord> = self.inner.slots().iter().map(|s| s.record()).collect();
        let model_info = self.inner.model_info().clone();
        PoolStats {
            ready_workers: workers
                .iter()
                .filter(|w| w.state == WorkerState::Ready)
                .count(),
            total_restarts: workers.iter().map(|w| w.restart_count).sum(),
            embeds_served: self.inner.embeds_served.load(Ordering::Relaxed),
            model: model_info.as_ref().map(|(name, _)| name.clone()),
            dimension: model_info.map(|(_, dim)| dim),
            launcher: self.inner.launcher.describe(),
            workers,
        }
    }

    /// Vector dimension reported by the workers, once one has started.
    pub fn dimension(&self) -> Option<usize> {
        self.inner.model_info().as_ref().map(|(_, dim)| *dim)
    }

    /// Restart one worker, or every worker when `index` is `None`.
    pub async fn restart(&self, index: Option<usize>) -> Result<()> {
        let slots = self.inner.slots();
        let selected: Vec<Arc<WorkerSlot>> = match index {
            Some(i) => vec![
                slots
                    .get(i)
                    .cloned()
                    .ok_or(EmbedError::UnknownWorker { index: i })?,
            ],
            None => slots,
        };
        for slot in selected {
            self.inner.restart_slot(&slot, "manual restart").await?;
        }
        Ok(())
    }

    /// Shut every worker down: drain in-flight calls, ask each worker to exit,
    /// and force-terminate those that do not exit within the drain timeout.
    pub async fn dispose(&self) -> Result<()> {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.monitor.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        // Wake callers waiting for a ready worker so they observe the disposal.
        self.inner.ready.notify_waiters();

        let slots = self.inner.slots();
        join_all(slots.iter().map(|slot| self.inner.shutdown_slot(slot))).await;
        info!("Embedder pool disposed");
        Ok(())
    }
}

impl Drop for EmbedderPool {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Embedder for EmbedderPool {
    async fn embed(&self, texts: &[String], role: EmbedRole) -> Result<Vec<Vec<f32>>> {
        EmbedderPool::embed(self, texts, role).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.dispose().await
    }
}

impl PoolInner {
    fn slots(&self) -> Vec<Arc<WorkerSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn model_info(&self) -> MutexGuard<'_, Option<(String, usize)>> {
        self.model_info.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn next_ready_slot(&self) -> Option<Arc<WorkerSlot>> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let count = slots.len();
        if count == 0 {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        (0..count)
            .map(|offset| &slots[(start + offset) % count])
            .find(|slot| slot.state() == WorkerState::Ready)
            .cloned()
    }

    /// `Spawning` through `Ready`: launch the worker and wait for its `ready`.
    async fn spawn_worker(&self, slot: &WorkerSlot) -> Result<()> {
        slot.transition(WorkerState::Spawning)?;
        let result = self.launch_and_init(slot).await;
        let result = result.and_then(|()| slot.transition(WorkerState::Ready));
        match result {
            Ok(()) => {
                self.ready.notify_waiters();
                Ok(())
            }
            Err(e) => {
                warn!("Embedding worker {} failed to start: {}", slot.id, e);
                slot.kill_process();
                if let Err(transition_error) = slot.transition(WorkerState::Error) {
                    debug!("Worker {} not moved to error: {}", slot.id, transition_error);
                }
                Err(e)
            }
        }
    }

    async fn launch_and_init(&self, slot: &WorkerSlot) -> Result<()> {
        let LaunchedWorker { mut io, process } = self.launcher.launch(slot.id).await?;
        let pid = process.pid();
        *slot.process() = Some(process);

        let init = async {
            io.send(&WorkerRequest::Init {
                config: self.embed_config.clone(),
            })
            .await?;
            io.recv().await
        };
        let spawn_timeout = self.config.spawn_timeout();
        let response = timeout(spawn_timeout, init)
            .await
            .map_err(|_| EmbedError::timeout(format!("starting worker {}", slot.id), spawn_timeout))??;

        match response {
            WorkerResponse::Ready { model, dimension } => {
                debug!("Worker {} ready with {} ({} dims)", slot.id, model, dimension);
                *self.model_info() = Some((model, dimension));
                {
                    let mut status = slot.status();
                    status.pid = pid;
                    status.files_processed_since_spawn = 0;
                    status.memory_usage_estimate = pid.and_then(process_memory).unwrap_or(0);
                }
                *slot.io.lock().await = Some(io);
                Ok(())
            }
            WorkerResponse::Error { message, .. } => Err(EmbedError::ModelInitialization { message }),
            other => Err(EmbedError::protocol(format!(
                "expected ready from worker {}, got {}",
                slot.id,
                other.kind()
            ))),
        }
    }

    /// One attempt: wait for a ready worker, then run the exchange on it.
    async fn embed_once(self: &Arc<Self>, texts: &[String], role: EmbedRole) -> Result<Vec<Vec<f32>>> {
        let waited = self.config.ready_wait_timeout();
        let deadline = Instant::now() + waited;
        loop {
            if self.is_disposed() {
                return Err(EmbedError::PoolDisposed);
            }
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(slot) = self.next_ready_slot() {
                let mut io = slot.io.lock().await;
                // The worker may have left Ready while we waited for the channel.
                if let Err(not_ready) = slot.ensure_ready() {
                    debug!("Skipping worker: {}", not_ready);
                    drop(io);
                    self.revive_failed_workers();
                    continue;
                }
                let Some(channel) = io.as_mut() else {
                    continue;
                };
                return self.call_worker(&slot, channel, texts, role).await;
            }

            self.revive_failed_workers();
            if timeout(deadline.saturating_duration_since(Instant::now()), notified)
                .await
                .is_err()
            {
                warn!("No embedding worker ready after {:?}", waited);
                return Err(EmbedError::PoolUnavailable { waited });
            }
        }
    }

    async fn call_worker(
        self: &Arc<Self>,
        slot: &Arc<WorkerSlot>,
        io: &mut WorkerIo,
        texts: &[String],
        role: EmbedRole,
    ) -> Result<Vec<Vec<f32>>> {
        let correlation_id = self.correlation.fetch_add(1, Ordering::Relaxed);
        let request = WorkerRequest::Embed {
            correlation_id,
            texts: texts.to_vec(),
            role,
        };
        let exchange = async {
            io.send(&request).await?;
            loop {
                match io.recv().await? {
                    WorkerResponse::Vectors {
                        correlation_id: id,
                        vectors,
                    } if id == correlation_id => return Ok(vectors),
                    WorkerResponse::Error {
                        correlation_id: Some(id),
                        message,
                    } if id == correlation_id => return Err(EmbedError::Model { message }),
                    WorkerResponse::Error {
                        correlation_id: None,
                        message,
                    } => return Err(EmbedError::protocol(message)),
                    stale => debug!("Worker {} sent stale {} response", slot.id, stale.kind()),
                }
            }
        };

        let embed_timeout = self.config.embed_timeout();
        let outcome = match timeout(embed_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(EmbedError::timeout(
                format!("embedding on worker {}", slot.id),
                embed_timeout,
            )),
        };
        let outcome = outcome.and_then(|vectors| {
            if vectors.len() == texts.len() {
                Ok(vectors)
            } else {
                Err(EmbedError::protocol(format!(
                    "worker {} returned {} vectors for {} texts",
                    slot.id,
                    vectors.len(),
                    texts.len()
                )))
            }
        });

        match &outcome {
            Ok(_) => self.after_success(slot),
            Err(e) if e.is_process_fault() => {
                error!("Embedding worker {} failed: {}", slot.id, e);
                if slot.leave_ready(WorkerState::Error) {
                    self.schedule_restart(slot, "worker fault");
                }
            }
            Err(e) => debug!("Worker {} rejected batch: {}", slot.id, e),
        }
        outcome
    }

    fn after_success(self: &Arc<Self>, slot: &Arc<WorkerSlot>) {
        self.embeds_served.fetch_add(1, Ordering::Relaxed);
        let pid = slot.status().pid;
        let memory = pid.and_then(process_memory);

        let (processed, memory_estimate) = {
            let mut status = slot.status();
            status.files_processed_since_spawn += 1;
            if let Some(bytes) = memory {
                status.memory_usage_estimate = bytes;
            }
            (status.files_processed_since_spawn, status.memory_usage_estimate)
        };

        let reason = if processed >= self.config.max_files_before_restart {
            Some(format!("served {processed} requests"))
        } else if memory_estimate > self.config.max_worker_memory_bytes() {
            Some(format!("memory at {} MB", memory_estimate / (1024 * 1024)))
        } else {
            None
        };
        if let Some(reason) = reason
            && slot.leave_ready(WorkerState::Restarting)
        {
            self.schedule_restart(slot, &reason);
        }
    }

    /// Spawn a restart of `slot` unless one is already scheduled or running.
    fn schedule_restart(self: &Arc<Self>, slot: &Arc<WorkerSlot>, reason: &str) {
        if slot.restart_pending.swap(true, Ordering::SeqCst) {
            debug!("Restart of worker {} already scheduled", slot.id);
            return;
        }
        let inner = Arc::clone(self);
        let slot = Arc::clone(slot);
        let reason = reason.to_string();
        tokio::spawn(async move {
            if let Err(e) = inner.restart_slot(&slot, &reason).await {
                warn!("Restart of embedding worker {} failed: {}", slot.id, e);
            }
            slot.restart_pending.store(false, Ordering::SeqCst);
        });
    }

    /// Restart workers sitting in `Error`.
    fn revive_failed_workers(self: &Arc<Self>) {
        for slot in self.slots() {
            if slot.state() == WorkerState::Error {
                self.schedule_restart(&slot, "recovering from error");
            }
        }
    }

    /// Replace the worker in `slot`. Serialized per slot.
    async fn restart_slot(&self, slot: &WorkerSlot, reason: &str) -> Result<()> {
        let _serial = slot.restart_lock.lock().await;
        if self.is_disposed() {
            return Ok(());
        }

        let graceful = match slot.state() {
            WorkerState::Ready => {
                slot.transition(WorkerState::Restarting)?;
                true
            }
            WorkerState::Error => {
                slot.transition(WorkerState::Restarting)?;
                false
            }
            // Marked by `after_success` and waiting for us.
            WorkerState::Restarting => true,
            other => {
                debug!("Skipping restart of worker {} in state {}", slot.id, other);
                return Ok(());
            }
        };
        info!("Restarting embedding worker {} ({})", slot.id, reason);

        let drain = self.config.shutdown_drain_timeout();
        let old_io = match timeout(drain, slot.io.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                warn!("Worker {} did not finish its request within {:?}", slot.id, drain);
                None
            }
        };
        self.retire(slot, old_io, graceful).await;

        {
            let mut status = slot.status();
            status.restart_count += 1;
            status.files_processed_since_spawn = 0;
            status.memory_usage_estimate = 0;
            status.pid = None;
        }
        self.spawn_worker(slot).await
    }

    /// Stop the worker behind `slot`: ask it to exit if `graceful`, then kill it
    /// if it is still running after the drain timeout.
    async fn retire(&self, slot: &WorkerSlot, io: Option<WorkerIo>, graceful: bool) {
        let drain = self.config.shutdown_drain_timeout();
        let mut deadline = Instant::now();
        if let (true, Some(mut io)) = (graceful, io) {
            let goodbye = async {
                io.send(&WorkerRequest::Shutdown).await?;
                io.recv().await
            };
            match timeout(drain, goodbye).await {
                Ok(Ok(WorkerResponse::ShuttingDown)) => deadline += drain,
                Ok(Ok(other)) => debug!("Worker {} answered shutdown with {}", slot.id, other.kind()),
                Ok(Err(e)) => debug!("Worker {} shutdown exchange failed: {}", slot.id, e),
                Err(_) => warn!("Worker {} ignored shutdown request", slot.id),
            }
        }

        loop {
            let exited = slot.process().as_mut().is_none_or(|p| p.has_exited());
            if exited || Instant::now() >= deadline {
                if !exited {
                    warn!("Force-terminating embedding worker {}", slot.id);
                }
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        slot.kill_process();
    }

    async fn shutdown_slot(&self, slot: &WorkerSlot) {
        if let Err(e) = slot.transition(WorkerState::ShuttingDown) {
            debug!("Worker {} not shut down: {}", slot.id, e);
            return;
        }
        let drain = self.config.shutdown_drain_timeout();
        let io = match timeout(drain, slot.io.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                warn!("Worker {} still busy after {:?}; terminating", slot.id, drain);
                None
            }
        };
        let graceful = io.is_some();
        self.retire(slot, io, graceful).await;
        if let Err(e) = slot.transition(WorkerState::Shutdown) {
            debug!("Worker {}: {}", slot.id, e);
        }
    }

    async fn health_check_all(self: &Arc<Self>) {
        for slot in self.slots() {
            match slot.state() {
                WorkerState::Ready => self.health_check(&slot).await,
                WorkerState::Error => {
                    self.schedule_restart(&slot, "health check found worker in error")
                }
                _ => {}
            }
        }
    }

    async fn health_check(self: &Arc<Self>, slot: &Arc<WorkerSlot>) {
        // A busy worker is covered by its own request timeout.
        let Ok(mut guard) = slot.io.try_lock() else {
            return;
        };
        if slot.ensure_ready().is_err() {
            return;
        }
        let Some(io) = guard.as_mut() else {
            return;
        };

        let correlation_id = self.correlation.fetch_add(1, Ordering::Relaxed);
        let probe = async {
            io.send(&WorkerRequest::Ping { correlation_id }).await?;
            loop {
                if let WorkerResponse::Pong {
                    correlation_id: id,
                    memory_bytes,
                } = io.recv().await?
                    && id == correlation_id
                {
                    return Ok(memory_bytes);
                }
            }
        };
        let check_timeout = self.config.health_check_timeout();
        let result = match timeout(check_timeout, probe).await {
            Ok(result) => result,
            Err(_) => Err(EmbedError::timeout(
                format!("health check of worker {}", slot.id),
                check_timeout,
            )),
        };
        drop(guard);

        match result {
            Ok(reported) => {
                let over_limit = {
                    let mut status = slot.status();
                    status.last_health_check_at = Some(Utc::now());
                    if let Some(bytes) = reported.or_else(|| status.pid.and_then(process_memory)) {
                        status.memory_usage_estimate = bytes;
                    }
                    status.memory_usage_estimate > self.config.max_worker_memory_bytes()
                };
                if over_limit && slot.leave_ready(WorkerState::Restarting) {
                    self.schedule_restart(slot, "memory limit exceeded");
                }
            }
            Err(e) => {
                warn!("Health check failed for embedding worker {}: {}", slot.id, e);
                slot.status().last_health_check_at = Some(Utc::now());
                if slot.leave_ready(WorkerState::Error) {
                    self.schedule_restart(slot, "failed health check");
                }
            }
        }
    }
}

async fn health_monitor(pool: Weak<PoolInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = pool.upgrade() else {
            break;
        };
        if inner.is_disposed() {
            break;
        }
        inner.health_check_all().await;
    }
    debug!("Health monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::InProcessLauncher;
    use crate::model::{EmbeddingModel, HashingModel};
    use crate::worker::WorkerServer;
    use docsearch_retry::RetryProfile;
    use tracing_test::traced_test;

    fn fast_config() -> PoolConfig {
        PoolConfig::default()
            .with_embed_timeout(Duration::from_secs(5))
            .with_ready_wait_timeout(Duration::from_secs(5))
            .with_shutdown_drain_timeout(Duration::from_millis(500))
            .with_health_check_interval(None)
            .with_retry(RetryProfile::no_retry())
    }

    fn in_process() -> Arc<dyn WorkerLauncher> {
        Arc::new(InProcessLauncher::default())
    }

    async fn wait_for(pool: &EmbedderPool, mut condition: impl FnMut(&PoolStats) -> bool) -> PoolStats {
        for _ in 0..200 {
            let stats = pool.get_stats();
            if condition(&stats) {
                return stats;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached: {:?}", pool.get_stats());
    }

    /// Sleeps on every embed call, longer than the test's embed timeout.
    struct StallingModel;

    impl EmbeddingModel for StallingModel {
        fn embed(&mut self, texts: &[String], _role: EmbedRole) -> Result<Vec<Vec<f32>>> {
            std::thread::sleep(Duration::from_millis(400));
            Ok(texts.iter().map(|_| vec![1.0]).collect())
        }

        fn dimension(&self) -> usize {
            1
        }

        fn name(&self) -> &str {
            "stalling"
        }
    }

    #[tokio::test]
    async fn test_embed_returns_vectors_in_order() {
        let pool = EmbedderPool::new(EmbedConfig::hashing(32), fast_config(), in_process());
        pool.initialize(2).await.unwrap();

        let texts = vec!["first text".to_string(), "second text".to_string()];
        let vectors = pool.embed(&texts, EmbedRole::Passage).await.unwrap();

        let model = HashingModel::new(32);
        assert_eq!(vectors.len(), 2);
        for (vector, text) in vectors.iter().zip(["first text", "second text"]) {
            let expected = model.embed_one(text);
            assert!(vector.iter().zip(&expected).all(|(a, b)| (a - b).abs() < 1e-5));
        }
        assert_eq!(pool.dimension(), Some(32));
        pool.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_round_robin_spreads_calls() {
        let pool = EmbedderPool::new(EmbedConfig::hashing(8), fast_config(), in_process());
        pool.initialize(3).await.unwrap();

        for i in 0..6 {
            pool.embed(&[format!("text {i}")], EmbedRole::Passage).await.unwrap();
        }

        let stats = pool.get_stats();
        assert_eq!(stats.embeds_served, 6);
        for worker in &stats.workers {
            assert_eq!(worker.files_processed_since_spawn, 2, "{worker:?}");
        }
        pool.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_recycled_after_request_limit() {
        let config = fast_config().with_max_files_before_restart(1);
        let pool = EmbedderPool::new(EmbedConfig::hashing(8), config, in_process());
        pool.initialize(2).await.unwrap();

        for i in 0..4 {
            pool.embed(&[format!("doc {i}")], EmbedRole::Passage).await.unwrap();
        }

        let stats = wait_for(&pool, |s| {
            s.workers[0].restart_count >= 1 && s.ready_workers == 2
        })
        .await;
        assert!(stats.workers[0].restart_count >= 1);
        assert_eq!(stats.workers[0].state, WorkerState::Ready);
        pool.dispose().await.unwrap();
    }

    #[traced_test]
    #[tokio::test]
    async fn test_unavailable_when_no_worker_starts() {
        let server = WorkerServer::new().with_factory(Arc::new(|_| {
            Err(EmbedError::ModelInitialization {
                message: "weights missing".to_string(),
            })
        }));
        let config = fast_config().with_ready_wait_timeout(Duration::from_millis(200));
        let pool = EmbedderPool::new(
            EmbedConfig::hashing(8),
            config,
            Arc::new(InProcessLauncher::new(server)),
        );

        let init = pool.initialize(2).await;
        assert!(matches!(init, Err(EmbedError::ModelInitialization { .. })));

        let started = std::time::Instant::now();
        let result = pool.embed(&["hello".to_string()], EmbedRole::Query).await;
        assert!(matches!(result, Err(EmbedError::PoolUnavailable { .. })), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(logs_contain("No embedding worker ready"));
        pool.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_moves_worker_to_error_and_restarts_it() {
        let server = WorkerServer::new().with_factory(Arc::new(|_| {
            Ok(Box::new(StallingModel) as Box<dyn EmbeddingModel>)
        }));
        let config = fast_config().with_embed_timeout(Duration::from_millis(100));
        let pool = EmbedderPool::new(EmbedConfig::hashing(1), config, Arc::new(InProcessLauncher::new(server)));
        pool.initialize(1).await.unwrap();

        let result = pool.embed(&["slow".to_string()], EmbedRole::Passage).await;
        assert!(matches!(result, Err(EmbedError::Timeout { .. })), "{result:?}");

        let stats = wait_for(&pool, |s| s.workers[0].restart_count >= 1).await;
        assert!(stats.workers[0].restart_count >= 1);
        pool.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_restart_and_unknown_index() {
        let pool = EmbedderPool::new(EmbedConfig::hashing(8), fast_config(), in_process());
        pool.initialize(2).await.unwrap();

        pool.restart(Some(1)).await.unwrap();
        let stats = pool.get_stats();
        assert_eq!(stats.workers[0].restart_count, 0);
        assert_eq!(stats.workers[1].restart_count, 1);
        assert_eq!(stats.workers[1].state, WorkerState::Ready);

        assert!(matches!(
            pool.restart(Some(7)).await,
            Err(EmbedError::UnknownWorker { index: 7 })
        ));
        pool.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispose_shuts_down_every_worker() {
        let pool = EmbedderPool::new(EmbedConfig::hashing(8), fast_config(), in_process());
        pool.initialize(2).await.unwrap();

        pool.dispose().await.unwrap();

        let stats = pool.get_stats();
        assert!(stats.workers.iter().all(|w| w.state == WorkerState::Shutdown));
        assert!(matches!(
            pool.embed(&["late".to_string()], EmbedRole::Query).await,
            Err(EmbedError::PoolDisposed)
        ));
        pool.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_check_records_timestamp() {
        let config = fast_config().with_health_check_interval(Some(Duration::from_millis(50)));
        let pool = EmbedderPool::new(EmbedConfig::hashing(8), config, in_process());
        pool.initialize(1).await.unwrap();

        let stats = wait_for(&pool, |s| s.workers[0].last_health_check_at.is_some()).await;
        assert_eq!(stats.workers[0].state, WorkerState::Ready);
        pool.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_input_skips_workers() {
        let pool = EmbedderPool::new(EmbedConfig::hashing(8), fast_config(), in_process());
        assert!(pool.embed(&[], EmbedRole::Passage).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_errored_worker_restarted_once() {
        let pool = EmbedderPool::new(EmbedConfig::hashing(8), fast_config(), in_process());
        pool.initialize(1).await.unwrap();

        let slot = pool.inner.slots()[0].clone();
        assert!(slot.leave_ready(WorkerState::Error));
        assert!(matches!(slot.ensure_ready(), Err(EmbedError::NotReady { worker: 0, .. })));

        // Every caller that notices the error asks for a restart.
        for _ in 0..4 {
            pool.inner.revive_failed_workers();
        }
        pool.inner.schedule_restart(&slot, "duplicate request");

        wait_for(&pool, |s| s.ready_workers == 1).await;
        sleep(Duration::from_millis(100)).await;
        let stats = pool.get_stats();
        assert_eq!(stats.workers[0].restart_count, 1);
        assert_eq!(stats.workers[0].state, WorkerState::Ready);
        pool.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_embed_revives_worker_in_error() {
        let pool = EmbedderPool::new(EmbedConfig::hashing(8), fast_config(), in_process());
        pool.initialize(1).await.unwrap();
        assert!(pool.inner.slots()[0].leave_ready(WorkerState::Error));

        let vectors = pool.embed(&["back again".to_string()], EmbedRole::Passage).await.unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(pool.get_stats().workers[0].restart_count, 1);
        pool.dispose().await.unwrap();
    }
}
