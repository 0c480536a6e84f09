//! Connection Pool Manager for multiple independently configured databases
//!
//! This module provides the ConnectionPoolManager component that handles:
//! - Lazily opening one pooled handle per database id on first use
//! - Probing handles before reuse and evicting dead ones
//! - Failing fast inside a backoff window after a failed connect
//! - Eager startup connects, background health monitoring and shutdown
//!
//! Lock discipline: the pool map and the failure map each sit behind their own
//! `RwLock` and are never held at the same time. No lock is held across a
//! driver call. Cold starts for one id are serialized by a per-id mutex, so
//! concurrent callers share a single connection attempt.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::connection::{Connector, DatabaseHandle};
use crate::environment::{DatabaseConfig, DatabaseRegistry};
use crate::error::ConnectionFailureKind;
use crate::{Result, ServerError};

/// A live handle in the pool
#[derive(Debug)]
struct PoolEntry<H> {
    handle: H,
    /// Distinguishes this handle from a later replacement under the same id
    generation: u64,
    connected_at: Instant,
}

/// Outcome of the eager startup connect
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    pub configured: usize,
    pub connected: Vec<String>,
    /// `(database_id, reason)` pairs
    pub failed: Vec<(String, String)>,
}

/// Overall readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessStatus {
    Ready,
    Degraded,
    NotReady,
}

/// Probe result for one database
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStatus {
    pub id: String,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot served by the readiness endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub status: ReadinessStatus,
    pub timestamp: DateTime<Utc>,
    pub databases: Vec<DatabaseStatus>,
    pub total: usize,
    pub healthy: usize,
}

/// Owns the `database_id -> handle` map for one connector
pub struct ConnectionPoolManager<C: Connector> {
    connector: C,
    registry: Arc<DatabaseRegistry>,
    settings: PoolConfig,
    pools: RwLock<HashMap<String, PoolEntry<C::Handle>>>,
    /// Time of the last failed connect per id
    failures: RwLock<HashMap<String, Instant>>,
    connect_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    closed: AtomicBool,
    next_generation: AtomicU64,
}

impl<C: Connector> ConnectionPoolManager<C> {
    pub fn new(connector: C, registry: Arc<DatabaseRegistry>, settings: PoolConfig) -> Self {
        info!(
            databases = registry.len(),
            backoff_ms = settings.failure_backoff_ms,
            "Creating connection pool manager"
        );

        Self {
            connector,
            registry,
            settings,
            pools: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
            connect_locks: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &DatabaseRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &PoolConfig {
        &self.settings
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Return a healthy handle for `database_id`, connecting if needed
    pub async fn get_connection(&self, database_id: &str) -> Result<C::Handle> {
        let id = database_id.to_lowercase();

        if self.closed.load(Ordering::SeqCst) {
            return Err(Self::closed_error(&id));
        }

        if let Some(handle) = self.probe_existing(&id).await {
            return Ok(handle);
        }

        self.check_backoff(&id).await?;

        let config = self
            .registry
            .get(&id)
            .cloned()
            .ok_or_else(|| ServerError::config_not_found(&id))?;

        let lock = self.connect_lock(&id).await;
        let _guard = lock.lock().await;

        // Whoever held the lock before us may have finished the job
        if let Some(handle) = self.current_handle(&id).await {
            debug!(database_id = %id, "Using handle opened by a concurrent caller");
            return Ok(handle);
        }
        self.check_backoff(&id).await?;

        if self.closed.load(Ordering::SeqCst) {
            return Err(Self::closed_error(&id));
        }

        self.connect(&config).await
    }

    /// Connect every configured database once, concurrently
    pub async fn connect_all(&self) -> StartupReport {
        let ids: Vec<String> = self.registry.ids().map(String::from).collect();
        info!(databases = ids.len(), "Connecting configured databases");

        let mut report = StartupReport {
            configured: ids.len(),
            ..StartupReport::default()
        };

        let results = join_all(ids.into_iter().map(|id| async move {
            let result = self.get_connection(&id).await;
            (id, result)
        }))
        .await;

        for (id, result) in results {
            match result {
                Ok(_) => report.connected.push(id),
                Err(e) => report.failed.push((id, e.detailed_message())),
            }
        }

        if report.connected.is_empty() {
            warn!(
                configured = report.configured,
                "No database could be connected at startup, continuing with lazy connects"
            );
        } else {
            info!(
                connected = report.connected.len(),
                failed = report.failed.len(),
                "Startup connect finished"
            );
        }

        report
    }

    /// Whether a handle for `database_id` is currently pooled
    pub async fn is_connected(&self, database_id: &str) -> bool {
        self.pools.read().await.contains_key(&database_id.to_lowercase())
    }

    /// Pooled ids in sorted order
    pub async fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pools.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// How long the handle for `database_id` has been pooled
    pub async fn connected_for(&self, database_id: &str) -> Option<Duration> {
        self.pools
            .read()
            .await
            .get(&database_id.to_lowercase())
            .map(|entry| entry.connected_at.elapsed())
    }

    /// Probe pooled handles without changing the pool
    pub async fn readiness(&self) -> ReadinessReport {
        let pooled: HashMap<String, C::Handle> = self
            .pools
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.handle.clone()))
            .collect();

        let probe_timeout = self.settings.probe_timeout();
        let ids: Vec<String> = self.registry.ids().map(String::from).collect();
        let databases = join_all(ids.into_iter().map(|id| {
            let handle = pooled.get(&id).cloned();
            async move {
                let Some(handle) = handle else {
                    return DatabaseStatus {
                        id,
                        available: false,
                        latency: None,
                        error: Some("not connected".to_string()),
                    };
                };

                let started = Instant::now();
                let error = match timeout(probe_timeout, handle.ping()).await {
                    Ok(Ok(())) => None,
                    Ok(Err(_)) => Some("probe failed".to_string()),
                    Err(_) => Some("probe timed out".to_string()),
                };

                DatabaseStatus {
                    id,
                    available: error.is_none(),
                    latency: error.is_none().then(|| format!("{:?}", started.elapsed())),
                    error,
                }
            }
        }))
        .await;

        let total = databases.len();
        let healthy = databases.iter().filter(|d| d.available).count();
        let status = if healthy == 0 {
            ReadinessStatus::NotReady
        } else if healthy < total {
            ReadinessStatus::Degraded
        } else {
            ReadinessStatus::Ready
        };

        ReadinessReport {
            status,
            timestamp: Utc::now(),
            databases,
            total,
            healthy,
        }
    }

    /// One health pass: evict dead handles, then try absent databases
    pub async fn sweep(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let pooled: Vec<(String, C::Handle, u64)> = self
            .pools
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.handle.clone(), entry.generation))
            .collect();

        let probe_timeout = self.settings.probe_timeout();
        join_all(pooled.into_iter().map(|(id, handle, generation)| async move {
            let failure = match timeout(probe_timeout, handle.ping()).await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.detailed_message(),
                Err(_) => format!("probe did not finish within {:?}", probe_timeout),
            };

            warn!(database_id = %id, "Health check failed: {}", failure);
            self.evict(&id, generation).await;
        }))
        .await;

        let connected = self.connected_ids().await;
        let absent: Vec<String> = self
            .registry
            .ids()
            .filter(|id| !connected.iter().any(|c| c == id))
            .map(String::from)
            .collect();

        join_all(absent.into_iter().map(|id| async move {
            match self.get_connection(&id).await {
                Ok(_) => info!(database_id = %id, "Database reconnected by health monitor"),
                Err(ServerError::RecentlyFailed { .. }) => {
                    debug!(database_id = %id, "Skipping reconnect inside backoff window")
                }
                Err(e) => warn!(database_id = %id, "Reconnect failed: {}", e.detailed_message()),
            }
        }))
        .await;
    }

    /// Start the background health monitor
    pub fn spawn_health_monitor(self: &Arc<Self>) -> HealthMonitor {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let period = self.settings.health_check_interval();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately
            interval.tick().await;

            info!("Starting health monitoring with {}s interval", period.as_secs());

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        // A stop request abandons the sweep in flight
                        tokio::select! {
                            _ = manager.sweep() => {}
                            _ = stop_requested(&mut stop_rx) => break,
                        }
                    }
                    _ = stop_requested(&mut stop_rx) => break,
                }
            }

            info!("Health monitoring stopped");
        });

        HealthMonitor { handle, stop: stop_tx }
    }

    /// Close every pooled handle and refuse further connections
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Connection pool manager already shut down");
            return;
        }

        info!("Shutting down connection pool manager");

        let drained: Vec<(String, PoolEntry<C::Handle>)> =
            self.pools.write().await.drain().collect();

        for (id, entry) in drained {
            info!(database_id = %id, "Closing database pool");
            entry.handle.close().await;
        }

        self.failures.write().await.clear();

        info!("Connection pool manager shutdown complete");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn closed_error(id: &str) -> ServerError {
        ServerError::connection_failed(
            id,
            ConnectionFailureKind::Closed,
            "pool manager is shut down".to_string(),
        )
    }

    async fn current_handle(&self, id: &str) -> Option<C::Handle> {
        self.pools.read().await.get(id).map(|entry| entry.handle.clone())
    }

    /// Probe the pooled handle, evicting it on failure
    async fn probe_existing(&self, id: &str) -> Option<C::Handle> {
        let (handle, generation) = {
            let pools = self.pools.read().await;
            let entry = pools.get(id)?;
            (entry.handle.clone(), entry.generation)
        };

        match timeout(self.settings.probe_timeout(), handle.ping()).await {
            Ok(Ok(())) => Some(handle),
            Ok(Err(e)) => {
                warn!(database_id = %id, "Pooled handle failed probe: {}", e.detailed_message());
                self.evict(id, generation).await;
                None
            }
            Err(_) => {
                warn!(
                    database_id = %id,
                    timeout_ms = self.settings.probe_timeout_ms,
                    "Pooled handle probe timed out"
                );
                self.evict(id, generation).await;
                None
            }
        }
    }

    /// Remove and close the entry for `id` if it is still `generation`
    async fn evict(&self, id: &str, generation: u64) -> bool {
        let removed = {
            let mut pools = self.pools.write().await;
            match pools.get(id) {
                Some(entry) if entry.generation == generation => pools.remove(id),
                _ => None,
            }
        };

        match removed {
            Some(entry) => {
                entry.handle.close().await;
                info!(database_id = %id, "Evicted unhealthy database pool");
                true
            }
            None => {
                debug!(database_id = %id, "Handle already replaced, nothing to evict");
                false
            }
        }
    }

    async fn check_backoff(&self, id: &str) -> Result<()> {
        let failed_at = self.failures.read().await.get(id).copied();

        if let Some(failed_at) = failed_at {
            let backoff = self.settings.failure_backoff();
            let elapsed = failed_at.elapsed();
            if elapsed < backoff {
                return Err(ServerError::recently_failed(id, backoff - elapsed));
            }
        }

        Ok(())
    }

    async fn connect_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.connect_locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn connect(&self, config: &DatabaseConfig) -> Result<C::Handle> {
        let id = config.id.as_str();
        let policy = &self.settings.retry;
        let connect_timeout = self.settings.connect_timeout();
        let mut attempt = 0;

        let outcome = loop {
            attempt += 1;

            let opening = self.connector.open(config, &self.settings);
            let result = match timeout(connect_timeout, opening).await {
                Ok(result) => result,
                Err(_) => Err(ServerError::connection_failed(
                    id,
                    ConnectionFailureKind::Timeout,
                    format!("connect did not finish within {}ms", self.settings.connect_timeout_ms),
                )),
            };

            match result {
                Ok(handle) => break Ok(handle),
                Err(e) if attempt < policy.max_attempts && e.is_recoverable() => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        database_id = %id,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Connect attempt failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(handle) => self.insert(id, handle).await,
            Err(e) => {
                self.failures.write().await.insert(id.to_string(), Instant::now());
                error!(database_id = %id, attempts = attempt, "Failed to connect database");

                Err(match e {
                    e @ ServerError::ConnectionFailed { .. } => e,
                    other => ServerError::connection_failed(
                        id,
                        ConnectionFailureKind::Unknown,
                        other.detailed_message(),
                    ),
                })
            }
        }
    }

    async fn insert(&self, id: &str, handle: C::Handle) -> Result<C::Handle> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        let replaced = {
            let mut pools = self.pools.write().await;

            // Checked under the write lock: shutdown drains after setting the flag
            if self.closed.load(Ordering::SeqCst) {
                None
            } else {
                Some(pools.insert(
                    id.to_string(),
                    PoolEntry {
                        handle: handle.clone(),
                        generation,
                        connected_at: Instant::now(),
                    },
                ))
            }
        };

        let Some(replaced) = replaced else {
            handle.close().await;
            return Err(Self::closed_error(id));
        };

        if let Some(old) = replaced {
            old.handle.close().await;
        }

        self.failures.write().await.remove(id);
        info!(database_id = %id, generation, "Database connected");

        Ok(handle)
    }
}

/// Running health monitor task
#[derive(Debug)]
pub struct HealthMonitor {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl HealthMonitor {
    /// Signal the monitor to stop and wait for it
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            error!("Health monitor task failed: {}", e);
        }
    }
}

/// Resolves once a stop is signalled or the sender is gone
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    while !*stop_rx.borrow_and_update() {
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}
