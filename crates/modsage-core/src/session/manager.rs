//! Per-model pool of model-server sessions.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use modsage_abstraction::{ClientFactory, ErrorKind, ModelClient, ServerError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{HealthStatus, SessionInfo, SessionState, SessionStatistics};
use crate::config::SessionConfig;
use crate::error::SessionError;

struct SessionRecord {
    model: String,
    client: Arc<dyn ModelClient>,
    created_at: DateTime<Utc>,
    created: Instant,
    last_used_at: DateTime<Utc>,
    last_used: Instant,
    healthy: bool,
    on_loan: bool,
    request_count: u64,
    busy: Duration,
}

impl SessionRecord {
    fn info(&self, id: Uuid) -> SessionInfo {
        SessionInfo {
            id,
            model: self.model.clone(),
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            state: if self.healthy { SessionState::Healthy } else { SessionState::Unhealthy },
            on_loan: self.on_loan,
            request_count: self.request_count,
            busy_duration: self.busy,
        }
    }
}

#[derive(Default)]
struct PoolState {
    sessions: HashMap<Uuid, SessionRecord>,
    gates: HashMap<String, Arc<Semaphore>>,
}

struct Shared {
    factory: Arc<dyn ClientFactory>,
    config: SessionConfig,
    probe_timeout: Duration,
    state: Mutex<PoolState>,
    total_created: AtomicU64,
    total_requests: AtomicU64,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish_loan(&self, id: Uuid, busy: Duration, healthy: bool) {
        let disposed = {
            let mut state = self.state();
            let Some(record) = state.sessions.get_mut(&id) else {
                return;
            };
            record.on_loan = false;
            record.last_used = Instant::now();
            record.last_used_at = Utc::now();
            record.request_count += 1;
            record.busy += busy;
            record.healthy &= healthy;
            if record.healthy { None } else { state.sessions.remove(&id) }
        };
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        if let Some(record) = disposed {
            info!(session_id = %id, model = %record.model, "Disposed unhealthy session on release");
        } else {
            debug!(session_id = %id, busy_ms = busy.as_millis(), "Session returned to pool");
        }
    }
}

/// Pools reusable model clients, per model, behind a concurrency gate.
///
/// At most `max_sessions_per_model` loans of one model are outstanding at any
/// time; further `acquire` calls wait for a slot. Idle healthy sessions are
/// reused least recently used first.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.shared.config)
            .field("probe_timeout", &self.shared.probe_timeout)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Creates a manager opening clients through `factory`.
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        config: SessionConfig,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                factory,
                config,
                probe_timeout,
                state: Mutex::new(PoolState::default()),
                total_created: AtomicU64::new(0),
                total_requests: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Loans a session for `model`, waiting for a pool slot if necessary.
    ///
    /// Reuses the least recently used idle healthy session, or opens and
    /// probes a new one.
    ///
    /// # Errors
    /// `Cancelled` if `cancel` fires first, `Connect` if a new session cannot
    /// be opened, `ShutDown` after `shutdown`.
    pub async fn acquire(
        &self,
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<SessionLease, SessionError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(SessionError::ShutDown);
        }

        let gate = self.gate(model);
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(SessionError::Cancelled),
            () = self.shared.shutdown.cancelled() => return Err(SessionError::ShutDown),
            permit = gate.acquire_owned() => permit.map_err(|_| SessionError::ShutDown)?,
        };

        if let Some((id, client)) = self.checkout_idle(model) {
            debug!(session_id = %id, model = %model, "Reusing pooled session");
            return Ok(self.lease(id, model, client, permit));
        }

        let client = self
            .shared
            .factory
            .create(model)
            .map_err(|source| SessionError::Connect { model: model.to_string(), source })?;

        let probe = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(SessionError::Cancelled),
            probe = tokio::time::timeout(self.shared.probe_timeout, client.probe()) => probe,
        };
        let probe = probe.unwrap_or_else(|_| {
            Err(ServerError::new(
                ErrorKind::Timeout,
                format!("Probe timed out after {}s", self.shared.probe_timeout.as_secs()),
            ))
        });
        if let Err(source) = probe {
            warn!(model = %model, error = %source, "Failed to open session");
            return Err(SessionError::Connect { model: model.to_string(), source });
        }

        let id = Uuid::new_v4();
        let now = Instant::now();
        self.shared.state().sessions.insert(
            id,
            SessionRecord {
                model: model.to_string(),
                client: Arc::clone(&client),
                created_at: Utc::now(),
                created: now,
                last_used_at: Utc::now(),
                last_used: now,
                healthy: true,
                on_loan: true,
                request_count: 0,
                busy: Duration::ZERO,
            },
        );
        self.shared.total_created.fetch_add(1, Ordering::Relaxed);
        info!(session_id = %id, model = %model, "Created session");

        Ok(self.lease(id, model, client, permit))
    }

    /// Returns a loaned session to the pool.
    ///
    /// Dropping a lease has the same effect; this makes the release point explicit.
    pub fn release(&self, lease: SessionLease) {
        drop(lease);
    }

    /// Probes every tracked session concurrently and updates their health.
    ///
    /// Probe errors and timeouts mark the session unhealthy; they are never returned.
    pub async fn check_health(&self) -> HealthStatus {
        let targets: Vec<(Uuid, String, Arc<dyn ModelClient>)> = self
            .shared
            .state()
            .sessions
            .iter()
            .map(|(id, record)| (*id, record.model.clone(), Arc::clone(&record.client)))
            .collect();

        let timeout = self.shared.probe_timeout;
        let results = join_all(targets.into_iter().map(|(id, model, client)| async move {
            let outcome = match tokio::time::timeout(timeout, client.probe()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("probe timed out after {}s", timeout.as_secs())),
            };
            (id, model, outcome)
        }))
        .await;

        let mut status = HealthStatus { total: results.len(), ..HealthStatus::default() };
        let mut state = self.shared.state();
        for (id, model, outcome) in results {
            let healthy = outcome.is_ok();
            if let Some(record) = state.sessions.get_mut(&id) {
                record.healthy = healthy;
            }
            match outcome {
                Ok(()) => status.healthy += 1,
                Err(issue) => {
                    warn!(session_id = %id, model = %model, issue = %issue, "Session failed health check");
                    status.unhealthy += 1;
                    status.issues.push(format!("Session {id} ({model}): {issue}"));
                }
            }
        }
        drop(state);

        debug!(total = status.total, unhealthy = status.unhealthy, "Session health check completed");
        status
    }

    /// Disposes idle sessions past the idle threshold and unhealthy sessions
    /// not on loan. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        let idle_timeout = self.shared.config.idle_timeout();
        let now = Instant::now();

        let mut state = self.shared.state();
        let before = state.sessions.len();
        state.sessions.retain(|id, record| {
            if record.on_loan {
                return true;
            }
            let idle = now.duration_since(record.last_used);
            let keep = record.healthy && idle <= idle_timeout;
            if !keep {
                debug!(session_id = %id, model = %record.model, healthy = record.healthy, idle_secs = idle.as_secs(), "Evicting session");
            }
            keep
        });
        let removed = before - state.sessions.len();
        drop(state);

        if removed > 0 {
            info!(removed, "Session cleanup completed");
        }
        removed
    }

    /// Aggregate pool statistics.
    pub fn statistics(&self) -> SessionStatistics {
        let now = Instant::now();
        let state = self.shared.state();

        let mut sessions_per_model = BTreeMap::new();
        let mut total_age = Duration::ZERO;
        let mut on_loan = 0;
        for record in state.sessions.values() {
            *sessions_per_model.entry(record.model.clone()).or_insert(0) += 1;
            total_age += now.duration_since(record.created);
            on_loan += usize::from(record.on_loan);
        }
        let active = state.sessions.len();

        SessionStatistics {
            active_sessions: active,
            sessions_on_loan: on_loan,
            total_created: self.shared.total_created.load(Ordering::Relaxed),
            total_requests: self.shared.total_requests.load(Ordering::Relaxed),
            average_session_duration: u32::try_from(active)
                .ok()
                .filter(|&n| n > 0)
                .map_or(Duration::ZERO, |n| total_age / n),
            sessions_per_model,
        }
    }

    /// Snapshot of every tracked session.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.shared.state().sessions.iter().map(|(id, record)| record.info(*id)).collect()
    }

    /// Free loan slots for `model`.
    pub fn available_slots(&self, model: &str) -> usize {
        self.gate(model).available_permits()
    }

    /// Spawns the periodic health-check and cleanup loops. Calling it again is a no-op.
    pub fn start(&self) {
        let mut tasks = self.shared.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() || self.shared.shutdown.is_cancelled() {
            return;
        }

        let health_interval = self.shared.config.health_check_interval();
        tasks.push(self.spawn_loop(health_interval, |manager| async move {
            manager.check_health().await;
        }));

        let cleanup_interval = self.shared.config.cleanup_interval();
        tasks.push(self.spawn_loop(cleanup_interval, |manager| async move {
            manager.cleanup();
        }));

        info!(
            health_interval_secs = health_interval.as_secs(),
            cleanup_interval_secs = cleanup_interval.as_secs(),
            "Session maintenance started"
        );
    }

    /// Stops background loops, wakes waiting callers and disposes every session.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();

        let handles: Vec<_> = {
            let mut tasks = self.shared.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        let disposed = {
            let mut state = self.shared.state();
            for gate in state.gates.values() {
                gate.close();
            }
            let disposed = state.sessions.len();
            state.sessions.clear();
            disposed
        };
        info!(disposed, "Session manager shut down");
    }

    fn spawn_loop<F, Fut>(&self, interval: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Self) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let shutdown = self.shared.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                let Some(shared) = weak.upgrade() else { break };
                tick(Self { shared }).await;
            }
        })
    }

    fn gate(&self, model: &str) -> Arc<Semaphore> {
        let mut state = self.shared.state();
        let capacity = self.shared.config.max_sessions_per_model;
        Arc::clone(
            state
                .gates
                .entry(model.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(capacity))),
        )
    }

    fn checkout_idle(&self, model: &str) -> Option<(Uuid, Arc<dyn ModelClient>)> {
        let mut state = self.shared.state();
        let (id, record) = state
            .sessions
            .iter_mut()
            .filter(|(_, r)| r.model == model && r.healthy && !r.on_loan)
            .min_by_key(|(_, r)| r.last_used)?;
        record.on_loan = true;
        Some((*id, Arc::clone(&record.client)))
    }

    fn lease(
        &self,
        id: Uuid,
        model: &str,
        client: Arc<dyn ModelClient>,
        permit: OwnedSemaphorePermit,
    ) -> SessionLease {
        SessionLease {
            id,
            model: model.to_string(),
            client,
            acquired: Instant::now(),
            healthy: true,
            shared: Arc::clone(&self.shared),
            permit: Some(permit),
        }
    }
}

/// An exclusive loan of one pooled session.
///
/// The loan ends when the lease is released or dropped, on every exit path.
/// Its pool slot is returned at the same moment.
pub struct SessionLease {
    id: Uuid,
    model: String,
    client: Arc<dyn ModelClient>,
    acquired: Instant,
    healthy: bool,
    shared: Arc<Shared>,
    permit: Option<OwnedSemaphorePermit>,
}

impl SessionLease {
    /// The session id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The model the session is bound to.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The client to issue requests with.
    pub fn client(&self) -> &Arc<dyn ModelClient> {
        &self.client
    }

    /// Marks the session broken so it is disposed instead of returned to the pool.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("id", &self.id)
            .field("model", &self.model)
            .field("healthy", &self.healthy)
            .finish_non_exhaustive()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.shared.finish_loan(self.id, self.acquired.elapsed(), self.healthy);
        // Slot is returned only after the session is idle again.
        drop(self.permit.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modsage_models::MockServer;

    fn manager(server: &Arc<MockServer>, max: usize) -> SessionManager {
        let config = SessionConfig { max_sessions_per_model: max, ..SessionConfig::default() };
        SessionManager::new(Arc::new(server.factory()), config, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_acquire_then_reuse() {
        let server = MockServer::with_models(&["llama3"]);
        let sessions = manager(&server, 3);
        let cancel = CancellationToken::new();

        let first = sessions.acquire("llama3", &cancel).await.unwrap();
        let first_id = first.id();
        sessions.release(first);

        let second = sessions.acquire("llama3", &cancel).await.unwrap();
        assert_eq!(second.id(), first_id);
        assert_eq!(server.clients_created(), 1);
        drop(second);

        let stats = sessions.statistics();
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.total_created, 1);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.sessions_per_model.get("llama3"), Some(&1));
    }

    #[tokio::test]
    async fn test_reuses_least_recently_used() {
        let server = MockServer::with_models(&["llama3"]);
        let sessions = manager(&server, 3);
        let cancel = CancellationToken::new();

        let a = sessions.acquire("llama3", &cancel).await.unwrap();
        let b = sessions.acquire("llama3", &cancel).await.unwrap();
        let (a_id, b_id) = (a.id(), b.id());
        assert_ne!(a_id, b_id);

        sessions.release(b);
        tokio::time::sleep(Duration::from_millis(5)).await;
        sessions.release(a);

        let next = sessions.acquire("llama3", &cancel).await.unwrap();
        assert_eq!(next.id(), b_id);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_blocks_until_release() {
        let server = MockServer::with_models(&["llama3"]);
        let sessions = manager(&server, 2);
        let cancel = CancellationToken::new();

        let a = sessions.acquire("llama3", &cancel).await.unwrap();
        let _b = sessions.acquire("llama3", &cancel).await.unwrap();
        assert_eq!(sessions.available_slots("llama3"), 0);

        let waiting = tokio::time::timeout(Duration::from_millis(50), sessions.acquire("llama3", &cancel)).await;
        assert!(waiting.is_err(), "third acquire should block");

        let pool = sessions.clone();
        let waiter = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            pool.acquire("llama3", &cancel).await.map(|lease| lease.id())
        });
        let a_id = a.id();
        drop(a);
        assert_eq!(waiter.await.unwrap().unwrap(), a_id);
    }

    #[tokio::test]
    async fn test_gates_are_per_model() {
        let server = MockServer::with_models(&["llama3", "mistral"]);
        let sessions = manager(&server, 1);
        let cancel = CancellationToken::new();

        let _a = sessions.acquire("llama3", &cancel).await.unwrap();
        let b = tokio::time::timeout(Duration::from_millis(100), sessions.acquire("mistral", &cancel)).await;
        assert!(b.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let server = MockServer::with_models(&["llama3"]);
        let sessions = manager(&server, 1);
        let _held = sessions.acquire("llama3", &CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = sessions.acquire("llama3", &cancel).await.unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_and_frees_slot() {
        let server = MockServer::with_models(&["llama3"]);
        server.set_reachable(false);
        let sessions = manager(&server, 1);
        let cancel = CancellationToken::new();

        let err = sessions.acquire("llama3", &cancel).await.unwrap_err();
        assert!(matches!(err, SessionError::Connect { source, .. } if source.kind == ErrorKind::Connect));
        assert_eq!(sessions.available_slots("llama3"), 1);
        assert_eq!(sessions.statistics().active_sessions, 0);

        server.set_reachable(true);
        assert!(sessions.acquire("llama3", &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_health_check_marks_and_cleanup_evicts() {
        let server = MockServer::with_models(&["llama3", "mistral"]);
        let sessions = manager(&server, 3);
        let cancel = CancellationToken::new();
        sessions.release(sessions.acquire("llama3", &cancel).await.unwrap());
        sessions.release(sessions.acquire("mistral", &cancel).await.unwrap());

        server.set_model_healthy("mistral", false);
        let status = sessions.check_health().await;
        assert_eq!(status.total, 2);
        assert_eq!(status.healthy, 1);
        assert_eq!(status.unhealthy, 1);
        assert!(status.issues[0].contains("mistral"));

        assert_eq!(sessions.cleanup(), 1);
        let remaining = sessions.sessions();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].model, "llama3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_counts_as_unhealthy() {
        let server = MockServer::with_models(&["llama3", "mistral"]);
        let sessions = manager(&server, 3);
        let cancel = CancellationToken::new();
        sessions.release(sessions.acquire("llama3", &cancel).await.unwrap());

        server.set_probe_latency(Duration::from_secs(60));
        let status = sessions.check_health().await;
        assert_eq!(status.unhealthy, 1);
        assert!(status.issues[0].contains("timed out"), "{:?}", status.issues);
        assert_eq!(sessions.sessions()[0].state, SessionState::Unhealthy);

        let err = sessions.acquire("mistral", &cancel).await.unwrap_err();
        assert!(matches!(err, SessionError::Connect { source, .. } if source.kind == ErrorKind::Timeout));
        assert_eq!(sessions.available_slots("mistral"), 3);
    }

    #[tokio::test]
    async fn test_unhealthy_loan_disposed_on_release() {
        let server = MockServer::with_models(&["llama3"]);
        let sessions = manager(&server, 3);
        let mut lease = sessions.acquire("llama3", &CancellationToken::new()).await.unwrap();
        lease.mark_unhealthy();
        sessions.release(lease);

        assert_eq!(sessions.statistics().active_sessions, 0);
        assert_eq!(sessions.available_slots("llama3"), 3);
    }

    #[tokio::test]
    async fn test_cleanup_spares_loaned_sessions() {
        let server = MockServer::with_models(&["llama3"]);
        let config = SessionConfig { idle_timeout_secs: 0, ..SessionConfig::default() };
        let sessions = SessionManager::new(Arc::new(server.factory()), config, Duration::from_secs(1));
        let cancel = CancellationToken::new();

        let held = sessions.acquire("llama3", &cancel).await.unwrap();
        sessions.release(sessions.acquire("llama3", &cancel).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(sessions.cleanup(), 1);
        assert_eq!(sessions.sessions()[0].id, held.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loops_run_on_schedule() {
        let server = MockServer::with_models(&["llama3"]);
        let sessions = manager(&server, 3);
        sessions.release(sessions.acquire("llama3", &CancellationToken::new()).await.unwrap());
        let probes_after_create = server.probe_calls();

        sessions.start();
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(server.probe_calls(), probes_after_create + 1);

        // Cleanup runs every 10 minutes; by the 40 minute run the session has idled past 30.
        tokio::time::sleep(Duration::from_secs(2200)).await;
        assert_eq!(sessions.statistics().active_sessions, 0);

        sessions.shutdown().await;
        assert!(matches!(
            sessions.acquire("llama3", &CancellationToken::new()).await,
            Err(SessionError::ShutDown)
        ));
    }
}
