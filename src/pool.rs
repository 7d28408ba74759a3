//! Session registry, admission control and idle reclamation.
//!
//! All bookkeeping lives in one mutex-guarded [`PoolInner`]: the registry of
//! slots and the FIFO queue of waiting callers. The lock is never held across
//! an await. A slot is reserved (`Slot::Creating`) before its container is
//! started, so capacity checks and reservations are atomic while slow
//! container starts run unlocked.
//!
//! When a slot is released and callers are waiting, the head of the queue is
//! popped and handed the freed capacity directly (a handoff), so newcomers
//! cannot overtake it.

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::sandbox::{Sandbox, SandboxManager};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// One caller's exclusive claim on a sandbox.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub sandbox: Sandbox,
    pub created_at: Instant,
    pub last_activity: Instant,
}

impl Session {
    fn new(id: String, sandbox: Sandbox) -> Self {
        let now = Instant::now();
        Self {
            id,
            sandbox,
            created_at: now,
            last_activity: now,
        }
    }

    fn handle(&self) -> SessionHandle {
        SessionHandle {
            session_id: self.id.clone(),
            container_id: self.sandbox.container_id.clone(),
            address: self.sandbox.address,
        }
    }
}

/// What a request needs to reach its sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: String,
    pub container_id: String,
    pub address: SocketAddr,
}

/// Registry entry. A creating slot counts against capacity but is never
/// visible to callers; waiters on the same id watch for the sender to drop.
enum Slot {
    Creating(watch::Receiver<()>),
    Ready(Session),
}

struct QueueEntry {
    ticket: u64,
    session_id: String,
    enqueued_at: Instant,
    wake: oneshot::Sender<()>,
}

/// Result of waiting in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted(SessionHandle),
    /// Still no capacity; `position` is 1-indexed.
    Queued { position: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub queue_size: usize,
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub container_name: String,
    pub address: SocketAddr,
    pub age: Duration,
    pub idle: Duration,
}

#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub session_id: String,
    pub waiting: Duration,
}

#[derive(Default)]
struct PoolInner {
    slots: HashMap<String, Slot>,
    queue: VecDeque<QueueEntry>,
    /// Tickets popped from the queue that hold a freed slot.
    handoffs: HashSet<u64>,
    next_ticket: u64,
    closed: bool,
}

impl PoolInner {
    fn occupied(&self) -> usize {
        self.slots.len() + self.handoffs.len()
    }

    /// Hand free capacity to the head of the queue. Skips entries whose
    /// waiter has already given up.
    fn wake_next(&mut self, max_sessions: usize) {
        while self.occupied() < max_sessions {
            let Some(entry) = self.queue.pop_front() else {
                return;
            };
            if entry.wake.send(()).is_ok() {
                info!(session_id = %entry.session_id, "Waking queued session");
                self.handoffs.insert(entry.ticket);
                return;
            }
        }
    }

    fn position_of(&self, ticket: u64) -> Option<usize> {
        self.queue
            .iter()
            .position(|e| e.ticket == ticket)
            .map(|i| i + 1)
    }
}

enum Decision {
    Ready(SessionHandle),
    WaitForCreation(watch::Receiver<()>),
    Create(watch::Sender<()>),
    NoCapacity,
}

/// Shared handle to the process-wide sandbox pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Mutex<PoolInner>>,
    sandboxes: Arc<SandboxManager>,
    config: Arc<PoolConfig>,
}

impl Pool {
    pub fn new(config: PoolConfig, sandboxes: SandboxManager) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner::default())),
            sandboxes: Arc::new(sandboxes),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn sandboxes(&self) -> &SandboxManager {
        &self.sandboxes
    }

    /// Return the session's sandbox, creating one if there is capacity.
    /// `Ok(None)` means the caller must go through the queue.
    pub async fn acquire(&self, session_id: &str) -> Result<Option<SessionHandle>, PoolError> {
        self.admit(session_id, None).await
    }

    /// Wait in the FIFO queue for a slot, up to the queue wait timeout.
    pub async fn enqueue_and_wait(&self, session_id: &str) -> Result<Admission, PoolError> {
        let (tx, rx) = oneshot::channel();
        let ticket = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(PoolError::ShuttingDown);
            }
            let ticket = inner.next_ticket;
            inner.next_ticket += 1;
            inner.queue.push_back(QueueEntry {
                ticket,
                session_id: session_id.to_string(),
                enqueued_at: Instant::now(),
                wake: tx,
            });
            info!(session_id = %session_id, position = inner.queue.len(), "Session queued");
            ticket
        };
        let mut guard = QueueGuard {
            pool: self,
            ticket,
            position: 0,
        };

        match tokio::time::timeout(self.config.queue_wait_timeout, rx).await {
            Ok(Ok(())) => match self.admit(session_id, Some(guard.take())).await? {
                Some(handle) => Ok(Admission::Admitted(handle)),
                None => Ok(Admission::Queued {
                    position: self.queue_size() + 1,
                }),
            },
            Ok(Err(_)) => Err(PoolError::ShuttingDown),
            Err(_) => {
                guard.leave();
                Ok(Admission::Queued {
                    position: guard.position.max(1),
                })
            }
        }
    }

    async fn admit(
        &self,
        session_id: &str,
        mut handoff: Option<u64>,
    ) -> Result<Option<SessionHandle>, PoolError> {
        loop {
            let decision = {
                let mut inner = self.inner.lock();
                // A handed-off slot is consumed here, whichever way the
                // decision goes.
                let bypass_queue = match handoff.take() {
                    Some(ticket) => {
                        inner.handoffs.remove(&ticket);
                        true
                    }
                    None => false,
                };
                let decision = self.decide(&mut inner, session_id, bypass_queue);
                if bypass_queue && !matches!(decision, Decision::Create(_)) {
                    inner.wake_next(self.config.max_sessions);
                }
                decision
            };

            match decision {
                Decision::Ready(handle) => return Ok(Some(handle)),
                Decision::NoCapacity => return Ok(None),
                Decision::WaitForCreation(mut rx) => {
                    // Resolves once the creating task drops its sender.
                    let _ = rx.changed().await;
                }
                Decision::Create(tx) => return self.create(session_id, tx).await.map(Some),
            }
        }
    }

    fn decide(&self, inner: &mut PoolInner, session_id: &str, bypass_queue: bool) -> Decision {
        if inner.closed {
            return Decision::NoCapacity;
        }
        if let Some(Slot::Creating(rx)) = inner.slots.get(session_id) {
            // The creating task is gone without resolving its reservation.
            if rx.has_changed().is_err() {
                warn!(session_id = %session_id, "Dropping abandoned sandbox reservation");
                inner.slots.remove(session_id);
                inner.wake_next(self.config.max_sessions);
            }
        }
        match inner.slots.get_mut(session_id) {
            Some(Slot::Ready(session)) => {
                session.last_activity = Instant::now();
                Decision::Ready(session.handle())
            }
            Some(Slot::Creating(rx)) => Decision::WaitForCreation(rx.clone()),
            None => {
                let queue_blocks = !bypass_queue && !inner.queue.is_empty();
                if inner.occupied() >= self.config.max_sessions || queue_blocks {
                    return Decision::NoCapacity;
                }
                let (tx, rx) = watch::channel(());
                inner
                    .slots
                    .insert(session_id.to_string(), Slot::Creating(rx));
                Decision::Create(tx)
            }
        }
    }

    /// Start the sandbox for a reserved slot. Runs as its own task so a
    /// caller that disconnects mid-creation cannot strand the reservation.
    async fn create(
        &self,
        session_id: &str,
        done: watch::Sender<()>,
    ) -> Result<SessionHandle, PoolError> {
        let pool = self.clone();
        let id = session_id.to_string();
        let task = tokio::spawn(async move {
            let mut reservation = Reservation {
                pool: pool.clone(),
                session_id: id.clone(),
                resolved: false,
                _done: done,
            };
            let result = pool.sandboxes.create(&id).await;
            let outcome = pool.finish_creation(&id, result).await;
            reservation.resolved = true;
            outcome
        });

        task.await.map_err(|e| {
            error!(session_id = %session_id, error = %e, "Sandbox creation task failed");
            PoolError::CreationAborted {
                session_id: session_id.to_string(),
            }
        })?
    }

    async fn finish_creation(
        &self,
        session_id: &str,
        result: Result<Sandbox, crate::error::SandboxError>,
    ) -> Result<SessionHandle, PoolError> {
        let orphan = {
            let mut inner = self.inner.lock();
            match result {
                Ok(sandbox) if !inner.closed => {
                    let session = Session::new(session_id.to_string(), sandbox);
                    let handle = session.handle();
                    inner
                        .slots
                        .insert(session_id.to_string(), Slot::Ready(session));
                    return Ok(handle);
                }
                Ok(sandbox) => {
                    inner.slots.remove(session_id);
                    Some(sandbox)
                }
                Err(source) => {
                    inner.slots.remove(session_id);
                    inner.wake_next(self.config.max_sessions);
                    return Err(PoolError::Creation {
                        session_id: session_id.to_string(),
                        source,
                    });
                }
            }
        };

        // The pool shut down while this sandbox was starting.
        if let Some(sandbox) = orphan {
            self.sandboxes.teardown(&sandbox).await;
        }
        Err(PoolError::ShuttingDown)
    }

    /// Refresh a session's activity timestamp.
    pub fn touch(&self, session_id: &str) {
        if let Some(Slot::Ready(session)) = self.inner.lock().slots.get_mut(session_id) {
            session.last_activity = Instant::now();
        }
    }

    /// Remove a session and tear down its sandbox. The registry entry goes
    /// first so nothing new is routed to it; the freed slot is handed to the
    /// head of the queue. Returns whether the session existed.
    pub async fn destroy(&self, session_id: &str) -> bool {
        self.destroy_matching(session_id, None).await
    }

    /// Like [`Pool::destroy`], but only while the session is still backed by
    /// `container_id`. A sandbox that already replaced it is kept.
    pub async fn destroy_if(&self, session_id: &str, container_id: &str) -> bool {
        self.destroy_matching(session_id, Some(container_id)).await
    }

    async fn destroy_matching(&self, session_id: &str, container_id: Option<&str>) -> bool {
        let session = {
            let mut inner = self.inner.lock();
            // Creating slots are resolved only by their creating task.
            let is_target = match inner.slots.get(session_id) {
                Some(Slot::Ready(session)) => {
                    container_id.map_or(true, |id| session.sandbox.container_id == id)
                }
                _ => false,
            };
            if !is_target {
                return false;
            }
            let Some(Slot::Ready(session)) = inner.slots.remove(session_id) else {
                return false;
            };
            inner.wake_next(self.config.max_sessions);
            session
        };

        self.sandboxes.teardown(&session.sandbox).await;
        true
    }

    /// Destroy every session idle for longer than the idle timeout.
    pub async fn reap_idle(&self) -> usize {
        let idle: Vec<String> = {
            let inner = self.inner.lock();
            let now = Instant::now();
            let idle_timeout = self.config.idle_timeout;
            inner
                .slots
                .values()
                .filter_map(|slot| match slot {
                    Slot::Ready(s) if now.duration_since(s.last_activity) > idle_timeout => {
                        Some(s.id.clone())
                    }
                    _ => None,
                })
                .collect()
        };

        let mut reaped = 0;
        for id in idle {
            info!(
                session_id = %id,
                idle_timeout_secs = self.config.idle_timeout.as_secs(),
                "Session idle, reaping"
            );
            if self.destroy(&id).await {
                reaped += 1;
            }
        }
        reaped
    }

    /// Drain the queue and destroy every live session.
    pub async fn shutdown(&self) {
        let sessions: Vec<Session> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            // Dropping the entries closes their wake channels.
            inner.queue.clear();
            inner.handoffs.clear();
            let ready: Vec<String> = inner
                .slots
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
                .map(|(id, _)| id.clone())
                .collect();
            ready
                .into_iter()
                .filter_map(|id| match inner.slots.remove(&id) {
                    Some(Slot::Ready(session)) => Some(session),
                    _ => None,
                })
                .collect()
        };

        info!(count = sessions.len(), "Destroying all sessions");
        join_all(
            sessions
                .iter()
                .map(|session| self.sandboxes.teardown(&session.sandbox)),
        )
        .await;
    }

    /// 1-indexed position of the first queue entry for `session_id`, or 0.
    pub fn queue_position(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .queue
            .iter()
            .position(|e| e.session_id == session_id)
            .map_or(0, |i| i + 1)
    }

    pub fn queue_size(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn status(&self) -> PoolStatus {
        let inner = self.inner.lock();
        PoolStatus {
            active_sessions: inner.slots.len(),
            max_sessions: self.config.max_sessions,
            queue_size: inner.queue.len(),
        }
    }

    /// Ready sessions and queued callers, for introspection.
    pub fn snapshot(&self) -> (Vec<SessionSnapshot>, Vec<QueueSnapshot>) {
        let inner = self.inner.lock();
        let now = Instant::now();
        let mut sessions: Vec<SessionSnapshot> = inner
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(s) => Some(SessionSnapshot {
                    session_id: s.id.clone(),
                    container_name: s.sandbox.name.clone(),
                    address: s.sandbox.address,
                    age: now.duration_since(s.created_at),
                    idle: now.duration_since(s.last_activity),
                }),
                Slot::Creating(_) => None,
            })
            .collect();
        sessions.sort_by(|a, b| b.age.cmp(&a.age));

        let queue = inner
            .queue
            .iter()
            .map(|e| QueueSnapshot {
                session_id: e.session_id.clone(),
                waiting: now.duration_since(e.enqueued_at),
            })
            .collect();
        (sessions, queue)
    }
}

/// Keeps a queued ticket consistent if the waiting future is dropped: the
/// entry leaves the queue, and an unused handoff is passed on.
struct QueueGuard<'a> {
    pool: &'a Pool,
    ticket: u64,
    position: usize,
}

impl QueueGuard<'_> {
    /// Disarm the guard and hand its ticket to the admission path.
    fn take(&mut self) -> u64 {
        let ticket = self.ticket;
        self.ticket = u64::MAX;
        ticket
    }

    /// Leave the queue, remembering the position held at that moment.
    fn leave(&mut self) {
        if self.ticket == u64::MAX {
            return;
        }
        let mut inner = self.pool.inner.lock();
        if let Some(position) = inner.position_of(self.ticket) {
            self.position = position;
            inner.queue.retain(|e| e.ticket != self.ticket);
        } else if inner.handoffs.remove(&self.ticket) {
            // Woken right as the wait timed out; pass the slot on.
            self.position = 1;
            inner.wake_next(self.pool.config.max_sessions);
        }
        self.ticket = u64::MAX;
    }
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.leave();
    }
}

/// A slot reservation owned by its creating task. If the task ends without
/// resolving it (panic or runtime shutdown) the slot is released and the
/// freed capacity handed on before same-id waiters are woken.
struct Reservation {
    pool: Pool,
    session_id: String,
    resolved: bool,
    _done: watch::Sender<()>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let mut inner = self.pool.inner.lock();
        if matches!(inner.slots.get(&self.session_id), Some(Slot::Creating(_))) {
            warn!(session_id = %self.session_id, "Sandbox creation abandoned, releasing slot");
            inner.slots.remove(&self.session_id);
            inner.wake_next(self.pool.config.max_sessions);
        }
    }
}

/// Background task that periodically reclaims idle sessions.
pub struct Reaper {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Reaper {
    pub fn spawn(pool: Pool) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let period = pool.config.reap_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let reaped = pool.reap_idle().await;
                        if reaped > 0 {
                            info!(reaped, "Idle sessions reclaimed");
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
        });
        Self { stop, handle }
    }

    /// Signal the loop to stop and wait for it.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Reaper task ended abnormally");
        }
    }
}
