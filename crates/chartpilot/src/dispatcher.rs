//! Reconcile queue and worker pool for one watched kind
//!
//! Requests are keyed by resource identity. A request for an identity that
//! is already queued is dropped; one that arrives while the identity is being
//! reconciled marks it dirty, which buys exactly one follow-up reconcile.
//! Distinct identities run in parallel on a bounded number of workers.
//!
//! Failed reconciles are retried with exponential backoff. A lost optimistic
//! write gets a few immediate retries first. Permanent errors are left to the
//! periodic reconcile.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::error::{Error, ErrorClass, Result};
use crate::identity::{ReconcileReason, ResourceKey};

/// Reconciles one resource identity
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, key: &ResourceKey, reason: ReconcileReason) -> Result<Action>;
}

/// What to do after a successful reconcile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
    forget: bool,
}

impl Action {
    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
            forget: false,
        }
    }

    /// Wait for the next event or periodic tick
    pub fn await_change() -> Self {
        Self::default()
    }

    /// The resource no longer exists; drop it from the periodic reconcile
    pub fn forget() -> Self {
        Self {
            requeue_after: None,
            forget: true,
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }

    pub fn forgets(&self) -> bool {
        self.forget
    }
}

/// Immediate retries of a conflicting reconcile before falling back to backoff
pub const CONFLICT_RETRIES: u32 = 3;

/// Retry delays for failed reconciles
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(64) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        let capped = base.min(max);
        let jitter = capped * self.jitter * (rand::random::<f64>() * 2.0 - 1.0);
        Duration::from_secs_f64((capped + jitter).clamp(0.0, max))
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub backoff: Backoff,
    /// Zero disables periodic reconciles
    pub reconcile_period: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            backoff: Backoff::default(),
            reconcile_period: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Queued(ReconcileReason),
    Running { follow_up: Option<ReconcileReason> },
}

struct State {
    slots: HashMap<ResourceKey, Slot>,
    attempts: HashMap<ResourceKey, u32>,
    /// Immediate conflict retries since the last success
    conflicts: HashMap<ResourceKey, u32>,
    /// Resources revisited by the periodic ticker
    known: HashSet<ResourceKey>,
    /// `None` once shut down
    ready: Option<UnboundedSender<ResourceKey>>,
}

struct Shared {
    state: Mutex<State>,
    handler: Arc<dyn Reconcile>,
    backoff: Backoff,
    span: Span,
}

#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    tasks: Arc<Mutex<Tasks>>,
}

#[derive(Default)]
struct Tasks {
    workers: JoinSet<()>,
    ticker: Option<JoinHandle<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Dispatcher {
    /// Start the worker pool and the periodic ticker
    pub fn start(handler: Arc<dyn Reconcile>, config: DispatcherConfig, span: Span) -> Self {
        let (tx, rx) = unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                slots: HashMap::new(),
                attempts: HashMap::new(),
                conflicts: HashMap::new(),
                known: HashSet::new(),
                ready: Some(tx),
            }),
            handler,
            backoff: config.backoff,
            span,
        });

        let mut tasks = Tasks::default();
        let rx = Arc::new(AsyncMutex::new(rx));
        for _ in 0..config.workers.max(1) {
            tasks.workers.spawn(worker(shared.clone(), rx.clone()));
        }
        if !config.reconcile_period.is_zero() {
            tasks.ticker = Some(tokio::spawn(ticker(
                Arc::downgrade(&shared),
                config.reconcile_period,
            )));
        }

        debug!(parent: &shared.span, workers = config.workers.max(1), period = ?config.reconcile_period, "dispatcher started");
        Self {
            shared,
            tasks: Arc::new(Mutex::new(tasks)),
        }
    }

    /// Request a reconcile; never blocks
    pub fn enqueue(&self, key: ResourceKey, reason: ReconcileReason) {
        self.shared.enqueue(key, reason);
    }

    /// Stop accepting work and wait for in-flight reconciles, at most `grace`
    pub async fn shutdown(&self, grace: Duration) {
        lock(&self.shared.state).ready = None;

        let mut tasks = std::mem::take(&mut *lock(&self.tasks));
        if let Some(ticker) = tasks.ticker.take() {
            ticker.abort();
        }

        let drained = tokio::time::timeout(grace, async {
            while tasks.workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(parent: &self.shared.span, grace = ?grace, "reconciles still running after grace period, aborting");
            tasks.workers.abort_all();
        }
        info!(parent: &self.shared.span, "dispatcher stopped");
    }

    /// Nothing queued or running
    pub fn is_idle(&self) -> bool {
        lock(&self.shared.state).slots.is_empty()
    }

    pub fn known_resources(&self) -> usize {
        lock(&self.shared.state).known.len()
    }

    #[cfg(test)]
    fn attempts(&self, key: &ResourceKey) -> u32 {
        lock(&self.shared.state).attempts.get(key).copied().unwrap_or(0)
    }
}

impl Shared {
    fn enqueue(&self, key: ResourceKey, reason: ReconcileReason) {
        let mut state = lock(&self.state);
        let Some(ready) = state.ready.clone() else {
            return;
        };
        if reason != ReconcileReason::ResourceDeleted {
            state.known.insert(key.clone());
        }

        // A deletion outranks whatever it is coalesced with
        let deleted = reason == ReconcileReason::ResourceDeleted;
        match state.slots.get_mut(&key) {
            Some(Slot::Queued(queued)) => {
                if deleted {
                    *queued = reason;
                }
            }
            Some(Slot::Running { follow_up }) => {
                if deleted {
                    *follow_up = Some(reason);
                } else {
                    follow_up.get_or_insert(reason);
                }
            }
            None => {
                state.slots.insert(key.clone(), Slot::Queued(reason));
                // The receiver lives as long as any worker
                let _ = ready.send(key);
            }
        }
    }

    /// Claim a queued identity for a worker
    fn start(&self, key: &ResourceKey) -> Option<ReconcileReason> {
        let mut state = lock(&self.state);
        state.ready.as_ref()?;
        let slot = state.slots.get_mut(key)?;
        match *slot {
            Slot::Queued(reason) => {
                *slot = Slot::Running { follow_up: None };
                Some(reason)
            }
            Slot::Running { .. } => None,
        }
    }

    async fn run(&self, key: &ResourceKey, reason: ReconcileReason) -> Result<Action> {
        let span = info_span!(parent: &self.span, "reconcile", resource = %key, %reason);
        // the handler runs inside the worker so aborting the worker cancels it
        AssertUnwindSafe(self.handler.reconcile(key, reason))
            .catch_unwind()
            .instrument(span)
            .await
            .unwrap_or_else(|panic| Err(Error::Panicked(panic_message(panic.as_ref()))))
    }

    fn finish(self: &Arc<Self>, key: ResourceKey, reason: ReconcileReason, result: Result<Action>) {
        let delayed = {
            let mut state = lock(&self.state);
            let follow_up = match state.slots.remove(&key) {
                Some(Slot::Running { follow_up }) => follow_up,
                _ => None,
            };

            let retry = match result {
                Ok(action) => {
                    state.attempts.remove(&key);
                    state.conflicts.remove(&key);
                    let gone = action.forgets() || reason == ReconcileReason::ResourceDeleted;
                    if gone && follow_up.is_none_or(|next| next == ReconcileReason::ResourceDeleted) {
                        state.known.remove(&key);
                    }
                    action.requeue_after().map(Retry::After)
                }
                Err(e) => match e.class() {
                    ErrorClass::Permanent | ErrorClass::Fatal => {
                        state.attempts.remove(&key);
                        state.conflicts.remove(&key);
                        error!(parent: &self.span, resource = %key, error = %e, "reconcile failed permanently");
                        None
                    }
                    ErrorClass::Conflict
                        if state.conflicts.get(&key).copied().unwrap_or(0) < CONFLICT_RETRIES =>
                    {
                        let conflicts = state.conflicts.entry(key.clone()).or_insert(0);
                        *conflicts += 1;
                        debug!(parent: &self.span, resource = %key, error = %e, attempt = *conflicts, "conflict, retrying now");
                        Some(Retry::Now)
                    }
                    ErrorClass::Transient | ErrorClass::Conflict => {
                        let attempt = state.attempts.entry(key.clone()).or_insert(0);
                        let delay = self.backoff.delay_for_attempt(*attempt);
                        *attempt = attempt.saturating_add(1);
                        warn!(parent: &self.span, resource = %key, error = %e, attempt = *attempt, retry_in = ?delay, "reconcile failed");
                        Some(Retry::Backoff(delay))
                    }
                },
            };

            // an immediate retry merges with a pending follow-up
            let next = match retry {
                Some(Retry::Now) => Some(follow_up.unwrap_or(ReconcileReason::Retry)),
                _ => follow_up,
            };
            if let Some(next) = next
                && let Some(ready) = state.ready.clone()
            {
                state.slots.insert(key.clone(), Slot::Queued(next));
                let _ = ready.send(key.clone());
            }

            match retry {
                Some(Retry::After(delay)) => Some((delay, ReconcileReason::Requeue)),
                Some(Retry::Backoff(delay)) => Some((delay, ReconcileReason::Retry)),
                Some(Retry::Now) | None => None,
            }
        };

        if let Some((delay, reason)) = delayed {
            let shared = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(shared) = shared.upgrade() {
                    shared.enqueue(key, reason);
                }
            });
        }
    }

    /// Enqueue every known resource; false once shut down
    fn tick(&self) -> bool {
        let known: Vec<ResourceKey> = {
            let state = lock(&self.state);
            if state.ready.is_none() {
                return false;
            }
            state.known.iter().cloned().collect()
        };
        debug!(parent: &self.span, resources = known.len(), "periodic reconcile");
        for key in known {
            self.enqueue(key, ReconcileReason::Periodic);
        }
        true
    }
}

enum Retry {
    Now,
    Backoff(Duration),
    /// Requested by the handler
    After(Duration),
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

async fn worker(shared: Arc<Shared>, ready: Arc<AsyncMutex<UnboundedReceiver<ResourceKey>>>) {
    loop {
        let next = ready.lock().await.recv().await;
        let Some(key) = next else {
            break;
        };
        let Some(reason) = shared.start(&key) else {
            continue;
        };
        let result = shared.run(&key, reason).await;
        shared.finish(key, reason, result);
    }
}

async fn ticker(shared: Weak<Shared>, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if !shared.tick() {
            break;
        }
    }
}
