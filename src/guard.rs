//! Keyed single-flight execution guard.
//!
//! [`MutationGuard::run`] registers the operation synchronously and returns a
//! [`PendingOutcome`]. At most one action per key is outstanding; what a second
//! caller gets while one is in flight depends on the call site's [`GuardPolicy`].
//! The action is spawned on the tokio runtime, so it settles (and observers hear
//! about it exactly once) even when every caller stops waiting.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::GateError;
use crate::notify::{Notifier, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardPolicy {
    /// Share the in-flight outcome (role lookups).
    Join,
    /// Refuse a second caller with `OperationInProgress` (create buttons).
    Reject,
    /// Share while in flight; once succeeded, later runs succeed without re-running (deletes).
    IdempotentSucceed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState<T> {
    Idle,
    InFlight,
    Succeeded(T),
    Failed(GateError),
}

#[derive(Debug, Clone)]
pub struct GuardEvent<T> {
    pub key: String,
    pub state: OperationState<T>,
}

type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T, GateError>>>;

struct Entry<T> {
    id: u64,
    outcome: SharedOutcome<T>,
    settled: Option<OperationState<T>>,
}

/// Idempotent successes remembered per guard before the oldest are forgotten.
pub const REMEMBERED_SUCCESSES: usize = 1024;

struct Table<T> {
    next_id: u64,
    entries: HashMap<String, Entry<T>>,
    completed: HashMap<String, T>,
    completed_order: VecDeque<String>,
    remember_limit: usize,
}

impl<T> Table<T> {
    fn remember(&mut self, key: &str, value: T) {
        if self.completed.insert(key.to_string(), value).is_none() {
            self.completed_order.push_back(key.to_string());
        }
        while self.completed.len() > self.remember_limit {
            let Some(oldest) = self.completed_order.pop_front() else { break };
            self.completed.remove(&oldest);
        }
    }

    fn forget(&mut self, key: &str) -> bool {
        if self.completed.remove(key).is_none() {
            return false;
        }
        self.completed_order.retain(|k| k != key);
        true
    }
}

enum Outcome<T: Clone> {
    Ready(Option<Result<T, GateError>>),
    Pending(SharedOutcome<T>),
}

/// Outcome handle returned by [`MutationGuard::run`]. Await it for the result.
pub struct PendingOutcome<T: Clone> {
    key: String,
    originator: bool,
    inner: Outcome<T>,
}

impl<T: Clone> PendingOutcome<T> {
    pub fn key(&self) -> &str { &self.key }

    /// True for the one caller whose `run` started the action. That caller owns any
    /// optimistic update and its rollback.
    pub fn is_originator(&self) -> bool { self.originator }

    /// Already-settled result, if any, without waiting.
    pub fn peek(&self) -> Option<Result<T, GateError>> {
        match &self.inner {
            Outcome::Ready(r) => r.clone(),
            Outcome::Pending(shared) => shared.peek().cloned(),
        }
    }
}

// The ready result is moved out, never pinned in place.
impl<T: Clone> Unpin for PendingOutcome<T> {}

impl<T: Clone> Future for PendingOutcome<T> {
    type Output = Result<T, GateError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            Outcome::Ready(r) => Poll::Ready(
                r.take().unwrap_or_else(|| Err(GateError::store("guarded outcome polled after completion"))),
            ),
            Outcome::Pending(shared) => Pin::new(shared).poll(cx),
        }
    }
}

pub struct MutationGuard<T> {
    name: &'static str,
    table: Arc<Mutex<Table<T>>>,
    events: Notifier<GuardEvent<T>>,
}

impl<T> Clone for MutationGuard<T> {
    fn clone(&self) -> Self { Self { name: self.name, table: self.table.clone(), events: self.events.clone() } }
}

impl<T> MutationGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self { Self::with_remember_limit(name, REMEMBERED_SUCCESSES) }

    /// Guard that remembers at most `limit` idempotent successes, oldest dropped first.
    pub fn with_remember_limit(name: &'static str, limit: usize) -> Self {
        Self {
            name,
            table: Arc::new(Mutex::new(Table {
                next_id: 1,
                entries: HashMap::new(),
                completed: HashMap::new(),
                completed_order: VecDeque::new(),
                remember_limit: limit,
            })),
            events: Notifier::new(),
        }
    }

    pub fn run<F, Fut>(&self, key: impl Into<String>, policy: GuardPolicy, action: F) -> PendingOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GateError>> + Send + 'static,
    {
        let key = key.into();
        let mut table = self.table.lock();

        if policy == GuardPolicy::IdempotentSucceed {
            if let Some(done) = table.completed.get(&key) {
                debug!(target: "classgate::guard", "{}: '{}' already succeeded, skipping action", self.name, key);
                return ready(key, Ok(done.clone()));
            }
        }

        if let Some(entry) = table.entries.get(&key) {
            if entry.settled.is_none() {
                return match policy {
                    GuardPolicy::Reject => {
                        debug!(target: "classgate::guard", "{}: rejecting duplicate '{}'", self.name, key);
                        ready(key.clone(), Err(GateError::OperationInProgress { key }))
                    }
                    GuardPolicy::Join | GuardPolicy::IdempotentSucceed => {
                        debug!(target: "classgate::guard", "{}: joining in-flight '{}'", self.name, key);
                        PendingOutcome { key, originator: false, inner: Outcome::Pending(entry.outcome.clone()) }
                    }
                };
            }
        }

        let id = table.next_id;
        table.next_id += 1;
        let (tx, rx) = oneshot::channel::<Result<T, GateError>>();
        let outcome: SharedOutcome<T> = async move {
            rx.await.unwrap_or_else(|_| Err(GateError::store("guarded action aborted")))
        }
        .boxed()
        .shared();
        table.entries.insert(key.clone(), Entry { id, outcome: outcome.clone(), settled: None });
        drop(table);

        // The key is registered; the action may now call back into this guard.
        let settle = Settle {
            name: self.name,
            key: key.clone(),
            id,
            remember: policy == GuardPolicy::IdempotentSucceed,
            table: self.table.clone(),
            events: self.events.clone(),
        };
        let fut = match std::panic::catch_unwind(AssertUnwindSafe(action)) {
            Ok(fut) => fut,
            Err(_) => {
                let result = Err(GateError::store("guarded action panicked"));
                settle.finish(&result);
                let _ = tx.send(result);
                return PendingOutcome { key, originator: true, inner: Outcome::Pending(outcome) };
            }
        };
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    settle.events.publish(GuardEvent { key: settle.key.clone(), state: OperationState::InFlight });
                    let result = AssertUnwindSafe(fut)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| Err(GateError::store("guarded action panicked")));
                    settle.finish(&result);
                    let _ = tx.send(result);
                });
            }
            Err(_) => {
                warn!(target: "classgate::guard", "{}: no tokio runtime for '{}'", self.name, key);
                let result = Err(GateError::store("guarded action needs a tokio runtime"));
                settle.finish(&result);
                let _ = tx.send(result);
            }
        }

        debug!(target: "classgate::guard", "{}: '{}' in flight", self.name, key);
        PendingOutcome { key, originator: true, inner: Outcome::Pending(outcome) }
    }

    pub fn state(&self, key: &str) -> OperationState<T> {
        match self.table.lock().entries.get(key) {
            Some(Entry { settled: Some(s), .. }) => s.clone(),
            Some(_) => OperationState::InFlight,
            None => OperationState::Idle,
        }
    }

    pub fn is_in_flight(&self, key: &str) -> bool { matches!(self.state(key), OperationState::InFlight) }

    pub fn in_flight_count(&self) -> usize {
        self.table.lock().entries.values().filter(|e| e.settled.is_none()).count()
    }

    /// Drop the remembered success of an idempotent key.
    pub fn forget(&self, key: &str) -> bool { self.table.lock().forget(key) }

    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&GuardEvent<T>) + Send + Sync + 'static,
    {
        self.events.subscribe(observer)
    }
}

fn ready<T: Clone + Send + Sync + 'static>(key: String, result: Result<T, GateError>) -> PendingOutcome<T> {
    PendingOutcome { key, originator: false, inner: Outcome::Ready(Some(result)) }
}

struct Settle<T> {
    name: &'static str,
    key: String,
    id: u64,
    remember: bool,
    table: Arc<Mutex<Table<T>>>,
    events: Notifier<GuardEvent<T>>,
}

impl<T: Clone + Send + Sync + 'static> Settle<T> {
    fn finish(self, result: &Result<T, GateError>) {
        let state = match result {
            Ok(v) => OperationState::Succeeded(v.clone()),
            Err(e) => OperationState::Failed(e.clone()),
        };
        {
            let mut table = self.table.lock();
            if let Some(entry) = table.entries.get_mut(&self.key) {
                if entry.id == self.id {
                    entry.settled = Some(state.clone());
                }
            }
            if let (true, Ok(v)) = (self.remember, result) {
                table.remember(&self.key, v.clone());
            }
        }
        match result {
            Ok(_) => debug!(target: "classgate::guard", "{}: '{}' succeeded", self.name, self.key),
            Err(e) => warn!(target: "classgate::guard", "{}: '{}' failed: {}", self.name, self.key, e),
        }
        self.events.publish(GuardEvent { key: self.key.clone(), state });
        // Observers have seen the settled state; the key is free again.
        let mut table = self.table.lock();
        if table.entries.get(&self.key).map(|e| e.id) == Some(self.id) {
            table.entries.remove(&self.key);
        }
    }
}
