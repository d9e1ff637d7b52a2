//! Synchronous publish/subscribe used by the session store, the role resolver, the
//! coordinator and the mutation guard. Keep the surface thin: subscribe, publish.
//!
//! Delivery is never reentrant. An event published from inside a callback (or from
//! another thread while a delivery runs) is queued and delivered by the publisher
//! that is already draining, after the current event reached every subscriber.
//! A panicking subscriber is logged and skipped; the others still receive the event.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::error;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Inner<E> {
    subscribers: Mutex<Vec<(u64, Callback<E>)>>,
    next_id: AtomicU64,
    queue: Mutex<VecDeque<E>>,
    delivering: AtomicBool,
}

pub struct Notifier<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for Notifier<E> {
    fn clone(&self) -> Self { Self { inner: self.inner.clone() } }
}

impl<E: Send + 'static> Default for Notifier<E> {
    fn default() -> Self { Self::new() }
}

impl<E: Send + 'static> Notifier<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                queue: Mutex::new(VecDeque::new()),
                delivering: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push((id, Arc::new(callback)));
        let weak: Weak<Inner<E>> = Arc::downgrade(&self.inner);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.subscribers.lock().retain(|(sid, _)| *sid != id);
                }
            })),
        }
    }

    pub fn subscriber_count(&self) -> usize { self.inner.subscribers.lock().len() }

    pub fn publish(&self, event: E) {
        self.inner.queue.lock().push_back(event);
        loop {
            if self.inner.delivering.swap(true, Ordering::AcqRel) {
                // Another delivery is draining the queue.
                return;
            }
            let draining = Draining(&self.inner.delivering);
            while let Some(ev) = self.inner.queue.lock().pop_front() {
                // Snapshot subscribers so callbacks may subscribe/unsubscribe freely.
                let subs: Vec<(u64, Callback<E>)> = self.inner.subscribers.lock().clone();
                for (id, cb) in subs {
                    if catch_unwind(AssertUnwindSafe(|| cb(&ev))).is_err() {
                        error!(target: "classgate::notify", "subscriber {} panicked; event skipped for it", id);
                    }
                }
            }
            drop(draining);
            // An event may have been queued between the last pop and the release.
            if self.inner.queue.lock().is_empty() {
                return;
            }
        }
    }
}

/// Clears the delivering flag however the drain loop exits.
struct Draining<'a>(&'a AtomicBool);

impl Drop for Draining<'_> {
    fn drop(&mut self) { self.0.store(false, Ordering::Release); }
}

/// Handle returned by [`Notifier::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.detach.take() { f(); }
    }

    /// Keep the callback registered for the lifetime of the notifier.
    pub fn detach(mut self) { self.detach = None; }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.detach.take() { f(); }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("active", &self.detach.is_some()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_to_all_and_unsubscribes() {
        let n: Notifier<u32> = Notifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s1 = { let seen = seen.clone(); n.subscribe(move |v| seen.lock().push(("a", *v))) };
        let s2 = { let seen = seen.clone(); n.subscribe(move |v| seen.lock().push(("b", *v))) };
        n.publish(1);
        s1.unsubscribe();
        n.publish(2);
        drop(s2);
        n.publish(3);
        assert_eq!(*seen.lock(), vec![("a", 1), ("b", 1), ("b", 2)]);
        assert_eq!(n.subscriber_count(), 0);
    }

    #[test]
    fn nested_publish_is_queued_not_reentrant() {
        let n: Notifier<u32> = Notifier::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let depth = Arc::new(AtomicU64::new(0));
        let n2 = n.clone();
        let log2 = log.clone();
        let depth2 = depth.clone();
        let _s = n.subscribe(move |v| {
            let d = depth2.fetch_add(1, Ordering::SeqCst);
            assert_eq!(d, 0, "callback entered reentrantly");
            log2.lock().push(format!("start {}", v));
            if *v == 1 {
                n2.publish(2);
            }
            log2.lock().push(format!("end {}", v));
            depth2.fetch_sub(1, Ordering::SeqCst);
        });
        n.publish(1);
        assert_eq!(*log.lock(), vec!["start 1", "end 1", "start 2", "end 2"]);
    }

    #[test]
    fn panicking_subscriber_does_not_stall_delivery() {
        let n: Notifier<u32> = Notifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _bad = n.subscribe(|v| {
            if *v == 1 {
                panic!("subscriber bug");
            }
        });
        let _good = { let seen = seen.clone(); n.subscribe(move |v| seen.lock().push(*v)) };
        for v in 1..=3 {
            n.publish(v);
        }
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn detached_subscription_stays_registered() {
        let n: Notifier<u32> = Notifier::new();
        n.subscribe(|_| {}).detach();
        assert_eq!(n.subscriber_count(), 1);
    }
}
