/// Inbound Router
/// Fans payloads out to every listener registered on a channel.
use crate::models::{Channel, Payload, SubscriptionId};
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub type Listener = Arc<dyn Fn(&Payload) + Send + Sync>;

/// One registration. The reentrant gate is held for the whole call into the
/// listener, so `unsubscribe` from another thread waits for an in-flight
/// delivery, while a listener can still cancel itself from inside the call.
struct Slot {
    id: SubscriptionId,
    gate: ReentrantMutex<RefCell<Option<Listener>>>,
}

impl Slot {
    fn deliver(&self, payload: &Payload) {
        let gate = self.gate.lock();
        let listener = gate.borrow().clone();
        if let Some(listener) = listener {
            listener(payload);
        }
    }

    fn close(&self) {
        let gate = self.gate.lock();
        gate.borrow_mut().take();
    }
}

struct RouterInner {
    next_id: AtomicU64,
    channels: Mutex<HashMap<Channel, Vec<Arc<Slot>>>>,
}

/// Cheap to clone; all clones share the same registrations.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RouterInner {
                next_id: AtomicU64::new(1),
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a listener. It sees only payloads published after this call.
    pub fn subscribe(
        &self,
        channel: Channel,
        listener: impl Fn(&Payload) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_with(channel, |_| listener)
    }

    /// Like `subscribe`, for listeners that need their own id, e.g. to name
    /// the event they forward to.
    pub fn subscribe_with<L>(
        &self,
        channel: Channel,
        make_listener: impl FnOnce(SubscriptionId) -> L,
    ) -> Subscription
    where
        L: Fn(&Payload) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let listener: Listener = Arc::new(make_listener(id));
        let slot = Arc::new(Slot {
            id,
            gate: ReentrantMutex::new(RefCell::new(Some(listener))),
        });

        self.inner
            .channels
            .lock()
            .entry(channel)
            .or_default()
            .push(slot);

        log::debug!("[Router] Subscribed {} to {}", id, channel);

        Subscription {
            router: Arc::downgrade(&self.inner),
            channel,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Remove one registration. Returns false if it was already gone.
    pub fn unsubscribe(&self, channel: Channel, id: SubscriptionId) -> bool {
        remove_slot(&self.inner, channel, id)
    }

    /// Deliver to everyone currently listening on `channel`.
    pub fn publish(&self, channel: Channel, payload: Payload) {
        // Snapshot so listeners may subscribe or unsubscribe while we deliver.
        let slots: Vec<Arc<Slot>> = match self.inner.channels.lock().get(&channel) {
            Some(slots) => slots.clone(),
            None => return,
        };
        for slot in slots {
            slot.deliver(&payload);
        }
    }

    pub fn listener_count(&self, channel: Channel) -> usize {
        self.inner
            .channels
            .lock()
            .get(&channel)
            .map_or(0, Vec::len)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_slot(inner: &RouterInner, channel: Channel, id: SubscriptionId) -> bool {
    let removed = {
        let mut channels = inner.channels.lock();
        let Some(slots) = channels.get_mut(&channel) else {
            return false;
        };
        let removed = slots
            .iter()
            .position(|slot| slot.id == id)
            .map(|pos| slots.remove(pos));
        if slots.is_empty() {
            channels.remove(&channel);
        }
        removed
    };

    match removed {
        Some(slot) => {
            // Outside the map lock: may wait for a delivery in progress.
            slot.close();
            log::debug!("[Router] Unsubscribed {} from {}", id, channel);
            true
        }
        None => false,
    }
}

/// Disposer returned by `subscribe`. Unsubscribes on `unsubscribe()` or drop,
/// whichever comes first.
pub struct Subscription {
    router: Weak<RouterInner>,
    channel: Channel,
    id: SubscriptionId,
    active: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Safe to call more than once.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.router.upgrade() {
            remove_slot(&inner, self.channel, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn text(s: &str) -> Payload {
        Payload::Text(s.to_string())
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&Payload) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = move |payload: &Payload| {
            sink.lock()
                .push(payload.as_text().unwrap_or_default().to_string());
        };
        (seen, listener)
    }

    #[test]
    fn delivers_in_publish_order() {
        let router = Router::new();
        let (seen, listener) = recorder();
        let _sub = router.subscribe(Channel::WorkerMessage, listener);

        for msg in ["a", "b", "c"] {
            router.publish(Channel::WorkerMessage, text(msg));
        }
        assert_eq!(*seen.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn channels_are_isolated() {
        let router = Router::new();
        let (seen, listener) = recorder();
        let _sub = router.subscribe(Channel::WorkerMessage, listener);

        router.publish(Channel::HostReady, text("ready"));
        router.publish(Channel::WorkerStderr, text("warning"));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn two_listeners_see_everything() {
        let router = Router::new();
        let (first, l1) = recorder();
        let (second, l2) = recorder();
        let _s1 = router.subscribe(Channel::WorkerMessage, l1);
        let _s2 = router.subscribe(Channel::WorkerMessage, l2);

        router.publish(Channel::WorkerMessage, text("x"));
        router.publish(Channel::WorkerMessage, text("y"));

        assert_eq!(*first.lock(), vec!["x", "y"]);
        assert_eq!(*second.lock(), vec!["x", "y"]);
    }

    #[test]
    fn no_replay_for_late_subscribers() {
        let router = Router::new();
        router.publish(Channel::WorkerMessage, text("early"));

        let (seen, listener) = recorder();
        let _sub = router.subscribe(Channel::WorkerMessage, listener);
        router.publish(Channel::WorkerMessage, text("late"));

        assert_eq!(*seen.lock(), vec!["late"]);
    }

    #[test]
    fn unsubscribe_stops_delivery_and_is_idempotent() {
        let router = Router::new();
        let (seen, listener) = recorder();
        let sub = router.subscribe(Channel::WorkerMessage, listener);

        router.publish(Channel::WorkerMessage, text("before"));
        sub.unsubscribe();
        sub.unsubscribe();
        router.publish(Channel::WorkerMessage, text("after"));

        assert_eq!(*seen.lock(), vec!["before"]);
        assert_eq!(router.listener_count(Channel::WorkerMessage), 0);
        assert!(!router.unsubscribe(Channel::WorkerMessage, sub.id()));
    }

    #[test]
    fn explicit_unsubscribe_removes_only_that_listener() {
        let router = Router::new();
        let (first, l1) = recorder();
        let (second, l2) = recorder();
        let s1 = router.subscribe(Channel::WorkerMessage, l1);
        let _s2 = router.subscribe(Channel::WorkerMessage, l2);

        assert!(router.unsubscribe(Channel::WorkerMessage, s1.id()));
        router.publish(Channel::WorkerMessage, text("only-second"));

        assert!(first.lock().is_empty());
        assert_eq!(*second.lock(), vec!["only-second"]);
        // The disposer is now a no-op.
        drop(s1);
        assert_eq!(router.listener_count(Channel::WorkerMessage), 1);
    }

    #[test]
    fn dropping_the_disposer_unsubscribes() {
        let router = Router::new();
        let (seen, listener) = recorder();
        {
            let _sub = router.subscribe(Channel::WorkerExited, listener);
            assert_eq!(router.listener_count(Channel::WorkerExited), 1);
        }
        router.publish(Channel::WorkerExited, text("gone"));
        assert!(seen.lock().is_empty());
        assert_eq!(router.listener_count(Channel::WorkerExited), 0);
    }

    #[test]
    fn listener_can_unsubscribe_itself() {
        let router = Router::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicU64::new(0));

        let (slot_in, hits_in) = (slot.clone(), hits.clone());
        let sub = router.subscribe(Channel::WorkerMessage, move |_| {
            hits_in.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = slot_in.lock().take() {
                sub.unsubscribe();
            }
        });
        *slot.lock() = Some(sub);

        router.publish(Channel::WorkerMessage, text("one"));
        router.publish(Channel::WorkerMessage, text("two"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_waits_for_in_flight_delivery() {
        let router = Router::new();
        let (entered_tx, entered_rx) = mpsc::channel();
        let finished = Arc::new(AtomicBool::new(false));

        let finished_in = finished.clone();
        let sub = router.subscribe(Channel::WorkerMessage, move |_| {
            let _ = entered_tx.send(());
            thread::sleep(Duration::from_millis(100));
            finished_in.store(true, Ordering::SeqCst);
        });

        let publisher = router.clone();
        let handle = thread::spawn(move || {
            publisher.publish(Channel::WorkerMessage, text("slow"));
        });

        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("listener never ran");
        sub.unsubscribe();
        assert!(finished.load(Ordering::SeqCst));
        handle.join().unwrap();
    }

    #[test]
    fn subscription_outliving_router_is_harmless() {
        let router = Router::new();
        let sub = router.subscribe(Channel::HostReady, |_| {});
        drop(router);
        sub.unsubscribe();
    }

    #[test]
    fn listener_knows_its_own_id() {
        let router = Router::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = router.subscribe_with(Channel::WorkerMessage, move |id| {
            move |payload: &Payload| {
                sink.lock().push(format!("{}:{}", id.0, payload.as_text().unwrap_or_default()));
            }
        });

        router.publish(Channel::WorkerMessage, text("a"));
        assert_eq!(*seen.lock(), vec![format!("{}:a", sub.id().0)]);
    }
}
