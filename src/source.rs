use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::{Signal, SignalKind};

pub type SignalHandler = Box<dyn FnMut(&mut Signal)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// Platform-wide signal subscriptions (visibility, focus, clipboard,
/// context menu, fullscreen, keyboard).
pub trait EventSource {
    fn subscribe(&mut self, kind: SignalKind, handler: SignalHandler) -> SubscriptionId;

    /// Returns whether `id` was still subscribed.
    fn unsubscribe(&mut self, id: SubscriptionId) -> bool;
}

struct Subscription {
    kind: SignalKind,
    handler: Rc<RefCell<SignalHandler>>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
}

/// In-process dispatcher. The host (or a test) keeps a clone and feeds it
/// signals; the monitor holds another clone to subscribe.
#[derive(Clone, Default)]
pub struct LocalEventSource {
    registry: Rc<RefCell<Registry>>,
}

impl LocalEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `signal` to every handler subscribed to its kind, in
    /// subscription order, and hands it back so the caller can see whether
    /// the default action was prevented.
    pub fn dispatch(&self, mut signal: Signal) -> Signal {
        let handlers: Vec<Rc<RefCell<SignalHandler>>> = self
            .registry
            .borrow()
            .subscriptions
            .values()
            .filter(|sub| sub.kind == signal.kind())
            .map(|sub| sub.handler.clone())
            .collect();
        for handler in handlers {
            match handler.try_borrow_mut() {
                Ok(mut handler) => (*handler)(&mut signal),
                Err(_) => log::warn!("nested {:?} dispatch skipped a running handler", signal.kind()),
            }
        }
        signal
    }

    pub fn subscriber_count(&self, kind: SignalKind) -> usize {
        self.registry
            .borrow()
            .subscriptions
            .values()
            .filter(|sub| sub.kind == kind)
            .count()
    }

    pub fn total_subscribers(&self) -> usize {
        self.registry.borrow().subscriptions.len()
    }
}

impl EventSource for LocalEventSource {
    fn subscribe(&mut self, kind: SignalKind, handler: SignalHandler) -> SubscriptionId {
        let mut registry = self.registry.borrow_mut();
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry.subscriptions.insert(
            id,
            Subscription {
                kind,
                handler: Rc::new(RefCell::new(handler)),
            },
        );
        id
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.registry.borrow_mut().subscriptions.remove(&id).is_some()
    }
}
