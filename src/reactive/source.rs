//! Head stage of every chain.
//!
//! A [`Source`] buffers items pushed into it by hand (or by an upstream
//! publisher it subscribes to) and releases them only against downstream
//! demand. Once its subscription is no longer SUBSCRIBED, new emissions are
//! discarded with a debug log and `emit` reports `false`.
use std::{
    collections::VecDeque,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::debug;

use super::{
    DemandSubscription, FlowError, Publisher, Subscriber, Subscription, SubscriptionState,
    link::{Link, reject},
};

struct Queue<T> {
    items: VecDeque<T>,
    done: bool,
    error: Option<FlowError>,
}

pub struct Source<T> {
    queue: Mutex<Queue<T>>,
    demand: Arc<DemandSubscription>,
    link: Link<T>,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    wip: AtomicUsize,
}

impl<T: Send + 'static> Source<T> {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let demand = Arc::new(DemandSubscription::strict());

            let on_demand = weak.clone();
            demand.set_demand_hook(move |n| {
                if let Some(source) = on_demand.upgrade() {
                    source.forward_demand(n);
                    source.drain();
                }
            });

            let on_cancel = weak.clone();
            demand.on_state(SubscriptionState::Cancelled, move || {
                if let Some(source) = on_cancel.upgrade() {
                    source.cancelled();
                }
            });

            let link = Link::new();
            link.set_offer(demand.clone());

            Source {
                queue: Mutex::new(Queue {
                    items: VecDeque::new(),
                    done: false,
                    error: None,
                }),
                demand,
                link,
                upstream: Mutex::new(None),
                wip: AtomicUsize::new(0),
            }
        })
    }

    /// Push one item. Returns `false` if the source no longer accepts items.
    pub fn emit(&self, item: T) -> bool {
        let state = self.demand.state();
        if state.is_terminal() {
            debug!(%state, "emission after termination discarded");
            return false;
        }
        {
            let mut queue = self.queue.lock();
            if queue.done || queue.error.is_some() {
                debug!("emission after done() discarded");
                return false;
            }
            queue.items.push_back(item);
        }
        self.drain();
        true
    }

    /// Signal completion once every queued item has been delivered.
    pub fn done(&self) {
        self.queue.lock().done = true;
        self.drain();
    }

    /// Signal failure. Queued items are discarded.
    pub fn error(&self, error: FlowError) {
        {
            let mut queue = self.queue.lock();
            if queue.done || queue.error.is_some() {
                debug!(%error, "error after termination discarded");
                return;
            }
            queue.error = Some(error);
        }
        self.drain();
    }

    /// Cancel the head of the chain.
    pub fn cancel(&self) {
        self.demand.cancel();
    }

    pub fn state(&self) -> SubscriptionState {
        self.demand.state()
    }

    /// Items accepted but not yet delivered.
    pub fn pending(&self) -> usize {
        self.queue.lock().items.len()
    }

    fn forward_demand(&self, n: u64) {
        let upstream = self.upstream.lock().clone();
        if let Some(upstream) = upstream {
            if let Err(error) = upstream.request(n) {
                debug!(%error, "upstream publisher refused demand");
            }
        }
    }

    fn cancelled(&self) {
        self.queue.lock().items.clear();
        if let Some(upstream) = self.upstream.lock().take() {
            upstream.cancel();
        }
        // courtesy completion so terminal subscribers resolve
        self.link.complete();
    }

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            self.drain_once();
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                break;
            }
        }
    }

    fn drain_once(&self) {
        loop {
            match self.demand.state() {
                SubscriptionState::Subscribed => {}
                SubscriptionState::Unsubscribed => return,
                _ => {
                    self.queue.lock().items.clear();
                    return;
                }
            }

            let mut queue = self.queue.lock();
            if let Some(error) = queue.error.take() {
                queue.items.clear();
                drop(queue);
                if self.demand.fail() {
                    self.link.error(error);
                }
                return;
            }
            if queue.items.is_empty() {
                let done = queue.done;
                drop(queue);
                if done && self.demand.complete() {
                    self.link.complete();
                }
                return;
            }
            if self.demand.get_and_decrement_requested() == 0 {
                return;
            }
            let Some(item) = queue.items.pop_front() else {
                return;
            };
            drop(queue);
            self.link.next(item);
        }
    }
}

impl<T: Send + 'static> Publisher<T> for Source<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        if let Err(error) = self.demand.subscribe() {
            reject(subscriber.as_ref(), error);
            return;
        }
        self.link.attach(subscriber);
        self.drain();
    }
}

impl<T: Send + 'static> Subscriber<T> for Source<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        {
            let mut upstream = self.upstream.lock();
            if upstream.is_some() {
                drop(upstream);
                subscription.cancel();
                return;
            }
            *upstream = Some(subscription.clone());
        }
        if self.demand.state().is_terminal() {
            subscription.cancel();
            return;
        }
        let outstanding = self.demand.requested();
        if outstanding > 0 {
            if let Err(error) = subscription.request(outstanding) {
                debug!(%error, "upstream publisher refused demand");
            }
        }
    }

    fn on_next(&self, item: T) {
        self.emit(item);
    }

    fn on_error(&self, error: FlowError) {
        Source::error(self, error);
    }

    fn on_complete(&self) {
        self.done();
    }
}

/// Cloneable handle that pushes into the head of a chain.
pub struct Emitter<T> {
    source: Arc<Source<T>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
        }
    }
}

impl<T: Send + 'static> Emitter<T> {
    pub(crate) fn new(source: Arc<Source<T>>) -> Self {
        Self { source }
    }

    pub fn emit(&self, item: T) -> bool {
        self.source.emit(item)
    }

    pub fn done(&self) {
        self.source.done();
    }

    pub fn error(&self, error: FlowError) {
        self.source.error(error);
    }

    pub fn cancel(&self) {
        self.source.cancel();
    }

    pub fn is_open(&self) -> bool {
        !self.source.state().is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    struct Manual {
        subscription: Mutex<Option<Arc<dyn Subscription>>>,
        items: Mutex<Vec<u32>>,
        completed: AtomicBool,
        error: Mutex<Option<FlowError>>,
    }

    impl Manual {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                subscription: Mutex::new(None),
                items: Mutex::new(Vec::new()),
                completed: AtomicBool::new(false),
                error: Mutex::new(None),
            })
        }

        fn request(&self, n: u64) {
            let subscription = self.subscription.lock().clone().unwrap();
            subscription.request(n).unwrap();
        }

        fn cancel(&self) {
            let subscription = self.subscription.lock().clone().unwrap();
            subscription.cancel();
        }
    }

    impl Subscriber<u32> for Manual {
        fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
            *self.subscription.lock() = Some(subscription);
        }
        fn on_next(&self, item: u32) {
            self.items.lock().push(item);
        }
        fn on_error(&self, error: FlowError) {
            *self.error.lock() = Some(error);
        }
        fn on_complete(&self) {
            self.completed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_items_released_only_against_demand() {
        let source = Source::new();
        let sink = Manual::new();
        source.subscribe(sink.clone());
        for i in 0..5 {
            assert!(source.emit(i));
        }
        assert!(sink.items.lock().is_empty());

        sink.request(2);
        assert_eq!(*sink.items.lock(), vec![0, 1]);
        sink.request(10);
        assert_eq!(*sink.items.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_completion_waits_for_queue() {
        let source = Source::new();
        let sink = Manual::new();
        source.subscribe(sink.clone());
        source.emit(1);
        source.done();
        assert!(!sink.completed.load(Ordering::SeqCst));
        sink.request(1);
        assert!(sink.completed.load(Ordering::SeqCst));
        assert!(!source.emit(2));
    }

    #[test]
    fn test_emission_after_cancel_discarded() {
        let source = Source::new();
        let sink = Manual::new();
        source.subscribe(sink.clone());
        sink.request(1);
        sink.cancel();
        assert!(!source.emit(7));
        assert!(sink.items.lock().is_empty());
        assert!(sink.completed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_error_skips_queued_items() {
        let source = Source::new();
        let sink = Manual::new();
        source.subscribe(sink.clone());
        source.emit(1);
        source.error(FlowError::InvalidArgument("bad".into()));
        assert!(sink.items.lock().is_empty());
        assert!(matches!(
            *sink.error.lock(),
            Some(FlowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_second_subscriber_rejected() {
        let source: Arc<Source<u32>> = Source::new();
        source.subscribe(Manual::new());
        let late = Manual::new();
        source.subscribe(late.clone());
        assert!(matches!(
            *late.error.lock(),
            Some(FlowError::AlreadySubscribed)
        ));
    }
}
