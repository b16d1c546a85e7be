//! Fluent chain assembly.
//!
//! A [`Flo`] is a head [`Source`] plus the tail publisher of the last stage
//! added. Every operator subscribes a new stage to the current tail and
//! returns a builder whose tail is that stage; the head never changes, so
//! anything pushed into it drives the whole chain.
//!
//! ```
//! use streamgate::reactive::{Flo, collectors};
//!
//! # #[tokio::main] async fn main() {
//! let total = Flo::from_iter(1..=4)
//!     .map(|x: i32| x * x)
//!     .filter(|x| x % 2 == 0)
//!     .collect(collectors::summing())
//!     .subscribe()
//!     .wait()
//!     .await
//!     .unwrap();
//! assert_eq!(total, Some(20));
//! # }
//! ```
use std::sync::Arc;

use super::{
    Collector, CollectorProcessor, Emitter, FlowError, LastValueSink, Parallel, ParallelOptions,
    Processor, Publisher, Source, Subscriber, Subscription, SubscriptionHandle,
    processors::{
        CompletionHook, DropUntil, Filter, KeepWhile, Limit, Mapper, Observer, Partition,
        Recover, Skip,
    },
};

pub struct Flo<I, O> {
    head: Arc<Source<I>>,
    tail: Arc<dyn Publisher<O>>,
}

impl<T: Send + 'static> Flo<T, T> {
    /// Empty chain fed by hand.
    pub fn new() -> Self {
        let head = Source::new();
        Self {
            tail: head.clone(),
            head,
        }
    }

    /// Chain that emits one item and completes.
    pub fn just(item: T) -> Self {
        let flo = Self::new();
        flo.head.emit(item);
        flo.head.done();
        flo
    }

    /// Chain that emits every item of `items` and completes.
    #[allow(clippy::should_implement_trait)]
    pub fn from_iter(items: impl IntoIterator<Item = T>) -> Self {
        let flo = Self::new();
        for item in items {
            flo.head.emit(item);
        }
        flo.head.done();
        flo
    }

    /// Chain fed by another publisher; downstream demand is forwarded to it.
    pub fn from_publisher(publisher: Arc<dyn Publisher<T>>) -> Self {
        let flo = Self::new();
        publisher.subscribe(flo.head.clone());
        flo
    }
}

impl<T: Send + 'static> Default for Flo<T, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Send + 'static, O: Send + 'static> Flo<I, O> {
    fn then<N, P>(self, stage: Arc<P>) -> Flo<I, N>
    where
        N: Send + 'static,
        P: Processor<O, N> + 'static,
    {
        self.tail.subscribe(stage.clone());
        Flo {
            head: self.head,
            tail: stage,
        }
    }

    /// Append an opaque processor, e.g. another chain packaged with
    /// [`Flo::into_processor`].
    pub fn via<N, P>(self, stage: Arc<P>) -> Flo<I, N>
    where
        N: Send + 'static,
        P: Processor<O, N> + 'static,
    {
        self.then(stage)
    }

    pub fn map<N: Send + 'static>(self, f: impl Fn(O) -> N + Send + Sync + 'static) -> Flo<I, N> {
        self.then(Arc::new(Mapper::new(f)))
    }

    /// Map with a fallible function; an `Err` becomes the chain's error.
    pub fn try_map<N: Send + 'static>(
        self,
        f: impl Fn(O) -> Result<N, FlowError> + Send + Sync + 'static,
    ) -> Flo<I, N> {
        self.then(Arc::new(Mapper::try_new(f)))
    }

    pub fn filter(self, predicate: impl Fn(&O) -> bool + Send + Sync + 'static) -> Flo<I, O> {
        self.then(Arc::new(Filter::new(predicate)))
    }

    pub fn observe(self, observer: impl Fn(&O) + Send + Sync + 'static) -> Flo<I, O> {
        self.then(Arc::new(Observer::new(observer)))
    }

    /// Run `hook` once when the chain completes normally.
    pub fn on_complete(self, hook: impl FnOnce() + Send + 'static) -> Flo<I, O> {
        self.then(Arc::new(CompletionHook::new(move || {
            hook();
            Ok(())
        })))
    }

    pub fn skip(self, count: u64) -> Flo<I, O> {
        self.then(Arc::new(Skip::new(count)))
    }

    pub fn limit(self, limit: u64) -> Flo<I, O> {
        self.then(Arc::new(Limit::new(limit)))
    }

    pub fn keep_while(
        self,
        predicate: impl Fn(&O) -> bool + Send + Sync + 'static,
        include_last: bool,
    ) -> Flo<I, O> {
        self.then(Arc::new(KeepWhile::new(predicate, include_last)))
    }

    pub fn drop_until(
        self,
        predicate: impl Fn(&O) -> bool + Send + Sync + 'static,
        include_trigger: bool,
    ) -> Flo<I, O> {
        self.then(Arc::new(DropUntil::new(predicate, include_trigger)))
    }

    pub fn collect<C>(self, collector: C) -> Flo<I, C::Output>
    where
        C: Collector<O> + 'static,
        C::Output: Send + 'static,
    {
        self.then(Arc::new(CollectorProcessor::new(collector)))
    }

    pub fn recover(
        self,
        recover: impl Fn(FlowError) -> Result<O, FlowError> + Send + Sync + 'static,
    ) -> Flo<I, O> {
        self.then(Arc::new(Recover::new(recover)))
    }

    pub fn partition(self, size: usize) -> Flo<I, Vec<O>> {
        self.then(Arc::new(Partition::new(size)))
    }

    /// Deliver the rest of the chain on a worker pool.
    pub fn parallel(self, options: ParallelOptions) -> Flo<I, O> {
        self.then(Arc::new(Parallel::new(options)))
    }

    pub fn emitter(&self) -> Emitter<I> {
        Emitter::new(self.head.clone())
    }

    /// Package the chain as one stage: its head subscribes upstream, its
    /// tail publishes downstream.
    pub fn into_processor(self) -> Arc<ChainProcessor<I, O>> {
        Arc::new(ChainProcessor {
            head: self.head,
            tail: self.tail,
        })
    }

    pub fn into_publisher(self) -> Arc<dyn Publisher<O>> {
        self.tail
    }

    /// Attach a [`LastValueSink`] and return the handle that resolves it.
    pub fn subscribe(self) -> SubscriptionHandle<I, O> {
        let (sink, outcome) = LastValueSink::new();
        self.tail.subscribe(sink.clone());
        SubscriptionHandle::new(self.head, sink, outcome)
    }

    /// Attach a custom terminal subscriber.
    pub fn subscribe_with(self, subscriber: Arc<dyn Subscriber<O>>) -> Emitter<I> {
        self.tail.subscribe(subscriber);
        Emitter::new(self.head)
    }
}

/// A whole chain viewed as a single stage.
pub struct ChainProcessor<I, O> {
    head: Arc<Source<I>>,
    tail: Arc<dyn Publisher<O>>,
}

impl<I: Send + 'static, O: Send + 'static> Subscriber<I> for ChainProcessor<I, O> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.head.on_subscribe(subscription);
    }

    fn on_next(&self, item: I) {
        self.head.on_next(item);
    }

    fn on_error(&self, error: FlowError) {
        self.head.on_error(error);
    }

    fn on_complete(&self) {
        self.head.on_complete();
    }
}

impl<I: Send + 'static, O: Send + 'static> Publisher<O> for ChainProcessor<I, O> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<O>>) {
        self.tail.subscribe(subscriber);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::reactive::collectors;

    #[tokio::test]
    async fn test_head_drives_whole_chain() {
        let flo: Flo<String, usize> = Flo::new().map(|s: String| s.len());
        let handle = flo.subscribe();
        handle.emit("one".to_string());
        handle.emit("three".to_string());
        handle.done();
        assert_eq!(handle.wait().await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_stitched_processor() {
        let inner = Flo::<i32, i32>::new()
            .map(|x| x + 1)
            .filter(|x| x % 2 == 0)
            .into_processor();
        let result = Flo::from_iter(1..=6)
            .via(inner)
            .collect(collectors::to_vec())
            .subscribe()
            .wait()
            .await
            .unwrap();
        assert_eq!(result, Some(vec![2, 4, 6]));
    }

    #[tokio::test]
    async fn test_from_publisher_forwards_demand() {
        let upstream = Flo::from_iter(vec![1u8, 2, 3]).into_publisher();
        let result = Flo::from_publisher(upstream)
            .collect(collectors::counting())
            .subscribe()
            .wait()
            .await
            .unwrap();
        assert_eq!(result, Some(3));
    }

    #[tokio::test]
    async fn test_observe_sees_every_item() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let last = Flo::from_iter(0..10)
            .observe(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .subscribe()
            .wait()
            .await
            .unwrap();
        assert_eq!(last, Some(9));
        assert_eq!(seen.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_demand_bounds_emission() {
        struct Counting {
            subscription: Mutex<Option<Arc<dyn Subscription>>>,
            received: AtomicUsize,
        }
        impl Subscriber<u32> for Counting {
            fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
                *self.subscription.lock() = Some(subscription);
            }
            fn on_next(&self, _item: u32) {
                self.received.fetch_add(1, Ordering::SeqCst);
            }
            fn on_error(&self, _error: FlowError) {}
            fn on_complete(&self) {}
        }

        let consumer = Arc::new(Counting {
            subscription: Mutex::new(None),
            received: AtomicUsize::new(0),
        });
        let emitter = Flo::<u32, u32>::new()
            .map(|x| x * 2)
            .subscribe_with(consumer.clone());
        for i in 0..20 {
            emitter.emit(i);
        }
        assert_eq!(consumer.received.load(Ordering::SeqCst), 0);

        let subscription = consumer.subscription.lock().clone().unwrap();
        subscription.request(3).unwrap();
        assert_eq!(consumer.received.load(Ordering::SeqCst), 3);
        subscription.request(4).unwrap();
        assert_eq!(consumer.received.load(Ordering::SeqCst), 7);
    }
}
