//! Fold a stream into a single value.
//!
//! A [`Collector`] describes the fold (`supply`, `accumulate`, `combine`,
//! `finish`); [`CollectorProcessor`] runs it. Collectors that declare
//! themselves concurrent accumulate into per-thread partials that are merged
//! with `combine` at completion, the rest go through a single lock.
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    marker::PhantomData,
    sync::Arc,
};

use parking_lot::Mutex;

use super::{
    FlowError, Publisher, Subscriber, Subscription, UNBOUNDED,
    error::guard,
    link::{CancelOnly, Link},
};

pub trait Collector<T>: Send + Sync {
    type Acc: Send;
    type Output;

    /// Fresh, empty accumulator.
    fn supply(&self) -> Self::Acc;

    fn accumulate(&self, acc: &mut Self::Acc, item: T);

    /// Merge two partial accumulators.
    fn combine(&self, left: Self::Acc, right: Self::Acc) -> Self::Acc;

    fn finish(&self, acc: Self::Acc) -> Self::Output;

    /// Whether `accumulate` may run on several partial accumulators at once.
    fn is_concurrent(&self) -> bool {
        false
    }
}

type Supplier<A> = Box<dyn Fn() -> A + Send + Sync>;
type Accumulator<T, A> = Box<dyn Fn(&mut A, T) + Send + Sync>;
type Combiner<A> = Box<dyn Fn(A, A) -> A + Send + Sync>;
type Finisher<A, R> = Box<dyn Fn(A) -> R + Send + Sync>;

/// Collector assembled from closures.
pub struct FnCollector<T, A, R> {
    supplier: Supplier<A>,
    accumulator: Accumulator<T, A>,
    combiner: Combiner<A>,
    finisher: Finisher<A, R>,
    concurrent: bool,
    _item: PhantomData<fn(T)>,
}

impl<T, A: Send + 'static> FnCollector<T, A, A> {
    /// Collector whose accumulator is its result.
    pub fn identity(
        supplier: impl Fn() -> A + Send + Sync + 'static,
        accumulator: impl Fn(&mut A, T) + Send + Sync + 'static,
        combiner: impl Fn(A, A) -> A + Send + Sync + 'static,
    ) -> Self {
        Self::new(supplier, accumulator, combiner, |acc| acc)
    }
}

impl<T, A: Send + 'static, R> FnCollector<T, A, R> {
    pub fn new(
        supplier: impl Fn() -> A + Send + Sync + 'static,
        accumulator: impl Fn(&mut A, T) + Send + Sync + 'static,
        combiner: impl Fn(A, A) -> A + Send + Sync + 'static,
        finisher: impl Fn(A) -> R + Send + Sync + 'static,
    ) -> Self {
        Self {
            supplier: Box::new(supplier),
            accumulator: Box::new(accumulator),
            combiner: Box::new(combiner),
            finisher: Box::new(finisher),
            concurrent: false,
            _item: PhantomData,
        }
    }

    /// Mark the accumulator as safe to fill from several threads at once.
    pub fn concurrent(mut self) -> Self {
        self.concurrent = true;
        self
    }
}

impl<T, A: Send + 'static, R> Collector<T> for FnCollector<T, A, R> {
    type Acc = A;
    type Output = R;

    fn supply(&self) -> A {
        (self.supplier)()
    }

    fn accumulate(&self, acc: &mut A, item: T) {
        (self.accumulator)(acc, item)
    }

    fn combine(&self, left: A, right: A) -> A {
        (self.combiner)(left, right)
    }

    fn finish(&self, acc: A) -> R {
        (self.finisher)(acc)
    }

    fn is_concurrent(&self) -> bool {
        self.concurrent
    }
}

/// Ready-made collectors.
pub mod collectors {
    use std::{collections::HashMap, fmt::Display, hash::Hash, ops::Add};

    use super::FnCollector;

    pub fn to_vec<T: Send + 'static>() -> FnCollector<T, Vec<T>, Vec<T>> {
        FnCollector::identity(Vec::new, |acc, item| acc.push(item), |mut left, right| {
            left.extend(right);
            left
        })
    }

    pub fn summing<T>() -> FnCollector<T, T, T>
    where
        T: Add<Output = T> + Default + Copy + Send + 'static,
    {
        FnCollector::identity(T::default, |acc, item| *acc = *acc + item, |l, r| l + r).concurrent()
    }

    pub fn counting<T>() -> FnCollector<T, u64, u64> {
        FnCollector::identity(|| 0, |acc, _| *acc += 1, |l, r| l + r).concurrent()
    }

    pub fn joining<T: Display>(separator: impl Into<String>) -> FnCollector<T, Vec<String>, String> {
        let separator = separator.into();
        FnCollector::new(
            Vec::new,
            |acc: &mut Vec<String>, item: T| acc.push(item.to_string()),
            |mut left, right| {
                left.extend(right);
                left
            },
            move |parts| parts.join(&separator),
        )
    }

    /// Fold with an identity element and an associative operator.
    pub fn reducing<T>(
        identity: T,
        op: impl Fn(T, T) -> T + Send + Sync + Clone + 'static,
    ) -> FnCollector<T, Option<T>, T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let fold = op.clone();
        let merge = op;
        FnCollector::new(
            || None,
            move |acc: &mut Option<T>, item: T| {
                *acc = Some(match acc.take() {
                    Some(current) => fold(current, item),
                    None => item,
                });
            },
            move |left, right| match (left, right) {
                (Some(l), Some(r)) => Some(merge(l, r)),
                (l, None) => l,
                (None, r) => r,
            },
            move |acc| acc.unwrap_or_else(|| identity.clone()),
        )
    }

    pub fn grouping_by<T, K>(
        key: impl Fn(&T) -> K + Send + Sync + 'static,
    ) -> FnCollector<T, HashMap<K, Vec<T>>, HashMap<K, Vec<T>>>
    where
        T: Send + 'static,
        K: Eq + Hash + Send + 'static,
    {
        FnCollector::identity(
            HashMap::new,
            move |acc: &mut HashMap<K, Vec<T>>, item: T| {
                acc.entry(key(&item)).or_default().push(item);
            },
            |mut left, right| {
                for (k, mut items) in right {
                    left.entry(k).or_default().append(&mut items);
                }
                left
            },
        )
    }
}

enum Accumulation<A> {
    Single(Mutex<Option<A>>),
    Striped(Vec<Mutex<Option<A>>>),
}

/// Stage that runs a [`Collector`] and emits its result once.
///
/// Upstream demand is unbounded; downstream receives exactly one item on
/// upstream completion, then completion.
pub struct CollectorProcessor<T, C: Collector<T>> {
    collector: C,
    accumulation: Accumulation<C::Acc>,
    link: Link<C::Output>,
    _item: PhantomData<fn(T)>,
}

impl<T, C> CollectorProcessor<T, C>
where
    T: Send + 'static,
    C: Collector<T> + 'static,
    C::Output: Send + 'static,
{
    pub fn new(collector: C) -> Self {
        let accumulation = if collector.is_concurrent() {
            let stripes = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .max(1);
            Accumulation::Striped((0..stripes).map(|_| Mutex::new(None)).collect())
        } else {
            Accumulation::Single(Mutex::new(None))
        };
        Self {
            collector,
            accumulation,
            link: Link::new(),
            _item: PhantomData,
        }
    }

    fn slot(&self) -> &Mutex<Option<C::Acc>> {
        match &self.accumulation {
            Accumulation::Single(slot) => slot,
            Accumulation::Striped(stripes) => {
                let mut hasher = DefaultHasher::new();
                std::thread::current().id().hash(&mut hasher);
                let index = (hasher.finish() as usize) % stripes.len();
                &stripes[index]
            }
        }
    }

    fn take_result(&self) -> C::Acc {
        let partials: Vec<C::Acc> = match &self.accumulation {
            Accumulation::Single(slot) => slot.lock().take().into_iter().collect(),
            Accumulation::Striped(stripes) => {
                stripes.iter().filter_map(|slot| slot.lock().take()).collect()
            }
        };
        let mut partials = partials.into_iter();
        match partials.next() {
            Some(first) => partials.fold(first, |acc, next| self.collector.combine(acc, next)),
            None => self.collector.supply(),
        }
    }
}

impl<T, C> Subscriber<T> for CollectorProcessor<T, C>
where
    T: Send + 'static,
    C: Collector<T> + 'static,
    C::Output: Send + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let offer = Arc::new(CancelOnly(subscription.clone()));
        if self.link.set_upstream(subscription, offer) {
            self.link.request_upstream(UNBOUNDED);
        }
    }

    fn on_next(&self, item: T) {
        if self.link.is_done() {
            return;
        }
        let outcome = guard(|| {
            let mut slot = self.slot().lock();
            let acc = slot.get_or_insert_with(|| self.collector.supply());
            self.collector.accumulate(acc, item);
            Ok(())
        });
        if let Err(error) = outcome {
            self.link.fail(error);
        }
    }

    fn on_error(&self, error: FlowError) {
        self.link.error(error);
    }

    fn on_complete(&self) {
        if self.link.is_done() {
            return;
        }
        match guard(|| Ok(self.collector.finish(self.take_result()))) {
            Ok(result) => {
                self.link.next(result);
                self.link.complete();
            }
            Err(error) => self.link.error(error),
        }
    }
}

impl<T, C> Publisher<C::Output> for CollectorProcessor<T, C>
where
    T: Send + 'static,
    C: Collector<T> + 'static,
    C::Output: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<C::Output>>) {
        self.link.attach(subscriber);
    }
}

#[cfg(test)]
mod tests {
    use super::{collectors::*, *};
    use crate::reactive::Flo;

    #[tokio::test]
    async fn test_sum_of_three_items() {
        let sum = Flo::from_iter(vec![1, 2, 3])
            .collect(summing::<i32>())
            .subscribe()
            .wait()
            .await
            .unwrap();
        assert_eq!(sum, Some(6));
    }

    #[tokio::test]
    async fn test_empty_input_yields_identity() {
        let flo: Flo<i64, i64> = Flo::new();
        let handle = flo.collect(summing::<i64>()).subscribe();
        handle.done();
        assert_eq!(handle.wait().await.unwrap(), Some(0));

        let flo: Flo<String, String> = Flo::new();
        let handle = flo.collect(to_vec()).subscribe();
        handle.done();
        assert_eq!(handle.wait().await.unwrap(), Some(Vec::<String>::new()));
    }

    #[tokio::test]
    async fn test_joining_and_counting() {
        let joined = Flo::from_iter(vec!["a", "b", "c"])
            .collect(joining(", "))
            .subscribe()
            .wait()
            .await
            .unwrap();
        assert_eq!(joined.as_deref(), Some("a, b, c"));

        let count = Flo::from_iter(0..42)
            .collect(counting())
            .subscribe()
            .wait()
            .await
            .unwrap();
        assert_eq!(count, Some(42));
    }

    #[tokio::test]
    async fn test_reducing_with_identity() {
        let max = Flo::from_iter(vec![3, 9, 4])
            .collect(reducing(i32::MIN, |a, b| a.max(b)))
            .subscribe()
            .wait()
            .await
            .unwrap();
        assert_eq!(max, Some(9));

        let flo: Flo<i32, i32> = Flo::new();
        let handle = flo.collect(reducing(7, |a, b| a + b)).subscribe();
        handle.done();
        assert_eq!(handle.wait().await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_grouping_by_key() {
        let groups = Flo::from_iter(1..=6)
            .collect(grouping_by(|x: &i32| x % 2 == 0))
            .subscribe()
            .wait()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(groups[&true], vec![2, 4, 6]);
        assert_eq!(groups[&false], vec![1, 3, 5]);
    }

    #[test]
    fn test_concurrent_partials_are_combined() {
        let processor = CollectorProcessor::new(counting::<u8>());
        let (sink, mut rx) = crate::reactive::LastValueSink::new();
        processor.subscribe(sink);
        processor.on_subscribe(Arc::new(crate::reactive::link::Detached));

        let processor = Arc::new(processor);
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let processor = processor.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        processor.on_next(1);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        processor.on_complete();

        assert_eq!(rx.try_recv().unwrap().unwrap(), Some(1000));
    }
}
