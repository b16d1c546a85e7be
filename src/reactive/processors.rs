//! Single-purpose stages.
//!
//! Each stage forwards every signal unchanged except the one it exists to
//! alter. User closures run inside a panic guard; a failure while handling
//! `on_next` becomes an `on_error` downstream and cancels upstream.
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::Mutex;

use super::{
    FlowError, Publisher, Subscriber, Subscription,
    error::guard,
    link::Link,
};

macro_rules! publish_via_link {
    ($stage:ident < $($param:ident),+ >, $out:ty) => {
        impl<$($param: Send + 'static),+> Publisher<$out> for $stage<$($param),+> {
            fn subscribe(&self, subscriber: Arc<dyn Subscriber<$out>>) {
                self.link.attach(subscriber);
            }
        }
    };
}

/// Forwards every signal unchanged.
pub struct Identity<T> {
    link: Link<T>,
}

impl<T: Send + 'static> Identity<T> {
    pub fn new() -> Self {
        Self { link: Link::new() }
    }
}

impl<T: Send + 'static> Default for Identity<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Subscriber<T> for Identity<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.link.set_upstream(subscription.clone(), subscription);
    }

    fn on_next(&self, item: T) {
        self.link.next(item);
    }

    fn on_error(&self, error: FlowError) {
        self.link.error(error);
    }

    fn on_complete(&self) {
        self.link.complete();
    }
}

publish_via_link!(Identity<T>, T);

type MapFn<I, O> = Box<dyn Fn(I) -> Result<O, FlowError> + Send + Sync>;

/// Emits `f(item)` for every item.
pub struct Mapper<I, O> {
    f: MapFn<I, O>,
    link: Link<O>,
}

impl<I: Send + 'static, O: Send + 'static> Mapper<I, O> {
    pub fn new(f: impl Fn(I) -> O + Send + Sync + 'static) -> Self {
        Self::try_new(move |item| Ok(f(item)))
    }

    pub fn try_new(f: impl Fn(I) -> Result<O, FlowError> + Send + Sync + 'static) -> Self {
        Self {
            f: Box::new(f),
            link: Link::new(),
        }
    }
}

impl<I: Send + 'static, O: Send + 'static> Subscriber<I> for Mapper<I, O> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.link.set_upstream(subscription.clone(), subscription);
    }

    fn on_next(&self, item: I) {
        if self.link.is_done() {
            return;
        }
        match guard(|| (self.f)(item)) {
            Ok(mapped) => {
                self.link.next(mapped);
            }
            Err(error) => self.link.fail(error),
        }
    }

    fn on_error(&self, error: FlowError) {
        self.link.error(error);
    }

    fn on_complete(&self) {
        self.link.complete();
    }
}

publish_via_link!(Mapper<I, O>, O);

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Forwards items matching a predicate; each rejected item is replaced by a
/// fresh unit of upstream demand.
pub struct Filter<T> {
    predicate: Predicate<T>,
    link: Link<T>,
}

impl<T: Send + 'static> Filter<T> {
    pub fn new(predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Box::new(predicate),
            link: Link::new(),
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for Filter<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.link.set_upstream(subscription.clone(), subscription);
    }

    fn on_next(&self, item: T) {
        if self.link.is_done() {
            return;
        }
        match guard(|| Ok((self.predicate)(&item))) {
            Ok(true) => {
                self.link.next(item);
            }
            Ok(false) => self.link.request_upstream(1),
            Err(error) => self.link.fail(error),
        }
    }

    fn on_error(&self, error: FlowError) {
        self.link.error(error);
    }

    fn on_complete(&self) {
        self.link.complete();
    }
}

publish_via_link!(Filter<T>, T);

/// Forwards items while the predicate holds. The first failing item ends the
/// stream: it is optionally forwarded, downstream completes and upstream is
/// cancelled.
pub struct KeepWhile<T> {
    predicate: Predicate<T>,
    include_last: bool,
    link: Link<T>,
}

impl<T: Send + 'static> KeepWhile<T> {
    pub fn new(predicate: impl Fn(&T) -> bool + Send + Sync + 'static, include_last: bool) -> Self {
        Self {
            predicate: Box::new(predicate),
            include_last,
            link: Link::new(),
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for KeepWhile<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.link.set_upstream(subscription.clone(), subscription);
    }

    fn on_next(&self, item: T) {
        if self.link.is_done() {
            return;
        }
        match guard(|| Ok((self.predicate)(&item))) {
            Ok(true) => {
                self.link.next(item);
            }
            Ok(false) => {
                if self.include_last {
                    self.link.next(item);
                }
                self.link.complete();
                self.link.cancel_upstream();
            }
            Err(error) => self.link.fail(error),
        }
    }

    fn on_error(&self, error: FlowError) {
        self.link.error(error);
    }

    fn on_complete(&self) {
        self.link.complete();
    }
}

publish_via_link!(KeepWhile<T>, T);

/// Drops items until the predicate first holds, then forwards everything.
pub struct DropUntil<T> {
    predicate: Predicate<T>,
    include_trigger: bool,
    open: AtomicBool,
    link: Link<T>,
}

impl<T: Send + 'static> DropUntil<T> {
    pub fn new(
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
        include_trigger: bool,
    ) -> Self {
        Self {
            predicate: Box::new(predicate),
            include_trigger,
            open: AtomicBool::new(false),
            link: Link::new(),
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for DropUntil<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.link.set_upstream(subscription.clone(), subscription);
    }

    fn on_next(&self, item: T) {
        if self.link.is_done() {
            return;
        }
        if self.open.load(Ordering::Acquire) {
            self.link.next(item);
            return;
        }
        match guard(|| Ok((self.predicate)(&item))) {
            Ok(true) => {
                self.open.store(true, Ordering::Release);
                if self.include_trigger {
                    self.link.next(item);
                } else {
                    self.link.request_upstream(1);
                }
            }
            Ok(false) => self.link.request_upstream(1),
            Err(error) => self.link.fail(error),
        }
    }

    fn on_error(&self, error: FlowError) {
        self.link.error(error);
    }

    fn on_complete(&self) {
        self.link.complete();
    }
}

publish_via_link!(DropUntil<T>, T);

/// Calls a side-effecting closure on every item, then forwards it.
pub struct Observer<T> {
    observer: Box<dyn Fn(&T) + Send + Sync>,
    link: Link<T>,
}

impl<T: Send + 'static> Observer<T> {
    pub fn new(observer: impl Fn(&T) + Send + Sync + 'static) -> Self {
        Self {
            observer: Box::new(observer),
            link: Link::new(),
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for Observer<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.link.set_upstream(subscription.clone(), subscription);
    }

    fn on_next(&self, item: T) {
        if self.link.is_done() {
            return;
        }
        match guard(|| {
            (self.observer)(&item);
            Ok(())
        }) {
            Ok(()) => {
                self.link.next(item);
            }
            Err(error) => self.link.fail(error),
        }
    }

    fn on_error(&self, error: FlowError) {
        self.link.error(error);
    }

    fn on_complete(&self) {
        self.link.complete();
    }
}

publish_via_link!(Observer<T>, T);

/// Runs a hook once when upstream completes, before forwarding completion.
/// A failing hook turns completion into an error.
pub struct CompletionHook<T> {
    hook: Mutex<Option<Box<dyn FnOnce() -> Result<(), FlowError> + Send>>>,
    link: Link<T>,
}

impl<T: Send + 'static> CompletionHook<T> {
    pub fn new(hook: impl FnOnce() -> Result<(), FlowError> + Send + 'static) -> Self {
        Self {
            hook: Mutex::new(Some(Box::new(hook))),
            link: Link::new(),
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for CompletionHook<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.link.set_upstream(subscription.clone(), subscription);
    }

    fn on_next(&self, item: T) {
        self.link.next(item);
    }

    fn on_error(&self, error: FlowError) {
        self.link.error(error);
    }

    fn on_complete(&self) {
        let hook = self.hook.lock().take();
        let outcome = match hook {
            Some(hook) => guard(hook),
            None => Ok(()),
        };
        match outcome {
            Ok(()) => self.link.complete(),
            Err(error) => self.link.error(error),
        }
    }
}

publish_via_link!(CompletionHook<T>, T);

/// Discards the first `count` items.
pub struct Skip<T> {
    remaining: AtomicU64,
    link: Link<T>,
}

impl<T: Send + 'static> Skip<T> {
    pub fn new(count: u64) -> Self {
        Self {
            remaining: AtomicU64::new(count),
            link: Link::new(),
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for Skip<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.link.set_upstream(subscription.clone(), subscription);
    }

    fn on_next(&self, item: T) {
        let skipped = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if skipped {
            self.link.request_upstream(1);
        } else {
            self.link.next(item);
        }
    }

    fn on_error(&self, error: FlowError) {
        self.link.error(error);
    }

    fn on_complete(&self) {
        self.link.complete();
    }
}

publish_via_link!(Skip<T>, T);

/// Forwards at most `limit` items, then completes and cancels upstream.
pub struct Limit<T> {
    limit: u64,
    seen: AtomicU64,
    link: Link<T>,
}

impl<T: Send + 'static> Limit<T> {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            seen: AtomicU64::new(0),
            link: Link::new(),
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for Limit<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.link.set_upstream(subscription.clone(), subscription);
        if self.limit == 0 {
            self.link.complete();
            self.link.cancel_upstream();
        }
    }

    fn on_next(&self, item: T) {
        let position = self.seen.fetch_add(1, Ordering::AcqRel) + 1;
        if position > self.limit {
            return;
        }
        self.link.next(item);
        if position == self.limit {
            self.link.complete();
            self.link.cancel_upstream();
        }
    }

    fn on_error(&self, error: FlowError) {
        self.link.error(error);
    }

    fn on_complete(&self) {
        self.link.complete();
    }
}

publish_via_link!(Limit<T>, T);

type RecoverFn<T> = Box<dyn Fn(FlowError) -> Result<T, FlowError> + Send + Sync>;

/// Replaces an upstream error by a substitute item followed by completion.
///
/// If the recovery closure fails too, downstream receives
/// [`FlowError::RecoveryFailed`] carrying both errors.
pub struct Recover<T> {
    recover: RecoverFn<T>,
    link: Link<T>,
}

impl<T: Send + 'static> Recover<T> {
    pub fn new(recover: impl Fn(FlowError) -> Result<T, FlowError> + Send + Sync + 'static) -> Self {
        Self {
            recover: Box::new(recover),
            link: Link::new(),
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for Recover<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.link.set_upstream(subscription.clone(), subscription);
    }

    fn on_next(&self, item: T) {
        self.link.next(item);
    }

    fn on_error(&self, error: FlowError) {
        if self.link.is_done() {
            return;
        }
        let original = error.clone();
        match guard(|| (self.recover)(error)) {
            Ok(substitute) => {
                self.link.next(substitute);
                self.link.complete();
            }
            Err(recovery) => self.link.error(FlowError::RecoveryFailed {
                original: Box::new(original),
                recovery: Box::new(recovery),
            }),
        }
    }

    fn on_complete(&self) {
        self.link.complete();
    }
}

publish_via_link!(Recover<T>, T);

/// Scales downstream batch demand into upstream item demand.
struct BatchDemand {
    upstream: Arc<dyn Subscription>,
    size: u64,
}

impl Subscription for BatchDemand {
    fn request(&self, n: u64) -> Result<(), FlowError> {
        if n == 0 {
            return Err(FlowError::InvalidDemand(n));
        }
        self.upstream.request(n.saturating_mul(self.size))
    }

    fn cancel(&self) {
        self.upstream.cancel();
    }
}

/// Groups items into batches of a fixed size. A trailing partial batch is
/// flushed on completion.
pub struct Partition<T> {
    size: usize,
    batch: Mutex<Vec<T>>,
    link: Link<Vec<T>>,
}

impl<T: Send + 'static> Partition<T> {
    /// `size` of zero is treated as one.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            batch: Mutex::new(Vec::with_capacity(size)),
            link: Link::new(),
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for Partition<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let offer = Arc::new(BatchDemand {
            upstream: subscription.clone(),
            size: self.size as u64,
        });
        self.link.set_upstream(subscription, offer);
    }

    fn on_next(&self, item: T) {
        let full = {
            let mut batch = self.batch.lock();
            batch.push(item);
            if batch.len() >= self.size {
                Some(std::mem::replace(&mut *batch, Vec::with_capacity(self.size)))
            } else {
                None
            }
        };
        if let Some(batch) = full {
            self.link.next(batch);
        }
    }

    fn on_error(&self, error: FlowError) {
        self.batch.lock().clear();
        self.link.error(error);
    }

    fn on_complete(&self) {
        let rest = std::mem::take(&mut *self.batch.lock());
        if !rest.is_empty() {
            self.link.next(rest);
        }
        self.link.complete();
    }
}

impl<T: Send + 'static> Publisher<Vec<T>> for Partition<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Vec<T>>>) {
        self.link.attach(subscriber);
    }
}
