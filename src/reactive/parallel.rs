//! Moves per-item delivery onto a worker pool.
//!
//! Items are queued on `on_next` and a drain task is submitted to the
//! process executor for each one. Drains forward queued items against
//! downstream demand and decrement the in-flight counter. Completion is only
//! forwarded once upstream is done, the queue is empty and nothing is in
//! flight; it and every error are delivered on the manage executor.
//!
//! A bounded buffer that is full when an item arrives fails the stage on the
//! calling thread with [`FlowError::BufferOverflow`].
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::{error, warn};

use super::{
    DemandSubscription, FlowError, Publisher, Subscriber, Subscription, SubscriptionState,
    UNBOUNDED, link::Link,
};
use crate::{ports::executor::Executor, tracing_setup::create_stage_span};

#[derive(Clone)]
pub struct ParallelOptions {
    /// Queue capacity; zero means unbounded.
    pub buffer_size: usize,
    /// Runs drain passes.
    pub process: Arc<dyn Executor>,
    /// Delivers completion and errors.
    pub manage: Arc<dyn Executor>,
}

impl ParallelOptions {
    /// One executor for both roles, unbounded buffer.
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            buffer_size: 0,
            process: executor.clone(),
            manage: executor,
        }
    }

    pub fn with_manage(mut self, manage: Arc<dyn Executor>) -> Self {
        self.manage = manage;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

impl fmt::Debug for ParallelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelOptions")
            .field("buffer_size", &self.buffer_size)
            .field("process", &self.process.name())
            .field("manage", &self.manage.name())
            .finish()
    }
}

struct Inner<T> {
    options: ParallelOptions,
    queue: Mutex<VecDeque<T>>,
    in_flight: AtomicUsize,
    upstream_done: AtomicBool,
    finished: AtomicBool,
    cancelled: AtomicBool,
    downstream_demand: Arc<DemandSubscription>,
    link: Link<T>,
}

pub struct Parallel<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Parallel<T> {
    pub fn new(options: ParallelOptions) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner<T>>| {
            let downstream_demand = Arc::new(DemandSubscription::tracking());

            let on_demand = weak.clone();
            downstream_demand.set_demand_hook(move |_| {
                if let Some(inner) = on_demand.upgrade() {
                    inner.schedule_drain();
                }
            });

            let on_cancel = weak.clone();
            downstream_demand.on_state(SubscriptionState::Cancelled, move || {
                if let Some(inner) = on_cancel.upgrade() {
                    inner.cancel();
                }
            });

            Inner {
                options,
                queue: Mutex::new(VecDeque::new()),
                in_flight: AtomicUsize::new(0),
                upstream_done: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                downstream_demand,
                link: Link::new(),
            }
        });
        Self { inner }
    }

    /// Items accepted but not yet forwarded.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }
}

impl<T: Send + 'static> Inner<T> {
    fn bounded(&self) -> bool {
        self.options.buffer_size > 0
    }

    fn enqueue(self: &Arc<Self>, item: T) {
        if self.cancelled.load(Ordering::Acquire) || self.finished.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.queue.lock();
            if self.bounded() && queue.len() >= self.options.buffer_size {
                drop(queue);
                self.overflow();
                return;
            }
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            queue.push_back(item);
        }
        self.schedule_drain();
    }

    fn overflow(&self) {
        let capacity = self.options.buffer_size;
        error!(capacity, "parallel stage buffer overflow");
        self.cancelled.store(true, Ordering::Release);
        self.finished.store(true, Ordering::Release);
        self.link.fail(FlowError::BufferOverflow { capacity });
        self.discard_queue();
    }

    fn schedule_drain(self: &Arc<Self>) {
        let inner = self.clone();
        let span = create_stage_span("parallel", self.options.process.name());
        if let Err(rejected) = self
            .options
            .process
            .execute(Box::new(move || span.in_scope(|| inner.drain())))
        {
            warn!(error = %rejected, "drain task rejected");
            self.cancelled.store(true, Ordering::Release);
            self.finished.store(true, Ordering::Release);
            self.link.fail(rejected.into());
            self.discard_queue();
        }
    }

    fn drain(self: &Arc<Self>) {
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.discard_queue();
                return;
            }
            let item = {
                let mut queue = self.queue.lock();
                if queue.is_empty() || self.downstream_demand.get_and_decrement_requested() == 0 {
                    None
                } else {
                    queue.pop_front()
                }
            };
            let Some(item) = item else {
                break;
            };
            if self.cancelled.load(Ordering::Acquire) {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                self.discard_queue();
                return;
            }

            self.link.next(item);
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            if self.bounded() && !self.upstream_done.load(Ordering::Acquire) {
                self.link.request_upstream(1);
            }
        }
        self.try_finish();
    }

    fn try_finish(self: &Arc<Self>) {
        if self.cancelled.load(Ordering::Acquire)
            || !self.upstream_done.load(Ordering::Acquire)
            || self.in_flight.load(Ordering::Acquire) != 0
            || !self.queue.lock().is_empty()
        {
            return;
        }
        if self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let inner = self.clone();
        self.manage(move || inner.link.complete(), "completion");
    }

    fn fail(self: &Arc<Self>, error: FlowError) {
        // nothing is signalled downstream once it cancelled
        if self.cancelled.load(Ordering::Acquire) || self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.clone();
        self.manage(
            move || {
                inner.discard_queue();
                inner.link.error(error);
            },
            "error",
        );
    }

    fn manage(self: &Arc<Self>, signal: impl FnOnce() + Send + 'static, what: &'static str) {
        let slot = Arc::new(Mutex::new(Some(signal)));
        let task_slot = slot.clone();
        let submitted = self.options.manage.execute(Box::new(move || {
            if let Some(signal) = task_slot.lock().take() {
                signal();
            }
        }));
        if let Err(rejected) = submitted {
            warn!(error = %rejected, what, "manage executor rejected signal, delivering inline");
            if let Some(signal) = slot.lock().take() {
                signal();
            }
        }
    }

    fn discard_queue(&self) {
        let mut queue = self.queue.lock();
        let dropped = queue.len();
        queue.clear();
        self.in_flight.fetch_sub(dropped, Ordering::AcqRel);
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.discard_queue();
        self.link.cancel_upstream();
    }
}

impl<T: Send + 'static> Subscriber<T> for Parallel<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let inner = &self.inner;
        if !inner
            .link
            .set_upstream(subscription, inner.downstream_demand.clone())
        {
            return;
        }
        let initial = if inner.bounded() {
            inner.options.buffer_size as u64
        } else {
            UNBOUNDED
        };
        inner.link.request_upstream(initial);
    }

    fn on_next(&self, item: T) {
        self.inner.enqueue(item);
    }

    fn on_error(&self, error: FlowError) {
        self.inner.fail(error);
    }

    fn on_complete(&self) {
        self.inner.upstream_done.store(true, Ordering::Release);
        self.inner.schedule_drain();
    }
}

impl<T: Send + 'static> Publisher<T> for Parallel<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        if let Err(error) = self.inner.downstream_demand.subscribe() {
            super::link::reject(subscriber.as_ref(), error);
            return;
        }
        self.inner.link.attach(subscriber);
    }
}
