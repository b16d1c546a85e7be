//! Terminal subscribers.
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{Emitter, FlowError, Source, Subscriber, Subscription, UNBOUNDED};

pub type Outcome<T> = Result<Option<T>, FlowError>;

/// Requests everything and resolves with the last item seen when upstream
/// completes (`None` for an empty stream), or with the error.
pub struct LastValueSink<T> {
    last: Mutex<Option<T>>,
    resolve: Mutex<Option<oneshot::Sender<Outcome<T>>>>,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
}

impl<T: Send + 'static> LastValueSink<T> {
    pub fn new() -> (Arc<Self>, oneshot::Receiver<Outcome<T>>) {
        let (tx, rx) = oneshot::channel();
        let sink = Arc::new(Self {
            last: Mutex::new(None),
            resolve: Mutex::new(Some(tx)),
            upstream: Mutex::new(None),
        });
        (sink, rx)
    }

    pub fn cancel(&self) {
        let upstream = self.upstream.lock().clone();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }

    fn settle(&self, outcome: Outcome<T>) {
        if let Some(tx) = self.resolve.lock().take() {
            // receiver gone means nobody is waiting
            let _ = tx.send(outcome);
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for LastValueSink<T> {
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
        if let Err(error) = subscription.request(UNBOUNDED) {
            self.settle(Err(error));
        }
    }

    fn on_next(&self, item: T) {
        *self.last.lock() = Some(item);
    }

    fn on_error(&self, error: FlowError) {
        self.last.lock().take();
        self.settle(Err(error));
    }

    fn on_complete(&self) {
        let last = self.last.lock().take();
        self.settle(Ok(last));
    }
}

/// Handle to a subscribed chain: push into its head, then wait for the
/// value its terminal sink resolves with.
pub struct SubscriptionHandle<I, O> {
    head: Arc<Source<I>>,
    sink: Arc<LastValueSink<O>>,
    outcome: oneshot::Receiver<Outcome<O>>,
}

impl<I: Send + 'static, O: Send + 'static> SubscriptionHandle<I, O> {
    pub(crate) fn new(
        head: Arc<Source<I>>,
        sink: Arc<LastValueSink<O>>,
        outcome: oneshot::Receiver<Outcome<O>>,
    ) -> Self {
        Self {
            head,
            sink,
            outcome,
        }
    }

    /// Push one item into the head. `false` once the head stopped accepting.
    pub fn emit(&self, item: I) -> bool {
        self.head.emit(item)
    }

    /// Push one item and signal completion.
    pub fn just(&self, item: I) -> bool {
        let accepted = self.head.emit(item);
        self.head.done();
        accepted
    }

    pub fn done(&self) {
        self.head.done();
    }

    pub fn error(&self, error: FlowError) {
        self.head.error(error);
    }

    /// Cancel the chain from its tail. The handle still resolves, with the
    /// last item that reached the sink.
    pub fn cancel(&self) {
        self.sink.cancel();
        self.head.cancel();
    }

    /// Cloneable emitter for the head, for callbacks that outlive `&self`.
    pub fn emitter(&self) -> Emitter<I> {
        Emitter::new(self.head.clone())
    }

    /// Wait for the chain to finish.
    pub async fn wait(self) -> Outcome<O> {
        self.outcome.await.unwrap_or(Err(FlowError::Abandoned))
    }

    /// Block the calling thread until the chain finishes.
    ///
    /// Must not be called from an async context.
    pub fn join(self) -> Outcome<O> {
        self.outcome
            .blocking_recv()
            .unwrap_or(Err(FlowError::Abandoned))
    }
}
