//! Downstream half shared by every stage.
//!
//! A [`Link`] owns the single downstream subscriber of a stage, the upstream
//! subscription it was handed, and the subscription it offers downstream.
//! `on_subscribe` is delivered exactly once, whichever of `attach` and
//! `set_upstream` happens last. Terminal signals are one-shot.
//!
//! Stages that stop early terminate downstream first and cancel upstream
//! second, so a courtesy completion raised by the cancelled upstream lands on
//! an already-finished link and is dropped.
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{FlowError, Subscriber, Subscription};

enum Terminal {
    Complete,
    Error(FlowError),
}

struct LinkState<T> {
    downstream: Option<Arc<dyn Subscriber<T>>>,
    upstream: Option<Arc<dyn Subscription>>,
    offer: Option<Arc<dyn Subscription>>,
    offered: bool,
    pending: Option<Terminal>,
}

pub(crate) struct Link<T> {
    state: Mutex<LinkState<T>>,
    done: AtomicBool,
}

impl<T> Link<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LinkState {
                downstream: None,
                upstream: None,
                offer: None,
                offered: false,
                pending: None,
            }),
            done: AtomicBool::new(false),
        }
    }

    /// Accept the downstream subscriber. A second subscriber is rejected with
    /// [`FlowError::AlreadySubscribed`].
    pub(crate) fn attach(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let mut state = self.state.lock();
        if state.downstream.is_some() {
            drop(state);
            reject(subscriber.as_ref(), FlowError::AlreadySubscribed);
            return;
        }
        state.downstream = Some(subscriber);
        self.offer_if_ready(state);
    }

    /// Record the upstream subscription and what to offer downstream.
    ///
    /// Returns `false` (and cancels `upstream`) if one was already recorded.
    pub(crate) fn set_upstream(
        &self,
        upstream: Arc<dyn Subscription>,
        offer: Arc<dyn Subscription>,
    ) -> bool {
        let mut state = self.state.lock();
        if state.upstream.is_some() {
            drop(state);
            warn!("stage received a second subscription; cancelling it");
            upstream.cancel();
            return false;
        }
        state.upstream = Some(upstream);
        if state.offer.is_none() {
            state.offer = Some(offer);
        }
        self.offer_if_ready(state);
        true
    }

    /// Offer a subscription downstream without an upstream (source stages).
    pub(crate) fn set_offer(&self, offer: Arc<dyn Subscription>) {
        let mut state = self.state.lock();
        if state.offer.is_none() {
            state.offer = Some(offer);
        }
        self.offer_if_ready(state);
    }

    fn offer_if_ready(&self, mut state: parking_lot::MutexGuard<'_, LinkState<T>>) {
        if state.offered || state.downstream.is_none() {
            return;
        }
        if state.offer.is_none() {
            if state.pending.is_none() {
                return;
            }
            state.offer = Some(Arc::new(Detached));
        }
        state.offered = true;
        let (Some(downstream), Some(offer)) = (state.downstream.clone(), state.offer.clone())
        else {
            return;
        };
        let pending = state.pending.take();
        drop(state);

        downstream.on_subscribe(offer);
        match pending {
            Some(Terminal::Complete) => downstream.on_complete(),
            Some(Terminal::Error(error)) => downstream.on_error(error),
            None => {}
        }
    }

    fn ready_downstream(&self) -> Option<Arc<dyn Subscriber<T>>> {
        let state = self.state.lock();
        if state.offered {
            state.downstream.clone()
        } else {
            None
        }
    }

    /// Forward an item. Returns `false` if it was dropped.
    pub(crate) fn next(&self, item: T) -> bool {
        if self.is_done() {
            return false;
        }
        match self.ready_downstream() {
            Some(downstream) => {
                downstream.on_next(item);
                true
            }
            None => {
                debug!("no downstream subscriber; item discarded");
                false
            }
        }
    }

    pub(crate) fn complete(&self) {
        self.terminate(Terminal::Complete);
    }

    pub(crate) fn error(&self, error: FlowError) {
        self.terminate(Terminal::Error(error));
    }

    /// Error downstream, then cancel upstream.
    pub(crate) fn fail(&self, error: FlowError) {
        self.error(error);
        self.cancel_upstream();
    }

    fn terminate(&self, terminal: Terminal) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.state.lock();
        if !state.offered {
            state.pending = Some(terminal);
            self.offer_if_ready(state);
            return;
        }
        let downstream = state.downstream.clone();
        drop(state);
        if let Some(downstream) = downstream {
            match terminal {
                Terminal::Complete => downstream.on_complete(),
                Terminal::Error(error) => downstream.on_error(error),
            }
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn upstream(&self) -> Option<Arc<dyn Subscription>> {
        self.state.lock().upstream.clone()
    }

    pub(crate) fn request_upstream(&self, n: u64) {
        if let Some(upstream) = self.upstream() {
            if let Err(error) = upstream.request(n) {
                debug!(%error, "upstream refused demand");
            }
        }
    }

    pub(crate) fn cancel_upstream(&self) {
        if let Some(upstream) = self.upstream() {
            upstream.cancel();
        }
    }
}

/// Deliver a subscription-time failure to a subscriber that cannot be served.
pub(crate) fn reject<T>(subscriber: &dyn Subscriber<T>, error: FlowError) {
    subscriber.on_subscribe(Arc::new(Detached));
    subscriber.on_error(error);
}

/// Subscription with nothing behind it.
pub(crate) struct Detached;

impl Subscription for Detached {
    fn request(&self, n: u64) -> Result<(), FlowError> {
        if n == 0 {
            return Err(FlowError::InvalidDemand(n));
        }
        Ok(())
    }

    fn cancel(&self) {}
}

/// Offered by stages that drive their own upstream demand: downstream
/// requests are validated and ignored, cancellation is passed through.
pub(crate) struct CancelOnly(pub(crate) Arc<dyn Subscription>);

impl Subscription for CancelOnly {
    fn request(&self, n: u64) -> Result<(), FlowError> {
        if n == 0 {
            return Err(FlowError::InvalidDemand(n));
        }
        Ok(())
    }

    fn cancel(&self) {
        self.0.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        subscribed: AtomicUsize,
        items: Mutex<Vec<u32>>,
        completed: AtomicUsize,
        errors: Mutex<Vec<String>>,
    }

    impl Subscriber<u32> for Recorder {
        fn on_subscribe(&self, _subscription: Arc<dyn Subscription>) {
            self.subscribed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_next(&self, item: u32) {
            self.items.lock().push(item);
        }
        fn on_error(&self, error: FlowError) {
            self.errors.lock().push(error.to_string());
        }
        fn on_complete(&self) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_on_subscribe_once_in_either_order() {
        let link = Link::new();
        let recorder = Arc::new(Recorder::default());
        link.attach(recorder.clone());
        assert_eq!(recorder.subscribed.load(Ordering::SeqCst), 0);
        link.set_upstream(Arc::new(Detached), Arc::new(Detached));
        assert_eq!(recorder.subscribed.load(Ordering::SeqCst), 1);

        let link = Link::new();
        let recorder = Arc::new(Recorder::default());
        link.set_upstream(Arc::new(Detached), Arc::new(Detached));
        link.attach(recorder.clone());
        assert_eq!(recorder.subscribed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_terminal_before_attach_is_replayed() {
        let link: Link<u32> = Link::new();
        link.set_upstream(Arc::new(Detached), Arc::new(Detached));
        link.complete();
        link.complete();
        let recorder = Arc::new(Recorder::default());
        link.attach(recorder.clone());
        assert_eq!(recorder.completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_second_subscriber_rejected() {
        let link: Link<u32> = Link::new();
        link.attach(Arc::new(Recorder::default()));
        let late = Arc::new(Recorder::default());
        link.attach(late.clone());
        assert_eq!(late.subscribed.load(Ordering::SeqCst), 1);
        assert_eq!(late.errors.lock().len(), 1);
    }

    #[test]
    fn test_items_after_terminal_are_dropped() {
        let link = Link::new();
        let recorder = Arc::new(Recorder::default());
        link.attach(recorder.clone());
        link.set_upstream(Arc::new(Detached), Arc::new(Detached));
        assert!(link.next(1));
        link.error(FlowError::Abandoned);
        assert!(!link.next(2));
        link.complete();
        assert_eq!(*recorder.items.lock(), vec![1]);
        assert_eq!(recorder.completed.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.errors.lock().len(), 1);
    }
}
