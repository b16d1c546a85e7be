//! Backpressure-aware publish/subscribe primitives and the stage library
//! built on them.
//!
//! The contract is three traits: a [`Publisher`] accepts one [`Subscriber`],
//! hands it a [`Subscription`] through `on_subscribe`, and then delivers at
//! most as many `on_next` signals as were requested, followed by at most one
//! terminal signal (`on_error` or `on_complete`).
//!
//! Stages ([`processors`], [`collector`], [`parallel`]) are both subscriber
//! and publisher. [`Flo`] links them into a chain whose head can be fed by
//! hand through a [`SubscriptionHandle`] or [`Emitter`].
//!
//! Signals for one subscription are delivered sequentially. Stages other
//! than [`parallel::Parallel`] run on whatever thread delivers the signal.
use std::sync::Arc;

pub mod collector;
pub mod error;
pub mod flo;
mod link;
pub mod parallel;
pub mod processors;
pub mod sink;
pub mod source;
pub mod subscription;

pub use collector::{Collector, CollectorProcessor, FnCollector, collectors};
pub use error::{FlowError, SharedError};
pub use flo::{ChainProcessor, Flo};
pub use parallel::{Parallel, ParallelOptions};
pub use sink::{LastValueSink, SubscriptionHandle};
pub use source::{Emitter, Source};
pub use subscription::{DemandSubscription, RequestPolicy, SubscriptionState, UNBOUNDED};

/// One producer/consumer link: demand flows up, cancellation flows up.
pub trait Subscription: Send + Sync {
    /// Add `n` to the outstanding demand. `n` must be positive.
    fn request(&self, n: u64) -> Result<(), FlowError>;

    /// Stop the flow. Idempotent.
    fn cancel(&self);
}

/// Receiver of the four stream signals.
pub trait Subscriber<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);
    fn on_next(&self, item: T);
    fn on_error(&self, error: FlowError);
    fn on_complete(&self);
}

/// Source of items for exactly one subscriber.
pub trait Publisher<T>: Send + Sync {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}

/// A stage that is both a subscriber of `I` and a publisher of `O`.
pub trait Processor<I, O>: Subscriber<I> + Publisher<O> {}

impl<I, O, P> Processor<I, O> for P where P: Subscriber<I> + Publisher<O> + ?Sized {}
