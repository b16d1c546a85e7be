//! Demand accounting and the subscription lifecycle state machine.
//!
//! `UNSUBSCRIBED -> SUBSCRIBED -> {COMPLETED | CANCELLED | ERROR}`; the three
//! right-hand states are terminal. Demand is a saturating counter where
//! [`UNBOUNDED`] means "no limit" and is never decremented.
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};

use super::{FlowError, Subscription};

/// Demand value treated as infinite.
pub const UNBOUNDED: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SubscriptionState {
    Unsubscribed = 0,
    Subscribed = 1,
    Completed = 2,
    Cancelled = 3,
    Error = 4,
}

impl SubscriptionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SubscriptionState::Unsubscribed,
            1 => SubscriptionState::Subscribed,
            2 => SubscriptionState::Completed,
            3 => SubscriptionState::Cancelled,
            _ => SubscriptionState::Error,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubscriptionState::Completed | SubscriptionState::Cancelled | SubscriptionState::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionState::Unsubscribed => "UNSUBSCRIBED",
            SubscriptionState::Subscribed => "SUBSCRIBED",
            SubscriptionState::Completed => "COMPLETED",
            SubscriptionState::Cancelled => "CANCELLED",
            SubscriptionState::Error => "ERROR",
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How [`DemandSubscription::request`] treats calls outside SUBSCRIBED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPolicy {
    /// Requests are only legal while SUBSCRIBED.
    Strict,
    /// Requests are recorded at any time; terminal states ignore them.
    Tracking,
}

type Listener = Box<dyn FnOnce() + Send>;
type DemandHook = Arc<dyn Fn(u64) + Send + Sync>;

/// Atomic demand counter plus lifecycle state with state-change listeners.
pub struct DemandSubscription {
    state: AtomicU8,
    requested: AtomicU64,
    policy: RequestPolicy,
    // Transitions happen while holding this lock so a registration can never
    // slip between the state check and the listener drain.
    listeners: Mutex<Vec<(SubscriptionState, Listener)>>,
    on_demand: RwLock<Option<DemandHook>>,
}

impl DemandSubscription {
    pub fn new(policy: RequestPolicy) -> Self {
        Self {
            state: AtomicU8::new(SubscriptionState::Unsubscribed as u8),
            requested: AtomicU64::new(0),
            policy,
            listeners: Mutex::new(Vec::new()),
            on_demand: RwLock::new(None),
        }
    }

    pub fn strict() -> Self {
        Self::new(RequestPolicy::Strict)
    }

    pub fn tracking() -> Self {
        Self::new(RequestPolicy::Tracking)
    }

    pub fn policy(&self) -> RequestPolicy {
        self.policy
    }

    pub fn state(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Outstanding demand.
    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    /// Install a callback run after every successful `request(n)`.
    pub fn set_demand_hook(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *self.on_demand.write() = Some(Arc::new(hook));
    }

    /// Move from UNSUBSCRIBED to SUBSCRIBED.
    pub fn subscribe(&self) -> Result<(), FlowError> {
        if self.transition(SubscriptionState::Subscribed) {
            Ok(())
        } else {
            Err(FlowError::AlreadySubscribed)
        }
    }

    /// Move to COMPLETED. Returns `false` if already terminal.
    pub fn complete(&self) -> bool {
        self.transition(SubscriptionState::Completed)
    }

    /// Move to ERROR. Returns `false` if already terminal.
    pub fn fail(&self) -> bool {
        self.transition(SubscriptionState::Error)
    }

    /// Atomically take one unit of demand, never going below zero.
    ///
    /// Returns the value before the decrement; zero means emission is not
    /// permitted. Unbounded demand is left untouched.
    pub fn get_and_decrement_requested(&self) -> u64 {
        match self
            .requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| match current {
                0 => None,
                UNBOUNDED => Some(UNBOUNDED),
                n => Some(n - 1),
            }) {
            Ok(previous) => previous,
            Err(_) => 0,
        }
    }

    /// Run `listener` once the subscription reaches `target`.
    ///
    /// Fires synchronously when already in `target`. Listeners for a state
    /// that can no longer be reached are dropped without running.
    pub fn on_state(&self, target: SubscriptionState, listener: impl FnOnce() + Send + 'static) {
        let mut listeners = self.listeners.lock();
        let current = self.state();
        if current == target {
            drop(listeners);
            listener();
        } else if !current.is_terminal() {
            listeners.push((target, Box::new(listener)));
        }
    }

    fn transition(&self, target: SubscriptionState) -> bool {
        let mut listeners = self.listeners.lock();
        let allowed = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                let current = SubscriptionState::from_u8(raw);
                let legal = match target {
                    SubscriptionState::Subscribed => current == SubscriptionState::Unsubscribed,
                    _ if target.is_terminal() => !current.is_terminal(),
                    _ => false,
                };
                legal.then_some(target as u8)
            })
            .is_ok();
        if !allowed {
            return false;
        }

        if target == SubscriptionState::Cancelled {
            self.requested.store(0, Ordering::Release);
        }

        let pending = std::mem::take(&mut *listeners);
        let (ready, waiting): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|(state, _)| *state == target);
        if !target.is_terminal() {
            *listeners = waiting;
        }
        drop(listeners);

        for (_, listener) in ready {
            listener();
        }
        true
    }
}

impl Default for DemandSubscription {
    fn default() -> Self {
        Self::strict()
    }
}

impl fmt::Debug for DemandSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DemandSubscription")
            .field("state", &self.state())
            .field("requested", &self.requested())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Subscription for DemandSubscription {
    fn request(&self, n: u64) -> Result<(), FlowError> {
        if n == 0 {
            return Err(FlowError::InvalidDemand(n));
        }
        let state = self.state();
        match self.policy {
            RequestPolicy::Strict if state != SubscriptionState::Subscribed => {
                return Err(FlowError::NotSubscribed { state });
            }
            RequestPolicy::Tracking if state.is_terminal() => return Ok(()),
            _ => {}
        }

        // fetch_update with an always-Some closure cannot fail
        let _ = self
            .requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(n))
            });

        let hook = self.on_demand.read().clone();
        if let Some(hook) = hook {
            hook(n);
        }
        Ok(())
    }

    fn cancel(&self) {
        if self.transition(SubscriptionState::Cancelled) {
            tracing::debug!("subscription cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn subscribed() -> DemandSubscription {
        let subscription = DemandSubscription::strict();
        subscription.subscribe().unwrap();
        subscription
    }

    #[test]
    fn test_strict_request_requires_subscribed() {
        let subscription = DemandSubscription::strict();
        let error = subscription.request(1).unwrap_err();
        assert!(matches!(
            error,
            FlowError::NotSubscribed {
                state: SubscriptionState::Unsubscribed
            }
        ));
    }

    #[test]
    fn test_tracking_request_allowed_before_subscribe() {
        let subscription = DemandSubscription::tracking();
        subscription.request(3).unwrap();
        assert_eq!(subscription.requested(), 3);
    }

    #[test]
    fn test_zero_request_rejected() {
        let subscription = subscribed();
        assert!(matches!(
            subscription.request(0),
            Err(FlowError::InvalidDemand(0))
        ));
    }

    #[test]
    fn test_demand_is_summed_and_saturates() {
        let subscription = subscribed();
        subscription.request(5).unwrap();
        subscription.request(7).unwrap();
        assert_eq!(subscription.requested(), 12);

        subscription.request(UNBOUNDED - 3).unwrap();
        assert_eq!(subscription.requested(), UNBOUNDED);
        assert_eq!(subscription.get_and_decrement_requested(), UNBOUNDED);
        assert_eq!(subscription.requested(), UNBOUNDED);
    }

    #[test]
    fn test_decrement_never_goes_negative() {
        let subscription = subscribed();
        subscription.request(2).unwrap();
        assert_eq!(subscription.get_and_decrement_requested(), 2);
        assert_eq!(subscription.get_and_decrement_requested(), 1);
        assert_eq!(subscription.get_and_decrement_requested(), 0);
        assert_eq!(subscription.get_and_decrement_requested(), 0);
        assert_eq!(subscription.requested(), 0);
    }

    #[test]
    fn test_cancel_is_idempotent_and_fires_once() {
        let subscription = subscribed();
        subscription.request(10).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        subscription.on_state(SubscriptionState::Cancelled, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        subscription.cancel();
        subscription.cancel();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(subscription.state(), SubscriptionState::Cancelled);
        assert_eq!(subscription.requested(), 0);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let subscription = subscribed();
        assert!(subscription.complete());
        assert!(!subscription.fail());
        subscription.cancel();
        assert_eq!(subscription.state(), SubscriptionState::Completed);
        assert!(subscription.subscribe().is_err());
    }

    #[test]
    fn test_listener_for_reached_state_fires_immediately() {
        let subscription = subscribed();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        subscription.on_state(SubscriptionState::Subscribed, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_for_unreachable_state_never_fires() {
        let subscription = subscribed();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        subscription.on_state(SubscriptionState::Cancelled, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        subscription.complete();
        subscription.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_demand_hook_runs_after_request() {
        let subscription = subscribed();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        subscription.set_demand_hook(move |n| {
            counter.fetch_add(n as usize, Ordering::SeqCst);
        });
        subscription.request(4).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }
}
