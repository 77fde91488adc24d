//! Lifecycle event dispatch
//!
//! Observers subscribe with a stable [`SubscriptionToken`]. Each event is
//! delivered against a snapshot of the subscriber list taken when the event
//! starts, so observers may subscribe or unsubscribe from inside a handler:
//! the change applies from the next event on. A failing or panicking
//! observer is logged and skipped; the remaining observers still receive
//! the event.

use common::DeviceIdentity;
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, warn};

/// Why a device ended up without permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DenialReason {
    /// User denied the prompt
    Denied,
    /// Prompt was dismissed or could not be shown
    Cancelled,
    /// OS closed a previously granted channel
    Revoked,
}

/// Normalized lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum LifecycleEvent {
    Attached {
        device: DeviceIdentity,
    },
    Detached {
        device: DeviceIdentity,
    },
    PermissionGranted {
        device: DeviceIdentity,
    },
    PermissionDenied {
        device: DeviceIdentity,
        reason: DenialReason,
    },
}

impl LifecycleEvent {
    pub fn device(&self) -> &DeviceIdentity {
        match self {
            LifecycleEvent::Attached { device }
            | LifecycleEvent::Detached { device }
            | LifecycleEvent::PermissionGranted { device }
            | LifecycleEvent::PermissionDenied { device, .. } => device,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::Attached { .. } => "attached",
            LifecycleEvent::Detached { .. } => "detached",
            LifecycleEvent::PermissionGranted { .. } => "permission-granted",
            LifecycleEvent::PermissionDenied { .. } => "permission-denied",
        }
    }
}

/// Receiver of lifecycle events
pub trait LifecycleObserver: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent) -> anyhow::Result<()>;
}

impl<F> LifecycleObserver for F
where
    F: Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Opaque subscription handle; tokens are never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

/// Per-event delivery counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

type Subscriber = (SubscriptionToken, Arc<dyn LifecycleObserver>);

/// Fan-out of lifecycle events to subscribers
pub struct EventDispatcher {
    subscribers: Mutex<Vec<Subscriber>>,
    next_token: AtomicU64,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn LifecycleObserver>) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.lock().push((token, observer));
        token
    }

    /// Subscribe a closure
    pub fn subscribe_fn<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(handler))
    }

    /// Remove a subscription; returns false for unknown or already removed tokens
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|(t, _)| *t != token);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver an event to every subscriber registered at this moment
    pub fn dispatch(&self, event: &LifecycleEvent) -> DispatchReport {
        let snapshot: Vec<Subscriber> = self.lock().clone();
        let mut report = DispatchReport::default();

        for (token, observer) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| observer.on_event(event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    warn!(
                        "Observer {:?} failed on {} for device {}: {:#}",
                        token,
                        event.kind(),
                        event.device().id(),
                        e
                    );
                    report.failed += 1;
                }
                Err(panic) => {
                    error!(
                        "Observer {:?} panicked on {} for device {}: {}",
                        token,
                        event.kind(),
                        event.device().id(),
                        panic_message(panic.as_ref())
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Observer that forwards events into an async channel
///
/// Delivery never blocks: a full queue is reported as an observer failure.
pub struct ChannelObserver {
    tx: async_channel::Sender<LifecycleEvent>,
}

impl LifecycleObserver for ChannelObserver {
    fn on_event(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        self.tx
            .try_send(event.clone())
            .map_err(|e| anyhow::anyhow!("event stream: {}", e))
    }
}

/// Create a channel-backed observer and the receiver to await events on
pub fn channel_observer(
    capacity: usize,
) -> (ChannelObserver, async_channel::Receiver<LifecycleEvent>) {
    let (tx, rx) = async_channel::bounded(capacity);
    (ChannelObserver { tx }, rx)
}
