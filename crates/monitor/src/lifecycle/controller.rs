//! Lifecycle controller
//!
//! Single entry point for raw host notifications and consumer requests.
//! Per device it drives this state machine:
//!
//! ```text
//! Unregistered --(attach, is-camera)--> Registered(Unrequested)
//! Registered(Unrequested) --(request)--> Registered(Pending)
//! Registered(Pending) --(grant)--> Registered(Granted, handle=None)
//! Registered(Pending) --(deny|cancel)--> Registered(Denied)
//! Registered(Granted) --(open)--> Registered(Granted, handle=Some)
//! Registered(Granted) --(channel lost)--> Registered(Denied)
//! Registered(*) --(detach)--> Unregistered
//! ```
//!
//! All mutations run under one lock. Events raised by a mutation are queued
//! while that lock is held and delivered after it is released, by whichever
//! thread is currently draining the queue. Observers may therefore call back
//! into the controller from a handler. OS prompts are also issued after the
//! lock is released, so a host may answer synchronously.

use crate::capture::{CaptureConfig, CaptureTransport};
use crate::lifecycle::dispatcher::{
    DenialReason, EventDispatcher, LifecycleEvent, LifecycleObserver, SubscriptionToken,
    channel_observer,
};
use crate::lifecycle::error::{LifecycleError, Result};
use crate::lifecycle::filter::CameraFilter;
use crate::lifecycle::permission::{
    HostSubsystem, PermissionGate, PermissionState, PromptPolicy, RequestOutcome, Transition,
};
use crate::lifecycle::registry::{AttachOutcome, DeviceRegistry, DeviceTile};
use common::{ControlBlock, DeviceId, DeviceIdentity, HostEvent, RawDevice};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Controller options
#[derive(Debug, Clone, Default)]
pub struct ControllerOptions {
    /// Which attached devices are managed
    pub filter: CameraFilter,
    /// When attach prompts automatically
    pub prompt_policy: PromptPolicy,
}

struct Core {
    registry: DeviceRegistry,
    gate: PermissionGate,
}

/// USB camera lifecycle controller
pub struct LifecycleController {
    core: Mutex<Core>,
    outbox: Mutex<VecDeque<LifecycleEvent>>,
    draining: AtomicBool,
    dispatcher: EventDispatcher,
    filter: CameraFilter,
    prompt_policy: PromptPolicy,
    host: Arc<dyn HostSubsystem>,
    transport: Arc<dyn CaptureTransport>,
    devices: watch::Sender<Vec<DeviceTile>>,
}

impl LifecycleController {
    pub fn new(
        host: Arc<dyn HostSubsystem>,
        transport: Arc<dyn CaptureTransport>,
        options: ControllerOptions,
    ) -> Self {
        let (devices, _) = watch::channel(Vec::new());

        Self {
            core: Mutex::new(Core {
                registry: DeviceRegistry::new(),
                gate: PermissionGate::new(options.prompt_policy),
            }),
            outbox: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            dispatcher: EventDispatcher::new(),
            filter: options.filter,
            prompt_policy: options.prompt_policy,
            host,
            transport,
            devices,
        }
    }

    // ------------------------------------------------------------------
    // Host notifications
    // ------------------------------------------------------------------

    /// Route a queued host notification
    pub fn handle_host_event(&self, event: HostEvent) {
        debug!("Host event {} for device {}", event.kind(), event.device_id());
        match event {
            HostEvent::Attached(raw) => self.attach(&raw),
            HostEvent::Detached(raw) => self.detach(&raw),
            HostEvent::PermissionGranted { device, channel } => {
                self.permission_granted(&device, channel)
            }
            HostEvent::PermissionDenied(device) => self.permission_denied(&device),
            HostEvent::PermissionCancelled(device) => self.permission_request_cancelled(&device),
            HostEvent::ChannelLost(device) => self.control_channel_lost(&device),
        }
    }

    /// A device was plugged in
    pub fn attach(&self, raw: &RawDevice) {
        if !self.filter.admits(raw) {
            debug!(
                "Ignoring non-camera device {:04x}:{:04x} at {}",
                raw.vendor_id,
                raw.product_id,
                raw.node_path()
            );
            return;
        }

        let identity = DeviceIdentity::from_raw(raw);
        // Only the pre-granted policy needs the OS check
        let host_has_permission = self.prompt_policy == PromptPolicy::PreGrantedOnly
            && self.host.has_permission(&identity);

        let prompt = {
            let mut core = self.lock_core();
            if core.registry.on_attach(identity.clone()) == AttachOutcome::Duplicate {
                debug!("Duplicate attach for device {}", identity.id());
                return;
            }
            core.gate.track(&identity);
            info!("Camera attached: {}", identity);
            self.raise(LifecycleEvent::Attached {
                device: identity.clone(),
            });

            let prompt = core
                .gate
                .should_auto_request(&identity, host_has_permission)
                && core.gate.request(identity.id()) == Ok(RequestOutcome::Prompt);
            self.publish(&core);
            prompt
        };

        if prompt {
            self.issue_prompt(&identity);
        }
        self.flush();
    }

    /// A device was unplugged
    pub fn detach(&self, raw: &RawDevice) {
        {
            let mut core = self.lock_core();
            match core.registry.on_detach(raw.id) {
                Some(identity) => {
                    core.gate.forget(identity.id());
                    info!("Camera detached: {}", identity);
                    self.raise(LifecycleEvent::Detached { device: identity });
                    self.publish(&core);
                }
                None => debug!("Detach for unregistered device {}", raw.id),
            }
        }
        self.flush();
    }

    /// The OS granted access and handed over a control channel
    pub fn permission_granted(&self, identity: &DeviceIdentity, channel: Box<dyn ControlBlock>) {
        if channel.device_id() != identity.id() {
            warn!(
                "Discarding grant for device {}: channel belongs to {}",
                identity.id(),
                channel.device_id()
            );
            return;
        }

        {
            let mut core = self.lock_core();
            match core.gate.on_grant(identity) {
                Transition::Applied { .. } => {
                    let Core { registry, .. } = &mut *core;
                    match registry.set_control_channel(identity.id(), Some(channel)) {
                        Ok(()) => {
                            let device = registry
                                .identity(identity.id())
                                .cloned()
                                .unwrap_or_else(|| identity.clone());
                            info!("Permission granted: {}", device);
                            self.raise(LifecycleEvent::PermissionGranted { device });
                        }
                        Err(e) => warn!("Grant for device {} not bound: {}", identity.id(), e),
                    }
                    self.publish(&core);
                }
                Transition::Unchanged(_) => {
                    debug!("Duplicate grant for device {} absorbed", identity.id());
                }
                Transition::Stale => {
                    debug!("Discarding late grant for absent device {}", identity.id());
                }
            }
        }
        self.flush();
    }

    /// The user denied access
    pub fn permission_denied(&self, identity: &DeviceIdentity) {
        self.resolve_denial(identity, DenialReason::Denied);
    }

    /// The prompt was dismissed or failed
    pub fn permission_request_cancelled(&self, identity: &DeviceIdentity) {
        self.resolve_denial(identity, DenialReason::Cancelled);
    }

    /// The OS closed a previously granted control channel
    pub fn control_channel_lost(&self, identity: &DeviceIdentity) {
        self.resolve_denial(identity, DenialReason::Revoked);
    }

    fn resolve_denial(&self, identity: &DeviceIdentity, reason: DenialReason) {
        {
            let mut core = self.lock_core();
            let transition = match reason {
                DenialReason::Denied => core.gate.on_deny(identity),
                DenialReason::Cancelled => core.gate.on_cancel(identity),
                DenialReason::Revoked => core.gate.revoke(identity.id()),
            };

            match transition {
                Transition::Applied { from, .. } => {
                    if let Err(e) = core.registry.set_control_channel(identity.id(), None) {
                        warn!("Revoking device {}: {}", identity.id(), e);
                    }
                    let device = core
                        .registry
                        .identity(identity.id())
                        .cloned()
                        .unwrap_or_else(|| identity.clone());
                    info!(
                        "Permission {:?} for {} (was {:?})",
                        reason, device, from
                    );
                    self.raise(LifecycleEvent::PermissionDenied { device, reason });
                    self.publish(&core);
                }
                Transition::Unchanged(state) => {
                    debug!(
                        "{:?} for device {} ignored in state {:?}",
                        reason,
                        identity.id(),
                        state
                    );
                }
                Transition::Stale => {
                    debug!(
                        "Discarding late {:?} for absent device {}",
                        reason,
                        identity.id()
                    );
                }
            }
        }
        self.flush();
    }

    // ------------------------------------------------------------------
    // Consumer requests
    // ------------------------------------------------------------------

    /// Manually request permission, e.g. after an earlier denial
    pub fn request_permission(&self, id: DeviceId) -> Result<RequestOutcome> {
        let (outcome, identity) = {
            let mut core = self.lock_core();
            let identity = core
                .registry
                .identity(id)
                .cloned()
                .ok_or(LifecycleError::UnknownDevice(id))?;
            let outcome = core.gate.request(id)?;
            if outcome == RequestOutcome::Prompt {
                self.publish(&core);
            }
            (outcome, identity)
        };

        if outcome == RequestOutcome::Prompt {
            self.issue_prompt(&identity);
        }
        self.flush();
        Ok(outcome)
    }

    /// Open a capture session on a granted device
    pub fn open(&self, id: DeviceId, config: &CaptureConfig) -> Result<()> {
        let mut core = self.lock_core();
        let Core { registry, gate } = &mut *core;
        registry.open(id, config, gate, self.transport.as_ref())?;
        self.publish(&core);
        Ok(())
    }

    /// Close the capture session of a device; `Ok(false)` if none was open
    pub fn close(&self, id: DeviceId) -> Result<bool> {
        let mut core = self.lock_core();
        let closed = core.registry.close(id)?;
        if closed {
            info!("Closed device {}", id);
            self.publish(&core);
        }
        Ok(closed)
    }

    /// Detach every device, closing all sessions
    pub fn shutdown(&self) {
        {
            let mut core = self.lock_core();
            let removed = core.registry.clear();
            for identity in removed {
                core.gate.forget(identity.id());
                self.raise(LifecycleEvent::Detached { device: identity });
            }
            self.publish(&core);
        }
        self.flush();
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Whether the device is registered and granted
    pub fn has_permission(&self, id: DeviceId) -> bool {
        self.permission_state(id) == Some(PermissionState::Granted)
    }

    pub fn permission_state(&self, id: DeviceId) -> Option<PermissionState> {
        self.devices
            .borrow()
            .iter()
            .find(|tile| tile.identity.id() == id)
            .map(|tile| tile.permission)
    }

    pub fn is_open(&self, id: DeviceId) -> bool {
        self.devices
            .borrow()
            .iter()
            .any(|tile| tile.identity.id() == id && tile.open)
    }

    /// Current device list in attach order
    pub fn devices(&self) -> Vec<DeviceTile> {
        self.devices.borrow().clone()
    }

    /// Receiver that observes every change of the device list
    pub fn watch_devices(&self) -> watch::Receiver<Vec<DeviceTile>> {
        self.devices.subscribe()
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    pub fn subscribe(&self, observer: Arc<dyn LifecycleObserver>) -> SubscriptionToken {
        self.dispatcher.subscribe(observer)
    }

    pub fn subscribe_fn<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.subscribe_fn(handler)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.dispatcher.unsubscribe(token)
    }

    /// Subscribe an async channel receiving every event from now on
    pub fn event_stream(
        &self,
        capacity: usize,
    ) -> (SubscriptionToken, async_channel::Receiver<LifecycleEvent>) {
        let (observer, rx) = channel_observer(capacity);
        (self.dispatcher.subscribe(Arc::new(observer)), rx)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn issue_prompt(&self, identity: &DeviceIdentity) {
        debug!("Prompting for access to {}", identity);
        if let Err(e) = self.host.request_permission(identity) {
            warn!("Permission prompt for {} failed: {}", identity.id(), e);
            self.permission_request_cancelled(identity);
        }
    }

    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outbox(&self) -> MutexGuard<'_, VecDeque<LifecycleEvent>> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an event; callers hold the core lock so queue order is mutation order
    fn raise(&self, event: LifecycleEvent) {
        self.lock_outbox().push_back(event);
    }

    fn publish(&self, core: &Core) {
        self.devices.send_replace(core.registry.tiles(&core.gate));
    }

    /// Deliver queued events unless another call is already delivering them
    fn flush(&self) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            loop {
                let next = self.lock_outbox().pop_front();
                match next {
                    Some(event) => {
                        self.dispatcher.dispatch(&event);
                    }
                    None => break,
                }
            }

            self.draining.store(false, Ordering::Release);

            // An event queued between the last pop and the store above would
            // otherwise wait for the next flush
            if self.lock_outbox().is_empty() {
                return;
            }
        }
    }
}
