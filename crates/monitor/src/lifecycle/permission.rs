//! Permission gate
//!
//! Tracks the permission state of every registered device and serializes
//! prompts: a device has at most one outstanding OS prompt at any time,
//! while prompts for different devices may run concurrently.
//!
//! The gate itself never talks to the OS. [`PermissionGate::request`]
//! returns [`RequestOutcome::Prompt`] when a prompt must be issued and the
//! controller forwards it to the [`HostSubsystem`] once its lock is released.

use crate::lifecycle::error::{LifecycleError, Result};
use common::{DeviceId, DeviceIdentity};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// OS hot-plug/permission subsystem as seen by the lifecycle core
pub trait HostSubsystem: Send + Sync {
    /// Show an access prompt for the device (fire-and-forget)
    ///
    /// The decision arrives later through the controller's permission
    /// callbacks. An `Err` means the prompt could not be issued at all and
    /// is handled like a cancelled request.
    fn request_permission(&self, identity: &DeviceIdentity) -> common::Result<()>;

    /// Whether the OS already grants access without prompting
    fn has_permission(&self, identity: &DeviceIdentity) -> bool;
}

/// Per-device permission state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionState {
    Unrequested,
    Pending,
    Granted,
    Denied,
}

/// When the controller prompts automatically on attach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromptPolicy {
    /// Prompt on every attach
    #[default]
    Always,
    /// Skip the automatic prompt for a VID:PID the user denied earlier in this process
    UnlessDenied,
    /// Only request when the OS already grants access, so no dialog appears
    PreGrantedOnly,
}

/// Result of a permission request
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// State moved to `Pending`; the caller must issue the OS prompt
    Prompt,
    /// A prompt is already outstanding; nothing to do
    AlreadyPending,
    /// Access is already granted
    AlreadyGranted,
}

/// Effect of a permission outcome on the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State changed
    Applied {
        from: PermissionState,
        to: PermissionState,
    },
    /// Device is tracked but the outcome does not change its state
    Unchanged(PermissionState),
    /// Device is not tracked (already detached); outcome discarded
    Stale,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }
}

/// Permission state tracker
#[derive(Debug, Default)]
pub struct PermissionGate {
    states: HashMap<DeviceId, PermissionState>,
    policy: PromptPolicy,
    /// VID:PID pairs denied in this process, kept across detach
    session_denials: HashSet<(u16, u16)>,
}

impl PermissionGate {
    pub fn new(policy: PromptPolicy) -> Self {
        Self {
            states: HashMap::new(),
            policy,
            session_denials: HashSet::new(),
        }
    }

    pub fn policy(&self) -> PromptPolicy {
        self.policy
    }

    /// Start tracking a newly registered device
    pub fn track(&mut self, identity: &DeviceIdentity) {
        self.states
            .entry(identity.id())
            .or_insert(PermissionState::Unrequested);
    }

    /// Stop tracking a removed device
    pub fn forget(&mut self, id: DeviceId) -> Option<PermissionState> {
        self.states.remove(&id)
    }

    pub fn state(&self, id: DeviceId) -> Option<PermissionState> {
        self.states.get(&id).copied()
    }

    pub fn has_permission(&self, id: DeviceId) -> bool {
        self.state(id) == Some(PermissionState::Granted)
    }

    /// Whether attach should trigger a request under the configured policy
    pub fn should_auto_request(
        &self,
        identity: &DeviceIdentity,
        host_has_permission: bool,
    ) -> bool {
        match self.policy {
            PromptPolicy::Always => true,
            PromptPolicy::UnlessDenied => !self.was_denied(identity),
            PromptPolicy::PreGrantedOnly => host_has_permission,
        }
    }

    /// Whether this VID:PID was denied earlier in this process
    pub fn was_denied(&self, identity: &DeviceIdentity) -> bool {
        self.session_denials
            .contains(&(identity.vendor_id(), identity.product_id()))
    }

    /// Request permission for a tracked device
    pub fn request(&mut self, id: DeviceId) -> Result<RequestOutcome> {
        let state = self
            .states
            .get_mut(&id)
            .ok_or(LifecycleError::UnknownDevice(id))?;

        match *state {
            PermissionState::Unrequested | PermissionState::Denied => {
                debug!("Permission {:?} -> Pending for device {}", state, id);
                *state = PermissionState::Pending;
                Ok(RequestOutcome::Prompt)
            }
            PermissionState::Pending => {
                debug!("Permission request already pending for device {}", id);
                Ok(RequestOutcome::AlreadyPending)
            }
            PermissionState::Granted => Ok(RequestOutcome::AlreadyGranted),
        }
    }

    /// OS reported a grant
    pub fn on_grant(&mut self, identity: &DeviceIdentity) -> Transition {
        let transition = self.transition(identity.id(), PermissionState::Granted);
        if transition.is_applied() {
            self.session_denials
                .remove(&(identity.vendor_id(), identity.product_id()));
        }
        transition
    }

    /// OS reported an explicit denial
    pub fn on_deny(&mut self, identity: &DeviceIdentity) -> Transition {
        let transition = self.transition(identity.id(), PermissionState::Denied);
        if transition.is_applied() {
            self.session_denials
                .insert((identity.vendor_id(), identity.product_id()));
        }
        transition
    }

    /// Prompt was dismissed or failed; handled like a denial but not remembered
    pub fn on_cancel(&mut self, identity: &DeviceIdentity) -> Transition {
        self.transition(identity.id(), PermissionState::Denied)
    }

    /// A granted control channel went away
    pub fn revoke(&mut self, id: DeviceId) -> Transition {
        match self.state(id) {
            None => Transition::Stale,
            Some(PermissionState::Granted) => self.transition(id, PermissionState::Denied),
            Some(other) => Transition::Unchanged(other),
        }
    }

    fn transition(&mut self, id: DeviceId, to: PermissionState) -> Transition {
        let Some(state) = self.states.get_mut(&id) else {
            return Transition::Stale;
        };

        if *state == to {
            return Transition::Unchanged(to);
        }

        let from = *state;
        *state = to;
        debug!("Permission {:?} -> {:?} for device {}", from, to, id);
        Transition::Applied { from, to }
    }
}
