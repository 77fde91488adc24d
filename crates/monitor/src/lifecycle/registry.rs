//! Device registry
//!
//! The authoritative map from device identity to its managed record. The
//! registry owns every control channel and access handle; nothing else keeps
//! them past a borrowed reference. Records are kept in attach order so the
//! device list renders stably.

use crate::capture::{CaptureConfig, CaptureSession, CaptureTransport};
use crate::lifecycle::error::{LifecycleError, Result};
use crate::lifecycle::permission::{PermissionGate, PermissionState};
use common::{ControlBlock, DeviceId, DeviceIdentity};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Exclusive access handle for an open capture session
///
/// Closing is idempotent. A handle that is dropped without an explicit
/// close still releases its session.
pub struct AccessHandle {
    device_id: DeviceId,
    session: Option<Box<dyn CaptureSession>>,
    config: CaptureConfig,
    opened_at: Instant,
}

impl AccessHandle {
    fn new(device_id: DeviceId, session: Box<dyn CaptureSession>, config: CaptureConfig) -> Self {
        Self {
            device_id,
            session: Some(session),
            config,
            opened_at: Instant::now(),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Configuration the session was opened with
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Release the session
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(
                "Closing {} on device {} after {:?}",
                session.describe(),
                self.device_id,
                self.opened_at.elapsed()
            );
            session.close();
        }
    }
}

impl Drop for AccessHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for AccessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessHandle")
            .field("device_id", &self.device_id)
            .field("open", &self.session.is_some())
            .field("opened_at", &self.opened_at)
            .finish()
    }
}

/// Transport binding of a record
///
/// A session can only exist on a bound record, and a record is only bound
/// after its permission was granted.
#[derive(Debug)]
enum Binding {
    Unbound,
    Bound {
        channel: Box<dyn ControlBlock>,
        session: Option<AccessHandle>,
    },
}

/// Managed device record
#[derive(Debug)]
pub struct DeviceRecord {
    identity: DeviceIdentity,
    binding: Binding,
    attached_at: Instant,
}

impl DeviceRecord {
    fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            binding: Binding::Unbound,
            attached_at: Instant::now(),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn attached_at(&self) -> Instant {
        self.attached_at
    }

    pub fn has_channel(&self) -> bool {
        matches!(self.binding, Binding::Bound { .. })
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.binding,
            Binding::Bound {
                session: Some(_),
                ..
            }
        )
    }

    /// Close the session if one is open; returns whether one was
    fn close_session(&mut self) -> bool {
        match &mut self.binding {
            Binding::Bound { session, .. } => match session.take() {
                Some(handle) => {
                    handle.close();
                    true
                }
                None => false,
            },
            Binding::Unbound => false,
        }
    }

    /// Close the session, then drop the control channel
    fn unbind(&mut self) {
        self.close_session();
        if let Binding::Bound { channel, .. } =
            std::mem::replace(&mut self.binding, Binding::Unbound)
        {
            debug!(
                "Releasing {} for device {}",
                channel.describe(),
                self.identity.id()
            );
        }
    }
}

/// Snapshot row of the device list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceTile {
    pub identity: DeviceIdentity,
    pub permission: PermissionState,
    pub open: bool,
}

/// Result of registering an attached device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Inserted,
    /// Already registered; duplicate notifications are idempotent
    Duplicate,
}

/// Registry of managed devices
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    records: HashMap<DeviceId, DeviceRecord>,
    /// Attach order of device ids
    order: Vec<DeviceId>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn get(&self, id: DeviceId) -> Option<&DeviceRecord> {
        self.records.get(&id)
    }

    pub fn identity(&self, id: DeviceId) -> Option<&DeviceIdentity> {
        self.records.get(&id).map(|r| r.identity())
    }

    pub fn is_open(&self, id: DeviceId) -> bool {
        self.records.get(&id).is_some_and(|r| r.is_open())
    }

    /// Device ids in attach order
    pub fn ids(&self) -> &[DeviceId] {
        &self.order
    }

    /// Register an attached device
    pub fn on_attach(&mut self, identity: DeviceIdentity) -> AttachOutcome {
        let id = identity.id();
        if self.records.contains_key(&id) {
            debug!("Device {} already registered", id);
            return AttachOutcome::Duplicate;
        }

        debug!("Registered device {}: {}", id, identity);
        self.records.insert(id, DeviceRecord::new(identity));
        self.order.push(id);
        AttachOutcome::Inserted
    }

    /// Remove a detached device
    ///
    /// Any open handle is closed and the channel released before the record
    /// leaves the map. Returns the identity of the removed record.
    pub fn on_detach(&mut self, id: DeviceId) -> Option<DeviceIdentity> {
        let record = self.records.get_mut(&id)?;
        if record.is_open() {
            info!("Force-closing device {} on detach", id);
        }
        record.unbind();

        let record = self.records.remove(&id)?;
        self.order.retain(|existing| *existing != id);
        debug!(
            "Removed device {} after {:?}",
            id,
            record.attached_at().elapsed()
        );
        Some(record.identity)
    }

    /// Open a capture session on a granted device
    pub fn open(
        &mut self,
        id: DeviceId,
        config: &CaptureConfig,
        gate: &PermissionGate,
        transport: &dyn CaptureTransport,
    ) -> Result<()> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(LifecycleError::UnknownDevice(id))?;

        if !gate.has_permission(id) {
            return Err(LifecycleError::NotPermitted(id));
        }

        match &mut record.binding {
            Binding::Unbound => Err(LifecycleError::NotPermitted(id)),
            Binding::Bound {
                session: Some(_), ..
            } => Err(LifecycleError::AlreadyOpen(id)),
            Binding::Bound { channel, session } => {
                let opened = transport
                    .open(&record.identity, &**channel, config)
                    .map_err(|e| {
                        warn!("Failed to open device {}: {}", id, e);
                        LifecycleError::Transport {
                            device: id,
                            message: e.to_string(),
                        }
                    })?;

                info!(
                    "Opened {} on device {} ({}x{})",
                    opened.describe(),
                    id,
                    config.preview_width,
                    config.preview_height
                );
                *session = Some(AccessHandle::new(id, opened, config.clone()));
                Ok(())
            }
        }
    }

    /// Close the session of a device
    ///
    /// Returns `Ok(false)` when no session was open.
    pub fn close(&mut self, id: DeviceId) -> Result<bool> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(LifecycleError::UnknownDevice(id))?;
        Ok(record.close_session())
    }

    /// Bind or revoke the control channel of a device
    ///
    /// `None` revokes the binding and closes any open session first.
    pub fn set_control_channel(
        &mut self,
        id: DeviceId,
        channel: Option<Box<dyn ControlBlock>>,
    ) -> Result<()> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(LifecycleError::UnknownDevice(id))?;

        match channel {
            Some(channel) => {
                if record.is_open() {
                    warn!("Rebinding device {} closes its open session", id);
                }
                record.unbind();
                debug!("Bound {} to device {}", channel.describe(), id);
                record.binding = Binding::Bound {
                    channel,
                    session: None,
                };
            }
            None => record.unbind(),
        }
        Ok(())
    }

    /// Close every session and drop every record
    pub fn clear(&mut self) -> Vec<DeviceIdentity> {
        let ids = std::mem::take(&mut self.order);
        ids.into_iter()
            .filter_map(|id| {
                let mut record = self.records.remove(&id)?;
                record.unbind();
                Some(record.identity)
            })
            .collect()
    }

    /// Ordered snapshot of the registry
    pub fn tiles(&self, gate: &PermissionGate) -> Vec<DeviceTile> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .map(|record| DeviceTile {
                identity: record.identity.clone(),
                permission: gate
                    .state(record.identity.id())
                    .unwrap_or(PermissionState::Unrequested),
                open: record.is_open(),
            })
            .collect()
    }
}
