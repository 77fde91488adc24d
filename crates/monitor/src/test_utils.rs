//! Test doubles for the lifecycle core
//!
//! [`MockHost`] stands in for the OS permission subsystem and records every
//! prompt it is asked to show. [`MockTransport`] counts opened and closed
//! sessions. [`RecordingObserver`] keeps every event it receives.

use crate::capture::{CaptureConfig, CaptureSession, CaptureTransport, TransportError};
use crate::lifecycle::{LifecycleEvent, LifecycleObserver};
use common::{ControlBlock, DeviceId, DeviceIdentity};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Host subsystem double
#[derive(Debug, Default)]
pub struct MockHost {
    prompts: Mutex<Vec<DeviceId>>,
    pre_granted: AtomicBool,
    fail_prompts: AtomicBool,
    permission_checks: AtomicUsize,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report every device as already accessible
    pub fn set_pre_granted(&self, pre_granted: bool) {
        self.pre_granted.store(pre_granted, Ordering::SeqCst);
    }

    /// Make `request_permission` fail
    pub fn fail_prompts(&self, fail: bool) {
        self.fail_prompts.store(fail, Ordering::SeqCst);
    }

    /// Devices prompted for, in call order
    pub fn prompts(&self) -> Vec<DeviceId> {
        self.prompts.lock().unwrap().clone()
    }

    /// How often the controller asked whether access is already granted
    pub fn permission_checks(&self) -> usize {
        self.permission_checks.load(Ordering::SeqCst)
    }

    pub fn prompt_count(&self, id: DeviceId) -> usize {
        self.prompts.lock().unwrap().iter().filter(|p| **p == id).count()
    }
}

impl crate::lifecycle::HostSubsystem for MockHost {
    fn request_permission(&self, identity: &DeviceIdentity) -> common::Result<()> {
        self.prompts.lock().unwrap().push(identity.id());
        if self.fail_prompts.load(Ordering::SeqCst) {
            return Err(common::Error::Usb("prompt unavailable".to_string()));
        }
        Ok(())
    }

    fn has_permission(&self, _identity: &DeviceIdentity) -> bool {
        self.permission_checks.fetch_add(1, Ordering::SeqCst);
        self.pre_granted.load(Ordering::SeqCst)
    }
}

/// Capture transport double
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    failure: Option<String>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport whose every open fails with `message`
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Sessions opened so far
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Sessions closed so far
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl CaptureTransport for MockTransport {
    fn open(
        &self,
        _identity: &DeviceIdentity,
        channel: &dyn ControlBlock,
        config: &CaptureConfig,
    ) -> Result<Box<dyn CaptureSession>, TransportError> {
        if let Some(message) = &self.failure {
            return Err(TransportError::new(message.clone()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            device_id: channel.device_id(),
            width: config.preview_width,
            height: config.preview_height,
            closed: self.closed.clone(),
        }))
    }
}

struct MockSession {
    device_id: DeviceId,
    width: u32,
    height: u32,
    closed: Arc<AtomicUsize>,
}

impl CaptureSession for MockSession {
    fn describe(&self) -> String {
        format!("mock session {} {}x{}", self.device_id, self.width, self.height)
    }

    fn close(self: Box<Self>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Observer that records every event
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Event kinds in delivery order
    pub fn kinds(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.kind().to_string())
            .collect()
    }
}

impl LifecycleObserver for RecordingObserver {
    fn on_event(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
