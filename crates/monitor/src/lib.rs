//! USB camera connection lifecycle manager
//!
//! Tracks camera attach/detach, serializes OS permission prompts, owns the
//! control channel and capture session of every granted device, and fans
//! normalized lifecycle events out to subscribers.

pub mod capture;
pub mod config;
pub mod host;
pub mod lifecycle;
pub mod test_utils;

pub use capture::{CaptureConfig, CaptureSession, CaptureTransport, TransportError};
pub use config::MonitorConfig;
pub use lifecycle::{
    ControllerOptions, DenialReason, DeviceTile, LifecycleController, LifecycleError,
    LifecycleEvent, LifecycleObserver, PermissionState, PromptPolicy, RequestOutcome,
    SubscriptionToken,
};
