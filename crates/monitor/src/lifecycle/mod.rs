//! USB camera connection lifecycle
//!
//! - [`permission`]: per-device permission state and prompt serialization
//! - [`registry`]: managed device records, control channels and access handles
//! - [`dispatcher`]: lifecycle event fan-out
//! - [`controller`]: the state machine tying the three together

pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod permission;
pub mod registry;

pub use controller::{ControllerOptions, LifecycleController};
pub use dispatcher::{
    ChannelObserver, DenialReason, DispatchReport, EventDispatcher, LifecycleEvent,
    LifecycleObserver, SubscriptionToken, channel_observer,
};
pub use error::{LifecycleError, Result};
pub use filter::{CameraFilter, FilterParseError, VidPidFilter};
pub use permission::{
    HostSubsystem, PermissionGate, PermissionState, PromptPolicy, RequestOutcome, Transition,
};
pub use registry::{AccessHandle, AttachOutcome, DeviceRecord, DeviceRegistry, DeviceTile};
