//! Capture transport seam
//!
//! The lifecycle core does not stream video. Once a device is granted, the
//! registry asks a [`CaptureTransport`] to open a session on the device's
//! control channel and keeps the returned [`CaptureSession`] as the device's
//! access handle. [`CaptureConfig`] is forwarded to the transport untouched.

use common::{ControlBlock, DeviceIdentity};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rendering backend requested from the capture pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderMode {
    #[default]
    OpenGl,
    Normal,
}

/// Default preview rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    #[serde(rename = "0")]
    Angle0,
    #[serde(rename = "90")]
    Angle90,
    #[serde(rename = "180")]
    Angle180,
    #[serde(rename = "270")]
    Angle270,
}

impl Rotation {
    pub fn degrees(&self) -> u16 {
        match self {
            Rotation::Angle0 => 0,
            Rotation::Angle90 => 90,
            Rotation::Angle180 => 180,
            Rotation::Angle270 => 270,
        }
    }
}

/// Audio source paired with the video stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AudioSource {
    None,
    #[default]
    Auto,
    Mic,
}

/// Opaque capture configuration handed to the transport on open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Preview width in pixels
    pub preview_width: u32,
    /// Preview height in pixels
    pub preview_height: u32,
    pub render_mode: RenderMode,
    pub rotation: Rotation,
    pub audio_source: AudioSource,
    /// Keep the preview's aspect ratio when displayed
    pub aspect_ratio_show: bool,
    /// Deliver raw still images
    pub capture_raw_image: bool,
    /// Deliver raw preview frames
    pub raw_preview_data: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            preview_width: 1280,
            preview_height: 720,
            render_mode: RenderMode::default(),
            rotation: Rotation::default(),
            audio_source: AudioSource::default(),
            aspect_ratio_show: true,
            capture_raw_image: false,
            raw_preview_data: false,
        }
    }
}

/// Error reported by a capture transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// An open capture session on a device
pub trait CaptureSession: Send {
    /// Short description for logs
    fn describe(&self) -> String {
        "capture session".to_string()
    }

    /// Release everything the session holds
    fn close(self: Box<Self>);
}

/// Capture/transport layer that turns a control channel into a session
pub trait CaptureTransport: Send + Sync {
    fn open(
        &self,
        identity: &DeviceIdentity,
        channel: &dyn ControlBlock,
        config: &CaptureConfig,
    ) -> Result<Box<dyn CaptureSession>, TransportError>;
}
