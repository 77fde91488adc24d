//! Camera admission filter
//!
//! Only camera-class devices, or devices explicitly allow-listed by VID:PID,
//! reach the registry. Everything else is dropped before any state is created.

use common::RawDevice;
use common::usb_types::class;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error parsing a VID:PID filter pattern
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterParseError {
    #[error(
        "Invalid filter format '{0}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')"
    )]
    Format(String),

    #[error("Invalid {name} '{value}', must start with '0x' (e.g., '0x1234')")]
    MissingPrefix { name: &'static str, value: String },

    #[error("Invalid {name} '{value}', hex part must be 1-4 digits")]
    Length { name: &'static str, value: String },

    #[error("Invalid {name} '{value}', not a valid hex number")]
    NotHex { name: &'static str, value: String },
}

/// A single allow-list entry: `0xVID:0xPID`, with `*` as wildcard on either side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VidPidFilter {
    vendor_id: Option<u16>,
    product_id: Option<u16>,
}

impl VidPidFilter {
    pub fn new(vendor_id: Option<u16>, product_id: Option<u16>) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    /// Check a VID/PID pair against this pattern
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
    }

    fn parse_part(part: &str, name: &'static str) -> Result<Option<u16>, FilterParseError> {
        if part == "*" {
            return Ok(None);
        }

        let hex_part = part
            .strip_prefix("0x")
            .or_else(|| part.strip_prefix("0X"))
            .ok_or_else(|| FilterParseError::MissingPrefix {
                name,
                value: part.to_string(),
            })?;

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(FilterParseError::Length {
                name,
                value: part.to_string(),
            });
        }

        u16::from_str_radix(hex_part, 16)
            .map(Some)
            .map_err(|_| FilterParseError::NotHex {
                name,
                value: part.to_string(),
            })
    }
}

impl FromStr for VidPidFilter {
    type Err = FilterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 2 {
            return Err(FilterParseError::Format(s.to_string()));
        }

        Ok(Self {
            vendor_id: Self::parse_part(parts[0], "VID")?,
            product_id: Self::parse_part(parts[1], "PID")?,
        })
    }
}

impl fmt::Display for VidPidFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vendor_id {
            Some(v) => write!(f, "0x{:04x}", v)?,
            None => write!(f, "*")?,
        }
        match self.product_id {
            Some(p) => write!(f, ":0x{:04x}", p),
            None => write!(f, ":*"),
        }
    }
}

/// Decides which attached devices are managed
#[derive(Debug, Clone)]
pub struct CameraFilter {
    allow_list: Vec<VidPidFilter>,
    camera_only: bool,
}

impl Default for CameraFilter {
    fn default() -> Self {
        Self {
            allow_list: Vec::new(),
            camera_only: true,
        }
    }
}

impl CameraFilter {
    /// Camera-class devices plus the given allow-list
    pub fn new(allow_list: Vec<VidPidFilter>) -> Self {
        Self {
            allow_list,
            camera_only: true,
        }
    }

    /// Parse allow-list patterns as found in the configuration file
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self, FilterParseError> {
        let allow_list = patterns
            .iter()
            .map(|p| p.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(allow_list))
    }

    /// Admit every device regardless of class
    pub fn admit_all() -> Self {
        Self {
            allow_list: Vec::new(),
            camera_only: false,
        }
    }

    pub fn allow_list(&self) -> &[VidPidFilter] {
        &self.allow_list
    }

    /// Whether a device should enter the registry
    pub fn admits(&self, raw: &RawDevice) -> bool {
        !self.camera_only
            || Self::is_camera_class(raw)
            || self
                .allow_list
                .iter()
                .any(|f| f.matches(raw.vendor_id, raw.product_id))
    }

    /// Camera-class detection from descriptors
    ///
    /// A device qualifies when its device class is Video, or when the class
    /// is deferred to interfaces (per-interface or miscellaneous/IAD) and at
    /// least one interface is Video.
    pub fn is_camera_class(raw: &RawDevice) -> bool {
        match raw.class {
            class::VIDEO => true,
            class::PER_INTERFACE | class::MISCELLANEOUS => raw.has_interface_class(class::VIDEO),
            _ => false,
        }
    }
}
