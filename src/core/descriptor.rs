//! Measurement descriptors
//!
//! Opaque handles returned by steady and capture operations. A descriptor is
//! only valid for the network generation that produced it.

use super::device::DeviceAddress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kind of capture a session can be armed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureKind {
    /// Steady (calibration) measurement
    Steady,
    /// Unbounded capture
    Capture,
    /// Fixed-length capture
    TimedCapture,
}

impl fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Steady => write!(f, "steady"),
            Self::Capture => write!(f, "capture"),
            Self::TimedCapture => write!(f, "timed capture"),
        }
    }
}

/// Result of a steady measurement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SteadySession {
    /// Unique id, also sent to the devices
    pub id: Uuid,
    /// Network generation that produced it
    pub generation: u64,
    /// Device addresses in slot order
    pub devices: Vec<DeviceAddress>,
    /// Start of the steady window
    pub started_at: DateTime<Utc>,
    /// End of the steady window
    pub stopped_at: DateTime<Utc>,
}

/// Result of a capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    /// Unique id, also sent to the devices
    pub id: Uuid,
    /// Network generation that produced it
    pub generation: u64,
    /// Capture kind that produced it
    pub kind: CaptureKind,
    /// Device addresses in slot order
    pub devices: Vec<DeviceAddress>,
    /// When every device acknowledged the start
    pub started_at: DateTime<Utc>,
    /// When every device acknowledged the stop
    pub stopped_at: DateTime<Utc>,
}

impl Measurement {
    /// Wall-clock length of the capture
    pub fn duration(&self) -> chrono::Duration {
        self.stopped_at - self.started_at
    }
}

/// Anything that can be downloaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Descriptor {
    /// Steady data
    Steady(SteadySession),
    /// Capture data
    Capture(Measurement),
}

impl Descriptor {
    /// Descriptor id
    pub fn id(&self) -> Uuid {
        match self {
            Self::Steady(s) => s.id,
            Self::Capture(m) => m.id,
        }
    }

    /// Producing network generation
    pub fn generation(&self) -> u64 {
        match self {
            Self::Steady(s) => s.generation,
            Self::Capture(m) => m.generation,
        }
    }

    /// Device addresses in slot order
    pub fn devices(&self) -> &[DeviceAddress] {
        match self {
            Self::Steady(s) => &s.devices,
            Self::Capture(m) => &m.devices,
        }
    }
}

impl From<SteadySession> for Descriptor {
    fn from(session: SteadySession) -> Self {
        Self::Steady(session)
    }
}

impl From<Measurement> for Descriptor {
    fn from(measurement: Measurement) -> Self {
        Self::Capture(measurement)
    }
}
