//! Device identity and the link abstraction
//!
//! Provides:
//! - Stable device addresses and discovered device metadata
//! - The command/response vocabulary spoken to a sensor
//! - The `DeviceLink` and `Discovery` traits implemented by transports
//! - A simulated transport for development and tests

pub mod simulated;

pub use simulated::{SimulatedDevice, SimulatedDeviceConfig, SimulatedDiscovery};

use crate::core::capability::CapabilitySet;
use crate::core::workout::LedColor;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Stable device address (MAC or platform-specific id)
///
/// Addresses are normalized to upper case so that ordering is stable
/// regardless of how the transport reports them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Create a normalized address
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_uppercase())
    }

    /// Get the address string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for DeviceAddress {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<DeviceAddress> for String {
    fn from(address: DeviceAddress) -> Self {
        address.0
    }
}

/// Identity of a physical sensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotchDevice {
    /// Device address
    pub address: DeviceAddress,
    /// Advertised name
    pub name: Option<String>,
    /// Firmware version (if reported)
    pub firmware_version: Option<String>,
    /// Capability flags
    pub capabilities: CapabilitySet,
    /// Signal strength at discovery time
    pub rssi: Option<i16>,
}

impl NotchDevice {
    /// Create a new device with address and standard capabilities
    pub fn new(address: impl Into<DeviceAddress>) -> Self {
        Self {
            address: address.into(),
            name: None,
            firmware_version: None,
            capabilities: CapabilitySet::standard(),
            rssi: None,
        }
    }

    /// Set the advertised name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Replace the capability set
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Get display name (name or address if name unknown)
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.address.as_str())
    }
}

/// Command kind, used for logging, failure injection and error reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    Connect,
    Disconnect,
    PowerOff,
    SetColor,
    Erase,
    ConfigureSteady,
    ConfigureCapture,
    StartSteady,
    StopSteady,
    StartCapture,
    StopCapture,
    GetSteadyData,
    Download,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::PowerOff => "power-off",
            Self::SetColor => "set-color",
            Self::Erase => "erase",
            Self::ConfigureSteady => "configure-steady",
            Self::ConfigureCapture => "configure-capture",
            Self::StartSteady => "start-steady",
            Self::StopSteady => "stop-steady",
            Self::StartCapture => "start-capture",
            Self::StopCapture => "stop-capture",
            Self::GetSteadyData => "get-steady-data",
            Self::Download => "download",
        };
        f.write_str(name)
    }
}

/// Logical command sent to one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Establish the link
    Connect,
    /// Release the link
    Disconnect,
    /// Turn the device off
    PowerOff,
    /// Light the status LED
    SetColor { color: LedColor },
    /// Erase onboard flash
    Erase,
    /// Prepare a steady measurement
    ConfigureSteady { color: Option<LedColor> },
    /// Prepare a capture at the slot's sampling rate
    ConfigureCapture {
        frequency_hz: u32,
        color: Option<LedColor>,
    },
    /// Begin a steady measurement
    StartSteady { session: Uuid },
    /// End a steady measurement
    StopSteady { session: Uuid },
    /// Begin recording
    StartCapture { measurement: Uuid },
    /// End recording
    StopCapture { measurement: Uuid },
    /// Read the latest steady data
    GetSteadyData,
    /// Transfer recorded data for a descriptor
    Download { descriptor: Uuid },
}

impl DeviceCommand {
    /// Get command kind
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Connect => CommandKind::Connect,
            Self::Disconnect => CommandKind::Disconnect,
            Self::PowerOff => CommandKind::PowerOff,
            Self::SetColor { .. } => CommandKind::SetColor,
            Self::Erase => CommandKind::Erase,
            Self::ConfigureSteady { .. } => CommandKind::ConfigureSteady,
            Self::ConfigureCapture { .. } => CommandKind::ConfigureCapture,
            Self::StartSteady { .. } => CommandKind::StartSteady,
            Self::StopSteady { .. } => CommandKind::StopSteady,
            Self::StartCapture { .. } => CommandKind::StartCapture,
            Self::StopCapture { .. } => CommandKind::StopCapture,
            Self::GetSteadyData => CommandKind::GetSteadyData,
            Self::Download { .. } => CommandKind::Download,
        }
    }
}

/// Response to a device command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResponse {
    /// Command accepted
    Ack,
    /// Command returned a payload
    Data(Bytes),
}

impl CommandResponse {
    /// Payload bytes, if any
    pub fn into_data(self) -> Option<Bytes> {
        match self {
            Self::Ack => None,
            Self::Data(bytes) => Some(bytes),
        }
    }
}

/// Push notification from a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceNotification {
    /// Battery level report
    Battery { percent: u8 },
    /// Free-form status text
    Status(String),
    /// Link dropped or device powered off
    Disconnected,
}

/// Device-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Device did not answer in time
    #[error("device timed out after {0} ms")]
    Timeout(u64),

    /// Link is not established
    #[error("device disconnected")]
    Disconnected,

    /// Device refused the command
    #[error("command rejected: {0}")]
    Rejected(String),

    /// Transport I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Command not supported by this device
    #[error("unsupported command: {0}")]
    Unsupported(CommandKind),

    /// Device task failed unexpectedly
    #[error("internal error: {0}")]
    Internal(String),
}

/// Request/response and notification primitives for one physical device
///
/// Implementations provide their own retry and timeout policy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Address of the device behind this link
    fn address(&self) -> DeviceAddress;

    /// Send a command and wait for its response
    async fn send_command(&self, command: DeviceCommand) -> Result<CommandResponse, LinkError>;

    /// Subscribe to push notifications
    fn subscribe(&self) -> broadcast::Receiver<DeviceNotification>;
}

/// A device found by discovery together with its link
#[derive(Clone)]
pub struct DiscoveredDevice {
    /// Device identity
    pub device: NotchDevice,
    /// Link to the device
    pub link: Arc<dyn DeviceLink>,
}

impl DiscoveredDevice {
    /// Create a new discovered device
    pub fn new(device: NotchDevice, link: Arc<dyn DeviceLink>) -> Self {
        Self { device, link }
    }

    /// Get device address
    pub fn address(&self) -> &DeviceAddress {
        &self.device.address
    }
}

impl fmt::Debug for DiscoveredDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveredDevice")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// Source of reachable devices (radio scanning, pairing lists, simulators)
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Discover devices for up to `window`
    async fn discover(&self, window: Duration) -> Result<Vec<DiscoveredDevice>, LinkError>;
}
