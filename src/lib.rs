//! # Notchnet Core Library
//!
//! Session coordinator for networks of wireless motion-capture sensors:
//! - Discovery and network formation against a workout definition
//! - All-or-nothing configuration and capture across every bound device
//! - Timed captures with automatic stop
//! - Cancellable operations with exactly-once outcomes
//! - Sequential download of recorded data into any async sink
//!
//! ## Example
//!
//! ```rust,no_run
//! use notchnet_core::{
//!     DeviceSlot, LedColor, NotchService, ServiceConfig, SimulatedDevice, SimulatedDiscovery,
//!     Workout,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let discovery = Arc::new(SimulatedDiscovery::new([
//!         SimulatedDevice::standard("C0:01"),
//!         SimulatedDevice::standard("C0:02"),
//!     ]));
//!     let service = NotchService::new(discovery, ServiceConfig::default());
//!
//!     let workout = Workout::new("arms")
//!         .with_slot(DeviceSlot::new("left", LedColor::RED))
//!         .with_slot(DeviceSlot::new("right", LedColor::BLUE));
//!     service.init(workout).result().await?;
//!     service.configure_capture(true).result().await?;
//!
//!     service.capture().result().await?;
//!     let measurement = service.stop().result().await?;
//!
//!     let output = service.download(measurement, Vec::new()).result().await?;
//!     println!("{} bytes", output.report.total_bytes);
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{exit_code_for, CliResult, ExitCodes, OutputFormat};
pub use crate::config::{AppConfig, ConfigError};
pub use crate::core::cancellation::{
    CancelHandle, Operation, OperationId, OperationKind, Outcome, PendingOperation, TimedOperation,
};
pub use crate::core::descriptor::{CaptureKind, Descriptor, Measurement, SteadySession};
pub use crate::core::device::{
    DeviceAddress, DeviceCommand, DeviceLink, DiscoveredDevice, Discovery, LinkError, NotchDevice,
    SimulatedDevice, SimulatedDeviceConfig, SimulatedDiscovery,
};
pub use crate::core::download::{DownloadFrame, DownloadOutput, DownloadReport};
pub use crate::core::error::NotchError;
pub use crate::core::registry::{CompatibilityError, NotchNetwork};
pub use crate::core::service::{NotchService, ServiceConfig, ServiceEvent};
pub use crate::core::state_machine::{ArmedMode, SessionState, StateTransition};
pub use crate::core::workout::{CaptureMode, DeviceSlot, LedColor, Workout};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
