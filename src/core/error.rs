//! Error types shared by the session components

use super::cancellation::OperationKind;
use super::descriptor::CaptureKind;
use super::device::{DeviceAddress, LinkError};
use super::fanout::FanOutFailure;
use super::registry::CompatibilityError;
use super::state_machine::SessionState;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Errors reported by the Notch service and its components
#[derive(Error, Debug, Clone)]
pub enum NotchError {
    /// Operation is not legal in the current session state
    #[error("operation requires state {}, but session is {current}", join_states(.required))]
    InvalidState {
        /// State at the time of the call
        current: SessionState,
        /// States from which the operation is legal
        required: &'static [SessionState],
    },

    /// Workout cannot be satisfied by the available devices
    #[error(transparent)]
    Compatibility(#[from] CompatibilityError),

    /// Capture kind does not match the armed configuration
    #[error("cannot start {requested} capture: {}", describe_armed(.armed))]
    ModeMismatch {
        /// Kind that was prepared, if any
        armed: Option<CaptureKind>,
        /// Kind that was requested
        requested: CaptureKind,
    },

    /// One or more devices failed a fanned-out command
    #[error(transparent)]
    DeviceFailure(#[from] FanOutFailure),

    /// Another lifecycle operation is still running
    #[error("cannot start {requested}: another operation is in progress")]
    OperationInProgress {
        /// Operation that was rejected
        requested: OperationKind,
    },

    /// Operation was cancelled before it produced a result
    #[error("operation cancelled")]
    Cancelled,

    /// Descriptor was produced by a different network
    #[error("descriptor {descriptor} belongs to network generation {descriptor_generation}, current is {current_generation:?}")]
    StaleDescriptor {
        /// Descriptor id
        descriptor: Uuid,
        /// Generation recorded in the descriptor
        descriptor_generation: u64,
        /// Generation of the bound network, if any
        current_generation: Option<u64>,
    },

    /// Fan-out was requested against an empty device set
    #[error("device set is empty")]
    EmptyDeviceSet,

    /// Workout definition is malformed
    #[error("invalid workout: {0}")]
    InvalidWorkout(String),

    /// Sequential download aborted on a device
    #[error("download failed on {address} after {completed} device(s): {source}")]
    DownloadFailed {
        /// Device that failed
        address: DeviceAddress,
        /// Devices fully downloaded before the failure
        completed: usize,
        /// Underlying device error
        #[source]
        source: LinkError,
    },

    /// No device outside the excluded set appeared in time
    #[error("no new device found within {0} ms")]
    NoDeviceFound(u64),

    /// Discovery collaborator failed
    #[error("discovery failed: {0}")]
    Discovery(#[source] LinkError),

    /// Output sink failed
    #[error("output sink error: {0}")]
    Sink(#[source] Arc<std::io::Error>),

    /// A capture timer is already armed
    #[error("capture timer already armed")]
    TimerAlreadyArmed,

    /// Operation task ended without reporting a result
    #[error("operation abandoned before completion")]
    Abandoned,
}

impl From<std::io::Error> for NotchError {
    fn from(err: std::io::Error) -> Self {
        Self::Sink(Arc::new(err))
    }
}

impl NotchError {
    /// Check if this is the cancellation outcome
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Addresses of the devices implicated in this error
    pub fn failed_devices(&self) -> Vec<DeviceAddress> {
        match self {
            Self::DeviceFailure(failure) => failure.failed_addresses(),
            Self::DownloadFailed { address, .. } => vec![address.clone()],
            _ => Vec::new(),
        }
    }
}

fn join_states(states: &[SessionState]) -> String {
    states
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" | ")
}

fn describe_armed(armed: &Option<CaptureKind>) -> String {
    match armed {
        Some(kind) => format!("session is armed for {kind}"),
        None => "session is not armed".to_string(),
    }
}
