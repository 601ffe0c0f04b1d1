//! Session State Machine
//!
//! Owns the session lifecycle state, the armed capture mode, the single bound
//! network and the transition history. Every service operation is checked
//! here before it touches a device.

use super::cancellation::OperationKind;
use super::descriptor::{CaptureKind, Measurement};
use super::device::DeviceAddress;
use super::error::NotchError;
use super::registry::{Assignment, NetworkMember, NotchNetwork};
use super::timer::CaptureTimer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

/// Default number of transitions kept in the history
pub const DEFAULT_HISTORY_SIZE: usize = 100;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// No network bound
    Uninitialized,
    /// Discovering devices for a network
    Scanning,
    /// Connecting the devices of a new network
    Initializing,
    /// Network bound and idle
    Ready,
    /// Preparing a capture mode
    Configuring,
    /// Devices are recording
    Capturing,
    /// Stopping a capture
    Stopping,
    /// Retrieving recorded data
    Downloading,
    /// Disconnecting or powering off the network
    ShuttingDown,
    /// A lifecycle transition failed; devices may be in any state
    Error,
}

impl SessionState {
    /// All states
    pub const ALL: &'static [SessionState] = &[
        Self::Uninitialized,
        Self::Scanning,
        Self::Initializing,
        Self::Ready,
        Self::Configuring,
        Self::Capturing,
        Self::Stopping,
        Self::Downloading,
        Self::ShuttingDown,
        Self::Error,
    ];

    /// Check if state is a transitional state
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            Self::Scanning
                | Self::Initializing
                | Self::Configuring
                | Self::Stopping
                | Self::Downloading
                | Self::ShuttingDown
        )
    }

    /// Check if a network is expected to be bound
    pub fn has_network(&self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Configuring | Self::Capturing | Self::Stopping | Self::Downloading
        )
    }

    /// States from which a transition to `self` is valid
    fn sources(&self) -> &'static [SessionState] {
        use SessionState::*;

        match self {
            Uninitialized => &[Scanning, ShuttingDown],
            Scanning => &[Uninitialized, Ready, Error],
            Initializing => &[Scanning],
            // Scanning -> Ready reverts an init whose workout could not be resolved
            Ready => &[Scanning, Initializing, Configuring, Capturing, Stopping, Downloading],
            Configuring => &[Ready],
            Capturing => &[Ready],
            Stopping => &[Capturing],
            Downloading => &[Ready],
            ShuttingDown => &[Ready, Error],
            Error => &[Scanning, Initializing, Configuring, Capturing, Stopping, ShuttingDown],
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "Uninitialized",
            Self::Scanning => "Scanning",
            Self::Initializing => "Initializing",
            Self::Ready => "Ready",
            Self::Configuring => "Configuring",
            Self::Capturing => "Capturing",
            Self::Stopping => "Stopping",
            Self::Downloading => "Downloading",
            Self::ShuttingDown => "ShuttingDown",
            Self::Error => "Error",
        };
        f.write_str(name)
    }
}

/// States from which an operation may start
pub fn required_states(kind: OperationKind) -> &'static [SessionState] {
    use SessionState::*;

    match kind {
        OperationKind::Scan | OperationKind::ScanForNew => SessionState::ALL,
        OperationKind::Init | OperationKind::UncheckedInit => &[Uninitialized, Ready, Error],
        OperationKind::Stop => &[Capturing],
        OperationKind::Disconnect | OperationKind::ShutDown => &[Ready, Error],
        OperationKind::Color
        | OperationKind::Erase
        | OperationKind::ConfigureSteady
        | OperationKind::ConfigureCapture
        | OperationKind::ConfigureTimedCapture
        | OperationKind::Steady
        | OperationKind::Capture
        | OperationKind::TimedCapture
        | OperationKind::Download
        | OperationKind::GetSteadyData => &[Ready],
    }
}

/// Prepared capture mode (sub-state of `Ready`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum ArmedMode {
    Steady { show_colors: bool },
    Capture { show_colors: bool },
    TimedCapture { duration: Duration, show_colors: bool },
}

impl ArmedMode {
    pub fn kind(&self) -> CaptureKind {
        match self {
            Self::Steady { .. } => CaptureKind::Steady,
            Self::Capture { .. } => CaptureKind::Capture,
            Self::TimedCapture { .. } => CaptureKind::TimedCapture,
        }
    }

    pub fn show_colors(&self) -> bool {
        match self {
            Self::Steady { show_colors }
            | Self::Capture { show_colors }
            | Self::TimedCapture { show_colors, .. } => *show_colors,
        }
    }
}

/// State transition event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state
    pub from: SessionState,
    /// New state
    pub to: SessionState,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Reason for transition
    pub reason: Option<String>,
}

/// Capture in progress
pub struct ActiveCapture {
    pub id: Uuid,
    pub kind: CaptureKind,
    pub generation: u64,
    pub devices: Vec<DeviceAddress>,
    pub started_at: DateTime<Utc>,
    /// Auto-stop timer of a timed capture
    pub timer: Option<CaptureTimer>,
    /// Waiter of a timed capture
    pub completion: Option<oneshot::Sender<Result<Measurement, NotchError>>>,
}

impl ActiveCapture {
    pub fn new(id: Uuid, kind: CaptureKind, network: &NotchNetwork) -> Self {
        Self {
            id,
            kind,
            generation: network.generation(),
            devices: network.addresses(),
            started_at: Utc::now(),
            timer: None,
            completion: None,
        }
    }

    /// Build the measurement for a capture that stopped now
    pub fn measurement(&self) -> Measurement {
        Measurement {
            id: self.id,
            generation: self.generation,
            kind: self.kind,
            devices: self.devices.clone(),
            started_at: self.started_at,
            stopped_at: Utc::now(),
        }
    }

    /// Deliver the final result to a timed-capture waiter, if any
    pub fn resolve(&mut self, result: Result<Measurement, NotchError>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }
}

impl fmt::Debug for ActiveCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveCapture")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("generation", &self.generation)
            .field("deadline", &self.timer.as_ref().and_then(CaptureTimer::deadline))
            .finish_non_exhaustive()
    }
}

type TransitionCallback = Box<dyn Fn(&StateTransition) + Send + Sync>;

/// Session state machine
pub struct SessionStateMachine {
    /// Current state
    state: SessionState,
    /// Prepared capture mode
    armed: Option<ArmedMode>,
    /// Bound network
    network: Option<NotchNetwork>,
    /// Members of a network released into `Error`
    stranded: Vec<NetworkMember>,
    /// Capture in progress
    active: Option<ActiveCapture>,
    /// Last bind generation
    generation: u64,
    /// Bounded transition history
    history: VecDeque<StateTransition>,
    /// Max history size
    max_history: usize,
    /// Last state change time
    last_transition: Option<Instant>,
    /// State change callback
    on_state_change: Option<TransitionCallback>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    /// Create a new state machine
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY_SIZE)
    }

    /// Create with a custom history bound
    pub fn with_history(max_history: usize) -> Self {
        Self {
            state: SessionState::Uninitialized,
            armed: None,
            network: None,
            stranded: Vec::new(),
            active: None,
            generation: 0,
            history: VecDeque::with_capacity(max_history.min(DEFAULT_HISTORY_SIZE)),
            max_history: max_history.max(1),
            last_transition: None,
            on_state_change: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Get armed capture mode
    pub fn armed(&self) -> Option<ArmedMode> {
        self.armed
    }

    /// Get bound network
    pub fn network(&self) -> Option<&NotchNetwork> {
        self.network.as_ref()
    }

    /// Members stranded by the last failure
    pub fn stranded(&self) -> &[NetworkMember] {
        &self.stranded
    }

    /// Get last bind generation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Get state history, oldest first
    pub fn history(&self) -> Vec<StateTransition> {
        self.history.iter().cloned().collect()
    }

    /// Get time in current state
    pub fn time_in_state(&self) -> Option<Duration> {
        self.last_transition.map(|t| t.elapsed())
    }

    /// Capture in progress
    pub fn active(&self) -> Option<&ActiveCapture> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut ActiveCapture> {
        self.active.as_mut()
    }

    /// Set state change callback
    pub fn on_state_change<F>(&mut self, callback: F)
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Box::new(callback));
    }

    /// Check that `kind` may start now
    pub fn check(&self, kind: OperationKind) -> Result<(), NotchError> {
        let required = required_states(kind);
        if !required.contains(&self.state) {
            return Err(NotchError::InvalidState {
                current: self.state,
                required,
            });
        }

        let requested = match kind {
            OperationKind::Steady => CaptureKind::Steady,
            OperationKind::Capture => CaptureKind::Capture,
            OperationKind::TimedCapture => CaptureKind::TimedCapture,
            OperationKind::Stop => {
                return match &self.active {
                    Some(active) if active.kind != CaptureKind::Steady => Ok(()),
                    _ => Err(NotchError::InvalidState {
                        current: self.state,
                        required,
                    }),
                };
            }
            _ => return Ok(()),
        };

        let armed = self.armed.map(|mode| mode.kind());
        if armed != Some(requested) {
            return Err(NotchError::ModeMismatch { armed, requested });
        }
        Ok(())
    }

    /// Transition to a new state
    pub fn transition(
        &mut self,
        new_state: SessionState,
        reason: impl Into<String>,
    ) -> Result<(), NotchError> {
        if new_state == self.state {
            return Ok(());
        }
        if !new_state.sources().contains(&self.state) {
            warn!("rejected transition {} -> {}", self.state, new_state);
            return Err(NotchError::InvalidState {
                current: self.state,
                required: new_state.sources(),
            });
        }

        let transition = StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason: Some(reason.into()),
        };
        info!(
            "session {} -> {} ({})",
            transition.from,
            transition.to,
            transition.reason.as_deref().unwrap_or_default()
        );

        self.history.push_back(transition.clone());
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }

        self.state = new_state;
        self.last_transition = Some(Instant::now());

        if let Some(ref callback) = self.on_state_change {
            callback(&transition);
        }

        Ok(())
    }

    /// Bind a resolved assignment as the new network
    ///
    /// Bumps the generation and clears the armed mode and stranded links.
    pub fn bind(&mut self, assignment: Assignment) -> NotchNetwork {
        self.generation += 1;
        let network = NotchNetwork::new(self.generation, assignment);
        self.network = Some(network.clone());
        self.armed = None;
        self.stranded.clear();
        network
    }

    /// Drop the network (and anything that depends on it)
    pub fn release(&mut self) -> Option<NotchNetwork> {
        self.armed = None;
        self.stop_active();
        self.network.take()
    }

    /// Drop the network and forget stranded links
    pub fn reset(&mut self) -> Option<NotchNetwork> {
        self.stranded.clear();
        self.release()
    }

    /// Members a teardown should address: the network, or the stranded links
    pub fn teardown_targets(&self) -> Vec<NetworkMember> {
        match &self.network {
            Some(network) => network.members().to_vec(),
            None => self.stranded.clone(),
        }
    }

    /// Enter `Error`, stranding the network members plus `extra`
    pub fn fail(&mut self, reason: impl Into<String>, extra: Vec<NetworkMember>) {
        let mut stranded = std::mem::take(&mut self.stranded);
        let released = self.release().map(|n| n.members().to_vec()).unwrap_or_default();
        for member in released.into_iter().chain(extra) {
            if !stranded.iter().any(|m| m.address() == member.address()) {
                stranded.push(member);
            }
        }
        self.stranded = stranded;

        if let Err(err) = self.transition(SessionState::Error, reason) {
            warn!("cannot enter error state: {}", err);
        }
    }

    /// Enter `Error` after a teardown, stranding exactly `members`
    pub fn fail_teardown(&mut self, reason: impl Into<String>, members: Vec<NetworkMember>) {
        self.release();
        self.stranded = members;
        if let Err(err) = self.transition(SessionState::Error, reason) {
            warn!("cannot enter error state: {}", err);
        }
    }

    /// Record the prepared capture mode
    pub fn arm(&mut self, mode: ArmedMode) {
        self.armed = Some(mode);
    }

    /// Consume the prepared capture mode
    pub fn take_armed(&mut self) -> Option<ArmedMode> {
        self.armed.take()
    }

    /// Register the capture that just started
    pub fn begin_capture(&mut self, capture: ActiveCapture) {
        self.stop_active();
        self.active = Some(capture);
    }

    /// Take the capture in progress, disarming its timer
    pub fn take_active(&mut self) -> Option<ActiveCapture> {
        let mut active = self.active.take()?;
        if let Some(timer) = active.timer.as_mut() {
            timer.cancel();
        }
        Some(active)
    }

    fn stop_active(&mut self) {
        if let Some(mut active) = self.take_active() {
            active.resolve(Err(NotchError::Abandoned));
        }
    }
}
