//! Notch service
//!
//! The public asynchronous API. Every operation returns an [`Operation`]
//! handle immediately and runs on the tokio runtime. Lifecycle and
//! device-facing operations claim a single lifecycle lock without waiting;
//! a busy lock fails the call with `OperationInProgress`. State changes are
//! committed only after the device fan-out completed or failed as a whole.

use super::cancellation::{
    CancellationRegistry, Completer, Operation, OperationId, OperationKind, PendingOperation,
    TimedOperation,
};
use super::descriptor::{CaptureKind, Descriptor, Measurement, SteadySession};
use super::device::{
    DeviceAddress, DeviceCommand, DeviceNotification, DiscoveredDevice, Discovery, NotchDevice,
};
use super::download::{DownloadCoordinator, DownloadOutput};
use super::error::NotchError;
use super::fanout::{
    requests_for, FanOutExecutor, FanOutReport, FanOutRequest, DEFAULT_MAX_IN_FLIGHT,
};
use super::registry::{
    merge_candidates, Assignment, CompatibilityError, NetworkMember, NetworkRegistry, NotchNetwork,
};
use super::state_machine::{
    ActiveCapture, ArmedMode, SessionState, SessionStateMachine, StateTransition,
    DEFAULT_HISTORY_SIZE,
};
use super::timer::CaptureTimer;
use super::workout::{DeviceSlot, LedColor, Workout};
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, OwnedMutexGuard};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

type LifecycleGuard = OwnedMutexGuard<()>;

/// Runtime service settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Length of one discovery pass
    pub scan_window: Duration,
    /// How long `scan_for_new` keeps looking
    pub scan_for_new_timeout: Duration,
    /// Length of the steady measurement window
    pub steady_duration: Duration,
    /// Bound on concurrently outstanding device commands
    pub max_in_flight_commands: usize,
    /// Transitions kept in the history
    pub history_size: usize,
    /// Service event channel capacity
    pub event_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            scan_window: Duration::from_secs(2),
            scan_for_new_timeout: Duration::from_secs(10),
            steady_duration: Duration::from_secs(2),
            max_in_flight_commands: DEFAULT_MAX_IN_FLIGHT,
            history_size: DEFAULT_HISTORY_SIZE,
            event_capacity: 256,
        }
    }
}

/// Service events
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// Session state changed
    StateChanged(StateTransition),
    /// A discovery pass finished
    DevicesDiscovered { count: usize },
    /// A network was bound
    NetworkBound {
        generation: u64,
        devices: Vec<DeviceAddress>,
    },
    /// The network was released
    NetworkReleased { generation: u64 },
    /// Every device started recording
    CaptureStarted { id: Uuid, kind: CaptureKind },
    /// Every device stopped recording
    CaptureStopped { id: Uuid, kind: CaptureKind },
    /// Notification from a bound device
    Device {
        address: DeviceAddress,
        notification: DeviceNotification,
    },
}

struct ServiceInner {
    config: ServiceConfig,
    discovery: Arc<dyn Discovery>,
    machine: Mutex<SessionStateMachine>,
    lifecycle: Arc<tokio::sync::Mutex<()>>,
    operations: CancellationRegistry,
    fanout: FanOutExecutor,
    registry: NetworkRegistry,
    downloads: DownloadCoordinator,
    known: Mutex<BTreeMap<DeviceAddress, DiscoveredDevice>>,
    events: broadcast::Sender<ServiceEvent>,
    watchers: Mutex<CancellationToken>,
}

/// Coordinator for one network of Notch devices
#[derive(Clone)]
pub struct NotchService {
    inner: Arc<ServiceInner>,
}

impl NotchService {
    /// Create a service over `discovery`
    pub fn new(discovery: Arc<dyn Discovery>, config: ServiceConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let mut machine = SessionStateMachine::with_history(config.history_size);
        let state_events = events.clone();
        machine.on_state_change(move |transition| {
            let _ = state_events.send(ServiceEvent::StateChanged(transition.clone()));
        });

        Self {
            inner: Arc::new(ServiceInner {
                fanout: FanOutExecutor::new(config.max_in_flight_commands),
                config,
                discovery,
                machine: Mutex::new(machine),
                lifecycle: Arc::new(tokio::sync::Mutex::new(())),
                operations: CancellationRegistry::new(),
                registry: NetworkRegistry::new(),
                downloads: DownloadCoordinator::new(),
                known: Mutex::new(BTreeMap::new()),
                events,
                watchers: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    // ---- queries ----

    /// Snapshot of the bound network
    pub fn get_network(&self) -> Option<NotchNetwork> {
        self.inner.machine.lock().network().cloned()
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.inner.machine.lock().state()
    }

    /// Prepared capture mode
    pub fn armed(&self) -> Option<ArmedMode> {
        self.inner.machine.lock().armed()
    }

    /// Recent state transitions, oldest first
    pub fn history(&self) -> Vec<StateTransition> {
        self.inner.machine.lock().history()
    }

    /// Devices left reachable after a failure
    pub fn stranded(&self) -> Vec<DeviceAddress> {
        self.inner
            .machine
            .lock()
            .stranded()
            .iter()
            .map(|m| m.address().clone())
            .collect()
    }

    /// Subscribe to service events
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    /// Every device seen by discovery, in address order
    pub fn known_devices(&self) -> Vec<NotchDevice> {
        self.inner.known.lock().values().map(|d| d.device.clone()).collect()
    }

    /// Outstanding operations
    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        self.inner.operations.pending()
    }

    /// Cancel an outstanding operation by id
    pub fn cancel(&self, id: OperationId) -> bool {
        self.inner.operations.cancel(id)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    // ---- discovery ----

    /// Run one discovery pass
    pub fn scan(&self) -> Operation<Vec<NotchDevice>> {
        let (operation, completer) = self.inner.operations.register(OperationKind::Scan);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let token = completer.token();
            let result = inner.discover_once(inner.config.scan_window, &token).await.map(|found| {
                let mut devices: Vec<NotchDevice> = found.into_iter().map(|d| d.device).collect();
                devices.sort_by(|a, b| a.address.cmp(&b.address));
                devices
            });
            completer.resolve(result);
        });
        operation
    }

    /// Keep scanning until a device outside `excluded` appears
    pub fn scan_for_new(
        &self,
        excluded: impl IntoIterator<Item = DeviceAddress>,
    ) -> Operation<NotchDevice> {
        let (operation, completer) = self.inner.operations.register(OperationKind::ScanForNew);
        let excluded: BTreeSet<DeviceAddress> = excluded.into_iter().collect();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let token = completer.token();
            let result = inner.scan_for_new(excluded, &token).await;
            completer.resolve(result);
        });
        operation
    }

    // ---- network lifecycle ----

    /// Bind a network satisfying `workout`
    pub fn init(&self, workout: Workout) -> Operation<NotchNetwork> {
        let (operation, completer) = self.inner.operations.register(OperationKind::Init);
        if let Err(err) = workout.validate() {
            completer.resolve(Err(err));
            return operation;
        }
        let (guard, previous, ()) =
            match self.inner.claim(OperationKind::Init, Some(SessionState::Scanning), |_| Ok(())) {
                Ok(claim) => claim,
                Err(err) => {
                    completer.resolve(Err(err));
                    return operation;
                }
            };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_init(completer, guard, previous, Arc::new(workout)).await;
        });
        operation
    }

    /// Bind every device that answers a connect, without a workout
    pub fn unchecked_init(&self) -> Operation<NotchNetwork> {
        let (operation, completer) = self.inner.operations.register(OperationKind::UncheckedInit);
        let (guard, previous, ()) = match self.inner.claim(
            OperationKind::UncheckedInit,
            Some(SessionState::Scanning),
            |_| Ok(()),
        ) {
            Ok(claim) => claim,
            Err(err) => {
                completer.resolve(Err(err));
                return operation;
            }
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_unchecked_init(completer, guard, previous).await;
        });
        operation
    }

    /// Disconnect the network (or the stranded devices)
    pub fn disconnect(&self) -> Operation<()> {
        self.teardown(OperationKind::Disconnect, DeviceCommand::Disconnect)
    }

    /// Power off the network (or the stranded devices)
    pub fn shut_down(&self) -> Operation<()> {
        self.teardown(OperationKind::ShutDown, DeviceCommand::PowerOff)
    }

    // ---- configuration ----

    /// Arm a steady measurement
    pub fn configure_steady(&self, show_colors: bool) -> Operation<()> {
        self.configure(OperationKind::ConfigureSteady, ArmedMode::Steady { show_colors })
    }

    /// Arm an unbounded capture
    pub fn configure_capture(&self, show_colors: bool) -> Operation<()> {
        self.configure(OperationKind::ConfigureCapture, ArmedMode::Capture { show_colors })
    }

    /// Arm a capture that stops itself after `duration`
    pub fn configure_timed_capture(&self, duration: Duration, show_colors: bool) -> Operation<()> {
        self.configure(
            OperationKind::ConfigureTimedCapture,
            ArmedMode::TimedCapture {
                duration,
                show_colors,
            },
        )
    }

    // ---- capture ----

    /// Run the armed steady measurement
    pub fn steady(&self) -> Operation<SteadySession> {
        let (operation, completer) = self.inner.operations.register(OperationKind::Steady);
        let claim = self.inner.claim(OperationKind::Steady, Some(SessionState::Capturing), |m| {
            m.take_armed();
            let network = bound(m)?;
            let id = Uuid::new_v4();
            m.begin_capture(ActiveCapture::new(id, CaptureKind::Steady, &network));
            Ok((id, network))
        });
        let (guard, _, (id, network)) = match claim {
            Ok(claim) => claim,
            Err(err) => {
                completer.resolve(Err(err));
                return operation;
            }
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let token = completer.token();
            let result = inner.run_steady(id, &network, &token).await;
            inner.conclude(completer, guard, result, Vec::new(), |machine, session| {
                machine.take_active();
                machine.transition(SessionState::Ready, format!("steady {} complete", session.id))
            });
        });
        operation
    }

    /// Start the armed capture
    ///
    /// Resolves with the measurement id once every device is recording.
    pub fn capture(&self) -> Operation<Uuid> {
        let (operation, completer) = self.inner.operations.register(OperationKind::Capture);
        let claim = self.inner.claim(OperationKind::Capture, Some(SessionState::Capturing), |m| {
            m.take_armed();
            bound(m)
        });
        let (guard, _, network) = match claim {
            Ok(claim) => claim,
            Err(err) => {
                completer.resolve(Err(err));
                return operation;
            }
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let token = completer.token();
            let id = Uuid::new_v4();
            let result = inner.start_capture(id, &network, &token).await.map(|_| id);
            let events = inner.events.clone();
            inner.conclude(completer, guard, result, Vec::new(), |machine, id| {
                machine.begin_capture(ActiveCapture::new(*id, CaptureKind::Capture, &network));
                let _ = events.send(ServiceEvent::CaptureStarted {
                    id: *id,
                    kind: CaptureKind::Capture,
                });
                Ok(())
            });
        });
        operation
    }

    /// Start the armed timed capture
    ///
    /// Resolves with the measurement once the capture stopped, either by its
    /// timer or by an explicit [`NotchService::stop`]. Cancelling the handle
    /// after the devices started disarms the timer and leaves the capture
    /// running.
    pub fn timed_capture(&self) -> TimedOperation {
        let (operation, completer) = self.inner.operations.register(OperationKind::TimedCapture);
        let deadline = Arc::new(Mutex::new(None));
        let timed = TimedOperation::new(operation, deadline.clone());

        let claim = self.inner.claim(
            OperationKind::TimedCapture,
            Some(SessionState::Capturing),
            |m| match m.take_armed() {
                Some(ArmedMode::TimedCapture { duration, .. }) => Ok((duration, bound(m)?)),
                armed => Err(NotchError::ModeMismatch {
                    armed: armed.map(|mode| mode.kind()),
                    requested: CaptureKind::TimedCapture,
                }),
            },
        );
        let (guard, _, (duration, network)) = match claim {
            Ok(claim) => claim,
            Err(err) => {
                completer.resolve(Err(err));
                return timed;
            }
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_timed_capture(completer, guard, network, duration, deadline).await;
        });
        timed
    }

    /// Stop the capture in progress
    pub fn stop(&self) -> Operation<Measurement> {
        let (operation, completer) = self.inner.operations.register(OperationKind::Stop);
        let (guard, _, ()) =
            match self.inner.claim(OperationKind::Stop, Some(SessionState::Stopping), |_| Ok(())) {
                Ok(claim) => claim,
                Err(err) => {
                    completer.resolve(Err(err));
                    return operation;
                }
            };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let token = completer.token();
            let (capture, result) = inner.stop_devices(&token).await;
            inner.commit_stop(capture, guard, result, Some(completer));
        });
        operation
    }

    // ---- one-shot commands ----

    /// Show the slot colors (or turn the LEDs off)
    pub fn color(&self, show: bool) -> Operation<()> {
        self.one_shot(
            OperationKind::Color,
            move |slot| DeviceCommand::SetColor {
                color: if show { slot.color } else { LedColor::OFF },
            },
            |_| (),
        )
    }

    /// Erase onboard storage
    pub fn erase(&self) -> Operation<()> {
        self.one_shot(OperationKind::Erase, |_| DeviceCommand::Erase, |_| ())
    }

    /// Read the latest steady data from every device, in slot order
    pub fn get_steady_data(&self) -> Operation<Vec<(DeviceAddress, Bytes)>> {
        self.one_shot(
            OperationKind::GetSteadyData,
            |_| DeviceCommand::GetSteadyData,
            |report| report.payloads(),
        )
    }

    /// Download recorded data into `sink`
    pub fn download<W>(
        &self,
        descriptor: impl Into<Descriptor>,
        sink: W,
    ) -> Operation<DownloadOutput<W>>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let descriptor = descriptor.into();
        let (operation, completer) = self.inner.operations.register(OperationKind::Download);
        let claim = self.inner.claim(OperationKind::Download, Some(SessionState::Downloading), |m| {
            let current = m.network().map(NotchNetwork::generation);
            if current != Some(descriptor.generation()) {
                return Err(NotchError::StaleDescriptor {
                    descriptor: descriptor.id(),
                    descriptor_generation: descriptor.generation(),
                    current_generation: current,
                });
            }
            Ok(bound(m)?.members().to_vec())
        });
        let (guard, _, members) = match claim {
            Ok(claim) => claim,
            Err(err) => {
                completer.resolve(Err(err));
                return operation;
            }
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let token = completer.token();
            let mut sink = sink;
            let result = inner
                .downloads
                .download(&descriptor, &members, &mut sink, &token)
                .await
                .map(|report| DownloadOutput { report, sink });
            {
                let mut machine = inner.machine.lock();
                let reason = match &result {
                    Ok(_) => "download complete".to_string(),
                    Err(err) => format!("download ended: {err}"),
                };
                if let Err(err) = machine.transition(SessionState::Ready, reason) {
                    warn!("cannot leave download: {}", err);
                }
            }
            drop(guard);
            completer.resolve(result);
        });
        operation
    }

    fn configure(&self, kind: OperationKind, mode: ArmedMode) -> Operation<()> {
        let (operation, completer) = self.inner.operations.register(kind);
        let claim = self.inner.claim(kind, Some(SessionState::Configuring), |m| {
            m.take_armed();
            bound(m)
        });
        let (guard, _, network) = match claim {
            Ok(claim) => claim,
            Err(err) => {
                completer.resolve(Err(err));
                return operation;
            }
        };

        let requests = requests_for(network.members(), |member| {
            let color = mode.show_colors().then_some(member.slot.color);
            match mode {
                ArmedMode::Steady { .. } => DeviceCommand::ConfigureSteady { color },
                ArmedMode::Capture { .. } | ArmedMode::TimedCapture { .. } => {
                    DeviceCommand::ConfigureCapture {
                        frequency_hz: member.slot.frequency_hz,
                        color,
                    }
                }
            }
        });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let token = completer.token();
            let result = inner.fanout.execute(requests, &token).await.map(|_| ());
            inner.conclude(completer, guard, result, Vec::new(), |machine, _| {
                machine.arm(mode);
                machine.transition(SessionState::Ready, format!("armed for {}", mode.kind()))
            });
        });
        operation
    }

    fn one_shot<T, B, M>(&self, kind: OperationKind, mut build: B, map: M) -> Operation<T>
    where
        T: Send + 'static,
        B: FnMut(&DeviceSlot) -> DeviceCommand,
        M: FnOnce(FanOutReport) -> T + Send + 'static,
    {
        let (operation, completer) = self.inner.operations.register(kind);
        let (guard, _, network) = match self.inner.claim(kind, None, bound) {
            Ok(claim) => claim,
            Err(err) => {
                completer.resolve(Err(err));
                return operation;
            }
        };
        let requests = requests_for(network.members(), |member| build(&member.slot));

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let token = completer.token();
            let result = inner.fanout.execute(requests, &token).await.map(map);
            drop(guard);
            completer.resolve(result);
        });
        operation
    }

    fn teardown(&self, kind: OperationKind, command: DeviceCommand) -> Operation<()> {
        let (operation, completer) = self.inner.operations.register(kind);
        let claim = self.inner.claim(kind, Some(SessionState::ShuttingDown), |m| {
            Ok(m.teardown_targets())
        });
        let (guard, _, targets) = match claim {
            Ok(claim) => claim,
            Err(err) => {
                completer.resolve(Err(err));
                return operation;
            }
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_teardown(completer, guard, targets, command).await;
        });
        operation
    }
}

/// Snapshot of the bound network, or `InvalidState` if there is none
fn bound(machine: &mut SessionStateMachine) -> Result<NotchNetwork, NotchError> {
    machine.network().cloned().ok_or(NotchError::InvalidState {
        current: machine.state(),
        required: &[SessionState::Ready],
    })
}

impl ServiceInner {
    /// Take the lifecycle lock, check legality, validate, then transition
    ///
    /// Nothing is changed unless every step succeeds.
    fn claim<R>(
        &self,
        kind: OperationKind,
        transitional: Option<SessionState>,
        validate: impl FnOnce(&mut SessionStateMachine) -> Result<R, NotchError>,
    ) -> Result<(LifecycleGuard, SessionState, R), NotchError> {
        let guard = self
            .lifecycle
            .clone()
            .try_lock_owned()
            .map_err(|_| NotchError::OperationInProgress { requested: kind })?;

        let mut machine = self.machine.lock();
        machine.check(kind)?;
        let value = validate(&mut machine)?;
        let previous = machine.state();
        if let Some(state) = transitional {
            machine.transition(state, kind.to_string())?;
        }
        Ok((guard, previous, value))
    }

    /// Commit a lifecycle operation
    ///
    /// Success runs `on_success` against the machine; failure, cancellation
    /// or a failing `on_success` enter `Error`, stranding the network plus
    /// `touched`.
    fn conclude<T, F>(
        &self,
        mut completer: Completer<T>,
        guard: LifecycleGuard,
        result: Result<T, NotchError>,
        touched: Vec<NetworkMember>,
        on_success: F,
    ) where
        F: FnOnce(&mut SessionStateMachine, &T) -> Result<(), NotchError>,
    {
        let result = if completer.settle() {
            Err(NotchError::Cancelled)
        } else {
            result
        };

        let result = {
            let mut machine = self.machine.lock();
            let result = result.and_then(|value| on_success(&mut machine, &value).map(|()| value));
            if let Err(err) = &result {
                machine.fail(format!("{} failed: {}", completer.kind(), err), touched);
            }
            result
        };
        if result.is_err() {
            self.unwatch();
        }

        drop(guard);
        completer.resolve(result);
    }

    /// Undo a claim that performed no device I/O
    fn revert<T>(
        &self,
        mut completer: Completer<T>,
        guard: LifecycleGuard,
        previous: SessionState,
        err: NotchError,
    ) {
        let cancelled = completer.settle();
        {
            let mut machine = self.machine.lock();
            if cancelled {
                machine.fail(format!("{} cancelled", completer.kind()), Vec::new());
            } else {
                let reason = format!("{} rejected: {}", completer.kind(), err);
                if let Err(e) = machine.transition(previous, reason) {
                    warn!("cannot revert to {}: {}", previous, e);
                }
            }
        }
        drop(guard);
        completer.resolve(Err(err));
    }

    async fn discover_once(
        &self,
        window: Duration,
        token: &CancellationToken,
    ) -> Result<Vec<DiscoveredDevice>, NotchError> {
        let found = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(NotchError::Cancelled),
            found = self.discovery.discover(window) => found.map_err(NotchError::Discovery)?,
        };

        {
            let mut known = self.known.lock();
            for device in &found {
                known.insert(device.address().clone(), device.clone());
            }
        }
        debug!("discovery pass found {} device(s)", found.len());
        let _ = self.events.send(ServiceEvent::DevicesDiscovered { count: found.len() });
        Ok(found)
    }

    async fn scan_for_new(
        &self,
        excluded: BTreeSet<DeviceAddress>,
        token: &CancellationToken,
    ) -> Result<NotchDevice, NotchError> {
        let timeout = self.config.scan_for_new_timeout;
        let deadline = Instant::now() + timeout;
        let not_found = || NotchError::NoDeviceFound(timeout.as_millis() as u64);

        loop {
            let pass_started = Instant::now();
            let remaining = deadline.saturating_duration_since(pass_started);
            if remaining.is_zero() {
                return Err(not_found());
            }

            let found = tokio::select! {
                biased;
                _ = sleep_until(deadline) => return Err(not_found()),
                found = self.discover_once(self.config.scan_window.min(remaining), token) => found?,
            };

            let mut fresh: Vec<NotchDevice> = found
                .into_iter()
                .filter(|d| !excluded.contains(d.address()))
                .map(|d| d.device)
                .collect();
            fresh.sort_by(|a, b| a.address.cmp(&b.address));
            if let Some(device) = fresh.into_iter().next() {
                info!("new device {}", device.address);
                return Ok(device);
            }

            let next_pass = (pass_started + self.config.scan_window).min(deadline);
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(NotchError::Cancelled),
                _ = sleep_until(next_pass) => {}
            }
        }
    }

    /// Candidates for a new network: the bound members and a fresh pass
    ///
    /// Members are only offered while the session is `Ready`; after a
    /// failure they have to show up in discovery again.
    async fn candidates(
        &self,
        previous: SessionState,
        token: &CancellationToken,
    ) -> Result<Vec<DiscoveredDevice>, NotchError> {
        let discovered = self.discover_once(self.config.scan_window, token).await?;
        let current = if previous == SessionState::Ready {
            self.current_members()
        } else {
            Vec::new()
        };
        Ok(merge_candidates(current.into_iter().chain(discovered)))
    }

    fn current_members(&self) -> Vec<DiscoveredDevice> {
        self.machine
            .lock()
            .network()
            .map(|n| n.members().iter().map(NetworkMember::as_discovered).collect())
            .unwrap_or_default()
    }

    async fn run_init(
        &self,
        completer: Completer<NotchNetwork>,
        guard: LifecycleGuard,
        previous: SessionState,
        workout: Arc<Workout>,
    ) {
        let token = completer.token();

        if let Some(assignment) = self.reusable(previous, &workout) {
            info!("bound devices satisfy {}, reusing them", workout.name);
            let entered = self
                .machine
                .lock()
                .transition(SessionState::Initializing, "bound network reused");
            if let Err(err) = entered {
                return self.conclude(completer, guard, Err(err), Vec::new(), |_, _| Ok(()));
            }
            return self.bind(completer, guard, assignment);
        }

        let candidates = match self.candidates(previous, &token).await {
            Ok(candidates) => candidates,
            Err(NotchError::Cancelled) => {
                let err = Err(NotchError::Cancelled);
                return self.conclude(completer, guard, err, Vec::new(), |_, _| Ok(()));
            }
            Err(err) => return self.revert(completer, guard, previous, err),
        };

        let assignment = match self.registry.resolve(workout, &candidates) {
            Ok(assignment) => assignment,
            Err(err) => {
                info!("{}", err);
                return self.revert(completer, guard, previous, err.into());
            }
        };

        let entered = self
            .machine
            .lock()
            .transition(SessionState::Initializing, "workout resolved");
        if let Err(err) = entered {
            return self.conclude(completer, guard, Err(err), Vec::new(), |_, _| Ok(()));
        }

        if let Err((err, stranded)) = self.release_network(previous, &token).await {
            return self.fail_teardown(completer, guard, err, stranded);
        }
        let requests = requests_for(&assignment.members, |_| DeviceCommand::Connect);
        if let Err(err) = self.fanout.execute(requests, &token).await {
            let touched = assignment.members.clone();
            return self.conclude(completer, guard, Err(err), touched, |_, _| Ok(()));
        }

        self.bind(completer, guard, assignment);
    }

    /// Assignment of `workout` onto exactly the bound devices, if it fits
    fn reusable(&self, previous: SessionState, workout: &Arc<Workout>) -> Option<Assignment> {
        if previous != SessionState::Ready {
            return None;
        }
        let current = self.current_members();
        let assignment = self.registry.resolve(workout.clone(), &current).ok()?;
        // every bound device has to stay in the network
        (assignment.members.len() == current.len()).then_some(assignment)
    }

    async fn run_unchecked_init(
        &self,
        completer: Completer<NotchNetwork>,
        guard: LifecycleGuard,
        previous: SessionState,
    ) {
        let token = completer.token();

        let candidates = match self.candidates(previous, &token).await {
            Ok(candidates) if candidates.is_empty() => {
                let err = CompatibilityError {
                    workout: "unchecked".to_string(),
                    required: 1,
                    available: 0,
                    unfilled: Vec::new(),
                };
                return self.revert(completer, guard, previous, err.into());
            }
            Ok(candidates) => candidates,
            Err(NotchError::Cancelled) => {
                let err = Err(NotchError::Cancelled);
                return self.conclude(completer, guard, err, Vec::new(), |_, _| Ok(()));
            }
            Err(err) => return self.revert(completer, guard, previous, err),
        };

        let entered = self
            .machine
            .lock()
            .transition(SessionState::Initializing, "unchecked candidates found");
        if let Err(err) = entered {
            return self.conclude(completer, guard, Err(err), Vec::new(), |_, _| Ok(()));
        }

        if let Err((err, stranded)) = self.release_network(previous, &token).await {
            return self.fail_teardown(completer, guard, err, stranded);
        }

        let requests: Vec<_> = candidates
            .iter()
            .map(|c| FanOutRequest {
                address: c.address().clone(),
                link: c.link.clone(),
                command: DeviceCommand::Connect,
            })
            .collect();
        let responders: Vec<DiscoveredDevice> = match self.fanout.execute(requests, &token).await {
            Ok(_) => candidates,
            Err(NotchError::DeviceFailure(failure)) if !failure.succeeded.is_empty() => {
                warn!("{}; binding the {} responder(s)", failure, failure.succeeded.len());
                candidates
                    .into_iter()
                    .filter(|c| failure.succeeded.contains(c.address()))
                    .collect()
            }
            Err(err) => {
                let touched = self.registry.unchecked(&candidates).members;
                return self.conclude(completer, guard, Err(err), touched, |_, _| Ok(()));
            }
        };

        let assignment = self.registry.unchecked(&responders);
        self.bind(completer, guard, assignment);
    }

    /// Disconnect whatever is bound (or stranded) before a new network
    async fn release_network(
        &self,
        previous: SessionState,
        token: &CancellationToken,
    ) -> Result<(), (NotchError, Vec<NetworkMember>)> {
        let targets = self.machine.lock().teardown_targets();
        if !targets.is_empty() {
            let requests = requests_for(&targets, |_| DeviceCommand::Disconnect);
            match self.fanout.execute(requests, token).await {
                Ok(_) => {}
                Err(NotchError::Cancelled) => return Err((NotchError::Cancelled, targets)),
                Err(err) if previous == SessionState::Error => {
                    warn!("best-effort disconnect of stranded devices failed: {}", err);
                }
                Err(err) => {
                    let failed = err.failed_devices();
                    let stranded = targets
                        .into_iter()
                        .filter(|m| failed.contains(m.address()))
                        .collect();
                    return Err((err, stranded));
                }
            }
        }

        let released = self.machine.lock().reset();
        if let Some(network) = released {
            self.unwatch();
            let _ = self.events.send(ServiceEvent::NetworkReleased {
                generation: network.generation(),
            });
        }
        Ok(())
    }

    fn bind(
        &self,
        mut completer: Completer<NotchNetwork>,
        guard: LifecycleGuard,
        assignment: Assignment,
    ) {
        if completer.settle() {
            let touched = assignment.members.clone();
            let err = Err(NotchError::Cancelled);
            return self.conclude(completer, guard, err, touched, |_, _| Ok(()));
        }

        let result = {
            let mut machine = self.machine.lock();
            let network = machine.bind(assignment);
            let reason = format!("network generation {} bound", network.generation());
            machine.transition(SessionState::Ready, reason).map(|()| network)
        };

        match &result {
            Ok(network) => {
                let _ = self.events.send(ServiceEvent::NetworkBound {
                    generation: network.generation(),
                    devices: network.addresses(),
                });
                self.watch(network);
            }
            Err(err) => self.machine.lock().fail(err.to_string(), Vec::new()),
        }

        drop(guard);
        completer.resolve(result);
    }

    fn fail_teardown<T>(
        &self,
        mut completer: Completer<T>,
        guard: LifecycleGuard,
        err: NotchError,
        stranded: Vec<NetworkMember>,
    ) {
        let cancelled = completer.settle();
        let err = if cancelled { NotchError::Cancelled } else { err };
        self.machine
            .lock()
            .fail_teardown(format!("{} failed: {}", completer.kind(), err), stranded);
        self.unwatch();
        drop(guard);
        completer.resolve(Err(err));
    }

    async fn run_teardown(
        &self,
        mut completer: Completer<()>,
        guard: LifecycleGuard,
        targets: Vec<NetworkMember>,
        command: DeviceCommand,
    ) {
        let token = completer.token();
        let result = if targets.is_empty() {
            Ok(())
        } else {
            let requests = requests_for(&targets, |_| command.clone());
            self.fanout.execute(requests, &token).await.map(|_| ())
        };

        if completer.settle() {
            return self.fail_teardown(completer, guard, NotchError::Cancelled, targets);
        }
        if let Err(err) = result {
            let failed = err.failed_devices();
            let stranded: Vec<NetworkMember> = if failed.is_empty() {
                targets
            } else {
                targets.into_iter().filter(|m| failed.contains(m.address())).collect()
            };
            return self.fail_teardown(completer, guard, err, stranded);
        }

        let released = {
            let mut machine = self.machine.lock();
            let released = machine.reset();
            let reason = completer.kind().to_string();
            if let Err(err) = machine.transition(SessionState::Uninitialized, reason) {
                warn!("cannot complete teardown: {}", err);
            }
            released
        };
        self.unwatch();
        if let Some(network) = released {
            let _ = self.events.send(ServiceEvent::NetworkReleased {
                generation: network.generation(),
            });
        }

        drop(guard);
        completer.resolve(Ok(()));
    }

    async fn start_capture(
        &self,
        id: Uuid,
        network: &NotchNetwork,
        token: &CancellationToken,
    ) -> Result<FanOutReport, NotchError> {
        let requests = requests_for(network.members(), |_| DeviceCommand::StartCapture {
            measurement: id,
        });
        self.fanout.execute(requests, token).await
    }

    async fn run_steady(
        &self,
        id: Uuid,
        network: &NotchNetwork,
        token: &CancellationToken,
    ) -> Result<SteadySession, NotchError> {
        let requests =
            requests_for(network.members(), |_| DeviceCommand::StartSteady { session: id });
        self.fanout.execute(requests, token).await?;
        let started_at = Utc::now();
        let _ = self.events.send(ServiceEvent::CaptureStarted {
            id,
            kind: CaptureKind::Steady,
        });

        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(NotchError::Cancelled),
            _ = sleep(self.config.steady_duration) => {}
        }

        let requests =
            requests_for(network.members(), |_| DeviceCommand::StopSteady { session: id });
        self.fanout.execute(requests, token).await?;
        let _ = self.events.send(ServiceEvent::CaptureStopped {
            id,
            kind: CaptureKind::Steady,
        });

        Ok(SteadySession {
            id,
            generation: network.generation(),
            devices: network.addresses(),
            started_at,
            stopped_at: Utc::now(),
        })
    }

    async fn run_timed_capture(
        self: Arc<Self>,
        completer: Completer<Measurement>,
        guard: LifecycleGuard,
        network: NotchNetwork,
        duration: Duration,
        deadline: Arc<Mutex<Option<Instant>>>,
    ) {
        let token = completer.token();
        let id = Uuid::new_v4();

        if let Err(err) = self.start_capture(id, &network, &token).await {
            return self.conclude(completer, guard, Err(err), Vec::new(), |_, _| Ok(()));
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut capture = ActiveCapture::new(id, CaptureKind::TimedCapture, &network);
            capture.completion = Some(tx);
            if !token.is_cancelled() {
                let mut timer = CaptureTimer::new();
                let inner = self.clone();
                match timer.schedule(duration, move || inner.auto_stop(id)) {
                    Ok(at) => *deadline.lock() = Some(at),
                    Err(err) => warn!("cannot arm capture timer: {}", err),
                }
                capture.timer = Some(timer);
            }
            self.machine.lock().begin_capture(capture);
        }
        let _ = self.events.send(ServiceEvent::CaptureStarted {
            id,
            kind: CaptureKind::TimedCapture,
        });
        info!("timed capture {} running for {:?}", id, duration);
        drop(guard);

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => {
                let mut machine = self.machine.lock();
                if let Some(active) = machine.active_mut().filter(|a| a.id == id) {
                    if let Some(timer) = active.timer.as_mut() {
                        timer.cancel();
                    }
                    active.completion = None;
                    info!("timed capture {} disarmed, capture keeps running", id);
                }
                Err(NotchError::Cancelled)
            }
            result = rx => result.unwrap_or(Err(NotchError::Abandoned)),
        };
        completer.resolve(result);
    }

    /// Timer callback: stop capture `id` if it is still the one running
    async fn auto_stop(self: Arc<Self>, id: Uuid) {
        let guard = self.lifecycle.clone().lock_owned().await;
        {
            let mut machine = self.machine.lock();
            let running = machine.active().map(|a| a.id);
            if machine.state() != SessionState::Capturing || running != Some(id) {
                debug!("capture {} already stopped", id);
                return;
            }
            if let Err(err) = machine.transition(SessionState::Stopping, "capture timer elapsed") {
                warn!("cannot auto-stop capture {}: {}", id, err);
                return;
            }
        }

        let (capture, result) = self.stop_devices(&CancellationToken::new()).await;
        self.commit_stop(capture, guard, result, None);
    }

    async fn stop_devices(
        &self,
        token: &CancellationToken,
    ) -> (Option<ActiveCapture>, Result<Measurement, NotchError>) {
        let (capture, members) = {
            let mut machine = self.machine.lock();
            let members = machine.network().map(|n| n.members().to_vec()).unwrap_or_default();
            (machine.take_active(), members)
        };
        let Some(capture) = capture else {
            return (None, Err(NotchError::Abandoned));
        };

        let id = capture.id;
        let requests = requests_for(&members, |_| DeviceCommand::StopCapture { measurement: id });
        let result = self
            .fanout
            .execute(requests, token)
            .await
            .map(|_| capture.measurement());
        (Some(capture), result)
    }

    fn commit_stop(
        &self,
        capture: Option<ActiveCapture>,
        guard: LifecycleGuard,
        result: Result<Measurement, NotchError>,
        completer: Option<Completer<Measurement>>,
    ) {
        let mut completer = completer;
        let cancelled = completer.as_mut().is_some_and(|c| c.settle());
        let result = if cancelled { Err(NotchError::Cancelled) } else { result };

        {
            let mut machine = self.machine.lock();
            match &result {
                Ok(measurement) => {
                    let reason = format!("capture {} stopped", measurement.id);
                    if let Err(err) = machine.transition(SessionState::Ready, reason) {
                        warn!("cannot leave stop: {}", err);
                    }
                }
                Err(err) => machine.fail(format!("stop failed: {err}"), Vec::new()),
            }
        }

        match &result {
            Ok(measurement) => {
                let _ = self.events.send(ServiceEvent::CaptureStopped {
                    id: measurement.id,
                    kind: measurement.kind,
                });
            }
            Err(_) => self.unwatch(),
        }
        if let Some(mut capture) = capture {
            capture.resolve(result.clone());
        }

        drop(guard);
        if let Some(completer) = completer {
            completer.resolve(result);
        }
    }

    /// Forward notifications of `network` members as service events
    fn watch(&self, network: &NotchNetwork) {
        let token = CancellationToken::new();
        let previous = std::mem::replace(&mut *self.watchers.lock(), token.clone());
        previous.cancel();

        for member in network.members() {
            let mut notifications = member.link.subscribe();
            let events = self.events.clone();
            let address = member.address().clone();
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        received = notifications.recv() => match received {
                            Ok(notification) => {
                                let _ = events.send(ServiceEvent::Device {
                                    address: address.clone(),
                                    notification,
                                });
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                warn!("{}: dropped {} notification(s)", address, skipped);
                            }
                            Err(RecvError::Closed) => break,
                        },
                    }
                }
            });
        }
    }

    fn unwatch(&self) {
        self.watchers.lock().cancel();
    }
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        self.watchers.lock().cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::{CommandKind, LinkError, SimulatedDevice, SimulatedDiscovery};

    fn service(addresses: &[&str]) -> (NotchService, Arc<SimulatedDiscovery>) {
        let discovery = Arc::new(SimulatedDiscovery::new(
            addresses.iter().map(|a| SimulatedDevice::standard(*a)),
        ));
        let config = ServiceConfig {
            scan_window: Duration::from_millis(10),
            scan_for_new_timeout: Duration::from_millis(100),
            steady_duration: Duration::from_millis(20),
            ..ServiceConfig::default()
        };
        (NotchService::new(discovery.clone(), config), discovery)
    }

    fn workout(slots: usize) -> Workout {
        (0..slots).fold(Workout::new("test"), |w, i| {
            w.with_slot(DeviceSlot::new(format!("slot-{i}"), LedColor::palette(i)))
        })
    }

    #[tokio::test]
    async fn test_init_binds_lowest_addresses() {
        let (service, _) = service(&["03", "01", "02"]);

        let network = service.init(workout(2)).result().await.unwrap();
        assert_eq!(network.generation(), 1);
        assert_eq!(network.addresses(), vec![DeviceAddress::new("01"), DeviceAddress::new("02")]);
        assert_eq!(service.state(), SessionState::Ready);
        assert_eq!(service.known_devices().len(), 3);
    }

    #[tokio::test]
    async fn test_incompatible_init_keeps_previous_state() {
        let (service, _) = service(&["01"]);

        let err = service.init(workout(2)).result().await.unwrap_err();
        assert!(matches!(err, NotchError::Compatibility(_)));
        assert_eq!(service.state(), SessionState::Uninitialized);
        assert!(service.get_network().is_none());
    }

    #[tokio::test]
    async fn test_second_operation_is_rejected_while_busy() {
        let (service, discovery) = service(&["01", "02"]);
        discovery
            .device(&DeviceAddress::new("01"))
            .unwrap()
            .delay_on(CommandKind::Connect, Duration::from_millis(50));

        let first = service.init(workout(2));
        let second = service.init(workout(2)).wait().await;
        assert!(second.is_busy());
        assert!(first.wait().await.is_success());
    }

    #[tokio::test]
    async fn test_stop_outside_capture_is_invalid() {
        let (service, discovery) = service(&["01"]);
        service.init(workout(1)).result().await.unwrap();
        let device = discovery.device(&DeviceAddress::new("01")).unwrap();
        device.clear_log();

        let err = service.stop().result().await.unwrap_err();
        assert!(matches!(err, NotchError::InvalidState { current: SessionState::Ready, .. }));
        assert!(device.commands().is_empty());
    }

    #[tokio::test]
    async fn test_one_shot_failure_keeps_ready() {
        let (service, discovery) = service(&["01", "02"]);
        service.init(workout(2)).result().await.unwrap();
        discovery
            .device(&DeviceAddress::new("02"))
            .unwrap()
            .fail_on(CommandKind::Erase, LinkError::Rejected("flash busy".into()));

        let err = service.erase().result().await.unwrap_err();
        assert_eq!(err.failed_devices(), vec![DeviceAddress::new("02")]);
        assert_eq!(service.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_color_sets_slot_colors() {
        let (service, discovery) = service(&["01", "02"]);
        service.init(workout(2)).result().await.unwrap();

        service.color(true).result().await.unwrap();
        let second = discovery.device(&DeviceAddress::new("02")).unwrap();
        assert_eq!(second.color(), Some(LedColor::palette(1)));

        service.color(false).result().await.unwrap();
        assert_eq!(second.color(), Some(LedColor::OFF));
    }

    #[tokio::test]
    async fn test_scan_for_new_finds_late_device() {
        let (service, discovery) = service(&["01"]);
        let seen = service.scan().result().await.unwrap();

        let pending = service.scan_for_new(seen.into_iter().map(|d| d.address));
        tokio::time::sleep(Duration::from_millis(15)).await;
        discovery.add(SimulatedDevice::standard("09"));

        let device = pending.result().await.unwrap();
        assert_eq!(device.address.as_str(), "09");
    }

    #[tokio::test]
    async fn test_scan_for_new_times_out() {
        let (service, _) = service(&["01"]);
        let seen = service.scan().result().await.unwrap();

        let err = service
            .scan_for_new(seen.into_iter().map(|d| d.address))
            .result()
            .await
            .unwrap_err();
        assert!(matches!(err, NotchError::NoDeviceFound(100)));
    }
}
