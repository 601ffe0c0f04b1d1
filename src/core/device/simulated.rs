//! Simulated sensor
//!
//! In-process devices for development and tests. Each simulated device keeps
//! a small amount of state (power, link, LED, sampling rate, recordings),
//! applies configurable latency and jitter, and can be told to fail specific
//! commands.

use super::{
    CommandKind, CommandResponse, DeviceAddress, DeviceCommand, DeviceLink, DeviceNotification,
    DiscoveredDevice, Discovery, LinkError, NotchDevice,
};
use crate::core::capability::CapabilitySet;
use crate::core::workout::LedColor;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

/// Samples generated per recording
const SAMPLES_PER_RECORDING: usize = 32;

/// Bytes per sample (timestamp + 3 x i16 accel + 3 x i16 gyro)
const SAMPLE_SIZE: usize = 16;

/// Steady data snapshot length
const STEADY_DATA_SIZE: usize = 12;

/// Latency simulation configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyConfig {
    /// Base latency in ms
    #[serde(default)]
    pub base_ms: u64,
    /// Uniform random jitter range in ms
    #[serde(default)]
    pub jitter_ms: u64,
}

impl LatencyConfig {
    /// Latency for the next command
    pub fn sample(&self) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.base_ms.saturating_add(jitter))
    }
}

/// Simulated device description, as found in the `[simulator]` config section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedDeviceConfig {
    /// Device address
    pub address: String,
    /// Advertised name
    #[serde(default)]
    pub name: Option<String>,
    /// Capabilities (standard sensor when omitted)
    #[serde(default = "CapabilitySet::standard")]
    pub capabilities: CapabilitySet,
    /// Command latency
    #[serde(default)]
    pub latency: LatencyConfig,
    /// Battery level reported on connect
    #[serde(default = "default_battery")]
    pub battery: u8,
    /// Commands that always fail on this device
    #[serde(default)]
    pub fail_on: Vec<CommandKind>,
}

fn default_battery() -> u8 {
    100
}

impl SimulatedDeviceConfig {
    /// Standard sensor at `address`
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            capabilities: CapabilitySet::standard(),
            latency: LatencyConfig::default(),
            battery: default_battery(),
            fail_on: Vec::new(),
        }
    }

    /// Set advertised name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set capabilities
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set latency
    #[must_use]
    pub fn with_latency(mut self, base_ms: u64, jitter_ms: u64) -> Self {
        self.latency = LatencyConfig { base_ms, jitter_ms };
        self
    }
}

/// Mutable device state
#[derive(Debug, Clone)]
struct DeviceState {
    powered: bool,
    connected: bool,
    color: Option<LedColor>,
    frequency_hz: u32,
    steady: Option<Uuid>,
    recording: Option<Uuid>,
    last_steady: Option<Uuid>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            powered: true,
            connected: false,
            color: None,
            frequency_hz: crate::core::workout::DEFAULT_FREQUENCY_HZ,
            steady: None,
            recording: None,
            last_steady: None,
        }
    }
}

/// Simulated Notch sensor
pub struct SimulatedDevice {
    config: SimulatedDeviceConfig,
    address: DeviceAddress,
    state: RwLock<DeviceState>,
    recordings: RwLock<HashMap<Uuid, Bytes>>,
    failures: RwLock<HashMap<CommandKind, LinkError>>,
    delays: RwLock<HashMap<CommandKind, Duration>>,
    log: RwLock<Vec<DeviceCommand>>,
    notifications: broadcast::Sender<DeviceNotification>,
}

impl SimulatedDevice {
    /// Create a device from its description
    pub fn new(config: SimulatedDeviceConfig) -> Self {
        let failures = config
            .fail_on
            .iter()
            .map(|kind| (*kind, LinkError::Rejected(format!("{kind} refused"))))
            .collect();
        let (notifications, _) = broadcast::channel(16);
        Self {
            address: DeviceAddress::new(&config.address),
            config,
            state: RwLock::new(DeviceState::default()),
            recordings: RwLock::new(HashMap::new()),
            failures: RwLock::new(failures),
            delays: RwLock::new(HashMap::new()),
            log: RwLock::new(Vec::new()),
            notifications,
        }
    }

    /// Standard sensor at `address`, no latency
    pub fn standard(address: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(SimulatedDeviceConfig::new(address)))
    }

    /// Device identity as advertised
    pub fn info(&self) -> NotchDevice {
        let mut device = NotchDevice::new(self.address.clone())
            .with_capabilities(self.config.capabilities.clone());
        device.name = self.config.name.clone();
        device.firmware_version = Some("sim-1.0".to_string());
        device
    }

    /// Make every future `kind` command fail with `error`
    pub fn fail_on(&self, kind: CommandKind, error: LinkError) {
        self.failures.write().insert(kind, error);
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        self.failures.write().clear();
    }

    /// Extra delay applied to `kind` commands
    pub fn delay_on(&self, kind: CommandKind, delay: Duration) {
        self.delays.write().insert(kind, delay);
    }

    /// Commands received so far
    pub fn commands(&self) -> Vec<DeviceCommand> {
        self.log.read().clone()
    }

    /// Number of `kind` commands received
    pub fn command_count(&self, kind: CommandKind) -> usize {
        self.log.read().iter().filter(|c| c.kind() == kind).count()
    }

    /// Forget the command log
    pub fn clear_log(&self) {
        self.log.write().clear();
    }

    /// Check if the link is up
    pub fn is_connected(&self) -> bool {
        self.state.read().connected
    }

    /// Check if the device is powered (and advertising)
    pub fn is_powered(&self) -> bool {
        self.state.read().powered
    }

    /// Press the power button
    pub fn power_on(&self) {
        self.state.write().powered = true;
    }

    /// Current LED color
    pub fn color(&self) -> Option<LedColor> {
        self.state.read().color
    }

    /// Check if recording is in progress
    pub fn is_recording(&self) -> bool {
        self.state.read().recording.is_some()
    }

    /// Push a notification to subscribers
    pub fn notify(&self, notification: DeviceNotification) {
        let _ = self.notifications.send(notification);
    }

    fn injected_failure(&self, kind: CommandKind) -> Option<LinkError> {
        self.failures.read().get(&kind).cloned()
    }

    fn latency(&self, kind: CommandKind) -> Duration {
        let extra = self.delays.read().get(&kind).copied().unwrap_or_default();
        self.config.latency.sample() + extra
    }

    fn seed(&self, id: &Uuid) -> u64 {
        // FNV-1a over address and id, stable across runs
        self.address
            .as_str()
            .bytes()
            .chain(id.as_bytes().iter().copied())
            .fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
                (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
            })
    }

    fn generate_recording(&self, id: &Uuid, frequency_hz: u32) -> Bytes {
        let mut rng = StdRng::seed_from_u64(self.seed(id));
        let period_us = 1_000_000 / frequency_hz.max(1);
        let mut buf = BytesMut::with_capacity(SAMPLES_PER_RECORDING * SAMPLE_SIZE);
        for index in 0..SAMPLES_PER_RECORDING {
            buf.put_u32(period_us.saturating_mul(index as u32));
            for _ in 0..6 {
                buf.put_i16(rng.gen_range(-2048..=2048));
            }
        }
        buf.freeze()
    }

    fn apply(&self, command: &DeviceCommand) -> Result<CommandResponse, LinkError> {
        let mut state = self.state.write();

        match command {
            DeviceCommand::Connect => {
                if !state.powered {
                    return Err(LinkError::Disconnected);
                }
                state.connected = true;
                drop(state);
                self.notify(DeviceNotification::Battery {
                    percent: self.config.battery,
                });
                return Ok(CommandResponse::Ack);
            }
            DeviceCommand::Disconnect => {
                state.connected = false;
                return Ok(CommandResponse::Ack);
            }
            _ => {}
        }

        if !state.connected {
            return Err(LinkError::Disconnected);
        }

        match command {
            DeviceCommand::Connect | DeviceCommand::Disconnect => {}
            DeviceCommand::PowerOff => {
                *state = DeviceState {
                    powered: false,
                    ..DeviceState::default()
                };
                drop(state);
                self.notify(DeviceNotification::Disconnected);
            }
            DeviceCommand::SetColor { color } => state.color = Some(*color),
            DeviceCommand::Erase => {
                drop(state);
                self.recordings.write().clear();
            }
            DeviceCommand::ConfigureSteady { color } => {
                if color.is_some() {
                    state.color = *color;
                }
            }
            DeviceCommand::ConfigureCapture { frequency_hz, color } => {
                state.frequency_hz = *frequency_hz;
                if color.is_some() {
                    state.color = *color;
                }
            }
            DeviceCommand::StartSteady { session } => state.steady = Some(*session),
            DeviceCommand::StopSteady { session } => {
                if state.steady != Some(*session) {
                    return Err(LinkError::Rejected(format!("steady {session} not running")));
                }
                state.steady = None;
                state.last_steady = Some(*session);
                let frequency = state.frequency_hz;
                drop(state);
                let data = self.generate_recording(session, frequency);
                self.recordings.write().insert(*session, data);
            }
            DeviceCommand::StartCapture { measurement } => {
                if state.recording.is_some() {
                    return Err(LinkError::Rejected("already recording".into()));
                }
                state.recording = Some(*measurement);
            }
            DeviceCommand::StopCapture { measurement } => {
                if state.recording != Some(*measurement) {
                    return Err(LinkError::Rejected(format!(
                        "measurement {measurement} not recording"
                    )));
                }
                state.recording = None;
                let frequency = state.frequency_hz;
                drop(state);
                let data = self.generate_recording(measurement, frequency);
                self.recordings.write().insert(*measurement, data);
            }
            DeviceCommand::GetSteadyData => {
                let id = state.last_steady.unwrap_or_else(Uuid::nil);
                drop(state);
                let mut rng = StdRng::seed_from_u64(self.seed(&id));
                let mut data = vec![0u8; STEADY_DATA_SIZE];
                rng.fill(data.as_mut_slice());
                return Ok(CommandResponse::Data(Bytes::from(data)));
            }
            DeviceCommand::Download { descriptor } => {
                drop(state);
                return self
                    .recordings
                    .read()
                    .get(descriptor)
                    .cloned()
                    .map(CommandResponse::Data)
                    .ok_or_else(|| LinkError::Rejected(format!("no recording for {descriptor}")));
            }
        }

        Ok(CommandResponse::Ack)
    }
}

#[async_trait]
impl DeviceLink for SimulatedDevice {
    fn address(&self) -> DeviceAddress {
        self.address.clone()
    }

    async fn send_command(&self, command: DeviceCommand) -> Result<CommandResponse, LinkError> {
        let kind = command.kind();
        self.log.write().push(command.clone());

        let delay = self.latency(kind);
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.injected_failure(kind) {
            debug!("{}: injected failure on {}: {}", self.address, kind, error);
            return Err(error);
        }

        let result = self.apply(&command);
        trace!("{}: {} -> {:?}", self.address, kind, result.as_ref().map(|_| ()));
        result
    }

    fn subscribe(&self) -> broadcast::Receiver<DeviceNotification> {
        self.notifications.subscribe()
    }
}

/// Discovery over a set of simulated devices
///
/// Only powered devices are advertised. Devices may be added or removed at
/// runtime to model sensors coming into range.
#[derive(Default)]
pub struct SimulatedDiscovery {
    devices: RwLock<Vec<Arc<SimulatedDevice>>>,
    scan_delay: Duration,
    failure: RwLock<Option<LinkError>>,
}

impl SimulatedDiscovery {
    /// Create discovery over `devices`
    pub fn new(devices: impl IntoIterator<Item = Arc<SimulatedDevice>>) -> Self {
        Self {
            devices: RwLock::new(devices.into_iter().collect()),
            scan_delay: Duration::ZERO,
            failure: RwLock::new(None),
        }
    }

    /// Build devices from config descriptions
    pub fn from_configs(configs: &[SimulatedDeviceConfig]) -> Self {
        Self::new(configs.iter().cloned().map(|c| Arc::new(SimulatedDevice::new(c))))
    }

    /// Spend up to this long per discovery pass (capped by the window)
    #[must_use]
    pub fn with_scan_delay(mut self, delay: Duration) -> Self {
        self.scan_delay = delay;
        self
    }

    /// Bring a device into range
    pub fn add(&self, device: Arc<SimulatedDevice>) {
        let mut devices = self.devices.write();
        devices.retain(|d| d.address != device.address);
        devices.push(device);
    }

    /// Take a device out of range
    pub fn remove(&self, address: &DeviceAddress) {
        self.devices.write().retain(|d| &d.address != address);
    }

    /// Make discovery passes fail (`None` to recover)
    pub fn set_failure(&self, failure: Option<LinkError>) {
        *self.failure.write() = failure;
    }

    /// All simulated devices, advertising or not
    pub fn devices(&self) -> Vec<Arc<SimulatedDevice>> {
        self.devices.read().clone()
    }

    /// Look up a simulated device
    pub fn device(&self, address: &DeviceAddress) -> Option<Arc<SimulatedDevice>> {
        self.devices.read().iter().find(|d| &d.address == address).cloned()
    }
}

#[async_trait]
impl Discovery for SimulatedDiscovery {
    async fn discover(&self, window: Duration) -> Result<Vec<DiscoveredDevice>, LinkError> {
        let delay = self.scan_delay.min(window);
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.failure.read().clone() {
            return Err(error);
        }

        let found: Vec<DiscoveredDevice> = self
            .devices
            .read()
            .iter()
            .filter(|d| d.is_powered())
            .map(|d| DiscoveredDevice::new(d.info(), d.clone() as Arc<dyn DeviceLink>))
            .collect();
        debug!("simulated discovery found {} device(s)", found.len());
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commands_require_connection() {
        let device = SimulatedDevice::standard("aa:01");
        let err = device.send_command(DeviceCommand::Erase).await.unwrap_err();
        assert_eq!(err, LinkError::Disconnected);

        device.send_command(DeviceCommand::Connect).await.unwrap();
        assert!(device.is_connected());
        device.send_command(DeviceCommand::Erase).await.unwrap();
        assert_eq!(device.command_count(CommandKind::Erase), 2);
    }

    #[tokio::test]
    async fn test_recording_is_deterministic() {
        let a = SimulatedDevice::standard("aa:01");
        let b = SimulatedDevice::standard("AA:01");
        let id = Uuid::new_v4();

        for device in [&a, &b] {
            device.send_command(DeviceCommand::Connect).await.unwrap();
            device.send_command(DeviceCommand::StartCapture { measurement: id }).await.unwrap();
            device.send_command(DeviceCommand::StopCapture { measurement: id }).await.unwrap();
        }

        let first = a.send_command(DeviceCommand::Download { descriptor: id }).await.unwrap();
        let second = b.send_command(DeviceCommand::Download { descriptor: id }).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first.into_data().map(|d| d.len()),
            Some(SAMPLES_PER_RECORDING * SAMPLE_SIZE)
        );
    }

    #[tokio::test]
    async fn test_failure_injection_and_power_off() {
        let device = SimulatedDevice::standard("aa:02");
        let mut notifications = device.subscribe();

        device.fail_on(CommandKind::Connect, LinkError::Timeout(50));
        assert_eq!(
            device.send_command(DeviceCommand::Connect).await,
            Err(LinkError::Timeout(50))
        );
        device.clear_failures();
        device.send_command(DeviceCommand::Connect).await.unwrap();
        assert_eq!(
            notifications.recv().await.unwrap(),
            DeviceNotification::Battery { percent: 100 }
        );

        device.send_command(DeviceCommand::PowerOff).await.unwrap();
        assert!(!device.is_powered());
        assert_eq!(notifications.recv().await.unwrap(), DeviceNotification::Disconnected);
    }

    #[tokio::test]
    async fn test_discovery_skips_powered_off_devices() {
        let on = SimulatedDevice::standard("aa:01");
        let off = SimulatedDevice::standard("aa:02");
        off.send_command(DeviceCommand::Connect).await.unwrap();
        off.send_command(DeviceCommand::PowerOff).await.unwrap();

        let discovery = SimulatedDiscovery::new([on, off.clone()]);
        let found = discovery.discover(Duration::from_millis(5)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address().as_str(), "AA:01");

        off.power_on();
        assert_eq!(discovery.discover(Duration::ZERO).await.unwrap().len(), 2);
    }
}
