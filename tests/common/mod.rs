//! Shared fixtures for the integration tests

#![allow(dead_code)]

use notchnet_core::core::device::CommandKind;
use notchnet_core::{
    DeviceAddress, DeviceSlot, LedColor, NotchNetwork, NotchService, ServiceConfig,
    SimulatedDevice, SimulatedDiscovery, Workout,
};
use std::sync::Arc;
use std::time::Duration;

pub struct Harness {
    pub service: NotchService,
    pub discovery: Arc<SimulatedDiscovery>,
}

impl Harness {
    /// Service over standard simulated sensors at `addresses`
    pub fn new(addresses: &[&str]) -> Self {
        let discovery = Arc::new(SimulatedDiscovery::new(
            addresses.iter().map(|a| SimulatedDevice::standard(*a)),
        ));
        let service = NotchService::new(discovery.clone(), config());
        Self { service, discovery }
    }

    pub fn device(&self, address: &str) -> Arc<SimulatedDevice> {
        self.discovery
            .device(&DeviceAddress::new(address))
            .unwrap_or_else(|| panic!("no simulated device {address}"))
    }

    /// Total `kind` commands across every simulated device
    pub fn count(&self, kind: CommandKind) -> usize {
        self.discovery.devices().iter().map(|d| d.command_count(kind)).sum()
    }

    /// Bind a network for an `n`-slot workout
    pub async fn ready(&self, slots: usize) -> NotchNetwork {
        self.service
            .init(workout(slots))
            .result()
            .await
            .expect("init should succeed")
    }
}

pub fn config() -> ServiceConfig {
    ServiceConfig {
        scan_window: Duration::from_millis(10),
        scan_for_new_timeout: Duration::from_millis(200),
        steady_duration: Duration::from_millis(50),
        ..ServiceConfig::default()
    }
}

pub fn workout(slots: usize) -> Workout {
    (0..slots).fold(Workout::new("integration"), |w, i| {
        w.with_slot(DeviceSlot::new(format!("slot-{i}"), LedColor::palette(i)))
    })
}

pub fn addresses(raw: &[&str]) -> Vec<DeviceAddress> {
    raw.iter().map(|a| DeviceAddress::new(*a)).collect()
}
