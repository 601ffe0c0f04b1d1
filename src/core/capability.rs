//! Device capability flags
//!
//! Each sensor advertises what it can do. Workout slots declare what they
//! need, and the network registry only binds a device to a slot whose
//! requirements its capabilities cover.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Sensor capability flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// 3-axis accelerometer
    Accelerometer,
    /// 3-axis gyroscope
    Gyroscope,
    /// 3-axis magnetometer
    Magnetometer,
    /// RGB status LED
    ColorLed,
    /// Onboard flash for captured data
    OnboardStorage,
    /// Sampling above 100 Hz
    HighRateSampling,
    /// Supports steady (calibration) measurement
    SteadyMeasurement,
}

impl Capability {
    /// All known capabilities
    pub fn all() -> &'static [Capability] {
        &[
            Capability::Accelerometer,
            Capability::Gyroscope,
            Capability::Magnetometer,
            Capability::ColorLed,
            Capability::OnboardStorage,
            Capability::HighRateSampling,
            Capability::SteadyMeasurement,
        ]
    }

    /// Stable kebab-case name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Accelerometer => "accelerometer",
            Self::Gyroscope => "gyroscope",
            Self::Magnetometer => "magnetometer",
            Self::ColorLed => "color-led",
            Self::OnboardStorage => "onboard-storage",
            Self::HighRateSampling => "high-rate-sampling",
            Self::SteadyMeasurement => "steady-measurement",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::all()
            .iter()
            .copied()
            .find(|cap| cap.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown capability: {s}"))
    }
}

/// Ordered set of capabilities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet {
    capabilities: BTreeSet<Capability>,
}

impl CapabilitySet {
    /// Create a new empty capability set
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything a standard Notch sensor offers
    pub fn standard() -> Self {
        Capability::all().iter().copied().collect()
    }

    /// Add a capability
    pub fn add(&mut self, cap: Capability) -> &mut Self {
        self.capabilities.insert(cap);
        self
    }

    /// Builder form of [`CapabilitySet::add`]
    #[must_use]
    pub fn with(mut self, cap: Capability) -> Self {
        self.capabilities.insert(cap);
        self
    }

    /// Remove a capability
    pub fn remove(&mut self, cap: Capability) -> &mut Self {
        self.capabilities.remove(&cap);
        self
    }

    /// Check if capability is supported
    pub fn supports(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Check if every capability of `required` is present
    pub fn covers(&self, required: &CapabilitySet) -> bool {
        required.capabilities.is_subset(&self.capabilities)
    }

    /// Capabilities of `required` that are missing here
    pub fn missing(&self, required: &CapabilitySet) -> Vec<Capability> {
        required
            .capabilities
            .difference(&self.capabilities)
            .copied()
            .collect()
    }

    /// Iterate in a stable order
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.capabilities.iter().copied()
    }

    /// Number of capabilities
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self {
            capabilities: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.capabilities.iter().map(Capability::name).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_covers_everything() {
        let caps = CapabilitySet::standard();
        for cap in Capability::all() {
            assert!(caps.supports(*cap));
        }
        assert!(caps.covers(&CapabilitySet::new().with(Capability::Magnetometer)));
    }

    #[test]
    fn test_missing_capabilities() {
        let device = CapabilitySet::new()
            .with(Capability::Accelerometer)
            .with(Capability::Gyroscope);
        let required = CapabilitySet::new()
            .with(Capability::Gyroscope)
            .with(Capability::HighRateSampling);

        assert!(!device.covers(&required));
        assert_eq!(device.missing(&required), vec![Capability::HighRateSampling]);
        assert!(device.covers(&CapabilitySet::new()));
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("color-led".parse::<Capability>(), Ok(Capability::ColorLed));
        assert!("flux-capacitor".parse::<Capability>().is_err());

        let caps = CapabilitySet::new()
            .with(Capability::Gyroscope)
            .with(Capability::Accelerometer);
        assert_eq!(caps.to_string(), "[accelerometer, gyroscope]");
    }
}
