//! Workout definitions
//!
//! A workout lists the device slots a capture needs (placement, LED color,
//! sampling rate, required capabilities) and the preferred capture mode.

use super::capability::CapabilitySet;
use super::device::NotchDevice;
use super::error::NotchError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default sampling frequency for a slot
pub const DEFAULT_FREQUENCY_HZ: u32 = 40;

/// Highest sampling frequency a slot may request
pub const MAX_FREQUENCY_HZ: u32 = 1000;

/// RGB color for a device status LED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedColor {
    /// Red
    pub r: u8,
    /// Green
    pub g: u8,
    /// Blue
    pub b: u8,
}

impl LedColor {
    pub const RED: Self = Self::rgb(255, 0, 0);
    pub const GREEN: Self = Self::rgb(0, 255, 0);
    pub const BLUE: Self = Self::rgb(0, 0, 255);
    pub const YELLOW: Self = Self::rgb(255, 255, 0);
    pub const CYAN: Self = Self::rgb(0, 255, 255);
    pub const MAGENTA: Self = Self::rgb(255, 0, 255);
    pub const WHITE: Self = Self::rgb(255, 255, 255);
    /// LED off
    pub const OFF: Self = Self::rgb(0, 0, 0);

    /// Create a color from components
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Color used for the n-th slot of a generated workout
    pub fn palette(index: usize) -> Self {
        const PALETTE: [LedColor; 6] = [
            LedColor::RED,
            LedColor::GREEN,
            LedColor::BLUE,
            LedColor::YELLOW,
            LedColor::CYAN,
            LedColor::MAGENTA,
        ];
        PALETTE[index % PALETTE.len()]
    }
}

impl fmt::Display for LedColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Preferred capture mode of a workout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CaptureMode {
    /// Steady (calibration) measurement only
    Steady,
    /// Unbounded capture, stopped explicitly
    #[default]
    Capture,
    /// Fixed-length capture
    TimedCapture {
        /// Capture length in milliseconds
        duration_ms: u64,
    },
}

impl CaptureMode {
    /// Duration of a timed capture
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::TimedCapture { duration_ms } => Some(Duration::from_millis(*duration_ms)),
            _ => None,
        }
    }
}

/// One device position in a workout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSlot {
    /// Placement name (e.g. "RightUpperArm")
    pub name: String,
    /// LED color shown by the device bound to this slot
    pub color: LedColor,
    /// Sampling frequency
    #[serde(default = "default_frequency")]
    pub frequency_hz: u32,
    /// Capabilities the bound device must have
    #[serde(default)]
    pub required: CapabilitySet,
}

fn default_frequency() -> u32 {
    DEFAULT_FREQUENCY_HZ
}

impl DeviceSlot {
    /// Create an unconstrained slot
    pub fn new(name: impl Into<String>, color: LedColor) -> Self {
        Self {
            name: name.into(),
            color,
            frequency_hz: DEFAULT_FREQUENCY_HZ,
            required: CapabilitySet::new(),
        }
    }

    /// Set sampling frequency
    #[must_use]
    pub fn frequency(mut self, frequency_hz: u32) -> Self {
        self.frequency_hz = frequency_hz;
        self
    }

    /// Set required capabilities
    #[must_use]
    pub fn requires(mut self, required: CapabilitySet) -> Self {
        self.required = required;
        self
    }
}

/// Capture configuration for a network of devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workout {
    /// Workout name
    pub name: String,
    /// Device slots, in assignment order
    pub slots: Vec<DeviceSlot>,
    /// Preferred capture mode
    #[serde(default)]
    pub capture_mode: CaptureMode,
}

impl Workout {
    /// Create an empty workout
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Vec::new(),
            capture_mode: CaptureMode::default(),
        }
    }

    /// Add a slot
    #[must_use]
    pub fn with_slot(mut self, slot: DeviceSlot) -> Self {
        self.slots.push(slot);
        self
    }

    /// Set preferred capture mode
    #[must_use]
    pub fn with_capture_mode(mut self, mode: CaptureMode) -> Self {
        self.capture_mode = mode;
        self
    }

    /// Number of devices this workout needs
    pub fn device_count(&self) -> usize {
        self.slots.len()
    }

    /// Workout binding every given device to its own unconstrained slot
    pub fn unchecked(devices: &[NotchDevice]) -> Self {
        let slots = devices
            .iter()
            .enumerate()
            .map(|(index, device)| DeviceSlot::new(device.display_name(), LedColor::palette(index)))
            .collect();
        Self {
            name: "unchecked".to_string(),
            slots,
            capture_mode: CaptureMode::default(),
        }
    }

    /// Parse a workout from TOML
    pub fn from_toml(content: &str) -> Result<Self, NotchError> {
        let workout: Self =
            toml::from_str(content).map_err(|e| NotchError::InvalidWorkout(e.to_string()))?;
        workout.validate()?;
        Ok(workout)
    }

    /// Check structural constraints
    pub fn validate(&self) -> Result<(), NotchError> {
        if self.slots.is_empty() {
            return Err(NotchError::InvalidWorkout(format!(
                "workout '{}' has no device slots",
                self.name
            )));
        }
        for slot in &self.slots {
            if slot.frequency_hz == 0 || slot.frequency_hz > MAX_FREQUENCY_HZ {
                return Err(NotchError::InvalidWorkout(format!(
                    "slot '{}' has unsupported frequency {} Hz",
                    slot.name, slot.frequency_hz
                )));
            }
        }
        if let CaptureMode::TimedCapture { duration_ms: 0 } = self.capture_mode {
            return Err(NotchError::InvalidWorkout(
                "timed capture needs a non-zero duration".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::capability::Capability;

    #[test]
    fn test_workout_from_toml() {
        let content = r##"
            name = "arm"
            capture_mode = { type = "timed-capture", duration_ms = 5000 }

            [[slots]]
            name = "RightUpperArm"
            color = { r = 255, g = 0, b = 0 }

            [[slots]]
            name = "RightForeArm"
            color = { r = 0, g = 0, b = 255 }
            frequency_hz = 200
            required = ["gyroscope", "high-rate-sampling"]
        "##;

        let workout = Workout::from_toml(content).unwrap();
        assert_eq!(workout.device_count(), 2);
        assert_eq!(workout.slots[0].frequency_hz, DEFAULT_FREQUENCY_HZ);
        assert!(workout.slots[1].required.supports(Capability::HighRateSampling));
        assert_eq!(workout.capture_mode.duration(), Some(Duration::from_millis(5000)));
    }

    #[test]
    fn test_validation() {
        assert!(Workout::new("empty").validate().is_err());

        let bad_rate =
            Workout::new("fast").with_slot(DeviceSlot::new("a", LedColor::RED).frequency(0));
        assert!(bad_rate.validate().is_err());

        let ok = Workout::new("ok").with_slot(DeviceSlot::new("a", LedColor::RED));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_unchecked_workout_uses_palette() {
        let devices = vec![NotchDevice::new("01").with_name("left"), NotchDevice::new("02")];
        let workout = Workout::unchecked(&devices);
        assert_eq!(workout.slots[0].name, "left");
        assert_eq!(workout.slots[1].name, "02");
        assert_eq!(workout.slots[1].color, LedColor::GREEN);
        assert!(workout.slots.iter().all(|s| s.required.is_empty()));
    }

    #[test]
    fn test_color_display() {
        assert_eq!(LedColor::rgb(1, 171, 255).to_string(), "#01ABFF");
    }
}
