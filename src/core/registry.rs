//! Network registry
//!
//! Resolves a workout against candidate devices. Assignment is a bipartite
//! matching between devices and slots: candidates are visited in ascending
//! address order and each one is kept only if it can enlarge the matching
//! (augmenting paths may move earlier devices to other slots). This always
//! finds a complete assignment when one exists, and the bound device set is
//! the lexicographically smallest feasible one.

use super::device::{DeviceAddress, DeviceLink, DiscoveredDevice, NotchDevice};
use super::workout::{DeviceSlot, Workout};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Workout cannot be satisfied by the candidate devices
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "workout '{workout}' needs {required} device(s), {available} candidate(s) available; unfilled slots: {}",
    .unfilled.join(", ")
)]
pub struct CompatibilityError {
    /// Workout name
    pub workout: String,
    /// Required device count
    pub required: usize,
    /// Distinct candidates considered
    pub available: usize,
    /// Slots no candidate could fill
    pub unfilled: Vec<String>,
}

/// A device bound to a workout slot
#[derive(Clone)]
pub struct NetworkMember {
    /// Index of the slot in the workout
    pub slot_index: usize,
    /// Slot settings
    pub slot: DeviceSlot,
    /// Device identity
    pub device: NotchDevice,
    /// Link to the device
    pub link: Arc<dyn DeviceLink>,
}

impl NetworkMember {
    pub fn address(&self) -> &DeviceAddress {
        &self.device.address
    }

    /// View as a discovery result, for re-resolving
    pub fn as_discovered(&self) -> DiscoveredDevice {
        DiscoveredDevice::new(self.device.clone(), self.link.clone())
    }
}

impl fmt::Debug for NetworkMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkMember")
            .field("slot_index", &self.slot_index)
            .field("slot", &self.slot.name)
            .field("address", &self.device.address)
            .finish_non_exhaustive()
    }
}

/// Result of a successful resolve, before it is bound
#[derive(Debug, Clone)]
pub struct Assignment {
    pub workout: Arc<Workout>,
    /// Members in slot order
    pub members: Vec<NetworkMember>,
}

impl Assignment {
    /// Device addresses in slot order
    pub fn addresses(&self) -> Vec<DeviceAddress> {
        self.members.iter().map(|m| m.address().clone()).collect()
    }
}

/// The bound network
#[derive(Debug, Clone)]
pub struct NotchNetwork {
    generation: u64,
    workout: Arc<Workout>,
    members: Vec<NetworkMember>,
}

impl NotchNetwork {
    pub(crate) fn new(generation: u64, assignment: Assignment) -> Self {
        Self {
            generation,
            workout: assignment.workout,
            members: assignment.members,
        }
    }

    /// Bind generation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn workout(&self) -> &Arc<Workout> {
        &self.workout
    }

    /// Members in slot order
    pub fn members(&self) -> &[NetworkMember] {
        &self.members
    }

    /// Device addresses in slot order
    pub fn addresses(&self) -> Vec<DeviceAddress> {
        self.members.iter().map(|m| m.address().clone()).collect()
    }

    /// Find a member by address
    pub fn member(&self, address: &DeviceAddress) -> Option<&NetworkMember> {
        self.members.iter().find(|m| m.address() == address)
    }

    /// Check if `addresses` is exactly this network's device set
    pub fn same_devices(&self, addresses: &[DeviceAddress]) -> bool {
        let mut mine = self.addresses();
        let mut theirs = addresses.to_vec();
        mine.sort();
        theirs.sort();
        mine == theirs
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Merge candidate groups, keeping the first occurrence of each address
pub fn merge_candidates<I>(groups: I) -> Vec<DiscoveredDevice>
where
    I: IntoIterator<Item = DiscoveredDevice>,
{
    let mut merged: Vec<DiscoveredDevice> = Vec::new();
    for candidate in groups {
        if !merged.iter().any(|m| m.address() == candidate.address()) {
            merged.push(candidate);
        }
    }
    merged
}

/// Resolves workouts into assignments
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkRegistry;

impl NetworkRegistry {
    pub fn new() -> Self {
        Self
    }

    /// Assign devices to every slot of `workout`
    pub fn resolve(
        &self,
        workout: Arc<Workout>,
        candidates: &[DiscoveredDevice],
    ) -> Result<Assignment, CompatibilityError> {
        // Dedupe by address (first occurrence wins), ascending order
        let mut by_address: BTreeMap<&DeviceAddress, &DiscoveredDevice> = BTreeMap::new();
        for candidate in candidates {
            by_address.entry(candidate.address()).or_insert(candidate);
        }
        let ordered: Vec<&DiscoveredDevice> = by_address.into_values().collect();

        let slots = &workout.slots;
        let adjacency: Vec<Vec<usize>> = ordered
            .iter()
            .map(|candidate| {
                slots
                    .iter()
                    .enumerate()
                    .filter(|(_, slot)| candidate.device.capabilities.covers(&slot.required))
                    .map(|(index, _)| index)
                    .collect()
            })
            .collect();

        let mut owner: Vec<Option<usize>> = vec![None; slots.len()];
        let mut filled = 0;
        for candidate in 0..ordered.len() {
            if filled == slots.len() {
                break;
            }
            let mut visited = vec![false; slots.len()];
            if augment(candidate, &adjacency, &mut owner, &mut visited) {
                filled += 1;
            }
        }

        if filled < slots.len() {
            let unfilled: Vec<String> = slots
                .iter()
                .zip(&owner)
                .filter(|(_, owner)| owner.is_none())
                .map(|(slot, _)| slot.name.clone())
                .collect();
            debug!(
                "workout '{}' unsatisfiable: {} of {} slot(s) unfilled",
                workout.name,
                unfilled.len(),
                slots.len()
            );
            return Err(CompatibilityError {
                workout: workout.name.clone(),
                required: slots.len(),
                available: ordered.len(),
                unfilled,
            });
        }

        let members = owner
            .iter()
            .enumerate()
            .filter_map(|(slot_index, owner)| {
                owner.map(|candidate| {
                    let chosen = ordered[candidate];
                    NetworkMember {
                        slot_index,
                        slot: slots[slot_index].clone(),
                        device: chosen.device.clone(),
                        link: chosen.link.clone(),
                    }
                })
            })
            .collect();

        Ok(Assignment { workout, members })
    }

    /// Bind every responding device to its own unconstrained slot
    pub fn unchecked(&self, responders: &[DiscoveredDevice]) -> Assignment {
        let mut ordered = merge_candidates(responders.iter().cloned());
        ordered.sort_by(|a, b| a.address().cmp(b.address()));

        let devices: Vec<NotchDevice> = ordered.iter().map(|d| d.device.clone()).collect();
        let workout = Arc::new(Workout::unchecked(&devices));
        let members = ordered
            .into_iter()
            .zip(workout.slots.iter().cloned())
            .enumerate()
            .map(|(slot_index, (discovered, slot))| NetworkMember {
                slot_index,
                slot,
                device: discovered.device,
                link: discovered.link,
            })
            .collect();

        Assignment { workout, members }
    }
}

/// Try to give `candidate` a slot, free slots first, then by displacing
fn augment(
    candidate: usize,
    adjacency: &[Vec<usize>],
    owner: &mut [Option<usize>],
    visited: &mut [bool],
) -> bool {
    for &slot in &adjacency[candidate] {
        if owner[slot].is_none() && !visited[slot] {
            visited[slot] = true;
            owner[slot] = Some(candidate);
            return true;
        }
    }

    for &slot in &adjacency[candidate] {
        if visited[slot] {
            continue;
        }
        visited[slot] = true;
        if let Some(current) = owner[slot] {
            if augment(current, adjacency, owner, visited) {
                owner[slot] = Some(candidate);
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::capability::{Capability, CapabilitySet};
    use crate::core::device::SimulatedDevice;
    use crate::core::workout::LedColor;

    fn candidate(address: &str, capabilities: CapabilitySet) -> DiscoveredDevice {
        let link = SimulatedDevice::standard(address);
        DiscoveredDevice::new(
            NotchDevice::new(address).with_capabilities(capabilities),
            link,
        )
    }

    fn slots(n: usize) -> Arc<Workout> {
        let mut workout = Workout::new("test");
        for i in 0..n {
            workout = workout.with_slot(DeviceSlot::new(format!("slot-{i}"), LedColor::palette(i)));
        }
        Arc::new(workout)
    }

    #[test]
    fn test_lowest_addresses_are_bound() {
        let candidates = vec![
            candidate("CC", CapabilitySet::standard()),
            candidate("AA", CapabilitySet::standard()),
            candidate("BB", CapabilitySet::standard()),
        ];

        for _ in 0..3 {
            let assignment = NetworkRegistry::new().resolve(slots(2), &candidates).unwrap();
            assert_eq!(
                assignment.addresses(),
                vec![DeviceAddress::new("AA"), DeviceAddress::new("BB")]
            );
        }
    }

    #[test]
    fn test_augmenting_path_moves_earlier_device() {
        let gyro = CapabilitySet::new().with(Capability::Gyroscope);
        let workout = Arc::new(
            Workout::new("constrained")
                .with_slot(DeviceSlot::new("any", LedColor::RED))
                .with_slot(DeviceSlot::new("gyro", LedColor::BLUE).requires(gyro.clone())),
        );
        // AA could take either slot; BB only fits "any"
        let candidates = vec![
            candidate("BB", CapabilitySet::new()),
            candidate("AA", gyro),
        ];

        let assignment = NetworkRegistry::new().resolve(workout, &candidates).unwrap();
        assert_eq!(assignment.members[0].address().as_str(), "BB");
        assert_eq!(assignment.members[1].address().as_str(), "AA");
        assert_eq!(assignment.members[1].slot.name, "gyro");
    }

    #[test]
    fn test_incompatible_reports_unfilled_slots() {
        let workout = Arc::new(
            Workout::new("magnetic")
                .with_slot(DeviceSlot::new("a", LedColor::RED))
                .with_slot(
                    DeviceSlot::new("b", LedColor::BLUE)
                        .requires(CapabilitySet::new().with(Capability::Magnetometer)),
                ),
        );
        let candidates = vec![
            candidate("AA", CapabilitySet::new()),
            candidate("AA", CapabilitySet::standard()),
            candidate("BB", CapabilitySet::new()),
        ];

        let err = NetworkRegistry::new().resolve(workout, &candidates).unwrap_err();
        assert_eq!(err.required, 2);
        assert_eq!(err.available, 2, "duplicates are counted once");
        assert_eq!(err.unfilled, vec!["b".to_string()]);
    }

    #[test]
    fn test_unchecked_assignment() {
        let responders = vec![
            candidate("BB", CapabilitySet::new()),
            candidate("AA", CapabilitySet::new()),
        ];
        let assignment = NetworkRegistry::new().unchecked(&responders);
        assert_eq!(assignment.workout.device_count(), 2);
        assert_eq!(assignment.members[0].address().as_str(), "AA");
        assert_eq!(assignment.members[1].slot_index, 1);
    }

    #[test]
    fn test_same_devices_ignores_order() {
        let candidates = vec![
            candidate("AA", CapabilitySet::standard()),
            candidate("BB", CapabilitySet::standard()),
        ];
        let assignment = NetworkRegistry::new().resolve(slots(2), &candidates).unwrap();
        let network = NotchNetwork::new(1, assignment);
        assert!(network.same_devices(&[DeviceAddress::new("bb"), DeviceAddress::new("aa")]));
        assert!(!network.same_devices(&[DeviceAddress::new("AA")]));
    }
}
