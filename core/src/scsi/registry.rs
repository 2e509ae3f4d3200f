//! Controller and device registry
//!
//! Controllers are keyed by their target ID (0..7) and created on first
//! attach. A controller with no remaining LUN is dropped by the caller via
//! `delete_controller`.

use std::collections::BTreeMap;

use crate::scsi::controller::ScsiController;
use crate::scsi::target::ScsiTarget;

/// Highest SCSI target ID plus one
pub const ID_MAX: u8 = 8;

#[derive(Default)]
pub struct DeviceRegistry {
    controllers: BTreeMap<u8, ScsiController>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device to the controller of its target ID, creating the
    /// controller on first use
    pub fn attach_to_controller(&mut self, id: u8, device: Box<dyn ScsiTarget>) -> bool {
        if id >= ID_MAX {
            return false;
        }

        let controller = self
            .controllers
            .entry(id)
            .or_insert_with(|| ScsiController::new(id));
        controller.add_device(device)
    }

    pub fn find_controller(&self, id: u8) -> Option<&ScsiController> {
        self.controllers.get(&id)
    }

    pub fn controller_mut(&mut self, id: u8) -> Option<&mut ScsiController> {
        self.controllers.get_mut(&id)
    }

    pub fn device_by(&self, id: u8, lun: u8) -> Option<&dyn ScsiTarget> {
        self.controllers.get(&id).and_then(|c| c.device(lun))
    }

    pub fn device_by_mut(&mut self, id: u8, lun: u8) -> Option<&mut Box<dyn ScsiTarget>> {
        self.controllers.get_mut(&id).and_then(|c| c.device_mut(lun))
    }

    pub fn has_controller(&self, id: u8) -> bool {
        self.controllers.contains_key(&id)
    }

    pub fn delete_controller(&mut self, id: u8) -> bool {
        self.controllers.remove(&id).is_some()
    }

    pub fn delete_all(&mut self) {
        self.controllers.clear();
    }

    pub fn reset_all(&mut self) {
        for controller in self.controllers.values_mut() {
            controller.reset();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// All devices as (ID, LUN, device), ordered by ID and LUN
    pub fn all_devices(&self) -> impl Iterator<Item = (u8, u8, &dyn ScsiTarget)> {
        self.controllers
            .iter()
            .flat_map(|(id, c)| c.luns().map(move |(lun, dev)| (*id, lun, dev)))
    }

    pub fn device_count(&self) -> usize {
        self.controllers.values().map(ScsiController::lun_count).sum()
    }

    /// Decodes the initiator's selection byte: exactly one of the asserted
    /// bits addresses one of our controllers; the remaining bit is the
    /// initiator's own ID.
    pub fn identify_controller(&mut self, id_data: u8) -> Option<(&mut ScsiController, Option<u8>)> {
        let target_id = self
            .controllers
            .keys()
            .copied()
            .find(|id| id_data & (1 << id) != 0)?;

        let initiator_bits = id_data & !(1 << target_id);
        let initiator_id = if initiator_bits.count_ones() == 1 {
            Some(initiator_bits.trailing_zeros() as u8)
        } else {
            None
        };

        Some((self.controllers.get_mut(&target_id).unwrap(), initiator_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::target::DeviceType;
    use crate::scsi::target::factory::{DeviceProfile, create_device};

    fn services(id: u8, lun: u8) -> Box<dyn ScsiTarget> {
        create_device(&DeviceProfile {
            device_type: DeviceType::HostServices,
            id,
            lun,
            filename: String::new(),
        })
        .unwrap()
    }

    #[test]
    fn attach_creates_controller() {
        let mut registry = DeviceRegistry::new();
        assert!(registry.attach_to_controller(4, services(4, 0)));
        assert!(registry.has_controller(4));
        assert!(registry.device_by(4, 0).is_some());
        assert_eq!(registry.device_count(), 1);
    }

    #[test]
    fn attach_rejects_duplicate_lun() {
        let mut registry = DeviceRegistry::new();
        assert!(registry.attach_to_controller(4, services(4, 0)));
        assert!(!registry.attach_to_controller(4, services(4, 0)));
        assert_eq!(registry.device_count(), 1);
    }

    #[test]
    fn attach_rejects_out_of_range_id() {
        let mut registry = DeviceRegistry::new();
        assert!(!registry.attach_to_controller(8, services(0, 0)));
    }

    #[test]
    fn all_devices_is_ordered() {
        let mut registry = DeviceRegistry::new();
        registry.attach_to_controller(5, services(5, 0));
        registry.attach_to_controller(1, services(1, 0));
        registry.attach_to_controller(1, services(1, 2));

        let devices: Vec<(u8, u8)> = registry.all_devices().map(|(id, lun, _)| (id, lun)).collect();
        assert_eq!(devices, vec![(1, 0), (1, 2), (5, 0)]);
    }

    #[test]
    fn identify_controller_decodes_selection_byte() {
        let mut registry = DeviceRegistry::new();
        registry.attach_to_controller(2, services(2, 0));

        // Initiator 7 selecting target 2
        let (controller, initiator) = registry.identify_controller(0b1000_0100).unwrap();
        assert_eq!(controller.target_id(), 2);
        assert_eq!(initiator, Some(7));

        // No controller for this selection
        assert!(registry.identify_controller(0b1000_1000).is_none());
    }

    #[test]
    fn delete_all_empties_registry() {
        let mut registry = DeviceRegistry::new();
        registry.attach_to_controller(0, services(0, 0));
        registry.attach_to_controller(3, services(3, 0));
        registry.delete_all();
        assert!(registry.is_empty());
        assert_eq!(registry.device_count(), 0);
    }
}
