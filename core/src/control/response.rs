//! Builds protobuf reply payloads from the daemon state

use itertools::Itertools;

use super::proto::{
    self, PbDevice, PbDeviceProperties, PbDeviceStatus, PbDeviceTypeProperties,
    PbDeviceTypesInfo, PbDevicesInfo, PbImageFile, PbImageFilesInfo, PbLogLevelInfo,
    PbMappingInfo, PbNetworkInterfacesInfo, PbOperation, PbOperationInfo, PbOperationMetaData,
    PbReservedIdsInfo, PbServerInfo, PbVersionInfo,
};
use crate::daemon::Daemon;
use crate::scsi::target::factory;
use crate::scsi::target::{DeviceType, LUN_MAX, ScsiTarget};
use crate::version;

pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "err", "off"];

const EXTENSIONS: &[(&str, DeviceType)] = &[
    ("hd1", DeviceType::Harddisk),
    ("hds", DeviceType::Harddisk),
    ("hda", DeviceType::Harddisk),
    ("hdn", DeviceType::Harddisk),
    ("hdi", DeviceType::Harddisk),
    ("nhd", DeviceType::Harddisk),
    ("hdr", DeviceType::RemovableDisk),
    ("mos", DeviceType::Optical),
    ("iso", DeviceType::Cdrom),
];

const ALL_DEVICE_TYPES: &[DeviceType] = &[
    DeviceType::Harddisk,
    DeviceType::RemovableDisk,
    DeviceType::Optical,
    DeviceType::Cdrom,
    DeviceType::Bridge,
    DeviceType::Daynaport,
    DeviceType::HostServices,
    DeviceType::Printer,
];

fn device_properties(device_type: DeviceType) -> PbDeviceProperties {
    let (read_only, protectable, stoppable, removable, lockable) = match device_type {
        DeviceType::Harddisk => (false, true, true, false, false),
        DeviceType::RemovableDisk | DeviceType::Optical => (false, true, true, true, true),
        DeviceType::Cdrom => (true, false, true, true, true),
        _ => (false, false, false, false, false),
    };

    let supports_params = matches!(
        device_type,
        DeviceType::Bridge | DeviceType::Daynaport | DeviceType::Printer
    );

    PbDeviceProperties {
        luns: u32::from(LUN_MAX),
        read_only,
        protectable,
        stoppable,
        removable,
        lockable,
        supports_file: !supports_params && device_type != DeviceType::HostServices,
        supports_params,
        block_sizes: factory::sector_sizes(device_type).to_vec(),
        default_params: factory::default_params(device_type),
    }
}

/// Protobuf description of one attached device
pub fn device_to_pb(daemon: &Daemon, id: u8, lun: u8, device: &dyn ScsiTarget) -> PbDevice {
    let state = device.state();
    let device_type = device.target_type();

    let file = device.image_path().map(|path| {
        let name = path
            .strip_prefix(daemon.images.default_folder())
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();

        daemon
            .images
            .image_file_info(&name)
            .unwrap_or(PbImageFile {
                name,
                ..Default::default()
            })
    });

    let mut device_pb = PbDevice {
        id: i32::from(id),
        unit: i32::from(lun),
        r#type: proto::types::from_core(device_type) as i32,
        properties: Some(device_properties(device_type)),
        status: Some(PbDeviceStatus {
            protected: state.is_protected(),
            stopped: state.stopped,
            removed: state.removed,
            locked: state.locked,
        }),
        file,
        params: state.params().clone(),
        vendor: state.vendor().to_string(),
        product: state.product().to_string(),
        revision: state.revision().to_string(),
        ..Default::default()
    };

    if let Some(properties) = device_pb.properties.as_mut() {
        properties.read_only = state.read_only;
    }

    device_pb
}

/// All attached devices, or only those matching the requested (ID, LUN)
/// pairs
pub fn devices_info(daemon: &Daemon, requested: &[(u8, u8)]) -> PbDevicesInfo {
    let devices = daemon
        .registry
        .all_devices()
        .filter(|(id, lun, _)| requested.is_empty() || requested.contains(&(*id, *lun)))
        .map(|(id, lun, device)| device_to_pb(daemon, id, lun, device))
        .collect();

    PbDevicesInfo { devices }
}

pub fn device_types_info() -> PbDeviceTypesInfo {
    PbDeviceTypesInfo {
        properties: ALL_DEVICE_TYPES
            .iter()
            .map(|&device_type| PbDeviceTypeProperties {
                r#type: proto::types::from_core(device_type) as i32,
                properties: Some(device_properties(device_type)),
            })
            .collect(),
    }
}

pub fn version_info() -> PbVersionInfo {
    let (major_version, minor_version, patch_version) = version::version_components();
    PbVersionInfo {
        major_version,
        minor_version,
        patch_version,
    }
}

pub fn log_level_info(current: &str) -> PbLogLevelInfo {
    PbLogLevelInfo {
        log_levels: LOG_LEVELS.iter().map(ToString::to_string).collect(),
        current_log_level: current.to_string(),
    }
}

pub fn image_files_info(daemon: &Daemon) -> PbImageFilesInfo {
    PbImageFilesInfo {
        default_image_folder: daemon.images.default_folder().to_string_lossy().to_string(),
        image_files: daemon.images.available_images(),
        depth: daemon.images.depth() as u32,
    }
}

pub fn network_interfaces_info() -> PbNetworkInterfacesInfo {
    PbNetworkInterfacesInfo {
        name: factory::network_interfaces(),
    }
}

pub fn mapping_info() -> PbMappingInfo {
    PbMappingInfo {
        mapping: EXTENSIONS
            .iter()
            .map(|(ext, device_type)| {
                (
                    ext.to_string(),
                    proto::types::from_core(*device_type) as i32,
                )
            })
            .collect(),
    }
}

pub fn reserved_ids_info(daemon: &Daemon) -> PbReservedIdsInfo {
    PbReservedIdsInfo {
        ids: daemon.reserved_ids.iter().map(|&id| u32::from(id)).collect(),
    }
}

pub fn operation_info() -> PbOperationInfo {
    let operations = (0..=PbOperation::OperationInfo as i32)
        .filter_map(|value| PbOperation::try_from(value).ok())
        .map(|operation| PbOperationMetaData {
            operation: operation as i32,
            name: format!("{:?}", operation),
        })
        .collect();

    PbOperationInfo { operations }
}

pub fn server_info(daemon: &Daemon) -> PbServerInfo {
    PbServerInfo {
        version_info: Some(version_info()),
        log_level_info: Some(log_level_info(&daemon.log_level)),
        device_types_info: Some(device_types_info()),
        image_files_info: Some(image_files_info(daemon)),
        network_interfaces_info: Some(network_interfaces_info()),
        mapping_info: Some(mapping_info()),
        devices_info: Some(devices_info(daemon, &[])),
        reserved_ids_info: Some(reserved_ids_info(daemon)),
        operation_info: Some(operation_info()),
    }
}

/// One-line-per-device listing for the log and console
pub fn list_devices(devices: &PbDevicesInfo) -> String {
    if devices.devices.is_empty() {
        return "No devices attached".to_string();
    }

    devices
        .devices
        .iter()
        .map(|device| {
            let file = device
                .file
                .as_ref()
                .map(|f| f.name.as_str())
                .filter(|name| !name.is_empty())
                .unwrap_or("NO MEDIUM");
            format!(
                "ID {}, unit {}: {:?} {} {} {}",
                device.id,
                device.unit,
                device.r#type(),
                device.vendor,
                device.product,
                file
            )
        })
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::proto::PbDeviceType;
    use crate::scsi::target::factory::{DeviceProfile, create_device};

    fn daemon_with_services() -> Daemon {
        let mut daemon = Daemon::new();
        let device = create_device(&DeviceProfile {
            device_type: DeviceType::HostServices,
            id: 3,
            lun: 0,
            filename: String::new(),
        })
        .unwrap();
        daemon.registry.attach_to_controller(3, device);
        daemon
    }

    #[test]
    fn devices_info_reflects_registry() {
        let daemon = daemon_with_services();

        let info = devices_info(&daemon, &[]);
        assert_eq!(info.devices.len(), 1);
        assert_eq!(info.devices[0].id, 3);
        assert_eq!(info.devices[0].r#type(), PbDeviceType::Schs);
        assert_eq!(info.devices[0].product, "Host Services");

        let filtered = devices_info(&daemon, &[(5, 0)]);
        assert!(filtered.devices.is_empty());
    }

    #[test]
    fn device_types_cover_all_types() {
        let info = device_types_info();
        assert_eq!(info.properties.len(), 8);

        let cd = info
            .properties
            .iter()
            .find(|p| p.r#type == PbDeviceType::Sccd as i32)
            .unwrap();
        let properties = cd.properties.as_ref().unwrap();
        assert!(properties.read_only);
        assert!(properties.removable);
        assert_eq!(properties.block_sizes, vec![512, 2048]);
    }

    #[test]
    fn mapping_contains_all_extensions() {
        let mapping = mapping_info().mapping;
        assert_eq!(mapping.len(), 9);
        assert_eq!(mapping["iso"], PbDeviceType::Sccd as i32);
        assert_eq!(mapping["hdr"], PbDeviceType::Scrm as i32);
    }

    #[test]
    fn server_info_is_fully_populated() {
        let daemon = daemon_with_services();
        let info = server_info(&daemon);

        assert!(info.version_info.is_some());
        assert!(info.log_level_info.is_some());
        assert!(info.device_types_info.is_some());
        assert!(info.image_files_info.is_some());
        assert!(info.mapping_info.is_some());
        assert!(info.devices_info.is_some());
        assert!(info.operation_info.is_some());
    }
}
