//! Device construction: type inference from file names, per-type capability
//! profiles and default parameters

use std::collections::HashMap;

use super::bridge::ScsiBridge;
use super::cdrom::ScsiCdRom;
use super::daynaport::ScsiDaynaport;
use super::harddisk::ScsiHardDisk;
use super::optical::ScsiMoDisk;
use super::printer::ScsiPrinter;
use super::services::HostServices;
use super::{DeviceType, ScsiLevel, ScsiTarget};

/// Everything needed to build a device instance
pub struct DeviceProfile {
    pub device_type: DeviceType,
    pub id: u8,
    pub lun: u8,
    pub filename: String,
}

fn extension(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Derives the device type from a file extension or one of the special
/// device names
pub fn device_type_for_file(filename: &str) -> Option<DeviceType> {
    match extension(filename).as_str() {
        "hd1" | "hds" | "hda" | "hdn" | "hdi" | "nhd" => return Some(DeviceType::Harddisk),
        "hdr" => return Some(DeviceType::RemovableDisk),
        "mos" => return Some(DeviceType::Optical),
        "iso" => return Some(DeviceType::Cdrom),
        _ => {}
    }

    match filename {
        "bridge" => Some(DeviceType::Bridge),
        "daynaport" => Some(DeviceType::Daynaport),
        "printer" => Some(DeviceType::Printer),
        "services" => Some(DeviceType::HostServices),
        _ => None,
    }
}

/// Supported configurable sector sizes per type
pub fn sector_sizes(device_type: DeviceType) -> &'static [u32] {
    match device_type {
        DeviceType::Harddisk | DeviceType::RemovableDisk => ScsiHardDisk::SECTOR_SIZES,
        DeviceType::Optical => ScsiMoDisk::SECTOR_SIZES,
        DeviceType::Cdrom => ScsiCdRom::SECTOR_SIZES,
        _ => &[],
    }
}

/// Default creation parameters per type
pub fn default_params(device_type: DeviceType) -> HashMap<String, String> {
    match device_type {
        DeviceType::Bridge | DeviceType::Daynaport => HashMap::from([
            ("interface".to_string(), network_interface_list()),
            ("inet".to_string(), "10.10.20.1/24".to_string()),
        ]),
        DeviceType::Printer => HashMap::from([
            ("cmd".to_string(), "lp -oraw %f".to_string()),
            ("timeout".to_string(), "30".to_string()),
        ]),
        _ => HashMap::new(),
    }
}

/// Names of the host's network interfaces that are up, excluding loopback
pub fn network_interfaces() -> Vec<String> {
    #[cfg(unix)]
    {
        use nix::net::if_::InterfaceFlags;

        match nix::ifaddrs::getifaddrs() {
            Ok(addrs) => {
                let mut names: Vec<String> = addrs
                    .filter(|ifaddr| {
                        ifaddr.flags.contains(InterfaceFlags::IFF_UP)
                            && !ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK)
                    })
                    .map(|ifaddr| ifaddr.interface_name)
                    .collect();
                names.sort();
                names.dedup();
                names
            }
            Err(_) => Vec::new(),
        }
    }
    #[cfg(not(unix))]
    {
        Vec::new()
    }
}

fn network_interface_list() -> String {
    itertools::Itertools::join(&mut network_interfaces().into_iter(), ",")
}

/// Creates a device with its type-specific capability flags and identity.
/// Returns None for an undefined type.
pub fn create_device(profile: &DeviceProfile) -> Option<Box<dyn ScsiTarget>> {
    let (id, lun) = (profile.id, profile.lun);

    let mut device: Box<dyn ScsiTarget> = match profile.device_type {
        DeviceType::Harddisk => {
            let ext = extension(&profile.filename);
            let level = if ext == "hd1" {
                ScsiLevel::Scsi1Ccs
            } else {
                ScsiLevel::Scsi2
            };
            let mut hd = ScsiHardDisk::new(id, lun, false, level);

            // Some Apple tools require a particular drive identification
            if ext == "hda" {
                hd.state_mut().set_vendor("QUANTUM").unwrap();
                hd.state_mut().set_product("FIREBALL", true).unwrap();
            }

            Box::new(hd)
        }
        DeviceType::RemovableDisk => {
            let mut hd = ScsiHardDisk::new(id, lun, true, ScsiLevel::Scsi2);
            hd.state_mut().set_product("SCSI HD (REM.)", true).unwrap();
            Box::new(hd)
        }
        DeviceType::Optical => {
            let mut mo = ScsiMoDisk::new(id, lun);
            mo.state_mut().set_product("SCSI MO", true).unwrap();
            Box::new(mo)
        }
        DeviceType::Cdrom => {
            let mut cd = ScsiCdRom::new(id, lun);
            cd.state_mut().set_product("SCSI CD-ROM", true).unwrap();
            Box::new(cd)
        }
        DeviceType::Bridge => {
            let mut bridge = ScsiBridge::new(id, lun);
            bridge
                .state_mut()
                .set_product("SCSI HOST BRIDGE", true)
                .unwrap();
            Box::new(bridge)
        }
        DeviceType::Daynaport => {
            // This emulates a specific adapter, so the full INQUIRY
            // identity is fixed
            let mut dp = ScsiDaynaport::new(id, lun);
            dp.state_mut().set_vendor("Dayna").unwrap();
            dp.state_mut().set_product("SCSI/Link", true).unwrap();
            dp.state_mut().set_revision("1.4a").unwrap();
            Box::new(dp)
        }
        DeviceType::HostServices => {
            let mut services = HostServices::new(id, lun);
            services
                .state_mut()
                .set_product("Host Services", true)
                .unwrap();
            Box::new(services)
        }
        DeviceType::Printer => {
            let mut printer = ScsiPrinter::new(id, lun);
            printer
                .state_mut()
                .set_product("SCSI PRINTER", true)
                .unwrap();
            Box::new(printer)
        }
    };

    device
        .state_mut()
        .set_default_params(default_params(profile.device_type));

    Some(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_from_extension() {
        assert_eq!(device_type_for_file("test.hds"), Some(DeviceType::Harddisk));
        assert_eq!(device_type_for_file("test.HDS"), Some(DeviceType::Harddisk));
        assert_eq!(
            device_type_for_file("test.hdr"),
            Some(DeviceType::RemovableDisk)
        );
        assert_eq!(device_type_for_file("test.mos"), Some(DeviceType::Optical));
        assert_eq!(device_type_for_file("test.iso"), Some(DeviceType::Cdrom));
        assert_eq!(device_type_for_file("test.img"), None);
        assert_eq!(device_type_for_file(""), None);
    }

    #[test]
    fn type_from_special_name() {
        assert_eq!(device_type_for_file("bridge"), Some(DeviceType::Bridge));
        assert_eq!(
            device_type_for_file("daynaport"),
            Some(DeviceType::Daynaport)
        );
        assert_eq!(device_type_for_file("printer"), Some(DeviceType::Printer));
        assert_eq!(
            device_type_for_file("services"),
            Some(DeviceType::HostServices)
        );
    }

    #[test]
    fn apple_image_gets_apple_identity() {
        let device = create_device(&DeviceProfile {
            device_type: DeviceType::Harddisk,
            id: 0,
            lun: 0,
            filename: "test.hda".to_string(),
        })
        .unwrap();

        assert_eq!(device.state().vendor(), "QUANTUM");
        assert_eq!(device.state().product(), "FIREBALL");
    }

    #[test]
    fn daynaport_identity_is_fixed() {
        let device = create_device(&DeviceProfile {
            device_type: DeviceType::Daynaport,
            id: 0,
            lun: 0,
            filename: "daynaport".to_string(),
        })
        .unwrap();

        assert_eq!(device.state().vendor(), "Dayna");
        assert_eq!(device.state().product(), "SCSI/Link");
        assert_eq!(device.state().revision(), "1.4a");
        assert!(device.state().supports_params);
    }

    #[test]
    fn sector_size_profiles() {
        assert_eq!(sector_sizes(DeviceType::Harddisk), &[512, 1024, 2048, 4096]);
        assert_eq!(sector_sizes(DeviceType::Cdrom), &[512, 2048]);
        assert!(sector_sizes(DeviceType::Printer).is_empty());
    }
}
