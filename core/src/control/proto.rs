//! Control protocol messages
//!
//! These structs encode to the proto3 wire format via `prost`. Field tags
//! are part of the protocol and must not change.

use std::collections::HashMap;

/// Device types distinguished by the control protocol. The numbering is
/// part of the wire format; value 1 is a historical device class that is
/// no longer supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PbDeviceType {
    Undefined = 0,
    Sahd = 1,
    Schd = 2,
    Scrm = 3,
    Scmo = 4,
    Sccd = 5,
    Scbr = 6,
    Scdp = 7,
    Schs = 8,
    Sclp = 9,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PbOperation {
    NoOperation = 0,
    Attach = 1,
    Detach = 2,
    Insert = 3,
    Eject = 4,
    Protect = 5,
    Unprotect = 6,
    Start = 7,
    Stop = 8,
    ReserveIds = 9,
    CreateImage = 10,
    DeleteImage = 11,
    RenameImage = 12,
    CopyImage = 13,
    ProtectImage = 14,
    UnprotectImage = 15,
    ServerInfo = 16,
    VersionInfo = 17,
    DevicesInfo = 18,
    DeviceTypesInfo = 19,
    DefaultImageFilesInfo = 20,
    ImageFileInfo = 21,
    LogLevelInfo = 22,
    NetworkInterfacesInfo = 23,
    MappingInfo = 24,
    ReservedIdsInfo = 25,
    DefaultFolder = 26,
    LogLevel = 27,
    DetachAll = 28,
    ShutDown = 29,
    CheckAuthentication = 30,
    OperationInfo = 31,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PbErrorCode {
    NoErrorCode = 0,
    Unauthorized = 1,
    UnknownOperation = 2,
}

/// The device part of an ATTACH/DETACH/INSERT/... command
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbDeviceDefinition {
    #[prost(int32, tag = "1")]
    pub id: i32,
    #[prost(int32, tag = "2")]
    pub unit: i32,
    #[prost(enumeration = "PbDeviceType", tag = "3")]
    pub r#type: i32,
    #[prost(map = "string, string", tag = "4")]
    pub params: HashMap<String, String>,
    #[prost(uint32, tag = "5")]
    pub block_size: u32,
    #[prost(string, tag = "6")]
    pub vendor: String,
    #[prost(string, tag = "7")]
    pub product: String,
    #[prost(string, tag = "8")]
    pub revision: String,
    #[prost(bool, tag = "9")]
    pub protected: bool,
}

impl PbDeviceDefinition {
    pub fn device_type(&self) -> PbDeviceType {
        PbDeviceType::try_from(self.r#type).unwrap_or(PbDeviceType::Undefined)
    }

    pub fn param(&self, key: &str) -> String {
        self.params.get(key).cloned().unwrap_or_default()
    }
}

/// A command sent by a client
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbCommand {
    #[prost(enumeration = "PbOperation", tag = "1")]
    pub operation: i32,
    #[prost(message, repeated, tag = "2")]
    pub devices: Vec<PbDeviceDefinition>,
    #[prost(map = "string, string", tag = "3")]
    pub params: HashMap<String, String>,
}

impl PbCommand {
    pub fn new(operation: PbOperation) -> Self {
        Self {
            operation: operation as i32,
            ..Default::default()
        }
    }

    pub fn operation_checked(&self) -> Option<PbOperation> {
        PbOperation::try_from(self.operation).ok()
    }

    pub fn param(&self, key: &str) -> String {
        self.params.get(key).cloned().unwrap_or_default()
    }
}

// --- Info payloads --------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbDeviceProperties {
    /// Maximum number of LUNs
    #[prost(uint32, tag = "1")]
    pub luns: u32,
    #[prost(bool, tag = "2")]
    pub read_only: bool,
    #[prost(bool, tag = "3")]
    pub protectable: bool,
    #[prost(bool, tag = "4")]
    pub stoppable: bool,
    #[prost(bool, tag = "5")]
    pub removable: bool,
    #[prost(bool, tag = "6")]
    pub lockable: bool,
    #[prost(bool, tag = "7")]
    pub supports_file: bool,
    #[prost(bool, tag = "8")]
    pub supports_params: bool,
    #[prost(uint32, repeated, tag = "9")]
    pub block_sizes: Vec<u32>,
    #[prost(map = "string, string", tag = "10")]
    pub default_params: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbDeviceStatus {
    #[prost(bool, tag = "1")]
    pub protected: bool,
    #[prost(bool, tag = "2")]
    pub stopped: bool,
    #[prost(bool, tag = "3")]
    pub removed: bool,
    #[prost(bool, tag = "4")]
    pub locked: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbImageFile {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bool, tag = "2")]
    pub read_only: bool,
    #[prost(enumeration = "PbDeviceType", tag = "3")]
    pub r#type: i32,
    #[prost(uint64, tag = "4")]
    pub size: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbDevice {
    #[prost(int32, tag = "1")]
    pub id: i32,
    #[prost(int32, tag = "2")]
    pub unit: i32,
    #[prost(enumeration = "PbDeviceType", tag = "3")]
    pub r#type: i32,
    #[prost(message, optional, tag = "4")]
    pub properties: Option<PbDeviceProperties>,
    #[prost(message, optional, tag = "5")]
    pub status: Option<PbDeviceStatus>,
    #[prost(message, optional, tag = "6")]
    pub file: Option<PbImageFile>,
    #[prost(map = "string, string", tag = "7")]
    pub params: HashMap<String, String>,
    #[prost(string, tag = "8")]
    pub vendor: String,
    #[prost(string, tag = "9")]
    pub product: String,
    #[prost(string, tag = "10")]
    pub revision: String,
    #[prost(uint32, tag = "11")]
    pub block_size: u32,
    #[prost(uint64, tag = "12")]
    pub block_count: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbDevicesInfo {
    #[prost(message, repeated, tag = "1")]
    pub devices: Vec<PbDevice>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbDeviceTypeProperties {
    #[prost(enumeration = "PbDeviceType", tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub properties: Option<PbDeviceProperties>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbDeviceTypesInfo {
    #[prost(message, repeated, tag = "1")]
    pub properties: Vec<PbDeviceTypeProperties>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbVersionInfo {
    #[prost(int32, tag = "1")]
    pub major_version: i32,
    #[prost(int32, tag = "2")]
    pub minor_version: i32,
    #[prost(int32, tag = "3")]
    pub patch_version: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbLogLevelInfo {
    #[prost(string, repeated, tag = "1")]
    pub log_levels: Vec<String>,
    #[prost(string, tag = "2")]
    pub current_log_level: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbImageFilesInfo {
    #[prost(string, tag = "1")]
    pub default_image_folder: String,
    #[prost(message, repeated, tag = "2")]
    pub image_files: Vec<PbImageFile>,
    #[prost(uint32, tag = "3")]
    pub depth: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbNetworkInterfacesInfo {
    #[prost(string, repeated, tag = "1")]
    pub name: Vec<String>,
}

/// Extension to device type mapping
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbMappingInfo {
    #[prost(map = "string, enumeration(PbDeviceType)", tag = "1")]
    pub mapping: HashMap<String, i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbReservedIdsInfo {
    #[prost(uint32, repeated, tag = "1")]
    pub ids: Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbOperationMetaData {
    #[prost(enumeration = "PbOperation", tag = "1")]
    pub operation: i32,
    #[prost(string, tag = "2")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbOperationInfo {
    #[prost(message, repeated, tag = "1")]
    pub operations: Vec<PbOperationMetaData>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbServerInfo {
    #[prost(message, optional, tag = "1")]
    pub version_info: Option<PbVersionInfo>,
    #[prost(message, optional, tag = "2")]
    pub log_level_info: Option<PbLogLevelInfo>,
    #[prost(message, optional, tag = "3")]
    pub device_types_info: Option<PbDeviceTypesInfo>,
    #[prost(message, optional, tag = "4")]
    pub image_files_info: Option<PbImageFilesInfo>,
    #[prost(message, optional, tag = "5")]
    pub network_interfaces_info: Option<PbNetworkInterfacesInfo>,
    #[prost(message, optional, tag = "6")]
    pub mapping_info: Option<PbMappingInfo>,
    #[prost(message, optional, tag = "7")]
    pub devices_info: Option<PbDevicesInfo>,
    #[prost(message, optional, tag = "8")]
    pub reserved_ids_info: Option<PbReservedIdsInfo>,
    #[prost(message, optional, tag = "9")]
    pub operation_info: Option<PbOperationInfo>,
}

/// The reply to every command
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbResult {
    #[prost(bool, tag = "1")]
    pub status: bool,
    #[prost(string, tag = "2")]
    pub msg: String,
    #[prost(enumeration = "PbErrorCode", tag = "3")]
    pub error_code: i32,
    #[prost(
        oneof = "PbResultPayload",
        tags = "4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14"
    )]
    pub payload: Option<PbResultPayload>,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum PbResultPayload {
    #[prost(message, tag = "4")]
    DevicesInfo(PbDevicesInfo),
    #[prost(message, tag = "5")]
    DeviceTypesInfo(PbDeviceTypesInfo),
    #[prost(message, tag = "6")]
    ServerInfo(PbServerInfo),
    #[prost(message, tag = "7")]
    VersionInfo(PbVersionInfo),
    #[prost(message, tag = "8")]
    LogLevelInfo(PbLogLevelInfo),
    #[prost(message, tag = "9")]
    ImageFilesInfo(PbImageFilesInfo),
    #[prost(message, tag = "10")]
    ImageFileInfo(PbImageFile),
    #[prost(message, tag = "11")]
    NetworkInterfacesInfo(PbNetworkInterfacesInfo),
    #[prost(message, tag = "12")]
    MappingInfo(PbMappingInfo),
    #[prost(message, tag = "13")]
    ReservedIdsInfo(PbReservedIdsInfo),
    #[prost(message, tag = "14")]
    OperationInfo(PbOperationInfo),
}

impl PbResult {
    pub fn ok() -> Self {
        Self {
            status: true,
            ..Default::default()
        }
    }

    pub fn ok_with(payload: PbResultPayload) -> Self {
        Self {
            status: true,
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self {
            status: false,
            msg: msg.into(),
            ..Default::default()
        }
    }

    pub fn failed_with_code(msg: impl Into<String>, code: PbErrorCode) -> Self {
        Self {
            status: false,
            msg: msg.into(),
            error_code: code as i32,
            ..Default::default()
        }
    }
}

/// Mapping between the wire device type and the core device type
pub mod types {
    use super::PbDeviceType;
    use crate::scsi::target::DeviceType;

    pub fn to_core(pb: PbDeviceType) -> Option<DeviceType> {
        match pb {
            PbDeviceType::Schd => Some(DeviceType::Harddisk),
            PbDeviceType::Scrm => Some(DeviceType::RemovableDisk),
            PbDeviceType::Scmo => Some(DeviceType::Optical),
            PbDeviceType::Sccd => Some(DeviceType::Cdrom),
            PbDeviceType::Scbr => Some(DeviceType::Bridge),
            PbDeviceType::Scdp => Some(DeviceType::Daynaport),
            PbDeviceType::Schs => Some(DeviceType::HostServices),
            PbDeviceType::Sclp => Some(DeviceType::Printer),
            PbDeviceType::Undefined | PbDeviceType::Sahd => None,
        }
    }

    pub fn from_core(device_type: DeviceType) -> PbDeviceType {
        match device_type {
            DeviceType::Harddisk => PbDeviceType::Schd,
            DeviceType::RemovableDisk => PbDeviceType::Scrm,
            DeviceType::Optical => PbDeviceType::Scmo,
            DeviceType::Cdrom => PbDeviceType::Sccd,
            DeviceType::Bridge => PbDeviceType::Scbr,
            DeviceType::Daynaport => PbDeviceType::Scdp,
            DeviceType::HostServices => PbDeviceType::Schs,
            DeviceType::Printer => PbDeviceType::Sclp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn command_roundtrip() {
        let mut command = PbCommand::new(PbOperation::Attach);
        command.devices.push(PbDeviceDefinition {
            id: 3,
            unit: 1,
            r#type: PbDeviceType::Schd as i32,
            block_size: 1024,
            vendor: "ACME".to_string(),
            params: HashMap::from([("file".to_string(), "test.hds".to_string())]),
            ..Default::default()
        });
        command
            .params
            .insert("token".to_string(), "secret".to_string());

        let encoded = command.encode_to_vec();
        let decoded = PbCommand::decode(encoded.as_slice()).unwrap();
        assert_eq!(command, decoded);
        assert_eq!(decoded.operation_checked(), Some(PbOperation::Attach));
        assert_eq!(decoded.devices[0].param("file"), "test.hds");
    }

    #[test]
    fn result_payload_roundtrip() {
        let result = PbResult::ok_with(PbResultPayload::VersionInfo(PbVersionInfo {
            major_version: 1,
            minor_version: 2,
            patch_version: 3,
        }));

        let decoded = PbResult::decode(result.encode_to_vec().as_slice()).unwrap();
        assert!(decoded.status);
        match decoded.payload {
            Some(PbResultPayload::VersionInfo(v)) => assert_eq!(v.minor_version, 2),
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn unknown_operation_decodes_to_none() {
        let command = PbCommand {
            operation: 9999,
            ..Default::default()
        };
        assert_eq!(command.operation_checked(), None);
    }
}
