//! remora-ctl: command-line client for the control protocol
//!
//! Sends one framed protobuf command per invocation and renders the reply.

use std::collections::HashMap;
use std::io::BufReader;
use std::net::TcpStream;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use remora_core::control::framing::{self, DEFAULT_PORT};
use remora_core::control::proto::{
    PbCommand, PbDeviceDefinition, PbDeviceType, PbOperation, PbResult, PbResultPayload,
};

#[derive(Parser)]
#[command(name = "remora-ctl", version, about = "Control client for remorad")]
struct Args {
    /// Daemon host
    #[arg(long, default_value = "localhost", global = true)]
    host: String,

    /// Daemon port
    #[arg(short, long, default_value_t = DEFAULT_PORT, global = true)]
    port: u16,

    /// Access token, if the daemon requires one
    #[arg(long, global = true)]
    token: Option<String>,

    /// Locale for error messages
    #[arg(short = 'z', long, global = true)]
    locale: Option<String>,

    /// Print replies as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum DeviceTypeArg {
    Schd,
    Scrm,
    Scmo,
    Sccd,
    Scbr,
    Scdp,
    Schs,
    Sclp,
}

impl From<DeviceTypeArg> for PbDeviceType {
    fn from(arg: DeviceTypeArg) -> Self {
        match arg {
            DeviceTypeArg::Schd => Self::Schd,
            DeviceTypeArg::Scrm => Self::Scrm,
            DeviceTypeArg::Scmo => Self::Scmo,
            DeviceTypeArg::Sccd => Self::Sccd,
            DeviceTypeArg::Scbr => Self::Scbr,
            DeviceTypeArg::Scdp => Self::Scdp,
            DeviceTypeArg::Schs => Self::Schs,
            DeviceTypeArg::Sclp => Self::Sclp,
        }
    }
}

#[derive(clap::Args)]
struct DeviceAddress {
    /// Device ID (0-7)
    #[arg(short, long)]
    id: i32,

    /// Logical unit (0-31)
    #[arg(short, long, default_value_t = 0)]
    unit: i32,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach a device
    Attach {
        #[command(flatten)]
        address: DeviceAddress,

        /// Image file or special device name
        #[arg(short, long)]
        file: Option<String>,

        /// Device type (derived from the file extension if omitted)
        #[arg(short = 't', long = "type")]
        device_type: Option<DeviceTypeArg>,

        /// Sector size in bytes
        #[arg(short, long)]
        block_size: Option<u32>,

        /// INQUIRY vendor (up to 8 characters)
        #[arg(long)]
        vendor: Option<String>,

        /// INQUIRY product (up to 16 characters)
        #[arg(long)]
        product: Option<String>,

        /// INQUIRY revision (up to 4 characters)
        #[arg(long)]
        revision: Option<String>,

        /// Attach write-protected
        #[arg(long)]
        protected: bool,

        /// Additional device parameters as key=value
        #[arg(long = "param")]
        params: Vec<String>,
    },

    /// Detach a device
    Detach {
        #[command(flatten)]
        address: DeviceAddress,
    },

    /// Detach all devices
    DetachAll,

    /// Insert a medium into a removable device
    Insert {
        #[command(flatten)]
        address: DeviceAddress,

        /// Image file
        #[arg(short, long)]
        file: String,

        /// Insert write-protected
        #[arg(long)]
        protected: bool,
    },

    /// Eject the medium of a removable device
    Eject {
        #[command(flatten)]
        address: DeviceAddress,
    },

    /// Start a device
    Start {
        #[command(flatten)]
        address: DeviceAddress,
    },

    /// Stop (park) a device
    Stop {
        #[command(flatten)]
        address: DeviceAddress,
    },

    /// Write-protect a device
    Protect {
        #[command(flatten)]
        address: DeviceAddress,
    },

    /// Remove the write protection of a device
    Unprotect {
        #[command(flatten)]
        address: DeviceAddress,
    },

    /// List the attached devices
    List,

    /// Query the full server state
    ServerInfo,

    /// Query the server version
    Version,

    /// Query or change the log level
    LogLevel {
        /// New log level; prints the current level when omitted
        level: Option<String>,
    },

    /// Set the default image folder
    DefaultFolder { folder: String },

    /// Reserve device IDs (empty list clears the reservations)
    ReserveIds {
        /// Comma-separated IDs, e.g. "2,5"
        #[arg(default_value = "")]
        ids: String,
    },

    /// List the reserved device IDs
    ReservedIds,

    /// Create an image file
    CreateImage {
        file: String,

        /// Size in bytes, a multiple of 512
        size: u64,

        #[arg(long)]
        read_only: bool,
    },

    /// Delete an image file
    DeleteImage { file: String },

    /// Rename or move an image file
    RenameImage { from: String, to: String },

    /// Copy an image file
    CopyImage {
        from: String,
        to: String,

        #[arg(long)]
        read_only: bool,
    },

    /// Write-protect an image file
    ProtectImage { file: String },

    /// Remove the write protection of an image file
    UnprotectImage { file: String },

    /// Show information about one image file
    ImageInfo { file: String },

    /// List the image files in the default folder
    Images,

    /// List the host's network interfaces
    NetworkInterfaces,

    /// Show the extension to device type mapping
    Mapping,

    /// List the operations the server supports
    Operations,

    /// Shut down the daemon or the host
    Shutdown {
        /// process, host_shutdown or host_reboot
        #[arg(default_value = "process")]
        mode: String,
    },
}

fn parse_params(params: &[String]) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for param in params {
        let Some((key, value)) = param.split_once('=') else {
            bail!("Invalid parameter '{}', expected key=value", param);
        };
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

fn build_command(args: &Args) -> Result<PbCommand> {
    let mut command = match &args.command {
        Commands::Attach {
            address,
            file,
            device_type,
            block_size,
            vendor,
            product,
            revision,
            protected,
            params,
        } => {
            let mut device_params = parse_params(params)?;
            if let Some(file) = file {
                device_params.insert("file".to_string(), file.clone());
            }

            let mut command = PbCommand::new(PbOperation::Attach);
            command.devices.push(PbDeviceDefinition {
                id: address.id,
                unit: address.unit,
                r#type: device_type.map_or(0, |t| PbDeviceType::from(t) as i32),
                params: device_params,
                block_size: block_size.unwrap_or(0),
                vendor: vendor.clone().unwrap_or_default(),
                product: product.clone().unwrap_or_default(),
                revision: revision.clone().unwrap_or_default(),
                protected: *protected,
            });
            command
        }

        Commands::Detach { address } => device_command(PbOperation::Detach, address),
        Commands::DetachAll => PbCommand::new(PbOperation::DetachAll),

        Commands::Insert {
            address,
            file,
            protected,
        } => {
            let mut command = device_command(PbOperation::Insert, address);
            let device = &mut command.devices[0];
            device
                .params
                .insert("file".to_string(), file.clone());
            device.protected = *protected;
            command
        }

        Commands::Eject { address } => device_command(PbOperation::Eject, address),
        Commands::Start { address } => device_command(PbOperation::Start, address),
        Commands::Stop { address } => device_command(PbOperation::Stop, address),
        Commands::Protect { address } => device_command(PbOperation::Protect, address),
        Commands::Unprotect { address } => device_command(PbOperation::Unprotect, address),

        Commands::List => PbCommand::new(PbOperation::DevicesInfo),
        Commands::ServerInfo => PbCommand::new(PbOperation::ServerInfo),
        Commands::Version => PbCommand::new(PbOperation::VersionInfo),

        Commands::LogLevel { level } => match level {
            Some(level) => {
                let mut command = PbCommand::new(PbOperation::LogLevel);
                command.params.insert("level".to_string(), level.clone());
                command
            }
            None => PbCommand::new(PbOperation::LogLevelInfo),
        },

        Commands::DefaultFolder { folder } => {
            let mut command = PbCommand::new(PbOperation::DefaultFolder);
            command.params.insert("folder".to_string(), folder.clone());
            command
        }

        Commands::ReserveIds { ids } => {
            let mut command = PbCommand::new(PbOperation::ReserveIds);
            command.params.insert("ids".to_string(), ids.clone());
            command
        }
        Commands::ReservedIds => PbCommand::new(PbOperation::ReservedIdsInfo),

        Commands::CreateImage {
            file,
            size,
            read_only,
        } => {
            let mut command = PbCommand::new(PbOperation::CreateImage);
            command.params.insert("file".to_string(), file.clone());
            command.params.insert("size".to_string(), size.to_string());
            command
                .params
                .insert("read_only".to_string(), read_only.to_string());
            command
        }

        Commands::DeleteImage { file } => {
            let mut command = PbCommand::new(PbOperation::DeleteImage);
            command.params.insert("file".to_string(), file.clone());
            command
        }

        Commands::RenameImage { from, to } => {
            let mut command = PbCommand::new(PbOperation::RenameImage);
            command.params.insert("from".to_string(), from.clone());
            command.params.insert("to".to_string(), to.clone());
            command
        }

        Commands::CopyImage {
            from,
            to,
            read_only,
        } => {
            let mut command = PbCommand::new(PbOperation::CopyImage);
            command.params.insert("from".to_string(), from.clone());
            command.params.insert("to".to_string(), to.clone());
            command
                .params
                .insert("read_only".to_string(), read_only.to_string());
            command
        }

        Commands::ProtectImage { file } => {
            let mut command = PbCommand::new(PbOperation::ProtectImage);
            command.params.insert("file".to_string(), file.clone());
            command
        }

        Commands::UnprotectImage { file } => {
            let mut command = PbCommand::new(PbOperation::UnprotectImage);
            command.params.insert("file".to_string(), file.clone());
            command
        }

        Commands::ImageInfo { file } => {
            let mut command = PbCommand::new(PbOperation::ImageFileInfo);
            command.params.insert("file".to_string(), file.clone());
            command
        }

        Commands::Images => PbCommand::new(PbOperation::DefaultImageFilesInfo),
        Commands::NetworkInterfaces => PbCommand::new(PbOperation::NetworkInterfacesInfo),
        Commands::Mapping => PbCommand::new(PbOperation::MappingInfo),
        Commands::Operations => PbCommand::new(PbOperation::OperationInfo),

        Commands::Shutdown { mode } => {
            let mut command = PbCommand::new(PbOperation::ShutDown);
            command.params.insert("mode".to_string(), mode.clone());
            command
        }
    };

    if let Some(token) = &args.token {
        command.params.insert("token".to_string(), token.clone());
    }
    if let Some(locale) = &args.locale {
        command.params.insert("locale".to_string(), locale.clone());
    }

    Ok(command)
}

fn device_command(operation: PbOperation, address: &DeviceAddress) -> PbCommand {
    let mut command = PbCommand::new(operation);
    command.devices.push(PbDeviceDefinition {
        id: address.id,
        unit: address.unit,
        ..Default::default()
    });
    command
}

fn send_command(host: &str, port: u16, command: &PbCommand) -> Result<PbResult> {
    let stream = TcpStream::connect((host, port))
        .with_context(|| format!("Can't connect to {}:{}", host, port))?;

    let mut writer = stream.try_clone()?;
    framing::write_magic(&mut writer)?;
    framing::write_message(&mut writer, command)?;

    let mut reader = BufReader::new(stream);
    Ok(framing::read_message(&mut reader)?)
}

fn device_type_name(value: i32) -> String {
    PbDeviceType::try_from(value)
        .map(|t| format!("{:?}", t).to_uppercase())
        .unwrap_or_else(|_| "UNDEFINED".to_string())
}

fn print_result(result: &PbResult, json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(&result_to_json(result)).unwrap());
        return;
    }

    if !result.msg.is_empty() {
        println!("{}", result.msg);
    }

    match &result.payload {
        Some(PbResultPayload::DevicesInfo(info)) => {
            if info.devices.is_empty() {
                println!("No devices attached");
            }
            for device in &info.devices {
                let file = device
                    .file
                    .as_ref()
                    .map(|f| f.name.as_str())
                    .filter(|name| !name.is_empty())
                    .unwrap_or("NO MEDIUM");
                let status = device.status.clone().unwrap_or_default();
                let mut flags = Vec::new();
                if status.protected {
                    flags.push("protected");
                }
                if status.stopped {
                    flags.push("stopped");
                }
                if status.removed {
                    flags.push("no medium");
                }
                if status.locked {
                    flags.push("locked");
                }

                println!(
                    "ID {}, unit {}: {} {} {} {} {}{}",
                    device.id,
                    device.unit,
                    device_type_name(device.r#type),
                    device.vendor,
                    device.product,
                    device.revision,
                    file,
                    if flags.is_empty() {
                        String::new()
                    } else {
                        format!(" ({})", flags.join(", "))
                    }
                );
            }
        }
        Some(PbResultPayload::VersionInfo(info)) => {
            println!(
                "Server version {}.{}.{}",
                info.major_version, info.minor_version, info.patch_version
            );
        }
        Some(PbResultPayload::LogLevelInfo(info)) => {
            println!("Current log level: {}", info.current_log_level);
            println!("Available log levels: {}", info.log_levels.join(", "));
        }
        Some(PbResultPayload::ImageFilesInfo(info)) => {
            println!("Default image folder: {}", info.default_image_folder);
            for file in &info.image_files {
                println!(
                    "{} ({} bytes{})",
                    file.name,
                    file.size,
                    if file.read_only { ", read-only" } else { "" }
                );
            }
        }
        Some(PbResultPayload::ImageFileInfo(file)) => {
            println!(
                "{}: {} bytes, type {}{}",
                file.name,
                file.size,
                device_type_name(file.r#type),
                if file.read_only { ", read-only" } else { "" }
            );
        }
        Some(PbResultPayload::NetworkInterfacesInfo(info)) => {
            println!("{}", info.name.join(", "));
        }
        Some(PbResultPayload::MappingInfo(info)) => {
            let mut mapping: Vec<_> = info.mapping.iter().collect();
            mapping.sort();
            for (extension, device_type) in mapping {
                println!("{} -> {}", extension, device_type_name(*device_type));
            }
        }
        Some(PbResultPayload::ReservedIdsInfo(info)) => {
            if info.ids.is_empty() {
                println!("No reserved IDs");
            } else {
                println!(
                    "Reserved IDs: {}",
                    info.ids
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
        }
        Some(PbResultPayload::OperationInfo(info)) => {
            for operation in &info.operations {
                println!("{}", operation.name);
            }
        }
        Some(PbResultPayload::ServerInfo(info)) => {
            if let Some(version) = &info.version_info {
                println!(
                    "Server version {}.{}.{}",
                    version.major_version, version.minor_version, version.patch_version
                );
            }
            if let Some(log) = &info.log_level_info {
                println!("Log level: {}", log.current_log_level);
            }
            if let Some(images) = &info.image_files_info {
                println!("Default image folder: {}", images.default_image_folder);
            }
            if let Some(reserved) = &info.reserved_ids_info {
                if !reserved.ids.is_empty() {
                    println!(
                        "Reserved IDs: {}",
                        reserved
                            .ids
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                }
            }
            if let Some(devices) = &info.devices_info {
                for device in &devices.devices {
                    println!(
                        "ID {}, unit {}: {} {} {}",
                        device.id,
                        device.unit,
                        device_type_name(device.r#type),
                        device.vendor,
                        device.product
                    );
                }
            }
        }
        Some(PbResultPayload::DeviceTypesInfo(info)) => {
            for properties in &info.properties {
                println!("{}", device_type_name(properties.r#type));
            }
        }
        None => {
            if result.msg.is_empty() {
                println!("{}", if result.status { "OK" } else { "FAILED" });
            }
        }
    }
}

/// Hand-built JSON rendering of the reply, for scripting
fn result_to_json(result: &PbResult) -> serde_json::Value {
    use serde_json::json;

    let payload = match &result.payload {
        Some(PbResultPayload::DevicesInfo(info)) => json!({
            "devices": info.devices.iter().map(|device| {
                let status = device.status.clone().unwrap_or_default();
                json!({
                    "id": device.id,
                    "unit": device.unit,
                    "type": device_type_name(device.r#type),
                    "vendor": device.vendor,
                    "product": device.product,
                    "revision": device.revision,
                    "file": device.file.as_ref().map(|f| f.name.clone()),
                    "protected": status.protected,
                    "stopped": status.stopped,
                    "removed": status.removed,
                    "locked": status.locked,
                })
            }).collect::<Vec<_>>()
        }),
        Some(PbResultPayload::VersionInfo(info)) => json!({
            "version": format!(
                "{}.{}.{}",
                info.major_version, info.minor_version, info.patch_version
            )
        }),
        Some(PbResultPayload::LogLevelInfo(info)) => json!({
            "current": info.current_log_level,
            "available": info.log_levels,
        }),
        Some(PbResultPayload::ImageFilesInfo(info)) => json!({
            "default_image_folder": info.default_image_folder,
            "images": info.image_files.iter().map(|file| json!({
                "name": file.name,
                "size": file.size,
                "read_only": file.read_only,
            })).collect::<Vec<_>>(),
        }),
        Some(PbResultPayload::ImageFileInfo(file)) => json!({
            "name": file.name,
            "size": file.size,
            "read_only": file.read_only,
            "type": device_type_name(file.r#type),
        }),
        Some(PbResultPayload::NetworkInterfacesInfo(info)) => json!(info.name),
        Some(PbResultPayload::MappingInfo(info)) => json!(
            info.mapping
                .iter()
                .map(|(ext, device_type)| (ext.clone(), device_type_name(*device_type)))
                .collect::<std::collections::BTreeMap<_, _>>()
        ),
        Some(PbResultPayload::ReservedIdsInfo(info)) => json!(info.ids),
        Some(PbResultPayload::OperationInfo(info)) => {
            json!(info.operations.iter().map(|op| op.name.clone()).collect::<Vec<_>>())
        }
        Some(PbResultPayload::ServerInfo(_)) => json!("server info"),
        Some(PbResultPayload::DeviceTypesInfo(info)) => json!(
            info.properties
                .iter()
                .map(|p| device_type_name(p.r#type))
                .collect::<Vec<_>>()
        ),
        None => serde_json::Value::Null,
    };

    json!({
        "status": result.status,
        "msg": result.msg,
        "payload": payload,
    })
}

fn main() -> Result<std::process::ExitCode> {
    let args = Args::parse();

    let command = build_command(&args)?;
    let result = send_command(&args.host, args.port, &command)?;

    print_result(&result, args.json);

    Ok(if result.status {
        std::process::ExitCode::SUCCESS
    } else {
        std::process::ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_command_carries_file_param() {
        let args = Args::parse_from([
            "remora-ctl", "attach", "-i", "0", "-f", "disk.hds", "--vendor", "ACME",
        ]);
        let command = build_command(&args).unwrap();

        assert_eq!(command.operation_checked(), Some(PbOperation::Attach));
        assert_eq!(command.devices[0].param("file"), "disk.hds");
        assert_eq!(command.devices[0].vendor, "ACME");
    }

    #[test]
    fn token_and_locale_are_attached() {
        let args = Args::parse_from([
            "remora-ctl", "--token", "secret", "-z", "de", "list",
        ]);
        let command = build_command(&args).unwrap();

        assert_eq!(command.param("token"), "secret");
        assert_eq!(command.param("locale"), "de");
        assert_eq!(command.operation_checked(), Some(PbOperation::DevicesInfo));
    }

    #[test]
    fn invalid_param_is_rejected() {
        let args = Args::parse_from([
            "remora-ctl", "attach", "-i", "0", "-f", "daynaport", "--param", "nokeyvalue",
        ]);
        assert!(build_command(&args).is_err());
    }
}
