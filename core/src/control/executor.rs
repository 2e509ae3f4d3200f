//! Control command executor
//!
//! `process_command` validates and applies one client command against the
//! daemon state. Device-targeted operations run in two passes: a dry run
//! with side effects inhibited over every per-device sub-command, then the
//! actual commit. A failing dry run restores the image-reservation snapshot
//! and leaves the registry untouched.

use std::collections::HashMap;
use std::path::PathBuf;

use itertools::Itertools;
use log::*;

use super::context::CommandContext;
use super::locale::LocalizationKey::*;
use super::proto::{
    self, PbCommand, PbDeviceDefinition, PbErrorCode, PbOperation, PbResult, PbResultPayload,
};
use super::response;
use crate::daemon::Daemon;
use crate::scsi::ShutdownMode;
use crate::scsi::registry::ID_MAX;
use crate::scsi::target::factory::{self, DeviceProfile};
use crate::scsi::target::{LUN_MAX, ScsiTarget};

/// What the service loop must do after a command has been processed
#[derive(Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    Completed(bool),
    /// The reply has been sent; the caller performs the shutdown
    Shutdown(ShutdownMode),
}

pub fn process_command(
    daemon: &mut Daemon,
    context: &mut CommandContext,
    command: &PbCommand,
) -> CommandOutcome {
    use CommandOutcome::Completed;

    let Some(operation) = command.operation_checked() else {
        error!(
            "Received unknown command with operation opcode {}",
            command.operation
        );
        return Completed(context.return_localized_error_with_code(
            ErrorOperation,
            PbErrorCode::UnknownOperation,
            &[],
        ));
    };

    trace!("Received {:?} command", operation);

    match operation {
        PbOperation::LogLevel => {
            let level = command.param("level");
            if set_log_level(&level) {
                daemon.log_level = level;
                Completed(context.return_ok())
            } else {
                Completed(context.return_localized_error(ErrorLogLevel, &[level.as_str()]))
            }
        }

        PbOperation::DefaultFolder => {
            match daemon.images.set_default_folder(&command.param("folder")) {
                Ok(()) => Completed(context.return_ok()),
                Err(msg) => Completed(context.return_status(false, &msg)),
            }
        }

        PbOperation::DetachAll => {
            daemon.detach_all();
            Completed(context.return_ok())
        }

        PbOperation::ReserveIds => match parse_reserved_ids(daemon, &command.param("ids")) {
            Ok(ids) => {
                if ids.is_empty() {
                    info!("Cleared reserved ID(s)");
                } else {
                    info!("Reserved ID(s) set to {}", ids.iter().join(", "));
                }
                daemon.reserved_ids = ids;
                Completed(context.return_ok())
            }
            Err(msg) => Completed(context.return_status(false, &msg)),
        },

        PbOperation::CreateImage => {
            Completed(daemon.images.create_image(context, command))
        }
        PbOperation::DeleteImage => {
            let Daemon {
                images,
                reservations,
                ..
            } = daemon;
            Completed(images.delete_image(context, command, reservations))
        }
        PbOperation::RenameImage => {
            let Daemon {
                images,
                reservations,
                ..
            } = daemon;
            Completed(images.rename_image(context, command, reservations))
        }
        PbOperation::CopyImage => Completed(daemon.images.copy_image(context, command)),
        PbOperation::ProtectImage | PbOperation::UnprotectImage => {
            Completed(daemon.images.set_image_permissions(context, command))
        }

        PbOperation::ServerInfo => Completed(context.send_result(&PbResult::ok_with(
            PbResultPayload::ServerInfo(response::server_info(daemon)),
        ))),
        PbOperation::DevicesInfo => {
            let requested: Vec<(u8, u8)> = command
                .devices
                .iter()
                .map(|d| (d.id as u8, d.unit as u8))
                .collect();
            Completed(context.send_result(&PbResult::ok_with(PbResultPayload::DevicesInfo(
                response::devices_info(daemon, &requested),
            ))))
        }
        PbOperation::DeviceTypesInfo => Completed(context.send_result(&PbResult::ok_with(
            PbResultPayload::DeviceTypesInfo(response::device_types_info()),
        ))),
        PbOperation::VersionInfo => Completed(context.send_result(&PbResult::ok_with(
            PbResultPayload::VersionInfo(response::version_info()),
        ))),
        PbOperation::LogLevelInfo => Completed(context.send_result(&PbResult::ok_with(
            PbResultPayload::LogLevelInfo(response::log_level_info(&daemon.log_level)),
        ))),
        PbOperation::DefaultImageFilesInfo => Completed(context.send_result(&PbResult::ok_with(
            PbResultPayload::ImageFilesInfo(response::image_files_info(daemon)),
        ))),
        PbOperation::ImageFileInfo => {
            let filename = command.param("file");
            if filename.is_empty() {
                return Completed(context.return_localized_error(ErrorMissingFilename, &[]));
            }
            match daemon.images.image_file_info(&filename) {
                Some(info) => Completed(context.send_result(&PbResult::ok_with(
                    PbResultPayload::ImageFileInfo(info),
                ))),
                None => Completed(
                    context.return_localized_error(ErrorImageFileInfo, &[filename.as_str()]),
                ),
            }
        }
        PbOperation::NetworkInterfacesInfo => Completed(context.send_result(&PbResult::ok_with(
            PbResultPayload::NetworkInterfacesInfo(response::network_interfaces_info()),
        ))),
        PbOperation::MappingInfo => Completed(context.send_result(&PbResult::ok_with(
            PbResultPayload::MappingInfo(response::mapping_info()),
        ))),
        PbOperation::OperationInfo => Completed(context.send_result(&PbResult::ok_with(
            PbResultPayload::OperationInfo(response::operation_info()),
        ))),
        PbOperation::ReservedIdsInfo => Completed(context.send_result(&PbResult::ok_with(
            PbResultPayload::ReservedIdsInfo(response::reserved_ids_info(daemon)),
        ))),

        PbOperation::ShutDown => shut_down(context, &command.param("mode")),

        _ => Completed(process_device_list(daemon, context, command, operation)),
    }
}

/// Two-pass processing of a command with a device list: dry-run every
/// sub-command, validate the resulting LUN setup, then commit
fn process_device_list(
    daemon: &mut Daemon,
    context: &mut CommandContext,
    command: &PbCommand,
    operation: PbOperation,
) -> bool {
    let snapshot = daemon.reservations.snapshot();

    for device in &command.devices {
        if !process_device_cmd(daemon, context, device, command, true) {
            // Dry run failed, restore the reservation list
            daemon.reservations.restore(snapshot.clone());
            return false;
        }
    }

    // Restore the reservations claimed by the dry run before committing
    daemon.reservations.restore(snapshot);

    if let Err(msg) = validate_lun_setup(daemon, command) {
        return context.return_status(false, &msg);
    }

    for device in &command.devices {
        if !process_device_cmd(daemon, context, device, command, false) {
            return false;
        }
    }

    // ATTACH and DETACH return the resulting device list
    if matches!(operation, PbOperation::Attach | PbOperation::Detach) {
        return context.send_result(&PbResult::ok_with(PbResultPayload::DevicesInfo(
            response::devices_info(daemon, &[]),
        )));
    }

    context.return_ok()
}

fn process_device_cmd(
    daemon: &mut Daemon,
    context: &mut CommandContext,
    pb_device: &PbDeviceDefinition,
    command: &PbCommand,
    dry_run: bool,
) -> bool {
    print_command(command, pb_device, dry_run);

    // Validate the device ID and LUN
    if pb_device.id < 0 {
        return context.return_localized_error(ErrorMissingDeviceId, &[]);
    }
    if pb_device.id >= i32::from(ID_MAX) {
        return context.return_localized_error(
            ErrorInvalidId,
            &[
                pb_device.id.to_string().as_str(),
                (ID_MAX - 1).to_string().as_str(),
            ],
        );
    }
    if pb_device.unit < 0 || pb_device.unit >= i32::from(LUN_MAX) {
        return context.return_localized_error(
            ErrorInvalidLun,
            &[
                pb_device.unit.to_string().as_str(),
                (LUN_MAX - 1).to_string().as_str(),
            ],
        );
    }

    let id = pb_device.id as u8;
    let lun = pb_device.unit as u8;
    let operation = command.operation_checked().unwrap_or(PbOperation::NoOperation);

    // For all commands except ATTACH the device and LUN must exist
    if operation != PbOperation::Attach {
        if !daemon.registry.has_controller(id) {
            return context
                .return_localized_error(ErrorNonExistingDevice, &[id.to_string().as_str()]);
        }
        if daemon.registry.device_by(id, lun).is_none() {
            return context.return_localized_error(
                ErrorNonExistingUnit,
                &[id.to_string().as_str(), lun.to_string().as_str()],
            );
        }
    }

    if operation != PbOperation::Attach
        && !validate_operation_against_device(daemon, context, id, lun, operation)
    {
        return false;
    }

    match operation {
        PbOperation::Start => start(daemon, id, lun, dry_run),
        PbOperation::Stop => stop(daemon, id, lun, dry_run),
        PbOperation::Attach => attach(daemon, context, pb_device, dry_run),
        PbOperation::Detach => detach(daemon, context, id, lun, dry_run),
        PbOperation::Insert => insert(daemon, context, pb_device, dry_run),
        PbOperation::Eject => eject(daemon, id, lun, dry_run),
        PbOperation::Protect => protect(daemon, id, lun, true, dry_run),
        PbOperation::Unprotect => protect(daemon, id, lun, false, dry_run),
        PbOperation::CheckAuthentication | PbOperation::NoOperation => {
            // Do nothing, just log
            trace!("Received {:?} command", operation);
            true
        }
        _ => context.return_localized_error(ErrorOperation, &[]),
    }
}

fn validate_operation_against_device(
    daemon: &Daemon,
    context: &mut CommandContext,
    id: u8,
    lun: u8,
    operation: PbOperation,
) -> bool {
    let device = daemon.registry.device_by(id, lun).unwrap();
    let type_name = device.target_type().as_str();
    let state = device.state();

    let op_name = format!("{:?}", operation);

    if matches!(operation, PbOperation::Start | PbOperation::Stop) && !state.stoppable {
        return context
            .return_localized_error(ErrorOperationDeniedStoppable, &[op_name.as_str(), type_name]);
    }

    if matches!(operation, PbOperation::Insert | PbOperation::Eject) && !state.removable {
        return context
            .return_localized_error(ErrorOperationDeniedRemovable, &[op_name.as_str(), type_name]);
    }

    if matches!(operation, PbOperation::Protect | PbOperation::Unprotect) {
        if !state.protectable {
            return context.return_localized_error(ErrorOperationDeniedProtectable, &[
                op_name.as_str(),
                type_name,
            ]);
        }
        if !state.ready {
            return context
                .return_localized_error(ErrorOperationDeniedReady, &[op_name.as_str(), type_name]);
        }
    }

    true
}

fn attach(
    daemon: &mut Daemon,
    context: &mut CommandContext,
    pb_device: &PbDeviceDefinition,
    dry_run: bool,
) -> bool {
    let id = pb_device.id as u8;
    let lun = pb_device.unit as u8;

    if daemon.registry.device_by(id, lun).is_some() {
        return context.return_localized_error(ErrorDuplicateId, &[
            id.to_string().as_str(),
            lun.to_string().as_str(),
        ]);
    }

    if daemon.reserved_ids.contains(&id) {
        return context.return_localized_error(ErrorReservedId, &[id.to_string().as_str()]);
    }

    let filename = pb_device.param("file");

    // Derive the device type from the file name when none was given
    let device_type = match proto::types::to_core(pb_device.device_type()) {
        Some(device_type) => device_type,
        None => {
            if pb_device.device_type() != proto::PbDeviceType::Undefined {
                return context.return_localized_error(
                    ErrorUnknownDeviceType,
                    &[format!("{:?}", pb_device.device_type()).as_str()],
                );
            }
            match factory::device_type_for_file(&filename) {
                Some(device_type) => device_type,
                None => {
                    return context
                        .return_localized_error(ErrorMissingDeviceType, &[filename.as_str()]);
                }
            }
        }
    };

    let Some(mut device) = factory::create_device(&DeviceProfile {
        device_type,
        id,
        lun,
        filename: filename.clone(),
    }) else {
        return context
            .return_localized_error(ErrorUnknownDeviceType, &[device_type.as_str()]);
    };

    // Without a filename the medium of a storage device is not inserted
    if device.supports_file() {
        device.state_mut().removed = filename.is_empty();
    }

    if !set_product_data(context, pb_device, device.as_mut()) {
        return false;
    }

    if !set_sector_size(context, device.as_mut(), pb_device.block_size) {
        return false;
    }

    let mut full_path = None;
    if device.supports_file() {
        // Only removable media drives may have their medium inserted later
        if filename.is_empty() && !device.state().removable {
            return context
                .return_localized_error(ErrorDeviceMissingFilename, &[device_type.as_str()]);
        }

        if !filename.is_empty() {
            match validate_image_file(daemon, context, device.as_mut(), &filename) {
                Some(path) => full_path = Some(path),
                None => return false,
            }
        }
    }

    // Protect/unprotect is only supported by non read-only devices. This
    // must not happen before the image file is opened because opening
    // overrides some settings.
    if device.state().protectable && !device.state().read_only {
        device.state_mut().set_protected(pb_device.protected);
    }

    let mut params = pb_device.params.clone();
    if !device.supports_file() {
        // Clients may send both "file" and device parameters
        params.remove("file");
    }

    if let Some(path) = &full_path {
        if !daemon.reservations.reserve(path, id, lun) {
            let (owner_id, owner_lun) = daemon.reservations.owner(path).unwrap();
            return context.return_localized_error(ErrorImageInUse, &[
                filename.as_str(),
                owner_id.to_string().as_str(),
                owner_lun.to_string().as_str(),
            ]);
        }
    }

    // Stop the dry run here, before actually attaching
    if dry_run {
        return true;
    }

    if !device.init(&params) {
        if let Some(path) = &full_path {
            daemon.reservations.release(path);
        }
        return context.return_localized_error(ErrorInitialization, &[
            device_type.as_str(),
            id.to_string().as_str(),
            lun.to_string().as_str(),
        ]);
    }

    let read_only = device.state().read_only;
    let is_protected = device.state().is_protected();

    if !daemon.registry.attach_to_controller(id, device) {
        if let Some(path) = &full_path {
            daemon.reservations.release(path);
        }
        return context.return_localized_error(ErrorScsiController, &[]);
    }

    let mut msg = "Attached ".to_string();
    if read_only {
        msg += "read-only ";
    } else if is_protected {
        msg += "protected ";
    }
    info!(
        "{}{} device, ID {}, unit {}",
        msg,
        device_type.as_str(),
        id,
        lun
    );

    true
}

fn detach(
    daemon: &mut Daemon,
    context: &mut CommandContext,
    id: u8,
    lun: u8,
    dry_run: bool,
) -> bool {
    {
        let Some(controller) = daemon.registry.find_controller(id) else {
            return context.return_localized_error(ErrorDetach, &[]);
        };

        // LUN 0 can only be detached if there is no other LUN anymore
        if lun == 0 && controller.lun_count() > 1 {
            return context.return_localized_error(ErrorLun0, &[]);
        }
    }

    if dry_run {
        return true;
    }

    let (device, remaining) = {
        let controller = daemon.registry.controller_mut(id).unwrap();
        let Some(device) = controller.remove_device(lun) else {
            return context.return_localized_error(ErrorDetach, &[]);
        };
        let remaining = controller.lun_count();
        (device, remaining)
    };

    // The controller goes away with its last LUN
    if remaining == 0 && !daemon.registry.delete_controller(id) {
        return context.return_localized_error(ErrorDetach, &[]);
    }

    if let Some(path) = device.image_path() {
        daemon.reservations.release(path);
    }

    info!(
        "Detached {} device with ID {}, unit {}",
        device.target_type().as_str(),
        id,
        lun
    );

    true
}

fn insert(
    daemon: &mut Daemon,
    context: &mut CommandContext,
    pb_device: &PbDeviceDefinition,
    dry_run: bool,
) -> bool {
    let id = pb_device.id as u8;
    let lun = pb_device.unit as u8;

    if !daemon
        .registry
        .device_by(id, lun)
        .is_some_and(|device| device.state().removed)
    {
        return context.return_localized_error(ErrorEjectRequired, &[]);
    }

    // The identity is fixed at attach time
    if !pb_device.vendor.is_empty()
        || !pb_device.product.is_empty()
        || !pb_device.revision.is_empty()
    {
        return context.return_localized_error(ErrorDeviceNameUpdate, &[]);
    }

    let filename = pb_device.param("file");
    if filename.is_empty() {
        return context.return_localized_error(ErrorMissingFilename, &[]);
    }

    // Stop the dry run here, before modifying the device
    if dry_run {
        return true;
    }

    info!(
        "Insert {}file '{}' requested into ID {}, unit {}",
        if pb_device.protected { "protected " } else { "" },
        filename,
        id,
        lun
    );

    let device = daemon.registry.device_by_mut(id, lun).unwrap();
    if !set_sector_size(context, device.as_mut(), pb_device.block_size) {
        return false;
    }

    // The borrow of the registry device blocks the daemon, so validate
    // against copies of the bookkeeping state
    let Some(full_path) = ({
        let Daemon {
            registry,
            reservations,
            images,
            ..
        } = daemon;
        let device = registry.device_by_mut(id, lun).unwrap();
        validate_image_file_parts(reservations, images, context, device.as_mut(), &filename)
    }) else {
        return false;
    };

    let device = daemon.registry.device_by_mut(id, lun).unwrap();
    device.state_mut().set_protected(pb_device.protected);
    device.set_medium_changed();

    daemon.reservations.reserve(&full_path, id, lun);

    true
}

fn eject(daemon: &mut Daemon, id: u8, lun: u8, dry_run: bool) -> bool {
    if !dry_run {
        let device = daemon.registry.device_by_mut(id, lun).unwrap();
        info!(
            "Eject requested for {} ID {}, unit {}",
            device.target_type().as_str(),
            id,
            lun
        );

        let path = device.image_path().map(PathBuf::from);
        if !device.eject(true) {
            warn!("Ejecting ID {}, unit {} failed", id, lun);
        } else if let Some(path) = path {
            daemon.reservations.release(&path);
        }
    }

    true
}

fn start(daemon: &mut Daemon, id: u8, lun: u8, dry_run: bool) -> bool {
    if !dry_run {
        let device = daemon.registry.device_by_mut(id, lun).unwrap();
        info!(
            "Start requested for {} ID {}, unit {}",
            device.target_type().as_str(),
            id,
            lun
        );

        if !device.state_mut().start() {
            warn!("Starting ID {}, unit {} failed", id, lun);
        }
    }

    true
}

fn stop(daemon: &mut Daemon, id: u8, lun: u8, dry_run: bool) -> bool {
    if !dry_run {
        let device = daemon.registry.device_by_mut(id, lun).unwrap();
        info!(
            "Stop requested for {} ID {}, unit {}",
            device.target_type().as_str(),
            id,
            lun
        );

        device.state_mut().stop();
    }

    true
}

fn protect(daemon: &mut Daemon, id: u8, lun: u8, protect: bool, dry_run: bool) -> bool {
    if !dry_run {
        let device = daemon.registry.device_by_mut(id, lun).unwrap();
        info!(
            "Write {}protection requested for {} ID {}, unit {}",
            if protect { "" } else { "un" },
            device.target_type().as_str(),
            id,
            lun
        );

        device.state_mut().set_protected(protect);
    }

    true
}

fn set_product_data(
    context: &mut CommandContext,
    pb_device: &PbDeviceDefinition,
    device: &mut dyn ScsiTarget,
) -> bool {
    let state = device.state_mut();

    let result = (|| {
        if !pb_device.vendor.is_empty() {
            state.set_vendor(&pb_device.vendor)?;
        }
        if !pb_device.product.is_empty() {
            state.set_product(&pb_device.product, true)?;
        }
        if !pb_device.revision.is_empty() {
            state.set_revision(&pb_device.revision)?;
        }
        Ok::<(), anyhow::Error>(())
    })();

    match result {
        Ok(()) => true,
        Err(e) => context.return_status(false, &e.to_string()),
    }
}

fn set_sector_size(
    context: &mut CommandContext,
    device: &mut dyn ScsiTarget,
    block_size: u32,
) -> bool {
    if block_size == 0 {
        return true;
    }

    if !device.sector_size_configurable() {
        return context.return_localized_error(
            ErrorBlockSizeNotConfigurable,
            &[device.target_type().as_str()],
        );
    }

    if !device.set_configured_sector_size(block_size) {
        return context
            .return_localized_error(ErrorBlockSize, &[block_size.to_string().as_str()]);
    }

    true
}

fn validate_image_file(
    daemon: &mut Daemon,
    context: &mut CommandContext,
    device: &mut dyn ScsiTarget,
    filename: &str,
) -> Option<PathBuf> {
    let Daemon {
        reservations,
        images,
        ..
    } = daemon;
    validate_image_file_parts(reservations, images, context, device, filename)
}

/// Resolves, reserves-checks and opens an image file, updating the
/// device's write-protection flags from the file permissions
fn validate_image_file_parts(
    reservations: &crate::daemon::ReservationTable,
    images: &super::image::ImageStore,
    context: &mut CommandContext,
    device: &mut dyn ScsiTarget,
    filename: &str,
) -> Option<PathBuf> {
    let full_path = images.resolve_existing(filename);

    if let Some((id, lun)) = reservations.owner(&full_path) {
        context.return_localized_error(ErrorImageInUse, &[
            filename,
            id.to_string().as_str(),
            lun.to_string().as_str(),
        ]);
        return None;
    }

    let Ok(metadata) = std::fs::metadata(&full_path) else {
        context.return_localized_error(ErrorFileOpen, &[full_path.to_string_lossy().as_ref()]);
        return None;
    };

    if metadata.permissions().readonly() {
        // Permanently write-protected
        device.state_mut().read_only = true;
        device.state_mut().protectable = false;
        device.state_mut().set_protected(false);
    } else if !device.state().read_only {
        device.state_mut().protectable = true;
    }

    if let Err(e) = device.open_image(&full_path) {
        warn!("Opening image failed: {:#}", e);
        context.return_localized_error(ErrorFileOpen, &[full_path.to_string_lossy().as_ref()]);
        return None;
    }

    Some(full_path)
}

/// LUN 0 must exist for every device ID after the command is applied
fn validate_lun_setup(daemon: &Daemon, command: &PbCommand) -> Result<(), String> {
    let mut luns: HashMap<u8, u32> = HashMap::new();

    // LUN bit vectors of new devices
    for device in &command.devices {
        if (0..i32::from(ID_MAX)).contains(&device.id) {
            *luns.entry(device.id as u8).or_default() |= 1 << device.unit;
        }
    }

    // LUN bit vectors of existing devices
    for (id, lun, _) in daemon.registry.all_devices() {
        *luns.entry(id).or_default() |= 1 << lun;
    }

    for (id, lun_mask) in &luns {
        if lun_mask & 0x01 == 0 {
            return Err(format!("LUN 0 is missing for device ID {}", id));
        }
    }

    Ok(())
}

fn parse_reserved_ids(
    daemon: &Daemon,
    ids: &str,
) -> Result<std::collections::BTreeSet<u8>, String> {
    let mut reserved = std::collections::BTreeSet::new();

    for id in ids.split(',').filter(|id| !id.is_empty()) {
        let Ok(parsed) = id.parse::<u8>() else {
            return Err(format!("Invalid ID {}", id));
        };
        if parsed >= ID_MAX {
            return Err(format!("Invalid ID {}", id));
        }

        if daemon.registry.has_controller(parsed) {
            return Err(format!("ID {} is currently in use", id));
        }

        reserved.insert(parsed);
    }

    Ok(reserved)
}

pub fn set_log_level(level: &str) -> bool {
    let filter = match level {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "err" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => {
            warn!("Invalid log level '{}'", level);
            return false;
        }
    };

    log::set_max_level(filter);
    info!("Set log level to '{}'", level);

    true
}

fn shut_down(context: &mut CommandContext, mode: &str) -> CommandOutcome {
    use CommandOutcome::{Completed, Shutdown};

    if mode.is_empty() {
        return Completed(context.return_localized_error(ErrorShutdownModeMissing, &[]));
    }

    let shutdown_mode = match mode {
        "process" => ShutdownMode::StopProcess,
        "host_shutdown" => ShutdownMode::StopHost,
        "host_reboot" => ShutdownMode::RestartHost,
        _ => {
            return Completed(context.return_localized_error(ErrorShutdownModeInvalid, &[mode]));
        }
    };

    // Shutting down or rebooting the host requires root
    #[cfg(unix)]
    if shutdown_mode != ShutdownMode::StopProcess && !nix::unistd::geteuid().is_root() {
        return Completed(context.return_localized_error(ErrorShutdownPermission, &[]));
    }

    // Reply first; the connection is gone once the shutdown proceeds
    context.return_ok();

    Shutdown(shutdown_mode)
}

fn print_command(command: &PbCommand, pb_device: &PbDeviceDefinition, dry_run: bool) {
    let params = command
        .params
        .iter()
        .sorted()
        .map(|(key, value)| {
            let value = if key == "token" { "???" } else { value };
            format!("'{}={}'", key, value)
        })
        .join(", ");

    info!(
        "{}: operation={:?}{}{}, device id={}, lun={}, type={:?}, vendor='{}', product='{}', \
         revision='{}', block size={}",
        if dry_run { "Validating" } else { "Executing" },
        command.operation_checked().unwrap_or(PbOperation::NoOperation),
        if params.is_empty() {
            String::new()
        } else {
            ", command params=".to_string()
        },
        params,
        pb_device.id,
        pb_device.unit,
        pb_device.device_type(),
        pb_device.vendor,
        pb_device.product,
        pb_device.revision,
        pb_device.block_size
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::context::{CaptureSink, CommandContext};
    use crate::control::locale::Localizer;
    use crate::control::proto::PbDeviceType;
    use crate::scsi::target::DeviceType;
    use std::sync::Arc;

    struct Fixture {
        daemon: Daemon,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut daemon = Daemon::new();
            daemon
                .images
                .set_default_folder_unchecked(dir.path().to_path_buf());
            Self { daemon, _dir: dir }
        }

        fn image(&self, name: &str, size: usize) {
            std::fs::write(
                self.daemon.images.default_folder().join(name),
                vec![0u8; size],
            )
            .unwrap();
        }

        fn run(&mut self, command: &PbCommand) -> (CommandOutcome, Vec<PbResult>) {
            let mut sink = CaptureSink::default();
            let outcome = {
                let mut context =
                    CommandContext::new(&mut sink, Arc::new(Localizer::new()), "en");
                process_command(&mut self.daemon, &mut context, command)
            };
            (outcome, sink.results)
        }
    }

    fn attach_command(id: i32, unit: i32, file: &str) -> PbCommand {
        let mut command = PbCommand::new(PbOperation::Attach);
        command.devices.push(PbDeviceDefinition {
            id,
            unit,
            params: std::collections::HashMap::from([(
                "file".to_string(),
                file.to_string(),
            )]),
            ..Default::default()
        });
        command
    }

    fn simple_device_command(operation: PbOperation, id: i32, unit: i32) -> PbCommand {
        let mut command = PbCommand::new(operation);
        command.devices.push(PbDeviceDefinition {
            id,
            unit,
            ..Default::default()
        });
        command
    }

    #[test]
    fn attach_and_detach_all_roundtrip() {
        let mut fixture = Fixture::new();
        fixture.image("a.hds", 10 * 1024 * 1024);

        let (outcome, results) = fixture.run(&attach_command(0, 0, "a.hds"));
        assert_eq!(outcome, CommandOutcome::Completed(true));
        assert!(results[0].status);
        assert_eq!(fixture.daemon.registry.device_count(), 1);
        assert_eq!(fixture.daemon.reservations.len(), 1);

        let (outcome, _) = fixture.run(&PbCommand::new(PbOperation::DetachAll));
        assert_eq!(outcome, CommandOutcome::Completed(true));
        assert!(fixture.daemon.registry.is_empty());
        assert!(fixture.daemon.reservations.is_empty());

        let (_, results) = fixture.run(&PbCommand::new(PbOperation::DevicesInfo));
        match &results[0].payload {
            Some(PbResultPayload::DevicesInfo(info)) => assert!(info.devices.is_empty()),
            _ => panic!("expected devices info"),
        }
    }

    #[test]
    fn attach_infers_type_from_extension() {
        let mut fixture = Fixture::new();
        fixture.image("a.iso", 2048 * 16);

        let (_, results) = fixture.run(&attach_command(1, 0, "a.iso"));
        assert!(results[0].status);

        let device = fixture.daemon.registry.device_by(1, 0).unwrap();
        assert_eq!(device.target_type(), DeviceType::Cdrom);
    }

    #[test]
    fn attach_rejects_unknown_extension() {
        let mut fixture = Fixture::new();
        fixture.image("a.dat", 512);

        let (_, results) = fixture.run(&attach_command(0, 0, "a.dat"));
        assert!(!results[0].status);
        assert!(!fixture.daemon.registry.has_controller(0));
    }

    #[test]
    fn attach_rejects_duplicate_image_reservation() {
        let mut fixture = Fixture::new();
        fixture.image("a.hds", 512 * 1024);

        let (_, results) = fixture.run(&attach_command(0, 0, "a.hds"));
        assert!(results[0].status);

        let (_, results) = fixture.run(&attach_command(0, 1, "a.hds"));
        assert!(!results[0].status);
        assert!(results[0].msg.contains("already being used by ID 0, unit 0"));
        assert_eq!(fixture.daemon.registry.device_count(), 1);
    }

    #[test]
    fn attach_rejects_reserved_id() {
        let mut fixture = Fixture::new();
        fixture.image("a.hds", 512 * 1024);

        let mut reserve = PbCommand::new(PbOperation::ReserveIds);
        reserve.params.insert("ids".to_string(), "2,5".to_string());
        let (outcome, _) = fixture.run(&reserve);
        assert_eq!(outcome, CommandOutcome::Completed(true));

        let (_, results) = fixture.run(&attach_command(2, 0, "a.hds"));
        assert!(!results[0].status);
    }

    #[test]
    fn reserve_ids_rejects_used_and_invalid_ids() {
        let mut fixture = Fixture::new();
        fixture.image("a.hds", 512 * 1024);
        fixture.run(&attach_command(3, 0, "a.hds"));

        let mut command = PbCommand::new(PbOperation::ReserveIds);
        command.params.insert("ids".to_string(), "3".to_string());
        let (_, results) = fixture.run(&command);
        assert!(!results[0].status);

        let mut command = PbCommand::new(PbOperation::ReserveIds);
        command.params.insert("ids".to_string(), "8".to_string());
        let (_, results) = fixture.run(&command);
        assert!(!results[0].status);
    }

    #[test]
    fn lun_boundaries() {
        let mut fixture = Fixture::new();
        fixture.image("a.hds", 512 * 1024);

        let (_, results) = fixture.run(&attach_command(0, 32, "a.hds"));
        assert!(!results[0].status);

        // LUN 31 requires LUN 0 to exist as well
        let mut command = attach_command(0, 0, "a.hds");
        command.devices[0].unit = 31;
        let (_, results) = fixture.run(&command);
        assert!(!results[0].status);
        assert!(results[0].msg.contains("LUN 0 is missing"));
    }

    #[test]
    fn identity_boundaries_on_attach() {
        let mut fixture = Fixture::new();
        fixture.image("a.hds", 512 * 1024);

        let mut command = attach_command(0, 0, "a.hds");
        command.devices[0].vendor = "V".repeat(9);
        let (_, results) = fixture.run(&command);
        assert!(!results[0].status);

        let mut command = attach_command(0, 0, "a.hds");
        command.devices[0].vendor = "V".repeat(8);
        command.devices[0].product = "P".repeat(16);
        command.devices[0].revision = "R".repeat(4);
        let (_, results) = fixture.run(&command);
        assert!(results[0].status);

        let device = fixture.daemon.registry.device_by(0, 0).unwrap();
        assert_eq!(device.state().vendor(), "V".repeat(8));
    }

    #[test]
    fn detach_of_lun0_with_other_luns_is_rejected() {
        let mut fixture = Fixture::new();
        fixture.image("a.hds", 512 * 1024);
        fixture.image("b.hds", 512 * 1024);

        let mut command = attach_command(0, 0, "a.hds");
        command.devices.push(PbDeviceDefinition {
            id: 0,
            unit: 1,
            params: std::collections::HashMap::from([(
                "file".to_string(),
                "b.hds".to_string(),
            )]),
            ..Default::default()
        });
        let (_, results) = fixture.run(&command);
        assert!(results[0].status);
        assert_eq!(fixture.daemon.registry.device_count(), 2);

        let (_, results) = fixture.run(&simple_device_command(PbOperation::Detach, 0, 0));
        assert!(!results[0].status);
        assert_eq!(fixture.daemon.registry.device_count(), 2);

        // Detaching the other LUN first makes LUN 0 detachable
        let (_, results) = fixture.run(&simple_device_command(PbOperation::Detach, 0, 1));
        assert!(results[0].status);
        let (_, results) = fixture.run(&simple_device_command(PbOperation::Detach, 0, 0));
        assert!(results[0].status);
        assert!(fixture.daemon.registry.is_empty());
        assert!(fixture.daemon.reservations.is_empty());
    }

    #[test]
    fn dry_run_failure_leaves_state_untouched() {
        let mut fixture = Fixture::new();
        fixture.image("a.hds", 512 * 1024);

        // Second device in the list refers to a missing file, so the whole
        // command must fail without attaching anything
        let mut command = attach_command(0, 0, "a.hds");
        command.devices.push(PbDeviceDefinition {
            id: 1,
            unit: 0,
            params: std::collections::HashMap::from([(
                "file".to_string(),
                "missing.hds".to_string(),
            )]),
            ..Default::default()
        });

        let (_, results) = fixture.run(&command);
        assert!(!results[0].status);
        assert!(fixture.daemon.registry.is_empty());
        assert!(fixture.daemon.reservations.is_empty());
    }

    #[test]
    fn insert_requires_removed_medium_and_fixed_identity() {
        let mut fixture = Fixture::new();
        fixture.image("a.hdr", 512 * 1024);
        fixture.image("b.hdr", 512 * 1024);

        let (_, results) = fixture.run(&attach_command(1, 0, "a.hdr"));
        assert!(results[0].status);

        // Medium still inserted
        let mut command = simple_device_command(PbOperation::Insert, 1, 0);
        command.devices[0]
            .params
            .insert("file".to_string(), "b.hdr".to_string());
        let (_, results) = fixture.run(&command);
        assert!(!results[0].status);

        let (_, results) = fixture.run(&simple_device_command(PbOperation::Eject, 1, 0));
        assert!(results[0].status);
        assert!(fixture.daemon.reservations.is_empty());

        // Identity changes are rejected on insert
        let mut renaming = simple_device_command(PbOperation::Insert, 1, 0);
        renaming.devices[0]
            .params
            .insert("file".to_string(), "b.hdr".to_string());
        renaming.devices[0].vendor = "NEW".to_string();
        let (_, results) = fixture.run(&renaming);
        assert!(!results[0].status);

        let vendor_before = fixture
            .daemon
            .registry
            .device_by(1, 0)
            .unwrap()
            .state()
            .vendor()
            .to_string();

        let (_, results) = fixture.run(&command);
        assert!(results[0].status, "{}", results[0].msg);
        assert_eq!(fixture.daemon.reservations.len(), 1);

        let device = fixture.daemon.registry.device_by_mut(1, 0).unwrap();
        assert_eq!(device.state().vendor(), vendor_before);
        // The medium change is reported once on the next dispatch
        assert!(device.take_medium_changed());
        assert!(!device.take_medium_changed());
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let mut fixture = Fixture::new();
        fixture.image("a.hds", 512 * 1024);
        fixture.run(&attach_command(0, 0, "a.hds"));

        fixture.run(&simple_device_command(PbOperation::Stop, 0, 0));
        let stopped = fixture.daemon.registry.device_by(0, 0).unwrap().state().stopped;
        fixture.run(&simple_device_command(PbOperation::Stop, 0, 0));
        assert_eq!(
            stopped,
            fixture.daemon.registry.device_by(0, 0).unwrap().state().stopped
        );
        assert!(stopped);
    }

    #[test]
    fn protect_requires_protectable_and_ready() {
        let mut fixture = Fixture::new();
        fixture.image("a.hds", 512 * 1024);
        fixture.run(&attach_command(0, 0, "a.hds"));

        let (_, results) = fixture.run(&simple_device_command(PbOperation::Protect, 0, 0));
        assert!(results[0].status);
        assert!(
            fixture
                .daemon
                .registry
                .device_by(0, 0)
                .unwrap()
                .state()
                .is_protected()
        );

        // services is not protectable
        let mut attach_services = PbCommand::new(PbOperation::Attach);
        attach_services.devices.push(PbDeviceDefinition {
            id: 7,
            unit: 0,
            r#type: PbDeviceType::Schs as i32,
            ..Default::default()
        });
        let (_, results) = fixture.run(&attach_services);
        assert!(results[0].status);

        let (_, results) = fixture.run(&simple_device_command(PbOperation::Protect, 7, 0));
        assert!(!results[0].status);
    }

    #[test]
    fn commands_for_missing_devices_are_rejected() {
        let mut fixture = Fixture::new();

        let (_, results) = fixture.run(&simple_device_command(PbOperation::Stop, 0, 0));
        assert!(!results[0].status);
        assert!(results[0].msg.contains("non-existing ID 0"));
    }

    #[test]
    fn shutdown_modes() {
        let mut fixture = Fixture::new();

        let mut command = PbCommand::new(PbOperation::ShutDown);
        command
            .params
            .insert("mode".to_string(), "process".to_string());
        let (outcome, results) = fixture.run(&command);
        assert_eq!(outcome, CommandOutcome::Shutdown(ShutdownMode::StopProcess));
        assert!(results[0].status);

        let mut command = PbCommand::new(PbOperation::ShutDown);
        command
            .params
            .insert("mode".to_string(), "banana".to_string());
        let (outcome, _) = fixture.run(&command);
        assert_eq!(outcome, CommandOutcome::Completed(false));

        let (outcome, _) = fixture.run(&PbCommand::new(PbOperation::ShutDown));
        assert_eq!(outcome, CommandOutcome::Completed(false));
    }

    #[test]
    fn unknown_operation_reports_error_code() {
        let mut fixture = Fixture::new();

        let command = PbCommand {
            operation: 4711,
            ..Default::default()
        };
        let (_, results) = fixture.run(&command);
        assert!(!results[0].status);
        assert_eq!(results[0].error_code, PbErrorCode::UnknownOperation as i32);
    }

    #[test]
    fn attach_returns_device_list() {
        let mut fixture = Fixture::new();
        fixture.image("a.hds", 512 * 1024);

        let (_, results) = fixture.run(&attach_command(4, 0, "a.hds"));
        match &results[0].payload {
            Some(PbResultPayload::DevicesInfo(info)) => {
                assert_eq!(info.devices.len(), 1);
                assert_eq!(info.devices[0].id, 4);
            }
            _ => panic!("expected a device list"),
        }
    }
}
