//! remorad: the SCSI target emulator daemon
//!
//! Presents emulated SCSI devices on the bus and accepts management
//! commands over the framed protobuf control protocol on TCP port 6868.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use clap::Parser;
use log::*;

use remora_core::control::context::{CaptureSink, CommandContext};
use remora_core::control::executor::{self, CommandOutcome};
use remora_core::control::framing::DEFAULT_PORT;
use remora_core::control::locale::Localizer;
use remora_core::control::proto::{PbCommand, PbDeviceDefinition, PbOperation};
use remora_core::control::response;
use remora_core::control::service::ControlService;
use remora_core::daemon::Daemon;
use remora_core::run::run_bus_loop;
use remora_core::scsi::bus::NullBus;
use remora_core::version;

#[derive(Parser)]
#[command(
    name = "remorad",
    version,
    about = "SCSI target emulator daemon",
    long_about = "Emulates SCSI devices (hard disks, removable disks, MO and CD-ROM drives, \
                  a DaynaPort Ethernet adapter, a host bridge, a printer and a host services \
                  device) backed by image files.\n\n\
                  Image types are detected by extension: hd1/hds/hda/hdn/hdi/nhd (hard disk), \
                  hdr (removable disk), mos (MO), iso (CD-ROM). The special names \"bridge\", \
                  \"daynaport\", \"printer\" and \"services\" attach the respective device."
)]
struct Args {
    /// Control service port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Log level (trace, debug, info, warn, err, off)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Default image folder
    #[arg(short = 'F', long)]
    image_folder: Option<String>,

    /// Folder scan depth for image files
    #[arg(short = 'R', long)]
    scan_depth: Option<usize>,

    /// Comma-separated list of reserved device IDs
    #[arg(short, long)]
    reserved_ids: Option<String>,

    /// File containing the access token required for all clients
    #[arg(short = 'P', long)]
    token_file: Option<PathBuf>,

    /// Locale for client-facing messages (defaults to LC_MESSAGES)
    #[arg(short = 'z', long)]
    locale: Option<String>,

    /// Device to attach: ID[:LUN]:FILE, e.g. 0:harddisk.hds or 1:0:cd.iso
    #[arg(short, long = "device", value_name = "SPEC")]
    devices: Vec<String>,

    /// Sector size for the devices of this command line
    #[arg(short, long)]
    block_size: Option<u32>,
}

static RUNNING: AtomicBool = AtomicBool::new(true);
static TERMINATION_SIGNAL: AtomicI32 = AtomicI32::new(0);

#[cfg(unix)]
extern "C" fn termination_handler(signal: i32) {
    TERMINATION_SIGNAL.store(signal, Ordering::SeqCst);
    RUNNING.store(false, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_signal_handlers() -> Result<()> {
    use nix::sys::signal;

    let action = signal::SigAction::new(
        signal::SigHandler::Handler(termination_handler),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );

    // SAFETY: the handler only stores into an atomic
    unsafe {
        signal::sigaction(signal::Signal::SIGINT, &action)?;
        signal::sigaction(signal::Signal::SIGTERM, &action)?;
        signal::signal(signal::Signal::SIGPIPE, signal::SigHandler::SigIgn)?;
    }

    Ok(())
}

fn default_locale() -> String {
    let locale = std::env::var("LC_MESSAGES")
        .or_else(|_| std::env::var("LANG"))
        .unwrap_or_default();

    // Strip the codeset ("de_DE.UTF-8" -> "de_DE")
    let locale = locale.split('.').next().unwrap_or("").to_string();
    if locale.is_empty() || locale == "C" || locale == "POSIX" {
        "en".to_string()
    } else {
        locale
    }
}

/// An access token file must be owned by root and readable by root only
fn read_access_token(path: &PathBuf) -> Result<String> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            bail!("Can't access token file '{}'", path.display());
        }
        if metadata.uid() != 0 || metadata.gid() != 0 || metadata.mode() & 0o077 != 0 {
            bail!(
                "Access token file '{}' must be owned by root and readable by root only",
                path.display()
            );
        }
    }

    let token = std::fs::read_to_string(path)?
        .lines()
        .next()
        .unwrap_or("")
        .to_string();
    if token.is_empty() {
        bail!("Access token file '{}' must not be empty", path.display());
    }

    Ok(token)
}

/// Parses a device spec of the form ID[:LUN]:FILE
fn parse_device_spec(spec: &str, block_size: Option<u32>) -> Result<PbDeviceDefinition> {
    let mut parts = spec.splitn(3, ':');

    let id: i32 = match parts.next().map(str::parse) {
        Some(Ok(id)) if (0..8).contains(&id) => id,
        _ => bail!("{}: Invalid device ID (0-7)", spec),
    };

    let (unit, file) = match (parts.next(), parts.next()) {
        (Some(file), None) => (0, file.to_string()),
        (Some(unit), Some(file)) => {
            let unit: i32 = match unit.parse() {
                Ok(unit) if (0..32).contains(&unit) => unit,
                _ => bail!("{}: Invalid unit (0-31)", spec),
            };
            (unit, file.to_string())
        }
        _ => bail!("{}: Missing filename", spec),
    };

    Ok(PbDeviceDefinition {
        id,
        unit,
        params: HashMap::from([("file".to_string(), file)]),
        block_size: block_size.unwrap_or(0),
        ..Default::default()
    })
}

fn create_initial_devices(
    daemon: &mut Daemon,
    localizer: &Arc<Localizer>,
    locale: &str,
    args: &Args,
) -> Result<()> {
    if args.devices.is_empty() {
        return Ok(());
    }

    let mut command = PbCommand::new(PbOperation::Attach);
    for spec in &args.devices {
        command.devices.push(parse_device_spec(spec, args.block_size)?);
    }

    let mut sink = CaptureSink::default();
    let ok = {
        let mut context = CommandContext::new(&mut sink, localizer.clone(), locale);
        matches!(
            executor::process_command(daemon, &mut context, &command),
            CommandOutcome::Completed(true)
        )
    };

    if !ok {
        let msg = sink
            .results
            .last()
            .map(|result| result.msg.clone())
            .unwrap_or_default();
        bail!("Creating the initial devices failed: {}", msg);
    }

    Ok(())
}

fn run() -> Result<ExitCode> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("SCSI target emulator remorad version {}", version::build_version());

    if !executor::set_log_level(&args.log_level) {
        bail!("Invalid log level '{}'", args.log_level);
    }

    let locale = args.locale.clone().unwrap_or_else(default_locale);
    let localizer = Arc::new(Localizer::new());

    let mut daemon = Daemon::new();
    daemon.log_level = args.log_level.clone();

    if let Some(folder) = &args.image_folder {
        if let Err(msg) = daemon.images.set_default_folder(folder) {
            bail!("{}", msg);
        }
    }

    if let Some(depth) = args.scan_depth {
        daemon.images.set_depth(depth);
    }

    if let Some(token_file) = &args.token_file {
        daemon.access_token = Some(read_access_token(token_file)?);
    }

    if let Some(ids) = &args.reserved_ids {
        let mut command = PbCommand::new(PbOperation::ReserveIds);
        command.params.insert("ids".to_string(), ids.clone());
        let mut sink = CaptureSink::default();
        let mut context = CommandContext::new(&mut sink, localizer.clone(), &locale);
        if !matches!(
            executor::process_command(&mut daemon, &mut context, &command),
            CommandOutcome::Completed(true)
        ) {
            bail!("Invalid reserved ID list '{}'", ids);
        }
    }

    create_initial_devices(&mut daemon, &localizer, &locale, &args)?;

    // Log the initial device list
    let device_list = response::list_devices(&response::devices_info(&daemon, &[]));
    for line in device_list.lines() {
        info!("{}", line);
    }

    let daemon = Arc::new(Mutex::new(daemon));

    // The control service runs on its own worker thread
    let service = match ControlService::bind(args.port, &locale) {
        Ok(service) => service,
        Err(e) => {
            error!("{:#}", e);
            // EPERM, matching a failed privileged bus setup
            return Ok(ExitCode::from(1));
        }
    };
    service.spawn(daemon.clone(), localizer);

    #[cfg(unix)]
    install_signal_handlers()?;

    info!("No bus hardware support, only client interface calls are supported");

    // The bus loop owns the main thread until a signal arrives
    let mut bus = NullBus;
    run_bus_loop(&mut bus, &daemon, &RUNNING);

    let signal = TERMINATION_SIGNAL.load(Ordering::SeqCst);
    info!("Shutting down on signal {}", signal);
    daemon.lock().unwrap().detach_all();

    Ok(ExitCode::from(signal as u8))
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(255)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_spec_parsing() {
        let device = parse_device_spec("0:test.hds", None).unwrap();
        assert_eq!(device.id, 0);
        assert_eq!(device.unit, 0);
        assert_eq!(device.params["file"], "test.hds");

        let device = parse_device_spec("3:1:cd.iso", Some(512)).unwrap();
        assert_eq!(device.id, 3);
        assert_eq!(device.unit, 1);
        assert_eq!(device.params["file"], "cd.iso");
        assert_eq!(device.block_size, 512);

        assert!(parse_device_spec("8:test.hds", None).is_err());
        assert!(parse_device_spec("0:32:test.hds", None).is_err());
        assert!(parse_device_spec("0", None).is_err());
    }

    #[test]
    fn locale_fallback() {
        // Only checks the shape; the environment is not modified
        let locale = default_locale();
        assert!(!locale.is_empty());
        assert!(!locale.contains('.'));
    }
}
