//! SCSI target devices
//!
//! [`ScsiTarget`] collapses the usual device class hierarchy into a single
//! trait: shared flag/identity state lives in [`DeviceState`], the mandatory
//! primary commands (TEST UNIT READY, INQUIRY, REPORT LUNS, REQUEST SENSE)
//! and the mode-page machinery are default methods, and each device variant
//! supplies its own command table through `dispatch_specific`.

pub mod bridge;
pub mod cdrom;
pub mod daynaport;
pub mod disk;
pub mod factory;
pub mod harddisk;
pub mod net;
pub mod optical;
pub mod printer;
pub mod services;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Result, bail};
use num_traits::FromPrimitive;

use crate::scsi::controller::TransferCtx;
use crate::scsi::{
    ASC_INVALID_COMMAND_OPERATION_CODE, ASC_INVALID_FIELD_IN_CDB, ASC_MEDIUM_NOT_PRESENT,
    ASC_NOT_READY_TO_READY_CHANGE, ASC_POWER_ON_OR_RESET, ScsiCommand, ScsiError, ScsiResult,
    SenseKey, be16, be32,
};
use crate::version;

pub const DEFAULT_VENDOR: &str = "REMORA";

/// Maximum LUNs per controller
pub const LUN_MAX: u8 = 32;

/// INQUIRY peripheral device types
pub const INQUIRY_DIRECT_ACCESS: u8 = 0x00;
pub const INQUIRY_PRINTER: u8 = 0x02;
pub const INQUIRY_PROCESSOR: u8 = 0x03;
pub const INQUIRY_CDROM: u8 = 0x05;
pub const INQUIRY_OPTICAL_MEMORY: u8 = 0x07;
pub const INQUIRY_COMMUNICATIONS: u8 = 0x09;

/// SCSI level reported in the INQUIRY response
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScsiLevel {
    Scsi1Ccs = 1,
    Scsi2 = 2,
    Spc3 = 5,
}

/// Emulated device variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceType {
    Harddisk,
    RemovableDisk,
    Optical,
    Cdrom,
    Bridge,
    Daynaport,
    HostServices,
    Printer,
}

impl DeviceType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Harddisk => "SCHD",
            Self::RemovableDisk => "SCRM",
            Self::Optical => "SCMO",
            Self::Cdrom => "SCCD",
            Self::Bridge => "SCBR",
            Self::Daynaport => "SCDP",
            Self::HostServices => "SCHS",
            Self::Printer => "SCLP",
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State shared by all device variants: capability flags, medium state,
/// INQUIRY identity and the cached sense code for REQUEST SENSE.
#[derive(Debug, Default, Clone)]
pub struct DeviceState {
    pub id: u8,
    pub lun: u8,

    vendor: String,
    product: String,
    revision: String,

    pub ready: bool,
    pub reset: bool,
    pub attn: bool,

    pub protectable: bool,
    write_protected: bool,
    pub read_only: bool,

    pub stoppable: bool,
    pub stopped: bool,

    pub removable: bool,
    pub removed: bool,

    pub lockable: bool,
    pub locked: bool,

    pub supports_params: bool,

    params: HashMap<String, String>,
    default_params: HashMap<String, String>,

    // (sense key << 16) | (ASC << 8) | ASCQ
    sense: u32,
}

impl DeviceState {
    pub fn new(id: u8, lun: u8) -> Self {
        Self {
            id,
            lun,
            vendor: DEFAULT_VENDOR.to_string(),
            revision: version::default_revision(),
            ..Default::default()
        }
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn product(&self) -> &str {
        &self.product
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn set_vendor(&mut self, vendor: &str) -> Result<()> {
        if vendor.is_empty() || vendor.len() > 8 {
            bail!("Vendor '{}' must be between 1 and 8 characters", vendor);
        }
        self.vendor = vendor.to_string();
        Ok(())
    }

    /// Changing an already assigned product name is only permitted when
    /// forced (it is not SCSI compliant).
    pub fn set_product(&mut self, product: &str, force: bool) -> Result<()> {
        if !self.product.is_empty() && !force {
            return Ok(());
        }
        if product.is_empty() || product.len() > 16 {
            bail!("Product '{}' must be between 1 and 16 characters", product);
        }
        self.product = product.to_string();
        Ok(())
    }

    pub fn set_revision(&mut self, revision: &str) -> Result<()> {
        if revision.is_empty() || revision.len() > 4 {
            bail!("Revision '{}' must be between 1 and 4 characters", revision);
        }
        self.revision = revision.to_string();
        Ok(())
    }

    /// Space-padded vendor(8) + product(16) + revision(4) INQUIRY tail
    pub fn padded_name(&self) -> [u8; 28] {
        let mut name = [b' '; 28];
        name[..self.vendor.len()].copy_from_slice(self.vendor.as_bytes());
        name[8..8 + self.product.len()].copy_from_slice(self.product.as_bytes());
        name[24..24 + self.revision.len()].copy_from_slice(self.revision.as_bytes());
        name
    }

    pub fn param(&self, key: &str) -> String {
        self.params.get(key).cloned().unwrap_or_default()
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn set_default_params(&mut self, default_params: HashMap<String, String>) {
        self.default_params = default_params;
    }

    /// Applies the given parameters on top of the defaults. Parameters
    /// without a default are not supported and get dropped.
    pub fn set_params(&mut self, set_params: &HashMap<String, String>) {
        self.params = self.default_params.clone();
        for (key, value) in set_params {
            if self.params.contains_key(key) {
                self.params.insert(key.clone(), value.clone());
            } else {
                log::warn!("Ignored unknown parameter '{}'", key);
            }
        }
    }

    pub fn sense(&self) -> u32 {
        self.sense
    }

    pub fn set_sense(&mut self, sense: u32) {
        if sense != 0 {
            log::debug!(
                "Error status: Sense Key ${:02X}, ASC ${:02X}, ASCQ ${:02X}",
                sense >> 16,
                (sense >> 8) & 0xFF,
                sense & 0xFF
            );
        }
        self.sense = sense;
    }

    pub fn is_protected(&self) -> bool {
        self.write_protected
    }

    /// Write protection is only honored for devices that are not
    /// permanently read-only.
    pub fn set_protected(&mut self, write_protected: bool) {
        if !self.read_only {
            self.write_protected = write_protected;
        }
    }

    /// Ready-state ladder, raising UNIT ATTENTION for pending reset or
    /// attention conditions.
    pub fn check_ready(&mut self) -> ScsiResult<()> {
        if self.reset {
            self.reset = false;
            return Err(ScsiError::new(SenseKey::UnitAttention, ASC_POWER_ON_OR_RESET));
        }

        if self.attn {
            self.attn = false;
            return Err(ScsiError::new(
                SenseKey::UnitAttention,
                ASC_NOT_READY_TO_READY_CHANGE,
            ));
        }

        if !self.ready {
            return Err(ScsiError::new(SenseKey::NotReady, ASC_MEDIUM_NOT_PRESENT));
        }

        Ok(())
    }

    pub fn start(&mut self) -> bool {
        if !self.ready {
            return false;
        }
        self.stopped = false;
        true
    }

    pub fn stop(&mut self) {
        self.ready = false;
        self.attn = false;
        self.stopped = true;
    }

    /// Base eject transition; medium-specific cleanup is up to the target
    pub fn eject(&mut self, force: bool) -> bool {
        if !self.ready || !self.removable {
            return false;
        }

        // Must be unlocked unless forced
        if !force && self.locked {
            return false;
        }

        self.ready = false;
        self.attn = false;
        self.removed = true;
        self.write_protected = false;
        self.locked = false;
        self.stopped = true;

        true
    }

    /// Bus reset clears transient medium state
    pub fn bus_reset(&mut self) {
        self.locked = false;
        self.attn = false;
        self.reset = false;
    }
}

pub trait ScsiTarget: Send {
    fn state(&self) -> &DeviceState;
    fn state_mut(&mut self) -> &mut DeviceState;
    fn target_type(&self) -> DeviceType;

    /// Full INQUIRY payload for this variant
    fn inquiry_payload(&self) -> Vec<u8>;

    /// Variant command table; `None` hands the opcode to the shared
    /// primary-command table.
    fn dispatch_specific(&mut self, ctx: &mut TransferCtx, opcode: u8)
    -> Option<ScsiResult<()>>;

    /// Mode pages of this variant, keyed by page code. Page 0x3F selects
    /// all pages.
    fn setup_mode_pages(&self, _pages: &mut BTreeMap<u8, Vec<u8>>, _page: u8, _changeable: bool) {}

    /// Applies MODE SELECT parameter data
    fn mode_select(&mut self, _cdb: &[u8], _data: &[u8]) -> ScsiResult<()> {
        Err(ScsiError::new(
            SenseKey::IllegalRequest,
            ASC_INVALID_COMMAND_OPERATION_CODE,
        ))
    }

    /// Post-construction hook, called once after flags and identity are set
    fn init(&mut self, params: &HashMap<String, String>) -> bool {
        self.state_mut().set_params(params);
        true
    }

    /// Consumes the medium-changed latch of removable media
    fn take_medium_changed(&mut self) -> bool {
        false
    }

    /// Arms the medium-changed latch after a medium insert
    fn set_medium_changed(&mut self) {}

    fn flush_cache(&mut self) {}

    fn eject(&mut self, force: bool) -> bool {
        self.state_mut().eject(force)
    }

    /// Called on bus reset
    fn bus_reset(&mut self) {
        self.state_mut().bus_reset();
    }

    /// Refills the transfer buffer with the next block during DataIn
    fn xfer_in(&mut self, _ctx: &mut TransferCtx) -> ScsiResult<()> {
        Err(ScsiError::aborted())
    }

    /// Consumes the transfer buffer during DataOut. With `cont` the target
    /// prepares the next block (offset and length).
    fn xfer_out(&mut self, ctx: &mut TransferCtx, _cont: bool) -> ScsiResult<()> {
        let opcode = ctx.opcode();
        match ScsiCommand::from_u8(opcode) {
            Some(ScsiCommand::ModeSelect6) => {
                let len = ctx.cdb[4] as usize;
                let (cdb, data) = ctx.cdb_and_buffer(len);
                self.mode_select(&cdb, data)
            }
            Some(ScsiCommand::ModeSelect10) => {
                let len = be16(&ctx.cdb, 7) as usize;
                let (cdb, data) = ctx.cdb_and_buffer(len);
                self.mode_select(&cdb, data)
            }
            _ => {
                log::warn!("Unexpected data-out completion for command ${:02X}", opcode);
                Ok(())
            }
        }
    }

    /// Byte-oriented DataOut completion (printer PRINT path)
    fn write_bytes(&mut self, _ctx: &mut TransferCtx) -> ScsiResult<()> {
        log::error!("Writing byte sequences is not supported by this device");
        Err(ScsiError::aborted())
    }

    /// Byte offset after which the HAL delays a send handshake
    fn send_delay(&self) -> u32 {
        crate::scsi::bus::SEND_NO_DELAY
    }

    fn image_path(&self) -> Option<&Path> {
        None
    }

    /// Opens the backing image file. Only meaningful for storage variants.
    fn open_image(&mut self, _path: &Path) -> Result<()> {
        bail!("This device does not support image files")
    }

    fn sector_size_configurable(&self) -> bool {
        false
    }

    fn set_configured_sector_size(&mut self, _size: u32) -> bool {
        false
    }

    fn supports_file(&self) -> bool {
        !self.state().supports_params
    }

    // --- Shared dispatch -------------------------------------------------

    fn dispatch(&mut self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        // Media changes are reported on the next access, not only for
        // TEST UNIT READY
        if self.take_medium_changed() {
            return Err(ScsiError::new(
                SenseKey::UnitAttention,
                ASC_NOT_READY_TO_READY_CHANGE,
            ));
        }

        let opcode = ctx.opcode();
        if let Some(result) = self.dispatch_specific(ctx, opcode) {
            return result;
        }

        self.dispatch_primary(ctx, opcode)
    }

    fn dispatch_primary(&mut self, ctx: &mut TransferCtx, opcode: u8) -> ScsiResult<()> {
        match ScsiCommand::from_u8(opcode) {
            Some(ScsiCommand::TestUnitReady) => self.test_unit_ready(ctx),
            Some(ScsiCommand::Inquiry) => self.inquiry(ctx),
            Some(ScsiCommand::ReportLuns) => self.report_luns(ctx),
            Some(ScsiCommand::RequestSense) => self.request_sense(ctx),
            Some(ScsiCommand::ModeSense6) => self.mode_sense6(ctx),
            Some(ScsiCommand::ModeSense10) => self.mode_sense10(ctx),
            Some(ScsiCommand::ModeSelect6) => self.mode_select6(ctx),
            Some(ScsiCommand::ModeSelect10) => self.mode_select10(ctx),
            _ => {
                log::trace!(
                    "ID {} LUN {} received unsupported command ${:02X}",
                    self.state().id,
                    self.state().lun,
                    opcode
                );
                Err(ScsiError::new(
                    SenseKey::IllegalRequest,
                    ASC_INVALID_COMMAND_OPERATION_CODE,
                ))
            }
        }
    }

    fn test_unit_ready(&mut self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        self.state_mut().check_ready()?;
        ctx.enter_status();
        Ok(())
    }

    fn inquiry(&mut self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        // EVPD and page code are not supported
        if ctx.cdb[1] & 0x01 != 0 || ctx.cdb[2] != 0 {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                ASC_INVALID_FIELD_IN_CDB,
            ));
        }

        let payload = self.inquiry_payload();
        let allocation_length = (be16(&ctx.cdb, 3) as usize).min(payload.len());
        ctx.buffer[..allocation_length].copy_from_slice(&payload[..allocation_length]);
        ctx.enter_data_in(allocation_length);
        Ok(())
    }

    fn report_luns(&mut self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        // Only SELECT REPORT mode 0 is supported
        if ctx.cdb[2] != 0 {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                ASC_INVALID_FIELD_IN_CDB,
            ));
        }

        let allocation_length = be32(&ctx.cdb, 6) as usize;
        let clear = allocation_length.min(ctx.buffer.len());
        ctx.buffer[..clear].fill(0);

        let mut size = 0;
        for lun in 0..LUN_MAX {
            if ctx.has_lun(lun) {
                size += 8;
                ctx.buffer[size + 7] = lun;
            }
        }

        ctx.buffer[2] = (size >> 8) as u8;
        ctx.buffer[3] = size as u8;

        size += 8;

        ctx.enter_data_in(allocation_length.min(size));
        Ok(())
    }

    fn request_sense(&mut self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        let payload = self.sense_payload()?;

        let allocation_length = (ctx.cdb[4] as usize).min(payload.len());
        ctx.buffer[..allocation_length].copy_from_slice(&payload[..allocation_length]);
        ctx.enter_data_in(allocation_length);
        Ok(())
    }

    fn sense_payload(&self) -> ScsiResult<Vec<u8>> {
        let code = self.state().sense();

        // Report not ready only if there is no error to report
        if code == 0 && !self.state().ready {
            return Err(ScsiError::new(SenseKey::NotReady, ASC_MEDIUM_NOT_PRESENT));
        }

        let mut buf = vec![0u8; 18];
        // Fixed format, current error
        buf[0] = 0x70;
        buf[2] = (code >> 16) as u8;
        buf[7] = 10;
        buf[12] = (code >> 8) as u8;
        buf[13] = code as u8;

        Ok(buf)
    }

    /// Assembles all requested mode pages. Page 0, when present, is
    /// emitted last as the specification mandates.
    fn collect_mode_pages(&self, page: u8, changeable: bool) -> ScsiResult<Vec<u8>> {
        let mut pages: BTreeMap<u8, Vec<u8>> = BTreeMap::new();
        self.setup_mode_pages(&mut pages, page, changeable);

        if pages.is_empty() {
            log::trace!("Unsupported mode page ${:02X}", page);
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                ASC_INVALID_FIELD_IN_CDB,
            ));
        }

        let mut result = Vec::new();
        let mut page0 = Vec::new();
        for (index, data) in &pages {
            if *index != 0 {
                let off = result.len();
                result.extend_from_slice(data);
                // Page code (the PS bit may already be set) and payload size
                result[off] |= index;
                result[off + 1] = (data.len() - 2) as u8;
            } else {
                page0 = data.clone();
            }
        }

        if !page0.is_empty() {
            let off = result.len();
            result.extend_from_slice(&page0);
            result[off + 1] = (page0.len() - 2) as u8;
        }

        Ok(result)
    }

    fn mode_sense6(&mut self, _ctx: &mut TransferCtx) -> ScsiResult<()> {
        Err(ScsiError::new(
            SenseKey::IllegalRequest,
            ASC_INVALID_COMMAND_OPERATION_CODE,
        ))
    }

    fn mode_sense10(&mut self, _ctx: &mut TransferCtx) -> ScsiResult<()> {
        Err(ScsiError::new(
            SenseKey::IllegalRequest,
            ASC_INVALID_COMMAND_OPERATION_CODE,
        ))
    }

    fn mode_select6(&mut self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        let length = ctx.cdb[4] as usize;
        ctx.enter_data_out(length);
        Ok(())
    }

    fn mode_select10(&mut self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        let length = (be16(&ctx.cdb, 7) as usize).min(ctx.buffer.len());
        ctx.enter_data_out(length);
        Ok(())
    }

    /// 36-byte INQUIRY base payload
    fn inquiry_common(&self, device_type: u8, level: ScsiLevel, removable: bool) -> Vec<u8> {
        let mut buf = vec![0u8; 0x1F + 5];

        buf[0] = device_type;
        buf[1] = if removable { 0x80 } else { 0x00 };
        buf[2] = level as u8;
        buf[3] = if level >= ScsiLevel::Scsi2 {
            ScsiLevel::Scsi2 as u8
        } else {
            ScsiLevel::Scsi1Ccs as u8
        };
        buf[4] = 0x1F;

        buf[8..36].copy_from_slice(&self.state().padded_name());

        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_name_is_28_bytes() {
        let mut state = DeviceState::new(0, 0);
        state.set_vendor("ACME").unwrap();
        state.set_product("TESTDISK", true).unwrap();
        state.set_revision("1.0").unwrap();

        let name = state.padded_name();
        assert_eq!(&name[..8], b"ACME    ");
        assert_eq!(&name[8..24], b"TESTDISK        ");
        assert_eq!(&name[24..], b"1.0 ");
    }

    #[test]
    fn identity_length_boundaries() {
        let mut state = DeviceState::new(0, 0);

        assert!(state.set_vendor("").is_err());
        assert!(state.set_vendor("V").is_ok());
        assert!(state.set_vendor("12345678").is_ok());
        assert!(state.set_vendor("123456789").is_err());

        assert!(state.set_product("", true).is_err());
        assert!(state.set_product("1234567890123456", true).is_ok());
        assert!(state.set_product("12345678901234567", true).is_err());

        assert!(state.set_revision("").is_err());
        assert!(state.set_revision("1234").is_ok());
        assert!(state.set_revision("12345").is_err());
    }

    #[test]
    fn product_not_overwritten_without_force() {
        let mut state = DeviceState::new(0, 0);
        state.set_product("FIRST", true).unwrap();
        state.set_product("SECOND", false).unwrap();
        assert_eq!(state.product(), "FIRST");
        state.set_product("THIRD", true).unwrap();
        assert_eq!(state.product(), "THIRD");
    }

    #[test]
    fn eject_requires_removable_and_unlocked() {
        let mut state = DeviceState::new(0, 0);
        state.ready = true;
        assert!(!state.eject(false));

        state.removable = true;
        state.locked = true;
        assert!(!state.eject(false));
        assert!(state.eject(true));
        assert!(state.removed);
        assert!(state.stopped);
        assert!(!state.locked);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut state = DeviceState::new(0, 0);
        state.ready = true;
        state.stop();
        let snapshot = (state.ready, state.attn, state.stopped);
        state.stop();
        assert_eq!(snapshot, (state.ready, state.attn, state.stopped));
    }

    #[test]
    fn check_ready_ladder() {
        let mut state = DeviceState::new(0, 0);
        state.ready = true;
        state.reset = true;
        state.attn = true;

        let e = state.check_ready().unwrap_err();
        assert_eq!(e.sense_key, SenseKey::UnitAttention);
        assert_eq!(e.asc, ASC_POWER_ON_OR_RESET);

        let e = state.check_ready().unwrap_err();
        assert_eq!(e.asc, ASC_NOT_READY_TO_READY_CHANGE);

        assert!(state.check_ready().is_ok());

        state.ready = false;
        let e = state.check_ready().unwrap_err();
        assert_eq!(e.sense_key, SenseKey::NotReady);
    }

    #[test]
    fn protection_requires_not_read_only() {
        let mut state = DeviceState::new(0, 0);
        state.read_only = true;
        state.set_protected(true);
        assert!(!state.is_protected());

        state.read_only = false;
        state.set_protected(true);
        assert!(state.is_protected());
    }
}
