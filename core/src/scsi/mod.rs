//! SCSI target subsystem: bus contract, phase-machine controller, targets
//!
//! ## Bus phases and transitions
//! ```mermaid
//! stateDiagram-v2
//!     [*] --> BusFree
//!
//!     BusFree --> Selection : SEL asserted, BSY clear
//!     Selection --> MsgOut : SEL released with ATN
//!     Selection --> Command : SEL released
//!     MsgOut --> Command : ATN released, messages parsed
//!     Command --> DataIn : target returns data
//!     Command --> DataOut : target expects data
//!     Command --> Status : no data transfer
//!     DataIn --> Status
//!     DataOut --> Status
//!     Status --> MsgIn : status byte sent
//!     MsgIn --> BusFree : command complete
//! ```

pub mod bus;
pub mod controller;
pub mod registry;
pub mod scriptbus;
pub mod target;

use num_derive::FromPrimitive;
use thiserror::Error;

pub const STATUS_GOOD: u8 = 0x00;
pub const STATUS_CHECK_CONDITION: u8 = 0x02;

/// Sense keys reported via REQUEST SENSE
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum SenseKey {
    NoSense = 0x00,
    NotReady = 0x02,
    MediumError = 0x03,
    IllegalRequest = 0x05,
    UnitAttention = 0x06,
    DataProtect = 0x07,
    AbortedCommand = 0x0B,
}

// Additional sense codes
pub const ASC_NO_ADDITIONAL_SENSE_INFORMATION: u8 = 0x00;
pub const ASC_WRITE_FAULT: u8 = 0x03;
pub const ASC_READ_FAULT: u8 = 0x11;
pub const ASC_INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
pub const ASC_LBA_OUT_OF_RANGE: u8 = 0x21;
pub const ASC_INVALID_FIELD_IN_CDB: u8 = 0x24;
pub const ASC_INVALID_LUN: u8 = 0x25;
pub const ASC_INVALID_FIELD_IN_PARAMETER_LIST: u8 = 0x26;
pub const ASC_WRITE_PROTECTED: u8 = 0x27;
pub const ASC_NOT_READY_TO_READY_CHANGE: u8 = 0x28;
pub const ASC_POWER_ON_OR_RESET: u8 = 0x29;
pub const ASC_MEDIUM_NOT_PRESENT: u8 = 0x3A;
pub const ASC_LOAD_OR_EJECT_FAILED: u8 = 0x53;

/// SCSI command operation codes
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum ScsiCommand {
    TestUnitReady = 0x00,
    Rezero = 0x01,
    RequestSense = 0x03,
    FormatUnit = 0x04,
    ReassignBlocks = 0x07,
    Read6 = 0x08,
    /// DaynaPort vendor command
    RetrieveStats = 0x09,
    /// Write(6), also PRINT on printer devices
    Write6 = 0x0A,
    Seek6 = 0x0B,
    /// DaynaPort vendor command
    SetIfaceMode = 0x0C,
    /// DaynaPort vendor command
    SetMcastAddr = 0x0D,
    /// DaynaPort vendor command
    EnableInterface = 0x0E,
    /// Printer only
    SynchronizeBuffer = 0x10,
    Inquiry = 0x12,
    ModeSelect6 = 0x15,
    Reserve6 = 0x16,
    Release6 = 0x17,
    ModeSense6 = 0x1A,
    /// STOP PRINT on printer devices
    StartStop = 0x1B,
    SendDiagnostic = 0x1D,
    PreventAllowMediumRemoval = 0x1E,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    Seek10 = 0x2B,
    Verify10 = 0x2F,
    SynchronizeCache10 = 0x35,
    ReadDefectData10 = 0x37,
    ReadLong10 = 0x3E,
    WriteLong10 = 0x3F,
    ReadToc = 0x43,
    ModeSelect10 = 0x55,
    Reserve10 = 0x56,
    Release10 = 0x57,
    ModeSense10 = 0x5A,
    Read16 = 0x88,
    Write16 = 0x8A,
    Verify16 = 0x8F,
    SynchronizeCache16 = 0x91,
    ReadCapacity16ReadLong16 = 0x9E,
    WriteLong16 = 0x9F,
    ReportLuns = 0xA0,
}

/// CDB length derived from the group code in the top 3 bits of the opcode
pub const fn cdb_length(opcode: u8) -> usize {
    match opcode >> 5 {
        0 => 6,
        1 | 2 => 10,
        5 => 12,
        4 => 16,
        _ => 6,
    }
}

/// A failed SCSI command, to be reported via sense data and CHECK CONDITION
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("SCSI error: sense key {sense_key:?}, ASC ${asc:02X}")]
pub struct ScsiError {
    pub sense_key: SenseKey,
    pub asc: u8,
    pub status: u8,
}

impl ScsiError {
    pub const fn new(sense_key: SenseKey, asc: u8) -> Self {
        Self {
            sense_key,
            asc,
            status: STATUS_CHECK_CONDITION,
        }
    }

    pub const fn aborted() -> Self {
        Self::new(SenseKey::AbortedCommand, ASC_NO_ADDITIONAL_SENSE_INFORMATION)
    }

    /// Packed (key << 16) | (ASC << 8) | ASCQ representation stored per device
    pub const fn status_code(&self) -> u32 {
        ((self.sense_key as u32) << 16) | ((self.asc as u32) << 8)
    }
}

pub type ScsiResult<T> = Result<T, ScsiError>;

/// Modes of a deferred shutdown scheduled by the host services device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Terminate this process
    StopProcess,
    /// Shut down the host machine
    StopHost,
    /// Reboot the host machine
    RestartHost,
}

// Big-endian CDB field accessors
pub fn be16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

pub fn be24(buf: &[u8], offset: usize) -> u32 {
    ((buf[offset] as u32) << 16) | ((buf[offset + 1] as u32) << 8) | (buf[offset + 2] as u32)
}

pub fn be32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

pub fn be64(buf: &[u8], offset: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(b)
}

pub fn put_be16(buf: &mut [u8], offset: usize, val: u16) {
    buf[offset..offset + 2].copy_from_slice(&val.to_be_bytes());
}

pub fn put_be32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_be_bytes());
}

pub fn put_be64(buf: &mut [u8], offset: usize, val: u64) {
    buf[offset..offset + 8].copy_from_slice(&val.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cdb_length_by_group() {
        assert_eq!(cdb_length(0x00), 6);
        assert_eq!(cdb_length(0x12), 6);
        assert_eq!(cdb_length(0x28), 10);
        assert_eq!(cdb_length(0x43), 10);
        assert_eq!(cdb_length(0x5A), 10);
        assert_eq!(cdb_length(0x88), 16);
        assert_eq!(cdb_length(0xA0), 12);
    }

    #[test]
    fn status_code_packing() {
        let e = ScsiError::new(SenseKey::IllegalRequest, ASC_INVALID_LUN);
        assert_eq!(e.status_code(), 0x05_25_00);
    }

    #[test]
    fn be_field_roundtrip() {
        let mut buf = [0u8; 16];
        put_be32(&mut buf, 2, 0xDEAD_BEEF);
        assert_eq!(be32(&buf, 2), 0xDEAD_BEEF);
        assert_eq!(be16(&buf, 2), 0xDEAD);
        put_be64(&mut buf, 8, 0x0123_4567_89AB_CDEF);
        assert_eq!(be64(&buf, 8), 0x0123_4567_89AB_CDEF);
    }
}
