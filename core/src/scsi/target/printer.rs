//! SCSI printer (SCLP)
//!
//! The client sends data with one or more PRINT commands and triggers
//! printing with SYNCHRONIZE BUFFER, which runs the configured print command
//! (default `lp -oraw %f`) on the spooled data. `%f` is replaced with the
//! spool file name. STOP PRINT discards the spool.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use num_traits::FromPrimitive;

use super::{DeviceState, DeviceType, INQUIRY_PRINTER, ScsiLevel, ScsiTarget};
use crate::scsi::controller::TransferCtx;
use crate::scsi::{
    ASC_INVALID_FIELD_IN_CDB, ScsiCommand, ScsiError, ScsiResult, SenseKey, be24,
};

pub struct ScsiPrinter {
    state: DeviceState,
    spool: Option<(PathBuf, File)>,
}

impl ScsiPrinter {
    pub fn new(id: u8, lun: u8) -> Self {
        let mut state = DeviceState::new(id, lun);
        state.supports_params = true;
        state.ready = true;

        Self { state, spool: None }
    }

    fn spool_path(&self) -> PathBuf {
        std::env::temp_dir().join(format!(
            "remora-print-{}-{}-{}",
            std::process::id(),
            self.state.id,
            self.state.lun
        ))
    }

    fn discard_spool(&mut self) {
        if let Some((path, file)) = self.spool.take() {
            drop(file);
            let _ = std::fs::remove_file(path);
        }
    }

    /// PRINT: receive the data to be printed through a byte-oriented
    /// transfer
    fn print(&mut self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        let length = be24(&ctx.cdb, 2) as usize;
        log::trace!("Receiving {} byte(s) to be printed", length);

        if length > ctx.buffer.len() {
            log::error!(
                "Transfer buffer overflow: buffer size is {} bytes, {} bytes expected",
                ctx.buffer.len(),
                length
            );
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                ASC_INVALID_FIELD_IN_CDB,
            ));
        }

        ctx.enter_data_out(length);
        ctx.set_byte_transfer();
        Ok(())
    }

    /// SYNCHRONIZE BUFFER: run the print command on the spooled data
    fn synchronize_buffer(&mut self) -> ScsiResult<()> {
        let Some((path, file)) = self.spool.take() else {
            log::warn!("Missing printer output file");
            return Err(ScsiError::aborted());
        };
        drop(file);

        let mut cmd = self.state.param("cmd");
        let file_position = cmd.find("%f").expect("checked in init");
        cmd.replace_range(file_position..file_position + 2, &path.to_string_lossy());

        log::debug!("Executing '{}'", cmd);

        let result = Command::new("sh").arg("-c").arg(&cmd).status();
        let _ = std::fs::remove_file(&path);

        match result {
            Ok(status) if status.success() => Ok(()),
            _ => {
                log::error!("Printing failed, the printing system might not be configured");
                Err(ScsiError::aborted())
            }
        }
    }
}

impl ScsiTarget for ScsiPrinter {
    fn state(&self) -> &DeviceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut DeviceState {
        &mut self.state
    }

    fn target_type(&self) -> DeviceType {
        DeviceType::Printer
    }

    fn image_path(&self) -> Option<&Path> {
        None
    }

    fn init(&mut self, params: &HashMap<String, String>) -> bool {
        self.state.set_params(params);

        if !self.state.param("cmd").contains("%f") {
            log::error!("Missing filename specifier %f");
            return false;
        }

        true
    }

    fn inquiry_payload(&self) -> Vec<u8> {
        self.inquiry_common(INQUIRY_PRINTER, ScsiLevel::Scsi2, false)
    }

    fn setup_mode_pages(&self, _pages: &mut BTreeMap<u8, Vec<u8>>, _page: u8, _changeable: bool) {}

    /// Appends the received PRINT data to the spool file
    fn write_bytes(&mut self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        let length = ctx.bytes_to_transfer();

        if self.spool.is_none() {
            let path = self.spool_path();
            match OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&path)
            {
                Ok(file) => {
                    log::trace!("Created printer output file '{}'", path.display());
                    self.spool = Some((path, file));
                }
                Err(e) => {
                    log::error!(
                        "Can't create printer output file '{}': {}",
                        path.display(),
                        e
                    );
                    return Err(ScsiError::aborted());
                }
            }
        }

        let (path, file) = self.spool.as_mut().unwrap();
        log::trace!(
            "Appending {} byte(s) to printer output file '{}'",
            length,
            path.display()
        );

        if file.write_all(&ctx.buffer[..length]).is_err() {
            return Err(ScsiError::aborted());
        }

        Ok(())
    }

    fn dispatch_specific(
        &mut self,
        ctx: &mut TransferCtx,
        opcode: u8,
    ) -> Option<ScsiResult<()>> {
        Some(match ScsiCommand::from_u8(opcode)? {
            ScsiCommand::TestUnitReady => {
                // The printer is always ready
                ctx.enter_status();
                Ok(())
            }
            // PRINT shares its opcode with WRITE(6)
            ScsiCommand::Write6 => self.print(ctx),
            ScsiCommand::SynchronizeBuffer => {
                self.synchronize_buffer().map(|()| ctx.enter_status())
            }
            // STOP PRINT shares its opcode with START STOP UNIT
            ScsiCommand::StartStop => {
                self.discard_spool();
                ctx.enter_status();
                Ok(())
            }
            ScsiCommand::Reserve6 | ScsiCommand::Release6 | ScsiCommand::SendDiagnostic => {
                ctx.enter_status();
                Ok(())
            }
            _ => return None,
        })
    }
}

impl Drop for ScsiPrinter {
    fn drop(&mut self) {
        self.discard_spool();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with_cdb(cdb: &[u8]) -> TransferCtx {
        let mut ctx = crate::scsi::controller::test_ctx();
        ctx.cdb.try_extend_from_slice(cdb).unwrap();
        ctx
    }

    fn printer_with_cmd(cmd: &str) -> ScsiPrinter {
        let mut printer = ScsiPrinter::new(2, 0);
        printer.state.set_default_params(HashMap::from([
            ("cmd".to_string(), cmd.to_string()),
            ("timeout".to_string(), "30".to_string()),
        ]));
        assert!(printer.init(&HashMap::new()));
        printer
    }

    #[test]
    fn init_requires_filename_specifier() {
        let mut printer = ScsiPrinter::new(2, 0);
        printer.state.set_default_params(HashMap::from([(
            "cmd".to_string(),
            "lp -oraw".to_string(),
        )]));
        assert!(!printer.init(&HashMap::new()));
    }

    #[test]
    fn print_enters_byte_transfer() {
        let mut printer = printer_with_cmd("true %f");
        let mut ctx = ctx_with_cdb(&[0x0A, 0, 0, 0x10, 0x00, 0]);

        printer.dispatch(&mut ctx).unwrap();
        assert_eq!(ctx.length, 0x1000);
    }

    #[test]
    fn synchronize_without_spool_fails() {
        let mut printer = printer_with_cmd("true %f");
        let mut ctx = ctx_with_cdb(&[0x10, 0, 0, 0, 0, 0]);

        assert!(printer.dispatch(&mut ctx).is_err());
    }

    #[test]
    fn spool_and_print_with_stub_command() {
        let mut printer = printer_with_cmd("test -s %f");

        let mut ctx = ctx_with_cdb(&[0x0A, 0, 0, 0, 16, 0]);
        printer.dispatch(&mut ctx).unwrap();

        // Simulate the byte transfer the controller performs
        ctx.buffer[..16].copy_from_slice(b"0123456789abcdef");
        ctx.offset = 16;
        ctx.length = 0;
        ctx.force_bytes_to_transfer(16);
        printer.write_bytes(&mut ctx).unwrap();

        let mut ctx = ctx_with_cdb(&[0x10, 0, 0, 0, 0, 0]);
        printer.dispatch(&mut ctx).unwrap();
    }
}
