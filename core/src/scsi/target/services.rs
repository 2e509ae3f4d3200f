//! Host services device (SCHS): realtime clock and shutdown support
//!
//! 1. Vendor-specific mode page 0x20 returns the current date and time.
//! 2. START/STOP UNIT shuts down the daemon or shuts down/reboots the host:
//!    - !start && !load: terminate the daemon process
//!    - !start && load: shut down the host
//!    - start && load: reboot the host

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{Datelike, Local, Timelike};
use num_traits::FromPrimitive;

use super::{DeviceState, DeviceType, INQUIRY_PROCESSOR, ScsiLevel, ScsiTarget};
use crate::scsi::controller::TransferCtx;
use crate::scsi::{
    ASC_INVALID_FIELD_IN_CDB, ScsiCommand, ScsiError, ScsiResult, SenseKey, ShutdownMode, be16,
    put_be16,
};

pub struct HostServices {
    state: DeviceState,
}

impl HostServices {
    pub fn new(id: u8, lun: u8) -> Self {
        let mut state = DeviceState::new(id, lun);
        state.ready = true;

        Self { state }
    }

    fn start_stop_unit(&self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        let start = ctx.cdb[4] & 0x01 != 0;
        let load = ctx.cdb[4] & 0x02 != 0;

        let mode = match (start, load) {
            (false, false) => ShutdownMode::StopProcess,
            (false, true) => ShutdownMode::StopHost,
            (true, true) => ShutdownMode::RestartHost,
            (true, false) => {
                return Err(ScsiError::new(
                    SenseKey::IllegalRequest,
                    ASC_INVALID_FIELD_IN_CDB,
                ));
            }
        };

        // The shutdown is deferred until the bus is free again
        ctx.schedule_shutdown(mode);
        ctx.enter_status();
        Ok(())
    }

    fn add_realtime_clock_page(pages: &mut BTreeMap<u8, Vec<u8>>, changeable: bool) {
        if changeable {
            return;
        }

        let now = Local::now();

        let mut buf = vec![0u8; 10];
        // Page version 1.0
        buf[2] = 0x01;
        buf[3] = 0x00;
        buf[4] = (now.year() - 1900) as u8;
        buf[5] = now.month0() as u8;
        buf[6] = now.day() as u8;
        buf[7] = now.hour() as u8;
        buf[8] = now.minute() as u8;
        // Ignore a leap second for simplicity
        buf[9] = now.second().min(59) as u8;

        pages.insert(0x20, buf);
    }
}

impl ScsiTarget for HostServices {
    fn state(&self) -> &DeviceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut DeviceState {
        &mut self.state
    }

    fn target_type(&self) -> DeviceType {
        DeviceType::HostServices
    }

    fn image_path(&self) -> Option<&Path> {
        None
    }

    fn supports_file(&self) -> bool {
        false
    }

    fn inquiry_payload(&self) -> Vec<u8> {
        self.inquiry_common(INQUIRY_PROCESSOR, ScsiLevel::Spc3, false)
    }

    fn setup_mode_pages(&self, pages: &mut BTreeMap<u8, Vec<u8>>, page: u8, changeable: bool) {
        if page == 0x20 || page == 0x3F {
            Self::add_realtime_clock_page(pages, changeable);
        }
    }

    fn mode_sense6(&mut self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        // Block descriptors cannot be returned
        if ctx.cdb[1] & 0x08 == 0 {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                ASC_INVALID_FIELD_IN_CDB,
            ));
        }

        let page = ctx.cdb[2] & 0x3F;
        let changeable = ctx.cdb[2] & 0xC0 == 0x40;
        let pages = self.collect_mode_pages(page, changeable)?;

        let length = (ctx.cdb[4] as usize).min(ctx.buffer.len());
        ctx.buffer[..length].fill(0);

        let size = 4 + pages.len();
        if size > 255 {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                ASC_INVALID_FIELD_IN_CDB,
            ));
        }

        let copied = pages.len().min(length.saturating_sub(4));
        ctx.buffer[4..4 + copied].copy_from_slice(&pages[..copied]);
        ctx.buffer[0] = size as u8;

        ctx.enter_data_in(size.min(length));
        Ok(())
    }

    fn mode_sense10(&mut self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        if ctx.cdb[1] & 0x08 == 0 {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                ASC_INVALID_FIELD_IN_CDB,
            ));
        }

        let page = ctx.cdb[2] & 0x3F;
        let changeable = ctx.cdb[2] & 0xC0 == 0x40;
        let pages = self.collect_mode_pages(page, changeable)?;

        let length = (be16(&ctx.cdb, 7) as usize).min(ctx.buffer.len());
        ctx.buffer[..length].fill(0);

        let size = 8 + pages.len();
        if size > 65535 {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                ASC_INVALID_FIELD_IN_CDB,
            ));
        }

        let copied = pages.len().min(length.saturating_sub(8));
        ctx.buffer[8..8 + copied].copy_from_slice(&pages[..copied]);
        put_be16(&mut ctx.buffer, 0, size as u16);

        ctx.enter_data_in(size.min(length));
        Ok(())
    }

    fn dispatch_specific(
        &mut self,
        ctx: &mut TransferCtx,
        opcode: u8,
    ) -> Option<ScsiResult<()>> {
        Some(match ScsiCommand::from_u8(opcode)? {
            ScsiCommand::TestUnitReady => {
                // Always successful
                ctx.enter_status();
                Ok(())
            }
            ScsiCommand::StartStop => self.start_stop_unit(ctx),
            _ => return None,
        })
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

    #[test]
    fn clock_page_has_version_and_plausible_date() {
        let mut pages = BTreeMap::new();
        HostServices::add_realtime_clock_page(&mut pages, false);

        let page = &pages[&0x20];
        assert_eq!(page.len(), 10);
        assert_eq!(page[2], 0x01);
        assert_eq!(page[3], 0x00);
        // Years since 1900, month 0..11, day 1..31
        assert!(page[4] >= 120);
        assert!(page[5] <= 11);
        assert!((1..=31).contains(&page[6]));
    }

    #[test]
    fn shutdown_mode_decoding() {
        let mut services = HostServices::new(7, 0);

        for (cdb4, expected) in [
            (0x00u8, ShutdownMode::StopProcess),
            (0x02, ShutdownMode::StopHost),
            (0x03, ShutdownMode::RestartHost),
        ] {
            let mut ctx = ctx_with_cdb(&[0x1B, 0, 0, 0, cdb4, 0]);
            services.dispatch(&mut ctx).unwrap();
            assert_eq!(ctx.take_shutdown_for_test(), Some(expected));
        }

        // start without load is invalid
        let mut ctx = ctx_with_cdb(&[0x1B, 0, 0, 0, 0x01, 0]);
        assert!(services.dispatch(&mut ctx).is_err());
    }

    #[test]
    fn mode_sense_requires_dbd() {
        let mut services = HostServices::new(7, 0);

        let mut ctx = ctx_with_cdb(&[0x1A, 0x00, 0x20, 0, 0xFF, 0]);
        assert!(services.dispatch(&mut ctx).is_err());

        let mut ctx = ctx_with_cdb(&[0x1A, 0x08, 0x20, 0, 0xFF, 0]);
        services.dispatch(&mut ctx).unwrap();
        // Header + page header + 8 byte clock payload
        assert_eq!(ctx.length, 4 + 10);
        assert_eq!(ctx.buffer[4] & 0x3F, 0x20);
    }
}
