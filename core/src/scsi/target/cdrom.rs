//! SCSI CD-ROM drive (SCCD)

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use num_traits::FromPrimitive;

use super::disk::{self, AccessMode, StorageDisk};
use super::{DeviceState, DeviceType, INQUIRY_CDROM, ScsiLevel, ScsiTarget};
use crate::scsi::controller::TransferCtx;
use crate::scsi::{
    ASC_INVALID_FIELD_IN_CDB, ScsiCommand, ScsiError, ScsiResult, SenseKey, be16,
};

const TRACK_LEADOUT: u8 = 0xAA;

pub struct ScsiCdRom {
    state: DeviceState,
    disk: StorageDisk,
}

impl ScsiCdRom {
    pub const SECTOR_SIZES: &'static [u32] = &[512, 2048];

    pub fn new(id: u8, lun: u8) -> Self {
        let mut state = DeviceState::new(id, lun);
        state.read_only = true;
        state.stoppable = true;
        state.removable = true;
        state.lockable = true;

        Self {
            state,
            disk: StorageDisk::new(Self::SECTOR_SIZES),
        }
    }

    /// Single-track TOC covering the whole image
    fn read_toc(&mut self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        self.state.check_ready()?;

        let format = ctx.cdb[9] >> 6;
        let track = ctx.cdb[6];
        let allocation_length = be16(&ctx.cdb, 7) as usize;

        let result: Vec<u8> = match format {
            0 => match track {
                0 | 1 => {
                    let mut toc = vec![0u8; 0x14];
                    toc[1] = 0x12;
                    // First and last track
                    toc[2] = 1;
                    toc[3] = 1;
                    // Track descriptor for track 1: digital track starting
                    // at block 0
                    toc[5] = 0x14;
                    toc[6] = 1;
                    // Track descriptor for the lead-out
                    toc[13] = 0x14;
                    toc[14] = TRACK_LEADOUT;
                    toc
                }
                TRACK_LEADOUT => {
                    let mut toc = vec![0u8; 12];
                    toc[1] = 0x0A;
                    toc[2] = 1;
                    toc[3] = 1;
                    toc[5] = 0x14;
                    toc[6] = TRACK_LEADOUT;
                    toc
                }
                _ => {
                    return Err(ScsiError::new(
                        SenseKey::IllegalRequest,
                        ASC_INVALID_FIELD_IN_CDB,
                    ));
                }
            },
            1 => {
                // Session TOC
                let mut toc = vec![0u8; 12];
                toc[1] = 0x0A;
                toc[2] = 1;
                toc[3] = 1;
                toc[5] = 0x14;
                toc[6] = 1;
                toc
            }
            _ => {
                log::error!("Unknown READ TOC format {}", format);
                return Err(ScsiError::new(
                    SenseKey::IllegalRequest,
                    ASC_INVALID_FIELD_IN_CDB,
                ));
            }
        };

        let len = result.len().min(allocation_length);
        ctx.buffer[..len].copy_from_slice(&result[..len]);
        ctx.enter_data_in(len);
        Ok(())
    }
}

impl ScsiTarget for ScsiCdRom {
    fn state(&self) -> &DeviceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut DeviceState {
        &mut self.state
    }

    fn target_type(&self) -> DeviceType {
        DeviceType::Cdrom
    }

    fn inquiry_payload(&self) -> Vec<u8> {
        self.inquiry_common(INQUIRY_CDROM, ScsiLevel::Scsi2, true)
    }

    fn open_image(&mut self, path: &Path) -> Result<()> {
        // CD-ROM media defaults to 2048-byte sectors
        if self.disk.configured_sector_size() == 0 {
            self.disk.set_configured_sector_size(2048);
        }

        self.disk.open(path, false)?;

        self.state.ready = true;
        self.state.stopped = false;
        self.state.removed = false;
        self.state.locked = false;

        Ok(())
    }

    fn image_path(&self) -> Option<&Path> {
        self.disk.path()
    }

    fn sector_size_configurable(&self) -> bool {
        self.disk.sector_size_configurable()
    }

    fn set_configured_sector_size(&mut self, size: u32) -> bool {
        self.disk.set_configured_sector_size(size)
    }

    fn take_medium_changed(&mut self) -> bool {
        self.disk.medium_changed.get_clear()
    }

    fn set_medium_changed(&mut self) {
        self.disk.medium_changed.set();
    }

    fn eject(&mut self, force: bool) -> bool {
        let ejected = self.state.eject(force);
        if ejected {
            self.disk.close();
        }
        ejected
    }

    fn xfer_in(&mut self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        disk::xfer_in(&mut self.disk, ctx)
    }

    fn mode_sense6(&mut self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        let page = ctx.cdb[2] & 0x3F;
        let changeable = ctx.cdb[2] & 0xC0 == 0x40;
        let pages = self.collect_mode_pages(page, changeable)?;
        disk::mode_sense6(&self.state, &self.disk, ctx, &pages)
    }

    fn mode_sense10(&mut self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        let page = ctx.cdb[2] & 0x3F;
        let changeable = ctx.cdb[2] & 0xC0 == 0x40;
        let pages = self.collect_mode_pages(page, changeable)?;
        disk::mode_sense10(&self.state, &self.disk, ctx, &pages)
    }

    fn setup_mode_pages(&self, pages: &mut BTreeMap<u8, Vec<u8>>, page: u8, changeable: bool) {
        disk::setup_disk_mode_pages(&self.state, &self.disk, pages, page, changeable);

        // Needed by the stock Apple CD-ROM driver
        if page == 0x30 || page == 0x3F {
            disk::add_apple_vendor_page(pages, changeable);
        }
    }

    fn dispatch_specific(
        &mut self,
        ctx: &mut TransferCtx,
        opcode: u8,
    ) -> Option<ScsiResult<()>> {
        match ScsiCommand::from_u8(opcode)? {
            ScsiCommand::ReadToc => Some(self.read_toc(ctx)),
            cmd => {
                let Self { state, disk } = self;
                Some(match cmd {
                    ScsiCommand::Read6 => disk::read_cmd(state, disk, ctx, AccessMode::Rw6),
                    ScsiCommand::Read10 => disk::read_cmd(state, disk, ctx, AccessMode::Rw10),
                    ScsiCommand::Read16 => disk::read_cmd(state, disk, ctx, AccessMode::Rw16),
                    ScsiCommand::Seek6 => disk::seek_cmd(state, disk, ctx, AccessMode::Seek6),
                    ScsiCommand::Seek10 => disk::seek_cmd(state, disk, ctx, AccessMode::Seek10),
                    ScsiCommand::StartStop => disk::start_stop_unit(state, disk, ctx),
                    ScsiCommand::PreventAllowMediumRemoval => {
                        disk::prevent_allow_removal(state, ctx)
                    }
                    ScsiCommand::SendDiagnostic => disk::send_diagnostic(ctx),
                    ScsiCommand::ReadCapacity10 => disk::read_capacity10(state, disk, ctx),
                    ScsiCommand::ReadCapacity16ReadLong16 => match ctx.cdb[1] & 0x1F {
                        0x10 => disk::read_capacity16(state, disk, ctx),
                        _ => Err(ScsiError::new(
                            SenseKey::IllegalRequest,
                            ASC_INVALID_FIELD_IN_CDB,
                        )),
                    },
                    ScsiCommand::Reserve6
                    | ScsiCommand::Release6
                    | ScsiCommand::Reserve10
                    | ScsiCommand::Release10 => {
                        ctx.enter_status();
                        Ok(())
                    }
                    _ => return None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cd_with_image() -> (tempfile::TempDir, ScsiCdRom) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.iso");
        std::fs::File::create(&path)
            .unwrap()
            .set_len(2048 * 16)
            .unwrap();

        let mut cd = ScsiCdRom::new(0, 0);
        cd.open_image(&path).unwrap();
        (dir, cd)
    }

    fn ctx_with_cdb(cdb: &[u8]) -> TransferCtx {
        let mut ctx = crate::scsi::controller::test_ctx();
        ctx.cdb.try_extend_from_slice(cdb).unwrap();
        ctx
    }

    #[test]
    fn defaults_to_2048_byte_sectors() {
        let (_dir, cd) = cd_with_image();
        assert_eq!(cd.disk.sector_size(), 2048);
        assert_eq!(cd.disk.blocks(), 16);
    }

    #[test]
    fn toc_contains_leadout() {
        let (_dir, mut cd) = cd_with_image();
        let mut ctx = ctx_with_cdb(&[0x43, 0, 0, 0, 0, 0, 0, 0x00, 0x14, 0]);

        cd.dispatch(&mut ctx).unwrap();
        assert_eq!(ctx.buffer[2], 1);
        assert_eq!(ctx.buffer[14], TRACK_LEADOUT);
    }

    #[test]
    fn write_is_not_supported() {
        let (_dir, mut cd) = cd_with_image();
        // WRITE(10)
        let mut ctx = ctx_with_cdb(&[0x2A, 0, 0, 0, 0, 0, 0, 0, 1, 0]);

        let e = cd.dispatch(&mut ctx).unwrap_err();
        assert_eq!(e.sense_key, SenseKey::IllegalRequest);
    }

    #[test]
    fn toc_without_medium_reports_not_ready() {
        let mut cd = ScsiCdRom::new(0, 0);
        let mut ctx = ctx_with_cdb(&[0x43, 0, 0, 0, 0, 0, 0, 0x00, 0x14, 0]);

        let e = cd.dispatch(&mut ctx).unwrap_err();
        assert_eq!(e.sense_key, SenseKey::NotReady);
    }
}
