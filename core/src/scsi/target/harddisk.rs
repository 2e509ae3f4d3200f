//! SCSI hard disk drive, fixed (SCHD) and removable (SCRM)

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Result, bail};
use num_traits::FromPrimitive;

use super::disk::{self, AccessMode, StorageDisk};
use super::{DeviceState, DeviceType, INQUIRY_DIRECT_ACCESS, ScsiLevel, ScsiTarget};
use crate::scsi::controller::TransferCtx;
use crate::scsi::{ScsiCommand, ScsiResult};

const DEFAULT_PRODUCT: &str = "SCSI HD";

/// 2 TiB is the current maximum image size
const MAX_IMAGE_SIZE: u64 = 2 << 40;

pub struct ScsiHardDisk {
    state: DeviceState,
    disk: StorageDisk,
    level: ScsiLevel,
}

impl ScsiHardDisk {
    pub const SECTOR_SIZES: &'static [u32] = &[512, 1024, 2048, 4096];

    pub fn new(id: u8, lun: u8, removable: bool, level: ScsiLevel) -> Self {
        let mut state = DeviceState::new(id, lun);
        state.protectable = true;
        state.stoppable = true;
        if removable {
            state.removable = true;
            state.lockable = true;
        }

        Self {
            state,
            disk: StorageDisk::new(Self::SECTOR_SIZES),
            level,
        }
    }
}

impl ScsiTarget for ScsiHardDisk {
    fn state(&self) -> &DeviceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut DeviceState {
        &mut self.state
    }

    fn target_type(&self) -> DeviceType {
        if self.state.removable {
            DeviceType::RemovableDisk
        } else {
            DeviceType::Harddisk
        }
    }

    fn inquiry_payload(&self) -> Vec<u8> {
        self.inquiry_common(INQUIRY_DIRECT_ACCESS, self.level, self.state.removable)
    }

    fn open_image(&mut self, path: &Path) -> Result<()> {
        let size = self.disk.open(path, !self.state.read_only)?;
        if size > MAX_IMAGE_SIZE {
            self.disk.close();
            bail!("File size must not exceed 2 TiB");
        }

        // Default product name reflects the drive capacity
        if !self.state.removable {
            let capacity = self.disk.capacity();
            let (amount, unit) = if capacity >= 1_000_000 {
                (capacity / 1_000_000, "MB")
            } else {
                (capacity / 1_000, "KB")
            };
            self.state
                .set_product(&format!("{} {} {}", DEFAULT_PRODUCT, amount, unit), false)?;
        }

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
        self.state.removable && self.disk.medium_changed.get_clear()
    }

    fn set_medium_changed(&mut self) {
        if self.state.removable {
            self.disk.medium_changed.set();
        }
    }

    fn flush_cache(&mut self) {
        self.disk.flush();
    }

    fn eject(&mut self, force: bool) -> bool {
        let ejected = self.state.eject(force);
        if ejected {
            self.disk.flush();
            self.disk.close();
        }
        ejected
    }

    fn xfer_in(&mut self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        disk::xfer_in(&mut self.disk, ctx)
    }

    fn xfer_out(&mut self, ctx: &mut TransferCtx, cont: bool) -> ScsiResult<()> {
        match ScsiCommand::from_u8(ctx.opcode()) {
            Some(ScsiCommand::ModeSelect6 | ScsiCommand::ModeSelect10) => {
                let len = ctx.offset;
                let (cdb, data) = ctx.cdb_and_buffer(len);
                self.mode_select(&cdb, data)
            }
            _ => disk::xfer_out(&self.state, &mut self.disk, ctx, cont),
        }
    }

    fn mode_select(&mut self, cdb: &[u8], data: &[u8]) -> ScsiResult<()> {
        disk::mode_select(cdb, data, self.disk.sector_size())
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

        if page == 0x30 || page == 0x3F {
            disk::add_apple_vendor_page(pages, changeable);
        }
    }

    fn dispatch_specific(
        &mut self,
        ctx: &mut TransferCtx,
        opcode: u8,
    ) -> Option<ScsiResult<()>> {
        let Self { state, disk, .. } = self;

        Some(match ScsiCommand::from_u8(opcode)? {
            ScsiCommand::Rezero | ScsiCommand::ReassignBlocks => {
                state.check_ready().map(|()| ctx.enter_status())
            }
            ScsiCommand::FormatUnit => disk::format_unit(state, ctx),
            ScsiCommand::Read6 => disk::read_cmd(state, disk, ctx, AccessMode::Rw6),
            ScsiCommand::Read10 => disk::read_cmd(state, disk, ctx, AccessMode::Rw10),
            ScsiCommand::Read16 => disk::read_cmd(state, disk, ctx, AccessMode::Rw16),
            ScsiCommand::Write6 => disk::write_cmd(state, disk, ctx, AccessMode::Rw6),
            ScsiCommand::Write10 => disk::write_cmd(state, disk, ctx, AccessMode::Rw10),
            ScsiCommand::Write16 => disk::write_cmd(state, disk, ctx, AccessMode::Rw16),
            ScsiCommand::Verify10 => disk::verify_cmd(state, disk, ctx, AccessMode::Rw10),
            ScsiCommand::Verify16 => disk::verify_cmd(state, disk, ctx, AccessMode::Rw16),
            ScsiCommand::Seek6 => disk::seek_cmd(state, disk, ctx, AccessMode::Seek6),
            ScsiCommand::Seek10 => disk::seek_cmd(state, disk, ctx, AccessMode::Seek10),
            ScsiCommand::StartStop => disk::start_stop_unit(state, disk, ctx),
            ScsiCommand::PreventAllowMediumRemoval => disk::prevent_allow_removal(state, ctx),
            ScsiCommand::SendDiagnostic => disk::send_diagnostic(ctx),
            ScsiCommand::ReadCapacity10 => disk::read_capacity10(state, disk, ctx),
            ScsiCommand::ReadLong10 | ScsiCommand::WriteLong10 => {
                disk::read_write_long(disk, ctx, AccessMode::Rw10)
            }
            ScsiCommand::WriteLong16 => disk::read_write_long(disk, ctx, AccessMode::Rw16),
            ScsiCommand::ReadCapacity16ReadLong16 => {
                // The service action selects the actual command
                match ctx.cdb[1] & 0x1F {
                    0x10 => disk::read_capacity16(state, disk, ctx),
                    0x11 => disk::read_write_long(disk, ctx, AccessMode::Rw16),
                    _ => Err(crate::scsi::ScsiError::new(
                        crate::scsi::SenseKey::IllegalRequest,
                        crate::scsi::ASC_INVALID_FIELD_IN_CDB,
                    )),
                }
            }
            ScsiCommand::SynchronizeCache10 | ScsiCommand::SynchronizeCache16 => {
                disk.flush();
                ctx.enter_status();
                Ok(())
            }
            ScsiCommand::ReadDefectData10 => disk::read_defect_data10(ctx),
            // Only used in multi-initiator environments, always succeed
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn hd_with_image(blocks: u64) -> (tempfile::TempDir, ScsiHardDisk) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.hds");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![0u8; (blocks * 512) as usize]).unwrap();
        drop(f);

        let mut hd = ScsiHardDisk::new(0, 0, false, ScsiLevel::Scsi2);
        hd.open_image(&path).unwrap();
        (dir, hd)
    }

    fn ctx_with_cdb(cdb: &[u8]) -> TransferCtx {
        let mut ctx = crate::scsi::controller::test_ctx();
        ctx.cdb.try_extend_from_slice(cdb).unwrap();
        ctx
    }

    #[test]
    fn open_sets_capacity_product() {
        let (_dir, hd) = hd_with_image(4096);
        assert_eq!(hd.state().product(), "SCSI HD 2 MB");
        assert!(hd.state().ready);
        assert_eq!(hd.target_type(), DeviceType::Harddisk);
    }

    #[test]
    fn read_capacity_reports_last_block() {
        let (_dir, mut hd) = hd_with_image(16);
        let mut ctx = ctx_with_cdb(&[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0]);

        hd.dispatch(&mut ctx).unwrap();
        assert_eq!(crate::scsi::be32(&ctx.buffer, 0), 15);
        assert_eq!(crate::scsi::be32(&ctx.buffer, 4), 512);
    }

    #[test]
    fn read6_prepares_data_in() {
        let (_dir, mut hd) = hd_with_image(16);
        // READ(6), block 1, 2 blocks
        let mut ctx = ctx_with_cdb(&[0x08, 0x00, 0x00, 0x01, 0x02, 0x00]);

        hd.dispatch(&mut ctx).unwrap();
        assert_eq!(ctx.length, 512);
        assert_eq!(ctx.blocks, 2);
        assert_eq!(ctx.next, 2);
    }

    #[test]
    fn mode_sense_includes_block_descriptor() {
        let (_dir, mut hd) = hd_with_image(16);
        // MODE SENSE(6), all pages, DBD=0
        let mut ctx = ctx_with_cdb(&[0x1A, 0x00, 0x3F, 0x00, 0xFF, 0x00]);

        hd.dispatch(&mut ctx).unwrap();
        assert_eq!(ctx.buffer[3], 0x08);
        assert_eq!(crate::scsi::be32(&ctx.buffer, 4), 16);
        assert_eq!(crate::scsi::be32(&ctx.buffer, 8), 512);
    }

    #[test]
    fn removable_hd_reports_removable_inquiry() {
        let hd = ScsiHardDisk::new(0, 0, true, ScsiLevel::Scsi2);
        let payload = hd.inquiry_payload();
        assert_eq!(payload[0], INQUIRY_DIRECT_ACCESS);
        assert_eq!(payload[1], 0x80);
        assert_eq!(hd.target_type(), DeviceType::RemovableDisk);
    }
}
