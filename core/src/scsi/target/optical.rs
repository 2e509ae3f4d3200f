//! SCSI magneto-optical drive (SCMO)

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use num_traits::FromPrimitive;

use super::disk::{self, AccessMode, StorageDisk};
use super::{DeviceState, DeviceType, INQUIRY_OPTICAL_MEMORY, ScsiLevel, ScsiTarget};
use crate::scsi::controller::TransferCtx;
use crate::scsi::{ScsiCommand, ScsiResult, put_be16, put_be32};

/// Well-defined geometries (sector size, block count) for the common fixed
/// MO media capacities
const GEOMETRIES: &[(u64, (u32, u64))] = &[
    // 128 MB
    (512 * 248_826, (512, 248_826)),
    // 230 MB
    (512 * 446_325, (512, 446_325)),
    // 540 MB
    (512 * 1_041_500, (512, 1_041_500)),
    // 640 MB
    (2048 * 310_352, (2048, 310_352)),
];

pub struct ScsiMoDisk {
    state: DeviceState,
    disk: StorageDisk,
}

impl ScsiMoDisk {
    pub const SECTOR_SIZES: &'static [u32] = &[512, 1024, 2048, 4096];

    pub fn new(id: u8, lun: u8) -> Self {
        let mut state = DeviceState::new(id, lun);
        state.protectable = true;
        state.stoppable = true;
        state.removable = true;
        state.lockable = true;

        Self {
            state,
            disk: StorageDisk::new(Self::SECTOR_SIZES),
        }
    }

    fn geometry_for_capacity(capacity: u64) -> Option<(u32, u64)> {
        GEOMETRIES
            .iter()
            .find(|(size, _)| *size == capacity)
            .map(|(_, geometry)| *geometry)
    }

    /// Option page 6; update blocks are not reported
    fn add_option_page(pages: &mut BTreeMap<u8, Vec<u8>>) {
        pages.insert(6, vec![0; 4]);
    }

    /// Vendor page 0x20 with the user/spare band layout of the common
    /// fixed media sizes
    fn add_vendor_page(&self, pages: &mut BTreeMap<u8, Vec<u8>>, changeable: bool) {
        let mut buf = vec![0u8; 12];

        if changeable {
            pages.insert(0x20, buf);
            return;
        }

        if self.state.ready {
            let blocks = self.disk.blocks();
            let (spare, bands) = match (self.disk.sector_size(), blocks) {
                (512, 248_826) => (1024u16, 1u16),
                (512, 446_325) => (1025, 10),
                (512, 1_041_500) => (2250, 18),
                (2048, 310_352) => (2244, 11),
                (2048, 605_846) => (4437, 18),
                _ => (0, 0),
            };

            put_be32(&mut buf, 4, blocks as u32);
            put_be16(&mut buf, 8, spare);
            put_be16(&mut buf, 10, bands);
        }

        pages.insert(0x20, buf);
    }
}

impl ScsiTarget for ScsiMoDisk {
    fn state(&self) -> &DeviceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut DeviceState {
        &mut self.state
    }

    fn target_type(&self) -> DeviceType {
        DeviceType::Optical
    }

    fn inquiry_payload(&self) -> Vec<u8> {
        self.inquiry_common(INQUIRY_OPTICAL_MEMORY, ScsiLevel::Scsi2, true)
    }

    fn open_image(&mut self, path: &Path) -> Result<()> {
        let size = self.disk.open(path, !self.state.read_only)?;

        // Some capacities have hard-coded, well-defined geometries
        if let Some((sector_size, blocks)) = Self::geometry_for_capacity(size) {
            self.disk.set_sector_size_bytes(sector_size);
            self.disk.set_blocks(blocks);
        }

        self.state.ready = true;
        self.state.stopped = false;
        self.state.removed = false;
        self.state.locked = false;

        // Report the media change on the next access
        self.state.attn = true;

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

    fn flush_cache(&mut self) {
        self.disk.flush();
    }

    fn set_medium_changed(&mut self) {
        self.disk.medium_changed.set();
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

        if page == 0x06 || page == 0x3F {
            Self::add_option_page(pages);
        }
        if page == 0x20 || page == 0x3F {
            self.add_vendor_page(pages, changeable);
        }
    }

    fn dispatch_specific(
        &mut self,
        ctx: &mut TransferCtx,
        opcode: u8,
    ) -> Option<ScsiResult<()>> {
        let Self { state, disk } = self;

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
            ScsiCommand::ReadCapacity16ReadLong16 => match ctx.cdb[1] & 0x1F {
                0x10 => disk::read_capacity16(state, disk, ctx),
                0x11 => disk::read_write_long(disk, ctx, AccessMode::Rw16),
                _ => Err(crate::scsi::ScsiError::new(
                    crate::scsi::SenseKey::IllegalRequest,
                    crate::scsi::ASC_INVALID_FIELD_IN_CDB,
                )),
            },
            ScsiCommand::SynchronizeCache10 | ScsiCommand::SynchronizeCache16 => {
                disk.flush();
                ctx.enter_status();
                Ok(())
            }
            ScsiCommand::ReadDefectData10 => disk::read_defect_data10(ctx),
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

    #[test]
    fn known_capacity_selects_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.mos");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&[0u8]).unwrap();
        f.set_len(512 * 248_826).unwrap();
        drop(f);

        let mut mo = ScsiMoDisk::new(0, 0);
        mo.open_image(&path).unwrap();

        assert_eq!(mo.disk.sector_size(), 512);
        assert_eq!(mo.disk.blocks(), 248_826);
        assert!(mo.state.attn);
    }

    #[test]
    fn unknown_capacity_falls_back_to_sector_shift() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.mos");
        std::fs::File::create(&path)
            .unwrap()
            .set_len(512 * 1000)
            .unwrap();

        let mut mo = ScsiMoDisk::new(0, 0);
        mo.open_image(&path).unwrap();

        assert_eq!(mo.disk.sector_size(), 512);
        assert_eq!(mo.disk.blocks(), 1000);
    }

    #[test]
    fn vendor_page_reports_band_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.mos");
        std::fs::File::create(&path)
            .unwrap()
            .set_len(512 * 248_826)
            .unwrap();

        let mut mo = ScsiMoDisk::new(0, 0);
        mo.open_image(&path).unwrap();

        let mut pages = BTreeMap::new();
        mo.setup_mode_pages(&mut pages, 0x20, false);
        let page = &pages[&0x20];
        assert_eq!(crate::scsi::be32(page, 4), 248_826);
        assert_eq!(crate::scsi::be16(page, 8), 1024);
        assert_eq!(crate::scsi::be16(page, 10), 1);
    }
}
