//! Shared storage core for the disk-like targets (HD, removable HD, MO,
//! CD-ROM): image backend, block geometry, block commands and mode pages.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::scsi::controller::TransferCtx;
use crate::scsi::target::DeviceState;
use crate::scsi::{
    ASC_INVALID_FIELD_IN_CDB, ASC_INVALID_FIELD_IN_PARAMETER_LIST, ASC_LBA_OUT_OF_RANGE,
    ASC_LOAD_OR_EJECT_FAILED, ASC_MEDIUM_NOT_PRESENT, ASC_READ_FAULT, ASC_WRITE_FAULT,
    ASC_WRITE_PROTECTED, ScsiError, ScsiResult, SenseKey, be16, be24, be32, be64, put_be16,
    put_be32, put_be64,
};
use crate::types::LatchingEvent;

/// Byte-level access to a backing image file
pub trait DiskImage: Send {
    fn byte_len(&self) -> u64;
    fn read_bytes(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// Image backend using positioned file I/O with an exclusive lock held for
/// the lifetime of the image
pub struct FileDiskImage {
    file: std::fs::File,
    len: u64,
}

impl FileDiskImage {
    pub fn open(filename: &Path, writable: bool) -> Result<Self> {
        use fs2::FileExt;

        if !filename.exists() {
            bail!("File not found: {}", filename.display());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(filename)
            .with_context(|| format!("Failed to open {}", filename.display()))?;

        file.try_lock_exclusive()
            .with_context(|| format!("Failed to lock {}", filename.display()))?;

        let len = file.metadata()?.len();

        Ok(Self { file, len })
    }
}

impl DiskImage for FileDiskImage {
    fn byte_len(&self) -> u64 {
        self.len
    }

    fn read_bytes(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Block addressing flavor of a READ/WRITE/VERIFY/SEEK command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Rw6,
    Rw10,
    Rw16,
    Seek6,
    Seek10,
}

/// Storage state embedded by every disk-like target
pub struct StorageDisk {
    image: Option<Box<dyn DiskImage>>,
    path: Option<PathBuf>,

    /// Sector size shift count (9=512, 10=1024, 11=2048, 12=4096)
    size_shift: u32,
    blocks: u64,

    /// Supported configurable sector sizes, empty if not configurable
    sector_sizes: &'static [u32],
    configured_sector_size: u32,

    pub medium_changed: LatchingEvent,
}

impl StorageDisk {
    pub fn new(sector_sizes: &'static [u32]) -> Self {
        Self {
            image: None,
            path: None,
            size_shift: 9,
            blocks: 0,
            sector_sizes,
            configured_sector_size: 0,
            medium_changed: LatchingEvent::default(),
        }
    }

    pub fn sector_size(&self) -> u32 {
        1 << self.size_shift
    }

    pub fn size_shift(&self) -> u32 {
        self.size_shift
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn set_blocks(&mut self, blocks: u64) {
        self.blocks = blocks;
    }

    pub fn capacity(&self) -> u64 {
        self.blocks << self.size_shift
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }

    pub fn sector_size_configurable(&self) -> bool {
        !self.sector_sizes.is_empty()
    }

    pub fn configured_sector_size(&self) -> u32 {
        self.configured_sector_size
    }

    pub fn set_configured_sector_size(&mut self, size: u32) -> bool {
        if !self.sector_sizes.contains(&size) {
            return false;
        }
        self.configured_sector_size = size;
        true
    }

    pub fn set_sector_size_bytes(&mut self, size: u32) {
        self.size_shift = match size {
            512 => 9,
            1024 => 10,
            2048 => 11,
            4096 => 12,
            _ => unreachable!("unsupported sector size {}", size),
        };
    }

    /// Opens the backing file with the configured (or default 512-byte)
    /// sector size and derives the block count from the file size.
    pub fn open(&mut self, path: &Path, writable: bool) -> Result<u64> {
        let image = FileDiskImage::open(path, writable)?;
        let size = image.byte_len();

        let sector_size = if self.configured_sector_size != 0 {
            self.configured_sector_size
        } else {
            512
        };
        self.set_sector_size_bytes(sector_size);
        self.blocks = size >> self.size_shift;

        self.image = Some(Box::new(image));
        self.path = Some(path.to_path_buf());

        Ok(size)
    }

    /// Drops the medium, returning the released image path
    pub fn close(&mut self) -> Option<PathBuf> {
        self.image = None;
        self.blocks = 0;
        self.path.take()
    }

    pub fn flush(&mut self) {
        if let Some(image) = self.image.as_mut() {
            if let Err(e) = image.flush() {
                log::error!("Flushing image failed: {:#}", e);
            }
        }
    }

    // --- Block I/O -------------------------------------------------------

    pub fn read_block(&mut self, buf: &mut [u8], block: u64) -> ScsiResult<usize> {
        if block >= self.blocks {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                ASC_INVALID_FIELD_IN_CDB,
            ));
        }

        let size = self.sector_size() as usize;
        let offset = block << self.size_shift;
        let Some(image) = self.image.as_mut() else {
            return Err(ScsiError::new(SenseKey::NotReady, ASC_MEDIUM_NOT_PRESENT));
        };

        // An image may not be an exact multiple of the sector size; pad the
        // final block
        let available = (image.byte_len().saturating_sub(offset) as usize).min(size);
        if image.read_bytes(offset, &mut buf[..available]).is_err() {
            return Err(ScsiError::new(SenseKey::MediumError, ASC_READ_FAULT));
        }
        buf[available..size].fill(0);

        Ok(size)
    }

    pub fn write_block(&mut self, state: &DeviceState, buf: &[u8], block: u64) -> ScsiResult<()> {
        if !state.ready {
            return Err(ScsiError::new(SenseKey::NotReady, ASC_MEDIUM_NOT_PRESENT));
        }

        if block >= self.blocks {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                ASC_LBA_OUT_OF_RANGE,
            ));
        }

        if state.is_protected() || state.read_only {
            return Err(ScsiError::new(SenseKey::DataProtect, ASC_WRITE_PROTECTED));
        }

        let size = self.sector_size() as usize;
        let offset = block << self.size_shift;
        let Some(image) = self.image.as_mut() else {
            return Err(ScsiError::new(SenseKey::NotReady, ASC_MEDIUM_NOT_PRESENT));
        };

        let writable = (image.byte_len().saturating_sub(offset) as usize).min(size);
        if image.write_bytes(offset, &buf[..writable]).is_err() {
            return Err(ScsiError::new(SenseKey::MediumError, ASC_WRITE_FAULT));
        }

        Ok(())
    }

    pub fn write_check(&mut self, state: &DeviceState, block: u64) -> ScsiResult<usize> {
        if block >= self.blocks {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                ASC_INVALID_FIELD_IN_CDB,
            ));
        }

        if state.is_protected() || state.read_only {
            return Err(ScsiError::new(SenseKey::DataProtect, ASC_WRITE_PROTECTED));
        }

        Ok(self.sector_size() as usize)
    }
}

// --- Block command helpers, shared by the disk-like targets ---------------

/// Checks and extracts (start block, block count) for a
/// READ/WRITE/VERIFY/SEEK command
pub fn check_start_and_count(
    cdb: &[u8],
    blocks: u64,
    mode: AccessMode,
) -> ScsiResult<Option<(u64, u32)>> {
    let (start, count) = match mode {
        AccessMode::Rw6 | AccessMode::Seek6 => {
            let start = u64::from(be24(cdb, 1) & 0x1F_FFFF);
            let mut count = u32::from(cdb[4]);
            if count == 0 && mode == AccessMode::Rw6 {
                count = 0x100;
            }
            (start, count)
        }
        AccessMode::Rw16 => (be64(cdb, 2), be32(cdb, 10)),
        AccessMode::Rw10 => (u64::from(be32(cdb, 2)), u32::from(be16(cdb, 7))),
        AccessMode::Seek10 => (u64::from(be32(cdb, 2)), 0),
    };

    if start > blocks || start + u64::from(count) > blocks {
        log::trace!(
            "Capacity of {} block(s) exceeded: block {}, count {}",
            blocks,
            start,
            count
        );
        return Err(ScsiError::new(
            SenseKey::IllegalRequest,
            ASC_LBA_OUT_OF_RANGE,
        ));
    }

    // Nothing to do for 0 blocks
    if count == 0 && !matches!(mode, AccessMode::Seek6 | AccessMode::Seek10) {
        return Ok(None);
    }

    Ok(Some((start, count)))
}

pub fn read_cmd(
    state: &mut DeviceState,
    disk: &mut StorageDisk,
    ctx: &mut TransferCtx,
    mode: AccessMode,
) -> ScsiResult<()> {
    state.check_ready()?;

    match check_start_and_count(&ctx.cdb, disk.blocks(), mode)? {
        Some((start, count)) => {
            ctx.length = disk.read_block(&mut ctx.buffer, start)?;
            ctx.blocks = count;
            ctx.next = start + 1;
            ctx.enter_data_in(ctx.length);
        }
        None => ctx.enter_status(),
    }

    Ok(())
}

pub fn write_cmd(
    state: &mut DeviceState,
    disk: &mut StorageDisk,
    ctx: &mut TransferCtx,
    mode: AccessMode,
) -> ScsiResult<()> {
    state.check_ready()?;

    match check_start_and_count(&ctx.cdb, disk.blocks(), mode)? {
        Some((start, count)) => {
            ctx.length = disk.write_check(state, start)?;
            ctx.blocks = count;
            ctx.next = start + 1;
            ctx.enter_data_out(ctx.length);
        }
        None => ctx.enter_status(),
    }

    Ok(())
}

pub fn verify_cmd(
    state: &mut DeviceState,
    disk: &mut StorageDisk,
    ctx: &mut TransferCtx,
    mode: AccessMode,
) -> ScsiResult<()> {
    state.check_ready()?;

    match check_start_and_count(&ctx.cdb, disk.blocks(), mode)? {
        Some((start, count)) => {
            // BytChk=0 turns VERIFY into a seek
            if ctx.cdb[1] & 0x02 == 0 {
                ctx.enter_status();
                return Ok(());
            }

            ctx.length = disk.read_block(&mut ctx.buffer, start)?;
            ctx.blocks = count;
            ctx.next = start + 1;
            ctx.enter_data_out(ctx.length);
        }
        None => ctx.enter_status(),
    }

    Ok(())
}

pub fn seek_cmd(
    state: &mut DeviceState,
    disk: &StorageDisk,
    ctx: &mut TransferCtx,
    mode: AccessMode,
) -> ScsiResult<()> {
    check_start_and_count(&ctx.cdb, disk.blocks(), mode)?;
    state.check_ready()?;
    ctx.enter_status();
    Ok(())
}

/// Continues a multi-block DataIn by loading the next block
pub fn xfer_in(disk: &mut StorageDisk, ctx: &mut TransferCtx) -> ScsiResult<()> {
    ctx.length = disk.read_block(&mut ctx.buffer, ctx.next)?;
    ctx.next += 1;
    ctx.offset = 0;
    Ok(())
}

/// Consumes a DataOut block; prepares the next block when `cont` is set
pub fn xfer_out(
    state: &DeviceState,
    disk: &mut StorageDisk,
    ctx: &mut TransferCtx,
    cont: bool,
) -> ScsiResult<()> {
    disk.write_block(state, &ctx.buffer, ctx.next - 1)?;

    ctx.next += 1;
    if cont {
        ctx.length = disk.write_check(state, ctx.next - 1)?;
        ctx.offset = 0;
    }

    Ok(())
}

pub fn read_capacity10(
    state: &mut DeviceState,
    disk: &StorageDisk,
    ctx: &mut TransferCtx,
) -> ScsiResult<()> {
    state.check_ready()?;

    if disk.blocks() == 0 {
        return Err(ScsiError::new(
            SenseKey::IllegalRequest,
            ASC_MEDIUM_NOT_PRESENT,
        ));
    }

    // Last logical block address; the initiator must use READ CAPACITY(16)
    // beyond 32 bits
    let capacity = (disk.blocks() - 1).min(u64::from(u32::MAX)) as u32;
    put_be32(&mut ctx.buffer, 0, capacity);
    put_be32(&mut ctx.buffer, 4, disk.sector_size());

    ctx.enter_data_in(8);
    Ok(())
}

pub fn read_capacity16(
    state: &mut DeviceState,
    disk: &StorageDisk,
    ctx: &mut TransferCtx,
) -> ScsiResult<()> {
    state.check_ready()?;

    if disk.blocks() == 0 {
        return Err(ScsiError::new(
            SenseKey::IllegalRequest,
            ASC_MEDIUM_NOT_PRESENT,
        ));
    }

    put_be64(&mut ctx.buffer, 0, disk.blocks() - 1);
    put_be32(&mut ctx.buffer, 8, disk.sector_size());
    ctx.buffer[12] = 0;
    // Logical blocks per physical block: not reported
    ctx.buffer[13] = 0;

    ctx.enter_data_in(14);
    Ok(())
}

/// READ/WRITE LONG with a transfer length other than 0 is not supported
pub fn read_write_long(disk: &StorageDisk, ctx: &mut TransferCtx, mode: AccessMode) -> ScsiResult<()> {
    let length_offset = if mode == AccessMode::Rw16 { 12 } else { 7 };
    if be16(&ctx.cdb, length_offset) != 0 {
        return Err(ScsiError::new(
            SenseKey::IllegalRequest,
            ASC_INVALID_FIELD_IN_CDB,
        ));
    }

    let block = if mode == AccessMode::Rw16 {
        be64(&ctx.cdb, 2)
    } else {
        u64::from(be32(&ctx.cdb, 2))
    };
    if block > disk.blocks() {
        return Err(ScsiError::new(
            SenseKey::IllegalRequest,
            ASC_LBA_OUT_OF_RANGE,
        ));
    }

    ctx.enter_status();
    Ok(())
}

pub fn format_unit(state: &mut DeviceState, ctx: &mut TransferCtx) -> ScsiResult<()> {
    state.check_ready()?;

    // FMTDATA=1 is not supported (but OK if there is no DEFECT LIST)
    if ctx.cdb[1] & 0x10 != 0 && ctx.cdb[4] != 0 {
        return Err(ScsiError::new(
            SenseKey::IllegalRequest,
            ASC_INVALID_FIELD_IN_CDB,
        ));
    }

    ctx.enter_status();
    Ok(())
}

/// START STOP UNIT with medium eject support. Ejected image paths are
/// handed to the context so the reservation can be dropped.
pub fn start_stop_unit(
    state: &mut DeviceState,
    disk: &mut StorageDisk,
    ctx: &mut TransferCtx,
) -> ScsiResult<()> {
    let start = ctx.cdb[4] & 0x01 != 0;
    let load = ctx.cdb[4] & 0x02 != 0;

    if load {
        log::trace!("{}", if start { "Loading medium" } else { "Ejecting medium" });
    } else {
        log::trace!("{}", if start { "Starting unit" } else { "Stopping unit" });
        state.stopped = !start;
    }

    if !start {
        disk.flush();

        if load {
            if state.locked {
                return Err(ScsiError::new(
                    SenseKey::IllegalRequest,
                    ASC_LOAD_OR_EJECT_FAILED,
                ));
            }

            if !state.eject(false) {
                return Err(ScsiError::aborted());
            }
            if let Some(path) = disk.close() {
                ctx.release_image(path);
            }
        }
    }

    ctx.enter_status();
    Ok(())
}

pub fn prevent_allow_removal(state: &mut DeviceState, ctx: &mut TransferCtx) -> ScsiResult<()> {
    state.check_ready()?;

    let lock = ctx.cdb[4] & 0x01 != 0;
    log::trace!("{}", if lock { "Locking medium" } else { "Unlocking medium" });
    state.locked = lock;

    ctx.enter_status();
    Ok(())
}

pub fn send_diagnostic(ctx: &mut TransferCtx) -> ScsiResult<()> {
    // PF bit and parameter lists are not supported
    if ctx.cdb[1] & 0x10 != 0 || ctx.cdb[3] != 0 || ctx.cdb[4] != 0 {
        return Err(ScsiError::new(
            SenseKey::IllegalRequest,
            ASC_INVALID_FIELD_IN_CDB,
        ));
    }

    ctx.enter_status();
    Ok(())
}

pub fn read_defect_data10(ctx: &mut TransferCtx) -> ScsiResult<()> {
    let allocation_length = (be16(&ctx.cdb, 7) as usize).min(4);

    // The defect list is empty
    ctx.buffer[..allocation_length].fill(0);
    ctx.enter_data_in(allocation_length);
    Ok(())
}

// --- Mode pages -----------------------------------------------------------

pub fn add_error_page(pages: &mut BTreeMap<u8, Vec<u8>>, _changeable: bool) {
    // Retry count 0, limit time uses the internal default
    pages.insert(1, vec![0; 12]);
}

pub fn add_format_page(
    state: &DeviceState,
    disk: &StorageDisk,
    pages: &mut BTreeMap<u8, Vec<u8>>,
    changeable: bool,
) {
    let mut buf = vec![0u8; 24];

    if changeable {
        // The sector size is simulated to be changeable; see the MODE
        // SELECT implementation
        put_be16(&mut buf, 12, disk.sector_size() as u16);
        pages.insert(3, buf);
        return;
    }

    if state.ready {
        // 8 tracks in one zone
        buf[3] = 0x08;
        // 25 sectors per track
        put_be16(&mut buf, 10, 25);
        // Physical sector size
        put_be16(&mut buf, 12, disk.sector_size() as u16);
        // Interleave 1
        put_be16(&mut buf, 14, 1);
        // Track skew factor 11
        put_be16(&mut buf, 16, 11);
        // Cylinder skew factor 20
        put_be16(&mut buf, 18, 20);
    }

    if state.removable {
        buf[20] = 0x20;
    }
    // Hard-sectored
    buf[20] |= 0x40;

    pages.insert(3, buf);
}

pub fn add_drive_page(
    state: &DeviceState,
    disk: &StorageDisk,
    pages: &mut BTreeMap<u8, Vec<u8>>,
    changeable: bool,
) {
    let mut buf = vec![0u8; 24];

    if !changeable && state.ready {
        // Cylinder count for 25 sectors/track and 8 heads
        let cylinders = (disk.blocks() >> 3) / 25;
        put_be32(&mut buf, 1, cylinders as u32);
        buf[5] = 0x08;
        // Medium rotation rate 7200
        put_be16(&mut buf, 20, 7200);
    }

    pages.insert(4, buf);
}

pub fn add_cache_page(pages: &mut BTreeMap<u8, Vec<u8>>, changeable: bool) {
    let mut buf = vec![0u8; 12];

    if !changeable {
        // Only the read cache is valid; all pre-fetch limits are disabled
        put_be16(&mut buf, 4, 0xFFFF);
        put_be16(&mut buf, 8, 0xFFFF);
        put_be16(&mut buf, 10, 0xFFFF);
    }

    pages.insert(8, buf);
}

pub fn add_apple_vendor_page(pages: &mut BTreeMap<u8, Vec<u8>>, changeable: bool) {
    // Page code 0x30: needed by the stock Apple drivers
    let mut buf = vec![0u8; 30];

    if !changeable {
        buf[2..24].copy_from_slice(b"APPLE COMPUTER, INC   ");
    }

    pages.insert(0x30, buf);
}

/// Common disk mode pages (error recovery, format, drive geometry, cache)
pub fn setup_disk_mode_pages(
    state: &DeviceState,
    disk: &StorageDisk,
    pages: &mut BTreeMap<u8, Vec<u8>>,
    page: u8,
    changeable: bool,
) {
    if page == 0x01 || page == 0x3F {
        add_error_page(pages, changeable);
    }
    if page == 0x03 || page == 0x3F {
        add_format_page(state, disk, pages, changeable);
    }
    if page == 0x04 || page == 0x3F {
        add_drive_page(state, disk, pages, changeable);
    }
    if page == 0x08 || page == 0x3F {
        add_cache_page(pages, changeable);
    }
}

/// MODE SENSE(6) response assembly around pre-collected page data
pub fn mode_sense6(
    state: &DeviceState,
    disk: &StorageDisk,
    ctx: &mut TransferCtx,
    page_data: &[u8],
) -> ScsiResult<()> {
    let length = (ctx.cdb[4] as usize).min(ctx.buffer.len());
    ctx.buffer[..length].fill(0);

    // DEVICE SPECIFIC PARAMETER
    if state.is_protected() {
        ctx.buffer[2] = 0x80;
    }

    let mut size = 4;

    // Block descriptor if DBD is 0
    if ctx.cdb[1] & 0x08 == 0 {
        ctx.buffer[3] = 0x08;

        if state.ready {
            put_be32(&mut ctx.buffer, 4, disk.blocks() as u32);
            put_be32(&mut ctx.buffer, 8, disk.sector_size());
        }

        size = 12;
    }

    size = append_page_data(ctx, size, length, page_data, 255)?;

    ctx.buffer[0] = size as u8;

    ctx.enter_data_in(size.min(length));
    Ok(())
}

/// MODE SENSE(10) response assembly around pre-collected page data
pub fn mode_sense10(
    state: &DeviceState,
    disk: &StorageDisk,
    ctx: &mut TransferCtx,
    page_data: &[u8],
) -> ScsiResult<()> {
    let length = (be16(&ctx.cdb, 7) as usize).min(ctx.buffer.len());
    ctx.buffer[..length].fill(0);

    if state.is_protected() {
        ctx.buffer[3] = 0x80;
    }

    let mut size = 8;

    if ctx.cdb[1] & 0x08 == 0 && state.ready {
        // LLBAA selects the long block descriptor for large media
        if ctx.cdb[1] & 0x10 == 0 || disk.blocks() <= u64::from(u32::MAX) {
            ctx.buffer[7] = 0x08;
            put_be32(&mut ctx.buffer, 8, disk.blocks() as u32);
            put_be32(&mut ctx.buffer, 12, disk.sector_size());
            size = 16;
        } else {
            // LONGLBA
            ctx.buffer[4] = 0x01;
            ctx.buffer[7] = 0x10;
            put_be64(&mut ctx.buffer, 8, disk.blocks());
            put_be32(&mut ctx.buffer, 20, disk.sector_size());
            size = 24;
        }
    }

    size = append_page_data(ctx, size, length, page_data, 65535)?;

    put_be16(&mut ctx.buffer, 0, size as u16);

    ctx.enter_data_in(size.min(length));
    Ok(())
}

fn append_page_data(
    ctx: &mut TransferCtx,
    offset: usize,
    length: usize,
    page_data: &[u8],
    max_size: usize,
) -> ScsiResult<usize> {
    let max_length = length.saturating_sub(offset);
    let copied = max_length.min(page_data.len());
    ctx.buffer[offset..offset + copied].copy_from_slice(&page_data[..copied]);

    let size = offset + page_data.len();
    if size > max_size {
        return Err(ScsiError::new(
            SenseKey::IllegalRequest,
            ASC_INVALID_FIELD_IN_CDB,
        ));
    }

    Ok(size.min(length))
}

/// MODE SELECT parameter verification: the only accepted change is a format
/// page echoing the current sector size
pub fn mode_select(cdb: &[u8], buf: &[u8], sector_size: u32) -> ScsiResult<()> {
    // Vendor-specific parameters (SCSI-1, PF=0) are not supported
    if cdb[1] & 0x10 == 0 {
        return Err(ScsiError::new(
            SenseKey::IllegalRequest,
            ASC_INVALID_FIELD_IN_PARAMETER_LIST,
        ));
    }

    let mut length = buf.len();
    let mut offset = 0;
    let mut has_valid_page_code = false;

    // Mode parameter header with block descriptor
    if length >= 12 {
        if be24(buf, 9) != sector_size {
            log::warn!("The sector size can only be changed when attaching a device");
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                ASC_INVALID_FIELD_IN_PARAMETER_LIST,
            ));
        }

        offset += 12;
        length -= 12;
    }

    while length > 2 {
        let page = buf[offset];

        if page == 0x03 {
            // The format page may select a sector size for a subsequent
            // FORMAT, as long as the current size remains unchanged
            if u32::from(be16(buf, offset + 12)) != sector_size {
                log::warn!("The sector size can only be changed when attaching a device");
                return Err(ScsiError::new(
                    SenseKey::IllegalRequest,
                    ASC_INVALID_FIELD_IN_PARAMETER_LIST,
                ));
            }
            has_valid_page_code = true;
        } else {
            log::warn!("Unknown MODE SELECT page code ${:02X}", page);
        }

        let size = buf[offset + 1] as usize + 2;
        if size > length {
            break;
        }
        length -= size;
        offset += size;
    }

    if !has_valid_page_code {
        return Err(ScsiError::new(
            SenseKey::IllegalRequest,
            ASC_INVALID_FIELD_IN_PARAMETER_LIST,
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_image(size: usize) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.hds");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![0u8; size]).unwrap();
        (dir, path)
    }

    #[test]
    fn open_derives_block_count() {
        let (_dir, path) = temp_image(512 * 16);
        let mut disk = StorageDisk::new(&[512, 1024, 2048, 4096]);
        disk.open(&path, true).unwrap();

        assert_eq!(disk.sector_size(), 512);
        assert_eq!(disk.blocks(), 16);
        assert_eq!(disk.capacity(), 8192);
    }

    #[test]
    fn configured_sector_size_is_validated() {
        let mut disk = StorageDisk::new(&[512, 1024, 2048, 4096]);
        assert!(disk.set_configured_sector_size(1024));
        assert!(!disk.set_configured_sector_size(513));

        let mut cd = StorageDisk::new(&[512, 2048]);
        assert!(!cd.set_configured_sector_size(1024));
    }

    #[test]
    fn block_io_roundtrip() {
        let (_dir, path) = temp_image(512 * 4);
        let mut disk = StorageDisk::new(&[512]);
        disk.open(&path, true).unwrap();

        let state = {
            let mut s = DeviceState::new(0, 0);
            s.ready = true;
            s
        };

        let data = vec![0xA5u8; 512];
        disk.write_block(&state, &data, 2).unwrap();
        disk.flush();

        let mut buf = vec![0u8; 512];
        disk.read_block(&mut buf, 2).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn out_of_range_block_is_rejected() {
        let (_dir, path) = temp_image(512 * 4);
        let mut disk = StorageDisk::new(&[512]);
        disk.open(&path, true).unwrap();

        let mut buf = vec![0u8; 512];
        let e = disk.read_block(&mut buf, 4).unwrap_err();
        assert_eq!(e.sense_key, SenseKey::IllegalRequest);
    }

    #[test]
    fn write_to_protected_medium_fails() {
        let (_dir, path) = temp_image(512 * 4);
        let mut disk = StorageDisk::new(&[512]);
        disk.open(&path, true).unwrap();

        let mut state = DeviceState::new(0, 0);
        state.ready = true;
        state.protectable = true;
        state.set_protected(true);

        let e = disk.write_block(&state, &[0u8; 512], 0).unwrap_err();
        assert_eq!(e.sense_key, SenseKey::DataProtect);
        assert_eq!(e.asc, ASC_WRITE_PROTECTED);
    }

    #[test]
    fn rw6_start_and_count() {
        let cdb = [0x08u8, 0x00, 0x00, 0x02, 0x00, 0x00];
        let (start, count) = check_start_and_count(&cdb, 1024, AccessMode::Rw6)
            .unwrap()
            .unwrap();
        assert_eq!(start, 2);
        // Count 0 means 256 blocks for RW6
        assert_eq!(count, 0x100);
    }

    #[test]
    fn capacity_overrun_is_rejected() {
        let mut cdb = [0u8; 10];
        cdb[0] = 0x28;
        put_be32(&mut cdb, 2, 1020);
        put_be16(&mut cdb, 7, 8);

        let e = check_start_and_count(&cdb, 1024, AccessMode::Rw10).unwrap_err();
        assert_eq!(e.asc, ASC_LBA_OUT_OF_RANGE);
    }

    #[test]
    fn mode_select_accepts_echoed_sector_size() {
        let cdb = [0x15u8, 0x10, 0, 0, 32, 0];

        // Header + block descriptor (sector size 512) + format page
        let mut buf = vec![0u8; 12 + 24];
        buf[9] = 0;
        buf[10] = 2;
        buf[11] = 0;
        buf[12] = 0x03;
        buf[13] = 22;
        put_be16(&mut buf, 24, 512);

        assert!(mode_select(&cdb, &buf, 512).is_ok());

        // A diverging sector size is refused
        put_be16(&mut buf, 24, 1024);
        assert!(mode_select(&cdb, &buf, 512).is_err());
    }
}
