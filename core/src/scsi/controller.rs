//! SCSI target controller: the bus phase state machine
//!
//! One controller exists per target ID and owns up to 32 logical units.
//! The daemon's main loop calls [`ScsiController::process`] repeatedly; each
//! call samples the bus and runs the handler of the current phase. A handler
//! doubles as the phase's entry action (when the stored phase differs from
//! its own) and its continue action (when it matches).
//!
//! Targets never hold a reference back to their controller. During command
//! execution they receive a [`TransferCtx`] carrying the CDB, the transfer
//! buffer and counters, and request the next bus phase through it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use log::*;
use num_traits::FromPrimitive;

use crate::scsi::bus::{SEND_NO_DELAY, ScsiBus};
use crate::scsi::target::{LUN_MAX, ScsiTarget};
use crate::scsi::{
    ASC_INVALID_LUN, ScsiCommand, ScsiError, ScsiResult, SenseKey, ShutdownMode, cdb_length,
};

/// Default transfer buffer size, or the size of an Ethernet frame plus
/// overhead, whichever is larger.
pub const BUFFER_SIZE: usize = if 0x1000 > 1514 + 16 + 4 { 0x1000 } else { 1514 + 16 + 4 };

const MIN_EXEC_TIME: Duration = Duration::from_micros(50);

const MAX_SYNC_PERIOD: u8 = 50;
const MAX_SYNC_OFFSET: u8 = 16;

// Message codes arriving via ATN
const MSG_EXTENDED: u8 = 0x01;
const MSG_ABORT: u8 = 0x06;
const MSG_REJECT: u8 = 0x07;
const MSG_BUS_DEVICE_RESET: u8 = 0x0C;

/// SCSI bus phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    BusFree,
    /// Initiator side only, never entered by a target
    Arbitration,
    Selection,
    Command,
    /// Internal sub-state while a CDB is being dispatched
    Execute,
    /// Target -> Initiator
    DataIn,
    /// Initiator -> Target
    DataOut,
    Status,
    MsgIn,
    MsgOut,
}

/// Per-command transfer state handed to targets during dispatch
pub struct TransferCtx {
    pub cdb: ArrayVec<u8, 16>,
    pub buffer: Vec<u8>,
    pub offset: usize,
    pub length: usize,
    pub blocks: u32,
    pub next: u64,
    pub status: u8,
    pub message: u8,

    /// LUN captured from a prior IDENTIFY message
    identified_lun: Option<u8>,
    /// Occupied LUNs of the owning controller (bit per LUN)
    lun_mask: u32,
    /// Phase requested by the target during dispatch
    requested_phase: Option<Phase>,
    /// Byte-oriented DataOut (printer PRINT path)
    byte_transfer: bool,
    bytes_to_transfer: usize,
    /// Deferred shutdown scheduled by the host services device
    shutdown: Option<ShutdownMode>,
    /// Image files released by a target-side eject, to be unreserved by
    /// the owner of the reservation table
    released_images: Vec<PathBuf>,
}

impl TransferCtx {
    fn new() -> Self {
        Self {
            cdb: ArrayVec::new(),
            buffer: vec![0; BUFFER_SIZE],
            offset: 0,
            length: 0,
            blocks: 0,
            next: 0,
            status: 0,
            message: 0,
            identified_lun: None,
            lun_mask: 0,
            requested_phase: None,
            byte_transfer: false,
            bytes_to_transfer: 0,
            shutdown: None,
            released_images: Vec::new(),
        }
    }

    pub fn opcode(&self) -> u8 {
        self.cdb.first().copied().unwrap_or(0)
    }

    /// LUN from the IDENTIFY message, falling back to bits 5..7 of CDB
    /// byte 1
    pub fn effective_lun(&self) -> u8 {
        self.identified_lun
            .unwrap_or_else(|| (self.cdb.get(1).copied().unwrap_or(0) >> 5) & 0x07)
    }

    pub fn has_lun(&self, lun: u8) -> bool {
        self.lun_mask & (1 << lun) != 0
    }

    pub fn enter_status(&mut self) {
        self.requested_phase = Some(Phase::Status);
    }

    pub fn enter_data_in(&mut self, length: usize) {
        self.length = length;
        self.requested_phase = Some(Phase::DataIn);
    }

    pub fn enter_data_out(&mut self, length: usize) {
        self.length = length;
        self.requested_phase = Some(Phase::DataOut);
    }

    /// Switches the pending DataOut to a single byte-oriented transfer
    pub fn set_byte_transfer(&mut self) {
        self.byte_transfer = true;
    }

    pub fn bytes_to_transfer(&self) -> usize {
        self.bytes_to_transfer
    }

    pub fn schedule_shutdown(&mut self, mode: ShutdownMode) {
        self.shutdown = Some(mode);
    }

    pub fn release_image(&mut self, path: PathBuf) {
        self.released_images.push(path);
    }

    #[cfg(test)]
    pub fn force_bytes_to_transfer(&mut self, n: usize) {
        self.bytes_to_transfer = n;
    }

    #[cfg(test)]
    pub fn take_shutdown_for_test(&mut self) -> Option<ShutdownMode> {
        self.shutdown.take()
    }

    /// CDB copy plus a read view of the transfer buffer, for handlers that
    /// need both at once
    pub fn cdb_and_buffer(&self, len: usize) -> ([u8; 16], &[u8]) {
        let mut cdb = [0u8; 16];
        cdb[..self.cdb.len()].copy_from_slice(&self.cdb);
        (cdb, &self.buffer[..len.min(self.buffer.len())])
    }
}

/// A free-standing transfer context for exercising targets without a
/// controller
#[cfg(test)]
pub fn test_ctx() -> TransferCtx {
    TransferCtx::new()
}

pub struct ScsiController {
    target_id: u8,
    phase: Phase,
    ctx: TransferCtx,
    luns: BTreeMap<u8, Box<dyn ScsiTarget>>,

    /// ATN message accumulator
    atn_msgs: ArrayVec<u8, 256>,
    atn_active: bool,

    sync_enable: bool,
    sync_period: u8,
    sync_offset: u8,

    /// Timer snapshot for the minimum execution time gate
    exec_start: Option<Instant>,

    /// Shutdown handed over at BusFree for the main loop to act on
    pending_shutdown: Option<ShutdownMode>,
}

impl ScsiController {
    pub fn new(target_id: u8) -> Self {
        Self {
            target_id,
            phase: Phase::BusFree,
            ctx: TransferCtx::new(),
            luns: BTreeMap::new(),
            atn_msgs: ArrayVec::new(),
            atn_active: false,
            sync_enable: true,
            sync_period: 0,
            sync_offset: 0,
            exec_start: None,
            pending_shutdown: None,
        }
    }

    pub fn target_id(&self) -> u8 {
        self.target_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    // --- LUN management --------------------------------------------------

    pub fn add_device(&mut self, device: Box<dyn ScsiTarget>) -> bool {
        let lun = device.state().lun;
        if lun >= LUN_MAX || self.luns.contains_key(&lun) {
            return false;
        }

        self.luns.insert(lun, device);
        true
    }

    pub fn remove_device(&mut self, lun: u8) -> Option<Box<dyn ScsiTarget>> {
        self.luns.remove(&lun)
    }

    pub fn device(&self, lun: u8) -> Option<&dyn ScsiTarget> {
        self.luns.get(&lun).map(AsRef::as_ref)
    }

    pub fn device_mut(&mut self, lun: u8) -> Option<&mut Box<dyn ScsiTarget>> {
        self.luns.get_mut(&lun)
    }

    pub fn lun_count(&self) -> usize {
        self.luns.len()
    }

    pub fn luns(&self) -> impl Iterator<Item = (u8, &dyn ScsiTarget)> {
        self.luns.iter().map(|(lun, dev)| (*lun, dev.as_ref()))
    }

    fn lun_mask(&self) -> u32 {
        self.luns.keys().fold(0, |mask, lun| mask | (1 << lun))
    }

    /// Shutdown scheduled by a target, handed over at BusFree
    pub fn take_pending_shutdown(&mut self) -> Option<ShutdownMode> {
        self.pending_shutdown.take()
    }

    /// Image files released by target-side ejects since the last call
    pub fn drain_released_images(&mut self) -> Vec<PathBuf> {
        std::mem::take(&mut self.ctx.released_images)
    }

    // --- Phase machine ---------------------------------------------------

    /// Full controller reset: clear phase state and reset every LUN
    pub fn reset(&mut self) {
        self.phase = Phase::BusFree;
        self.ctx.status = 0;
        self.ctx.message = 0;
        self.ctx.blocks = 0;
        self.ctx.next = 0;
        self.ctx.offset = 0;
        self.ctx.length = 0;
        self.ctx.identified_lun = None;
        self.ctx.requested_phase = None;
        self.ctx.byte_transfer = false;
        self.ctx.bytes_to_transfer = 0;
        self.exec_start = None;

        self.atn_active = false;
        self.atn_msgs.clear();
        self.sync_offset = 0;

        for device in self.luns.values_mut() {
            device.bus_reset();
        }
    }

    /// Processes the current phase once. Called by the main loop until the
    /// phase returns to BusFree.
    pub fn process(&mut self, bus: &mut dyn ScsiBus, initiator_id: Option<u8>) -> Phase {
        bus.acquire();

        if bus.get_rst() {
            warn!("RESET signal received");
            self.reset();
            bus.reset();
            return self.phase;
        }

        match initiator_id {
            Some(id) => trace!("Initiator ID is {}", id),
            None => trace!("Initiator ID is unknown"),
        }

        match self.phase {
            Phase::BusFree => self.bus_free(bus),
            Phase::Selection => self.selection(bus),
            Phase::DataOut => self.data_out(bus),
            Phase::DataIn => self.data_in(bus),
            Phase::Command => self.command(bus),
            Phase::Status => self.status(bus),
            Phase::MsgOut => self.msg_out(bus),
            Phase::MsgIn => self.msg_in(bus),
            Phase::Arbitration | Phase::Execute => {
                // Never left as the externally visible phase
                self.bus_free(bus);
            }
        }

        self.phase
    }

    fn bus_free(&mut self, bus: &mut dyn ScsiBus) {
        if self.phase != Phase::BusFree {
            trace!("Bus free phase");

            self.phase = Phase::BusFree;

            bus.set_req(false);
            bus.set_msg(false);
            bus.set_cd(false);
            bus.set_io(false);
            bus.set_bsy(false);

            self.ctx.status = 0;
            self.ctx.message = 0;
            self.atn_active = false;
            self.ctx.identified_lun = None;
            self.ctx.byte_transfer = false;
            self.ctx.bytes_to_transfer = 0;

            // A scheduled shutdown takes effect here and nowhere else, after
            // all handshakes of the in-flight command have completed.
            if let Some(mode) = self.ctx.shutdown.take() {
                self.pending_shutdown = Some(mode);
            }

            return;
        }

        if bus.get_sel() && !bus.get_bsy() {
            self.selection(bus);
        }
    }

    fn selection(&mut self, bus: &mut dyn ScsiBus) {
        if self.phase != Phase::Selection {
            // Not selected unless our ID bit is asserted
            if bus.dat() & (1 << self.target_id) == 0 {
                return;
            }

            // Abort if there is no LUN on this controller
            if self.luns.is_empty() {
                return;
            }

            trace!("Selection phase, target ID {}", self.target_id);

            self.phase = Phase::Selection;

            // Raise BSY to respond
            bus.set_bsy(true);
            return;
        }

        // Selection is complete once the initiator releases SEL
        if !bus.get_sel() && bus.get_bsy() {
            if bus.get_atn() {
                self.msg_out(bus);
            } else {
                self.command(bus);
            }
        }
    }

    fn command(&mut self, bus: &mut dyn ScsiBus) {
        trace!("Command phase");

        self.phase = Phase::Command;

        bus.set_msg(false);
        bus.set_cd(true);
        bus.set_io(false);

        let actual_count = bus.command_handshake(&mut self.ctx.buffer);
        let command_byte_count = cdb_length(self.ctx.buffer[0]);

        if actual_count != command_byte_count {
            error!(
                "Command byte count mismatch: expected {} bytes, received {}",
                command_byte_count, actual_count
            );
            self.error(bus, ScsiError::aborted());
            return;
        }

        self.ctx.cdb.clear();
        self.ctx
            .cdb
            .try_extend_from_slice(&self.ctx.buffer[..command_byte_count])
            .unwrap();
        trace!("CDB=${}", hex::encode(&self.ctx.cdb));

        self.ctx.length = 0;

        self.execute(bus);
    }

    fn execute(&mut self, bus: &mut dyn ScsiBus) {
        let opcode = self.ctx.opcode();
        debug!("Executing command ${:02X}", opcode);

        self.phase = Phase::Execute;

        self.ctx.offset = 0;
        self.ctx.blocks = 1;
        self.exec_start = Some(Instant::now());

        let is_request_sense = ScsiCommand::from_u8(opcode) == Some(ScsiCommand::RequestSense);
        let is_inquiry = ScsiCommand::from_u8(opcode) == Some(ScsiCommand::Inquiry);

        // Discard pending status unless the command is REQUEST SENSE
        if !is_request_sense {
            self.ctx.status = 0;
        }

        let requested_lun = self.ctx.effective_lun();
        let mut lun = requested_lun;
        let lun_missing = !self.luns.contains_key(&lun);

        if lun_missing {
            // INQUIRY and REQUEST SENSE have special handling for
            // non-existing LUNs and fall back to LUN 0
            if !is_inquiry && !is_request_sense {
                debug!("Invalid LUN {} for ID {}", lun, self.target_id);
                self.error(
                    bus,
                    ScsiError::new(SenseKey::IllegalRequest, ASC_INVALID_LUN),
                );
                return;
            }

            lun = 0;
            if !self.luns.contains_key(&0) {
                self.error(bus, ScsiError::aborted());
                return;
            }

            // REQUEST SENSE for a non-existing LUN reports the missing LUN
            // in the sense data without raising CHECK CONDITION
            if is_request_sense {
                let code = ScsiError::new(SenseKey::IllegalRequest, ASC_INVALID_LUN).status_code();
                self.luns.get_mut(&0).unwrap().state_mut().set_sense(code);
                self.ctx.status = 0;
            }
        }

        self.ctx.lun_mask = self.lun_mask();
        self.ctx.requested_phase = None;

        let result = {
            let Self { ctx, luns, .. } = self;
            let device = luns.get_mut(&lun).unwrap();
            if !is_request_sense {
                device.state_mut().set_sense(0);
            }
            device.dispatch(ctx)
        };

        if let Err(e) = result {
            self.error(bus, e);
            return;
        }

        // SCSI-2 p.104 4.4.3: report an unsupported LUN in the INQUIRY data
        if is_inquiry && lun_missing {
            trace!(
                "Reporting LUN {} for ID {} as not supported",
                requested_lun, self.target_id
            );
            self.ctx.buffer[0] = 0x7F;
        }

        match self.ctx.requested_phase.take() {
            Some(Phase::Status) => self.status(bus),
            Some(Phase::DataIn) => self.data_in(bus),
            Some(Phase::DataOut) => self.data_out(bus),
            Some(other) => {
                error!("Target requested unexpected phase {:?}", other);
                self.error(bus, ScsiError::aborted());
            }
            None => {
                // A well-behaved target always requests a phase
                self.error(bus, ScsiError::aborted());
            }
        }
    }

    fn status(&mut self, bus: &mut dyn ScsiBus) {
        if self.phase != Phase::Status {
            // Minimum execution time gate
            if self.exec_start.is_some() {
                self.sleep_min_exec_time();
            } else {
                thread::sleep(Duration::from_micros(5));
            }

            trace!("Status phase ${:02X}", self.ctx.status);

            self.phase = Phase::Status;

            bus.set_msg(false);
            bus.set_cd(true);
            bus.set_io(true);

            // One byte, one block
            self.ctx.offset = 0;
            self.ctx.length = 1;
            self.ctx.blocks = 1;
            self.ctx.buffer[0] = self.ctx.status;

            return;
        }

        self.send(bus);
    }

    fn msg_in(&mut self, bus: &mut dyn ScsiBus) {
        if self.phase != Phase::MsgIn {
            trace!("Message In phase");

            self.phase = Phase::MsgIn;

            bus.set_msg(true);
            bus.set_cd(true);
            bus.set_io(true);

            // length and blocks were set up by the caller
            self.ctx.offset = 0;
            return;
        }

        self.send(bus);
    }

    fn msg_out(&mut self, bus: &mut dyn ScsiBus) {
        if self.phase != Phase::MsgOut {
            trace!("Message Out phase");

            // Start accumulating the IDENTIFY message sequence when coming
            // out of selection
            if self.phase == Phase::Selection {
                self.atn_active = true;
                self.atn_msgs.clear();
            }

            self.phase = Phase::MsgOut;

            bus.set_msg(true);
            bus.set_cd(true);
            bus.set_io(false);

            // One byte, one block
            self.ctx.offset = 0;
            self.ctx.length = 1;
            self.ctx.blocks = 1;

            return;
        }

        self.receive(bus);
    }

    fn data_in(&mut self, bus: &mut dyn ScsiBus) {
        if self.phase != Phase::DataIn {
            if self.exec_start.is_some() {
                self.sleep_min_exec_time();
            }

            if self.ctx.length == 0 {
                self.status(bus);
                return;
            }

            trace!("Data-in phase");

            self.phase = Phase::DataIn;

            bus.set_msg(false);
            bus.set_cd(false);
            bus.set_io(true);

            self.ctx.offset = 0;
            return;
        }

        self.send(bus);
    }

    fn data_out(&mut self, bus: &mut dyn ScsiBus) {
        if self.phase != Phase::DataOut {
            if self.exec_start.is_some() {
                self.sleep_min_exec_time();
            }

            if self.ctx.length == 0 {
                self.status(bus);
                return;
            }

            trace!("Data-out phase");

            self.phase = Phase::DataOut;

            bus.set_msg(false);
            bus.set_cd(false);
            bus.set_io(false);

            self.ctx.offset = 0;
            return;
        }

        self.receive(bus);
    }

    /// Routes a command failure to the status phase, recording the sense
    /// data on the effective LUN
    fn error(&mut self, bus: &mut dyn ScsiBus, e: ScsiError) {
        bus.acquire();

        if bus.get_rst() {
            self.reset();
            bus.reset();
            return;
        }

        // Bus free for errors during the status or message-in phase
        if self.phase == Phase::Status || self.phase == Phase::MsgIn {
            self.bus_free(bus);
            return;
        }

        let mut lun = self.ctx.effective_lun();
        if !self.luns.contains_key(&lun) || e.asc == ASC_INVALID_LUN {
            lun = 0;
        }

        if e.sense_key != SenseKey::NoSense || e.asc != 0 {
            if let Some(device) = self.luns.get_mut(&lun) {
                device.state_mut().set_sense(e.status_code());
            }
        }

        self.ctx.status = e.status;
        self.ctx.message = 0;
        self.ctx.requested_phase = None;

        trace!("Error (to status phase)");

        self.status(bus);
    }

    /// Target -> initiator transfer step (DataIn, Status, MsgIn)
    fn send(&mut self, bus: &mut dyn ScsiBus) {
        if self.ctx.length != 0 {
            trace!(
                "Sending handshake with offset {}, length {}",
                self.ctx.offset, self.ctx.length
            );

            // The send delay is taken from LUN 0 as there are no initiator
            // drivers using other LUNs on delay-sensitive devices
            let delay = self
                .luns
                .get(&0)
                .map_or(SEND_NO_DELAY, |d| d.send_delay());

            let len = bus.send_handshake(
                &self.ctx.buffer[self.ctx.offset..self.ctx.offset + self.ctx.length],
                delay,
            );
            if len != self.ctx.length {
                self.error(bus, ScsiError::aborted());
                return;
            }

            self.ctx.offset += self.ctx.length;
            self.ctx.length = 0;
            return;
        }

        // Block completed
        self.ctx.blocks -= 1;

        // Refill from the target while more blocks are required
        if self.phase == Phase::DataIn && self.ctx.blocks != 0 {
            let result = {
                let Self { ctx, luns, .. } = self;
                let lun = ctx.effective_lun();
                match luns.get_mut(&lun) {
                    Some(device) => device.xfer_in(ctx),
                    None => Err(ScsiError::aborted()),
                }
            };
            if let Err(e) = result {
                self.error(bus, e);
                return;
            }
            trace!("Next block prepared, {} block(s) remaining", self.ctx.blocks);
        }

        if self.ctx.blocks != 0 {
            return;
        }

        // Move to the next phase
        match self.phase {
            Phase::MsgIn => {
                if self.atn_active {
                    // Response to an extended message completed, the
                    // initiator continues with a command
                    self.atn_active = false;
                    self.command(bus);
                } else {
                    self.bus_free(bus);
                }
            }
            Phase::DataIn => self.status(bus),
            Phase::Status => {
                self.ctx.length = 1;
                self.ctx.blocks = 1;
                self.ctx.buffer[0] = self.ctx.message;
                self.msg_in(bus);
            }
            _ => unreachable!("send() in phase {:?}", self.phase),
        }
    }

    /// Initiator -> target transfer step (DataOut, MsgOut). Handles both
    /// block-oriented and byte-oriented transfers.
    fn receive(&mut self, bus: &mut dyn ScsiBus) {
        if self.ctx.length != 0 {
            trace!("Receiving {} byte(s)", self.ctx.length);

            let len = bus.receive_handshake(
                &mut self.ctx.buffer[self.ctx.offset..self.ctx.offset + self.ctx.length],
            );
            if len != self.ctx.length {
                error!(
                    "Not able to receive {} byte(s), only received {}",
                    self.ctx.length, len
                );
                self.error(bus, ScsiError::aborted());
                return;
            }

            if self.ctx.byte_transfer {
                self.ctx.bytes_to_transfer = self.ctx.length;
            }

            self.ctx.offset += self.ctx.length;
            self.ctx.length = 0;
            return;
        }

        if !self.ctx.byte_transfer {
            self.ctx.blocks -= 1;
        }

        let result = match self.phase {
            Phase::DataOut => {
                let cont = !self.ctx.byte_transfer && self.ctx.blocks != 0;
                self.xfer_out(cont)
            }
            Phase::MsgOut => {
                self.ctx.message = self.ctx.buffer[0];
                if self.atn_active {
                    // Accumulate, wrapping at the buffer capacity
                    if self.atn_msgs.is_full() {
                        self.atn_msgs.clear();
                    }
                    self.atn_msgs.push(self.ctx.message);
                }

                // Clear in preparation for message-in
                self.ctx.message = 0;
                Ok(())
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            self.error(bus, e);
            return;
        }

        if !self.ctx.byte_transfer && self.ctx.blocks != 0 {
            return;
        }
        self.ctx.byte_transfer = false;

        match self.phase {
            Phase::MsgOut => {
                // Continue receiving messages as long as ATN stays asserted
                if bus.get_atn() {
                    self.ctx.offset = 0;
                    self.ctx.length = 1;
                    self.ctx.blocks = 1;
                    return;
                }

                self.process_atn_messages(bus);
            }
            Phase::DataOut => {
                self.flush_unit();
                self.status(bus);
            }
            _ => unreachable!("receive() in phase {:?}", self.phase),
        }
    }

    fn xfer_out(&mut self, cont: bool) -> ScsiResult<()> {
        let Self { ctx, luns, .. } = self;
        let lun = ctx.effective_lun();
        let Some(device) = luns.get_mut(&lun) else {
            return Err(ScsiError::aborted());
        };

        if ctx.byte_transfer {
            return device.write_bytes(ctx);
        }

        device.xfer_out(ctx, cont)
    }

    /// Post-write cache flush after a completed DataOut
    fn flush_unit(&mut self) {
        let opcode = ScsiCommand::from_u8(self.ctx.opcode());
        if !matches!(
            opcode,
            Some(
                ScsiCommand::Write6
                    | ScsiCommand::Write10
                    | ScsiCommand::Write16
                    | ScsiCommand::Verify10
                    | ScsiCommand::Verify16
            )
        ) {
            return;
        }

        let lun = self.ctx.effective_lun();
        if let Some(device) = self.luns.get_mut(&lun) {
            device.flush_cache();
        }
    }

    /// Parses the messages accumulated while ATN was asserted
    fn process_atn_messages(&mut self, bus: &mut dyn ScsiBus) {
        if self.atn_active {
            let msgs = self.atn_msgs.clone();
            let mut i = 0;
            while i < msgs.len() {
                let data = msgs[i];

                match data {
                    MSG_ABORT => {
                        trace!("Message code ABORT ${:02X}", data);
                        self.bus_free(bus);
                        return;
                    }

                    MSG_BUS_DEVICE_RESET => {
                        trace!("Message code BUS DEVICE RESET ${:02X}", data);
                        self.sync_offset = 0;
                        self.bus_free(bus);
                        return;
                    }

                    0x80..=0xFF => {
                        self.ctx.identified_lun = Some(data & 0x1F);
                        trace!(
                            "Message code IDENTIFY ${:02X}, LUN {} selected",
                            data,
                            data & 0x1F
                        );
                    }

                    MSG_EXTENDED => {
                        trace!("Message code EXTENDED MESSAGE ${:02X}", data);

                        // Only SDTR is answered, and only when synchronous
                        // transfers are possible
                        if !self.sync_enable || msgs.get(i + 2) != Some(&0x01) {
                            self.ctx.length = 1;
                            self.ctx.blocks = 1;
                            self.ctx.buffer[0] = MSG_REJECT;
                            self.msg_in(bus);
                            return;
                        }

                        self.sync_period =
                            msgs.get(i + 3).copied().unwrap_or(0).min(MAX_SYNC_PERIOD);
                        self.sync_offset =
                            msgs.get(i + 4).copied().unwrap_or(0).min(MAX_SYNC_OFFSET);

                        // SDTR echo
                        self.ctx.length = 5;
                        self.ctx.blocks = 1;
                        self.ctx.buffer[0] = 0x01;
                        self.ctx.buffer[1] = 0x03;
                        self.ctx.buffer[2] = 0x01;
                        self.ctx.buffer[3] = self.sync_period;
                        self.ctx.buffer[4] = self.sync_offset;
                        self.msg_in(bus);
                        return;
                    }

                    _ => {}
                }

                i += 1;
            }
        }

        self.atn_active = false;
        self.atn_msgs.clear();

        self.command(bus);
    }

    fn sleep_min_exec_time(&mut self) {
        if let Some(start) = self.exec_start.take() {
            let elapsed = start.elapsed();
            if elapsed < MIN_EXEC_TIME {
                thread::sleep(MIN_EXEC_TIME - elapsed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::scriptbus::ScriptBus;
    use crate::scsi::target::factory::{DeviceProfile, create_device};
    use crate::scsi::target::DeviceType;
    use hex_literal::hex;

    fn controller_with_services(id: u8) -> ScsiController {
        let mut controller = ScsiController::new(id);
        let device = create_device(&DeviceProfile {
            device_type: DeviceType::HostServices,
            id,
            lun: 0,
            filename: String::new(),
        })
        .unwrap();
        assert!(controller.add_device(device));
        controller
    }

    fn run_transaction(controller: &mut ScsiController, bus: &mut ScriptBus) {
        // Drive the phase machine until the command cycle ends
        for _ in 0..64 {
            if controller.process(bus, Some(7)) == Phase::BusFree && bus.script_done() {
                return;
            }
        }
        panic!("Transaction did not complete; phase {:?}", controller.phase());
    }

    #[test]
    fn selection_ignores_other_ids() {
        let mut controller = controller_with_services(3);
        let mut bus = ScriptBus::new();
        bus.begin_selection(1 << 5, false);

        // SEL for ID 5 is not for us
        controller.process(&mut bus, None);
        assert_eq!(controller.phase(), Phase::BusFree);
    }

    #[test]
    fn selection_without_luns_is_ignored() {
        let mut controller = ScsiController::new(2);
        let mut bus = ScriptBus::new();
        bus.begin_selection(1 << 2, false);

        controller.process(&mut bus, None);
        assert_eq!(controller.phase(), Phase::BusFree);
    }

    #[test]
    fn test_unit_ready_full_cycle() {
        let mut controller = controller_with_services(3);
        let mut bus = ScriptBus::new();
        bus.begin_selection(1 << 3, false);
        bus.queue_cdb(&hex!("00 00 00 00 00 00"));

        run_transaction(&mut controller, &mut bus);

        assert_eq!(bus.status_bytes(), &[STATUS_GOOD_BYTE]);
        assert_eq!(bus.message_in_bytes(), &[0x00]);
    }

    const STATUS_GOOD_BYTE: u8 = 0x00;

    #[test]
    fn inquiry_returns_identity() {
        let mut controller = controller_with_services(3);
        let mut bus = ScriptBus::new();
        bus.begin_selection(1 << 3, false);
        bus.queue_cdb(&hex!("12 00 00 00 24 00"));

        run_transaction(&mut controller, &mut bus);

        let data = bus.data_in_bytes();
        assert_eq!(data.len(), 36);
        // Processor device
        assert_eq!(data[0], 0x03);
        assert_eq!(&data[8..14], b"REMORA");
    }

    #[test]
    fn inquiry_on_missing_lun_flags_unsupported() {
        let mut controller = controller_with_services(3);
        let mut bus = ScriptBus::new();
        bus.begin_selection(1 << 3, false);
        // INQUIRY with LUN 2 in CDB byte 1
        bus.queue_cdb(&hex!("12 40 00 00 24 00"));

        run_transaction(&mut controller, &mut bus);

        let data = bus.data_in_bytes();
        assert_eq!(data[0], 0x7F);
    }

    #[test]
    fn unknown_lun_raises_invalid_lun() {
        let mut controller = controller_with_services(3);
        let mut bus = ScriptBus::new();
        bus.begin_selection(1 << 3, false);
        // TEST UNIT READY for LUN 2
        bus.queue_cdb(&hex!("00 40 00 00 00 00"));

        run_transaction(&mut controller, &mut bus);

        assert_eq!(bus.status_bytes(), &[0x02]);

        // REQUEST SENSE reports the invalid LUN without CHECK CONDITION
        let mut bus = ScriptBus::new();
        bus.begin_selection(1 << 3, false);
        bus.queue_cdb(&hex!("03 00 00 00 12 00"));
        run_transaction(&mut controller, &mut bus);

        assert_eq!(bus.status_bytes(), &[0x00]);
        let sense = bus.data_in_bytes();
        assert_eq!(sense[2], SenseKey::IllegalRequest as u8);
        assert_eq!(sense[12], ASC_INVALID_LUN);
    }

    #[test]
    fn identify_message_selects_lun() {
        let mut controller = controller_with_services(3);
        let mut bus = ScriptBus::new();
        // Select with ATN, IDENTIFY LUN 1 (which does not exist)
        bus.begin_selection(1 << 3, true);
        bus.queue_message_out(&[0x80 | 0x01]);
        bus.queue_cdb(&hex!("00 00 00 00 00 00"));

        run_transaction(&mut controller, &mut bus);

        // LUN 1 does not exist: CHECK CONDITION
        assert_eq!(bus.status_bytes(), &[0x02]);
    }

    #[test]
    fn abort_message_frees_bus() {
        let mut controller = controller_with_services(3);
        let mut bus = ScriptBus::new();
        bus.begin_selection(1 << 3, true);
        bus.queue_message_out(&[MSG_ABORT]);

        for _ in 0..16 {
            if controller.process(&mut bus, None) == Phase::BusFree {
                break;
            }
        }

        assert_eq!(controller.phase(), Phase::BusFree);
        assert!(bus.status_bytes().is_empty());
    }

    #[test]
    fn sdtr_is_echoed_with_clamped_parameters() {
        let mut controller = controller_with_services(3);
        let mut bus = ScriptBus::new();
        bus.begin_selection(1 << 3, true);
        // EXTENDED MESSAGE: SDTR with period 0x70, offset 0x40
        bus.queue_message_out(&[0x01, 0x03, 0x01, 0x70, 0x40]);
        bus.queue_cdb(&hex!("00 00 00 00 00 00"));

        run_transaction(&mut controller, &mut bus);

        let msgs = bus.message_in_bytes();
        // SDTR echo with clamped values, then command completion
        assert_eq!(&msgs[..5], &[0x01, 0x03, 0x01, MAX_SYNC_PERIOD, MAX_SYNC_OFFSET]);
        assert_eq!(bus.status_bytes(), &[0x00]);
    }

    #[test]
    fn reject_unsupported_extended_message() {
        let mut controller = controller_with_services(3);
        let mut bus = ScriptBus::new();
        bus.begin_selection(1 << 3, true);
        // Extended message that is not SDTR
        bus.queue_message_out(&[0x01, 0x02, 0x02, 0x00, 0x00]);
        bus.queue_cdb(&hex!("00 00 00 00 00 00"));

        run_transaction(&mut controller, &mut bus);

        assert_eq!(bus.message_in_bytes()[0], MSG_REJECT);
    }

    #[test]
    fn start_stop_unit_schedules_process_shutdown() {
        let mut controller = controller_with_services(3);
        let mut bus = ScriptBus::new();
        bus.begin_selection(1 << 3, false);
        // START STOP UNIT with start=0, load=0
        bus.queue_cdb(&hex!("1B 00 00 00 00 00"));

        run_transaction(&mut controller, &mut bus);

        assert_eq!(bus.status_bytes(), &[0x00]);
        assert_eq!(
            controller.take_pending_shutdown(),
            Some(ShutdownMode::StopProcess)
        );
        assert_eq!(controller.take_pending_shutdown(), None);
    }

    #[test]
    fn rst_resets_controller() {
        let mut controller = controller_with_services(3);
        let mut bus = ScriptBus::new();
        bus.begin_selection(1 << 3, false);
        controller.process(&mut bus, None);
        assert_eq!(controller.phase(), Phase::Selection);

        bus.assert_rst();
        controller.process(&mut bus, None);
        assert_eq!(controller.phase(), Phase::BusFree);
    }

    #[test]
    fn add_device_rejects_occupied_and_out_of_range_luns() {
        let mut controller = controller_with_services(0);

        let dup = create_device(&DeviceProfile {
            device_type: DeviceType::HostServices,
            id: 0,
            lun: 0,
            filename: String::new(),
        })
        .unwrap();
        assert!(!controller.add_device(dup));

        let out_of_range = create_device(&DeviceProfile {
            device_type: DeviceType::HostServices,
            id: 0,
            lun: LUN_MAX,
            filename: String::new(),
        })
        .unwrap();
        assert!(!controller.add_device(out_of_range));
    }
}
