//! DaynaPort SCSI/Link Ethernet adapter (SCDP)

use std::collections::BTreeMap;
use std::path::Path;

use num_traits::FromPrimitive;
use rand::Rng;

use super::net::NetworkLink;
use super::{DeviceState, DeviceType, INQUIRY_PROCESSOR, ScsiLevel, ScsiTarget};
use crate::scsi::controller::TransferCtx;
use crate::scsi::{
    ASC_INVALID_FIELD_IN_CDB, ScsiCommand, ScsiError, ScsiResult, SenseKey, be16,
};

/// The read response header; the MacOS driver performs two separate reads,
/// so the HAL must pause the handshake after these bytes.
const READ_HEADER_SIZE: usize = 6;

const FCS: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

pub struct ScsiDaynaport {
    state: DeviceState,
    macaddress: [u8; 6],
    link: Option<NetworkLink>,
    enabled: bool,
    multicast_groups: Vec<[u8; 6]>,
}

impl ScsiDaynaport {
    pub fn new(id: u8, lun: u8) -> Self {
        let mut state = DeviceState::new(id, lun);
        state.supports_params = true;
        state.ready = true;

        let mut rng = rand::rng();

        Self {
            state,
            macaddress: [0x00, 0x80, 0x19, rng.random(), rng.random(), rng.random()],
            link: None,
            enabled: false,
            multicast_groups: Vec::new(),
        }
    }

    pub fn macaddress(&self) -> [u8; 6] {
        self.macaddress
    }

    /// Connects the adapter to a packet link
    pub fn set_link(&mut self, link: NetworkLink) {
        self.link = Some(link);
    }

    /// READ(6): drains queued packets into the DaynaPort frame format,
    /// a 6-byte header (length, flags) followed by the frame and its FCS.
    fn read_packets(&mut self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        let read_len = be16(&ctx.cdb, 3) as usize;
        if read_len == 1 {
            // The boot ROM probes the adapter as a disk at startup
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                ASC_INVALID_FIELD_IN_CDB,
            ));
        }

        let Some(link) = self.link.as_ref() else {
            // Link down: report no data
            ctx.buffer[..READ_HEADER_SIZE].fill(0);
            ctx.enter_data_in(READ_HEADER_SIZE);
            return Ok(());
        };

        if link.rx.is_empty() {
            ctx.buffer[..READ_HEADER_SIZE].fill(0);
            ctx.enter_data_in(READ_HEADER_SIZE);
            return Ok(());
        }

        let mut response: Vec<u8> = Vec::new();
        while let Ok(packet) = link.rx.try_recv() {
            let more = !link.rx.is_empty();
            // Runt frames are padded to the Ethernet minimum
            let packet_len = packet.len().max(64);
            let frame_len = packet_len + 4;
            let limit = read_len.min(ctx.buffer.len());
            if response.len() + READ_HEADER_SIZE + frame_len > limit {
                log::error!(
                    "RX packet does not fit into read request of {} byte(s)",
                    read_len
                );
                return Err(ScsiError::aborted());
            }

            let checksum = FCS.checksum(&packet).to_be_bytes();
            response.push((frame_len >> 8) as u8);
            response.push(frame_len as u8);
            response.extend_from_slice(&[0, 0, 0]);
            response.push(if more { 0x10 } else { 0 });
            response.extend_from_slice(&packet);
            response.resize(response.len() + packet_len - packet.len(), 0);
            response.extend_from_slice(&checksum);

            if !more {
                break;
            }
        }

        ctx.buffer[..response.len()].copy_from_slice(&response);
        ctx.enter_data_in(response.len());
        Ok(())
    }

    fn tx_packet(&mut self, packet: &[u8]) {
        if let Some(link) = self.link.as_ref() {
            if let Err(e) = link.tx.try_send(packet.to_vec()) {
                log::error!("Failed to send packet: {:?}", e);
            }
        }
    }

    /// RETRIEVE STATISTICS: MAC address plus frame counters
    fn retrieve_statistics(&mut self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        let allocation_length = be16(&ctx.cdb, 3) as usize;

        let mut result = vec![0u8; 18];
        result[..6].copy_from_slice(&self.macaddress);

        let len = result.len().min(allocation_length);
        ctx.buffer[..len].copy_from_slice(&result[..len]);
        ctx.enter_data_in(len);
        Ok(())
    }
}

impl ScsiTarget for ScsiDaynaport {
    fn state(&self) -> &DeviceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut DeviceState {
        &mut self.state
    }

    fn target_type(&self) -> DeviceType {
        DeviceType::Daynaport
    }

    fn send_delay(&self) -> u32 {
        READ_HEADER_SIZE as u32
    }

    fn image_path(&self) -> Option<&Path> {
        None
    }

    fn inquiry_payload(&self) -> Vec<u8> {
        let mut buf = self.inquiry_common(INQUIRY_PROCESSOR, ScsiLevel::Scsi2, false);

        // One additional vendor byte
        buf.push(0x00);
        buf[4] += 1;

        buf
    }

    fn setup_mode_pages(&self, _pages: &mut BTreeMap<u8, Vec<u8>>, _page: u8, _changeable: bool) {}

    fn xfer_out(&mut self, ctx: &mut TransferCtx, _cont: bool) -> ScsiResult<()> {
        let opcode = ScsiCommand::from_u8(ctx.opcode());
        let received = ctx.offset;

        match opcode {
            Some(ScsiCommand::Write6) => {
                if ctx.cdb[5] & 0x80 != 0 {
                    // Length-prefixed frame format
                    let len = be16(&ctx.buffer, 0) as usize;
                    if received < len + 4 {
                        log::error!("Invalid write length {} with {} received", len, received);
                        return Err(ScsiError::aborted());
                    }
                    let packet = ctx.buffer[4..4 + len].to_vec();
                    self.tx_packet(&packet);
                } else {
                    let packet = ctx.buffer[..received].to_vec();
                    self.tx_packet(&packet);
                }
                ctx.blocks = 0;
                ctx.offset = 0;
                Ok(())
            }
            Some(ScsiCommand::SetIfaceMode) => {
                // Only the MAC-address subfunction carries data
                if received >= 6 {
                    self.macaddress.copy_from_slice(&ctx.buffer[..6]);
                    log::info!(
                        "MAC address set to {}",
                        format_mac(&self.macaddress)
                    );
                }
                ctx.blocks = 0;
                Ok(())
            }
            Some(ScsiCommand::SetMcastAddr) => {
                if received >= 6 {
                    let mut mac = [0u8; 6];
                    mac.copy_from_slice(&ctx.buffer[..6]);
                    if !self.multicast_groups.contains(&mac) {
                        log::info!("Subscribed to multicast group {}", format_mac(&mac));
                        self.multicast_groups.push(mac);
                    }
                }
                ctx.blocks = 0;
                Ok(())
            }
            _ => {
                log::warn!("Unexpected data-out completion for command ${:02X}", ctx.opcode());
                Ok(())
            }
        }
    }

    fn dispatch_specific(
        &mut self,
        ctx: &mut TransferCtx,
        opcode: u8,
    ) -> Option<ScsiResult<()>> {
        Some(match ScsiCommand::from_u8(opcode)? {
            ScsiCommand::TestUnitReady => {
                // The adapter is always ready
                ctx.enter_status();
                Ok(())
            }
            ScsiCommand::Read6 => self.read_packets(ctx),
            ScsiCommand::RetrieveStats => self.retrieve_statistics(ctx),
            ScsiCommand::Write6 => {
                let mut write_len = be16(&ctx.cdb, 3) as usize;
                if ctx.cdb[5] & 0x80 != 0 {
                    write_len += 8;
                }
                if write_len > ctx.buffer.len() {
                    return Some(Err(ScsiError::new(
                        SenseKey::IllegalRequest,
                        ASC_INVALID_FIELD_IN_CDB,
                    )));
                }
                ctx.enter_data_out(write_len);
                Ok(())
            }
            ScsiCommand::SetIfaceMode | ScsiCommand::SetMcastAddr => {
                let len = usize::from(ctx.cdb[4]).max(6);
                ctx.enter_data_out(len);
                Ok(())
            }
            ScsiCommand::EnableInterface => {
                let enable = ctx.cdb[5] & 0x80 != 0;
                log::debug!("Interface enable: {}", enable);

                if !self.enabled && enable {
                    // Drain stale packets
                    if let Some(link) = self.link.as_ref() {
                        while link.rx.try_recv().is_ok() {}
                    }
                }
                self.enabled = enable;

                ctx.enter_status();
                Ok(())
            }
            _ => return None,
        })
    }
}

fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::target::net::link_pair;

    fn ctx_with_cdb(cdb: &[u8]) -> TransferCtx {
        let mut ctx = crate::scsi::controller::test_ctx();
        ctx.cdb.try_extend_from_slice(cdb).unwrap();
        ctx
    }

    #[test]
    fn read_without_link_returns_empty_header() {
        let mut dp = ScsiDaynaport::new(0, 0);
        let mut ctx = ctx_with_cdb(&[0x08, 0, 0, 0x05, 0xF4, 0]);

        dp.dispatch(&mut ctx).unwrap();
        assert_eq!(ctx.length, READ_HEADER_SIZE);
        assert_eq!(&ctx.buffer[..6], &[0; 6]);
    }

    #[test]
    fn read_frames_queued_packet_with_fcs() {
        let mut dp = ScsiDaynaport::new(0, 0);
        let (link, peer) = link_pair();
        dp.set_link(link);

        let packet = vec![0xAAu8; 100];
        peer.tx.send(packet.clone()).unwrap();

        let mut ctx = ctx_with_cdb(&[0x08, 0, 0, 0x05, 0xF4, 0]);
        dp.dispatch(&mut ctx).unwrap();

        // Header: frame length = packet + FCS, no more packets queued
        let frame_len = ((ctx.buffer[0] as usize) << 8) | ctx.buffer[1] as usize;
        assert_eq!(frame_len, 104);
        assert_eq!(ctx.buffer[5], 0);
        assert_eq!(&ctx.buffer[6..106], packet.as_slice());
        assert_eq!(ctx.length, READ_HEADER_SIZE + frame_len);
    }

    #[test]
    fn write_transmits_packet() {
        let mut dp = ScsiDaynaport::new(0, 0);
        let (link, peer) = link_pair();
        dp.set_link(link);

        // Plain write of 42 bytes
        let mut ctx = ctx_with_cdb(&[0x0A, 0, 0, 0x00, 42, 0]);
        dp.dispatch(&mut ctx).unwrap();
        assert_eq!(ctx.length, 42);

        ctx.buffer[..42].copy_from_slice(&[0x55u8; 42]);
        ctx.offset = 42;
        dp.xfer_out(&mut ctx, false).unwrap();

        let sent = peer.rx.try_recv().unwrap();
        assert_eq!(sent, vec![0x55u8; 42]);
    }

    #[test]
    fn boot_probe_read_is_rejected() {
        let mut dp = ScsiDaynaport::new(0, 0);
        let mut ctx = ctx_with_cdb(&[0x08, 0, 0, 0x00, 0x01, 0]);

        assert!(dp.dispatch(&mut ctx).is_err());
    }

    #[test]
    fn mac_has_dayna_oui() {
        let dp = ScsiDaynaport::new(0, 0);
        assert_eq!(&dp.macaddress()[..3], &[0x00, 0x80, 0x19]);
    }
}
