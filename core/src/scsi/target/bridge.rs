//! Host bridge device (SCBR): MAC address and raw packet-frame exchange
//!
//! The bridge exposes GET MESSAGE(10)/SEND MESSAGE(10) for Ethernet frame
//! transfer. The historical file-system pass-through of this device class is
//! not part of this implementation.

use std::collections::BTreeMap;
use std::path::Path;

use num_traits::FromPrimitive;

use super::net::{MAX_FRAME_SIZE, NetworkLink};
use super::{DeviceState, DeviceType, INQUIRY_COMMUNICATIONS, ScsiLevel, ScsiTarget};
use crate::scsi::controller::TransferCtx;
use crate::scsi::{
    ASC_INVALID_FIELD_IN_CDB, ScsiCommand, ScsiError, ScsiResult, SenseKey, be24,
};

// GET/SEND MESSAGE(10) functions
const FUNC_PACKET: u8 = 1;
const FUNC_MACADDR: u8 = 2;

pub struct ScsiBridge {
    state: DeviceState,
    macaddress: [u8; 6],
    link: Option<NetworkLink>,
}

impl ScsiBridge {
    pub fn new(id: u8, lun: u8) -> Self {
        let mut state = DeviceState::new(id, lun);
        state.supports_params = true;
        state.ready = true;

        Self {
            state,
            macaddress: [0x00, 0x00, 0xA7, 0x00, 0x00, (id << 4) | lun],
            link: None,
        }
    }

    pub fn set_link(&mut self, link: NetworkLink) {
        self.link = Some(link);
    }

    /// GET MESSAGE(10): either the next queued packet (2-byte length
    /// header, 0 when the queue is empty) or the MAC address
    fn get_message(&mut self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        match ctx.cdb[2] {
            FUNC_PACKET => {
                let packet = self
                    .link
                    .as_ref()
                    .and_then(|link| link.rx.try_recv().ok());

                match packet {
                    Some(packet) => {
                        ctx.buffer[0] = (packet.len() >> 8) as u8;
                        ctx.buffer[1] = packet.len() as u8;
                        ctx.buffer[2..2 + packet.len()].copy_from_slice(&packet);
                        ctx.enter_data_in(2 + packet.len());
                    }
                    None => {
                        ctx.buffer[..2].fill(0);
                        ctx.enter_data_in(2);
                    }
                }
                Ok(())
            }
            FUNC_MACADDR => {
                ctx.buffer[..6].copy_from_slice(&self.macaddress);
                ctx.enter_data_in(6);
                Ok(())
            }
            _ => Err(ScsiError::new(
                SenseKey::IllegalRequest,
                ASC_INVALID_FIELD_IN_CDB,
            )),
        }
    }

    /// SEND MESSAGE(10): a packet to transmit or a new MAC address
    fn send_message(&mut self, ctx: &mut TransferCtx) -> ScsiResult<()> {
        let len = be24(&ctx.cdb, 6) as usize;

        match ctx.cdb[2] {
            FUNC_PACKET => {
                if len == 0 || len > MAX_FRAME_SIZE {
                    return Err(ScsiError::new(
                        SenseKey::IllegalRequest,
                        ASC_INVALID_FIELD_IN_CDB,
                    ));
                }
                ctx.enter_data_out(len);
                Ok(())
            }
            FUNC_MACADDR => {
                if len < 6 {
                    return Err(ScsiError::new(
                        SenseKey::IllegalRequest,
                        ASC_INVALID_FIELD_IN_CDB,
                    ));
                }
                ctx.enter_data_out(len);
                Ok(())
            }
            _ => Err(ScsiError::new(
                SenseKey::IllegalRequest,
                ASC_INVALID_FIELD_IN_CDB,
            )),
        }
    }
}

impl ScsiTarget for ScsiBridge {
    fn state(&self) -> &DeviceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut DeviceState {
        &mut self.state
    }

    fn target_type(&self) -> DeviceType {
        DeviceType::Bridge
    }

    fn image_path(&self) -> Option<&Path> {
        None
    }

    fn inquiry_payload(&self) -> Vec<u8> {
        let mut buf = self.inquiry_common(INQUIRY_COMMUNICATIONS, ScsiLevel::Scsi2, false);

        // The bridge returns 6 more additional bytes than the other devices
        buf.resize(0x1F + 8 + 5, 0);
        buf[4] = 0x1F + 8;

        // Optional function flags: TAP enable, file system pass-through
        // disabled
        buf[36] = b'0';
        buf[37] = if self.link.is_some() { b'1' } else { b'0' };
        buf[38] = b'0';

        buf
    }

    fn setup_mode_pages(&self, _pages: &mut BTreeMap<u8, Vec<u8>>, _page: u8, _changeable: bool) {}

    fn xfer_out(&mut self, ctx: &mut TransferCtx, _cont: bool) -> ScsiResult<()> {
        let received = ctx.offset;

        match ScsiCommand::from_u8(ctx.opcode()) {
            Some(ScsiCommand::Write10) => match ctx.cdb[2] {
                FUNC_PACKET => {
                    if let Some(link) = self.link.as_ref() {
                        if let Err(e) = link.tx.try_send(ctx.buffer[..received].to_vec()) {
                            log::error!("Failed to send packet: {:?}", e);
                            return Err(ScsiError::aborted());
                        }
                    }
                    ctx.blocks = 0;
                    Ok(())
                }
                FUNC_MACADDR => {
                    self.macaddress.copy_from_slice(&ctx.buffer[..6]);
                    ctx.blocks = 0;
                    Ok(())
                }
                _ => Err(ScsiError::aborted()),
            },
            _ => {
                log::warn!(
                    "Unexpected data-out completion for command ${:02X}",
                    ctx.opcode()
                );
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
                // The bridge is always ready
                ctx.enter_status();
                Ok(())
            }
            // GET MESSAGE(10) shares its opcode with READ(10)
            ScsiCommand::Read10 => self.get_message(ctx),
            // SEND MESSAGE(10) shares its opcode with WRITE(10)
            ScsiCommand::Write10 => self.send_message(ctx),
            _ => return None,
        })
    }
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
    fn inquiry_has_capability_tail() {
        let bridge = ScsiBridge::new(6, 0);
        let payload = bridge.inquiry_payload();

        assert_eq!(payload.len(), 44);
        assert_eq!(payload[0], INQUIRY_COMMUNICATIONS);
        assert_eq!(payload[4], 0x27);
        assert_eq!(payload[37], b'0');
    }

    #[test]
    fn get_message_returns_queued_packet() {
        let mut bridge = ScsiBridge::new(6, 0);
        let (link, peer) = link_pair();
        bridge.set_link(link);

        peer.tx.send(vec![1, 2, 3, 4]).unwrap();

        let mut ctx = ctx_with_cdb(&[0x28, 0, FUNC_PACKET, 0, 0, 0, 0, 0x06, 0x00, 0]);
        bridge.dispatch(&mut ctx).unwrap();

        assert_eq!(&ctx.buffer[..6], &[0, 4, 1, 2, 3, 4]);
        assert_eq!(ctx.length, 6);
    }

    #[test]
    fn get_mac_address() {
        let mut bridge = ScsiBridge::new(6, 0);
        let mut ctx = ctx_with_cdb(&[0x28, 0, FUNC_MACADDR, 0, 0, 0, 0, 0, 6, 0]);

        bridge.dispatch(&mut ctx).unwrap();
        assert_eq!(ctx.length, 6);
        assert_eq!(&ctx.buffer[..3], &[0x00, 0x00, 0xA7]);
    }

    #[test]
    fn unknown_function_is_rejected() {
        let mut bridge = ScsiBridge::new(6, 0);
        let mut ctx = ctx_with_cdb(&[0x28, 0, 9, 0, 0, 0, 0, 0, 6, 0]);

        assert!(bridge.dispatch(&mut ctx).is_err());
    }
}
