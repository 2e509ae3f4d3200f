//! Scripted in-memory bus for exercising the phase machine without hardware
//!
//! `ScriptBus` plays the initiator side of a transaction: it selects a
//! target, feeds queued CDB and message-out bytes, and records everything
//! the target sends back, classified by the signal levels the target drives
//! (status, message-in and data-in traffic are kept apart).

use std::collections::VecDeque;

use super::bus::{ScsiBus, Signal};

#[derive(Debug, Default)]
struct Signals {
    bsy: bool,
    sel: bool,
    atn: bool,
    ack: bool,
    req: bool,
    rst: bool,
    msg: bool,
    cd: bool,
    io: bool,
}

#[derive(Debug, Default)]
pub struct ScriptBus {
    signals: Signals,
    dat: u8,

    /// Queued CDBs, served by `command_handshake`
    cdbs: VecDeque<Vec<u8>>,
    /// Queued message-out bytes; ATN stays asserted while non-empty
    msg_out: VecDeque<u8>,

    status: Vec<u8>,
    msg_in: Vec<u8>,
    data_in: Vec<u8>,
    data_out: VecDeque<u8>,
}

impl ScriptBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a selection: SEL asserted, BSY clear, the target (and
    /// initiator) ID bits on the data lines.
    pub fn begin_selection(&mut self, id_bits: u8, atn: bool) {
        self.signals.sel = true;
        self.signals.bsy = false;
        self.dat = id_bits;
        self.signals.atn = atn;
    }

    pub fn queue_cdb(&mut self, cdb: &[u8]) {
        self.cdbs.push_back(cdb.to_vec());
    }

    pub fn queue_message_out(&mut self, msgs: &[u8]) {
        self.msg_out.extend(msgs.iter().copied());
        self.signals.atn = true;
    }

    /// Bytes the initiator will provide during a DataOut phase
    pub fn queue_data_out(&mut self, data: &[u8]) {
        self.data_out.extend(data.iter().copied());
    }

    pub fn assert_rst(&mut self) {
        self.signals.rst = true;
    }

    pub fn status_bytes(&self) -> &[u8] {
        &self.status
    }

    pub fn message_in_bytes(&self) -> &[u8] {
        &self.msg_in
    }

    pub fn data_in_bytes(&self) -> &[u8] {
        &self.data_in
    }

    /// True once every scripted stimulus has been consumed
    pub fn script_done(&self) -> bool {
        self.cdbs.is_empty() && self.msg_out.is_empty() && self.data_out.is_empty()
    }
}

impl ScsiBus for ScriptBus {
    fn acquire(&mut self) {}

    fn get_signal(&self, signal: Signal) -> bool {
        match signal {
            Signal::Bsy => self.signals.bsy,
            Signal::Sel => self.signals.sel,
            // ATN holds until the scripted message bytes are drained
            Signal::Atn => self.signals.atn && !self.msg_out.is_empty(),
            Signal::Ack => self.signals.ack,
            Signal::Req => self.signals.req,
            Signal::Rst => self.signals.rst,
            Signal::Msg => self.signals.msg,
            Signal::Cd => self.signals.cd,
            Signal::Io => self.signals.io,
        }
    }

    fn set_signal(&mut self, signal: Signal, asserted: bool) {
        match signal {
            Signal::Bsy => {
                self.signals.bsy = asserted;
                // The initiator releases SEL once the target responds with
                // BSY
                if asserted && self.signals.sel {
                    self.signals.sel = false;
                }
            }
            Signal::Sel => self.signals.sel = asserted,
            Signal::Atn => self.signals.atn = asserted,
            Signal::Ack => self.signals.ack = asserted,
            Signal::Req => self.signals.req = asserted,
            Signal::Rst => self.signals.rst = asserted,
            Signal::Msg => self.signals.msg = asserted,
            Signal::Cd => self.signals.cd = asserted,
            Signal::Io => self.signals.io = asserted,
        }
    }

    fn dat(&self) -> u8 {
        self.dat
    }

    fn set_dat(&mut self, value: u8) {
        self.dat = value;
    }

    fn command_handshake(&mut self, buffer: &mut [u8]) -> usize {
        let Some(cdb) = self.cdbs.pop_front() else {
            return 0;
        };

        let len = cdb.len().min(buffer.len());
        buffer[..len].copy_from_slice(&cdb[..len]);
        len
    }

    fn send_handshake(&mut self, buffer: &[u8], _send_delay: u32) -> usize {
        // Classify by the phase signals the target drives
        let sink = match (self.signals.msg, self.signals.cd, self.signals.io) {
            (true, true, true) => &mut self.msg_in,
            (false, true, true) => &mut self.status,
            (false, false, true) => &mut self.data_in,
            _ => return 0,
        };

        sink.extend_from_slice(buffer);
        buffer.len()
    }

    fn receive_handshake(&mut self, buffer: &mut [u8]) -> usize {
        let source = if self.signals.msg {
            &mut self.msg_out
        } else {
            &mut self.data_out
        };

        let mut read = 0;
        for slot in buffer.iter_mut() {
            match source.pop_front() {
                Some(b) => {
                    *slot = b;
                    read += 1;
                }
                None => break,
            }
        }
        read
    }

    fn reset(&mut self) {
        self.signals = Signals::default();
        self.dat = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_send_traffic() {
        let mut bus = ScriptBus::new();

        bus.set_signal(Signal::Cd, true);
        bus.set_signal(Signal::Io, true);
        assert_eq!(bus.send_handshake(&[0x00], 0), 1);

        bus.set_signal(Signal::Msg, true);
        assert_eq!(bus.send_handshake(&[0x80], 0), 1);

        assert_eq!(bus.status_bytes(), &[0x00]);
        assert_eq!(bus.message_in_bytes(), &[0x80]);
    }

    #[test]
    fn atn_drops_when_messages_are_drained() {
        let mut bus = ScriptBus::new();
        bus.begin_selection(0x01, true);
        bus.queue_message_out(&[0x80]);
        assert!(bus.get_atn());

        bus.set_signal(Signal::Msg, true);
        let mut buf = [0u8; 1];
        assert_eq!(bus.receive_handshake(&mut buf), 1);
        assert_eq!(buf[0], 0x80);
        assert!(!bus.get_atn());
    }
}
