//! Physical bus contract
//!
//! The daemon drives a real SCSI bus through GPIO; everything the controller
//! needs from that layer is captured in the [`ScsiBus`] trait. Handshake
//! primitives transfer whole buffers and report how many bytes actually
//! moved; a short transfer means the initiator walked away mid-phase.

/// No artificial delay during a send handshake
pub const SEND_NO_DELAY: u32 = 0;

/// Bus signal lines sampled and driven by the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Bsy,
    Sel,
    Atn,
    Ack,
    Req,
    Rst,
    Msg,
    Cd,
    Io,
}

pub trait ScsiBus: Send {
    /// Sample all signals atomically. Signal getters below return the state
    /// captured by the most recent acquire.
    fn acquire(&mut self);

    fn get_signal(&self, signal: Signal) -> bool;
    fn set_signal(&mut self, signal: Signal, asserted: bool);

    /// Current value of the 8 data lines
    fn dat(&self) -> u8;
    fn set_dat(&mut self, value: u8);

    /// Receives a CDB during the command phase. Returns the number of bytes
    /// actually read.
    fn command_handshake(&mut self, buffer: &mut [u8]) -> usize;

    /// Target -> initiator transfer. `send_delay` is the byte offset after
    /// which the HAL inserts its device-specific pause ([`SEND_NO_DELAY`]
    /// for none). Returns the number of bytes written.
    fn send_handshake(&mut self, buffer: &[u8], send_delay: u32) -> usize;

    /// Initiator -> target transfer. Returns the number of bytes read.
    fn receive_handshake(&mut self, buffer: &mut [u8]) -> usize;

    /// Blocks until a selection event is seen, where the HAL supports it.
    /// Returns false when interrupted.
    fn poll_select_event(&mut self) -> bool {
        true
    }

    /// Drive all lines back to idle
    fn reset(&mut self);

    fn get_bsy(&self) -> bool {
        self.get_signal(Signal::Bsy)
    }
    fn get_sel(&self) -> bool {
        self.get_signal(Signal::Sel)
    }
    fn get_atn(&self) -> bool {
        self.get_signal(Signal::Atn)
    }
    fn get_rst(&self) -> bool {
        self.get_signal(Signal::Rst)
    }

    fn set_bsy(&mut self, v: bool) {
        self.set_signal(Signal::Bsy, v);
    }
    fn set_req(&mut self, v: bool) {
        self.set_signal(Signal::Req, v);
    }
    fn set_msg(&mut self, v: bool) {
        self.set_signal(Signal::Msg, v);
    }
    fn set_cd(&mut self, v: bool) {
        self.set_signal(Signal::Cd, v);
    }
    fn set_io(&mut self, v: bool) {
        self.set_signal(Signal::Io, v);
    }
}

/// Bus stand-in for hosts without bus hardware. No selection ever occurs,
/// only the control interface is functional.
#[derive(Default)]
pub struct NullBus;

impl ScsiBus for NullBus {
    fn acquire(&mut self) {}

    fn get_signal(&self, _signal: Signal) -> bool {
        false
    }

    fn set_signal(&mut self, _signal: Signal, _asserted: bool) {}

    fn dat(&self) -> u8 {
        0
    }

    fn set_dat(&mut self, _value: u8) {}

    fn command_handshake(&mut self, _buffer: &mut [u8]) -> usize {
        0
    }

    fn send_handshake(&mut self, _buffer: &[u8], _send_delay: u32) -> usize {
        0
    }

    fn receive_handshake(&mut self, _buffer: &mut [u8]) -> usize {
        0
    }

    fn poll_select_event(&mut self) -> bool {
        std::thread::sleep(std::time::Duration::from_millis(10));
        false
    }

    fn reset(&mut self) {}
}
