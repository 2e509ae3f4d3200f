//! Packet plumbing shared by the network-facing targets
//!
//! The DaynaPort and host-bridge targets exchange Ethernet frames through a
//! pair of bounded channels. What sits on the other end (a TAP interface, a
//! user-space NAT, a test fixture) is up to the embedder.

use crossbeam_channel::{Receiver, Sender, bounded};

/// Maximum amount of packets to buffer in the RX/TX queues
pub const PACKET_QUEUE_SIZE: usize = 512;

/// Maximum Ethernet frame size accepted from the wire
pub const MAX_FRAME_SIZE: usize = 1514;

pub type Packet = Vec<u8>;

/// The device-facing end of a packet link
pub struct NetworkLink {
    /// Device -> network
    pub tx: Sender<Packet>,
    /// Network -> device
    pub rx: Receiver<Packet>,
}

/// The network-facing end of a packet link
pub struct LinkPeer {
    /// Packets sent by the device
    pub rx: Receiver<Packet>,
    /// Packets to deliver to the device
    pub tx: Sender<Packet>,
}

/// Creates a connected link, returning the device end and the peer end
pub fn link_pair() -> (NetworkLink, LinkPeer) {
    let (dev_tx, peer_rx) = bounded(PACKET_QUEUE_SIZE);
    let (peer_tx, dev_rx) = bounded(PACKET_QUEUE_SIZE);

    (
        NetworkLink {
            tx: dev_tx,
            rx: dev_rx,
        },
        LinkPeer {
            rx: peer_rx,
            tx: peer_tx,
        },
    )
}
