//! The datagram seam between the streaming core and the network.

use std::net::SocketAddr;

/// Unique identifier for a connected client.
pub type ClientId = u64;

/// Outbound datagram transport.
pub trait Transport: Send + Sync {
    /// Send one datagram. Returns the bytes handed to the network, 0 if the
    /// datagram was dropped.
    fn send(&self, bytes: &[u8], client: SocketAddr) -> usize;

    /// Whether a one-off packet (for example environment data) is queued for
    /// `client`.
    fn has_special_packet_pending(&self, client: ClientId) -> bool;

    /// Dequeue the next one-off packet for `client`.
    fn take_special_packet(&self, client: ClientId) -> Option<Vec<u8>>;
}

/// Which kind of tree content a server streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataKind {
    #[default]
    Voxels,
    Particles,
    Models,
}

impl DataKind {
    /// Packet type byte used for this kind's stream packets.
    pub fn packet_type(self) -> u8 {
        match self {
            DataKind::Voxels => 0x10,
            DataKind::Particles => 0x11,
            DataKind::Models => 0x12,
        }
    }
}

/// Per-server-type capabilities handed to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProfile {
    pub packet_type: u8,
    pub data_kind: DataKind,
}

impl StreamProfile {
    pub fn new(data_kind: DataKind) -> Self {
        Self {
            packet_type: data_kind.packet_type(),
            data_kind,
        }
    }
}

impl Default for StreamProfile {
    fn default() -> Self {
        Self::new(DataKind::default())
    }
}
