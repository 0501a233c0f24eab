//! Datagram transport over a shared tokio UDP socket.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use octstream_core::{ClientId, Transport};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

type SpecialQueues = HashMap<ClientId, VecDeque<Vec<u8>>>;

/// Sends stream packets without blocking the worker that produced them.
///
/// A datagram the socket cannot take right now is dropped and reported as 0
/// bytes sent, the same as any other datagram loss.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    special: Mutex<SpecialQueues>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            special: Mutex::new(HashMap::new()),
        }
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    /// Queue a one-off packet to go out with `client`'s next cycle.
    pub fn queue_special(&self, client: ClientId, bytes: Vec<u8>) {
        self.queues().entry(client).or_default().push_back(bytes);
    }

    /// Forget any queued one-off packets for a departed client.
    pub fn clear_special(&self, client: ClientId) {
        self.queues().remove(&client);
    }

    fn queues(&self) -> MutexGuard<'_, SpecialQueues> {
        self.special.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for UdpTransport {
    fn send(&self, bytes: &[u8], client: SocketAddr) -> usize {
        match self.socket.try_send_to(bytes, client) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("socket busy, dropped {} bytes for {}", bytes.len(), client);
                0
            }
            Err(e) => {
                warn!("send to {} failed: {}", client, e);
                0
            }
        }
    }

    fn has_special_packet_pending(&self, client: ClientId) -> bool {
        self.queues().get(&client).is_some_and(|q| !q.is_empty())
    }

    fn take_special_packet(&self, client: ClientId) -> Option<Vec<u8>> {
        let mut queues = self.queues();
        let queue = queues.get_mut(&client)?;
        let bytes = queue.pop_front();
        if queue.is_empty() {
            queues.remove(&client);
        }
        bytes
    }
}
