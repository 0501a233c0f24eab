//! Hands finished packets to the transport.
//!
//! The sender owns the last decision before bytes leave: drop a duplicate,
//! piggyback a pending scene summary, or send the voxel packet on its own.
//! Every real send advances the session's sequence number and resets its
//! packet.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use crate::metrics::StreamMetrics;
use crate::session::{ClientStreamSession, usec_timestamp_now};
use crate::transport::{ClientId, StreamProfile, Transport};

/// Bytes and wire units actually transmitted during one distributor call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendTally {
    pub true_bytes: usize,
    pub true_packets: usize,
}

impl SendTally {
    fn add(&mut self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        self.true_bytes += bytes;
        self.true_packets += 1;
    }
}

/// Sends one session's packets and keeps running totals.
pub struct PacketSender {
    transport: Arc<dyn Transport>,
    metrics: Arc<dyn StreamMetrics>,
    profile: StreamProfile,
    mtu: usize,
    debug_sending: bool,
    total_bytes: u64,
    total_packets: u64,
    total_wasted_bytes: u64,
}

impl PacketSender {
    pub fn new(
        transport: Arc<dyn Transport>,
        metrics: Arc<dyn StreamMetrics>,
        profile: StreamProfile,
        mtu: usize,
    ) -> Self {
        Self {
            transport,
            metrics,
            profile,
            mtu,
            debug_sending: false,
            total_bytes: 0,
            total_packets: 0,
            total_wasted_bytes: 0,
        }
    }

    /// Log every datagram at debug level.
    pub fn with_debug_sending(mut self, debug_sending: bool) -> Self {
        self.debug_sending = debug_sending;
        self
    }

    /// Flush the session's packet, plus a ready scene summary, using at most
    /// `max_units` datagrams. Returns how many datagrams went out.
    pub fn send(
        &mut self,
        session: &mut ClientStreamSession,
        tally: &mut SendTally,
        max_units: usize,
    ) -> usize {
        if session.is_shutting_down() || max_units == 0 {
            return 0;
        }
        if !session.is_packet_waiting() {
            return self.send_stats_alone(session, tally);
        }

        if session.should_suppress_duplicate_packet() {
            if self.debug_sending {
                debug!(
                    "suppressing duplicate packet for client {} (count {})",
                    session.client_id(),
                    session.duplicate_packet_count()
                );
            }
            session.reset_outbound_packet();
            return 0;
        }

        let client = session.client_id();
        let address = session.address();
        let sequence = session.packet().sequence();
        let compressed = session.packet().flags().compressed;
        let voxel_wire = session
            .packet()
            .to_wire(self.profile.packet_type, usec_timestamp_now());
        let mut units = 0;

        let voxel_sent = match session.stats().message().map(<[u8]>::to_vec) {
            Some(mut stats) if stats.len() + voxel_wire.len() < self.mtu => {
                stats.extend_from_slice(&voxel_wire);
                let sent = self.transport.send(&stats, address);
                self.account(client, sequence, sent, 0, "piggybacked");
                session.stats_mut().mark_as_sent();
                sent
            }
            Some(stats) if max_units >= 2 => {
                let sent = self.transport.send(&stats, address);
                self.account(client, sequence, sent, 0, "stats");
                tally.add(sent);
                units += 1;
                session.stats_mut().mark_as_sent();
                self.send_voxel(client, sequence, address, &voxel_wire, compressed)
            }
            // A summary that needs its own datagram waits for a send with
            // budget for two.
            _ => self.send_voxel(client, sequence, address, &voxel_wire, compressed),
        };

        if voxel_sent > 0 {
            session.stats_mut().packet_sent(voxel_sent);
        }
        tally.add(voxel_sent);
        units += 1;
        session.increment_sequence();
        session.reset_outbound_packet();
        units
    }

    fn send_voxel(
        &mut self,
        client: ClientId,
        sequence: u32,
        address: SocketAddr,
        wire: &[u8],
        compressed: bool,
    ) -> usize {
        let sent = self.transport.send(wire, address);
        let wasted = if sent == 0 { 0 } else { self.wasted(sent, compressed) };
        self.account(client, sequence, sent, wasted, "voxel");
        sent
    }

    /// With no voxel content waiting, a ready summary goes out on its own.
    /// The voxel sequence number is left alone.
    fn send_stats_alone(&mut self, session: &mut ClientStreamSession, tally: &mut SendTally) -> usize {
        let Some(stats) = session.stats().message().map(<[u8]>::to_vec) else {
            return 0;
        };
        let sent = self.transport.send(&stats, session.address());
        self.account(session.client_id(), session.sequence(), sent, 0, "stats");
        tally.add(sent);
        session.stats_mut().mark_as_sent();
        1
    }

    /// Send one queued special packet for the session, if any. Returns the
    /// number of datagrams sent.
    pub fn send_special(&mut self, session: &ClientStreamSession, tally: &mut SendTally) -> usize {
        let client = session.client_id();
        if session.is_shutting_down() || !self.transport.has_special_packet_pending(client) {
            return 0;
        }
        let Some(bytes) = self.transport.take_special_packet(client) else {
            return 0;
        };
        let sent = self.transport.send(&bytes, session.address());
        self.account(client, session.sequence(), sent, 0, "special");
        tally.add(sent);
        1
    }

    fn wasted(&self, len: usize, compressed: bool) -> usize {
        if compressed {
            0
        } else {
            self.mtu.saturating_sub(len)
        }
    }

    /// Count `len` bytes handed to the network. 0 means the transport
    /// dropped the datagram.
    fn account(&mut self, client: ClientId, sequence: u32, len: usize, wasted: usize, kind: &str) {
        if len == 0 {
            if self.debug_sending {
                debug!(
                    "{} packet to client {} dropped by transport: sequence {}",
                    kind, client, sequence
                );
            }
            return;
        }
        self.total_bytes += len as u64;
        self.total_packets += 1;
        self.total_wasted_bytes += wasted as u64;
        self.metrics.record_packet_sent(len, wasted);
        if self.debug_sending {
            debug!(
                "sent {} packet to client {} [{}]: sequence {} size {} [{}] wasted {} [{}]",
                kind,
                client,
                self.total_packets,
                sequence,
                len,
                self.total_bytes,
                wasted,
                self.total_wasted_bytes
            );
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn total_packets(&self) -> u64 {
        self.total_packets
    }

    pub fn total_wasted_bytes(&self) -> u64 {
        self.total_wasted_bytes
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::StreamCounters;
    use crate::packet::parse_packet;
    use crate::query::ClientQuery;
    use crate::session::SessionHandle;
    use crate::stats::StatsSummary;
    use crate::testing::RecordingTransport;

    fn setup(mtu: usize) -> (
        PacketSender,
        Arc<RecordingTransport>,
        Arc<StreamCounters>,
        ClientStreamSession,
        SessionHandle,
    ) {
        let transport = Arc::new(RecordingTransport::default());
        let counters = Arc::new(StreamCounters::new());
        let sender = PacketSender::new(
            transport.clone(),
            counters.clone(),
            StreamProfile::default(),
            mtu,
        );
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let (mut session, handle) = ClientStreamSession::new(7, addr, ClientQuery::default(), mtu);
        // The first pull always moves off the default frustum; the second
        // leaves the view settled.
        session.update_current_view_frustum();
        session.update_current_view_frustum();
        (sender, transport, counters, session, handle)
    }

    #[test]
    fn test_send_advances_sequence_and_resets() {
        let (mut sender, transport, counters, mut session, _h) = setup(1450);
        let mut tally = SendTally::default();

        session.write_to_outbound_packet(b"first");
        assert_eq!(sender.send(&mut session, &mut tally, 10), 1);
        session.write_to_outbound_packet(b"second");
        assert_eq!(sender.send(&mut session, &mut tally, 10), 1);

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        let (h0, p0) = parse_packet(&sent[0]).unwrap();
        let (h1, p1) = parse_packet(&sent[1]).unwrap();
        assert_eq!(h1.sequence, h0.sequence + 1);
        assert_eq!(p0, b"first");
        assert_eq!(p1, b"second");
        assert!(!session.is_packet_waiting());
        assert_eq!(tally.true_packets, 2);
        assert_eq!(tally.true_bytes, sent[0].len() + sent[1].len());

        let snapshot = counters.snapshot_and_reset();
        assert_eq!(snapshot.packets_sent, 2);
        assert_eq!(
            snapshot.wasted_bytes as usize,
            2 * 1450 - sent[0].len() - sent[1].len()
        );
    }

    #[test]
    fn test_nothing_waiting_sends_nothing() {
        let (mut sender, transport, _c, mut session, _h) = setup(1450);
        let mut tally = SendTally::default();
        assert_eq!(sender.send(&mut session, &mut tally, 10), 0);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_stats_alone_keeps_sequence() {
        let (mut sender, transport, _c, mut session, _h) = setup(1450);
        let mut tally = SendTally::default();
        session.stats_mut().scene_started(false, false, 1);
        session.stats_mut().scene_completed();

        assert_eq!(sender.send(&mut session, &mut tally, 10), 1);
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let (_, rest) = StatsSummary::from_message(&sent[0]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(session.sequence(), 0);
        assert!(!session.stats().is_ready_to_send());
    }

    #[test]
    fn test_duplicate_is_suppressed_without_sequence_bump() {
        let (mut sender, transport, _c, mut session, _h) = setup(1450);
        let mut tally = SendTally::default();

        session.write_to_outbound_packet(b"static scene");
        sender.send(&mut session, &mut tally, 10);
        let sequence = session.sequence();

        session.write_to_outbound_packet(b"static scene");
        assert_eq!(sender.send(&mut session, &mut tally, 10), 0);
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(session.sequence(), sequence);
        assert_eq!(session.duplicate_packet_count(), 1);
        assert!(!session.is_packet_waiting());
    }

    #[test]
    fn test_stats_piggyback_on_small_packet() {
        let (mut sender, transport, _c, mut session, _h) = setup(1450);
        let mut tally = SendTally::default();
        session.stats_mut().scene_started(true, false, 1);
        session.stats_mut().scene_completed();
        session.write_to_outbound_packet(b"voxels");

        assert_eq!(sender.send(&mut session, &mut tally, 10), 1);
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let (summary, rest) = StatsSummary::from_message(&sent[0]).unwrap();
        assert!(summary.is_full_scene);
        let (_, payload) = parse_packet(rest).unwrap();
        assert_eq!(payload, b"voxels");
        assert!(!session.stats().is_ready_to_send());
    }

    #[test]
    fn test_stats_sent_separately_when_combined_too_large() {
        let (mut sender, transport, _c, mut session, _h) = setup(100);
        let mut tally = SendTally::default();
        session.stats_mut().scene_started(false, false, 1);
        session.stats_mut().scene_completed();
        let room = session.packet().available();
        session.write_to_outbound_packet(&vec![5u8; room]);

        assert_eq!(sender.send(&mut session, &mut tally, 10), 2);
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(StatsSummary::from_message(&sent[0]).is_ok());
        assert_eq!(sent[1].len(), 100);
        assert_eq!(tally.true_packets, 2);
    }

    #[test]
    fn test_single_unit_budget_defers_stats() {
        let (mut sender, transport, _c, mut session, _h) = setup(100);
        let mut tally = SendTally::default();
        session.stats_mut().scene_started(false, false, 1);
        session.stats_mut().scene_completed();
        let room = session.packet().available();
        session.write_to_outbound_packet(&vec![5u8; room]);

        assert_eq!(sender.send(&mut session, &mut tally, 1), 1);
        assert_eq!(transport.sent().len(), 1);
        assert!(session.stats().is_ready_to_send());
    }

    #[test]
    fn test_zero_budget_defers_everything() {
        let (mut sender, transport, _c, mut session, _h) = setup(1450);
        let mut tally = SendTally::default();
        session.write_to_outbound_packet(b"later");
        assert_eq!(sender.send(&mut session, &mut tally, 0), 0);
        assert!(transport.sent().is_empty());
        assert!(session.is_packet_waiting());
    }

    #[test]
    fn test_special_packet_is_sent_once() {
        let (mut sender, transport, _c, session, _h) = setup(1450);
        let mut tally = SendTally::default();
        transport.queue_special(7, b"environment".to_vec());

        assert_eq!(sender.send_special(&session, &mut tally), 1);
        assert_eq!(sender.send_special(&session, &mut tally), 0);
        assert_eq!(transport.sent(), vec![b"environment".to_vec()]);
        assert_eq!(tally.true_bytes, 11);
    }

    #[test]
    fn test_dropped_datagram_is_not_counted() {
        let (mut sender, transport, counters, mut session, _h) = setup(1450);
        let mut tally = SendTally::default();
        transport.set_dropping(true);

        session.write_to_outbound_packet(b"lost");
        assert_eq!(sender.send(&mut session, &mut tally, 10), 1);
        assert_eq!(tally, SendTally::default());
        assert_eq!(sender.total_bytes(), 0);
        assert_eq!(sender.total_packets(), 0);
        let snapshot = counters.snapshot_and_reset();
        assert_eq!(snapshot.packets_sent, 0);
        assert_eq!(snapshot.bytes_sent, 0);
        assert_eq!(snapshot.wasted_bytes, 0);
        // The sequence still moves on so the client can see the gap.
        assert_eq!(session.sequence(), 1);
        assert!(!session.is_packet_waiting());

        transport.set_dropping(false);
        session.write_to_outbound_packet(b"kept");
        sender.send(&mut session, &mut tally, 10);
        assert_eq!(tally.true_packets, 1);
        assert_eq!(tally.true_bytes, transport.sent()[0].len());
    }

    #[test]
    fn test_shut_down_session_sends_nothing() {
        let (mut sender, transport, _c, mut session, handle) = setup(1450);
        let mut tally = SendTally::default();
        session.write_to_outbound_packet(b"data");
        handle.shutdown();
        assert_eq!(sender.send(&mut session, &mut tally, 10), 0);
        assert!(transport.sent().is_empty());
    }
}
