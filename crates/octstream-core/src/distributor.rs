//! The per-cycle packing algorithm.
//!
//! Each call decides whether the client's scene restarts, then pulls nodes
//! from the visit bag, has the tree encode them into the assembler, moves
//! finished sections into the outbound packet and sends packets until the bag
//! is empty or the cycle's packet budget is used up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::assembler::PacketAssembler;
use crate::metrics::{Phase, StreamMetrics};
use crate::packet::{DEFAULT_MTU, SECTION_PREFIX_LEN, STREAM_HEADER_LEN};
use crate::sender::{PacketSender, SendTally};
use crate::session::ClientStreamSession;
use crate::transport::{StreamProfile, Transport};
use crate::tree::{Jurisdiction, SharedTree, read_tree};

/// Headroom below which a compressed packet is sent instead of packed further.
pub const MINIMUM_ATTEMPT_MORE_PACKING: usize = SECTION_PREFIX_LEN + 40;

/// Extra compressed sections tried before a packet is sent anyway.
pub const REASONABLE_NUMBER_OF_PACKING_ATTEMPTS: u32 = 5;

/// Slack for small inputs that grow when compressed.
pub const COMPRESS_PADDING: usize = 15;

/// Boundary level coarsening while the camera moves.
pub const LOW_RES_MOVING_ADJUST: i32 = 1;

pub const DEFAULT_INTERVALS_PER_SECOND: u32 = 60;

/// Server-side packets-per-second cap for each client.
pub const DEFAULT_SERVER_MAX_PACKETS_PER_SECOND: u32 = 1000;

const ROOT_PRIORITY: f32 = f32::MAX;

/// How the visit bag is seeded when a scene restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReseedPolicy {
    /// Always queue the root again.
    #[default]
    Always,
    /// Queue the root only if the bag is empty.
    WhenEmpty,
}

/// Streaming parameters shared by every session on a server.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Datagram size budget in bytes.
    pub mtu: usize,
    pub intervals_per_second: u32,
    pub server_max_packets_per_second: u32,
    /// Shortest pause between worker cycles.
    pub min_sleep: Duration,
    pub reseed: ReseedPolicy,
    /// Log every packet at debug level.
    pub debug_sending: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            intervals_per_second: DEFAULT_INTERVALS_PER_SECOND,
            server_max_packets_per_second: DEFAULT_SERVER_MAX_PACKETS_PER_SECOND,
            min_sleep: Duration::from_micros(1),
            reseed: ReseedPolicy::Always,
            debug_sending: false,
        }
    }
}

impl StreamConfig {
    /// Target time between worker cycles.
    pub fn send_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.intervals_per_second.max(1)))
    }

    /// Packets a client may receive in one cycle: the smaller of its own
    /// request and the server cap, each at least one.
    pub fn packets_per_interval(&self, client_packets_per_second: u32) -> usize {
        let intervals = self.intervals_per_second.max(1);
        let client = (client_packets_per_second / intervals).max(1);
        let server = (self.server_max_packets_per_second / intervals).max(1);
        client.min(server) as usize
    }
}

/// What one [`Distributor::distribute`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Datagrams counted against this cycle's budget, special packets
    /// included.
    pub packets_this_interval: usize,
    pub true_packets: usize,
    pub true_bytes: usize,
    pub encode_calls: usize,
    /// The scene restarted from the root.
    pub scene_restarted: bool,
    /// The visit bag drained and the view was marked sent.
    pub scene_completed: bool,
}

// ---------------------------------------------------------------------------
// Distributor
// ---------------------------------------------------------------------------

/// Drives encode, pack and send for the session its worker owns.
pub struct Distributor {
    tree: SharedTree,
    config: StreamConfig,
    assembler: PacketAssembler,
    sender: PacketSender,
    metrics: Arc<dyn StreamMetrics>,
    jurisdiction: Option<Jurisdiction>,
}

impl Distributor {
    pub fn new(
        tree: SharedTree,
        transport: Arc<dyn Transport>,
        metrics: Arc<dyn StreamMetrics>,
        profile: StreamProfile,
        config: StreamConfig,
    ) -> Self {
        let sender = PacketSender::new(transport, Arc::clone(&metrics), profile, config.mtu)
            .with_debug_sending(config.debug_sending);
        let assembler = PacketAssembler::new(false, config.mtu.saturating_sub(STREAM_HEADER_LEN));
        Self {
            tree,
            config,
            assembler,
            sender,
            metrics,
            jurisdiction: None,
        }
    }

    /// Limit encoding to the region this server owns.
    pub fn with_jurisdiction(mut self, jurisdiction: Jurisdiction) -> Self {
        self.jurisdiction = Some(jurisdiction);
        self
    }

    pub fn tree(&self) -> &SharedTree {
        &self.tree
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn sender(&self) -> &PacketSender {
        &self.sender
    }

    /// Run one cycle for `session`. `view_changed` is the result of this
    /// cycle's [`ClientStreamSession::update_current_view_frustum`].
    pub fn distribute(&mut self, session: &mut ClientStreamSession, view_changed: bool) -> CycleReport {
        let mut report = CycleReport::default();
        if session.is_shutting_down() {
            return report;
        }

        let mut tally = SendTally::default();
        let mut packets = 0;
        let budget = self
            .config
            .packets_per_interval(session.query().max_packets_per_second);

        let is_full_scene = session.view_just_stopped_changing() || session.has_lod_changed();
        let want_delta = view_changed && session.query().want_delta;

        // The packet's flags are locked while it holds content.
        if !session.packet_format_matches() {
            if self.assembler.has_content() {
                self.write_assembled(session, &mut tally, &mut packets, budget);
            }
            if session.is_packet_waiting() {
                packets += self.sender.send(session, &mut tally, budget.saturating_sub(packets));
            } else {
                session.reset_outbound_packet();
            }
            if !session.is_packet_waiting() {
                self.retarget(session);
            }
        } else if self.assembler.is_compressed() != session.packet().flags().compressed {
            self.retarget(session);
        }

        let root_version = read_tree(&self.tree).root_last_changed();
        let restart_due = session.bag().is_empty()
            && (!session.is_view_sent()
                || is_full_scene
                || root_version != session.last_root_version());

        if view_changed || session.lod_just_changed() || restart_due {
            self.restart_scene(
                session,
                view_changed,
                is_full_scene,
                root_version,
                &mut tally,
                &mut packets,
                budget,
            );
            report.scene_restarted = true;
        } else if session.bag().is_empty()
            && (session.is_packet_waiting() || session.stats().is_ready_to_send())
        {
            // Content held back by an earlier cycle's budget, or the summary
            // of the scene that just completed.
            packets += self.sender.send(session, &mut tally, budget.saturating_sub(packets));
        }

        if !session.bag().is_empty() {
            report.encode_calls = self.pack_and_send(
                session,
                view_changed,
                want_delta,
                is_full_scene,
                &mut tally,
                &mut packets,
                budget,
            );

            if session.bag().is_empty() {
                session.update_last_known_view_frustum();
                session.set_view_sent(true);
                session.coverage_mut().erase();
                session.stats_mut().scene_completed();
                session.close_search();
                report.scene_completed = true;
            }
        }

        packets += self.sender.send_special(session, &mut tally);

        report.packets_this_interval = packets;
        report.true_packets = tally.true_packets;
        report.true_bytes = tally.true_bytes;
        report
    }

    #[allow(clippy::too_many_arguments)]
    fn restart_scene(
        &mut self,
        session: &mut ClientStreamSession,
        view_changed: bool,
        is_full_scene: bool,
        root_version: u64,
        tally: &mut SendTally,
        packets: &mut usize,
        budget: usize,
    ) {
        if view_changed {
            if session.move_should_dump() || session.has_lod_changed() {
                session.bag_mut().clear();
            }
            session.coverage_mut().erase();
        }

        session.stats_mut().scene_completed();
        session.close_search();
        session.set_last_root_version(root_version);

        *packets += self.sender.send(session, tally, budget.saturating_sub(*packets));

        if is_full_scene {
            session.bag_mut().clear();
        }
        session.stats_mut().scene_started(is_full_scene, view_changed, root_version);

        let root = read_tree(&self.tree).root();
        match self.config.reseed {
            ReseedPolicy::Always => session.bag_mut().insert(root, ROOT_PRIORITY),
            ReseedPolicy::WhenEmpty => {
                if session.bag().is_empty() {
                    session.bag_mut().insert(root, ROOT_PRIORITY);
                }
            }
        }
        debug!(
            "client {} scene restart: full={} moving={} root version {}",
            session.client_id(),
            is_full_scene,
            view_changed,
            root_version
        );
    }

    /// The packing loop. Returns the number of encode calls made.
    #[allow(clippy::too_many_arguments)]
    fn pack_and_send(
        &mut self,
        session: &mut ClientStreamSession,
        view_changed: bool,
        want_delta: bool,
        is_full_scene: bool,
        tally: &mut SendTally,
        packets: &mut usize,
        budget: usize,
    ) -> usize {
        let loop_start = Instant::now();
        let mut encode_calls = 0;
        let mut extra_packing_attempts = 0u32;

        let query = session.query();
        let boundary_level_adjust = query.boundary_level_adjust
            + if view_changed && query.want_low_res_moving {
                LOW_RES_MOVING_ADJUST
            } else {
                0
            };

        while !session.bag().is_empty() && *packets < budget && !session.is_shutting_down() {
            let inside_start = Instant::now();
            let Some(node) = session.bag_mut().extract() else {
                break;
            };
            let mut last_node_didnt_fit = false;

            let lock_start = Instant::now();
            let tree = read_tree(&self.tree);
            self.metrics.record_phase(Phase::LockWait, lock_start.elapsed());

            if tree.contains(node) {
                session.stats_mut().encode_started();
                let encode_start = Instant::now();
                let mut params = session.encode_params(
                    want_delta,
                    is_full_scene,
                    boundary_level_adjust,
                    self.jurisdiction.as_ref(),
                );
                let mut outcome = tree.encode(node, &mut self.assembler, &mut params);
                drop(tree);
                self.metrics.record_phase(Phase::Encode, encode_start.elapsed());
                encode_calls += 1;

                session.stats_mut().encode_stopped();
                session.stats_mut().record_stop(outcome.stop_reason);
                session.note_level_reached(outcome.max_level_reached);

                let nothing_fit = outcome.bytes_written == 0 && outcome.stop_reason.is_capacity();
                if nothing_fit
                    && !self.assembler.has_content()
                    && !session.is_packet_waiting()
                    && self.assembler.target_size() >= self.fresh_target(session)
                {
                    warn!(
                        "dropping node {:?} for client {}: too large for an empty packet",
                        node,
                        session.client_id()
                    );
                    outcome.residual.retain(|pending| pending.node != node);
                } else if self.assembler.target_size() == session.packet().capacity() {
                    last_node_didnt_fit = self.assembler.has_content() && nothing_fit;
                } else {
                    // Packing extra compressed sections: an empty assembler
                    // still ends the attempt.
                    extra_packing_attempts += 1;
                    last_node_didnt_fit = nothing_fit;
                }
                session.bag_mut().extend(outcome.residual);
            } else {
                drop(tree);
                debug!("node {:?} left the tree before it was sent", node);
            }

            if session.is_shutting_down() {
                break;
            }

            let completed_scene = session.bag().is_empty();
            if completed_scene || last_node_didnt_fit {
                if self.assembler.has_content() {
                    let write_start = Instant::now();
                    self.write_assembled(session, tally, packets, budget);
                    extra_packing_attempts = 0;
                    self.metrics
                        .record_phase(Phase::CompressAndWrite, write_start.elapsed());
                }

                let packet = session.packet();
                let pack_more = packet.flags().compressed
                    && packet.available() >= MINIMUM_ATTEMPT_MORE_PACKING
                    && extra_packing_attempts <= REASONABLE_NUMBER_OF_PACKING_ATTEMPTS
                    && !completed_scene;

                if pack_more {
                    let target = packet
                        .available()
                        .saturating_sub(SECTION_PREFIX_LEN + COMPRESS_PADDING);
                    self.assembler.change_settings(true, target);
                } else {
                    let send_start = Instant::now();
                    *packets += self.sender.send(session, tally, budget.saturating_sub(*packets));
                    self.metrics.record_phase(Phase::PacketSend, send_start.elapsed());
                    self.retarget(session);
                }
            }

            self.metrics.record_phase(Phase::Inside, inside_start.elapsed());
        }

        self.metrics.record_phase(Phase::Loop, loop_start.elapsed());
        encode_calls
    }

    /// Move the assembled section into the outbound packet, sending the
    /// packet first if the section would overflow it.
    fn write_assembled(
        &mut self,
        session: &mut ClientStreamSession,
        tally: &mut SendTally,
        packets: &mut usize,
        budget: usize,
    ) {
        let section = self.assembler.take_finalized();
        if section.is_empty() {
            return;
        }
        let prefix = if session.packet().flags().compressed {
            SECTION_PREFIX_LEN
        } else {
            0
        };
        if section.len() + prefix > session.packet().available() {
            *packets += self.sender.send(session, tally, budget.saturating_sub(*packets));
        }
        if !session.write_to_outbound_packet(&section) {
            warn!(
                "dropping {} encoded bytes for client {}: outbound packet full",
                section.len(),
                session.client_id()
            );
        }
    }

    /// Assembler target for the packet as it stands now.
    fn full_target(&self, session: &ClientStreamSession) -> usize {
        let packet = session.packet();
        if packet.flags().compressed {
            packet.available().saturating_sub(SECTION_PREFIX_LEN)
        } else {
            packet.capacity()
        }
    }

    /// Assembler target for an empty packet.
    fn fresh_target(&self, session: &ClientStreamSession) -> usize {
        let packet = session.packet();
        if packet.flags().compressed {
            packet.capacity().saturating_sub(SECTION_PREFIX_LEN)
        } else {
            packet.capacity()
        }
    }

    fn retarget(&mut self, session: &ClientStreamSession) {
        let target = self.full_target(session);
        self.assembler
            .change_settings(session.packet().flags().compressed, target);
    }
}
