//! Durable per-client streaming state.
//!
//! A [`ClientStreamSession`] is owned by exactly one worker. The network side
//! keeps the matching [`SessionHandle`] to push view updates and to ask the
//! worker to wind down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;

use crate::bag::VisitBag;
use crate::coverage::CoverageMap;
use crate::frustum::ViewFrustum;
use crate::packet::{OutboundPacket, PacketFlags};
use crate::query::ClientQuery;
use crate::stats::SceneStats;
use crate::suppressor::DuplicateSuppressor;
use crate::transport::ClientId;
use crate::tree::{EncodeParams, Jurisdiction};

/// Wall-clock time in microseconds since the Unix epoch.
pub fn usec_timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// The server shell's side of a session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    client_id: ClientId,
    query_tx: watch::Sender<ClientQuery>,
    shutdown: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Replace the client's query. The worker picks it up on its next cycle.
    pub fn update_query(&self, query: ClientQuery) {
        self.query_tx.send_replace(query);
    }

    /// Mark the session as shutting down.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }
}

// ---------------------------------------------------------------------------
// ClientStreamSession
// ---------------------------------------------------------------------------

/// Everything the server remembers about streaming to one client.
#[derive(Debug)]
pub struct ClientStreamSession {
    client_id: ClientId,
    address: SocketAddr,
    query_rx: watch::Receiver<ClientQuery>,
    query: ClientQuery,

    current_view: ViewFrustum,
    last_known_view: ViewFrustum,
    view_changing: bool,
    just_stopped_changing: bool,
    view_sent: bool,

    lod_initialized: bool,
    lod_changed: bool,
    /// A LOD change was detected by the latest view update.
    lod_just_changed: bool,
    last_boundary_level_adjust: i32,
    last_octree_size_scale: f32,

    bag: VisitBag,
    coverage: CoverageMap,
    packet: OutboundPacket,
    sequence: u32,
    suppressor: DuplicateSuppressor,
    stats: SceneStats,

    max_search_level: u32,
    max_level_reached: u32,
    last_root_version: u64,
    last_bag_empty_usecs: u64,

    shutdown: Arc<AtomicBool>,
}

impl ClientStreamSession {
    /// Create a session and the handle that feeds it.
    pub fn new(
        client_id: ClientId,
        address: SocketAddr,
        query: ClientQuery,
        mtu: usize,
    ) -> (Self, SessionHandle) {
        let (query_tx, query_rx) = watch::channel(query.clone());
        let shutdown = Arc::new(AtomicBool::new(false));
        let flags = PacketFlags::new(query.want_color, query.want_compression);

        let session = Self {
            client_id,
            address,
            query_rx,
            query,
            current_view: ViewFrustum::default(),
            last_known_view: ViewFrustum::default(),
            view_changing: false,
            just_stopped_changing: true,
            view_sent: false,
            lod_initialized: false,
            lod_changed: false,
            lod_just_changed: false,
            last_boundary_level_adjust: 0,
            last_octree_size_scale: 0.0,
            bag: VisitBag::new(),
            coverage: CoverageMap::new(),
            packet: OutboundPacket::new(mtu, flags, 0),
            sequence: 0,
            suppressor: DuplicateSuppressor::new(),
            stats: SceneStats::new(),
            max_search_level: 0,
            max_level_reached: 0,
            last_root_version: 0,
            last_bag_empty_usecs: 0,
            shutdown: Arc::clone(&shutdown),
        };
        let handle = SessionHandle {
            client_id,
            query_tx,
            shutdown,
        };
        (session, handle)
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// The query as of the last [`update_current_view_frustum`](Self::update_current_view_frustum).
    pub fn query(&self) -> &ClientQuery {
        &self.query
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    // -- view tracking ------------------------------------------------------

    /// Pull the newest query and rebuild the current frustum from it.
    ///
    /// Returns `true` when the frustum moved beyond the similarity epsilon.
    /// Also tracks LOD changes and the changing-to-still transition.
    pub fn update_current_view_frustum(&mut self) -> bool {
        if self.is_shutting_down() {
            return false;
        }

        self.query = self.query_rx.borrow_and_update().clone();
        let newest = self.query.view_frustum();
        let changed = !newest.is_very_similar(&self.current_view);
        if changed {
            self.current_view = newest;
        }

        self.lod_just_changed = false;
        if self.lod_initialized {
            if self.last_boundary_level_adjust != self.query.boundary_level_adjust {
                self.last_boundary_level_adjust = self.query.boundary_level_adjust;
                self.lod_just_changed = true;
            }
            if self.last_octree_size_scale != self.query.octree_size_scale {
                self.last_octree_size_scale = self.query.octree_size_scale;
                self.lod_just_changed = true;
            }
            self.lod_changed |= self.lod_just_changed;
        } else {
            self.lod_initialized = true;
            self.last_boundary_level_adjust = self.query.boundary_level_adjust;
            self.last_octree_size_scale = self.query.octree_size_scale;
            self.lod_changed = false;
        }

        // Sticky until the scene is marked sent.
        if self.view_changing && !changed {
            self.just_stopped_changing = true;
        }
        self.view_changing = changed;
        if changed || self.lod_just_changed {
            self.view_sent = false;
        }
        changed
    }

    /// Snapshot the current frustum as the delta baseline and stamp the bag
    /// as emptied.
    pub fn update_last_known_view_frustum(&mut self) {
        if self.is_shutting_down() {
            return;
        }
        if !self.last_known_view.is_very_similar(&self.current_view) {
            self.last_known_view = self.current_view.clone();
        }
        self.last_bag_empty_usecs = usec_timestamp_now();
    }

    pub fn set_view_sent(&mut self, sent: bool) {
        self.view_sent = sent;
        if sent {
            self.just_stopped_changing = false;
            self.lod_changed = false;
        }
    }

    pub fn is_view_sent(&self) -> bool {
        self.view_sent
    }

    /// Whether the camera moved at all since the last fully sent view.
    pub fn move_should_dump(&self) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        self.current_view.position() != self.last_known_view.position()
    }

    pub fn is_view_changing(&self) -> bool {
        self.view_changing
    }

    pub fn view_just_stopped_changing(&self) -> bool {
        self.just_stopped_changing
    }

    pub fn has_lod_changed(&self) -> bool {
        self.lod_changed
    }

    /// Whether the latest view update saw the LOD parameters change.
    pub fn lod_just_changed(&self) -> bool {
        self.lod_just_changed
    }

    pub fn current_view_frustum(&self) -> &ViewFrustum {
        &self.current_view
    }

    pub fn last_known_view_frustum(&self) -> &ViewFrustum {
        &self.last_known_view
    }

    // -- outbound packet ----------------------------------------------------

    /// Start a fresh packet. The old payload becomes the duplicate baseline
    /// and the flags are relocked to the client's current wants.
    pub fn reset_outbound_packet(&mut self) {
        if self.is_shutting_down() {
            return;
        }
        let previous = self.packet.reset(self.desired_flags(), self.sequence);
        self.suppressor.remember(previous);
    }

    /// Append a finalized segment. Returns `false` if it did not fit.
    pub fn write_to_outbound_packet(&mut self, bytes: &[u8]) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        self.packet.write(bytes)
    }

    pub fn packet(&self) -> &OutboundPacket {
        &self.packet
    }

    pub fn is_packet_waiting(&self) -> bool {
        self.packet.is_waiting()
    }

    /// Whether the packet's locked flags match what the client wants now.
    pub fn packet_format_matches(&self) -> bool {
        self.packet.flags() == self.desired_flags()
    }

    fn desired_flags(&self) -> PacketFlags {
        PacketFlags::new(self.query.want_color, self.query.want_compression)
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub(crate) fn increment_sequence(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
    }

    /// Whether the finished packet repeats the last one and can be dropped.
    pub fn should_suppress_duplicate_packet(&mut self) -> bool {
        if self.is_shutting_down() {
            return true;
        }
        self.suppressor
            .should_suppress(self.packet.payload(), self.view_changing, Instant::now())
    }

    pub fn duplicate_packet_count(&self) -> u32 {
        self.suppressor.duplicate_count()
    }

    // -- traversal state ----------------------------------------------------

    pub fn bag(&self) -> &VisitBag {
        &self.bag
    }

    pub fn bag_mut(&mut self) -> &mut VisitBag {
        &mut self.bag
    }

    pub fn coverage(&self) -> &CoverageMap {
        &self.coverage
    }

    pub fn coverage_mut(&mut self) -> &mut CoverageMap {
        &mut self.coverage
    }

    pub fn stats(&self) -> &SceneStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut SceneStats {
        &mut self.stats
    }

    pub fn last_root_version(&self) -> u64 {
        self.last_root_version
    }

    pub fn set_last_root_version(&mut self, version: u64) {
        self.last_root_version = version;
    }

    pub fn last_bag_empty_usecs(&self) -> u64 {
        self.last_bag_empty_usecs
    }

    pub fn set_last_bag_empty_usecs(&mut self, usecs: u64) {
        self.last_bag_empty_usecs = usecs;
    }

    /// Deepest level any encode call reached in the current scene.
    pub fn max_level_reached(&self) -> u32 {
        self.max_level_reached
    }

    /// Deepest level reached by any completed scene.
    pub fn max_search_level(&self) -> u32 {
        self.max_search_level
    }

    pub(crate) fn note_level_reached(&mut self, level: u32) {
        self.max_level_reached = self.max_level_reached.max(level);
    }

    pub(crate) fn close_search(&mut self) {
        self.max_search_level = self.max_search_level.max(self.max_level_reached);
        self.max_level_reached = 0;
    }

    /// Borrow the pieces of the session the encoder needs for one call.
    pub(crate) fn encode_params<'a>(
        &'a mut self,
        want_delta: bool,
        is_full_scene: bool,
        boundary_level_adjust: i32,
        jurisdiction: Option<&'a Jurisdiction>,
    ) -> EncodeParams<'a> {
        let coverage = if self.query.want_occlusion_culling {
            Some(&mut self.coverage)
        } else {
            None
        };
        EncodeParams {
            view_frustum: &self.current_view,
            delta_baseline: want_delta.then_some(&self.last_known_view),
            want_color: self.packet.flags().color,
            want_exists_bits: true,
            want_delta,
            coverage,
            octree_size_scale: self.query.octree_size_scale,
            boundary_level_adjust,
            last_bag_empty_usecs: self.last_bag_empty_usecs,
            is_full_scene,
            stats: &mut self.stats,
            jurisdiction,
        }
    }
}
