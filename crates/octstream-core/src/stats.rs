//! Per-scene statistics for one client.
//!
//! A scene runs from a traversal restart to the next. When it completes, a
//! [`StatsSummary`] is serialized and held until the sender can piggyback it
//! on a voxel packet.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::packet::PacketDecodeError;
use crate::tree::StopReason;

/// Packet type byte in front of a serialized [`StatsSummary`].
pub const PACKET_TYPE_SCENE_STATS: u8 = 0x1F;

/// What a client is told about a completed scene.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatsSummary {
    pub scene_number: u32,
    pub is_full_scene: bool,
    pub is_moving: bool,
    pub root_version: u64,
    pub elapsed_usecs: u64,
    pub encode_usecs: u64,
    pub encode_calls: u32,
    pub packets: u32,
    pub bytes: u64,
    pub nodes_traversed: u32,
    /// Encode calls per [`StopReason`], indexed by [`StopReason::index`].
    pub stop_reasons: [u32; StopReason::COUNT],
}

impl StatsSummary {
    /// How many encode calls ended for `reason`.
    pub fn stops(&self, reason: StopReason) -> u32 {
        self.stop_reasons[reason.index()]
    }

    /// Wire form: the stats packet type byte followed by the postcard body.
    pub fn to_message(&self) -> Result<Vec<u8>, postcard::Error> {
        let mut out = vec![PACKET_TYPE_SCENE_STATS];
        out.extend_from_slice(&postcard::to_allocvec(self)?);
        Ok(out)
    }

    /// Decode a stats message. Returns the summary and whatever follows it,
    /// which is the piggybacked voxel packet if there is one.
    pub fn from_message(bytes: &[u8]) -> Result<(Self, &[u8]), PacketDecodeError> {
        let Some((&packet_type, body)) = bytes.split_first() else {
            return Err(PacketDecodeError::TooShort(0));
        };
        if packet_type != PACKET_TYPE_SCENE_STATS {
            return Err(PacketDecodeError::UnexpectedType {
                expected: PACKET_TYPE_SCENE_STATS,
                found: packet_type,
            });
        }
        Ok(postcard::take_from_bytes(body)?)
    }
}

/// Running statistics for the current scene.
#[derive(Debug, Default)]
pub struct SceneStats {
    scene_number: u32,
    in_scene: bool,
    is_full_scene: bool,
    is_moving: bool,
    root_version: u64,
    scene_started_at: Option<Instant>,
    encode_started_at: Option<Instant>,
    total_encode: Duration,
    encode_calls: u32,
    packets: u32,
    bytes: u64,
    nodes_traversed: u32,
    stop_reasons: [u32; StopReason::COUNT],
    last_summary: Option<StatsSummary>,
    message: Option<Vec<u8>>,
}

impl SceneStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a new scene. Counters from the previous one are cleared.
    pub fn scene_started(&mut self, is_full_scene: bool, is_moving: bool, root_version: u64) {
        self.scene_number = self.scene_number.wrapping_add(1);
        self.in_scene = true;
        self.is_full_scene = is_full_scene;
        self.is_moving = is_moving;
        self.root_version = root_version;
        self.scene_started_at = Some(Instant::now());
        self.encode_started_at = None;
        self.total_encode = Duration::ZERO;
        self.encode_calls = 0;
        self.packets = 0;
        self.bytes = 0;
        self.nodes_traversed = 0;
        self.stop_reasons = [0; StopReason::COUNT];
    }

    /// Close the current scene and queue its summary for sending. Does
    /// nothing if no scene is running.
    pub fn scene_completed(&mut self) {
        if !self.in_scene {
            return;
        }
        self.in_scene = false;

        let elapsed = self
            .scene_started_at
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let summary = StatsSummary {
            scene_number: self.scene_number,
            is_full_scene: self.is_full_scene,
            is_moving: self.is_moving,
            root_version: self.root_version,
            elapsed_usecs: elapsed.as_micros() as u64,
            encode_usecs: self.total_encode.as_micros() as u64,
            encode_calls: self.encode_calls,
            packets: self.packets,
            bytes: self.bytes,
            nodes_traversed: self.nodes_traversed,
            stop_reasons: self.stop_reasons,
        };

        match summary.to_message() {
            Ok(message) => self.message = Some(message),
            Err(e) => tracing::warn!("failed to serialize scene stats: {}", e),
        }
        self.last_summary = Some(summary);
    }

    pub fn encode_started(&mut self) {
        self.encode_started_at = Some(Instant::now());
    }

    pub fn encode_stopped(&mut self) {
        if let Some(start) = self.encode_started_at.take() {
            self.total_encode += start.elapsed();
            self.encode_calls += 1;
        }
    }

    /// Count one encode call that ended for `reason`.
    pub fn record_stop(&mut self, reason: StopReason) {
        self.stop_reasons[reason.index()] += 1;
    }

    /// Called by the encoder for every element it visits.
    pub fn node_traversed(&mut self) {
        self.nodes_traversed += 1;
    }

    /// Count one voxel packet of `bytes` wire bytes.
    pub fn packet_sent(&mut self, bytes: usize) {
        self.packets += 1;
        self.bytes += bytes as u64;
    }

    /// Whether a completed scene's summary is waiting to go out.
    pub fn is_ready_to_send(&self) -> bool {
        self.message.is_some()
    }

    /// The serialized summary waiting to go out.
    pub fn message(&self) -> Option<&[u8]> {
        self.message.as_deref()
    }

    pub fn mark_as_sent(&mut self) {
        self.message = None;
    }

    pub fn last_summary(&self) -> Option<&StatsSummary> {
        self.last_summary.as_ref()
    }

    pub fn scene_number(&self) -> u32 {
        self.scene_number
    }

    pub fn is_in_scene(&self) -> bool {
        self.in_scene
    }
}
