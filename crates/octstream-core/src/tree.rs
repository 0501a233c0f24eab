//! The seam to the shared octree and its bitstream encoder.
//!
//! The streaming core never looks inside the tree. It hands the encoder a
//! node reference, an assembler to write into and the per-client parameters,
//! and gets back how much was written, why encoding stopped, and which child
//! nodes still need visiting.

use std::sync::{Arc, RwLock, RwLockReadGuard};

use crate::assembler::PacketAssembler;
use crate::bag::{NodeRef, PendingNode};
use crate::coverage::CoverageMap;
use crate::frustum::{Aabb, ViewFrustum};
use crate::stats::SceneStats;

/// The tree shared by every streaming worker.
pub type SharedTree = Arc<RwLock<dyn StreamTree>>;

/// Why the encoder stopped descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    Unknown,
    /// The assembler ran out of room.
    DidntFit,
    NullNode,
    TooDeep,
    OutOfJurisdiction,
    LodSkip,
    OutOfView,
    WasInView,
    NoChange,
    Occluded,
    /// Everything under the node was written.
    Finished,
}

impl StopReason {
    pub const COUNT: usize = 11;

    pub const ALL: [StopReason; Self::COUNT] = [
        StopReason::Unknown,
        StopReason::DidntFit,
        StopReason::NullNode,
        StopReason::TooDeep,
        StopReason::OutOfJurisdiction,
        StopReason::LodSkip,
        StopReason::OutOfView,
        StopReason::WasInView,
        StopReason::NoChange,
        StopReason::Occluded,
        StopReason::Finished,
    ];

    /// Position in [`ALL`](Self::ALL), used for histograms.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether encoding stopped for lack of packet space.
    pub fn is_capacity(self) -> bool {
        self == StopReason::DidntFit
    }
}

/// The region of the tree this server is responsible for.
#[derive(Debug, Clone, PartialEq)]
pub struct Jurisdiction {
    pub bounds: Aabb,
    /// Sub-regions owned by other servers.
    pub excluded: Vec<Aabb>,
}

impl Jurisdiction {
    pub fn new(bounds: Aabb) -> Self {
        Self {
            bounds,
            excluded: Vec::new(),
        }
    }

    pub fn with_excluded(mut self, region: Aabb) -> Self {
        self.excluded.push(region);
        self
    }

    /// Whether an element's box belongs to this server.
    pub fn contains(&self, aabb: &Aabb) -> bool {
        self.bounds.intersects(aabb) && !self.excluded.iter().any(|e| e.contains(aabb))
    }
}

/// Everything the encoder needs to know about one client for one call.
pub struct EncodeParams<'a> {
    pub view_frustum: &'a ViewFrustum,
    /// Previously fully sent view; content visible from it is skipped.
    pub delta_baseline: Option<&'a ViewFrustum>,
    pub want_color: bool,
    pub want_exists_bits: bool,
    pub want_delta: bool,
    /// Present only when the client asked for occlusion culling.
    pub coverage: Option<&'a mut CoverageMap>,
    pub octree_size_scale: f32,
    pub boundary_level_adjust: i32,
    /// Microsecond timestamp of the last completed scene; unchanged content
    /// older than this can be skipped.
    pub last_bag_empty_usecs: u64,
    pub is_full_scene: bool,
    pub stats: &'a mut SceneStats,
    pub jurisdiction: Option<&'a Jurisdiction>,
}

/// Result of one encode call.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeOutcome {
    pub bytes_written: usize,
    pub stop_reason: StopReason,
    /// Nodes still to visit, to be queued again by the caller.
    pub residual: Vec<PendingNode>,
    pub max_level_reached: u32,
}

impl EncodeOutcome {
    pub fn finished(bytes_written: usize) -> Self {
        Self {
            bytes_written,
            stop_reason: StopReason::Finished,
            residual: Vec::new(),
            max_level_reached: 0,
        }
    }

    pub fn didnt_fit(residual: Vec<PendingNode>) -> Self {
        Self {
            bytes_written: 0,
            stop_reason: StopReason::DidntFit,
            residual,
            max_level_reached: 0,
        }
    }
}

/// The shared tree as seen by the streaming core.
pub trait StreamTree: Send + Sync {
    /// Whether the tree has finished loading from storage.
    fn is_initial_load_complete(&self) -> bool;

    fn root(&self) -> NodeRef;

    /// Version stamp of the root, bumped whenever anything below it changes.
    fn root_last_changed(&self) -> u64;

    /// Whether `node` still exists.
    fn contains(&self, node: NodeRef) -> bool;

    /// Encode the subtree at `node` into `assembler`.
    fn encode(
        &self,
        node: NodeRef,
        assembler: &mut PacketAssembler,
        params: &mut EncodeParams<'_>,
    ) -> EncodeOutcome;
}

/// Take the tree read lock, recovering it if a writer panicked.
pub fn read_tree(tree: &SharedTree) -> RwLockReadGuard<'_, dyn StreamTree> {
    tree.read().unwrap_or_else(|poisoned| {
        tracing::warn!("tree lock poisoned, continuing with last written state");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_stop_reason_indices_match_table() {
        for (i, reason) in StopReason::ALL.iter().enumerate() {
            assert_eq!(reason.index(), i);
        }
        assert!(StopReason::DidntFit.is_capacity());
        assert!(!StopReason::Finished.is_capacity());
    }

    #[test]
    fn test_jurisdiction_excludes_sub_regions() {
        let jurisdiction = Jurisdiction::new(Aabb::cube(Vec3::ZERO, 100.0))
            .with_excluded(Aabb::cube(Vec3::ZERO, 10.0));
        assert!(jurisdiction.contains(&Aabb::cube(Vec3::splat(50.0), 5.0)));
        assert!(!jurisdiction.contains(&Aabb::cube(Vec3::splat(1.0), 2.0)));
        assert!(!jurisdiction.contains(&Aabb::cube(Vec3::splat(200.0), 5.0)));
    }
}
