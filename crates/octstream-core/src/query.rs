//! The client's streaming query: camera, lens, and level-of-detail wants.
//!
//! A [`ClientQuery`] is what the network layer decodes from each inbound view
//! update. The session pulls the newest one at the start of every cycle.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::frustum::{
    DEFAULT_ASPECT_RATIO, DEFAULT_FAR_CLIP, DEFAULT_FIELD_OF_VIEW_DEGREES, DEFAULT_NEAR_CLIP,
    VIEW_FRUSTUM_FOV_OVERSEND, ViewFrustum,
};

/// Edge length of the root cube in tree units.
pub const TREE_SCALE: f32 = 16_384.0;

/// Default element size scale: elements are sent while they would cover more
/// than roughly a pixel at this ratio of distance to size.
pub const DEFAULT_OCTREE_SIZE_SCALE: f32 = TREE_SCALE * 400.0;

/// Default client packet-rate request.
pub const DEFAULT_MAX_PACKETS_PER_SECOND: u32 = 600;

/// A client's view and level-of-detail preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientQuery {
    /// Camera position in tree space.
    pub camera_position: Vec3,
    /// Camera orientation.
    pub camera_orientation: Quat,
    /// Vertical field of view in degrees.
    pub camera_fov: f32,
    pub camera_aspect_ratio: f32,
    pub camera_near_clip: f32,
    pub camera_far_clip: f32,
    /// Eye position relative to the camera.
    pub camera_eye_offset_position: Vec3,

    /// Send color data with each element.
    pub want_color: bool,
    /// Only stream what changed relative to the last fully sent view.
    pub want_delta: bool,
    /// Coarsen the level of detail while the camera moves.
    pub want_low_res_moving: bool,
    /// Skip content hidden behind already-sent foreground content.
    pub want_occlusion_culling: bool,
    /// LZ4-compress packet sections.
    pub want_compression: bool,
    /// Highest packet rate the client is willing to receive.
    pub max_packets_per_second: u32,
    /// Ratio of distance to element size below which elements are sent.
    pub octree_size_scale: f32,
    /// Additional levels of boundary detail (positive = coarser).
    pub boundary_level_adjust: i32,
}

impl Default for ClientQuery {
    fn default() -> Self {
        Self {
            camera_position: Vec3::ZERO,
            camera_orientation: Quat::IDENTITY,
            camera_fov: DEFAULT_FIELD_OF_VIEW_DEGREES,
            camera_aspect_ratio: DEFAULT_ASPECT_RATIO,
            camera_near_clip: DEFAULT_NEAR_CLIP,
            camera_far_clip: DEFAULT_FAR_CLIP,
            camera_eye_offset_position: Vec3::ZERO,
            want_color: true,
            want_delta: true,
            want_low_res_moving: true,
            want_occlusion_culling: false,
            want_compression: false,
            max_packets_per_second: DEFAULT_MAX_PACKETS_PER_SECOND,
            octree_size_scale: DEFAULT_OCTREE_SIZE_SCALE,
            boundary_level_adjust: 0,
        }
    }
}

impl ClientQuery {
    /// The frustum the server streams against: the client's lens widened by
    /// [`VIEW_FRUSTUM_FOV_OVERSEND`].
    pub fn view_frustum(&self) -> ViewFrustum {
        ViewFrustum::new(
            self.camera_position,
            self.camera_orientation,
            self.camera_fov + VIEW_FRUSTUM_FOV_OVERSEND,
            self.camera_aspect_ratio,
            self.camera_near_clip,
            self.camera_far_clip,
        )
        .with_eye_offset(self.camera_eye_offset_position, Quat::IDENTITY)
    }
}
