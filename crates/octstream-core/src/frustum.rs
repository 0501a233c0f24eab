//! Client view frustum: camera/lens state, plane extraction, culling tests and
//! the "very similar" comparison used to detect view changes.
//!
//! The camera looks down its local `-Z` axis (right-handed, depth `[0, 1]`),
//! matching `glam::Mat4::perspective_rh`.

use glam::{Mat4, Quat, Vec3, Vec4};
use serde::{Deserialize, Serialize};

/// Extra field of view (degrees) added on top of the client's lens so content
/// just outside the visible edge is already streamed when the camera turns.
pub const VIEW_FRUSTUM_FOV_OVERSEND: f32 = 60.0;

/// Default lens parameters.
pub const DEFAULT_FIELD_OF_VIEW_DEGREES: f32 = 90.0;
pub const DEFAULT_ASPECT_RATIO: f32 = 16.0 / 9.0;
pub const DEFAULT_NEAR_CLIP: f32 = 0.08;
pub const DEFAULT_FAR_CLIP: f32 = 819_200.0;

const POSITION_SIMILAR_ENOUGH: f32 = 5.0;
const EYE_OFFSET_POSITION_SIMILAR_ENOUGH: f32 = 0.15;
const ORIENTATION_SIMILAR_ENOUGH_DEGREES: f32 = 10.0;
const LENS_EPSILON: f32 = 1e-4;
const MAX_FIELD_OF_VIEW_DEGREES: f32 = 179.0;

const LEFT: usize = 0;
const RIGHT: usize = 1;
const BOTTOM: usize = 2;
const TOP: usize = 3;
const NEAR: usize = 4;
const FAR: usize = 5;

// ---------------------------------------------------------------------------
// Aabb
// ---------------------------------------------------------------------------

/// An axis-aligned box in tree space.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    /// Minimum corner.
    pub min: Vec3,
    /// Maximum corner.
    pub max: Vec3,
}

impl Aabb {
    /// Create a box from its two corners.
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Axis-aligned cube with the given minimum corner and edge length.
    pub fn cube(corner: Vec3, scale: f32) -> Self {
        Self {
            min: corner,
            max: corner + Vec3::splat(scale),
        }
    }

    /// Center point.
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Whether `other` lies entirely inside this box.
    pub fn contains(&self, other: &Aabb) -> bool {
        self.min.cmple(other.min).all() && self.max.cmpge(other.max).all()
    }

    /// Whether the two boxes overlap.
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }
}

/// Result of a culling test.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    /// Entirely outside at least one plane.
    Outside,
    /// Straddles one or more planes.
    Intersect,
    /// Entirely inside all planes.
    Inside,
}

// ---------------------------------------------------------------------------
// ViewFrustum
// ---------------------------------------------------------------------------

/// A client's view frustum: camera placement, lens, and the six inward-facing
/// planes derived from them.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewFrustum {
    position: Vec3,
    orientation: Quat,
    field_of_view: f32,
    aspect_ratio: f32,
    near_clip: f32,
    far_clip: f32,
    eye_offset_position: Vec3,
    eye_offset_orientation: Quat,
    /// Left, right, bottom, top, near, far. `(a, b, c)` is the unit inward
    /// normal and `d` the signed distance term.
    planes: [Vec4; 6],
}

impl Default for ViewFrustum {
    fn default() -> Self {
        Self::new(
            Vec3::ZERO,
            Quat::IDENTITY,
            DEFAULT_FIELD_OF_VIEW_DEGREES,
            DEFAULT_ASPECT_RATIO,
            DEFAULT_NEAR_CLIP,
            DEFAULT_FAR_CLIP,
        )
    }
}

impl ViewFrustum {
    /// Build a frustum and compute its planes.
    pub fn new(
        position: Vec3,
        orientation: Quat,
        field_of_view: f32,
        aspect_ratio: f32,
        near_clip: f32,
        far_clip: f32,
    ) -> Self {
        let mut frustum = Self {
            position,
            orientation: orientation.normalize(),
            field_of_view,
            aspect_ratio,
            near_clip,
            far_clip,
            eye_offset_position: Vec3::ZERO,
            eye_offset_orientation: Quat::IDENTITY,
            planes: [Vec4::ZERO; 6],
        };
        frustum.calculate();
        frustum
    }

    /// Set the eye offset relative to the camera and recompute the planes.
    pub fn with_eye_offset(mut self, position: Vec3, orientation: Quat) -> Self {
        self.eye_offset_position = position;
        self.eye_offset_orientation = orientation.normalize();
        self.calculate();
        self
    }

    /// Camera position in tree space.
    pub fn position(&self) -> Vec3 {
        self.position
    }

    /// Camera orientation.
    pub fn orientation(&self) -> Quat {
        self.orientation
    }

    /// Field of view in degrees.
    pub fn field_of_view(&self) -> f32 {
        self.field_of_view
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.aspect_ratio
    }

    pub fn near_clip(&self) -> f32 {
        self.near_clip
    }

    pub fn far_clip(&self) -> f32 {
        self.far_clip
    }

    pub fn eye_offset_position(&self) -> Vec3 {
        self.eye_offset_position
    }

    /// Unit vector the camera looks along.
    pub fn direction(&self) -> Vec3 {
        self.orientation * Vec3::NEG_Z
    }

    fn calculate(&mut self) {
        let eye = self.position + self.orientation * self.eye_offset_position;
        let rotation = self.orientation * self.eye_offset_orientation;
        let view = Mat4::from_rotation_translation(rotation, eye).inverse();

        let fov = self
            .field_of_view
            .clamp(LENS_EPSILON, MAX_FIELD_OF_VIEW_DEGREES)
            .to_radians();
        let aspect = self.aspect_ratio.max(LENS_EPSILON);
        let near = self.near_clip.max(LENS_EPSILON);
        let far = self.far_clip.max(near + LENS_EPSILON);
        let vp = Mat4::perspective_rh(fov, aspect, near, far) * view;

        let rows = [vp.row(0), vp.row(1), vp.row(2), vp.row(3)];
        let mut planes = [Vec4::ZERO; 6];
        planes[LEFT] = rows[3] + rows[0];
        planes[RIGHT] = rows[3] - rows[0];
        planes[BOTTOM] = rows[3] + rows[1];
        planes[TOP] = rows[3] - rows[1];
        planes[NEAR] = rows[2];
        planes[FAR] = rows[3] - rows[2];

        for plane in &mut planes {
            let len = plane.truncate().length();
            if len > 0.0 {
                *plane /= len;
            }
        }
        self.planes = planes;
    }

    /// Whether a point lies inside all six planes.
    pub fn point_in_frustum(&self, point: Vec3) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.truncate().dot(point) + plane.w >= 0.0)
    }

    /// Classify a box against the frustum with the p-vertex / n-vertex test.
    pub fn box_in_frustum(&self, aabb: &Aabb) -> Location {
        let mut all_inside = true;

        for plane in &self.planes {
            let normal = plane.truncate();
            let p_vertex = Vec3::select(normal.cmpge(Vec3::ZERO), aabb.max, aabb.min);
            let n_vertex = Vec3::select(normal.cmpge(Vec3::ZERO), aabb.min, aabb.max);

            if normal.dot(p_vertex) + plane.w < 0.0 {
                return Location::Outside;
            }
            if normal.dot(n_vertex) + plane.w < 0.0 {
                all_inside = false;
            }
        }

        if all_inside {
            Location::Inside
        } else {
            Location::Intersect
        }
    }

    /// Whether two frusta are close enough that re-streaming is unnecessary:
    /// positions within 5 m, orientations within 10°, eye offsets within
    /// 0.15 m / 10°, and identical lens parameters.
    pub fn is_very_similar(&self, other: &ViewFrustum) -> bool {
        let position_distance = self.position.distance(other.position);
        let eye_offset_distance = self.eye_offset_position.distance(other.eye_offset_position);
        let orientation_angle = angle_degrees(self.orientation, other.orientation);
        let eye_offset_angle = angle_degrees(self.eye_offset_orientation, other.eye_offset_orientation);

        position_distance <= POSITION_SIMILAR_ENOUGH
            && orientation_angle <= ORIENTATION_SIMILAR_ENOUGH_DEGREES
            && lens_matches(self.field_of_view, other.field_of_view)
            && lens_matches(self.aspect_ratio, other.aspect_ratio)
            && lens_matches(self.near_clip, other.near_clip)
            && lens_matches(self.far_clip, other.far_clip)
            && eye_offset_distance <= EYE_OFFSET_POSITION_SIMILAR_ENOUGH
            && eye_offset_angle <= ORIENTATION_SIMILAR_ENOUGH_DEGREES
    }
}

fn angle_degrees(a: Quat, b: Quat) -> f32 {
    if a == b {
        return 0.0;
    }
    let angle = a.angle_between(b).to_degrees();
    if angle.is_nan() { 0.0 } else { angle }
}

fn lens_matches(a: f32, b: f32) -> bool {
    (a - b).abs() <= LENS_EPSILON
}
