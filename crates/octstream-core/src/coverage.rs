//! Per-session occlusion coverage: screen-space regions already covered by
//! opaque content sent during the current scene.
//!
//! The encoder records occluders and asks whether a candidate is hidden. The
//! streaming core only owns the map and clears it at scene boundaries.

use glam::Vec2;

/// An axis-aligned region in normalized screen space (`[-1, 1]` on both axes).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenRect {
    pub min: Vec2,
    pub max: Vec2,
}

impl ScreenRect {
    pub fn new(min: Vec2, max: Vec2) -> Self {
        Self { min, max }
    }

    fn covers(&self, other: &ScreenRect) -> bool {
        self.min.cmple(other.min).all() && self.max.cmpge(other.max).all()
    }
}

/// Occluders recorded for one client, nearest first.
#[derive(Debug, Default)]
pub struct CoverageMap {
    occluders: Vec<(f32, ScreenRect)>,
}

impl CoverageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an opaque region at the given view distance.
    pub fn add_occluder(&mut self, distance: f32, rect: ScreenRect) {
        let at = self.occluders.partition_point(|(d, _)| *d <= distance);
        self.occluders.insert(at, (distance, rect));
    }

    /// Whether `rect` at `distance` is fully hidden by a single nearer
    /// occluder.
    pub fn is_occluded(&self, distance: f32, rect: &ScreenRect) -> bool {
        self.occluders
            .iter()
            .take_while(|(d, _)| *d < distance)
            .any(|(_, occluder)| occluder.covers(rect))
    }

    pub fn len(&self) -> usize {
        self.occluders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occluders.is_empty()
    }

    /// Forget every occluder.
    pub fn erase(&mut self) {
        self.occluders.clear();
    }
}
