//! Terrain query seam
//!
//! The engine never owns terrain data; it asks the host through this
//! trait when it needs ground height, surface normals or resource
//! classification (shadow spot orientation, altitude-banded ground spots,
//! the debug resource overlay).

use glam::Vec3;

/// Subsoil resource classification used by the debug overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Stone,
    Uranium,
    Power,
}

impl ResourceKind {
    /// Overlay color for this resource.
    #[must_use]
    pub const fn overlay_color(self) -> [f32; 3] {
        match self {
            Self::Stone => [1.0, 0.0, 0.0],
            Self::Uranium => [1.0, 1.0, 0.0],
            Self::Power => [0.0, 1.0, 0.0],
        }
    }
}

/// Host-supplied terrain queries.
pub trait Terrain {
    /// Ground height at a world position (y is ignored).
    fn floor_level(&self, pos: Vec3) -> f32;

    /// Ground surface normal at a world position.
    fn normal(&self, pos: Vec3) -> Vec3;

    /// Subsoil resource under a world position, if any.
    fn resource_type(&self, pos: Vec3) -> Option<ResourceKind>;
}

/// Level, featureless ground at height zero. Used by tests and headless
/// runs.
pub struct FlatTerrain;

impl Terrain for FlatTerrain {
    fn floor_level(&self, _pos: Vec3) -> f32 {
        0.0
    }

    fn normal(&self, _pos: Vec3) -> Vec3 {
        Vec3::Y
    }

    fn resource_type(&self, _pos: Vec3) -> Option<ResourceKind> {
        None
    }
}
