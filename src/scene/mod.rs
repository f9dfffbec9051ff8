//! Scene data model: arenas, template geometry, object instances and
//! visibility culling.

pub mod arena;
pub mod culling;
pub mod geometry;
pub mod object;

pub use arena::{Arena, Handle, RankError};
pub use culling::{is_visible, update_visibility, Frustum};
pub use geometry::{
    BaseObject, BaseObjectStore, BoundingSphere, DataTier, MaterialDef, TierTextures, Vertex,
};
pub use object::{ObjectKind, ObjectTable, SceneObject, ShadowSpot, ShadowSpotKind};
