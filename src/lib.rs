//! A real-time 3D scene rendering engine
//!
//! This crate provides:
//! - Template geometry arenas with deferred GPU uploads
//! - Frustum culling and cascaded shadow maps with texel snapping
//! - Ground decal compositing and an animated ground mark
//! - A frame pipeline with pause blur and background screenshots
//! - Pluggable devices: a wgpu backend and a headless test double

pub mod core;
pub mod device;
pub mod render;
pub mod scene;

// Re-exports for convenience
pub use glam;
pub use wgpu;
pub use winit;

/// Initialize env_logger with the default filter. Call once at startup.
pub fn init_logging() {
    env_logger::init();
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::core::{
        Engine, EngineConfig, EngineEvent, FlatTerrain, FrameHooks, FrameStats, NoHooks,
        ResourceKind, Terrain,
    };
    pub use crate::device::{
        Device, DeviceCaps, NullDevice, PrimitiveKind, ScenePass, ShadowPass, TextureFilter,
        TextureHandle, Transparency, UiPass, WgpuDevice,
    };
    pub use crate::render::{
        FileTextureLoader, GroundDecals, ShadowConfig, TextureCache, TextureLoader,
    };
    pub use crate::scene::{
        Arena, BaseObjectStore, Handle, MaterialDef, ObjectKind, ObjectTable, RankError,
        ShadowSpotKind, Vertex,
    };
    pub use glam::{Mat4, Quat, Vec2, Vec3, Vec4};
}
