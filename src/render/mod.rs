//! Rendering subsystems: texture cache, shadow maps, ground decals and
//! framebuffer capture.

pub mod capture;
pub mod ground;
pub mod shadow;
pub mod texture;

pub use capture::{write_screenshot, PauseBlur};
pub use ground::{GroundDecals, GroundMark, GroundSpot, MarkPhase};
pub use shadow::{ShadowConfig, ShadowMapper};
pub use texture::{FileTextureLoader, TextureCache, TextureError, TextureLoader, TextureRef};
