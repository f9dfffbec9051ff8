//! GPU device abstraction
//!
//! Rendering goes through the [`Device`] trait plus three per-role pass
//! traits, each with a begin/end bracket: [`ShadowPass`] writes the depth
//! atlas, [`ScenePass`] draws the 3D world, [`UiPass`] draws screen-space
//! quads and lines. [`NullDevice`] is the headless implementation used by
//! tests and server-side runs; [`WgpuDevice`] renders for real.

mod gpu;
mod null;

pub use gpu::WgpuDevice;
pub use null::NullDevice;

use glam::{Mat4, Vec2};
use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::scene::Vertex;

/// Opaque device texture handle. Zero is the invalid sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextureHandle(pub(crate) u32);

impl TextureHandle {
    pub const INVALID: Self = Self(0);

    #[must_use]
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// Opaque device vertex buffer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u32);

/// Primitive topology of a vertex batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    TriangleList,
    TriangleStrip,
}

/// Texture sampling filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextureFilter {
    Nearest,
    Bilinear,
    Trilinear,
}

/// Parameters for texture creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureParams {
    pub filter: TextureFilter,
    pub mipmap: bool,
    pub repeat: bool,
}

impl Default for TextureParams {
    fn default() -> Self {
        Self {
            filter: TextureFilter::Bilinear,
            mipmap: true,
            repeat: true,
        }
    }
}

/// Capabilities reported by a device. Queried fresh every frame because
/// some backends lose features on context changes.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCaps {
    pub shadow_mapping: bool,
    pub offscreen_framebuffers: bool,
    pub max_texture_size: u32,
    pub msaa: bool,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            shadow_mapping: true,
            offscreen_framebuffers: true,
            max_texture_size: 8192,
            msaa: true,
        }
    }
}

/// Blending mode for scene draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transparency {
    #[default]
    Opaque,
    /// Additive ghost blend without depth writes.
    Ghost,
}

/// Per-tier material state bound for a scene draw.
#[derive(Debug, Clone, Copy)]
pub struct TierBinding {
    pub albedo: TextureHandle,
    pub detail: TextureHandle,
    pub emissive: TextureHandle,
    pub material: TextureHandle,
    pub albedo_color: [f32; 4],
    pub emissive_color: [f32; 4],
    pub uv_offset: Vec2,
    pub uv_scale: Vec2,
    pub roughness: f32,
    pub metalness: f32,
}

impl Default for TierBinding {
    fn default() -> Self {
        Self {
            albedo: TextureHandle::INVALID,
            detail: TextureHandle::INVALID,
            emissive: TextureHandle::INVALID,
            material: TextureHandle::INVALID,
            albedo_color: [1.0, 1.0, 1.0, 1.0],
            emissive_color: [0.0, 0.0, 0.0, 1.0],
            uv_offset: Vec2::ZERO,
            uv_scale: Vec2::ONE,
            roughness: 1.0,
            metalness: 0.0,
        }
    }
}

/// Shadow atlas region as seen by the scene pass: world-to-texture matrix
/// plus the atlas sub-rectangle it maps into.
#[derive(Debug, Clone, Copy)]
pub struct ShadowRegionBinding {
    pub matrix: Mat4,
    pub uv_offset: Vec2,
    pub uv_scale: Vec2,
}

/// Depth-only pass writing shadow casters into the atlas.
pub trait ShadowPass {
    fn begin_shadow(&mut self, atlas: TextureHandle);
    /// Restrict subsequent caster draws to an atlas sub-rectangle
    /// (offset and scale in [0, 1] atlas space).
    fn set_shadow_region(&mut self, offset: Vec2, scale: Vec2);
    fn set_shadow_matrices(&mut self, projection: Mat4, view: Mat4);
    /// Albedo is sampled for alpha-tested casters.
    fn draw_shadow_caster(
        &mut self,
        buffer: BufferHandle,
        kind: PrimitiveKind,
        transform: Mat4,
        albedo: TextureHandle,
    );
    fn end_shadow(&mut self);
}

/// Main 3D pass.
pub trait ScenePass {
    fn begin_scene(&mut self, projection: Mat4, view: Mat4);
    /// Bind the shadow atlas and its region table, or `None` to render
    /// unshadowed.
    fn set_shadow_map(&mut self, atlas: Option<TextureHandle>, regions: &[ShadowRegionBinding]);
    fn set_transparency(&mut self, mode: Transparency);
    fn draw_tier(
        &mut self,
        buffer: BufferHandle,
        kind: PrimitiveKind,
        transform: Mat4,
        binding: &TierBinding,
    );
    /// Draw transient geometry (shadow spots, decal quads) without a
    /// retained buffer.
    fn draw_immediate(
        &mut self,
        kind: PrimitiveKind,
        vertices: &[Vertex],
        texture: TextureHandle,
        transparency: Transparency,
    );
    fn end_scene(&mut self);
}

/// Screen-space pass for the interface, cursor and highlight overlay.
/// Coordinates are in [0, 1] with the origin at the bottom left.
pub trait UiPass {
    fn begin_ui(&mut self);
    fn draw_quad(
        &mut self,
        p1: Vec2,
        p2: Vec2,
        uv1: Vec2,
        uv2: Vec2,
        texture: TextureHandle,
        color: [f32; 4],
    );
    fn draw_lines(&mut self, points: &[Vec2], color: [f32; 4]);
    fn end_ui(&mut self);
}

/// Rendering backend. Object safe so subsystems can hold `&mut dyn Device`.
pub trait Device: ShadowPass + ScenePass + UiPass {
    fn caps(&self) -> DeviceCaps;

    /// Upload an image as a texture. `None` means the device rejected it
    /// (for example, over the size limit).
    fn create_texture(
        &mut self,
        image: &RgbaImage,
        params: &TextureParams,
        label: &str,
    ) -> Option<TextureHandle>;

    /// Replace the pixels of an existing texture of the same size.
    fn update_texture(&mut self, handle: TextureHandle, image: &RgbaImage);

    fn destroy_texture(&mut self, handle: TextureHandle);

    fn destroy_all_textures(&mut self);

    /// Create a square depth texture usable as a shadow atlas.
    fn create_depth_texture(&mut self, size: u32) -> Option<TextureHandle>;

    fn create_vertex_buffer(&mut self, kind: PrimitiveKind, vertices: &[Vertex]) -> BufferHandle;

    /// Rewrite a buffer's contents, growing it if needed.
    fn update_vertex_buffer(
        &mut self,
        handle: BufferHandle,
        kind: PrimitiveKind,
        vertices: &[Vertex],
    );

    fn destroy_vertex_buffer(&mut self, handle: BufferHandle);

    /// Acquire the frame target. Returns false when no frame can be
    /// started (surface lost); the caller skips rendering this frame.
    fn begin_frame(&mut self, clear: [f32; 4]) -> bool;

    fn end_frame(&mut self);

    fn set_msaa(&mut self, enabled: bool);

    /// Read back the current frame's color pixels. `None` when the
    /// backend cannot read (or no frame is in flight).
    fn read_framebuffer(&mut self) -> Option<RgbaImage>;

    /// Current target size in pixels.
    fn size(&self) -> (u32, u32);
}
