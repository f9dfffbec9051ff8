//! Headless device
//!
//! Allocates handles and counts operations without touching a GPU. Used
//! by tests and by server-side runs that simulate without drawing.

use glam::{Mat4, Vec2};
use image::{Rgba, RgbaImage};
use rustc_hash::FxHashMap;

use super::{
    BufferHandle, Device, DeviceCaps, PrimitiveKind, ScenePass, ShadowPass, ShadowRegionBinding,
    TextureHandle, TextureParams, TierBinding, Transparency, UiPass,
};
use crate::scene::Vertex;

/// Device double that records what was asked of it.
pub struct NullDevice {
    caps: DeviceCaps,
    width: u32,
    height: u32,
    next_texture: u32,
    next_buffer: u32,
    textures: FxHashMap<TextureHandle, (u32, u32)>,
    buffers: FxHashMap<BufferHandle, usize>,
    textures_created: usize,
    textures_destroyed: usize,
    texture_uploads: usize,
    buffers_created: usize,
    buffer_uploads: usize,
    draw_calls: usize,
    frames: usize,
    in_frame: bool,
    msaa: bool,
    clear_color: [f32; 4],
}

impl NullDevice {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            caps: DeviceCaps::default(),
            width,
            height,
            next_texture: 1,
            next_buffer: 1,
            textures: FxHashMap::default(),
            buffers: FxHashMap::default(),
            textures_created: 0,
            textures_destroyed: 0,
            texture_uploads: 0,
            buffers_created: 0,
            buffer_uploads: 0,
            draw_calls: 0,
            frames: 0,
            in_frame: false,
            msaa: false,
            clear_color: [0.0; 4],
        }
    }

    /// Override the reported capabilities, for degradation tests.
    #[must_use]
    pub fn with_caps(mut self, caps: DeviceCaps) -> Self {
        self.caps = caps;
        self
    }

    #[must_use]
    pub fn textures_created(&self) -> usize {
        self.textures_created
    }

    #[must_use]
    pub fn textures_destroyed(&self) -> usize {
        self.textures_destroyed
    }

    #[must_use]
    pub fn texture_uploads(&self) -> usize {
        self.texture_uploads
    }

    #[must_use]
    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    #[must_use]
    pub fn buffers_created(&self) -> usize {
        self.buffers_created
    }

    #[must_use]
    pub fn buffer_uploads(&self) -> usize {
        self.buffer_uploads
    }

    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn draw_calls(&self) -> usize {
        self.draw_calls
    }

    #[must_use]
    pub fn frames(&self) -> usize {
        self.frames
    }
}

impl ShadowPass for NullDevice {
    fn begin_shadow(&mut self, _atlas: TextureHandle) {}

    fn set_shadow_region(&mut self, _offset: Vec2, _scale: Vec2) {}

    fn set_shadow_matrices(&mut self, _projection: Mat4, _view: Mat4) {}

    fn draw_shadow_caster(
        &mut self,
        _buffer: BufferHandle,
        _kind: PrimitiveKind,
        _transform: Mat4,
        _albedo: TextureHandle,
    ) {
        self.draw_calls += 1;
    }

    fn end_shadow(&mut self) {}
}

impl ScenePass for NullDevice {
    fn begin_scene(&mut self, _projection: Mat4, _view: Mat4) {}

    fn set_shadow_map(&mut self, _atlas: Option<TextureHandle>, _regions: &[ShadowRegionBinding]) {}

    fn set_transparency(&mut self, _mode: Transparency) {}

    fn draw_tier(
        &mut self,
        _buffer: BufferHandle,
        _kind: PrimitiveKind,
        _transform: Mat4,
        _binding: &TierBinding,
    ) {
        self.draw_calls += 1;
    }

    fn draw_immediate(
        &mut self,
        _kind: PrimitiveKind,
        _vertices: &[Vertex],
        _texture: TextureHandle,
        _transparency: Transparency,
    ) {
        self.draw_calls += 1;
    }

    fn end_scene(&mut self) {}
}

impl UiPass for NullDevice {
    fn begin_ui(&mut self) {}

    fn draw_quad(
        &mut self,
        _p1: Vec2,
        _p2: Vec2,
        _uv1: Vec2,
        _uv2: Vec2,
        _texture: TextureHandle,
        _color: [f32; 4],
    ) {
        self.draw_calls += 1;
    }

    fn draw_lines(&mut self, _points: &[Vec2], _color: [f32; 4]) {
        self.draw_calls += 1;
    }

    fn end_ui(&mut self) {}
}

impl Device for NullDevice {
    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn create_texture(
        &mut self,
        image: &RgbaImage,
        _params: &TextureParams,
        _label: &str,
    ) -> Option<TextureHandle> {
        if image.width() > self.caps.max_texture_size || image.height() > self.caps.max_texture_size
        {
            return None;
        }
        let handle = TextureHandle(self.next_texture);
        self.next_texture += 1;
        self.textures.insert(handle, image.dimensions());
        self.textures_created += 1;
        Some(handle)
    }

    fn update_texture(&mut self, handle: TextureHandle, image: &RgbaImage) {
        if let Some(size) = self.textures.get_mut(&handle) {
            *size = image.dimensions();
            self.texture_uploads += 1;
        }
    }

    fn destroy_texture(&mut self, handle: TextureHandle) {
        if self.textures.remove(&handle).is_some() {
            self.textures_destroyed += 1;
        }
    }

    fn destroy_all_textures(&mut self) {
        self.textures_destroyed += self.textures.len();
        self.textures.clear();
    }

    fn create_depth_texture(&mut self, size: u32) -> Option<TextureHandle> {
        if size > self.caps.max_texture_size {
            return None;
        }
        let handle = TextureHandle(self.next_texture);
        self.next_texture += 1;
        self.textures.insert(handle, (size, size));
        self.textures_created += 1;
        Some(handle)
    }

    fn create_vertex_buffer(&mut self, _kind: PrimitiveKind, vertices: &[Vertex]) -> BufferHandle {
        let handle = BufferHandle(self.next_buffer);
        self.next_buffer += 1;
        self.buffers.insert(handle, vertices.len());
        self.buffers_created += 1;
        self.buffer_uploads += 1;
        handle
    }

    fn update_vertex_buffer(
        &mut self,
        handle: BufferHandle,
        _kind: PrimitiveKind,
        vertices: &[Vertex],
    ) {
        if let Some(len) = self.buffers.get_mut(&handle) {
            *len = vertices.len();
            self.buffer_uploads += 1;
        }
    }

    fn destroy_vertex_buffer(&mut self, handle: BufferHandle) {
        self.buffers.remove(&handle);
    }

    fn begin_frame(&mut self, clear: [f32; 4]) -> bool {
        self.in_frame = true;
        self.clear_color = clear;
        true
    }

    fn end_frame(&mut self) {
        if self.in_frame {
            self.in_frame = false;
            self.frames += 1;
        }
    }

    fn set_msaa(&mut self, enabled: bool) {
        self.msaa = enabled && self.caps.msaa;
    }

    fn read_framebuffer(&mut self) -> Option<RgbaImage> {
        let pixel = Rgba([
            (self.clear_color[0] * 255.0) as u8,
            (self.clear_color[1] * 255.0) as u8,
            (self.clear_color[2] * 255.0) as u8,
            255,
        ]);
        Some(RgbaImage::from_pixel(self.width, self.height, pixel))
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texture_lifecycle_counts() {
        let mut device = NullDevice::new(32, 32);
        let image = RgbaImage::new(4, 4);
        let a = device
            .create_texture(&image, &TextureParams::default(), "a")
            .unwrap();
        let b = device
            .create_texture(&image, &TextureParams::default(), "b")
            .unwrap();
        assert_ne!(a, b);
        assert!(a.is_valid());
        assert_eq!(device.live_textures(), 2);

        device.destroy_texture(a);
        assert_eq!(device.live_textures(), 1);
        device.destroy_all_textures();
        assert_eq!(device.live_textures(), 0);
        assert_eq!(device.textures_destroyed(), 2);
    }

    #[test]
    fn test_oversized_texture_rejected() {
        let mut device = NullDevice::new(32, 32).with_caps(DeviceCaps {
            max_texture_size: 64,
            ..DeviceCaps::default()
        });
        let image = RgbaImage::new(128, 128);
        assert!(device
            .create_texture(&image, &TextureParams::default(), "big")
            .is_none());
    }

    #[test]
    fn test_framebuffer_matches_clear() {
        let mut device = NullDevice::new(8, 8);
        assert!(device.begin_frame([1.0, 0.0, 0.0, 1.0]));
        device.end_frame();
        let pixels = device.read_framebuffer().unwrap();
        assert_eq!(pixels.dimensions(), (8, 8));
        assert_eq!(pixels.get_pixel(0, 0), &Rgba([255, 0, 0, 255]));
        assert_eq!(device.frames(), 1);
    }
}
