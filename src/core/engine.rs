//! Frame pipeline orchestrator
//!
//! `Engine` owns every rendering subsystem and sequences a frame:
//! shadow maps first, then the 3D world (terrain, opaque objects, the
//! deferred ghost pass, decals), then the screen-space interface with the
//! highlight overlay and cursor. While the world is paused a blurred
//! still stands in for the whole 3D portion.
//!
//! External collaborators (sky, water, particles, UI widgets) plug in
//! through the [`FrameHooks`] trait; every callback defaults to a no-op
//! so headless use needs nothing.

use std::path::PathBuf;
use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3};
use log::warn;

use super::config::EngineConfig;
use super::events::{EngineEvent, EventQueue};
use super::stats::FrameStats;
use super::terrain::Terrain;
use crate::device::{
    Device, PrimitiveKind, ScenePass, TextureParams, TierBinding, Transparency, UiPass,
};
use crate::render::capture::{self, PauseBlur};
use crate::render::ground::GroundDecals;
use crate::render::shadow::ShadowMapper;
use crate::render::texture::{TextureCache, TextureLoader, TextureRef};
use crate::scene::{
    culling, BaseObject, BaseObjectStore, Frustum, Handle, ObjectKind, ObjectTable, RankError,
    SceneObject, Vertex,
};

/// Albedo tint for the deferred ghost pass.
const GHOST_COLOR: [f32; 4] = [68.0 / 255.0, 68.0 / 255.0, 68.0 / 255.0, 1.0];

/// Texture holding the blob shadow sprites.
const SHADOW_SPOT_TEXTURE: &str = "effect03.png";

/// Callbacks for the collaborators the engine itself does not own.
/// Every hook defaults to doing nothing.
#[allow(unused_variables)]
pub trait FrameHooks {
    /// Backdrop drawn before the 3D world.
    fn draw_background(&mut self, ui: &mut dyn UiPass) {}
    /// Planets, drawn first inside the scene pass.
    fn draw_planet(&mut self, scene: &mut dyn ScenePass) {}
    fn draw_clouds(&mut self, scene: &mut dyn ScenePass) {}
    /// Water surface, after all objects.
    fn draw_water(&mut self, scene: &mut dyn ScenePass) {}
    fn draw_particles(&mut self, scene: &mut dyn ScenePass) {}
    fn draw_lightning(&mut self, scene: &mut dyn ScenePass) {}
    /// 2D interface widgets.
    fn draw_interface(&mut self, ui: &mut dyn UiPass) {}
    /// Foreground effects over everything else.
    fn draw_foreground(&mut self, ui: &mut dyn UiPass) {}
}

/// Hook implementation that draws nothing.
pub struct NoHooks;

impl FrameHooks for NoHooks {}

/// The engine: owns the device and every rendering subsystem.
pub struct Engine<D: Device> {
    device: D,
    config: EngineConfig,
    terrain: Box<dyn Terrain>,
    cache: TextureCache,
    store: BaseObjectStore,
    objects: ObjectTable,
    shadows: ShadowMapper,
    decals: GroundDecals,
    blur: PauseBlur,
    stats: FrameStats,
    events: EventQueue,

    eye: Vec3,
    look_at: Vec3,
    view_matrix: Mat4,
    proj_matrix: Mat4,

    render_enabled: bool,
    draw_world: bool,

    highlight: Option<(Vec2, Vec2)>,
    highlight_time: f32,

    mouse_pos: Vec2,
    cursor: Option<TextureRef>,
}

impl<D: Device> Engine<D> {
    pub fn new(
        device: D,
        config: EngineConfig,
        terrain: Box<dyn Terrain>,
        loader: Arc<dyn TextureLoader>,
    ) -> Self {
        let mut cache = TextureCache::new(loader);
        cache.set_params(TextureParams {
            filter: config.texture_filter,
            mipmap: config.texture_mipmap,
            repeat: true,
        });
        let shadows = ShadowMapper::new(config.shadows);

        Self {
            device,
            config,
            terrain,
            cache,
            store: BaseObjectStore::new(),
            objects: ObjectTable::new(),
            shadows,
            decals: GroundDecals::new(),
            blur: PauseBlur::new(),
            stats: FrameStats::new(),
            events: EventQueue::new(),
            eye: Vec3::ZERO,
            look_at: Vec3::NEG_Z,
            view_matrix: Mat4::IDENTITY,
            proj_matrix: Mat4::IDENTITY,
            render_enabled: true,
            draw_world: true,
            highlight: None,
            highlight_time: 0.0,
            mouse_pos: Vec2::splat(0.5),
            cursor: None,
        }
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    // Scene content.

    #[must_use]
    pub fn geometry(&self) -> &BaseObjectStore {
        &self.store
    }

    pub fn geometry_mut(&mut self) -> &mut BaseObjectStore {
        &mut self.store
    }

    /// Delete a template geometry and its GPU buffers.
    ///
    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn delete_base_object(&mut self, handle: Handle<BaseObject>) -> Result<(), RankError> {
        self.store.delete(&mut self.device, handle)
    }

    #[must_use]
    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    pub fn objects_mut(&mut self) -> &mut ObjectTable {
        &mut self.objects
    }

    /// Delete an object instance (and its shadow spot).
    ///
    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn delete_object(&mut self, handle: Handle<SceneObject>) -> Result<(), RankError> {
        self.objects.delete(handle)
    }

    /// Re-derive a shadow spot's normal from the terrain.
    ///
    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn update_spot_normal(&mut self, handle: Handle<SceneObject>) -> Result<(), RankError> {
        self.objects.update_spot_normal(handle, self.terrain.as_ref())
    }

    #[must_use]
    pub fn ground(&self) -> &GroundDecals {
        &self.decals
    }

    pub fn ground_mut(&mut self) -> &mut GroundDecals {
        &mut self.decals
    }

    // Textures.

    /// Load (or fetch from cache) a texture by name.
    pub fn load_texture(&mut self, name: &str) -> TextureRef {
        self.cache.load(&mut self.device, name)
    }

    /// Release a texture by name.
    pub fn delete_texture(&mut self, name: &str) {
        self.cache.delete_by_name(&mut self.device, name);
    }

    /// Drop every cached texture. Tier handles are re-resolved and the
    /// ground decals recomposed on the next frame.
    pub fn flush_texture_cache(&mut self) {
        self.cache.flush(&mut self.device);
        self.store.invalidate_textures();
        self.decals.force_regenerate();
        self.cursor = None;
    }

    /// Decode a batch of textures on a background thread. Results arrive
    /// through [`poll_events`](Self::poll_events).
    pub fn preload_textures(&self, names: Vec<String>) {
        let loader = self.cache.loader();
        let sender = self.events.sender();
        std::thread::spawn(move || {
            for name in names {
                let event = match loader.load(&name) {
                    Ok(image) => EngineEvent::TexturePreloaded {
                        name,
                        image: Box::new(image),
                    },
                    Err(err) => {
                        warn!("Texture preload failed for '{name}': {err}");
                        EngineEvent::TexturePreloadFailed { name }
                    }
                };
                if sender.send(event).is_err() {
                    break;
                }
            }
        });
    }

    /// Drain background-thread events, uploading any pre-loaded textures,
    /// and hand them to the host.
    pub fn poll_events(&mut self) -> Vec<EngineEvent> {
        let events = self.events.drain();
        for event in &events {
            if let EngineEvent::TexturePreloaded { name, image } = event {
                self.cache.insert_loaded(&mut self.device, name, image);
            }
        }
        events
    }

    /// Write the last rendered frame to a PNG on a background thread.
    /// Completion is reported as an [`EngineEvent::ScreenshotWritten`].
    pub fn write_screenshot(&mut self, path: PathBuf) {
        let _ = capture::write_screenshot(&mut self.device, path, self.events.sender());
    }

    // View and frame state.

    /// Supply the camera for the next frame.
    pub fn set_view_params(&mut self, eye: Vec3, look_at: Vec3, view: Mat4, projection: Mat4) {
        self.eye = eye;
        self.look_at = look_at;
        self.view_matrix = view;
        self.proj_matrix = projection;
    }

    /// Master render switch; a disabled engine skips frames entirely.
    pub fn set_render_enabled(&mut self, enabled: bool) {
        self.render_enabled = enabled;
    }

    /// Toggle the 3D world portion (the interface always draws).
    pub fn set_draw_world(&mut self, draw: bool) {
        self.draw_world = draw;
    }

    /// Highlight a screen-space rectangle (both corners in [0, 1]).
    pub fn set_highlight(&mut self, p1: Vec2, p2: Vec2) {
        self.highlight = Some((p1, p2));
    }

    pub fn clear_highlight(&mut self) {
        self.highlight = None;
    }

    pub fn set_mouse_pos(&mut self, pos: Vec2) {
        self.mouse_pos = pos;
    }

    /// Choose the cursor sprite, or hide the cursor with `None`.
    pub fn set_cursor_texture(&mut self, name: Option<&str>) {
        self.cursor = name.map(|name| self.cache.load(&mut self.device, name));
    }

    /// Freeze the world into a blurred still at the end of the next
    /// rendered frame.
    pub fn enable_pause_blur(&mut self) {
        if self.config.pause_blur {
            self.blur.request();
        }
    }

    /// Resume live world rendering.
    pub fn disable_pause_blur(&mut self) {
        self.blur.invalidate(&mut self.device);
    }

    /// Whether a captured still currently replaces the world.
    #[must_use]
    pub fn is_world_frozen(&self) -> bool {
        self.blur.is_captured()
    }

    /// Toggle the terrain resource overlay on the ground decals.
    pub fn set_debug_resources(&mut self, enabled: bool) {
        self.decals.set_debug_resources(enabled);
    }

    /// Advance per-frame state: cached distances, the ground mark
    /// animation, the highlight pulse, and the deferred geometry flush.
    pub fn frame_update(&mut self, rel_time: f32) {
        self.stats.push_frame(rel_time);
        self.highlight_time += rel_time;
        self.objects.compute_distances(self.eye);
        self.decals.frame_update(rel_time);
        self.store.flush_dirty(&mut self.device);
    }

    /// Render one frame.
    pub fn render(&mut self, hooks: &mut dyn FrameHooks) {
        if !self.render_enabled {
            return;
        }
        self.stats.start_frame();

        if !self.device.begin_frame(self.config.background_color) {
            return;
        }

        if self.blur.is_captured() && !self.blur.is_pending() {
            self.draw_captured_world();
        } else {
            let shadowed = if self.draw_world {
                self.shadows.render(
                    &mut self.device,
                    self.eye,
                    self.look_at,
                    &mut self.objects,
                    &self.store,
                )
            } else {
                false
            };

            if self.config.msaa {
                self.device.set_msaa(true);
            }

            self.device.begin_ui();
            hooks.draw_background(&mut self.device);
            self.device.end_ui();

            if self.draw_world {
                self.draw_3d_scene(hooks, shadowed);
            }

            self.device.set_msaa(false);

            if self.blur.is_pending() && self.blur.capture(&mut self.device) {
                self.draw_captured_world();
            }
        }

        self.device.begin_ui();
        hooks.draw_interface(&mut self.device);
        self.device.end_ui();

        self.draw_front_objects();

        self.device.begin_ui();
        hooks.draw_foreground(&mut self.device);
        self.draw_highlight();
        self.draw_cursor();
        self.device.end_ui();

        self.device.end_frame();
    }

    fn draw_3d_scene(&mut self, hooks: &mut dyn FrameHooks, shadowed: bool) {
        self.decals
            .update_textures(&mut self.device, &mut self.cache, self.terrain.as_ref());
        self.resolve_tier_textures();

        self.device.begin_scene(self.proj_matrix, self.view_matrix);

        if shadowed {
            let regions = self.shadows.region_bindings();
            self.device.set_shadow_map(self.shadows.atlas(), &regions);
        } else {
            self.device.set_shadow_map(None, &[]);
        }

        hooks.draw_planet(&mut self.device);
        hooks.draw_clouds(&mut self.device);

        let frustum = Frustum::from_matrix(self.proj_matrix * self.view_matrix);

        // Terrain first, then everything else with ghosts deferred to a
        // translucent pass that leaves depth untouched.
        self.draw_object_pass(&frustum, ObjectKind::Terrain, Transparency::Opaque);

        if !shadowed {
            self.draw_shadow_spots();
        }

        let ghosts = self.draw_object_pass(&frustum, ObjectKind::Fixed, Transparency::Opaque);
        if ghosts {
            self.device.set_transparency(Transparency::Ghost);
            self.draw_ghost_pass(&frustum);
            self.device.set_transparency(Transparency::Opaque);
        }

        hooks.draw_water(&mut self.device);
        hooks.draw_particles(&mut self.device);
        hooks.draw_lightning(&mut self.device);

        self.device.end_scene();
    }

    /// Draw one class of objects; returns whether any ghost was skipped
    /// for the deferred pass.
    fn draw_object_pass(
        &mut self,
        frustum: &Frustum,
        class: ObjectKind,
        transparency: Transparency,
    ) -> bool {
        let terrain_pass = class == ObjectKind::Terrain;
        let mut deferred_ghosts = false;

        for handle in self.objects.handles() {
            let Ok(object) = self.objects.get(handle) else {
                continue;
            };
            if (object.kind == ObjectKind::Terrain) != terrain_pass {
                continue;
            }
            if !object.draw_world {
                continue;
            }
            if object.ghost && transparency == Transparency::Opaque {
                deferred_ghosts = true;
                continue;
            }
            if !culling::is_visible(&mut self.objects, &self.store, frustum, handle) {
                continue;
            }

            let Ok(object) = self.objects.get(handle) else {
                continue;
            };
            let transform = object.transform;
            let Some(base) = object.base.and_then(|base| self.store.get(base).ok()) else {
                continue;
            };

            for tier in &base.tiers {
                let Some(buffer) = tier.buffer else {
                    continue;
                };
                let binding = tier_binding(tier, transparency);
                self.device.draw_tier(buffer, tier.kind, transform, &binding);
                self.stats.add_triangles(tier_triangles(tier));
            }
        }

        deferred_ghosts
    }

    fn draw_ghost_pass(&mut self, frustum: &Frustum) {
        for handle in self.objects.handles() {
            let Ok(object) = self.objects.get(handle) else {
                continue;
            };
            if !object.ghost || !object.draw_world || object.kind == ObjectKind::Terrain {
                continue;
            }
            if !culling::is_visible(&mut self.objects, &self.store, frustum, handle) {
                continue;
            }

            let Ok(object) = self.objects.get(handle) else {
                continue;
            };
            let transform = object.transform;
            let Some(base) = object.base.and_then(|base| self.store.get(base).ok()) else {
                continue;
            };

            for tier in &base.tiers {
                let Some(buffer) = tier.buffer else {
                    continue;
                };
                let binding = tier_binding(tier, Transparency::Ghost);
                self.device.draw_tier(buffer, tier.kind, transform, &binding);
                self.stats.add_triangles(tier_triangles(tier));
            }
        }
    }

    /// Blob shadows drawn under objects when shadow mapping is off.
    fn draw_shadow_spots(&mut self) {
        let texture = self.cache.load(&mut self.device, SHADOW_SPOT_TEXTURE).handle;
        let eye = self.eye;

        // Sprite sheet cells, shrunk half a texel to avoid bleeding.
        let dp = 0.5 / 256.0;
        let (v0, v1) = (192.0 / 256.0 + dp, 224.0 / 256.0 - dp);

        let mut quads: Vec<[Vertex; 4]> = Vec::new();

        for spot in self.objects.shadow_spots() {
            if spot.hidden {
                continue;
            }

            let mut pos = spot.position;
            if eye.y == pos.y {
                continue;
            }

            // Lift the quad toward the camera so it never z-fights the
            // ground it shadows.
            let above = eye.y > pos.y;
            let height = (eye.y - pos.y).abs();
            let h = spot
                .radius
                .min(height * if above { 0.5 } else { 0.1 })
                .min(4.0);
            let big_d = eye.distance(pos);
            if big_d < f32::EPSILON {
                continue;
            }
            let d = big_d * h / height;
            pos.x += (eye.x - pos.x) * d / big_d;
            pos.z += (eye.z - pos.z) * d / big_d;
            pos.y += if above { h } else { -h };

            // Higher objects cast larger, fainter spots.
            let h_factor = ((1.0 - (spot.height / 20.0).clamp(0.0, 1.0)).powi(2)).max(0.2);
            let radius = spot.radius * 1.5 * (2.0 - h_factor) * (1.0 - d / big_d);

            let flattened = spot.kind == crate::scene::ShadowSpotKind::Flattened;
            let (u0, u1) = if flattened {
                (96.0 / 256.0 + dp, 128.0 / 256.0 - dp)
            } else {
                (64.0 / 256.0 + dp, 96.0 / 256.0 - dp)
            };

            let corner = |x: f32, z: f32| {
                let local = if flattened {
                    let (sin, cos) = (-spot.angle).sin_cos();
                    Vec3::new(x * cos - z * sin, 0.0, x * sin + z * cos)
                } else {
                    Vec3::new(x, 0.0, z)
                };
                local.cross(spot.normal) + pos
            };

            let c0 = corner(radius, radius);
            let c1 = corner(-radius, radius);
            let c2 = corner(radius, -radius);
            let c3 = corner(-radius, -radius);

            let intensity = (0.5 + spot.intensity * 0.5) * h_factor;
            if intensity == 0.0 {
                continue;
            }
            let color = [intensity, intensity, intensity, intensity];
            let vertex = |p: Vec3, u: f32, v: f32| Vertex {
                position: p.to_array(),
                normal: [0.0, 1.0, 0.0],
                uv: [u, v],
                color,
            };

            quads.push([
                vertex(c1, u0, v0),
                vertex(c0, u1, v0),
                vertex(c3, u0, v1),
                vertex(c2, u1, v1),
            ]);
        }

        for quad in &quads {
            self.device
                .draw_immediate(PrimitiveKind::TriangleStrip, quad, texture, Transparency::Ghost);
            self.stats.add_triangles(2);
        }
    }

    /// Objects flagged `draw_front` render again over the interface.
    fn draw_front_objects(&mut self) {
        let any_front = self.objects.iter().any(|object| object.draw_front);
        if !any_front {
            return;
        }

        self.device.begin_scene(self.proj_matrix, self.view_matrix);
        self.device.set_shadow_map(None, &[]);

        let frustum = Frustum::from_matrix(self.proj_matrix * self.view_matrix);
        for handle in self.objects.handles() {
            let Ok(object) = self.objects.get(handle) else {
                continue;
            };
            if !object.draw_front {
                continue;
            }
            if !culling::is_visible(&mut self.objects, &self.store, &frustum, handle) {
                continue;
            }

            let Ok(object) = self.objects.get(handle) else {
                continue;
            };
            let transform = object.transform;
            let Some(base) = object.base.and_then(|base| self.store.get(base).ok()) else {
                continue;
            };

            for tier in &base.tiers {
                let Some(buffer) = tier.buffer else {
                    continue;
                };
                let binding = tier_binding(tier, Transparency::Opaque);
                self.device.draw_tier(buffer, tier.kind, transform, &binding);
                self.stats.add_triangles(tier_triangles(tier));
            }
        }

        self.device.end_scene();
    }

    /// Pulsing corner brackets around the highlighted rectangle.
    fn draw_highlight(&mut self) {
        let Some((mut p1, mut p2)) = self.highlight else {
            return;
        };

        // Mostly offscreen rectangles are not worth drawing.
        let out = [p1.x, p1.y, p2.x, p2.y]
            .iter()
            .filter(|c| **c < 0.0 || **c > 1.0)
            .count();
        if out > 2 {
            return;
        }

        let mut d = 0.5 + (self.highlight_time * 6.0).sin() * 0.5;
        d *= (p2.x - p1.x) * 0.1;
        p1 += Vec2::splat(d);
        p2 -= Vec2::splat(d);

        let yellow = [1.0, 1.0, 0.0, 1.0];
        let dx = (p2.x - p1.x) / 5.0;
        let dy = (p2.y - p1.y) / 5.0;

        let corners = [
            [Vec2::new(p1.x, p1.y + dy), Vec2::new(p1.x, p1.y), Vec2::new(p1.x + dx, p1.y)],
            [Vec2::new(p2.x - dx, p1.y), Vec2::new(p2.x, p1.y), Vec2::new(p2.x, p1.y + dy)],
            [Vec2::new(p2.x, p2.y - dy), Vec2::new(p2.x, p2.y), Vec2::new(p2.x - dx, p2.y)],
            [Vec2::new(p1.x + dx, p2.y), Vec2::new(p1.x, p2.y), Vec2::new(p1.x, p2.y - dy)],
        ];
        for corner in &corners {
            self.device.draw_lines(corner, yellow);
        }
    }

    fn draw_cursor(&mut self) {
        let Some(cursor) = self.cursor else {
            return;
        };
        if !cursor.is_valid() {
            return;
        }

        let size = 0.05;
        let p1 = Vec2::new(self.mouse_pos.x, self.mouse_pos.y - size);
        let p2 = Vec2::new(self.mouse_pos.x + size, self.mouse_pos.y);
        self.device.draw_quad(
            p1,
            p2,
            Vec2::ZERO,
            Vec2::ONE,
            cursor.handle,
            [1.0, 1.0, 1.0, 1.0],
        );
    }

    /// Fullscreen quad of the blurred pause capture.
    fn draw_captured_world(&mut self) {
        let Some(texture) = self.blur.texture() else {
            return;
        };
        self.device.begin_ui();
        self.device.draw_quad(
            Vec2::ZERO,
            Vec2::ONE,
            Vec2::ZERO,
            Vec2::ONE,
            texture,
            [1.0, 1.0, 1.0, 1.0],
        );
        self.device.end_ui();
    }

    /// Resolve tier texture names to device handles through the cache.
    fn resolve_tier_textures(&mut self) {
        for object in self.store.objects_mut() {
            for tier in object.tiers.iter_mut() {
                let slots = [
                    (&tier.material.albedo_texture, &mut tier.textures.albedo),
                    (&tier.material.detail_texture, &mut tier.textures.detail),
                    (&tier.material.emissive_texture, &mut tier.textures.emissive),
                    (&tier.material.material_texture, &mut tier.textures.material),
                ];
                for (name, slot) in slots {
                    if !slot.is_valid() && !name.is_empty() {
                        *slot = self.cache.load(&mut self.device, name).handle;
                    }
                }
            }
        }
    }
}

fn tier_binding(tier: &crate::scene::DataTier, transparency: Transparency) -> TierBinding {
    let albedo_color = match transparency {
        Transparency::Opaque => tier.material.albedo_color,
        Transparency::Ghost => GHOST_COLOR,
    };
    TierBinding {
        albedo: tier.textures.albedo,
        detail: tier.textures.detail,
        emissive: tier.textures.emissive,
        material: tier.textures.material,
        albedo_color,
        emissive_color: tier.material.emissive_color,
        uv_offset: tier.uv_offset,
        uv_scale: tier.uv_scale,
        roughness: tier.material.roughness,
        metalness: tier.material.metalness,
    }
}

fn tier_triangles(tier: &crate::scene::DataTier) -> usize {
    match tier.kind {
        PrimitiveKind::TriangleList => tier.vertices.len() / 3,
        PrimitiveKind::TriangleStrip => tier.vertices.len().saturating_sub(2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FlatTerrain;
    use crate::device::NullDevice;
    use crate::render::texture::TextureError;
    use crate::scene::MaterialDef;
    use image::RgbaImage;

    struct StubLoader;

    impl TextureLoader for StubLoader {
        fn load(&self, name: &str) -> Result<RgbaImage, TextureError> {
            if name.ends_with(".missing") {
                Err(TextureError::IoError(std::io::Error::from(
                    std::io::ErrorKind::NotFound,
                )))
            } else {
                Ok(RgbaImage::new(8, 8))
            }
        }
    }

    fn engine() -> Engine<NullDevice> {
        Engine::new(
            NullDevice::new(64, 64),
            EngineConfig::default(),
            Box::new(FlatTerrain),
            Arc::new(StubLoader),
        )
    }

    fn add_cube(engine: &mut Engine<NullDevice>) -> Handle<SceneObject> {
        let base = engine.geometry_mut().create();
        let n = [0.0, 1.0, 0.0];
        engine
            .geometry_mut()
            .add_triangles(
                base,
                &[
                    Vertex::new([-1.0, 0.0, -1.0], n, [0.0, 0.0]),
                    Vertex::new([1.0, 0.0, -1.0], n, [1.0, 0.0]),
                    Vertex::new([0.0, 2.0, 1.0], n, [0.5, 1.0]),
                ],
                &MaterialDef::with_albedo("cube.png"),
                PrimitiveKind::TriangleList,
            )
            .unwrap();

        let object = engine.objects_mut().create();
        engine.objects_mut().set_base(object, Some(base)).unwrap();
        object
    }

    fn look_at_origin(engine: &mut Engine<NullDevice>) {
        let eye = Vec3::new(0.0, 5.0, 10.0);
        let view = Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(1.0, 1.0, 0.1, 1000.0);
        engine.set_view_params(eye, Vec3::ZERO, view, proj);
    }

    #[test]
    fn test_frame_renders_scene() {
        let mut engine = engine();
        add_cube(&mut engine);
        look_at_origin(&mut engine);

        engine.frame_update(0.016);
        engine.render(&mut NoHooks);

        let device = engine.device_mut();
        assert_eq!(device.frames(), 1);
        // Four shadow cascades plus the visible object itself.
        assert!(device.draw_calls() >= 5);
        assert_eq!(engine.stats().triangles(), 1);
    }

    #[test]
    fn test_render_disabled_skips_frame() {
        let mut engine = engine();
        add_cube(&mut engine);
        engine.set_render_enabled(false);

        engine.frame_update(0.016);
        engine.render(&mut NoHooks);
        assert_eq!(engine.device_mut().frames(), 0);
    }

    #[test]
    fn test_pause_blur_substitutes_world() {
        let mut engine = engine();
        add_cube(&mut engine);
        look_at_origin(&mut engine);

        engine.frame_update(0.016);
        engine.enable_pause_blur();
        engine.render(&mut NoHooks);
        assert!(engine.is_world_frozen());

        // The frozen frame draws the captured quad instead of the scene.
        let before = engine.device_mut().draw_calls();
        engine.render(&mut NoHooks);
        let delta = engine.device_mut().draw_calls() - before;
        assert_eq!(delta, 1);

        engine.disable_pause_blur();
        assert!(!engine.is_world_frozen());
    }

    #[test]
    fn test_ghost_objects_deferred_not_dropped() {
        let mut engine = engine();
        let object = add_cube(&mut engine);
        engine.objects_mut().set_ghost(object, true).unwrap();
        look_at_origin(&mut engine);

        engine.frame_update(0.016);
        engine.render(&mut NoHooks);
        // The ghost still contributes its triangles.
        assert_eq!(engine.stats().triangles(), 1);
    }

    #[test]
    fn test_shadow_spots_drawn_when_mapping_disabled() {
        let mut engine = Engine::new(
            NullDevice::new(64, 64),
            EngineConfig::default().with_shadows(crate::render::ShadowConfig {
                enabled: false,
                ..Default::default()
            }),
            Box::new(FlatTerrain),
            Arc::new(StubLoader),
        );
        let object = add_cube(&mut engine);
        engine.objects_mut().create_shadow_spot(object).unwrap();
        {
            let spot = engine.objects_mut().shadow_spot_mut(object).unwrap();
            spot.radius = 2.0;
            spot.intensity = 1.0;
        }
        look_at_origin(&mut engine);

        engine.frame_update(0.016);
        engine.render(&mut NoHooks);
        // Spot quad adds two triangles to the object's one.
        assert_eq!(engine.stats().triangles(), 3);
    }

    #[test]
    fn test_flush_texture_cache_resets_resolution() {
        let mut engine = engine();
        add_cube(&mut engine);
        look_at_origin(&mut engine);

        engine.frame_update(0.016);
        engine.render(&mut NoHooks);
        assert!(engine.load_texture("cube.png").is_valid());

        engine.flush_texture_cache();
        let resolved = engine
            .geometry()
            .objects()
            .flat_map(|o| o.tiers.iter())
            .all(|t| !t.textures.albedo.is_valid());
        assert!(resolved);

        // The next frame re-resolves and recomposes decals.
        engine.render(&mut NoHooks);
        assert!(engine
            .geometry()
            .objects()
            .flat_map(|o| o.tiers.iter())
            .all(|t| t.textures.albedo.is_valid()));
    }

    #[test]
    fn test_preload_arrives_as_event() {
        let mut engine = engine();
        engine.preload_textures(vec!["a.png".to_string(), "b.missing".to_string()]);

        let mut loaded = 0;
        let mut failed = 0;
        for _ in 0..100 {
            for event in engine.poll_events() {
                match event {
                    EngineEvent::TexturePreloaded { .. } => loaded += 1,
                    EngineEvent::TexturePreloadFailed { .. } => failed += 1,
                    EngineEvent::ScreenshotWritten { .. } => {}
                }
            }
            if loaded + failed == 2 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(loaded, 1);
        assert_eq!(failed, 1);
        assert!(engine.load_texture("a.png").is_valid());
    }

    #[test]
    fn test_highlight_drawn_with_world_disabled() {
        let mut engine = engine();
        engine.set_draw_world(false);
        engine.set_highlight(Vec2::new(0.2, 0.2), Vec2::new(0.8, 0.8));

        engine.frame_update(0.016);
        engine.render(&mut NoHooks);
        // Four corner brackets.
        assert_eq!(engine.device_mut().draw_calls(), 4);
    }
}
