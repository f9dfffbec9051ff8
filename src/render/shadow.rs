//! Cascaded shadow maps
//!
//! The sun direction is fixed. The atlas holds either four cascades with
//! world ranges 16/64/256/1024 packed into quadrants (quality mode) or a
//! single 256-range region over the whole texture (simple mode). Cascade
//! centers are snapped to texel-sized increments in light space so the
//! shadow edges do not shimmer as the camera pans.

use glam::{Mat4, Vec2, Vec3};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::device::{Device, ShadowRegionBinding, TextureHandle};
use crate::scene::{culling, BaseObjectStore, Frustum, ObjectKind, ObjectTable};

/// Sun direction, deliberately unnormalized: its length is folded into
/// the light-space transform exactly as the projection expects.
const LIGHT_DIR: Vec3 = Vec3::new(1.0, 2.0, -1.0);

/// Half-extent of the depth range around each cascade center.
const DEPTH_EXTENT: f32 = 200.0;

/// Shadow mapping configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShadowConfig {
    pub enabled: bool,
    /// Four cascades instead of one region.
    pub quality: bool,
    /// Let terrain geometry cast shadows too.
    pub terrain_shadows: bool,
    /// Requested atlas resolution; clamped to device limits.
    pub resolution: u32,
    /// Render the atlas offscreen when the device supports it.
    pub offscreen: bool,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            quality: true,
            terrain_shadows: false,
            resolution: 1024,
            offscreen: true,
        }
    }
}

/// One atlas region with its world range and sub-rectangle.
#[derive(Debug, Clone, Copy)]
pub struct ShadowRegion {
    pub range: f32,
    pub offset: Vec2,
    pub scale: Vec2,
    /// World-to-shadow-texture matrix, filled in during rendering.
    pub texture_matrix: Mat4,
}

/// Region layout for a mode: (range, atlas offset, atlas scale).
fn region_table(quality: bool) -> SmallVec<[ShadowRegion; 4]> {
    let blank = |range, offset, scale| ShadowRegion {
        range,
        offset,
        scale,
        texture_matrix: Mat4::IDENTITY,
    };

    if quality {
        let half = Vec2::splat(0.5);
        SmallVec::from_slice(&[
            blank(16.0, Vec2::new(0.0, 0.0), half),
            blank(64.0, Vec2::new(0.5, 0.0), half),
            blank(256.0, Vec2::new(0.0, 0.5), half),
            blank(1024.0, Vec2::new(0.5, 0.5), half),
        ])
    } else {
        SmallVec::from_slice(&[blank(256.0, Vec2::ZERO, Vec2::ONE)])
    }
}

/// Projection distance for a region, with the resolution-scaled fallback
/// when the region carries no explicit range.
fn region_dist(range: f32, resolution: u32) -> f32 {
    if range < 0.5 {
        75.0 * ((resolution as f32).log2() - 6.5)
    } else {
        range
    }
}

/// Snap a cascade center to the light-space texel grid.
///
/// The candidate position sits a quarter of the projection distance ahead
/// of the look-at point, then is rounded to whole texels in a frame
/// aligned with the light so sub-texel camera motion cannot move the
/// rasterized shadow.
fn snapped_center(eye: Vec3, look_at: Vec3, dist: f32, resolution: u32) -> Vec3 {
    let mut dir = look_at - eye;
    dir.y = 0.0;
    let dir = dir.normalize_or_zero();

    let candidate = look_at + 0.25 * dist * dir;

    let light_rotation = Mat4::look_at_rh(Vec3::ZERO, LIGHT_DIR, Vec3::Y);
    let mut pos = light_rotation.transform_point3(candidate);

    let world_units_per_texel = (dist * 2.0) / resolution as f32;
    pos = (pos / world_units_per_texel).round() * world_units_per_texel;

    light_rotation.inverse().transform_point3(pos)
}

/// Projection, view and bias-composed texture matrices for one cascade.
fn light_matrices(center: Vec3, dist: f32) -> (Mat4, Mat4, Mat4) {
    let projection = Mat4::orthographic_rh(-dist, dist, -dist, dist, -DEPTH_EXTENT, DEPTH_EXTENT);
    let view = Mat4::look_at_rh(center, center - LIGHT_DIR, Vec3::Y);

    // Clip space [-1, 1] to texture space [0, 1].
    let bias =
        Mat4::from_scale(Vec3::splat(0.5)) * Mat4::from_translation(Vec3::new(1.0, 1.0, 1.0));
    let texture = bias * projection * view;

    (projection, view, texture)
}

/// Owns the shadow atlas and runs the depth-only caster pass.
pub struct ShadowMapper {
    config: ShadowConfig,
    atlas: Option<TextureHandle>,
    atlas_resolution: u32,
    regions: SmallVec<[ShadowRegion; 4]>,
    warned_unsupported: bool,
    warned_no_offscreen: bool,
}

impl ShadowMapper {
    #[must_use]
    pub fn new(config: ShadowConfig) -> Self {
        Self {
            config,
            atlas: None,
            atlas_resolution: 0,
            regions: SmallVec::new(),
            warned_unsupported: false,
            warned_no_offscreen: false,
        }
    }

    /// Whether terrain objects are casting.
    #[must_use]
    pub fn terrain_shadows(&self) -> bool {
        self.config.terrain_shadows
    }

    /// The atlas texture, once rendering created it.
    #[must_use]
    pub fn atlas(&self) -> Option<TextureHandle> {
        self.atlas
    }

    /// Resolution of the created atlas (zero before first render).
    #[must_use]
    pub fn atlas_resolution(&self) -> u32 {
        self.atlas_resolution
    }

    /// Region table for the scene pass to sample with.
    #[must_use]
    pub fn region_bindings(&self) -> SmallVec<[ShadowRegionBinding; 4]> {
        self.regions
            .iter()
            .map(|region| ShadowRegionBinding {
                matrix: region.texture_matrix,
                uv_offset: region.offset,
                uv_scale: region.scale,
            })
            .collect()
    }

    /// Render every caster into the atlas.
    ///
    /// Capabilities are re-checked on each call: a device that cannot do
    /// shadow mapping turns the whole pass off (warned once), one without
    /// offscreen framebuffers falls back to the plain depth-texture path,
    /// and the atlas resolution is clamped to the device limit.
    pub fn render(
        &mut self,
        device: &mut dyn Device,
        eye: Vec3,
        look_at: Vec3,
        table: &mut ObjectTable,
        store: &BaseObjectStore,
    ) -> bool {
        let caps = device.caps();

        if !self.config.enabled || !caps.shadow_mapping {
            if self.config.enabled && !self.warned_unsupported {
                warn!("Device has no shadow map support, shadows disabled");
                self.warned_unsupported = true;
            }
            return false;
        }

        if self.config.offscreen && !caps.offscreen_framebuffers {
            if !self.warned_no_offscreen {
                warn!("No offscreen framebuffers, using plain depth texture for shadows");
                self.warned_no_offscreen = true;
            }
            self.config.offscreen = false;
        }

        let resolution = self.config.resolution.min(caps.max_texture_size);

        if self.atlas.is_none() || self.atlas_resolution != resolution {
            if let Some(old) = self.atlas.take() {
                device.destroy_texture(old);
            }
            match device.create_depth_texture(resolution) {
                Some(atlas) => {
                    info!("Created shadow atlas {resolution}x{resolution}");
                    self.atlas = Some(atlas);
                    self.atlas_resolution = resolution;
                }
                None => {
                    if !self.warned_unsupported {
                        warn!("Shadow atlas creation failed, shadows disabled");
                        self.warned_unsupported = true;
                    }
                    return false;
                }
            }
        }

        let atlas = match self.atlas {
            Some(atlas) => atlas,
            None => return false,
        };

        self.regions = region_table(self.config.quality);

        device.begin_shadow(atlas);

        for index in 0..self.regions.len() {
            let region = self.regions[index];
            device.set_shadow_region(region.offset, region.scale);

            let dist = region_dist(region.range, resolution);
            let center = snapped_center(eye, look_at, dist, resolution);
            let (projection, view, texture_matrix) = light_matrices(center, dist);
            self.regions[index].texture_matrix = texture_matrix;

            device.set_shadow_matrices(projection, view);

            let frustum = Frustum::from_matrix(projection * view);
            for handle in table.handles() {
                let Ok(object) = table.get(handle) else {
                    continue;
                };
                if object.kind == ObjectKind::Terrain && !self.config.terrain_shadows {
                    continue;
                }
                if !culling::is_visible(table, store, &frustum, handle) {
                    continue;
                }

                let Ok(object) = table.get(handle) else {
                    continue;
                };
                let Some(base) = object.base.and_then(|base| store.get(base).ok()) else {
                    continue;
                };
                let transform = object.transform;

                for tier in &base.tiers {
                    if let Some(buffer) = tier.buffer {
                        device.draw_shadow_caster(buffer, tier.kind, transform, tier.textures.albedo);
                    }
                }
            }
        }

        device.end_shadow();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCaps, NullDevice, PrimitiveKind};
    use crate::scene::{MaterialDef, Vertex};

    fn scene_with_one_caster() -> (ObjectTable, BaseObjectStore, NullDevice) {
        let mut device = NullDevice::new(64, 64);
        let mut store = BaseObjectStore::new();
        let mut table = ObjectTable::new();

        let base = store.create();
        let n = [0.0, 1.0, 0.0];
        store
            .add_triangles(
                base,
                &[
                    Vertex::new([-1.0, 0.0, -1.0], n, [0.0, 0.0]),
                    Vertex::new([1.0, 0.0, -1.0], n, [1.0, 0.0]),
                    Vertex::new([0.0, 2.0, 1.0], n, [0.5, 1.0]),
                ],
                &MaterialDef::default(),
                PrimitiveKind::TriangleList,
            )
            .unwrap();
        store.flush_dirty(&mut device);

        let object = table.create();
        table.set_base(object, Some(base)).unwrap();

        (table, store, device)
    }

    #[test]
    fn test_quality_region_layout() {
        let regions = region_table(true);
        assert_eq!(regions.len(), 4);
        assert_eq!(regions[0].range, 16.0);
        assert_eq!(regions[1].range, 64.0);
        assert_eq!(regions[2].range, 256.0);
        assert_eq!(regions[3].range, 1024.0);

        assert_eq!(regions[0].offset, Vec2::new(0.0, 0.0));
        assert_eq!(regions[1].offset, Vec2::new(0.5, 0.0));
        assert_eq!(regions[2].offset, Vec2::new(0.0, 0.5));
        assert_eq!(regions[3].offset, Vec2::new(0.5, 0.5));
        assert!(regions.iter().all(|r| r.scale == Vec2::splat(0.5)));
    }

    #[test]
    fn test_simple_region_layout() {
        let regions = region_table(false);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].range, 256.0);
        assert_eq!(regions[0].offset, Vec2::ZERO);
        assert_eq!(regions[0].scale, Vec2::ONE);
    }

    #[test]
    fn test_zero_range_fallback_scales_with_resolution() {
        assert!((region_dist(0.0, 1024) - 262.5).abs() < 1e-4);
        assert!((region_dist(0.0, 128) - 37.5).abs() < 1e-4);
        assert_eq!(region_dist(256.0, 1024), 256.0);
    }

    #[test]
    fn test_texel_snap_absorbs_small_motion() {
        // dist 256 at resolution 1024 gives 0.5 world units per texel;
        // camera shifts below that must not move the cascade center.
        let look_at = Vec3::new(100.0, 0.0, 50.0);
        let eye = Vec3::new(90.0, 5.0, 50.0);

        let a = snapped_center(eye, look_at, 256.0, 1024);
        let b = snapped_center(
            eye + Vec3::new(0.1, 0.0, 0.1),
            look_at + Vec3::new(0.1, 0.0, 0.1),
            256.0,
            1024,
        );
        assert!((a - b).length() < 1e-3);
    }

    #[test]
    fn test_texel_snap_tracks_large_motion() {
        let look_at = Vec3::new(100.0, 0.0, 50.0);
        let eye = Vec3::new(90.0, 5.0, 50.0);

        let a = snapped_center(eye, look_at, 256.0, 1024);
        let b = snapped_center(
            eye + Vec3::new(40.0, 0.0, 0.0),
            look_at + Vec3::new(40.0, 0.0, 0.0),
            256.0,
            1024,
        );
        assert!((a - b).length() > 10.0);
    }

    #[test]
    fn test_render_draws_casters() {
        let (mut table, store, mut device) = scene_with_one_caster();
        let mut mapper = ShadowMapper::new(ShadowConfig::default());

        let rendered = mapper.render(
            &mut device,
            Vec3::new(0.0, 5.0, 10.0),
            Vec3::ZERO,
            &mut table,
            &store,
        );
        assert!(rendered);
        // One caster in each of the four cascades.
        assert_eq!(device.draw_calls(), 4);
        assert_eq!(mapper.region_bindings().len(), 4);
        assert!(mapper.atlas().is_some());
    }

    #[test]
    fn test_terrain_skipped_without_terrain_shadows() {
        let (mut table, store, mut device) = scene_with_one_caster();
        let handle = table.handles()[0];
        table.set_kind(handle, ObjectKind::Terrain).unwrap();

        let mut mapper = ShadowMapper::new(ShadowConfig::default());
        mapper.render(
            &mut device,
            Vec3::new(0.0, 5.0, 10.0),
            Vec3::ZERO,
            &mut table,
            &store,
        );
        assert_eq!(device.draw_calls(), 0);

        let mut mapper = ShadowMapper::new(ShadowConfig {
            terrain_shadows: true,
            ..ShadowConfig::default()
        });
        mapper.render(
            &mut device,
            Vec3::new(0.0, 5.0, 10.0),
            Vec3::ZERO,
            &mut table,
            &store,
        );
        assert_eq!(device.draw_calls(), 4);
    }

    #[test]
    fn test_unsupported_device_disables_without_error() {
        let (mut table, store, _) = scene_with_one_caster();
        let mut device = NullDevice::new(64, 64).with_caps(DeviceCaps {
            shadow_mapping: false,
            ..DeviceCaps::default()
        });

        let mut mapper = ShadowMapper::new(ShadowConfig::default());
        let rendered = mapper.render(&mut device, Vec3::ZERO, Vec3::Z, &mut table, &store);
        assert!(!rendered);
        assert!(mapper.atlas().is_none());
    }

    #[test]
    fn test_resolution_clamped_to_device_limit() {
        let (mut table, store, _) = scene_with_one_caster();
        let mut device = NullDevice::new(64, 64).with_caps(DeviceCaps {
            max_texture_size: 512,
            ..DeviceCaps::default()
        });

        let mut mapper = ShadowMapper::new(ShadowConfig {
            resolution: 2048,
            ..ShadowConfig::default()
        });
        mapper.render(&mut device, Vec3::ZERO, Vec3::Z, &mut table, &store);
        assert_eq!(mapper.atlas_resolution(), 512);
    }
}
