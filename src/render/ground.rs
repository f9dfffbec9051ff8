//! Ground decal compositor
//!
//! The world square from -1600 to +1600 is covered by a 4x4 grid of
//! 256x256 decal tiles blended over the terrain. Ground spots multiply
//! their color into the white base, either as a radial blob or as a
//! terrain-altitude band; the single animated ground mark stamps its bit
//! table on top. Tiles are CPU-composed and only re-uploaded when
//! something overlapping them changed.

use glam::{Vec2, Vec3};
use image::{Rgba, RgbaImage};

use super::texture::TextureCache;
use crate::core::Terrain;
use crate::device::Device;
use crate::scene::{Arena, Handle, RankError};

/// Half-width of the decal-covered world square.
const WORLD_EXTENT: f32 = 1600.0;
const WORLD_SPAN: f32 = 2.0 * WORLD_EXTENT;

/// Tiles per grid axis.
const GRID: u32 = 4;
const TILE_COUNT: usize = (GRID * GRID) as usize;

/// Tile texture edge in pixels.
const TILE_PIXELS: u32 = 256;

/// Decal-space units covered by one tile; the remaining 2 pixels are a
/// border shared with the neighbors so bilinear sampling never bleeds.
const TILE_SPAN: f32 = 254.0;

fn norm(v: f32) -> f32 {
    v.clamp(0.0, 1.0)
}

fn scale_channel(c: u8, factor: f32) -> u8 {
    (f32::from(c) * factor).round() as u8
}

/// Map a world x/z position to decal-space pixel coordinates: the cell
/// origin `(px, py)` and the exact center `(cx, cy)`. Point stamps
/// (`dot == 0`) are nudged half a pixel so they land on a cell center.
fn decal_cell(x: f32, z: f32, dot: i32) -> (f32, f32, f32, f32) {
    let tu = (x + WORLD_EXTENT) / WORLD_SPAN;
    let tv = (z + WORLD_EXTENT) / WORLD_SPAN;

    let mut cx = tu * TILE_SPAN * GRID as f32 - 0.5;
    let mut cy = tv * TILE_SPAN * GRID as f32 - 0.5;
    if dot == 0 {
        cx += 0.5;
        cy += 0.5;
    }

    (cx.floor(), cy.floor(), cx, cy)
}

/// Decal-space rectangle of one tile, border included.
fn tile_rect(s: usize) -> (Vec2, Vec2) {
    let min = Vec2::new(
        (s as u32 % GRID) as f32 * TILE_SPAN - 1.0,
        (s as u32 / GRID) as f32 * TILE_SPAN - 1.0,
    );
    (min, min + Vec2::splat(TILE_SPAN + 2.0))
}

/// Static circular or altitude-banded darkening of the ground.
#[derive(Debug, Clone)]
pub struct GroundSpot {
    pub color: [f32; 3],
    pub position: Vec3,
    pub radius: f32,
    /// Altitude band bounds; both zero selects the radial form.
    pub min: f32,
    pub max: f32,
    pub smooth: f32,
    draw_pos: Vec3,
    draw_radius: f32,
}

impl Default for GroundSpot {
    fn default() -> Self {
        Self {
            color: [0.0, 0.0, 0.0],
            position: Vec3::ZERO,
            radius: 0.0,
            min: 0.0,
            max: 0.0,
            smooth: 1.0,
            draw_pos: Vec3::ZERO,
            draw_radius: 0.0,
        }
    }
}

/// Life-cycle phase of the animated ground mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkPhase {
    #[default]
    Null,
    Growing,
    Holding,
    Decaying,
}

/// The single animated stamp (at most one exists at a time).
#[derive(Debug, Clone, Default)]
pub struct GroundMark {
    pub draw: bool,
    pub phase: MarkPhase,
    pub delay: [f32; 3],
    pub position: Vec3,
    pub radius: f32,
    pub intensity: f32,
    fix: f32,
    pub dx: usize,
    pub dy: usize,
    /// Stamp bitmap, `dx * dy` cells: 0 = empty, 1 = green, 2 = red.
    pub table: Vec<u8>,
    draw_pos: Vec3,
    draw_radius: f32,
    draw_intensity: f32,
}

/// Owns the ground spots, the ground mark and the 16 decal tiles.
#[derive(Default)]
pub struct GroundDecals {
    spots: Arena<GroundSpot>,
    mark: GroundMark,
    /// Regenerate every tile on the next update.
    force_full: bool,
    debug_resources: bool,
    path_preview: Option<RgbaImage>,
}

impl GroundDecals {
    #[must_use]
    pub fn new() -> Self {
        Self {
            force_full: true,
            ..Self::default()
        }
    }

    pub fn create_spot(&mut self) -> Handle<GroundSpot> {
        self.spots.insert(GroundSpot::default())
    }

    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn delete_spot(&mut self, handle: Handle<GroundSpot>) -> Result<(), RankError> {
        self.spots.remove(handle)?;
        Ok(())
    }

    /// Remove every spot and schedule a full regeneration.
    pub fn delete_all_spots(&mut self) {
        self.spots.clear();
        self.force_full = true;
    }

    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn spot_mut(&mut self, handle: Handle<GroundSpot>) -> Result<&mut GroundSpot, RankError> {
        self.spots.get_mut(handle)
    }

    #[must_use]
    pub fn spot_count(&self) -> usize {
        self.spots.len()
    }

    /// Start a new ground mark, replacing any existing one.
    pub fn create_mark(
        &mut self,
        position: Vec3,
        radius: f32,
        delay: [f32; 3],
        dx: usize,
        dy: usize,
        table: Vec<u8>,
    ) {
        self.mark = GroundMark {
            draw: true,
            phase: MarkPhase::Growing,
            delay,
            position,
            radius,
            intensity: 0.0,
            fix: 0.0,
            dx,
            dy,
            table,
            ..GroundMark::default()
        };
    }

    pub fn delete_mark(&mut self) {
        self.mark = GroundMark::default();
    }

    #[must_use]
    pub fn mark(&self) -> &GroundMark {
        &self.mark
    }

    /// Advance the mark animation: grow to full intensity, hold, then
    /// decay and stop drawing.
    pub fn frame_update(&mut self, rel_time: f32) {
        match self.mark.phase {
            MarkPhase::Null => {}
            MarkPhase::Growing => {
                self.mark.intensity += rel_time / self.mark.delay[0];
                if self.mark.intensity >= 1.0 {
                    self.mark.intensity = 1.0;
                    self.mark.fix = 0.0;
                    self.mark.phase = MarkPhase::Holding;
                }
            }
            MarkPhase::Holding => {
                self.mark.fix += rel_time / self.mark.delay[1];
                if self.mark.fix >= 1.0 {
                    self.mark.phase = MarkPhase::Decaying;
                }
            }
            MarkPhase::Decaying => {
                self.mark.intensity -= rel_time / self.mark.delay[2];
                if self.mark.intensity < 0.0 {
                    self.mark.intensity = 0.0;
                    self.mark.phase = MarkPhase::Null;
                    self.mark.draw = false;
                }
            }
        }
    }

    /// Toggle the terrain-resource debug overlay.
    pub fn set_debug_resources(&mut self, enabled: bool) {
        self.debug_resources = enabled;
        self.force_regenerate();
    }

    /// Install or clear the externally computed path-preview bitmap.
    pub fn set_path_preview(&mut self, image: Option<RgbaImage>) {
        self.path_preview = image;
        self.force_regenerate();
    }

    /// Schedule regeneration of all 16 tiles on the next update.
    pub fn force_regenerate(&mut self) {
        self.force_full = true;
    }

    /// Recompose and re-upload every tile something changed under.
    /// Returns the number of tiles regenerated.
    pub fn update_textures(
        &mut self,
        device: &mut dyn Device,
        cache: &mut TextureCache,
        terrain: &dyn Terrain,
    ) -> usize {
        let mark = &self.mark;
        if !self.force_full
            && mark.draw_pos.x == mark.position.x
            && mark.draw_pos.z == mark.position.z
            && mark.draw_radius == mark.radius
            && mark.draw_intensity == mark.intensity
        {
            return 0;
        }

        let mut regenerated = 0;
        for s in 0..TILE_COUNT {
            let (min, max) = tile_rect(s);

            // Area the previous mark occupied (to erase).
            let erase_dot = (self.mark.draw_radius / 2.0) as i32;
            let (epx, epy, _, _) =
                decal_cell(self.mark.draw_pos.x, self.mark.draw_pos.z, erase_dot);
            let erase = self.force_full
                || (self.mark.draw_radius != 0.0
                    && epx + erase_dot as f32 >= min.x
                    && epy + erase_dot as f32 >= min.y
                    && epx - erase_dot as f32 <= max.x
                    && epy - erase_dot as f32 <= max.y);

            // Area the current mark occupies (to draw).
            let draw_dot = (self.mark.radius / 2.0) as i32;
            let (dpx, dpy, _, _) = decal_cell(self.mark.position.x, self.mark.position.z, draw_dot);
            let draw = self.mark.draw
                && dpx + draw_dot as f32 >= min.x
                && dpy + draw_dot as f32 >= min.y
                && dpx - draw_dot as f32 <= max.x
                && dpy - draw_dot as f32 <= max.y;

            if !(erase || draw || self.debug_resources || self.path_preview.is_some()) {
                continue;
            }

            let tile = self.compose_tile(s, draw, terrain);
            cache.create_or_update(device, &format!("shadow{s:02}"), &tile);
            regenerated += 1;
        }

        for spot in self.spots.iter_mut() {
            if spot.radius == 0.0 {
                spot.draw_radius = 0.0;
            } else {
                spot.draw_pos = spot.position;
                spot.draw_radius = spot.radius;
            }
        }
        self.mark.draw_pos = self.mark.position;
        self.mark.draw_radius = self.mark.radius;
        self.mark.draw_intensity = self.mark.intensity;
        self.force_full = false;

        regenerated
    }

    fn compose_tile(&self, s: usize, draw_mark: bool, terrain: &dyn Terrain) -> RgbaImage {
        let (min, max) = tile_rect(s);
        let mut tile = RgbaImage::from_pixel(TILE_PIXELS, TILE_PIXELS, Rgba([255, 255, 255, 255]));

        for spot in self.spots.iter() {
            if spot.radius == 0.0 {
                continue;
            }
            if spot.min == 0.0 && spot.max == 0.0 {
                stamp_radial_spot(&mut tile, spot, min, max);
            } else {
                stamp_altitude_band(&mut tile, spot, s, terrain);
            }
        }

        if draw_mark {
            stamp_mark(&mut tile, &self.mark, min, max);
        }

        if self.debug_resources {
            overlay_resources(&mut tile, min, max, terrain);
        }

        if let Some(preview) = &self.path_preview {
            overlay_preview(&mut tile, min, max, preview);
        }

        tile
    }
}

fn stamp_radial_spot(tile: &mut RgbaImage, spot: &GroundSpot, min: Vec2, max: Vec2) {
    let dot = (spot.radius / 2.0) as i32;
    let (px, py, cx, cy) = decal_cell(spot.position.x, spot.position.z, dot);

    let reach = dot as f32;
    if px + reach < min.x || py + reach < min.y || px - reach > max.x || py - reach > max.y {
        return;
    }

    for iy in -dot..=dot {
        for ix in -dot..=dot {
            let ppx = px + ix as f32;
            let ppy = py + iy as f32;
            if ppx < min.x || ppy < min.y || ppx >= max.x || ppy >= max.y {
                continue;
            }

            let intensity = if dot == 0 {
                0.0
            } else {
                Vec2::new(ppx - cx, ppy - cy).length() / dot as f32
            };

            let pixel = tile.get_pixel_mut((ppx - min.x) as u32, (ppy - min.y) as u32);
            pixel[0] = scale_channel(pixel[0], norm(spot.color[0] + intensity));
            pixel[1] = scale_channel(pixel[1], norm(spot.color[1] + intensity));
            pixel[2] = scale_channel(pixel[2], norm(spot.color[2] + intensity));
        }
    }
}

fn stamp_altitude_band(tile: &mut RgbaImage, spot: &GroundSpot, s: usize, terrain: &dyn Terrain) {
    let tiles_px = (TILE_PIXELS * GRID) as f32;
    for iy in 0..TILE_PIXELS {
        for ix in 0..TILE_PIXELS {
            let pos = Vec3::new(
                ((TILE_PIXELS * (s as u32 % GRID) + ix) as f32) * WORLD_SPAN / tiles_px
                    - WORLD_EXTENT,
                0.0,
                ((TILE_PIXELS * (s as u32 / GRID) + iy) as f32) * WORLD_SPAN / tiles_px
                    - WORLD_EXTENT,
            );

            let level = terrain.floor_level(pos);
            if level < spot.min || level > spot.max {
                continue;
            }

            let intensity = if level > (spot.max + spot.min) / 2.0 {
                1.0 - (spot.max - level) / spot.smooth
            } else {
                1.0 - (level - spot.min) / spot.smooth
            }
            .max(0.0);

            let pixel = tile.get_pixel_mut(ix, iy);
            pixel[0] = scale_channel(pixel[0], norm(spot.color[0] + intensity));
            pixel[1] = scale_channel(pixel[1], norm(spot.color[1] + intensity));
            pixel[2] = scale_channel(pixel[2], norm(spot.color[2] + intensity));
        }
    }
}

fn stamp_mark(tile: &mut RgbaImage, mark: &GroundMark, min: Vec2, max: Vec2) {
    let dot = (mark.radius / 2.0) as i32;
    let (px, py, _, _) = decal_cell(mark.position.x, mark.position.z, dot);

    for iy in -dot..=dot {
        for ix in -dot..=dot {
            let ppx = px + ix as f32;
            let ppy = py + iy as f32;
            if ppx < min.x || ppy < min.y || ppx >= max.x || ppy >= max.y {
                continue;
            }

            let falloff = 1.0 - Vec2::new(ix as f32, iy as f32).length() / dot as f32;
            if falloff <= 0.0 {
                continue;
            }
            let intensity = falloff * mark.intensity;

            let j = (ix + dot) as usize + (iy + dot) as usize * mark.dx;
            let Some(&cell) = mark.table.get(j) else {
                continue;
            };

            let pixel = tile.get_pixel_mut((ppx - min.x) as u32, (ppy - min.y) as u32);
            match cell {
                // Green stamp: fade red and blue.
                1 => {
                    pixel[0] = scale_channel(pixel[0], norm(1.0 - intensity));
                    pixel[2] = scale_channel(pixel[2], norm(1.0 - intensity));
                }
                // Red stamp: fade green and blue.
                2 => {
                    pixel[1] = scale_channel(pixel[1], norm(1.0 - intensity));
                    pixel[2] = scale_channel(pixel[2], norm(1.0 - intensity));
                }
                _ => {}
            }
        }
    }
}

fn overlay_resources(tile: &mut RgbaImage, min: Vec2, max: Vec2, terrain: &dyn Terrain) {
    let mut x = min.x;
    while x < max.x {
        let mut y = min.y;
        while y < max.y {
            let pos = Vec3::new(
                x / GRID as f32 / TILE_SPAN * WORLD_SPAN - WORLD_EXTENT,
                0.0,
                y / GRID as f32 / TILE_SPAN * WORLD_SPAN - WORLD_EXTENT,
            );
            let pixel = tile.get_pixel_mut((x - min.x) as u32, (y - min.y) as u32);
            match terrain.resource_type(pos) {
                Some(res) => {
                    let [r, g, b] = res.overlay_color();
                    *pixel = Rgba([
                        (r * 255.0) as u8,
                        (g * 255.0) as u8,
                        (b * 255.0) as u8,
                        255,
                    ]);
                }
                None => *pixel = Rgba([128, 128, 128, 255]),
            }
            y += 1.0;
        }
        x += 1.0;
    }
}

fn overlay_preview(tile: &mut RgbaImage, min: Vec2, max: Vec2, preview: &RgbaImage) {
    let (width, height) = preview.dimensions();
    let mut x = min.x;
    while x < max.x {
        let mut y = min.y;
        while y < max.y {
            let px = (x / GRID as f32 / TILE_SPAN * width as f32) as i64;
            let py = (y / GRID as f32 / TILE_SPAN * height as f32) as i64;
            // The 1 pixel tile border maps just outside the bitmap.
            if px >= 0 && (px as u32) < width && py >= 0 && (py as u32) < height {
                let color = *preview.get_pixel(px as u32, py as u32);
                tile.put_pixel((x - min.x) as u32, (y - min.y) as u32, color);
            }
            y += 1.0;
        }
        x += 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FlatTerrain;
    use crate::device::NullDevice;
    use crate::render::texture::{TextureCache, TextureError, TextureLoader};
    use std::sync::Arc;

    struct NoLoader;

    impl TextureLoader for NoLoader {
        fn load(&self, _name: &str) -> Result<RgbaImage, TextureError> {
            Err(TextureError::IoError(std::io::Error::from(
                std::io::ErrorKind::NotFound,
            )))
        }
    }

    fn fixture() -> (GroundDecals, NullDevice, TextureCache) {
        (
            GroundDecals::new(),
            NullDevice::new(64, 64),
            TextureCache::new(Arc::new(NoLoader)),
        )
    }

    #[test]
    fn test_mark_phase_sequence() {
        let mut decals = GroundDecals::new();
        decals.create_mark(Vec3::ZERO, 8.0, [1.0, 2.0, 1.0], 2, 2, vec![1, 1, 1, 1]);
        assert_eq!(decals.mark().phase, MarkPhase::Growing);
        assert_eq!(decals.mark().intensity, 0.0);
        assert!(decals.mark().draw);

        // 0.125 steps keep the arithmetic exact in binary.
        for _ in 0..7 {
            decals.frame_update(0.125);
            assert_eq!(decals.mark().phase, MarkPhase::Growing);
        }
        decals.frame_update(0.125);
        assert_eq!(decals.mark().phase, MarkPhase::Holding);
        assert_eq!(decals.mark().intensity, 1.0);

        for _ in 0..15 {
            decals.frame_update(0.125);
            assert_eq!(decals.mark().phase, MarkPhase::Holding);
        }
        decals.frame_update(0.125);
        assert_eq!(decals.mark().phase, MarkPhase::Decaying);

        for _ in 0..8 {
            decals.frame_update(0.125);
        }
        // Intensity goes below zero on the step after reaching 0.0.
        decals.frame_update(0.125);
        assert_eq!(decals.mark().phase, MarkPhase::Null);
        assert_eq!(decals.mark().intensity, 0.0);
        assert!(!decals.mark().draw);
    }

    #[test]
    fn test_first_update_regenerates_all_tiles() {
        let (mut decals, mut device, mut cache) = fixture();
        let terrain = FlatTerrain;

        let count = decals.update_textures(&mut device, &mut cache, &terrain);
        assert_eq!(count, 16);
        assert!(cache.get("shadow00").is_some());
        assert!(cache.get("shadow15").is_some());

        // Nothing changed: the whole pass is skipped.
        let count = decals.update_textures(&mut device, &mut cache, &terrain);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_force_regenerate_touches_all_tiles() {
        let (mut decals, mut device, mut cache) = fixture();
        let terrain = FlatTerrain;

        decals.update_textures(&mut device, &mut cache, &terrain);
        decals.force_regenerate();
        let count = decals.update_textures(&mut device, &mut cache, &terrain);
        assert_eq!(count, 16);
        // Tiles were updated in place, not recreated.
        assert_eq!(device.textures_created(), 16);
    }

    #[test]
    fn test_mark_animation_dirties_overlapped_tiles_only() {
        let (mut decals, mut device, mut cache) = fixture();
        let terrain = FlatTerrain;
        decals.update_textures(&mut device, &mut cache, &terrain);

        decals.create_mark(Vec3::ZERO, 8.0, [1.0, 1.0, 1.0], 4, 4, vec![1; 16]);
        decals.frame_update(0.5);
        let count = decals.update_textures(&mut device, &mut cache, &terrain);
        assert!(count >= 1 && count < 16);
    }

    #[test]
    fn test_radial_spot_darkens_center() {
        let mut decals = GroundDecals::new();
        let spot = decals.create_spot();
        {
            let s = decals.spot_mut(spot).unwrap();
            s.position = Vec3::ZERO;
            s.radius = 8.0;
            s.color = [0.0, 0.0, 0.0];
        }

        // World origin lands in tile 5 at decal cell (507, 507).
        let tile = decals.compose_tile(5, false, &FlatTerrain);
        let (min, _) = tile_rect(5);
        // The cell center sits half a pixel off, so the nearest pixel
        // keeps a sliver of its falloff intensity.
        let center = tile.get_pixel((507.0 - min.x) as u32, (507.0 - min.y) as u32);
        assert!(center[0] < 60);
        assert_eq!(center[0], center[1]);
        assert_eq!(center[1], center[2]);

        // Away from the spot the tile stays white.
        let corner = tile.get_pixel(0, 0);
        assert_eq!(corner[0], 255);
    }

    #[test]
    fn test_radial_spot_skips_distant_tile() {
        let mut decals = GroundDecals::new();
        let spot = decals.create_spot();
        {
            let s = decals.spot_mut(spot).unwrap();
            s.position = Vec3::ZERO;
            s.radius = 8.0;
            s.color = [0.0, 0.0, 0.0];
        }

        // The spot's reach ends well inside tile 5; tile 0 stays white.
        let tile = decals.compose_tile(0, false, &FlatTerrain);
        assert!(tile.pixels().all(|p| p[0] == 255 && p[1] == 255 && p[2] == 255));
    }

    #[test]
    fn test_green_mark_keeps_green_channel() {
        let mut decals = GroundDecals::new();
        decals.create_mark(Vec3::ZERO, 8.0, [1.0, 1.0, 1.0], 9, 9, vec![1; 81]);
        decals.mark.intensity = 1.0;

        let tile = decals.compose_tile(5, true, &FlatTerrain);
        let (min, _) = tile_rect(5);
        let center = tile.get_pixel((507.0 - min.x) as u32, (507.0 - min.y) as u32);
        assert!(center[0] < 255);
        assert_eq!(center[1], 255);
        assert!(center[2] < 255);
    }

    #[test]
    fn test_debug_overlay_forces_regeneration() {
        let (mut decals, mut device, mut cache) = fixture();
        let terrain = FlatTerrain;
        decals.update_textures(&mut device, &mut cache, &terrain);

        decals.set_debug_resources(true);
        let count = decals.update_textures(&mut device, &mut cache, &terrain);
        assert_eq!(count, 16);

        // Gray overlay replaces the white base where no resource exists.
        let tile = decals.compose_tile(0, false, &terrain);
        assert_eq!(tile.get_pixel(10, 10), &Rgba([128, 128, 128, 255]));
    }
}
