//! Template geometry store
//!
//! A `BaseObject` is a reusable template mesh shared by any number of
//! scene instances. Its triangles are grouped into tiers keyed by
//! (primitive kind, material) so each tier maps to exactly one draw call.
//! CPU-side mutation is free; GPU buffers are built in a single
//! `flush_dirty` pass at the end of the frame.

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use smallvec::SmallVec;

use super::arena::{Arena, Handle, RankError};
use crate::device::{BufferHandle, Device, PrimitiveKind, TextureHandle};

/// Vertex with position, normal, UV and color.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    pub color: [f32; 4],
}

impl Vertex {
    /// Create a new vertex with white color.
    pub const fn new(position: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            uv,
            color: [1.0, 1.0, 1.0, 1.0],
        }
    }
}

impl Default for Vertex {
    fn default() -> Self {
        Self::new([0.0; 3], [0.0, 1.0, 0.0], [0.0; 2])
    }
}

/// Material definition for a geometry tier.
///
/// Textures are referred to by name; the cache resolves them to device
/// handles lazily. Two tiers merge only when their definitions compare
/// equal.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialDef {
    pub albedo_texture: String,
    pub detail_texture: String,
    pub emissive_texture: String,
    pub material_texture: String,
    pub normal_texture: String,
    pub albedo_color: [f32; 4],
    pub emissive_color: [f32; 4],
    pub roughness: f32,
    pub metalness: f32,
    pub ao_strength: f32,
}

impl MaterialDef {
    /// Material with a single albedo texture and default parameters.
    #[must_use]
    pub fn with_albedo(name: impl Into<String>) -> Self {
        Self {
            albedo_texture: name.into(),
            ..Self::default()
        }
    }
}

impl Default for MaterialDef {
    fn default() -> Self {
        Self {
            albedo_texture: String::new(),
            detail_texture: String::new(),
            emissive_texture: String::new(),
            material_texture: String::new(),
            normal_texture: String::new(),
            albedo_color: [1.0, 1.0, 1.0, 1.0],
            emissive_color: [0.0, 0.0, 0.0, 1.0],
            roughness: 1.0,
            metalness: 0.0,
            ao_strength: 1.0,
        }
    }
}

/// Resolved device textures for a tier, filled in by the engine from the
/// texture cache. Invalid handles mean "not resolved yet".
#[derive(Debug, Clone, Copy, Default)]
pub struct TierTextures {
    pub albedo: TextureHandle,
    pub detail: TextureHandle,
    pub emissive: TextureHandle,
    pub material: TextureHandle,
}

/// One (primitive kind, material) vertex batch within a base object.
#[derive(Debug)]
pub struct DataTier {
    pub kind: PrimitiveKind,
    pub material: MaterialDef,
    pub vertices: Vec<Vertex>,
    /// GPU buffer, if one has been built for the current vertex data.
    pub buffer: Option<BufferHandle>,
    /// True when `vertices` has changed since the buffer was last built.
    pub dirty: bool,
    pub uv_offset: Vec2,
    pub uv_scale: Vec2,
    pub textures: TierTextures,
}

impl DataTier {
    fn new(kind: PrimitiveKind, material: MaterialDef) -> Self {
        Self {
            kind,
            material,
            vertices: Vec::new(),
            buffer: None,
            dirty: false,
            uv_offset: Vec2::ZERO,
            uv_scale: Vec2::ONE,
            textures: TierTextures::default(),
        }
    }
}

/// Bounding sphere derived from an axis-aligned box.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingSphere {
    pub center: Vec3,
    pub radius: f32,
}

impl BoundingSphere {
    /// Smallest sphere around an axis-aligned box.
    #[must_use]
    pub fn for_box(min: Vec3, max: Vec3) -> Self {
        let center = (min + max) * 0.5;
        Self {
            center,
            radius: max.distance(center),
        }
    }
}

/// Reusable template geometry.
#[derive(Debug, Default)]
pub struct BaseObject {
    /// Bounding box of all vertices added so far. Always contains the
    /// origin, so an instance pivot is never culled away from its mesh.
    pub bbox_min: Vec3,
    pub bbox_max: Vec3,
    pub bounding_sphere: BoundingSphere,
    pub tiers: SmallVec<[DataTier; 2]>,
    pub total_triangles: usize,
}

impl BaseObject {
    fn extend_bounds(&mut self, vertices: &[Vertex]) {
        for vertex in vertices {
            let p = Vec3::from(vertex.position);
            self.bbox_min = self.bbox_min.min(p);
            self.bbox_max = self.bbox_max.max(p);
        }
        self.bounding_sphere = BoundingSphere::for_box(self.bbox_min, self.bbox_max);
    }
}

/// Arena of base objects plus the deferred GPU upload pass.
#[derive(Default)]
pub struct BaseObjectStore {
    arena: Arena<BaseObject>,
    /// Set when any tier went dirty; lets `flush_dirty` skip the scan.
    needs_flush: bool,
}

impl BaseObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new, empty base object.
    pub fn create(&mut self) -> Handle<BaseObject> {
        self.arena.insert(BaseObject::default())
    }

    /// Delete a base object, freeing its GPU buffers.
    ///
    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn delete(
        &mut self,
        device: &mut dyn Device,
        handle: Handle<BaseObject>,
    ) -> Result<(), RankError> {
        let object = self.arena.remove(handle)?;
        for tier in &object.tiers {
            if let Some(buffer) = tier.buffer {
                device.destroy_vertex_buffer(buffer);
            }
        }
        Ok(())
    }

    /// Delete every base object and free all GPU buffers.
    pub fn delete_all(&mut self, device: &mut dyn Device) {
        for object in self.arena.iter() {
            for tier in &object.tiers {
                if let Some(buffer) = tier.buffer {
                    device.destroy_vertex_buffer(buffer);
                }
            }
        }
        self.arena.clear();
        self.needs_flush = false;
    }

    /// Append triangles to the tier matching `(kind, material)`, creating
    /// the tier if absent, and extend the bounding volume.
    ///
    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn add_triangles(
        &mut self,
        handle: Handle<BaseObject>,
        vertices: &[Vertex],
        material: &MaterialDef,
        kind: PrimitiveKind,
    ) -> Result<(), RankError> {
        let object = self.arena.get_mut(handle)?;

        let tier = match object
            .tiers
            .iter_mut()
            .position(|t| t.kind == kind && t.material == *material)
        {
            Some(index) => &mut object.tiers[index],
            None => {
                object.tiers.push(DataTier::new(kind, material.clone()));
                object.tiers.last_mut().expect("just pushed")
            }
        };

        tier.vertices.extend_from_slice(vertices);
        tier.dirty = true;

        object.extend_bounds(vertices);
        object.total_triangles += match kind {
            PrimitiveKind::TriangleList => vertices.len() / 3,
            PrimitiveKind::TriangleStrip => vertices.len().saturating_sub(2),
        };

        self.needs_flush = true;
        Ok(())
    }

    /// Duplicate tier structure and CPU vertex data from `src` into `dst`.
    ///
    /// GPU buffer handles are never shared: the copied tiers are marked
    /// dirty so they build their own buffers on the next flush.
    ///
    /// # Errors
    ///
    /// Returns [`RankError`] if either handle is stale or out of bounds.
    pub fn copy(
        &mut self,
        device: &mut dyn Device,
        src: Handle<BaseObject>,
        dst: Handle<BaseObject>,
    ) -> Result<(), RankError> {
        let source = self.arena.get(src)?;

        let mut tiers: SmallVec<[DataTier; 2]> = SmallVec::new();
        for tier in &source.tiers {
            let mut copy = DataTier::new(tier.kind, tier.material.clone());
            copy.vertices = tier.vertices.clone();
            copy.uv_offset = tier.uv_offset;
            copy.uv_scale = tier.uv_scale;
            copy.dirty = true;
            tiers.push(copy);
        }
        let bbox_min = source.bbox_min;
        let bbox_max = source.bbox_max;
        let bounding_sphere = source.bounding_sphere;
        let total_triangles = source.total_triangles;

        let target = self.arena.get_mut(dst)?;
        for tier in &target.tiers {
            if let Some(buffer) = tier.buffer {
                device.destroy_vertex_buffer(buffer);
            }
        }
        target.tiers = tiers;
        target.bbox_min = bbox_min;
        target.bbox_max = bbox_max;
        target.bounding_sphere = bounding_sphere;
        target.total_triangles = total_triangles;

        self.needs_flush = true;
        Ok(())
    }

    /// Set a per-tier UV transform override.
    ///
    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn set_uv_transform(
        &mut self,
        handle: Handle<BaseObject>,
        tier_index: usize,
        offset: Vec2,
        scale: Vec2,
    ) -> Result<(), RankError> {
        let object = self.arena.get_mut(handle)?;
        if let Some(tier) = object.tiers.get_mut(tier_index) {
            tier.uv_offset = offset;
            tier.uv_scale = scale;
        }
        Ok(())
    }

    /// Recompute bounds of every base object from scratch.
    ///
    /// Used after bulk vertex mutation where incremental extension would
    /// overestimate. The box is reset to the origin first, preserving the
    /// origin-inclusion invariant.
    pub fn recompute_bounds(&mut self) {
        for object in self.arena.iter_mut() {
            object.bbox_min = Vec3::ZERO;
            object.bbox_max = Vec3::ZERO;
            for tier in 0..object.tiers.len() {
                let vertices = std::mem::take(&mut object.tiers[tier].vertices);
                object.extend_bounds(&vertices);
                object.tiers[tier].vertices = vertices;
            }
        }
    }

    /// Upload every dirty tier to the GPU in one batch.
    ///
    /// This is the second half of the two-phase commit: all CPU-side
    /// mutation since the last flush becomes visible to the device here.
    pub fn flush_dirty(&mut self, device: &mut dyn Device) {
        if !self.needs_flush {
            return;
        }

        for object in self.arena.iter_mut() {
            for tier in object.tiers.iter_mut() {
                if !tier.dirty {
                    continue;
                }
                match tier.buffer {
                    Some(buffer) => {
                        device.update_vertex_buffer(buffer, tier.kind, &tier.vertices);
                    }
                    None => {
                        tier.buffer = Some(device.create_vertex_buffer(tier.kind, &tier.vertices));
                    }
                }
                tier.dirty = false;
            }
        }

        self.needs_flush = false;
    }

    /// Drop all resolved texture handles, forcing re-resolution from the
    /// cache. Called after a cache flush.
    pub fn invalidate_textures(&mut self) {
        for object in self.arena.iter_mut() {
            for tier in object.tiers.iter_mut() {
                tier.textures = TierTextures::default();
            }
        }
    }

    /// Borrow a base object.
    ///
    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn get(&self, handle: Handle<BaseObject>) -> Result<&BaseObject, RankError> {
        self.arena.get(handle)
    }

    /// Mutably borrow a base object.
    ///
    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn get_mut(&mut self, handle: Handle<BaseObject>) -> Result<&mut BaseObject, RankError> {
        self.arena.get_mut(handle)
    }

    /// Iterate over live base objects.
    pub fn objects(&self) -> impl Iterator<Item = &BaseObject> {
        self.arena.iter()
    }

    /// Iterate mutably over live base objects.
    pub fn objects_mut(&mut self) -> impl Iterator<Item = &mut BaseObject> {
        self.arena.iter_mut()
    }

    /// Number of live base objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    /// True if no base objects are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::NullDevice;

    fn tri(a: [f32; 3], b: [f32; 3], c: [f32; 3]) -> Vec<Vertex> {
        let n = [0.0, 1.0, 0.0];
        vec![
            Vertex::new(a, n, [0.0, 0.0]),
            Vertex::new(b, n, [1.0, 0.0]),
            Vertex::new(c, n, [0.0, 1.0]),
        ]
    }

    #[test]
    fn test_bbox_contains_vertices_and_origin() {
        let mut store = BaseObjectStore::new();
        let base = store.create();

        let vertices = tri([2.0, 1.0, 2.0], [3.0, 1.0, 2.0], [2.0, 4.0, 5.0]);
        store
            .add_triangles(base, &vertices, &MaterialDef::default(), PrimitiveKind::TriangleList)
            .unwrap();

        let object = store.get(base).unwrap();
        for v in &vertices {
            let p = Vec3::from(v.position);
            assert!(p.cmpge(object.bbox_min).all());
            assert!(p.cmple(object.bbox_max).all());
        }
        // The origin stays inside even though every vertex is offset.
        assert!(object.bbox_min.cmple(Vec3::ZERO).all());
        assert!(object.bbox_max.cmpge(Vec3::ZERO).all());
    }

    #[test]
    fn test_sphere_encloses_vertices() {
        let mut store = BaseObjectStore::new();
        let base = store.create();

        store
            .add_triangles(
                base,
                &tri([-4.0, 0.0, 0.0], [4.0, 0.0, 0.0], [0.0, 6.0, 0.0]),
                &MaterialDef::default(),
                PrimitiveKind::TriangleList,
            )
            .unwrap();

        let object = store.get(base).unwrap();
        let sphere = object.bounding_sphere;
        for v in &object.tiers[0].vertices {
            let d = Vec3::from(v.position).distance(sphere.center);
            assert!(d <= sphere.radius + 1e-4);
        }
    }

    #[test]
    fn test_tier_merge_and_split() {
        let mut store = BaseObjectStore::new();
        let base = store.create();
        let mat_a = MaterialDef::with_albedo("rock.png");
        let mat_b = MaterialDef::with_albedo("sand.png");

        let v = tri([0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]);
        store
            .add_triangles(base, &v, &mat_a, PrimitiveKind::TriangleList)
            .unwrap();
        store
            .add_triangles(base, &v, &mat_a, PrimitiveKind::TriangleList)
            .unwrap();
        assert_eq!(store.get(base).unwrap().tiers.len(), 1);
        assert_eq!(store.get(base).unwrap().tiers[0].vertices.len(), 6);

        store
            .add_triangles(base, &v, &mat_b, PrimitiveKind::TriangleList)
            .unwrap();
        assert_eq!(store.get(base).unwrap().tiers.len(), 2);

        // Same material, different primitive kind is a separate tier too.
        store
            .add_triangles(base, &v, &mat_a, PrimitiveKind::TriangleStrip)
            .unwrap();
        assert_eq!(store.get(base).unwrap().tiers.len(), 3);
    }

    #[test]
    fn test_flush_builds_buffers_once() {
        let mut device = NullDevice::new(64, 64);
        let mut store = BaseObjectStore::new();
        let base = store.create();

        let v = tri([0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]);
        store
            .add_triangles(base, &v, &MaterialDef::default(), PrimitiveKind::TriangleList)
            .unwrap();
        store
            .add_triangles(base, &v, &MaterialDef::default(), PrimitiveKind::TriangleList)
            .unwrap();

        store.flush_dirty(&mut device);
        assert_eq!(device.buffers_created(), 1);
        assert!(store.get(base).unwrap().tiers[0].buffer.is_some());

        // Nothing dirty: flush is a no-op.
        store.flush_dirty(&mut device);
        assert_eq!(device.buffer_uploads(), 1);

        // Another append reuses the existing buffer.
        store
            .add_triangles(base, &v, &MaterialDef::default(), PrimitiveKind::TriangleList)
            .unwrap();
        store.flush_dirty(&mut device);
        assert_eq!(device.buffers_created(), 1);
        assert_eq!(device.buffer_uploads(), 2);
    }

    #[test]
    fn test_copy_never_shares_buffers() {
        let mut device = NullDevice::new(64, 64);
        let mut store = BaseObjectStore::new();
        let src = store.create();
        let dst = store.create();

        let v = tri([0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]);
        store
            .add_triangles(src, &v, &MaterialDef::default(), PrimitiveKind::TriangleList)
            .unwrap();
        store.flush_dirty(&mut device);
        let src_buffer = store.get(src).unwrap().tiers[0].buffer;

        store.copy(&mut device, src, dst).unwrap();
        assert!(store.get(dst).unwrap().tiers[0].buffer.is_none());
        assert!(store.get(dst).unwrap().tiers[0].dirty);

        store.flush_dirty(&mut device);
        let dst_buffer = store.get(dst).unwrap().tiers[0].buffer;
        assert_ne!(src_buffer, dst_buffer);
        assert_eq!(
            store.get(src).unwrap().tiers[0].vertices,
            store.get(dst).unwrap().tiers[0].vertices
        );
    }

    #[test]
    fn test_rank_reuse_round_trip() {
        let mut device = NullDevice::new(64, 64);
        let mut store = BaseObjectStore::new();

        let a = store.create();
        store.delete(&mut device, a).unwrap();
        let b = store.create();

        assert_eq!(b.index(), a.index());
        assert!(store.get(a).is_err());
        assert!(store.get(b).is_ok());
    }

    #[test]
    fn test_delete_frees_buffers() {
        let mut device = NullDevice::new(64, 64);
        let mut store = BaseObjectStore::new();
        let base = store.create();

        let v = tri([0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]);
        store
            .add_triangles(base, &v, &MaterialDef::default(), PrimitiveKind::TriangleList)
            .unwrap();
        store.flush_dirty(&mut device);
        assert_eq!(device.live_buffers(), 1);

        store.delete(&mut device, base).unwrap();
        assert_eq!(device.live_buffers(), 0);
    }
}
