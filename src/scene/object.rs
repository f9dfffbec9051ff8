//! Scene object instances and shadow spots
//!
//! A scene object is an instance of a template geometry with its own world
//! transform and render flags. Each object may own at most one shadow
//! spot, the soft blob decal drawn under it when real shadow mapping is
//! unavailable. Spots live in their own arena and are freed together with
//! their owner.

use glam::{Mat4, Vec3};

use super::arena::{Arena, Handle, RankError};
use super::geometry::BaseObject;
use crate::core::Terrain;

/// Broad category of a scene object, used for render-pass routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectKind {
    /// Static world geometry. Casts shadows only when terrain shadows
    /// are enabled.
    Terrain,
    /// Placed structure or prop.
    #[default]
    Fixed,
    /// Articulated sub-part of a larger object.
    MovingPart,
}

/// Footprint shape of a shadow spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShadowSpotKind {
    /// Round blob.
    #[default]
    Normal,
    /// Elongated quad rotated to the owner's heading.
    Flattened,
}

/// Blob shadow decal owned by exactly one scene object.
#[derive(Debug, Clone)]
pub struct ShadowSpot {
    pub owner: Handle<SceneObject>,
    pub hidden: bool,
    pub kind: ShadowSpotKind,
    pub position: Vec3,
    pub angle: f32,
    pub radius: f32,
    pub intensity: f32,
    pub height: f32,
    pub normal: Vec3,
}

impl ShadowSpot {
    fn new(owner: Handle<SceneObject>) -> Self {
        Self {
            owner,
            hidden: false,
            kind: ShadowSpotKind::Normal,
            position: Vec3::ZERO,
            angle: 0.0,
            radius: 0.0,
            intensity: 0.0,
            height: 0.0,
            normal: Vec3::Y,
        }
    }
}

/// One renderable instance.
#[derive(Debug, Clone)]
pub struct SceneObject {
    pub base: Option<Handle<BaseObject>>,
    pub transform: Mat4,
    pub kind: ObjectKind,
    pub team: i32,
    /// Part of the 3D world pass.
    pub draw_world: bool,
    /// Drawn again over the interface, undistorted by pause blur.
    pub draw_front: bool,
    /// Rendered with the translucent ghost blend in the deferred pass.
    pub ghost: bool,
    pub shadow_spot: Option<Handle<ShadowSpot>>,
    /// Eye distance cached by `compute_distances`, used for LOD and
    /// sorting by the caller.
    pub distance: f32,
    /// Result of the last visibility test.
    pub visible: bool,
}

impl Default for SceneObject {
    fn default() -> Self {
        Self {
            base: None,
            transform: Mat4::IDENTITY,
            kind: ObjectKind::Fixed,
            team: 0,
            draw_world: true,
            draw_front: false,
            ghost: false,
            shadow_spot: None,
            distance: 0.0,
            visible: false,
        }
    }
}

/// Table of scene objects plus their shadow spots.
#[derive(Default)]
pub struct ObjectTable {
    objects: Arena<SceneObject>,
    spots: Arena<ShadowSpot>,
}

impl ObjectTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an object with default flags and no template geometry.
    pub fn create(&mut self) -> Handle<SceneObject> {
        self.objects.insert(SceneObject::default())
    }

    /// Delete an object. Its shadow spot, if any, is freed in the same
    /// call so no orphan decal survives the owner.
    ///
    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn delete(&mut self, handle: Handle<SceneObject>) -> Result<(), RankError> {
        let object = self.objects.remove(handle)?;
        if let Some(spot) = object.shadow_spot {
            // The spot table cannot contain a stale link here.
            let _ = self.spots.remove(spot);
        }
        Ok(())
    }

    /// Delete every object and shadow spot.
    pub fn delete_all(&mut self) {
        self.objects.clear();
        self.spots.clear();
    }

    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn get(&self, handle: Handle<SceneObject>) -> Result<&SceneObject, RankError> {
        self.objects.get(handle)
    }

    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn get_mut(&mut self, handle: Handle<SceneObject>) -> Result<&mut SceneObject, RankError> {
        self.objects.get_mut(handle)
    }

    #[must_use]
    pub fn contains(&self, handle: Handle<SceneObject>) -> bool {
        self.objects.contains(handle)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SceneObject> {
        self.objects.iter()
    }

    pub fn iter_with_handles(&self) -> impl Iterator<Item = (Handle<SceneObject>, &SceneObject)> {
        self.objects.iter_with_handles()
    }

    /// Collect the handles of all live objects.
    #[must_use]
    pub fn handles(&self) -> Vec<Handle<SceneObject>> {
        self.objects.handles()
    }

    /// Link an object to a template geometry (or unlink with `None`).
    ///
    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn set_base(
        &mut self,
        handle: Handle<SceneObject>,
        base: Option<Handle<BaseObject>>,
    ) -> Result<(), RankError> {
        self.objects.get_mut(handle)?.base = base;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn set_transform(
        &mut self,
        handle: Handle<SceneObject>,
        transform: Mat4,
    ) -> Result<(), RankError> {
        self.objects.get_mut(handle)?.transform = transform;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn set_kind(
        &mut self,
        handle: Handle<SceneObject>,
        kind: ObjectKind,
    ) -> Result<(), RankError> {
        self.objects.get_mut(handle)?.kind = kind;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn set_team(&mut self, handle: Handle<SceneObject>, team: i32) -> Result<(), RankError> {
        self.objects.get_mut(handle)?.team = team;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn set_draw_world(
        &mut self,
        handle: Handle<SceneObject>,
        draw: bool,
    ) -> Result<(), RankError> {
        self.objects.get_mut(handle)?.draw_world = draw;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn set_draw_front(
        &mut self,
        handle: Handle<SceneObject>,
        draw: bool,
    ) -> Result<(), RankError> {
        self.objects.get_mut(handle)?.draw_front = draw;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn set_ghost(&mut self, handle: Handle<SceneObject>, ghost: bool) -> Result<(), RankError> {
        self.objects.get_mut(handle)?.ghost = ghost;
        Ok(())
    }

    /// Refresh the cached eye distance of every object.
    pub fn compute_distances(&mut self, eye: Vec3) {
        for object in self.objects.iter_mut() {
            let translation = object.transform.w_axis.truncate();
            object.distance = eye.distance(translation);
        }
    }

    // Shadow spots.

    /// Create a shadow spot for an object. Idempotent: an existing spot
    /// is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn create_shadow_spot(
        &mut self,
        owner: Handle<SceneObject>,
    ) -> Result<Handle<ShadowSpot>, RankError> {
        if let Some(existing) = self.objects.get(owner)?.shadow_spot {
            return Ok(existing);
        }
        let spot = self.spots.insert(ShadowSpot::new(owner));
        self.objects.get_mut(owner)?.shadow_spot = Some(spot);
        Ok(spot)
    }

    /// Remove an object's shadow spot, if it has one.
    ///
    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is stale or out of bounds.
    pub fn delete_shadow_spot(&mut self, owner: Handle<SceneObject>) -> Result<(), RankError> {
        let object = self.objects.get_mut(owner)?;
        if let Some(spot) = object.shadow_spot.take() {
            let _ = self.spots.remove(spot);
        }
        Ok(())
    }

    /// Borrow an object's shadow spot, if it has one.
    #[must_use]
    pub fn shadow_spot(&self, owner: Handle<SceneObject>) -> Option<&ShadowSpot> {
        let spot = self.objects.get(owner).ok()?.shadow_spot?;
        self.spots.get(spot).ok()
    }

    /// Mutably borrow an object's shadow spot, if it has one.
    pub fn shadow_spot_mut(&mut self, owner: Handle<SceneObject>) -> Option<&mut ShadowSpot> {
        let spot = self.objects.get(owner).ok()?.shadow_spot?;
        self.spots.get_mut(spot).ok()
    }

    /// Iterate over all live shadow spots.
    pub fn shadow_spots(&self) -> impl Iterator<Item = &ShadowSpot> {
        self.spots.iter()
    }

    #[must_use]
    pub fn shadow_spot_count(&self) -> usize {
        self.spots.len()
    }

    /// Re-derive a spot's ground normal from the terrain under it.
    ///
    /// Samples nine points, weighting the center triple and the inner
    /// ring double, then averages.
    ///
    /// # Errors
    ///
    /// Returns [`RankError`] if the object handle is stale or out of
    /// bounds. An object without a spot is not an error.
    pub fn update_spot_normal(
        &mut self,
        owner: Handle<SceneObject>,
        terrain: &dyn Terrain,
    ) -> Result<(), RankError> {
        let object = self.objects.get(owner)?;
        let Some(spot_handle) = object.shadow_spot else {
            return Ok(());
        };
        let spot = self.spots.get_mut(spot_handle)?;

        let pos = spot.position;
        let radius = spot.radius;

        let mut sum = Vec3::ZERO;
        let mut count = 0.0;
        let mut sample = |offset: Vec3, weight: f32| {
            sum += terrain.normal(pos + offset) * weight;
            count += weight;
        };

        sample(Vec3::ZERO, 3.0);
        for (sx, sz) in [(1.0, 1.0), (-1.0, 1.0), (1.0, -1.0), (-1.0, -1.0)] {
            sample(Vec3::new(sx * radius * 0.6, 0.0, sz * radius * 0.6), 2.0);
            sample(Vec3::new(sx * radius, 0.0, sz * radius), 1.0);
        }

        spot.normal = sum / count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FlatTerrain;

    #[test]
    fn test_defaults() {
        let mut table = ObjectTable::new();
        let object = table.create();

        let o = table.get(object).unwrap();
        assert!(o.draw_world);
        assert!(!o.draw_front);
        assert!(!o.ghost);
        assert!(o.base.is_none());
        assert!(o.shadow_spot.is_none());
        assert_eq!(o.transform, Mat4::IDENTITY);
    }

    #[test]
    fn test_delete_frees_shadow_spot() {
        let mut table = ObjectTable::new();
        let object = table.create();
        table.create_shadow_spot(object).unwrap();
        assert_eq!(table.shadow_spot_count(), 1);

        table.delete(object).unwrap();
        assert_eq!(table.shadow_spot_count(), 0);
        assert!(table.get(object).is_err());
    }

    #[test]
    fn test_shadow_spot_idempotent() {
        let mut table = ObjectTable::new();
        let object = table.create();

        let a = table.create_shadow_spot(object).unwrap();
        let b = table.create_shadow_spot(object).unwrap();
        assert_eq!(a, b);
        assert_eq!(table.shadow_spot_count(), 1);
    }

    #[test]
    fn test_delete_all_invalidates_held_handles() {
        let mut table = ObjectTable::new();
        let old = table.create();
        table.delete_all();

        let new = table.create();
        table.set_team(new, 7).unwrap();
        assert!(table.get(old).is_err());
        assert_eq!(table.get(new).unwrap().team, 7);
    }

    #[test]
    fn test_compute_distances() {
        let mut table = ObjectTable::new();
        let object = table.create();
        table
            .set_transform(object, Mat4::from_translation(Vec3::new(3.0, 0.0, 4.0)))
            .unwrap();

        table.compute_distances(Vec3::ZERO);
        assert!((table.get(object).unwrap().distance - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_spot_normal_flat_terrain() {
        let mut table = ObjectTable::new();
        let object = table.create();
        table.create_shadow_spot(object).unwrap();
        {
            let spot = table.shadow_spot_mut(object).unwrap();
            spot.radius = 2.0;
            spot.normal = Vec3::ZERO;
        }

        table.update_spot_normal(object, &FlatTerrain).unwrap();
        let normal = table.shadow_spot(object).unwrap().normal;
        assert!((normal - Vec3::Y).length() < 1e-5);
    }

    #[test]
    fn test_spot_normal_without_spot_is_ok() {
        let mut table = ObjectTable::new();
        let object = table.create();
        assert!(table.update_spot_normal(object, &FlatTerrain).is_ok());
    }
}
