//! Frustum visibility culling
//!
//! The six view-frustum planes are extracted algebraically from the
//! combined projection*view matrix, so culling works for any projection
//! without knowing fov or clip distances. Objects are tested by template
//! bounding sphere transformed to world space.

use glam::{Mat4, Vec3};

use super::arena::Handle;
use super::geometry::BaseObjectStore;
use super::object::{ObjectTable, SceneObject};

/// One frustum plane in `dot(normal, p) + origin >= 0` half-space form.
#[derive(Debug, Clone, Copy)]
struct Plane {
    normal: Vec3,
    origin: f32,
}

impl Plane {
    /// Build from raw row-combination coefficients, normalizing so the
    /// distance test is in world units.
    fn from_coefficients(a: f32, b: f32, c: f32, d: f32) -> Self {
        let normal = Vec3::new(a, b, c);
        let length = normal.length();
        if length > f32::EPSILON {
            Self {
                normal: normal / length,
                origin: d / length,
            }
        } else {
            // Degenerate matrix row: never culls.
            Self {
                normal: Vec3::ZERO,
                origin: f32::MAX,
            }
        }
    }

    /// A sphere is outside only when fully beyond the plane.
    fn sphere_inside(&self, center: Vec3, radius: f32) -> bool {
        self.origin + self.normal.dot(center) >= -radius
    }
}

/// View frustum for sphere visibility tests.
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    planes: [Plane; 6],
}

impl Frustum {
    /// Extract the six planes from a combined projection*view matrix.
    #[must_use]
    pub fn from_matrix(combined: Mat4) -> Self {
        let row = |i: usize| {
            [
                combined.x_axis[i],
                combined.y_axis[i],
                combined.z_axis[i],
                combined.w_axis[i],
            ]
        };
        let r0 = row(0);
        let r1 = row(1);
        let r2 = row(2);
        let r3 = row(3);

        let combine = |r: [f32; 4], sign: f32| {
            Plane::from_coefficients(
                r3[0] + sign * r[0],
                r3[1] + sign * r[1],
                r3[2] + sign * r[2],
                r3[3] + sign * r[3],
            )
        };

        Self {
            planes: [
                combine(r0, 1.0),  // left
                combine(r0, -1.0), // right
                combine(r1, 1.0),  // bottom
                combine(r1, -1.0), // top
                combine(r2, 1.0),  // near
                combine(r2, -1.0), // far
            ],
        }
    }

    /// Conservative sphere test: true unless the sphere lies entirely
    /// beyond at least one plane.
    #[must_use]
    pub fn contains_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.sphere_inside(center, radius))
    }
}

/// Test one object against the frustum and cache the result on it.
///
/// Objects without template geometry (or with a stale link) are never
/// visible. A false result here may only be a false positive at the
/// caller's level, never a false negative.
pub fn is_visible(
    table: &mut ObjectTable,
    store: &BaseObjectStore,
    frustum: &Frustum,
    handle: Handle<SceneObject>,
) -> bool {
    let Ok(object) = table.get(handle) else {
        return false;
    };

    let visible = match object.base.and_then(|base| store.get(base).ok()) {
        Some(base) => {
            let sphere = base.bounding_sphere;
            let center = object.transform.transform_point3(sphere.center);
            frustum.contains_sphere(center, sphere.radius)
        }
        None => false,
    };

    if let Ok(object) = table.get_mut(handle) {
        object.visible = visible;
    }
    visible
}

/// Refresh the cached visible flag of every object.
pub fn update_visibility(table: &mut ObjectTable, store: &BaseObjectStore, combined: Mat4) {
    let frustum = Frustum::from_matrix(combined);
    for handle in table.handles() {
        is_visible(table, store, &frustum, handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PrimitiveKind;
    use crate::scene::geometry::{MaterialDef, Vertex};

    // With the identity matrix the frustum is the unit cube in clip
    // space: |x| <= w, |y| <= w, |z| <= w with w = 1.

    #[test]
    fn test_identity_frustum_sphere_at_origin() {
        let frustum = Frustum::from_matrix(Mat4::IDENTITY);
        assert!(frustum.contains_sphere(Vec3::ZERO, 0.5));
    }

    #[test]
    fn test_identity_frustum_sphere_outside_right() {
        let frustum = Frustum::from_matrix(Mat4::IDENTITY);
        assert!(!frustum.contains_sphere(Vec3::new(5.0, 0.0, 0.0), 0.5));
        assert!(!frustum.contains_sphere(Vec3::new(-5.0, 0.0, 0.0), 0.5));
        assert!(!frustum.contains_sphere(Vec3::new(0.0, 5.0, 0.0), 0.5));
        assert!(!frustum.contains_sphere(Vec3::new(0.0, 0.0, -5.0), 0.5));
    }

    #[test]
    fn test_straddling_sphere_kept() {
        let frustum = Frustum::from_matrix(Mat4::IDENTITY);
        // Center outside, surface crossing the x = 1 plane.
        assert!(frustum.contains_sphere(Vec3::new(1.4, 0.0, 0.0), 0.5));
    }

    #[test]
    fn test_perspective_frustum() {
        let proj = Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0);
        let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        let frustum = Frustum::from_matrix(proj * view);

        assert!(frustum.contains_sphere(Vec3::new(0.0, 0.0, -10.0), 1.0));
        // Behind the camera.
        assert!(!frustum.contains_sphere(Vec3::new(0.0, 0.0, 10.0), 1.0));
        // Beyond the far plane.
        assert!(!frustum.contains_sphere(Vec3::new(0.0, 0.0, -500.0), 1.0));
    }

    #[test]
    fn test_object_without_base_invisible() {
        let mut table = ObjectTable::new();
        let store = BaseObjectStore::new();
        let object = table.create();

        let frustum = Frustum::from_matrix(Mat4::IDENTITY);
        assert!(!is_visible(&mut table, &store, &frustum, object));
        assert!(!table.get(object).unwrap().visible);
    }

    #[test]
    fn test_object_visibility_cached() {
        let mut table = ObjectTable::new();
        let mut store = BaseObjectStore::new();

        let base = store.create();
        let n = [0.0, 1.0, 0.0];
        store
            .add_triangles(
                base,
                &[
                    Vertex::new([-0.1, 0.0, 0.0], n, [0.0, 0.0]),
                    Vertex::new([0.1, 0.0, 0.0], n, [1.0, 0.0]),
                    Vertex::new([0.0, 0.1, 0.0], n, [0.0, 1.0]),
                ],
                &MaterialDef::default(),
                PrimitiveKind::TriangleList,
            )
            .unwrap();

        let object = table.create();
        table.set_base(object, Some(base)).unwrap();

        let frustum = Frustum::from_matrix(Mat4::IDENTITY);
        assert!(is_visible(&mut table, &store, &frustum, object));
        assert!(table.get(object).unwrap().visible);

        table
            .set_transform(object, Mat4::from_translation(Vec3::new(50.0, 0.0, 0.0)))
            .unwrap();
        assert!(!is_visible(&mut table, &store, &frustum, object));
        assert!(!table.get(object).unwrap().visible);
    }
}
