use cv_core::{
    nalgebra::{Matrix3x4, Matrix4, Point2, Point3, RowVector4, Vector4},
    Pose, WorldToCamera,
};
use float_ord::FloatOrd;

/// Triangulates one world point seen by two cameras.
///
/// `a` and `b` are normalized image coordinates in the cameras with poses `pose_a` and `pose_b`.
/// Each observation contributes two rows of the linear system `A X = 0`, where
/// `x P₃ - P₁` and `y P₃ - P₂` are built from the rows of the `3x4` projection `P`.
/// The solution is the right singular vector of `A` with the smallest singular value.
///
/// The homogeneous point is returned as-is. Use [`dehomogenize`] to get the point in world space,
/// which fails when the scale component is zero (a point at infinity).
///
/// ```
/// use cv_core::nalgebra::{Point2, Point3, Rotation3, Vector3};
/// use cv_core::{Pose, WorldToCamera};
/// use mono_geom::{dehomogenize, triangulate};
///
/// let point = Point3::new(0.3, 0.1, 2.0);
/// let pose_a = WorldToCamera::identity();
/// let pose_b = WorldToCamera::from_parts(Vector3::new(-0.2, 0.0, 0.0), Rotation3::identity());
/// let project = |pose: WorldToCamera| {
///     let camera = pose.0 * point;
///     Point2::new(camera.x / camera.z, camera.y / camera.z)
/// };
/// let homogeneous = triangulate(pose_a, pose_b, project(pose_a), project(pose_b)).unwrap();
/// let triangulated = dehomogenize(homogeneous).unwrap();
/// assert!((triangulated - point).norm() < 1e-9);
/// ```
pub fn triangulate(
    pose_a: WorldToCamera,
    pose_b: WorldToCamera,
    a: Point2<f64>,
    b: Point2<f64>,
) -> Option<Vector4<f64>> {
    let projection_a = projection(pose_a);
    let projection_b = projection(pose_b);
    let design = Matrix4::from_rows(&[
        row(&projection_a, 2) * a.x - row(&projection_a, 0),
        row(&projection_a, 2) * a.y - row(&projection_a, 1),
        row(&projection_b, 2) * b.x - row(&projection_b, 0),
        row(&projection_b, 2) * b.y - row(&projection_b, 1),
    ]);
    let svd = design.try_svd(false, true, f64::EPSILON, 1000)?;
    let v_t = svd.v_t?;
    let (ix, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by_key(|&(_, &s)| FloatOrd(s))?;
    Some(v_t.row(ix).transpose())
}

/// Triangulates every correspondence between two cameras.
///
/// The output has one entry per input pair, `None` where the linear solve failed.
pub fn triangulate_many(
    pose_a: WorldToCamera,
    pose_b: WorldToCamera,
    pairs: impl IntoIterator<Item = (Point2<f64>, Point2<f64>)>,
) -> Vec<Option<Vector4<f64>>> {
    pairs
        .into_iter()
        .map(|(a, b)| triangulate(pose_a, pose_b, a, b))
        .collect()
}

/// Divides through by the scale component.
///
/// Returns `None` if the scale is zero relative to the rest of the vector.
pub fn dehomogenize(homogeneous: Vector4<f64>) -> Option<Point3<f64>> {
    if homogeneous.w.abs() > f64::EPSILON * homogeneous.norm() {
        Some(Point3::from(homogeneous.xyz() / homogeneous.w))
    } else {
        None
    }
}

fn projection(pose: WorldToCamera) -> Matrix3x4<f64> {
    pose.homogeneous().fixed_rows::<3>(0).into_owned()
}

fn row(projection: &Matrix3x4<f64>, ix: usize) -> RowVector4<f64> {
    projection.row(ix).into_owned()
}
