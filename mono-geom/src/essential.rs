use crate::{dehomogenize, renormalize, triangulate, NormalizedMatch};
use cv_core::{
    nalgebra::{DMatrix, IsometryMatrix3, Matrix3, Rotation3, Translation3, Vector3},
    sample_consensus::{Estimator, Model},
    CameraToCamera, Pose, WorldToCamera,
};
use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};
use float_ord::FloatOrd;

/// This stores an essential matrix, which satisfies the epipolar constraint `bᵀ E a = 0`
/// for every [`NormalizedMatch`] `(a, b)` between the two views.
///
/// It encodes the rotation and the direction of the translation from camera `a` to camera `b`,
/// but not the magnitude of the translation.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, Deref, DerefMut, From, Into)]
pub struct EssentialMatrix(pub Matrix3<f64>);

impl Model<NormalizedMatch> for EssentialMatrix {
    /// The first-order geometric (Sampson) distance of the match to the epipolar constraint.
    fn residual(&self, data: &NormalizedMatch) -> f64 {
        let &NormalizedMatch(a, b) = data;
        let a = a.to_homogeneous();
        let b = b.to_homogeneous();
        let ea = self.0 * a;
        let etb = self.0.transpose() * b;
        let denominator = ea.x * ea.x + ea.y * ea.y + etb.x * etb.x + etb.y * etb.y;
        if denominator > 0.0 {
            b.dot(&ea).abs() / denominator.sqrt()
        } else {
            f64::INFINITY
        }
    }
}

impl From<CameraToCamera> for EssentialMatrix {
    /// Computes `E = [t]ₓ R`.
    fn from(pose: CameraToCamera) -> Self {
        let isometry = pose.isometry();
        Self(isometry.translation.vector.cross_matrix() * isometry.rotation.matrix())
    }
}

impl EssentialMatrix {
    /// Projects the matrix onto the space of essential matrices by making the first two
    /// singular values equal and the third zero.
    #[must_use]
    pub fn recondition(self) -> Option<Self> {
        let (u, s, v_t) = sorted_svd(self.0)?;
        let mean = (s.x + s.y) * 0.5;
        let sigma = Matrix3::from_diagonal(&Vector3::new(mean, mean, 0.0));
        Some(Self(u * sigma * v_t))
    }

    /// Decomposes the essential matrix into the four rigid transforms consistent with it.
    ///
    /// Each has a unit translation. Only one of them places triangulated points in front of
    /// both cameras, see [`EssentialMatrix::solve_pose`].
    pub fn possible_poses(&self) -> Option<[CameraToCamera; 4]> {
        let (mut u, _, mut v_t) = sorted_svd(self.0)?;
        // Both factors must be proper rotations. Negating the null-space direction
        // leaves E unchanged since its singular value is zero.
        if u.determinant() < 0.0 {
            u.column_mut(2).neg_mut();
        }
        if v_t.determinant() < 0.0 {
            v_t.row_mut(2).neg_mut();
        }
        let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let rotation_a = renormalize(Rotation3::from_matrix_unchecked(u * w * v_t));
        let rotation_b = renormalize(Rotation3::from_matrix_unchecked(u * w.transpose() * v_t));
        let t: Vector3<f64> = u.column(2).into_owned();
        let pose = |rotation: Rotation3<f64>, t: Vector3<f64>| {
            CameraToCamera(IsometryMatrix3::from_parts(Translation3::from(t), rotation))
        };
        Some([
            pose(rotation_a, t),
            pose(rotation_a, -t),
            pose(rotation_b, t),
            pose(rotation_b, -t),
        ])
    }

    /// Chooses the pose from [`EssentialMatrix::possible_poses`] that places the most
    /// `probe` points in front of both cameras.
    ///
    /// The chosen pose must place more than half of the probes in front of both cameras
    /// and strictly more than any other candidate, otherwise `None` is returned.
    pub fn solve_pose<I>(&self, probe: I) -> Option<CameraToCamera>
    where
        I: Iterator<Item = NormalizedMatch> + Clone,
    {
        let total = probe.clone().count();
        let mut scored: Vec<(usize, CameraToCamera)> = self
            .possible_poses()?
            .iter()
            .map(|&pose| (count_in_front(pose, probe.clone()), pose))
            .collect();
        scored.sort_unstable_by_key(|&(count, _)| core::cmp::Reverse(count));
        let (best, pose) = scored[0];
        let runner_up = scored[1].0;
        if best * 2 > total && best > runner_up {
            Some(pose)
        } else {
            None
        }
    }
}

/// Counts the matches that triangulate in front of both cameras.
pub fn count_in_front(pose: CameraToCamera, matches: impl Iterator<Item = NormalizedMatch>) -> usize {
    let pose_a = WorldToCamera::identity();
    let pose_b = WorldToCamera(pose.0);
    matches
        .filter(|&NormalizedMatch(a, b)| {
            triangulate(pose_a, pose_b, a, b)
                .and_then(dehomogenize)
                .map_or(false, |point| point.z > 0.0 && (pose.0 * point).z > 0.0)
        })
        .count()
}

/// Singular value decomposition with singular values in descending order.
fn sorted_svd(matrix: Matrix3<f64>) -> Option<(Matrix3<f64>, Vector3<f64>, Matrix3<f64>)> {
    let svd = matrix.try_svd(true, true, f64::EPSILON, 1000)?;
    let (u, v_t, s) = (svd.u?, svd.v_t?, svd.singular_values);
    let mut order = [0usize, 1, 2];
    order.sort_unstable_by_key(|&ix| core::cmp::Reverse(FloatOrd(s[ix])));
    let sorted_u = Matrix3::from_columns(&order.map(|ix| u.column(ix).into_owned()));
    let sorted_v_t = Matrix3::from_rows(&order.map(|ix| v_t.row(ix).into_owned()));
    let sorted_s = Vector3::from_iterator(order.iter().map(|&ix| s[ix]));
    Some((sorted_u, sorted_s, sorted_v_t))
}

/// Performs the
/// [eight-point algorithm](https://en.wikipedia.org/wiki/Eight-point_algorithm)
/// on normalized image coordinates.
///
/// Every match contributes one row of the linear system `A e = 0` where `e` holds the
/// entries of `E`. With more than eight matches the solution is the least-squares one.
/// The result is reconditioned with [`EssentialMatrix::recondition`].
#[derive(Copy, Clone, Debug, Default)]
pub struct EightPoint;

impl EightPoint {
    pub fn new() -> Self {
        Self
    }

    pub fn from_matches<I>(&self, data: I) -> Option<EssentialMatrix>
    where
        I: Iterator<Item = NormalizedMatch>,
    {
        let matches: Vec<NormalizedMatch> = data.collect();
        if matches.len() < <Self as Estimator<NormalizedMatch>>::MIN_SAMPLES {
            return None;
        }
        // The SVD needs at least as many rows as unknowns to expose the null space.
        let mut design = DMatrix::<f64>::zeros(matches.len().max(9), 9);
        for (i, &NormalizedMatch(a, b)) in matches.iter().enumerate() {
            let a = a.to_homogeneous();
            let b = b.to_homogeneous();
            let mut row = design.row_mut(i);
            for j in 0..3 {
                for k in 0..3 {
                    row[3 * j + k] = a[j] * b[k];
                }
            }
        }
        let svd = design.try_svd(false, true, f64::EPSILON, 1000)?;
        let v_t = svd.v_t?;
        let (ix, _) = svd
            .singular_values
            .iter()
            .enumerate()
            .min_by_key(|&(_, &s)| FloatOrd(s))?;
        let mat = Matrix3::from_iterator(v_t.row(ix).iter().copied());
        EssentialMatrix(mat).recondition()
    }
}

impl Estimator<NormalizedMatch> for EightPoint {
    type Model = EssentialMatrix;
    type ModelIter = Option<EssentialMatrix>;
    const MIN_SAMPLES: usize = 8;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = NormalizedMatch> + Clone,
    {
        self.from_matches(data)
    }
}
