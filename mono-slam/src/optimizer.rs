use cv_core::{
    nalgebra::{
        dimension::{Dynamic, U3, U6},
        storage::Owned,
        DVector, IsometryMatrix3, Matrix2x3, OMatrix, Point2, Point3, Rotation3, Translation3,
        Vector2, Vector3, Vector6,
    },
    WorldToCamera,
};
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use log::*;

/// A camera pose in a [`BundleProblem`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseVariable {
    pub pose: WorldToCamera,
    pub fixed: bool,
}

/// A world point in a [`BundleProblem`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointVariable {
    pub position: Point3<f64>,
    pub fixed: bool,
}

/// Point `point` seen from pose `pose` at normalized image coordinate `normalized`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub pose: usize,
    pub point: usize,
    pub normalized: Point2<f64>,
}

/// A self-contained snapshot of poses, points, and the observations tying them together.
///
/// Variables marked `fixed` must not be changed by a [`BundleAdjuster`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BundleProblem {
    pub poses: Vec<PoseVariable>,
    pub points: Vec<PointVariable>,
    pub observations: Vec<Observation>,
}

impl BundleProblem {
    /// Projection of the observed point minus the observation, in normalized coordinates.
    pub fn residual(&self, observation: &Observation) -> Vector2<f64> {
        reprojection_residual(
            self.poses[observation.pose].pose.0 * self.points[observation.point].position,
            observation.normalized,
        )
    }

    /// Sum of squared residuals over every observation.
    pub fn total_error(&self) -> f64 {
        self.observations
            .iter()
            .map(|observation| self.residual(observation).norm_squared())
            .sum()
    }
}

/// Refines poses and points of a [`BundleProblem`] to reduce reprojection error.
pub trait BundleAdjuster {
    /// Adjusts the problem in place using at most `rounds` rounds and returns [`BundleProblem::total_error`].
    fn adjust(&self, problem: &mut BundleProblem, rounds: usize) -> f64;
}

impl<T> BundleAdjuster for &T
where
    T: BundleAdjuster + ?Sized,
{
    fn adjust(&self, problem: &mut BundleProblem, rounds: usize) -> f64 {
        (**self).adjust(problem, rounds)
    }
}

/// Bundle adjustment by alternating resection and intersection.
///
/// Each round solves every free pose against the current points, then every free point
/// against the current poses, each as a small Levenberg-Marquardt problem. Rounds stop early
/// once the relative improvement of the total error drops below `tolerance`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevenbergMarquardtAdjuster {
    /// Passed to [`LevenbergMarquardt::with_patience`].
    pub patience: usize,
    /// Poses with fewer observations are left where they are.
    pub minimum_pose_observations: usize,
    /// Points with fewer observations are left where they are.
    pub minimum_point_observations: usize,
    pub tolerance: f64,
}

impl Default for LevenbergMarquardtAdjuster {
    fn default() -> Self {
        Self {
            patience: 10,
            minimum_pose_observations: 3,
            minimum_point_observations: 2,
            tolerance: 1e-6,
        }
    }
}

impl LevenbergMarquardtAdjuster {
    pub fn new() -> Self {
        Default::default()
    }

    fn resect(
        &self,
        pose: WorldToCamera,
        observations: Vec<(Point3<f64>, Point2<f64>)>,
    ) -> Option<WorldToCamera> {
        let problem = PoseResection {
            base: pose.0.rotation,
            translation: pose.0.translation.vector,
            rotation: Vector3::zeros(),
            observations,
        };
        let initial = problem.cost();
        let (problem, report) = LevenbergMarquardt::new()
            .with_patience(self.patience)
            .minimize(problem);
        let cost = problem.cost();
        if report.objective_function.is_finite() && cost.is_finite() && cost <= initial {
            Some(WorldToCamera(problem.isometry()))
        } else {
            None
        }
    }

    fn intersect(
        &self,
        position: Point3<f64>,
        observations: Vec<(IsometryMatrix3<f64>, Point2<f64>)>,
    ) -> Option<Point3<f64>> {
        let problem = PointIntersection {
            position: position.coords,
            observations,
        };
        let initial = problem.cost();
        let (problem, report) = LevenbergMarquardt::new()
            .with_patience(self.patience)
            .minimize(problem);
        let cost = problem.cost();
        if report.objective_function.is_finite() && cost.is_finite() && cost <= initial {
            Some(Point3::from(problem.position))
        } else {
            None
        }
    }
}

impl BundleAdjuster for LevenbergMarquardtAdjuster {
    fn adjust(&self, problem: &mut BundleProblem, rounds: usize) -> f64 {
        let mut by_pose = vec![vec![]; problem.poses.len()];
        let mut by_point = vec![vec![]; problem.points.len()];
        for (ix, observation) in problem.observations.iter().enumerate() {
            by_pose[observation.pose].push(ix);
            by_point[observation.point].push(ix);
        }

        let mut error = problem.total_error();
        for round in 0..rounds {
            for (pose_ix, observations) in by_pose.iter().enumerate() {
                if problem.poses[pose_ix].fixed
                    || observations.len() < self.minimum_pose_observations
                {
                    continue;
                }
                let observations = observations
                    .iter()
                    .map(|&ix| {
                        let observation = problem.observations[ix];
                        (
                            problem.points[observation.point].position,
                            observation.normalized,
                        )
                    })
                    .collect();
                if let Some(pose) = self.resect(problem.poses[pose_ix].pose, observations) {
                    problem.poses[pose_ix].pose = pose;
                }
            }

            for (point_ix, observations) in by_point.iter().enumerate() {
                if problem.points[point_ix].fixed
                    || observations.len() < self.minimum_point_observations
                {
                    continue;
                }
                let observations = observations
                    .iter()
                    .map(|&ix| {
                        let observation = problem.observations[ix];
                        (
                            problem.poses[observation.pose].pose.0,
                            observation.normalized,
                        )
                    })
                    .collect();
                if let Some(position) =
                    self.intersect(problem.points[point_ix].position, observations)
                {
                    problem.points[point_ix].position = position;
                }
            }

            let new_error = problem.total_error();
            trace!("bundle adjust round {} error {}", round, new_error);
            let improvement = error - new_error;
            error = new_error;
            if improvement <= self.tolerance * error {
                break;
            }
        }
        error
    }
}

fn reprojection_residual(camera: Point3<f64>, observed: Point2<f64>) -> Vector2<f64> {
    if camera.z.abs() > f64::EPSILON {
        Vector2::new(
            camera.x / camera.z - observed.x,
            camera.y / camera.z - observed.y,
        )
    } else {
        Vector2::zeros()
    }
}

/// Derivative of the perspective division with respect to the camera point.
fn projection_jacobian(camera: Point3<f64>) -> Matrix2x3<f64> {
    if camera.z.abs() > f64::EPSILON {
        let iz = camera.z.recip();
        let iz2 = iz * iz;
        Matrix2x3::new(
            iz,
            0.0,
            -camera.x * iz2,
            0.0,
            iz,
            -camera.y * iz2,
        )
    } else {
        Matrix2x3::zeros()
    }
}

/// Solves one pose against fixed world points.
///
/// The rotation is parameterized as an increment `exp(ω) R₀` on the starting rotation,
/// so the Jacobian of the camera point with respect to `ω` is close to `-[R X]ₓ`.
#[derive(Clone)]
struct PoseResection {
    base: Rotation3<f64>,
    translation: Vector3<f64>,
    rotation: Vector3<f64>,
    observations: Vec<(Point3<f64>, Point2<f64>)>,
}

impl PoseResection {
    fn isometry(&self) -> IsometryMatrix3<f64> {
        IsometryMatrix3::from_parts(
            Translation3::from(self.translation),
            Rotation3::new(self.rotation) * self.base,
        )
    }

    fn cost(&self) -> f64 {
        let isometry = self.isometry();
        self.observations
            .iter()
            .map(|&(world, observed)| reprojection_residual(isometry * world, observed).norm_squared())
            .sum()
    }
}

impl LeastSquaresProblem<f64, Dynamic, U6> for PoseResection {
    type ResidualStorage = Owned<f64, Dynamic>;
    type JacobianStorage = Owned<f64, Dynamic, U6>;
    type ParameterStorage = Owned<f64, U6>;

    fn set_params(&mut self, x: &Vector6<f64>) {
        self.translation = Vector3::new(x[0], x[1], x[2]);
        self.rotation = Vector3::new(x[3], x[4], x[5]);
    }

    fn params(&self) -> Vector6<f64> {
        let (t, r) = (self.translation, self.rotation);
        Vector6::new(t.x, t.y, t.z, r.x, r.y, r.z)
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let isometry = self.isometry();
        Some(DVector::from_iterator(
            2 * self.observations.len(),
            self.observations.iter().flat_map(|&(world, observed)| {
                let residual = reprojection_residual(isometry * world, observed);
                [residual.x, residual.y]
            }),
        ))
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dynamic, U6>> {
        let isometry = self.isometry();
        let mut jacobian = OMatrix::<f64, Dynamic, U6>::zeros(2 * self.observations.len());
        for (i, &(world, _)) in self.observations.iter().enumerate() {
            let camera = isometry * world;
            let dproj = projection_jacobian(camera);
            let rotated = camera.coords - self.translation;
            jacobian
                .fixed_slice_mut::<2, 3>(2 * i, 0)
                .copy_from(&dproj);
            jacobian
                .fixed_slice_mut::<2, 3>(2 * i, 3)
                .copy_from(&(dproj * -rotated.cross_matrix()));
        }
        Some(jacobian)
    }
}

/// Solves one world point against fixed poses.
#[derive(Clone)]
struct PointIntersection {
    position: Vector3<f64>,
    observations: Vec<(IsometryMatrix3<f64>, Point2<f64>)>,
}

impl PointIntersection {
    fn cost(&self) -> f64 {
        let world = Point3::from(self.position);
        self.observations
            .iter()
            .map(|&(pose, observed)| reprojection_residual(pose * world, observed).norm_squared())
            .sum()
    }
}

impl LeastSquaresProblem<f64, Dynamic, U3> for PointIntersection {
    type ResidualStorage = Owned<f64, Dynamic>;
    type JacobianStorage = Owned<f64, Dynamic, U3>;
    type ParameterStorage = Owned<f64, U3>;

    fn set_params(&mut self, x: &Vector3<f64>) {
        self.position = *x;
    }

    fn params(&self) -> Vector3<f64> {
        self.position
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let world = Point3::from(self.position);
        Some(DVector::from_iterator(
            2 * self.observations.len(),
            self.observations.iter().flat_map(|&(pose, observed)| {
                let residual = reprojection_residual(pose * world, observed);
                [residual.x, residual.y]
            }),
        ))
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dynamic, U3>> {
        let world = Point3::from(self.position);
        let mut jacobian = OMatrix::<f64, Dynamic, U3>::zeros(2 * self.observations.len());
        for (i, &(pose, _)) in self.observations.iter().enumerate() {
            let dproj = projection_jacobian(pose * world);
            jacobian
                .fixed_slice_mut::<2, 3>(2 * i, 0)
                .copy_from(&(dproj * pose.rotation.matrix()));
        }
        Some(jacobian)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::Pose;

    fn observe(pose: WorldToCamera, point: Point3<f64>) -> Point2<f64> {
        let camera = pose.0 * point;
        Point2::new(camera.x / camera.z, camera.y / camera.z)
    }

    fn grid() -> Vec<Point3<f64>> {
        (0..25)
            .map(|i| {
                let (x, y) = ((i % 5) as f64 - 2.0, (i / 5) as f64 - 2.0);
                Point3::new(x * 0.5, y * 0.5, 5.0 + 0.3 * x - 0.2 * y)
            })
            .collect()
    }

    #[test]
    fn pose_only_refinement() {
        let truth = WorldToCamera::from_parts(
            Vector3::new(0.2, -0.1, 0.05),
            Rotation3::new(Vector3::new(0.01, 0.03, -0.02)),
        );
        let points = grid();
        let mut problem = BundleProblem {
            poses: vec![PoseVariable {
                pose: WorldToCamera::from_parts(Vector3::new(0.25, -0.05, 0.0), Rotation3::identity()),
                fixed: false,
            }],
            points: points
                .iter()
                .map(|&position| PointVariable {
                    position,
                    fixed: true,
                })
                .collect(),
            observations: points
                .iter()
                .enumerate()
                .map(|(point, &p)| Observation {
                    pose: 0,
                    point,
                    normalized: observe(truth, p),
                })
                .collect(),
        };
        let before = problem.total_error();
        let after = LevenbergMarquardtAdjuster::new().adjust(&mut problem, 20);
        assert!(after < before);
        assert!(after < 1e-10);
        let refined = problem.poses[0].pose;
        assert!((refined.0.translation.vector - truth.0.translation.vector).norm() < 1e-4);
        assert!(mono_geom::rotation_angle(&refined.0.rotation, &truth.0.rotation) < 1e-4);
        for (point, original) in problem.points.iter().zip(&points) {
            assert_eq!(point.position, *original);
        }
    }

    #[test]
    fn fixed_poses_do_not_move() {
        let pose_a = WorldToCamera::identity();
        let pose_b = WorldToCamera::from_parts(Vector3::new(-0.5, 0.0, 0.0), Rotation3::identity());
        let points = grid();
        let mut problem = BundleProblem {
            poses: vec![
                PoseVariable {
                    pose: pose_a,
                    fixed: true,
                },
                PoseVariable {
                    pose: pose_b,
                    fixed: true,
                },
            ],
            points: points
                .iter()
                .map(|&p| PointVariable {
                    position: p + Vector3::new(0.05, -0.05, 0.2),
                    fixed: false,
                })
                .collect(),
            observations: points
                .iter()
                .enumerate()
                .flat_map(|(point, &p)| {
                    [
                        Observation {
                            pose: 0,
                            point,
                            normalized: observe(pose_a, p),
                        },
                        Observation {
                            pose: 1,
                            point,
                            normalized: observe(pose_b, p),
                        },
                    ]
                })
                .collect(),
        };
        let before = problem.total_error();
        let after = LevenbergMarquardtAdjuster::new().adjust(&mut problem, 10);
        assert!(after < before * 1e-6);
        assert_eq!(problem.poses[0].pose, pose_a);
        assert_eq!(problem.poses[1].pose, pose_b);
        for (point, original) in problem.points.iter().zip(&points) {
            assert!((point.position - original).norm() < 1e-4);
        }
    }
}
