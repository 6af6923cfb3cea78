use cv_core::nalgebra::{Matrix3, Point2, Point3};

/// A pinhole calibration matrix `K` together with its inverse.
///
/// The inverse is computed once on construction, so normalizing keypoints
/// is a single matrix product per point.
///
/// ```
/// use cv_core::nalgebra::{Point2, Point3};
/// use mono_geom::CameraIntrinsics;
///
/// let intrinsics = CameraIntrinsics::from_focal(500.0, Point2::new(320.0, 240.0)).unwrap();
/// let pixel = intrinsics.project(Point3::new(0.2, -0.1, 2.0)).unwrap();
/// let normalized = intrinsics.normalize(pixel);
/// assert!((normalized - Point2::new(0.1, -0.05)).norm() < 1e-12);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    matrix: Matrix3<f64>,
    inverse: Matrix3<f64>,
}

impl CameraIntrinsics {
    /// Returns `None` if `matrix` is not invertible.
    pub fn new(matrix: Matrix3<f64>) -> Option<Self> {
        let inverse = matrix.try_inverse()?;
        Some(Self { matrix, inverse })
    }

    /// Builds `K = [[f, 0, cx], [0, f, cy], [0, 0, 1]]`.
    pub fn from_focal(focal: f64, principal_point: Point2<f64>) -> Option<Self> {
        Self::new(Matrix3::new(
            focal,
            0.0,
            principal_point.x,
            0.0,
            focal,
            principal_point.y,
            0.0,
            0.0,
            1.0,
        ))
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    pub fn inverse(&self) -> &Matrix3<f64> {
        &self.inverse
    }

    /// Removes the calibration from a pixel coordinate.
    pub fn normalize(&self, pixel: Point2<f64>) -> Point2<f64> {
        Point2::from_homogeneous(self.inverse * pixel.to_homogeneous())
            .unwrap_or_else(|| Point2::new(f64::NAN, f64::NAN))
    }

    /// Applies the calibration to a normalized image coordinate.
    pub fn denormalize(&self, normalized: Point2<f64>) -> Point2<f64> {
        Point2::from_homogeneous(self.matrix * normalized.to_homogeneous())
            .unwrap_or_else(|| Point2::new(f64::NAN, f64::NAN))
    }

    /// Projects a point in camera space to a pixel.
    ///
    /// Returns `None` if the point is not in front of the camera.
    pub fn project(&self, camera: Point3<f64>) -> Option<Point2<f64>> {
        if camera.z > 0.0 {
            Point2::from_homogeneous(self.matrix * camera.coords)
        } else {
            None
        }
    }
}

/// Applies an inverse calibration matrix to every pixel coordinate.
pub fn normalize(inverse: &Matrix3<f64>, pixels: &[Point2<f64>]) -> Vec<Point2<f64>> {
    pixels
        .iter()
        .map(|pixel| {
            let h = inverse * pixel.to_homogeneous();
            Point2::new(h.x / h.z, h.y / h.z)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singular_matrix_is_rejected() {
        assert!(CameraIntrinsics::new(Matrix3::zeros()).is_none());
        assert!(CameraIntrinsics::from_focal(0.0, Point2::origin()).is_none());
    }

    #[test]
    fn normalize_matches_inverse() {
        let intrinsics = CameraIntrinsics::from_focal(225.0, Point2::new(512.0, 384.0)).unwrap();
        let pixels = [Point2::new(512.0, 384.0), Point2::new(737.0, 159.0)];
        let normalized = normalize(intrinsics.inverse(), &pixels);
        assert!((normalized[0] - Point2::origin()).norm() < 1e-12);
        assert!((normalized[1] - Point2::new(1.0, -1.0)).norm() < 1e-12);
        for (&pixel, &n) in pixels.iter().zip(&normalized) {
            assert!((intrinsics.denormalize(n) - pixel).norm() < 1e-9);
            assert!((intrinsics.normalize(pixel) - n).norm() < 1e-12);
        }
    }

    #[test]
    fn points_behind_do_not_project() {
        let intrinsics = CameraIntrinsics::from_focal(225.0, Point2::new(512.0, 384.0)).unwrap();
        assert!(intrinsics.project(Point3::new(0.0, 0.0, -1.0)).is_none());
        assert!(intrinsics.project(Point3::new(0.0, 0.0, 0.0)).is_none());
    }
}
