use cv_core::nalgebra::{Rotation3, UnitQuaternion};

/// The angle in radians of the rotation taking `a` to `b`.
///
/// This is computed from the chord `‖A - B‖ = 2√2 sin(θ/2)` instead of the trace, so it is
/// accurate near zero and never `NaN` for matrices that are slightly off `SO(3)`.
pub fn rotation_angle(a: &Rotation3<f64>, b: &Rotation3<f64>) -> f64 {
    let chord = (a.matrix() - b.matrix()).norm() / (2.0 * core::f64::consts::SQRT_2);
    2.0 * chord.min(1.0).asin()
}

/// Projects a rotation that has picked up rounding error back onto `SO(3)`.
#[must_use]
pub fn renormalize(rotation: Rotation3<f64>) -> Rotation3<f64> {
    let quaternion = UnitQuaternion::from_rotation_matrix(&rotation).into_inner();
    UnitQuaternion::new_normalize(quaternion).to_rotation_matrix()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::nalgebra::{Matrix3, Vector3};

    #[test]
    fn angle_matches_axis_angle() {
        let a = Rotation3::from_axis_angle(&Vector3::y_axis(), 0.3);
        let b = Rotation3::from_axis_angle(&Vector3::y_axis(), 0.5);
        assert!((rotation_angle(&a, &b) - 0.2).abs() < 1e-12);
        assert_eq!(rotation_angle(&a, &a), 0.0);
    }

    #[test]
    fn nearly_orthogonal_matrix() {
        let exact = Rotation3::from_euler_angles(0.1, -0.2, 0.3);
        let drifted = Rotation3::from_matrix_unchecked(exact.matrix() * (1.0 + 1e-9));
        let angle = rotation_angle(&drifted, &exact);
        assert!(angle.is_finite() && angle < 1e-8);

        let fixed = renormalize(drifted);
        let m = fixed.matrix();
        assert!((m * m.transpose() - Matrix3::identity()).norm() < 1e-12);
        assert!(rotation_angle(&fixed, &exact) < 1e-8);
    }
}
