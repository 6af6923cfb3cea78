//! # Monocular two-view geometry
//!
//! This crate holds the pure geometry used to track a single moving camera:
//!
//! * [`CameraIntrinsics`] removes and re-applies the calibration matrix `K`
//! * [`triangulate`] recovers a homogeneous world point from two poses and two normalized keypoints
//! * [`EssentialMatrix`] encodes the relative pose between two calibrated views and
//!   can be decomposed back into the four candidate poses
//! * [`EightPoint`] estimates an essential matrix from eight or more [`NormalizedMatch`]es
//! * [`Ransac`] finds the essential matrix that agrees with the most matches
//! * [`rotation_angle`] and [`renormalize`] compare and repair rotations
//!
//! Poses use the types from [`cv_core`]. A [`NormalizedMatch`] `(a, b)` always pairs a keypoint
//! in camera `a` with a keypoint in camera `b`, and an essential matrix `E` estimated from such
//! matches satisfies `bᵀ E a = 0`. The [`CameraToCamera`](cv_core::CameraToCamera) it decomposes into
//! maps points in camera `a` into camera `b`.

mod camera;
mod consensus;
mod essential;
mod rotation;
mod triangulation;

pub use camera::*;
pub use consensus::*;
pub use essential::*;
pub use rotation::*;
pub use triangulation::*;

use cv_core::nalgebra::Point2;

/// A correspondence between normalized image coordinates in camera `a` (`.0`) and camera `b` (`.1`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedMatch(pub Point2<f64>, pub Point2<f64>);
