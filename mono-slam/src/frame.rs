use crate::{Descriptor, FeatureExtractor, Features, PointKey, Result, SlamError};
use cv_core::{
    nalgebra::{Matrix4, Point2, Point3},
    Pose, WorldToCamera,
};
use derive_more::{Display, From, Into};
use image::DynamicImage;
use mono_geom::{normalize, CameraIntrinsics};
use rstar::{primitives::GeomWithData, RTree};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The id of a frame, which is also its position in the map.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
pub struct FrameId(pub usize);

type KeypointPoint = GeomWithData<[f64; 2], usize>;

/// One processed image.
///
/// Everything but the pose and the slots is fixed on construction: the inverse intrinsics,
/// the normalized keypoints, and the spatial index over the pixel keypoints are computed once here.
#[derive(Clone)]
pub struct Frame {
    id: FrameId,
    pose: WorldToCamera,
    intrinsics: CameraIntrinsics,
    keypoints: Vec<Point2<f64>>,
    normalized: Vec<Point2<f64>>,
    descriptors: Vec<Descriptor>,
    slots: Vec<Option<PointKey>>,
    index: RTree<KeypointPoint>,
}

impl Frame {
    /// Builds a frame from already extracted features.
    ///
    /// The pose defaults to identity. Fails if the keypoint and descriptor counts differ.
    pub fn new(
        id: FrameId,
        intrinsics: CameraIntrinsics,
        features: Features,
        pose: Option<WorldToCamera>,
    ) -> Result<Self> {
        let Features {
            keypoints,
            descriptors,
        } = features;
        if keypoints.len() != descriptors.len() {
            return Err(SlamError::InvariantViolation(format!(
                "frame {} has {} keypoints but {} descriptors",
                id,
                keypoints.len(),
                descriptors.len()
            )));
        }
        let normalized = normalize(intrinsics.inverse(), &keypoints);
        let index = RTree::bulk_load(
            keypoints
                .iter()
                .enumerate()
                .map(|(ix, p)| KeypointPoint::new([p.x, p.y], ix))
                .collect(),
        );
        Ok(Self {
            id,
            pose: pose.unwrap_or_else(WorldToCamera::identity),
            intrinsics,
            slots: vec![None; keypoints.len()],
            keypoints,
            normalized,
            descriptors,
            index,
        })
    }

    /// Runs the extractor once on the image and builds the frame from its output.
    pub fn extract(
        id: FrameId,
        intrinsics: CameraIntrinsics,
        extractor: &impl FeatureExtractor,
        image: &DynamicImage,
        pose: Option<WorldToCamera>,
    ) -> Result<Self> {
        Self::new(id, intrinsics, Features::extract(extractor, image), pose)
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn pose(&self) -> WorldToCamera {
        self.pose
    }

    /// The pose as a 4x4 matrix with last row `[0, 0, 0, 1]`.
    pub fn homogeneous(&self) -> Matrix4<f64> {
        self.pose.homogeneous()
    }

    pub(crate) fn set_pose(&mut self, pose: WorldToCamera) {
        self.pose = pose;
    }

    pub fn intrinsics(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    pub fn keypoints(&self) -> &[Point2<f64>] {
        &self.keypoints
    }

    pub fn keypoint(&self, ix: usize) -> Point2<f64> {
        self.keypoints[ix]
    }

    /// Keypoints with the calibration removed.
    pub fn normalized(&self) -> &[Point2<f64>] {
        &self.normalized
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, ix: usize) -> &Descriptor {
        &self.descriptors[ix]
    }

    pub fn slots(&self) -> &[Option<PointKey>] {
        &self.slots
    }

    /// The point observed at keypoint `ix`, if any.
    pub fn slot(&self, ix: usize) -> Option<PointKey> {
        self.slots.get(ix).copied().flatten()
    }

    /// The map checks the slot exists before calling this.
    pub(crate) fn set_slot(&mut self, ix: usize, point: Option<PointKey>) {
        self.slots[ix] = point;
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// Indices of the keypoints within `radius` pixels of `pixel`, closest first.
    pub fn keypoints_within(&self, pixel: Point2<f64>, radius: f64) -> Vec<usize> {
        let mut found: Vec<(f64, usize)> = self
            .index
            .locate_within_distance([pixel.x, pixel.y], radius * radius)
            .map(|kp| ((self.keypoints[kp.data] - pixel).norm_squared(), kp.data))
            .collect();
        found.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(core::cmp::Ordering::Equal));
        found.into_iter().map(|(_, ix)| ix).collect()
    }

    /// Projects a world point to a pixel, `None` if it is behind the camera.
    pub fn project(&self, world: Point3<f64>) -> Option<Point2<f64>> {
        self.intrinsics.project(self.pose.0 * world)
    }

    /// Distance between the projection of `world` and keypoint `ix` in normalized coordinates.
    ///
    /// Infinite if the point is not in front of the camera.
    pub fn reprojection_error(&self, world: Point3<f64>, ix: usize) -> f64 {
        let camera = self.pose.0 * world;
        if camera.z > 0.0 {
            (Point2::new(camera.x / camera.z, camera.y / camera.z) - self.normalized[ix]).norm()
        } else {
            f64::INFINITY
        }
    }
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("pose", &self.pose)
            .field("keypoints", &self.keypoints.len())
            .field(
                "observed",
                &self.slots.iter().filter(|slot| slot.is_some()).count(),
            )
            .finish_non_exhaustive()
    }
}
