use crate::{Descriptor, Frame, FrameId};
use cv_core::nalgebra::Point3;
use derive_more::{Display, From, Into};
use slotmap::new_key_type;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

new_key_type! {
    pub struct PointKey;
}

/// The id of a point in creation order. Unlike [`PointKey`] it is never reused.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
pub struct PointId(pub usize);

/// A reconstructed point in the world and the keypoints it was seen at.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub(crate) id: PointId,
    pub(crate) position: Point3<f64>,
    pub(crate) color: [u8; 3],
    /// Each frame appears at most once.
    pub(crate) observations: Vec<(FrameId, usize)>,
}

impl Point {
    pub fn id(&self) -> PointId {
        self.id
    }

    pub fn position(&self) -> Point3<f64> {
        self.position
    }

    pub fn color(&self) -> [u8; 3] {
        self.color
    }

    /// The frame and keypoint index of every observation, oldest first.
    pub fn observations(&self) -> &[(FrameId, usize)] {
        &self.observations
    }

    pub fn observes(&self, frame: FrameId) -> bool {
        self.observations.iter().any(|&(f, _)| f == frame)
    }

    /// The most recent frame this point was seen in.
    pub fn last_observed(&self) -> Option<FrameId> {
        self.observations.iter().map(|&(f, _)| f).max()
    }

    /// The smallest Hamming distance between `descriptor` and the descriptors this point was observed with.
    pub fn descriptor_distance(&self, frames: &[Frame], descriptor: &Descriptor) -> Option<u32> {
        self.observations
            .iter()
            .filter_map(|&(FrameId(f), ix)| {
                frames
                    .get(f)
                    .map(|frame| frame.descriptor(ix).distance(descriptor))
            })
            .min()
    }

    /// Mean reprojection error in normalized coordinates over every observation.
    pub fn mean_error(&self, frames: &[Frame]) -> f64 {
        let total: f64 = self
            .observations
            .iter()
            .map(|&(FrameId(f), ix)| {
                frames
                    .get(f)
                    .map_or(f64::INFINITY, |frame| frame.reprojection_error(self.position, ix))
            })
            .sum();
        total / self.observations.len().max(1) as f64
    }
}
