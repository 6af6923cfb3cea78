//! # Monocular tracking and mapping
//!
//! This crate tracks a single calibrated camera through a sequence of images and builds a
//! sparse, colored point map of what it sees.
//!
//! Every image goes through a [`TrackingPipeline`]:
//!
//! 1. features are extracted and a [`Frame`] is built,
//! 2. the [`FrameMatcher`] matches it against the previous frame and recovers the relative pose,
//! 3. known points are carried over, the pose is refined against them, and bad points are culled,
//! 4. more known points are found by projecting them into the image,
//! 5. unmatched correspondences are triangulated into new points,
//! 6. every few frames the whole map is bundle adjusted and culled again.
//!
//! All state lives in the [`WorldMap`], which is the only thing allowed to change poses,
//! points, and the links between them. A single camera cannot observe scale, so the map is in
//! units of the translation between the first two frames.

mod error;
mod features;
mod frame;
mod map;
mod matching;
mod optimizer;
mod point;
mod settings;
mod tracking;

pub use error::*;
pub use features::*;
pub use frame::*;
pub use map::*;
pub use matching::*;
pub use optimizer::*;
pub use point::*;
pub use settings::*;
pub use tracking::*;

pub use mono_geom::CameraIntrinsics;
