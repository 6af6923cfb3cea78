use thiserror::Error;

/// Why two frames could not be related by a rigid motion.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegenerateGeometry {
    /// The matched keypoints barely moved, so the baseline is too small to estimate a pose.
    #[error("median parallax of matches is below the minimum")]
    InsufficientParallax,
    /// No essential matrix was supported by enough inliers.
    #[error("no essential matrix reached the inlier minimum")]
    NoConsensus,
    /// No decomposition of the essential matrix placed the probe points in front of both cameras.
    #[error("no pose candidate passed the cheirality test")]
    NoCheiralSolution,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SlamError {
    #[error("image is {actual:?} but the pipeline was configured for {expected:?}")]
    ShapeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("found {found} matches, at least {required} are required")]
    InsufficientMatches { found: usize, required: usize },
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(#[from] DegenerateGeometry),
    /// A write to the map would have broken the frame/point links. Nothing was changed.
    #[error("map invariant violated: {0}")]
    InvariantViolation(String),
}

pub type Result<T, E = SlamError> = core::result::Result<T, E>;
