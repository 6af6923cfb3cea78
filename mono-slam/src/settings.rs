use crate::features::ExtractorKind;
#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The settings for the tracking and mapping process.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SlamSettings {
    /// The feature extractor used on every frame
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_extractor"))]
    pub extractor: ExtractorKind,
    /// The detector threshold used for akaze
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_akaze_threshold"))]
    pub akaze_threshold: f64,
    /// The FAST corner intensity threshold used by the BRIEF extractor
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_brief_fast_threshold"))]
    pub brief_fast_threshold: u8,
    /// The maximum number of corners the BRIEF extractor keeps
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_brief_max_features"))]
    pub brief_max_features: usize,
    /// The minimum pixel distance between two corners kept by the BRIEF extractor
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_brief_min_distance"))]
    pub brief_min_distance: f64,
    /// The best match must be closer than this fraction of the second best match
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_lowes_ratio"))]
    pub lowes_ratio: f64,
    /// The maximum descriptor distance of an accepted frame to frame match
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_match_distance_ceiling"))]
    pub match_distance_ceiling: u32,
    /// The minimum number of matches needed to estimate a pose
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_minimum_matches"))]
    pub minimum_matches: usize,
    /// The minimum median displacement of matches in normalized coordinates
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_minimum_parallax"))]
    pub minimum_parallax: f64,
    /// The maximum epipolar residual of an inlier in normalized coordinates
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_consensus_threshold"))]
    pub consensus_threshold: f64,
    /// The number of minimal samples drawn by sample consensus
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_consensus_max_trials"))]
    pub consensus_max_trials: usize,
    /// The minimum number of inliers an essential matrix needs
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_consensus_minimum_inliers"))]
    pub consensus_minimum_inliers: usize,
    /// The number of inliers triangulated to pick a pose out of the essential matrix
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_cheirality_probe_points"))]
    pub cheirality_probe_points: usize,
    /// The pixel radius searched around a projected map point
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_search_radius"))]
    pub search_radius: f64,
    /// The maximum descriptor distance when re-associating a map point by projection
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_search_distance_ceiling"))]
    pub search_distance_ceiling: u32,
    /// The maximum squared pixel reprojection error of a new point in either view
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_triangulation_max_squared_error"))]
    pub triangulation_max_squared_error: f64,
    /// Global optimization runs on frames whose id is a multiple of this
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_optimization_step"))]
    pub optimization_step: usize,
    /// The number of recent frames optimized globally (all frames if unset)
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_global_window"))]
    pub global_window: Option<usize>,
    /// The number of rounds given to the bundle adjuster
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_optimization_rounds"))]
    pub optimization_rounds: usize,
    /// Frames with an id below this are never moved by optimization
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_fixed_frames"))]
    pub fixed_frames: usize,
    /// Points with at most this many observations can be culled for staleness
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_cull_max_observations"))]
    pub cull_max_observations: usize,
    /// How many frame ids a weakly observed point may fall behind before it is culled
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_cull_staleness"))]
    pub cull_staleness: usize,
    /// The maximum mean reprojection error of a point in normalized coordinates
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_cull_max_error"))]
    pub cull_max_error: f64,
    /// The per frame time budget in milliseconds, global optimization is deferred once exceeded
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_frame_budget_ms"))]
    pub frame_budget_ms: Option<u64>,
    /// The seed for sample consensus and the BRIEF sampling pattern
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_rng_seed"))]
    pub rng_seed: u64,
}

impl Default for SlamSettings {
    fn default() -> Self {
        Self {
            extractor: default_extractor(),
            akaze_threshold: default_akaze_threshold(),
            brief_fast_threshold: default_brief_fast_threshold(),
            brief_max_features: default_brief_max_features(),
            brief_min_distance: default_brief_min_distance(),
            lowes_ratio: default_lowes_ratio(),
            match_distance_ceiling: default_match_distance_ceiling(),
            minimum_matches: default_minimum_matches(),
            minimum_parallax: default_minimum_parallax(),
            consensus_threshold: default_consensus_threshold(),
            consensus_max_trials: default_consensus_max_trials(),
            consensus_minimum_inliers: default_consensus_minimum_inliers(),
            cheirality_probe_points: default_cheirality_probe_points(),
            search_radius: default_search_radius(),
            search_distance_ceiling: default_search_distance_ceiling(),
            triangulation_max_squared_error: default_triangulation_max_squared_error(),
            optimization_step: default_optimization_step(),
            global_window: default_global_window(),
            optimization_rounds: default_optimization_rounds(),
            fixed_frames: default_fixed_frames(),
            cull_max_observations: default_cull_max_observations(),
            cull_staleness: default_cull_staleness(),
            cull_max_error: default_cull_max_error(),
            frame_budget_ms: default_frame_budget_ms(),
            rng_seed: default_rng_seed(),
        }
    }
}

fn default_extractor() -> ExtractorKind {
    ExtractorKind::Akaze
}

fn default_akaze_threshold() -> f64 {
    0.001
}

fn default_brief_fast_threshold() -> u8 {
    20
}

fn default_brief_max_features() -> usize {
    1000
}

fn default_brief_min_distance() -> f64 {
    7.0
}

fn default_lowes_ratio() -> f64 {
    0.75
}

fn default_match_distance_ceiling() -> u32 {
    32
}

fn default_minimum_matches() -> usize {
    8
}

fn default_minimum_parallax() -> f64 {
    0.001
}

fn default_consensus_threshold() -> f64 {
    0.02
}

fn default_consensus_max_trials() -> usize {
    100
}

fn default_consensus_minimum_inliers() -> usize {
    8
}

fn default_cheirality_probe_points() -> usize {
    32
}

fn default_search_radius() -> f64 {
    2.0
}

fn default_search_distance_ceiling() -> u32 {
    64
}

fn default_triangulation_max_squared_error() -> f64 {
    2.0
}

fn default_optimization_step() -> usize {
    4
}

fn default_global_window() -> Option<usize> {
    None
}

fn default_optimization_rounds() -> usize {
    50
}

fn default_fixed_frames() -> usize {
    2
}

fn default_cull_max_observations() -> usize {
    4
}

fn default_cull_staleness() -> usize {
    7
}

fn default_cull_max_error() -> f64 {
    0.02
}

fn default_frame_budget_ms() -> Option<u64> {
    None
}

fn default_rng_seed() -> u64 {
    0
}
