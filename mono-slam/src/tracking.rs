use crate::{
    BundleAdjuster, CullThresholds, Extractor, FeatureExtractor, Frame, FrameId, FrameMatcher,
    LevenbergMarquardtAdjuster, PointKey, Result, SlamError, SlamSettings, WorldMap,
};
use cv_core::{
    nalgebra::{Point2, Point3, Vector4},
    WorldToCamera,
};
use image::{DynamicImage, GenericImageView};
use log::*;
use mono_geom::{dehomogenize, renormalize, triangulate_many, CameraIntrinsics};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::time::{Duration, Instant};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// What happened to one frame passed to [`TrackingPipeline::process_frame`].
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub frame: FrameId,
    /// The frame was the first one in the map and only defines the origin.
    pub bootstrap: bool,
    /// Descriptor matches with the previous frame before geometric verification.
    pub matches: usize,
    /// Matches consistent with the estimated relative pose.
    pub inliers: usize,
    /// Points carried over from the previous frame through matches.
    pub propagated: usize,
    /// Points found by projecting the map into the frame.
    pub searched: usize,
    /// New points triangulated from this frame and the previous one.
    pub triangulated: usize,
    /// Total squared error after refining the pose of this frame.
    pub pose_error: Option<f64>,
    /// Total squared error after global optimization, if it ran.
    pub optimization_error: Option<f64>,
    /// Points removed by culling after each optimization of this frame.
    pub culled: usize,
    /// Points in the map after this frame.
    pub points: usize,
    pub elapsed: Duration,
    /// The frame budget ran out before global optimization.
    pub over_budget: bool,
}

impl FrameReport {
    fn new(frame: FrameId) -> Self {
        Self {
            frame,
            bootstrap: false,
            matches: 0,
            inliers: 0,
            propagated: 0,
            searched: 0,
            triangulated: 0,
            pose_error: None,
            optimization_error: None,
            culled: 0,
            points: 0,
            elapsed: Duration::ZERO,
            over_budget: false,
        }
    }
}

/// Turns a stream of same-sized images into a camera trajectory and a point map.
///
/// Frames must be passed in capture order. A frame that fails to match the previous one
/// is dropped and leaves the map as it was, so the next frame is matched against the same
/// previous frame.
#[derive(Debug)]
pub struct TrackingPipeline<E = Extractor, B = LevenbergMarquardtAdjuster> {
    width: u32,
    height: u32,
    intrinsics: CameraIntrinsics,
    extractor: E,
    adjuster: B,
    matcher: FrameMatcher<Xoshiro256PlusPlus>,
    settings: SlamSettings,
    map: WorldMap,
}

impl TrackingPipeline {
    /// Uses the extractor named in the settings and the default bundle adjuster.
    pub fn from_settings(
        width: u32,
        height: u32,
        intrinsics: CameraIntrinsics,
        settings: SlamSettings,
    ) -> Self {
        Self::new(
            width,
            height,
            intrinsics,
            Extractor::from_settings(&settings),
            LevenbergMarquardtAdjuster::new(),
            settings,
        )
    }
}

impl<E, B> TrackingPipeline<E, B>
where
    E: FeatureExtractor,
    B: BundleAdjuster,
{
    pub fn new(
        width: u32,
        height: u32,
        intrinsics: CameraIntrinsics,
        extractor: E,
        adjuster: B,
        settings: SlamSettings,
    ) -> Self {
        Self {
            width,
            height,
            intrinsics,
            extractor,
            adjuster,
            matcher: FrameMatcher::new(
                &settings,
                Xoshiro256PlusPlus::seed_from_u64(settings.rng_seed),
            ),
            settings,
            map: WorldMap::new(settings.fixed_frames),
        }
    }

    pub fn map(&self) -> &WorldMap {
        &self.map
    }

    pub fn into_map(self) -> WorldMap {
        self.map
    }

    pub fn settings(&self) -> &SlamSettings {
        &self.settings
    }

    pub fn intrinsics(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    /// Drops the map so the next frame starts a new one.
    pub fn reset(&mut self) {
        info!("resetting map with {} frames", self.map.frame_count());
        self.map = WorldMap::new(self.settings.fixed_frames);
    }

    /// Tracks one image and extends the map with it.
    ///
    /// Fails with [`SlamError::ShapeMismatch`] if the image does not have the configured size.
    /// Matching failures are returned as [`SlamError::InsufficientMatches`] or
    /// [`SlamError::DegenerateGeometry`], and in every error case the map is unchanged.
    pub fn process_frame(&mut self, image: &DynamicImage) -> Result<FrameReport> {
        let start = Instant::now();
        let (width, height) = image.dimensions();
        if (width, height) != (self.width, self.height) {
            return Err(SlamError::ShapeMismatch {
                expected: (self.width, self.height),
                actual: (width, height),
            });
        }

        let id = self.map.next_frame_id();
        let mut frame = Frame::extract(id, self.intrinsics, &self.extractor, image, None)?;
        let mut report = FrameReport::new(id);

        if self.map.frame_count() == 0 {
            info!("bootstrapping map with {} features", frame.len());
            self.map.add_frame(frame)?;
            report.bootstrap = true;
            report.elapsed = start.elapsed();
            return Ok(report);
        }
        let previous = self
            .map
            .last_frame()
            .ok_or_else(|| SlamError::InvariantViolation("map has no frames".to_owned()))?;
        let previous_id = previous.id();

        let found = self.matcher.match_frames(&frame, previous)?;
        report.matches = found.candidates;
        report.inliers = found.matches.len();
        info!("matches: {}", found.matches.len());

        let mut pose = found.relative.0 * previous.pose().0;
        pose.rotation = renormalize(pose.rotation);
        frame.set_pose(WorldToCamera(pose));
        let carried: Vec<(PointKey, usize)> = found
            .matches
            .iter()
            .filter_map(|&(current, previous_ix)| Some((previous.slot(previous_ix)?, current)))
            .collect();

        self.map.add_frame(frame)?;
        for (key, ix) in carried {
            let free = self.map.frame(id).map_or(false, |frame| frame.slot(ix).is_none());
            let seen = self.map.point(key).map_or(true, |point| point.observes(id));
            if free && !seen {
                self.map.add_observation(key, id, ix)?;
                report.propagated += 1;
            }
        }

        let rounds = self.settings.optimization_rounds;
        let pose_error = self.map.optimize(&self.adjuster, Some(1), true, rounds);
        report.pose_error = Some(pose_error);
        debug!("pose: {} units of error", pose_error);
        report.culled = self.map.cull(self.cull_thresholds());

        report.searched = self.search_by_projection(id)?;
        report.triangulated = self.triangulate(image, previous_id, id, &found.matches)?;
        info!(
            "adding: {} new points, {} search by projection",
            report.triangulated, report.searched
        );

        report.over_budget = self
            .settings
            .frame_budget_ms
            .map_or(false, |budget| start.elapsed() > Duration::from_millis(budget));
        let step = self.settings.optimization_step;
        if id.0 >= 2 && step != 0 && id.0 % step == 0 {
            if report.over_budget {
                warn!("frame {} is over budget, deferring global optimization", id);
            } else {
                let error = self.map.optimize(
                    &self.adjuster,
                    self.settings.global_window,
                    false,
                    rounds,
                );
                info!("optimize: {} units of error", error);
                report.optimization_error = Some(error);
                report.culled += self.map.cull(self.cull_thresholds());
            }
        }

        report.points = self.map.point_count();
        report.elapsed = start.elapsed();
        info!("culled {} points", report.culled);
        info!(
            "map: {} points, {} frames",
            self.map.point_count(),
            self.map.frame_count()
        );
        info!("time: {:.2} ms", report.elapsed.as_secs_f64() * 1000.0);
        Ok(report)
    }

    /// Associates map points with free keypoints near where they project in frame `id`.
    fn search_by_projection(&mut self, id: FrameId) -> Result<usize> {
        let frame = self.map.frame(id).ok_or_else(|| missing(id))?;
        let (width, height) = (self.width as f64, self.height as f64);
        let mut claimed = vec![false; frame.len()];
        let mut found = vec![];
        for (key, point) in self.map.points() {
            if point.observes(id) {
                continue;
            }
            let pixel = match frame.project(point.position()) {
                Some(pixel) => pixel,
                None => continue,
            };
            if pixel.x <= 0.0 || pixel.x >= width || pixel.y <= 0.0 || pixel.y >= height {
                continue;
            }
            let candidate = frame
                .keypoints_within(pixel, self.settings.search_radius)
                .into_iter()
                .find(|&ix| {
                    !claimed[ix]
                        && frame.slot(ix).is_none()
                        && point
                            .descriptor_distance(self.map.frames(), frame.descriptor(ix))
                            .map_or(false, |d| d < self.settings.search_distance_ceiling)
                });
            if let Some(ix) = candidate {
                claimed[ix] = true;
                found.push((key, ix));
            }
        }
        let count = found.len();
        for (key, ix) in found {
            self.map.add_observation(key, id, ix)?;
        }
        Ok(count)
    }

    /// Creates points from matches where neither keypoint observes a point yet.
    fn triangulate(
        &mut self,
        image: &DynamicImage,
        previous: FrameId,
        current: FrameId,
        matches: &[(usize, usize)],
    ) -> Result<usize> {
        let a = self.map.frame(previous).ok_or_else(|| missing(previous))?;
        let b = self.map.frame(current).ok_or_else(|| missing(current))?;
        let open: Vec<(usize, usize)> = matches
            .iter()
            .copied()
            .filter(|&(c, p)| a.slot(p).is_none() && b.slot(c).is_none())
            .collect();
        let homogeneous = triangulate_many(
            a.pose(),
            b.pose(),
            open.iter()
                .map(|&(c, p)| (a.normalized()[p], b.normalized()[c])),
        );
        let max_error = self.settings.triangulation_max_squared_error;
        let created: Vec<(Point3<f64>, [u8; 3], usize, usize)> = open
            .iter()
            .zip(homogeneous)
            .filter_map(|(&(c, p), h)| {
                let position = validate_triangulation(h?, [(a, p), (b, c)], max_error)?;
                Some((position, sample_color(image, b.keypoint(c)), p, c))
            })
            .collect();
        let count = created.len();
        for (position, color, p, c) in created {
            self.map
                .add_point(position, color, [(previous, p), (current, c)])?;
        }
        Ok(count)
    }

    fn cull_thresholds(&self) -> CullThresholds {
        CullThresholds {
            max_observations: self.settings.cull_max_observations,
            staleness: self.settings.cull_staleness,
            max_error: self.settings.cull_max_error,
        }
    }
}

fn missing(id: FrameId) -> SlamError {
    SlamError::InvariantViolation(format!("frame {} is not in the map", id))
}

/// Accepts a triangulated point only if it is finite, in front of both cameras, and
/// reprojects within `max_squared_error` pixels² of each keypoint.
pub(crate) fn validate_triangulation(
    homogeneous: Vector4<f64>,
    views: [(&Frame, usize); 2],
    max_squared_error: f64,
) -> Option<Point3<f64>> {
    let position = dehomogenize(homogeneous)?;
    for (frame, ix) in views {
        let pixel = frame.project(position)?;
        if (pixel - frame.keypoint(ix)).norm_squared() > max_squared_error {
            return None;
        }
    }
    Some(position)
}

/// The RGB color of the pixel a keypoint falls in.
fn sample_color(image: &DynamicImage, keypoint: Point2<f64>) -> [u8; 3] {
    let (width, height) = image.dimensions();
    let x = (keypoint.x.max(0.0) as u32).min(width.saturating_sub(1));
    let y = (keypoint.y.max(0.0) as u32).min(height.saturating_sub(1));
    let [r, g, b, _] = image.get_pixel(x, y).0;
    [r, g, b]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Descriptor, Features};
    use cv_core::{
        nalgebra::{IsometryMatrix3, Rotation3, Translation3},
        Pose,
    };
    use image::{Rgb, RgbImage};

    fn frame(id: usize, pose: WorldToCamera, keypoint: Point2<f64>) -> Frame {
        let intrinsics = CameraIntrinsics::from_focal(100.0, Point2::new(50.0, 50.0)).unwrap();
        Frame::new(
            FrameId(id),
            intrinsics,
            Features {
                keypoints: vec![keypoint],
                descriptors: vec![Descriptor::zeros()],
            },
            Some(pose),
        )
        .unwrap()
    }

    fn shifted(x: f64) -> WorldToCamera {
        WorldToCamera(IsometryMatrix3::from_parts(
            Translation3::new(x, 0.0, 0.0),
            Rotation3::identity(),
        ))
    }

    #[test]
    fn triangulation_is_validated_in_both_views() {
        let world = Point3::new(0.1, 0.2, 2.0);
        let a = frame(0, WorldToCamera::identity(), Point2::new(55.0, 60.0));
        let b = frame(1, shifted(-0.2), Point2::new(45.0, 60.0));
        let h = world.to_homogeneous() * 3.0;
        let accepted = validate_triangulation(h, [(&a, 0), (&b, 0)], 2.0).unwrap();
        assert!((accepted - world).norm() < 1e-12);

        // One pixel off in the second view is an error of 1.0.
        let off = frame(1, shifted(-0.2), Point2::new(46.0, 60.0));
        assert!(validate_triangulation(h, [(&a, 0), (&off, 0)], 2.0).is_some());
        assert!(validate_triangulation(h, [(&a, 0), (&off, 0)], 0.5).is_none());
    }

    #[test]
    fn triangulation_behind_or_at_infinity_is_rejected() {
        let a = frame(0, WorldToCamera::identity(), Point2::new(50.0, 50.0));
        let b = frame(1, shifted(-0.2), Point2::new(40.0, 50.0));
        let behind = Point3::new(0.0, 0.0, -2.0).to_homogeneous();
        assert!(validate_triangulation(behind, [(&a, 0), (&b, 0)], 1e9).is_none());
        let infinite = Vector4::new(0.0, 0.0, 1.0, 0.0);
        assert!(validate_triangulation(infinite, [(&a, 0), (&b, 0)], 1e9).is_none());
    }

    #[test]
    fn color_is_sampled_and_clamped() {
        let mut image = RgbImage::new(4, 3);
        image.put_pixel(1, 2, Rgb([10, 20, 30]));
        image.put_pixel(3, 0, Rgb([40, 50, 60]));
        let image = DynamicImage::ImageRgb8(image);
        assert_eq!(sample_color(&image, Point2::new(1.9, 2.2)), [10, 20, 30]);
        assert_eq!(sample_color(&image, Point2::new(9.0, -1.0)), [40, 50, 60]);
    }
}
