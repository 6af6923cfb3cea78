use crate::{
    BundleAdjuster, BundleProblem, Frame, FrameId, Observation, Point, PointId,
    PointKey, PointVariable, PoseVariable, Result, SlamError,
};
use cv_core::{nalgebra::Point3, CameraToWorld, Pose};
use log::*;
use slotmap::SlotMap;

/// When [`WorldMap::cull`] removes a point.
///
/// The two conditions are independent: a point is removed if either holds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CullThresholds {
    /// A point with at most this many observations is stale once it falls more than `staleness` frames behind.
    pub max_observations: usize,
    pub staleness: usize,
    /// A point whose mean reprojection error (normalized coordinates) exceeds this is removed.
    pub max_error: f64,
}

impl Default for CullThresholds {
    fn default() -> Self {
        Self {
            max_observations: 4,
            staleness: 7,
            max_error: 0.02,
        }
    }
}

/// Owns every frame and point and keeps the links between them consistent.
///
/// Frames are stored in id order and are never removed. Points live in an arena and are
/// referred to by [`PointKey`]. Each frame slot holds the key of the point observed at that
/// keypoint, and each point lists the `(frame, keypoint)` pairs that observe it. Every
/// mutation goes through this type and either fully applies or leaves the map unchanged.
#[derive(Debug, Clone)]
pub struct WorldMap {
    frames: Vec<Frame>,
    points: SlotMap<PointKey, Point>,
    /// Keys of the live points in creation order.
    point_order: Vec<PointKey>,
    next_point: usize,
    fixed_frames: usize,
}

impl Default for WorldMap {
    fn default() -> Self {
        Self::new(2)
    }
}

impl WorldMap {
    /// Frames with an id below `fixed_frames` are never moved by [`WorldMap::optimize`].
    pub fn new(fixed_frames: usize) -> Self {
        Self {
            frames: vec![],
            points: SlotMap::with_key(),
            point_order: vec![],
            next_point: 0,
            fixed_frames,
        }
    }

    /// The id the next frame must be created with.
    pub fn next_frame_id(&self) -> FrameId {
        FrameId(self.frames.len())
    }

    /// Appends a frame, which must carry [`WorldMap::next_frame_id`] and observe no points.
    pub fn add_frame(&mut self, frame: Frame) -> Result<FrameId> {
        let id = frame.id();
        if id != self.next_frame_id() {
            return Err(SlamError::InvariantViolation(format!(
                "frame {} added when {} was expected",
                id,
                self.next_frame_id()
            )));
        }
        if frame.slots().iter().any(Option::is_some) {
            return Err(SlamError::InvariantViolation(format!(
                "frame {} already observes points",
                id
            )));
        }
        self.frames.push(frame);
        Ok(id)
    }

    /// Creates a point observed by two different frames.
    ///
    /// Both slots must be empty. Nothing is changed on failure.
    pub fn add_point(
        &mut self,
        position: Point3<f64>,
        color: [u8; 3],
        observations: [(FrameId, usize); 2],
    ) -> Result<PointKey> {
        let [(frame_a, ix_a), (frame_b, ix_b)] = observations;
        if frame_a == frame_b {
            return Err(SlamError::InvariantViolation(format!(
                "point would be observed twice by frame {}",
                frame_a
            )));
        }
        self.check_slot_free(frame_a, ix_a)?;
        self.check_slot_free(frame_b, ix_b)?;

        let id = PointId(self.next_point);
        self.next_point += 1;
        let key = self.points.insert(Point {
            id,
            position,
            color,
            observations: observations.to_vec(),
        });
        self.point_order.push(key);
        for (FrameId(f), ix) in observations {
            self.frames[f].set_slot(ix, Some(key));
        }
        Ok(key)
    }

    /// Records that `point` is seen by `frame` at keypoint `ix`.
    ///
    /// Fails without changing anything if the slot is filled or the point already has an
    /// observation in this frame.
    pub fn add_observation(&mut self, point: PointKey, frame: FrameId, ix: usize) -> Result<()> {
        let observed = self
            .points
            .get(point)
            .ok_or_else(|| SlamError::InvariantViolation(format!("{:?} is not in the map", point)))?
            .observes(frame);
        if observed {
            return Err(SlamError::InvariantViolation(format!(
                "{:?} is already observed by frame {}",
                point, frame
            )));
        }
        self.check_slot_free(frame, ix)?;
        self.points[point].observations.push((frame, ix));
        self.frames[frame.0].set_slot(ix, Some(point));
        Ok(())
    }

    fn check_slot_free(&self, frame: FrameId, ix: usize) -> Result<()> {
        let slot = self
            .frames
            .get(frame.0)
            .ok_or_else(|| SlamError::InvariantViolation(format!("frame {} is not in the map", frame)))?
            .slots()
            .get(ix)
            .copied()
            .ok_or_else(|| {
                SlamError::InvariantViolation(format!("frame {} has no keypoint {}", frame, ix))
            })?;
        match slot {
            None => Ok(()),
            Some(existing) => Err(SlamError::InvariantViolation(format!(
                "keypoint {} of frame {} already observes {:?}",
                ix, frame, existing
            ))),
        }
    }

    /// Removes a point and empties every slot that referred to it.
    fn remove_point(&mut self, key: PointKey) -> Option<Point> {
        let point = self.points.remove(key)?;
        for &(FrameId(f), ix) in &point.observations {
            self.frames[f].set_slot(ix, None);
        }
        Some(point)
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frame(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(id.0)
    }

    pub fn last_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn point(&self, key: PointKey) -> Option<&Point> {
        self.points.get(key)
    }

    /// Live points in creation order.
    pub fn points(&self) -> impl Iterator<Item = (PointKey, &Point)> + '_ {
        self.point_order.iter().map(move |&key| (key, &self.points[key]))
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// The camera-to-world pose of every frame, which is the trajectory of the camera.
    pub fn trajectory(&self) -> Vec<CameraToWorld> {
        self.frames.iter().map(|frame| frame.pose().inverse()).collect()
    }

    /// Position and color of every point in creation order.
    pub fn point_cloud(&self) -> Vec<(Point3<f64>, [u8; 3])> {
        self.points()
            .map(|(_, point)| (point.position(), point.color()))
            .collect()
    }

    /// Refines poses and, unless `fix_points`, point positions with the bundle adjuster.
    ///
    /// `window` selects the most recent frames to optimize, all of them if `None`. Every point
    /// seen in the window takes part, and older frames that also see those points are added as
    /// fixed poses. Frames with an id below the map's `fixed_frames` are always fixed.
    ///
    /// Returns the total squared reprojection error in normalized coordinates.
    pub fn optimize<B>(
        &mut self,
        adjuster: &B,
        window: Option<usize>,
        fix_points: bool,
        rounds: usize,
    ) -> f64
    where
        B: BundleAdjuster + ?Sized,
    {
        let start = window.map_or(0, |window| self.frames.len().saturating_sub(window));
        let mut problem = BundleProblem::default();
        let mut pose_ix: Vec<Option<usize>> = vec![None; self.frames.len()];
        let mut keys = vec![];

        for (key, point) in self.points() {
            if !point.observations.iter().any(|&(FrameId(f), _)| f >= start) {
                continue;
            }
            let point_ix = problem.points.len();
            problem.points.push(PointVariable {
                position: point.position,
                fixed: fix_points,
            });
            keys.push(key);
            for &(FrameId(f), ix) in &point.observations {
                let pose = *pose_ix[f].get_or_insert_with(|| {
                    problem.poses.push(PoseVariable {
                        pose: self.frames[f].pose(),
                        fixed: f < start || f < self.fixed_frames,
                    });
                    problem.poses.len() - 1
                });
                problem.observations.push(Observation {
                    pose,
                    point: point_ix,
                    normalized: self.frames[f].normalized()[ix],
                });
            }
        }

        let error = adjuster.adjust(&mut problem, rounds);

        for (f, pose) in pose_ix.iter().enumerate() {
            if let Some(&pose) = pose.as_ref() {
                let variable = problem.poses[pose];
                if !variable.fixed {
                    self.frames[f].set_pose(variable.pose);
                }
            }
        }
        if !fix_points {
            for (key, variable) in keys.iter().zip(&problem.points) {
                self.points[*key].position = variable.position;
            }
        }
        debug!(
            "optimized {} poses, {} points, {} observations",
            problem.poses.iter().filter(|pose| !pose.fixed).count(),
            if fix_points { 0 } else { problem.points.len() },
            problem.observations.len()
        );
        error
    }

    /// Removes weak and inconsistent points and returns how many were removed.
    ///
    /// A point is removed if it has at most `max_observations` observations and its most
    /// recent one is more than `staleness` frames behind the newest frame, or if its mean
    /// reprojection error is above `max_error`. A point behind any observing camera has
    /// infinite error.
    ///
    /// Staleness counts from the id of the newest frame, so a point last seen exactly
    /// `staleness` frames before it is kept.
    pub fn cull(&mut self, thresholds: CullThresholds) -> usize {
        let newest = self.frames.len().saturating_sub(1);
        let doomed: Vec<PointKey> = self
            .points()
            .filter(|(_, point)| {
                let stale = point.observations.len() <= thresholds.max_observations
                    && point
                        .last_observed()
                        .map_or(true, |FrameId(last)| newest - last > thresholds.staleness);
                stale || point.mean_error(&self.frames) > thresholds.max_error
            })
            .map(|(key, _)| key)
            .collect();
        for &key in &doomed {
            self.remove_point(key);
        }
        let points = &self.points;
        self.point_order.retain(|&key| points.contains_key(key));
        doomed.len()
    }

    /// Checks that every slot and every observation refer to each other.
    pub fn validate(&self) -> Result<()> {
        for (key, point) in self.points() {
            for (i, &(frame, ix)) in point.observations.iter().enumerate() {
                if point.observations[..i].iter().any(|&(f, _)| f == frame) {
                    return Err(SlamError::InvariantViolation(format!(
                        "{:?} is observed twice by frame {}",
                        key, frame
                    )));
                }
                let slot = self.frame(frame).and_then(|frame| frame.slot(ix));
                if slot != Some(key) {
                    return Err(SlamError::InvariantViolation(format!(
                        "{:?} lists keypoint {} of frame {} but the slot holds {:?}",
                        key, ix, frame, slot
                    )));
                }
            }
        }
        for frame in &self.frames {
            for (ix, slot) in frame.slots().iter().enumerate() {
                if let Some(key) = *slot {
                    let listed = self
                        .points
                        .get(key)
                        .map_or(false, |point| point.observations.contains(&(frame.id(), ix)));
                    if !listed {
                        return Err(SlamError::InvariantViolation(format!(
                            "keypoint {} of frame {} holds {:?} which does not list it",
                            ix,
                            frame.id(),
                            key
                        )));
                    }
                }
            }
        }
        if self.point_order.len() != self.points.len() {
            return Err(SlamError::InvariantViolation(
                "point order is out of sync with the arena".to_owned(),
            ));
        }
        Ok(())
    }
}
