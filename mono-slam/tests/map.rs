use cv_core::{
    nalgebra::{Point2, Point3, Rotation3, Vector3},
    Pose, WorldToCamera,
};
use mono_slam::{
    CameraIntrinsics, CullThresholds, Descriptor, Features, Frame, FrameId,
    LevenbergMarquardtAdjuster, SlamError, WorldMap,
};

fn intrinsics() -> CameraIntrinsics {
    CameraIntrinsics::from_focal(100.0, Point2::new(50.0, 50.0)).unwrap()
}

fn shifted(x: f64) -> WorldToCamera {
    WorldToCamera::from_parts(Vector3::new(x, 0.0, 0.0), Rotation3::identity())
}

/// A frame whose keypoints are the exact projections of `points`.
fn frame(id: usize, pose: WorldToCamera, points: &[Point3<f64>]) -> Frame {
    let keypoints = points
        .iter()
        .map(|&p| intrinsics().project(pose.0 * p).unwrap())
        .collect::<Vec<_>>();
    let descriptors = (0..keypoints.len())
        .map(|i| {
            let mut bytes = [0u8; 64];
            bytes[i % 64] = (i / 64 + 1) as u8;
            Descriptor::new(bytes)
        })
        .collect();
    Frame::new(
        FrameId(id),
        intrinsics(),
        Features {
            keypoints,
            descriptors,
        },
        Some(pose),
    )
    .unwrap()
}

fn grid() -> Vec<Point3<f64>> {
    (0..16)
        .map(|i| {
            let (x, y) = ((i % 4) as f64 - 1.5, (i / 4) as f64 - 1.5);
            Point3::new(x * 0.4, y * 0.4, 4.0 + 0.2 * x)
        })
        .collect()
}

fn two_frame_map() -> WorldMap {
    let points = grid();
    let mut map = WorldMap::default();
    map.add_frame(frame(0, WorldToCamera::identity(), &points))
        .unwrap();
    map.add_frame(frame(1, shifted(-0.5), &points)).unwrap();
    map
}

#[test]
fn frames_must_arrive_in_order() {
    let mut map = two_frame_map();
    assert!(matches!(
        map.add_frame(frame(5, WorldToCamera::identity(), &grid())),
        Err(SlamError::InvariantViolation(_))
    ));
    assert_eq!(map.frame_count(), 2);
    assert_eq!(map.next_frame_id(), FrameId(2));
}

#[test]
fn observations_are_write_once() {
    let mut map = two_frame_map();
    let points = grid();
    let key = map
        .add_point(points[0], [1, 2, 3], [(FrameId(0), 0), (FrameId(1), 0)])
        .unwrap();
    map.add_frame(frame(2, shifted(-1.0), &points)).unwrap();
    map.add_observation(key, FrameId(2), 0).unwrap();

    // The same frame twice.
    assert!(map.add_observation(key, FrameId(2), 1).is_err());
    // A slot that is already taken.
    let other = map
        .add_point(points[1], [0; 3], [(FrameId(0), 1), (FrameId(1), 1)])
        .unwrap();
    assert!(map.add_observation(other, FrameId(2), 0).is_err());
    assert!(map
        .add_point(points[2], [0; 3], [(FrameId(0), 0), (FrameId(1), 2)])
        .is_err());
    // Both observations in one frame.
    assert!(map
        .add_point(points[2], [0; 3], [(FrameId(0), 2), (FrameId(0), 3)])
        .is_err());
    // A keypoint that does not exist.
    assert!(map.add_observation(other, FrameId(2), 99).is_err());

    assert_eq!(map.point_count(), 2);
    assert_eq!(
        map.point(key).unwrap().observations(),
        &[(FrameId(0), 0), (FrameId(1), 0), (FrameId(2), 0)]
    );
    assert_eq!(map.frames()[2].slot(0), Some(key));
    assert_eq!(map.frames()[2].slot(1), None);
    map.validate().unwrap();
}

#[test]
fn cull_removes_inconsistent_points() {
    let mut map = two_frame_map();
    let points = grid();
    let good = map
        .add_point(points[0], [0; 3], [(FrameId(0), 0), (FrameId(1), 0)])
        .unwrap();
    let moved = points[1] + Vector3::new(0.5, 0.0, 0.0);
    let bad = map
        .add_point(moved, [0; 3], [(FrameId(0), 1), (FrameId(1), 1)])
        .unwrap();
    let behind = Point3::new(0.0, 0.0, -4.0);
    let hidden = map
        .add_point(behind, [0; 3], [(FrameId(0), 2), (FrameId(1), 2)])
        .unwrap();

    let culled = map.cull(CullThresholds::default());
    assert_eq!(culled, 2);
    assert!(map.point(good).is_some());
    assert!(map.point(bad).is_none());
    assert!(map.point(hidden).is_none());
    for frame in map.frames() {
        assert_eq!(frame.slot(1), None);
        assert_eq!(frame.slot(2), None);
    }
    map.validate().unwrap();

    // Nothing left to remove.
    assert_eq!(map.cull(CullThresholds::default()), 0);
    assert_eq!(map.point_count(), 1);
}

#[test]
fn cull_removes_stale_points() {
    let points = grid();
    let mut map = WorldMap::default();
    for id in 0..10 {
        map.add_frame(frame(id, WorldToCamera::identity(), &points))
            .unwrap();
    }
    let stale = map
        .add_point(points[0], [0; 3], [(FrameId(0), 0), (FrameId(1), 0)])
        .unwrap();
    let recent = map
        .add_point(points[1], [0; 3], [(FrameId(8), 1), (FrameId(9), 1)])
        .unwrap();
    let busy = map
        .add_point(points[2], [0; 3], [(FrameId(0), 2), (FrameId(1), 2)])
        .unwrap();
    for id in 2..5 {
        map.add_observation(busy, FrameId(id), 2).unwrap();
    }
    // Last seen exactly seven frames before frame 9.
    let boundary = map
        .add_point(points[3], [0; 3], [(FrameId(1), 3), (FrameId(2), 3)])
        .unwrap();

    let thresholds = CullThresholds::default();
    assert_eq!(thresholds.staleness, 7);
    assert_eq!(map.cull(thresholds), 1);
    assert!(map.point(stale).is_none());
    assert!(map.point(recent).is_some());
    assert!(map.point(boundary).is_some());
    // Five observations is more than the staleness rule applies to.
    assert!(map.point(busy).is_some());

    let strict = CullThresholds {
        max_observations: 5,
        staleness: 3,
        ..thresholds
    };
    assert_eq!(map.cull(strict), 2);
    assert!(map.point(busy).is_none());
    assert!(map.point(boundary).is_none());
    map.validate().unwrap();
}

#[test]
fn optimization_leaves_fixed_frames_alone() {
    let points = grid();
    let truth = shifted(-1.0);
    let mut map = two_frame_map();
    let start = WorldToCamera::from_parts(
        Vector3::new(-0.9, 0.05, 0.02),
        Rotation3::from_euler_angles(0.01, -0.02, 0.0),
    );
    // Keypoints seen from the true pose, registered with a wrong one.
    let observed = frame(2, truth, &points);
    let third = Frame::new(
        FrameId(2),
        intrinsics(),
        Features {
            keypoints: observed.keypoints().to_vec(),
            descriptors: observed.descriptors().to_vec(),
        },
        Some(start),
    )
    .unwrap();
    map.add_frame(third).unwrap();
    for (ix, &point) in points.iter().enumerate() {
        let key = map
            .add_point(point, [0; 3], [(FrameId(0), ix), (FrameId(1), ix)])
            .unwrap();
        map.add_observation(key, FrameId(2), ix).unwrap();
    }
    let before: Vec<_> = map.frames().iter().map(Frame::pose).collect();

    let error = map.optimize(&LevenbergMarquardtAdjuster::new(), Some(1), true, 20);
    assert!(error < 1e-10);

    let after: Vec<_> = map.frames().iter().map(Frame::pose).collect();
    assert_eq!(before[..2], after[..2]);
    let residual = after[2].0.translation.vector - truth.0.translation.vector;
    assert!(residual.norm() < 1e-4);
    assert_eq!(
        map.point_cloud().iter().map(|&(p, _)| p).collect::<Vec<_>>(),
        points
    );
}
