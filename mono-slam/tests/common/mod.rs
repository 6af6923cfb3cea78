#![allow(dead_code)]

use cv_core::{
    nalgebra::{IsometryMatrix3, Point2, Point3, Rotation3, Translation3, Vector3},
    WorldToCamera,
};
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use mono_slam::{
    CameraIntrinsics, Descriptor, FeatureExtractor, Features, LevenbergMarquardtAdjuster,
    SlamSettings, TrackingPipeline,
};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;
pub const FOCAL: f64 = 500.0;

/// The distance the camera moves between two consecutive frames.
pub fn step() -> Vector3<f64> {
    Vector3::new(0.25, 0.02, 0.0)
}

pub fn intrinsics() -> CameraIntrinsics {
    CameraIntrinsics::from_focal(
        FOCAL,
        Point2::new(WIDTH as f64 / 2.0, HEIGHT as f64 / 2.0),
    )
    .unwrap()
}

/// Random points in front of a camera that slides sideways and slowly turns.
pub struct Scene {
    pub points: Vec<Point3<f64>>,
    pub descriptors: Vec<Descriptor>,
}

impl Scene {
    pub fn new(count: usize, seed: u64) -> Self {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let points = (0..count)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-4.0..6.0),
                    rng.gen_range(-3.0..3.0),
                    rng.gen_range(5.0..10.0),
                )
            })
            .collect();
        let descriptors = (0..count)
            .map(|_| {
                let mut bytes = [0u8; 64];
                rng.fill(&mut bytes[..]);
                Descriptor::new(bytes)
            })
            .collect();
        Self {
            points,
            descriptors,
        }
    }

    /// The true pose of frame `k`. Frame 0 is the world origin.
    pub fn pose(k: usize) -> WorldToCamera {
        let rotation = Rotation3::from_axis_angle(&Vector3::y_axis(), -0.01 * k as f64);
        let center = step() * k as f64;
        WorldToCamera(IsometryMatrix3::from_parts(
            Translation3::from(-(rotation * center)),
            rotation,
        ))
    }

    /// The keypoints of every visible point, skipping points for which `skip` is true.
    ///
    /// Returns the features and the scene index of each keypoint.
    pub fn observe(&self, k: usize, skip: impl Fn(usize) -> bool) -> (Features, Vec<usize>) {
        let pose = Self::pose(k);
        let intrinsics = intrinsics();
        let mut features = Features::default();
        let mut ids = vec![];
        for (ix, (&point, descriptor)) in self.points.iter().zip(&self.descriptors).enumerate() {
            if skip(ix) {
                continue;
            }
            let pixel = match intrinsics.project(pose.0 * point) {
                Some(pixel) => pixel,
                None => continue,
            };
            let margin = 10.0;
            if pixel.x < margin
                || pixel.y < margin
                || pixel.x > WIDTH as f64 - margin
                || pixel.y > HEIGHT as f64 - margin
            {
                continue;
            }
            features.keypoints.push(pixel);
            features.descriptors.push(*descriptor);
            ids.push(ix);
        }
        (features, ids)
    }
}

/// Returns preset features for each image, selected by the red channel of the first pixel.
pub struct ScriptedExtractor {
    pub frames: Vec<Features>,
}

impl FeatureExtractor for ScriptedExtractor {
    fn extract(&self, image: &DynamicImage) -> Features {
        let k = image.get_pixel(0, 0)[0] as usize;
        self.frames.get(k).cloned().unwrap_or_default()
    }
}

/// A flat image that makes [`ScriptedExtractor`] return its `k`th features.
pub fn image(k: usize) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([k as u8, 128, 64])))
}

pub fn pipeline(frames: Vec<Features>) -> TrackingPipeline<ScriptedExtractor> {
    pipeline_with(frames, SlamSettings::default())
}

pub fn pipeline_with(
    frames: Vec<Features>,
    settings: SlamSettings,
) -> TrackingPipeline<ScriptedExtractor> {
    TrackingPipeline::new(
        WIDTH,
        HEIGHT,
        intrinsics(),
        ScriptedExtractor { frames },
        LevenbergMarquardtAdjuster::new(),
        settings,
    )
}

/// Angle in degrees between two vectors.
pub fn angle(a: Vector3<f64>, b: Vector3<f64>) -> f64 {
    a.angle(&b).to_degrees()
}

pub fn init_logger() {
    let _ = pretty_env_logger::try_init_timed();
}
