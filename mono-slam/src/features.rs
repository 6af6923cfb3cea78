use crate::SlamSettings;
use akaze::Akaze;
use bitarray::BitArray;
use cv_core::nalgebra::Point2;
use float_ord::FloatOrd;
use image::{DynamicImage, GrayImage};
use imageproc::{corners::corners_fast9, filter::gaussian_blur_f32};
use log::*;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use thiserror::Error;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A 512-bit binary descriptor compared by Hamming distance.
pub type Descriptor = BitArray<64>;

/// The keypoints found in one image and their descriptors, in the same order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Features {
    pub keypoints: Vec<Point2<f64>>,
    pub descriptors: Vec<Descriptor>,
}

impl Features {
    /// Runs `extractor` on the image once.
    pub fn extract(extractor: &impl FeatureExtractor, image: &DynamicImage) -> Self {
        extractor.extract(image)
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Finds keypoints in an image and describes them.
pub trait FeatureExtractor {
    /// The returned keypoints are in pixel coordinates.
    fn extract(&self, image: &DynamicImage) -> Features;
}

impl<T> FeatureExtractor for &T
where
    T: FeatureExtractor + ?Sized,
{
    fn extract(&self, image: &DynamicImage) -> Features {
        (**self).extract(image)
    }
}

impl FeatureExtractor for Akaze {
    fn extract(&self, image: &DynamicImage) -> Features {
        let (keypoints, descriptors) = Akaze::extract(self, image);
        Features {
            keypoints: keypoints
                .iter()
                .map(|kp| Point2::new(kp.point.0 as f64, kp.point.1 as f64))
                .collect(),
            descriptors,
        }
    }
}

/// Selects one of the built-in extractors by name.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorKind {
    Akaze,
    Brief,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown feature extractor {0:?}, expected AKAZE or BRIEF")]
pub struct UnknownExtractor(pub String);

impl core::str::FromStr for ExtractorKind {
    type Err = UnknownExtractor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AKAZE" => Ok(Self::Akaze),
            // ORB is FAST corners with binary intensity tests, which is what BRIEF provides here.
            "BRIEF" | "ORB" => Ok(Self::Brief),
            _ => Err(UnknownExtractor(s.to_owned())),
        }
    }
}

/// The closed set of extractors the tracker can be configured with.
#[derive(Debug, Clone)]
pub enum Extractor {
    Akaze(Akaze),
    Brief(Brief),
}

impl Extractor {
    pub fn from_settings(settings: &SlamSettings) -> Self {
        match settings.extractor {
            ExtractorKind::Akaze => Self::Akaze(Akaze::new(settings.akaze_threshold)),
            ExtractorKind::Brief => Self::Brief(
                Brief::new(settings.rng_seed)
                    .fast_threshold(settings.brief_fast_threshold)
                    .max_features(settings.brief_max_features)
                    .min_distance(settings.brief_min_distance),
            ),
        }
    }
}

impl FeatureExtractor for Extractor {
    fn extract(&self, image: &DynamicImage) -> Features {
        let features = match self {
            Self::Akaze(akaze) => FeatureExtractor::extract(akaze, image),
            Self::Brief(brief) => brief.extract(image),
        };
        debug!("extracted {} features", features.len());
        features
    }
}

/// Half the side of the square patch sampled around a corner.
const PATCH_RADIUS: i32 = 15;
const DESCRIPTOR_BITS: usize = 512;

/// FAST-9 corners described by 512 pairwise intensity comparisons on a smoothed image.
///
/// The comparison pattern is drawn once from a seed, so descriptors from two extractors
/// built with the same seed can be compared.
#[derive(Debug, Clone)]
pub struct Brief {
    fast_threshold: u8,
    max_features: usize,
    min_distance: f64,
    sigma: f32,
    pattern: Vec<[(i32, i32); 2]>,
}

impl Brief {
    pub fn new(seed: u64) -> Self {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let mut offset = || {
            (
                rng.gen_range(-PATCH_RADIUS..=PATCH_RADIUS),
                rng.gen_range(-PATCH_RADIUS..=PATCH_RADIUS),
            )
        };
        let pattern = (0..DESCRIPTOR_BITS)
            .map(|_| [offset(), offset()])
            .collect();
        Self {
            fast_threshold: 20,
            max_features: 1000,
            min_distance: 7.0,
            sigma: 2.0,
            pattern,
        }
    }

    #[must_use]
    pub fn fast_threshold(self, fast_threshold: u8) -> Self {
        Self {
            fast_threshold,
            ..self
        }
    }

    #[must_use]
    pub fn max_features(self, max_features: usize) -> Self {
        Self {
            max_features,
            ..self
        }
    }

    #[must_use]
    pub fn min_distance(self, min_distance: f64) -> Self {
        Self {
            min_distance,
            ..self
        }
    }

    /// Strongest corners first, skipping any closer than `min_distance` to one already kept.
    fn corners(&self, gray: &GrayImage) -> Vec<Point2<f64>> {
        let (width, height) = gray.dimensions();
        let border = PATCH_RADIUS as u32 + 1;
        let mut corners = corners_fast9(gray, self.fast_threshold);
        corners.retain(|c| {
            c.x >= border && c.y >= border && c.x + border < width && c.y + border < height
        });
        corners.sort_unstable_by_key(|c| core::cmp::Reverse(FloatOrd(c.score)));

        let cell = self.min_distance.max(1.0);
        let columns = (width as f64 / cell).ceil() as usize + 1;
        let rows = (height as f64 / cell).ceil() as usize + 1;
        let mut grid: Vec<Vec<Point2<f64>>> = vec![vec![]; columns * rows];
        let mut kept = vec![];
        for corner in corners {
            if kept.len() >= self.max_features {
                break;
            }
            let point = Point2::new(corner.x as f64, corner.y as f64);
            let cx = (point.x / cell) as usize;
            let cy = (point.y / cell) as usize;
            let crowded = (cy.saturating_sub(1)..=(cy + 1).min(rows - 1)).any(|y| {
                (cx.saturating_sub(1)..=(cx + 1).min(columns - 1)).any(|x| {
                    grid[y * columns + x]
                        .iter()
                        .any(|other| (other - point).norm() < self.min_distance)
                })
            });
            if !crowded {
                grid[cy * columns + cx].push(point);
                kept.push(point);
            }
        }
        kept
    }

    fn describe(&self, smoothed: &GrayImage, corner: Point2<f64>) -> Descriptor {
        let (x, y) = (corner.x as i32, corner.y as i32);
        let sample = |(dx, dy): (i32, i32)| smoothed.get_pixel((x + dx) as u32, (y + dy) as u32)[0];
        let mut bytes = [0u8; 64];
        for (bit, &[a, b]) in self.pattern.iter().enumerate() {
            if sample(a) < sample(b) {
                bytes[bit / 8] |= 1 << (bit % 8);
            }
        }
        BitArray::new(bytes)
    }
}

impl FeatureExtractor for Brief {
    fn extract(&self, image: &DynamicImage) -> Features {
        let gray = image.to_luma8();
        let keypoints = self.corners(&gray);
        let smoothed = gaussian_blur_f32(&gray, self.sigma);
        let descriptors = keypoints
            .iter()
            .map(|&corner| self.describe(&smoothed, corner))
            .collect();
        Features {
            keypoints,
            descriptors,
        }
    }
}
