use crate::{DegenerateGeometry, Descriptor, Frame, Result, SlamError, SlamSettings};
use cv_core::{sample_consensus::Consensus, CameraToCamera};
use float_ord::FloatOrd;
use log::*;
use mono_geom::{EightPoint, EssentialMatrix, NormalizedMatch, Ransac};
use rand::Rng;

/// The outcome of matching the current frame against the previous one.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMatch {
    /// Bijective `(current keypoint, previous keypoint)` pairs consistent with `relative`.
    pub matches: Vec<(usize, usize)>,
    /// Maps points in the previous camera into the current camera. The translation has unit length.
    pub relative: CameraToCamera,
    /// Satisfies `currentᵀ E previous = 0` for the normalized keypoints of each match.
    pub essential: EssentialMatrix,
    /// How many descriptor matches survived the ratio test and bijectivity.
    pub candidates: usize,
}

/// Matches descriptors between two frames and estimates their relative pose.
#[derive(Debug, Clone)]
pub struct FrameMatcher<R> {
    lowes_ratio: f64,
    distance_ceiling: u32,
    minimum_matches: usize,
    minimum_parallax: f64,
    probe_points: usize,
    consensus: Ransac<R>,
    estimator: EightPoint,
}

impl<R> FrameMatcher<R>
where
    R: Rng,
{
    pub fn new(settings: &SlamSettings, rng: R) -> Self {
        Self {
            lowes_ratio: settings.lowes_ratio,
            distance_ceiling: settings.match_distance_ceiling,
            minimum_matches: settings.minimum_matches,
            minimum_parallax: settings.minimum_parallax,
            probe_points: settings.cheirality_probe_points,
            consensus: Ransac::new(settings.consensus_threshold, rng)
                .max_trials(settings.consensus_max_trials)
                .min_inliers(settings.consensus_minimum_inliers),
            estimator: EightPoint::new(),
        }
    }

    /// Ratio-tested nearest neighbor matches from `current` into `previous`.
    ///
    /// For each descriptor in `current` the two closest descriptors in `previous` are found.
    /// The closest is kept if it is closer than `lowes_ratio` times the second closest and
    /// under the distance ceiling. Matches are then taken in order, and any match reusing an
    /// index on either side that an earlier match already took is dropped.
    pub fn match_descriptors(
        &self,
        current: &[Descriptor],
        previous: &[Descriptor],
    ) -> Vec<(usize, usize)> {
        let mut used_current = vec![false; current.len()];
        let mut used_previous = vec![false; previous.len()];
        current
            .iter()
            .enumerate()
            .filter_map(|(ix, descriptor)| {
                let [best, second] = two_nearest(descriptor, previous);
                let (best_ix, best_distance) = best?;
                let ratio_ok = second.map_or(true, |(_, second_distance)| {
                    (best_distance as f64) < self.lowes_ratio * second_distance as f64
                });
                if ratio_ok && best_distance < self.distance_ceiling {
                    Some((ix, best_ix))
                } else {
                    None
                }
            })
            .filter(|&(a, b)| {
                if used_current[a] || used_previous[b] {
                    false
                } else {
                    used_current[a] = true;
                    used_previous[b] = true;
                    true
                }
            })
            .collect()
    }

    /// Matches `current` against `previous` and recovers the relative pose.
    ///
    /// Fails with [`SlamError::InsufficientMatches`] if too few descriptors match, and with
    /// [`SlamError::DegenerateGeometry`] if the matches barely move, no essential matrix has
    /// enough support, or no pose puts the matched points in front of both cameras.
    pub fn match_frames(&mut self, current: &Frame, previous: &Frame) -> Result<FrameMatch> {
        let candidates = self.match_descriptors(current.descriptors(), previous.descriptors());
        debug!("found {} candidate matches", candidates.len());
        if candidates.len() < self.minimum_matches {
            return Err(SlamError::InsufficientMatches {
                found: candidates.len(),
                required: self.minimum_matches,
            });
        }

        let normalized: Vec<NormalizedMatch> = candidates
            .iter()
            .map(|&(c, p)| NormalizedMatch(previous.normalized()[p], current.normalized()[c]))
            .collect();

        let parallax = median_parallax(&normalized);
        debug!("median parallax {}", parallax);
        if parallax < self.minimum_parallax {
            return Err(DegenerateGeometry::InsufficientParallax.into());
        }

        let (essential, inliers) = self
            .consensus
            .model_inliers(&self.estimator, normalized.iter().copied())
            .ok_or(DegenerateGeometry::NoConsensus)?;
        debug!(
            "essential matrix has {} inliers out of {} matches",
            inliers.len(),
            normalized.len()
        );

        let relative = essential
            .solve_pose(
                inliers
                    .iter()
                    .take(self.probe_points)
                    .map(|&ix| normalized[ix]),
            )
            .ok_or(DegenerateGeometry::NoCheiralSolution)?;

        Ok(FrameMatch {
            matches: inliers.iter().map(|&ix| candidates[ix]).collect(),
            relative,
            essential,
            candidates: candidates.len(),
        })
    }
}

/// The closest and second closest descriptors by Hamming distance.
fn two_nearest(descriptor: &Descriptor, others: &[Descriptor]) -> [Option<(usize, u32)>; 2] {
    let mut nearest: [Option<(usize, u32)>; 2] = [None, None];
    for (ix, other) in others.iter().enumerate() {
        let distance = descriptor.distance(other);
        match nearest {
            [None, _] => nearest[0] = Some((ix, distance)),
            [Some((_, best)), _] if distance < best => {
                nearest[1] = nearest[0];
                nearest[0] = Some((ix, distance));
            }
            [_, None] => nearest[1] = Some((ix, distance)),
            [_, Some((_, second))] if distance < second => nearest[1] = Some((ix, distance)),
            _ => {}
        }
    }
    nearest
}

/// Median distance moved by the matched normalized keypoints.
fn median_parallax(matches: &[NormalizedMatch]) -> f64 {
    let mut distances: Vec<f64> = matches
        .iter()
        .map(|&NormalizedMatch(a, b)| (b - a).norm())
        .collect();
    if distances.is_empty() {
        return 0.0;
    }
    let middle = distances.len() / 2;
    let (_, median, _) = distances.select_nth_unstable_by_key(middle, |&d| FloatOrd(d));
    *median
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::nalgebra::Point2;
    use rand_xoshiro::{rand_core::SeedableRng, Xoshiro256PlusPlus};

    fn descriptor(byte: u8, flipped: usize) -> Descriptor {
        let mut bytes = [byte; 64];
        for bit in 0..flipped {
            bytes[bit / 8] ^= 1 << (bit % 8);
        }
        Descriptor::new(bytes)
    }

    fn matcher() -> FrameMatcher<Xoshiro256PlusPlus> {
        FrameMatcher::new(&SlamSettings::default(), Xoshiro256PlusPlus::seed_from_u64(0))
    }

    #[test]
    fn two_nearest_orders_by_distance() {
        let query = descriptor(0, 0);
        let others = [descriptor(0, 9), descriptor(0, 2), descriptor(0, 40), descriptor(0, 5)];
        assert_eq!(two_nearest(&query, &others), [Some((1, 2)), Some((3, 5))]);
        assert_eq!(two_nearest(&query, &others[..1]), [Some((0, 9)), None]);
        assert_eq!(two_nearest(&query, &[]), [None, None]);
    }

    #[test]
    fn ratio_test_and_ceiling() {
        let matcher = matcher();
        let previous = [descriptor(0x00, 0), descriptor(0xff, 0), descriptor(0x00, 20)];
        let current = [
            // Close match with a distant runner up.
            descriptor(0x00, 3),
            // Equally close to the first and third.
            descriptor(0x00, 10),
            // Too far from everything.
            descriptor(0xf0, 0),
        ];
        let matches = matcher.match_descriptors(&current, &previous);
        assert_eq!(matches, vec![(0, 0)]);
    }

    #[test]
    fn matches_are_bijective() {
        let matcher = matcher();
        let previous = [descriptor(0x00, 0), descriptor(0xff, 0)];
        let current = [descriptor(0x00, 1), descriptor(0x00, 2), descriptor(0xff, 3)];
        let matches = matcher.match_descriptors(&current, &previous);
        assert_eq!(matches, vec![(0, 0), (2, 1)]);
    }

    #[test]
    fn random_near_duplicates_stay_bijective() {
        use rand::Rng;
        use std::collections::HashSet;

        let matcher = matcher();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        let mut total = 0;
        for _ in 0..200 {
            let bases: Vec<[u8; 64]> = (0..8)
                .map(|_| {
                    let mut bytes = [0u8; 64];
                    rng.fill(&mut bytes[..]);
                    bytes
                })
                .collect();
            let noisy = |rng: &mut Xoshiro256PlusPlus| {
                let mut bytes = bases[rng.gen_range(0..bases.len())];
                for _ in 0..rng.gen_range(0..6) {
                    let bit = rng.gen_range(0..512);
                    bytes[bit / 8] ^= 1 << (bit % 8);
                }
                Descriptor::new(bytes)
            };
            let previous: Vec<Descriptor> = (0..12).map(|_| noisy(&mut rng)).collect();
            let current: Vec<Descriptor> = (0..12).map(|_| noisy(&mut rng)).collect();

            let matches = matcher.match_descriptors(&current, &previous);
            let current_ixs: HashSet<usize> = matches.iter().map(|&(c, _)| c).collect();
            let previous_ixs: HashSet<usize> = matches.iter().map(|&(_, p)| p).collect();
            assert_eq!(current_ixs.len(), matches.len());
            assert_eq!(previous_ixs.len(), matches.len());
            for &(c, p) in &matches {
                assert!(current[c].distance(&previous[p]) < 32);
            }
            total += matches.len();
        }
        assert!(total > 0);
    }

    #[test]
    fn median_of_displacements() {
        let matches = [0.0, 3.0, 1.0]
            .iter()
            .map(|&d| NormalizedMatch(Point2::origin(), Point2::new(d, 0.0)))
            .collect::<Vec<_>>();
        assert_eq!(median_parallax(&matches), 1.0);
        assert_eq!(median_parallax(&[]), 0.0);
    }
}
