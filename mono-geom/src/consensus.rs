use cv_core::sample_consensus::{Consensus, Estimator, Model};
use rand::{seq::index::sample, Rng};

/// Random sample consensus with a bounded number of trials.
///
/// Each trial draws `E::MIN_SAMPLES` data points, estimates models from them, and counts
/// the data whose residual is below the threshold. The model with the most inliers wins.
/// After the trials the winner is re-estimated from all of its inliers, and that refit
/// is kept if it has at least as many inliers.
#[derive(Debug, Clone)]
pub struct Ransac<R> {
    threshold: f64,
    max_trials: usize,
    min_inliers: usize,
    rng: R,
}

impl<R> Ransac<R>
where
    R: Rng,
{
    /// Defaults to `100` trials and `8` minimum inliers.
    pub fn new(threshold: f64, rng: R) -> Self {
        Self {
            threshold,
            max_trials: 100,
            min_inliers: 8,
            rng,
        }
    }

    /// Set the residual below which a datum is an inlier.
    #[must_use]
    pub fn threshold(self, threshold: f64) -> Self {
        Self { threshold, ..self }
    }

    /// Set the number of minimal samples drawn.
    #[must_use]
    pub fn max_trials(self, max_trials: usize) -> Self {
        Self { max_trials, ..self }
    }

    /// Set the inlier count a model needs to be returned at all.
    #[must_use]
    pub fn min_inliers(self, min_inliers: usize) -> Self {
        Self {
            min_inliers,
            ..self
        }
    }

    fn inliers<M, Data>(&self, model: &M, data: &[Data]) -> Vec<usize>
    where
        M: Model<Data>,
    {
        data.iter()
            .enumerate()
            .filter(|(_, datum)| model.residual(datum) < self.threshold)
            .map(|(ix, _)| ix)
            .collect()
    }
}

impl<E, Data, R> Consensus<E, Data> for Ransac<R>
where
    E: Estimator<Data>,
    Data: Clone,
    R: Rng,
{
    type Inliers = Vec<usize>;

    fn model<I>(&mut self, estimator: &E, data: I) -> Option<E::Model>
    where
        I: Iterator<Item = Data> + Clone,
    {
        self.model_inliers(estimator, data).map(|(model, _)| model)
    }

    fn model_inliers<I>(&mut self, estimator: &E, data: I) -> Option<(E::Model, Self::Inliers)>
    where
        I: Iterator<Item = Data> + Clone,
    {
        let data: Vec<Data> = data.collect();
        if data.len() < E::MIN_SAMPLES {
            return None;
        }
        let mut best: Option<(E::Model, Vec<usize>)> = None;
        for _ in 0..self.max_trials {
            let indices = sample(&mut self.rng, data.len(), E::MIN_SAMPLES);
            let samples = indices.iter().map(|ix| data[ix].clone()).collect::<Vec<_>>();
            for model in estimator.estimate(samples.into_iter()) {
                let inliers = self.inliers(&model, &data);
                if best
                    .as_ref()
                    .map_or(true, |(_, best_inliers)| inliers.len() > best_inliers.len())
                {
                    best = Some((model, inliers));
                }
            }
        }
        let (model, inliers) = best?;
        if inliers.len() < self.min_inliers.max(E::MIN_SAMPLES) {
            return None;
        }
        let refit = estimator
            .estimate(
                inliers
                    .iter()
                    .map(|&ix| data[ix].clone())
                    .collect::<Vec<_>>()
                    .into_iter(),
            )
            .into_iter()
            .map(|model| {
                let inliers = self.inliers(&model, &data);
                (model, inliers)
            })
            .max_by_key(|(_, inliers)| inliers.len());
        match refit {
            Some((refit, refit_inliers)) if refit_inliers.len() >= inliers.len() => {
                Some((refit, refit_inliers))
            }
            _ => Some((model, inliers)),
        }
    }
}
