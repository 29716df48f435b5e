//! Symmetric Parameter-Exploring Policy Gradients (PEPG).
//!
//! Diagonal Gaussian search distribution, antithetic sampling, and
//! reward-normalized updates of both the mean and the per-dimension sigma.
//! Reference: Sehnke et al. 2010, "Parameter-exploring policy gradients".

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::OptimizerError;

/// Floor on sigma when normalizing the sigma-direction term.
const SIGMA_EPS: f64 = 1e-4;

/// In-place projection applied to every new mean (e.g. a box clamp).
pub type BoundFn = Box<dyn Fn(&mut [f64]) + Send + Sync>;

pub fn clamp_bound(limit: f64) -> BoundFn {
    let limit = limit.abs();
    Box::new(move |v: &mut [f64]| {
        for x in v.iter_mut() {
            *x = x.clamp(-limit, limit);
        }
    })
}

pub fn identity_bound() -> BoundFn {
    Box::new(|_: &mut [f64]| {})
}

fn all_finite(v: &[f64]) -> bool {
    v.iter().all(|x| x.is_finite())
}

// ─── Parameter distribution ───────────────────────────────────────────

/// Mean and per-dimension sigma of the search distribution.
/// The dimension is fixed at construction.
pub struct ParameterDistribution {
    mean: Vec<f64>,
    sigma: Vec<f64>,
    bound: BoundFn,
}

impl ParameterDistribution {
    pub fn new(mean: Vec<f64>, sigma: Vec<f64>, bound: BoundFn) -> Result<Self, OptimizerError> {
        if mean.is_empty() {
            return Err(OptimizerError::Configuration("distribution has zero dimensions".into()));
        }
        if mean.len() != sigma.len() {
            return Err(OptimizerError::Configuration(format!(
                "mean has {} dimensions but sigma has {}",
                mean.len(),
                sigma.len()
            )));
        }
        if !all_finite(&mean) || !sigma.iter().all(|s| s.is_finite() && *s >= 0.0) {
            return Err(OptimizerError::Configuration(
                "mean must be finite and sigma finite and non-negative".into(),
            ));
        }
        let mut dist = ParameterDistribution { mean, sigma, bound };
        (dist.bound)(&mut dist.mean);
        Ok(dist)
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn sigma(&self) -> &[f64] {
        &self.sigma
    }

    /// Replace the mean; the bound function is applied before storing.
    pub fn set_mean(&mut self, v: &[f64]) -> Result<(), OptimizerError> {
        if v.len() != self.dim() {
            return Err(OptimizerError::State(format!(
                "mean must have {} dimensions, got {}",
                self.dim(),
                v.len()
            )));
        }
        let mut v = v.to_vec();
        (self.bound)(&mut v);
        self.mean = v;
        Ok(())
    }

    pub fn set_sigma(&mut self, v: &[f64]) -> Result<(), OptimizerError> {
        if v.len() != self.dim() {
            return Err(OptimizerError::State(format!(
                "sigma must have {} dimensions, got {}",
                self.dim(),
                v.len()
            )));
        }
        if !v.iter().all(|s| s.is_finite() && *s >= 0.0) {
            return Err(OptimizerError::Configuration("sigma must be finite and non-negative".into()));
        }
        self.sigma = v.to_vec();
        Ok(())
    }

    pub fn mean_sigma(&self) -> f64 {
        self.sigma().iter().sum::<f64>() / self.dim() as f64
    }
}

// ─── Optimizer state ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    /// EMA of the mean batch reward.
    pub baseline: f64,
    /// Largest reward ever observed (starts at 0); never decreases.
    pub max_reward_seen: f64,
}

impl Default for OptimizerState {
    fn default() -> Self {
        OptimizerState { baseline: 0.0, max_reward_seen: 0.0 }
    }
}

/// Perturbations of the batch awaiting its rewards.
#[derive(Debug, Clone)]
pub struct PerturbationBatch {
    perturbations: Vec<Vec<f64>>,
}

impl PerturbationBatch {
    pub fn batch_size(&self) -> usize {
        self.perturbations.len()
    }
}

/// Serializable optimizer record: enough to resume or deploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PepgState {
    pub mean: Vec<f64>,
    pub sigma: Vec<f64>,
    pub baseline: f64,
    pub max_reward_seen: f64,
    pub learning_rate: f64,
    pub baseline_decay: f64,
    /// `None` means unbounded (JSON has no infinity).
    pub sigma_upper_bound: Option<f64>,
}

// ─── Symmetric PEPG ───────────────────────────────────────────────────

pub struct SymmetricPepg {
    dist: ParameterDistribution,
    state: OptimizerState,
    pending: Option<PerturbationBatch>,
    learning_rate: f64,
    baseline_decay: f64,
    sigma_bound_default: f64,
    rng: StdRng,
}

impl SymmetricPepg {
    pub fn new(
        dist: ParameterDistribution,
        learning_rate: f64,
        baseline_decay: f64,
        sigma_bound_default: f64,
        seed: Option<u64>,
    ) -> Result<Self, OptimizerError> {
        if !learning_rate.is_finite() {
            return Err(OptimizerError::Configuration(format!("learning rate {learning_rate}")));
        }
        if !(0.0..=1.0).contains(&baseline_decay) {
            return Err(OptimizerError::Configuration(format!("baseline decay {baseline_decay}")));
        }
        if sigma_bound_default.is_nan() {
            return Err(OptimizerError::Configuration("sigma bound is NaN".into()));
        }
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Ok(SymmetricPepg {
            dist,
            state: OptimizerState::default(),
            pending: None,
            learning_rate,
            baseline_decay,
            sigma_bound_default,
            rng,
        })
    }

    /// Zero mean, uniform sigma.
    pub fn with_dim(
        n: usize,
        init_sigma: f64,
        bound: BoundFn,
        learning_rate: f64,
        baseline_decay: f64,
        sigma_bound_default: f64,
        seed: Option<u64>,
    ) -> Result<Self, OptimizerError> {
        let dist = ParameterDistribution::new(vec![0.0; n], vec![init_sigma; n], bound)?;
        Self::new(dist, learning_rate, baseline_decay, sigma_bound_default, seed)
    }

    pub fn from_state(state: &PepgState, bound: BoundFn, seed: Option<u64>) -> Result<Self, OptimizerError> {
        let dist = ParameterDistribution::new(state.mean.clone(), state.sigma.clone(), bound)?;
        let mut opt = Self::new(
            dist,
            state.learning_rate,
            state.baseline_decay,
            state.sigma_upper_bound.unwrap_or(f64::INFINITY),
            seed,
        )?;
        if !(state.baseline.is_finite() && state.max_reward_seen.is_finite()) {
            return Err(OptimizerError::Configuration("stored baseline is not finite".into()));
        }
        opt.state = OptimizerState { baseline: state.baseline, max_reward_seen: state.max_reward_seen };
        Ok(opt)
    }

    pub fn snapshot(&self) -> PepgState {
        PepgState {
            mean: self.dist.mean().to_vec(),
            sigma: self.dist.sigma().to_vec(),
            baseline: self.state.baseline,
            max_reward_seen: self.state.max_reward_seen,
            learning_rate: self.learning_rate,
            baseline_decay: self.baseline_decay,
            sigma_upper_bound: self.sigma_bound_default.is_finite().then_some(self.sigma_bound_default),
        }
    }

    pub fn distribution_mut(&mut self) -> &mut ParameterDistribution {
        &mut self.dist
    }

    pub fn state(&self) -> OptimizerState {
        self.state
    }

    pub fn mean(&self) -> &[f64] {
        self.dist.mean()
    }

    pub fn mean_sigma(&self) -> f64 {
        self.dist.mean_sigma()
    }

    /// Drop an abandoned batch so it cannot be updated against.
    pub fn discard_pending(&mut self) -> bool {
        self.pending.take().is_some()
    }

    /// Draw `batch_size` perturbations and return the `2 * batch_size`
    /// candidates `[mean + p_0 .. mean + p_{B-1}, mean - p_0 .. mean - p_{B-1}]`.
    pub fn sample(&mut self, batch_size: usize) -> Result<Vec<Vec<f64>>, OptimizerError> {
        if batch_size == 0 {
            return Err(OptimizerError::Configuration("batch size must be at least 1".into()));
        }
        let sigma = &self.dist.sigma;
        let perturbations: Vec<Vec<f64>> = (0..batch_size)
            .map(|_| {
                sigma
                    .iter()
                    .map(|&s| s * self.rng.sample::<f64, _>(StandardNormal))
                    .collect()
            })
            .collect();

        let mean = &self.dist.mean;
        let plus = perturbations.iter().map(|p| mean.iter().zip(p).map(|(m, d)| m + d).collect());
        let minus = perturbations.iter().map(|p| mean.iter().zip(p).map(|(m, d)| m - d).collect());
        let candidates = plus.chain(minus).collect();

        self.pending = Some(PerturbationBatch { perturbations });
        Ok(candidates)
    }

    pub fn update(&mut self, rewards: &[f64]) -> Result<(), OptimizerError> {
        self.update_with_bound(rewards, self.sigma_bound_default)
    }

    /// Consume the pending batch and move the distribution toward the
    /// better half of each antithetic pair. Nothing is modified on error.
    pub fn update_with_bound(&mut self, rewards: &[f64], sigma_upper_bound: f64) -> Result<(), OptimizerError> {
        let batch = self
            .pending
            .take()
            .ok_or_else(|| OptimizerError::State("sample must precede update".into()))?;
        let b = batch.batch_size();
        if rewards.len() != 2 * b {
            return Err(OptimizerError::State(format!(
                "expected {} rewards for a batch of {b}, got {}",
                2 * b,
                rewards.len()
            )));
        }
        if !all_finite(rewards) {
            return Err(OptimizerError::NumericInstability(format!("non-finite reward in {rewards:?}")));
        }

        let n = self.dist.dim();
        let baseline = self.state.baseline;
        let max_reward = rewards.iter().copied().fold(self.state.max_reward_seen, f64::max);
        let normalized = max_reward > 0.0;

        let mut g_mean = vec![0.0; n];
        let mut g_sigma = vec![0.0; n];
        for (i, p) in batch.perturbations.iter().enumerate() {
            let (r_plus, r_minus) = (rewards[i], rewards[i + b]);
            let r_sum = r_plus + r_minus;
            let r_diff = r_plus - r_minus;
            let r_centered = r_sum / 2.0 - baseline;
            let w = if normalized { r_diff / (2.0 * max_reward - r_sum) } else { r_diff };
            for j in 0..n {
                let s = self.dist.sigma[j];
                g_mean[j] += p[j] * w;
                g_sigma[j] += (p[j] * p[j] - s * s) / s.max(SIGMA_EPS) * r_centered;
            }
        }
        if normalized {
            let scale = max_reward - baseline;
            g_sigma.iter_mut().for_each(|g| *g /= scale);
        }
        if !all_finite(&g_mean) || !all_finite(&g_sigma) {
            return Err(OptimizerError::NumericInstability(format!(
                "gradient is not finite (max reward {max_reward}, baseline {baseline})"
            )));
        }

        let lr = self.learning_rate;
        let mut mean: Vec<f64> = self.dist.mean.iter().zip(&g_mean).map(|(m, g)| m + lr * g).collect();
        (self.dist.bound)(&mut mean);
        let limit = sigma_upper_bound.abs();
        let sigma: Vec<f64> =
            self.dist.sigma.iter().zip(&g_sigma).map(|(s, g)| (s + lr * g).min(limit).max(0.0)).collect();

        let mean_reward = rewards.iter().sum::<f64>() / rewards.len() as f64;
        let gamma = self.baseline_decay;
        let new_baseline = gamma * mean_reward + (1.0 - gamma) * baseline;

        if !all_finite(&mean) || !all_finite(&sigma) || !new_baseline.is_finite() {
            return Err(OptimizerError::NumericInstability("updated distribution is not finite".into()));
        }

        self.dist.mean = mean;
        self.dist.sigma = sigma;
        self.state = OptimizerState { baseline: new_baseline, max_reward_seen: max_reward };
        tracing::debug!(
            mean_sigma = self.dist.mean_sigma(),
            baseline = new_baseline,
            max_reward = max_reward,
            "PEPG update"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pepg(n: usize, sigma: f64, seed: u64) -> SymmetricPepg {
        SymmetricPepg::with_dim(n, sigma, identity_bound(), 0.1, 0.01, f64::INFINITY, Some(seed)).unwrap()
    }

    #[test]
    fn test_sample_is_antithetic() {
        let mut opt = pepg(5, 1.0, 42);
        opt.distribution_mut().set_mean(&[0.5, -1.0, 2.0, 0.0, 3.0]).unwrap();
        for b in 1..=4 {
            let c = opt.sample(b).unwrap();
            assert_eq!(c.len(), 2 * b);
            for i in 0..b {
                for j in 0..5 {
                    let sum = c[i][j] + c[i + b][j];
                    assert!((sum - 2.0 * opt.mean()[j]).abs() < 1e-12, "pair {i} dim {j}: {sum}");
                }
            }
        }
    }

    #[test]
    fn test_sample_zero_batch_rejected() {
        let mut opt = pepg(3, 1.0, 0);
        assert!(matches!(opt.sample(0), Err(OptimizerError::Configuration(_))));
    }

    #[test]
    fn test_sigma_scales_perturbations() {
        let mut opt = pepg(2, 1.0, 7);
        opt.distribution_mut().set_sigma(&[0.0, 2.0]).unwrap();
        let c = opt.sample(200).unwrap();
        assert!(c.iter().all(|row| row[0] == 0.0));
        let var = c[..200].iter().map(|row| row[1] * row[1]).sum::<f64>() / 200.0;
        assert!((var - 4.0).abs() < 1.5, "sample variance {var}");
    }

    #[test]
    fn test_update_without_sample() {
        let mut opt = pepg(3, 1.0, 0);
        let err = opt.update(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, OptimizerError::State(_)));
    }

    #[test]
    fn test_update_wrong_length_consumes_batch() {
        let mut opt = pepg(3, 1.0, 0);
        opt.sample(2).unwrap();
        assert!(matches!(opt.update(&[1.0, 2.0, 3.0]), Err(OptimizerError::State(_))));
        // the stale batch is gone
        assert!(!opt.discard_pending());
        assert!(matches!(opt.update(&[1.0, 2.0, 3.0, 4.0]), Err(OptimizerError::State(_))));
    }

    #[test]
    fn test_baseline_ema() {
        let mut opt = pepg(3, 1.0, 1);
        opt.sample(2).unwrap();
        opt.update(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(opt.state().baseline, 0.01 * 2.5 + (1.0 - 0.01) * 0.0);
        assert!((opt.state().baseline - 0.025).abs() < 1e-15);
    }

    #[test]
    fn test_max_reward_non_decreasing() {
        let mut opt = pepg(4, 0.5, 3);
        let batches = [[3.0, -1.0], [-5.0, 1.0], [2.0, 2.5], [-10.0, -10.0]];
        let mut last = opt.state().max_reward_seen;
        for r in batches {
            opt.sample(1).unwrap();
            opt.update(&r).unwrap();
            let now = opt.state().max_reward_seen;
            assert!(now >= last, "{now} < {last}");
            last = now;
        }
        assert_eq!(last, 3.0);
    }

    #[test]
    fn test_sigma_clamped_to_abs_bound() {
        for bound in [0.3, -0.3, 5.0, -5.0, 0.0] {
            let mut opt = pepg(6, 1.0, 11);
            for k in 0..5 {
                opt.sample(3).unwrap();
                let rewards: Vec<f64> = (0..6).map(|i| ((i * 7 + k) % 5) as f64 - 2.0).collect();
                opt.update_with_bound(&rewards, bound).unwrap();
                for s in &opt.snapshot().sigma {
                    assert!(*s >= 0.0 && *s <= bound.abs(), "sigma {s} outside [0, |{bound}|]");
                }
            }
        }
    }

    #[test]
    fn test_zero_sigma_keeps_optimum() {
        // f(p) = -|p|^2 is already maximal at the origin
        let mut opt = pepg(2, 1.0, 5);
        opt.distribution_mut().set_sigma(&[0.0, 0.0]).unwrap();
        let candidates = opt.sample(1).unwrap();
        let rewards: Vec<f64> = candidates.iter().map(|p| -p.iter().map(|x| x * x).sum::<f64>()).collect();
        opt.update(&rewards).unwrap();
        assert_eq!(opt.mean(), &[0.0, 0.0]);
        assert_eq!(opt.state().baseline, 0.0);
    }

    #[test]
    fn test_mean_moves_toward_better_candidate() {
        let mut opt = pepg(1, 1.0, 9);
        let c = opt.sample(1).unwrap();
        let p = c[0][0];
        // reward the + side only
        opt.update(&[1.0, 0.0]).unwrap();
        assert!(opt.mean()[0] * p > 0.0, "mean {} should follow perturbation {p}", opt.mean()[0]);
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_update_values_without_positive_reward() {
        // max reward seen stays 0, so the raw reward difference drives the mean
        let mut opt = pepg(1, 1.0, 21);
        let p = opt.sample(1).unwrap()[0][0];
        opt.update(&[-1.0, -3.0]).unwrap();

        let (r_diff, r_centered) = (2.0, -2.0);
        let expected_mean = 0.1 * p * r_diff;
        let expected_sigma = (1.0 + 0.1 * (p * p - 1.0) / 1.0 * r_centered).max(0.0);
        let state = opt.snapshot();
        assert!(close(state.mean[0], expected_mean), "mean {} vs {expected_mean}", state.mean[0]);
        assert!(close(state.sigma[0], expected_sigma), "sigma {} vs {expected_sigma}", state.sigma[0]);
        assert_eq!(state.max_reward_seen, 0.0);
        assert!(close(state.baseline, 0.01 * -2.0));
    }

    #[test]
    fn test_update_values_with_positive_reward() {
        let mut opt = pepg(1, 1.0, 22);
        opt.distribution_mut().set_sigma(&[0.5]).unwrap();
        let p = opt.sample(1).unwrap()[0][0];
        opt.update(&[3.0, 1.0]).unwrap();

        // w = r_diff / (2 max - r_sum), sigma term scaled by 1 / (max - baseline)
        let w = 2.0 / (2.0 * 3.0 - 4.0);
        let mean = 0.1 * p * w;
        let sigma = 0.5 + 0.1 * (p * p - 0.25) / 0.5 * 2.0 / 3.0;
        let state = opt.snapshot();
        assert!(close(state.mean[0], mean), "mean {} vs {mean}", state.mean[0]);
        assert!(close(state.sigma[0], sigma), "sigma {} vs {sigma}", state.sigma[0]);
        assert_eq!(state.max_reward_seen, 3.0);
        assert!(close(state.baseline, 0.02));

        // second batch: the normalizers use the running max and the new baseline
        let q = opt.sample(1).unwrap()[0][0] - mean;
        opt.update(&[2.0, 0.5]).unwrap();
        let baseline = 0.02;
        let w = 1.5 / (2.0 * 3.0 - 2.5);
        let r_centered = 1.25 - baseline;
        let next_mean = mean + 0.1 * q * w;
        let next_sigma = sigma + 0.1 * (q * q - sigma * sigma) / sigma * r_centered / (3.0 - baseline);
        let state = opt.snapshot();
        assert!(close(state.mean[0], next_mean), "mean {} vs {next_mean}", state.mean[0]);
        assert!(close(state.sigma[0], next_sigma), "sigma {} vs {next_sigma}", state.sigma[0]);
        assert_eq!(state.max_reward_seen, 3.0);
    }

    #[test]
    fn test_mean_sigma_averages_sigma() {
        let mut opt = pepg(4, 1.0, 0);
        opt.distribution_mut().set_sigma(&[0.5, 1.5, 0.0, 2.0]).unwrap();
        assert_eq!(opt.mean_sigma(), 1.0);
        assert_eq!(opt.snapshot().sigma, vec![0.5, 1.5, 0.0, 2.0]);
    }

    #[test]
    fn test_non_finite_update_is_rejected() {
        let mut opt = pepg(2, 1.0, 2);
        opt.sample(1).unwrap();
        let before = opt.snapshot();
        assert!(matches!(opt.update(&[f64::NAN, 0.0]), Err(OptimizerError::NumericInstability(_))));
        assert_eq!(opt.snapshot(), before);

        // r+ = r- = max makes the normalizer 2*max - r_sum zero
        opt.sample(1).unwrap();
        opt.update(&[2.0, 1.0]).unwrap();
        let before = opt.snapshot();
        opt.sample(1).unwrap();
        assert!(matches!(opt.update(&[2.0, 2.0]), Err(OptimizerError::NumericInstability(_))));
        assert_eq!(opt.snapshot(), before);
    }

    #[test]
    fn test_bound_applied_to_mean() {
        let mut opt =
            SymmetricPepg::with_dim(2, 1.0, clamp_bound(0.5), 10.0, 0.01, f64::INFINITY, Some(4)).unwrap();
        opt.distribution_mut().set_mean(&[3.0, -3.0]).unwrap();
        assert_eq!(opt.mean(), &[0.5, -0.5]);
        for _ in 0..3 {
            opt.sample(2).unwrap();
            opt.update(&[4.0, -1.0, 0.5, 2.0]).unwrap();
            assert!(opt.mean().iter().all(|m| m.abs() <= 0.5));
        }
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut opt = pepg(3, 1.0, 8);
        opt.sample(2).unwrap();
        opt.update(&[1.0, 0.5, -0.5, 2.0]).unwrap();
        let state = opt.snapshot();
        assert_eq!(state.sigma_upper_bound, None);

        let json = serde_json::to_string(&state).unwrap();
        let back: PepgState = serde_json::from_str(&json).unwrap();
        let mut restored = SymmetricPepg::from_state(&back, identity_bound(), Some(1)).unwrap();
        assert_eq!(restored.mean(), opt.mean());
        assert_eq!(restored.state(), opt.state());
        assert!(!restored.discard_pending());
    }

    #[test]
    fn test_distribution_dimension_checks() {
        assert!(ParameterDistribution::new(vec![0.0; 3], vec![1.0; 2], identity_bound()).is_err());
        assert!(ParameterDistribution::new(vec![], vec![], identity_bound()).is_err());
        assert!(ParameterDistribution::new(vec![0.0], vec![-1.0], identity_bound()).is_err());
        let mut d = ParameterDistribution::new(vec![0.0; 3], vec![1.0; 3], identity_bound()).unwrap();
        assert!(matches!(d.set_mean(&[1.0]), Err(OptimizerError::State(_))));
        assert_eq!(d.dim(), 3);
    }
}
