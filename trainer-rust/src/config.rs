use std::f64::consts::PI;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use caterpillar_sim::CaterpillarConfig;
use serde::{Deserialize, Serialize};

use crate::error::OptimizerError;
use crate::experiments::dispatch::DivergencePolicy;
use crate::experiments::env::Topology;
use crate::experiments::rollout::RewardShaping;

/// Everything a training run needs. Loaded once at startup: defaults,
/// then an optional JSON file, then command-line overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub episodes: usize,
    pub steps: usize,
    pub time_delta: f64,
    pub default_sample_steps: usize,
    pub init_sigma: f64,
    /// Mean sigma below which the run is reported as converged.
    pub converged_sigma: f64,
    pub sigma_upper_bound: f64,
    pub learning_rate: f64,
    /// EMA weight of the newest batch in the reward baseline.
    pub baseline_decay: f64,
    /// Policy parameters are clamped to `[-b, b]`; `None` leaves them free.
    pub param_bound: Option<f64>,
    pub reward_shaping: RewardShaping,
    pub tension_divisor: f64,
    pub divergence: DivergencePolicy,
    pub rollout_timeout_secs: Option<f64>,
    pub workers: usize,
    pub seed: Option<u64>,
    pub policy: String,
    pub somites: usize,
    pub oscillator_ids: Vec<usize>,
    /// Force channels zeroed before policy inference.
    pub disabled_channels: Vec<usize>,
    pub caterpillar: CaterpillarConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            batch_size: 8,
            episodes: 500,
            steps: 2000,
            time_delta: 0.01,
            default_sample_steps: 10000,
            init_sigma: 1.0,
            converged_sigma: 0.01,
            sigma_upper_bound: 10.0,
            learning_rate: 0.1,
            baseline_decay: 0.01,
            param_bound: Some(PI),
            reward_shaping: RewardShaping::Displacement,
            tension_divisor: 8000.0,
            divergence: DivergencePolicy::Abort,
            rollout_timeout_secs: None,
            workers: 8,
            seed: None,
            policy: "linear".to_string(),
            somites: 8,
            oscillator_ids: vec![1, 2, 3, 4, 5, 6],
            disabled_channels: Vec::new(),
            caterpillar: CaterpillarConfig::default(),
        }
    }
}

impl TrainConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn topology(&self) -> Topology {
        Topology {
            somites: self.somites,
            oscillator_ids: self.oscillator_ids.clone(),
            caterpillar: self.caterpillar.clone(),
        }
    }

    /// Reject settings that would fail later in the run.
    pub fn validate(&self) -> std::result::Result<(), OptimizerError> {
        let bad = |msg: String| Err(OptimizerError::Configuration(msg));
        if self.batch_size == 0 {
            return bad("batch_size must be at least 1".into());
        }
        if self.workers == 0 {
            return bad("workers must be at least 1".into());
        }
        if !(self.time_delta.is_finite() && self.time_delta > 0.0) {
            return bad(format!("time_delta must be positive, got {}", self.time_delta));
        }
        if !(self.init_sigma.is_finite() && self.init_sigma >= 0.0) {
            return bad(format!("init_sigma must be non-negative, got {}", self.init_sigma));
        }
        if self.sigma_upper_bound.is_nan() {
            return bad("sigma_upper_bound is NaN".into());
        }
        if !self.learning_rate.is_finite() {
            return bad(format!("learning_rate must be finite, got {}", self.learning_rate));
        }
        if !(0.0..=1.0).contains(&self.baseline_decay) {
            return bad(format!("baseline_decay must lie in [0, 1], got {}", self.baseline_decay));
        }
        if let Some(b) = self.param_bound {
            if !(b > 0.0) {
                return bad(format!("param_bound must be positive, got {b}"));
            }
        }
        if let Some(t) = self.rollout_timeout_secs {
            if !(t.is_finite() && t > 0.0) {
                return bad(format!("rollout_timeout_secs must be positive, got {t}"));
            }
        }
        if !(self.tension_divisor.is_finite() && self.tension_divisor != 0.0) {
            return bad(format!("tension_divisor must be finite and non-zero, got {}", self.tension_divisor));
        }
        if let DivergencePolicy::Penalize(p) = self.divergence {
            if !p.is_finite() {
                return bad(format!("divergence penalty must be finite, got {p}"));
            }
        }
        if let Some(ch) = self.disabled_channels.iter().find(|&&ch| ch >= self.somites) {
            return bad(format!("disabled channel {ch} out of range for {} somites", self.somites));
        }
        self.topology()
            .validate()
            .map_err(|e| OptimizerError::Configuration(e.to_string()))
    }
}

impl fmt::Display for TrainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "==========configs==========")?;
        writeln!(f, "policy: {}", self.policy)?;
        writeln!(f, "batch_size: {}", self.batch_size)?;
        writeln!(f, "episodes: {}", self.episodes)?;
        writeln!(f, "steps: {}", self.steps)?;
        writeln!(f, "time_delta: {}", self.time_delta)?;
        writeln!(f, "default_sample_steps: {}", self.default_sample_steps)?;
        writeln!(f, "init_sigma: {}", self.init_sigma)?;
        writeln!(f, "converged_sigma: {}", self.converged_sigma)?;
        writeln!(f, "sigma_upper_bound: {}", self.sigma_upper_bound)?;
        writeln!(f, "learning_rate: {}", self.learning_rate)?;
        writeln!(f, "baseline_decay: {}", self.baseline_decay)?;
        writeln!(f, "param_bound: {:?}", self.param_bound)?;
        writeln!(f, "reward_shaping: {:?}", self.reward_shaping)?;
        writeln!(f, "tension_divisor: {}", self.tension_divisor)?;
        writeln!(f, "divergence: {:?}", self.divergence)?;
        writeln!(f, "workers: {}", self.workers)?;
        writeln!(f, "somites: {}", self.somites)?;
        writeln!(f, "oscillator_ids: {:?}", self.oscillator_ids)?;
        writeln!(f, "==========caterpillar config=================")?;
        write!(f, "{}", self.caterpillar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = TrainConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.batch_size, 8);
        assert_eq!(cfg.oscillator_ids.len(), 6);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(
            &path,
            r#"{"batch_size": 4, "divergence": {"penalize": -1000.0}, "caterpillar": {"sp_k": 50.0}}"#,
        )
        .unwrap();
        let cfg = TrainConfig::load(&path).unwrap();
        assert_eq!(cfg.batch_size, 4);
        assert_eq!(cfg.divergence, DivergencePolicy::Penalize(-1000.0));
        assert_eq!(cfg.caterpillar.sp_k, 50.0);
        assert_eq!(cfg.caterpillar.dp_c, 10.0);
        assert_eq!(cfg.episodes, 500);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cfg = TrainConfig { batch_size: 0, ..TrainConfig::default() };
        assert!(matches!(cfg.validate(), Err(OptimizerError::Configuration(_))));

        let cfg = TrainConfig { disabled_channels: vec![8], ..TrainConfig::default() };
        assert!(cfg.validate().is_err());

        let cfg = TrainConfig { oscillator_ids: vec![0], ..TrainConfig::default() };
        assert!(cfg.validate().is_err());

        let cfg = TrainConfig { baseline_decay: 1.5, ..TrainConfig::default() };
        assert!(cfg.validate().is_err());
    }
}
