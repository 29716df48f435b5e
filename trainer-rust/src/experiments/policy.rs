//! Feedback policies: observation → per-oscillator frequency feedback.
//!
//! Parameters are stored as a flat f64 vector, manipulated by the optimizer.
//! Policies are picked by key from a `PolicyRegistry` once at startup.

use std::collections::BTreeMap;

use super::env::{Observation, Topology};
use crate::error::PolicyError;

/// Dimensions a policy is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyShape {
    pub somites: usize,
    pub oscillators: usize,
}

impl From<&Topology> for PolicyShape {
    fn from(t: &Topology) -> Self {
        PolicyShape { somites: t.somites, oscillators: t.oscillators() }
    }
}

pub trait Policy {
    fn name(&self) -> &'static str;

    /// Length of the flat parameter vector; fixed for the policy's lifetime.
    fn n_params(&self) -> usize;

    fn set_parameters(&mut self, params: &[f64]) -> Result<(), PolicyError>;

    fn parameters(&self) -> &[f64];

    /// One feedback value per oscillator.
    fn infer(&self, obs: &Observation) -> Vec<f64>;
}

fn check_len(policy: &'static str, expected: usize, got: usize) -> Result<(), PolicyError> {
    if expected != got {
        return Err(PolicyError::ParameterCount { policy, expected, got });
    }
    Ok(())
}

// ─── Linear actor ─────────────────────────────────────────────────────

/// Linear feedback on actuator tensions:
///
/// f_sin = F·W_sin + b_sin, f_cos = F·W_cos + b_cos
/// action_k = f_sin_k sin φ_k + f_cos_k cos φ_k
///
/// Layout: `[W_sin (S×O, row-major), b_sin (O), W_cos (S×O), b_cos (O)]`.
#[derive(Debug, Clone)]
pub struct LinearActor {
    shape: PolicyShape,
    params: Vec<f64>,
}

impl LinearActor {
    pub fn new(shape: PolicyShape) -> Self {
        let n = 2 * (shape.somites * shape.oscillators + shape.oscillators);
        LinearActor { shape, params: vec![0.0; n] }
    }

    /// `(f_sin, f_cos)` for the given forces.
    pub fn amplitudes(&self, forces: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let (s, o) = (self.shape.somites, self.shape.oscillators);
        let block = s * o + o;
        let half = |offset: usize| -> Vec<f64> {
            let w = &self.params[offset..offset + s * o];
            let b = &self.params[offset + s * o..offset + block];
            (0..o)
                .map(|k| b[k] + forces.iter().take(s).enumerate().map(|(i, f)| f * w[i * o + k]).sum::<f64>())
                .collect()
        };
        (half(0), half(block))
    }
}

impl Policy for LinearActor {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn n_params(&self) -> usize {
        self.params.len()
    }

    fn set_parameters(&mut self, params: &[f64]) -> Result<(), PolicyError> {
        check_len(self.name(), self.params.len(), params.len())?;
        self.params.copy_from_slice(params);
        Ok(())
    }

    fn parameters(&self) -> &[f64] {
        &self.params
    }

    fn infer(&self, obs: &Observation) -> Vec<f64> {
        let (f_sin, f_cos) = self.amplitudes(&obs.forces);
        f_sin
            .iter()
            .zip(&f_cos)
            .zip(&obs.phases)
            .map(|((s, c), phi)| s * phi.sin() + c * phi.cos())
            .collect()
    }
}

// ─── Open-loop actor ──────────────────────────────────────────────────

/// Constant frequency offset per oscillator; ignores the observation.
#[derive(Debug, Clone)]
pub struct OpenLoopActor {
    params: Vec<f64>,
}

impl OpenLoopActor {
    pub fn new(shape: PolicyShape) -> Self {
        OpenLoopActor { params: vec![0.0; shape.oscillators] }
    }
}

impl Policy for OpenLoopActor {
    fn name(&self) -> &'static str {
        "open_loop"
    }

    fn n_params(&self) -> usize {
        self.params.len()
    }

    fn set_parameters(&mut self, params: &[f64]) -> Result<(), PolicyError> {
        check_len(self.name(), self.params.len(), params.len())?;
        self.params.copy_from_slice(params);
        Ok(())
    }

    fn parameters(&self) -> &[f64] {
        &self.params
    }

    fn infer(&self, _obs: &Observation) -> Vec<f64> {
        self.params.clone()
    }
}

// ─── Registry ─────────────────────────────────────────────────────────

pub type PolicyConstructor = fn(PolicyShape) -> Box<dyn Policy>;

fn linear(shape: PolicyShape) -> Box<dyn Policy> {
    Box::new(LinearActor::new(shape))
}

fn open_loop(shape: PolicyShape) -> Box<dyn Policy> {
    Box::new(OpenLoopActor::new(shape))
}

/// Configuration key → constructor.
#[derive(Clone)]
pub struct PolicyRegistry {
    entries: BTreeMap<&'static str, PolicyConstructor>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        let mut r = PolicyRegistry { entries: BTreeMap::new() };
        r.register("linear", linear);
        r.register("open_loop", open_loop);
        r
    }
}

impl PolicyRegistry {
    pub fn register(&mut self, key: &'static str, ctor: PolicyConstructor) {
        self.entries.insert(key, ctor);
    }

    pub fn resolve(&self, key: &str) -> Result<PolicyConstructor, PolicyError> {
        self.entries.get(key).copied().ok_or_else(|| PolicyError::Unknown {
            key: key.to_string(),
            known: self.keys().collect::<Vec<_>>().join(", "),
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHAPE: PolicyShape = PolicyShape { somites: 3, oscillators: 2 };

    #[test]
    fn test_linear_param_count() {
        let p = LinearActor::new(PolicyShape { somites: 8, oscillators: 6 });
        assert_eq!(p.n_params(), 108);
    }

    #[test]
    fn test_linear_infer() {
        let mut p = LinearActor::new(SHAPE);
        // W_sin = 0, b_sin = [1, 2], W_cos[0][1] = 1, b_cos = 0
        let mut params = vec![0.0; p.n_params()];
        params[6] = 1.0;
        params[7] = 2.0;
        params[8 + 1] = 1.0;
        p.set_parameters(&params).unwrap();

        let obs = Observation {
            forces: vec![3.0, 0.0, 0.0],
            phases: vec![std::f64::consts::FRAC_PI_2, 0.0],
            frictions: vec![0.0; 3],
        };
        let a = p.infer(&obs);
        assert!((a[0] - 1.0).abs() < 1e-12, "got {a:?}");
        assert!((a[1] - 3.0).abs() < 1e-12, "got {a:?}");
    }

    #[test]
    fn test_wrong_length_rejected() {
        let mut p = LinearActor::new(SHAPE);
        let err = p.set_parameters(&[0.0; 3]).unwrap_err();
        assert_eq!(err, PolicyError::ParameterCount { policy: "linear", expected: 16, got: 3 });
    }

    #[test]
    fn test_open_loop_ignores_observation() {
        let mut p = OpenLoopActor::new(SHAPE);
        p.set_parameters(&[0.5, -0.5]).unwrap();
        assert_eq!(p.infer(&Observation::default()), vec![0.5, -0.5]);
    }

    #[test]
    fn test_registry() {
        let r = PolicyRegistry::default();
        let ctor = r.resolve("open_loop").unwrap();
        assert_eq!(ctor(SHAPE).n_params(), 2);
        match r.resolve("mlp") {
            Err(e) => assert_eq!(e.to_string(), "Unknown policy 'mlp' (known: linear, open_loop)"),
            Ok(_) => panic!("mlp should not resolve"),
        }
        assert_eq!(r.keys().collect::<Vec<_>>(), vec!["linear", "open_loop"]);
    }
}
