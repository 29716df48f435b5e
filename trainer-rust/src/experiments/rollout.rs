//! One episode of one parameter set, reduced to a scalar reward.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::dispatch::StopSignal;
use super::env::{self, Observation, Simulator, Topology};
use super::policy::{Policy, PolicyConstructor, PolicyShape};
use crate::error::RolloutError;

/// How the accumulated tension enters the reward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardShaping {
    /// Net forward head displacement.
    #[default]
    Displacement,
    /// Displacement minus `tension / tension_divisor`.
    TensionPenalized,
}

#[derive(Debug, Clone)]
pub struct RolloutSpec {
    pub steps: usize,
    pub dt: f64,
    pub disabled_channels: Vec<usize>,
    pub shaping: RewardShaping,
    pub tension_divisor: f64,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RolloutOutcome {
    pub reward: f64,
    /// Head displacement along x since the start of the run.
    pub distance: f64,
    /// Sum of squared actuator tensions over all steps.
    pub tension: f64,
}

/// Handed to the observer after every simulator step.
pub struct StepRecord<'a> {
    pub step: usize,
    /// Observation the action was computed from.
    pub observation: &'a Observation,
    pub action: &'a [f64],
    pub distance: f64,
}

/// Run `spec.steps` steps of `sim` under `policy`.
///
/// The stop signal is polled before every step; the observer sees each
/// completed step.
pub fn evaluate<S: Simulator + ?Sized>(
    sim: &mut S,
    policy: &dyn Policy,
    spec: &RolloutSpec,
    stop: &StopSignal<'_>,
    mut observer: impl FnMut(&StepRecord<'_>),
) -> Result<RolloutOutcome, RolloutError> {
    let start_x = sim.head_position().x;
    let started = Instant::now();
    let mut tension = 0.0;

    for step in 0..spec.steps {
        if stop.should_stop() {
            return Err(RolloutError::Cancelled);
        }
        if let Some(limit) = spec.timeout {
            if started.elapsed() > limit {
                return Err(RolloutError::TimedOut(limit.as_secs_f64()));
            }
        }

        let mut obs = sim.observe();
        if !obs.is_finite() {
            return Err(RolloutError::SimulationDiverged(format!("non-finite observation at step {step}")));
        }
        for &ch in &spec.disabled_channels {
            if let Some(f) = obs.forces.get_mut(ch) {
                *f = 0.0;
            }
        }
        tension += obs.forces.iter().map(|f| f * f).sum::<f64>();

        let action = policy.infer(&obs);
        if action.iter().any(|a| !a.is_finite()) {
            return Err(RolloutError::SimulationDiverged(format!("non-finite action at step {step}")));
        }
        sim.step(spec.dt, &action)?;

        observer(&StepRecord {
            step,
            observation: &obs,
            action: &action,
            distance: sim.head_position().x - start_x,
        });
    }

    let distance = sim.head_position().x - start_x;
    let reward = match spec.shaping {
        RewardShaping::Displacement => distance,
        RewardShaping::TensionPenalized => distance - tension / spec.tension_divisor,
    };
    if !(reward.is_finite() && tension.is_finite()) {
        return Err(RolloutError::SimulationDiverged(format!("non-finite reward {reward}")));
    }
    Ok(RolloutOutcome { reward, distance, tension })
}

/// Build a fresh simulator and policy, load `params`, and evaluate.
pub fn run_candidate(
    topology: &Topology,
    make_policy: PolicyConstructor,
    params: &[f64],
    spec: &RolloutSpec,
    stop: &StopSignal<'_>,
) -> Result<RolloutOutcome, RolloutError> {
    let mut sim = env::make(topology)?;
    let mut policy = make_policy(PolicyShape::from(topology));
    policy.set_parameters(params)?;
    evaluate(sim.as_mut(), policy.as_ref(), spec, stop, |_| {})
}
