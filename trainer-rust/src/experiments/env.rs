//! Simulator abstraction for the trainer.
//!
//! The optimizer only sees rewards; rollouts see this trait. Each rollout
//! builds its own simulator from a `Topology`, so nothing here is shared
//! between workers.

use std::path::Path;

use caterpillar_sim::{Caterpillar, CaterpillarConfig, SimError, Vec2};
use serde::{Deserialize, Serialize};

use crate::error::{RolloutError, StorageError};

/// What a policy gets to see each step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Observation {
    /// Actuator tension per somite (zero where nothing is mounted).
    pub forces: Vec<f64>,
    /// Oscillator phases, one per actuator.
    pub phases: Vec<f64>,
    /// Ground friction along x per somite.
    pub frictions: Vec<f64>,
}

impl Observation {
    pub fn is_finite(&self) -> bool {
        self.forces.iter().chain(&self.phases).chain(&self.frictions).all(|v| v.is_finite())
    }
}

pub trait Simulator {
    fn observe(&self) -> Observation;

    /// Advance by `dt` with one feedback value per oscillator.
    fn step(&mut self, dt: f64, action: &[f64]) -> Result<(), RolloutError>;

    fn head_position(&self) -> Vec2;

    fn save_trace(&self, path: &Path) -> Result<(), StorageError>;
}

impl Simulator for Caterpillar {
    fn observe(&self) -> Observation {
        Observation {
            forces: self.tensions().to_vec(),
            phases: self.somite_phases(),
            frictions: self.frictions_x().to_vec(),
        }
    }

    fn step(&mut self, dt: f64, action: &[f64]) -> Result<(), RolloutError> {
        Ok(self.step_with_feedbacks(dt, action)?)
    }

    fn head_position(&self) -> Vec2 {
        Caterpillar::head_position(self)
    }

    fn save_trace(&self, path: &Path) -> Result<(), StorageError> {
        Ok(self.save_simulation(path)?)
    }
}

/// Body layout: enough to build a fresh simulator anywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub somites: usize,
    pub oscillator_ids: Vec<usize>,
    pub caterpillar: CaterpillarConfig,
}

impl Topology {
    pub fn oscillators(&self) -> usize {
        self.oscillator_ids.len()
    }

    pub fn build(&self) -> Result<Caterpillar, SimError> {
        Caterpillar::new(self.somites, &self.oscillator_ids, self.caterpillar.clone())
    }

    pub fn validate(&self) -> Result<(), SimError> {
        self.build().map(|_| ())
    }
}

/// Factory: a fresh simulator at rest, for scoring only. It keeps no trace
/// frames; build through `Topology::build` when the trajectory is saved.
pub fn make(topology: &Topology) -> Result<Box<dyn Simulator>, RolloutError> {
    let mut sim = topology.build()?;
    sim.set_recording(false);
    Ok(Box::new(sim))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Topology {
        Topology { somites: 5, oscillator_ids: vec![1, 2, 3], caterpillar: CaterpillarConfig::default() }
    }

    #[test]
    fn test_observation_shape() {
        let sim = make(&small()).unwrap();
        let obs = sim.observe();
        assert_eq!(obs.forces.len(), 5);
        assert_eq!(obs.phases.len(), 3);
        assert_eq!(obs.frictions.len(), 5);
        assert!(obs.is_finite());
    }

    #[test]
    fn test_wrong_action_length_is_not_divergence() {
        let mut sim = make(&small()).unwrap();
        let err = sim.step(0.01, &[0.0]).unwrap_err();
        assert!(!err.is_divergence());
        assert!(matches!(err, RolloutError::Simulator(SimError::FeedbackLength { .. })));
    }

    #[test]
    fn test_scoring_simulator_keeps_no_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.json");
        let mut sim = make(&small()).unwrap();
        for _ in 0..30 {
            sim.step(0.01, &[0.0; 3]).unwrap();
        }
        sim.save_trace(&path).unwrap();
        let trace = caterpillar_sim::trace::SimulationTrace::load(&path).unwrap();
        assert!(trace.frames.is_empty());
        assert_eq!(trace.objects.len(), 5);

        assert!(small().build().unwrap().is_recording());
    }

    #[test]
    fn test_bad_topology() {
        let t = Topology { oscillator_ids: vec![4], ..small() };
        assert!(t.validate().is_err());
        assert!(make(&t).is_err());
    }
}
