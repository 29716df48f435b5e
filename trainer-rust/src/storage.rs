use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::TrainConfig;
use crate::error::StorageError;
use crate::experiments::optim::PepgState;

pub const OPTIMIZER_FILE: &str = "optimizer_state.json";
pub const POLICY_FILE: &str = "actor_params.json";

/// Everything needed to resume a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSnapshot {
    pub policy: String,
    pub episode: usize,
    pub batch_size: usize,
    pub param_bound: Option<f64>,
    pub optimizer: PepgState,
}

impl TrainingSnapshot {
    /// Overwrite the hyperparameters in `config` with the ones this run was
    /// trained with. The policy key is left alone; callers check it.
    pub fn restore_into(&self, config: &mut TrainConfig) {
        config.batch_size = self.batch_size;
        config.param_bound = self.param_bound;
        config.learning_rate = self.optimizer.learning_rate;
        config.baseline_decay = self.optimizer.baseline_decay;
        config.sigma_upper_bound = self.optimizer.sigma_upper_bound.unwrap_or(f64::INFINITY);
    }
}

/// A deployable policy: registry key plus flat parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub policy: String,
    pub params: Vec<f64>,
}

impl From<&TrainingSnapshot> for PolicyRecord {
    fn from(s: &TrainingSnapshot) -> Self {
        PolicyRecord { policy: s.policy.clone(), params: s.optimizer.mean.clone() }
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;
    }
    let json = serde_json::to_string_pretty(value)?;
    // the previous file stays intact until the new one is complete
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| StorageError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, StorageError> {
    let data = std::fs::read_to_string(path).map_err(|e| StorageError::io(path, e))?;
    Ok(serde_json::from_str(&data)?)
}

pub fn save_snapshot(path: &Path, snapshot: &TrainingSnapshot) -> Result<(), StorageError> {
    save_json(path, snapshot)
}

pub fn load_snapshot(path: &Path) -> Result<TrainingSnapshot, StorageError> {
    load_json(path)
}

pub fn save_policy(path: &Path, record: &PolicyRecord) -> Result<(), StorageError> {
    save_json(path, record)
}

/// Load either a policy record or an optimizer snapshot (its mean).
pub fn load_policy(path: &Path) -> Result<PolicyRecord, StorageError> {
    let data = std::fs::read_to_string(path).map_err(|e| StorageError::io(path, e))?;
    if let Ok(snapshot) = serde_json::from_str::<TrainingSnapshot>(&data) {
        return Ok(PolicyRecord::from(&snapshot));
    }
    Ok(serde_json::from_str(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> TrainingSnapshot {
        TrainingSnapshot {
            policy: "linear".into(),
            episode: 12,
            batch_size: 8,
            param_bound: Some(std::f64::consts::PI),
            optimizer: PepgState {
                mean: vec![0.1, -0.2, 0.3],
                sigma: vec![1.0, 0.5, 0.25],
                baseline: 0.04,
                max_reward_seen: 1.5,
                learning_rate: 0.1,
                baseline_decay: 0.01,
                sigma_upper_bound: Some(10.0),
            },
        }
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model").join(OPTIMIZER_FILE);
        save_snapshot(&path, &snapshot()).unwrap();
        assert_eq!(load_snapshot(&path).unwrap(), snapshot());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_policy_from_either_file() {
        let dir = tempfile::tempdir().unwrap();
        let snap_path = dir.path().join(OPTIMIZER_FILE);
        save_snapshot(&snap_path, &snapshot()).unwrap();
        let from_snapshot = load_policy(&snap_path).unwrap();
        assert_eq!(from_snapshot.params, vec![0.1, -0.2, 0.3]);

        let policy_path = dir.path().join(POLICY_FILE);
        save_policy(&policy_path, &PolicyRecord { policy: "open_loop".into(), params: vec![1.0] }).unwrap();
        let record = load_policy(&policy_path).unwrap();
        assert_eq!(record.policy, "open_loop");
    }

    #[test]
    fn test_restore_into_overrides_hyperparameters() {
        let mut snap = snapshot();
        snap.batch_size = 3;
        snap.param_bound = None;
        snap.optimizer.learning_rate = 0.05;
        snap.optimizer.sigma_upper_bound = None;

        let mut cfg = TrainConfig { policy: "open_loop".into(), ..TrainConfig::default() };
        snap.restore_into(&mut cfg);
        assert_eq!(cfg.batch_size, 3);
        assert_eq!(cfg.param_bound, None);
        assert_eq!(cfg.learning_rate, 0.05);
        assert_eq!(cfg.baseline_decay, 0.01);
        assert_eq!(cfg.sigma_upper_bound, f64::INFINITY);
        assert_eq!(cfg.policy, "open_loop");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = load_snapshot(Path::new("/nonexistent/state.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/state.json"));
    }
}
