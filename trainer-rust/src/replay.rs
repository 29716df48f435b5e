//! Run a saved policy once and record what it does.

use std::path::{Path, PathBuf};

use crate::config::TrainConfig;
use crate::error::{RolloutError, StorageError, TrainError};
use crate::experiments::dispatch::{CancelToken, StopSignal};
use crate::experiments::env::Simulator;
use crate::experiments::policy::{PolicyRegistry, PolicyShape};
use crate::experiments::rollout::{self, RolloutSpec};
use crate::runlog::CsvLog;
use crate::storage::PolicyRecord;

#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub distance: f64,
    pub distance_path: PathBuf,
    pub trace_path: PathBuf,
}

pub fn replay(
    config: &TrainConfig,
    record: &PolicyRecord,
    steps: usize,
    out_dir: &Path,
    cancel: &CancelToken,
) -> Result<ReplayOutcome, TrainError> {
    let make_policy = PolicyRegistry::default().resolve(&record.policy)?;
    let topology = config.topology();
    let mut policy = make_policy(PolicyShape::from(&topology));
    policy.set_parameters(&record.params)?;
    let mut sim = topology.build().map_err(RolloutError::from)?;

    std::fs::create_dir_all(out_dir).map_err(|e| StorageError::io(out_dir, e))?;
    let distance_path = out_dir.join("replay_distance.csv");
    let trace_path = out_dir.join("replay.json");
    let mut log = CsvLog::new(&distance_path, vec!["step".into(), "distance".into()]);

    let spec = RolloutSpec {
        steps,
        dt: config.time_delta,
        disabled_channels: config.disabled_channels.clone(),
        shaping: config.reward_shaping,
        tension_divisor: config.tension_divisor,
        timeout: None,
    };
    let stop = StopSignal::new(cancel, None);
    let mut write_error = None;
    let outcome = rollout::evaluate(&mut sim, policy.as_ref(), &spec, &stop, |rec| {
        if write_error.is_none() {
            if let Err(e) = log.append(rec.step, &[rec.distance]) {
                write_error = Some(e);
            }
        }
    })?;
    if let Some(e) = write_error {
        return Err(e.into());
    }
    sim.save_trace(&trace_path)?;

    tracing::info!(
        policy = %record.policy,
        steps = steps,
        distance = outcome.distance,
        "Replay complete"
    );
    Ok(ReplayOutcome { distance: outcome.distance, distance_path, trace_path })
}
