//! Fan a batch of candidates out over a worker pool and fan the rewards
//! back in, index-aligned with the input.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{OptimizerError, RolloutError};

/// What to do when one rollout of a batch diverges.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergencePolicy {
    /// Stop the batch and return the first divergence.
    #[default]
    Abort,
    /// Score the candidate with this reward and keep going.
    Penalize(f64),
}

/// Shared interrupt flag, raised by the Ctrl-C listener.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What a running rollout polls to know it should give up: the user
/// interrupt, and optionally the abort flag of its batch.
pub struct StopSignal<'a> {
    interrupt: &'a CancelToken,
    batch_abort: Option<&'a AtomicBool>,
}

impl<'a> StopSignal<'a> {
    pub fn new(interrupt: &'a CancelToken, batch_abort: Option<&'a AtomicBool>) -> Self {
        StopSignal { interrupt, batch_abort }
    }

    pub fn should_stop(&self) -> bool {
        self.interrupt.is_cancelled() || self.batch_abort.map_or(false, |a| a.load(Ordering::Relaxed))
    }
}

pub struct ParallelDispatcher {
    pool: rayon::ThreadPool,
    divergence: DivergencePolicy,
}

impl ParallelDispatcher {
    pub fn new(workers: usize, divergence: DivergencePolicy) -> Result<Self, OptimizerError> {
        if workers == 0 {
            return Err(OptimizerError::Configuration("worker pool needs at least one thread".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("rollout-{i}"))
            .build()
            .map_err(|e| OptimizerError::Configuration(format!("failed to build worker pool: {e}")))?;
        Ok(ParallelDispatcher { pool, divergence })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn divergence_policy(&self) -> DivergencePolicy {
        self.divergence
    }

    /// Evaluate every candidate on the pool. `eval` gets the candidate
    /// index, its parameters, and the stop signal it must poll.
    ///
    /// An interrupt abandons the whole batch with `Cancelled`.
    pub fn dispatch<F>(&self, candidates: &[Vec<f64>], cancel: &CancelToken, eval: F) -> Result<Vec<f64>, RolloutError>
    where
        F: Fn(usize, &[f64], &StopSignal<'_>) -> Result<f64, RolloutError> + Sync,
    {
        let abort = AtomicBool::new(false);
        let abort_on_divergence = self.divergence == DivergencePolicy::Abort;

        let results: Vec<Result<f64, RolloutError>> = self.pool.install(|| {
            candidates
                .par_iter()
                .enumerate()
                .map(|(i, params)| {
                    let stop = StopSignal::new(cancel, Some(&abort));
                    if stop.should_stop() {
                        return Err(RolloutError::Cancelled);
                    }
                    let result = eval(i, params, &stop);
                    if abort_on_divergence && matches!(result, Err(ref e) if e.is_divergence()) {
                        abort.store(true, Ordering::Relaxed);
                    }
                    result
                })
                .collect()
        });

        if cancel.is_cancelled() {
            return Err(RolloutError::Cancelled);
        }

        let mut rewards = Vec::with_capacity(results.len());
        let mut first_error = None;
        for (i, result) in results.into_iter().enumerate() {
            match (result, self.divergence) {
                (Ok(r), _) => rewards.push(r),
                (Err(e), DivergencePolicy::Penalize(penalty))
                    if e.is_divergence() || matches!(e, RolloutError::TimedOut(_)) =>
                {
                    tracing::warn!(candidate = i, penalty = penalty, "Rollout failed, penalized: {e}");
                    rewards.push(penalty);
                }
                // rollouts stopped by the batch abort are not the cause
                (Err(RolloutError::Cancelled), _) => {}
                (Err(e), _) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None if rewards.len() == candidates.len() => Ok(rewards),
            None => Err(RolloutError::Cancelled),
        }
    }
}
