//! The training loop: sample → dispatch → update → report, as a state
//! machine over `Running`, `Interrupted` and `Terminal`.
//!
//! The interrupt arrives through a `CancelToken`; the prompt reads from any
//! `BufRead` and writes to any `Write`, so tests drive it with byte buffers.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use super::dispatch::{CancelToken, DivergencePolicy, ParallelDispatcher, StopSignal};
use super::env::{Simulator, Topology};
use super::optim::{clamp_bound, identity_bound, BoundFn, SymmetricPepg};
use super::policy::{PolicyConstructor, PolicyRegistry, PolicyShape};
use super::rollout::{self, run_candidate, RolloutSpec};
use crate::config::TrainConfig;
use crate::error::{OptimizerError, RolloutError, TrainError};
use crate::runlog::{CsvLog, RunLogs, SaveDir};
use crate::storage::{self, PolicyRecord, TrainingSnapshot, OPTIMIZER_FILE, POLICY_FILE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Interrupted,
    Terminal,
}

/// Commands accepted while interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Sample,
    Finish,
}

pub fn parse_command(input: &str) -> Option<Command> {
    let input = input.trim();
    if input.eq_ignore_ascii_case("sample") {
        Some(Command::Sample)
    } else if input.eq_ignore_ascii_case("finish") {
        Some(Command::Finish)
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub episodes: usize,
    pub last_distance: Option<f64>,
    pub snapshot_path: PathBuf,
    pub policy_path: PathBuf,
}

enum EpisodeOutcome {
    Completed,
    Interrupted,
}

pub struct TrainingLoop<R, W> {
    config: TrainConfig,
    optimizer: SymmetricPepg,
    dispatcher: ParallelDispatcher,
    make_policy: PolicyConstructor,
    topology: Topology,
    spec: RolloutSpec,
    save_dir: SaveDir,
    logs: RunLogs,
    cancel: CancelToken,
    input: R,
    output: W,
    episode: usize,
    state: LoopState,
    last_distance: Option<f64>,
    converged: bool,
}

fn param_bound(config: &TrainConfig) -> BoundFn {
    match config.param_bound {
        Some(b) => clamp_bound(b),
        None => identity_bound(),
    }
}

impl<R: BufRead, W: Write> TrainingLoop<R, W> {
    /// Resolve the policy, build the optimizer (fresh or from `resume`) and
    /// the worker pool. A snapshot's hyperparameters replace the config's.
    pub fn new(
        mut config: TrainConfig,
        save_dir: SaveDir,
        cancel: CancelToken,
        input: R,
        output: W,
        resume: Option<TrainingSnapshot>,
    ) -> Result<Self, TrainError> {
        if let Some(snapshot) = &resume {
            snapshot.restore_into(&mut config);
        }
        config.validate()?;
        let make_policy = PolicyRegistry::default().resolve(&config.policy)?;
        let topology = config.topology();
        let n_params = make_policy(PolicyShape::from(&topology)).n_params();

        let (optimizer, episode) = match resume {
            Some(snapshot) => {
                if snapshot.policy != config.policy {
                    return Err(OptimizerError::Configuration(format!(
                        "snapshot was trained with policy '{}', config asks for '{}'",
                        snapshot.policy, config.policy
                    ))
                    .into());
                }
                if snapshot.optimizer.mean.len() != n_params {
                    return Err(OptimizerError::Configuration(format!(
                        "snapshot has {} parameters, policy '{}' needs {n_params}",
                        snapshot.optimizer.mean.len(),
                        config.policy
                    ))
                    .into());
                }
                let opt = SymmetricPepg::from_state(&snapshot.optimizer, param_bound(&config), config.seed)?;
                tracing::info!(episode = snapshot.episode, "Resuming from snapshot");
                (opt, snapshot.episode)
            }
            None => {
                let opt = SymmetricPepg::with_dim(
                    n_params,
                    config.init_sigma,
                    param_bound(&config),
                    config.learning_rate,
                    config.baseline_decay,
                    config.sigma_upper_bound,
                    config.seed,
                )?;
                (opt, 0)
            }
        };

        let dispatcher = ParallelDispatcher::new(config.workers, config.divergence)?;
        let spec = RolloutSpec {
            steps: config.steps,
            dt: config.time_delta,
            disabled_channels: config.disabled_channels.clone(),
            shaping: config.reward_shaping,
            tension_divisor: config.tension_divisor,
            timeout: config.rollout_timeout_secs.map(Duration::from_secs_f64),
        };
        let logs = RunLogs::new(&save_dir.log_dir());

        tracing::info!(
            policy = %config.policy,
            n_params = n_params,
            workers = dispatcher.workers(),
            batch_size = config.batch_size,
            "Training loop ready"
        );

        Ok(TrainingLoop {
            config,
            optimizer,
            dispatcher,
            make_policy,
            topology,
            spec,
            save_dir,
            logs,
            cancel,
            input,
            output,
            episode,
            state: LoopState::Running,
            last_distance: None,
            converged: false,
        })
    }

    /// Drive the state machine until `Terminal`. Any error on the way saves
    /// the last good optimizer state before it is returned.
    pub fn run(mut self) -> Result<TrainingSummary, TrainError> {
        loop {
            let next = match self.state {
                LoopState::Running => self.advance(),
                LoopState::Interrupted => self.interact(),
                LoopState::Terminal => return self.finish(),
            };
            match next {
                Ok(state) => self.state = state,
                Err(e) => {
                    tracing::error!(episode = self.episode, "Training halted: {e}");
                    match self.persist() {
                        Ok(path) => tracing::info!(path = %path.display(), "Saved last good state"),
                        Err(pe) => tracing::error!("Failed to save last good state: {pe}"),
                    }
                    return Err(e);
                }
            }
        }
    }

    fn advance(&mut self) -> Result<LoopState, TrainError> {
        if self.episode >= self.config.episodes {
            return Ok(LoopState::Terminal);
        }
        Ok(match self.run_episode()? {
            EpisodeOutcome::Completed => LoopState::Running,
            EpisodeOutcome::Interrupted => LoopState::Interrupted,
        })
    }

    fn interact(&mut self) -> Result<LoopState, TrainError> {
        self.cancel.reset();
        match self.prompt_command()? {
            Command::Sample => self.sample_probe(),
            Command::Finish => {
                writeln!(self.output, "Ending training ...")?;
                Ok(LoopState::Terminal)
            }
        }
    }

    fn run_episode(&mut self) -> Result<EpisodeOutcome, TrainError> {
        tracing::debug!(episode = self.episode, "Sampling batch");
        let candidates = self.optimizer.sample(self.config.batch_size)?;

        let topology = &self.topology;
        let spec = &self.spec;
        let make_policy = self.make_policy;
        let dispatched = self.dispatcher.dispatch(&candidates, &self.cancel, |_, params, stop| {
            run_candidate(topology, make_policy, params, spec, stop).map(|o| o.reward)
        });
        let rewards = match dispatched {
            Ok(r) => r,
            Err(RolloutError::Cancelled) => {
                self.optimizer.discard_pending();
                tracing::warn!(episode = self.episode, "Batch abandoned on interrupt");
                return Ok(EpisodeOutcome::Interrupted);
            }
            Err(e) => {
                self.optimizer.discard_pending();
                return Err(e.into());
            }
        };

        self.optimizer.update(&rewards)?;
        self.episode += 1;

        // score the unperturbed mean
        let stop = StopSignal::new(&self.cancel, None);
        match run_candidate(&self.topology, self.make_policy, self.optimizer.mean(), &self.spec, &stop) {
            Ok(outcome) => {
                let mean_sigma = self.optimizer.mean_sigma();
                self.logs.record(self.episode, outcome.distance, outcome.reward, mean_sigma)?;
                self.last_distance = Some(outcome.distance);
                tracing::info!(
                    episode = self.episode,
                    distance = outcome.distance,
                    reward = outcome.reward,
                    mean_sigma = mean_sigma,
                    baseline = self.optimizer.state().baseline,
                    "Episode complete"
                );
                if !self.converged && mean_sigma < self.config.converged_sigma {
                    self.converged = true;
                    tracing::info!(episode = self.episode, mean_sigma = mean_sigma, "Exploration noise converged");
                }
            }
            Err(RolloutError::Cancelled) => return Ok(EpisodeOutcome::Interrupted),
            Err(e) if e.is_divergence() && self.dispatcher.divergence_policy() != DivergencePolicy::Abort => {
                tracing::warn!(episode = self.episode, "Mean evaluation diverged: {e}");
            }
            Err(e) => return Err(e.into()),
        }

        if self.cancel.is_cancelled() {
            Ok(EpisodeOutcome::Interrupted)
        } else {
            Ok(EpisodeOutcome::Completed)
        }
    }

    fn read_line(&mut self, prompt: &str) -> Result<Option<String>, TrainError> {
        write!(self.output, "{prompt}")?;
        self.output.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }

    /// End of input counts as `finish`.
    fn prompt_command(&mut self) -> Result<Command, TrainError> {
        loop {
            match self.read_line("\nSample? Finish? : ")? {
                None => return Ok(Command::Finish),
                Some(line) => {
                    if let Some(cmd) = parse_command(&line) {
                        return Ok(cmd);
                    }
                }
            }
        }
    }

    fn prompt_steps(&mut self) -> Result<usize, TrainError> {
        loop {
            let line = self.read_line("How many steps for this sample?: ")?.unwrap_or_default();
            let line = line.trim();
            if line.is_empty() {
                writeln!(self.output, "default steps {}", self.config.default_sample_steps)?;
                return Ok(self.config.default_sample_steps);
            }
            match line.parse() {
                Ok(n) => return Ok(n),
                Err(_) => writeln!(self.output, "Not a step count: {line}")?,
            }
        }
    }

    /// Run the current mean for a user-chosen number of steps and record
    /// distance, actions, frictions and a trace under the log directory.
    fn sample_probe(&mut self) -> Result<LoopState, TrainError> {
        let steps = self.prompt_steps()?;
        let log_dir = self.save_dir.log_dir();
        let ep = self.episode;
        let file = |suffix: &str| log_dir.join(format!("train_result_ep{ep}{suffix}"));

        let mut distance_log = CsvLog::new(file("_distance.csv"), vec!["step".into(), "distance".into()]);
        let mut actions_log = CsvLog::indexed(file("_actions.csv"), "step", "action", self.topology.oscillators());
        let mut frictions_log = CsvLog::indexed(file("_frictions.csv"), "step", "friction", self.topology.somites);

        let mut sim = self.topology.build().map_err(RolloutError::from)?;
        let mut policy = (self.make_policy)(PolicyShape::from(&self.topology));
        policy.set_parameters(self.optimizer.mean())?;
        let spec = RolloutSpec { steps, timeout: None, ..self.spec.clone() };
        let stop = StopSignal::new(&self.cancel, None);

        let mut write_error = None;
        let result = rollout::evaluate(&mut sim, policy.as_ref(), &spec, &stop, |rec| {
            if write_error.is_some() {
                return;
            }
            let written = distance_log
                .append(rec.step, &[rec.distance])
                .and_then(|_| actions_log.append(rec.step, rec.action))
                .and_then(|_| frictions_log.append(rec.step, &rec.observation.frictions));
            if let Err(e) = written {
                write_error = Some(e);
            }
        });
        if let Some(e) = write_error {
            return Err(e.into());
        }

        let next = match result {
            Ok(outcome) => {
                writeln!(self.output, "Moved distance: {}", outcome.distance)?;
                LoopState::Running
            }
            Err(RolloutError::Cancelled) => {
                writeln!(self.output, "Sample interrupted")?;
                LoopState::Interrupted
            }
            Err(e) if e.is_divergence() => {
                writeln!(self.output, "Sample run diverged: {e}")?;
                LoopState::Running
            }
            Err(e) => return Err(e.into()),
        };
        sim.save_trace(&file(".json"))?;
        Ok(next)
    }

    fn snapshot(&self) -> TrainingSnapshot {
        TrainingSnapshot {
            policy: self.config.policy.clone(),
            episode: self.episode,
            batch_size: self.config.batch_size,
            param_bound: self.config.param_bound,
            optimizer: self.optimizer.snapshot(),
        }
    }

    fn persist(&self) -> Result<PathBuf, TrainError> {
        let path = self.save_dir.model_dir().join(OPTIMIZER_FILE);
        storage::save_snapshot(&path, &self.snapshot())?;
        Ok(path)
    }

    fn finish(&mut self) -> Result<TrainingSummary, TrainError> {
        let mut policy = (self.make_policy)(PolicyShape::from(&self.topology));
        policy.set_parameters(self.optimizer.mean())?;

        let snapshot_path = self.persist()?;
        let policy_path = self.save_dir.model_dir().join(POLICY_FILE);
        let record = PolicyRecord { policy: self.config.policy.clone(), params: policy.parameters().to_vec() };
        storage::save_policy(&policy_path, &record)?;

        tracing::info!(episodes = self.episode, path = %snapshot_path.display(), "Training finished");
        Ok(TrainingSummary {
            episodes: self.episode,
            last_distance: self.last_distance,
            snapshot_path,
            policy_path,
        })
    }
}
