use caterpillar_sim::SimError;
use thiserror::Error;

/// Failures of the PEPG optimizer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizerError {
    /// Invalid dimensions or hyperparameters.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Protocol violation, e.g. `update` without a pending batch.
    #[error("State error: {0}")]
    State(String),

    /// The update produced non-finite values; nothing was committed.
    #[error("Numeric instability: {0}")]
    NumericInstability(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("Unknown policy '{key}' (known: {known})")]
    Unknown { key: String, known: String },

    #[error("Policy '{policy}' takes {expected} parameters, got {got}")]
    ParameterCount { policy: &'static str, expected: usize, got: usize },
}

/// Failures of a single rollout.
#[derive(Error, Debug)]
pub enum RolloutError {
    #[error("Simulation diverged: {0}")]
    SimulationDiverged(String),

    #[error("Rollout cancelled")]
    Cancelled,

    #[error("Rollout exceeded {0:.1}s")]
    TimedOut(f64),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Simulator(SimError),
}

impl From<SimError> for RolloutError {
    fn from(e: SimError) -> Self {
        match e {
            SimError::Diverged { .. } => RolloutError::SimulationDiverged(e.to_string()),
            other => RolloutError::Simulator(other),
        }
    }
}

impl RolloutError {
    pub fn is_divergence(&self) -> bool {
        matches!(self, RolloutError::SimulationDiverged(_))
    }
}

/// Persistence failures (run logs, snapshots, traces).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Trace export failed: {0}")]
    Trace(#[from] SimError),
}

impl StorageError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        StorageError::Io { path: path.display().to_string(), source }
    }
}

/// Anything that stops the training loop.
#[derive(Error, Debug)]
pub enum TrainError {
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    #[error(transparent)]
    Rollout(#[from] RolloutError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Interactive prompt failed: {0}")]
    Prompt(#[from] std::io::Error),
}
