use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    /// Invalid body layout or physical parameters.
    #[error("Invalid topology: {0}")]
    Topology(String),

    /// Feedback vector does not match the oscillator count.
    #[error("Expected {expected} feedback values, got {got}")]
    FeedbackLength { expected: usize, got: usize },

    /// Integration produced a non-finite state.
    #[error("Simulation diverged at frame {frame} (somite {somite})")]
    Diverged { frame: usize, somite: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
