//! Caterpillar locomotion training, gradient-free, in pure Rust.
//!
//! Architecture:
//! - `env`: Simulator trait + the caterpillar binding
//! - `policy`: Feedback policies and the key → constructor registry
//! - `optim`: Symmetric PEPG optimizer
//! - `rollout`: One episode → scalar reward
//! - `dispatch`: Parallel batch evaluation, index-aligned
//! - `trainer`: Running / Interrupted / Terminal loop

pub mod env;
pub mod policy;
pub mod optim;
pub mod rollout;
pub mod dispatch;
pub mod trainer;
