//! Caterpillar simulator
//!
//! A planar chain of somites resting on flat ground. Somites carrying a phase
//! oscillator also carry a bending actuator whose target angle follows the
//! oscillator phase. An external controller speeds each oscillator up or down
//! through a feedback value per step.
//!
//! # Layout
//!
//! ```text
//!   tail                                   head
//!   (0)───(1)───(2)───(3)─── ... ───(n-2)───(n-1)    → +x
//!          ▲     ▲     ▲
//!          └─────┴─────┴── bending actuator + oscillator
//! ```
//!
//! ## Forces per step
//! - gravity, ground contact and friction on every somite
//! - spring + damper between neighbours
//! - actuator torque at each oscillator somite, applied as a force couple on
//!   its two neighbours with the reaction on the somite itself
//!
//! Integration is velocity Verlet with a caller-supplied `dt`.

pub mod body;
pub mod config;
pub mod error;
pub mod oscillator;
pub mod trace;
pub mod vec2;

pub use body::Caterpillar;
pub use config::CaterpillarConfig;
pub use error::SimError;
pub use vec2::Vec2;
