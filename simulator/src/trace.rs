//! Simulation trace export (JSON), consumed by the replay viewer.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::error::SimError;

/// Static description of a body in the scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceObject {
    pub id: String,
    pub rad: f64,
    pub pos: (f64, f64, f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectPosition {
    pub id: String,
    pub pos: (f64, f64, f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub index: usize,
    pub objects: Vec<ObjectPosition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationTrace {
    pub objects: Vec<TraceObject>,
    pub frames: Vec<Frame>,
}

impl SimulationTrace {
    pub fn new(objects: Vec<TraceObject>) -> Self {
        SimulationTrace { objects, frames: Vec::new() }
    }

    /// Append a frame. Indices must be strictly increasing.
    pub fn add_frame(&mut self, index: usize, objects: Vec<ObjectPosition>) {
        debug_assert!(
            self.frames.last().map_or(true, |f| f.index < index),
            "frame index {index} out of order"
        );
        self.frames.push(Frame { index, objects });
    }

    pub fn save(&self, path: &Path) -> Result<(), SimError> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, SimError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}
