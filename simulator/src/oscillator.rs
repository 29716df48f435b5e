/// Phase oscillator driving one actuator.
#[derive(Debug, Clone, Default)]
pub struct PhaseOscillator {
    phase: f64,
}

impl PhaseOscillator {
    pub fn new() -> Self {
        PhaseOscillator { phase: 0.0 }
    }

    pub fn phase(&self) -> f64 {
        self.phase
    }

    pub fn set_phase(&mut self, phase: f64) {
        self.phase = phase;
    }

    /// Advance by `speed * dt` and return the new phase.
    pub fn step(&mut self, speed: f64, dt: f64) -> f64 {
        self.phase += speed * dt;
        self.phase
    }
}
