//! The somite chain and its integrator.

use std::f64::consts::{PI, TAU};
use std::path::Path;

use crate::config::CaterpillarConfig;
use crate::error::SimError;
use crate::oscillator::PhaseOscillator;
use crate::trace::{ObjectPosition, SimulationTrace, TraceObject};
use crate::vec2::Vec2;

/// Below this ground speed a somite is treated as stuck (static friction).
const STATIC_SPEED: f64 = 1e-3;
/// Record one trace frame every this many steps.
const TRACE_DECIMATION: usize = 10;
const CONTACT_EPS: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct Somite {
    pub position: Vec2,
    pub velocity: Vec2,
    pub force: Vec2,
}

pub struct Caterpillar {
    config: CaterpillarConfig,
    /// Ordered tail to head.
    somites: Vec<Somite>,
    oscillators: Vec<PhaseOscillator>,
    /// Somite index carrying each oscillator, ascending.
    oscillator_ids: Vec<usize>,
    /// Actuator tension per somite; zero where no actuator is mounted.
    tensions: Vec<f64>,
    /// Ground friction along x per somite from the last force evaluation.
    frictions: Vec<f64>,
    trace: SimulationTrace,
    /// Whether `trace` collects frames while stepping.
    recording: bool,
    frame: usize,
}

fn wrap_angle(a: f64) -> f64 {
    let mut a = a % TAU;
    if a > PI {
        a -= TAU;
    } else if a <= -PI {
        a += TAU;
    }
    a
}

/// Rotation rate of the segment `d` whose ends move apart at `dv`.
fn segment_angular_velocity(d: Vec2, dv: Vec2) -> f64 {
    let len_sq = d.dot(d);
    if len_sq < 1e-12 {
        return 0.0;
    }
    (d.x * dv.z - d.z * dv.x) / len_sq
}

/// Actuator target bend for oscillator phase `phase`.
fn phase_to_target_angle(phase: f64, rom: f64) -> f64 {
    rom * (1.0 - phase.cos()) * 0.5
}

impl Caterpillar {
    /// Build a chain of `somite_count` somites resting on the ground.
    ///
    /// `oscillator_ids` lists the interior somites (1..=n-2) carrying an
    /// actuator; they must be unique.
    pub fn new(
        somite_count: usize,
        oscillator_ids: &[usize],
        config: CaterpillarConfig,
    ) -> Result<Self, SimError> {
        config.validate()?;
        if somite_count < 3 {
            return Err(SimError::Topology(format!(
                "need at least 3 somites, got {somite_count}"
            )));
        }
        let mut ids = oscillator_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != oscillator_ids.len() {
            return Err(SimError::Topology("duplicate oscillator somite id".into()));
        }
        if let Some(bad) = ids.iter().find(|&&id| id == 0 || id >= somite_count - 1) {
            return Err(SimError::Topology(format!(
                "oscillator somite {bad} is not an interior somite of a {somite_count}-somite body"
            )));
        }

        let r = config.somite_radius;
        let somites: Vec<Somite> = (0..somite_count)
            .map(|i| Somite {
                position: Vec2::new(i as f64 * 2.0 * r, r),
                velocity: Vec2::ZERO,
                force: Vec2::ZERO,
            })
            .collect();

        let trace = SimulationTrace::new(
            somites
                .iter()
                .enumerate()
                .map(|(i, s)| TraceObject { id: somite_label(i), rad: r, pos: s.position.to_xyz() })
                .collect(),
        );

        let mut body = Caterpillar {
            oscillators: vec![PhaseOscillator::new(); ids.len()],
            oscillator_ids: ids,
            tensions: vec![0.0; somite_count],
            frictions: vec![0.0; somite_count],
            somites,
            trace,
            recording: true,
            frame: 0,
            config,
        };
        let initial = body.compute_forces();
        for (s, f) in body.somites.iter_mut().zip(initial) {
            s.force = f;
        }
        Ok(body)
    }

    pub fn config(&self) -> &CaterpillarConfig {
        &self.config
    }

    pub fn somite_count(&self) -> usize {
        self.somites.len()
    }

    pub fn oscillator_count(&self) -> usize {
        self.oscillators.len()
    }

    pub fn oscillator_ids(&self) -> &[usize] {
        &self.oscillator_ids
    }

    pub fn frame_count(&self) -> usize {
        self.frame
    }

    pub fn somite_positions(&self) -> Vec<Vec2> {
        self.somites.iter().map(|s| s.position).collect()
    }

    pub fn head_position(&self) -> Vec2 {
        // new() guarantees at least 3 somites
        self.somites[self.somites.len() - 1].position
    }

    pub fn center_of_mass(&self) -> Vec2 {
        let sum = self.somites.iter().fold(Vec2::ZERO, |acc, s| acc + s.position);
        sum / self.somites.len() as f64
    }

    pub fn tensions(&self) -> &[f64] {
        &self.tensions
    }

    pub fn frictions_x(&self) -> &[f64] {
        &self.frictions
    }

    pub fn somite_phases(&self) -> Vec<f64> {
        self.oscillators.iter().map(|o| o.phase()).collect()
    }

    pub fn set_phase(&mut self, oscillator: usize, phase: f64) -> Result<(), SimError> {
        let count = self.oscillators.len();
        let o = self.oscillators.get_mut(oscillator).ok_or_else(|| {
            SimError::Topology(format!("oscillator {oscillator} out of range (have {count})"))
        })?;
        o.set_phase(phase);
        Ok(())
    }

    pub fn trace(&self) -> &SimulationTrace {
        &self.trace
    }

    /// Turn frame recording on or off. Frames already recorded are kept.
    pub fn set_recording(&mut self, on: bool) {
        self.recording = on;
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn save_simulation(&self, path: &Path) -> Result<(), SimError> {
        self.trace.save(path)
    }

    /// Advance one step of `dt` seconds. `feedbacks[k]` is added to the
    /// free-running speed of oscillator `k`.
    pub fn step_with_feedbacks(&mut self, dt: f64, feedbacks: &[f64]) -> Result<(), SimError> {
        if feedbacks.len() != self.oscillators.len() {
            return Err(SimError::FeedbackLength {
                expected: self.oscillators.len(),
                got: feedbacks.len(),
            });
        }
        let omega = self.config.normal_angular_velocity;
        for (o, fb) in self.oscillators.iter_mut().zip(feedbacks) {
            o.step(omega + fb, dt);
        }
        self.update_state(dt)
    }

    fn update_state(&mut self, dt: f64) -> Result<(), SimError> {
        let m = self.config.somite_mass;
        let r = self.config.somite_radius;

        // Verlet: x' = x + v dt + F/(2m) dt^2
        for s in &mut self.somites {
            let mut p = s.position + s.velocity * dt + s.force * (0.5 * dt * dt / m);
            if p.z < r {
                p.z = r;
            }
            s.position = p;
        }

        let new_forces = self.compute_forces();

        // v' = v + (F + F') dt / (2m)
        for (s, f_new) in self.somites.iter_mut().zip(new_forces) {
            let mut v = s.velocity + (s.force + f_new) * (0.5 * dt / m);
            if s.position.z <= r + CONTACT_EPS && v.z < 0.0 {
                v.z = 0.0;
            }
            s.velocity = v;
            s.force = f_new;
        }

        if let Some(i) = self
            .somites
            .iter()
            .position(|s| !(s.position.is_finite() && s.velocity.is_finite() && s.force.is_finite()))
        {
            return Err(SimError::Diverged { frame: self.frame, somite: i });
        }

        if self.recording && self.frame % TRACE_DECIMATION == 0 {
            let frame = self
                .somites
                .iter()
                .enumerate()
                .map(|(i, s)| ObjectPosition { id: somite_label(i), pos: s.position.to_xyz() })
                .collect();
            self.trace.add_frame(self.frame / TRACE_DECIMATION, frame);
        }
        self.frame += 1;
        Ok(())
    }

    /// Resultant force on every somite at the current positions and
    /// velocities. Refreshes `tensions` and `frictions` as a side effect.
    fn compute_forces(&mut self) -> Vec<Vec2> {
        let cfg = &self.config;
        let n = self.somites.len();
        let mut forces = vec![Vec2::new(0.0, -cfg.gravitational_acceleration * cfg.somite_mass); n];

        // neighbour springs and dampers
        for i in 0..n - 1 {
            let d = self.somites[i + 1].position - self.somites[i].position;
            let len = d.norm();
            let mut f = (self.somites[i + 1].velocity - self.somites[i].velocity) * cfg.dp_c;
            if len > 1e-12 {
                f += d * (cfg.sp_k * (len - cfg.sp_natural_length) / len);
            }
            forces[i] += f;
            forces[i + 1] -= f;
        }

        // bending torques at every interior joint; actuated joints follow
        // their oscillator, passive ones relax toward straight
        self.tensions.iter_mut().for_each(|t| *t = 0.0);
        let mut actuators = self.oscillator_ids.iter().zip(&self.oscillators).peekable();
        for i in 1..n - 1 {
            let base = self.somites[i - 1].position - self.somites[i].position;
            let tip = self.somites[i + 1].position - self.somites[i].position;
            let bend = wrap_angle(tip.angle() - (-base).angle());

            let w_base = segment_angular_velocity(
                -base,
                self.somites[i].velocity - self.somites[i - 1].velocity,
            );
            let w_tip = segment_angular_velocity(
                tip,
                self.somites[i + 1].velocity - self.somites[i].velocity,
            );
            let bend_rate = w_tip - w_base;

            let target = match actuators.peek() {
                Some((&id, osc)) if id == i => {
                    let t = phase_to_target_angle(osc.phase(), cfg.realtime_tunable_ts_rom);
                    actuators.next();
                    Some(t)
                }
                _ => None,
            };
            let torque = cfg.vertical_ts_k * (target.unwrap_or(0.0) - bend) - cfg.vertical_ts_c * bend_rate;

            let tip_len = tip.norm();
            let base_len = base.norm();
            if tip_len < 1e-12 || base_len < 1e-12 {
                continue;
            }
            // tip turns counter-clockwise, base clockwise, for positive torque
            let f_tip = tip.ccw_normal() * (torque / tip_len);
            let f_base = -base.ccw_normal() * (torque / base_len);
            forces[i + 1] += f_tip;
            forces[i - 1] += f_base;
            forces[i] -= f_tip + f_base;

            if target.is_some() {
                self.tensions[i] = torque / tip_len;
            }
        }

        // ground contact
        for (i, s) in self.somites.iter().enumerate() {
            if s.position.z > cfg.somite_radius + CONTACT_EPS {
                self.frictions[i] = 0.0;
                continue;
            }
            let normal = (-forces[i].z).max(0.0);
            forces[i].z += normal;

            let vx = s.velocity.x;
            let friction = if vx.abs() < STATIC_SPEED {
                if forces[i].x.abs() <= cfg.static_friction_coeff * normal {
                    -forces[i].x
                } else {
                    -forces[i].x.signum() * cfg.dynamic_friction_coeff * normal
                }
            } else {
                -vx.signum() * cfg.dynamic_friction_coeff * normal - cfg.viscosity_friction_coeff * vx
            };
            forces[i].x += friction;
            self.frictions[i] = friction;
        }

        forces
    }
}

fn somite_label(i: usize) -> String {
    format!("_somite_{i}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(ids: &[usize]) -> Caterpillar {
        Caterpillar::new(8, ids, CaterpillarConfig::default()).unwrap()
    }

    #[test]
    fn test_initial_layout() {
        let c = body(&[1, 2, 3, 4, 5, 6]);
        let r = c.config().somite_radius;
        assert_eq!(c.somite_count(), 8);
        assert_eq!(c.oscillator_count(), 6);
        assert_eq!(c.head_position(), Vec2::new(7.0 * 2.0 * r, r));
        assert!(c.tensions().iter().all(|t| *t == 0.0));
    }

    #[test]
    fn test_rest_without_actuators() {
        let mut c = body(&[]);
        let head = c.head_position();
        for _ in 0..300 {
            c.step_with_feedbacks(0.01, &[]).unwrap();
        }
        let moved = (c.head_position() - head).norm();
        assert!(moved < 1e-9, "passive body drifted by {moved}");
    }

    #[test]
    fn test_actuators_bend_body() {
        let mut c = body(&[1, 2, 3, 4, 5, 6]);
        for _ in 0..100 {
            c.step_with_feedbacks(0.01, &[0.0; 6]).unwrap();
        }
        // after one second every oscillator sits at phase pi (full bend)
        let r = c.config().somite_radius;
        assert!(c.somite_positions().iter().any(|p| p.z > r + 1e-4));
        assert!(c.tensions().iter().any(|t| *t != 0.0));
    }

    #[test]
    fn test_feedback_shifts_phase() {
        let mut c = body(&[2, 5]);
        c.step_with_feedbacks(0.1, &[1.0, -1.0]).unwrap();
        let phases = c.somite_phases();
        let omega = c.config().normal_angular_velocity;
        assert!((phases[0] - (omega + 1.0) * 0.1).abs() < 1e-12);
        assert!((phases[1] - (omega - 1.0) * 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_feedback_length_checked() {
        let mut c = body(&[1, 2]);
        let err = c.step_with_feedbacks(0.01, &[0.0]).unwrap_err();
        assert!(matches!(err, SimError::FeedbackLength { expected: 2, got: 1 }));
    }

    #[test]
    fn test_invalid_topology() {
        let cfg = CaterpillarConfig::default();
        assert!(Caterpillar::new(2, &[], cfg.clone()).is_err());
        assert!(Caterpillar::new(5, &[0], cfg.clone()).is_err());
        assert!(Caterpillar::new(5, &[4], cfg.clone()).is_err());
        assert!(Caterpillar::new(5, &[2, 2], cfg).is_err());
    }

    #[test]
    fn test_stiff_spring_diverges() {
        let cfg = CaterpillarConfig { sp_k: 1e9, ..CaterpillarConfig::default() };
        let mut c = Caterpillar::new(5, &[1, 2, 3], cfg).unwrap();
        let mut diverged = false;
        for _ in 0..2000 {
            match c.step_with_feedbacks(0.01, &[5.0, 5.0, 5.0]) {
                Ok(()) => {}
                Err(SimError::Diverged { .. }) => {
                    diverged = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(diverged, "explicit integration of a 1e9 N/m spring should blow up");
    }

    #[test]
    fn test_trace_decimation() {
        let mut c = body(&[]);
        for _ in 0..25 {
            c.step_with_feedbacks(0.01, &[]).unwrap();
        }
        // frames 0, 10, 20
        assert_eq!(c.trace().frames.len(), 3);
        assert_eq!(c.trace().frames[2].index, 2);
        assert_eq!(c.trace().objects.len(), 8);
    }

    #[test]
    fn test_recording_off_skips_frames() {
        let mut c = body(&[2, 4]);
        c.set_recording(false);
        for _ in 0..25 {
            c.step_with_feedbacks(0.01, &[0.0, 0.0]).unwrap();
        }
        assert!(c.trace().frames.is_empty());
        assert_eq!(c.frame_count(), 25);

        // frame indices stay tied to the step count once switched back on
        c.set_recording(true);
        for _ in 0..10 {
            c.step_with_feedbacks(0.01, &[0.0, 0.0]).unwrap();
        }
        let indices: Vec<usize> = c.trace().frames.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![3]);
    }

    #[test]
    fn test_wrap_angle() {
        assert!((wrap_angle(3.0 * PI / 2.0) + PI / 2.0).abs() < 1e-12);
        assert!((wrap_angle(-3.0 * PI / 2.0) - PI / 2.0).abs() < 1e-12);
        assert_eq!(wrap_angle(0.5), 0.5);
    }
}
