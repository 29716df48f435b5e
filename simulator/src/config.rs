use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

use crate::error::SimError;

/// Physical parameters of the body and the ground.
///
/// Keys the physics does not model (tip friction coefficients, the friction
/// switch angle, horizontal joint stiffness) are ignored when loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaterpillarConfig {
    /// kg
    pub somite_mass: f64,
    /// m
    pub somite_radius: f64,
    /// Free-running oscillator speed, rad/s
    pub normal_angular_velocity: f64,
    /// Rest length of the spring between neighbours, m
    pub sp_natural_length: f64,
    /// N/m
    pub sp_k: f64,
    /// Damper between neighbours, Ns/m
    pub dp_c: f64,
    /// Actuator bending stiffness, Nm/rad
    pub vertical_ts_k: f64,
    /// Bending damping at actuator joints, Nms/rad
    pub vertical_ts_c: f64,
    /// Range of motion of each actuator, rad
    pub realtime_tunable_ts_rom: f64,
    pub static_friction_coeff: f64,
    pub dynamic_friction_coeff: f64,
    pub viscosity_friction_coeff: f64,
    pub gravitational_acceleration: f64,
}

impl Default for CaterpillarConfig {
    fn default() -> Self {
        CaterpillarConfig {
            somite_mass: 0.3,
            somite_radius: 0.35,
            normal_angular_velocity: PI,
            sp_natural_length: 0.7,
            sp_k: 80.0,
            dp_c: 10.0,
            vertical_ts_k: 80.0,
            vertical_ts_c: 1.0,
            realtime_tunable_ts_rom: PI / 3.0,
            static_friction_coeff: 1.0,
            dynamic_friction_coeff: 0.1,
            viscosity_friction_coeff: 10.0,
            gravitational_acceleration: 9.8065,
        }
    }
}

impl CaterpillarConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        let positive = [
            ("somite_mass", self.somite_mass),
            ("somite_radius", self.somite_radius),
            ("sp_natural_length", self.sp_natural_length),
        ];
        for (name, v) in positive {
            if !(v.is_finite() && v > 0.0) {
                return Err(SimError::Topology(format!("{name} must be positive, got {v}")));
            }
        }
        let non_negative = [
            ("sp_k", self.sp_k),
            ("dp_c", self.dp_c),
            ("vertical_ts_k", self.vertical_ts_k),
            ("vertical_ts_c", self.vertical_ts_c),
            ("static_friction_coeff", self.static_friction_coeff),
            ("dynamic_friction_coeff", self.dynamic_friction_coeff),
            ("viscosity_friction_coeff", self.viscosity_friction_coeff),
            ("gravitational_acceleration", self.gravitational_acceleration),
        ];
        for (name, v) in non_negative {
            if !(v.is_finite() && v >= 0.0) {
                return Err(SimError::Topology(format!("{name} must be non-negative, got {v}")));
            }
        }
        Ok(())
    }
}

impl fmt::Display for CaterpillarConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "somite_mass: {}", self.somite_mass)?;
        writeln!(f, "somite_radius: {}", self.somite_radius)?;
        writeln!(f, "normal_angular_velocity: {}", self.normal_angular_velocity)?;
        writeln!(f, "sp_natural_length: {}", self.sp_natural_length)?;
        writeln!(f, "sp_k: {}", self.sp_k)?;
        writeln!(f, "dp_c: {}", self.dp_c)?;
        writeln!(f, "vertical_ts_k: {}", self.vertical_ts_k)?;
        writeln!(f, "vertical_ts_c: {}", self.vertical_ts_c)?;
        writeln!(f, "realtime_tunable_ts_rom: {}", self.realtime_tunable_ts_rom)?;
        writeln!(f, "static_friction_coeff: {}", self.static_friction_coeff)?;
        writeln!(f, "dynamic_friction_coeff: {}", self.dynamic_friction_coeff)?;
        write!(f, "viscosity_friction_coeff: {}", self.viscosity_friction_coeff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_parameter_file_loads() {
        let json = r#"{
            "somite_mass": 0.3,
            "sp_k": 80.0,
            "horizon_ts_k0": 0.0,
            "horizon_ts_k1": 0.0,
            "tip_sub_static_friction_coeff": 1.0,
            "tip_sub_dynamic_friction_coeff": 0.7,
            "tip_sub_viscosity_friction_coeff": 0.5,
            "friction_switch_tan": 0.7,
            "dynamic_friction_coeff": 0.2
        }"#;
        let cfg: CaterpillarConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.dynamic_friction_coeff, 0.2);
        assert_eq!(cfg.somite_radius, CaterpillarConfig::default().somite_radius);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_negative_stiffness() {
        let cfg = CaterpillarConfig { sp_k: -1.0, ..CaterpillarConfig::default() };
        assert!(matches!(cfg.validate(), Err(SimError::Topology(_))));
    }
}
