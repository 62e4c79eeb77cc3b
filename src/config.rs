//! Robot configuration loading

use crate::{Result, RobotError};
use serde::{Deserialize, Serialize};
use std::fs;
use uuid::Uuid;

/// Static description of the controlled robot.
///
/// Immutable after construction; the joint count is implied by the number
/// of joint names. Tolerances are configured in degrees (the natural unit
/// for commissioning) and exposed in radians through the accessors below.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RobotConfig {
    /// Ordered joint names; the length defines the joint count N.
    pub joint_names: Vec<String>,
    /// Device UUID, also stamped into sensor-data headers.
    pub device_uuid: Uuid,
    #[serde(default)]
    pub tolerances: ToleranceConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToleranceConfig {
    /// Maximum per-joint jog step, degrees.
    pub jog_joint_limit_deg: Option<f64>,
    /// Jog completion tolerance, degrees.
    pub jog_joint_tol_deg: Option<f64>,
    /// Maximum deviation between trajectory setpoint and feedback, degrees.
    pub trajectory_error_tol_deg: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TimingConfig {
    /// Jog command expiry, milliseconds.
    pub jog_joint_timeout_ms: Option<u64>,
    /// Feedback staleness threshold, milliseconds.
    pub communication_timeout_ms: Option<u64>,
    /// Control loop period, milliseconds.
    pub tick_period_ms: Option<u64>,
}

impl RobotConfig {
    /// Build a configuration for `joint_count` joints with generated joint
    /// names and a random device UUID. Intended for embedders and tests.
    pub fn with_joint_count(joint_count: usize) -> Self {
        Self {
            joint_names: (1..=joint_count).map(|i| format!("joint_{}", i)).collect(),
            device_uuid: Uuid::new_v4(),
            tolerances: ToleranceConfig::default(),
            timing: TimingConfig::default(),
        }
    }

    pub fn load_from_path(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| RobotError::Config(format!("Failed to read {}: {}", path, e)))?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: RobotConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check structural invariants (at least one joint, unique names).
    pub fn validate(&self) -> Result<()> {
        if self.joint_names.is_empty() {
            return Err(RobotError::Config(
                "joint_names must contain at least one joint".to_string(),
            ));
        }
        for (i, name) in self.joint_names.iter().enumerate() {
            if self.joint_names[..i].contains(name) {
                return Err(RobotError::Config(format!("duplicate joint name: {}", name)));
            }
        }
        Ok(())
    }

    /// Number of controlled joints N.
    pub fn joint_count(&self) -> usize {
        self.joint_names.len()
    }

    /// Maximum per-joint jog step, radians.
    pub fn jog_joint_limit(&self) -> f64 {
        self.tolerances.jog_joint_limit_deg.unwrap_or(15.0).to_radians()
    }

    /// Jog completion tolerance, radians.
    pub fn jog_joint_tol(&self) -> f64 {
        self.tolerances.jog_joint_tol_deg.unwrap_or(0.1).to_radians()
    }

    /// Trajectory tracking tolerance, radians.
    pub fn trajectory_error_tol(&self) -> f64 {
        self.tolerances.trajectory_error_tol_deg.unwrap_or(5.0).to_radians()
    }

    pub fn jog_joint_timeout_ms(&self) -> u64 {
        self.timing.jog_joint_timeout_ms.unwrap_or(5_000)
    }

    pub fn communication_timeout_ms(&self) -> u64 {
        self.timing.communication_timeout_ms.unwrap_or(250)
    }

    pub fn tick_period_ms(&self) -> u64 {
        self.timing.tick_period_ms.unwrap_or(10)
    }
}
