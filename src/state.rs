//! Controller state model and feedback storage
//!
//! Collects every mutable controller-level field into one record so the
//! whole thing can live behind the single core lock, plus the feedback
//! snapshot written by the hardware transport.

use serde::{Deserialize, Serialize};

/// Active command source selected by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandMode {
    #[default]
    InvalidState,
    Halt,
    Jog,
    Homing,
    PositionCommand,
    VelocityCommand,
    Trajectory,
}

/// Operational mode reported by the robot controller cabinet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationalMode {
    #[default]
    Undefined,
    ManualReducedSpeed,
    ManualFullSpeed,
    Auto,
    Cobot,
}

/// Externally reported machine status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerStateKind {
    #[default]
    Undefined,
    MotorOff,
    MotorOn,
    EmergencyStop,
    GuardStop,
}

/// Origin of an emergency stop, when one is latched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstopSource {
    #[default]
    None,
    Button1,
    Other,
    Fault,
    Internal,
}

/// Bit labels for the published robot-state flag mask.
pub mod flags {
    pub const COMMUNICATION_FAILURE: u64 = 1 << 0;
    pub const ERROR: u64 = 1 << 1;
    pub const ESTOP: u64 = 1 << 2;
    pub const ESTOP_BUTTON1: u64 = 1 << 3;
    pub const ESTOP_OTHER: u64 = 1 << 4;
    pub const ESTOP_FAULT: u64 = 1 << 5;
    pub const ESTOP_INTERNAL: u64 = 1 << 6;
    pub const ENABLED: u64 = 1 << 7;
    pub const READY: u64 = 1 << 8;
    pub const HOMED: u64 = 1 << 9;
    pub const HOMING_REQUIRED: u64 = 1 << 10;
    pub const VALID_POSITION_COMMAND: u64 = 1 << 11;
    pub const VALID_VELOCITY_COMMAND: u64 = 1 << 12;
    pub const TRAJECTORY_RUNNING: u64 = 1 << 13;
}

/// Controller-level status record.
///
/// Every field is mutated only under the core lock; `state_seqno` advances
/// by exactly one per control tick.
#[derive(Debug, Clone)]
pub struct ControllerState {
    pub command_mode: CommandMode,
    pub operational_mode: OperationalMode,
    pub controller_state: ControllerStateKind,
    pub homed: bool,
    pub ready: bool,
    pub enabled: bool,
    pub stopped: bool,
    pub error: bool,
    pub communication_failure: bool,
    pub estop_source: EstopSource,
    pub state_seqno: u64,
    pub speed_ratio: f64,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            command_mode: CommandMode::InvalidState,
            operational_mode: OperationalMode::Undefined,
            controller_state: ControllerStateKind::Undefined,
            homed: false,
            ready: false,
            enabled: false,
            stopped: false,
            error: false,
            communication_failure: false,
            estop_source: EstopSource::None,
            state_seqno: 0,
            speed_ratio: 1.0,
        }
    }
}

/// End-effector pose: position in meters, orientation quaternion (w, x, y, z).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EndpointPose {
    pub position: [f64; 3],
    pub orientation: [f64; 4],
}

/// End-effector spatial velocity: angular (rad/s) and linear (m/s).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialVelocity {
    pub angular: [f64; 3],
    pub linear: [f64; 3],
}

/// Latest feedback received from the hardware transport.
///
/// Joint vectors have length N, or 0 while in communication failure. Each
/// group carries the monotonic arrival timestamp of its last update; the
/// verifier declares a communication failure when any of the three goes
/// stale.
#[derive(Debug, Clone, Default)]
pub struct RobotFeedback {
    pub joint_position: Vec<f64>,
    pub joint_velocity: Vec<f64>,
    pub joint_effort: Vec<f64>,
    pub endpoint_pose: Option<EndpointPose>,
    pub endpoint_velocity: Option<SpatialVelocity>,
    pub joint_ts_ms: Option<u64>,
    pub health_ts_ms: Option<u64>,
    pub endpoint_ts_ms: Option<u64>,
}

impl RobotFeedback {
    /// Drop all cached feedback, keeping timestamps cleared as well.
    pub(crate) fn clear(&mut self) {
        self.joint_position = Vec::new();
        self.joint_velocity = Vec::new();
        self.joint_effort = Vec::new();
        self.endpoint_pose = None;
        self.endpoint_velocity = None;
    }
}

/// Robot-health fields a transport may report alongside joint feedback.
///
/// `None` leaves the corresponding controller field untouched.
#[derive(Debug, Clone, Default)]
pub struct HealthUpdate {
    pub enabled: Option<bool>,
    pub ready: Option<bool>,
    pub homed: Option<bool>,
    pub stopped: Option<bool>,
    pub error: Option<bool>,
    pub estop_source: Option<EstopSource>,
    pub operational_mode: Option<OperationalMode>,
}
