//! Robot-state telemetry assembly and publishing
//!
//! Every tick the controller assembles immutable snapshots of its state
//! and hands them to the publisher outside the core lock. Basic and
//! advanced state go out on latest-value channels (readers only ever see
//! the most recent tick); sensor data goes out on a lossy streaming
//! channel with a small bounded backlog.

use crate::clock;
use crate::state::{
    flags, CommandMode, ControllerState, ControllerStateKind, EndpointPose, EstopSource,
    OperationalMode, SpatialVelocity,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

/// Maximum sensor-data messages buffered per subscriber before the oldest
/// are dropped.
pub(crate) const SENSOR_DATA_BACKLOG: usize = 3;

/// Basic robot-state snapshot published every tick.
///
/// Joint vectors are defensive copies of the feedback (length N, or 0
/// during communication failure). The command mirrors carry the command
/// actually sent this tick, empty when none was.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RobotState {
    pub state_seqno: u64,
    pub command_mode: CommandMode,
    pub operational_mode: OperationalMode,
    pub controller_state: ControllerStateKind,
    pub robot_state_flags: u64,
    pub joint_position: Vec<f64>,
    pub joint_velocity: Vec<f64>,
    pub joint_effort: Vec<f64>,
    pub joint_position_command: Vec<f64>,
    pub joint_velocity_command: Vec<f64>,
    /// End-effector pose, zero- or one-element.
    pub endpoint_pose: Vec<EndpointPose>,
    /// End-effector spatial velocity, zero- or one-element.
    pub endpoint_vel: Vec<SpatialVelocity>,
}

/// Extended robot-state snapshot with unit codes and trajectory progress.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdvancedRobotState {
    #[serde(flatten)]
    pub base: RobotState,
    /// Per-joint position unit codes, length N.
    pub joint_position_units: Vec<u8>,
    /// Per-joint effort unit codes, length N.
    pub joint_effort_units: Vec<u8>,
    pub trajectory_running: bool,
    pub trajectory_time: f64,
    pub trajectory_max_time: f64,
    pub queued_trajectories: u32,
}

/// Header stamped onto streamed sensor data.
///
/// The clock UUID equals the robot's device UUID so consumers can match
/// the timestamp source to the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorDataHeader {
    pub seqno: u64,
    pub ts: DateTime<Utc>,
    pub clock_uuid: Uuid,
}

/// One sensor-data sample on the streaming pipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotStateSensorData {
    pub data_header: SensorDataHeader,
    pub robot_state: AdvancedRobotState,
}

impl RobotStateSensorData {
    pub(crate) fn new(device_uuid: Uuid, robot_state: AdvancedRobotState) -> Self {
        Self {
            data_header: SensorDataHeader {
                seqno: robot_state.base.state_seqno,
                ts: clock::utc_now(),
                clock_uuid: device_uuid,
            },
            robot_state,
        }
    }
}

/// Assemble the published flag bitmask from the controller state.
///
/// A communication failure masks everything else; consumers must treat the
/// rest of the snapshot as unreliable in that case.
pub(crate) fn fill_state_flags(
    ctrl: &ControllerState,
    position_command_sent: bool,
    velocity_command_sent: bool,
    trajectory_running: bool,
) -> u64 {
    if ctrl.communication_failure {
        return flags::COMMUNICATION_FAILURE;
    }

    let mut mask = 0u64;
    if ctrl.error {
        mask |= flags::ERROR;
    }
    if ctrl.stopped {
        mask |= flags::ESTOP;
        mask |= match ctrl.estop_source {
            EstopSource::None => 0,
            EstopSource::Button1 => flags::ESTOP_BUTTON1,
            EstopSource::Other => flags::ESTOP_OTHER,
            EstopSource::Fault => flags::ESTOP_FAULT,
            EstopSource::Internal => flags::ESTOP_INTERNAL,
        };
    }
    if ctrl.enabled {
        mask |= flags::ENABLED;
    }
    if ctrl.ready {
        mask |= flags::READY;
    }
    if ctrl.homed {
        mask |= flags::HOMED;
    } else {
        mask |= flags::HOMING_REQUIRED;
    }
    if position_command_sent {
        mask |= flags::VALID_POSITION_COMMAND;
    }
    if velocity_command_sent {
        mask |= flags::VALID_VELOCITY_COMMAND;
    }
    if trajectory_running {
        mask |= flags::TRAJECTORY_RUNNING;
    }
    mask
}

/// Fan-out point for the three telemetry channels.
///
/// The state channels overwrite (a slow reader sees only the latest tick);
/// the sensor-data pipe buffers up to [`SENSOR_DATA_BACKLOG`] messages per
/// subscriber and drops the oldest beyond that.
pub struct StatePublisher {
    state_tx: watch::Sender<RobotState>,
    advanced_tx: watch::Sender<AdvancedRobotState>,
    sensor_tx: broadcast::Sender<RobotStateSensorData>,
}

impl StatePublisher {
    pub(crate) fn new() -> Self {
        let (state_tx, _) = watch::channel(RobotState::default());
        let (advanced_tx, _) = watch::channel(AdvancedRobotState::default());
        let (sensor_tx, _) = broadcast::channel(SENSOR_DATA_BACKLOG);
        Self {
            state_tx,
            advanced_tx,
            sensor_tx,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RobotState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_advanced_state(&self) -> watch::Receiver<AdvancedRobotState> {
        self.advanced_tx.subscribe()
    }

    pub fn subscribe_sensor_data(&self) -> broadcast::Receiver<RobotStateSensorData> {
        self.sensor_tx.subscribe()
    }

    /// Publish one tick's snapshots. Never blocks; send errors only mean
    /// nobody is listening.
    pub(crate) fn publish(
        &self,
        state: RobotState,
        advanced: AdvancedRobotState,
        sensor: RobotStateSensorData,
    ) {
        self.state_tx.send_replace(state);
        self.advanced_tx.send_replace(advanced);
        let _ = self.sensor_tx.send(sensor);
    }
}
