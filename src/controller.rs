//! Robot controller core
//!
//! Owns the per-tick control cycle: communication and state verification,
//! command-source selection (jog, streamed position, streamed velocity,
//! queued trajectory), and state snapshot assembly. All mutable controller
//! state lives behind a single lock whose holds are CPU-bounded; command
//! sends and telemetry publishing happen outside it.

use crate::clock::MonotonicClock;
use crate::config::RobotConfig;
use crate::interpolator::{JointTrajectory, TrajectoryInterpolatorFactory};
use crate::publisher::{
    self, AdvancedRobotState, RobotState, RobotStateSensorData, StatePublisher,
};
use crate::state::{
    CommandMode, ControllerState, ControllerStateKind, EndpointPose, HealthUpdate, RobotFeedback,
    SpatialVelocity,
};
use crate::trajectory::{self, SetpointResult, TaskFailure, TaskInner, TrajectoryTask};
use crate::transport::{ClientEndpoint, EndpointHealth, RobotTransport};
use crate::wire::{self, EffortUnits, JointCommandPayload, PositionUnits, WireCommandState};
use crate::{Result, RobotError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

/// Jog command source state.
#[derive(Default)]
pub(crate) struct JogState {
    pub target: Option<Vec<f64>>,
    pub last_command_ms: u64,
    pub completion: Option<oneshot::Sender<Result<()>>>,
}

/// All mutable controller state, guarded by the core lock.
#[derive(Default)]
pub(crate) struct CoreState {
    pub ctrl: ControllerState,
    pub feedback: RobotFeedback,
    pub jog: JogState,
    pub wire_position: WireCommandState,
    pub wire_velocity: WireCommandState,
    pub active_trajectory: Option<Arc<TaskInner>>,
    pub queued_trajectories: VecDeque<Arc<TaskInner>>,
    /// Trajectory reporting fields, refreshed every tick.
    pub trajectory_valid: bool,
    pub trajectory_time: f64,
    pub trajectory_max_time: f64,
    /// Command actually sent this tick, mirrored into published state.
    pub last_position_command: Vec<f64>,
    pub last_velocity_command: Vec<f64>,
}

pub(crate) struct ControllerCore {
    pub(crate) config: RobotConfig,
    pub(crate) clock: MonotonicClock,
    pub(crate) state: Mutex<CoreState>,
    transport: Arc<dyn RobotTransport>,
    endpoint_health: Arc<dyn EndpointHealth>,
    interpolator_factory: Arc<dyn TrajectoryInterpolatorFactory>,
    publisher: StatePublisher,
}

impl ControllerCore {
    /// Run one control cycle at monotonic time `now_ms`.
    pub(crate) fn tick_at(&self, now_ms: u64) {
        let (command, state, advanced, sensor) = {
            let mut s = self.state.lock();
            s.ctrl.state_seqno += 1;

            let comm_ok = self.verify_communication(&mut s, now_ms);
            let state_ok = comm_ok && self.verify_robot_state(&mut s);
            let command = if state_ok {
                Some(self.fill_robot_command(&mut s, now_ms))
            } else {
                s.wire_position.sent_this_tick = false;
                s.wire_velocity.sent_this_tick = false;
                s.trajectory_valid = false;
                s.trajectory_time = 0.0;
                s.trajectory_max_time = 0.0;
                None
            };

            match &command {
                Some((position, velocity)) => {
                    s.last_position_command = position.clone().unwrap_or_default();
                    s.last_velocity_command = velocity.clone().unwrap_or_default();
                }
                None => {
                    s.last_position_command = Vec::new();
                    s.last_velocity_command = Vec::new();
                }
            }

            let (state, advanced, sensor) = self.fill_states(&s);
            (command, state, advanced, sensor)
        };

        // I/O strictly outside the lock. Send failures are dropped; the
        // next tick reattempts.
        if let Some((position, velocity)) = command {
            if let Err(e) =
                self.transport
                    .send_robot_command(now_ms, position.as_deref(), velocity.as_deref())
            {
                debug!("robot command send failed, dropping: {}", e);
            }
        }
        self.publisher.publish(state, advanced, sensor);
    }

    /// Declare a communication failure when any feedback group is stale.
    fn verify_communication(&self, s: &mut CoreState, now_ms: u64) -> bool {
        let timeout = self.config.communication_timeout_ms();
        let stale = |ts: Option<u64>| match ts {
            Some(t) => now_ms.saturating_sub(t) > timeout,
            None => true,
        };
        let failed = stale(s.feedback.joint_ts_ms)
            || stale(s.feedback.health_ts_ms)
            || stale(s.feedback.endpoint_ts_ms);

        if failed {
            if !s.ctrl.communication_failure {
                warn!("robot feedback stale for more than {} ms", timeout);
            }
            s.ctrl.communication_failure = true;
            s.ctrl.command_mode = CommandMode::InvalidState;
            s.ctrl.operational_mode = Default::default();
            s.ctrl.controller_state = Self::stop_controller_state(&s.ctrl);
            s.feedback.clear();
            false
        } else {
            if s.ctrl.communication_failure {
                info!("robot communication restored");
            }
            s.ctrl.communication_failure = false;
            true
        }
    }

    fn stop_controller_state(ctrl: &ControllerState) -> ControllerStateKind {
        if ctrl.stopped {
            ControllerStateKind::EmergencyStop
        } else if ctrl.error {
            ControllerStateKind::GuardStop
        } else {
            ControllerStateKind::MotorOff
        }
    }

    /// Gate the command mode on the reported robot health.
    fn verify_robot_state(&self, s: &mut CoreState) -> bool {
        let ctrl = &mut s.ctrl;
        if ctrl.command_mode == CommandMode::Homing && ctrl.enabled && !ctrl.error {
            ctrl.controller_state = ControllerStateKind::MotorOff;
            return true;
        }
        if !ctrl.ready {
            ctrl.controller_state = Self::stop_controller_state(ctrl);
            ctrl.command_mode = CommandMode::InvalidState;
            return false;
        }
        if !ctrl.enabled {
            ctrl.controller_state = ControllerStateKind::MotorOff;
            ctrl.command_mode = CommandMode::InvalidState;
            return false;
        }
        if ctrl.command_mode == CommandMode::InvalidState {
            ctrl.command_mode = CommandMode::Halt;
        }
        ctrl.controller_state = ControllerStateKind::MotorOn;
        true
    }

    /// Select and validate the active command source for this tick.
    ///
    /// At most one of the returned position/velocity commands is present.
    fn fill_robot_command(
        &self,
        s: &mut CoreState,
        now_ms: u64,
    ) -> (Option<Vec<f64>>, Option<Vec<f64>>) {
        s.wire_position.sent_this_tick = false;
        s.wire_velocity.sent_this_tick = false;
        s.trajectory_valid = false;
        s.trajectory_time = 0.0;
        s.trajectory_max_time = 0.0;

        if s.ctrl.command_mode != CommandMode::Trajectory {
            self.abort_all_trajectories(s, "command mode no longer accepts trajectories");
        }

        match s.ctrl.command_mode {
            CommandMode::Jog => (self.fill_jog_command(s, now_ms), None),
            CommandMode::PositionCommand => (self.read_position_wire(s), None),
            CommandMode::VelocityCommand => (None, self.read_velocity_wire(s)),
            CommandMode::Trajectory => self.advance_trajectory(s, now_ms),
            CommandMode::Halt | CommandMode::Homing | CommandMode::InvalidState => (None, None),
        }
    }

    fn fill_jog_command(&self, s: &mut CoreState, now_ms: u64) -> Option<Vec<f64>> {
        let Some(target) = s.jog.target.clone() else {
            if let Some(tx) = s.jog.completion.take() {
                let _ = tx.send(Err(RobotError::TimedOut("no jog target".to_string())));
            }
            return None;
        };

        if now_ms.saturating_sub(s.jog.last_command_ms) > self.config.jog_joint_timeout_ms() {
            s.jog.target = None;
            if let Some(tx) = s.jog.completion.take() {
                let _ = tx.send(Err(RobotError::TimedOut(
                    "jog timed out before reaching target".to_string(),
                )));
            }
            return None;
        }

        let tol = self.config.jog_joint_tol();
        let within = s.feedback.joint_position.len() == target.len()
            && s.feedback
                .joint_position
                .iter()
                .zip(target.iter())
                .all(|(measured, wanted)| (measured - wanted).abs() <= tol);
        if within {
            if let Some(tx) = s.jog.completion.take() {
                let _ = tx.send(Ok(()));
            }
            None
        } else {
            Some(target)
        }
    }

    fn read_position_wire(&self, s: &mut CoreState) -> Option<Vec<f64>> {
        let n = self.config.joint_count();
        let state_seqno = s.ctrl.state_seqno;
        let ws = &mut s.wire_position;
        let (endpoint, payload) = ws.slot.clone()?;

        if ws.last_endpoint != Some(endpoint) {
            ws.last_endpoint = Some(endpoint);
            ws.last_seqno = 0;
        }
        if payload.seqno <= ws.last_seqno {
            return None;
        }
        if state_seqno.abs_diff(payload.state_seqno) > wire::STATE_SEQNO_WINDOW {
            debug!(
                "rejecting position command with stale state_seqno {}",
                payload.state_seqno
            );
            return None;
        }
        if payload.command.len() != n {
            debug!(
                "rejecting position command of length {}, expected {}",
                payload.command.len(),
                n
            );
            return None;
        }
        if !payload.units.is_empty() && payload.units.len() != n {
            return None;
        }
        let command = wire::convert_position_command(&payload.command, &payload.units)?;

        ws.last_seqno = payload.seqno;
        ws.sent_this_tick = true;
        Some(command)
    }

    fn read_velocity_wire(&self, s: &mut CoreState) -> Option<Vec<f64>> {
        let n = self.config.joint_count();
        let state_seqno = s.ctrl.state_seqno;
        let speed_ratio = s.ctrl.speed_ratio;
        let ws = &mut s.wire_velocity;
        let (endpoint, payload) = ws.slot.clone()?;

        if ws.last_endpoint != Some(endpoint) {
            ws.last_endpoint = Some(endpoint);
            ws.last_seqno = 0;
        }
        if payload.seqno <= ws.last_seqno {
            return None;
        }
        if state_seqno.abs_diff(payload.state_seqno) > wire::STATE_SEQNO_WINDOW {
            debug!(
                "rejecting velocity command with stale state_seqno {}",
                payload.state_seqno
            );
            return None;
        }
        if payload.command.len() != n {
            return None;
        }
        if !payload.units.is_empty() && payload.units.len() != n {
            return None;
        }
        let mut command = wire::convert_velocity_command(&payload.command, &payload.units)?;
        if (speed_ratio - 1.0).abs() > f64::EPSILON {
            for value in &mut command {
                *value *= speed_ratio;
            }
        }

        ws.last_seqno = payload.seqno;
        ws.sent_this_tick = true;
        Some(command)
    }

    fn advance_trajectory(
        &self,
        s: &mut CoreState,
        now_ms: u64,
    ) -> (Option<Vec<f64>>, Option<Vec<f64>>) {
        let Some(active) = s.active_trajectory.clone() else {
            return (None, None);
        };

        match active.get_setpoint(now_ms, &s.feedback.joint_position) {
            SetpointResult::Ready { max_time } => {
                s.trajectory_valid = true;
                s.trajectory_max_time = max_time;
                (None, None)
            }
            SetpointResult::FirstValid {
                positions,
                time,
                max_time,
            }
            | SetpointResult::Valid {
                positions,
                time,
                max_time,
            } => {
                s.trajectory_valid = true;
                s.trajectory_time = time;
                s.trajectory_max_time = max_time;
                (Some(positions), None)
            }
            SetpointResult::Complete {
                positions,
                time,
                max_time,
            } => {
                s.trajectory_valid = true;
                s.trajectory_time = time;
                s.trajectory_max_time = max_time;
                s.active_trajectory = s.queued_trajectories.pop_front();
                if s.active_trajectory.is_some() {
                    info!("trajectory complete, promoting queued trajectory");
                } else {
                    info!("trajectory complete");
                }
                (Some(positions), None)
            }
            SetpointResult::ToleranceError | SetpointResult::Failed => {
                s.active_trajectory = None;
                for task in s.queued_trajectories.drain(..) {
                    task.fail(TaskFailure::Aborted(
                        "preceding trajectory failed".to_string(),
                    ));
                }
                (None, None)
            }
        }
    }

    fn abort_all_trajectories(&self, s: &mut CoreState, reason: &str) {
        if s.active_trajectory.is_none() && s.queued_trajectories.is_empty() {
            return;
        }
        info!("aborting trajectories: {}", reason);
        if let Some(active) = s.active_trajectory.take() {
            active.fail(TaskFailure::Aborted(reason.to_string()));
        }
        for task in s.queued_trajectories.drain(..) {
            task.fail(TaskFailure::Aborted(reason.to_string()));
        }
    }

    /// Detach a task from the active slot or the queue. Cancelling the
    /// active task cancels everything queued behind it; a task that is in
    /// neither place is left alone.
    pub(crate) fn remove_trajectory(&self, s: &mut CoreState, task: &Arc<TaskInner>) {
        let was_active = s
            .active_trajectory
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, task));
        if was_active {
            s.active_trajectory = None;
            for queued in s.queued_trajectories.drain(..) {
                queued.fail(TaskFailure::Aborted(
                    "active trajectory cancelled".to_string(),
                ));
            }
        } else if let Some(index) = s
            .queued_trajectories
            .iter()
            .position(|queued| Arc::ptr_eq(queued, task))
        {
            s.queued_trajectories.remove(index);
        }
    }

    /// Assemble the three published snapshots. Joint vectors are copied so
    /// nothing aliases the lock-guarded feedback after release.
    fn fill_states(
        &self,
        s: &CoreState,
    ) -> (RobotState, AdvancedRobotState, RobotStateSensorData) {
        let n = self.config.joint_count();
        let trajectory_running = s.trajectory_valid;
        let robot_state_flags = publisher::fill_state_flags(
            &s.ctrl,
            s.wire_position.sent_this_tick,
            s.wire_velocity.sent_this_tick,
            trajectory_running,
        );

        let state = RobotState {
            state_seqno: s.ctrl.state_seqno,
            command_mode: s.ctrl.command_mode,
            operational_mode: s.ctrl.operational_mode,
            controller_state: s.ctrl.controller_state,
            robot_state_flags,
            joint_position: s.feedback.joint_position.clone(),
            joint_velocity: s.feedback.joint_velocity.clone(),
            joint_effort: s.feedback.joint_effort.clone(),
            joint_position_command: s.last_position_command.clone(),
            joint_velocity_command: s.last_velocity_command.clone(),
            endpoint_pose: s.feedback.endpoint_pose.into_iter().collect(),
            endpoint_vel: s.feedback.endpoint_velocity.into_iter().collect(),
        };
        let advanced = AdvancedRobotState {
            base: state.clone(),
            joint_position_units: vec![PositionUnits::Radian as u8; n],
            joint_effort_units: vec![EffortUnits::NewtonMeter as u8; n],
            trajectory_running,
            trajectory_time: s.trajectory_time,
            trajectory_max_time: s.trajectory_max_time,
            queued_trajectories: s.queued_trajectories.len() as u32,
        };
        let sensor = RobotStateSensorData::new(self.config.device_uuid, advanced.clone());
        (state, advanced, sensor)
    }
}

/// Handle to the robot controller core.
///
/// Cheap to clone; all clones share the same core. The control loop, the
/// transport feedback callbacks, and any number of client-facing API
/// handlers operate on it concurrently.
#[derive(Clone)]
pub struct RobotController {
    core: Arc<ControllerCore>,
}

impl RobotController {
    pub fn new(
        config: RobotConfig,
        transport: Arc<dyn RobotTransport>,
        interpolator_factory: Arc<dyn TrajectoryInterpolatorFactory>,
        endpoint_health: Arc<dyn EndpointHealth>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            "initializing robot controller: {} joints, device {}",
            config.joint_count(),
            config.device_uuid
        );
        Ok(Self {
            core: Arc::new(ControllerCore {
                config,
                clock: MonotonicClock::new(),
                state: Mutex::new(CoreState::default()),
                transport,
                endpoint_health,
                interpolator_factory,
                publisher: StatePublisher::new(),
            }),
        })
    }

    /// Advance the control loop by one cycle. Normally driven by the
    /// [`crate::control_loop`] thread; embedders with their own scheduler
    /// may call it directly.
    pub fn tick(&self) {
        self.core.tick_at(self.core.clock.now_ms());
    }

    #[cfg(test)]
    pub(crate) fn tick_at(&self, now_ms: u64) {
        self.core.tick_at(now_ms);
    }

    // ---- feedback ingress (called by the hardware transport) ----

    /// Replace the joint feedback vectors and stamp their arrival time.
    pub fn update_joint_feedback(&self, position: Vec<f64>, velocity: Vec<f64>, effort: Vec<f64>) {
        self.update_joint_feedback_at(self.core.clock.now_ms(), position, velocity, effort);
    }

    pub(crate) fn update_joint_feedback_at(
        &self,
        now_ms: u64,
        position: Vec<f64>,
        velocity: Vec<f64>,
        effort: Vec<f64>,
    ) {
        let mut s = self.core.state.lock();
        s.feedback.joint_position = position;
        s.feedback.joint_velocity = velocity;
        s.feedback.joint_effort = effort;
        s.feedback.joint_ts_ms = Some(now_ms);
    }

    /// Apply robot-health fields reported by the transport.
    pub fn update_health_feedback(&self, update: HealthUpdate) {
        self.update_health_feedback_at(self.core.clock.now_ms(), update);
    }

    pub(crate) fn update_health_feedback_at(&self, now_ms: u64, update: HealthUpdate) {
        let mut s = self.core.state.lock();
        let ctrl = &mut s.ctrl;
        if let Some(enabled) = update.enabled {
            ctrl.enabled = enabled;
        }
        if let Some(ready) = update.ready {
            ctrl.ready = ready;
        }
        if let Some(homed) = update.homed {
            ctrl.homed = homed;
        }
        if let Some(stopped) = update.stopped {
            ctrl.stopped = stopped;
        }
        if let Some(error) = update.error {
            ctrl.error = error;
        }
        if let Some(source) = update.estop_source {
            ctrl.estop_source = source;
        }
        if let Some(mode) = update.operational_mode {
            ctrl.operational_mode = mode;
        }
        s.feedback.health_ts_ms = Some(now_ms);
    }

    /// Update the end-effector pose and spatial velocity feedback.
    pub fn update_endpoint_feedback(
        &self,
        pose: Option<EndpointPose>,
        velocity: Option<SpatialVelocity>,
    ) {
        self.update_endpoint_feedback_at(self.core.clock.now_ms(), pose, velocity);
    }

    pub(crate) fn update_endpoint_feedback_at(
        &self,
        now_ms: u64,
        pose: Option<EndpointPose>,
        velocity: Option<SpatialVelocity>,
    ) {
        let mut s = self.core.state.lock();
        s.feedback.endpoint_pose = pose;
        s.feedback.endpoint_velocity = velocity;
        s.feedback.endpoint_ts_ms = Some(now_ms);
    }

    // ---- streamed command ingress (called by the RPC layer) ----

    /// Latest-value position command wire. Overwrites any unread payload.
    pub fn post_position_command(&self, endpoint: ClientEndpoint, payload: JointCommandPayload) {
        self.core.state.lock().wire_position.slot = Some((endpoint, payload));
    }

    /// Latest-value velocity command wire. Overwrites any unread payload.
    pub fn post_velocity_command(&self, endpoint: ClientEndpoint, payload: JointCommandPayload) {
        self.core.state.lock().wire_velocity.slot = Some((endpoint, payload));
    }

    // ---- client API ----

    /// Change the active command source.
    ///
    /// `homing` may be entered from `invalid_state` on an enabled
    /// controller; every other transition requires a ready controller and
    /// passes through `halt`.
    pub fn set_command_mode(&self, target: CommandMode) -> Result<()> {
        let mut s = self.core.state.lock();
        if target == CommandMode::InvalidState {
            return Err(RobotError::InvalidArgument(
                "invalid_state cannot be requested".to_string(),
            ));
        }
        let current = s.ctrl.command_mode;
        if current == CommandMode::InvalidState && target == CommandMode::Homing {
            if !s.ctrl.enabled || s.ctrl.communication_failure {
                return Err(RobotError::InvalidState(
                    "homing requires an enabled controller".to_string(),
                ));
            }
        } else {
            if !s.ctrl.ready || s.ctrl.communication_failure {
                return Err(RobotError::InvalidState(
                    "controller is not ready".to_string(),
                ));
            }
            if target != CommandMode::Halt && current != CommandMode::Halt {
                return Err(RobotError::InvalidState(format!(
                    "{:?} must be entered from halt",
                    target
                )));
            }
        }

        if target != current {
            if let Some(tx) = s.jog.completion.take() {
                let _ = tx.send(Err(RobotError::Aborted("command mode changed".to_string())));
            }
            info!("command mode {:?} -> {:?}", current, target);
        }
        if target == CommandMode::Jog {
            s.jog.target = None;
        }
        s.ctrl.command_mode = target;
        Ok(())
    }

    /// Request a bounded manual move of all joints.
    ///
    /// With `wait`, resolves once the measured position is within the jog
    /// tolerance of the target, or fails on timeout or supersession.
    pub async fn jog_joint(
        &self,
        target: &[f64],
        max_velocity: &[f64],
        relative: bool,
        wait: bool,
    ) -> Result<()> {
        let completion = {
            let mut s = self.core.state.lock();
            if s.ctrl.command_mode != CommandMode::Jog {
                return Err(RobotError::InvalidState(
                    "jogging requires jog command mode".to_string(),
                ));
            }
            if !s.ctrl.ready {
                return Err(RobotError::InvalidState(
                    "controller is not ready".to_string(),
                ));
            }
            let n = self.core.config.joint_count();
            if s.feedback.joint_position.len() != n {
                return Err(RobotError::InvalidState(
                    "no joint feedback available".to_string(),
                ));
            }
            if target.len() != n {
                return Err(RobotError::InvalidArgument(format!(
                    "jog target has {} joints, expected {}",
                    target.len(),
                    n
                )));
            }
            if max_velocity.len() != n {
                return Err(RobotError::InvalidArgument(format!(
                    "jog max velocity has {} joints, expected {}",
                    max_velocity.len(),
                    n
                )));
            }

            let absolute: Vec<f64> = if relative {
                s.feedback
                    .joint_position
                    .iter()
                    .zip(target.iter())
                    .map(|(current, step)| current + step)
                    .collect()
            } else {
                target.to_vec()
            };
            let limit = self.core.config.jog_joint_limit();
            for (i, (wanted, current)) in
                absolute.iter().zip(s.feedback.joint_position.iter()).enumerate()
            {
                if (wanted - current).abs() > limit {
                    return Err(RobotError::InvalidArgument(format!(
                        "jog step of joint {} exceeds the {:.4} rad limit",
                        i, limit
                    )));
                }
            }

            // A newer jog supersedes any jog still in flight.
            if let Some(tx) = s.jog.completion.take() {
                let _ = tx.send(Err(RobotError::Aborted(
                    "superseded by a newer jog command".to_string(),
                )));
            }
            s.jog.target = Some(absolute);
            s.jog.last_command_ms = self.core.clock.now_ms();

            if wait {
                let (tx, rx) = oneshot::channel();
                s.jog.completion = Some(tx);
                Some(rx)
            } else {
                None
            }
        };

        match completion {
            None => Ok(()),
            Some(rx) => rx
                .await
                .map_err(|_| RobotError::Aborted("jog completion dropped".to_string()))?,
        }
    }

    /// Submit a trajectory for execution.
    ///
    /// The interpolator is built outside the core lock; the result is
    /// committed as the active trajectory, or queued behind it, and handed
    /// back as the client's progress stream.
    pub async fn execute_trajectory(
        &self,
        endpoint: ClientEndpoint,
        trajectory: JointTrajectory,
    ) -> Result<TrajectoryTask> {
        let n = self.core.config.joint_count();
        let (speed_ratio, current) = {
            let s = self.core.state.lock();
            if s.ctrl.command_mode != CommandMode::Trajectory {
                return Err(RobotError::InvalidState(
                    "trajectory execution requires trajectory command mode".to_string(),
                ));
            }
            if s.feedback.joint_position.len() != n {
                return Err(RobotError::InvalidState(
                    "no joint feedback available".to_string(),
                ));
            }
            (s.ctrl.speed_ratio, s.feedback.joint_position.clone())
        };

        let interpolator = self.core.interpolator_factory.build(&trajectory, speed_ratio)?;
        let (start, _) = interpolator.interpolate(0.0)?;
        if start.len() != n {
            return Err(RobotError::InvalidArgument(format!(
                "trajectory waypoints have {} joints, expected {}",
                start.len(),
                n
            )));
        }
        let tol = self.core.config.trajectory_error_tol();
        for (i, (setpoint, measured)) in start.iter().zip(current.iter()).enumerate() {
            if (setpoint - measured).abs() > tol {
                return Err(RobotError::InvalidArgument(format!(
                    "trajectory start deviates {:.4} rad from joint {}",
                    (setpoint - measured).abs(),
                    i
                )));
            }
        }

        let task = {
            let mut s = self.core.state.lock();
            if s.ctrl.command_mode != CommandMode::Trajectory {
                return Err(RobotError::Aborted(
                    "command mode changed during trajectory load".to_string(),
                ));
            }
            let queued = s.active_trajectory.is_some();
            let inner = Arc::new(TaskInner::new(
                Arc::downgrade(&self.core),
                interpolator,
                endpoint,
                tol,
                queued,
            ));
            if queued {
                s.queued_trajectories.push_back(inner.clone());
                debug!(
                    "trajectory queued behind {} others",
                    s.queued_trajectories.len() - 1
                );
            } else {
                debug!("trajectory installed as active");
                s.active_trajectory = Some(inner.clone());
            }
            TrajectoryTask::new(inner)
        };
        trajectory::spawn_liveness_watcher(
            task.inner().clone(),
            self.core.endpoint_health.clone(),
        );
        Ok(task)
    }

    /// Stop commanding motion. A no-op while the controller is in
    /// `invalid_state`; idempotent otherwise.
    pub fn halt(&self) -> Result<()> {
        let mut s = self.core.state.lock();
        if s.ctrl.command_mode != CommandMode::InvalidState {
            s.ctrl.command_mode = CommandMode::Halt;
        }
        Ok(())
    }

    pub async fn enable(&self) -> Result<()> {
        self.core
            .transport
            .send_enable()
            .await
            .map_err(|e| RobotError::Failed(format!("enable request failed: {}", e)))
    }

    pub async fn disable(&self) -> Result<()> {
        self.core
            .transport
            .send_disable()
            .await
            .map_err(|e| RobotError::Failed(format!("disable request failed: {}", e)))
    }

    pub async fn reset_errors(&self) -> Result<()> {
        self.core
            .transport
            .send_reset_errors()
            .await
            .map_err(|e| RobotError::Failed(format!("error reset request failed: {}", e)))
    }

    pub fn speed_ratio(&self) -> f64 {
        self.core.state.lock().ctrl.speed_ratio
    }

    /// Set the speed ratio applied to velocity commands and newly
    /// submitted trajectories. Accepts `[0.1, 10.0]`.
    pub fn set_speed_ratio(&self, ratio: f64) -> Result<()> {
        if !(0.1..=10.0).contains(&ratio) {
            return Err(RobotError::InvalidArgument(format!(
                "speed ratio {} outside [0.1, 10.0]",
                ratio
            )));
        }
        self.core.state.lock().ctrl.speed_ratio = ratio;
        Ok(())
    }

    /// The immutable robot description.
    pub fn robot_info(&self) -> RobotConfig {
        self.core.config.clone()
    }

    pub fn command_mode(&self) -> CommandMode {
        self.core.state.lock().ctrl.command_mode
    }

    pub fn controller_state(&self) -> ControllerStateKind {
        self.core.state.lock().ctrl.controller_state
    }

    pub fn state_seqno(&self) -> u64 {
        self.core.state.lock().ctrl.state_seqno
    }

    // ---- telemetry subscriptions ----

    pub fn subscribe_state(&self) -> watch::Receiver<RobotState> {
        self.core.publisher.subscribe_state()
    }

    pub fn subscribe_advanced_state(&self) -> watch::Receiver<AdvancedRobotState> {
        self.core.publisher.subscribe_advanced_state()
    }

    pub fn subscribe_sensor_data(&self) -> broadcast::Receiver<RobotStateSensorData> {
        self.core.publisher.subscribe_sensor_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ramp_trajectory, RampFactory, RecordingTransport, SwitchableHealth};
    use crate::state::flags;
    use crate::trajectory::TrajectoryProgress;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn test_controller() -> (RobotController, Arc<RecordingTransport>, Arc<SwitchableHealth>) {
        let transport = Arc::new(RecordingTransport::default());
        let health = Arc::new(SwitchableHealth::new(true));
        let controller = RobotController::new(
            RobotConfig::with_joint_count(6),
            transport.clone(),
            Arc::new(RampFactory),
            health.clone(),
        )
        .unwrap();
        (controller, transport, health)
    }

    fn deliver_full_feedback(controller: &RobotController, now_ms: u64) {
        controller.update_joint_feedback_at(now_ms, vec![0.0; 6], vec![0.0; 6], vec![0.0; 6]);
        controller.update_health_feedback_at(
            now_ms,
            HealthUpdate {
                enabled: Some(true),
                ready: Some(true),
                homed: Some(true),
                ..Default::default()
            },
        );
        controller.update_endpoint_feedback_at(now_ms, None, None);
    }

    /// Feedback delivered, one tick run: the controller lands in halt.
    fn ready_controller() -> (RobotController, Arc<RecordingTransport>, Arc<SwitchableHealth>) {
        let (controller, transport, health) = test_controller();
        deliver_full_feedback(&controller, 0);
        controller.tick_at(10);
        assert_eq!(controller.command_mode(), CommandMode::Halt);
        (controller, transport, health)
    }

    fn payload(seqno: u64, state_seqno: u64, command: Vec<f64>) -> JointCommandPayload {
        JointCommandPayload {
            seqno,
            state_seqno,
            command,
            units: Vec::new(),
        }
    }

    #[test]
    fn test_startup_reports_communication_failure() {
        let (controller, transport, _) = test_controller();
        controller.tick_at(5);

        let state = controller.subscribe_state().borrow().clone();
        assert_eq!(state.state_seqno, 1);
        assert_eq!(state.robot_state_flags, flags::COMMUNICATION_FAILURE);
        assert!(state.joint_position.is_empty());
        assert_eq!(controller.command_mode(), CommandMode::InvalidState);
        assert!(transport.sent.lock().is_empty());
    }

    #[test]
    fn test_state_seqno_increments_per_tick() {
        let (controller, _, _) = test_controller();
        for i in 1..=5 {
            controller.tick_at(i);
            assert_eq!(controller.state_seqno(), i);
        }
    }

    #[test]
    fn test_communication_failure_clears_feedback_and_mode() {
        let (controller, _, _) = ready_controller();
        controller.set_command_mode(CommandMode::PositionCommand).unwrap();

        controller.tick_at(400);
        assert_eq!(controller.command_mode(), CommandMode::InvalidState);
        let state = controller.subscribe_state().borrow().clone();
        assert_eq!(state.robot_state_flags, flags::COMMUNICATION_FAILURE);
        assert!(state.joint_position.is_empty());
        assert!(matches!(
            controller.controller_state(),
            ControllerStateKind::MotorOff
                | ControllerStateKind::EmergencyStop
                | ControllerStateKind::GuardStop
        ));
    }

    #[test]
    fn test_enter_position_mode_and_stream() {
        let (controller, transport, _) = ready_controller();
        controller.set_command_mode(CommandMode::Halt).unwrap();
        controller.set_command_mode(CommandMode::PositionCommand).unwrap();

        let seqno = controller.state_seqno();
        controller.post_position_command(1, payload(1, seqno, vec![0.0; 6]));
        controller.tick_at(20);

        let sent = transport.last_sent().unwrap();
        assert_eq!(sent.position, Some(vec![0.0; 6]));
        assert_eq!(sent.velocity, None);
        let state = controller.subscribe_state().borrow().clone();
        assert_ne!(state.robot_state_flags & flags::VALID_POSITION_COMMAND, 0);
        assert_eq!(state.joint_position_command, vec![0.0; 6]);
    }

    #[test]
    fn test_velocity_scaling_by_speed_ratio() {
        let (controller, transport, _) = ready_controller();
        controller.set_command_mode(CommandMode::VelocityCommand).unwrap();
        controller.set_speed_ratio(0.5).unwrap();

        controller.post_velocity_command(1, payload(1, controller.state_seqno(), vec![1.0; 6]));
        controller.tick_at(20);

        let sent = transport.last_sent().unwrap();
        assert_eq!(sent.position, None);
        assert_eq!(sent.velocity, Some(vec![0.5; 6]));
        let state = controller.subscribe_state().borrow().clone();
        assert_ne!(state.robot_state_flags & flags::VALID_VELOCITY_COMMAND, 0);
    }

    #[test]
    fn test_resubmitting_same_seqno_is_noop() {
        let (controller, transport, _) = ready_controller();
        controller.set_command_mode(CommandMode::PositionCommand).unwrap();

        controller.post_position_command(1, payload(3, controller.state_seqno(), vec![0.1; 6]));
        controller.tick_at(20);
        assert_eq!(transport.last_sent().unwrap().position, Some(vec![0.1; 6]));

        // Same payload still on the wire: rejected, nothing marked valid.
        controller.tick_at(30);
        let state = controller.subscribe_state().borrow().clone();
        assert_eq!(state.robot_state_flags & flags::VALID_POSITION_COMMAND, 0);
        assert_eq!(transport.last_sent().unwrap().position, None);
    }

    #[test]
    fn test_seqno_regression_rejected_and_endpoint_change_resets() {
        let (controller, transport, _) = ready_controller();
        controller.set_command_mode(CommandMode::PositionCommand).unwrap();

        controller.post_position_command(1, payload(5, controller.state_seqno(), vec![0.1; 6]));
        controller.tick_at(20);
        assert!(transport.last_sent().unwrap().position.is_some());

        // Older seqno from the same endpoint: silently dropped.
        controller.post_position_command(1, payload(4, controller.state_seqno(), vec![0.2; 6]));
        controller.tick_at(30);
        assert_eq!(transport.last_sent().unwrap().position, None);

        // New endpoint restarts the sequence space.
        controller.post_position_command(2, payload(1, controller.state_seqno(), vec![0.3; 6]));
        controller.tick_at(40);
        assert_eq!(transport.last_sent().unwrap().position, Some(vec![0.3; 6]));
    }

    #[test]
    fn test_wire_rejections() {
        let (controller, transport, _) = ready_controller();
        controller.set_command_mode(CommandMode::PositionCommand).unwrap();

        // Stale tick counter.
        controller.post_position_command(1, payload(1, controller.state_seqno() + 20, vec![0.0; 6]));
        controller.tick_at(20);
        assert_eq!(transport.last_sent().unwrap().position, None);

        // Wrong command length.
        controller.post_position_command(1, payload(2, controller.state_seqno(), vec![0.0; 5]));
        controller.tick_at(30);
        assert_eq!(transport.last_sent().unwrap().position, None);

        // Unknown unit code.
        let mut bad_units = payload(3, controller.state_seqno(), vec![0.0; 6]);
        bad_units.units = vec![99; 6];
        controller.post_position_command(1, bad_units);
        controller.tick_at(40);
        assert_eq!(transport.last_sent().unwrap().position, None);

        // Degrees convert.
        let mut degrees = payload(4, controller.state_seqno(), vec![180.0; 6]);
        degrees.units = vec![2; 6];
        controller.post_position_command(1, degrees);
        controller.tick_at(50);
        let sent = transport.last_sent().unwrap().position.unwrap();
        assert!((sent[0] - std::f64::consts::PI).abs() < 1e-12);
    }

    #[test]
    fn test_command_mode_transitions() {
        let (controller, _, _) = test_controller();

        // Not enabled yet: homing from invalid_state refused.
        assert!(matches!(
            controller.set_command_mode(CommandMode::Homing),
            Err(RobotError::InvalidState(_))
        ));

        // Enabled (feedback delivered, no tick yet): homing is allowed
        // straight from invalid_state.
        deliver_full_feedback(&controller, 0);
        controller.set_command_mode(CommandMode::Homing).unwrap();
        controller.tick_at(10);
        assert_eq!(controller.command_mode(), CommandMode::Homing);
        assert_eq!(controller.controller_state(), ControllerStateKind::MotorOff);

        // Any other mode requires passing through halt.
        controller.set_command_mode(CommandMode::Halt).unwrap();
        controller.set_command_mode(CommandMode::Jog).unwrap();
        assert!(matches!(
            controller.set_command_mode(CommandMode::PositionCommand),
            Err(RobotError::InvalidState(_))
        ));
        controller.set_command_mode(CommandMode::Halt).unwrap();
        controller.set_command_mode(CommandMode::PositionCommand).unwrap();

        // invalid_state is not a settable target.
        assert!(matches!(
            controller.set_command_mode(CommandMode::InvalidState),
            Err(RobotError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_halt_is_idempotent() {
        let (controller, _, _) = ready_controller();
        controller.halt().unwrap();
        assert_eq!(controller.command_mode(), CommandMode::Halt);
        controller.set_command_mode(CommandMode::Halt).unwrap();
        controller.halt().unwrap();
        assert_eq!(controller.command_mode(), CommandMode::Halt);

        // In invalid_state halt is a no-op.
        let (fresh, _, _) = test_controller();
        fresh.halt().unwrap();
        assert_eq!(fresh.command_mode(), CommandMode::InvalidState);
    }

    #[test]
    fn test_speed_ratio_bounds() {
        let (controller, _, _) = test_controller();
        assert!(controller.set_speed_ratio(0.05).is_err());
        assert!(controller.set_speed_ratio(10.5).is_err());
        assert!(controller.set_speed_ratio(f64::NAN).is_err());
        controller.set_speed_ratio(0.1).unwrap();
        controller.set_speed_ratio(10.0).unwrap();
        assert_eq!(controller.speed_ratio(), 10.0);
    }

    #[tokio::test]
    async fn test_jog_step_limit() {
        let (controller, _, _) = ready_controller();
        controller.set_command_mode(CommandMode::Jog).unwrap();

        let too_far = vec![0.5; 6]; // well past the 15 degree limit
        let err = controller
            .jog_joint(&too_far, &[1.0; 6], false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, RobotError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_jog_within_tolerance_completes() {
        let (controller, _, _) = ready_controller();
        controller.set_command_mode(CommandMode::Jog).unwrap();

        // 0.05 degrees away: inside the 0.1 degree completion tolerance.
        let target = vec![0.05_f64.to_radians(); 6];
        let worker = controller.clone();
        let handle = tokio::spawn(async move {
            worker.jog_joint(&target, &[1.0; 6], false, true).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.tick_at(100);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_jog_timeout_fails_waiter() {
        let (controller, _, _) = ready_controller();
        controller.set_command_mode(CommandMode::Jog).unwrap();

        // Within the step limit but outside the completion tolerance.
        let target = vec![0.2_f64.to_radians(); 6];
        let worker = controller.clone();
        let handle = tokio::spawn(async move {
            worker.jog_joint(&target, &[1.0; 6], false, true).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Keep communication alive while the jog clock runs out.
        deliver_full_feedback(&controller, 5_900);
        controller.tick_at(6_000);

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, RobotError::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_new_jog_supersedes_pending_one() {
        let (controller, _, _) = ready_controller();
        controller.set_command_mode(CommandMode::Jog).unwrap();

        let target = vec![0.2_f64.to_radians(); 6];
        let worker = controller.clone();
        let first = tokio::spawn(async move {
            worker.jog_joint(&target, &[1.0; 6], false, true).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        controller
            .jog_joint(&[0.0; 6], &[1.0; 6], false, false)
            .await
            .unwrap();
        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, RobotError::Aborted(_)));
    }

    #[tokio::test]
    async fn test_execute_trajectory_requires_trajectory_mode() {
        let (controller, _, _) = ready_controller();
        let err = controller
            .execute_trajectory(1, ramp_trajectory(vec![0.0; 6], vec![0.05; 6], 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, RobotError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_trajectory_start_deviation_rejected() {
        let (controller, _, _) = ready_controller();
        controller.set_command_mode(CommandMode::Trajectory).unwrap();

        let err = controller
            .execute_trajectory(1, ramp_trajectory(vec![1.0; 6], vec![1.05; 6], 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, RobotError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_trajectory_queue_promotion() {
        let (controller, transport, _) = ready_controller();
        controller.set_command_mode(CommandMode::Trajectory).unwrap();

        let a = controller
            .execute_trajectory(1, ramp_trajectory(vec![0.0; 6], vec![0.05; 6], 1.0))
            .await
            .unwrap();
        let b = controller
            .execute_trajectory(2, ramp_trajectory(vec![0.0; 6], vec![0.05; 6], 1.0))
            .await
            .unwrap();

        // A queued task reports queued immediately on its first pull.
        assert_eq!(b.next().await.unwrap(), Some(TrajectoryProgress::Queued));

        // Start A and deliver its first setpoint.
        let a_pull = tokio::spawn(async move {
            let progress = a.next().await;
            (a, progress)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.tick_at(100);
        let (a, progress) = a_pull.await.unwrap();
        assert!(matches!(
            progress.unwrap(),
            Some(TrajectoryProgress::Running { .. })
        ));
        assert!(transport.last_sent().unwrap().position.is_some());

        // Past A's max time: A completes and B is promoted.
        deliver_full_feedback(&controller, 1_250);
        controller.tick_at(1_300);
        assert_eq!(
            a.next().await.unwrap(),
            Some(TrajectoryProgress::Complete {
                time: 1.0,
                max_time: 1.0
            })
        );
        assert_eq!(a.next().await.unwrap(), None);

        // B starts on the next tick after its pull.
        let b_pull = tokio::spawn(async move {
            let progress = b.next().await;
            (b, progress)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        deliver_full_feedback(&controller, 1_350);
        controller.tick_at(1_400);
        let (_b, progress) = b_pull.await.unwrap();
        match progress.unwrap() {
            Some(TrajectoryProgress::Running { time, .. }) => assert_eq!(time, 0.0),
            other => panic!("expected running progress, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_aborting_active_cancels_queued_and_halts() {
        let (controller, _, _) = ready_controller();
        controller.set_command_mode(CommandMode::Trajectory).unwrap();

        let a = controller
            .execute_trajectory(1, ramp_trajectory(vec![0.0; 6], vec![0.05; 6], 1.0))
            .await
            .unwrap();
        let b = controller
            .execute_trajectory(2, ramp_trajectory(vec![0.0; 6], vec![0.05; 6], 1.0))
            .await
            .unwrap();

        a.abort();
        assert_eq!(controller.command_mode(), CommandMode::Halt);
        assert!(matches!(a.next().await.unwrap_err(), RobotError::Aborted(_)));
        assert!(matches!(b.next().await.unwrap_err(), RobotError::Aborted(_)));
    }

    #[tokio::test]
    async fn test_leaving_trajectory_mode_aborts_tasks() {
        let (controller, _, _) = ready_controller();
        controller.set_command_mode(CommandMode::Trajectory).unwrap();

        let task = controller
            .execute_trajectory(1, ramp_trajectory(vec![0.0; 6], vec![0.05; 6], 1.0))
            .await
            .unwrap();

        controller.set_command_mode(CommandMode::Halt).unwrap();
        controller.tick_at(20);
        assert!(matches!(
            task.next().await.unwrap_err(),
            RobotError::Aborted(_)
        ));
    }

    #[tokio::test]
    async fn test_tolerance_breach_drops_active_and_flushes_queue() {
        let (controller, _, _) = ready_controller();
        controller.set_command_mode(CommandMode::Trajectory).unwrap();

        let a = controller
            .execute_trajectory(1, ramp_trajectory(vec![0.0; 6], vec![0.05; 6], 1.0))
            .await
            .unwrap();
        let b = controller
            .execute_trajectory(2, ramp_trajectory(vec![0.0; 6], vec![0.05; 6], 1.0))
            .await
            .unwrap();

        let a_pull = tokio::spawn(async move {
            let progress = a.next().await;
            (a, progress)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.tick_at(100);
        let (a, progress) = a_pull.await.unwrap();
        assert!(progress.unwrap().is_some());

        // Feedback jumps far away from the setpoint: tolerance breach.
        controller.update_joint_feedback_at(150, vec![1.0; 6], vec![0.0; 6], vec![0.0; 6]);
        controller.tick_at(200);

        assert!(matches!(a.next().await.unwrap_err(), RobotError::Failed(_)));
        assert!(matches!(b.next().await.unwrap_err(), RobotError::Aborted(_)));
        let advanced = controller.subscribe_advanced_state().borrow().clone();
        assert_eq!(advanced.queued_trajectories, 0);
        assert!(!advanced.trajectory_running);
    }

    #[tokio::test]
    async fn test_connection_loss_cancels_task() {
        let (controller, _, health) = ready_controller();
        controller.set_command_mode(CommandMode::Trajectory).unwrap();

        let task = controller
            .execute_trajectory(1, ramp_trajectory(vec![0.0; 6], vec![0.05; 6], 1.0))
            .await
            .unwrap();

        health.connected.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(matches!(
            task.next().await.unwrap_err(),
            RobotError::ConnectionLost(_)
        ));
    }

    #[tokio::test]
    async fn test_cabinet_requests_delegate_to_transport() {
        let (controller, transport, _) = test_controller();
        controller.enable().await.unwrap();
        controller.disable().await.unwrap();
        controller.reset_errors().await.unwrap();
        assert_eq!(transport.enable_requests.load(Ordering::SeqCst), 1);
        assert_eq!(transport.disable_requests.load(Ordering::SeqCst), 1);
        assert_eq!(transport.reset_requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_robot_info_returns_config() {
        let (controller, _, _) = test_controller();
        let info = controller.robot_info();
        assert_eq!(info.joint_count(), 6);
    }
}
