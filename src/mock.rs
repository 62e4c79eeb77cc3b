//! Shared test fixtures: a recording transport, a linear ramp
//! interpolator, and a switchable endpoint-health probe.

use crate::interpolator::{
    JointTrajectory, TrajectoryInterpolator, TrajectoryInterpolatorFactory, TrajectoryWaypoint,
};
use crate::transport::{ClientEndpoint, EndpointHealth, RobotTransport};
use crate::{Result, RobotError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Clone)]
pub(crate) struct SentCommand {
    pub now_ms: u64,
    pub position: Option<Vec<f64>>,
    pub velocity: Option<Vec<f64>>,
}

/// Transport that records every command instead of talking to hardware.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    pub sent: Mutex<Vec<SentCommand>>,
    pub enable_requests: AtomicUsize,
    pub disable_requests: AtomicUsize,
    pub reset_requests: AtomicUsize,
}

impl RecordingTransport {
    pub fn last_sent(&self) -> Option<SentCommand> {
        self.sent.lock().last().cloned()
    }
}

#[async_trait]
impl RobotTransport for RecordingTransport {
    fn send_robot_command(
        &self,
        now_ms: u64,
        position_command: Option<&[f64]>,
        velocity_command: Option<&[f64]>,
    ) -> anyhow::Result<()> {
        self.sent.lock().push(SentCommand {
            now_ms,
            position: position_command.map(|p| p.to_vec()),
            velocity: velocity_command.map(|v| v.to_vec()),
        });
        Ok(())
    }

    async fn send_enable(&self) -> anyhow::Result<()> {
        self.enable_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_disable(&self) -> anyhow::Result<()> {
        self.disable_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_reset_errors(&self) -> anyhow::Result<()> {
        self.reset_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Linear interpolation between a start and end point over a fixed
/// duration; waypoint index 0 along the ramp, 1 at the end.
pub(crate) struct RampInterpolator {
    start: Vec<f64>,
    end: Vec<f64>,
    duration: f64,
}

impl RampInterpolator {
    pub fn new(start: Vec<f64>, end: Vec<f64>, duration: f64) -> Self {
        Self {
            start,
            end,
            duration,
        }
    }
}

impl TrajectoryInterpolator for RampInterpolator {
    fn interpolate(&self, t: f64) -> Result<(Vec<f64>, usize)> {
        let fraction = if self.duration > 0.0 {
            (t / self.duration).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let positions = self
            .start
            .iter()
            .zip(self.end.iter())
            .map(|(s, e)| s + (e - s) * fraction)
            .collect();
        let waypoint = usize::from(fraction >= 1.0);
        Ok((positions, waypoint))
    }

    fn max_time(&self) -> f64 {
        self.duration
    }
}

/// Factory producing a [`RampInterpolator`] from the first and last
/// waypoints, time-scaled by the speed ratio.
pub(crate) struct RampFactory;

impl TrajectoryInterpolatorFactory for RampFactory {
    fn build(
        &self,
        trajectory: &JointTrajectory,
        speed_ratio: f64,
    ) -> Result<Box<dyn TrajectoryInterpolator>> {
        let (first, last) = match (trajectory.waypoints.first(), trajectory.waypoints.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                return Err(RobotError::InvalidArgument(
                    "trajectory has no waypoints".to_string(),
                ))
            }
        };
        Ok(Box::new(RampInterpolator::new(
            first.joint_position.clone(),
            last.joint_position.clone(),
            last.time_from_start / speed_ratio,
        )))
    }
}

/// Two-waypoint trajectory from `start` to `end` over `duration` seconds.
pub(crate) fn ramp_trajectory(start: Vec<f64>, end: Vec<f64>, duration: f64) -> JointTrajectory {
    JointTrajectory {
        waypoints: vec![
            TrajectoryWaypoint {
                time_from_start: 0.0,
                joint_position: start,
            },
            TrajectoryWaypoint {
                time_from_start: duration,
                joint_position: end,
            },
        ],
    }
}

/// Endpoint-health probe that can be flipped from a test.
pub(crate) struct SwitchableHealth {
    pub connected: AtomicBool,
}

impl SwitchableHealth {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
        }
    }
}

impl EndpointHealth for SwitchableHealth {
    fn is_connected(&self, _endpoint: ClientEndpoint) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
