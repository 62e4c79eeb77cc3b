//! Trajectory interpolation seam
//!
//! Waypoint spline evaluation is an external concern; the core only needs
//! setpoints at a given time and the total duration. Implementations are
//! built per trajectory submission, off the control loop's critical path.

use crate::Result;
use serde::{Deserialize, Serialize};

/// One trajectory waypoint: joint positions to reach at `time_from_start`
/// seconds (before speed scaling).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryWaypoint {
    pub time_from_start: f64,
    pub joint_position: Vec<f64>,
}

/// A time-parameterised joint trajectory as submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointTrajectory {
    pub waypoints: Vec<TrajectoryWaypoint>,
}

/// Evaluates joint setpoints along a loaded trajectory.
pub trait TrajectoryInterpolator: Send + Sync {
    /// Joint setpoint and waypoint index at `t` seconds from trajectory
    /// start. `t` is pre-clamped to `[0, max_time]` by the caller.
    fn interpolate(&self, t: f64) -> Result<(Vec<f64>, usize)>;

    /// Total trajectory duration in seconds, after speed scaling.
    fn max_time(&self) -> f64;
}

/// Builds interpolators for submitted trajectories.
pub trait TrajectoryInterpolatorFactory: Send + Sync {
    /// Build an interpolator loaded with `trajectory`, time-scaled by
    /// `speed_ratio` (2.0 runs the trajectory in half the nominal time).
    fn build(
        &self,
        trajectory: &JointTrajectory,
        speed_ratio: f64,
    ) -> Result<Box<dyn TrajectoryInterpolator>>;
}
