//! Robot service - high-level wrapper for easy embedding
//!
//! Wires the controller to its collaborators, owns the control loop
//! thread, and tears everything down on shutdown or drop.

use crate::control_loop::{self, LoopConfig};
use crate::controller::RobotController;
use crate::config::RobotConfig;
use crate::interpolator::TrajectoryInterpolatorFactory;
use crate::transport::{EndpointHealth, RobotTransport};
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::info;

/// Owns a running robot controller and its control loop.
pub struct RobotService {
    controller: RobotController,
    shutdown_signal: Arc<AtomicBool>,
    loop_handle: Option<JoinHandle<()>>,
}

impl RobotService {
    /// Build the controller and start the control loop.
    pub fn start(
        config: RobotConfig,
        loop_config: LoopConfig,
        transport: Arc<dyn RobotTransport>,
        interpolator_factory: Arc<dyn TrajectoryInterpolatorFactory>,
        endpoint_health: Arc<dyn EndpointHealth>,
    ) -> Result<Self> {
        info!("starting robot control service");
        let controller =
            RobotController::new(config, transport, interpolator_factory, endpoint_health)?;

        let shutdown_signal = Arc::new(AtomicBool::new(false));
        let loop_handle =
            control_loop::spawn(controller.clone(), loop_config, shutdown_signal.clone())?;

        Ok(Self {
            controller,
            shutdown_signal,
            loop_handle: Some(loop_handle),
        })
    }

    /// Start with the loop period taken from the robot configuration.
    pub fn start_with_defaults(
        config: RobotConfig,
        transport: Arc<dyn RobotTransport>,
        interpolator_factory: Arc<dyn TrajectoryInterpolatorFactory>,
        endpoint_health: Arc<dyn EndpointHealth>,
    ) -> Result<Self> {
        let loop_config = LoopConfig::from_robot_config(&config);
        Self::start(
            config,
            loop_config,
            transport,
            interpolator_factory,
            endpoint_health,
        )
    }

    /// The controller handle for API calls, feedback ingress, and
    /// telemetry subscriptions.
    pub fn controller(&self) -> &RobotController {
        &self.controller
    }

    /// Stop the control loop and wait for it to exit.
    pub fn shutdown(&mut self) {
        if self.loop_handle.is_some() {
            info!("shutting down robot control service");
        }
        self.shutdown_signal.store(true, Ordering::Relaxed);
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RobotService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
