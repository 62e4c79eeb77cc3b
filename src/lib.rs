//! IRD Core - IPC-agnostic industrial robot driver control core
//!
//! This library provides the control core of an industrial-robot driver
//! without any transport or IPC dependencies: a fixed-period control loop
//! that validates communications and controller health, selects one of
//! several command sources (jog, streamed position, streamed velocity,
//! queued trajectory), emits joint commands to an injected hardware
//! transport, and publishes robot-state telemetry. It can be embedded in
//! applications using any communication framework (gRPC, HTTP, Zenoh,
//! MQTT, etc.).
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ird::{LoopConfig, RobotConfig, RobotService};
//! use ird::{AlwaysConnected, CommandMode};
//! use std::sync::Arc;
//!
//! # fn collaborators() -> (Arc<dyn ird::RobotTransport>, Arc<dyn ird::TrajectoryInterpolatorFactory>) { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (transport, interpolator_factory) = collaborators();
//!     let service = RobotService::start(
//!         RobotConfig::load_from_path("config/robot.yaml")?,
//!         LoopConfig::default(),
//!         transport,
//!         interpolator_factory,
//!         Arc::new(AlwaysConnected),
//!     )?;
//!
//!     let robot = service.controller();
//!     robot.set_command_mode(CommandMode::Halt)?;
//!     let mut states = robot.subscribe_state();
//!     states.changed().await?;
//!     println!("robot state: {:?}", states.borrow().controller_state);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **RobotService**: high-level wrapper owning the control loop thread
//! - **RobotController**: single-lock control core and client API
//! - **TrajectoryTask**: per-trajectory execution with a progress stream
//! - **StatePublisher**: latest-value state channels plus a lossy
//!   sensor-data pipe
//! - **RobotTransport / TrajectoryInterpolatorFactory / EndpointHealth**:
//!   injected collaborator contracts

pub mod clock;
pub mod config;
pub mod control_loop;
pub mod controller;
pub mod error;
pub mod interpolator;
pub mod publisher;
pub mod service;
pub mod state;
pub mod trajectory;
pub mod transport;
pub mod wire;

#[cfg(feature = "zenoh-integration")]
pub mod zenoh_bridge;

#[cfg(test)]
pub(crate) mod mock;

// High-level exports for easy usage
pub use config::RobotConfig;
pub use control_loop::LoopConfig;
pub use controller::RobotController;
pub use error::{Result, RobotError};
pub use service::RobotService;
pub use trajectory::{TrajectoryProgress, TrajectoryTask};

// Core type exports
pub use clock::MonotonicClock;
pub use interpolator::{
    JointTrajectory, TrajectoryInterpolator, TrajectoryInterpolatorFactory, TrajectoryWaypoint,
};
pub use publisher::{
    AdvancedRobotState, RobotState, RobotStateSensorData, SensorDataHeader, StatePublisher,
};
pub use state::{
    flags, CommandMode, ControllerStateKind, EndpointPose, EstopSource, HealthUpdate,
    OperationalMode, SpatialVelocity,
};
pub use transport::{AlwaysConnected, ClientEndpoint, EndpointHealth, RobotTransport};
pub use wire::{JointCommandPayload, PositionUnits, VelocityUnits};

#[cfg(feature = "zenoh-integration")]
pub use zenoh_bridge::ZenohBridge;
