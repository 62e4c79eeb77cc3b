//! Zenoh Publishing Bridge
//!
//! Optionally republishes the controller's state channels to Zenoh topics
//! as JSON, enabling multiple remote consumers without coupling the core
//! to any middleware. Enabled with the `zenoh-integration` feature.

use crate::controller::RobotController;
use anyhow::{anyhow, Context, Result};
use tracing::{debug, error, info};
use zenoh::{pubsub::Publisher, Session};

/// Zenoh bridge for robot state data
///
/// Manages separate publishers for the basic state, advanced state, and
/// sensor-data streams:
/// - `{prefix}/state` - basic robot state snapshot
/// - `{prefix}/advanced_state` - extended snapshot with trajectory progress
/// - `{prefix}/sensor_data` - streamed sensor samples
pub struct ZenohBridge {
    tasks: Vec<tokio::task::JoinHandle<()>>,
    _session: Session,
}

impl ZenohBridge {
    /// Open a Zenoh session and start forwarding the controller's
    /// telemetry channels to `{topic_prefix}/...` topics.
    pub async fn attach(controller: &RobotController, topic_prefix: &str) -> Result<Self> {
        info!("Initializing Zenoh session for robot state publishing");

        let session = zenoh::open(zenoh::Config::default())
            .await
            .map_err(|e| anyhow!("Failed to open Zenoh session: {}", e))?;

        let state_publisher = session
            .declare_publisher(format!("{}/state", topic_prefix))
            .await
            .map_err(|e| anyhow!("Failed to create state publisher: {}", e))?;
        let advanced_publisher = session
            .declare_publisher(format!("{}/advanced_state", topic_prefix))
            .await
            .map_err(|e| anyhow!("Failed to create advanced state publisher: {}", e))?;
        let sensor_publisher = session
            .declare_publisher(format!("{}/sensor_data", topic_prefix))
            .await
            .map_err(|e| anyhow!("Failed to create sensor data publisher: {}", e))?;

        info!("Zenoh publishers created under '{}'", topic_prefix);

        let tasks = vec![
            Self::forward_state(controller.subscribe_state(), state_publisher),
            Self::forward_advanced(controller.subscribe_advanced_state(), advanced_publisher),
            Self::forward_sensor_data(controller.subscribe_sensor_data(), sensor_publisher),
        ];

        Ok(Self {
            tasks,
            _session: session,
        })
    }

    fn forward_state(
        mut rx: tokio::sync::watch::Receiver<crate::publisher::RobotState>,
        publisher: Publisher<'static>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                if let Err(e) = Self::put_json(&publisher, &snapshot).await {
                    error!("Failed to publish robot state to Zenoh: {}", e);
                }
            }
            debug!("robot state forwarder terminated");
        })
    }

    fn forward_advanced(
        mut rx: tokio::sync::watch::Receiver<crate::publisher::AdvancedRobotState>,
        publisher: Publisher<'static>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                if let Err(e) = Self::put_json(&publisher, &snapshot).await {
                    error!("Failed to publish advanced robot state to Zenoh: {}", e);
                }
            }
            debug!("advanced robot state forwarder terminated");
        })
    }

    fn forward_sensor_data(
        mut rx: tokio::sync::broadcast::Receiver<crate::publisher::RobotStateSensorData>,
        publisher: Publisher<'static>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(sample) => {
                        if let Err(e) = Self::put_json(&publisher, &sample).await {
                            error!("Failed to publish sensor data to Zenoh: {}", e);
                        }
                    }
                    // Lossy by design: skip ahead after falling behind.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("sensor data forwarder lagged, skipped {} samples", skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("sensor data forwarder terminated");
        })
    }

    async fn put_json<T: serde::Serialize>(publisher: &Publisher<'static>, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value).context("Failed to serialize state snapshot")?;
        publisher
            .put(payload)
            .await
            .map_err(|e| anyhow!("Zenoh publish failed: {}", e))?;
        Ok(())
    }

    /// Stop the forwarding tasks.
    pub fn detach(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ZenohBridge {
    fn drop(&mut self) {
        self.detach();
    }
}
