//! Periodic control loop driver
//!
//! Runs the controller tick on a dedicated thread with a monotonic
//! absolute-deadline schedule: the next deadline is accumulated from the
//! previous one, so a late tick does not shift the whole schedule. The
//! spin-wait variant trades CPU for lower wakeup jitter and is worth
//! enabling only on isolated cores.

use crate::controller::RobotController;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Control loop configuration.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Tick period.
    pub period: Duration,
    /// Spin-wait to each deadline instead of sleeping.
    pub spin_wait: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(10),
            spin_wait: false,
        }
    }
}

impl LoopConfig {
    /// Loop configuration matching a robot configuration's tick period.
    pub fn from_robot_config(config: &crate::config::RobotConfig) -> Self {
        Self {
            period: Duration::from_millis(config.tick_period_ms()),
            ..Default::default()
        }
    }
}

/// Spawn the control loop thread. It runs until `shutdown` is set.
pub(crate) fn spawn(
    controller: RobotController,
    config: LoopConfig,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("ird-control-loop".to_string())
        .spawn(move || run(controller, config, shutdown))
}

fn run(controller: RobotController, config: LoopConfig, shutdown: Arc<AtomicBool>) {
    let period = if config.period.is_zero() {
        warn!("control loop period of zero requested, using 10 ms");
        Duration::from_millis(10)
    } else {
        config.period
    };

    info!(
        "control loop started: {} us period, spin_wait={}",
        period.as_micros(),
        config.spin_wait
    );

    let sleeper = spin_sleep::SpinSleeper::default();
    let mut next_deadline = Instant::now() + period;

    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        // Accumulate absolute deadlines; skipped periods are not replayed.
        while next_deadline <= now {
            next_deadline += period;
        }
        let wait = next_deadline - now;
        if config.spin_wait {
            sleeper.sleep(wait);
        } else {
            thread::sleep(wait);
        }
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        controller.tick();
    }

    info!("control loop stopped");
}
