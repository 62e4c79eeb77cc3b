//! Trajectory execution tasks
//!
//! One [`TrajectoryTask`] is created per accepted trajectory submission and
//! handed back to the owning client as a generator-style progress stream.
//! The control loop drives execution through `get_setpoint`; the client
//! pulls progress through `next`, which resolves on one of two one-shot
//! signals (first setpoint, completion/failure) or a periodic poll timeout.
//!
//! Lock order is controller lock, then task lock, everywhere. `next` takes
//! only the task lock; `abort` and `close` reach the controller through a
//! weak back-reference, so a live task never keeps the controller alive.

use crate::controller::ControllerCore;
use crate::interpolator::TrajectoryInterpolator;
use crate::state::CommandMode;
use crate::transport::{ClientEndpoint, EndpointHealth};
use crate::{Result, RobotError};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Poll period for a pending `next` with no signal activity.
const NEXT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll period of the owning-endpoint liveness watcher.
const ENDPOINT_POLL_PERIOD: Duration = Duration::from_millis(50);

/// Terminal failure of a trajectory task.
#[derive(Debug, Clone)]
pub(crate) enum TaskFailure {
    Aborted(String),
    Failed(String),
    ConnectionLost(String),
}

impl From<TaskFailure> for RobotError {
    fn from(failure: TaskFailure) -> Self {
        match failure {
            TaskFailure::Aborted(msg) => RobotError::Aborted(msg),
            TaskFailure::Failed(msg) => RobotError::Failed(msg),
            TaskFailure::ConnectionLost(msg) => RobotError::ConnectionLost(msg),
        }
    }
}

/// One-shot completion signal observable by any number of waiters.
///
/// Fires at most once; later fires are ignored.
struct Signal {
    tx: watch::Sender<Option<std::result::Result<(), TaskFailure>>>,
}

impl Signal {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    fn fire(&self, result: std::result::Result<(), TaskFailure>) {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(result);
                true
            } else {
                false
            }
        });
    }

    fn subscribe(&self) -> watch::Receiver<Option<std::result::Result<(), TaskFailure>>> {
        self.tx.subscribe()
    }
}

/// Wait until the signal has fired (result inspection happens on the task
/// state afterwards, which is always at least as fresh).
async fn wait_signal(rx: &mut watch::Receiver<Option<std::result::Result<(), TaskFailure>>>) {
    loop {
        if rx.borrow().is_some() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Progress report pulled by the owning client.
#[derive(Debug, Clone, PartialEq)]
pub enum TrajectoryProgress {
    /// Waiting behind another trajectory.
    Queued,
    /// Executing; `time` and `waypoint` are the last evaluated point.
    Running {
        time: f64,
        max_time: f64,
        waypoint: usize,
    },
    /// Final report before end-of-stream.
    Complete { time: f64, max_time: f64 },
}

/// Outcome of one control-loop evaluation of the active trajectory.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SetpointResult {
    /// Task exists but the client has not started it yet.
    Ready { max_time: f64 },
    /// First evaluated setpoint after start.
    FirstValid {
        positions: Vec<f64>,
        time: f64,
        max_time: f64,
    },
    Valid {
        positions: Vec<f64>,
        time: f64,
        max_time: f64,
    },
    /// Final setpoint; the queue head should be promoted.
    Complete {
        positions: Vec<f64>,
        time: f64,
        max_time: f64,
    },
    /// Setpoint deviated from feedback beyond tolerance.
    ToleranceError,
    /// Cancelled, aborted, or interpolation error.
    Failed,
}

#[derive(Debug, Default)]
struct TaskState {
    next_called: bool,
    started: bool,
    finished: bool,
    aborted: bool,
    cancelled: bool,
    joint_tol_error: bool,
    queued: bool,
    complete_emitted: bool,
    promotion_reported: bool,
    start_time_ms: u64,
    last_time: f64,
    last_waypoint: usize,
    failure: Option<TaskFailure>,
}

impl TaskState {
    fn is_terminal(&self) -> bool {
        self.finished || self.aborted || self.cancelled || self.joint_tol_error
    }
}

pub(crate) struct TaskInner {
    core: Weak<ControllerCore>,
    interpolator: Box<dyn TrajectoryInterpolator>,
    owner: ClientEndpoint,
    tolerance_rad: f64,
    state: Mutex<TaskState>,
    next_signal: Signal,
    queue_signal: Signal,
}

impl TaskInner {
    pub(crate) fn new(
        core: Weak<ControllerCore>,
        interpolator: Box<dyn TrajectoryInterpolator>,
        owner: ClientEndpoint,
        tolerance_rad: f64,
        queued: bool,
    ) -> Self {
        Self {
            core,
            interpolator,
            owner,
            tolerance_rad,
            state: Mutex::new(TaskState {
                queued,
                ..Default::default()
            }),
            next_signal: Signal::new(),
            queue_signal: Signal::new(),
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.state.lock().is_terminal()
    }

    /// Terminate without touching the controller queues. The controller
    /// calls this for tasks it has already detached.
    pub(crate) fn fail(&self, failure: TaskFailure) {
        {
            let mut st = self.state.lock();
            if st.finished {
                return;
            }
            if st.failure.is_none() {
                st.failure = Some(failure.clone());
            }
            st.cancelled = true;
        }
        self.next_signal.fire(Err(failure.clone()));
        self.queue_signal.fire(Err(failure));
    }

    /// Evaluate the trajectory at `now_ms` against the measured joint
    /// positions. Called by the control loop with the controller lock held.
    pub(crate) fn get_setpoint(&self, now_ms: u64, current: &[f64]) -> SetpointResult {
        let mut st = self.state.lock();
        if st.cancelled || st.aborted || st.joint_tol_error {
            return SetpointResult::Failed;
        }

        let mut first_call = false;
        if st.next_called && !st.started {
            st.started = true;
            st.start_time_ms = now_ms;
            first_call = true;
        }

        let raw_t = if st.started {
            now_ms.saturating_sub(st.start_time_ms) as f64 / 1000.0
        } else {
            0.0
        };
        let max_time = self.interpolator.max_time();
        let t = raw_t.min(max_time);

        let (positions, waypoint) = match self.interpolator.interpolate(t) {
            Ok(result) => result,
            Err(e) => {
                debug!("trajectory interpolation failed at t={:.3}: {}", t, e);
                let failure = TaskFailure::Failed(format!("interpolation failed: {}", e));
                st.failure = Some(failure.clone());
                st.cancelled = true;
                drop(st);
                self.next_signal.fire(Err(failure.clone()));
                self.queue_signal.fire(Err(failure));
                return SetpointResult::Failed;
            }
        };

        let deviates = positions.len() != current.len()
            || positions
                .iter()
                .zip(current.iter())
                .any(|(setpoint, measured)| (setpoint - measured).abs() > self.tolerance_rad);
        if deviates {
            st.joint_tol_error = true;
            let failure =
                TaskFailure::Failed("trajectory deviates from measured joint position".to_string());
            st.failure = Some(failure.clone());
            drop(st);
            self.next_signal.fire(Err(failure.clone()));
            self.queue_signal.fire(Err(failure));
            return SetpointResult::ToleranceError;
        }

        if !st.next_called {
            return SetpointResult::Ready { max_time };
        }

        st.last_time = t;
        st.last_waypoint = waypoint;

        if raw_t > max_time {
            st.finished = true;
            drop(st);
            // Fire both: a first `next` may still be parked on the queue
            // signal when a short trajectory completes immediately.
            self.next_signal.fire(Ok(()));
            self.queue_signal.fire(Ok(()));
            return SetpointResult::Complete {
                positions,
                time: t,
                max_time,
            };
        }

        if first_call {
            st.queued = false;
            drop(st);
            self.queue_signal.fire(Ok(()));
            return SetpointResult::FirstValid {
                positions,
                time: t,
                max_time,
            };
        }

        SetpointResult::Valid {
            positions,
            time: t,
            max_time,
        }
    }

    /// Detach from the controller (cancelling the queue when this was the
    /// active task) and optionally force the controller to halt.
    fn detach(this: &Arc<Self>, flip_to_halt: bool) {
        if let Some(core) = this.core.upgrade() {
            let mut s = core.state.lock();
            core.remove_trajectory(&mut s, this);
            if flip_to_halt && s.ctrl.command_mode != CommandMode::InvalidState {
                s.ctrl.command_mode = CommandMode::Halt;
            }
        }
    }

    fn abort(this: &Arc<Self>) {
        {
            let mut st = this.state.lock();
            if st.is_terminal() {
                return;
            }
            st.aborted = true;
        }
        info!("trajectory task aborted by client");
        Self::detach(this, true);
        let failure = TaskFailure::Aborted("trajectory aborted".to_string());
        {
            let mut st = this.state.lock();
            if st.failure.is_none() {
                st.failure = Some(failure.clone());
            }
        }
        this.next_signal.fire(Err(failure.clone()));
        this.queue_signal.fire(Err(failure));
    }

    fn close(this: &Arc<Self>, failure: TaskFailure) {
        {
            let mut st = this.state.lock();
            if st.is_terminal() {
                return;
            }
            st.cancelled = true;
            if st.failure.is_none() {
                st.failure = Some(failure.clone());
            }
        }
        Self::detach(this, false);
        this.next_signal.fire(Err(failure.clone()));
        this.queue_signal.fire(Err(failure));
    }
}

/// Progress stream for one trajectory execution, owned by a single client
/// endpoint.
pub struct TrajectoryTask {
    inner: Arc<TaskInner>,
}

impl std::fmt::Debug for TrajectoryTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrajectoryTask").finish_non_exhaustive()
    }
}

impl TrajectoryTask {
    pub(crate) fn new(inner: Arc<TaskInner>) -> Self {
        Self { inner }
    }

    /// Pull the next progress report.
    ///
    /// The first call on a task queued behind another returns
    /// [`TrajectoryProgress::Queued`] without waiting. Later calls resolve
    /// when the task starts executing or terminates, or after a poll
    /// timeout with the current status. `Ok(None)` is end-of-stream, after
    /// the completion report has been delivered.
    pub async fn next(&self) -> Result<Option<TrajectoryProgress>> {
        enum Step {
            Done(Result<Option<TrajectoryProgress>>),
            Wait { watch_queue: bool },
        }

        let step = {
            let mut st = self.inner.state.lock();
            if let Some(failure) = &st.failure {
                Step::Done(Err(failure.clone().into()))
            } else if st.finished {
                Step::Done(self.emit_finished(&mut st))
            } else if !st.next_called {
                st.next_called = true;
                if st.queued {
                    Step::Done(Ok(Some(TrajectoryProgress::Queued)))
                } else {
                    Step::Wait {
                        watch_queue: !st.promotion_reported,
                    }
                }
            } else {
                Step::Wait {
                    watch_queue: !st.promotion_reported,
                }
            }
        };

        let watch_queue = match step {
            Step::Done(result) => return result,
            Step::Wait { watch_queue } => watch_queue,
        };

        let mut next_rx = self.inner.next_signal.subscribe();
        let mut queue_rx = self.inner.queue_signal.subscribe();
        tokio::select! {
            _ = wait_signal(&mut next_rx) => {}
            _ = wait_signal(&mut queue_rx), if watch_queue => {}
            _ = tokio::time::sleep(NEXT_POLL_TIMEOUT) => {}
        }

        let mut st = self.inner.state.lock();
        if let Some(failure) = &st.failure {
            return Err(failure.clone().into());
        }
        if st.finished {
            return self.emit_finished(&mut st);
        }
        if !st.started {
            return Ok(Some(TrajectoryProgress::Queued));
        }
        st.promotion_reported = true;
        Ok(Some(TrajectoryProgress::Running {
            time: st.last_time,
            max_time: self.inner.interpolator.max_time(),
            waypoint: st.last_waypoint,
        }))
    }

    fn emit_finished(&self, st: &mut TaskState) -> Result<Option<TrajectoryProgress>> {
        if st.complete_emitted {
            Ok(None)
        } else {
            st.complete_emitted = true;
            Ok(Some(TrajectoryProgress::Complete {
                time: st.last_time,
                max_time: self.inner.interpolator.max_time(),
            }))
        }
    }

    /// Terminate immediately and force the controller to halt. Any pending
    /// `next` fails with an aborted error.
    pub fn abort(&self) {
        TaskInner::abort(&self.inner);
    }

    /// Cooperative cancel: drop the task from the controller without
    /// changing the command mode. Any pending `next` fails with an aborted
    /// error.
    pub fn close(&self) {
        TaskInner::close(
            &self.inner,
            TaskFailure::Aborted("trajectory closed by client".to_string()),
        );
    }

    pub(crate) fn inner(&self) -> &Arc<TaskInner> {
        &self.inner
    }
}

/// Cancel the task when its owning client endpoint becomes unreachable.
///
/// Runs until the task reaches a terminal state; connection-loss detection
/// is [`ENDPOINT_POLL_PERIOD`]-granular.
pub(crate) fn spawn_liveness_watcher(inner: Arc<TaskInner>, health: Arc<dyn EndpointHealth>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(ENDPOINT_POLL_PERIOD).await;
            if inner.is_terminal() {
                break;
            }
            if !health.is_connected(inner.owner) {
                debug!(
                    "client endpoint {} unreachable, cancelling trajectory task",
                    inner.owner
                );
                TaskInner::close(
                    &inner,
                    TaskFailure::ConnectionLost("client endpoint disconnected".to_string()),
                );
                break;
            }
        }
    });
}
