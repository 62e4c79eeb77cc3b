//! External collaborator contracts
//!
//! The core never talks to hardware or RPC middleware directly; concrete
//! transports and endpoint-health probes are injected behind these traits
//! so the crate can be embedded under any communication framework.

use async_trait::async_trait;

/// Identifier of a connected client endpoint, assigned by the RPC layer.
pub type ClientEndpoint = u64;

/// Hardware-facing transport consumed by the control core.
///
/// `send_robot_command` is called once per tick outside the core lock and
/// must never block; failures are the transport's to absorb (the next tick
/// reattempts). The enable/disable/reset hooks are asynchronous requests
/// to the controller cabinet.
#[async_trait]
pub trait RobotTransport: Send + Sync {
    /// Best-effort, non-blocking command send. At most one of the two
    /// commands is present; both absent means "no new command this tick".
    fn send_robot_command(
        &self,
        now_ms: u64,
        position_command: Option<&[f64]>,
        velocity_command: Option<&[f64]>,
    ) -> anyhow::Result<()>;

    async fn send_enable(&self) -> anyhow::Result<()>;

    async fn send_disable(&self) -> anyhow::Result<()>;

    async fn send_reset_errors(&self) -> anyhow::Result<()>;
}

/// Liveness probe for client endpoints.
///
/// Injected at construction instead of reaching into a process-wide RPC
/// node; trajectory tasks poll it to cancel themselves when their owning
/// client disappears.
pub trait EndpointHealth: Send + Sync {
    /// Whether the given client endpoint is still reachable.
    fn is_connected(&self, endpoint: ClientEndpoint) -> bool;
}

/// Endpoint-health probe that considers every endpoint reachable.
///
/// Useful for embedders whose middleware has no liveness notion.
#[derive(Debug, Clone, Default)]
pub struct AlwaysConnected;

impl EndpointHealth for AlwaysConnected {
    fn is_connected(&self, _endpoint: ClientEndpoint) -> bool {
        true
    }
}
