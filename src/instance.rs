//! The live side of a shard member: connection handles and the contracts the
//! router needs from the surrounding machinery.
//!
//! The router never performs I/O. Everything latency-bearing lives behind
//! [`RedisInstance`], implemented by the connection layer; the router only
//! inspects state, selects, and enqueues.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::command::CommandPtr;
use crate::config::{CommandsBufferingSettings, ConnectionInfo};

/// Connection lifecycle states reported by an instance handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Connected,
    Disconnecting,
    Disconnected,
    DisconnectError,
    InitError,
}

impl ConnectionState {
    /// States that drain an entry from the pending queue: the handle will not
    /// come back on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnecting
                | ConnectionState::Disconnected
                | ConnectionState::DisconnectError
                | ConnectionState::InitError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Init => "init",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::DisconnectError => "disconnect_error",
            ConnectionState::InitError => "init_error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identifier of a server, preserved across reconnects.
///
/// Zero is the `any` sentinel: "no pin" in [`crate::CommandControl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(u64);

impl ServerId {
    pub fn generate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn any() -> Self {
        Self(0)
    }

    pub fn is_any(self) -> bool {
        self.0 == 0
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Surface the router requires from a live Redis connection.
///
/// All methods are non-blocking. `submit` enqueues onto the connection's send
/// pipeline and returns false iff the command could not be enqueued; the
/// router treats that as "try the next candidate".
pub trait RedisInstance: Send + Sync {
    fn state(&self) -> ConnectionState;
    fn server_id(&self) -> ServerId;
    fn server_host(&self) -> String;
    fn server_port(&self) -> u16;
    /// Latest ping latency sample (or EWMA) for nearest-server ordering.
    fn ping_latency(&self) -> Duration;
    /// Commands accepted and not yet completed; the least-loaded tie-breaker.
    fn running_commands(&self) -> usize;
    fn is_destroying(&self) -> bool;
    /// Cluster mode only: the instance is syncing and must not serve reads.
    fn is_syncing(&self) -> bool;
    fn submit(&self, command: &CommandPtr) -> bool;
    /// Idempotent; transitions Init towards Connected or InitError.
    fn connect(&self, info: &ConnectionInfo);
    fn set_buffering(&self, settings: CommandsBufferingSettings);
}

/// Emit functions injected into a handle at construction.
///
/// The handle reports its own [`ServerId`] with every state change; holding
/// no shard lock at call time is the implementor's obligation. Injection
/// (rather than a handle-to-shard back-pointer) keeps teardown linear.
pub struct InstanceEvents {
    pub state_change: Box<dyn Fn(ServerId, ConnectionState) + Send + Sync>,
    /// Fired by an instance that discovered it is misconfigured for its
    /// deployment mode.
    pub not_in_cluster_mode: Box<dyn Fn() + Send + Sync>,
}

/// Callable-worker contract of the surrounding event machinery.
///
/// The router never calls this itself; it is plumbed through to newly created
/// handles, which use it for their I/O.
pub trait Worker: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Creates instance handles for the reconciler.
pub trait InstanceFactory: Send + Sync {
    /// `send_readonly_mode` is set for read-only members of a cluster-mode
    /// shard, which must announce READONLY to the server after connecting.
    fn create(
        &self,
        worker: &Arc<dyn Worker>,
        send_readonly_mode: bool,
        events: InstanceEvents,
    ) -> Arc<dyn RedisInstance>;
}

/// Pairing of a declared identity with its live handle; the router's unit of
/// ownership.
pub struct ConnectionStatus {
    pub info: ConnectionInfo,
    pub instance: Arc<dyn RedisInstance>,
}
