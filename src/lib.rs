//! Client-side shard routing for Redis deployments.
//!
//! One logical shard is a master plus zero or more replicas, managed either
//! by Sentinel ([`SentinelShard`], which also owns connection lifecycle and
//! reconciliation) or by Redis Cluster ([`ClusterShard`], routing only over a
//! shape supplied from the slot map). Both pick a target per command from the
//! same vocabulary: a strategy-derived candidate set, round-robin rotation,
//! and a least-loaded tie-break, with at-most-once-then-fallback dispatch.
//!
//! Protocol encoding, socket I/O and topology discovery live outside this
//! crate; [`RedisInstance`] is the surface a connection must provide, and
//! discovery feeds desired topology in through
//! [`SentinelShard::set_connection_infos`] or the [`ClusterShard`]
//! constructor.

pub mod cluster_shard;
pub mod command;
pub mod config;
pub mod error;
pub mod instance;
pub mod observer;
mod routing;
pub mod shard;
pub mod stats;
mod throttle;

pub use cluster_shard::{ClusterShard, WaitConnectedMode};
pub use command::{Command, CommandControl, CommandPtr, Strategy, DEFAULT_PREV_INSTANCE_IDX};
pub use config::{CommandsBufferingSettings, ConnectionInfo, Password};
pub use error::{Error, Result};
pub use instance::{
    ConnectionState, ConnectionStatus, InstanceEvents, InstanceFactory, RedisInstance, ServerId,
    Worker,
};
pub use observer::Observer;
pub use shard::{ReadyChangeCallback, SentinelShard, SentinelShardOptions};
pub use stats::{InstanceStatistics, ShardStatistics, ShardTotals};
