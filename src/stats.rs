//! Point-in-time shard snapshots for introspection.

use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::instance::{ConnectionState, RedisInstance};

/// Snapshot of one instance handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceStatistics {
    pub state: ConnectionState,
    pub ping_latency: Duration,
    pub running_commands: usize,
    pub is_syncing: bool,
}

impl InstanceStatistics {
    pub(crate) fn gather(instance: &dyn RedisInstance) -> Self {
        Self {
            state: instance.state(),
            ping_latency: instance.ping_latency(),
            running_commands: instance.running_commands(),
            is_syncing: instance.is_syncing(),
        }
    }
}

/// Totals across the counted instances of one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardTotals {
    pub instances: usize,
    pub connected: usize,
    pub running_commands: usize,
}

impl ShardTotals {
    pub(crate) fn add(&mut self, stats: &InstanceStatistics) {
        self.instances += 1;
        if stats.state == ConnectionState::Connected {
            self.connected += 1;
        }
        self.running_commands += stats.running_commands;
    }
}

/// Aggregate over one side (master or replicas) of a shard, keyed by
/// `host:port`.
#[derive(Debug, Clone, Default)]
pub struct ShardStatistics {
    pub instances: AHashMap<String, InstanceStatistics>,
    pub shard_total: ShardTotals,
    pub is_ready: bool,
    pub last_ready_time: Option<Instant>,
}
