//! Cluster-mode shard: the `(master, replicas)` shape arrives from the slot
//! map, so this side does routing only.
//!
//! Read-only traffic rotates over a candidate vector that keeps the master in
//! the trailing slot: with reads-from-master disabled it is still reachable,
//! but only once every replica has been exhausted. Writable and pinned
//! commands take the direct path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::command::{CommandControl, CommandPtr};
use crate::instance::{ConnectionState, RedisInstance};
use crate::routing;
use crate::stats::{InstanceStatistics, ShardStatistics};
use crate::throttle::LogThrottle;

static SERVER_NOT_FOUND_WARN: LogThrottle = LogThrottle::new(Duration::from_secs(1));
static NOT_READY_WARN: LogThrottle = LogThrottle::new(Duration::from_secs(1));

/// Readiness requirement a caller may wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitConnectedMode {
    NoWait,
    Master,
    Slave,
    MasterOrSlave,
    MasterAndSlave,
}

pub struct ClusterShard {
    /// Opaque shard number, used only for diagnostics.
    shard: usize,
    master: Option<Arc<dyn RedisInstance>>,
    replicas: Vec<Arc<dyn RedisInstance>>,
    current: AtomicUsize,
}

impl Clone for ClusterShard {
    fn clone(&self) -> Self {
        Self {
            shard: self.shard,
            master: self.master.clone(),
            replicas: self.replicas.clone(),
            current: AtomicUsize::new(self.current.load(Ordering::Relaxed)),
        }
    }
}

impl ClusterShard {
    pub fn new(
        shard: usize,
        master: Option<Arc<dyn RedisInstance>>,
        replicas: Vec<Arc<dyn RedisInstance>>,
    ) -> Self {
        Self {
            shard,
            master,
            replicas,
            current: AtomicUsize::new(0),
        }
    }

    pub fn shard_id(&self) -> usize {
        self.shard
    }

    /// Route one command. Returns true iff some instance accepted it.
    pub fn submit(&self, command: &CommandPtr) -> bool {
        let control = &command.control;
        let read_only = command.read_only;

        if !read_only || !control.force_server_id.is_any() {
            if let Some(instance) = self.available_server(control, read_only) {
                return instance.submit(command);
            }
            return false;
        }

        let current = self.current.fetch_add(1, Ordering::Relaxed);
        let candidates = self.available_servers(control);
        let servers_count = candidates.len();
        let is_nearest_ping = control.strategy.is_nearest_ping();

        if servers_count > 0 {
            let masters_count = 1;
            let max_attempts = self.replicas.len() + masters_count + 1;
            for attempt in 0..max_attempts {
                let start_idx = routing::cluster_start_index(
                    control,
                    attempt,
                    is_nearest_ping,
                    command.instance_idx(),
                    current,
                    servers_count,
                );
                let selected = routing::select_cluster_instance(
                    &candidates,
                    start_idx,
                    attempt,
                    is_nearest_ping,
                    control.best_dc_count,
                );
                let Some((instance, idx)) = selected else {
                    continue;
                };
                command.set_instance_idx(idx);
                if instance.submit(command) {
                    return true;
                }
            }
        }

        if NOT_READY_WARN.allow() {
            warn!(
                "no server is ready for shard={} read_only={} available_servers={}",
                self.shard, read_only, servers_count
            );
        }
        false
    }

    /// Direct path: the master for writes, a `ServerId` scan for pins.
    fn available_server(
        &self,
        control: &CommandControl,
        read_only: bool,
    ) -> Option<Arc<dyn RedisInstance>> {
        if !read_only {
            return self.master.clone();
        }

        if control.force_server_id.is_any() {
            return None;
        }

        let id = control.force_server_id;
        if let Some(master) = &self.master {
            if master.server_id() == id {
                return Some(Arc::clone(master));
            }
        }
        for replica in &self.replicas {
            if replica.server_id() == id {
                return Some(Arc::clone(replica));
            }
        }
        if SERVER_NOT_FOUND_WARN.allow() {
            warn!(
                "server_id={id} not found in shard={} (dead server?)",
                self.shard
            );
        }
        None
    }

    /// Candidate vector for unpinned reads. The master always trails so the
    /// start-index arithmetic can exclude it from the initial rotation;
    /// nearest-ping orders the window head by latency.
    fn available_servers(&self, control: &CommandControl) -> Vec<Arc<dyn RedisInstance>> {
        if !control.strategy.is_nearest_ping() {
            return self.readonly_with_master();
        }

        if control.allow_reads_from_master {
            let mut candidates = self.readonly_with_master();
            routing::prioritize_nearest(&mut candidates, control.best_dc_count);
            return candidates;
        }

        let mut candidates = self.replicas.clone();
        routing::prioritize_nearest(&mut candidates, control.best_dc_count);
        if let Some(master) = &self.master {
            candidates.push(Arc::clone(master));
        }
        candidates
    }

    fn readonly_with_master(&self) -> Vec<Arc<dyn RedisInstance>> {
        let mut candidates = Vec::with_capacity(self.replicas.len() + 1);
        candidates.extend(self.replicas.iter().cloned());
        if let Some(master) = &self.master {
            candidates.push(Arc::clone(master));
        }
        candidates
    }

    pub fn is_ready(&self, mode: WaitConnectedMode) -> bool {
        match mode {
            WaitConnectedMode::NoWait => true,
            WaitConnectedMode::Master => self.is_master_ready(),
            WaitConnectedMode::Slave => self.is_replica_ready(),
            WaitConnectedMode::MasterOrSlave => {
                self.is_master_ready() || self.is_replica_ready()
            }
            WaitConnectedMode::MasterAndSlave => {
                self.is_master_ready() && self.is_replica_ready()
            }
        }
    }

    fn is_master_ready(&self) -> bool {
        self.master
            .as_ref()
            .is_some_and(|master| master.state() == ConnectionState::Connected)
    }

    fn is_replica_ready(&self) -> bool {
        self.replicas
            .iter()
            .any(|replica| replica.state() == ConnectionState::Connected)
    }

    /// Snapshot of the requested side, keyed by `host:port`.
    pub fn statistics(&self, master: bool) -> ShardStatistics {
        let mut stats = ShardStatistics::default();
        let mut add = |instance: &Arc<dyn RedisInstance>| {
            let instance_stats = InstanceStatistics::gather(instance.as_ref());
            stats.shard_total.add(&instance_stats);
            let key = format!("{}:{}", instance.server_host(), instance.server_port());
            stats.instances.insert(key, instance_stats);
        };

        if master {
            if let Some(instance) = &self.master {
                add(instance);
            }
        } else {
            for instance in &self.replicas {
                add(instance);
            }
        }

        stats.is_ready = self.is_ready(WaitConnectedMode::MasterAndSlave);
        stats
    }
}
