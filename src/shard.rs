//! Sentinel-mode shard: reconciles a desired instance set against live
//! connections and routes commands to whichever member can take them.
//!
//! Two caller populations share a shard. The topology thread owns every
//! mutation (`set_connection_infos`, the reconcile pair, `clean`), so writers
//! never contend with each other; worker threads route and introspect under
//! the shared side of one reader-writer lock. Signals are always emitted
//! after the lock is released, because subscribers may re-enter the shard.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use log::{trace, warn};
use parking_lot::{Mutex, RwLock};

use crate::command::{CommandControl, CommandPtr};
use crate::config::{CommandsBufferingSettings, ConnectionInfo};
use crate::instance::{
    ConnectionState, ConnectionStatus, InstanceEvents, InstanceFactory, ServerId, Worker,
};
use crate::observer::Observer;
use crate::routing;
use crate::stats::{InstanceStatistics, ShardStatistics};
use crate::throttle::LogThrottle;

static FALLBACK_WARN: LogThrottle = LogThrottle::new(Duration::from_secs(1));
static NOT_READY_WARN: LogThrottle = LogThrottle::new(Duration::from_secs(1));

/// Fired when the shard readiness (any connected instance) flips.
pub type ReadyChangeCallback = Box<dyn Fn(bool) + Send + Sync>;

pub struct SentinelShardOptions {
    pub shard_name: String,
    pub shard_group_name: String,
    /// True when the shard belongs to a cluster deployment; read-only members
    /// then announce READONLY after connecting.
    pub cluster_mode: bool,
    pub connection_infos: Vec<ConnectionInfo>,
    pub ready_change_callback: Option<ReadyChangeCallback>,
    pub factory: Arc<dyn InstanceFactory>,
}

struct ShardState {
    /// Desired members; reconciliation converges the live sets onto this.
    connection_infos: BTreeSet<ConnectionInfo>,
    /// Members serving traffic. Admitted while Connected.
    instances: Vec<ConnectionStatus>,
    /// Members still connecting, or ejected from `instances` after leaving
    /// Connected. Terminal entries are drained from here.
    clean_wait: Vec<ConnectionStatus>,
    destroying: bool,
    last_connected_time: Option<Instant>,
    last_ready_time: Option<Instant>,
}

pub struct SentinelShard {
    shard_name: String,
    shard_group_name: String,
    cluster_mode: bool,
    factory: Arc<dyn InstanceFactory>,
    state: RwLock<ShardState>,
    /// Round-robin anchor; never decremented.
    current: AtomicUsize,
    prev_connected: AtomicBool,
    /// Default applied to handles created after the last `set_buffering`.
    buffering: Mutex<Option<CommandsBufferingSettings>>,
    ready_change_callback: Option<ReadyChangeCallback>,
    instance_state_change: Arc<Observer<(ServerId, ConnectionState)>>,
    instance_ready: Observer<(ServerId, bool)>,
    not_in_cluster_mode: Arc<Observer<()>>,
}

impl SentinelShard {
    pub fn new(options: SentinelShardOptions) -> Self {
        Self {
            shard_name: options.shard_name,
            shard_group_name: options.shard_group_name,
            cluster_mode: options.cluster_mode,
            factory: options.factory,
            state: RwLock::new(ShardState {
                connection_infos: options.connection_infos.into_iter().collect(),
                instances: Vec::new(),
                clean_wait: Vec::new(),
                destroying: false,
                last_connected_time: None,
                last_ready_time: None,
            }),
            current: AtomicUsize::new(0),
            prev_connected: AtomicBool::new(false),
            buffering: Mutex::new(None),
            ready_change_callback: options.ready_change_callback,
            instance_state_change: Arc::new(Observer::new()),
            instance_ready: Observer::new(),
            not_in_cluster_mode: Arc::new(Observer::new()),
        }
    }

    pub fn shard_name(&self) -> &str {
        &self.shard_name
    }

    /// Route one command. Returns true iff some instance accepted it for
    /// dispatch; never blocks on I/O. Always false once the shard is
    /// destroying.
    pub fn submit(&self, command: &CommandPtr) -> bool {
        let state = self.state.read();
        if state.destroying {
            return false;
        }

        let with_masters = !command.read_only || command.control.allow_reads_from_master;
        let with_slaves = command.read_only;
        let availability = routing::available_servers(
            &state.instances,
            &command.control,
            with_masters,
            with_slaves,
        );

        let max_attempts = state.instances.len() + 1;
        for attempt in 0..max_attempts {
            // Skip whatever the caller just failed on; from the second
            // attempt on, widen past the strategy mask unless the caller
            // pinned a specific server.
            let skip_idx = (attempt == 0).then(|| command.instance_idx());
            let may_fallback_to_any = attempt != 0 && command.control.force_server_id.is_any();

            let start = self.current.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            let selected = routing::select_instance(
                &state.instances,
                &availability,
                may_fallback_to_any,
                skip_idx,
                command.read_only,
                start,
            );

            if let Some((instance, idx)) = selected {
                command.set_instance_idx(idx);
                if (idx >= availability.len() || !availability[idx]) && FALLBACK_WARN.allow() {
                    warn!(
                        "failed to pick a server according to the strategy, \
                         falling back to any server, shard={}",
                        self.shard_name
                    );
                }
                if instance.submit(command) {
                    return true;
                }
            }
        }

        if NOT_READY_WARN.allow() {
            warn!(
                "no server is ready for shard_group={} shard={} read_only={}",
                self.shard_group_name, self.shard_name, command.read_only
            );
        }
        false
    }

    /// Replace the desired member set. Returns true iff it changed, which is
    /// the caller's cue to run a reconciliation cycle.
    pub fn set_connection_infos(
        &self,
        infos: impl IntoIterator<Item = ConnectionInfo>,
    ) -> bool {
        let new_infos: BTreeSet<ConnectionInfo> = infos.into_iter().collect();
        let mut state = self.state.write();
        if new_infos == state.connection_infos {
            return false;
        }
        state.connection_infos = new_infos;
        true
    }

    /// Create handles for every desired member not yet represented, hook
    /// their signals, start them connecting, and queue them as pending; also
    /// drop live entries whose info vanished from the desired set. Returns
    /// true iff the live set changed.
    ///
    /// Called from the topology thread only; `worker` is handed to each new
    /// handle for its I/O.
    pub fn reconcile_create(&self, worker: &Arc<dyn Worker>) -> bool {
        let need_to_create = self.connection_infos_to_create();
        // Mutations all originate on the topology thread, so the sets read
        // above cannot change before update_clean_wait_queue() relocks.
        let buffering = *self.buffering.lock();
        let mut add_clean_wait = Vec::with_capacity(need_to_create.len());

        for info in need_to_create {
            let state_signal = Arc::clone(&self.instance_state_change);
            let mode_signal = Arc::clone(&self.not_in_cluster_mode);
            let events = InstanceEvents {
                state_change: Box::new(move |server_id, state| {
                    trace!("state change signaled, server_id={server_id} state={state}");
                    state_signal.emit(&(server_id, state));
                }),
                not_in_cluster_mode: Box::new(move || mode_signal.emit(&())),
            };

            let instance =
                self.factory
                    .create(worker, self.cluster_mode && info.read_only, events);
            if let Some(settings) = buffering {
                instance.set_buffering(settings);
            }
            instance.connect(&info);
            add_clean_wait.push(ConnectionStatus { info, instance });
        }

        self.update_clean_wait_queue(add_clean_wait)
    }

    /// Promote pending entries that reached Connected, eject live entries
    /// that left it, and drain terminal ones. Returns true iff the live set
    /// changed. Promotion and readiness signals fire after the lock is
    /// released.
    pub fn reconcile_state(&self) -> bool {
        let mut erase_clean_wait = Vec::new();
        let mut ready_signals: Vec<(ServerId, bool)> = Vec::new();
        let mut instances_changed = false;
        let new_connected;
        {
            let mut guard = self.state.write();
            let state = &mut *guard;

            let mut idx = 0;
            while idx < state.instances.len() {
                if state.instances[idx].instance.state() != ConnectionState::Connected {
                    let entry = state.instances.remove(idx);
                    state.clean_wait.push(entry);
                    instances_changed = true;
                } else {
                    idx += 1;
                }
            }

            let mut idx = 0;
            while idx < state.clean_wait.len() {
                let handle_state = state.clean_wait[idx].instance.state();
                match handle_state {
                    ConnectionState::Connected => {
                        let entry = state.clean_wait.remove(idx);
                        trace!(
                            "found connected instance, server_id={}",
                            entry.instance.server_id()
                        );
                        ready_signals
                            .push((entry.instance.server_id(), entry.info.read_only));
                        state.instances.push(entry);
                        instances_changed = true;
                        state.last_connected_time = Some(Instant::now());
                    }
                    _ if handle_state.is_terminal() => {
                        erase_clean_wait.push(state.clean_wait.remove(idx));
                    }
                    _ => idx += 1,
                }
            }

            new_connected = !state.instances.is_empty();
            if !erase_clean_wait.is_empty()
                && state.last_connected_time > state.last_ready_time
            {
                // we were ready, but have just become not ready
                state.last_ready_time = Some(Instant::now());
            }
        }

        drop(erase_clean_wait);

        for signal in &ready_signals {
            self.instance_ready.emit(signal);
        }

        if self.prev_connected.load(Ordering::Relaxed) != new_connected {
            if let Some(callback) = &self.ready_change_callback {
                if catch_unwind(AssertUnwindSafe(|| callback(new_connected))).is_err() {
                    warn!(
                        "readiness callback panicked, shard={} connected={}",
                        self.shard_name, new_connected
                    );
                }
            }
            self.prev_connected.store(new_connected, Ordering::Relaxed);
        }

        instances_changed
    }

    /// Tear the shard down: all further routing fails closed. Handles are
    /// released after the lock is dropped; in-flight commands finish against
    /// them independently.
    pub fn clean(&self) {
        let (_instances, _clean_wait);
        {
            let mut state = self.state.write();
            state.destroying = true;
            _instances = std::mem::take(&mut state.instances);
            _clean_wait = std::mem::take(&mut state.clean_wait);
        }
    }

    /// True iff every live instance is Connected; `allow_empty` controls
    /// whether an empty shard counts.
    pub fn is_connected_to_all(&self, allow_empty: bool) -> bool {
        let state = self.state.read();
        if state
            .instances
            .iter()
            .any(|entry| entry.instance.state() != ConnectionState::Connected)
        {
            return false;
        }
        allow_empty || !state.instances.is_empty()
    }

    /// Ids of every instance currently able to serve.
    pub fn all_ready_server_ids(&self) -> Vec<ServerId> {
        let state = self.state.read();
        state
            .instances
            .iter()
            .filter(|entry| {
                entry.instance.state() == ConnectionState::Connected
                    && !entry.instance.is_destroying()
            })
            .map(|entry| entry.instance.server_id())
            .collect()
    }

    /// Weight-1 map of the servers the strategy would currently accept;
    /// locality-aware discovery feeds on this.
    pub fn available_servers_weighted(
        &self,
        with_master: bool,
        control: &CommandControl,
    ) -> AHashMap<ServerId, usize> {
        let state = self.state.read();
        let availability =
            routing::available_servers(&state.instances, control, with_master, true);
        let mut weights = AHashMap::new();
        for (idx, entry) in state.instances.iter().enumerate() {
            if availability[idx]
                && entry.instance.state() == ConnectionState::Connected
                && !entry.instance.is_destroying()
                && (with_master || entry.info.read_only)
            {
                weights.insert(entry.instance.server_id(), 1);
            }
        }
        weights
    }

    /// Snapshot of the requested side of the shard, keyed by `host:port`.
    pub fn statistics(&self, master: bool) -> ShardStatistics {
        let state = self.state.read();
        let mut stats = ShardStatistics::default();
        for entry in &state.instances {
            if entry.info.read_only == master {
                continue;
            }
            let instance_stats = InstanceStatistics::gather(entry.instance.as_ref());
            stats.shard_total.add(&instance_stats);
            stats.instances.insert(entry.info.fulltext(), instance_stats);
            if entry.instance.state() == ConnectionState::Connected {
                stats.is_ready = true;
            }
        }
        stats.last_ready_time = state.last_ready_time;
        stats
    }

    pub fn instances_count(&self) -> usize {
        self.state.read().instances.len()
    }

    /// Propagate batching knobs to every live and pending handle, and record
    /// them as the default for handles created later.
    pub fn set_buffering(&self, settings: CommandsBufferingSettings) {
        {
            let state = self.state.read();
            for entry in state.instances.iter().chain(state.clean_wait.iter()) {
                entry.instance.set_buffering(settings);
            }
        }
        *self.buffering.lock() = Some(settings);
    }

    pub fn on_instance_state_change(&self) -> &Observer<(ServerId, ConnectionState)> {
        &self.instance_state_change
    }

    pub fn on_instance_ready(&self) -> &Observer<(ServerId, bool)> {
        &self.instance_ready
    }

    pub fn on_not_in_cluster_mode(&self) -> &Observer<()> {
        &self.not_in_cluster_mode
    }

    fn connection_infos_to_create(&self) -> Vec<ConnectionInfo> {
        let state = self.state.read();
        state
            .connection_infos
            .iter()
            .filter(|info| {
                !state
                    .instances
                    .iter()
                    .chain(state.clean_wait.iter())
                    .any(|entry| entry.info.same_endpoint(info))
            })
            .cloned()
            .collect()
    }

    /// Append the freshly created entries and sweep live entries against the
    /// desired set: vanished infos are dropped, a changed role flag is
    /// mutated in place.
    fn update_clean_wait_queue(&self, add_clean_wait: Vec<ConnectionStatus>) -> bool {
        let mut instances_changed = false;
        let mut erase_instance = Vec::new();
        {
            let mut guard = self.state.write();
            let state = &mut *guard;
            state.clean_wait.extend(add_clean_wait);

            let mut idx = 0;
            while idx < state.instances.len() {
                let desired = state
                    .connection_infos
                    .iter()
                    .find(|info| info.same_endpoint(&state.instances[idx].info))
                    .cloned();
                match desired {
                    None => {
                        erase_instance.push(state.instances.remove(idx));
                        instances_changed = true;
                    }
                    Some(info) => {
                        if info.read_only != state.instances[idx].info.read_only {
                            state.instances[idx].info.read_only = info.read_only;
                            instances_changed = true;
                        }
                        idx += 1;
                    }
                }
            }
        }
        drop(erase_instance);
        instances_changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, Strategy, DEFAULT_PREV_INSTANCE_IDX};
    use crate::instance::mock::{ImmediateWorker, MockFactory, MockInstance};
    use crate::instance::RedisInstance;
    use bytes::Bytes;

    fn command(read_only: bool, control: CommandControl) -> CommandPtr {
        Command::new(
            vec![Bytes::from_static(b"GET"), Bytes::from_static(b"key")],
            control,
            read_only,
        )
    }

    struct Harness {
        shard: SentinelShard,
        factory: Arc<MockFactory>,
        worker: Arc<dyn Worker>,
        ready_flips: Arc<Mutex<Vec<bool>>>,
    }

    impl Harness {
        fn new(infos: Vec<ConnectionInfo>) -> Self {
            let factory = Arc::new(MockFactory::default());
            let ready_flips: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
            let flips = Arc::clone(&ready_flips);
            let shard = SentinelShard::new(SentinelShardOptions {
                shard_name: "shard0".to_string(),
                shard_group_name: "test-group".to_string(),
                cluster_mode: false,
                connection_infos: infos,
                ready_change_callback: Some(Box::new(move |ready| flips.lock().push(ready))),
                factory: Arc::clone(&factory) as Arc<dyn InstanceFactory>,
            });
            Self {
                shard,
                factory,
                worker: Arc::new(ImmediateWorker),
                ready_flips,
            }
        }

        /// Full reconcile with every created handle forced to `state`.
        fn converge(&self, state: ConnectionState) {
            self.shard.reconcile_create(&self.worker);
            for mock in self.factory.created.lock().iter() {
                if mock.state() == ConnectionState::Init {
                    mock.set_state(state);
                }
            }
            self.shard.reconcile_state();
        }

        fn mock(&self, idx: usize) -> Arc<MockInstance> {
            Arc::clone(&self.factory.created.lock()[idx])
        }
    }

    fn master_and_replicas() -> Vec<ConnectionInfo> {
        vec![
            ConnectionInfo::new("m", 6379),
            ConnectionInfo::new("r1", 6379).read_only(true),
            ConnectionInfo::new("r2", 6379).read_only(true),
        ]
    }

    #[test]
    fn test_simple_master_write() {
        let harness = Harness::new(master_and_replicas());
        harness.converge(ConnectionState::Connected);

        let cmd = command(false, CommandControl::default());
        assert!(harness.shard.submit(&cmd));

        let masters: Vec<_> = harness
            .factory
            .created
            .lock()
            .iter()
            .filter(|m| m.server_host() == "m")
            .cloned()
            .collect();
        assert_eq!(masters.len(), 1);
        assert_eq!(masters[0].submitted_count(), 1);
    }

    #[test]
    fn test_writable_never_lands_on_replica() {
        let harness = Harness::new(master_and_replicas());
        harness.converge(ConnectionState::Connected);

        for mock in harness.factory.created.lock().iter() {
            if mock.server_host() == "m" {
                mock.set_destroying(true);
            }
        }

        let cmd = command(false, CommandControl::default());
        assert!(!harness.shard.submit(&cmd));
        for mock in harness.factory.created.lock().iter() {
            if mock.server_host() != "m" {
                assert_eq!(mock.submitted_count(), 0);
            }
        }
    }

    #[test]
    fn test_read_goes_to_replica_by_default() {
        let harness = Harness::new(master_and_replicas());
        harness.converge(ConnectionState::Connected);

        let cmd = command(true, CommandControl::default());
        assert!(harness.shard.submit(&cmd));
        for mock in harness.factory.created.lock().iter() {
            if mock.server_host() == "m" {
                assert_eq!(mock.submitted_count(), 0);
            }
        }
    }

    #[test]
    fn test_read_falls_back_to_master_on_second_attempt() {
        let harness = Harness::new(master_and_replicas());
        harness.converge(ConnectionState::Connected);

        for mock in harness.factory.created.lock().iter() {
            if mock.server_host() != "m" {
                mock.set_accept(false);
            }
        }

        let cmd = command(true, CommandControl::default());
        assert!(harness.shard.submit(&cmd));
        let handled_by_master = harness
            .factory
            .created
            .lock()
            .iter()
            .any(|m| m.server_host() == "m" && m.submitted_count() == 1);
        assert!(handled_by_master);
    }

    #[test]
    fn test_pinned_id_missing_returns_false_and_leaves_slot() {
        let harness = Harness::new(master_and_replicas());
        harness.converge(ConnectionState::Connected);

        let control = CommandControl {
            force_server_id: ServerId::generate(),
            ..CommandControl::default()
        };
        let cmd = command(true, control);
        assert!(!harness.shard.submit(&cmd));
        assert_eq!(cmd.instance_idx(), DEFAULT_PREV_INSTANCE_IDX);
        for mock in harness.factory.created.lock().iter() {
            assert_eq!(mock.submitted_count(), 0);
        }
    }

    #[test]
    fn test_pinned_id_present_hits_exactly_that_server() {
        let harness = Harness::new(master_and_replicas());
        harness.converge(ConnectionState::Connected);

        let pinned = harness.mock(1);
        let control = CommandControl {
            force_server_id: pinned.server_id(),
            ..CommandControl::default()
        };
        let cmd = command(true, control);
        assert!(harness.shard.submit(&cmd));
        assert_eq!(pinned.submitted_count(), 1);
        for (idx, mock) in harness.factory.created.lock().iter().enumerate() {
            if idx != 1 {
                assert_eq!(mock.submitted_count(), 0);
            }
        }
    }

    #[test]
    fn test_retry_skips_previous_instance() {
        let infos = vec![
            ConnectionInfo::new("r1", 6379).read_only(true),
            ConnectionInfo::new("r2", 6379).read_only(true),
        ];
        let harness = Harness::new(infos);
        harness.converge(ConnectionState::Connected);

        let cmd = command(true, CommandControl::default());
        assert!(harness.shard.submit(&cmd));
        let first_idx = cmd.instance_idx();

        assert!(harness.shard.submit(&cmd));
        assert_ne!(cmd.instance_idx(), first_idx);
    }

    #[test]
    fn test_least_loaded_replica_wins() {
        let harness = Harness::new(master_and_replicas());
        harness.converge(ConnectionState::Connected);

        let mut lightest = None;
        for mock in harness.factory.created.lock().iter() {
            match mock.server_host().as_str() {
                "r1" => mock.set_running(9),
                "r2" => {
                    mock.set_running(1);
                    lightest = Some(Arc::clone(mock));
                }
                _ => mock.set_running(5),
            }
        }

        let cmd = command(true, CommandControl::default());
        assert!(harness.shard.submit(&cmd));
        assert_eq!(lightest.unwrap().submitted_count(), 1);
    }

    #[test]
    fn test_nearest_ping_window() {
        // pings: a=5ms, b=20ms, c=1ms, window 2 -> first pick from {c, a}
        let infos = vec![
            ConnectionInfo::new("a", 6379).read_only(true),
            ConnectionInfo::new("b", 6379).read_only(true),
            ConnectionInfo::new("c", 6379).read_only(true),
        ];
        let harness = Harness::new(infos);
        harness.converge(ConnectionState::Connected);
        for mock in harness.factory.created.lock().iter() {
            let ping = match mock.server_host().as_str() {
                "a" => Duration::from_millis(5),
                "b" => Duration::from_millis(20),
                _ => Duration::from_millis(1),
            };
            mock.set_ping(ping);
        }

        let control = CommandControl {
            strategy: Strategy::NearestServerPing,
            best_dc_count: 2,
            ..CommandControl::default()
        };
        for _ in 0..6 {
            let cmd = command(true, control.clone());
            assert!(harness.shard.submit(&cmd));
        }
        for mock in harness.factory.created.lock().iter() {
            if mock.server_host() == "b" {
                assert_eq!(mock.submitted_count(), 0);
            }
        }
    }

    #[test]
    fn test_nearest_ping_fallback_reaches_out_of_window_server() {
        let infos = vec![
            ConnectionInfo::new("a", 6379).read_only(true),
            ConnectionInfo::new("b", 6379).read_only(true),
        ];
        let harness = Harness::new(infos);
        harness.converge(ConnectionState::Connected);
        for mock in harness.factory.created.lock().iter() {
            match mock.server_host().as_str() {
                "a" => {
                    mock.set_ping(Duration::from_millis(1));
                    mock.set_accept(false);
                }
                _ => mock.set_ping(Duration::from_millis(50)),
            }
        }

        let control = CommandControl {
            strategy: Strategy::NearestServerPing,
            best_dc_count: 1,
            ..CommandControl::default()
        };
        let cmd = command(true, control);
        assert!(harness.shard.submit(&cmd));
        let served = harness
            .factory
            .created
            .lock()
            .iter()
            .any(|m| m.server_host() == "b" && m.submitted_count() == 1);
        assert!(served);
    }

    #[test]
    fn test_reconcile_promotion_fires_signals_once() {
        let harness = Harness::new(vec![
            ConnectionInfo::new("a", 6379),
            ConnectionInfo::new("b", 6379).read_only(true),
        ]);

        let ready_events: Arc<Mutex<Vec<(ServerId, bool)>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let ready_events = Arc::clone(&ready_events);
            harness
                .shard
                .on_instance_ready()
                .subscribe(move |event| ready_events.lock().push(*event));
        }

        // pending-only growth is not a live-set change
        assert!(!harness.shard.reconcile_create(&harness.worker));
        assert_eq!(harness.shard.instances_count(), 0);
        assert!(harness.ready_flips.lock().is_empty());

        let handle_a = harness.mock(0);
        handle_a.set_state(ConnectionState::Connected);
        assert!(harness.shard.reconcile_state());

        assert_eq!(harness.shard.instances_count(), 1);
        assert_eq!(ready_events.lock().len(), 1);
        assert_eq!(ready_events.lock()[0].0, handle_a.server_id());
        assert_eq!(*harness.ready_flips.lock(), vec![true]);

        // no external change: nothing new fires
        assert!(!harness.shard.reconcile_state());
        assert_eq!(ready_events.lock().len(), 1);
        assert_eq!(*harness.ready_flips.lock(), vec![true]);
    }

    #[test]
    fn test_reconcile_demotion_flips_readiness_and_advances_ready_time() {
        let harness = Harness::new(vec![ConnectionInfo::new("a", 6379)]);
        harness.converge(ConnectionState::Connected);
        assert_eq!(*harness.ready_flips.lock(), vec![true]);
        assert!(harness.shard.statistics(true).last_ready_time.is_none());

        harness.mock(0).set_state(ConnectionState::Disconnecting);
        assert!(harness.shard.reconcile_state());

        assert_eq!(harness.shard.instances_count(), 0);
        assert_eq!(*harness.ready_flips.lock(), vec![true, false]);
        assert!(harness.shard.statistics(true).last_ready_time.is_some());
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let harness = Harness::new(master_and_replicas());
        harness.converge(ConnectionState::Connected);
        assert_eq!(harness.shard.instances_count(), 3);
        let created = harness.factory.created.lock().len();

        assert!(!harness.shard.reconcile_create(&harness.worker));
        assert!(!harness.shard.reconcile_state());
        assert_eq!(harness.factory.created.lock().len(), created);
        assert_eq!(harness.shard.instances_count(), 3);
    }

    #[test]
    fn test_instances_and_clean_wait_stay_disjoint_and_desired() {
        let harness = Harness::new(master_and_replicas());
        harness.shard.reconcile_create(&harness.worker);
        harness.mock(0).set_state(ConnectionState::Connected);
        harness.shard.reconcile_state();

        let state = harness.shard.state.read();
        for live in &state.instances {
            assert!(
                !state
                    .clean_wait
                    .iter()
                    .any(|pending| pending.info.same_endpoint(&live.info)),
                "an endpoint must never sit in both queues"
            );
        }
        for entry in state.instances.iter().chain(state.clean_wait.iter()) {
            assert!(state
                .connection_infos
                .iter()
                .any(|info| info.same_endpoint(&entry.info)));
        }
    }

    #[test]
    fn test_vanished_info_drops_live_instance() {
        let harness = Harness::new(master_and_replicas());
        harness.converge(ConnectionState::Connected);
        assert_eq!(harness.shard.instances_count(), 3);

        assert!(harness.shard.set_connection_infos(vec![
            ConnectionInfo::new("m", 6379),
            ConnectionInfo::new("r1", 6379).read_only(true),
        ]));
        assert!(harness.shard.reconcile_create(&harness.worker));
        assert_eq!(harness.shard.instances_count(), 2);
    }

    #[test]
    fn test_role_flip_mutates_live_entry_in_place() {
        let harness = Harness::new(vec![ConnectionInfo::new("a", 6379).read_only(true)]);
        harness.converge(ConnectionState::Connected);
        let created = harness.factory.created.lock().len();

        // same endpoint, now a master
        assert!(harness
            .shard
            .set_connection_infos(vec![ConnectionInfo::new("a", 6379)]));
        assert!(harness.shard.reconcile_create(&harness.worker));

        assert_eq!(harness.factory.created.lock().len(), created);
        let state = harness.shard.state.read();
        assert_eq!(state.instances.len(), 1);
        assert!(!state.instances[0].info.read_only);
    }

    #[test]
    fn test_set_connection_infos_detects_no_change() {
        let harness = Harness::new(master_and_replicas());
        assert!(!harness.shard.set_connection_infos(master_and_replicas()));
        assert!(harness
            .shard
            .set_connection_infos(vec![ConnectionInfo::new("m", 6379)]));
    }

    #[test]
    fn test_clean_closes_the_door() {
        let harness = Harness::new(master_and_replicas());
        harness.converge(ConnectionState::Connected);
        assert!(harness.shard.submit(&command(false, CommandControl::default())));

        harness.shard.clean();
        assert!(!harness.shard.submit(&command(false, CommandControl::default())));
        assert!(!harness.shard.submit(&command(true, CommandControl::default())));
        assert_eq!(harness.shard.instances_count(), 0);
    }

    #[test]
    fn test_panicking_ready_callback_is_contained() {
        let factory = Arc::new(MockFactory::default());
        let shard = SentinelShard::new(SentinelShardOptions {
            shard_name: "shard0".to_string(),
            shard_group_name: "g".to_string(),
            cluster_mode: false,
            connection_infos: vec![ConnectionInfo::new("a", 6379)],
            ready_change_callback: Some(Box::new(|_| panic!("observer bug"))),
            factory: Arc::clone(&factory) as Arc<dyn InstanceFactory>,
        });
        let worker: Arc<dyn Worker> = Arc::new(ImmediateWorker);

        shard.reconcile_create(&worker);
        factory.created.lock()[0].set_state(ConnectionState::Connected);
        assert!(shard.reconcile_state());
        assert_eq!(shard.instances_count(), 1);
    }

    #[test]
    fn test_is_connected_to_all() {
        let harness = Harness::new(master_and_replicas());
        assert!(harness.shard.is_connected_to_all(true));
        assert!(!harness.shard.is_connected_to_all(false));

        harness.converge(ConnectionState::Connected);
        assert!(harness.shard.is_connected_to_all(false));

        harness.mock(0).set_state(ConnectionState::Disconnected);
        assert!(!harness.shard.is_connected_to_all(true));
    }

    #[test]
    fn test_all_ready_server_ids_excludes_destroying() {
        let harness = Harness::new(master_and_replicas());
        harness.converge(ConnectionState::Connected);
        assert_eq!(harness.shard.all_ready_server_ids().len(), 3);

        harness.mock(1).set_destroying(true);
        assert_eq!(harness.shard.all_ready_server_ids().len(), 2);
    }

    #[test]
    fn test_available_servers_weighted_filters_roles() {
        let harness = Harness::new(master_and_replicas());
        harness.converge(ConnectionState::Connected);

        let replicas_only = harness
            .shard
            .available_servers_weighted(false, &CommandControl::default());
        assert_eq!(replicas_only.len(), 2);
        assert!(replicas_only.values().all(|weight| *weight == 1));

        let with_master = harness
            .shard
            .available_servers_weighted(true, &CommandControl::default());
        assert_eq!(with_master.len(), 3);
    }

    #[test]
    fn test_statistics_sides_and_readiness() {
        let harness = Harness::new(master_and_replicas());
        harness.converge(ConnectionState::Connected);

        let master_side = harness.shard.statistics(true);
        assert_eq!(master_side.instances.len(), 1);
        assert!(master_side.is_ready);
        assert!(master_side.instances.contains_key("m:6379"));

        let replica_side = harness.shard.statistics(false);
        assert_eq!(replica_side.instances.len(), 2);
        assert_eq!(replica_side.shard_total.instances, 2);
        assert_eq!(replica_side.shard_total.connected, 2);
    }

    #[test]
    fn test_set_buffering_propagates_and_applies_to_future_handles() {
        let harness = Harness::new(vec![ConnectionInfo::new("a", 6379)]);
        harness.converge(ConnectionState::Connected);

        let settings = CommandsBufferingSettings {
            buffering_enabled: true,
            commands_buffering_threshold: 32,
            watch_command_timer_interval: Duration::from_millis(5),
        };
        harness.shard.set_buffering(settings);
        assert_eq!(*harness.mock(0).buffering.lock(), Some(settings));

        harness
            .shard
            .set_connection_infos(vec![
                ConnectionInfo::new("a", 6379),
                ConnectionInfo::new("b", 6379).read_only(true),
            ]);
        harness.shard.reconcile_create(&harness.worker);
        assert_eq!(*harness.mock(1).buffering.lock(), Some(settings));
    }

    #[test]
    fn test_cluster_mode_marks_readonly_handles() {
        let factory = Arc::new(MockFactory::default());
        let shard = SentinelShard::new(SentinelShardOptions {
            shard_name: "shard0".to_string(),
            shard_group_name: "g".to_string(),
            cluster_mode: true,
            connection_infos: vec![
                ConnectionInfo::new("m", 6379),
                ConnectionInfo::new("r", 6379).read_only(true),
            ],
            ready_change_callback: None,
            factory: Arc::clone(&factory) as Arc<dyn InstanceFactory>,
        });
        let worker: Arc<dyn Worker> = Arc::new(ImmediateWorker);
        shard.reconcile_create(&worker);

        let flags = factory.send_readonly_flags.lock().clone();
        assert_eq!(flags.len(), 2);
        assert_eq!(flags.iter().filter(|flag| **flag).count(), 1);
    }

    #[test]
    fn test_instance_state_change_signal_fans_out() {
        let harness = Harness::new(vec![ConnectionInfo::new("a", 6379)]);
        let seen: Arc<Mutex<Vec<(ServerId, ConnectionState)>>> =
            Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            harness
                .shard
                .on_instance_state_change()
                .subscribe(move |event| seen.lock().push(*event));
        }

        harness.shard.reconcile_create(&harness.worker);
        harness.mock(0).transition(ConnectionState::Connected);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, ConnectionState::Connected);
    }
}
