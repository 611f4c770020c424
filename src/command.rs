//! Commands and their per-command routing knobs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::instance::ServerId;

/// Retry-slot value meaning "no previously tried instance".
pub const DEFAULT_PREV_INSTANCE_IDX: usize = usize::MAX;

/// Per-command instance selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    #[default]
    Default,
    /// Consider every instance whose role matches the command class.
    EveryDc,
    /// Prefer instances co-located with the caller, measured by ping.
    LocalDcConductor,
    /// Prefer the instances with the lowest measured ping latency.
    NearestServerPing,
}

impl Strategy {
    /// Whether candidates are ordered by measured ping latency.
    pub fn is_nearest_ping(self) -> bool {
        matches!(self, Strategy::LocalDcConductor | Strategy::NearestServerPing)
    }
}

/// Routing knobs carried by every command.
#[derive(Debug, Clone)]
pub struct CommandControl {
    pub strategy: Strategy,
    /// Pin the command to one server. [`ServerId::any`] means no pin.
    pub force_server_id: ServerId,
    /// Permit the replica-phase fallback onto the master.
    pub allow_reads_from_master: bool,
    /// Window size for the nearest-ping strategies. Zero means all instances.
    pub best_dc_count: usize,
}

impl Default for CommandControl {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            force_server_id: ServerId::any(),
            allow_reads_from_master: false,
            best_dc_count: 0,
        }
    }
}

/// A command heading for one instance of a shard.
///
/// The router treats the argument list as opaque bytes; encoding belongs to
/// the connection layer. `instance_idx` is the caller-maintained "last tried"
/// slot: the router skips that instance on the first attempt of a resubmit
/// and writes back whichever slot it actually used.
pub struct Command {
    pub args: Vec<Bytes>,
    pub control: CommandControl,
    pub read_only: bool,
    instance_idx: AtomicUsize,
}

/// Commands are shared between the caller and the accepting instance.
pub type CommandPtr = Arc<Command>;

impl Command {
    pub fn new(args: Vec<Bytes>, control: CommandControl, read_only: bool) -> CommandPtr {
        Arc::new(Self {
            args,
            control,
            read_only,
            instance_idx: AtomicUsize::new(DEFAULT_PREV_INSTANCE_IDX),
        })
    }

    /// The command verb, for diagnostics.
    pub fn name(&self) -> String {
        self.args
            .first()
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .unwrap_or_default()
    }

    pub fn instance_idx(&self) -> usize {
        self.instance_idx.load(Ordering::Relaxed)
    }

    pub fn set_instance_idx(&self, idx: usize) {
        self.instance_idx.store(idx, Ordering::Relaxed);
    }
}
