//! Strategy evaluation: which instances may serve a command, and in which
//! order candidates are tried.
//!
//! Both shard flavors share this vocabulary. The sentinel shard works over
//! `(info, handle)` pairs and a per-command availability mask; the cluster
//! shard works over a pre-shaped candidate vector with a computed rotation
//! anchor. Selection is always round-robin filtered down to the least-loaded
//! eligible handle.

use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use log::{debug, warn};

use crate::command::{CommandControl, Strategy, DEFAULT_PREV_INSTANCE_IDX};
use crate::instance::{ConnectionState, ConnectionStatus, RedisInstance};
use crate::throttle::LogThrottle;

static SERVER_NOT_FOUND_WARN: LogThrottle = LogThrottle::new(Duration::from_secs(1));

/// Per-instance mask: which of `instances` satisfy `control` for the current
/// command class.
///
/// A pinned `force_server_id` produces a single-element mask on the matching
/// instance, or an all-zero mask (with one rate-limited warning) when the
/// pinned server is absent.
pub(crate) fn available_servers(
    instances: &[ConnectionStatus],
    control: &CommandControl,
    with_masters: bool,
    with_slaves: bool,
) -> Vec<bool> {
    if !control.force_server_id.is_any() {
        let id = control.force_server_id;
        let mut result = vec![false; instances.len()];
        for (idx, entry) in instances.iter().enumerate() {
            if entry.instance.server_id() == id {
                result[idx] = true;
                return result;
            }
        }
        if SERVER_NOT_FOUND_WARN.allow() {
            warn!("server_id={id} not found in shard (dead server?)");
        }
        return result;
    }

    match control.strategy {
        Strategy::Default | Strategy::EveryDc => instances
            .iter()
            .map(|entry| {
                if entry.info.read_only {
                    with_slaves
                } else {
                    with_masters
                }
            })
            .collect(),
        Strategy::LocalDcConductor | Strategy::NearestServerPing => {
            nearest_servers_by_ping(instances, control, with_masters, with_slaves)
        }
    }
}

/// Mark the `best_dc_count` role-matching instances with the lowest ping.
fn nearest_servers_by_ping(
    instances: &[ConnectionStatus],
    control: &CommandControl,
    with_masters: bool,
    with_slaves: bool,
) -> Vec<bool> {
    let mut count = control.best_dc_count;
    if count == 0 {
        count = instances.len();
    }

    let sorted_by_ping = instances
        .iter()
        .enumerate()
        .map(|(idx, entry)| (entry.instance.ping_latency(), idx))
        .sorted_unstable()
        .collect_vec();

    let mut result = vec![false; instances.len()];
    for (ping, idx) in sorted_by_ping {
        if count == 0 {
            break;
        }
        let info = &instances[idx].info;
        if (with_slaves && info.read_only) || (with_masters && !info.read_only) {
            result[idx] = true;
            debug!(
                "server with acceptable ping, server={}, ping={:?}",
                instances[idx].instance.server_host(),
                ping
            );
            count -= 1;
        }
    }
    result
}

/// Round-robin from `start`, returning the least-loaded eligible handle.
///
/// Eligibility: not the skip slot, role-compatible, covered by the mask
/// unless fallback is allowed, Connected, and not tearing down. Ties on
/// running-command count resolve to the first candidate seen.
pub(crate) fn select_instance(
    instances: &[ConnectionStatus],
    availability: &[bool],
    may_fallback_to_any: bool,
    skip_idx: Option<usize>,
    read_only: bool,
    start: usize,
) -> Option<(Arc<dyn RedisInstance>, usize)> {
    let end = instances.len();
    let mut chosen: Option<(Arc<dyn RedisInstance>, usize)> = None;

    for offset in 0..end {
        let idx = (start + offset) % end;
        if Some(idx) == skip_idx
            || (!read_only && instances[idx].info.read_only)
            || (!may_fallback_to_any && !availability[idx])
        {
            continue;
        }

        let candidate = &instances[idx].instance;
        if candidate.is_destroying() || candidate.state() != ConnectionState::Connected {
            continue;
        }

        let better = match &chosen {
            None => true,
            Some((best, _)) => {
                best.is_destroying()
                    || candidate.running_commands() < best.running_commands()
            }
        };
        if better {
            chosen = Some((Arc::clone(candidate), idx));
        }
    }
    chosen
}

/// Least-loaded selection over a cluster candidate vector.
///
/// On the first attempt of a nearest-ping command the window is restricted to
/// the `best_dc_count` head of the vector; later attempts widen to all of it.
pub(crate) fn select_cluster_instance(
    candidates: &[Arc<dyn RedisInstance>],
    start_idx: usize,
    attempt: usize,
    is_nearest_ping: bool,
    best_dc_count: usize,
) -> Option<(Arc<dyn RedisInstance>, usize)> {
    let end = if is_nearest_ping && attempt == 0 && best_dc_count != 0 {
        candidates.len().min(best_dc_count)
    } else {
        candidates.len()
    };
    if end == 0 {
        return None;
    }

    let mut chosen: Option<(Arc<dyn RedisInstance>, usize)> = None;
    for offset in 0..end {
        let idx = (start_idx + offset) % end;
        let candidate = &candidates[idx];
        if candidate.is_destroying()
            || candidate.state() != ConnectionState::Connected
            || candidate.is_syncing()
        {
            continue;
        }
        let better = match &chosen {
            None => true,
            Some((best, _)) => {
                best.is_destroying()
                    || candidate.running_commands() < best.running_commands()
            }
        };
        if better {
            chosen = Some((Arc::clone(candidate), idx));
        }
    }
    chosen
}

/// Order the first `best_dc_count` candidates ascending by ping latency,
/// leaving the tail as fallback.
pub(crate) fn prioritize_nearest(candidates: &mut [Arc<dyn RedisInstance>], best_dc_count: usize) {
    let len = candidates.len();
    let num = best_dc_count.min(len);
    if num == 0 {
        return;
    }
    let by_ping = |a: &Arc<dyn RedisInstance>, b: &Arc<dyn RedisInstance>| {
        a.ping_latency().cmp(&b.ping_latency())
    };
    if num < len {
        candidates.select_nth_unstable_by(num - 1, by_ping);
    }
    candidates[..num].sort_unstable_by(by_ping);
}

/// Rotation anchor for one cluster routing attempt.
///
/// The candidate vector keeps the master in the trailing slot; on the very
/// first attempt of a fresh read with reads-from-master disabled the count is
/// reduced by one (clamped at 1) so the initial rotation cannot land on it.
/// Retries rotate away from the caller's previous slot instead of the shared
/// counter, guaranteeing the just-failed instance is not picked again
/// immediately.
pub(crate) fn cluster_start_index(
    control: &CommandControl,
    attempt: usize,
    is_nearest_ping: bool,
    prev_instance_idx: usize,
    current: usize,
    servers_count: usize,
) -> usize {
    let best_dc_count = if control.best_dc_count == 0 {
        usize::MAX
    } else {
        control.best_dc_count
    };
    let first_attempt = attempt == 0;
    let first_try = prev_instance_idx == DEFAULT_PREV_INSTANCE_IDX;

    let servers_count = if first_try && first_attempt && !control.allow_reads_from_master {
        servers_count.saturating_sub(1).max(1)
    } else {
        servers_count
    };

    if is_nearest_ping {
        let base = if first_try {
            current % best_dc_count.min(servers_count)
        } else {
            prev_instance_idx + 1
        };
        return (attempt + base) % servers_count;
    }

    if first_try {
        (current + attempt) % servers_count
    } else {
        (prev_instance_idx + 1 + attempt) % servers_count
    }
}
