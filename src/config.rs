//! Tunable parameters of a Homa instance.
//!
//! Every knob here corresponds to a sysctl in the original kernel module.
//! Values are fixed at [`Homa::new`](crate::Homa::new) time.

use crate::type_alias::{Port, Priority};
use crate::wire::HOMA_MAX_PRIORITIES;

/// Flag bit: disable the pacer entirely (used by tests).
pub const FLAG_DONT_THROTTLE: u32 = 1;

/// Configuration for a Homa transport instance.
#[derive(Debug, Clone)]
pub struct HomaConfig {
    /// Ticks of peer silence before the first RESEND goes out.
    pub resend_ticks: u32,

    /// Ticks between successive RESENDs for the same RPC.
    pub resend_interval: u32,

    /// Ticks of peer silence after which an RPC fails with `TimedOut`.
    pub timeout_ticks: u32,

    /// Unanswered RESENDs to a peer after which its RPCs fail.
    pub timeout_resends: u32,

    /// Ticks a server waits after finishing a response before asking the
    /// client to acknowledge it with NEED_ACK.
    pub request_ack_ticks: u32,

    /// Aggregate packet buffers on dead RPCs a socket may accumulate before
    /// the timer starts reaping aggressively.
    pub dead_buffs_limit: usize,

    /// Bytes each sender may transmit without waiting for grants.
    pub unsched_bytes: usize,

    /// Per-RPC grant window: bytes of authorized-but-unreceived data the
    /// grant scheduler maintains for each active incoming message.
    pub window: usize,

    /// Maximum number of incoming RPCs that may hold grants at once.
    pub num_active_rpcs: usize,

    /// Messages no longer than this bypass the pacer's throttle queue.
    pub throttle_min_bytes: usize,

    /// Link speed used for pacer accounting.
    pub link_mbps: u64,

    /// Maximum NIC queue backlog the pacer tolerates, in nanoseconds of
    /// transmit time.
    pub max_nic_queue_ns: u64,

    /// Highest priority level usable for scheduled (granted) data.
    /// Levels above it are reserved for unscheduled data and controls.
    pub max_sched_prio: Priority,

    /// `unsched_cutoffs[p]` is the largest message length that may use
    /// priority `p` for its unscheduled bytes.
    pub unsched_cutoffs: [u32; HOMA_MAX_PRIORITIES],

    /// Version number advertised with the cutoffs, bumped when they change.
    pub cutoff_version: u16,

    /// Ports below this boundary are server ports and must be bound
    /// explicitly; ports at or above it are handed out to clients.
    pub min_default_port: Port,

    /// Behavior flags ([`FLAG_DONT_THROTTLE`]).
    pub flags: u32,
}

impl Default for HomaConfig {
    fn default() -> Self {
        Self {
            resend_ticks: 5,
            resend_interval: 5,
            timeout_ticks: 100,
            timeout_resends: 5,
            request_ack_ticks: 10,
            dead_buffs_limit: 5000,
            unsched_bytes: 10000,
            window: 10000,
            num_active_rpcs: 10,
            throttle_min_bytes: 200,
            link_mbps: 10_000,
            max_nic_queue_ns: 5000,
            max_sched_prio: 5,
            // Small messages climb to the highest priorities; everything
            // else shares the top scheduled-adjacent level.
            unsched_cutoffs: [0, 0, 0, 0, 0, u32::MAX, 2800, 256],
            cutoff_version: 1,
            min_default_port: 0x8000,
            flags: 0,
        }
    }
}

impl HomaConfig {
    /// Return `true` if the pacer is disabled.
    #[inline(always)]
    pub(crate) fn dont_throttle(&self) -> bool {
        self.flags & FLAG_DONT_THROTTLE != 0
    }

    /// Pick the priority for the unscheduled bytes of a message of the
    /// given total length, using this instance's cutoffs.
    pub(crate) fn unsched_priority(&self, length: usize) -> Priority {
        for prio in (0..HOMA_MAX_PRIORITIES).rev() {
            if length <= self.unsched_cutoffs[prio] as usize {
                return prio as Priority;
            }
        }
        self.max_sched_prio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsched_priority_follows_cutoffs() {
        let config = HomaConfig::default();
        assert_eq!(config.unsched_priority(100), 7);
        assert_eq!(config.unsched_priority(256), 7);
        assert_eq!(config.unsched_priority(257), 6);
        assert_eq!(config.unsched_priority(2800), 6);
        assert_eq!(config.unsched_priority(100_000), 5);
    }
}
