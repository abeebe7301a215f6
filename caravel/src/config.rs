//! Pool configuration.

use crate::pool::placement::PlacementPolicy;
use caravel_transport::{Address, ChannelConfig};
use std::time::Duration;

/// What the supervisor does when a sub-process dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Leave the sub-pool down; its actors stay failed.
    Never,
    /// Relaunch the sub-process. Actor state is never reconstituted;
    /// clients re-create.
    OnFailure,
}

impl std::str::FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "never" => Ok(Self::Never),
            "on-failure" | "on_failure" => Ok(Self::OnFailure),
            other => Err(format!("unknown restart policy {other:?}")),
        }
    }
}

/// Reconnect backoff parameters (exponential, full jitter).
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub base: Duration,
    pub cap: Duration,
    /// Total budget from the first failure; past it, sends fail
    /// immediately until a lookup refresh resets the peer.
    pub deadline: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(10),
            deadline: Duration::from_secs(30),
        }
    }
}

/// Full configuration of one pool process.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// This pool's endpoint.
    pub address: Address,
    /// Worker sub-processes behind the main process.
    pub n_subpools: u32,
    /// Worker threads for the actor scheduler. `None` means one per core.
    pub worker_threads: Option<usize>,
    /// Ceiling for a single envelope, checked before send.
    pub max_envelope_bytes: usize,
    /// Idle interval between heartbeat probes.
    pub heartbeat_interval: Duration,
    /// Consecutive misses before a peer is declared gone.
    pub heartbeat_misses: u32,
    /// Budget for graceful shutdown before sub-processes are killed.
    pub graceful_deadline: Duration,
    pub restart_policy: RestartPolicy,
    /// Default placement for new actors.
    pub allocation_policy: PlacementPolicy,
    /// How long cross-node lookup responses stay cached.
    pub lookup_ttl: Duration,
    /// Lookup attempts before reporting `ActorNotFound`.
    pub lookup_retries: u32,
    /// Per-message watchdog; `None` disables it.
    pub watchdog: Option<Duration>,
    /// Watchdog strikes before an actor is quarantined.
    pub quarantine_strikes: u32,
    /// Outbound channel high-water mark, envelopes.
    pub high_water_envelopes: usize,
    /// Outbound channel high-water mark, bytes.
    pub high_water_bytes: usize,
    pub reconnect: ReconnectConfig,
}

impl PoolConfig {
    /// Configuration with defaults for everything but the address.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            n_subpools: 0,
            worker_threads: None,
            max_envelope_bytes: caravel_transport::wire::DEFAULT_MAX_ENVELOPE_BYTES,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_misses: 2,
            graceful_deadline: Duration::from_secs(10),
            restart_policy: RestartPolicy::OnFailure,
            allocation_policy: PlacementPolicy::RoundRobin,
            lookup_ttl: Duration::from_secs(30),
            lookup_retries: 3,
            watchdog: None,
            quarantine_strikes: 3,
            high_water_envelopes: 1024,
            high_water_bytes: 64 * 1024 * 1024,
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Channel-level view of this configuration.
    ///
    /// Pools disable idle teardown: supervisor failure detection rides on
    /// channel liveness, and an idle-closed control channel would read as
    /// a dead sub-pool.
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_misses: self.heartbeat_misses,
            handshake_timeout: Duration::from_secs(5),
            high_water_envelopes: self.high_water_envelopes,
            high_water_bytes: self.high_water_bytes,
            drain_deadline: self.graceful_deadline,
            max_envelope_bytes: self.max_envelope_bytes,
            idle_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_policy_parse() {
        assert_eq!("never".parse::<RestartPolicy>().unwrap(), RestartPolicy::Never);
        assert_eq!(
            "on-failure".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure
        );
        assert!("sometimes".parse::<RestartPolicy>().is_err());
    }

    #[test]
    fn test_default_tuning_values() {
        let config = PoolConfig::new(Address::parse("tcp://127.0.0.1:5000").unwrap());
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.heartbeat_misses, 2);
        assert_eq!(config.lookup_ttl, Duration::from_secs(30));
        assert_eq!(config.high_water_envelopes, 1024);
        assert_eq!(config.max_envelope_bytes, 256 * 1024 * 1024);
    }
}
