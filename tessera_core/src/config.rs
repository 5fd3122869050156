//! Replication tunables.

use serde::{Deserialize, Serialize};
use tessera_env::Tick;

/// Every timing and threshold constant the arbitration core uses.
///
/// All counters are in ticks. Loadable from JSON; missing fields keep their
/// defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// AOI hysteresis applied to peers (default: 1.02)
    pub aoi_buffer_multiplier: f64,

    /// Idle ticks before an unowned replica is tombstoned (default: 60).
    /// Owned objects are force-refreshed at half this value.
    pub expiring_object_threshold: Tick,

    /// Upper bound of the claim jitter and the in-transit deadline (default: 5)
    pub countdown_takeover: u32,

    /// Ticks an avatar survives after its peer disconnects (default: 10)
    pub countdown_remove_avatar: u32,

    /// Ticks during which a promotion blocks another one nearby (default: 20)
    pub countdown_promote: Tick,

    /// Idle ticks after which load counters reset (default: 21)
    pub load_counting_threshold: Tick,

    /// Capacity a joining peer needs to become a promotion candidate (default: 80)
    pub arbitrator_capacity_threshold: u32,

    /// Load level regarded as overload (default: 70)
    pub overload_threshold: u32,

    /// Load level regarded as underload (default: 30)
    pub underload_threshold: u32,

    /// Longest a neighbor may go without an event or tick marker (default: 1)
    pub event_tick_threshold: Tick,

    /// Period of unsolicited self-advertisement to neighbors (default: 20)
    pub full_update_period: Tick,

    /// Forwarding budget of a routed event (default: 3)
    pub event_ttl: u8,

    /// Arbitrator AOI with no peers attached (default: 5.0)
    pub min_arbitrator_aoi: f64,

    /// Slack applied when growing the arbitrator AOI over its peers (default: 1.05)
    pub aoi_growth: f64,

    /// Promotions closer than this to a recent one are suppressed (default: 400.0)
    pub promotion_exclusion_radius: f64,

    /// Consecutive failed sends before a peer abandons its arbitrator (default: 3)
    pub max_send_failures: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            aoi_buffer_multiplier: 1.02,
            expiring_object_threshold: 60,
            countdown_takeover: 5,
            countdown_remove_avatar: 10,
            countdown_promote: 20,
            load_counting_threshold: 21,
            arbitrator_capacity_threshold: 80,
            overload_threshold: 70,
            underload_threshold: 30,
            event_tick_threshold: 1,
            full_update_period: 20,
            event_ttl: 3,
            min_arbitrator_aoi: 5.0,
            aoi_growth: 1.05,
            promotion_exclusion_radius: 400.0,
            max_send_failures: 3,
        }
    }
}

impl ReplicationConfig {
    /// Parses a JSON document of overrides.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Idle ticks after which an owned object is resent in full.
    pub fn refresh_threshold(&self) -> Tick {
        self.expiring_object_threshold / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReplicationConfig::default();
        assert_eq!(config.expiring_object_threshold, 60);
        assert_eq!(config.refresh_threshold(), 30);
        assert_eq!(config.countdown_takeover, 5);
        assert_eq!(config.max_send_failures, 3);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ReplicationConfig::from_json(r#"{ "countdown_takeover": 9, "aoi_buffer_multiplier": 1.1 }"#)
            .expect("valid json");

        assert_eq!(config.countdown_takeover, 9);
        assert_eq!(config.aoi_buffer_multiplier, 1.1);
        assert_eq!(config.full_update_period, 20);
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(ReplicationConfig::from_json("{ countdown_takeover: }").is_err());
    }
}
