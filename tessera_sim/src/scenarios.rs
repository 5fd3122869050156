//! Named fault scenarios for the deterministic simulator.

use crate::error::SimError;
use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// Peers wander, nothing fails
    SteadyState,

    /// Fast walkers cross region boundaries over and over
    HandoverWalk,

    /// A non-gateway arbitrator dies silently mid-run
    OwnerCrash,

    /// Unreliable traffic is lost at random
    LossyLinks,

    /// The world is cut in half for a while, then healed
    PartitionHeal,

    /// Every peer fires an event each tick; ordering is checked
    EventStorm,

    /// Load reports overload an arbitrator until the gateway promotes a peer
    Promotion,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SteadyState,
            ScenarioId::HandoverWalk,
            ScenarioId::OwnerCrash,
            ScenarioId::LossyLinks,
            ScenarioId::PartitionHeal,
            ScenarioId::EventStorm,
            ScenarioId::Promotion,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SteadyState => "steady_state",
            ScenarioId::HandoverWalk => "handover_walk",
            ScenarioId::OwnerCrash => "owner_crash",
            ScenarioId::LossyLinks => "lossy_links",
            ScenarioId::PartitionHeal => "partition_heal",
            ScenarioId::EventStorm => "event_storm",
            ScenarioId::Promotion => "promotion",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SteadyState => "Peers walk with no faults; one owner per object, replicas agree",
            ScenarioId::HandoverWalk => "Fast walkers force repeated ownership handovers between regions",
            ScenarioId::OwnerCrash => "An arbitrator crashes silently; neighbors must claim its orphans",
            ScenarioId::LossyLinks => "20% loss on unreliable traffic, then recovery through refresh",
            ScenarioId::PartitionHeal => "West and east halves split for 60 ticks, then heal and converge",
            ScenarioId::EventStorm => "Every peer pings every tick; batches must stay (timestamp, sender) sorted",
            ScenarioId::Promotion => "Overload reports make the gateway promote a capable peer",
        }
    }

    /// Returns true if the scenario injects faults into the network.
    pub fn injects_faults(&self) -> bool {
        matches!(
            self,
            ScenarioId::OwnerCrash | ScenarioId::LossyLinks | ScenarioId::PartitionHeal
        )
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "steady_state" | "steady" => Ok(ScenarioId::SteadyState),
            "handover_walk" | "handover" => Ok(ScenarioId::HandoverWalk),
            "owner_crash" | "crash" => Ok(ScenarioId::OwnerCrash),
            "lossy_links" | "lossy" => Ok(ScenarioId::LossyLinks),
            "partition_heal" | "partition" => Ok(ScenarioId::PartitionHeal),
            "event_storm" | "storm" => Ok(ScenarioId::EventStorm),
            "promotion" | "promote" => Ok(ScenarioId::Promotion),
            _ => Err(SimError::UnknownScenario(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>().ok(), Some(scenario));
            assert_eq!(scenario.to_string(), scenario.name());
        }
    }

    #[test]
    fn test_aliases_and_unknown() {
        assert_eq!("Owner-Crash".parse::<ScenarioId>().ok(), Some(ScenarioId::OwnerCrash));
        assert_eq!("storm".parse::<ScenarioId>().ok(), Some(ScenarioId::EventStorm));
        let err = "time_warp".parse::<ScenarioId>().unwrap_err();
        assert_eq!(err.to_string(), "Unknown scenario: time_warp");
        assert!(ScenarioId::PartitionHeal.injects_faults());
        assert!(!ScenarioId::EventStorm.injects_faults());
    }
}
