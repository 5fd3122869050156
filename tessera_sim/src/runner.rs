//! Scenario runner - drives a world through a scenario and judges the result.

use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld};
use serde::Serialize;
use tessera_env::NodeId;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected at the end of the run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected after the quiet period.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioMetrics {
    /// Objects with more than one live owner
    pub ownership_violations: usize,

    /// Live peers whose avatar nobody owns
    pub orphaned_avatars: usize,

    /// Neighbor replicas behind their owner
    pub replica_divergence: usize,

    /// Avatars inside a peer's AOI the peer does not hold
    pub visibility_misses: usize,

    /// Out-of-order pairs within an arbitrator's event batch
    pub event_order_violations: usize,

    /// Events applied twice by one arbitrator
    pub duplicate_events: usize,

    /// Sent events no arbitrator applied
    pub unapplied_events: usize,

    /// Shared events two arbitrators applied in opposite order
    pub order_disagreements: usize,

    pub handovers: u64,
    pub rejoins: u64,
    pub promotions: usize,
    pub live_arbitrators: usize,
    pub events_sent: usize,
    pub events_applied: usize,

    /// Total messages sent
    pub messages_sent: u64,

    /// Messages lost after sending
    pub messages_dropped: u64,

    /// Sends refused by a crashed or partitioned target
    pub messages_refused: u64,
    pub bytes_sent: u64,
}

impl ScenarioMetrics {
    fn collect(world: &SimWorld, event_cutoff: u64) -> Self {
        let stats = world.stats();
        Self {
            ownership_violations: world.ownership_violations(),
            orphaned_avatars: world.orphaned_avatars(),
            replica_divergence: world.replica_divergence(),
            visibility_misses: world.visibility_misses(),
            event_order_violations: world.event_order_violations(),
            duplicate_events: world.duplicate_events(),
            unapplied_events: world.unapplied_events(event_cutoff),
            order_disagreements: world.order_disagreements(),
            handovers: stats.handovers,
            rejoins: stats.rejoins,
            promotions: stats.promotions,
            live_arbitrators: stats.live_arbitrators,
            events_sent: stats.events_sent,
            events_applied: stats.events_applied,
            messages_sent: stats.network.sent,
            messages_dropped: stats.network.dropped,
            messages_refused: stats.network.refused,
            bytes_sent: stats.network.bytes,
        }
    }
}

/// What a scenario insists on after its quiet period.
#[derive(Debug, Clone, Copy, Default)]
struct Expectations {
    single_owner: bool,
    no_orphans: bool,
    replicas_agree: bool,
    peers_see_neighbors: bool,
    ordered_events: bool,
    every_event_applied: bool,
    handovers: bool,
    promotions: bool,
}

impl Expectations {
    /// The invariants every scenario keeps.
    fn consistent() -> Self {
        Self {
            single_owner: true,
            no_orphans: true,
            ordered_events: true,
            ..Self::default()
        }
    }

    fn failures(&self, m: &ScenarioMetrics) -> Vec<String> {
        let mut failures = Vec::new();
        let mut expect = |wanted: bool, ok: bool, what: String| {
            if wanted && !ok {
                failures.push(what);
            }
        };
        expect(
            self.single_owner,
            m.ownership_violations == 0,
            format!("{} objects have several owners", m.ownership_violations),
        );
        expect(
            self.no_orphans,
            m.orphaned_avatars == 0,
            format!("{} avatars have no owner", m.orphaned_avatars),
        );
        expect(
            self.replicas_agree,
            m.replica_divergence == 0,
            format!("{} replicas lag their owner", m.replica_divergence),
        );
        expect(
            self.peers_see_neighbors,
            m.visibility_misses == 0,
            format!("{} visible avatars missing at peers", m.visibility_misses),
        );
        expect(
            self.ordered_events,
            m.event_order_violations == 0 && m.duplicate_events == 0 && m.order_disagreements == 0,
            format!(
                "{} batch order violations, {} duplicate events, {} order disagreements",
                m.event_order_violations, m.duplicate_events, m.order_disagreements
            ),
        );
        expect(
            self.every_event_applied,
            m.unapplied_events == 0,
            format!("{} events never applied", m.unapplied_events),
        );
        expect(self.handovers, m.handovers > 0, "no handover happened".to_string());
        expect(self.promotions, m.promotions > 0, "no peer was promoted".to_string());
        failures
    }
}

/// Runs simulation scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// World settings every scenario starts from
    base: SimConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            base: SimConfig {
                seed,
                ..SimConfig::default()
            },
        }
    }

    /// Replaces the base world settings; the runner's seed still applies.
    pub fn with_config(mut self, config: SimConfig) -> Self {
        self.base = SimConfig {
            seed: self.seed,
            ..config
        };
        self
    }

    /// Sets the number of active ticks.
    pub fn with_ticks(mut self, ticks: u64) -> Self {
        self.base.ticks = ticks;
        self
    }

    pub fn with_arbitrators(mut self, arbitrators: usize) -> Self {
        self.base.arbitrators = arbitrators;
        self
    }

    pub fn with_peers(mut self, peers: usize) -> Self {
        self.base.peers = peers;
        self
    }

    pub fn config(&self) -> &SimConfig {
        &self.base
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        if scenario.injects_faults() {
            debug!("{}: {}", scenario, scenario.description());
        }

        let (world, expectations) = match scenario {
            ScenarioId::SteadyState => self.run_steady_state(),
            ScenarioId::HandoverWalk => self.run_handover_walk(),
            ScenarioId::OwnerCrash => self.run_owner_crash(),
            ScenarioId::LossyLinks => self.run_lossy_links(),
            ScenarioId::PartitionHeal => self.run_partition_heal(),
            ScenarioId::EventStorm => self.run_event_storm(),
            ScenarioId::Promotion => self.run_promotion(),
        };

        let metrics = ScenarioMetrics::collect(&world, world.config().ticks);
        let failures = expectations.failures(&metrics);
        let passed = failures.is_empty();
        if passed {
            info!("✅ {} passed after {} ticks", scenario, world.now());
        } else {
            warn!("❌ {} failed: {}", scenario, failures.join("; "));
        }

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            total_ticks: world.now(),
            failure_reason: (!passed).then(|| failures.join("; ")),
            metrics,
        }
    }

    /// Stops all activity and lets the world settle.
    fn settle(world: &mut SimWorld, ticks: u64) {
        world.set_moving(false);
        world.set_load_per_peer(0);
        world.run(ticks);
    }

    /// Peers walk with no faults.
    fn run_steady_state(&self) -> (SimWorld, Expectations) {
        let mut world = SimWorld::new(self.base.clone());
        world.run(self.base.ticks);
        Self::settle(&mut world, self.base.settle_ticks);

        let expectations = Expectations {
            replicas_agree: true,
            peers_see_neighbors: true,
            every_event_applied: true,
            ..Expectations::consistent()
        };
        (world, expectations)
    }

    /// Fast walkers with no pings, so every tick moves someone.
    fn run_handover_walk(&self) -> (SimWorld, Expectations) {
        let config = SimConfig {
            step: self.base.step.max(8.0),
            ping_rate: 0.0,
            ..self.base.clone()
        };
        let mut world = SimWorld::new(config);
        world.run(self.base.ticks);
        Self::settle(&mut world, self.base.settle_ticks);

        let expectations = Expectations {
            replicas_agree: true,
            peers_see_neighbors: true,
            handovers: true,
            ..Expectations::consistent()
        };
        (world, expectations)
    }

    /// Crashes the last grid arbitrator a third of the way in.
    fn run_owner_crash(&self) -> (SimWorld, Expectations) {
        let config = SimConfig {
            arbitrators: self.base.arbitrators.max(2),
            ..self.base.clone()
        };
        let victim = NodeId(config.arbitrators as u64);
        let mut world = SimWorld::new(config);

        let before = self.base.ticks / 3;
        world.run(before);
        let owned = world.arbitrator(victim).map_or(0, |a| a.owned_ids().len());
        info!("crashing {} while it owns {} objects", victim, owned);
        world.crash(victim);
        world.run(self.base.ticks - before);
        Self::settle(&mut world, self.base.settle_ticks);

        let expectations = Expectations {
            replicas_agree: true,
            ..Expectations::consistent()
        };
        (world, expectations)
    }

    /// Drops unreliable traffic, then gives periodic refresh time to repair.
    fn run_lossy_links(&self) -> (SimWorld, Expectations) {
        let loss = if self.base.loss > 0.0 { self.base.loss } else { 0.2 };
        let config = SimConfig {
            loss,
            ..self.base.clone()
        };
        let refresh = config.replication.refresh_threshold();
        let mut world = SimWorld::new(config);
        world.run(self.base.ticks);

        world.set_loss(0.0);
        Self::settle(&mut world, self.base.settle_ticks.max(refresh + 10));

        let expectations = Expectations {
            replicas_agree: true,
            ..Expectations::consistent()
        };
        (world, expectations)
    }

    /// Splits the world down the middle for 60 ticks.
    fn run_partition_heal(&self) -> (SimWorld, Expectations) {
        const SPLIT_TICKS: u64 = 60;
        let mut world = SimWorld::new(self.base.clone());

        let before = self.base.ticks / 3;
        world.run(before);
        world.partition_halves();
        world.run(SPLIT_TICKS);
        world.heal();
        world.run(self.base.ticks.saturating_sub(before));

        let expiry = self.base.replication.expiring_object_threshold;
        Self::settle(&mut world, self.base.settle_ticks.max(expiry));

        (world, Expectations::consistent())
    }

    /// Half the actions are pings; every event must be applied, in order.
    fn run_event_storm(&self) -> (SimWorld, Expectations) {
        let config = SimConfig {
            ping_rate: 0.5,
            ..self.base.clone()
        };
        let mut world = SimWorld::new(config);
        world.run(self.base.ticks);
        Self::settle(&mut world, self.base.settle_ticks);

        let expectations = Expectations {
            every_event_applied: true,
            ..Expectations::consistent()
        };
        (world, expectations)
    }

    /// Two arbitrators, many capable peers and heavy load reports.
    fn run_promotion(&self) -> (SimWorld, Expectations) {
        let config = SimConfig {
            arbitrators: 2,
            peers: self.base.peers.max(16),
            peer_capacity: 90,
            load_per_peer: 10,
            ..self.base.clone()
        };
        let mut world = SimWorld::new(config);
        world.run(self.base.ticks);
        Self::settle(&mut world, self.base.settle_ticks);

        for (host, arbitrator) in world.promotions() {
            debug!("{} hosted {}", host, arbitrator);
        }
        let expectations = Expectations {
            promotions: true,
            ..Expectations::consistent()
        };
        (world, expectations)
    }
}
