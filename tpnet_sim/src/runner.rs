//! Scenario runner - executes simulation scenarios against a full session.

use crate::scenarios::ScenarioId;
use crate::world::SimSession;

use nalgebra::Vector3;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use tpnet_core::{BlockPos, EntityId, MemorySaveStore, SaveStore, TpNetConfig, WorldAccess};
use tpnet_env::{NetworkController, TpNetContext};
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Nodes in the authoritative registry at the end
    pub final_node_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScenarioMetrics {
    /// Packets handed to the router
    pub packets_sent: u64,

    /// Packets dropped by loss or partition
    pub packets_dropped: u64,

    /// Sync messages applied across all observers
    pub sync_messages_applied: u64,

    /// Entities relocated by the authority
    pub relocations: u64,

    /// Full resyncs performed
    pub resyncs: u64,
}

/// Runs simulation scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of observer processes
    num_observers: usize,

    /// Maximum duration in seconds
    max_duration_secs: f64,

    /// Network configuration used by every process
    config: TpNetConfig,
}

impl ScenarioRunner {
    pub fn new(seed: u64, num_observers: usize) -> Self {
        Self {
            seed,
            num_observers,
            max_duration_secs: 10.0,
            config: TpNetConfig::default(),
        }
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    pub fn with_config(mut self, config: TpNetConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs a scenario on a fresh single-threaded runtime.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                return ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    total_ticks: 0,
                    final_time_secs: 0.0,
                    final_node_count: 0,
                    failure_reason: Some(format!("Failed to build runtime: {}", e)),
                    metrics: ScenarioMetrics::default(),
                }
            }
        };

        runtime.block_on(async {
            match scenario {
                ScenarioId::FirstContact => self.run_first_contact().await,
                ScenarioId::LossyResync => self.run_lossy_resync().await,
                ScenarioId::PartitionHeal => self.run_partition_heal().await,
                ScenarioId::LegacyMigration => self.run_legacy_migration().await,
                ScenarioId::UnstableJump => self.run_unstable_jump().await,
                ScenarioId::ClaimEnforcement => self.run_claim_enforcement().await,
            }
        })
    }

    fn session(&self, num_observers: usize, store: Arc<dyn SaveStore>) -> SimSession {
        SimSession::new(self.seed, num_observers, self.config.clone(), store)
    }

    fn fresh_session(&self, num_observers: usize) -> SimSession {
        self.session(num_observers, Arc::new(MemorySaveStore::new()))
    }

    fn duration_ticks(&self) -> u64 {
        let tick_ms = self.config.server.tick_interval_ms.max(1) as f64;
        (self.max_duration_secs * 1000.0 / tick_ms) as u64
    }

    /// Ticks of contact needed before the destination choice opens.
    fn reveal_ticks(&self) -> u64 {
        let tick_ms = self.config.server.tick_interval_ms.max(1) as f64;
        (self.config.activation.reveal_after_secs as f64 * 1000.0 / tick_ms).ceil() as u64 + 5
    }

    fn finish(
        &self,
        scenario: ScenarioId,
        session: &SimSession,
        failures: Vec<String>,
        resyncs: u64,
    ) -> ScenarioResult {
        let stats = session.world.stats();
        let passed = failures.is_empty();
        if passed {
            info!("✓ {} complete after {} ticks", scenario.name(), session.ticks());
        } else {
            warn!("✗ {}: {}", scenario.name(), failures.join("; "));
        }

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            total_ticks: session.ticks(),
            final_time_secs: session.world.time(),
            final_node_count: session.server.registry().len(),
            failure_reason: if passed { None } else { Some(failures.join("; ")) },
            metrics: ScenarioMetrics {
                packets_sent: stats.routed,
                packets_dropped: stats.dropped,
                sync_messages_applied: session.sync_messages_applied(),
                relocations: session.host.relocations(),
                resyncs,
            },
        }
    }

    /// SIM-001: FirstContact - full push on join and node discovery.
    async fn run_first_contact(&self) -> ScenarioResult {
        let mut s = self.fresh_session(self.num_observers.max(1));
        let mut failures = Vec::new();

        let pads: Vec<BlockPos> = (0..8).map(|i| BlockPos::new(i * 20, 64, 0)).collect();
        for pad in &pads {
            s.server.on_node_placed(*pad, true);
        }
        s.connect_all();
        s.step().await;
        check(&mut failures, s.all_converged(), "observers did not receive the full push");

        let player = s.observers[0].player.clone();
        s.host.spawn_player(&player, EntityId(1000), contact_center(pads[0]));

        let ticks = self.duration_ticks().max(self.reveal_ticks());
        for _ in 0..ticks {
            s.hold(0, pads[0]);
            s.step().await;
        }

        check(&mut failures, s.all_converged(), "mirrors diverged after discovery");
        for observer in &s.observers {
            let discovered = observer
                .client
                .mirror()
                .get(pads[0])
                .map_or(false, |node| node.is_activated_by(&player));
            check(&mut failures, discovered, format!("{} did not see the discovery", observer.player));
        }

        let opened = s.observers[0].dialogs.opened();
        check(&mut failures, opened.len() == 1, format!("expected one dialog, got {}", opened.len()));
        for observer in s.observers.iter().skip(1) {
            check(&mut failures, observer.dialogs.opened().is_empty(), "bystander saw a dialog");
        }

        self.finish(ScenarioId::FirstContact, &s, failures, 0)
    }

    /// SIM-002: LossyResync - churn under 30% loss, then resync.
    async fn run_lossy_resync(&self) -> ScenarioResult {
        let mut s = self.fresh_session(self.num_observers.max(1));
        let mut failures = Vec::new();
        let mut rng = s.world.context.derive_rng(0x1055);

        for i in 0..6 {
            s.server.on_node_placed(BlockPos::new(i * 16, 64, 0), true);
        }
        s.connect_all();
        s.step().await;

        let authority = s.authority_id();
        for index in 0..s.observers.len() {
            s.world.controller.set_link_loss(authority, s.observer_id(index), 0.3);
        }

        for tick in 0..self.duration_ticks().max(20) {
            match tick % 6 {
                0 => {
                    let pos = BlockPos::new(rng.gen_range(-200..200), 64, rng.gen_range(-200..200));
                    s.server.on_node_placed(pos, true);
                }
                3 => {
                    let nodes = s.server.registry().list_all();
                    if nodes.len() > 3 {
                        let victim = nodes[rng.gen_range(0..nodes.len())].pos;
                        s.server.on_node_removed(victim);
                    }
                }
                _ => {
                    let nodes = s.server.registry().list_all();
                    if let Some(node) = nodes.get(rng.gen_range(0..nodes.len().max(1))) {
                        let renamed = node.clone().with_name(format!("gate-{}", tick));
                        s.server.registry().set(renamed);
                    }
                }
            }
            s.step().await;
        }

        let stale = (0..s.observers.len()).filter(|i| !s.converged(*i)).count();
        debug!("{} of {} observers stale before resync", stale, s.observers.len());

        for index in 0..s.observers.len() {
            s.world.controller.set_link_loss(authority, s.observer_id(index), 0.0);
        }
        let mut resyncs = 0;
        for index in 0..s.observers.len() {
            s.resync(index);
            resyncs += 1;
        }
        s.step().await;

        check(&mut failures, s.all_converged(), "mirrors diverged after full resync");
        self.finish(ScenarioId::LossyResync, &s, failures, resyncs)
    }

    /// SIM-003: PartitionHeal - one observer misses changes, then catches up.
    async fn run_partition_heal(&self) -> ScenarioResult {
        let mut s = self.fresh_session(self.num_observers.max(2));
        let mut failures = Vec::new();

        let pads: Vec<BlockPos> = (0..5).map(|i| BlockPos::new(i * 25, 70, 10)).collect();
        for pad in &pads {
            s.server.on_node_placed(*pad, true);
        }
        s.connect_all();
        s.step().await;

        let authority = s.authority_id();
        let isolated = s.observer_id(1);
        s.world.controller.partition(&[authority], &[isolated]);

        for (i, pad) in pads.iter().enumerate() {
            if let Some(node) = s.server.registry().get(*pad) {
                s.server.registry().set(node.with_name(format!("pad-{}", i)));
            }
            s.step().await;
        }
        s.server.on_node_removed(pads[2]);
        s.server.on_node_placed(BlockPos::new(60, 70, 40), true);
        s.run_ticks(self.duration_ticks().max(5)).await;

        check(&mut failures, s.converged(0), "connected observer diverged during partition");
        check(&mut failures, !s.converged(1), "partitioned observer received updates");

        s.world.controller.heal_all();
        s.resync(1);
        s.step().await;

        check(&mut failures, s.all_converged(), "mirrors diverged after heal");
        self.finish(ScenarioId::PartitionHeal, &s, failures, 1)
    }

    /// SIM-004: LegacyMigration - old save format survives a restart.
    async fn run_legacy_migration(&self) -> ScenarioResult {
        let store = Arc::new(MemorySaveStore::new());
        let mut failures = Vec::new();

        let mut legacy = serde_json::Map::new();
        for i in 0..5 {
            legacy.insert(
                format!("{},64,{}", i * 10, -i * 10),
                serde_json::json!({
                    "name": format!("Old Gate {}", i),
                    "available": i != 4,
                    "activatedBy": ["player-0"],
                }),
            );
        }
        let blob = serde_json::Value::Object(legacy).to_string();
        if let Err(e) = store.store_data(&self.config.server.save_key, blob.as_bytes()) {
            failures.push(format!("seeding save failed: {}", e));
        }

        let mut s = self.session(self.num_observers.max(1), store.clone());
        let summary = s.server.start();
        check(&mut failures, summary.legacy, "save was not recognised as legacy");
        check(&mut failures, summary.loaded == 5, format!("loaded {} legacy nodes", summary.loaded));

        s.connect_all();
        s.step().await;
        check(&mut failures, s.all_converged(), "mirrors diverged after legacy load");

        let visible = s.observers[0].client.destinations_from(BlockPos::new(0, 64, 0)).len();
        check(&mut failures, visible == 3, format!("expected 3 destinations, got {}", visible));

        match s.server.save() {
            Ok(saved) => check(&mut failures, saved == 5, format!("saved {} nodes", saved)),
            Err(e) => failures.push(format!("save failed: {}", e)),
        }

        let mut restarted = self.session(0, store);
        let summary = restarted.server.start();
        check(&mut failures, !summary.legacy, "resave kept the legacy format");
        check(
            &mut failures,
            restarted.server.registry().list_all() == s.server.registry().list_all(),
            "restart lost data",
        );

        self.finish(ScenarioId::LegacyMigration, &s, failures, 0)
    }

    /// SIM-005: UnstableJump - depleted stability displaces the landing.
    async fn run_unstable_jump(&self) -> ScenarioResult {
        let mut config = self.config.clone();
        config.teleport.stability_cost = 0.3;
        let mut s = SimSession::new(self.seed, self.num_observers.max(1), config, Arc::new(MemorySaveStore::new()));
        let mut failures = Vec::new();

        let home = BlockPos::new(0, 64, 0);
        let far = BlockPos::new(2000, 80, 2000);
        s.server.on_node_placed(home, true);
        s.server.on_node_placed(far, true);
        let player = s.observers[0].player.clone();
        if let Some(node) = s.server.registry().get(far) {
            s.server.registry().set(node.with_name("Far Gate"));
        }
        s.server.registry().activate_for(far, &player);
        s.connect_all();
        s.step().await;

        let entity = EntityId(1000);
        s.host.spawn_player(&player, entity, contact_center(home));
        s.host.set_stability(entity, 0.2);

        let limit = self.reveal_ticks() + 20;
        let mut held = 0;
        while s.observers[0].dialogs.opened().is_empty() && held < limit {
            s.hold(0, home);
            s.step().await;
            held += 1;
        }
        check(&mut failures, !s.observers[0].dialogs.opened().is_empty(), "destination choice never opened");

        if let Err(e) = s.observers[0].client.choose_destination(Some(home), far).await {
            failures.push(format!("teleport request failed: {}", e));
        }
        s.step().await;

        let intended = far.to_vec3() + Vector3::new(0.5, 2.0, 0.5);
        match s.host.position_of(entity) {
            Some(landed) => {
                let offset = landed - intended;
                let horizontal = (offset.x * offset.x + offset.z * offset.z).sqrt();
                let range = s.config().teleport.unstable_range;
                check(
                    &mut failures,
                    (horizontal - range).abs() < 1e-6 && offset.y.abs() < 1e-9,
                    format!("landed {:.2} blocks from the target, expected {}", horizontal, range),
                );
            }
            None => failures.push("player entity vanished".to_string()),
        }
        check(&mut failures, s.host.stability_of(entity) == 0.0, "stability was not clamped to zero");
        check(&mut failures, s.host.relocations() == 1, "expected exactly one relocation");

        self.finish(ScenarioId::UnstableJump, &s, failures, 0)
    }

    /// SIM-006: ClaimEnforcement - only the claim owner may rename.
    async fn run_claim_enforcement(&self) -> ScenarioResult {
        let mut s = self.fresh_session(self.num_observers.max(2));
        let mut failures = Vec::new();

        let pad = BlockPos::new(5, 64, 5);
        s.server.on_node_placed(pad, true);
        s.connect_all();
        s.step().await;

        let owner = s.observers[1].player.clone();
        s.host.claim(pad, &owner);

        let queued = s.server.replicator().messages_queued();
        if let Err(e) = s.observers[0].client.request_rename(pad, "Intruder").await {
            failures.push(format!("rename request failed: {}", e));
        }
        s.run_ticks(2).await;

        let name = s.server.registry().get(pad).map(|node| node.name).unwrap_or_default();
        check(&mut failures, name.is_empty(), format!("non-owner renamed the pad to {:?}", name));
        check(&mut failures, s.server.replicator().messages_queued() == queued, "denied rename was broadcast");

        if let Err(e) = s.observers[1].client.request_rename(pad, "Owner's Gate").await {
            failures.push(format!("rename request failed: {}", e));
        }
        s.run_ticks(2).await;

        for observer in &s.observers {
            let seen = observer.client.mirror().get(pad).map(|node| node.name).unwrap_or_default();
            check(&mut failures, seen == "Owner's Gate", format!("{} sees {:?}", observer.player, seen));
        }
        check(&mut failures, s.all_converged(), "mirrors diverged");

        self.finish(ScenarioId::ClaimEnforcement, &s, failures, 0)
    }
}

/// Point entities stand on when touching the pad at `pos`.
fn contact_center(pos: BlockPos) -> Vector3<f64> {
    pos.to_vec3() + Vector3::new(0.5, 1.0, 0.5)
}

fn check(failures: &mut Vec<String>, ok: bool, message: impl Into<String>) {
    if !ok {
        failures.push(message.into());
    }
}
