//! Authority runtime - owns the network and serves observers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       TeleportServer                         │
//! │  ┌──────────────┐  notifications  ┌───────────────────────┐  │
//! │  │ NodeRegistry │ ──────────────► │  AuthorityReplicator  │──┼──► outbox → transport
//! │  └──────────────┘                 └───────────────────────┘  │
//! │        ▲    ▲                                                │
//! │        │    └── ActivationMachine (one per physical node)    │
//! │        └─────── inbound Rename / Teleport packets            │
//! │                         │                                    │
//! │                    Teleporter ──► WorldAccess                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let mut server = TeleportServer::new(ctx, net, config, world, policy, store);
//! server.start();
//! loop {
//!     server.step().await;
//!     ctx.sleep(Duration::from_millis(config.server.tick_interval_ms)).await;
//! }
//! ```

use tpnet_env::{NetworkTransport, PacketEnvelope, PeerId, TpNetContext};

use crate::config::TpNetConfig;
use crate::tpnet_activation::{ActivationEvent, ActivationMachine};
use crate::tpnet_node::{BlockPos, Node, PlayerUid};
use crate::tpnet_registry::NodeRegistry;
use crate::tpnet_store::{load_network, save_network, LoadSummary, SaveStore, StoreError};
use crate::tpnet_sync::{apply_rename, AccessPolicy, AuthorityReplicator, Packet, ProtocolError};
use crate::tpnet_teleport::{TeleportOutcome, Teleporter, WorldAccess};

use rand::rngs::StdRng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Seed extension for the displacement RNG derived from the context.
const TELEPORT_RNG_STREAM: u64 = 0x7e1e;

/// The authoritative side of a session.
pub struct TeleportServer<Ctx, Net>
where
    Ctx: TpNetContext,
    Net: NetworkTransport,
{
    context: Arc<Ctx>,
    network: Arc<Net>,
    config: TpNetConfig,

    registry: Arc<NodeRegistry>,
    replicator: Arc<AuthorityReplicator>,
    machines: BTreeMap<BlockPos, ActivationMachine>,
    teleporter: Teleporter,

    world: Arc<dyn WorldAccess>,
    policy: Arc<dyn AccessPolicy>,
    store: Arc<dyn SaveStore>,

    /// Connected observers and the player each one speaks for
    players: HashMap<PeerId, PlayerUid>,

    rng: StdRng,
    tick_count: u64,
}

impl<Ctx, Net> TeleportServer<Ctx, Net>
where
    Ctx: TpNetContext,
    Net: NetworkTransport,
{
    pub fn new(
        context: Arc<Ctx>,
        network: Arc<Net>,
        config: TpNetConfig,
        world: Arc<dyn WorldAccess>,
        policy: Arc<dyn AccessPolicy>,
        store: Arc<dyn SaveStore>,
    ) -> Self {
        let registry = NodeRegistry::shared(config.registry.clone());
        let replicator = AuthorityReplicator::attach(&registry);
        let teleporter = Teleporter::new(config.teleport.clone());
        let rng = context.derive_rng(TELEPORT_RNG_STREAM);

        Self {
            context,
            network,
            config,
            registry,
            replicator,
            machines: BTreeMap::new(),
            teleporter,
            world,
            policy,
            store,
            players: HashMap::new(),
            rng,
            tick_count: 0,
        }
    }

    /// Loads the saved network. A corrupt save is logged and startup
    /// continues with whatever was loaded.
    pub fn start(&mut self) -> LoadSummary {
        info!("{} starting", self.config.server.name);
        match load_network(&self.registry, self.store.as_ref(), &self.config.server.save_key) {
            Ok(summary) => summary,
            Err(e) => {
                error!("Failed to load teleport network: {}", e);
                LoadSummary {
                    loaded: self.registry.len(),
                    legacy: false,
                }
            }
        }
    }

    /// Writes the network into the world save.
    pub fn save(&self) -> Result<usize, StoreError> {
        save_network(&self.registry, self.store.as_ref(), &self.config.server.save_key)
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn replicator(&self) -> &Arc<AuthorityReplicator> {
        &self.replicator
    }

    pub fn config(&self) -> &TpNetConfig {
        &self.config
    }

    pub fn local_id(&self) -> PeerId {
        self.network.local_id()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn machine(&self, pos: BlockPos) -> Option<&ActivationMachine> {
        self.machines.get(&pos)
    }

    /// A physical node was placed or loaded. `enabled` comes from the block type.
    pub fn on_node_placed(&mut self, pos: BlockPos, enabled: bool) -> Node {
        let node = self.registry.get_or_create(pos, enabled);
        let config = &self.config.activation;
        self.machines
            .entry(pos)
            .or_insert_with(|| ActivationMachine::new(pos, config.clone()))
            .set_enabled(node.enabled);
        node
    }

    /// Whether a physical node is placed at `pos`.
    pub fn is_placed(&self, pos: BlockPos) -> bool {
        self.machines.contains_key(&pos)
    }

    /// A physical node was broken.
    pub fn on_node_removed(&mut self, pos: BlockPos) -> Option<Node> {
        self.machines.remove(&pos);
        self.registry.remove(pos)
    }

    /// A player touched the node at `pos`. Ignored unless a node is placed there.
    pub fn on_entity_collide(&mut self, pos: BlockPos, player: &PlayerUid) {
        let Some(node) = self.registry.get(pos) else {
            return;
        };
        let now_ms = self.context.now_ms();
        let on_cooldown = self.world.is_cooldown_running(player);

        let Some(machine) = self.machines.get_mut(&pos) else {
            return;
        };
        machine.set_enabled(node.enabled);
        machine.on_entity_collide(player, now_ms, on_cooldown);
    }

    /// Block info lines, neighbours included.
    pub fn describe_node(&self, pos: BlockPos) -> Option<Vec<String>> {
        self.registry.describe(pos, true)
    }

    /// Registers an observer and queues a full resync for it.
    pub fn peer_connected(&mut self, peer: PeerId, player: PlayerUid) -> usize {
        info!("Observer {} connected as {}", peer, player);
        self.players.insert(peer, player);
        self.replicator.connect(peer, &self.registry)
    }

    pub fn peer_disconnected(&mut self, peer: PeerId) {
        if let Some(player) = self.players.remove(&peer) {
            info!("Observer {} ({}) disconnected", peer, player);
        }
        self.replicator.disconnect(peer);
    }

    /// Advances every activation machine by one tick.
    ///
    /// `Entered` is handled here (the node is activated for the player);
    /// all events are returned for the host.
    pub fn tick(&mut self) -> Vec<(BlockPos, ActivationEvent)> {
        self.tick_count += 1;
        let dt = self.config.server.tick_interval_ms as f32 / 1000.0;
        let now_ms = self.context.now_ms();

        let mut events = Vec::new();
        for (pos, machine) in self.machines.iter_mut() {
            for event in machine.tick(dt, now_ms) {
                events.push((*pos, event));
            }
        }

        for (pos, event) in &events {
            match event {
                ActivationEvent::Entered(player) => {
                    self.registry.activate_for(*pos, player);
                }
                ActivationEvent::RevealChoice(player) => {
                    debug!("{} may choose a destination at {}", player, pos);
                }
                ActivationEvent::Abandoned(player) => {
                    debug!("{} left {}", player, pos);
                }
            }
        }
        events
    }

    /// Drains inbound packets, ticks, then flushes the outbox.
    pub async fn step(&mut self) -> Vec<(BlockPos, ActivationEvent)> {
        self.poll_inbox();
        let events = self.tick();
        self.flush().await;
        events
    }

    /// Runs `ticks` steps at the configured tick interval.
    pub async fn run(&mut self, ticks: u64) {
        let interval = Duration::from_millis(self.config.server.tick_interval_ms);
        for _ in 0..ticks {
            self.step().await;
            self.context.sleep(interval).await;
        }
    }

    /// Processes every packet already delivered. Returns how many were read.
    pub fn poll_inbox(&mut self) -> usize {
        let mut count = 0;
        while let Some((sender, envelope)) = self.network.try_recv() {
            count += 1;
            if let Err(e) = self.process_packet(sender, &envelope) {
                warn!("Dropping packet from {}: {}", sender, e);
            }
        }
        count
    }

    /// Handles one packet from an observer.
    pub fn process_packet(&mut self, sender: PeerId, envelope: &PacketEnvelope) -> Result<(), ProtocolError> {
        let packet = Packet::decode(envelope)?;

        let Some(player) = self.players.get(&sender).cloned() else {
            debug!("Ignoring packet from unknown peer {}", sender);
            return Ok(());
        };

        match packet {
            Packet::Rename { pos, name } => {
                let Some(block_enabled) = self.machines.get(&pos).map(ActivationMachine::is_enabled) else {
                    debug!("Rename of {} by {} ignored: no node placed there", pos, player);
                    return Ok(());
                };
                apply_rename(
                    &self.registry,
                    self.policy.as_ref(),
                    &player,
                    pos,
                    &name,
                    block_enabled,
                );
            }
            Packet::Teleport(request) => {
                let outcome = self.teleporter.execute(
                    &self.registry,
                    self.world.as_ref(),
                    &player,
                    &request,
                    &mut self.rng,
                );
                if let TeleportOutcome::Relocated(relocations) = outcome {
                    for moved in relocations.iter().filter_map(|r| r.player.as_ref()) {
                        for machine in self.machines.values_mut() {
                            machine.complete(moved);
                        }
                    }
                }
            }
            Packet::Sync(message) => {
                warn!("Observer {} sent a sync message for {}; ignored", sender, message.node.pos);
            }
        }
        Ok(())
    }

    /// Sends every queued sync message. Returns how many were sent.
    pub async fn flush(&self) -> usize {
        let now_ms = self.context.now_ms();
        let mut sent = 0;
        for (peer, packet) in self.replicator.take_outbox() {
            let envelope = match packet.encode(now_ms) {
                Ok(envelope) => envelope,
                Err(e) => {
                    error!("Failed to encode packet for {}: {}", peer, e);
                    continue;
                }
            };
            match self.network.send(peer, envelope).await {
                Ok(()) => sent += 1,
                Err(e) => warn!("Send to {} failed: {}", peer, e),
            }
        }
        sent
    }
}
