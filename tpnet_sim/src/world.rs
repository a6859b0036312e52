//! SimWorld - packet router plus the session harness built on it.

use crate::context::SimContext;
use crate::host::{DialogLog, SimHost};
use crate::network::{NetworkMessage, SimNetwork, SimNetworkController};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tpnet_core::{BlockPos, PlayerUid, SaveStore, TeleportClient, TeleportServer, TpNetConfig};
use tpnet_env::{NetworkTransport, PacketEnvelope, PeerId, TpNetContext};
use tracing::{debug, warn};

/// Router counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub routed: u64,
    pub delivered: u64,
    pub dropped: u64,
}

/// Owns the virtual clock and routes every packet between endpoints.
pub struct SimWorld {
    pub context: Arc<SimContext>,

    /// Network controller for fault injection
    pub controller: Arc<SimNetworkController>,

    inboxes: HashMap<PeerId, mpsc::Sender<(PeerId, PacketEnvelope)>>,
    directory: Arc<Mutex<Vec<PeerId>>>,

    router_tx: mpsc::Sender<NetworkMessage>,
    router_rx: mpsc::Receiver<NetworkMessage>,

    /// Seeded RNG for loss decisions
    rng: ChaCha8Rng,
    stats: RouterStats,
}

impl SimWorld {
    pub fn new(seed: u64) -> Self {
        let (router_tx, router_rx) = mpsc::channel::<NetworkMessage>(10000);
        Self {
            context: SimContext::shared(seed),
            controller: Arc::new(SimNetworkController::new()),
            inboxes: HashMap::new(),
            directory: Arc::new(Mutex::new(Vec::new())),
            router_tx,
            router_rx,
            rng: ChaCha8Rng::seed_from_u64(seed.wrapping_mul(0x9e3779b97f4a7c15)),
            stats: RouterStats::default(),
        }
    }

    /// Attaches a new endpoint with a deterministic id.
    pub fn endpoint(&mut self, seed: u64) -> Arc<SimNetwork> {
        let id = PeerId::from_seed(seed);
        let (inbox_tx, inbox_rx) = mpsc::channel(10000);
        self.inboxes.insert(id, inbox_tx);
        self.directory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
        Arc::new(SimNetwork::new(
            id,
            self.router_tx.clone(),
            inbox_rx,
            Arc::clone(&self.directory),
        ))
    }

    /// Delivers every pending packet, applying partitions and loss.
    pub fn route(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(msg) = self.router_rx.try_recv() {
            self.stats.routed += 1;

            if !self.controller.can_communicate(msg.from, msg.to) {
                self.stats.dropped += 1;
                continue;
            }

            let loss = self.controller.get_loss(msg.from, msg.to);
            if loss > 0.0 && self.rng.gen_bool(loss) {
                self.stats.dropped += 1;
                continue;
            }

            match self.inboxes.get(&msg.to) {
                Some(inbox) => match inbox.try_send((msg.from, msg.packet)) {
                    Ok(()) => {
                        self.stats.delivered += 1;
                        delivered += 1;
                    }
                    Err(e) => {
                        warn!("Inbox of {} rejected packet: {}", msg.to, e);
                        self.stats.dropped += 1;
                    }
                },
                None => {
                    debug!("No endpoint {}", msg.to);
                    self.stats.dropped += 1;
                }
            }
        }
        delivered
    }

    pub fn advance(&self, duration: Duration) {
        self.context.advance_time(duration);
    }

    pub fn time(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }
}

/// One observer process and its player.
pub struct SimObserver {
    pub player: PlayerUid,
    pub client: TeleportClient<SimContext, SimNetwork>,
    pub dialogs: Arc<DialogLog>,
}

/// An authority with any number of observers over one [`SimWorld`].
pub struct SimSession {
    pub world: SimWorld,
    pub host: Arc<SimHost>,
    pub server: TeleportServer<SimContext, SimNetwork>,
    pub observers: Vec<SimObserver>,
    config: TpNetConfig,
    ticks: u64,
}

impl SimSession {
    pub fn new(seed: u64, num_observers: usize, config: TpNetConfig, store: Arc<dyn SaveStore>) -> Self {
        let mut world = SimWorld::new(seed);
        let context = Arc::clone(&world.context);
        let host = SimHost::shared(Arc::clone(&context));

        let server_net = world.endpoint(0);
        let authority = server_net.local_id();
        let server = TeleportServer::new(
            Arc::clone(&context),
            server_net,
            config.clone(),
            host.clone(),
            host.clone(),
            store,
        );

        let observers = (0..num_observers)
            .map(|i| {
                let player = PlayerUid::new(format!("player-{}", i));
                let dialogs = DialogLog::shared();
                let client = TeleportClient::new(
                    Arc::clone(&context),
                    world.endpoint(i as u64 + 1),
                    config.clone(),
                    authority,
                    player.clone(),
                    dialogs.clone(),
                );
                SimObserver { player, client, dialogs }
            })
            .collect();

        Self {
            world,
            host,
            server,
            observers,
            config,
            ticks: 0,
        }
    }

    pub fn config(&self) -> &TpNetConfig {
        &self.config
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn authority_id(&self) -> PeerId {
        self.server.local_id()
    }

    pub fn observer_id(&self, index: usize) -> PeerId {
        self.observers[index].client.local_id()
    }

    pub fn connect(&mut self, index: usize) -> usize {
        let peer = self.observer_id(index);
        let player = self.observers[index].player.clone();
        self.server.peer_connected(peer, player)
    }

    pub fn connect_all(&mut self) {
        for index in 0..self.observers.len() {
            self.connect(index);
        }
    }

    /// Reconnects an observer from scratch.
    pub fn resync(&mut self, index: usize) -> usize {
        let peer = self.observer_id(index);
        self.server.peer_disconnected(peer);
        self.observers[index].client.reset();
        self.connect(index)
    }

    /// Keeps observer `index`'s player on the node at `pos` for this tick.
    pub fn hold(&mut self, index: usize, pos: BlockPos) {
        let observer = &mut self.observers[index];
        let on_cooldown = tpnet_core::WorldAccess::is_cooldown_running(self.host.as_ref(), &observer.player);
        self.server.on_entity_collide(pos, &observer.player);
        observer.client.on_entity_collide(pos, on_cooldown);
    }

    /// One tick of the whole session.
    pub async fn step(&mut self) {
        self.world
            .advance(Duration::from_millis(self.config.server.tick_interval_ms));
        self.world.route();
        self.server.step().await;
        self.world.route();
        for observer in &mut self.observers {
            observer.client.poll_inbox();
            observer.client.tick();
        }
        self.ticks += 1;
    }

    pub async fn run_ticks(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.step().await;
        }
    }

    /// Whether observer `index`'s mirror equals the authoritative registry.
    pub fn converged(&self, index: usize) -> bool {
        self.observers[index].client.mirror().list_all() == self.server.registry().list_all()
    }

    pub fn all_converged(&self) -> bool {
        (0..self.observers.len()).all(|index| self.converged(index))
    }

    pub fn sync_messages_applied(&self) -> u64 {
        self.observers.iter().map(|o| o.client.applied()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpnet_core::MemorySaveStore;
    use tpnet_env::NetworkController;

    fn session(observers: usize) -> SimSession {
        SimSession::new(42, observers, TpNetConfig::default(), Arc::new(MemorySaveStore::new()))
    }

    #[tokio::test]
    async fn test_sim_world_routes_to_endpoint() {
        let mut world = SimWorld::new(7);
        let a = world.endpoint(1);
        let b = world.endpoint(2);

        a.send(b.local_id(), PacketEnvelope::new(vec![1, 2], 0)).await.unwrap();
        assert!(b.try_recv().is_none());

        assert_eq!(world.route(), 1);
        let (from, packet) = b.try_recv().unwrap();
        assert_eq!(from, a.local_id());
        assert_eq!(packet.payload, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_sim_world_partition_drops() {
        let mut world = SimWorld::new(7);
        let a = world.endpoint(1);
        let b = world.endpoint(2);
        world.controller.partition(&[a.local_id()], &[b.local_id()]);

        a.send(b.local_id(), PacketEnvelope::new(vec![], 0)).await.unwrap();
        assert_eq!(world.route(), 0);
        assert_eq!(world.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_other_endpoint() {
        let mut world = SimWorld::new(7);
        let a = world.endpoint(1);
        let _b = world.endpoint(2);
        let _c = world.endpoint(3);

        assert_eq!(a.broadcast(PacketEnvelope::new(vec![9], 0)).await, 2);
        assert_eq!(world.route(), 2);
    }

    #[tokio::test]
    async fn test_session_connect_and_converge() {
        let mut s = session(2);
        s.server.on_node_placed(BlockPos::new(0, 64, 0), true);
        s.server.on_node_placed(BlockPos::new(30, 64, 0), true);
        s.connect_all();

        s.step().await;
        assert!(s.all_converged());
        assert_eq!(s.sync_messages_applied(), 4);
    }
}
