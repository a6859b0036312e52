//! Shared fixtures: a manual clock, an in-process hub transport, and a
//! scripted world.

#![allow(dead_code)]

use async_trait::async_trait;
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tpnet_core::{BlockPos, EntityId, EntityRef, Node, NodePresenter, PlayerUid, WorldAccess, AccessPolicy};
use tpnet_env::{EnvError, NetworkTransport, PacketEnvelope, PeerId, TpNetContext};

/// Clock that only moves when told to.
pub struct ManualContext {
    now_ms: AtomicU64,
    seed: u64,
}

impl ManualContext {
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self { now_ms: AtomicU64::new(0), seed })
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

#[async_trait]
impl TpNetContext for ManualContext {
    fn now(&self) -> Duration {
        Duration::from_millis(self.now_ms.load(Ordering::SeqCst))
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration.as_millis() as u64);
    }

    fn derive_rng(&self, seed_extension: u64) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ seed_extension)
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

/// Delivers packets between endpoints of the same hub immediately.
#[derive(Default)]
pub struct Hub {
    inboxes: Mutex<HashMap<PeerId, VecDeque<(PeerId, PacketEnvelope)>>>,
}

impl Hub {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn endpoint(self: &Arc<Self>, seed: u64) -> Arc<HubEndpoint> {
        let id = PeerId::from_seed(seed);
        self.inboxes.lock().unwrap().insert(id, VecDeque::new());
        Arc::new(HubEndpoint { id, hub: Arc::clone(self) })
    }
}

pub struct HubEndpoint {
    id: PeerId,
    hub: Arc<Hub>,
}

#[async_trait]
impl NetworkTransport for HubEndpoint {
    async fn send(&self, target: PeerId, packet: PacketEnvelope) -> Result<(), EnvError> {
        let mut inboxes = self.hub.inboxes.lock().unwrap();
        let inbox = inboxes
            .get_mut(&target)
            .ok_or_else(|| EnvError::unreachable(target.to_string()))?;
        inbox.push_back((self.id, packet));
        Ok(())
    }

    async fn recv(&self) -> Option<(PeerId, PacketEnvelope)> {
        self.try_recv()
    }

    fn try_recv(&self) -> Option<(PeerId, PacketEnvelope)> {
        self.hub.inboxes.lock().unwrap().get_mut(&self.id)?.pop_front()
    }

    async fn broadcast(&self, packet: PacketEnvelope) -> usize {
        let mut inboxes = self.hub.inboxes.lock().unwrap();
        let mut sent = 0;
        for (_, inbox) in inboxes.iter_mut().filter(|(peer, _)| **peer != self.id) {
            inbox.push_back((self.id, packet.clone()));
            sent += 1;
        }
        sent
    }

    fn local_id(&self) -> PeerId {
        self.id
    }
}

/// World with players standing at fixed points.
#[derive(Default)]
pub struct ScriptedWorld {
    pub entities: Mutex<Vec<EntityRef>>,
    pub stability: Mutex<HashMap<EntityId, f64>>,
    pub cooldowns: Mutex<HashSet<PlayerUid>>,
}

impl ScriptedWorld {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_player(&self, uid: &str, id: u64, position: Vector3<f64>) {
        self.entities.lock().unwrap().push(EntityRef {
            id: EntityId(id),
            position,
            player: Some(PlayerUid::new(uid)),
            name: uid.to_string(),
        });
        self.stability.lock().unwrap().insert(EntityId(id), 1.0);
    }

    pub fn position_of(&self, id: u64) -> Vector3<f64> {
        self.entities
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.id == EntityId(id))
            .map(|e| e.position)
            .unwrap()
    }
}

impl WorldAccess for ScriptedWorld {
    fn entities_around(&self, _center: Vector3<f64>, _radius: f64) -> Vec<EntityRef> {
        self.entities.lock().unwrap().clone()
    }

    fn player_entity(&self, player: &PlayerUid) -> Option<EntityRef> {
        self.entities
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.player.as_ref() == Some(player))
            .cloned()
    }

    fn is_cooldown_running(&self, player: &PlayerUid) -> bool {
        self.cooldowns.lock().unwrap().contains(player)
    }

    fn apply_cooldown(&self, entity: EntityId, _duration_ms: u64) {
        let player = self
            .entities
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.id == entity)
            .and_then(|e| e.player.clone());
        if let Some(player) = player {
            self.cooldowns.lock().unwrap().insert(player);
        }
    }

    fn stability(&self, entity: EntityId) -> f64 {
        self.stability.lock().unwrap().get(&entity).copied().unwrap_or(1.0)
    }

    fn set_stability(&self, entity: EntityId, value: f64) {
        self.stability.lock().unwrap().insert(entity, value);
    }

    fn is_storm_active(&self) -> bool {
        false
    }

    fn relocate(&self, entity: EntityId, destination: Vector3<f64>) {
        for e in self.entities.lock().unwrap().iter_mut().filter(|e| e.id == entity) {
            e.position = destination;
        }
    }
}

/// Only the listed players may use the listed positions.
#[derive(Default)]
pub struct Claims {
    pub owners: Mutex<HashMap<BlockPos, PlayerUid>>,
}

impl Claims {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn claim(&self, pos: BlockPos, owner: &str) {
        self.owners.lock().unwrap().insert(pos, PlayerUid::new(owner));
    }
}

impl AccessPolicy for Claims {
    fn can_use(&self, player: &PlayerUid, pos: BlockPos) -> bool {
        self.owners
            .lock()
            .unwrap()
            .get(&pos)
            .map_or(true, |owner| owner == player)
    }
}

/// Presenter that records what it was asked to show.
#[derive(Default)]
pub struct RecordingPresenter {
    pub opened: Mutex<Vec<(BlockPos, Vec<String>)>>,
    pub closed: Mutex<Vec<BlockPos>>,
}

impl RecordingPresenter {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl NodePresenter for RecordingPresenter {
    fn open_dialog(&self, pos: BlockPos, destinations: &[Node]) {
        let names = destinations.iter().map(|n| n.name.clone()).collect();
        self.opened.lock().unwrap().push((pos, names));
    }

    fn close_dialog(&self, pos: BlockPos) {
        self.closed.lock().unwrap().push(pos);
    }
}
