//! Simulated host game: entities, per-player resources, land claims and a
//! dialog log standing in for the client UI.

use crate::context::SimContext;

use nalgebra::Vector3;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tpnet_core::{AccessPolicy, BlockPos, EntityId, EntityRef, Node, NodePresenter, PlayerUid, WorldAccess};
use tpnet_env::TpNetContext;

/// World state the authority acts upon.
pub struct SimHost {
    context: Arc<SimContext>,
    entities: Mutex<BTreeMap<EntityId, EntityRef>>,
    stability: Mutex<HashMap<EntityId, f64>>,
    cooldown_until_ms: Mutex<HashMap<EntityId, u64>>,
    claims: Mutex<HashMap<BlockPos, PlayerUid>>,
    storm: AtomicBool,
    relocations: AtomicU64,
}

impl SimHost {
    pub fn new(context: Arc<SimContext>) -> Self {
        Self {
            context,
            entities: Mutex::new(BTreeMap::new()),
            stability: Mutex::new(HashMap::new()),
            cooldown_until_ms: Mutex::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
            storm: AtomicBool::new(false),
            relocations: AtomicU64::new(0),
        }
    }

    pub fn shared(context: Arc<SimContext>) -> Arc<Self> {
        Arc::new(Self::new(context))
    }

    /// Places a player entity with full stability.
    pub fn spawn_player(&self, player: &PlayerUid, id: EntityId, position: Vector3<f64>) {
        self.lock(&self.entities).insert(
            id,
            EntityRef {
                id,
                position,
                player: Some(player.clone()),
                name: player.to_string(),
            },
        );
        self.lock(&self.stability).insert(id, 1.0);
    }

    pub fn spawn_creature(&self, name: &str, id: EntityId, position: Vector3<f64>) {
        self.lock(&self.entities).insert(
            id,
            EntityRef {
                id,
                position,
                player: None,
                name: name.to_string(),
            },
        );
    }

    pub fn position_of(&self, id: EntityId) -> Option<Vector3<f64>> {
        self.lock(&self.entities).get(&id).map(|entity| entity.position)
    }

    pub fn stability_of(&self, id: EntityId) -> f64 {
        self.stability(id)
    }

    pub fn set_storm(&self, active: bool) {
        self.storm.store(active, Ordering::Relaxed);
    }

    /// Restricts `pos` to `owner`.
    pub fn claim(&self, pos: BlockPos, owner: &PlayerUid) {
        self.lock(&self.claims).insert(pos, owner.clone());
    }

    pub fn relocations(&self) -> u64 {
        self.relocations.load(Ordering::Relaxed)
    }

    fn entity_of(&self, player: &PlayerUid) -> Option<EntityId> {
        self.lock(&self.entities)
            .values()
            .find(|entity| entity.player.as_ref() == Some(player))
            .map(|entity| entity.id)
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WorldAccess for SimHost {
    fn entities_around(&self, center: Vector3<f64>, radius: f64) -> Vec<EntityRef> {
        self.lock(&self.entities)
            .values()
            .filter(|entity| (entity.position - center).amax() <= radius)
            .cloned()
            .collect()
    }

    fn player_entity(&self, player: &PlayerUid) -> Option<EntityRef> {
        let id = self.entity_of(player)?;
        self.lock(&self.entities).get(&id).cloned()
    }

    fn is_cooldown_running(&self, player: &PlayerUid) -> bool {
        let Some(id) = self.entity_of(player) else {
            return false;
        };
        let now_ms = self.context.now_ms();
        self.lock(&self.cooldown_until_ms)
            .get(&id)
            .map_or(false, |until| *until > now_ms)
    }

    fn apply_cooldown(&self, entity: EntityId, duration_ms: u64) {
        let until = self.context.now_ms() + duration_ms;
        self.lock(&self.cooldown_until_ms).insert(entity, until);
    }

    fn stability(&self, entity: EntityId) -> f64 {
        self.lock(&self.stability).get(&entity).copied().unwrap_or(1.0)
    }

    fn set_stability(&self, entity: EntityId, value: f64) {
        self.lock(&self.stability).insert(entity, value);
    }

    fn is_storm_active(&self) -> bool {
        self.storm.load(Ordering::Relaxed)
    }

    fn relocate(&self, entity: EntityId, destination: Vector3<f64>) {
        if let Some(found) = self.lock(&self.entities).get_mut(&entity) {
            found.position = destination;
            self.relocations.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl AccessPolicy for SimHost {
    fn can_use(&self, player: &PlayerUid, pos: BlockPos) -> bool {
        self.lock(&self.claims)
            .get(&pos)
            .map_or(true, |owner| owner == player)
    }
}

/// Presenter that records dialog traffic.
#[derive(Default)]
pub struct DialogLog {
    opened: Mutex<Vec<(BlockPos, Vec<BlockPos>)>>,
    closed: Mutex<Vec<BlockPos>>,
}

impl DialogLog {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Dialogs opened so far, with the offered destinations.
    pub fn opened(&self) -> Vec<(BlockPos, Vec<BlockPos>)> {
        self.opened.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn closed(&self) -> Vec<BlockPos> {
        self.closed.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl NodePresenter for DialogLog {
    fn open_dialog(&self, pos: BlockPos, destinations: &[Node]) {
        let offered = destinations.iter().map(|node| node.pos).collect();
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((pos, offered));
    }

    fn close_dialog(&self, pos: BlockPos) {
        self.closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cooldown_expires_with_virtual_time() {
        let ctx = SimContext::shared(1);
        let host = SimHost::new(ctx.clone());
        let player = PlayerUid::new("p");
        host.spawn_player(&player, EntityId(1), Vector3::zeros());

        host.apply_cooldown(EntityId(1), 5000);
        assert!(host.is_cooldown_running(&player));

        ctx.advance_time(Duration::from_millis(5000));
        assert!(!host.is_cooldown_running(&player));
    }

    #[test]
    fn test_claims_restrict_to_owner() {
        let host = SimHost::new(SimContext::shared(1));
        let pos = BlockPos::new(1, 2, 3);
        assert!(host.can_use(&PlayerUid::new("anyone"), pos));

        host.claim(pos, &PlayerUid::new("owner"));
        assert!(host.can_use(&PlayerUid::new("owner"), pos));
        assert!(!host.can_use(&PlayerUid::new("anyone"), pos));
    }

    #[test]
    fn test_entities_around_uses_box() {
        let host = SimHost::new(SimContext::shared(1));
        host.spawn_creature("wolf", EntityId(2), Vector3::new(1.0, 0.0, 1.0));
        host.spawn_creature("far", EntityId(3), Vector3::new(10.0, 0.0, 0.0));

        let found = host.entities_around(Vector3::zeros(), 1.5);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, EntityId(2));
    }
}
