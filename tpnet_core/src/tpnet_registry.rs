//! The Node Registry - single mutable store of teleport nodes per process.
//!
//! The same registry type backs the authority and every observer mirror.
//! It has no networking knowledge: replication attaches to it as a
//! [`RegistryListener`].
//!
//! # Consistency
//!
//! All records live behind one `RwLock`. A mutation replaces whole records
//! while holding the write lock, so readers never see a partially updated
//! node. Its notifications are appended to a pending queue before the write
//! lock is released, so the queue holds events in mutation order.
//!
//! Delivery happens after the lock is released, one dispatcher at a time.
//! A thread that finds another dispatch in progress leaves its events to
//! that dispatcher. Listeners therefore see events in mutation order and
//! may read (or even mutate) the registry from inside a callback.
//!
//! # Neighbour links
//!
//! With [`RegistryConfig::link_neighbours`] set, every enabled node links to
//! its `neighbour_slots` nearest enabled nodes (squared Euclidean distance,
//! ties broken by position order). Links are recomputed whenever membership
//! or an `enabled` flag changes. Without linking (observer mirrors) links are
//! replayed as received, and removal only prunes slots pointing at the
//! removed node.

use crate::config::RegistryConfig;
use crate::tpnet_node::{BlockPos, Node, PlayerUid};

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};

/// Receives registry change notifications.
///
/// All methods default to no-ops, so a listener only overrides what it needs.
pub trait RegistryListener: Send + Sync {
    fn on_added(&self, _node: &Node) {}

    fn on_modified(&self, _node: &Node) {}

    fn on_removed(&self, _node: &Node) {}

    fn on_activated_by(&self, _node: &Node, _player: &PlayerUid) {}
}

/// A change produced by a registry mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added(Node),
    Modified(Node),
    Removed(Node),
    ActivatedBy(Node, PlayerUid),
}

impl RegistryEvent {
    /// Node carried by the event.
    pub fn node(&self) -> &Node {
        match self {
            RegistryEvent::Added(node)
            | RegistryEvent::Modified(node)
            | RegistryEvent::Removed(node)
            | RegistryEvent::ActivatedBy(node, _) => node,
        }
    }

    fn dispatch(&self, listener: &dyn RegistryListener) {
        match self {
            RegistryEvent::Added(node) => listener.on_added(node),
            RegistryEvent::Modified(node) => listener.on_modified(node),
            RegistryEvent::Removed(node) => listener.on_removed(node),
            RegistryEvent::ActivatedBy(node, player) => listener.on_activated_by(node, player),
        }
    }
}

/// Handle returned by [`NodeRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Authoritative (or mirrored) mapping of position to node.
pub struct NodeRegistry {
    config: RegistryConfig,
    nodes: RwLock<BTreeMap<BlockPos, Node>>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn RegistryListener>)>>,
    next_listener: AtomicU64,

    /// Events not yet delivered, in mutation order
    pending: Mutex<VecDeque<RegistryEvent>>,

    /// Held by the thread currently delivering `pending`
    dispatch: Mutex<()>,
}

impl NodeRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            nodes: RwLock::new(BTreeMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
            dispatch: Mutex::new(()),
        }
    }

    /// Creates an Arc-wrapped registry for sharing between components.
    pub fn shared(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Registers a listener; it sees every mutation from now on.
    pub fn subscribe(&self, listener: Arc<dyn RegistryListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Returns the node at `pos`, creating and registering it if absent.
    pub fn get_or_create(&self, pos: BlockPos, enabled: bool) -> Node {
        let node = {
            let mut nodes = self.write();
            if let Some(existing) = nodes.get(&pos) {
                return existing.clone();
            }

            let mut node = Node::new(pos, enabled);
            node.neighbours = vec![None; self.config.neighbour_slots];
            nodes.insert(pos, node);

            let relinked = self.refresh_links(&mut nodes, None, Some(pos));
            let node = nodes[&pos].clone();
            let mut events = vec![RegistryEvent::Added(node.clone())];
            events.extend(relinked);
            self.enqueue(events);
            node
        };
        self.deliver();
        node
    }

    pub fn get(&self, pos: BlockPos) -> Option<Node> {
        self.read().get(&pos).cloned()
    }

    pub fn contains(&self, pos: BlockPos) -> bool {
        self.read().contains_key(&pos)
    }

    /// Upserts `node` by position.
    ///
    /// Fires `on_added` for a new position and `on_modified` when the stored
    /// record changes. Storing an identical record fires nothing.
    pub fn set(&self, node: Node) {
        let pos = node.pos;
        {
            let mut events = Vec::new();
            let mut nodes = self.write();
            let previous = nodes.insert(pos, node);

            let relinked = self.refresh_links(&mut nodes, None, Some(pos));
            let current = nodes[&pos].clone();
            match previous {
                None => events.push(RegistryEvent::Added(current)),
                Some(previous) if previous != current => {
                    events.push(RegistryEvent::Modified(current))
                }
                Some(_) => {}
            }
            events.extend(relinked);
            self.enqueue(events);
        }
        self.deliver();
    }

    /// Deletes the node at `pos` and prunes links pointing at it.
    ///
    /// Removing an absent position is a no-op.
    pub fn remove(&self, pos: BlockPos) -> Option<Node> {
        let removed = {
            let mut nodes = self.write();
            let removed = nodes.remove(&pos)?;
            let mut events = vec![RegistryEvent::Removed(removed.clone())];
            events.extend(self.refresh_links(&mut nodes, Some(pos), None));
            self.enqueue(events);
            removed
        };
        self.deliver();
        Some(removed)
    }

    /// Records that `player` discovered the node at `pos`.
    ///
    /// Returns false when there is no such node. Fires `on_activated_by`
    /// only when the player was not already recorded.
    pub fn activate_for(&self, pos: BlockPos, player: &PlayerUid) -> bool {
        {
            let mut nodes = self.write();
            let Some(node) = nodes.get_mut(&pos) else {
                return false;
            };
            if !node.activated_by.insert(player.clone()) {
                return true;
            }
            self.enqueue(vec![RegistryEvent::ActivatedBy(node.clone(), player.clone())]);
        }
        self.deliver();
        true
    }

    /// All nodes, in position order.
    pub fn list_all(&self) -> Vec<Node> {
        self.read().values().cloned().collect()
    }

    /// Enabled nodes the player has discovered (the destination list).
    pub fn visible_to(&self, player: &PlayerUid) -> Vec<Node> {
        self.read()
            .values()
            .filter(|node| node.enabled && node.is_activated_by(player))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drops every record without notifying. Used at session teardown.
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Block info lines for the node at `pos`.
    ///
    /// With `with_neighbours`, each slot is listed by the linked node's name,
    /// or `null` for an empty slot or an unknown position.
    pub fn describe(&self, pos: BlockPos, with_neighbours: bool) -> Option<Vec<String>> {
        let nodes = self.read();
        let node = nodes.get(&pos)?;

        let mut lines = vec![node.name.clone()];
        if with_neighbours {
            lines.push("Neighbours:".to_string());
            for slot in &node.neighbours {
                let name = slot
                    .and_then(|linked| nodes.get(&linked))
                    .map(|linked| linked.name.as_str())
                    .unwrap_or("null");
                lines.push(format!("*** {}", name));
            }
        }
        Some(lines)
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<BlockPos, Node>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<BlockPos, Node>> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Brings every node's links up to date and returns `Modified` events
    /// for the nodes whose slots changed (except `skip`).
    fn refresh_links(
        &self,
        nodes: &mut BTreeMap<BlockPos, Node>,
        removed: Option<BlockPos>,
        skip: Option<BlockPos>,
    ) -> Vec<RegistryEvent> {
        let slots = self.config.neighbour_slots;
        let enabled: Vec<BlockPos> = if self.config.link_neighbours {
            nodes.values().filter(|n| n.enabled).map(|n| n.pos).collect()
        } else {
            Vec::new()
        };

        let mut events = Vec::new();
        for node in nodes.values_mut() {
            let links = if self.config.link_neighbours {
                if node.enabled {
                    nearest_links(node.pos, &enabled, slots)
                } else {
                    vec![None; slots]
                }
            } else if let Some(removed) = removed {
                node.neighbours
                    .iter()
                    .map(|slot| slot.filter(|linked| *linked != removed))
                    .collect()
            } else {
                continue;
            };

            if links != node.neighbours {
                node.neighbours = links;
                if Some(node.pos) != skip {
                    events.push(RegistryEvent::Modified(node.clone()));
                }
            }
        }
        events
    }

    /// Queues events for delivery. Called with the write lock held.
    fn enqueue(&self, events: Vec<RegistryEvent>) {
        if events.is_empty() {
            return;
        }
        self.lock_pending().extend(events);
    }

    /// Delivers pending events unless another thread is already doing so.
    fn deliver(&self) {
        loop {
            let dispatching = match self.dispatch.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };

            loop {
                let Some(event) = self.lock_pending().pop_front() else {
                    break;
                };
                for listener in self.listener_snapshot() {
                    event.dispatch(listener.as_ref());
                }
            }
            drop(dispatching);

            // events queued while the guard was being released
            if self.lock_pending().is_empty() {
                return;
            }
        }
    }

    fn listener_snapshot(&self) -> Vec<Arc<dyn RegistryListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, VecDeque<RegistryEvent>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

/// The `slots` nearest candidates to `pos`, padded with empty slots.
fn nearest_links(pos: BlockPos, candidates: &[BlockPos], slots: usize) -> Vec<Option<BlockPos>> {
    let mut others: Vec<BlockPos> = candidates.iter().copied().filter(|c| *c != pos).collect();
    others.sort_by_key(|c| (pos.distance_sq(c), *c));

    let mut links: Vec<Option<BlockPos>> = others.into_iter().take(slots).map(Some).collect();
    links.resize(slots, None);
    links
}

/// Listener that records every event, in order.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<RegistryEvent>>,
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drains the recorded events.
    pub fn take(&self) -> Vec<RegistryEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn push(&self, event: RegistryEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl RegistryListener for EventRecorder {
    fn on_added(&self, node: &Node) {
        self.push(RegistryEvent::Added(node.clone()));
    }

    fn on_modified(&self, node: &Node) {
        self.push(RegistryEvent::Modified(node.clone()));
    }

    fn on_removed(&self, node: &Node) {
        self.push(RegistryEvent::Removed(node.clone()));
    }

    fn on_activated_by(&self, node: &Node, player: &PlayerUid) {
        self.push(RegistryEvent::ActivatedBy(node.clone(), player.clone()));
    }
}
