//! The Replication Protocol - keeps observer mirrors in step with the authority.
//!
//! # Roles
//!
//! - **Authority**: [`AuthorityReplicator`] listens to the authoritative
//!   registry and queues one [`SyncMessage`] per notification for every
//!   connected observer. A newly connected observer gets one message per
//!   existing node.
//! - **Observer**: [`ObserverReplicator`] replays received messages into its
//!   local mirror with `set` / `remove`. It never computes network state.
//!
//! Upsert-by-key and remove-by-key make every message idempotent, so
//! duplicated, reordered, or replayed messages converge to the same mirror.
//!
//! # Wire format
//!
//! ```text
//! PacketEnvelope { payload: JSON(Packet), timestamp_ms, hop_count }
//!
//! Packet::Sync     { node: NodeSnapshot, remove }   authority -> observer
//! Packet::Rename   { pos, name: UTF-8 bytes }       observer  -> authority
//! Packet::Teleport { source, target }               observer  -> authority
//! ```

use crate::tpnet_node::{BlockPos, Node, NodeSnapshot, PlayerUid};
use crate::tpnet_registry::{NodeRegistry, RegistryListener};
use crate::tpnet_teleport::TeleportRequest;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tpnet_env::{PacketEnvelope, PeerId};
use tracing::debug;

/// Packet encoding errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to encode packet: {0}")]
    Encode(serde_json::Error),

    #[error("Failed to decode packet: {0}")]
    Decode(serde_json::Error),
}

/// One node snapshot plus a removal flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub node: NodeSnapshot,
    pub remove: bool,
}

impl SyncMessage {
    pub fn upsert(node: &Node) -> Self {
        Self {
            node: NodeSnapshot::from(node),
            remove: false,
        }
    }

    pub fn removal(node: &Node) -> Self {
        Self {
            node: NodeSnapshot::from(node),
            remove: true,
        }
    }
}

/// Everything that travels between the authority and observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    Sync(SyncMessage),
    Rename { pos: BlockPos, name: Vec<u8> },
    Teleport(TeleportRequest),
}

impl Packet {
    /// Wraps the packet in a transport envelope.
    pub fn encode(&self, timestamp_ms: u64) -> Result<PacketEnvelope, ProtocolError> {
        let payload = serde_json::to_vec(self).map_err(ProtocolError::Encode)?;
        Ok(PacketEnvelope::new(payload, timestamp_ms))
    }

    pub fn decode(envelope: &PacketEnvelope) -> Result<Self, ProtocolError> {
        serde_json::from_slice(&envelope.payload).map_err(ProtocolError::Decode)
    }
}

/// Position-scoped permission check for client requests.
pub trait AccessPolicy: Send + Sync {
    /// Whether `player` may use the block at `pos`.
    fn can_use(&self, player: &PlayerUid, pos: BlockPos) -> bool;
}

/// Grants every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn can_use(&self, _player: &PlayerUid, _pos: BlockPos) -> bool {
        true
    }
}

/// Authority side of the protocol.
///
/// Attach it to the authoritative registry with [`AuthorityReplicator::attach`];
/// queued packets are drained with [`AuthorityReplicator::take_outbox`].
#[derive(Default)]
pub struct AuthorityReplicator {
    peers: Mutex<BTreeSet<PeerId>>,
    outbox: Mutex<Vec<(PeerId, Packet)>>,
    messages_queued: AtomicU64,
}

impl AuthorityReplicator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a replicator subscribed to `registry`.
    pub fn attach(registry: &NodeRegistry) -> Arc<Self> {
        let replicator = Self::new();
        registry.subscribe(replicator.clone());
        replicator
    }

    /// Registers an observer and queues a full push of `registry` to it.
    ///
    /// The snapshot is taken with the outbox locked, so every change made
    /// after it is queued behind it. Returns the number of messages queued.
    pub fn connect(&self, peer: PeerId, registry: &NodeRegistry) -> usize {
        self.lock_peers().insert(peer);

        let mut outbox = self.lock_outbox();
        let nodes = registry.list_all();
        let count = nodes.len();
        for node in &nodes {
            outbox.push((peer, Packet::Sync(SyncMessage::upsert(node))));
        }
        self.messages_queued.fetch_add(count as u64, Ordering::Relaxed);

        debug!("full sync of {} nodes queued for {}", count, peer);
        count
    }

    /// Forgets an observer. Pending packets for it are discarded.
    pub fn disconnect(&self, peer: PeerId) -> bool {
        self.lock_outbox().retain(|(target, _)| *target != peer);
        self.lock_peers().remove(&peer)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.lock_peers().iter().copied().collect()
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.lock_peers().contains(&peer)
    }

    /// Queues `message` for every observer except `except`.
    pub fn broadcast(&self, message: SyncMessage, except: Option<PeerId>) {
        let peers = self.peers();
        let mut outbox = self.lock_outbox();
        for peer in peers.into_iter().filter(|peer| Some(*peer) != except) {
            outbox.push((peer, Packet::Sync(message.clone())));
            self.messages_queued.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drains the queued `(target, packet)` pairs.
    pub fn take_outbox(&self) -> Vec<(PeerId, Packet)> {
        std::mem::take(&mut *self.lock_outbox())
    }

    /// Total messages queued since creation.
    pub fn messages_queued(&self) -> u64 {
        self.messages_queued.load(Ordering::Relaxed)
    }

    fn lock_peers(&self) -> std::sync::MutexGuard<'_, BTreeSet<PeerId>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outbox(&self) -> std::sync::MutexGuard<'_, Vec<(PeerId, Packet)>> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RegistryListener for AuthorityReplicator {
    fn on_added(&self, node: &Node) {
        self.broadcast(SyncMessage::upsert(node), None);
    }

    fn on_modified(&self, node: &Node) {
        self.broadcast(SyncMessage::upsert(node), None);
    }

    fn on_removed(&self, node: &Node) {
        self.broadcast(SyncMessage::removal(node), None);
    }

    fn on_activated_by(&self, node: &Node, _player: &PlayerUid) {
        self.broadcast(SyncMessage::upsert(node), None);
    }
}

/// Applies a client rename request to the node placed at `pos`.
///
/// The caller checks that a block is placed there; `block_enabled` is that
/// block's flag, used when the registry has no record for it yet.
/// Returns false (and changes nothing) when the access check fails.
pub fn apply_rename(
    registry: &NodeRegistry,
    policy: &dyn AccessPolicy,
    player: &PlayerUid,
    pos: BlockPos,
    name: &[u8],
    block_enabled: bool,
) -> bool {
    if !policy.can_use(player, pos) {
        debug!("rename of {} by {} denied", pos, player);
        return false;
    }

    let mut node = registry.get_or_create(pos, block_enabled);
    node.name = String::from_utf8_lossy(name).into_owned();
    registry.set(node);
    true
}

/// Observer side of the protocol.
pub struct ObserverReplicator {
    mirror: Arc<NodeRegistry>,
    applied: AtomicU64,
}

impl ObserverReplicator {
    pub fn new(mirror: Arc<NodeRegistry>) -> Self {
        Self {
            mirror,
            applied: AtomicU64::new(0),
        }
    }

    pub fn mirror(&self) -> &Arc<NodeRegistry> {
        &self.mirror
    }

    /// Replays one authoritative event into the mirror.
    pub fn apply(&self, message: SyncMessage) {
        let node = Node::from(message.node);
        if message.remove {
            self.mirror.remove(node.pos);
        } else {
            self.mirror.set(node);
        }
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Handles a packet from the authority. Returns true if it was applied.
    pub fn handle_packet(&self, packet: Packet) -> bool {
        match packet {
            Packet::Sync(message) => {
                self.apply(message);
                true
            }
            other => {
                debug!("observer ignoring {:?}", other);
                false
            }
        }
    }

    /// Messages applied since creation.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn rename_request(pos: BlockPos, name: &str) -> Packet {
        Packet::Rename {
            pos,
            name: name.as_bytes().to_vec(),
        }
    }

    pub fn teleport_request(source: Option<BlockPos>, target: BlockPos) -> Packet {
        Packet::Teleport(TeleportRequest {
            source,
            target: Some(target),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;

    fn pos(x: i32, y: i32, z: i32) -> BlockPos {
        BlockPos::new(x, y, z)
    }

    struct DenyAll;

    impl AccessPolicy for DenyAll {
        fn can_use(&self, _player: &PlayerUid, _pos: BlockPos) -> bool {
            false
        }
    }

    fn observer() -> ObserverReplicator {
        ObserverReplicator::new(NodeRegistry::shared(RegistryConfig::mirror()))
    }

    #[test]
    fn test_registry_events_are_broadcast_to_all_peers() {
        let registry = NodeRegistry::new(RegistryConfig::mirror());
        let replicator = AuthorityReplicator::attach(&registry);
        replicator.connect(PeerId::from_seed(1), &registry);
        replicator.connect(PeerId::from_seed(2), &registry);

        registry.get_or_create(pos(0, 0, 0), true);
        registry.remove(pos(0, 0, 0));

        let outbox = replicator.take_outbox();
        assert_eq!(outbox.len(), 4);
        let removals = outbox
            .iter()
            .filter(|(_, p)| matches!(p, Packet::Sync(m) if m.remove))
            .count();
        assert_eq!(removals, 2);
        assert!(replicator.take_outbox().is_empty());
    }

    #[test]
    fn test_connect_pushes_every_node() {
        let registry = NodeRegistry::default();
        for i in 0..5 {
            registry.get_or_create(pos(i, 0, 0), true);
        }
        let replicator = AuthorityReplicator::attach(&registry);

        let peer = PeerId::from_seed(3);
        assert_eq!(replicator.connect(peer, &registry), 5);

        let outbox = replicator.take_outbox();
        assert_eq!(outbox.len(), 5);
        assert!(outbox.iter().all(|(target, p)| *target == peer
            && matches!(p, Packet::Sync(m) if !m.remove)));
    }

    #[test]
    fn test_connect_during_writes_ends_on_latest_state() {
        let registry = Arc::new(NodeRegistry::new(RegistryConfig::mirror()));
        registry.set(Node::new(pos(0, 0, 0), true));
        let replicator = AuthorityReplicator::attach(&registry);

        let writer = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for i in 0..500 {
                    registry.set(Node::new(pos(0, 0, 0), true).with_name(format!("n{}", i)));
                }
            })
        };
        let peer = PeerId::from_seed(4);
        replicator.connect(peer, &registry);
        writer.join().unwrap();

        let last = replicator
            .take_outbox()
            .into_iter()
            .filter(|(target, _)| *target == peer)
            .filter_map(|(_, packet)| match packet {
                Packet::Sync(message) => Some(Node::from(message.node)),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(Some(last), registry.get(pos(0, 0, 0)));
    }

    #[test]
    fn test_broadcast_except_skips_originator() {
        let registry = NodeRegistry::default();
        let replicator = AuthorityReplicator::attach(&registry);
        let a = PeerId::from_seed(1);
        let b = PeerId::from_seed(2);
        replicator.connect(a, &registry);
        replicator.connect(b, &registry);

        replicator.broadcast(SyncMessage::upsert(&Node::new(pos(1, 1, 1), true)), Some(a));

        let outbox = replicator.take_outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].0, b);
    }

    #[test]
    fn test_disconnect_drops_pending_packets() {
        let registry = NodeRegistry::default();
        registry.get_or_create(pos(0, 0, 0), true);
        let replicator = AuthorityReplicator::attach(&registry);
        let peer = PeerId::from_seed(9);
        replicator.connect(peer, &registry);

        assert!(replicator.disconnect(peer));
        assert!(!replicator.is_connected(peer));
        assert!(replicator.take_outbox().is_empty());
    }

    #[test]
    fn test_apply_twice_equals_apply_once() {
        let observer = observer();
        let mut node = Node::new(pos(1, 2, 3), true).with_name("Alpha");
        node.activated_by.insert(PlayerUid::new("u1"));
        let message = SyncMessage::upsert(&node);

        observer.apply(message.clone());
        let once = observer.mirror().list_all();
        observer.apply(message);

        assert_eq!(observer.mirror().list_all(), once);
        assert_eq!(observer.mirror().get(pos(1, 2, 3)), Some(node));
    }

    #[test]
    fn test_removal_replay_is_idempotent() {
        let observer = observer();
        let node = Node::new(pos(1, 2, 3), true);
        observer.apply(SyncMessage::upsert(&node));

        observer.apply(SyncMessage::removal(&node));
        observer.apply(SyncMessage::removal(&node));

        assert!(observer.mirror().is_empty());
        assert_eq!(observer.applied(), 3);
    }

    #[test]
    fn test_full_resync_in_reverse_order_matches_authority() {
        let authority = NodeRegistry::default();
        for i in 0..6 {
            let node = authority.get_or_create(pos(i * 3, i, -i), i % 2 == 0);
            authority.set(node.with_name(format!("node-{}", i)));
        }
        let replicator = AuthorityReplicator::attach(&authority);
        replicator.connect(PeerId::from_seed(1), &authority);

        let observer = observer();
        for (_, packet) in replicator.take_outbox().into_iter().rev() {
            assert!(observer.handle_packet(packet));
        }

        assert_eq!(observer.mirror().list_all(), authority.list_all());
    }

    #[test]
    fn test_unauthorized_rename_changes_nothing() {
        let registry = NodeRegistry::default();
        let node = registry.get_or_create(pos(0, 0, 0), true);
        registry.set(node.with_name("Original"));
        let replicator = AuthorityReplicator::attach(&registry);
        replicator.connect(PeerId::from_seed(1), &registry);
        replicator.take_outbox();

        let applied = apply_rename(&registry, &DenyAll, &PlayerUid::new("intruder"),
            pos(0, 0, 0), b"Hacked", true);

        assert!(!applied);
        assert_eq!(registry.get(pos(0, 0, 0)).unwrap().name, "Original");
        assert!(replicator.take_outbox().is_empty());
    }

    #[test]
    fn test_authorized_rename_broadcasts() {
        let registry = NodeRegistry::default();
        registry.get_or_create(pos(0, 0, 0), true);
        let replicator = AuthorityReplicator::attach(&registry);
        replicator.connect(PeerId::from_seed(1), &registry);
        replicator.take_outbox();

        assert!(apply_rename(&registry, &AllowAll, &PlayerUid::new("owner"),
            pos(0, 0, 0), "Höhle".as_bytes(), true));

        assert_eq!(registry.get(pos(0, 0, 0)).unwrap().name, "Höhle");
        let outbox = replicator.take_outbox();
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn test_rename_without_record_uses_block_flag() {
        let registry = NodeRegistry::default();
        assert!(apply_rename(&registry, &AllowAll, &PlayerUid::new("owner"),
            pos(7, 7, 7), b"Fresh", false));

        let node = registry.get(pos(7, 7, 7)).unwrap();
        assert_eq!(node.name, "Fresh");
        assert!(!node.enabled);
    }

    #[test]
    fn test_packet_envelope_roundtrip_and_garbage() {
        let packet = ObserverReplicator::rename_request(pos(1, 2, 3), "Gate");
        let envelope = packet.encode(42).unwrap();
        assert_eq!(envelope.timestamp_ms, 42);
        assert_eq!(Packet::decode(&envelope).unwrap(), packet);

        let garbage = PacketEnvelope::new(b"\x00\x01garbage".to_vec(), 0);
        assert!(matches!(Packet::decode(&garbage), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_observer_ignores_client_packets() {
        let observer = observer();
        let packet = ObserverReplicator::teleport_request(None, pos(0, 0, 0));
        assert!(!observer.handle_packet(packet));
        assert!(observer.mirror().is_empty());
    }
}
