//! Property tests for registry upsert/remove and mirror convergence.

use proptest::prelude::*;
use std::collections::BTreeMap;
use tpnet_core::{AuthorityReplicator, BlockPos, Node, NodeRegistry, ObserverReplicator, Packet, RegistryConfig};
use tpnet_env::PeerId;

#[derive(Debug, Clone)]
enum Op {
    Upsert(BlockPos, String, bool),
    Remove(BlockPos),
}

fn pos_strategy() -> impl Strategy<Value = BlockPos> {
    (0i32..6, 0i32..3, 0i32..6).prop_map(|(x, y, z)| BlockPos::new(x, y, z))
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (pos_strategy(), "[a-z]{0,6}", any::<bool>())
            .prop_map(|(pos, name, enabled)| Op::Upsert(pos, name, enabled)),
        1 => pos_strategy().prop_map(Op::Remove),
    ]
}

fn apply(registry: &NodeRegistry, op: &Op) {
    match op {
        Op::Upsert(pos, name, enabled) => {
            let mut node = registry.get(*pos).unwrap_or_else(|| Node::new(*pos, *enabled));
            node.name = name.clone();
            node.enabled = *enabled;
            registry.set(node);
        }
        Op::Remove(pos) => {
            registry.remove(*pos);
        }
    }
}

fn sync_messages(replicator: &AuthorityReplicator) -> Vec<tpnet_core::SyncMessage> {
    replicator
        .take_outbox()
        .into_iter()
        .filter_map(|(_, packet)| match packet {
            Packet::Sync(message) => Some(message),
            _ => None,
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_registry_matches_keyed_model(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let registry = NodeRegistry::default();
        let mut model: BTreeMap<BlockPos, (String, bool)> = BTreeMap::new();

        for op in &ops {
            apply(&registry, op);
            match op {
                Op::Upsert(pos, name, enabled) => {
                    model.insert(*pos, (name.clone(), *enabled));
                }
                Op::Remove(pos) => {
                    model.remove(pos);
                }
            }
        }

        let nodes = registry.list_all();
        prop_assert_eq!(nodes.len(), model.len());
        for node in &nodes {
            let (name, enabled) = &model[&node.pos];
            prop_assert_eq!(&node.name, name);
            prop_assert_eq!(node.enabled, *enabled);
            prop_assert_eq!(node.neighbours.len(), 4);
            for linked in node.linked() {
                prop_assert!(model.get(&linked).map_or(false, |(_, enabled)| *enabled));
            }
        }
    }

    #[test]
    fn prop_mirror_converges_in_order(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let authority = NodeRegistry::default();
        let replicator = AuthorityReplicator::attach(&authority);
        replicator.connect(PeerId::from_seed(1), &authority);
        let observer = ObserverReplicator::new(NodeRegistry::shared(RegistryConfig::mirror()));

        for op in &ops {
            apply(&authority, op);
        }
        for message in sync_messages(&replicator) {
            observer.apply(message);
        }

        prop_assert_eq!(observer.mirror().list_all(), authority.list_all());
    }

    #[test]
    fn prop_resync_converges_in_any_order(
        (ops, order) in prop::collection::vec(op_strategy(), 1..40).prop_flat_map(|ops| {
            let len = 6 * 3 * 6;
            (Just(ops), Just((0..len).collect::<Vec<usize>>()).prop_shuffle())
        })
    ) {
        let authority = NodeRegistry::default();
        for op in &ops {
            apply(&authority, op);
        }

        let replicator = AuthorityReplicator::attach(&authority);
        replicator.connect(PeerId::from_seed(1), &authority);
        let messages = sync_messages(&replicator);

        let observer = ObserverReplicator::new(NodeRegistry::shared(RegistryConfig::mirror()));
        let mut shuffled: Vec<_> = order.iter().filter(|i| **i < messages.len()).map(|i| messages[*i].clone()).collect();
        // replay twice; duplicates must not matter
        shuffled.extend(shuffled.clone());
        for message in shuffled {
            observer.apply(message);
        }

        prop_assert_eq!(observer.mirror().list_all(), authority.list_all());
    }
}
