//! Node records and the identifiers they are keyed by.
//!
//! A [`Node`] is the registry-owned record. [`NodeSnapshot`] is the one
//! concrete representation that crosses process boundaries (wire and save
//! blob); records convert to and from it explicitly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Integer block position in the world. Unique key of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Squared Euclidean distance. Exact for any pair of positions.
    pub fn distance_sq(&self, other: &BlockPos) -> u128 {
        let dx = (self.x as i64 - other.x as i64).unsigned_abs() as u128;
        let dy = (self.y as i64 - other.y as i64).unsigned_abs() as u128;
        let dz = (self.z as i64 - other.z as i64).unsigned_abs() as u128;
        dx * dx + dy * dy + dz * dz
    }

    /// Block corner as a world-space vector.
    pub fn to_vec3(&self) -> nalgebra::Vector3<f64> {
        nalgebra::Vector3::new(self.x as f64, self.y as f64, self.z as f64)
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.x, self.y, self.z)
    }
}

/// Error returned when a `"x,y,z"` string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid block position: {0:?}")]
pub struct ParsePosError(pub String);

impl FromStr for BlockPos {
    type Err = ParsePosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',').map(|p| p.trim().parse::<i32>());
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(Ok(x)), Some(Ok(y)), Some(Ok(z)), None) => Ok(BlockPos::new(x, y, z)),
            _ => Err(ParsePosError(s.to_string())),
        }
    }
}

/// Stable identifier of a player.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerUid(pub String);

impl PlayerUid {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of any world entity (players included).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

/// A teleport node as held by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Identity; never changes after creation
    pub pos: BlockPos,

    /// Human label shown in the destination list
    pub name: String,

    /// Whether the node takes part in the network
    pub enabled: bool,

    /// Linked nodes, one per slot. `None` is an empty slot.
    pub neighbours: Vec<Option<BlockPos>>,

    /// Players that have discovered this node
    pub activated_by: BTreeSet<PlayerUid>,
}

impl Node {
    /// Creates an unnamed node with no links and no discoveries.
    pub fn new(pos: BlockPos, enabled: bool) -> Self {
        Self {
            pos,
            name: String::new(),
            enabled,
            neighbours: Vec::new(),
            activated_by: BTreeSet::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn is_activated_by(&self, player: &PlayerUid) -> bool {
        self.activated_by.contains(player)
    }

    /// Positions of the filled neighbour slots.
    pub fn linked(&self) -> impl Iterator<Item = BlockPos> + '_ {
        self.neighbours.iter().flatten().copied()
    }
}

/// Wire and save representation of a [`Node`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub pos: BlockPos,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub neighbours: Vec<Option<BlockPos>>,
    #[serde(default)]
    pub activated_by: Vec<PlayerUid>,
}

impl From<&Node> for NodeSnapshot {
    fn from(node: &Node) -> Self {
        Self {
            pos: node.pos,
            name: node.name.clone(),
            enabled: node.enabled,
            neighbours: node.neighbours.clone(),
            activated_by: node.activated_by.iter().cloned().collect(),
        }
    }
}

impl From<Node> for NodeSnapshot {
    fn from(node: Node) -> Self {
        Self {
            pos: node.pos,
            name: node.name,
            enabled: node.enabled,
            neighbours: node.neighbours,
            activated_by: node.activated_by.into_iter().collect(),
        }
    }
}

impl From<NodeSnapshot> for Node {
    fn from(snapshot: NodeSnapshot) -> Self {
        Self {
            pos: snapshot.pos,
            name: snapshot.name,
            enabled: snapshot.enabled,
            neighbours: snapshot.neighbours,
            activated_by: snapshot.activated_by.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_pos_parse_and_display() {
        let pos: BlockPos = "1,-2,3".parse().unwrap();
        assert_eq!(pos, BlockPos::new(1, -2, 3));
        assert_eq!(pos.to_string(), "1,-2,3");

        assert!("1,2".parse::<BlockPos>().is_err());
        assert!("1,2,3,4".parse::<BlockPos>().is_err());
        assert!("a,b,c".parse::<BlockPos>().is_err());
    }

    #[test]
    fn test_distance_sq() {
        let a = BlockPos::new(0, 0, 0);
        let b = BlockPos::new(3, 4, 0);
        assert_eq!(a.distance_sq(&b), 25);
    }

    #[test]
    fn test_distance_sq_at_coordinate_extremes() {
        let a = BlockPos::new(i32::MAX, 0, 0);
        let b = BlockPos::new(-10, 0, 0);
        let dx = i32::MAX as u128 + 10;
        assert_eq!(a.distance_sq(&b), dx * dx);

        let min = BlockPos::new(i32::MIN, i32::MIN, i32::MIN);
        let max = BlockPos::new(i32::MAX, i32::MAX, i32::MAX);
        let span = u32::MAX as u128;
        assert_eq!(min.distance_sq(&max), 3 * span * span);
        assert_eq!(max.distance_sq(&min), min.distance_sq(&max));
    }

    #[test]
    fn test_snapshot_conversion_keeps_fields() {
        let mut node = Node::new(BlockPos::new(5, 6, 7), true).with_name("Gate");
        node.neighbours = vec![Some(BlockPos::new(1, 1, 1)), None];
        node.activated_by.insert(PlayerUid::new("u1"));

        let snapshot = NodeSnapshot::from(&node);
        assert_eq!(snapshot.activated_by, vec![PlayerUid::new("u1")]);
        assert_eq!(Node::from(snapshot), node);
    }

    #[test]
    fn test_snapshot_defaults_missing_fields() {
        let snapshot: NodeSnapshot =
            serde_json::from_str(r#"{"pos":{"x":1,"y":2,"z":3}}"#).unwrap();
        let node = Node::from(snapshot);
        assert!(node.name.is_empty());
        assert!(!node.enabled);
        assert!(node.activated_by.is_empty());
    }
}
