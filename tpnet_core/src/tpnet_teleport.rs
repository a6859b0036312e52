//! Relocation side effects, applied by the authority once a destination is chosen.
//!
//! For every entity carried by a jump:
//! 1. The destination keeps the entity's offset from the pad's contact center
//! 2. Players get a movement cooldown
//! 3. With the stability world rule on, players pay `stability_cost`;
//!    running out (or an active storm) turns the jump unstable
//! 4. Unstable jumps land on a random point `unstable_range` away from the
//!    destination instead of on it

use crate::config::{StabilityMode, TeleportConfig};
use crate::tpnet_node::{BlockPos, EntityId, PlayerUid};
use crate::tpnet_registry::NodeRegistry;

use nalgebra::Vector3;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::info;

/// Offset from a pad's block corner to the point entities stand on.
fn contact_center_offset() -> Vector3<f64> {
    Vector3::new(0.5, 1.0, 0.5)
}

/// Offset from a target block corner to the landing point.
fn landing_offset() -> Vector3<f64> {
    Vector3::new(0.5, 2.0, 0.5)
}

/// A destination choice sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeleportRequest {
    /// Pad the jump starts from; `None` moves only the requesting player
    pub source: Option<BlockPos>,

    /// Destination node
    pub target: Option<BlockPos>,
}

/// What the authority knows about an entity eligible for a jump.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRef {
    pub id: EntityId,
    pub position: Vector3<f64>,

    /// Set when the entity is a player
    pub player: Option<PlayerUid>,

    /// Display name (for logging)
    pub name: String,
}

/// Host world operations the authority relies on.
pub trait WorldAccess: Send + Sync {
    /// Entities near `center`. May over-approximate; callers filter by distance.
    fn entities_around(&self, center: Vector3<f64>, radius: f64) -> Vec<EntityRef>;

    fn player_entity(&self, player: &PlayerUid) -> Option<EntityRef>;

    fn is_cooldown_running(&self, player: &PlayerUid) -> bool;

    fn apply_cooldown(&self, entity: EntityId, duration_ms: u64);

    fn stability(&self, entity: EntityId) -> f64;

    fn set_stability(&self, entity: EntityId, value: f64);

    fn is_storm_active(&self) -> bool;

    fn relocate(&self, entity: EntityId, destination: Vector3<f64>);
}

/// How an entity arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Landing {
    Exact,
    Unstable,
}

/// One completed relocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Relocation {
    pub entity: EntityId,
    pub player: Option<PlayerUid>,

    /// Where the entity was aimed at
    pub intended: Vector3<f64>,

    /// Where the entity actually went
    pub destination: Vector3<f64>,

    pub landing: Landing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TeleportOutcome {
    /// Nothing to move or nowhere to go. Not an error.
    Aborted,
    Relocated(Vec<Relocation>),
}

impl TeleportOutcome {
    pub fn relocations(&self) -> &[Relocation] {
        match self {
            TeleportOutcome::Aborted => &[],
            TeleportOutcome::Relocated(relocations) => relocations,
        }
    }
}

/// Applies [`TeleportRequest`]s against the world.
#[derive(Debug, Clone)]
pub struct Teleporter {
    config: TeleportConfig,
}

impl Teleporter {
    pub fn new(config: TeleportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TeleportConfig {
        &self.config
    }

    /// Executes a request from `requester`.
    pub fn execute<R: Rng + ?Sized>(
        &self,
        registry: &NodeRegistry,
        world: &dyn WorldAccess,
        requester: &PlayerUid,
        request: &TeleportRequest,
        rng: &mut R,
    ) -> TeleportOutcome {
        let Some(target) = request.target else {
            return TeleportOutcome::Aborted;
        };
        let Some(target_node) = registry.get(target).filter(|node| node.enabled) else {
            return TeleportOutcome::Aborted;
        };

        let (entities, center) = match request.source {
            None => match world.player_entity(requester) {
                Some(entity) => {
                    let center = entity.position;
                    (vec![entity], center)
                }
                None => return TeleportOutcome::Aborted,
            },
            Some(source) => {
                if !registry.contains(source) {
                    return TeleportOutcome::Aborted;
                }
                let center = source.to_vec3() + contact_center_offset();
                (in_circle_entities(world, center, self.config.seal_radius), center)
            }
        };

        if entities.is_empty() {
            return TeleportOutcome::Aborted;
        }

        let stability_enabled = self.config.temporal_stability;
        let mut relocations = Vec::with_capacity(entities.len());

        for entity in entities {
            let intended = target.to_vec3() + (entity.position - center) + landing_offset();

            let landing = match &entity.player {
                Some(_) => {
                    world.apply_cooldown(entity.id, self.config.teleport_cooldown_ms);
                    let mut unstable = self.config.stability_mode == StabilityMode::Always;
                    if stability_enabled && self.charge_stability(world, entity.id) {
                        unstable = true;
                    }
                    if unstable && self.config.stability_mode != StabilityMode::Off {
                        Landing::Unstable
                    } else {
                        Landing::Exact
                    }
                }
                None => Landing::Exact,
            };

            let destination = match landing {
                Landing::Exact => intended,
                Landing::Unstable => {
                    random_pos_on_circle_edge(rng, self.config.unstable_range, intended)
                }
            };
            world.relocate(entity.id, destination);

            info!(
                "{} teleported to {:.1}, {:.1}, {:.1} ({})",
                entity.name, destination.x, destination.y, destination.z, target_node.name
            );

            relocations.push(Relocation {
                entity: entity.id,
                player: entity.player,
                intended,
                destination,
                landing,
            });
        }

        TeleportOutcome::Relocated(relocations)
    }

    /// Deducts the jump cost. Returns true when the jump must be unstable.
    fn charge_stability(&self, world: &dyn WorldAccess, entity: EntityId) -> bool {
        let current = world.stability(entity);
        let remaining = current - self.config.stability_cost;

        if remaining < 0.0 || world.is_storm_active() {
            world.set_stability(entity, remaining.max(0.0));
            true
        } else {
            if remaining < current {
                world.set_stability(entity, remaining);
            }
            false
        }
    }
}

/// Entities strictly inside the circle of `radius` around `center`.
pub fn in_circle_entities(world: &dyn WorldAccess, center: Vector3<f64>, radius: f64) -> Vec<EntityRef> {
    world
        .entities_around(center, radius)
        .into_iter()
        .filter(|entity| (entity.position - center).norm() < radius)
        .collect()
}

/// Uniformly random point on the horizontal circle of `radius` around `center`.
pub fn random_pos_on_circle_edge<R: Rng + ?Sized>(
    rng: &mut R,
    radius: f64,
    center: Vector3<f64>,
) -> Vector3<f64> {
    let angle = rng.gen::<f64>() * PI * 2.0;
    Vector3::new(
        center.x + angle.cos() * radius,
        center.y,
        center.z + angle.sin() * radius,
    )
}
