//! Per-node activation sequence.
//!
//! Each physical node owns one [`ActivationMachine`]. Contact events from
//! the host create and refresh [`TransportingEntity`] records; the periodic
//! [`ActivationMachine::tick`] advances them and reports what the host must
//! do next through [`ActivationEvent`]s.
//!
//! ```text
//!  contact ──► Idle ──tick──► Progressing ──(> reveal_after)──► AwaitingChoice
//!               │                  │                                  │
//!               └──────────────────┴──── (no contact > grace) ───────┴──► discarded
//! ```

use crate::config::ActivationConfig;
use crate::tpnet_node::{BlockPos, PlayerUid};

use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeleportState {
    Idle,
    Progressing,
    AwaitingChoice,
}

/// Transient contact record of one player on one node.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportingEntity {
    pub player: PlayerUid,
    pub state: TeleportState,
    pub seconds_passed: f32,
    pub last_collide_ms: u64,
}

impl TransportingEntity {
    fn new(player: PlayerUid, now_ms: u64) -> Self {
        Self {
            player,
            state: TeleportState::Idle,
            seconds_passed: 0.0,
            last_collide_ms: now_ms,
        }
    }
}

/// What the host has to act on after a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationEvent {
    /// Contact started: activate the node for the player
    Entered(PlayerUid),

    /// Contact lasted long enough: present the destination choice
    RevealChoice(PlayerUid),

    /// Contact lapsed: close any open dialog
    Abandoned(PlayerUid),
}

impl ActivationEvent {
    pub fn player(&self) -> &PlayerUid {
        match self {
            ActivationEvent::Entered(player)
            | ActivationEvent::RevealChoice(player)
            | ActivationEvent::Abandoned(player) => player,
        }
    }
}

/// Activation state of one physical node.
#[derive(Debug, Clone)]
pub struct ActivationMachine {
    pos: BlockPos,
    config: ActivationConfig,
    enabled: bool,
    records: BTreeMap<PlayerUid, TransportingEntity>,
}

impl ActivationMachine {
    pub fn new(pos: BlockPos, config: ActivationConfig) -> Self {
        Self {
            pos,
            config,
            enabled: true,
            records: BTreeMap::new(),
        }
    }

    pub fn pos(&self) -> BlockPos {
        self.pos
    }

    /// Mirrors the node's `enabled` flag. Disabled nodes ignore contact.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Registers a contact event.
    pub fn on_entity_collide(&mut self, player: &PlayerUid, now_ms: u64, on_cooldown: bool) {
        if !self.enabled || on_cooldown {
            return;
        }
        self.records
            .entry(player.clone())
            .or_insert_with(|| TransportingEntity::new(player.clone(), now_ms))
            .last_collide_ms = now_ms;
    }

    /// Advances every record by `dt` seconds.
    pub fn tick(&mut self, dt: f32, now_ms: u64) -> Vec<ActivationEvent> {
        let increment = dt.min(self.config.max_tick_increment_secs);
        let grace = self.config.grace_period_ms;
        let threshold = self.config.reveal_after_secs;

        let mut events = Vec::new();
        let mut lapsed = Vec::new();

        for (player, record) in self.records.iter_mut() {
            if record.state == TeleportState::Idle {
                record.state = TeleportState::Progressing;
                events.push(ActivationEvent::Entered(player.clone()));
            }

            record.seconds_passed += increment;

            if now_ms.saturating_sub(record.last_collide_ms) > grace {
                lapsed.push(player.clone());
            } else if record.seconds_passed > threshold
                && record.state == TeleportState::Progressing
            {
                record.state = TeleportState::AwaitingChoice;
                events.push(ActivationEvent::RevealChoice(player.clone()));
            }
        }

        for player in lapsed {
            self.records.remove(&player);
            debug!("Contact lapsed on {} for {}", self.pos, player);
            events.push(ActivationEvent::Abandoned(player));
        }

        events
    }

    /// Render progress in `[0, 1]` over the live records.
    pub fn progress(&self) -> f32 {
        let longest = self
            .records
            .values()
            .map(|record| record.seconds_passed)
            .fold(0.0_f32, f32::max);
        (longest / self.config.reveal_after_secs).min(1.0)
    }

    pub fn is_active(&self) -> bool {
        !self.records.is_empty()
    }

    pub fn state_of(&self, player: &PlayerUid) -> Option<TeleportState> {
        self.records.get(player).map(|record| record.state)
    }

    pub fn record(&self, player: &PlayerUid) -> Option<&TransportingEntity> {
        self.records.get(player)
    }

    /// Drops the record of a player whose jump completed.
    pub fn complete(&mut self, player: &PlayerUid) -> bool {
        self.records.remove(player).is_some()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
