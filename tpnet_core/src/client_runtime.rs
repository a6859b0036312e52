//! Observer runtime - keeps a local mirror and drives the player's UI.

use tpnet_env::{EnvError, NetworkTransport, PeerId, TpNetContext};

use crate::config::TpNetConfig;
use crate::tpnet_activation::{ActivationEvent, ActivationMachine};
use crate::tpnet_node::{BlockPos, Node, PlayerUid};
use crate::tpnet_registry::NodeRegistry;
use crate::tpnet_sync::{ObserverReplicator, Packet, ProtocolError};

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Env(#[from] EnvError),
}

/// UI surface for a node.
pub trait NodePresenter: Send + Sync {
    /// Shows the destination choice for the node at `pos`.
    fn open_dialog(&self, pos: BlockPos, destinations: &[Node]);

    fn close_dialog(&self, pos: BlockPos);

    /// Render progress of the node's activation, in `[0, 1]`.
    fn set_progress(&self, _pos: BlockPos, _progress: f32) {}
}

/// Presenter that shows nothing.
pub struct NoopPresenter;

impl NodePresenter for NoopPresenter {
    fn open_dialog(&self, _pos: BlockPos, _destinations: &[Node]) {}

    fn close_dialog(&self, _pos: BlockPos) {}
}

/// The observer side of a session, for one player.
pub struct TeleportClient<Ctx, Net>
where
    Ctx: TpNetContext,
    Net: NetworkTransport,
{
    context: Arc<Ctx>,
    network: Arc<Net>,
    config: TpNetConfig,

    authority: PeerId,
    player: PlayerUid,

    replicator: ObserverReplicator,
    machines: BTreeMap<BlockPos, ActivationMachine>,
    presenter: Arc<dyn NodePresenter>,
}

impl<Ctx, Net> TeleportClient<Ctx, Net>
where
    Ctx: TpNetContext,
    Net: NetworkTransport,
{
    pub fn new(
        context: Arc<Ctx>,
        network: Arc<Net>,
        config: TpNetConfig,
        authority: PeerId,
        player: PlayerUid,
        presenter: Arc<dyn NodePresenter>,
    ) -> Self {
        let mirror = NodeRegistry::shared(config.registry.clone().into_mirror());
        Self {
            context,
            network,
            config,
            authority,
            player,
            replicator: ObserverReplicator::new(mirror),
            machines: BTreeMap::new(),
            presenter,
        }
    }

    pub fn mirror(&self) -> &Arc<NodeRegistry> {
        self.replicator.mirror()
    }

    pub fn player(&self) -> &PlayerUid {
        &self.player
    }

    pub fn local_id(&self) -> PeerId {
        self.network.local_id()
    }

    pub fn applied(&self) -> u64 {
        self.replicator.applied()
    }

    /// Drops the mirror and local activation ahead of a full resync.
    ///
    /// A resync only carries upserts, so removals lost in transit are
    /// cleared here.
    pub fn reset(&mut self) {
        self.mirror().clear();
        self.machines.clear();
    }

    /// Applies every packet already delivered. Returns how many were applied.
    pub fn poll_inbox(&self) -> usize {
        let mut applied = 0;
        while let Some((sender, envelope)) = self.network.try_recv() {
            if sender != self.authority {
                debug!("Ignoring packet from non-authority {}", sender);
                continue;
            }
            match Packet::decode(&envelope) {
                Ok(packet) => {
                    if self.replicator.handle_packet(packet) {
                        applied += 1;
                    }
                }
                Err(e) => warn!("Dropping packet from authority: {}", e),
            }
        }
        applied
    }

    /// The local player touched the node at `pos`.
    pub fn on_entity_collide(&mut self, pos: BlockPos, on_cooldown: bool) {
        let Some(node) = self.mirror().get(pos) else {
            return;
        };
        let now_ms = self.context.now_ms();
        let config = &self.config.activation;
        let machine = self
            .machines
            .entry(pos)
            .or_insert_with(|| ActivationMachine::new(pos, config.clone()));
        machine.set_enabled(node.enabled);
        machine.on_entity_collide(&self.player, now_ms, on_cooldown);
    }

    /// Advances local activation and updates the presenter.
    pub fn tick(&mut self) -> Vec<(BlockPos, ActivationEvent)> {
        let dt = self.config.server.tick_interval_ms as f32 / 1000.0;
        let now_ms = self.context.now_ms();

        let mut events = Vec::new();
        for (pos, machine) in self.machines.iter_mut() {
            events.extend(machine.tick(dt, now_ms).into_iter().map(|e| (*pos, e)));
            self.presenter.set_progress(*pos, machine.progress());
        }

        for (pos, event) in &events {
            match event {
                ActivationEvent::RevealChoice(player) if *player == self.player => {
                    let destinations = self.destinations_from(*pos);
                    self.presenter.open_dialog(*pos, &destinations);
                }
                ActivationEvent::Abandoned(player) if *player == self.player => {
                    self.presenter.close_dialog(*pos);
                }
                _ => {}
            }
        }
        events
    }

    /// Enabled nodes the player discovered, excluding `pos`.
    pub fn destinations_from(&self, pos: BlockPos) -> Vec<Node> {
        self.mirror()
            .visible_to(&self.player)
            .into_iter()
            .filter(|node| node.pos != pos)
            .collect()
    }

    pub fn progress(&self, pos: BlockPos) -> f32 {
        self.machines.get(&pos).map_or(0.0, ActivationMachine::progress)
    }

    /// Block info lines from the mirror.
    pub fn describe(&self, pos: BlockPos) -> Option<Vec<String>> {
        self.mirror().describe(pos, true)
    }

    /// Asks the authority to rename a node.
    pub async fn request_rename(&self, pos: BlockPos, name: &str) -> Result<(), ClientError> {
        self.send(ObserverReplicator::rename_request(pos, name)).await
    }

    /// Sends the player's destination choice and closes the dialog.
    pub async fn choose_destination(
        &mut self,
        source: Option<BlockPos>,
        target: BlockPos,
    ) -> Result<(), ClientError> {
        self.send(ObserverReplicator::teleport_request(source, target)).await?;
        if let Some(source) = source {
            self.presenter.close_dialog(source);
            if let Some(machine) = self.machines.get_mut(&source) {
                machine.complete(&self.player);
            }
        }
        Ok(())
    }

    async fn send(&self, packet: Packet) -> Result<(), ClientError> {
        let envelope = packet.encode(self.context.now_ms())?;
        self.network.send(self.authority, envelope).await?;
        Ok(())
    }
}
