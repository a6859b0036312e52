//! Simulated network transport with fault injection.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tpnet_env::{EnvError, NetworkController, NetworkTransport, PacketEnvelope, PeerId};

/// Simulated network interface for one process.
pub struct SimNetwork {
    local_id: PeerId,

    /// Sender to central router
    tx: mpsc::Sender<NetworkMessage>,

    /// Receiver for routed packets
    rx: tokio::sync::Mutex<mpsc::Receiver<(PeerId, PacketEnvelope)>>,

    /// Every peer attached to the same router
    directory: Arc<Mutex<Vec<PeerId>>>,
}

/// Internal message to the network router.
#[derive(Debug)]
pub struct NetworkMessage {
    pub from: PeerId,
    pub to: PeerId,
    pub packet: PacketEnvelope,
}

impl SimNetwork {
    pub fn new(
        local_id: PeerId,
        tx: mpsc::Sender<NetworkMessage>,
        rx: mpsc::Receiver<(PeerId, PacketEnvelope)>,
        directory: Arc<Mutex<Vec<PeerId>>>,
    ) -> Self {
        Self {
            local_id,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            directory,
        }
    }
}

#[async_trait]
impl NetworkTransport for SimNetwork {
    async fn send(&self, target: PeerId, packet: PacketEnvelope) -> Result<(), EnvError> {
        let msg = NetworkMessage {
            from: self.local_id,
            to: target,
            packet,
        };

        self.tx
            .send(msg)
            .await
            .map_err(|_| EnvError::network("Channel closed"))
    }

    async fn recv(&self) -> Option<(PeerId, PacketEnvelope)> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    fn try_recv(&self) -> Option<(PeerId, PacketEnvelope)> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    async fn broadcast(&self, packet: PacketEnvelope) -> usize {
        let peers: Vec<PeerId> = self
            .directory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .filter(|peer| *peer != self.local_id)
            .collect();

        let mut sent = 0;
        for peer in peers {
            if self.send(peer, packet.clone()).await.is_ok() {
                sent += 1;
            }
        }
        sent
    }

    fn local_id(&self) -> PeerId {
        self.local_id
    }
}

/// Network controller for fault injection.
#[derive(Default)]
pub struct SimNetworkController {
    /// Per-link packet loss rate (0.0 - 1.0)
    link_loss: Mutex<HashMap<(PeerId, PeerId), f64>>,

    /// Active partitions (peers that cannot communicate)
    partitions: Mutex<Vec<(Vec<PeerId>, Vec<PeerId>)>>,
}

impl SimNetworkController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks if two peers can communicate (not partitioned).
    pub fn can_communicate(&self, from: PeerId, to: PeerId) -> bool {
        let partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);

        for (group_a, group_b) in partitions.iter() {
            let from_in_a = group_a.contains(&from);
            let from_in_b = group_b.contains(&from);
            let to_in_a = group_a.contains(&to);
            let to_in_b = group_b.contains(&to);

            // Partitioned if one is in A and other in B (or vice versa)
            if (from_in_a && to_in_b) || (from_in_b && to_in_a) {
                return false;
            }
        }

        true
    }

    /// Gets the loss rate for a link (default 0.0).
    pub fn get_loss(&self, from: PeerId, to: PeerId) -> f64 {
        let losses = self.link_loss.lock().unwrap_or_else(PoisonError::into_inner);
        *losses.get(&(from, to)).unwrap_or(&0.0)
    }
}

impl NetworkController for SimNetworkController {
    fn partition(&self, group_a: &[PeerId], group_b: &[PeerId]) {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((group_a.to_vec(), group_b.to_vec()));
    }

    fn heal_all(&self) {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn set_link_loss(&self, from: PeerId, to: PeerId, loss_rate: f64) {
        self.link_loss
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((from, to), loss_rate.clamp(0.0, 1.0));
    }
}
