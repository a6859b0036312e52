//! Network transport abstraction between the authority and its observers.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{PeerId, PacketEnvelope};

/// Abstraction for network I/O between TPNet processes.
///
/// # Implementations
///
/// - **Production**: Wraps the host game's packet channel
/// - **Simulation**: Channel-based with configurable loss and partitions
///
/// # Packet Flow
///
/// ```text
/// Authority                  Network                  Observer
///   |                           |                          |
///   |-- send(O, packet) ------->|                          |
///   |                           |-- [loss/partition] ----->|
///   |                           |                          |-- recv() -> packet
/// ```
#[async_trait]
pub trait NetworkTransport: Send + Sync + 'static {
    /// Sends a packet to a target peer.
    ///
    /// # Returns
    /// * `Ok(())` - Packet queued for delivery
    /// * `Err(EnvError::NetworkError)` - Immediate send failure (e.g., buffer full)
    ///
    /// # Note
    /// Success does not guarantee delivery - packets may be lost in simulation.
    async fn send(&self, target: PeerId, packet: PacketEnvelope) -> Result<(), EnvError>;
    
    /// Receives the next packet addressed to this peer.
    ///
    /// Blocks until a packet arrives. `None` means the channel was closed.
    async fn recv(&self) -> Option<(PeerId, PacketEnvelope)>;
    
    /// Returns the next already-delivered packet without waiting.
    ///
    /// Used by tick-driven loops that drain their inbox once per tick.
    fn try_recv(&self) -> Option<(PeerId, PacketEnvelope)>;
    
    /// Broadcasts a packet to all connected peers.
    ///
    /// Returns the number of peers the packet was sent to.
    async fn broadcast(&self, packet: PacketEnvelope) -> usize;
    
    /// Returns this peer's ID.
    fn local_id(&self) -> PeerId;
}

/// Marker trait for network controllers in simulation.
///
/// Allows injecting faults like partitions and packet loss.
pub trait NetworkController: Send + Sync {
    /// Creates a network partition between two peer sets.
    fn partition(&self, group_a: &[PeerId], group_b: &[PeerId]);
    
    /// Heals all partitions.
    fn heal_all(&self);
    
    /// Sets packet loss probability for a link (0.0 - 1.0).
    fn set_link_loss(&self, from: PeerId, to: PeerId, loss_rate: f64);
}
