//! TPNet Core - replicated teleport node network.
//!
//! One authority process owns the [`NodeRegistry`] and replicates every
//! change to observers, which keep a read-only mirror. Each physical node
//! runs an [`ActivationMachine`] that turns sustained contact into a
//! destination choice, and the authority's [`Teleporter`] carries out the
//! chosen jump.
//!
//! Modules:
//! - [`tpnet_node`]: node records and identifiers
//! - [`tpnet_registry`]: keyed store of nodes with change notifications
//! - [`tpnet_sync`]: wire packets and the authority/observer roles
//! - [`tpnet_store`]: world save adapter with legacy migration
//! - [`tpnet_activation`]: per-node contact state machine
//! - [`tpnet_teleport`]: relocation side effects
//! - [`server_runtime`] / [`client_runtime`]: the two process roles

pub mod config;
pub mod tpnet_node;
pub mod tpnet_registry;
pub mod tpnet_sync;
pub mod tpnet_store;
pub mod tpnet_activation;
pub mod tpnet_teleport;

pub mod server_runtime;
pub mod client_runtime;

// Re-export key types for convenience
pub use config::{ActivationConfig, ConfigError, RegistryConfig, ServerConfig, StabilityMode, TeleportConfig, TpNetConfig};
pub use tpnet_node::{BlockPos, EntityId, Node, NodeSnapshot, ParsePosError, PlayerUid};
pub use tpnet_registry::{EventRecorder, ListenerId, NodeRegistry, RegistryEvent, RegistryListener};
pub use tpnet_sync::{apply_rename, AccessPolicy, AllowAll, AuthorityReplicator, ObserverReplicator, Packet, ProtocolError, SyncMessage};
pub use tpnet_store::{load_network, save_network, LegacyRecord, LoadSummary, MemorySaveStore, SaveStore, SledSaveStore, StoreError};
pub use tpnet_activation::{ActivationEvent, ActivationMachine, TeleportState, TransportingEntity};
pub use tpnet_teleport::{EntityRef, Landing, Relocation, TeleportOutcome, TeleportRequest, Teleporter, WorldAccess};
pub use server_runtime::TeleportServer;
pub use client_runtime::{ClientError, NodePresenter, NoopPresenter, TeleportClient};
