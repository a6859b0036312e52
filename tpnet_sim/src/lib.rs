//! TPNet Deterministic Simulation Harness
//!
//! Runs an authority and several observers in one process, with every
//! source of non-determinism under control:
//! - **Time**: virtual clock advanced once per tick
//! - **Network**: routed channels with per-link loss and partitions
//! - **Randomness**: every RNG derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimSession                          │
//! │  ┌──────────────────┐        ┌───────────────────────────┐  │
//! │  │  TeleportServer  │        │  SimHost (WorldAccess +   │  │
//! │  │   (authority)    │◄──────►│  AccessPolicy)            │  │
//! │  └────────┬─────────┘        └───────────────────────────┘  │
//! │           │  SimWorld router (loss / partitions)            │
//! │     ┌─────┴──────┬────────────┐                             │
//! │  ┌──▼───┐    ┌───▼──┐     ┌───▼──┐                          │
//! │  │ Obs 0│    │ Obs 1│ ... │ Obs N│   TeleportClient mirrors │
//! │  └──────┘    └──────┘     └──────┘                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tpnet_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 3).run(ScenarioId::LossyResync);
//! assert!(result.passed);
//! ```

mod context;
mod host;
mod network;
mod world;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use host::{DialogLog, SimHost};
pub use network::{SimNetwork, SimNetworkController};
pub use world::{RouterStats, SimObserver, SimSession, SimWorld};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
