//! TPNet Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the TPNet authority
//! and its observers to run in both **Production** (tokio) and **Simulation**
//! (virtual clock) environments.
//!
//! # Core Concept: The Reactor Pattern
//!
//! For Deterministic Simulation Testing (DST), we intercept all I/O:
//! - Time (`now()`, `sleep()`)
//! - Network (`send()`, `recv()`)
//! - Randomness (`derive_rng()`)
//!
//! By deriving all entropy from a single 64-bit seed, any bug becomes
//! reproducible via its seed number.
//!
//! # Example
//!
//! ```ignore
//! use tpnet_env::{TpNetContext, NetworkTransport};
//!
//! async fn server_loop<Ctx: TpNetContext, Net: NetworkTransport>(
//!     ctx: &Ctx,
//!     net: &Net,
//! ) {
//!     loop {
//!         tokio::select! {
//!             packet = net.recv() => handle_packet(packet),
//!             _ = ctx.sleep(Duration::from_millis(50)) => tick(),
//!         }
//!     }
//! }
//! ```

mod context;
mod network;
mod types;
mod error;
mod tokio_impl;

pub use context::TpNetContext;
pub use network::{NetworkTransport, NetworkController};
pub use types::{PeerId, PacketEnvelope};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
