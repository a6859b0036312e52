//! Core environment context trait for TPNet processes.

use async_trait::async_trait;
use rand::rngs::StdRng;
use std::time::{Duration, SystemTime};

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the authority and observer
/// runtimes can run in both production (tokio) and simulation environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, OS entropy
/// - **Simulation**: `SimContext` - virtual clock, `StdRng(seed)`
///
/// # Determinism
///
/// For DST, all methods that would normally introduce non-determinism
/// (time, randomness) are controlled by the implementation.
#[async_trait]
pub trait TpNetContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Drives activation timestamps and the contact grace window.
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;
    
    /// Returns the monotonic time in whole milliseconds.
    fn now_ms(&self) -> u64 {
        self.now().as_millis() as u64
    }
    
    /// Returns the wall-clock time for packet timestamps.
    fn system_time(&self) -> SystemTime;
    
    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);
    
    /// Derives a random number generator from a seed extension.
    ///
    /// The implementation combines the global seed with `seed_extension`
    /// so that simulated unstable jumps are reproducible.
    fn derive_rng(&self, seed_extension: u64) -> StdRng;
    
    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
