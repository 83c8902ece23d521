//! Core environment context trait for Agent Forge components.

use async_trait::async_trait;
use rand_chacha::ChaCha8Rng;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the message bus, the
/// adversarial middleware and the simulation engine can run against a real
/// clock in production and a virtual clock in tests.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, OS entropy
/// - **Simulation**: `SimContext` - virtual clock, `ChaCha8Rng(seed)`
///
/// # Determinism
///
/// Every source of non-determinism the core touches (time, sleeping,
/// randomness) goes through this trait.
#[async_trait]
pub trait ForgeContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for outage schedules and duration measurements.
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used for message and step timestamps.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static;

    /// Derives an independent RNG stream.
    ///
    /// Components that need randomness but were not given an explicit seed
    /// call this once at construction. Distinct `stream` values yield
    /// distinct sequences.
    fn derive_rng(&self, stream: u64) -> ChaCha8Rng;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;

    /// Wall-clock time as fractional seconds since the unix epoch.
    fn unix_secs(&self) -> f64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}
