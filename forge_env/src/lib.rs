//! Agent Forge Environment Abstraction Layer
//!
//! This crate provides the seam that lets the coordination core run in both
//! **Production** (tokio, real clock) and **Simulation** (virtual clock,
//! seeded RNG) environments.
//!
//! # Core Concept
//!
//! Everything that would make a run irreproducible is intercepted:
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - Task spawning (`spawn()`)
//! - Randomness (`derive_rng()`)
//!
//! By deriving all entropy from a single 64-bit seed, any chaos run becomes
//! replayable via its seed number.
//!
//! # Example
//!
//! ```ignore
//! use forge_env::ForgeContext;
//!
//! async fn heartbeat<Ctx: ForgeContext>(ctx: &Ctx) {
//!     loop {
//!         ctx.sleep(Duration::from_millis(250)).await;
//!         tick(ctx.now());
//!     }
//! }
//! ```

mod context;
mod error;
mod tokio_impl;
mod types;

pub use context::ForgeContext;
pub use error::EnvError;
pub use tokio_impl::TokioContext;
pub use types::{AuthToken, SubscriptionId, BROADCAST_RECEIVER, SYSTEM_SENDER};

/// Re-exported so downstream crates name the same RNG type.
pub use rand_chacha::ChaCha8Rng;
