//! Fair, persisted closer draws.
//!
//! Assigns one closer to an incoming appointment request by weighted
//! random selection, with degressive weights, periodic bucket resets,
//! per-(actor, tier) cooldowns, and a durable, concurrency-safe store.
//!
//! Entry point: [`service::DrawService`].

pub mod bucket;
pub mod clock;
pub mod config;
pub mod cooldown;
pub mod draw_engine;
pub mod error;
pub mod event;
pub mod lock;
pub mod rng;
pub mod service;
pub mod stats;
pub mod store;
pub mod types;

pub use config::{DrawSettings, ProbabilityConfig};
pub use error::{CoreResult, DrawError};
pub use service::{DrawResult, DrawService};
pub use store::{DrawBackend, SqliteStore};
