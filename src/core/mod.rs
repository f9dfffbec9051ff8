//! Core engine module
//!
//! Contains the orchestrator, configuration, events, statistics and the
//! terrain seam.

mod config;
mod engine;
mod events;
mod stats;
mod terrain;

pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, FrameHooks, NoHooks};
pub use events::{EngineEvent, EventQueue};
pub use stats::FrameStats;
pub use terrain::{FlatTerrain, ResourceKind, Terrain};
