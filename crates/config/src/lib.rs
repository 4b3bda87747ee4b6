//! Configuration for EZ ffmpeg
//!
//! Persisted settings (TOML with environment overrides), presets, and the
//! validated per-run processing snapshot.

pub mod config;
pub mod processing;

pub use config::*;
pub use processing::*;
