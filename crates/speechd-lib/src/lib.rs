//! speechd-lib — Speech worker engine.
//!
//! Protocol codec, synthesis adapter, playback driver, and the scheduler
//! that ties them into a single-utterance-at-a-time runtime. Depends on
//! speechd-core for pure types and text chunking.

pub mod config;
pub mod engine;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod scheduler;

// Re-export speechd-core for convenience
pub use speechd_core;
