//! speechd-core — Pure types, text chunking, and WAV/PCM math.
//!
//! No async runtime, no I/O, no platform dependencies.

pub mod chunking;
pub mod types;
pub mod wav;
