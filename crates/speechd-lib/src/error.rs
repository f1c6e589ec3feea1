//! Worker error type.
//!
//! Never reaches for `anyhow`/`thiserror` — threads `Result<_, String>`
//! through with `.map_err(|e| format!("...: {e}"))`, the same way the
//! worker process this crate grew out of handled errors.
//! `WorkerError` keeps that dependency-free style (no derive macro, no new
//! crate) but gives call sites a typed seam between "this command failed
//! validation", "startup failed", and "this stage failed" without
//! inventing a string taxonomy at each call site.

use std::fmt;

#[derive(Debug)]
pub enum WorkerError {
    /// Model files missing, engine/G2P construction failure, bad env config.
    Startup(String),
    /// Malformed input line or structurally invalid command.
    Protocol(String),
    /// A `speak` command failed field validation.
    Validation(String),
    /// Synthesis backend returned an error.
    Synthesis(String),
    /// WAV/base64 encoding for the browser-audio frame failed.
    Encoding(String),
    /// Playback backend failed to start, tick, or drain.
    Playback(String),
}

impl WorkerError {
    pub fn message(&self) -> &str {
        match self {
            WorkerError::Startup(m)
            | WorkerError::Protocol(m)
            | WorkerError::Validation(m)
            | WorkerError::Synthesis(m)
            | WorkerError::Encoding(m)
            | WorkerError::Playback(m) => m,
        }
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for WorkerError {}
