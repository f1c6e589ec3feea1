//! Shared types for the speechd worker.
//!
//! Kept dependency-light so downstream consumers (the scheduler, the CLI)
//! can depend on the domain model without pulling in tokio or rodio.

use std::path::PathBuf;

// ─── Audio target ──────────────────────────────────────────────────────────

/// Scope of audio delivery: local playback device, remote (browser) frame,
/// or both. Configured once at startup from `MH_AUDIO_TARGET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioTarget {
    Local,
    Browser,
    Both,
}

impl AudioTarget {
    pub fn allows_local_playback(self) -> bool {
        matches!(self, AudioTarget::Local | AudioTarget::Both)
    }

    pub fn allows_browser_audio(self) -> bool {
        matches!(self, AudioTarget::Browser | AudioTarget::Both)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AudioTarget::Local => "local",
            AudioTarget::Browser => "browser",
            AudioTarget::Both => "both",
        }
    }

    /// Parse `MH_AUDIO_TARGET`, case-insensitively. Any value other than
    /// `local`/`browser`/`both` is rejected — an unrecognized target is a
    /// startup failure, not a silent fallback.
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_lowercase().as_str() {
            "local" => Ok(AudioTarget::Local),
            "browser" => Ok(AudioTarget::Browser),
            "both" => Ok(AudioTarget::Both),
            other => Err(format!(
                "unsupported MH_AUDIO_TARGET: {other} (expected local|browser|both)"
            )),
        }
    }
}

impl Default for AudioTarget {
    fn default() -> Self {
        AudioTarget::Local
    }
}

// ─── Model paths ───────────────────────────────────────────────────────────

/// Resolved filesystem locations of the Kokoro model and voices files.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub model_path: PathBuf,
    pub voices_path: PathBuf,
}

// ─── Speak request ─────────────────────────────────────────────────────────

/// Default synthesis TTL when a `speak` command supplies neither
/// `expires_at` nor both `ts` and `ttl_ms`.
pub const DEFAULT_TTL_MS: i64 = 4_000;

/// Immutable record derived from a validated `speak` command. Lives for the
/// duration of its utterance task, then is dropped.
#[derive(Debug, Clone)]
pub struct SpeakRequest {
    pub request_id: Option<String>,
    pub generation: i64,
    pub session_id: String,
    pub utterance_id: String,
    pub text: String,
    pub expires_at: i64,
    pub message_id: Option<String>,
    pub revision: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_target_parses_case_insensitively() {
        assert_eq!(AudioTarget::parse("Local").unwrap(), AudioTarget::Local);
        assert_eq!(AudioTarget::parse("BROWSER").unwrap(), AudioTarget::Browser);
        assert_eq!(AudioTarget::parse("both").unwrap(), AudioTarget::Both);
    }

    #[test]
    fn audio_target_rejects_unknown_value() {
        assert!(AudioTarget::parse("remote").is_err());
    }

    #[test]
    fn audio_target_default_is_local() {
        assert_eq!(AudioTarget::default(), AudioTarget::Local);
    }

    #[test]
    fn audio_target_capability_flags() {
        assert!(AudioTarget::Local.allows_local_playback());
        assert!(!AudioTarget::Local.allows_browser_audio());
        assert!(!AudioTarget::Browser.allows_local_playback());
        assert!(AudioTarget::Browser.allows_browser_audio());
        assert!(AudioTarget::Both.allows_local_playback());
        assert!(AudioTarget::Both.allows_browser_audio());
    }
}
