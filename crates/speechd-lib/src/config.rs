//! Startup configuration — environment variable resolution.
//!
//! Grounded on `kokoro_engine.py::resolve_model_paths` (env var with a
//! relative-path fallback): a small helper plus a `from_env` constructor,
//! the way `nayru-core::types::TtsConfig::default` centralizes its own
//! defaults.

use std::path::PathBuf;

use speechd_core::types::{AudioTarget, ModelPaths};

use crate::error::WorkerError;

const DEFAULT_MODEL_PATH: &str = "./assets/kokoro/kokoro-v1.0.onnx";
const DEFAULT_VOICES_PATH: &str = "./assets/kokoro/voices-v1.0.bin";
const DEFAULT_VOICE: &str = "af_heart";

/// Everything the worker needs at startup, resolved once from the process
/// environment.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub model_paths: ModelPaths,
    pub voice: String,
    pub audio_target: AudioTarget,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, WorkerError> {
        let model_path = env_or_default("MH_KOKORO_MODEL", DEFAULT_MODEL_PATH);
        let voices_path = env_or_default("MH_KOKORO_VOICES", DEFAULT_VOICES_PATH);

        let audio_target = match std::env::var("MH_AUDIO_TARGET") {
            Ok(raw) if !raw.trim().is_empty() => {
                AudioTarget::parse(&raw).map_err(WorkerError::Startup)?
            }
            _ => AudioTarget::default(),
        };

        Ok(Self {
            model_paths: ModelPaths {
                model_path: PathBuf::from(model_path),
                voices_path: PathBuf::from(voices_path),
            },
            voice: DEFAULT_VOICE.to_string(),
            audio_target,
        })
    }

    /// Verify both model files exist before constructing the synthesis
    /// engine. Ported from `kokoro_engine.py::verify_model_files`.
    pub fn verify_model_files(&self) -> Result<(), WorkerError> {
        if !self.model_paths.model_path.is_file() {
            return Err(WorkerError::Startup(format!(
                "missing model file: {}",
                self.model_paths.model_path.display()
            )));
        }
        if !self.model_paths.voices_path.is_file() {
            return Err(WorkerError::Startup(format!(
                "missing voices file: {}",
                self.model_paths.voices_path.display()
            )));
        }
        Ok(())
    }
}

fn env_or_default(name: &str, fallback: &str) -> String {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => fallback.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_default_falls_back_when_unset() {
        std::env::remove_var("SPEECHD_TEST_VAR_UNSET");
        assert_eq!(
            env_or_default("SPEECHD_TEST_VAR_UNSET", "fallback"),
            "fallback"
        );
    }

    #[test]
    fn env_or_default_falls_back_when_empty() {
        std::env::set_var("SPEECHD_TEST_VAR_EMPTY", "  ");
        assert_eq!(
            env_or_default("SPEECHD_TEST_VAR_EMPTY", "fallback"),
            "fallback"
        );
        std::env::remove_var("SPEECHD_TEST_VAR_EMPTY");
    }

    #[test]
    fn env_or_default_uses_value_when_set() {
        std::env::set_var("SPEECHD_TEST_VAR_SET", "/custom/path");
        assert_eq!(
            env_or_default("SPEECHD_TEST_VAR_SET", "fallback"),
            "/custom/path"
        );
        std::env::remove_var("SPEECHD_TEST_VAR_SET");
    }

    #[test]
    fn verify_model_files_reports_missing_model() {
        let config = WorkerConfig {
            model_paths: ModelPaths {
                model_path: PathBuf::from("/nonexistent/model.onnx"),
                voices_path: PathBuf::from("/nonexistent/voices.bin"),
            },
            voice: DEFAULT_VOICE.to_string(),
            audio_target: AudioTarget::Local,
        };
        let err = config.verify_model_files().unwrap_err();
        assert!(err.message().contains("missing model file"));
    }
}
