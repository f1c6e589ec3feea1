//! speechd CLI — long-running TTS worker process.
//!
//! Reads newline-delimited JSON commands on stdin and writes
//! newline-delimited JSON frames to stdout until `shutdown` or EOF.
//!
//! ```text
//! speechd [--smoke]
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use speechd_lib::config::WorkerConfig;
use speechd_lib::engine::{EspeakG2p, KokoroBackend, SynthesizeText, Synthesizer};
use speechd_lib::playback::{Backend, DeviceSink, PlaybackDriver};
use speechd_lib::protocol::Writer;
use speechd_lib::scheduler::{self, Collaborators};

/// PATH-resolvable raw-PCM players tried, in order, when no output device
/// is available (mirrors `playback.py`'s `aplay` fallback).
const PCM_TOOL_CANDIDATES: &[&str] = &["aplay", "paplay", "sox"];

/// speechd — newline-delimited-JSON speech synthesis worker
#[derive(Parser)]
#[command(name = "speechd", version, about)]
struct Cli {
    /// Verify startup (model files, synthesizer, playback backend) and
    /// emit the `ready` frame, then exit without reading stdin.
    #[arg(long)]
    smoke: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("startup failed: {}", e.message());
            return ExitCode::from(2);
        }
    };

    let backend = match KokoroBackend::new(&config) {
        Ok(backend) => backend,
        Err(e) => {
            eprintln!("startup failed: {}", e.message());
            return ExitCode::from(2);
        }
    };

    let synth: Arc<dyn SynthesizeText> = Arc::new(Synthesizer::new(backend, EspeakG2p::new()));

    let device = if config.audio_target.allows_local_playback() {
        DeviceSink::spawn()
    } else {
        None
    };
    let subprocess_tool = if device.is_none() && config.audio_target.allows_local_playback() {
        speechd_lib::playback::find_subprocess_tool(PCM_TOOL_CANDIDATES)
    } else {
        None
    };
    let playback_backend = Backend::select(
        config.audio_target.allows_local_playback(),
        device.is_some(),
        subprocess_tool.as_deref(),
    );
    let playback = Arc::new(PlaybackDriver::new(playback_backend, device, subprocess_tool));

    let stdout = tokio::io::stdout();
    let writer = Arc::new(Writer::new(stdout));

    writer
        .ready(
            &config.voice,
            "kokoro",
            &config.model_paths.model_path.display().to_string(),
            &config.model_paths.voices_path.display().to_string(),
            playback_backend.has_audio_output().then(|| playback_backend.as_str()),
            config.audio_target.as_str(),
        )
        .await;

    if cli.smoke {
        return ExitCode::SUCCESS;
    }

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let collaborators = Collaborators {
        synth,
        playback,
        writer,
    };

    scheduler::run(stdin, collaborators, config.audio_target).await;

    ExitCode::SUCCESS
}
