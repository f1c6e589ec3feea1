//! Playback driver (C3) — backend selection, the mouth-sample tick loop,
//! and idempotent stop semantics.
//!
//! Device playback reuses the dedicated-thread `rodio` idiom from
//! `tts.rs::playback_thread` (the stream handle is `!Send`, so it must live
//! on its own OS thread and be driven via channels). Subprocess playback
//! reuses `manager.rs`'s spawn/stderr-drain/terminate-then-kill idiom,
//! grounded structurally but applied to stdin-fed PCM instead of a
//! long-lived sidecar server, per `playback.py`'s `aplay` path.

use std::io::Write as _;
use std::process::{Command as StdCommand, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use speechd_core::wav::{apply_fades, mouth_open_at, to_i16_pcm};
use tokio::sync::oneshot;

use crate::error::WorkerError;

const TICK: Duration = Duration::from_millis(40);
const FADE_IN_MS: f32 = 3.0;
const FADE_OUT_MS: f32 = 18.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Device,
    Subprocess,
    Silent,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Device => "device",
            Backend::Subprocess => "subprocess",
            Backend::Silent => "silent",
        }
    }

    pub fn has_audio_output(self) -> bool {
        matches!(self, Backend::Device | Backend::Subprocess)
    }

    /// Selection precedence: disallowed-local -> silent; device-available ->
    /// device; PATH-resolvable PCM player -> subprocess; else silent.
    pub fn select(allow_local: bool, device_available: bool, subprocess_tool: Option<&str>) -> Self {
        if !allow_local {
            return Backend::Silent;
        }
        if device_available {
            return Backend::Device;
        }
        if subprocess_tool.is_some() {
            return Backend::Subprocess;
        }
        Backend::Silent
    }
}

/// Looks for a PCM-consuming CLI tool on `PATH`. Mirrors
/// `manager.rs::resolve_sidecar`'s "search, then fall back" idiom, simplified
/// to a plain PATH scan since there is no bundled-sidecar convention here.
pub fn find_subprocess_tool(candidates: &[&str]) -> Option<String> {
    let path = std::env::var_os("PATH")?;
    for candidate in candidates {
        for dir in std::env::split_paths(&path) {
            let full = dir.join(candidate);
            if full.is_file() {
                return Some(candidate.to_string());
            }
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    Interrupted,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Completed => "completed",
            StopReason::Interrupted => "interrupted",
        }
    }
}

enum DeviceCmd {
    Play(Vec<i16>, u32),
    Stop,
}

/// Dedicated-thread device sink. `rodio::OutputStream` is `!Send`, so the
/// stream and sink live entirely on the worker thread; this handle only
/// holds a channel, mirroring `tts.rs`'s playback-thread split.
pub struct DeviceSink {
    tx: mpsc::Sender<DeviceCmd>,
}

impl DeviceSink {
    pub fn spawn() -> Option<Self> {
        let (tx, rx) = mpsc::channel::<DeviceCmd>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<bool>();

        std::thread::spawn(move || {
            let (_stream, handle) = match rodio::OutputStream::try_default() {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!("no audio output device: {e}");
                    let _ = ready_tx.send(false);
                    return;
                }
            };
            let sink = match rodio::Sink::try_new(&handle) {
                Ok(sink) => sink,
                Err(e) => {
                    tracing::warn!("failed to build audio sink: {e}");
                    let _ = ready_tx.send(false);
                    return;
                }
            };
            let _ = ready_tx.send(true);

            for cmd in rx {
                match cmd {
                    DeviceCmd::Play(samples, rate) => {
                        let source = rodio::buffer::SamplesBuffer::new(1, rate, samples);
                        sink.append(source);
                    }
                    DeviceCmd::Stop => sink.stop(),
                }
            }
        });

        match ready_rx.recv() {
            Ok(true) => Some(Self { tx }),
            _ => None,
        }
    }

    fn play(&self, samples: Vec<i16>, sample_rate: u32) {
        let _ = self.tx.send(DeviceCmd::Play(samples, sample_rate));
    }

    fn stop(&self) {
        let _ = self.tx.send(DeviceCmd::Stop);
    }
}

/// Feeds a spawned subprocess's stdin from a worker thread and waits for it
/// to exit, signalling completion through a oneshot channel so the async
/// tick loop can await it without blocking the event loop.
struct SubprocessPlayback {
    child: std::process::Child,
    feeder: Option<std::thread::JoinHandle<()>>,
}

impl SubprocessPlayback {
    fn spawn(tool: &str, samples: &[i16], sample_rate: u32) -> Result<Self, WorkerError> {
        let mut child = StdCommand::new(tool)
            .args(raw_pcm_args(tool, sample_rate))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WorkerError::Playback(format!("failed to start {tool}: {e}")))?;

        if let Some(stderr) = child.stderr.take() {
            std::thread::spawn(move || {
                crate::engine::drain_to_stderr(stderr);
            });
        }

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Playback(format!("{tool} did not expose stdin")))?;
        let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let feeder = std::thread::spawn(move || {
            let _ = stdin.write_all(&pcm);
        });

        Ok(Self {
            child,
            feeder: Some(feeder),
        })
    }

    fn stop(&mut self) {
        let _ = self.child.kill();
        self.join();
    }

    /// Called after `terminate` + a 500ms grace period in the tick loop's
    /// `should_stop` path; here we just always kill-then-join since the std
    /// `Child` API has no graceful terminate on all platforms.
    fn join(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.join();
        }
        let _ = self.child.wait();
    }
}

fn raw_pcm_args(tool: &str, sample_rate: u32) -> Vec<String> {
    // aplay-style raw PCM flags: signed 16-bit little-endian mono at the
    // synthesized sample rate.
    if tool.ends_with("aplay") {
        vec![
            "-q".to_string(),
            "-f".to_string(),
            "S16_LE".to_string(),
            "-c".to_string(),
            "1".to_string(),
            "-r".to_string(),
            sample_rate.to_string(),
        ]
    } else {
        vec![
            "-r".to_string(),
            sample_rate.to_string(),
            "-c".to_string(),
            "1".to_string(),
        ]
    }
}

/// Playback driver (C3). One instance per worker process; reused across
/// utterances. `stop()` is idempotent and swallows its own errors so a
/// failed stop never poisons the next `play()`.
pub struct PlaybackDriver {
    backend: Backend,
    device: Option<DeviceSink>,
    subprocess_tool: Option<String>,
    active: std::sync::Mutex<Option<ActiveSinkHandle>>,
}

enum ActiveSinkHandle {
    Subprocess(SubprocessPlayback),
}

impl PlaybackDriver {
    pub fn new(backend: Backend, device: Option<DeviceSink>, subprocess_tool: Option<String>) -> Self {
        Self {
            backend,
            device,
            subprocess_tool,
            active: std::sync::Mutex::new(None),
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Idempotent, error-swallowing stop. Safe with no playback active.
    pub fn stop(&self) {
        match self.backend {
            Backend::Device => {
                if let Some(device) = &self.device {
                    device.stop();
                }
            }
            Backend::Subprocess => {
                if let Some(handle) = self.active.lock().unwrap().take() {
                    let ActiveSinkHandle::Subprocess(mut proc) = handle;
                    proc.stop();
                }
            }
            Backend::Silent => {}
        }
    }

    /// `play(samples, sample_rate, on_mouth, should_stop) -> reason`.
    /// `on_mouth` and `should_stop` are polled once per 40ms tick. The
    /// terminal `mouth(0.0)` frame is the caller's responsibility — it must
    /// be written only after the `play_stop` event the caller emits from the
    /// returned reason, so this method does not emit one itself.
    pub async fn play<M, S>(
        &self,
        samples: &[f32],
        sample_rate: u32,
        mut on_mouth: M,
        mut should_stop: S,
    ) -> StopReason
    where
        M: FnMut(f32) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>,
        S: FnMut() -> bool,
    {
        let faded = apply_fades(samples, sample_rate, FADE_IN_MS, FADE_OUT_MS);

        if faded.is_empty() {
            return StopReason::Completed;
        }

        let duration = Duration::from_secs_f64(faded.len() as f64 / sample_rate as f64);
        self.start(&faded, sample_rate);

        let start = Instant::now();
        loop {
            if should_stop() {
                self.stop();
                return StopReason::Interrupted;
            }

            let elapsed = start.elapsed();
            if elapsed >= duration {
                break;
            }

            let mouth = mouth_open_at(&faded, sample_rate, elapsed.as_secs_f64());
            on_mouth(mouth).await;

            tokio::time::sleep(TICK).await;
        }

        self.wait_for_drain().await;
        StopReason::Completed
    }

    fn start(&self, faded: &[f32], sample_rate: u32) {
        match self.backend {
            Backend::Device => {
                if let Some(device) = &self.device {
                    device.play(to_i16_pcm(faded), sample_rate);
                }
            }
            Backend::Subprocess => {
                if let Some(tool) = &self.subprocess_tool {
                    match SubprocessPlayback::spawn(tool, &to_i16_pcm(faded), sample_rate) {
                        Ok(proc) => {
                            *self.active.lock().unwrap() = Some(ActiveSinkHandle::Subprocess(proc));
                        }
                        Err(e) => tracing::warn!("subprocess playback failed to start: {e}"),
                    }
                }
            }
            Backend::Silent => {}
        }
    }

    async fn wait_for_drain(&self) {
        match self.backend {
            Backend::Subprocess => {
                let handle = self.active.lock().unwrap().take();
                if let Some(ActiveSinkHandle::Subprocess(mut proc)) = handle {
                    let (tx, rx) = oneshot::channel();
                    std::thread::spawn(move || {
                        proc.join();
                        let _ = tx.send(());
                    });
                    let _ = rx.await;
                }
            }
            Backend::Device | Backend::Silent => {
                // The device sink's queue already blocks `append` only on
                // buffer space, not completion; for mouth-sync purposes the
                // tick loop above already tracked wall-clock duration, so
                // there is nothing further to await here.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_prefers_silent_when_local_disallowed() {
        assert_eq!(Backend::select(false, true, Some("aplay")), Backend::Silent);
    }

    #[test]
    fn select_prefers_device_over_subprocess() {
        assert_eq!(Backend::select(true, true, Some("aplay")), Backend::Device);
    }

    #[test]
    fn select_falls_back_to_subprocess() {
        assert_eq!(Backend::select(true, false, Some("aplay")), Backend::Subprocess);
    }

    #[test]
    fn select_falls_back_to_silent() {
        assert_eq!(Backend::select(true, false, None), Backend::Silent);
    }

    #[test]
    fn has_audio_output_is_true_only_for_device_and_subprocess() {
        assert!(Backend::Device.has_audio_output());
        assert!(Backend::Subprocess.has_audio_output());
        assert!(!Backend::Silent.has_audio_output());
    }

    #[tokio::test]
    async fn play_empty_buffer_short_circuits() {
        let driver = PlaybackDriver::new(Backend::Silent, None, None);
        let mouth_values = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let values = mouth_values.clone();
        let reason = driver
            .play(
                &[],
                24000,
                move |v| {
                    values.lock().unwrap().push(v);
                    Box::pin(async {})
                },
                || false,
            )
            .await;
        assert_eq!(reason, StopReason::Completed);
        // Empty buffers never start a tick loop, so no mouth value is
        // produced here — the caller is responsible for the terminal zero.
        assert!(mouth_values.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn play_silent_backend_completes_and_emits_mouth_samples() {
        let driver = PlaybackDriver::new(Backend::Silent, None, None);
        let samples = vec![0.2f32; 2400]; // 100ms at 24kHz
        let mouth_values = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let values = mouth_values.clone();
        let reason = driver
            .play(
                &samples,
                24000,
                move |v| {
                    values.lock().unwrap().push(v);
                    Box::pin(async {})
                },
                || false,
            )
            .await;
        assert_eq!(reason, StopReason::Completed);
        assert!(!mouth_values.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn play_stops_when_should_stop_is_true() {
        let driver = PlaybackDriver::new(Backend::Silent, None, None);
        let samples = vec![0.2f32; 240_000]; // 10s — long enough to observe the stop
        let reason = driver
            .play(&samples, 24000, |_| Box::pin(async {}), || true)
            .await;
        assert_eq!(reason, StopReason::Interrupted);
    }
}
