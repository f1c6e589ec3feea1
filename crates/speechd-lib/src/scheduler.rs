//! Scheduler/runtime (C5) — the command loop and the utterance phase
//! machine.
//!
//! Generalizes `tts.rs`'s `Cmd`/`AtomicU64`-epoch single-flight design: the
//! epoch becomes `latest_generation`, and `TtsEngine::stop`'s
//! bump-then-signal pattern becomes a per-utterance `CancellationToken`
//! (the "cancellable task abstraction" the design notes ask for) composed
//! with the generation/TTL freshness checks. The scheduler never calls
//! `JoinHandle::abort()` — cancelling a task means flipping its token and
//! `await`-ing it to completion, so it always runs its own finalization.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use speechd_core::types::{AudioTarget, SpeakRequest, DEFAULT_TTL_MS};
use speechd_core::wav::encode_wav_base64;

use crate::engine::SynthesizeText;
use crate::playback::PlaybackDriver;
use crate::protocol::{parse_command, ParsedCommand, Writer};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A fully-wired in-flight utterance: the handle the scheduler awaits on
/// cancellation or natural completion, plus enough identity to log about it.
struct CurrentUtterance {
    generation: i64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Process-wide runtime state. Mutated only from the event loop task; the
/// utterance task never touches it directly — it only reads
/// `latest_generation` (shared via `Arc<AtomicI64>`) and its own token.
pub struct RuntimeState {
    latest_generation: Arc<AtomicI64>,
    current: Option<CurrentUtterance>,
    shutdown_requested: bool,
    audio_target: AudioTarget,
}

impl RuntimeState {
    pub fn new(audio_target: AudioTarget) -> Self {
        Self {
            latest_generation: Arc::new(AtomicI64::new(i64::MIN)),
            current: None,
            shutdown_requested: false,
            audio_target,
        }
    }

    /// Cancels and awaits the in-flight task, if any, swallowing whatever it
    /// returns (finalization is the task's own responsibility; its join
    /// result carries nothing the scheduler needs). Stops playback
    /// synchronously before awaiting the task so audio cuts off immediately
    /// rather than waiting for the task's tick loop to next poll its
    /// cancellation token.
    async fn cancel_current(&mut self, playback: &PlaybackDriver) {
        if let Some(current) = self.current.take() {
            current.cancel.cancel();
            playback.stop();
            let _ = current.handle.await;
        }
    }
}

type MouthFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Everything the utterance task needs, grouped so `speak` handling doesn't
/// pass a dozen loose arguments.
pub struct Collaborators<W> {
    pub synth: Arc<dyn SynthesizeText>,
    pub playback: Arc<PlaybackDriver>,
    pub writer: Arc<Writer<W>>,
}

/// Runs the command loop until `shutdown` (explicit or EOF-derived).
/// Resolving model paths, constructing the synthesizer/driver, and emitting
/// the initial `ready` frame all happen in the caller (`speechd-cli::main`);
/// this function only takes over once the worker is ready to accept lines.
pub async fn run<R, W>(reader: R, collaborators: Collaborators<W>, audio_target: AudioTarget)
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Option<String>>(64);
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(Some(line)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    // EOF on stdin is treated as an implicit shutdown request.
                    let _ = tx.send(None).await;
                    break;
                }
                Err(e) => {
                    tracing::warn!("stdin read error: {e}");
                    let _ = tx.send(None).await;
                    break;
                }
            }
        }
    });

    let mut state = RuntimeState::new(audio_target);

    loop {
        // Pull `current` out of `state` for the duration of the select so
        // the natural-completion branch's mutable borrow of the join
        // handle never overlaps with the command branch's need for
        // `&mut state` — the two borrows are now on disjoint variables.
        let mut current = state.current.take();

        let completion = async {
            match &mut current {
                Some(c) => (&mut c.handle).await,
                None => std::future::pending().await,
            }
        };
        let has_current = current.is_some();

        tokio::select! {
            biased;

            line = rx.recv() => {
                state.current = current;
                let Some(line) = line else { break };
                match line {
                    None => {
                        handle_shutdown_line(&mut state, &collaborators, None).await;
                        if state.shutdown_requested {
                            break;
                        }
                    }
                    Some(line) => {
                        if !dispatch_line(&line, &mut state, &collaborators).await {
                            break;
                        }
                    }
                }
            }

            _ = completion, if has_current => {
                // Natural completion: the utterance task already ran its
                // own finalization (play_stop/dropped/error + mouth(0.0));
                // `current` (the finished task) is simply dropped here,
                // leaving `state.current` at None.
                if let Some(c) = &current {
                    tracing::debug!(generation = c.generation, "utterance task finished");
                }
            }
        }
    }
}

/// Parses and dispatches one input line. Returns `false` if the worker
/// should stop reading further commands (post-shutdown).
async fn dispatch_line<W>(line: &str, state: &mut RuntimeState, collaborators: &Collaborators<W>) -> bool
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return true;
    }

    let cmd = match parse_command(trimmed) {
        Ok(cmd) => cmd,
        Err(e) => {
            collaborators.writer.error(e.message(), None, None).await;
            return true;
        }
    };

    match cmd.op.as_str() {
        "ping" => {
            handle_ping(state, &collaborators.writer, cmd.request_id.as_deref()).await;
        }
        "shutdown" => {
            handle_shutdown_line(state, collaborators, cmd.request_id.as_deref()).await;
            return !state.shutdown_requested;
        }
        "interrupt" => {
            handle_interrupt(state, collaborators, cmd.request_id.as_deref()).await;
        }
        "speak" => {
            handle_speak(state, collaborators, cmd).await;
        }
        other => {
            collaborators
                .writer
                .response(
                    cmd.request_id.as_deref(),
                    false,
                    None,
                    Some(&format!("unknown op: {other}")),
                )
                .await;
        }
    }

    true
}

async fn handle_ping<W: AsyncWrite + Unpin>(state: &RuntimeState, writer: &Writer<W>, id: Option<&str>) {
    let latest = state.latest_generation.load(Ordering::SeqCst);
    writer
        .response(id, true, Some(json!({"ready": true, "latest_generation": latest})), None)
        .await;
}

async fn handle_shutdown_line<W>(state: &mut RuntimeState, collaborators: &Collaborators<W>, id: Option<&str>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    state.shutdown_requested = true;
    collaborators
        .writer
        .response(id, true, Some(json!({"shutdown": true})), None)
        .await;
    state.cancel_current(&collaborators.playback).await;
}

async fn handle_interrupt<W>(state: &mut RuntimeState, collaborators: &Collaborators<W>, id: Option<&str>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    state.cancel_current(&collaborators.playback).await;
    collaborators
        .writer
        .response(id, true, Some(json!({"interrupted": true})), None)
        .await;
}

/// Parses and validates a `speak` command's fields.
fn parse_speak_request(raw: &Value, request_id: Option<String>) -> Result<SpeakRequest, String> {
    let generation = raw
        .get("generation")
        .and_then(Value::as_i64)
        .ok_or_else(|| "generation must be an integer".to_string())?;

    let session_id = non_empty_string(raw, "session_id")?;
    let utterance_id = non_empty_string(raw, "utterance_id")?;
    let text = non_empty_string(raw, "text")?.trim().to_string();
    if text.is_empty() {
        return Err("text must be non-empty".to_string());
    }

    let expires_at = match raw.get("expires_at").and_then(Value::as_i64) {
        Some(v) => v,
        None => {
            let ts = raw.get("ts").and_then(Value::as_i64);
            let ttl_ms = raw.get("ttl_ms").and_then(Value::as_i64);
            match (ts, ttl_ms) {
                (Some(ts), Some(ttl_ms)) => ts + ttl_ms,
                _ => now_ms() + DEFAULT_TTL_MS,
            }
        }
    };

    let message_id = raw
        .get("message_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let revision = raw.get("revision").and_then(|v| {
        v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
    });

    Ok(SpeakRequest {
        request_id,
        generation,
        session_id,
        utterance_id,
        text,
        expires_at,
        message_id,
        revision,
    })
}

fn non_empty_string(raw: &Value, field: &str) -> Result<String, String> {
    let value = raw
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("{field} must be a non-empty string"))?;
    if value.trim().is_empty() {
        return Err(format!("{field} must be a non-empty string"));
    }
    Ok(value.to_string())
}

async fn handle_speak<W>(state: &mut RuntimeState, collaborators: &Collaborators<W>, cmd: ParsedCommand)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer = &collaborators.writer;

    let request = match parse_speak_request(&cmd.raw, cmd.request_id.clone()) {
        Ok(request) => request,
        Err(reason) => {
            writer
                .response(cmd.request_id.as_deref(), false, None, Some(&reason))
                .await;
            writer
                .event("error", None, None, None, Some(&reason), None)
                .await;
            return;
        }
    };

    // A generation older than the latest accepted one is dropped on sight,
    // but the response still reports accepted:true — acceptance just means
    // "this was understood as a valid command", not "this will play".
    let latest = state.latest_generation.load(Ordering::SeqCst);
    if request.generation < latest {
        writer
            .event(
                "dropped",
                Some(request.generation),
                Some(&request.session_id),
                Some(&request.utterance_id),
                Some("stale_generation"),
                None,
            )
            .await;
        writer
            .response(
                request.request_id.as_deref(),
                true,
                Some(json!({"accepted": true, "generation": request.generation})),
                None,
            )
            .await;
        return;
    }

    state.latest_generation.store(request.generation, Ordering::SeqCst);
    state.cancel_current(&collaborators.playback).await;

    let cancel = CancellationToken::new();
    let generation = request.generation;
    let audio_target = state.audio_target;
    let synth = collaborators.synth.clone();
    let playback = collaborators.playback.clone();
    let writer_for_task = collaborators.writer.clone();
    let latest_generation = state.latest_generation.clone();
    let task_cancel = cancel.clone();

    let handle = tokio::spawn(async move {
        run_utterance(
            request,
            task_cancel,
            latest_generation,
            synth,
            playback,
            writer_for_task,
            audio_target,
        )
        .await;
    });

    state.current = Some(CurrentUtterance {
        generation,
        cancel,
        handle,
    });

    writer
        .response(
            cmd.request_id.as_deref(),
            true,
            Some(json!({"accepted": true, "generation": generation})),
            None,
        )
        .await;
}

/// The utterance phase machine: expiry/staleness gates, synthesis, optional
/// browser audio encoding, then playback. Never touches `RuntimeState`
/// directly — it only reads `latest_generation` and its own cancellation
/// token, both handed in by value/clone.
async fn run_utterance<W>(
    request: SpeakRequest,
    cancel: CancellationToken,
    latest_generation: Arc<AtomicI64>,
    synth: Arc<dyn SynthesizeText>,
    playback: Arc<PlaybackDriver>,
    writer: Arc<Writer<W>>,
    audio_target: AudioTarget,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let is_stale = || latest_generation.load(Ordering::SeqCst) != request.generation;
    let is_expired = || now_ms() > request.expires_at;

    let gen = Some(request.generation);
    let sess = request.session_id.as_str();
    let utt = request.utterance_id.as_str();

    // Dropped before synthesis ever starts if it's already past its TTL.
    if is_expired() {
        writer
            .event("dropped", gen, Some(sess), Some(utt), Some("ttl_expired"), None)
            .await;
        return;
    }

    writer.event("synth_start", gen, Some(sess), Some(utt), None, None).await;

    let synth_clone = synth.clone();
    let text = request.text.clone();
    let synth_task = tokio::task::spawn_blocking(move || synth_clone.synthesize_text(&text));

    let synth_output = tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            playback.stop();
            writer.event("play_stop", gen, Some(sess), Some(utt), Some("interrupted"), None).await;
            writer.mouth(gen, Some(sess), Some(utt), 0.0).await;
            return;
        }

        result = synth_task => {
            match result {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    writer.event("error", gen, Some(sess), Some(utt), Some(e.message()), None).await;
                    writer.mouth(gen, Some(sess), Some(utt), 0.0).await;
                    return;
                }
                Err(join_err) => {
                    writer.event(
                        "error", gen, Some(sess), Some(utt),
                        Some(&format!("synthesis task panicked: {join_err}")), None,
                    ).await;
                    writer.mouth(gen, Some(sess), Some(utt), 0.0).await;
                    return;
                }
            }
        }
    };

    let (samples, sample_rate) = synth_output;

    // Re-check freshness: synthesis may have taken long enough that a newer
    // generation superseded this one, or the TTL lapsed, while it ran.
    if is_stale() {
        writer
            .event("dropped", gen, Some(sess), Some(utt), Some("stale_generation"), None)
            .await;
        writer.mouth(gen, Some(sess), Some(utt), 0.0).await;
        return;
    }
    if is_expired() {
        writer
            .event("dropped", gen, Some(sess), Some(utt), Some("ttl_expired"), None)
            .await;
        writer.mouth(gen, Some(sess), Some(utt), 0.0).await;
        return;
    }

    writer
        .event(
            "synth_done",
            gen,
            Some(sess),
            Some(utt),
            None,
            Some(json!({"sample_rate": sample_rate, "sample_count": samples.len()})),
        )
        .await;

    // Browser branch.
    if audio_target.allows_browser_audio() {
        let samples_for_encode = samples.clone();
        let encode_task =
            tokio::task::spawn_blocking(move || encode_wav_base64(&samples_for_encode, sample_rate));
        let encoded = match encode_task.await {
            Ok(encoded) => encoded,
            Err(join_err) => {
                writer
                    .event(
                        "error",
                        gen,
                        Some(sess),
                        Some(utt),
                        Some(&format!("browser_audio_encode_failed:{join_err}")),
                        None,
                    )
                    .await;
                writer.mouth(gen, Some(sess), Some(utt), 0.0).await;
                return;
            }
        };

        if is_stale() {
            writer
                .event("dropped", gen, Some(sess), Some(utt), Some("stale_generation"), None)
                .await;
            writer.mouth(gen, Some(sess), Some(utt), 0.0).await;
            return;
        }
        if is_expired() {
            writer
                .event("dropped", gen, Some(sess), Some(utt), Some("ttl_expired"), None)
                .await;
            writer.mouth(gen, Some(sess), Some(utt), 0.0).await;
            return;
        }

        writer
            .audio(
                request.generation,
                sess,
                utt,
                "audio/wav",
                &encoded,
                sample_rate,
                request.message_id.as_deref(),
                request.revision,
            )
            .await;
    }

    writer.event("play_start", gen, Some(sess), Some(utt), None, None).await;

    let writer_for_mouth = writer.clone();
    let sess_owned = request.session_id.clone();
    let utt_owned = request.utterance_id.clone();
    let generation = request.generation;
    let on_mouth = move |value: f32| -> MouthFuture {
        let writer = writer_for_mouth.clone();
        let sess = sess_owned.clone();
        let utt = utt_owned.clone();
        Box::pin(async move {
            writer.mouth(Some(generation), Some(&sess), Some(&utt), value).await;
        })
    };

    let should_stop = || cancel.is_cancelled() || is_stale() || is_expired();

    let reason = playback.play(&samples, sample_rate, on_mouth, should_stop).await;

    writer
        .event(
            "play_stop",
            gen,
            Some(sess),
            Some(utt),
            Some(reason.as_str()),
            None,
        )
        .await;
    writer.mouth(gen, Some(sess), Some(utt), 0.0).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_speak_request_requires_integer_generation() {
        let raw = json!({"session_id": "s", "utterance_id": "u", "text": "hi"});
        assert!(parse_speak_request(&raw, None).is_err());
    }

    #[test]
    fn parse_speak_request_trims_text() {
        let raw = json!({
            "generation": 1, "session_id": "s", "utterance_id": "u", "text": "  hi  ",
            "expires_at": now_ms() + 60_000,
        });
        let req = parse_speak_request(&raw, None).unwrap();
        assert_eq!(req.text, "hi");
    }

    #[test]
    fn parse_speak_request_rejects_empty_text() {
        let raw = json!({
            "generation": 1, "session_id": "s", "utterance_id": "u", "text": "   ",
        });
        assert!(parse_speak_request(&raw, None).is_err());
    }

    #[test]
    fn parse_speak_request_derives_expiry_from_ts_and_ttl() {
        let raw = json!({
            "generation": 1, "session_id": "s", "utterance_id": "u", "text": "hi",
            "ts": 1000, "ttl_ms": 500,
        });
        let req = parse_speak_request(&raw, None).unwrap();
        assert_eq!(req.expires_at, 1500);
    }

    #[test]
    fn parse_speak_request_defaults_expiry_when_absent() {
        let raw = json!({"generation": 1, "session_id": "s", "utterance_id": "u", "text": "hi"});
        let before = now_ms();
        let req = parse_speak_request(&raw, None).unwrap();
        assert!(req.expires_at >= before + DEFAULT_TTL_MS);
    }

    #[test]
    fn parse_speak_request_coerces_float_revision() {
        let raw = json!({
            "generation": 1, "session_id": "s", "utterance_id": "u", "text": "hi",
            "revision": 3.0,
        });
        let req = parse_speak_request(&raw, None).unwrap();
        assert_eq!(req.revision, Some(3));
    }

    #[test]
    fn parse_speak_request_rejects_empty_session_id() {
        let raw = json!({"generation": 1, "session_id": "", "utterance_id": "u", "text": "hi"});
        assert!(parse_speak_request(&raw, None).is_err());
    }

    #[test]
    fn parse_speak_request_rejects_whitespace_only_session_and_utterance_id() {
        let raw = json!({"generation": 1, "session_id": "   ", "utterance_id": "u", "text": "hi"});
        assert!(parse_speak_request(&raw, None).is_err());
        let raw = json!({"generation": 1, "session_id": "s", "utterance_id": "\t\n", "text": "hi"});
        assert!(parse_speak_request(&raw, None).is_err());
    }

    #[test]
    fn parse_speak_request_normalizes_blank_message_id_to_none() {
        let raw = json!({
            "generation": 1, "session_id": "s", "utterance_id": "u", "text": "hi",
            "message_id": "   ",
        });
        let req = parse_speak_request(&raw, None).unwrap();
        assert_eq!(req.message_id, None);
    }

    #[test]
    fn parse_speak_request_trims_message_id() {
        let raw = json!({
            "generation": 1, "session_id": "s", "utterance_id": "u", "text": "hi",
            "message_id": "  m1  ",
        });
        let req = parse_speak_request(&raw, None).unwrap();
        assert_eq!(req.message_id.as_deref(), Some("m1"));
    }
}
