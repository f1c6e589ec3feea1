//! Newline-delimited JSON protocol — command parsing and frame writing.
//!
//! Grounded on `nayru-lib/server.rs`'s "one struct per request/response"
//! shape, generalized from axum JSON bodies to framed stdout lines (the
//! Python original's `protocol.py` gives the exact frame contract this
//! module reproduces). `serde_json`'s default serializer never escapes
//! non-ASCII code points, so text/phoneme content round-trips as UTF-8.

use serde_json::{json, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::WorkerError;

/// A parsed input line. `raw` retains the full JSON object so callers can
/// pull out op-specific fields without a separate struct per op.
#[derive(Debug, Clone)]
pub struct ParsedCommand {
    pub raw: Value,
    pub op: String,
    pub request_id: Option<String>,
}

/// Parse one input line into a command. Propagated to the caller as an
/// `error` frame (malformed JSON) rather than terminating the worker.
pub fn parse_command(line: &str) -> Result<ParsedCommand, WorkerError> {
    let raw: Value = serde_json::from_str(line)
        .map_err(|e| WorkerError::Protocol(format!("invalid json command: {e}")))?;

    let Value::Object(_) = &raw else {
        return Err(WorkerError::Protocol(
            "command must be a JSON object".to_string(),
        ));
    };

    let op = raw
        .get("op")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| WorkerError::Protocol("command op must be a non-empty string".to_string()))?
        .to_string();

    let request_id = match raw.get("id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            return Err(WorkerError::Protocol(
                "command id must be a string when provided".to_string(),
            ))
        }
    };

    Ok(ParsedCommand { raw, op, request_id })
}

/// Serializes every outgoing frame under a single mutex so concurrent
/// emitters (the command loop, the playback tick loop, error paths) never
/// interleave lines on stdout.
pub struct Writer<W> {
    inner: Mutex<W>,
}

impl<W: AsyncWrite + Unpin> Writer<W> {
    pub fn new(sink: W) -> Self {
        Self {
            inner: Mutex::new(sink),
        }
    }

    async fn send(&self, payload: Value) {
        let line = match serde_json::to_string(&payload) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("failed to serialize frame: {e}");
                return;
            }
        };
        let mut guard = self.inner.lock().await;
        if let Err(e) = guard.write_all(line.as_bytes()).await {
            tracing::error!("stdout write failed: {e}");
            return;
        }
        if let Err(e) = guard.write_all(b"\n").await {
            tracing::error!("stdout write failed: {e}");
            return;
        }
        if let Err(e) = guard.flush().await {
            tracing::error!("stdout flush failed: {e}");
        }
    }

    pub async fn ready(
        &self,
        voice: &str,
        engine: &str,
        model_path: &str,
        voices_path: &str,
        playback_backend: Option<&str>,
        audio_target: &str,
    ) {
        let mut payload = json!({
            "type": "ready",
            "voice": voice,
            "engine": engine,
            "model_path": model_path,
            "voices_path": voices_path,
            "audio_target": audio_target,
        });
        if let Some(backend) = playback_backend {
            payload["playback_backend"] = json!(backend);
        }
        self.send(payload).await;
    }

    pub async fn response(&self, id: Option<&str>, ok: bool, result: Option<Value>, error: Option<&str>) {
        let mut payload = json!({
            "type": "response",
            "id": id,
            "ok": ok,
        });
        if let Some(result) = result {
            payload["result"] = result;
        }
        if let Some(error) = error {
            payload["error"] = json!(error);
        }
        self.send(payload).await;
    }

    pub async fn event(
        &self,
        phase: &str,
        generation: Option<i64>,
        session_id: Option<&str>,
        utterance_id: Option<&str>,
        reason: Option<&str>,
        extra: Option<Value>,
    ) {
        let mut payload = json!({
            "type": "event",
            "phase": phase,
            "generation": generation,
            "session_id": session_id,
            "utterance_id": utterance_id,
        });
        if let Some(reason) = reason {
            payload["reason"] = json!(reason);
        }
        if let Some(Value::Object(map)) = extra {
            let obj = payload.as_object_mut().expect("payload is an object");
            for (k, v) in map {
                obj.insert(k, v);
            }
        }
        self.send(payload).await;
    }

    pub async fn mouth(
        &self,
        generation: Option<i64>,
        session_id: Option<&str>,
        utterance_id: Option<&str>,
        open: f32,
    ) {
        let clamped = open.clamp(0.0, 1.0);
        self.send(json!({
            "type": "mouth",
            "generation": generation,
            "session_id": session_id,
            "utterance_id": utterance_id,
            "open": clamped,
        }))
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn audio(
        &self,
        generation: i64,
        session_id: &str,
        utterance_id: &str,
        mime_type: &str,
        audio_base64: &str,
        sample_rate: u32,
        message_id: Option<&str>,
        revision: Option<i64>,
    ) {
        let mut payload = json!({
            "type": "audio",
            "generation": generation,
            "session_id": session_id,
            "utterance_id": utterance_id,
            "mime_type": mime_type,
            "audio_base64": audio_base64,
            "sample_rate": sample_rate,
        });
        if let Some(message_id) = message_id {
            payload["message_id"] = json!(message_id);
        }
        if let Some(revision) = revision {
            payload["revision"] = json!(revision);
        }
        self.send(payload).await;
    }

    pub async fn error(&self, message: &str, op: Option<&str>, id: Option<&str>) {
        self.send(json!({
            "type": "error",
            "message": message,
            "op": op,
            "id": id,
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_command_requires_object() {
        assert!(parse_command("[1,2,3]").is_err());
    }

    #[test]
    fn parse_command_rejects_invalid_json() {
        assert!(parse_command("{not json").is_err());
    }

    #[test]
    fn parse_command_requires_non_empty_op() {
        assert!(parse_command(r#"{"op":""}"#).is_err());
        assert!(parse_command(r#"{"id":"x"}"#).is_err());
    }

    #[test]
    fn parse_command_trims_op() {
        let cmd = parse_command(r#"{"op":" ping "}"#).unwrap();
        assert_eq!(cmd.op, "ping");
    }

    #[test]
    fn parse_command_rejects_non_string_id() {
        assert!(parse_command(r#"{"op":"ping","id":5}"#).is_err());
    }

    #[test]
    fn parse_command_extracts_request_id() {
        let cmd = parse_command(r#"{"op":"ping","id":"r1"}"#).unwrap();
        assert_eq!(cmd.request_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn writer_emits_single_newline_terminated_line() {
        let buf: Vec<u8> = Vec::new();
        let writer = Writer::new(buf);
        writer.mouth(Some(1), Some("s"), Some("u"), 0.5).await;
        let inner = writer.inner.into_inner();
        let text = String::from_utf8(inner).unwrap();
        assert_eq!(text.matches('\n').count(), 1);
        assert!(text.ends_with('\n'));
        let value: Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(value["type"], "mouth");
        assert_eq!(value["open"], 0.5);
    }

    #[tokio::test]
    async fn writer_clamps_mouth_open() {
        let buf: Vec<u8> = Vec::new();
        let writer = Writer::new(buf);
        writer.mouth(Some(1), Some("s"), Some("u"), 5.0).await;
        let inner = writer.inner.into_inner();
        let text = String::from_utf8(inner).unwrap();
        let value: Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(value["open"], 1.0);
    }

    #[tokio::test]
    async fn writer_preserves_unicode_in_event_extra() {
        let buf: Vec<u8> = Vec::new();
        let writer = Writer::new(buf);
        writer
            .event(
                "error",
                None,
                None,
                None,
                Some("\u{3053}\u{3093}\u{306b}\u{3061}\u{306f}"),
                None,
            )
            .await;
        let inner = writer.inner.into_inner();
        let text = String::from_utf8(inner).unwrap();
        assert!(text.contains("こんにちは"));
        assert!(!text.contains("\\u"));
    }
}
