//! Synthesizer adapter — chunking + G2P + the Kokoro backend, wired into a
//! single blocking `synthesize` call.
//!
//! Grounded on `kokoro_engine.py`'s `KokoroEngine.synthesize_text` /
//! `synthesize_chunks` / `_to_ja_phonemes`, translated into the trait seam
//! `tts.rs` uses for its own backend abstraction (its `FetchJob`/HTTP-call
//! split becomes `Grapheme2Phoneme`/`SynthBackend` here, since synthesis now
//! runs in-process instead of against a sidecar).

use std::io::Write as _;

use speechd_core::chunking::{split_text_chunks, TextChunk};

use crate::config::WorkerConfig;
use crate::error::WorkerError;

/// Sample rate used for the silence fallback when no chunk produces audio.
const SILENT_FALLBACK_SAMPLE_RATE: u32 = 24_000;

/// Converts a run of text into phonemes for a language the synthesis
/// backend cannot pronounce directly from graphemes.
///
/// Implementations that shell out to or link a chatty native library (as
/// `pyopenjtalk` does in the original) must redirect any stray stdout the
/// library writes to stderr — stdout is reserved for protocol frames.
pub trait Grapheme2Phoneme: Send + Sync {
    fn phonemize(&self, text: &str, lang: &str) -> Result<String, WorkerError>;
}

/// G2P backed by `espeak-rs`'s `text_to_phonemes`.
pub struct EspeakG2p {
    preserve_punctuation: bool,
    with_stress: bool,
}

impl EspeakG2p {
    pub fn new() -> Self {
        Self {
            preserve_punctuation: true,
            with_stress: true,
        }
    }

    /// `chunking::split_text_chunks` tags non-ASCII runs with the wire/spec
    /// language code `"j"`; espeak's own language table wants `"ja"`.
    fn espeak_lang(chunk_lang: &str) -> &str {
        match chunk_lang {
            "j" => "ja",
            other => other,
        }
    }
}

impl Default for EspeakG2p {
    fn default() -> Self {
        Self::new()
    }
}

impl Grapheme2Phoneme for EspeakG2p {
    fn phonemize(&self, text: &str, lang: &str) -> Result<String, WorkerError> {
        let espeak_lang = Self::espeak_lang(lang);
        // espeak-rs links libespeak-ng directly; it has no stdout chatter of
        // its own to redirect, unlike the pyopenjtalk CLI path this mirrors.
        let phonemes =
            espeak_rs::text_to_phonemes(text, espeak_lang, None, self.preserve_punctuation, self.with_stress)
                .map_err(|e| WorkerError::Synthesis(format!("g2p failed: {e:?}")))?;
        Ok(phonemes.join(""))
    }
}

/// One already-phonemized or plain-text chunk, ready for the synthesis
/// backend's `create` call.
pub struct SynthInput<'a> {
    pub text: &'a str,
    pub lang: &'a str,
    pub speed: f32,
    pub is_phonemes: bool,
}

/// Blocking `(text chunk) -> (samples, sample_rate)` backend. A trait seam
/// so the scheduler and tests don't depend on the concrete ONNX runtime.
pub trait SynthBackend: Send + Sync {
    fn create(&self, input: SynthInput<'_>) -> Result<(Vec<f32>, u32), WorkerError>;
}

/// In-process Kokoro ONNX backend. Wraps the `kokoro-tts` crate that
/// `Cargo.toml` already declared but that `tts.rs` never called directly —
/// it instead made an HTTP request to a sidecar process. `kokoro-tts` pulls
/// in `ort`/`ndarray` itself for the ONNX graph; this crate has no direct
/// use for either, so they aren't listed as its own dependencies.
pub struct KokoroBackend {
    model: kokoro_tts::Kokoro,
    voice: String,
}

impl KokoroBackend {
    /// Verifies both model files exist (ported from
    /// `kokoro_engine.py::verify_model_files`), then constructs the engine.
    pub fn new(config: &WorkerConfig) -> Result<Self, WorkerError> {
        config.verify_model_files()?;

        let model = kokoro_tts::Kokoro::new(
            &config.model_paths.model_path,
            &config.model_paths.voices_path,
        )
        .map_err(|e| WorkerError::Startup(format!("failed to load kokoro model: {e}")))?;

        Ok(Self {
            model,
            voice: config.voice.clone(),
        })
    }

    pub fn engine_id(&self) -> &'static str {
        "kokoro"
    }
}

impl SynthBackend for KokoroBackend {
    fn create(&self, input: SynthInput<'_>) -> Result<(Vec<f32>, u32), WorkerError> {
        self.model
            .create(
                input.text,
                &self.voice,
                input.lang,
                input.speed,
                input.is_phonemes,
            )
            .map_err(|e| WorkerError::Synthesis(format!("synthesis failed: {e}")))
    }
}

/// Synthesizer adapter (C2): chunking + G2P + backend, reduced to one
/// blocking `synthesize` call the scheduler invokes via `spawn_blocking`.
pub struct Synthesizer<B, G> {
    backend: B,
    g2p: G,
}

impl<B: SynthBackend, G: Grapheme2Phoneme> Synthesizer<B, G> {
    pub fn new(backend: B, g2p: G) -> Self {
        Self { backend, g2p }
    }

    /// `text -> (samples, sample_rate)`. Blocking; call from a worker
    /// thread. Chunks are synthesized in order and concatenated; all chunks
    /// must agree on sample rate or this is a hard error. If chunking (or
    /// every chunk) produces no audio, returns one silent sample at 24kHz.
    pub fn synthesize(&self, text: &str) -> Result<(Vec<f32>, u32), WorkerError> {
        let chunks = split_text_chunks(text);
        if chunks.is_empty() {
            return Ok((vec![0.0], SILENT_FALLBACK_SAMPLE_RATE));
        }

        let mut combined: Vec<f32> = Vec::new();
        let mut combined_rate: Option<u32> = None;

        for chunk in &chunks {
            let (samples, rate) = self.synthesize_chunk(chunk)?;
            match combined_rate {
                None => combined_rate = Some(rate),
                Some(existing) if existing != rate => {
                    return Err(WorkerError::Synthesis(format!(
                        "sample rate mismatch across chunks: {existing} vs {rate}"
                    )))
                }
                _ => {}
            }
            combined.extend(samples);
        }

        match combined_rate {
            Some(rate) if !combined.is_empty() => Ok((combined, rate)),
            _ => Ok((vec![0.0], SILENT_FALLBACK_SAMPLE_RATE)),
        }
    }

    fn synthesize_chunk(&self, chunk: &TextChunk) -> Result<(Vec<f32>, u32), WorkerError> {
        if chunk.is_phonemes {
            let phonemes = self.g2p.phonemize(&chunk.text, chunk.lang)?;
            self.backend.create(SynthInput {
                text: &phonemes,
                lang: chunk.lang,
                speed: chunk.speed(),
                is_phonemes: true,
            })
        } else {
            self.backend.create(SynthInput {
                text: &chunk.text,
                lang: chunk.lang,
                speed: chunk.speed(),
                is_phonemes: false,
            })
        }
    }
}

/// Object-safe facade over `Synthesizer<B, G>` so the scheduler can hold a
/// single `Arc<dyn SynthesizeText>` instead of threading the backend/G2P
/// type parameters through every function signature.
pub trait SynthesizeText: Send + Sync {
    fn synthesize_text(&self, text: &str) -> Result<(Vec<f32>, u32), WorkerError>;
}

impl<B: SynthBackend, G: Grapheme2Phoneme> SynthesizeText for Synthesizer<B, G> {
    fn synthesize_text(&self, text: &str) -> Result<(Vec<f32>, u32), WorkerError> {
        self.synthesize(text)
    }
}

/// Drains a child process's stdout/stderr to the diagnostic stream so any
/// chatter from a native helper never reaches the protocol stream. Unused
/// by `EspeakG2p` (it links directly, no subprocess), kept for backends
/// that do shell out.
pub fn drain_to_stderr(mut reader: impl std::io::Read) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let _ = std::io::stderr().write_all(&buf[..n]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StubG2p;
    impl Grapheme2Phoneme for StubG2p {
        fn phonemize(&self, text: &str, _lang: &str) -> Result<String, WorkerError> {
            Ok(format!("[{text}]"))
        }
    }

    struct StubBackend {
        rate: u32,
        calls: Mutex<Vec<String>>,
    }

    impl SynthBackend for StubBackend {
        fn create(&self, input: SynthInput<'_>) -> Result<(Vec<f32>, u32), WorkerError> {
            self.calls.lock().unwrap().push(input.text.to_string());
            Ok((vec![0.1, 0.2, 0.3], self.rate))
        }
    }

    #[test]
    fn espeak_lang_maps_chunk_code_to_espeak_code() {
        assert_eq!(EspeakG2p::espeak_lang("j"), "ja");
        assert_eq!(EspeakG2p::espeak_lang("en-us"), "en-us");
    }

    #[test]
    fn synthesize_concatenates_chunks_in_order() {
        let synth = Synthesizer::new(
            StubBackend {
                rate: 24000,
                calls: Mutex::new(Vec::new()),
            },
            StubG2p,
        );
        let (samples, rate) = synth.synthesize("hello こんにちは").unwrap();
        assert_eq!(rate, 24000);
        assert_eq!(samples.len(), 6);
        let calls = synth.backend.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], "hello");
        assert_eq!(calls[1], "[こんにちは]");
    }

    #[test]
    fn synthesize_mismatched_sample_rate_is_error() {
        struct FlakyBackend {
            first: bool,
        }
        impl SynthBackend for Mutex<FlakyBackend> {
            fn create(&self, _input: SynthInput<'_>) -> Result<(Vec<f32>, u32), WorkerError> {
                let mut state = self.lock().unwrap();
                let rate = if state.first { 24000 } else { 22050 };
                state.first = false;
                Ok((vec![0.0], rate))
            }
        }
        let synth = Synthesizer::new(Mutex::new(FlakyBackend { first: true }), StubG2p);
        let result = synth.synthesize("hello こんにちは");
        assert!(result.is_err());
    }

    #[test]
    fn synthesize_empty_text_yields_silence() {
        let synth = Synthesizer::new(
            StubBackend {
                rate: 24000,
                calls: Mutex::new(Vec::new()),
            },
            StubG2p,
        );
        let (samples, rate) = synth.synthesize("").unwrap();
        assert_eq!(samples, vec![0.0]);
        assert_eq!(rate, SILENT_FALLBACK_SAMPLE_RATE);
    }
}
