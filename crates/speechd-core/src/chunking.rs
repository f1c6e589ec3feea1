//! Text chunking for TTS — splits input into language/speed segments.
//!
//! Pure functions, no I/O. Ported from the `tts_worker` chunking logic.

/// One language/speed segment of an utterance, ready to hand to a synthesis
/// backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    pub lang: &'static str,
    /// Fixed-point speed, `x1000` (e.g. `1000` == 1.0, `1200` == 1.2) so the
    /// type stays `Eq`-able for tests; callers divide by 1000.0 before use.
    pub speed_millis: u32,
    pub is_phonemes: bool,
}

impl TextChunk {
    pub fn speed(&self) -> f32 {
        self.speed_millis as f32 / 1000.0
    }
}

const ASCII_LANG: &str = "en-us";
const ASCII_SPEED_MILLIS: u32 = 1000;
const NON_ASCII_LANG: &str = "j";
const NON_ASCII_SPEED_MILLIS: u32 = 1200;

/// An ASCII-printable code point: `0x20..=0x7E`.
fn is_ascii_printable(c: char) -> bool {
    let code = c as u32;
    (0x20..=0x7E).contains(&code)
}

fn build_chunk(text: &str, ascii_flag: bool) -> TextChunk {
    if ascii_flag {
        TextChunk {
            text: text.to_string(),
            lang: ASCII_LANG,
            speed_millis: ASCII_SPEED_MILLIS,
            is_phonemes: false,
        }
    } else {
        TextChunk {
            text: text.to_string(),
            lang: NON_ASCII_LANG,
            speed_millis: NON_ASCII_SPEED_MILLIS,
            is_phonemes: true,
        }
    }
}

fn all_ascii_printable(text: &str) -> bool {
    text.chars().all(is_ascii_printable)
}

/// Split `text` into maximal runs of ASCII-printable vs. non-ASCII-printable
/// characters. Each run is trimmed; empty runs are dropped. If no runs are
/// produced but the trimmed whole text is non-empty, the whole text becomes
/// a single chunk under the appropriate rule.
pub fn split_text_chunks(text: &str) -> Vec<TextChunk> {
    if text.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_ascii: Option<bool> = None;

    for c in text.chars() {
        let ascii_flag = is_ascii_printable(c);
        let run_flag = *current_ascii.get_or_insert(ascii_flag);

        if ascii_flag != run_flag {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                chunks.push(build_chunk(trimmed, run_flag));
            }
            current = String::new();
            current.push(c);
            current_ascii = Some(ascii_flag);
            continue;
        }

        current.push(c);
    }

    if let Some(run_flag) = current_ascii {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            chunks.push(build_chunk(trimmed, run_flag));
        }
    }

    if chunks.is_empty() {
        let normalized = text.trim();
        if !normalized.is_empty() {
            chunks.push(build_chunk(normalized, all_ascii_printable(normalized)));
        }
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(split_text_chunks("").is_empty());
    }

    #[test]
    fn pure_ascii_is_one_chunk() {
        let chunks = split_text_chunks("hello world");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello world");
        assert_eq!(chunks[0].lang, "en-us");
        assert!(!chunks[0].is_phonemes);
        assert_eq!(chunks[0].speed(), 1.0);
    }

    #[test]
    fn pure_non_ascii_is_one_chunk() {
        let chunks = split_text_chunks("こんにちは");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "こんにちは");
        assert_eq!(chunks[0].lang, "j");
        assert!(chunks[0].is_phonemes);
        assert_eq!(chunks[0].speed(), 1.2);
    }

    #[test]
    fn mixed_text_alternates_runs() {
        let chunks = split_text_chunks("hello こんにちは world");
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "hello");
        assert!(!chunks[0].is_phonemes);
        assert_eq!(chunks[1].text, "こんにちは");
        assert!(chunks[1].is_phonemes);
        assert_eq!(chunks[2].text, "world");
        assert!(!chunks[2].is_phonemes);
    }

    #[test]
    fn whitespace_only_run_is_dropped() {
        // The space between "a" and non-ascii belongs to the ascii run; once
        // trimmed it should not vanish into an empty chunk on either side.
        let chunks = split_text_chunks("a   ");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "a");
    }

    #[test]
    fn whitespace_only_input_yields_no_chunks() {
        assert!(split_text_chunks("   ").is_empty());
    }

    #[test]
    fn rejoin_reproduces_input_modulo_interior_whitespace() {
        // Each run is trimmed, so rejoining with a single space between runs
        // must reproduce the original content exactly.
        let input = "hello   こんにちは   world";
        let chunks = split_text_chunks(input);
        let rejoined: String = chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(rejoined, "hello こんにちは world");
    }

    #[test]
    fn non_ascii_runs_get_slower_speed() {
        let chunks = split_text_chunks("漢字");
        assert_eq!(chunks[0].speed_millis, 1200);
    }

    #[test]
    fn ascii_printable_boundaries() {
        assert!(is_ascii_printable(' '));
        assert!(is_ascii_printable('~'));
        assert!(!is_ascii_printable('\u{7F}'));
        assert!(!is_ascii_printable('\n'));
    }
}
