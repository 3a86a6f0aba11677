//! Sentence and clause chunking of streamed LLM text for TTS.
//!
//! Chunks are cut so synthesis can start before the reply is complete. The
//! chunks of a reply concatenate back to exactly the text that was pushed.

use parley_core::config::ChunkerConfig;

const SENTENCE_END: &[char] = &['.', '!', '?', '…'];
const CLAUSE_END: &[char] = &[',', ';', ':'];

pub struct SentenceChunker {
    min_clause_chars: usize,
    max_chunk_chars: usize,
    buffer: String,
}

impl SentenceChunker {
    pub fn new(config: &ChunkerConfig) -> Self {
        Self {
            min_clause_chars: config.min_clause_chars,
            max_chunk_chars: config.max_chunk_chars.max(1),
            buffer: String::new(),
        }
    }

    /// Add a text delta and return every chunk it completes.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);
        let mut chunks = Vec::new();
        while let Some(split) = self.next_boundary() {
            let rest = self.buffer.split_off(split);
            chunks.push(std::mem::replace(&mut self.buffer, rest));
        }
        chunks
    }

    /// Flush whatever text is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Byte offset just past the first chunk boundary in the buffer.
    fn next_boundary(&self) -> Option<usize> {
        let mut chars = self.buffer.char_indices().peekable();
        let mut count = 0;
        let mut last_space = None;

        while let Some((idx, c)) = chars.next() {
            count += 1;
            if count > self.max_chunk_chars {
                // no natural boundary within the limit
                return Some(last_space.unwrap_or(idx));
            }
            if c.is_whitespace() && idx > 0 {
                last_space = Some(idx + c.len_utf8());
            }
            let Some(&(next_idx, next)) = chars.peek() else {
                break;
            };
            if !next.is_whitespace() || count + 1 > self.max_chunk_chars {
                continue;
            }
            let at_sentence = SENTENCE_END.contains(&c);
            let at_clause = CLAUSE_END.contains(&c) && count >= self.min_clause_chars;
            if at_sentence || at_clause {
                return Some(next_idx + next.len_utf8());
            }
        }

        if count == self.max_chunk_chars && count > 0 {
            return Some(last_space.unwrap_or(self.buffer.len()));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(min_clause: usize, max: usize) -> SentenceChunker {
        SentenceChunker::new(&ChunkerConfig {
            min_clause_chars: min_clause,
            max_chunk_chars: max,
        })
    }

    fn run(c: &mut SentenceChunker, deltas: &[&str]) -> Vec<String> {
        let mut out: Vec<String> = deltas.iter().flat_map(|d| c.push(d)).collect();
        out.extend(c.finish());
        out
    }

    #[test]
    fn test_splits_after_sentence_end() {
        let mut c = chunker(40, 250);
        assert_eq!(c.push("Hello there. How are"), vec!["Hello there. "]);
        assert!(c.push(" you?").is_empty());
        assert_eq!(c.finish().as_deref(), Some("How are you?"));
        assert_eq!(c.finish(), None);
    }

    #[test]
    fn test_waits_for_whitespace_after_period() {
        let mut c = chunker(40, 250);
        assert!(c.push("It is 18.").is_empty());
        assert!(c.push("5 degrees").is_empty());
        assert_eq!(c.push(". Cloudy"), vec!["It is 18.5 degrees. "]);
        assert_eq!(c.pending(), "Cloudy");
    }

    #[test]
    fn test_clause_split_needs_min_length() {
        let mut c = chunker(20, 250);
        assert!(c.push("Well, ").is_empty());
        let chunks = c.push("the weather in Paris today, according to");
        assert_eq!(chunks, vec!["Well, the weather in Paris today, "]);
    }

    #[test]
    fn test_long_run_splits_at_last_space() {
        let mut c = chunker(40, 12);
        let chunks = run(&mut c, &["the quick brown fox jumps"]);
        assert_eq!(chunks[0], "the quick ");
        assert_eq!(chunks.concat(), "the quick brown fox jumps");
        assert!(chunks.iter().all(|s| s.chars().count() <= 12));
    }

    #[test]
    fn test_long_word_is_hard_split() {
        let mut c = chunker(40, 4);
        let chunks = run(&mut c, &["abcdefghij"]);
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn test_multibyte_text() {
        let mut c = chunker(40, 250);
        let chunks = run(&mut c, &["Très bien… ", "À bientôt! ", "Ça va"]);
        assert_eq!(chunks, vec!["Très bien… ", "À bientôt! ", "Ça va"]);
    }

    #[test]
    fn test_chunks_cover_input_exactly() {
        let text = "The weather in Paris is 18 degrees, and cloudy; expect rain later!  Anything else?\nBye.";
        for max in [5, 17, 40, 250] {
            for step in [1, 3, 7, 100] {
                let mut c = chunker(10, max);
                let deltas: Vec<String> = text
                    .chars()
                    .collect::<Vec<_>>()
                    .chunks(step)
                    .map(|w| w.iter().collect())
                    .collect();
                let refs: Vec<&str> = deltas.iter().map(String::as_str).collect();
                let chunks = run(&mut c, &refs);
                assert_eq!(chunks.concat(), text, "max={max} step={step}");
                assert!(chunks.iter().all(|s| !s.is_empty()));
                assert!(chunks.iter().all(|s| s.chars().count() <= max));
            }
        }
    }
}
