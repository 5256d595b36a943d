//! Splits a stream of generated text into sentences suitable for
//! incremental TTS (§4.6). Isolated from the rest of the pipeline per
//! spec.md, which calls it out as its own unit — boundary detection here
//! has nothing to do with audio, connections, or state.

/// Finds `terminator . ! ?` immediately followed by whitespace, with a
/// minimum sentence length so stray short fragments (`"Dr."`) get folded
/// into the next boundary instead of shipped on their own.
pub struct SentenceChunker {
    min_len: usize,
    buffer: String,
}

impl SentenceChunker {
    pub fn new(min_len: usize) -> Self {
        Self {
            min_len,
            buffer: String::new(),
        }
    }

    /// Feeds one more chunk of generated text, returning every complete
    /// sentence found so far, in order.
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.buffer.push_str(token);
        let mut sentences = Vec::new();
        let mut search_from = 0;
        loop {
            match self.find_boundary_from(search_from) {
                Some(at) => {
                    let candidate = self.buffer[..at].trim();
                    if candidate.len() >= self.min_len {
                        sentences.push(candidate.to_string());
                        let rest = self.buffer[at..].trim_start().to_string();
                        self.buffer = rest;
                        search_from = 0;
                    } else {
                        // Too short to stand alone; keep scanning past it.
                        search_from = at;
                    }
                }
                None => break,
            }
        }
        sentences
    }

    fn find_boundary_from(&self, from: usize) -> Option<usize> {
        let bytes = self.buffer.as_bytes();
        if from >= bytes.len().saturating_sub(1) {
            return None;
        }
        for i in from..bytes.len() - 1 {
            if matches!(bytes[i], b'.' | b'!' | b'?') && bytes[i + 1] == b' ' {
                return Some(i + 1);
            }
        }
        None
    }

    /// Returns whatever's left once the stream has ended, even without a
    /// trailing terminator, or `None` if nothing remains.
    pub fn flush(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.buffer);
        let trimmed = tail.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_terminator_followed_by_space() {
        let mut chunker = SentenceChunker::new(3);
        let sentences = chunker.push("Hello world. This is great! ");
        assert_eq!(sentences, vec!["Hello world.", "This is great!"]);
    }

    #[test]
    fn short_fragment_is_folded_into_the_next_sentence() {
        let mut chunker = SentenceChunker::new(10);
        let sentences = chunker.push("Dr. Jones is here. ");
        assert_eq!(sentences, vec!["Dr. Jones is here."]);
    }

    #[test]
    fn tokens_arriving_piecemeal_still_find_the_boundary() {
        let mut chunker = SentenceChunker::new(3);
        assert!(chunker.push("Hel").is_empty());
        assert!(chunker.push("lo there").is_empty());
        let sentences = chunker.push(". more text");
        assert_eq!(sentences, vec!["Hello there."]);
    }

    #[test]
    fn flush_returns_trailing_text_without_a_terminator() {
        let mut chunker = SentenceChunker::new(3);
        chunker.push("no terminator here");
        assert_eq!(chunker.flush().as_deref(), Some("no terminator here"));
        assert_eq!(chunker.flush(), None);
    }
}
