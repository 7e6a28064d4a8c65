//! Sentence-aligned text chunking for knowledge ingestion.

/// Splits text into bounded-size chunks aligned to sentence boundaries.
///
/// Sentences (runs ending in `.`, `!`, or `?`) are accumulated greedily while
/// the running length stays within `chunk_size`; a single sentence longer
/// than the limit is kept whole as its own chunk, never split mid-sentence.
/// Text without any terminal punctuation becomes one chunk. Each emitted
/// chunk is trimmed of surrounding whitespace.
pub fn split_into_chunks(text: &str, chunk_size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for sentence in split_sentences(text) {
        if current.len() + sentence.len() <= chunk_size {
            current.push_str(&sentence);
        } else {
            if !current.is_empty() {
                chunks.push(current.trim().to_string());
            }
            current = sentence;
        }
    }
    if !current.is_empty() {
        chunks.push(current.trim().to_string());
    }
    chunks
}

// Splits into runs of non-terminal characters followed by one or more
// terminal characters. A trailing run with no terminator is dropped when at
// least one terminated sentence exists, matching upstream ingestion; text
// with no terminators at all is returned whole.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if is_terminal(ch) {
            if current.is_empty() {
                continue;
            }
            current.push(ch);
            while let Some(&next) = chars.peek() {
                if !is_terminal(next) {
                    break;
                }
                current.push(next);
                chars.next();
            }
            sentences.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }

    if sentences.is_empty() {
        vec![text.to_string()]
    } else {
        sentences
    }
}

fn is_terminal(ch: char) -> bool {
    matches!(ch, '.' | '!' | '?')
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn splits_on_sentence_boundaries() {
        let chunks = split_into_chunks("A. B. C.", 4);
        assert_eq!(chunks, vec!["A.", "B.", "C."]);
    }

    #[test]
    fn accumulates_within_budget() {
        let chunks = split_into_chunks("One two. Three four! Five?", 20);
        assert_eq!(chunks, vec!["One two. Three four!", "Five?"]);
    }

    #[test]
    fn oversize_sentence_kept_whole() {
        let text = "This sentence is far longer than the configured limit.";
        let chunks = split_into_chunks(text, 10);
        assert_eq!(chunks, vec![text]);
    }

    #[test]
    fn no_terminal_punctuation_is_one_chunk() {
        let chunks = split_into_chunks("no punctuation here at all", 8);
        assert_eq!(chunks, vec!["no punctuation here at all"]);
    }

    #[test]
    fn terminal_runs_stay_attached() {
        let chunks = split_into_chunks("Really?! Yes... Sure.", 50);
        assert_eq!(chunks, vec!["Really?! Yes... Sure."]);
    }

    #[test]
    fn chunks_are_trimmed() {
        let chunks = split_into_chunks("First one. Second one.", 11);
        assert_eq!(chunks, vec!["First one.", "Second one."]);
    }
}
