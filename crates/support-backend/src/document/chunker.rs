//! Deterministic recursive-separator text splitter: tries `"\n\n"`, then
//! `"\n"`, then `". "`, then `" "`, then a hard
//! character split, accepting the first separator whose parts can be
//! packed into chunks all `<= chunk_size`. Overlap is re-prepended from the
//! previous chunk's tail. Pure, no I/O — never called from an async context
//! that needs to suspend.

const DEFAULT_SEPARATORS: [&str; 4] = ["\n\n", "\n", ". ", " "];

pub struct TextChunker {
    chunk_size: usize,
    overlap: usize,
}

impl TextChunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        Self { chunk_size: chunk_size.max(1), overlap }
    }

    /// Splits `text` into chunks of at most `chunk_size` chars (best effort;
    /// a single word longer than `chunk_size` is not further split), each
    /// consecutive pair overlapping by up to `overlap` chars of the
    /// previous chunk's tail.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }

        let pieces = Self::split_recursive(text, self.chunk_size, &DEFAULT_SEPARATORS);
        self.pack_with_overlap(pieces)
    }

    /// Breaks `text` into pieces small enough to pack, trying separators in
    /// order and recursing into any piece still over `chunk_size`.
    fn split_recursive(text: &str, chunk_size: usize, separators: &[&str]) -> Vec<String> {
        if text.len() <= chunk_size {
            return vec![text.to_string()];
        }

        let Some((sep, rest)) = separators.split_first() else {
            return Self::hard_split(text, chunk_size);
        };

        if sep.is_empty() || !text.contains(sep) {
            return Self::split_recursive(text, chunk_size, rest);
        }

        let mut out = Vec::new();
        for part in text.split(*sep) {
            if part.is_empty() {
                continue;
            }
            if part.len() > chunk_size {
                out.extend(Self::split_recursive(part, chunk_size, rest));
            } else {
                out.push(part.to_string());
            }
        }
        out
    }

    fn hard_split(text: &str, chunk_size: usize) -> Vec<String> {
        text.chars()
            .collect::<Vec<_>>()
            .chunks(chunk_size.max(1))
            .map(|c| c.iter().collect())
            .collect()
    }

    /// Greedily packs small pieces back together up to `chunk_size`,
    /// prepending up to `overlap` trailing chars of the previous chunk.
    fn pack_with_overlap(&self, pieces: Vec<String>) -> Vec<String> {
        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();

        for piece in pieces {
            let joiner = if current.is_empty() { "" } else { " " };
            if !current.is_empty() && current.len() + joiner.len() + piece.len() > self.chunk_size {
                chunks.push(std::mem::take(&mut current));
            }
            if current.is_empty() {
                let carry = chunks.last().map(|prev| Self::tail(prev, self.overlap)).unwrap_or_default();
                current.push_str(&carry);
                if !carry.is_empty() {
                    current.push(' ');
                }
            } else {
                current.push(' ');
            }
            current.push_str(&piece);
        }

        if !current.is_empty() {
            chunks.push(current);
        }

        chunks
    }

    fn tail(s: &str, n: usize) -> String {
        if s.len() <= n {
            return s.to_string();
        }
        let start = s.len() - n;
        let boundary = (start..=s.len()).find(|&i| s.is_char_boundary(i)).unwrap_or(s.len());
        s[boundary..].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(TextChunker::new(1000, 100).chunk("").is_empty());
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = TextChunker::new(1000, 100).chunk("hello world");
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn long_text_splits_on_paragraph_boundaries() {
        let text = format!("{}\n\n{}", "a".repeat(900), "b".repeat(900));
        let chunks = TextChunker::new(1000, 100).chunk(&text);
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.len() <= 1000 + 100));
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = (0..500).map(|i| format!("word{} ", i)).collect::<String>();
        let chunks = TextChunker::new(200, 50).chunk(&text);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let tail = TextChunker::tail(&pair[0], 50);
            assert!(pair[1].starts_with(tail.trim_start()) || tail.is_empty());
        }
    }

    #[test]
    fn deterministic_on_repeated_calls() {
        let text = "one two three. four five six. seven eight nine.".repeat(20);
        let a = TextChunker::new(80, 10).chunk(&text);
        let b = TextChunker::new(80, 10).chunk(&text);
        assert_eq!(a, b);
    }
}
