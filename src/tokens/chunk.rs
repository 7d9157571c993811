//! Window splitting for long texts

use super::estimate_words;
use regex::Regex;
use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

fn paragraph_break() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\s*\n").expect("static regex"))
}

fn sentence_end() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?]\s+").expect("static regex"))
}

/// Fixed-size token windows advancing by `chunk_size - overlap`
pub(super) fn by_tokens(bpe: &CoreBPE, text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let tokens = bpe.encode_with_special_tokens(text);
    let step = chunk_size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < tokens.len() {
        let end = (start + chunk_size).min(tokens.len());
        if let Some(window) = decode_window(bpe, &tokens[start..end], chunk_size) {
            chunks.push(window);
        }
        if end == tokens.len() {
            break;
        }
        start += step;
    }

    chunks
}

/// Decode a token window, trimming up to three tokens at the head when the
/// window splits a multi-byte character, and as many at the tail as needed
/// for the decoded text to re-encode within `limit` tokens.
fn decode_window(bpe: &CoreBPE, window: &[usize], limit: usize) -> Option<String> {
    for head in 0..=3usize.min(window.len()) {
        for tail in 0..window.len() - head {
            let slice = &window[head..window.len() - tail];
            let Ok(text) = bpe.decode(slice.to_vec()) else {
                continue;
            };
            if bpe.encode_with_special_tokens(&text).len() <= limit {
                return Some(text);
            }
        }
    }
    None
}

/// Paragraph-first splitting driven by the word estimate.
///
/// Every emitted chunk estimates to at most `chunk_size` tokens. When a
/// chunk closes, its last words (up to `overlap` tokens) open the next one
/// if they fit next to the incoming piece.
pub(super) fn by_boundaries(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let mut builder = ChunkBuilder::new(chunk_size, overlap);

    for paragraph in paragraph_break().split(text) {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }

        if estimate_words(paragraph.split_whitespace().count()) > chunk_size {
            for sentence in split_sentences(paragraph) {
                builder.push(sentence, " ");
            }
        } else {
            builder.push(paragraph, "\n\n");
        }
    }

    builder.finish()
}

fn split_sentences(paragraph: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut last = 0;

    for m in sentence_end().find_iter(paragraph) {
        // keep the terminator, drop the whitespace after it
        let sentence = paragraph[last..m.start() + 1].trim();
        if !sentence.is_empty() {
            sentences.push(sentence);
        }
        last = m.end();
    }

    let rest = paragraph[last..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

/// Largest word count whose estimate fits in `budget` tokens
fn max_words_for(budget: usize) -> usize {
    let mut words = (budget as f64 / super::TOKENS_PER_WORD) as usize;
    while estimate_words(words + 1) <= budget {
        words += 1;
    }
    while words > 0 && estimate_words(words) > budget {
        words -= 1;
    }
    words
}

struct ChunkBuilder {
    chunk_size: usize,
    overlap: usize,
    current: String,
    current_words: usize,
    chunks: Vec<String>,
}

impl ChunkBuilder {
    fn new(chunk_size: usize, overlap: usize) -> Self {
        Self {
            chunk_size,
            overlap,
            current: String::new(),
            current_words: 0,
            chunks: Vec::new(),
        }
    }

    fn fits(&self, words: usize) -> bool {
        estimate_words(words) <= self.chunk_size
    }

    fn push(&mut self, piece: &str, joiner: &str) {
        let piece_words = piece.split_whitespace().count();

        if !self.fits(piece_words) {
            // A single sentence larger than a chunk: cut it between words.
            self.close();
            let per_chunk = max_words_for(self.chunk_size).max(1);
            let words: Vec<&str> = piece.split_whitespace().collect();
            for window in words.chunks(per_chunk) {
                self.chunks.push(window.join(" "));
            }
            return;
        }

        if self.current.is_empty() {
            self.current = piece.to_string();
            self.current_words = piece_words;
            return;
        }

        if self.fits(self.current_words + piece_words) {
            self.current.push_str(joiner);
            self.current.push_str(piece);
            self.current_words += piece_words;
            return;
        }

        let seed = self.close();
        let seed_words = seed.split_whitespace().count();
        if !seed.is_empty() && self.fits(seed_words + piece_words) {
            self.current = format!("{} {}", seed, piece);
            self.current_words = seed_words + piece_words;
        } else {
            self.current = piece.to_string();
            self.current_words = piece_words;
        }
    }

    /// Emit the open chunk and return its overlap tail
    fn close(&mut self) -> String {
        if self.current.is_empty() {
            return String::new();
        }

        let closed = std::mem::take(&mut self.current);
        self.current_words = 0;

        let words: Vec<&str> = closed.split_whitespace().collect();
        let tail_len = max_words_for(self.overlap).min(words.len().saturating_sub(1));
        let tail = words[words.len() - tail_len..].join(" ");

        self.chunks.push(closed);
        tail
    }

    fn finish(mut self) -> Vec<String> {
        self.close();
        self.chunks
    }
}
