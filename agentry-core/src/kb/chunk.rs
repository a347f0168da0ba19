//! Text chunking for embedding.
//!
//! Targets 500 tokens per chunk with a 50-token overlap, approximated at 4
//! characters per token. Paragraphs are the primary split boundary; a
//! paragraph longer than a whole chunk is sub-split at sentence boundaries.
//! Chunks preserve reading order.

/// Target chunk size in tokens.
pub const CHUNK_TOKENS: usize = 500;
/// Overlap between consecutive chunks in tokens.
pub const OVERLAP_TOKENS: usize = 50;
/// The fixed chars-per-token approximation.
pub const CHARS_PER_TOKEN: usize = 4;

const CHUNK_CHARS: usize = CHUNK_TOKENS * CHARS_PER_TOKEN;
const OVERLAP_CHARS: usize = OVERLAP_TOKENS * CHARS_PER_TOKEN;

/// A chunk of document text ready for embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub content: String,
    pub token_count: usize,
}

/// Split `text` into overlapping chunks.
pub fn chunk_text(text: &str) -> Vec<Chunk> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    // Paragraph-first segmentation; oversized paragraphs get sentence-split.
    let mut segments: Vec<&str> = Vec::new();
    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if paragraph.len() <= CHUNK_CHARS {
            segments.push(paragraph);
        } else {
            segments.extend(split_sentences(paragraph));
        }
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    // Whether `current` holds anything beyond the seeded overlap tail; a
    // chunk of pure overlap would just duplicate the previous one.
    let mut has_new_content = false;

    for segment in segments {
        // A single sentence can still exceed the target (no boundaries at
        // all); hard-wrap it rather than emitting an oversized chunk.
        if segment.len() > CHUNK_CHARS {
            if has_new_content {
                flush(&mut chunks, &mut current);
            }
            current.clear();
            for piece in hard_wrap(segment) {
                current.push_str(piece);
                flush(&mut chunks, &mut current);
                current.clear();
            }
            has_new_content = false;
            continue;
        }

        // Would adding this segment overflow the target?
        if !current.is_empty() && current.len() + 2 + segment.len() > CHUNK_CHARS {
            if has_new_content {
                flush(&mut chunks, &mut current);
            } else {
                current.clear();
            }
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(segment);
        has_new_content = true;
    }
    if has_new_content && !current.trim().is_empty() {
        flush(&mut chunks, &mut current);
    }
    chunks
}

fn flush(chunks: &mut Vec<Chunk>, current: &mut String) {
    let content = current.trim().to_string();
    if content.is_empty() {
        current.clear();
        return;
    }
    let token_count = content.len().div_ceil(CHARS_PER_TOKEN);

    // Seed the next chunk with the tail of this one for continuity.
    let overlap = overlap_tail(&content);
    chunks.push(Chunk {
        content,
        token_count,
    });
    *current = overlap;
}

/// The trailing ~50 tokens of a chunk, cut at a word boundary.
fn overlap_tail(content: &str) -> String {
    if content.len() <= OVERLAP_CHARS {
        return String::new();
    }
    let mut start = content.len() - OVERLAP_CHARS;
    while start < content.len() && !content.is_char_boundary(start) {
        start += 1;
    }
    match content[start..].find(char::is_whitespace) {
        Some(space) => content[start + space..].trim_start().to_string(),
        None => content[start..].to_string(),
    }
}

/// Split a long paragraph at sentence boundaries.
fn split_sentences(paragraph: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = paragraph.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        let is_terminal = matches!(b, b'.' | b'!' | b'?');
        let at_boundary = is_terminal
            && bytes
                .get(i + 1)
                .map(|&next| next == b' ' || next == b'\n')
                .unwrap_or(true);
        if at_boundary {
            let sentence = paragraph[start..=i].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = i + 1;
        }
    }
    let tail = paragraph[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Last-resort split for boundary-free text.
fn hard_wrap(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + CHUNK_CHARS).min(text.len());
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        pieces.push(&text[start..end]);
        start = end;
    }
    pieces
}
