//! Document chunking and metadata enrichment.
//!
//! Documents split on paragraph boundaries, packing paragraphs into chunks up
//! to a soft character cap while tracking stable character offsets into the
//! source. Markdown-style headings are carried along so each chunk knows its
//! nearest heading, and oversized single paragraphs fall back to sentence
//! splitting.
//!
//! Enrichment is heuristic and cheap: fenced-block language detection, table
//! and list flags, and a words-per-sentence reading-complexity score.

use sift_core::ChunkingConfig;

/// A chunk before embedding: content plus offsets and structural context.
#[derive(Debug, Clone)]
pub struct DraftChunk {
    pub content: String,
    pub chunk_index: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub heading: Option<String>,
    /// The full text of the enclosing section, when parent-child linkage is
    /// enabled.
    pub parent: Option<String>,
}

struct Paragraph {
    text: String,
    start: usize,
    end: usize,
    heading: Option<String>,
}

/// Split `content` into paragraphs with character offsets, tracking the
/// nearest preceding heading.
fn paragraphs(content: &str) -> Vec<Paragraph> {
    let mut out = Vec::new();
    let mut heading: Option<String> = None;
    let mut offset = 0usize;

    for raw in content.split("\n\n") {
        let char_len = raw.chars().count();
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            if let Some(h) = trimmed.strip_prefix('#') {
                heading = Some(h.trim_start_matches('#').trim().to_string());
            }
            let leading = raw.chars().take_while(|c| c.is_whitespace()).count();
            let trimmed_len = trimmed.chars().count();
            out.push(Paragraph {
                text: trimmed.to_string(),
                start: offset + leading,
                end: offset + leading + trimmed_len,
                heading: heading.clone(),
            });
        }
        // +2 for the paragraph separator.
        offset += char_len + 2;
    }
    out
}

/// Split an oversized paragraph at sentence boundaries.
fn split_sentences(paragraph: &Paragraph, max_chars: usize) -> Vec<Paragraph> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut start = paragraph.start;
    let mut cursor = paragraph.start;

    for sentence in paragraph.text.split_inclusive(['.', '!', '?']) {
        let sentence_len = sentence.chars().count();
        if !current.is_empty() && current.chars().count() + sentence_len > max_chars {
            out.push(Paragraph {
                text: current.trim().to_string(),
                start,
                end: cursor,
                heading: paragraph.heading.clone(),
            });
            current = String::new();
            start = cursor;
        }
        current.push_str(sentence);
        cursor += sentence_len;
    }
    if !current.trim().is_empty() {
        out.push(Paragraph {
            text: current.trim().to_string(),
            start,
            end: cursor,
            heading: paragraph.heading.clone(),
        });
    }
    out
}

/// Chunk a document: pack paragraphs up to `max_chunk_chars`, splitting
/// oversized paragraphs at sentences. Offsets are character offsets into the
/// source and always satisfy `start < end`.
pub fn chunk_document(content: &str, cfg: &ChunkingConfig) -> Vec<DraftChunk> {
    let max_chars = cfg.max_chunk_chars.max(1);
    let mut units: Vec<Paragraph> = Vec::new();
    for paragraph in paragraphs(content) {
        if paragraph.text.chars().count() > max_chars {
            units.extend(split_sentences(&paragraph, max_chars));
        } else {
            units.push(paragraph);
        }
    }

    // Pack consecutive units sharing a heading into chunks.
    let mut chunks: Vec<DraftChunk> = Vec::new();
    let mut buffer: Vec<&Paragraph> = Vec::new();
    let mut buffered_chars = 0usize;

    let flush = |buffer: &mut Vec<&Paragraph>, chunks: &mut Vec<DraftChunk>| {
        if buffer.is_empty() {
            return;
        }
        let text = buffer
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        chunks.push(DraftChunk {
            content: text,
            chunk_index: chunks.len(),
            start_offset: buffer.first().expect("non-empty").start,
            end_offset: buffer.last().expect("non-empty").end,
            heading: buffer.first().expect("non-empty").heading.clone(),
            parent: None,
        });
        buffer.clear();
    };

    for unit in &units {
        let unit_chars = unit.text.chars().count();
        let heading_changed = buffer
            .first()
            .map(|p| p.heading != unit.heading)
            .unwrap_or(false);
        if !buffer.is_empty() && (buffered_chars + unit_chars > max_chars || heading_changed) {
            flush(&mut buffer, &mut chunks);
            buffered_chars = 0;
        }
        buffer.push(unit);
        buffered_chars += unit_chars;
    }
    flush(&mut buffer, &mut chunks);

    if cfg.parent_child {
        attach_parents(&mut chunks);
    }
    chunks
}

/// Copy the concatenated text of each heading's section onto its chunks.
fn attach_parents(chunks: &mut [DraftChunk]) {
    let sections: Vec<(Option<String>, String)> = {
        let mut acc: Vec<(Option<String>, Vec<&str>)> = Vec::new();
        for chunk in chunks.iter() {
            let same_section = acc
                .last()
                .map(|(heading, _)| *heading == chunk.heading)
                .unwrap_or(false);
            if same_section {
                acc.last_mut()
                    .expect("checked non-empty")
                    .1
                    .push(chunk.content.as_str());
            } else {
                acc.push((chunk.heading.clone(), vec![chunk.content.as_str()]));
            }
        }
        acc.into_iter()
            .map(|(h, parts)| (h, parts.join("\n\n")))
            .collect()
    };
    for chunk in chunks.iter_mut() {
        if let Some((_, section)) = sections.iter().find(|(h, _)| *h == chunk.heading) {
            if section.len() > chunk.content.len() {
                chunk.parent = Some(section.clone());
            }
        }
    }
}

/// Detect the dominant code language from fenced blocks or keyword
/// heuristics. Returns None for prose.
pub fn detect_code_language(content: &str) -> Option<&'static str> {
    for line in content.lines() {
        if let Some(tag) = line.trim().strip_prefix("```") {
            let tag = tag.trim();
            match tag {
                "rust" | "rs" => return Some("rust"),
                "python" | "py" => return Some("python"),
                "javascript" | "js" => return Some("javascript"),
                "typescript" | "ts" => return Some("typescript"),
                "go" => return Some("go"),
                "sql" => return Some("sql"),
                "json" => return Some("json"),
                "bash" | "sh" | "shell" => return Some("shell"),
                _ => {}
            }
        }
    }
    if content.contains("fn ") && content.contains("->") {
        Some("rust")
    } else if content.contains("def ") && content.contains(":") && content.contains("self") {
        Some("python")
    } else if content.contains("function ") || content.contains("=> {") {
        Some("javascript")
    } else {
        None
    }
}

pub fn has_table(content: &str) -> bool {
    content
        .lines()
        .any(|line| line.trim_start().starts_with('|') && line.matches('|').count() >= 2)
}

pub fn has_list(content: &str) -> bool {
    content.lines().any(|line| {
        let t = line.trim_start();
        t.starts_with("- ")
            || t.starts_with("* ")
            || t.chars()
                .next()
                .map(|c| c.is_ascii_digit() && (t.starts_with(&format!("{c}. "))))
                .unwrap_or(false)
    })
}

/// Words-per-sentence reading complexity, normalized to [0, 1] where ~30
/// words per sentence saturates.
pub fn reading_complexity(content: &str) -> f64 {
    let sentences = content
        .split(['.', '!', '?'])
        .filter(|s| !s.trim().is_empty())
        .count()
        .max(1);
    let words = content.split_whitespace().count();
    ((words as f64 / sentences as f64) / 30.0).min(1.0)
}

/// Heading-based contextual prefix, the cheap alternative to model
/// contextualization.
pub fn heading_context(
    title: Option<&str>,
    heading: Option<&str>,
    chunk_index: usize,
    total: usize,
) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(title) = title {
        parts.push(format!("Document: {title}"));
    }
    if let Some(heading) = heading {
        parts.push(format!("Section: {heading}"));
    }
    parts.push(format!("Part {} of {}", chunk_index + 1, total));
    parts.join(" | ")
}
