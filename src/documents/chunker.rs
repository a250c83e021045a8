//! Table-Aware Chunking
//!
//! Splits annotated document text into retrieval-sized chunks. Rendered
//! tables are found first and treated as atomic: a table is never split
//! across two chunks. Prose is grouped into numbered sections and split on
//! paragraph boundaries when a section outgrows the chunk size.
//!
//! Chunk spans are byte offsets into the source text and tile it exactly.
//! A continuation chunk repeats the tail of its predecessor at the start of
//! its `text`; its span only covers the new text.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, warn};

use super::tables::{
    is_header_row, is_pipe_row, line_spans, parse_alignment_row, parse_metadata_comment, parse_pipe_row,
    tail_chars, CaptionDetector, RegexCaptionDetector, Table,
};
use crate::config::{ChunkingConfig, TableHeuristics};
use crate::error::ErrorKind;

/// Title of the content before the first numbered header
pub const INTRODUCTION: &str = "Introduction";

static NUMBERED_SECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+(\.\d+)*)\s+[A-Z].{3,}$").expect("valid regex"));

#[derive(Error, Debug)]
pub enum ChunkingError {
    #[error("Invalid chunking options: {0}")]
    InvalidOptions(String),
    #[error("Chunk invariant violated: {0}")]
    InvariantViolation(String),
}

impl Serialize for ChunkingError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl ErrorKind for ChunkingError {
    fn kind(&self) -> &'static str {
        "ChunkingError"
    }
}

/// A table as referenced from a chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRef {
    pub caption: String,
    pub numbering: Option<String>,
    pub start: usize,
    pub end: usize,
    pub num_rows: usize,
    pub num_cols: usize,
}

impl From<&Table> for TableRef {
    fn from(table: &Table) -> Self {
        Self {
            caption: table.caption.clone(),
            numbering: table.numbering.clone(),
            start: table.start,
            end: table.end,
            num_rows: table.num_rows(),
            num_cols: table.num_cols(),
        }
    }
}

/// A chunk of a document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Chunk index within document
    pub index: usize,
    pub section_title: String,
    /// Byte offset where the chunk's span starts
    pub start_char: usize,
    /// Byte offset where the chunk's span ends (exclusive)
    pub end_char: usize,
    pub text: String,
    pub has_tables: bool,
    pub contains_tables: Vec<TableRef>,
    pub table_numbers: Vec<String>,
}

/// Recognises section header lines
pub trait SectionDetector: Send + Sync {
    /// Section title if `line` starts a new section
    fn section_title(&self, line: &str) -> Option<String>;
}

/// `2.1 Timing Parameters` style headers
#[derive(Debug, Clone, Copy, Default)]
pub struct NumberedSectionDetector;

impl SectionDetector for NumberedSectionDetector {
    fn section_title(&self, line: &str) -> Option<String> {
        if NUMBERED_SECTION.is_match(line) {
            Some(line.trim().to_string())
        } else {
            None
        }
    }
}

struct Section {
    title: String,
    start: usize,
    end: usize,
}

/// Chunk before indexing and table bookkeeping
struct Draft {
    title: String,
    start: usize,
    end: usize,
    text: String,
    blank: bool,
}

pub struct Chunker {
    config: ChunkingConfig,
    heuristics: TableHeuristics,
    sections: Box<dyn SectionDetector>,
    captions: Box<dyn CaptionDetector>,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self, ChunkingError> {
        Self::with_detectors(
            config,
            TableHeuristics::default(),
            Box::new(NumberedSectionDetector),
            Box::new(RegexCaptionDetector),
        )
    }

    pub fn with_detectors(
        config: ChunkingConfig,
        heuristics: TableHeuristics,
        sections: Box<dyn SectionDetector>,
        captions: Box<dyn CaptionDetector>,
    ) -> Result<Self, ChunkingError> {
        if config.chunk_size == 0 {
            return Err(ChunkingError::InvalidOptions("chunk size must be positive".to_string()));
        }
        if config.overlap >= config.chunk_size {
            return Err(ChunkingError::InvalidOptions(format!(
                "overlap ({}) must be smaller than chunk size ({})",
                config.overlap, config.chunk_size
            )));
        }
        Ok(Self {
            config,
            heuristics,
            sections,
            captions,
        })
    }

    /// Split `text` into ordered chunks
    pub fn chunk(&self, text: &str) -> Result<Vec<Chunk>, ChunkingError> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let tables = self.detect_tables(text);
        let sections = self.find_sections(text, &tables);

        let mut drafts = Vec::new();
        for section in &sections {
            self.chunk_section(text, section, &tables, &mut drafts);
        }

        let chunks: Vec<Chunk> = absorb_blank(drafts)
            .into_iter()
            .enumerate()
            .map(|(index, draft)| {
                let contained: Vec<&Table> = tables
                    .iter()
                    .filter(|t| t.is_within(draft.start, draft.end))
                    .collect();
                Chunk {
                    index,
                    section_title: draft.title,
                    start_char: draft.start,
                    end_char: draft.end,
                    text: draft.text,
                    has_tables: !contained.is_empty(),
                    table_numbers: contained.iter().filter_map(|t| t.numbering.clone()).collect(),
                    contains_tables: contained.into_iter().map(TableRef::from).collect(),
                }
            })
            .collect();

        verify_chunks(text, &chunks, &tables)?;
        debug!(
            chunks = chunks.len(),
            sections = sections.len(),
            tables = tables.len(),
            "Chunked document"
        );
        Ok(chunks)
    }

    /// Find rendered Markdown tables, with their caption heading and metadata comment
    pub fn detect_tables(&self, text: &str) -> Vec<Table> {
        let lines = line_spans(text);
        let mut tables = Vec::new();
        // First line not yet claimed by a table
        let mut floor = 0usize;
        let mut i = 0usize;

        while i + 1 < lines.len() {
            if !is_pipe_row(lines[i].text) {
                i += 1;
                continue;
            }
            let Some(alignments) = parse_alignment_row(lines[i + 1].text) else {
                i += 1;
                continue;
            };

            let mut rows = vec![parse_pipe_row(lines[i].text)];
            let mut last = i + 1;
            let mut next = i + 2;
            while next < lines.len() && is_pipe_row(lines[next].text) {
                rows.push(parse_pipe_row(lines[next].text));
                last = next;
                next += 1;
            }

            let mut metadata = None;
            let mut k = next;
            while k < lines.len() && lines[k].text.trim().is_empty() {
                k += 1;
            }
            if k < lines.len() {
                if let Some(meta) = parse_metadata_comment(lines[k].text) {
                    metadata = Some(meta);
                    last = k;
                    next = k + 1;
                }
            }

            let mut first = i;
            let mut heading = None;
            let mut h = i;
            while h > floor && lines[h - 1].text.trim().is_empty() {
                h -= 1;
            }
            if h > floor {
                let candidate = lines[h - 1].text.trim();
                if candidate.starts_with('#') || self.captions.detect_caption(candidate).is_some() {
                    heading = Some(candidate.trim_start_matches('#').trim().to_string());
                    first = h - 1;
                }
            }

            let caption = metadata
                .as_ref()
                .map(|m| m.caption.clone())
                .or(heading)
                .unwrap_or_default();
            let numbering = self.captions.detect_caption(&caption).and_then(|c| c.numbering);
            let has_header = metadata
                .as_ref()
                .map(|m| m.has_header)
                .unwrap_or_else(|| is_header_row(&rows[0], &self.heuristics));

            tables.push(Table {
                start: lines[first].start,
                end: lines[last].end,
                caption,
                numbering,
                rows,
                alignments,
                has_header,
            });
            floor = next;
            i = next;
        }

        tables
    }

    fn find_sections(&self, text: &str, tables: &[Table]) -> Vec<Section> {
        let mut sections = Vec::new();
        let mut title = INTRODUCTION.to_string();
        let mut start = 0usize;
        let mut seen_header = false;

        for line in line_spans(text) {
            if tables.iter().any(|t| t.start <= line.start && line.start < t.end) {
                continue;
            }
            let Some(header) = self.sections.section_title(line.text) else {
                continue;
            };
            // A blank introduction is folded into the first section
            if seen_header || !text[..line.start].trim().is_empty() {
                sections.push(Section {
                    title,
                    start,
                    end: line.start,
                });
                start = line.start;
            }
            title = header;
            seen_header = true;
        }

        sections.push(Section {
            title,
            start,
            end: text.len(),
        });
        sections
    }

    fn chunk_section(&self, text: &str, section: &Section, tables: &[Table], out: &mut Vec<Draft>) {
        let slice = &text[section.start..section.end];
        if slice.chars().count() <= self.config.chunk_size {
            out.push(Draft {
                title: section.title.clone(),
                start: section.start,
                end: section.end,
                text: slice.trim().to_string(),
                blank: slice.trim().is_empty(),
            });
            return;
        }

        let continued = format!("{} (continued)", section.title);
        let section_tables: Vec<&Table> = tables
            .iter()
            .filter(|t| t.is_within(section.start, section.end))
            .collect();

        if section_tables.is_empty() {
            self.split_prose(text, section.start, section.end, &section.title, &continued, out);
            return;
        }

        let before = format!("{} (before table)", section.title);
        let after = format!("{} (after table)", section.title);
        let tolerance = (self.config.chunk_size as f64 * self.config.table_tolerance) as usize;
        let mut cursor = section.start;

        for table in section_tables {
            if table.start > cursor {
                self.split_prose(text, cursor, table.start, &before, &continued, out);
            }

            let block = &text[table.start..table.end];
            let size = block.chars().count();
            if size > tolerance {
                warn!(
                    caption = %table.caption,
                    size,
                    limit = tolerance,
                    "Table exceeds chunk size tolerance, keeping it whole"
                );
            }
            let title = if table.caption.is_empty() {
                section.title.clone()
            } else {
                format!("{} - {}", section.title, table.caption)
            };
            out.push(Draft {
                title,
                start: table.start,
                end: table.end,
                text: block.trim().to_string(),
                blank: false,
            });
            cursor = table.end;
        }

        if cursor < section.end {
            self.split_prose(text, cursor, section.end, &after, &continued, out);
        }
    }

    /// Accumulate paragraphs until the next one would overflow the chunk size
    fn split_prose(&self, text: &str, start: usize, end: usize, label: &str, continued: &str, out: &mut Vec<Draft>) {
        let mut chunk_start = start;
        let mut chunk_len = 0usize;
        let mut first = true;

        for (piece_start, piece_end) in self.segments(text, start, end) {
            let len = text[piece_start..piece_end].chars().count();
            let has_content = !text[chunk_start..piece_start].trim().is_empty();
            if has_content && chunk_len + len > self.config.chunk_size {
                self.push_prose(text, chunk_start, piece_start, if first { label } else { continued }, !first, out);
                first = false;
                chunk_start = piece_start;
                chunk_len = 0;
            }
            chunk_len += len;
        }

        self.push_prose(text, chunk_start, end, if first { label } else { continued }, !first, out);
    }

    fn push_prose(&self, text: &str, start: usize, end: usize, title: &str, seeded: bool, out: &mut Vec<Draft>) {
        let body = text[start..end].trim();
        if body.is_empty() {
            out.push(Draft {
                title: title.to_string(),
                start,
                end,
                text: String::new(),
                blank: true,
            });
            return;
        }

        let mut chunk_text = String::new();
        if seeded && self.config.overlap > 0 {
            if let Some(previous) = out.last().filter(|d| !d.blank) {
                let tail = tail_chars(&previous.text, self.config.overlap).trim_start();
                if !tail.is_empty() {
                    chunk_text.push_str(tail);
                    chunk_text.push_str("\n\n");
                }
            }
        }
        chunk_text.push_str(body);

        out.push(Draft {
            title: title.to_string(),
            start,
            end,
            text: chunk_text,
            blank: false,
        });
    }

    /// Paragraph spans tiling `[start, end)`; paragraphs longer than the chunk
    /// size are broken down to lines.
    fn segments(&self, text: &str, start: usize, end: usize) -> Vec<(usize, usize)> {
        let mut pieces = Vec::new();
        let mut pos = start;
        for paragraph in text[start..end].split_inclusive("\n\n") {
            if paragraph.chars().count() > self.config.chunk_size {
                for line in paragraph.split_inclusive('\n') {
                    pieces.push((pos, pos + line.len()));
                    pos += line.len();
                }
            } else {
                pieces.push((pos, pos + paragraph.len()));
                pos += paragraph.len();
            }
        }
        pieces
    }
}

/// Fold whitespace-only drafts into a neighbour so spans keep tiling
fn absorb_blank(drafts: Vec<Draft>) -> Vec<Draft> {
    let mut out: Vec<Draft> = Vec::with_capacity(drafts.len());
    let mut pending_start: Option<usize> = None;

    for mut draft in drafts {
        if draft.blank {
            match out.last_mut() {
                Some(previous) => previous.end = draft.end,
                None => {
                    pending_start.get_or_insert(draft.start);
                }
            }
            continue;
        }
        if let Some(start) = pending_start.take() {
            draft.start = start;
        }
        out.push(draft);
    }
    out
}

fn verify_chunks(text: &str, chunks: &[Chunk], tables: &[Table]) -> Result<(), ChunkingError> {
    let mut expected_start = 0usize;
    for chunk in chunks {
        if chunk.start_char != expected_start {
            return Err(ChunkingError::InvariantViolation(format!(
                "chunk {} starts at {} but previous chunk ended at {}",
                chunk.index, chunk.start_char, expected_start
            )));
        }
        if chunk.end_char <= chunk.start_char
            || !text.is_char_boundary(chunk.start_char)
            || !text.is_char_boundary(chunk.end_char)
        {
            return Err(ChunkingError::InvariantViolation(format!(
                "chunk {} has invalid span {}..{}",
                chunk.index, chunk.start_char, chunk.end_char
            )));
        }
        for table in tables {
            if table.overlaps(chunk.start_char, chunk.end_char) && !table.is_within(chunk.start_char, chunk.end_char) {
                return Err(ChunkingError::InvariantViolation(format!(
                    "table '{}' at {}..{} is split by chunk {}",
                    table.caption, table.start, table.end, chunk.index
                )));
            }
        }
        expected_start = chunk.end_char;
    }
    if !chunks.is_empty() && expected_start != text.len() {
        return Err(ChunkingError::InvariantViolation(format!(
            "chunks end at {} but text is {} bytes",
            expected_start,
            text.len()
        )));
    }
    Ok(())
}

/// Chunk with default detectors
pub fn chunk_text(text: &str, config: &ChunkingConfig) -> Result<Vec<Chunk>, ChunkingError> {
    Chunker::new(config.clone())?.chunk(text)
}
