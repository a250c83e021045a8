//! Table Extraction
//!
//! Turns raw cell grids found in page text into captioned Markdown tables.
//! Caption lookup scans the prose preceding a table; header and alignment
//! are inferred from cell contents using the thresholds in
//! [`TableHeuristics`]. Rendered blocks carry a trailing metadata comment
//! so downstream stages never have to re-infer them.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::config::TableHeuristics;

/// Caption used when no numbered caption precedes a table
pub const FALLBACK_CAPTION_PREFIX: &str = "Extracted Table from Page";

/// Prefix of the machine-readable comment after each rendered table
pub const METADATA_COMMENT_PREFIX: &str = "<!-- TABLE_METADATA:";

/// Ordered caption patterns; the dashed/dotted form is tried before the bare number.
static CAPTION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)\btable[ \t]+(\d+[-.]\d+)\b[ \t]*[:.]?[ \t]*(\S[^\n]*)").expect("valid regex"),
        Regex::new(r"(?i)\btable[ \t]+(\d+)\b[ \t]*:?[ \t]*(\S[^\n]*)").expect("valid regex"),
    ]
});

static NUMERIC_CELL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?\d+(?:\.\d+)?$").expect("valid regex"));

static SECTION_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(?:\.\d+)*\.?$").expect("valid regex"));

static ALIGNED_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\t+| {2,}").expect("valid regex"));

/// Column alignment in the rendered Markdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    Left,
    Right,
}

impl Alignment {
    pub fn marker(&self) -> &'static str {
        match self {
            Alignment::Left => "---",
            Alignment::Right => "---:",
        }
    }
}

/// A recognised caption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Caption {
    /// Normalised caption, e.g. `Table 2-2: Pin Map`
    pub text: String,
    /// Table number when present, e.g. `2-2`
    pub numbering: Option<String>,
}

impl Caption {
    /// `Extracted Table from Page <n>`
    pub fn fallback(page_number: u32) -> Self {
        Self {
            text: format!("{} {}", FALLBACK_CAPTION_PREFIX, page_number),
            numbering: None,
        }
    }
}

/// Finds a table caption in a piece of text
pub trait CaptionDetector: Send + Sync {
    fn detect_caption(&self, text: &str) -> Option<Caption>;
}

/// Regex-backed caption detection (`Table 2-2: Description`)
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexCaptionDetector;

impl CaptionDetector for RegexCaptionDetector {
    fn detect_caption(&self, text: &str) -> Option<Caption> {
        for pattern in CAPTION_PATTERNS.iter() {
            if let Some(caps) = pattern.captures(text) {
                let number = caps.get(1)?.as_str();
                let description = caps.get(2)?.as_str().trim();
                return Some(Caption {
                    text: format!("Table {}: {}", number, description),
                    numbering: Some(number.to_string()),
                });
            }
        }
        None
    }
}

/// Metadata carried in the HTML comment after a rendered table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub caption: String,
    pub has_header: bool,
    pub num_rows: usize,
    pub num_cols: usize,
}

/// A table with its location in the text it was found in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub start: usize,
    pub end: usize,
    pub caption: String,
    pub numbering: Option<String>,
    pub rows: Vec<Vec<String>>,
    pub alignments: Vec<Alignment>,
    pub has_header: bool,
}

/// Extractor output for a single table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedTable {
    pub caption: String,
    pub markdown: String,
    pub metadata: TableMetadata,
}

impl Table {
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_cols(&self) -> usize {
        self.rows.first().map(|r| r.len()).unwrap_or(0)
    }

    /// True if `[start, end)` shares at least one byte with this table
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end
    }

    /// True if this table lies entirely inside `[start, end)`
    pub fn is_within(&self, start: usize, end: usize) -> bool {
        start <= self.start && self.end <= end
    }

    pub fn metadata(&self) -> TableMetadata {
        TableMetadata {
            caption: self.caption.clone(),
            has_header: self.has_header,
            num_rows: self.num_rows(),
            num_cols: self.num_cols(),
        }
    }

    /// Header row, alignment row, then data rows
    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        let Some(first) = self.rows.first() else {
            return out;
        };

        out.push_str(&render_row(first));

        let markers: Vec<&str> = if self.alignments.len() == first.len() {
            self.alignments.iter().map(|a| a.marker()).collect()
        } else {
            vec![Alignment::Left.marker(); first.len()]
        };
        out.push_str("| ");
        out.push_str(&markers.join(" | "));
        out.push_str(" |\n");

        for row in &self.rows[1..] {
            out.push_str(&render_row(row));
        }
        out
    }

    /// Caption heading, Markdown table and metadata comment
    pub fn render_block(&self) -> String {
        let metadata = serde_json::to_string(&self.metadata()).unwrap_or_else(|_| "{}".to_string());
        format!(
            "### {}\n\n{}\n{} {} -->\n",
            self.caption,
            self.render_markdown(),
            METADATA_COMMENT_PREFIX,
            metadata
        )
    }

    pub fn to_extracted(&self) -> ExtractedTable {
        ExtractedTable {
            caption: self.caption.clone(),
            markdown: self.render_block(),
            metadata: self.metadata(),
        }
    }
}

fn render_row(row: &[String]) -> String {
    let cells: Vec<String> = row.iter().map(|c| c.replace('|', "\\|")).collect();
    format!("| {} |\n", cells.join(" | "))
}

/// Builds tables from raw grids using a caption detector and heuristics
pub struct TableExtractor {
    detector: Box<dyn CaptionDetector>,
    heuristics: TableHeuristics,
}

impl TableExtractor {
    pub fn new(detector: Box<dyn CaptionDetector>, heuristics: TableHeuristics) -> Self {
        Self { detector, heuristics }
    }

    pub fn heuristics(&self) -> &TableHeuristics {
        &self.heuristics
    }

    pub fn detector(&self) -> &dyn CaptionDetector {
        self.detector.as_ref()
    }

    /// Caption from the last `caption_scan_chars` of `text_before`, or the page fallback
    pub fn detect_caption(&self, text_before: &str, page_number: u32) -> Caption {
        let window = tail_chars(text_before, self.heuristics.caption_scan_chars);
        self.detector
            .detect_caption(window)
            .unwrap_or_else(|| Caption::fallback(page_number))
    }

    /// Build a table from a raw grid. `None` when the grid is empty or malformed.
    /// The returned table's span is left at `0..0`; callers set it.
    pub fn extract(&self, text_before: &str, grid: &[Vec<String>], page_number: u32) -> Option<Table> {
        let rows = normalize_grid(grid)?;
        let caption = self.detect_caption(text_before, page_number);
        let has_header = is_header_row(&rows[0], &self.heuristics);
        let alignments = column_alignments(&rows, &self.heuristics);

        Some(Table {
            start: 0,
            end: 0,
            caption: caption.text,
            numbering: caption.numbering,
            rows,
            alignments,
            has_header,
        })
    }
}

impl Default for TableExtractor {
    fn default() -> Self {
        Self::new(Box::new(RegexCaptionDetector), TableHeuristics::default())
    }
}

/// Last `n` characters of `text`, on a char boundary
pub fn tail_chars(text: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match text.char_indices().rev().nth(n - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Collapse internal whitespace runs and strip the edges
pub fn normalize_cell(cell: &str) -> String {
    cell.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Clean every cell and make the grid rectangular (width of the first row).
/// Rejects grids with fewer than two rows, no columns, or no content.
fn normalize_grid(grid: &[Vec<String>]) -> Option<Vec<Vec<String>>> {
    if grid.len() < 2 {
        return None;
    }
    let width = grid[0].len();
    if width == 0 {
        return None;
    }

    let rows: Vec<Vec<String>> = grid
        .iter()
        .map(|row| {
            let mut cleaned: Vec<String> = row.iter().take(width).map(|c| normalize_cell(c)).collect();
            cleaned.resize(width, String::new());
            cleaned
        })
        .collect();

    if rows.iter().all(|r| r.iter().all(|c| c.is_empty())) {
        return None;
    }
    Some(rows)
}

/// Header if enough cells are filled and they are short on average
pub fn is_header_row(row: &[String], heuristics: &TableHeuristics) -> bool {
    if row.is_empty() {
        return false;
    }

    let non_empty: Vec<&String> = row.iter().filter(|c| !c.trim().is_empty()).collect();
    if (non_empty.len() as f64) < row.len() as f64 * heuristics.header_fill_ratio {
        return false;
    }
    if non_empty.is_empty() {
        return false;
    }

    let total: usize = non_empty.iter().map(|c| c.chars().count()).sum();
    let avg = total as f64 / non_empty.len() as f64;
    avg < heuristics.header_max_avg_len
}

/// Right-align columns whose non-header values are mostly numeric
pub fn column_alignments(rows: &[Vec<String>], heuristics: &TableHeuristics) -> Vec<Alignment> {
    let width = rows.first().map(|r| r.len()).unwrap_or(0);
    if rows.len() < 2 {
        return vec![Alignment::Left; width];
    }

    (0..width)
        .map(|col| {
            let values: Vec<&str> = rows[1..]
                .iter()
                .map(|r| r.get(col).map(|s| s.as_str()).unwrap_or(""))
                .collect();
            let numeric = values
                .iter()
                .filter(|v| !v.is_empty() && NUMERIC_CELL.is_match(v.trim()))
                .count();
            if numeric as f64 > values.len() as f64 * heuristics.numeric_ratio {
                Alignment::Right
            } else {
                Alignment::Left
            }
        })
        .collect()
}

// ============ MARKDOWN PARSING ============

/// True for a line that looks like a pipe-table row
pub fn is_pipe_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|') && trimmed.matches('|').count() >= 2
}

/// Split a pipe row into trimmed cells, honouring `\|` escapes
pub fn parse_pipe_row(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    let inner = trimmed.strip_prefix('|').unwrap_or(trimmed);
    let inner = if inner.ends_with('|') && !inner.ends_with("\\|") {
        &inner[..inner.len() - 1]
    } else {
        inner
    };

    let mut cells = Vec::new();
    let mut current = String::new();
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'|') => {
                current.push('|');
                chars.next();
            }
            '|' => {
                cells.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    cells.push(current.trim().to_string());
    cells
}

/// Parse an alignment row (`| --- | ---: |`); `None` if the line is not one
pub fn parse_alignment_row(line: &str) -> Option<Vec<Alignment>> {
    if !is_pipe_row(line) {
        return None;
    }
    let cells = parse_pipe_row(line);
    let mut alignments = Vec::with_capacity(cells.len());
    for cell in &cells {
        let body = cell.trim_start_matches(':');
        let right = body.ends_with(':');
        let dashes = body.trim_end_matches(':');
        if dashes.len() < 3 || !dashes.chars().all(|c| c == '-') {
            return None;
        }
        alignments.push(if right { Alignment::Right } else { Alignment::Left });
    }
    Some(alignments)
}

/// Parse `<!-- TABLE_METADATA: {...} -->`
pub fn parse_metadata_comment(line: &str) -> Option<TableMetadata> {
    let body = line.trim().strip_prefix(METADATA_COMMENT_PREFIX)?;
    let json = body.trim().strip_suffix("-->")?.trim();
    serde_json::from_str(json).ok()
}

// ============ TABLE DETECTION IN EXTRACTED TEXT ============

/// A table-shaped region of raw page text with its parsed grid
#[derive(Debug, Clone, PartialEq)]
pub struct TableRegion {
    pub start: usize,
    pub end: usize,
    pub grid: Vec<Vec<String>>,
}

/// A line of text with its byte span (newline excluded)
#[derive(Debug, Clone, Copy)]
pub(crate) struct LineSpan<'a> {
    pub start: usize,
    pub end: usize,
    pub text: &'a str,
}

pub(crate) fn line_spans(text: &str) -> Vec<LineSpan<'_>> {
    let mut spans = Vec::new();
    let mut pos = 0usize;
    for raw in text.split_inclusive('\n') {
        let line = raw.strip_suffix('\n').unwrap_or(raw);
        let line = line.strip_suffix('\r').unwrap_or(line);
        spans.push(LineSpan {
            start: pos,
            end: pos + line.len(),
            text: line,
        });
        pos += raw.len();
    }
    spans
}

fn aligned_cells(line: &str) -> Option<Vec<String>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || is_pipe_row(trimmed) {
        return None;
    }
    let cells: Vec<String> = ALIGNED_SPLIT
        .split(trimmed)
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if cells.len() >= 2 {
        Some(cells)
    } else {
        None
    }
}

/// Whitespace-aligned rows count as a table only with a text header row or
/// at least two numeric columns. Numbered title lines (tables of contents,
/// section lists) are rejected so their headers stay visible to the chunker.
fn is_aligned_table(grid: &[Vec<String>], heuristics: &TableHeuristics) -> bool {
    let Some(first) = grid.first() else {
        return false;
    };
    let numbered_titles = grid.iter().all(|row| {
        row.first().is_some_and(|c| SECTION_NUMBER.is_match(c))
            && row
                .get(1)
                .and_then(|c| c.chars().next())
                .is_some_and(char::is_uppercase)
    });
    if numbered_titles {
        return false;
    }
    if is_header_row(first, heuristics) && !first.iter().any(|c| NUMERIC_CELL.is_match(c)) {
        return true;
    }

    let numeric_columns = (0..first.len())
        .filter(|&col| {
            let numeric = grid
                .iter()
                .filter(|row| row.get(col).is_some_and(|c| NUMERIC_CELL.is_match(c)))
                .count();
            numeric as f64 > grid.len() as f64 * heuristics.numeric_ratio
        })
        .count();
    numeric_columns >= 2
}

/// Find pipe tables and whitespace-aligned tables in raw page text
pub fn detect_text_tables(text: &str, heuristics: &TableHeuristics) -> Vec<TableRegion> {
    let lines = line_spans(text);
    let mut regions = Vec::new();
    let mut i = 0usize;

    while i < lines.len() {
        if is_pipe_row(lines[i].text) {
            let first = i;
            while i < lines.len() && is_pipe_row(lines[i].text) {
                i += 1;
            }
            let grid: Vec<Vec<String>> = lines[first..i]
                .iter()
                .filter(|l| parse_alignment_row(l.text).is_none())
                .map(|l| parse_pipe_row(l.text))
                .collect();
            if grid.len() >= 2 {
                regions.push(TableRegion {
                    start: lines[first].start,
                    end: lines[i - 1].end,
                    grid,
                });
            }
            continue;
        }

        if let Some(cells) = aligned_cells(lines[i].text) {
            let width = cells.len();
            let first = i;
            let mut grid = vec![cells];
            i += 1;
            while i < lines.len() {
                match aligned_cells(lines[i].text) {
                    Some(next) if next.len() == width => {
                        grid.push(next);
                        i += 1;
                    }
                    _ => break,
                }
            }
            if grid.len() >= heuristics.min_aligned_rows.max(2) && is_aligned_table(&grid, heuristics) {
                regions.push(TableRegion {
                    start: lines[first].start,
                    end: lines[i - 1].end,
                    grid,
                });
            }
            continue;
        }

        i += 1;
    }

    regions
}
