//! Document Extraction
//!
//! Reads PDF, DOCX, plain text and Markdown bytes into pages, finds tables in
//! each page and produces the annotated text the chunker works on: page
//! markers plus prose with every table replaced by its rendered block.

use lopdf::{Object, ObjectId};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::document::DocumentFormat;
use super::tables::{
    detect_text_tables, line_spans, CaptionDetector, ExtractedTable, Table, TableExtractor, TableRegion,
};
use crate::config::TableHeuristics;
use crate::error::ErrorKind;

/// Upper bound on accepted input (50 MB)
const MAX_DOCUMENT_BYTES: usize = 50 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),
    #[error("Corrupt document: {0}")]
    Corrupt(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Document contains no extractable text")]
    NoContent,
    #[error("Document too large: {0} bytes (max {1} bytes)")]
    TooLarge(usize, usize),
}

impl Serialize for ExtractionError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl ErrorKind for ExtractionError {
    fn kind(&self) -> &'static str {
        "ExtractionError"
    }
}

/// One page of source text and the tables found on it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// 1-based
    pub number: u32,
    /// Raw page text; table offsets index into it
    pub text: String,
    pub tables: Vec<Table>,
}

/// Extraction result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedDocument {
    pub format: DocumentFormat,
    pub pages: Vec<Page>,
    /// Annotated text handed to the chunker
    pub text: String,
    pub page_count: u32,
    /// Page-scoped problems that did not stop extraction
    pub warnings: Vec<String>,
}

impl ExtractedDocument {
    pub fn table_count(&self) -> usize {
        self.pages.iter().map(|p| p.tables.len()).sum()
    }

    /// Caption, rendered block and metadata of every table, in page order
    pub fn tables(&self) -> Vec<ExtractedTable> {
        self.pages
            .iter()
            .flat_map(|p| p.tables.iter().map(Table::to_extracted))
            .collect()
    }
}

/// Page text plus table regions located in it
struct RawPage {
    number: u32,
    text: String,
    regions: Vec<TableRegion>,
}

// ============ PDF PAGE STRATEGIES ============

/// One way of getting the text of a PDF page
pub trait PageTextStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn page_text(&self, doc: &lopdf::Document, page_number: u32, page_id: ObjectId) -> Result<String, ExtractionError>;
}

/// lopdf's own text extraction (handles font encodings)
pub struct LopdfTextStrategy;

impl PageTextStrategy for LopdfTextStrategy {
    fn name(&self) -> &'static str {
        "lopdf_text"
    }

    fn page_text(&self, doc: &lopdf::Document, page_number: u32, _page_id: ObjectId) -> Result<String, ExtractionError> {
        doc.extract_text(&[page_number])
            .map_err(|e| ExtractionError::Corrupt(e.to_string()))
    }
}

/// Decode `Tj`/`TJ` operators straight from the content stream.
/// Less accurate for complex fonts but tolerant of malformed files.
pub struct ContentStreamStrategy;

impl PageTextStrategy for ContentStreamStrategy {
    fn name(&self) -> &'static str {
        "content_stream"
    }

    fn page_text(&self, doc: &lopdf::Document, _page_number: u32, page_id: ObjectId) -> Result<String, ExtractionError> {
        let content = doc
            .get_page_content(page_id)
            .map_err(|e| ExtractionError::Corrupt(e.to_string()))?;
        let operations = lopdf::content::Content::decode(&content)
            .map_err(|e| ExtractionError::Corrupt(e.to_string()))?
            .operations;

        let mut text = String::new();
        for op in operations {
            match op.operator.as_str() {
                "Tj" | "'" | "\"" => {
                    if let Some(Object::String(bytes, _)) = op.operands.last() {
                        text.push_str(&decode_pdf_string(bytes));
                    }
                }
                "TJ" => {
                    if let Some(Object::Array(items)) = op.operands.first() {
                        for item in items {
                            if let Object::String(bytes, _) = item {
                                text.push_str(&decode_pdf_string(bytes));
                            }
                        }
                    }
                }
                "Td" | "TD" | "T*" => {
                    if !text.ends_with('\n') && !text.ends_with(' ') {
                        text.push(' ');
                    }
                }
                "ET" => {
                    if !text.ends_with('\n') {
                        text.push('\n');
                    }
                }
                _ => {}
            }
        }
        Ok(text)
    }
}

/// UTF-16BE with BOM, then UTF-8, then Latin-1
fn decode_pdf_string(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

// ============ EXTRACTOR ============

pub struct DocumentExtractor {
    tables: TableExtractor,
    pdf_strategies: Vec<Box<dyn PageTextStrategy>>,
}

impl DocumentExtractor {
    pub fn new(heuristics: TableHeuristics) -> Self {
        Self {
            tables: TableExtractor::new(Box::new(super::tables::RegexCaptionDetector), heuristics),
            pdf_strategies: vec![Box::new(LopdfTextStrategy), Box::new(ContentStreamStrategy)],
        }
    }

    /// Extract pages, tables and annotated text from raw bytes
    pub fn extract(&self, bytes: &[u8], mime_type: &str, filename: &str) -> Result<ExtractedDocument, ExtractionError> {
        let format = DocumentFormat::detect(mime_type, filename).ok_or_else(|| {
            ExtractionError::UnsupportedFormat(if mime_type.is_empty() {
                filename.to_string()
            } else {
                mime_type.to_string()
            })
        })?;
        if bytes.len() > MAX_DOCUMENT_BYTES {
            return Err(ExtractionError::TooLarge(bytes.len(), MAX_DOCUMENT_BYTES));
        }

        let mut warnings = Vec::new();
        let raw_pages = match format {
            DocumentFormat::Pdf => self.pdf_pages(bytes, &mut warnings)?,
            DocumentFormat::Docx => docx_pages(bytes)?,
            DocumentFormat::PlainText | DocumentFormat::Markdown => self.plain_pages(bytes),
        };

        if raw_pages.iter().all(|p| p.text.trim().is_empty()) {
            return Err(ExtractionError::NoContent);
        }

        let page_count = raw_pages.len() as u32;
        let with_markers = format == DocumentFormat::Pdf || page_count > 1;

        let mut pages = Vec::with_capacity(raw_pages.len());
        let mut blocks = Vec::with_capacity(raw_pages.len());
        for raw in raw_pages {
            let (page, annotated) = self.annotate_page(raw);
            let annotated = annotated.trim();
            if with_markers {
                blocks.push(format!("[Page {} of {}]\n{}", page.number, page_count, annotated));
            } else if !annotated.is_empty() {
                blocks.push(annotated.to_string());
            }
            pages.push(page);
        }

        let doc = ExtractedDocument {
            format,
            pages,
            text: blocks.join("\n\n"),
            page_count,
            warnings,
        };
        info!(
            filename = %filename,
            pages = doc.page_count,
            tables = doc.table_count(),
            warnings = doc.warnings.len(),
            "Extracted document"
        );
        Ok(doc)
    }

    fn pdf_pages(&self, bytes: &[u8], warnings: &mut Vec<String>) -> Result<Vec<RawPage>, ExtractionError> {
        let doc = lopdf::Document::load_mem(bytes).map_err(|e| ExtractionError::Corrupt(e.to_string()))?;
        let page_ids = doc.get_pages();
        if page_ids.is_empty() {
            return Err(ExtractionError::NoContent);
        }

        let mut pages = Vec::with_capacity(page_ids.len());
        for (number, page_id) in page_ids {
            let text = self.pdf_page_text(&doc, number, page_id).unwrap_or_else(|| {
                warn!(page = number, "No strategy produced text for page");
                warnings.push(format!("Page {}: no extractable text", number));
                String::new()
            });
            let regions = detect_text_tables(&text, self.tables.heuristics());
            pages.push(RawPage { number, text, regions });
        }
        Ok(pages)
    }

    /// Try each strategy in order; the first non-empty result wins
    fn pdf_page_text(&self, doc: &lopdf::Document, number: u32, page_id: ObjectId) -> Option<String> {
        for strategy in &self.pdf_strategies {
            match strategy.page_text(doc, number, page_id) {
                Ok(text) if !text.trim().is_empty() => {
                    debug!(page = number, strategy = strategy.name(), "Page text extracted");
                    return Some(text);
                }
                Ok(_) => {
                    debug!(page = number, strategy = strategy.name(), "Strategy returned no text");
                }
                Err(e) => {
                    debug!(page = number, strategy = strategy.name(), error = %e, "Strategy failed");
                }
            }
        }
        None
    }

    fn plain_pages(&self, bytes: &[u8]) -> Vec<RawPage> {
        let content = String::from_utf8_lossy(bytes).replace("\r\n", "\n");
        content
            .split('\u{c}')
            .enumerate()
            .map(|(i, text)| {
                let regions = detect_text_tables(text, self.tables.heuristics());
                RawPage {
                    number: i as u32 + 1,
                    text: text.to_string(),
                    regions,
                }
            })
            .collect()
    }

    /// Replace each table region with its rendered block
    fn annotate_page(&self, raw: RawPage) -> (Page, String) {
        let RawPage { number, text, regions } = raw;
        let mut annotated = String::with_capacity(text.len());
        let mut tables = Vec::new();
        let mut cursor = 0usize;

        for region in regions {
            if region.start < cursor {
                continue;
            }
            // Only prose since the previous table can caption this one
            let text_before = &text[cursor..region.start];
            let Some(mut table) = self.tables.extract(text_before, &region.grid, number) else {
                debug!(page = number, "Discarded malformed table region");
                continue;
            };
            table.start = region.start;
            table.end = region.end;

            let replace_from = cursor
                + caption_line_offset(text_before, self.tables.detector(), &table.caption)
                    .unwrap_or(text_before.len());
            annotated.push_str(&text[cursor..replace_from]);
            if !annotated.is_empty() && !annotated.ends_with("\n\n") {
                annotated.push_str(if annotated.ends_with('\n') { "\n" } else { "\n\n" });
            }
            annotated.push_str(&table.render_block());
            cursor = region.end;
            tables.push(table);
        }
        annotated.push_str(&text[cursor..]);

        (Page { number, text, tables }, annotated)
    }
}

impl Default for DocumentExtractor {
    fn default() -> Self {
        Self::new(TableHeuristics::default())
    }
}

/// Offset of the caption line directly preceding a table, either a Markdown
/// heading or a bare `Table N-M: ...` line, so it is replaced along with the
/// table instead of being repeated. Sentences that merely cite the table stay.
fn caption_line_offset(text_before: &str, detector: &dyn CaptionDetector, caption: &str) -> Option<usize> {
    let line = line_spans(text_before)
        .into_iter()
        .rev()
        .find(|l| !l.text.trim().is_empty())?;
    let stripped = line.text.trim_start().trim_start_matches('#').trim_start();
    let starts_with_table = stripped
        .get(..5)
        .is_some_and(|word| word.eq_ignore_ascii_case("table"));
    if !starts_with_table {
        return None;
    }
    match detector.detect_caption(stripped) {
        Some(detected) if detected.text == caption => Some(line.start),
        _ => None,
    }
}

// ============ DOCX ============

enum DocxBlock {
    Paragraph(String),
    Table(Vec<Vec<String>>),
}

fn docx_pages(bytes: &[u8]) -> Result<Vec<RawPage>, ExtractionError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ExtractionError::Corrupt(format!("Invalid DOCX archive: {}", e)))?;
    let mut entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractionError::Corrupt("No document.xml found in DOCX".to_string()))?;
    let mut xml = String::new();
    entry.read_to_string(&mut xml)?;

    let mut text = String::new();
    let mut regions = Vec::new();
    for block in parse_docx_blocks(&xml) {
        match block {
            DocxBlock::Paragraph(p) => {
                let p = p.trim();
                if !p.is_empty() {
                    text.push_str(p);
                    text.push_str("\n\n");
                }
            }
            DocxBlock::Table(grid) => {
                if grid.is_empty() {
                    continue;
                }
                let start = text.len();
                let lines: Vec<String> = grid
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|c| super::tables::normalize_cell(c))
                            .collect::<Vec<_>>()
                            .join("\t")
                    })
                    .collect();
                text.push_str(&lines.join("\n"));
                let end = text.len();
                text.push_str("\n\n");
                regions.push(TableRegion { start, end, grid });
            }
        }
    }

    Ok(vec![RawPage {
        number: 1,
        text,
        regions,
    }])
}

/// Walk `word/document.xml` collecting paragraphs and top-level table grids.
/// Nested tables are flattened into the enclosing cell.
fn parse_docx_blocks(xml: &str) -> Vec<DocxBlock> {
    let mut blocks = Vec::new();
    let mut para = String::new();
    let mut cell = String::new();
    let mut row: Vec<String> = Vec::new();
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut in_text = false;
    let mut table_depth = 0usize;
    let mut rest = xml;

    while let Some(lt) = rest.find('<') {
        if in_text && lt > 0 {
            let target = if table_depth > 0 { &mut cell } else { &mut para };
            target.push_str(&decode_xml_entities(&rest[..lt]));
        }
        let after = &rest[lt..];
        let Some(gt) = after.find('>') else {
            break;
        };
        let tag = &after[1..gt];
        rest = &after[gt + 1..];

        let closing = tag.starts_with('/');
        let self_closing = tag.ends_with('/');
        let name = tag
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or("");
        let target = if table_depth > 0 { &mut cell } else { &mut para };

        match name {
            "w:t" => in_text = !closing && !self_closing,
            "w:tab" if !closing => target.push('\t'),
            "w:br" | "w:cr" if !closing => target.push('\n'),
            "w:p" if closing || self_closing => {
                if table_depth > 0 {
                    cell.push('\n');
                } else {
                    blocks.push(DocxBlock::Paragraph(std::mem::take(&mut para)));
                }
            }
            "w:tbl" if !closing && !self_closing => {
                table_depth += 1;
                if table_depth == 1 {
                    rows.clear();
                }
            }
            "w:tbl" if closing => {
                if table_depth == 1 {
                    blocks.push(DocxBlock::Table(std::mem::take(&mut rows)));
                }
                table_depth = table_depth.saturating_sub(1);
            }
            "w:tr" if table_depth == 1 => {
                if closing {
                    rows.push(std::mem::take(&mut row));
                } else {
                    row.clear();
                }
            }
            "w:tc" if table_depth == 1 => {
                if closing {
                    row.push(cell.trim().to_string());
                }
                cell.clear();
            }
            _ => {}
        }
    }

    if !para.trim().is_empty() {
        blocks.push(DocxBlock::Paragraph(para));
    }
    blocks
}

fn decode_xml_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp..];
        let Some(semi) = after.find(';') else {
            out.push_str(after);
            return out;
        };
        let entity = &after[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &after[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &after[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
