//! Context Assembly
//!
//! Turns ranked search results into one prompt-ready context block plus the
//! citation list shown next to an answer. Chunks are included whole or not
//! at all, so a rendered table never reaches the model half cut.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::tokens::count_tokens;
use crate::config::RetrievalConfig;
use crate::documents::index::SearchResult;

pub const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Characters of chunk text kept in a source snippet
pub const SNIPPET_CHARS: usize = 150;

/// Reply used when nothing relevant was retrieved
pub const NO_CONTEXT_MESSAGE: &str = "I don't have enough context from your documents to answer that question. \
Try uploading a document that covers it, or rephrase the question.";

const SYSTEM_PROMPT: &str = "You are a helpful assistant answering questions about the user's documents. \
Answer from the context below. Tables are given in Markdown; quote their values exactly and name the table \
you took them from. If the context does not contain the answer, say so.";

/// Citation for one chunk used in the context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: String,
    pub snippet: String,
    pub metadata: Value,
    pub score: f32,
    pub contains_table: bool,
    pub contains_requested_table: bool,
}

impl From<&SearchResult> for Source {
    fn from(result: &SearchResult) -> Self {
        Self {
            id: result.id.clone(),
            snippet: snippet(&result.text),
            metadata: result.metadata.clone(),
            score: result.score,
            contains_table: result.contains_table,
            contains_requested_table: result.contains_requested_table,
        }
    }
}

/// First `SNIPPET_CHARS` characters, `...` appended when cut
pub fn snippet(text: &str) -> String {
    match text.char_indices().nth(SNIPPET_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledContext {
    pub context: String,
    pub sources: Vec<Source>,
    pub token_count: u32,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.context.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// What to send to the chat model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptPlan {
    Augmented(Vec<ChatMessage>),
    /// Nothing usable was retrieved; answer with this text instead
    NoContext(&'static str),
}

/// Augmented messages, or the no-context reply when `context` is empty
pub fn build_prompt(query: &str, context: &AssembledContext) -> PromptPlan {
    if context.is_empty() {
        return PromptPlan::NoContext(NO_CONTEXT_MESSAGE);
    }
    PromptPlan::Augmented(vec![
        ChatMessage::system(format!("{}\n\nContext:\n{}", SYSTEM_PROMPT, context.context)),
        ChatMessage::user(query),
    ])
}

pub struct ContextAssembler {
    max_chunks: usize,
    max_tokens: Option<u32>,
}

impl ContextAssembler {
    pub fn new(max_chunks: usize, max_tokens: Option<u32>) -> Self {
        Self {
            max_chunks: max_chunks.max(1),
            max_tokens,
        }
    }

    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self::new(config.max_context_chunks, config.max_context_tokens)
    }

    /// Pick which results make it in, in rank order
    fn select<'a>(&self, results: &'a [SearchResult], prefer_tables: bool) -> Vec<&'a SearchResult> {
        let mut kept: Vec<&SearchResult> = results.iter().take(self.max_chunks).collect();

        let flagged = |r: &SearchResult| r.contains_table || r.contains_requested_table;
        if prefer_tables && !kept.iter().any(|r| flagged(r)) {
            if let Some(best_table) = results.iter().skip(kept.len()).find(|r| flagged(r)) {
                kept.pop();
                kept.push(best_table);
            }
        }
        kept
    }

    /// Join whole chunks within the chunk and token budgets
    pub fn assemble(&self, results: &[SearchResult], prefer_tables: bool) -> AssembledContext {
        let separator_tokens = count_tokens(CONTEXT_SEPARATOR);
        let mut parts: Vec<&str> = Vec::new();
        let mut sources = Vec::new();
        let mut token_count = 0u32;

        for result in self.select(results, prefer_tables) {
            if result.text.trim().is_empty() {
                continue;
            }
            let cost = count_tokens(&result.text) + if parts.is_empty() { 0 } else { separator_tokens };
            if let Some(limit) = self.max_tokens {
                if token_count + cost > limit {
                    debug!(chunk_id = %result.id, cost, limit, "Chunk skipped, over token budget");
                    continue;
                }
            }
            token_count += cost;
            parts.push(&result.text);
            sources.push(Source::from(result));
        }

        AssembledContext {
            context: parts.join(CONTEXT_SEPARATOR),
            sources,
            token_count,
        }
    }
}
