//! Token counting using tiktoken-rs.
//!
//! Uses cl100k_base encoding as an estimate for prompt budgets. Counts are
//! cached by content hash since the same chunks come back for every query
//! on a document.

use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::warn;

const CACHE_CAPACITY: usize = 10_000;

static BPE: LazyLock<Option<CoreBPE>> = LazyLock::new(|| match cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        warn!(error = %e, "cl100k_base unavailable, falling back to estimates");
        None
    }
});

static TOKEN_CACHE: LazyLock<RwLock<TokenCache>> = LazyLock::new(|| RwLock::new(TokenCache::new(CACHE_CAPACITY)));

/// Token counts keyed by content hash
struct TokenCache {
    counts: HashMap<u64, u32>,
    capacity: usize,
}

impl TokenCache {
    fn new(capacity: usize) -> Self {
        Self {
            counts: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    fn get(&self, hash: u64) -> Option<u32> {
        self.counts.get(&hash).copied()
    }

    fn insert(&mut self, hash: u64, count: u32) {
        // At capacity, drop half rather than tracking recency
        if self.counts.len() >= self.capacity {
            let evict: Vec<u64> = self.counts.keys().take(self.capacity / 2).copied().collect();
            for key in evict {
                self.counts.remove(&key);
            }
        }
        self.counts.insert(hash, count);
    }
}

fn hash_content(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

/// Count tokens in text using cl100k_base encoding
pub fn count_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }

    let hash = hash_content(text);
    if let Some(count) = TOKEN_CACHE.read().get(hash) {
        return count;
    }

    let count = match BPE.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u32,
        None => estimate_tokens_quick(text),
    };
    TOKEN_CACHE.write().insert(hash, count);
    count
}

/// ~4 bytes per token
pub fn estimate_tokens_quick(text: &str) -> u32 {
    (text.len() as f64 / 4.0).ceil() as u32
}
