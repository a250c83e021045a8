//! Chroma Vector Database Integration
//!
//! REST client, collection helpers and the `VectorIndex` adapter used when
//! chunks are stored in a Chroma server instead of in process.

pub mod client;
pub mod collections;
pub mod index;

pub use client::{ChromaClient, ChromaError};
pub use index::ChromaIndex;
