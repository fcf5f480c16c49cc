//! # defense-kb core
//!
//! Shared logic for defense-kb: the document model, the embedding service
//! contract, the in-memory vector index a generation serves from, and the
//! derived artifacts (statistics, threat reverse index, id suggestions)
//! computed while a generation is built.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. Everything in it
//! operates on values already in memory.

pub mod embedding;
pub mod index;
pub mod lookup;
pub mod models;
pub mod stats;
pub mod threat;
