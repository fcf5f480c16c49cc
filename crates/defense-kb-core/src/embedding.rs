//! Embedding service contract and vector utilities.
//!
//! Defines the [`Embedder`] trait every embedding backend implements, plus
//! pure helpers for vector serialization and similarity.
//!
//! Concrete providers (fastembed, OpenAI, Ollama) live in the `defense-kb`
//! app crate. The embedder is stateless with respect to indexed content, so
//! one handle is shared read-only by the builder and every query.

use anyhow::Result;
use async_trait::async_trait;

/// Opaque embedding service: `embed(texts) → vectors`.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"bge-small-en-v1.5"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality (e.g. `384`).
    fn dims(&self) -> usize;

    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single text through the batch interface.
pub async fn embed_one(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    let mut vectors = embedder.embed(&[text.to_string()]).await?;
    if vectors.is_empty() {
        anyhow::bail!("embedder returned no vector for a single input");
    }
    Ok(vectors.swap_remove(0))
}

/// Little-endian `f32` bytes, as stored in a generation's `embedding` column.
///
/// ```rust
/// use defense_kb_core::embedding::{blob_to_vec, vec_to_blob};
///
/// let v = [0.5f32, -4.0];
/// assert_eq!(vec_to_blob(&v).len(), 8);
/// assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// Inverse of [`vec_to_blob`]; a trailing partial value is dropped.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .filter_map(|c| c.try_into().ok().map(f32::from_le_bytes))
        .collect()
}

/// Cosine similarity. Mismatched lengths, empty input, and zero-norm
/// vectors all score `0.0`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let (dot, aa, bb) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, aa, bb), (x, y)| {
            (dot + x * y, aa + x * x, bb + y * y)
        });

    let norms = (aa * bb).sqrt();
    if norms < f32::EPSILON {
        0.0
    } else {
        dot / norms
    }
}
