//! Embedding provider boundary.
//!
//! The engine never talks to a model directly. Callers hand it an
//! [`EmbeddingGenerator`] which turns text into float vectors; the engine
//! quantizes them and takes it from there.

use crate::vector::quantize::QuantizedVector;
use crate::vector::types::{VectorDimension, VectorError};
use std::hash::{DefaultHasher, Hash, Hasher};

/// Trait for generating embeddings from text.
///
/// Implementations must be thread-safe as embedding generation
/// may happen in parallel.
pub trait EmbeddingGenerator: Send + Sync {
    /// Generate embeddings for a batch of texts.
    ///
    /// # Errors
    /// Returns an error if embedding generation fails.
    fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError>;

    /// Get the dimension of embeddings produced by this generator.
    fn dimension(&self) -> VectorDimension;

    /// Generate embeddings and quantize them for storage or querying.
    fn embed_quantized(&self, texts: &[&str]) -> Result<Vec<QuantizedVector>, VectorError> {
        let embeddings = self.generate_embeddings(texts)?;
        let dimension = self.dimension();
        embeddings
            .iter()
            .map(|embedding| {
                dimension.validate_vector(embedding)?;
                QuantizedVector::encode(embedding)
            })
            .collect()
    }
}

/// Deterministic feature-hashing generator.
///
/// Every whitespace-separated lowercase token is hashed into one slot with a
/// signed weight, so texts sharing words land close together. Used by tests
/// and the CLI demo where no real model is available.
#[derive(Debug, Clone, Copy)]
pub struct MockEmbeddingGenerator {
    dimension: VectorDimension,
}

impl MockEmbeddingGenerator {
    /// Create a generator with the given dimension.
    #[must_use]
    pub fn with_dimension(dimension: VectorDimension) -> Self {
        Self { dimension }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let dim = self.dimension.get();
        // small constant floor keeps empty text from producing a zero vector
        let mut embedding = vec![0.01; dim];

        for token in text.split_whitespace() {
            let mut hasher = DefaultHasher::new();
            token.to_lowercase().hash(&mut hasher);
            let hash = hasher.finish();
            let slot = (hash % dim as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            embedding[slot] += sign;
        }

        let magnitude: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut embedding {
                *value /= magnitude;
            }
        }
        embedding
    }
}

impl EmbeddingGenerator for MockEmbeddingGenerator {
    fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::similarity::cosine;

    fn generator() -> MockEmbeddingGenerator {
        MockEmbeddingGenerator::with_dimension(VectorDimension::new(64).unwrap())
    }

    #[test]
    fn test_mock_generator_is_deterministic() {
        let generator = generator();
        let first = generator.generate_embeddings(&["parse json"]).unwrap();
        let second = generator.generate_embeddings(&["parse json"]).unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].len(), 64);
    }

    #[test]
    fn test_shared_words_are_more_similar() {
        let generator = generator();
        let vectors = generator
            .generate_embeddings(&[
                "rust vector search engine",
                "vector search engine in rust",
                "banana bread recipe",
            ])
            .unwrap();

        assert!(cosine(&vectors[0], &vectors[1]) > cosine(&vectors[0], &vectors[2]));
    }

    #[test]
    fn test_embed_quantized() {
        let generator = generator();
        let quantized = generator.embed_quantized(&["a", "b c"]).unwrap();
        assert_eq!(quantized.len(), 2);
        assert!(quantized.iter().all(|q| q.len() == 64));
    }
}
