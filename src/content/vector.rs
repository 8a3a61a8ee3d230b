//! Semantic vectors and similarity.

use async_trait::async_trait;

use crate::Result;

/// Turns text into a fixed-length numeric embedding.
///
/// Contract: the same input always yields the same vector, and every vector
/// from one implementation has `dimensions()` entries.
#[async_trait]
pub trait Vectorizer: Send + Sync {
    /// Length of every vector this implementation produces.
    fn dimensions(&self) -> usize;

    async fn vectorize(&self, text: &str) -> Result<Vec<f32>>;
}

/// Placeholder embedding: per-letter frequency histogram.
///
/// 26 buckets (`a`..=`z`, case-insensitive), each count divided by the number
/// of characters in the text. Empty text maps to the zero vector.
#[derive(Debug, Clone, Copy, Default)]
pub struct LetterFrequencyVectorizer;

impl LetterFrequencyVectorizer {
    pub const DIMENSIONS: usize = 26;

    pub fn histogram(text: &str) -> Vec<f32> {
        let mut buckets = vec![0.0f32; Self::DIMENSIONS];
        let mut length = 0usize;

        for c in text.chars() {
            length += 1;
            let lower = c.to_ascii_lowercase();
            if lower.is_ascii_lowercase() {
                buckets[(lower as u8 - b'a') as usize] += 1.0;
            }
        }

        if length > 0 {
            let length = length as f32;
            for bucket in &mut buckets {
                *bucket /= length;
            }
        }
        buckets
    }
}

#[async_trait]
impl Vectorizer for LetterFrequencyVectorizer {
    fn dimensions(&self) -> usize {
        Self::DIMENSIONS
    }

    async fn vectorize(&self, text: &str) -> Result<Vec<f32>> {
        Ok(Self::histogram(text))
    }
}

/// Cosine similarity in `[-1, 1]`.
///
/// Vectors of different lengths are compared as if the shorter one were
/// zero-padded. Returns 0 when either vector has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().max(b.len());
    let component = |v: &[f32], i: usize| f64::from(v.get(i).copied().unwrap_or(0.0));

    let mut dot_product = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for i in 0..len {
        let x = component(a, i);
        let y = component(b, i);
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let similarity = dot_product / (norm_a.sqrt() * norm_b.sqrt());
    if !similarity.is_finite() {
        return 0.0;
    }
    similarity.clamp(-1.0, 1.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-6;

    #[test]
    fn test_self_similarity_is_one() {
        for v in [
            vec![1.0, 0.0, 0.0],
            vec![0.3, -2.5, 7.0, 0.001],
            vec![1e-3; 26],
            LetterFrequencyVectorizer::histogram("The quick brown fox"),
        ] {
            assert!((cosine_similarity(&v, &v) - 1.0).abs() < EPS, "{:?}", v);
        }
    }

    #[test]
    fn test_zero_vector_similarity_is_zero() {
        let zero = vec![0.0; 3];
        assert_eq!(cosine_similarity(&zero, &zero), 0.0);
        assert_eq!(cosine_similarity(&zero, &[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_orthogonal_and_opposite() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < EPS);
        assert!((cosine_similarity(&[1.0, 2.0], &[-1.0, -2.0]) + 1.0).abs() < EPS);
    }

    #[test]
    fn test_scale_invariant() {
        let a = [0.2, 0.4, 0.1];
        let b = [2.0, 4.0, 1.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < EPS);
    }

    #[test]
    fn test_known_value() {
        // [1,0,0] vs [0.9,0.1,0] = 0.9 / sqrt(0.82)
        let expected = (0.9f64 / 0.82f64.sqrt()) as f32;
        assert!((cosine_similarity(&[1.0, 0.0, 0.0], &[0.9, 0.1, 0.0]) - expected).abs() < EPS);
    }

    // Mismatched lengths are zero-padded rather than rejected, so vectors from
    // different embedding spaces still compare.
    #[test]
    fn test_mismatched_lengths_are_zero_padded() {
        let short = [1.0, 0.0];
        let long = [1.0, 0.0, 0.0, 0.0];
        assert!((cosine_similarity(&short, &long) - 1.0).abs() < EPS);

        let padded_away = [1.0, 0.0, 5.0];
        let expected = (1.0f64 / 26.0f64.sqrt()) as f32;
        assert!((cosine_similarity(&short, &padded_away) - expected).abs() < EPS);
        assert_eq!(
            cosine_similarity(&short, &padded_away),
            cosine_similarity(&padded_away, &short)
        );
    }

    #[test]
    fn test_histogram_normalized_by_length() {
        let v = LetterFrequencyVectorizer::histogram("aAb!");
        assert_eq!(v.len(), LetterFrequencyVectorizer::DIMENSIONS);
        assert!((v[0] - 0.5).abs() < EPS);
        assert!((v[1] - 0.25).abs() < EPS);
        assert!(v[2..].iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_histogram_empty_and_non_letters() {
        assert!(LetterFrequencyVectorizer::histogram("").iter().all(|x| *x == 0.0));
        assert!(LetterFrequencyVectorizer::histogram("1234 !? éü").iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_vectorizer_is_deterministic() {
        let vectorizer = LetterFrequencyVectorizer;
        let a = vectorizer.vectorize("Launch day thread").await.unwrap();
        let b = vectorizer.vectorize("Launch day thread").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), vectorizer.dimensions());
        assert_eq!(
            vectorizer.vectorize("").await.unwrap().len(),
            vectorizer.dimensions()
        );
    }
}
