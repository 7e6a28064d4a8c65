//! Deterministic, hash-seeded embedding synthesis.
//!
//! This is a local fingerprint, not a semantic embedding: similarity between
//! two vectors reflects shared character-hash structure, not meaning. The
//! completion provider in use offers no embedding endpoint, so ingestion and
//! query paths both run this placeholder. Swapping in a real embedding model
//! only requires keeping the dimension and unit-norm contract.

/// Default embedding dimension, matching the index the system ships with.
pub const DEFAULT_DIMENSION: usize = 1536;

/// Pure, infrastructure-free embedding generator.
///
/// `embed` is deterministic: identical text (after lowercasing and trimming)
/// always yields the identical vector, with no network call and no failure
/// mode. The empty string is valid and maps to the all-zero-seed vector.
#[derive(Debug, Clone)]
pub struct Embedder {
    dimension: usize,
}

impl Embedder {
    /// Builds a generator emitting vectors of the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    /// Configured output dimension.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Synthesizes a unit-normalized vector for the given text.
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let clean = text.to_lowercase();
        let clean = clean.trim();
        let chars: Vec<char> = clean.chars().collect();
        let mid = chars.len() / 2;
        let first_half: String = chars[..mid].iter().collect();
        let second_half: String = chars[mid..].iter().collect();
        let letter_count = chars.iter().filter(|ch| ch.is_ascii_lowercase()).count();

        let seeds = [
            rolling_hash(clean),
            rolling_hash(&first_half),
            rolling_hash(&second_half),
            chars.len() as f64,
            letter_count as f64,
        ];

        let mut vector = Vec::with_capacity(self.dimension);
        for i in 0..self.dimension {
            let seed = seeds[i % seeds.len()];
            let angle = (seed + i as f64 * 0.1) * std::f64::consts::PI;
            vector.push((angle.sin() * (angle * 0.5).cos()) as f32);
        }

        let norm = vector
            .iter()
            .map(|v| f64::from(*v) * f64::from(*v))
            .sum::<f64>()
            .sqrt();
        let divisor = if norm == 0.0 { 1.0 } else { norm };
        for v in &mut vector {
            *v = (f64::from(*v) / divisor) as f32;
        }
        vector
    }
}

impl Default for Embedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

// Polynomial rolling hash truncated to signed 32 bits, absolute value taken.
// Runs over Unicode scalar values.
fn rolling_hash(text: &str) -> f64 {
    let mut hash: i32 = 0;
    for ch in text.chars() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(ch as i32);
    }
    f64::from(hash.unsigned_abs())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(vector: &[f32]) -> f64 {
        vector
            .iter()
            .map(|v| f64::from(*v) * f64::from(*v))
            .sum::<f64>()
            .sqrt()
    }

    #[test]
    fn deterministic_across_calls() {
        let embedder = Embedder::new(64);
        assert_eq!(embedder.embed("hello world"), embedder.embed("hello world"));
    }

    #[test]
    fn case_and_whitespace_normalize() {
        let embedder = Embedder::new(64);
        assert_eq!(
            embedder.embed("  Hello World "),
            embedder.embed("hello world")
        );
    }

    #[test]
    fn unit_norm_and_dimension() {
        let embedder = Embedder::new(DEFAULT_DIMENSION);
        let vector = embedder.embed("the quick brown fox");
        assert_eq!(vector.len(), DEFAULT_DIMENSION);
        assert!((norm(&vector) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn empty_text_is_defined() {
        let embedder = Embedder::new(32);
        let vector = embedder.embed("");
        assert_eq!(vector.len(), 32);
        assert!((norm(&vector) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn distinct_texts_differ() {
        let embedder = Embedder::new(64);
        assert_ne!(embedder.embed("alpha"), embedder.embed("omega"));
    }
}
