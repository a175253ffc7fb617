//! Size accounting strategies for the memory tier.

use crate::cache::key::CacheKey;

/// Decides how many bytes an entry counts against the memory-tier budget.
///
/// Receives the serialized payload so estimates are deterministic.
pub trait SizeEstimator: Send + Sync {
    fn estimate(&self, key: &CacheKey, encoded: &[u8]) -> usize;
}

/// Counts the serialized byte length.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerializedLength;

impl SizeEstimator for SerializedLength {
    fn estimate(&self, _key: &CacheKey, encoded: &[u8]) -> usize {
        encoded.len()
    }
}

/// Counts every entry as the same size.
#[derive(Debug, Clone, Copy)]
pub struct FixedSize(pub usize);

impl SizeEstimator for FixedSize {
    fn estimate(&self, _key: &CacheKey, _encoded: &[u8]) -> usize {
        self.0
    }
}

impl<F> SizeEstimator for F
where
    F: Fn(&CacheKey, &[u8]) -> usize + Send + Sync,
{
    fn estimate(&self, key: &CacheKey, encoded: &[u8]) -> usize {
        self(key, encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimators() {
        let key = CacheKey::new("c", "k");
        assert_eq!(SerializedLength.estimate(&key, b"12345"), 5);
        assert_eq!(FixedSize(64).estimate(&key, b"12345"), 64);

        let by_collection = |key: &CacheKey, encoded: &[u8]| {
            if key.collection == "images" {
                encoded.len() * 4
            } else {
                encoded.len()
            }
        };
        assert_eq!(by_collection.estimate(&CacheKey::new("images", "x"), b"ab"), 8);
    }
}
