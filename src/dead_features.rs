//! Per-feature "tokens since last fired" counters.

/// Tokens after which a silent feature counts as dead.
pub const DEAD_FEATURE_THRESHOLD: u64 = 10_000_000;

/// Counts, for every feature, how many tokens have gone by since it was last
/// nonzero in a batch.
#[derive(Debug, Clone)]
pub struct DeadFeatureTracker {
    tokens_since_fired: Vec<u64>,
}

impl DeadFeatureTracker {
    pub fn new(dict_size: usize) -> Self {
        Self {
            tokens_since_fired: vec![0; dict_size],
        }
    }

    /// Advance every counter by `batch_size`, then reset those that fired.
    pub fn update(&mut self, fired: &[bool], batch_size: usize) {
        debug_assert_eq!(fired.len(), self.tokens_since_fired.len());
        for (count, &did_fire) in self.tokens_since_fired.iter_mut().zip(fired) {
            if did_fire {
                *count = 0;
            } else {
                *count += batch_size as u64;
            }
        }
    }

    /// Indices of features whose counter reached `threshold`.
    pub fn dead_indices(&self, threshold: u64) -> Vec<usize> {
        self.tokens_since_fired
            .iter()
            .enumerate()
            .filter(|(_, &count)| count >= threshold)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn dead_count(&self, threshold: u64) -> usize {
        self.tokens_since_fired
            .iter()
            .filter(|&&count| count >= threshold)
            .count()
    }

    pub fn counts(&self) -> &[u64] {
        &self.tokens_since_fired
    }
}
