//! Nested feature groups.
//!
//! The dictionary's feature axis `[0, dict_size)` is split into contiguous
//! groups. Group `i` spans `indices[i]..indices[i + 1]`, and the `i`-th
//! nested sub-dictionary is every feature before `indices[i + 1]`.

use crate::error::ConfigError;

/// Validated group sizes together with their prefix sums.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureGroups {
    sizes: Vec<usize>,
    /// Prefix sums, length `sizes.len() + 1`, starting at 0
    indices: Vec<usize>,
}

impl FeatureGroups {
    /// Build groups that must exactly partition `dict_size` features.
    pub fn new(group_sizes: &[usize], dict_size: usize) -> Result<Self, ConfigError> {
        if group_sizes.is_empty() || group_sizes.iter().any(|&s| s == 0) {
            return Err(ConfigError::EmptyGroup {
                group_sizes: group_sizes.to_vec(),
            });
        }
        let sum: usize = group_sizes.iter().sum();
        if sum != dict_size {
            return Err(ConfigError::GroupSizeSum {
                group_sizes: group_sizes.to_vec(),
                sum,
                dict_size,
            });
        }

        let mut indices = Vec::with_capacity(group_sizes.len() + 1);
        indices.push(0);
        let mut acc = 0;
        for &size in group_sizes {
            acc += size;
            indices.push(acc);
        }

        Ok(Self {
            sizes: group_sizes.to_vec(),
            indices,
        })
    }

    /// Number of groups
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    /// Always false for a validated partition
    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Prefix-sum boundaries (`len() + 1` entries)
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Half-open feature range `(start, end)` of group `i`.
    pub fn bounds(&self, i: usize) -> (usize, usize) {
        (self.indices[i], self.indices[i + 1])
    }

    /// First feature index outside the first `active` groups.
    pub fn end_of(&self, active: usize) -> usize {
        self.indices[active]
    }

    /// Total number of features
    pub fn dict_size(&self) -> usize {
        self.indices[self.sizes.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_sums() {
        let groups = FeatureGroups::new(&[2, 3, 5], 10).unwrap();
        assert_eq!(groups.indices(), &[0, 2, 5, 10]);
        assert_eq!(groups.bounds(1), (2, 5));
        assert_eq!(groups.end_of(2), 5);
        assert_eq!(groups.dict_size(), 10);
        assert_eq!(groups.len(), 3);
    }

    #[test]
    fn test_rejects_bad_sum() {
        let err = FeatureGroups::new(&[4, 3], 8).unwrap_err();
        assert_eq!(
            err,
            ConfigError::GroupSizeSum {
                group_sizes: vec![4, 3],
                sum: 7,
                dict_size: 8
            }
        );
    }

    #[test]
    fn test_rejects_empty_group() {
        let err = FeatureGroups::new(&[8, 0], 8).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyGroup { .. }));
        assert!(FeatureGroups::new(&[], 0).is_err());
    }
}
