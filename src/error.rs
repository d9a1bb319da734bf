//! Configuration errors for dictionaries and trainers.
//!
//! Everything else in the crate propagates through `anyhow::Result`; these
//! variants exist so callers can tell misuse apart from runtime failures
//! (`err.downcast_ref::<ConfigError>()`).

use thiserror::Error;

/// Invalid construction parameters. Always fatal, never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Group sizes do not partition the dictionary
    #[error("group sizes {group_sizes:?} sum to {sum}, expected dict_size={dict_size}")]
    GroupSizeSum {
        group_sizes: Vec<usize>,
        sum: usize,
        dict_size: usize,
    },

    /// A group with no features
    #[error("all group sizes must be positive, got {group_sizes:?}")]
    EmptyGroup { group_sizes: Vec<usize> },

    /// Sparsity budget must be at least one feature per sample
    #[error("k={k} must be a positive integer")]
    InvalidK { k: i64 },

    /// Caller-supplied k disagrees with the k stored in a dictionary file
    #[error("k={requested} != {stored}=stored k")]
    KMismatch { requested: usize, stored: usize },

    /// Group fractions must form a distribution
    #[error("group fractions {fractions:?} sum to {sum}, expected 1.0")]
    FractionSum { fractions: Vec<f64>, sum: f64 },

    /// Group weights and group sizes must line up one-to-one
    #[error("got {weights} group weights for {groups} groups")]
    WeightCount { weights: usize, groups: usize },

    /// Learning-rate schedule boundaries out of order
    #[error("invalid schedule: {0}")]
    Schedule(String),

    /// Probability or temperature outside the domain of log/softmax
    #[error("invalid weighting input: {0}")]
    Weighting(String),

    /// active_groups outside 1..=n_groups
    #[error("active_groups={requested} out of range 1..={n_groups}")]
    ActiveGroups { requested: usize, n_groups: usize },

    /// Any other inconsistent setting
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Schedule boundary error
    pub fn schedule(msg: impl Into<String>) -> Self {
        Self::Schedule(msg.into())
    }

    /// Generic invalid configuration
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}
