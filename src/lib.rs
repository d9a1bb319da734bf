// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in stored metadata
#![allow(clippy::many_single_char_names)] // x, f, k standard in math
#![allow(clippy::similar_names)] // related variables like `w_enc`/`w_dec`
#![allow(clippy::module_name_repetitions)] // DictionaryKind in checkpoint.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // i64→usize when value is known positive

//! dictlearn-rs: Matroyshka batch top-k sparse autoencoders
//!
//! Learns sparse dictionaries over language-model activations whose
//! features are ordered into nested groups, so every prefix of groups is a
//! usable smaller dictionary.
//!
//! ## Architecture
//!
//! - `dictionary`: MatroyshkaDictionary (encode/decode, decoder constraints, safetensors I/O)
//! - `groups`: Nested feature groups and their prefix-sum boundaries
//! - `trainer`: MatroyshkaTrainer with nested reconstruction and auxiliary dead-feature loss
//! - `schedule`: Warm-up / plateau / decay learning-rate schedule
//! - `dead_features`: Tokens-since-fired counters
//! - `geometric_median`: Weiszfeld estimator used to seed the decoder bias
//! - `weighting`: Temperature-scaled group weights and group sizes from fractions
//! - `checkpoint`: Run directories, config records, dictionary dispatch on load
//! - `activations`: Activation sources and in-memory shuffled batching
//! - `training`: Training loop with logging and checkpoints
//! - `evaluation`: Reconstruction and sparsity metrics
//! - `error`: Configuration error taxonomy

pub mod activations;
pub mod checkpoint;
pub mod dead_features;
pub mod dictionary;
pub mod error;
pub mod evaluation;
pub mod geometric_median;
pub mod groups;
pub mod schedule;
pub mod trainer;
pub mod training;
pub mod weighting;

pub use activations::{ActivationSource, InMemoryActivations};
pub use checkpoint::{
    load_dictionary, save_checkpoint, save_run, Dictionary, DictionaryKind, RunConfig,
    TrainerRecord,
};
pub use dead_features::{DeadFeatureTracker, DEAD_FEATURE_THRESHOLD};
pub use dictionary::{EncodeOutput, MatroyshkaDictionary, UNSET_THRESHOLD};
pub use error::ConfigError;
pub use evaluation::{evaluate, EvalMetrics};
pub use geometric_median::geometric_median;
pub use groups::FeatureGroups;
pub use schedule::{LrSchedule, TrainingPhase};
pub use trainer::{
    clip_grad_norm, default_lr, LossLog, LossOutput, MatroyshkaTrainer, TrainerConfig,
    TrainerDiagnostics,
};
pub use training::{train_dictionary, TrainOptions, TrainingSummary};
pub use weighting::{apply_temperature, group_sizes_from_fractions};
