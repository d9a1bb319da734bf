//! Run directories: weights plus the config that produced them.
//!
//! ```text
//! <run>/
//!   ae.safetensors              final dictionary
//!   config.json                 {"trainer": {...}}
//!   checkpoints/ae_<step>.safetensors
//! ```
//!
//! The dictionary variant is recorded as a tagged enum (`dict_class`) so a
//! loader can rebuild the right type without guessing from tensor names.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dictionary::MatroyshkaDictionary;
use crate::trainer::MatroyshkaTrainer;

/// Final weights file inside a run directory.
pub const WEIGHTS_FILE: &str = "ae.safetensors";

/// Run config file inside a run directory.
pub const CONFIG_FILE: &str = "config.json";

/// Intermediate checkpoints live here, relative to the run directory.
pub const CHECKPOINT_DIR: &str = "checkpoints";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Dictionary variant plus the constructor arguments not recoverable from
/// tensor shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "dict_class")]
pub enum DictionaryKind {
    #[serde(rename = "MatroyshkaBatchTopKSAE")]
    MatroyshkaBatchTopK { k: usize, group_sizes: Vec<usize> },
}

/// Serialized trainer hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerRecord {
    pub trainer_class: String,
    pub dictionary: DictionaryKind,
    pub lr: f64,
    pub steps: usize,
    pub auxk_alpha: f64,
    pub warmup_steps: usize,
    pub decay_start: Option<usize>,
    pub threshold_beta: f64,
    pub threshold_start_step: usize,
    pub top_k_aux: usize,
    pub dead_feature_threshold: u64,
    pub seed: Option<u64>,
    pub activation_dim: usize,
    pub dict_size: usize,
    pub group_fractions: Vec<f64>,
    pub group_weights: Vec<f64>,
    pub weights_temperature: f64,
    pub device: String,
    pub layer: usize,
    pub lm_name: String,
    pub run_name: String,
    pub submodule_name: Option<String>,
}

/// Contents of `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub trainer: TrainerRecord,
}

impl RunConfig {
    /// Read `config.json` from a run directory.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(CONFIG_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read run config {}", path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run config {}", path.display()))?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Loaded dictionaries
// ---------------------------------------------------------------------------

/// A dictionary of any supported kind.
pub enum Dictionary {
    MatroyshkaBatchTopK(MatroyshkaDictionary),
}

impl Dictionary {
    pub fn kind(&self) -> DictionaryKind {
        match self {
            Self::MatroyshkaBatchTopK(ae) => DictionaryKind::MatroyshkaBatchTopK {
                k: ae.k(),
                group_sizes: ae.group_sizes().to_vec(),
            },
        }
    }

    pub fn activation_dim(&self) -> usize {
        match self {
            Self::MatroyshkaBatchTopK(ae) => ae.activation_dim(),
        }
    }

    pub fn dict_size(&self) -> usize {
        match self {
            Self::MatroyshkaBatchTopK(ae) => ae.dict_size(),
        }
    }

    /// Inference-time encoding.
    pub fn encode(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::MatroyshkaBatchTopK(ae) => ae.encode(x, true),
        }
    }

    pub fn decode(&self, codes: &Tensor) -> Result<Tensor> {
        match self {
            Self::MatroyshkaBatchTopK(ae) => ae.decode(codes),
        }
    }

    /// Reconstruction and sparse code.
    pub fn forward_with_features(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        match self {
            Self::MatroyshkaBatchTopK(ae) => ae.forward_with_features(x),
        }
    }

    pub fn as_matroyshka(&self) -> Option<&MatroyshkaDictionary> {
        match self {
            Self::MatroyshkaBatchTopK(ae) => Some(ae),
        }
    }
}

impl From<MatroyshkaDictionary> for Dictionary {
    fn from(ae: MatroyshkaDictionary) -> Self {
        Self::MatroyshkaBatchTopK(ae)
    }
}

// ---------------------------------------------------------------------------
// Save / load
// ---------------------------------------------------------------------------

/// Write the trainer's dictionary and config into `dir`.
pub fn save_run(trainer: &MatroyshkaTrainer, dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create run directory {}", dir.display()))?;

    trainer.dictionary().save(dir.join(WEIGHTS_FILE))?;

    let config = RunConfig {
        trainer: trainer.config_record(),
    };
    let config_path = dir.join(CONFIG_FILE);
    std::fs::write(&config_path, serde_json::to_string_pretty(&config)?)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    info!("Saved run to {}", dir.display());
    Ok(())
}

/// Write an intermediate checkpoint and return its path.
pub fn save_checkpoint(trainer: &MatroyshkaTrainer, dir: impl AsRef<Path>, step: usize) -> Result<PathBuf> {
    let checkpoint_dir = dir.as_ref().join(CHECKPOINT_DIR);
    std::fs::create_dir_all(&checkpoint_dir)
        .with_context(|| format!("Failed to create {}", checkpoint_dir.display()))?;
    let path = checkpoint_dir.join(format!("ae_{step}.safetensors"));
    trainer.dictionary().save(&path)?;
    Ok(path)
}

/// Rebuild a dictionary from a run directory written by [`save_run`].
pub fn load_dictionary(dir: impl AsRef<Path>, device: &Device) -> Result<(Dictionary, RunConfig)> {
    let dir = dir.as_ref();
    let config = RunConfig::load(dir)?;

    let dictionary = match &config.trainer.dictionary {
        DictionaryKind::MatroyshkaBatchTopK { k, group_sizes } => {
            let ae = MatroyshkaDictionary::from_pretrained(dir.join(WEIGHTS_FILE), Some(*k), device)?;
            anyhow::ensure!(
                ae.group_sizes() == group_sizes.as_slice(),
                "config group sizes {group_sizes:?} disagree with weights {:?}",
                ae.group_sizes()
            );
            Dictionary::MatroyshkaBatchTopK(ae)
        }
    };

    Ok((dictionary, config))
}
