//! Training loop: pull batches, step the trainer, log and checkpoint.

use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::activations::ActivationSource;
use crate::checkpoint::{save_checkpoint, save_run};
use crate::trainer::{LossLog, MatroyshkaTrainer};

/// Options around the optimization itself.
#[derive(Debug, Clone, Default)]
pub struct TrainOptions {
    /// Log the loss breakdown every `log_steps` steps
    pub log_steps: Option<usize>,
    /// Steps after which an intermediate checkpoint is written
    pub save_steps: Vec<usize>,
    /// Run directory; nothing is written when unset
    pub save_dir: Option<PathBuf>,
}

/// Outcome of [`train_dictionary`].
#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    pub steps_completed: usize,
    pub final_loss: Option<f32>,
    /// `(step, log)` pairs recorded at each logging step
    pub history: Vec<(usize, LossLog)>,
    pub checkpoints: Vec<PathBuf>,
}

/// Train until the trainer's step budget is spent or `source` runs dry.
pub fn train_dictionary<S: ActivationSource + ?Sized>(
    source: &mut S,
    trainer: &mut MatroyshkaTrainer,
    options: &TrainOptions,
) -> Result<TrainingSummary> {
    anyhow::ensure!(
        source.activation_dim() == trainer.dictionary().activation_dim(),
        "activation source has dim {} but dictionary expects {}",
        source.activation_dim(),
        trainer.dictionary().activation_dim()
    );

    let steps = trainer.config().steps;
    let mut summary = TrainingSummary {
        steps_completed: 0,
        final_loss: None,
        history: Vec::new(),
        checkpoints: Vec::new(),
    };

    info!("Training for {steps} steps");
    for step in 0..steps {
        let Some(batch) = source.next_batch()? else {
            warn!("Activation source exhausted after {step} steps");
            break;
        };

        let loss = trainer.update(step, &batch)?;
        summary.steps_completed = step + 1;
        summary.final_loss = Some(loss);

        if let Some(every) = options.log_steps.filter(|&n| n > 0) {
            if step % every == 0 {
                if let Some(log) = trainer.last_log() {
                    let diag = trainer.diagnostics();
                    info!(
                        "step {:>6}: loss={:.5} l2={:.5} auxk={:.5} l2[min,max]=[{:.5}, {:.5}] dead={} lr={:.3e}",
                        step,
                        log.loss,
                        log.l2_loss,
                        log.auxk_loss,
                        log.min_l2_loss,
                        log.max_l2_loss,
                        diag.dead_features,
                        trainer.current_lr()
                    );
                    summary.history.push((step, log));
                }
            }
        }

        if let Some(dir) = &options.save_dir {
            if options.save_steps.contains(&step) {
                let path = save_checkpoint(trainer, dir, step)?;
                info!("Checkpoint written to {}", path.display());
                summary.checkpoints.push(path);
            }
        }
    }

    if let Some(dir) = &options.save_dir {
        save_run(trainer, dir)?;
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activations::InMemoryActivations;
    use crate::trainer::TrainerConfig;
    use candle_core::{Device, Tensor};

    fn setup(steps: usize, rows: usize) -> (InMemoryActivations, MatroyshkaTrainer) {
        let data = Tensor::randn(0f32, 1f32, (rows, 4), &Device::Cpu).unwrap();
        let source = InMemoryActivations::new(data, 8, 0).unwrap();
        let config = TrainerConfig {
            warmup_steps: 1,
            lr: Some(1e-3),
            seed: Some(1),
            ..TrainerConfig::new(steps, 4, 8, 2, 0, "test-model", vec![0.5, 0.5])
        };
        let trainer = MatroyshkaTrainer::new(config, &Device::Cpu).unwrap();
        (source, trainer)
    }

    #[test]
    fn test_runs_all_steps_and_logs() {
        let (mut source, mut trainer) = setup(6, 32);
        let options = TrainOptions {
            log_steps: Some(2),
            ..Default::default()
        };
        let summary = train_dictionary(&mut source, &mut trainer, &options).unwrap();
        assert_eq!(summary.steps_completed, 6);
        assert!(summary.final_loss.unwrap().is_finite());
        let logged: Vec<usize> = summary.history.iter().map(|(s, _)| *s).collect();
        assert_eq!(logged, vec![0, 2, 4]);
        assert!(summary.checkpoints.is_empty());
    }

    #[test]
    fn test_stops_when_source_exhausted() {
        let (source, mut trainer) = setup(10, 16);
        let mut source = source.single_pass();
        let summary = train_dictionary(&mut source, &mut trainer, &TrainOptions::default()).unwrap();
        assert_eq!(summary.steps_completed, 2);
    }

    #[test]
    fn test_checkpoints_and_final_save() {
        let dir = tempfile::tempdir().unwrap();
        let (mut source, mut trainer) = setup(5, 32);
        let options = TrainOptions {
            log_steps: None,
            save_steps: vec![1, 3],
            save_dir: Some(dir.path().to_path_buf()),
        };
        let summary = train_dictionary(&mut source, &mut trainer, &options).unwrap();
        assert_eq!(summary.checkpoints.len(), 2);
        assert!(dir.path().join("checkpoints/ae_1.safetensors").exists());
        assert!(dir.path().join("checkpoints/ae_3.safetensors").exists());
        assert!(dir.path().join("ae.safetensors").exists());
        assert!(dir.path().join("config.json").exists());
    }

    #[test]
    fn test_rejects_mismatched_width() {
        let data = Tensor::zeros((4, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        let mut source = InMemoryActivations::new(data, 2, 0).unwrap();
        let (_, mut trainer) = setup(2, 4);
        assert!(train_dictionary(&mut source, &mut trainer, &TrainOptions::default()).is_err());
    }
}
