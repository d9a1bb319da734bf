//! Matroyshka batch top-k trainer
//!
//! One call to [`MatroyshkaTrainer::update`] is one optimization step:
//!
//! 1. step 0 only: seed `b_dec` with the geometric median of the batch
//! 2. renormalize decoder rows
//! 3. batch top-k encode, recording which features fired
//! 4. after `threshold_start_step`: fold the batch's minimum positive
//!    activation into the adaptive threshold
//! 5. nested reconstruction: groups are added one at a time to a running
//!    reconstruction starting at `b_dec`; each prefix is scored and weighted
//! 6. dead-feature counters
//! 7. auxiliary loss reconstructing the residual from dead features only
//! 8. `loss = mean(weighted group losses) + auxk_alpha * aux_loss`
//! 9. backward, clip to norm 1, project decoder gradient, Adam step,
//!    advance the learning-rate schedule

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::{DictionaryKind, TrainerRecord};
use crate::dead_features::{DeadFeatureTracker, DEAD_FEATURE_THRESHOLD};
use crate::dictionary::{top_k_mask, MatroyshkaDictionary};
use crate::error::ConfigError;
use crate::geometric_median::{geometric_median, DEFAULT_MAX_ITER, DEFAULT_TOL};
use crate::schedule::{LrSchedule, TrainingPhase};
use crate::weighting::{apply_temperature, group_sizes_from_fractions};

/// Name recorded as `trainer_class` in saved configs.
pub const TRAINER_CLASS: &str = "MatroyshkaBatchTopKTrainer";

/// Global gradient norm cap applied before every optimizer step.
pub const MAX_GRAD_NORM: f64 = 1.0;

/// Hyperparameters for a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Total number of optimizer steps
    pub steps: usize,
    pub activation_dim: usize,
    pub dict_size: usize,
    /// Batch top-k budget per sample
    pub k: usize,
    /// Layer of the source model the activations come from
    pub layer: usize,
    /// Source model name
    pub lm_name: String,
    /// Fraction of `dict_size` assigned to each group; must sum to 1
    pub group_fractions: Vec<f64>,
    /// Base distribution for group loss weights (defaults to the fractions)
    pub group_weights: Option<Vec<f64>>,
    pub weights_temperature: f64,
    /// Auxiliary (dead-feature) loss coefficient
    pub auxk_alpha: f64,
    pub warmup_steps: usize,
    /// Step at which linear decay to zero begins
    pub decay_start: Option<usize>,
    /// Exponential smoothing factor for the adaptive threshold
    pub threshold_beta: f64,
    pub threshold_start_step: usize,
    /// Tokens without firing after which a feature is dead
    pub dead_feature_threshold: u64,
    /// Base learning rate; `2e-4 / sqrt(dict_size / 2^14)` when unset
    pub lr: Option<f64>,
    pub seed: Option<u64>,
    pub run_name: String,
    pub submodule_name: Option<String>,
}

impl TrainerConfig {
    /// Config with the required fields set and everything else at its default.
    pub fn new(
        steps: usize,
        activation_dim: usize,
        dict_size: usize,
        k: usize,
        layer: usize,
        lm_name: impl Into<String>,
        group_fractions: Vec<f64>,
    ) -> Self {
        Self {
            steps,
            activation_dim,
            dict_size,
            k,
            layer,
            lm_name: lm_name.into(),
            group_fractions,
            group_weights: None,
            weights_temperature: 1.0,
            auxk_alpha: 1.0 / 32.0,
            warmup_steps: 1000,
            decay_start: None,
            threshold_beta: 0.999,
            threshold_start_step: 1000,
            dead_feature_threshold: DEAD_FEATURE_THRESHOLD,
            lr: None,
            seed: None,
            run_name: "MatroyshkaBatchTopKSAE".to_string(),
            submodule_name: None,
        }
    }
}

/// Learning rate scaled down for wider dictionaries.
pub fn default_lr(dict_size: usize) -> f64 {
    let scale = dict_size as f64 / f64::from(1u32 << 14);
    2e-4 / scale.sqrt()
}

/// Scalar diagnostics from one loss evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossLog {
    /// Mean of the weighted per-group reconstruction losses
    pub l2_loss: f32,
    pub auxk_loss: f32,
    pub loss: f32,
    pub min_l2_loss: f32,
    pub max_l2_loss: f32,
}

/// Differentiable loss plus the intermediate results that produced it.
pub struct LossOutput {
    pub loss: Tensor,
    /// Full nested reconstruction over the active groups
    pub reconstruction: Tensor,
    pub codes: Tensor,
    pub log: LossLog,
}

/// Values worth logging alongside the loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrainerDiagnostics {
    pub effective_l0: usize,
    pub dead_features: usize,
}

/// Owns the dictionary, optimizer, schedule and per-feature counters for a run.
pub struct MatroyshkaTrainer {
    config: TrainerConfig,
    ae: MatroyshkaDictionary,
    group_sizes: Vec<usize>,
    group_weights: Vec<f64>,
    top_k_aux: usize,
    optimizer: AdamW,
    schedule: LrSchedule,
    dead: DeadFeatureTracker,
    dead_features: usize,
    last_log: Option<LossLog>,
    device: Device,
}

impl MatroyshkaTrainer {
    /// Validate the config and build a fresh dictionary on `device`.
    pub fn new(config: TrainerConfig, device: &Device) -> Result<Self> {
        let group_sizes = group_sizes_from_fractions(&config.group_fractions, config.dict_size)?;
        let base_weights = config
            .group_weights
            .clone()
            .unwrap_or_else(|| config.group_fractions.clone());
        let group_weights = apply_temperature(&base_weights, config.weights_temperature)?;
        if group_weights.len() != group_sizes.len() {
            return Err(ConfigError::WeightCount {
                weights: group_weights.len(),
                groups: group_sizes.len(),
            }
            .into());
        }
        if !(0.0..=1.0).contains(&config.threshold_beta) {
            return Err(ConfigError::invalid(format!(
                "threshold_beta={} must lie in [0, 1]",
                config.threshold_beta
            ))
            .into());
        }

        let lr = config.lr.unwrap_or_else(|| default_lr(config.dict_size));
        let schedule = LrSchedule::new(lr, config.steps, config.warmup_steps, config.decay_start)?;

        let ae = match config.seed {
            Some(seed) => MatroyshkaDictionary::new_seeded(
                config.activation_dim,
                config.dict_size,
                config.k,
                &group_sizes,
                seed,
                device,
            )?,
            None => MatroyshkaDictionary::new(
                config.activation_dim,
                config.dict_size,
                config.k,
                &group_sizes,
                device,
            )?,
        };

        let params = ParamsAdamW {
            lr: schedule.current_lr(),
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        };
        let optimizer = AdamW::new(ae.trainable_vars(), params)?;

        info!(
            "Matroyshka trainer: dict_size={}, k={}, groups={:?}, weights={:?}, lr={:.3e}",
            config.dict_size, config.k, group_sizes, group_weights, lr
        );

        Ok(Self {
            top_k_aux: config.activation_dim / 2,
            dead: DeadFeatureTracker::new(config.dict_size),
            dead_features: 0,
            last_log: None,
            config,
            ae,
            group_sizes,
            group_weights,
            optimizer,
            schedule,
            device: device.clone(),
        })
    }

    // --- Accessors ---

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn dictionary(&self) -> &MatroyshkaDictionary {
        &self.ae
    }

    pub fn dictionary_mut(&mut self) -> &mut MatroyshkaDictionary {
        &mut self.ae
    }

    pub fn into_dictionary(self) -> MatroyshkaDictionary {
        self.ae
    }

    pub fn group_sizes(&self) -> &[usize] {
        &self.group_sizes
    }

    /// Temperature-scaled loss weight of each group
    pub fn group_weights(&self) -> &[f64] {
        &self.group_weights
    }

    pub fn top_k_aux(&self) -> usize {
        self.top_k_aux
    }

    /// Base learning rate before scheduling
    pub fn lr(&self) -> f64 {
        self.schedule.base_lr()
    }

    /// Learning rate the next optimizer step will use
    pub fn current_lr(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn phase(&self, step: usize) -> TrainingPhase {
        self.schedule.phase(step)
    }

    pub fn tokens_since_fired(&self) -> &[u64] {
        self.dead.counts()
    }

    pub fn diagnostics(&self) -> TrainerDiagnostics {
        TrainerDiagnostics {
            effective_l0: self.config.k,
            dead_features: self.dead_features,
        }
    }

    /// Diagnostics from the most recent loss evaluation
    pub fn last_log(&self) -> Option<LossLog> {
        self.last_log
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    // --- Training ---

    /// Run one optimization step on `x` (`[batch, activation_dim]`) and return
    /// the scalar total loss.
    pub fn update(&mut self, step: usize, x: &Tensor) -> Result<f32> {
        let x = x.to_device(&self.device)?.to_dtype(DType::F32)?;

        if step == 0 {
            let median = geometric_median(&x, DEFAULT_MAX_ITER, DEFAULT_TOL)?;
            self.ae.set_decoder_bias(&median)?;
            debug!("Decoder bias initialized from geometric median of {} points", x.dim(0)?);
        }

        self.ae.set_decoder_norm_to_unit_norm()?;

        let output = self.loss(&x, step)?;
        let mut grads = output.loss.backward()?;

        clip_grad_norm(&self.ae.trainable_vars(), &mut grads, MAX_GRAD_NORM)?;
        self.ae.remove_gradient_parallel_to_decoder_directions(&mut grads)?;

        self.optimizer.step(&grads)?;
        let lr = self.schedule.advance();
        self.optimizer.set_learning_rate(lr);

        Ok(output.log.loss)
    }

    /// Compute the training loss for `x` at `step`.
    ///
    /// Updates the adaptive threshold and dead-feature counters as a side
    /// effect, exactly as [`update`](Self::update) does.
    pub fn loss(&mut self, x: &Tensor, step: usize) -> Result<LossOutput> {
        let x = x.to_device(&self.device)?.to_dtype(DType::F32)?;
        let batch_size = x.dim(0)?;

        let encoded = self.ae.encode_detailed(&x, false)?;
        let f = &encoded.codes;

        if step > self.config.threshold_start_step {
            let min_activation = min_positive(f)?;
            self.ae
                .update_threshold(min_activation, self.config.threshold_beta);
        }

        // Nested reconstruction: each group adds to the running reconstruction
        let mut x_reconstruct = x.zeros_like()?.broadcast_add(self.ae.decoder_bias())?;
        let mut group_losses = Vec::with_capacity(self.ae.active_groups());
        for i in 0..self.ae.active_groups() {
            let (start, end) = self.ae.groups().bounds(i);
            let w_dec_slice = self.ae.decoder_weight().narrow(0, start, end - start)?;
            let acts_slice = f.narrow(1, start, end - start)?.contiguous()?;
            x_reconstruct = (x_reconstruct + acts_slice.matmul(&w_dec_slice)?)?;

            let l2 = (&x_reconstruct - &x)?.sqr()?.sum(1)?.mean_all()?;
            group_losses.push((l2 * self.group_weights[i])?);
        }

        let values = group_losses
            .iter()
            .map(Tensor::to_scalar::<f32>)
            .collect::<candle_core::Result<Vec<f32>>>()?;
        let min_l2_loss = values.iter().copied().fold(f32::INFINITY, f32::min);
        let max_l2_loss = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        let mut total = group_losses[0].clone();
        for l in &group_losses[1..] {
            total = (total + l)?;
        }
        let mean_l2 = (total / group_losses.len() as f64)?;

        self.dead.update(&encoded.active, batch_size);
        self.dead_features = self.dead.dead_count(self.config.dead_feature_threshold);

        let auxk_loss = self.auxiliary_loss(&x, &x_reconstruct, &encoded.pre_activations)?;
        let loss = (&mean_l2 + (&auxk_loss * self.config.auxk_alpha)?)?;

        let log = LossLog {
            l2_loss: mean_l2.to_scalar::<f32>()?,
            auxk_loss: auxk_loss.to_scalar::<f32>()?,
            loss: loss.to_scalar::<f32>()?,
            min_l2_loss,
            max_l2_loss,
        };
        debug!(
            "step {step}: loss={:.5} l2={:.5} auxk={:.5} dead={}",
            log.loss, log.l2_loss, log.auxk_loss, self.dead_features
        );
        self.last_log = Some(log);

        Ok(LossOutput {
            loss,
            reconstruction: x_reconstruct,
            codes: encoded.codes,
            log,
        })
    }

    /// Reconstruct the residual `x - x_reconstruct` from dead features only.
    ///
    /// Each row keeps its `min(top_k_aux, n_dead)` largest dead-feature
    /// activations. The residual is detached: only dead-feature encoder and
    /// decoder weights receive gradient from this term.
    fn auxiliary_loss(&self, x: &Tensor, x_reconstruct: &Tensor, pre_activations: &Tensor) -> Result<Tensor> {
        let dead = self.dead.dead_indices(self.config.dead_feature_threshold);
        if dead.is_empty() {
            return Ok(Tensor::zeros((), DType::F32, x.device())?);
        }
        let n_dead = dead.len();

        let residual = (x - x_reconstruct)?.detach();
        let index: Vec<u32> = dead.iter().map(|&i| i as u32).collect();
        let index = Tensor::from_vec(index, n_dead, x.device())?;

        let dead_acts = pre_activations.index_select(&index, 1)?; // [batch, n_dead]
        let keep = self.top_k_aux.min(n_dead);
        let rows: Vec<Vec<f32>> = dead_acts.to_vec2()?;
        let mask: Vec<f32> = rows.iter().flat_map(|row| top_k_mask(row, keep)).collect();
        let mask = Tensor::from_vec(mask, dead_acts.dims2()?, x.device())?;
        let acts_aux = (dead_acts * mask)?;

        let w_dec_dead = self.ae.decoder_weight().index_select(&index, 0)?; // [n_dead, dim]
        let x_reconstruct_aux = acts_aux.matmul(&w_dec_dead)?;

        Ok((x_reconstruct_aux - residual)?.sqr()?.mean_all()?)
    }

    // --- Provenance ---

    /// Every hyperparameter needed to reproduce or reload this run.
    pub fn config_record(&self) -> TrainerRecord {
        TrainerRecord {
            trainer_class: TRAINER_CLASS.to_string(),
            dictionary: DictionaryKind::MatroyshkaBatchTopK {
                k: self.ae.k(),
                group_sizes: self.group_sizes.clone(),
            },
            lr: self.schedule.base_lr(),
            steps: self.config.steps,
            auxk_alpha: self.config.auxk_alpha,
            warmup_steps: self.config.warmup_steps,
            decay_start: self.config.decay_start,
            threshold_beta: self.config.threshold_beta,
            threshold_start_step: self.config.threshold_start_step,
            top_k_aux: self.top_k_aux,
            dead_feature_threshold: self.config.dead_feature_threshold,
            seed: self.config.seed,
            activation_dim: self.ae.activation_dim(),
            dict_size: self.ae.dict_size(),
            group_fractions: self.config.group_fractions.clone(),
            group_weights: self.group_weights.clone(),
            weights_temperature: self.config.weights_temperature,
            device: device_name(&self.device).to_string(),
            layer: self.config.layer,
            lm_name: self.config.lm_name.clone(),
            run_name: self.config.run_name.clone(),
            submodule_name: self.config.submodule_name.clone(),
        }
    }
}

/// Scale all gradients so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> Result<f64> {
    let mut total_sq = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total_sq += f64::from(g.sqr()?.sum_all()?.to_scalar::<f32>()?);
        }
    }
    let norm = total_sq.sqrt();

    let coef = max_norm / (norm + 1e-6);
    if coef < 1.0 {
        for var in vars {
            if let Some(g) = grads.get(var.as_tensor()).cloned() {
                grads.insert(var.as_tensor(), (g * coef)?);
            }
        }
    }
    Ok(norm)
}

/// Smallest strictly positive entry, or 0 when nothing fired.
fn min_positive(t: &Tensor) -> Result<f32> {
    let values: Vec<f32> = t.flatten_all()?.to_vec1()?;
    Ok(values
        .into_iter()
        .filter(|&v| v > 0.0)
        .reduce(f32::min)
        .unwrap_or(0.0))
}

fn device_name(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TrainerConfig {
        TrainerConfig {
            warmup_steps: 2,
            threshold_start_step: 1,
            lr: Some(1e-2),
            seed: Some(42),
            ..TrainerConfig::new(20, 4, 8, 2, 3, "test-model", vec![0.25, 0.75])
        }
    }

    fn random_batch(rows: usize, dim: usize) -> Tensor {
        Tensor::randn(0f32, 1f32, (rows, dim), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_default_lr() {
        assert!((default_lr(1 << 14) - 2e-4).abs() < 1e-12);
        assert!((default_lr(1 << 16) - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn test_construction_derives_groups_and_weights() {
        let trainer = MatroyshkaTrainer::new(test_config(), &Device::Cpu).unwrap();
        assert_eq!(trainer.group_sizes(), &[2, 6]);
        assert!((trainer.group_weights()[0] - 0.25).abs() < 1e-12);
        assert!((trainer.group_weights()[1] - 0.75).abs() < 1e-12);
        assert_eq!(trainer.top_k_aux(), 2);
        assert_eq!(trainer.current_lr(), 0.0);
    }

    #[test]
    fn test_construction_rejects_bad_schedule() {
        let config = TrainerConfig {
            warmup_steps: 20,
            ..test_config()
        };
        let err = MatroyshkaTrainer::new(config, &Device::Cpu).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::Schedule(_))
        ));

        let config = TrainerConfig {
            decay_start: Some(1),
            ..test_config()
        };
        assert!(MatroyshkaTrainer::new(config, &Device::Cpu).is_err());
    }

    #[test]
    fn test_construction_rejects_mismatched_weights() {
        let config = TrainerConfig {
            group_weights: Some(vec![0.2, 0.3, 0.5]),
            ..test_config()
        };
        let err = MatroyshkaTrainer::new(config, &Device::Cpu).err().unwrap();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::WeightCount {
                weights: 3,
                groups: 2
            })
        );
    }

    #[test]
    fn test_first_update_seeds_decoder_bias() {
        let mut trainer = MatroyshkaTrainer::new(test_config(), &Device::Cpu).unwrap();
        let x = Tensor::from_vec(
            vec![
                0.0f32, 0.0, 1.0, 1.0, //
                0.0, 0.0, 1.0, 1.0, //
                9.0, 0.0, 1.0, 1.0,
            ],
            (3, 4),
            &Device::Cpu,
        )
        .unwrap();

        let loss = trainer.update(0, &x).unwrap();
        assert!(loss.is_finite());

        // Warm-up multiplier is 0 at step 0, so the seeded bias survives the step.
        let b_dec: Vec<f32> = trainer.dictionary().decoder_bias().to_vec1().unwrap();
        assert!(b_dec[0].abs() < 1e-3, "b_dec={b_dec:?}");
        assert!((b_dec[2] - 1.0).abs() < 1e-5);
        assert!((trainer.current_lr() - 0.5e-2).abs() < 1e-12);
    }

    #[test]
    fn test_threshold_estimated_only_after_start_step() {
        let mut trainer = MatroyshkaTrainer::new(test_config(), &Device::Cpu).unwrap();
        let x = random_batch(16, 4);

        trainer.update(0, &x).unwrap();
        trainer.update(1, &x).unwrap();
        assert_eq!(trainer.dictionary().threshold(), -1.0);

        trainer.update(2, &x).unwrap();
        assert!(trainer.dictionary().threshold() >= 0.0);
    }

    #[test]
    fn test_loss_log_bounds() {
        let mut trainer = MatroyshkaTrainer::new(test_config(), &Device::Cpu).unwrap();
        let x = random_batch(8, 4);
        let out = trainer.loss(&x, 0).unwrap();
        assert!(out.log.min_l2_loss <= out.log.max_l2_loss);
        assert_eq!(out.log.auxk_loss, 0.0);
        assert!((out.log.loss - out.log.l2_loss).abs() < 1e-6);
        assert_eq!(out.reconstruction.dims(), &[8, 4]);
        assert_eq!(out.codes.dims(), &[8, 8]);
    }

    #[test]
    fn test_dead_features_trigger_auxiliary_loss() {
        let config = TrainerConfig {
            dead_feature_threshold: 1,
            ..test_config()
        };
        let mut trainer = MatroyshkaTrainer::new(config, &Device::Cpu).unwrap();
        let x = random_batch(4, 4);

        trainer.update(0, &x).unwrap();
        let dead = trainer.diagnostics().dead_features;
        let silent = trainer
            .tokens_since_fired()
            .iter()
            .filter(|&&c| c >= 1)
            .count();
        assert_eq!(dead, silent);

        let out = trainer.loss(&x, 1).unwrap();
        assert!(out.log.auxk_loss.is_finite());
        assert!(out.log.auxk_loss >= 0.0);
    }

    fn rows(t: &Tensor) -> Vec<Vec<f32>> {
        t.to_vec2().unwrap()
    }

    fn assert_close(a: f32, b: f64, what: &str) {
        let tol = 1e-4 * b.abs().max(1.0);
        assert!((f64::from(a) - b).abs() < tol, "{what}: {a} vs {b}");
    }

    #[test]
    fn test_nested_group_loss_value() {
        let mut trainer = MatroyshkaTrainer::new(test_config(), &Device::Cpu).unwrap();
        let bias = Tensor::new(&[0.5f32, -0.25, 0.0, 1.0], &Device::Cpu).unwrap();
        trainer.dictionary().set_decoder_bias(&bias).unwrap();
        let x = Tensor::new(
            &[
                [1.0f32, -2.0, 0.5, 3.0],
                [-1.5, 0.25, 2.0, -0.5],
                [0.75, 1.25, -1.0, 2.5],
            ],
            &Device::Cpu,
        )
        .unwrap();

        let out = trainer.loss(&x, 0).unwrap();
        let codes = rows(&out.codes);
        let w_dec = rows(trainer.dictionary().decoder_weight());
        let b_dec: Vec<f32> = trainer.dictionary().decoder_bias().to_vec1().unwrap();
        let xs = rows(&x);

        // Cumulative reconstruction after each group, scored against x
        let mut group_losses = Vec::new();
        for (g, weight) in trainer.group_weights().iter().enumerate() {
            let (_, end) = trainer.dictionary().groups().bounds(g);
            let mut total = 0.0f64;
            for (code, target) in codes.iter().zip(&xs) {
                for d in 0..4 {
                    let mut x_hat = f64::from(b_dec[d]);
                    for f in 0..end {
                        x_hat += f64::from(code[f]) * f64::from(w_dec[f][d]);
                    }
                    total += (x_hat - f64::from(target[d])).powi(2);
                }
            }
            group_losses.push(weight * total / xs.len() as f64);
        }

        let mean = group_losses.iter().sum::<f64>() / group_losses.len() as f64;
        let min = group_losses.iter().copied().fold(f64::INFINITY, f64::min);
        let max = group_losses.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        assert_close(out.log.l2_loss, mean, "l2_loss");
        assert_close(out.log.min_l2_loss, min, "min_l2_loss");
        assert_close(out.log.max_l2_loss, max, "max_l2_loss");
        assert_close(out.log.loss, mean, "loss without dead features");
    }

    #[test]
    fn test_auxiliary_loss_value() {
        let config = TrainerConfig {
            dead_feature_threshold: 1,
            ..test_config()
        };
        let mut trainer = MatroyshkaTrainer::new(config, &Device::Cpu).unwrap();
        // 2 rows * k=2 leaves at least 4 of 8 features silent
        let x = Tensor::new(&[[1.0f32, -0.5, 2.0, 0.25], [-1.0, 1.5, 0.5, -2.0]], &Device::Cpu)
            .unwrap();

        let out = trainer.loss(&x, 0).unwrap();
        let dead: Vec<usize> = trainer
            .tokens_since_fired()
            .iter()
            .enumerate()
            .filter(|(_, &c)| c >= 1)
            .map(|(i, _)| i)
            .collect();
        assert!(dead.len() >= 4, "dead={dead:?}");

        let pre = rows(&trainer.dictionary().pre_activations(&x).unwrap());
        let w_dec = rows(trainer.dictionary().decoder_weight());
        let residual = rows(&(&x - &out.reconstruction).unwrap());
        let keep = trainer.top_k_aux().min(dead.len());

        let mut total = 0.0f64;
        for (pre_row, res_row) in pre.iter().zip(&residual) {
            let mut ranked: Vec<usize> = dead.clone();
            ranked.sort_by(|&a, &b| pre_row[b].total_cmp(&pre_row[a]));
            for d in 0..4 {
                let x_aux: f64 = ranked[..keep]
                    .iter()
                    .map(|&f| f64::from(pre_row[f]) * f64::from(w_dec[f][d]))
                    .sum();
                total += (x_aux - f64::from(res_row[d])).powi(2);
            }
        }
        let expected_aux = total / (2.0 * 4.0);
        assert_close(out.log.auxk_loss, expected_aux, "auxk_loss");

        let expected_total = f64::from(out.log.l2_loss) + trainer.config().auxk_alpha * expected_aux;
        assert_close(out.log.loss, expected_total, "loss");
    }

    #[test]
    fn test_decoder_rows_stay_unit_norm_across_updates() {
        let mut trainer = MatroyshkaTrainer::new(test_config(), &Device::Cpu).unwrap();
        for step in 0..5 {
            let x = random_batch(8, 4);
            trainer.update(step, &x).unwrap();
        }
        trainer.dictionary().set_decoder_norm_to_unit_norm().unwrap();
        let norms: Vec<f32> = trainer
            .dictionary()
            .decoder_weight()
            .sqr()
            .unwrap()
            .sum(1)
            .unwrap()
            .sqrt()
            .unwrap()
            .to_vec1()
            .unwrap();
        for n in norms {
            assert!((n - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_clip_grad_norm() {
        let device = Device::Cpu;
        let var = Var::from_tensor(&Tensor::new(&[3.0f32, 4.0], &device).unwrap()).unwrap();
        let loss = (var.as_tensor().sqr().unwrap().sum_all().unwrap() * 0.5).unwrap();
        let mut grads = loss.backward().unwrap();

        let norm = clip_grad_norm(&[var.clone()], &mut grads, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-5);
        let clipped: Vec<f32> = grads.get(var.as_tensor()).unwrap().to_vec1().unwrap();
        assert!((clipped[0] - 0.6).abs() < 1e-4);
        assert!((clipped[1] - 0.8).abs() < 1e-4);
    }

    #[test]
    fn test_config_record() {
        let trainer = MatroyshkaTrainer::new(test_config(), &Device::Cpu).unwrap();
        let record = trainer.config_record();
        assert_eq!(record.trainer_class, TRAINER_CLASS);
        assert_eq!(
            record.dictionary,
            DictionaryKind::MatroyshkaBatchTopK {
                k: 2,
                group_sizes: vec![2, 6]
            }
        );
        assert_eq!(record.device, "cpu");
        assert_eq!(record.lm_name, "test-model");
        assert_eq!(record.layer, 3);
    }
}
