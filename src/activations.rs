//! Activation sources for training and evaluation.
//!
//! The trainer only needs `[batch, activation_dim]` tensors; where they come
//! from (a buffer fed by a live model, a file on disk) is behind
//! [`ActivationSource`].

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use safetensors::tensor::SafeTensors;
use tracing::{debug, info};

/// Anything that yields batches of activations.
pub trait ActivationSource {
    /// Width of each activation vector.
    fn activation_dim(&self) -> usize;

    /// Next `[batch, activation_dim]` batch, or `None` once exhausted.
    fn next_batch(&mut self) -> Result<Option<Tensor>>;
}

/// Fixed `(N, D)` activation matrix served in shuffled mini-batches.
///
/// Each epoch visits every row once in a fresh order drawn from the seed.
/// With `cycle` set the source never runs dry; otherwise it stops after the
/// first epoch.
pub struct InMemoryActivations {
    data: Tensor,
    batch_size: usize,
    cycle: bool,
    rng: StdRng,
    order: Vec<u32>,
    cursor: usize,
    epoch: usize,
}

impl InMemoryActivations {
    pub fn new(data: Tensor, batch_size: usize, seed: u64) -> Result<Self> {
        let (n_rows, _) = data.dims2().context("activations must be [n, activation_dim]")?;
        anyhow::ensure!(n_rows > 0, "activation matrix is empty");
        anyhow::ensure!(batch_size > 0, "batch_size must be positive");

        let mut source = Self {
            data: data.to_dtype(DType::F32)?,
            batch_size,
            cycle: true,
            rng: StdRng::seed_from_u64(seed),
            order: (0..n_rows as u32).collect(),
            cursor: 0,
            epoch: 0,
        };
        source.order.shuffle(&mut source.rng);
        Ok(source)
    }

    /// Stop after one pass instead of reshuffling.
    pub fn single_pass(mut self) -> Self {
        self.cycle = false;
        self
    }

    /// Load one named `(N, D)` tensor from a safetensors file.
    pub fn from_safetensors(
        path: impl AsRef<Path>,
        tensor_name: &str,
        batch_size: usize,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read activations file {}", path.display()))?;
        let st = SafeTensors::deserialize(&data)
            .with_context(|| format!("Failed to deserialize {}", path.display()))?;
        let view = st
            .tensor(tensor_name)
            .with_context(|| format!("Tensor '{tensor_name}' not found in {}", path.display()))?;

        let dtype = match view.dtype() {
            safetensors::Dtype::BF16 => DType::BF16,
            safetensors::Dtype::F16 => DType::F16,
            safetensors::Dtype::F32 => DType::F32,
            safetensors::Dtype::F64 => DType::F64,
            other => anyhow::bail!("Unsupported activation dtype: {other:?}"),
        };
        let tensor = Tensor::from_raw_buffer(view.data(), dtype, view.shape(), device)?;
        info!(
            "Loaded activations '{}' {:?} from {}",
            tensor_name,
            tensor.dims(),
            path.display()
        );
        Self::new(tensor, batch_size, seed)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Completed passes over the data
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn data(&self) -> &Tensor {
        &self.data
    }
}

impl ActivationSource for InMemoryActivations {
    fn activation_dim(&self) -> usize {
        self.data.dims()[1]
    }

    fn next_batch(&mut self) -> Result<Option<Tensor>> {
        if self.cursor >= self.order.len() {
            if !self.cycle {
                return Ok(None);
            }
            self.epoch += 1;
            self.cursor = 0;
            self.order.shuffle(&mut self.rng);
            debug!("Activation source starting epoch {}", self.epoch);
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let index = Tensor::new(&self.order[self.cursor..end], self.data.device())?;
        self.cursor = end;
        if !self.cycle && self.cursor >= self.order.len() {
            self.epoch += 1;
        }
        Ok(Some(self.data.index_select(&index, 0)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize, dim: usize) -> Tensor {
        let values: Vec<f32> = (0..n * dim).map(|v| v as f32).collect();
        Tensor::from_vec(values, (n, dim), &Device::Cpu).unwrap()
    }

    fn first_column(t: &Tensor) -> Vec<f32> {
        t.to_vec2::<f32>()
            .unwrap()
            .into_iter()
            .map(|row| row[0])
            .collect()
    }

    #[test]
    fn test_single_pass_visits_every_row_once() {
        let mut source = InMemoryActivations::new(ramp(10, 2), 4, 0).unwrap().single_pass();
        let mut seen = Vec::new();
        let mut sizes = Vec::new();
        while let Some(batch) = source.next_batch().unwrap() {
            sizes.push(batch.dim(0).unwrap());
            seen.extend(first_column(&batch));
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        seen.sort_by(f32::total_cmp);
        let expected: Vec<f32> = (0..10).map(|r| (r * 2) as f32).collect();
        assert_eq!(seen, expected);
        assert_eq!(source.epoch(), 1);
    }

    #[test]
    fn test_cycling_never_runs_dry() {
        let mut source = InMemoryActivations::new(ramp(3, 2), 2, 1).unwrap();
        for _ in 0..10 {
            assert!(source.next_batch().unwrap().is_some());
        }
        // batches of 2 then 1: a new epoch starts every other call
        assert_eq!(source.epoch(), 4);
    }

    #[test]
    fn test_same_seed_same_order() {
        let mut a = InMemoryActivations::new(ramp(16, 3), 5, 9).unwrap();
        let mut b = InMemoryActivations::new(ramp(16, 3), 5, 9).unwrap();
        for _ in 0..6 {
            let xa = first_column(&a.next_batch().unwrap().unwrap());
            let xb = first_column(&b.next_batch().unwrap().unwrap());
            assert_eq!(xa, xb);
        }
    }

    #[test]
    fn test_from_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acts.safetensors");
        let mut tensors = std::collections::HashMap::new();
        tensors.insert("resid".to_string(), ramp(6, 4));
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let mut source =
            InMemoryActivations::from_safetensors(&path, "resid", 3, 0, &Device::Cpu).unwrap();
        assert_eq!(source.len(), 6);
        assert_eq!(source.activation_dim(), 4);
        assert_eq!(source.next_batch().unwrap().unwrap().dims(), &[3, 4]);

        assert!(InMemoryActivations::from_safetensors(&path, "missing", 3, 0, &Device::Cpu).is_err());
    }

    #[test]
    fn test_rejects_empty_input() {
        let empty = Tensor::zeros((0, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(InMemoryActivations::new(empty, 2, 0).is_err());
        assert!(InMemoryActivations::new(ramp(2, 2), 0, 0).is_err());
    }
}
