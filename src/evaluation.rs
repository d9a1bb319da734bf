//! Reconstruction and sparsity metrics for a trained dictionary.
//!
//! Encoding uses the inference path (adaptive threshold), so the numbers
//! describe the dictionary as it will be used, not as it was trained.

use anyhow::Result;
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::activations::ActivationSource;
use crate::checkpoint::Dictionary;

/// Guards norms and variances against division by zero.
const EPS: f64 = 1e-8;

/// Metrics averaged over evaluation batches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    /// Mean L2 norm of the reconstruction error per sample
    pub l2_loss: f64,
    /// Mean L1 norm of the code per sample
    pub l1_loss: f64,
    /// Mean number of active features per sample
    pub l0: f64,
    /// Fraction of features active at least once across all batches
    pub frac_alive: f64,
    pub frac_variance_explained: f64,
    pub cossim: f64,
    /// Mean `||x_hat|| / ||x||`
    pub l2_ratio: f64,
    /// `mean ||x_hat||^2 / mean <x, x_hat>`; 1 when unbiased
    pub relative_reconstruction_bias: f64,
}

struct BatchMetrics {
    l2_loss: f64,
    l1_loss: f64,
    l0: f64,
    frac_variance_explained: f64,
    cossim: f64,
    l2_ratio: f64,
    relative_reconstruction_bias: f64,
}

/// Evaluate `dictionary` on up to `n_batches` batches from `source`.
pub fn evaluate<S: ActivationSource + ?Sized>(
    dictionary: &Dictionary,
    source: &mut S,
    n_batches: usize,
) -> Result<EvalMetrics> {
    let mut alive = vec![false; dictionary.dict_size()];
    let mut per_batch = Vec::with_capacity(n_batches);

    for _ in 0..n_batches {
        let Some(x) = source.next_batch()? else {
            break;
        };
        let (x_hat, codes) = dictionary.forward_with_features(&x)?;
        let x = to_rows(&x)?;
        let x_hat = to_rows(&x_hat)?;
        let codes = to_rows(&codes)?;

        for row in &codes {
            for (flag, &v) in alive.iter_mut().zip(row) {
                *flag |= v != 0.0;
            }
        }
        per_batch.push(batch_metrics(&x, &x_hat, &codes));
    }

    anyhow::ensure!(!per_batch.is_empty(), "no evaluation batches available");
    let n = per_batch.len() as f64;
    let mean = |f: fn(&BatchMetrics) -> f64| per_batch.iter().map(f).sum::<f64>() / n;

    let metrics = EvalMetrics {
        l2_loss: mean(|m| m.l2_loss),
        l1_loss: mean(|m| m.l1_loss),
        l0: mean(|m| m.l0),
        frac_alive: alive.iter().filter(|&&a| a).count() as f64 / alive.len() as f64,
        frac_variance_explained: mean(|m| m.frac_variance_explained),
        cossim: mean(|m| m.cossim),
        l2_ratio: mean(|m| m.l2_ratio),
        relative_reconstruction_bias: mean(|m| m.relative_reconstruction_bias),
    };
    info!(
        "Evaluated {} batches: l2={:.4} l0={:.2} fve={:.4} alive={:.3}",
        per_batch.len(),
        metrics.l2_loss,
        metrics.l0,
        metrics.frac_variance_explained,
        metrics.frac_alive
    );
    Ok(metrics)
}

fn to_rows(t: &Tensor) -> Result<Vec<Vec<f32>>> {
    Ok(t.to_dtype(DType::F32)?.to_vec2()?)
}

fn batch_metrics(x: &[Vec<f32>], x_hat: &[Vec<f32>], codes: &[Vec<f32>]) -> BatchMetrics {
    let rows = x.len() as f64;
    let dim = x.first().map_or(0, Vec::len);

    let mut l2 = 0.0;
    let mut l1 = 0.0;
    let mut l0 = 0.0;
    let mut cossim = 0.0;
    let mut ratio = 0.0;
    let mut sq_hat = 0.0;
    let mut inner = 0.0;

    for ((xr, hr), cr) in x.iter().zip(x_hat).zip(codes) {
        let err: f64 = xr
            .iter()
            .zip(hr)
            .map(|(a, b)| f64::from(a - b).powi(2))
            .sum();
        let nx = norm(xr);
        let nh = norm(hr);
        let dot: f64 = xr.iter().zip(hr).map(|(a, b)| f64::from(*a) * f64::from(*b)).sum();

        l2 += err.sqrt();
        l1 += cr.iter().map(|v| f64::from(v.abs())).sum::<f64>();
        l0 += cr.iter().filter(|&&v| v != 0.0).count() as f64;
        cossim += dot / (nx.max(EPS) * nh.max(EPS));
        ratio += nh / nx.max(EPS);
        sq_hat += nh * nh;
        inner += dot;
    }

    let residual: Vec<Vec<f32>> = x
        .iter()
        .zip(x_hat)
        .map(|(xr, hr)| xr.iter().zip(hr).map(|(a, b)| a - b).collect())
        .collect();
    let total_variance = summed_variance(x, dim);
    let residual_variance = summed_variance(&residual, dim);

    BatchMetrics {
        l2_loss: l2 / rows,
        l1_loss: l1 / rows,
        l0: l0 / rows,
        frac_variance_explained: 1.0 - residual_variance / total_variance.max(EPS),
        cossim: cossim / rows,
        l2_ratio: ratio / rows,
        relative_reconstruction_bias: (sq_hat / rows) / (inner / rows).max(EPS),
    }
}

fn norm(v: &[f32]) -> f64 {
    v.iter().map(|a| f64::from(*a).powi(2)).sum::<f64>().sqrt()
}

/// Sum over dimensions of the per-dimension variance across rows.
fn summed_variance(rows: &[Vec<f32>], dim: usize) -> f64 {
    let n = rows.len() as f64;
    (0..dim)
        .map(|d| {
            let mean = rows.iter().map(|r| f64::from(r[d])).sum::<f64>() / n;
            rows.iter().map(|r| (f64::from(r[d]) - mean).powi(2)).sum::<f64>() / n
        })
        .sum()
}
