//! Geometric median via Weiszfeld iteration.
//!
//! Used once, on the first training batch, to seed the decoder bias with a
//! point that is not dragged around by outlier activations the way the mean
//! is.

use anyhow::Result;
use candle_core::{DType, Tensor};
use tracing::debug;

/// Default iteration cap used by the trainer.
pub const DEFAULT_MAX_ITER: usize = 100;

/// Default convergence tolerance (Euclidean movement of the estimate).
pub const DEFAULT_TOL: f32 = 1e-5;

/// Distances below this are clamped before inversion, so a point that
/// coincides with the current estimate gets a large finite weight instead of
/// an infinite one.
pub const MIN_DISTANCE: f32 = 1e-8;

/// Geometric median of the rows of a `(batch, dim)` tensor.
///
/// Returns a `(dim,)` tensor on the same device as `points`.
pub fn geometric_median(points: &Tensor, max_iter: usize, tol: f32) -> Result<Tensor> {
    let (n_points, dim) = points.dims2()?;
    anyhow::ensure!(n_points > 0, "geometric median of an empty batch");

    let rows: Vec<Vec<f32>> = points.to_dtype(DType::F32)?.to_vec2()?;
    let estimate = weiszfeld(&rows, max_iter, tol);
    debug_assert_eq!(estimate.len(), dim);

    Ok(Tensor::from_vec(estimate, dim, points.device())?.to_dtype(points.dtype())?)
}

/// Weiszfeld iteration over plain rows, starting from the arithmetic mean.
pub fn weiszfeld(points: &[Vec<f32>], max_iter: usize, tol: f32) -> Vec<f32> {
    let Some(first) = points.first() else {
        return Vec::new();
    };
    let dim = first.len();
    let n = points.len() as f32;

    let mut guess = vec![0.0f32; dim];
    for p in points {
        for (g, v) in guess.iter_mut().zip(p) {
            *g += v / n;
        }
    }

    for iter in 0..max_iter {
        let weights: Vec<f32> = points
            .iter()
            .map(|p| 1.0 / euclidean(p, &guess).max(MIN_DISTANCE))
            .collect();
        let total: f32 = weights.iter().sum();

        let mut next = vec![0.0f32; dim];
        for (p, w) in points.iter().zip(&weights) {
            let w = w / total;
            for (x, v) in next.iter_mut().zip(p) {
                *x += w * v;
            }
        }

        let moved = euclidean(&next, &guess);
        guess = next;
        if moved < tol {
            debug!("Geometric median converged after {} iterations", iter + 1);
            break;
        }
    }

    guess
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_majority_cluster_wins_over_mean() {
        let points = vec![vec![0.0, 0.0], vec![0.0, 0.0], vec![10.0, 0.0]];
        let median = weiszfeld(&points, DEFAULT_MAX_ITER, DEFAULT_TOL);
        assert!(median[0].abs() < 1e-3, "got {median:?}");
        assert!(median[1].abs() < 1e-6);
    }

    #[test]
    fn test_symmetric_points_give_center() {
        let points = vec![
            vec![1.0, 0.0],
            vec![-1.0, 0.0],
            vec![0.0, 1.0],
            vec![0.0, -1.0],
        ];
        let median = weiszfeld(&points, DEFAULT_MAX_ITER, DEFAULT_TOL);
        assert!(median[0].abs() < 1e-5);
        assert!(median[1].abs() < 1e-5);
    }

    #[test]
    fn test_coincident_point_stays_finite() {
        // The mean of these rows is exactly the middle point.
        let points = vec![vec![-1.0, 2.0], vec![0.0, 2.0], vec![1.0, 2.0]];
        let median = weiszfeld(&points, DEFAULT_MAX_ITER, DEFAULT_TOL);
        assert!(median.iter().all(|v| v.is_finite()));
        assert!(median[0].abs() < 1e-5);
        assert!((median[1] - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_single_point() {
        let points = vec![vec![3.0, -4.0, 5.0]];
        let median = weiszfeld(&points, DEFAULT_MAX_ITER, DEFAULT_TOL);
        assert_eq!(median, vec![3.0, -4.0, 5.0]);
    }

    #[test]
    fn test_tensor_entry_point() {
        let device = Device::Cpu;
        let points =
            Tensor::from_vec(vec![0.0f32, 0.0, 0.0, 0.0, 10.0, 0.0], (3, 2), &device).unwrap();
        let median = geometric_median(&points, DEFAULT_MAX_ITER, DEFAULT_TOL).unwrap();
        assert_eq!(median.dims(), &[2]);
        let values: Vec<f32> = median.to_vec1().unwrap();
        assert!(values[0] < 1e-3);
    }
}
