//! Group loss weighting and group sizing.
//!
//! Each Matroyshka group contributes its own reconstruction loss. The
//! weights come from a base distribution (by default the group-size
//! fractions) sharpened or flattened by a temperature:
//!
//! ```text
//! w_i = softmax(log(p_i) / τ)
//! ```
//!
//! `τ → 0` concentrates on the largest entry, `τ → ∞` tends to uniform and
//! `τ = 1` renormalizes the input.

use crate::error::ConfigError;

/// Relative tolerance used when checking that fractions sum to one.
const FRACTION_SUM_REL_TOL: f64 = 1e-9;

/// Temperature-scale a probability distribution.
///
/// Fails if any probability is not strictly positive (its log is undefined)
/// or if the temperature is not strictly positive.
pub fn apply_temperature(probabilities: &[f64], temperature: f64) -> Result<Vec<f64>, ConfigError> {
    if !(temperature > 0.0 && temperature.is_finite()) {
        return Err(ConfigError::Weighting(format!(
            "temperature={temperature} must be positive and finite"
        )));
    }
    if probabilities.is_empty() {
        return Err(ConfigError::Weighting(
            "probability list is empty".to_string(),
        ));
    }
    if let Some(p) = probabilities.iter().find(|&&p| !(p > 0.0)) {
        return Err(ConfigError::Weighting(format!(
            "probability {p} is not positive in {probabilities:?}"
        )));
    }

    let logits: Vec<f64> = probabilities.iter().map(|p| p.ln() / temperature).collect();
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exp: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let total: f64 = exp.iter().sum();

    Ok(exp.into_iter().map(|e| e / total).collect())
}

/// Split `dict_size` features into groups following `fractions`.
///
/// Every group but the last receives `floor(f_i * dict_size)` features; the
/// last one absorbs the remainder so the sizes always sum to `dict_size`.
pub fn group_sizes_from_fractions(
    fractions: &[f64],
    dict_size: usize,
) -> Result<Vec<usize>, ConfigError> {
    let sum: f64 = fractions.iter().sum();
    if fractions.is_empty() || (sum - 1.0).abs() > FRACTION_SUM_REL_TOL * sum.abs().max(1.0) {
        return Err(ConfigError::FractionSum {
            fractions: fractions.to_vec(),
            sum,
        });
    }
    if let Some(f) = fractions.iter().find(|&&f| f < 0.0) {
        return Err(ConfigError::invalid(format!(
            "group fraction {f} is negative in {fractions:?}"
        )));
    }

    let mut sizes: Vec<usize> = fractions[..fractions.len() - 1]
        .iter()
        .map(|f| (f * dict_size as f64) as usize)
        .collect();
    let assigned: usize = sizes.iter().sum();
    sizes.push(dict_size.saturating_sub(assigned));

    Ok(sizes)
}
