//! Matroyshka batch top-k sparse autoencoder
//!
//! A sparse dictionary whose features are split into ordered, nested groups.
//! Any prefix of groups is a usable sub-dictionary on its own.
//!
//! # Architecture
//!
//! ```text
//! Encode:  pre   = ReLU((x - b_dec) @ W_enc + b_enc)           [B, F]
//!          codes = batch_top_k(pre, k * B)        (training)
//!                | pre * (pre > threshold)        (evaluation)
//!          codes[:, groups_end(active_groups)..] = 0
//! Decode:  x_hat = codes @ W_dec + b_dec                        [B, D]
//! ```
//!
//! `W_dec` rows are kept at unit norm: the trainer renormalizes before every
//! forward pass and projects the decoder gradient onto the tangent space of
//! each row before the optimizer consumes it.
//!
//! # File Layout
//!
//! A saved dictionary is a single safetensors file with:
//! - `W_enc`: `[activation_dim, dict_size]` (F32)
//! - `b_enc`: `[dict_size]` (F32)
//! - `W_dec`: `[dict_size, activation_dim]` (F32)
//! - `b_dec`: `[activation_dim]` (F32)
//! - `k`: scalar (I64)
//! - `group_sizes`: `[n_groups]` (I64)
//! - `threshold`: scalar (F32), `-1` while unset

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use hf_hub::{api::sync::Api, Repo, RepoType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use safetensors::tensor::SafeTensors;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::groups::FeatureGroups;

/// Threshold value before the trainer has produced an estimate.
pub const UNSET_THRESHOLD: f32 = -1.0;

const W_ENC: &str = "W_enc";
const B_ENC: &str = "b_enc";
const W_DEC: &str = "W_dec";
const B_DEC: &str = "b_dec";
const K: &str = "k";
const GROUP_SIZES: &str = "group_sizes";
const THRESHOLD: &str = "threshold";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Everything the trainer needs from one encoder pass.
#[derive(Debug, Clone)]
pub struct EncodeOutput {
    /// Sparse code `[batch, dict_size]`
    pub codes: Tensor,
    /// ReLU activations before sparsification `[batch, dict_size]`
    pub pre_activations: Tensor,
    /// Per feature: nonzero in at least one row of `codes`
    pub active: Vec<bool>,
}

/// Sparse autoencoder with nested feature groups and batch top-k sparsity.
#[derive(Debug)]
pub struct MatroyshkaDictionary {
    activation_dim: usize,
    dict_size: usize,
    k: usize,
    groups: FeatureGroups,
    /// Number of leading groups allowed to fire (1..=groups.len())
    active_groups: usize,
    /// Adaptive activation threshold; `UNSET_THRESHOLD` until estimated
    threshold: f32,
    w_enc: Var, // [activation_dim, dict_size]
    b_enc: Var, // [dict_size]
    w_dec: Var, // [dict_size, activation_dim]
    b_dec: Var, // [activation_dim]
    device: Device,
}

impl MatroyshkaDictionary {
    /// Create a freshly initialized dictionary.
    ///
    /// `W_dec` is drawn Kaiming-uniform, normalized to unit rows, and `W_enc`
    /// starts as its transpose. Biases start at zero.
    pub fn new(
        activation_dim: usize,
        dict_size: usize,
        k: usize,
        group_sizes: &[usize],
        device: &Device,
    ) -> Result<Self> {
        let mut rng = StdRng::from_entropy();
        Self::with_rng(activation_dim, dict_size, k, group_sizes, &mut rng, device)
    }

    /// Like [`new`](Self::new) with a reproducible initialization.
    pub fn new_seeded(
        activation_dim: usize,
        dict_size: usize,
        k: usize,
        group_sizes: &[usize],
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::with_rng(activation_dim, dict_size, k, group_sizes, &mut rng, device)
    }

    fn with_rng<R: Rng>(
        activation_dim: usize,
        dict_size: usize,
        k: usize,
        group_sizes: &[usize],
        rng: &mut R,
        device: &Device,
    ) -> Result<Self> {
        let groups = FeatureGroups::new(group_sizes, dict_size)?;
        validate_k(k)?;
        anyhow::ensure!(activation_dim > 0, "activation_dim must be positive");

        // kaiming_uniform with a = sqrt(5): bound = 1 / sqrt(fan_in)
        let bound = 1.0 / (activation_dim as f32).sqrt();
        let values: Vec<f32> = (0..dict_size * activation_dim)
            .map(|_| rng.gen_range(-bound..bound))
            .collect();
        let w_dec = Tensor::from_vec(values, (dict_size, activation_dim), device)?;
        let w_dec = unit_rows(&w_dec)?;
        let w_enc = w_dec.t()?.contiguous()?;
        let b_enc = Tensor::zeros(dict_size, DType::F32, device)?;
        let b_dec = Tensor::zeros(activation_dim, DType::F32, device)?;

        Self::from_parts(w_enc, b_enc, w_dec, b_dec, k, groups, UNSET_THRESHOLD, device)
    }

    #[allow(clippy::too_many_arguments)]
    fn from_parts(
        w_enc: Tensor,
        b_enc: Tensor,
        w_dec: Tensor,
        b_dec: Tensor,
        k: usize,
        groups: FeatureGroups,
        threshold: f32,
        device: &Device,
    ) -> Result<Self> {
        let (activation_dim, dict_size) = w_enc.dims2()?;
        anyhow::ensure!(
            groups.dict_size() == dict_size,
            "group sizes cover {} features but W_enc has {dict_size}",
            groups.dict_size()
        );
        anyhow::ensure!(
            w_dec.dims() == [dict_size, activation_dim],
            "W_dec shape {:?} does not match W_enc shape [{activation_dim}, {dict_size}]",
            w_dec.dims()
        );
        anyhow::ensure!(
            b_enc.dims() == [dict_size],
            "b_enc shape {:?}, expected [{dict_size}]",
            b_enc.dims()
        );
        anyhow::ensure!(
            b_dec.dims() == [activation_dim],
            "b_dec shape {:?}, expected [{activation_dim}]",
            b_dec.dims()
        );

        let param = |t: Tensor| -> Result<Var> {
            let t = t.to_dtype(DType::F32)?.to_device(device)?;
            Ok(Var::from_tensor(&t)?)
        };

        Ok(Self {
            activation_dim,
            dict_size,
            k,
            active_groups: groups.len(),
            groups,
            threshold,
            w_enc: param(w_enc)?,
            b_enc: param(b_enc)?,
            w_dec: param(w_dec)?,
            b_dec: param(b_dec)?,
            device: device.clone(),
        })
    }

    // --- Accessors ---

    pub fn activation_dim(&self) -> usize {
        self.activation_dim
    }

    pub fn dict_size(&self) -> usize {
        self.dict_size
    }

    /// Average number of active features per sample under batch top-k
    pub fn k(&self) -> usize {
        self.k
    }

    pub fn groups(&self) -> &FeatureGroups {
        &self.groups
    }

    pub fn group_sizes(&self) -> &[usize] {
        self.groups.sizes()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn encoder_weight(&self) -> &Tensor {
        self.w_enc.as_tensor()
    }

    pub fn encoder_bias(&self) -> &Tensor {
        self.b_enc.as_tensor()
    }

    pub fn decoder_weight(&self) -> &Tensor {
        self.w_dec.as_tensor()
    }

    pub fn decoder_bias(&self) -> &Tensor {
        self.b_dec.as_tensor()
    }

    /// Parameters the optimizer updates, in a fixed order.
    pub fn trainable_vars(&self) -> Vec<Var> {
        vec![
            self.w_enc.clone(),
            self.b_enc.clone(),
            self.w_dec.clone(),
            self.b_dec.clone(),
        ]
    }

    /// Overwrite the decoder bias (used to seed it with the geometric median).
    pub fn set_decoder_bias(&self, bias: &Tensor) -> Result<()> {
        anyhow::ensure!(
            bias.dims() == [self.activation_dim],
            "decoder bias shape {:?}, expected [{}]",
            bias.dims(),
            self.activation_dim
        );
        let bias = bias.to_dtype(DType::F32)?.to_device(&self.device)?;
        self.b_dec.set(&bias)?;
        Ok(())
    }

    // --- Nested groups ---

    pub fn active_groups(&self) -> usize {
        self.active_groups
    }

    /// Restrict encoding to the first `n` groups.
    ///
    /// Columns past the boundary are zeroed by every `encode`, in both
    /// sparsification modes.
    pub fn set_active_groups(&mut self, n: usize) -> Result<()> {
        if n == 0 || n > self.groups.len() {
            return Err(ConfigError::ActiveGroups {
                requested: n,
                n_groups: self.groups.len(),
            }
            .into());
        }
        self.active_groups = n;
        Ok(())
    }

    // --- Adaptive threshold ---

    /// Current threshold, `UNSET_THRESHOLD` (-1) before the first estimate.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn has_threshold(&self) -> bool {
        self.threshold >= 0.0
    }

    /// Fold a batch's minimum positive activation into the running threshold.
    ///
    /// The first estimate replaces the sentinel; later ones are averaged with
    /// `threshold = beta * threshold + (1 - beta) * min_activation`.
    pub fn update_threshold(&mut self, min_activation: f32, beta: f64) {
        if self.threshold < 0.0 {
            self.threshold = min_activation;
        } else {
            self.threshold = (beta * f64::from(self.threshold)
                + (1.0 - beta) * f64::from(min_activation)) as f32;
        }
    }

    // --- Encoding ---

    /// ReLU pre-activations `(x - b_dec) @ W_enc + b_enc`, shape `[batch, dict_size]`.
    pub fn pre_activations(&self, x: &Tensor) -> Result<Tensor> {
        let (_, dim) = x.dims2().context("encoder input must be [batch, activation_dim]")?;
        anyhow::ensure!(
            dim == self.activation_dim,
            "input dimension {dim} != activation_dim {}",
            self.activation_dim
        );
        let x = x.to_dtype(DType::F32)?;
        let pre = x
            .broadcast_sub(self.b_dec.as_tensor())?
            .matmul(self.w_enc.as_tensor())?
            .broadcast_add(self.b_enc.as_tensor())?;
        Ok(pre.relu()?)
    }

    /// Encode a batch into sparse codes.
    ///
    /// With `use_threshold` every activation at or below the adaptive threshold
    /// is dropped; this does not depend on batch size but gives no exact
    /// per-sample sparsity. Without it, the `k * batch` largest activations of
    /// the whole batch are kept (entries tied at the cutoff are dropped).
    pub fn encode(&self, x: &Tensor, use_threshold: bool) -> Result<Tensor> {
        Ok(self.sparsify(x, use_threshold)?.0)
    }

    /// Encode and report which features fired in at least one row.
    pub fn encode_with_activity(&self, x: &Tensor, use_threshold: bool) -> Result<(Tensor, Vec<bool>)> {
        let out = self.encode_detailed(x, use_threshold)?;
        Ok((out.codes, out.active))
    }

    /// Encode keeping the pre-sparsification activations as well.
    pub fn encode_detailed(&self, x: &Tensor, use_threshold: bool) -> Result<EncodeOutput> {
        let (codes, pre_activations) = self.sparsify(x, use_threshold)?;
        let active = codes
            .sum(0)?
            .to_vec1::<f32>()?
            .into_iter()
            .map(|v| v > 0.0)
            .collect();
        Ok(EncodeOutput {
            codes,
            pre_activations,
            active,
        })
    }

    fn sparsify(&self, x: &Tensor, use_threshold: bool) -> Result<(Tensor, Tensor)> {
        let pre = self.pre_activations(x)?;
        let (batch, dict_size) = pre.dims2()?;

        let sparse = if use_threshold {
            let threshold = Tensor::full(self.threshold, (batch, dict_size), pre.device())?;
            let keep = pre.gt(&threshold)?.to_dtype(DType::F32)?;
            (&pre * keep)?
        } else {
            batch_top_k(&pre, self.k * batch)?
        };

        let codes = self.zero_inactive_groups(&sparse)?;
        Ok((codes, pre))
    }

    fn zero_inactive_groups(&self, codes: &Tensor) -> Result<Tensor> {
        let limit = self.groups.end_of(self.active_groups);
        if limit == self.dict_size {
            return Ok(codes.clone());
        }
        let column_mask: Vec<f32> = (0..self.dict_size)
            .map(|i| if i < limit { 1.0 } else { 0.0 })
            .collect();
        let column_mask = Tensor::from_vec(column_mask, self.dict_size, codes.device())?;
        Ok(codes.broadcast_mul(&column_mask)?)
    }

    // --- Decoding ---

    /// `codes @ W_dec + b_dec`
    pub fn decode(&self, codes: &Tensor) -> Result<Tensor> {
        Ok(codes
            .matmul(self.w_dec.as_tensor())?
            .broadcast_add(self.b_dec.as_tensor())?)
    }

    /// Threshold-mode encode followed by decode.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let codes = self.encode(x, true)?;
        self.decode(&codes)
    }

    /// Like [`forward`](Self::forward), also returning the sparse code.
    pub fn forward_with_features(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let codes = self.encode(x, true)?;
        let x_hat = self.decode(&codes)?;
        Ok((x_hat, codes))
    }

    // --- Decoder constraints ---

    /// Rescale every decoder row to unit Euclidean norm, in place.
    pub fn set_decoder_norm_to_unit_norm(&self) -> Result<()> {
        let normalized = unit_rows(self.w_dec.as_tensor())?;
        self.w_dec.set(&normalized)?;
        Ok(())
    }

    /// Remove from the `W_dec` gradient the component parallel to each row.
    ///
    /// Assumes rows are unit norm; the projected gradient then leaves row
    /// norms unchanged to first order.
    pub fn remove_gradient_parallel_to_decoder_directions(&self, grads: &mut GradStore) -> Result<()> {
        let w_dec = self.w_dec.as_tensor();
        let grad = grads
            .get(w_dec)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("W_dec gradient not populated; run backward() first"))?;

        let parallel = (&grad * w_dec)?.sum_keepdim(1)?; // [dict_size, 1]
        let projected = (&grad - parallel.broadcast_mul(w_dec)?)?;
        grads.insert(w_dec, projected);
        Ok(())
    }

    /// Multiply the biases (and an estimated threshold) by `scale`.
    pub fn scale_biases(&mut self, scale: f64) -> Result<()> {
        self.b_enc.set(&(self.b_enc.as_tensor() * scale)?)?;
        self.b_dec.set(&(self.b_dec.as_tensor() * scale)?)?;
        if self.threshold >= 0.0 {
            self.threshold = (f64::from(self.threshold) * scale) as f32;
        }
        Ok(())
    }

    // --- Persistence ---

    /// All parameters and metadata, keyed by their file names.
    pub fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let cpu = Device::Cpu;
        let sizes: Vec<i64> = self.groups.sizes().iter().map(|&s| s as i64).collect();

        let mut tensors = HashMap::new();
        tensors.insert(W_ENC.to_string(), self.w_enc.as_tensor().to_device(&cpu)?);
        tensors.insert(B_ENC.to_string(), self.b_enc.as_tensor().to_device(&cpu)?);
        tensors.insert(W_DEC.to_string(), self.w_dec.as_tensor().to_device(&cpu)?);
        tensors.insert(B_DEC.to_string(), self.b_dec.as_tensor().to_device(&cpu)?);
        tensors.insert(K.to_string(), Tensor::new(self.k as i64, &cpu)?);
        tensors.insert(GROUP_SIZES.to_string(), Tensor::new(sizes.as_slice(), &cpu)?);
        tensors.insert(THRESHOLD.to_string(), Tensor::new(self.threshold, &cpu)?);
        Ok(tensors)
    }

    /// Write the dictionary to a safetensors file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tensors = self.state_dict()?;
        candle_core::safetensors::save(&tensors, path)
            .with_context(|| format!("Failed to write dictionary to {}", path.display()))?;
        debug!("Saved dictionary to {}", path.display());
        Ok(())
    }

    /// Load a dictionary saved by [`save`](Self::save).
    ///
    /// `activation_dim` and `dict_size` come from the `W_enc` shape. If `k` is
    /// given and the file also stores one, they must agree.
    pub fn from_pretrained(path: impl AsRef<Path>, k: Option<usize>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read dictionary file {}", path.display()))?;
        let st = SafeTensors::deserialize(&data)
            .with_context(|| format!("Failed to deserialize dictionary file {}", path.display()))?;

        let w_enc = load_tensor(&st, W_ENC, device)?;
        let b_enc = load_tensor(&st, B_ENC, device)?;
        let w_dec = load_tensor(&st, W_DEC, device)?;
        let b_dec = load_tensor(&st, B_DEC, device)?;
        let (activation_dim, dict_size) = w_enc
            .dims2()
            .context("W_enc must be [activation_dim, dict_size]")?;

        let stored_k = match st.tensor(K) {
            Ok(view) => {
                let raw = first_i64(&tensor_from_view(&view, &Device::Cpu)?)?;
                Some(usize::try_from(raw).ok().filter(|&v| v > 0).ok_or(ConfigError::InvalidK { k: raw })?)
            }
            Err(_) => None,
        };
        let k = match (k, stored_k) {
            (Some(requested), Some(stored)) if requested != stored => {
                return Err(ConfigError::KMismatch { requested, stored }.into());
            }
            (Some(requested), _) => requested,
            (None, Some(stored)) => stored,
            (None, None) => anyhow::bail!(
                "{} stores no k and none was supplied",
                path.display()
            ),
        };
        validate_k(k)?;

        let sizes_view = st
            .tensor(GROUP_SIZES)
            .with_context(|| format!("Tensor '{GROUP_SIZES}' not found in {}", path.display()))?;
        let group_sizes = tensor_from_view(&sizes_view, &Device::Cpu)?
            .to_dtype(DType::I64)?
            .to_vec1::<i64>()?
            .into_iter()
            .map(|s| {
                usize::try_from(s).map_err(|_| {
                    ConfigError::invalid(format!(
                        "stored group size {s} in {} is negative",
                        path.display()
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let groups = FeatureGroups::new(&group_sizes, dict_size)?;

        let threshold = match st.tensor(THRESHOLD) {
            Ok(view) => tensor_from_view(&view, &Device::Cpu)?
                .flatten_all()?
                .to_dtype(DType::F32)?
                .to_vec1::<f32>()?
                .first()
                .copied()
                .unwrap_or(UNSET_THRESHOLD),
            Err(_) => UNSET_THRESHOLD,
        };

        info!(
            "Loaded dictionary: activation_dim={}, dict_size={}, k={}, groups={:?}",
            activation_dim, dict_size, k, group_sizes
        );

        Self::from_parts(w_enc, b_enc, w_dec, b_dec, k, groups, threshold, device)
    }

    /// Download a dictionary file from a HuggingFace model repository and load it.
    pub fn from_hub(repo_id: &str, filename: &str, k: Option<usize>, device: &Device) -> Result<Self> {
        let api = Api::new().context("Failed to create HuggingFace API")?;
        let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));
        info!("Downloading {filename} from {repo_id}");
        let path = repo
            .get(filename)
            .with_context(|| format!("Failed to download {filename} from {repo_id}"))?;
        Self::from_pretrained(path, k, device)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate_k(k: usize) -> Result<(), ConfigError> {
    if k == 0 {
        return Err(ConfigError::InvalidK { k: 0 });
    }
    Ok(())
}

/// Divide each row by its Euclidean norm (plus machine epsilon).
fn unit_rows(w: &Tensor) -> Result<Tensor> {
    let norm = w.sqr()?.sum_keepdim(1)?.sqrt()?;
    let norm = (norm + f64::from(f32::EPSILON))?;
    Ok(w.broadcast_div(&norm)?)
}

/// Keep the `keep` largest entries of a non-negative tensor, zero the rest.
///
/// Runs on the tensor's device: a binary search over f32 bit patterns (which
/// order like the values for non-negative floats) finds the smallest cutoff
/// with at most `keep` entries above it. Costs at most 32 scalar reads instead
/// of a host copy of the whole matrix. Entries tied at the cutoff are all
/// dropped, so fewer than `keep` survive only when values tie exactly.
fn batch_top_k(pre: &Tensor, keep: usize) -> Result<Tensor> {
    if keep >= pre.elem_count() {
        return Ok(pre.clone());
    }
    if keep == 0 {
        return Ok(pre.zeros_like()?);
    }

    // Invariant: count_above(hi) <= keep < count_above(lo)
    if count_above(pre, 0.0)? <= keep {
        return keep_above(pre, 0.0);
    }
    let max = pre.flatten_all()?.max(0)?.to_scalar::<f32>()?;
    let mut lo = 0.0f32.to_bits();
    let mut hi = max.to_bits();
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if count_above(pre, f32::from_bits(mid))? <= keep {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    keep_above(pre, f32::from_bits(hi))
}

fn count_above(pre: &Tensor, cutoff: f32) -> Result<usize> {
    let cutoff = Tensor::new(cutoff, pre.device())?;
    let count = pre
        .broadcast_gt(&cutoff)?
        .to_dtype(DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?;
    Ok(count as usize)
}

fn keep_above(pre: &Tensor, cutoff: f32) -> Result<Tensor> {
    let cutoff = Tensor::new(cutoff, pre.device())?;
    let mask = pre.broadcast_gt(&cutoff)?.to_dtype(pre.dtype())?;
    Ok((pre * mask)?)
}

/// 0/1 mask keeping the `keep` largest entries of `values`.
///
/// Ties at the cutoff are resolved by selection order, not by index.
pub fn top_k_mask(values: &[f32], keep: usize) -> Vec<f32> {
    let keep = keep.min(values.len());
    let mut mask = vec![0.0f32; values.len()];
    if keep == 0 {
        return mask;
    }
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.select_nth_unstable_by(keep - 1, |&a, &b| values[b].total_cmp(&values[a]));
    for &i in &order[..keep] {
        mask[i] = 1.0;
    }
    mask
}

fn load_tensor(st: &SafeTensors<'_>, name: &str, device: &Device) -> Result<Tensor> {
    let view = st
        .tensor(name)
        .with_context(|| format!("Tensor '{name}' not found in dictionary file"))?;
    Ok(tensor_from_view(&view, device)?.to_dtype(DType::F32)?)
}

fn first_i64(t: &Tensor) -> Result<i64> {
    t.flatten_all()?
        .to_dtype(DType::I64)?
        .to_vec1::<i64>()?
        .first()
        .copied()
        .ok_or_else(|| anyhow::anyhow!("expected a scalar, got an empty tensor"))
}

/// Convert a safetensors view into a candle `Tensor` on the given device.
fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        safetensors::Dtype::F64 => DType::F64,
        safetensors::Dtype::I64 => DType::I64,
        safetensors::Dtype::U32 => DType::U32,
        other => anyhow::bail!("Unsupported dictionary tensor dtype: {other:?}"),
    };
    let tensor = Tensor::from_raw_buffer(view.data(), dtype, &shape, device)?;
    Ok(tensor)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
