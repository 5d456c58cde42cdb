//! Reduction codec — the pluggable dimensionality-reduction seam.
//!
//! The transport only ever talks to [`ReductionCodec`]; the shipped
//! implementation is a PCA projection backed by a precomputed basis loaded
//! from external storage keyed by (model, layer). Computing the basis is
//! out of scope here — an offline job produces the JSON files this module
//! loads.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::tensor::{Tensor, TensorError};

/// Reduce/reconstruct capability pair the roles program against.
pub trait ReductionCodec: Send + Sync {
    /// Project a tensor, keeping `rate` of its dimensions. The output has
    /// the input's shape with the dropped coefficients zeroed.
    fn reduce(&self, tensor: &Tensor, rate: f64) -> Result<Tensor, ReduceError>;

    /// Invert [`ReductionCodec::reduce`] as far as the retained
    /// coefficients allow.
    fn reconstruct(&self, tensor: &Tensor) -> Result<Tensor, ReduceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    /// Missing basis is a configuration error — fatal, never retried.
    #[error("reduction basis not found at {0}")]
    BasisNotFound(PathBuf),

    #[error("failed to parse basis {path}: {source}")]
    BasisUnreadable {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("basis covers {basis} dimensions, tensor has {tensor}")]
    DimensionMismatch { basis: usize, tensor: usize },

    #[error(transparent)]
    Shape(#[from] TensorError),
}

/// A precomputed PCA basis: the training mean and the component rows,
/// ordered by explained variance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcaBasis {
    pub mean: Vec<f32>,
    /// Component rows, each of length `mean.len()`.
    pub components: Vec<Vec<f32>>,
}

/// PCA projection against a loaded basis.
#[derive(Debug)]
pub struct PcaReduction {
    basis: PcaBasis,
}

impl PcaReduction {
    pub fn new(basis: PcaBasis) -> Self {
        Self { basis }
    }

    /// Load the basis for (model, layer) from `<dir>/<model>/<layer>.json`.
    pub fn load(dir: &Path, model: &str, layer: u32) -> Result<Self, ReduceError> {
        let path = dir.join(model).join(format!("{layer}.json"));
        let text =
            std::fs::read_to_string(&path).map_err(|_| ReduceError::BasisNotFound(path.clone()))?;
        let basis = serde_json::from_str(&text)
            .map_err(|source| ReduceError::BasisUnreadable { path, source })?;
        Ok(Self::new(basis))
    }

    fn check_dims(&self, tensor: &Tensor) -> Result<(), ReduceError> {
        if self.basis.mean.len() != tensor.len() {
            return Err(ReduceError::DimensionMismatch {
                basis: self.basis.mean.len(),
                tensor: tensor.len(),
            });
        }
        Ok(())
    }
}

impl ReductionCodec for PcaReduction {
    fn reduce(&self, tensor: &Tensor, rate: f64) -> Result<Tensor, ReduceError> {
        self.check_dims(tensor)?;
        let n = tensor.len();
        let x = tensor.as_slice();

        // Dimensions to keep, capped by the basis size.
        let keep = ((n as f64 * rate).ceil() as usize).min(self.basis.components.len());

        let mut out = vec![0.0f32; n];
        for (k, row) in self.basis.components.iter().take(keep).enumerate() {
            let mut acc = 0.0f32;
            for i in 0..n {
                acc += row[i] * (x[i] - self.basis.mean[i]);
            }
            out[k] = acc;
        }

        Ok(Tensor::new(tensor.shape().to_vec(), out)?)
    }

    fn reconstruct(&self, tensor: &Tensor) -> Result<Tensor, ReduceError> {
        self.check_dims(tensor)?;
        let n = tensor.len();
        let y = tensor.as_slice();

        let mut out = self.basis.mean.clone();
        for (k, row) in self.basis.components.iter().take(n).enumerate() {
            let coeff = y[k];
            if coeff == 0.0 {
                continue;
            }
            for i in 0..n {
                out[i] += coeff * row[i];
            }
        }

        Ok(Tensor::new(tensor.shape().to_vec(), out)?)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
