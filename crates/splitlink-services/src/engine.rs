//! Inference-engine seam.
//!
//! The transport never computes a prediction itself — it hands tensors to
//! whatever implements [`InferenceEngine`]. Model loading, sub-graph
//! slicing, and the actual math live behind this trait; the shipped
//! [`MockEngine`] is a deterministic stand-in used by tests and dry runs.

use anyhow::Result;

use splitlink_core::Tensor;

/// Opaque handle to a loaded model.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    pub id: String,
    pub layer_count: u32,
}

pub trait InferenceEngine: Send + Sync {
    /// Load (or reload) a model by identifier.
    fn load_model(&self, id: &str) -> Result<ModelHandle>;

    /// Turn a raw input file into the model's input tensor.
    fn decode_input(&self, bytes: &[u8]) -> Result<Tensor>;

    /// Run layers `start_layer..=end_layer` (1-based, inclusive) over the
    /// input. `end_layer == layer_count` produces the class scores.
    fn run_slice(
        &self,
        model: &ModelHandle,
        start_layer: u32,
        end_layer: u32,
        input: &Tensor,
    ) -> Result<Tensor>;
}

/// Deterministic stand-in engine.
///
/// Each "layer" folds neighbouring pairs and applies a ReLU-style floor,
/// so the output depends on every input element and both halves of a split
/// run compose to the same result as an unsplit one. The final layer emits
/// `class_count` scores.
pub struct MockEngine {
    pub layer_count: u32,
    pub class_count: usize,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            layer_count: 6,
            class_count: 10,
        }
    }
}

impl MockEngine {
    fn layer(&self, input: &[f32]) -> Vec<f32> {
        if input.len() <= 1 {
            return input.to_vec();
        }
        input
            .chunks(2)
            .map(|pair| {
                let sum: f32 = pair.iter().sum();
                (sum * 0.5).max(0.0)
            })
            .collect()
    }

    fn scores(&self, input: &[f32]) -> Vec<f32> {
        let mut scores = vec![0.0f32; self.class_count];
        for (i, &v) in input.iter().enumerate() {
            scores[i % self.class_count] += v;
        }
        scores
    }
}

impl InferenceEngine for MockEngine {
    fn load_model(&self, id: &str) -> Result<ModelHandle> {
        Ok(ModelHandle {
            id: id.to_string(),
            layer_count: self.layer_count,
        })
    }

    fn decode_input(&self, bytes: &[u8]) -> Result<Tensor> {
        let data: Vec<f32> = bytes.iter().map(|&b| b as f32 / 255.0).collect();
        Ok(Tensor::from_vec(data))
    }

    fn run_slice(
        &self,
        model: &ModelHandle,
        start_layer: u32,
        end_layer: u32,
        input: &Tensor,
    ) -> Result<Tensor> {
        anyhow::ensure!(
            start_layer >= 1 && end_layer <= model.layer_count && start_layer <= end_layer,
            "invalid layer slice {start_layer}..={end_layer} for {} layers",
            model.layer_count
        );

        let mut values = input.as_slice().to_vec();
        for layer in start_layer..=end_layer {
            values = if layer == model.layer_count {
                self.scores(&values)
            } else {
                self.layer(&values)
            };
        }
        Ok(Tensor::from_vec(values))
    }
}
