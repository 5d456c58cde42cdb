//! Fixed-point quantization codecs.
//!
//! Quantized code points travel as f32 elements on the wire — every code is
//! an exact integer well inside f32's 24-bit mantissa, so nothing is lost
//! between encode and transport. Encoding truncates toward zero; values
//! below zero clamp to 0 for the linear schemes, and overflow above the
//! integer width wraps rather than saturating.
//!
//! The normalized variants divide by the per-tensor range (or the 2-sigma
//! band) first and decode back into that normalized domain; the range
//! itself is not transmitted.

use crate::settings::QuantScheme;
use crate::tensor::{Tensor, TensorError};

/// Scale for the plain 16-bit scheme. One quantization step = 1/1000.
pub const SCALE_16BIT: f32 = 1000.0;

/// Scale for the plain 8-bit scheme. One quantization step = 1/10.
pub const SCALE_8BIT: f32 = 10.0;

/// Scale applied after normalization for both normalized 16-bit schemes.
pub const SCALE_NORMALIZE_16BIT: f32 = 30000.0;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The per-tensor normalization range collapsed to zero width.
    #[error("cannot normalize a tensor with zero value range")]
    DegenerateRange,

    #[error("cannot quantize an empty tensor")]
    EmptyTensor,

    #[error(transparent)]
    Shape(#[from] TensorError),
}

/// Truncate toward zero, then wrap into u16 width.
fn wrap_u16(scaled: f32) -> u16 {
    (scaled as i64 & 0xFFFF) as u16
}

fn wrap_u8(scaled: f32) -> u8 {
    (scaled as i64 & 0xFF) as u8
}

fn encode_16bit(v: f32) -> f32 {
    if v < 0.0 {
        0.0
    } else {
        wrap_u16(v * SCALE_16BIT) as f32
    }
}

fn encode_8bit(v: f32) -> f32 {
    if v < 0.0 {
        0.0
    } else {
        wrap_u8(v * SCALE_8BIT) as f32
    }
}

/// Median of the tensor's elements. `values` must be non-empty.
fn median(values: &[f32]) -> f32 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Population standard deviation.
fn std_dev(values: &[f32]) -> f32 {
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    var.sqrt()
}

/// Quantize a tensor's elements under the given scheme.
///
/// Returns the flat code-point sequence ready for the packetizer.
pub fn encode(tensor: &Tensor, scheme: QuantScheme) -> Result<Vec<f32>, CodecError> {
    let values = tensor.as_slice();
    if values.is_empty() && scheme != QuantScheme::None {
        return Err(CodecError::EmptyTensor);
    }

    match scheme {
        QuantScheme::None => Ok(values.to_vec()),
        QuantScheme::Q16 => Ok(values.iter().map(|&v| encode_16bit(v)).collect()),
        QuantScheme::Q8 => Ok(values.iter().map(|&v| encode_8bit(v)).collect()),
        QuantScheme::Norm16 => {
            let max = values.iter().cloned().fold(f32::MIN, f32::max);
            let min = values.iter().cloned().fold(f32::MAX, f32::min);
            let span = max - min;
            if span == 0.0 {
                return Err(CodecError::DegenerateRange);
            }
            // No negative clamp — post-PCA values may be negative and are
            // left to wrap.
            Ok(values
                .iter()
                .map(|&v| wrap_u16((v / span) * SCALE_NORMALIZE_16BIT) as f32)
                .collect())
        }
        QuantScheme::Norm2Sigma16 => {
            let med = median(values);
            let sigma = std_dev(values);
            let lower = (med - 2.0 * sigma).max(0.0);
            let upper = med + 2.0 * sigma;
            let span = upper - lower;
            if span == 0.0 {
                return Err(CodecError::DegenerateRange);
            }
            Ok(values
                .iter()
                .map(|&v| {
                    if v < lower || v > upper {
                        0.0
                    } else {
                        wrap_u16((v / span) * SCALE_NORMALIZE_16BIT) as f32
                    }
                })
                .collect())
        }
    }
}

/// Dequantize a flat code-point sequence.
///
/// The normalized schemes decode into the normalized domain — the original
/// range is not transmitted, so it cannot be restored here.
pub fn decode(codes: &[f32], scheme: QuantScheme) -> Vec<f32> {
    match scheme {
        QuantScheme::None => codes.to_vec(),
        QuantScheme::Q16 => codes.iter().map(|&c| c / SCALE_16BIT).collect(),
        QuantScheme::Q8 => codes.iter().map(|&c| c / SCALE_8BIT).collect(),
        QuantScheme::Norm16 | QuantScheme::Norm2Sigma16 => {
            codes.iter().map(|&c| c / SCALE_NORMALIZE_16BIT).collect()
        }
    }
}

/// Dequantize and reshape back into a tensor of the declared shape.
pub fn decode_tensor(
    codes: &[f32],
    scheme: QuantScheme,
    shape: Vec<usize>,
) -> Result<Tensor, CodecError> {
    Ok(Tensor::new(shape, decode(codes, scheme))?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(values: &[f32]) -> Tensor {
        Tensor::from_vec(values.to_vec())
    }

    #[test]
    fn q16_round_trip_within_one_step() {
        let input = [0.0, 0.001, 0.5, 1.2345, 12.75, 60.0];
        let codes = encode(&tensor(&input), QuantScheme::Q16).unwrap();
        let back = decode(&codes, QuantScheme::Q16);
        for (orig, rec) in input.iter().zip(&back) {
            assert!(
                (orig - rec).abs() <= 1.0 / SCALE_16BIT,
                "{orig} decoded to {rec}"
            );
        }
    }

    #[test]
    fn q8_round_trip_within_one_step() {
        let input = [0.0, 0.1, 3.3, 12.7, 25.0];
        let codes = encode(&tensor(&input), QuantScheme::Q8).unwrap();
        let back = decode(&codes, QuantScheme::Q8);
        for (orig, rec) in input.iter().zip(&back) {
            assert!((orig - rec).abs() <= 1.0 / SCALE_8BIT);
        }
    }

    #[test]
    fn negative_values_encode_to_zero() {
        let codes = encode(&tensor(&[-1.0, -0.001]), QuantScheme::Q16).unwrap();
        assert_eq!(codes, vec![0.0, 0.0]);
        let codes = encode(&tensor(&[-5.0]), QuantScheme::Q8).unwrap();
        assert_eq!(codes, vec![0.0]);
    }

    #[test]
    fn overflow_wraps_instead_of_saturating() {
        // 66.0 * 1000 = 66000 = 65536 + 464
        let codes = encode(&tensor(&[66.0]), QuantScheme::Q16).unwrap();
        assert_eq!(codes, vec![464.0]);
        // 26.0 * 10 = 260 = 256 + 4
        let codes = encode(&tensor(&[26.0]), QuantScheme::Q8).unwrap();
        assert_eq!(codes, vec![4.0]);
    }

    #[test]
    fn normalized_codes_stay_in_u16_lattice() {
        let input = [0.5, 1.0, 2.0, 4.0];
        let codes = encode(&tensor(&input), QuantScheme::Norm16).unwrap();
        for c in &codes {
            assert_eq!(c.fract(), 0.0);
            assert!(*c >= 0.0 && *c <= 65535.0);
        }
        // Largest value normalizes to span-relative max.
        let back = decode(&codes, QuantScheme::Norm16);
        let span = 4.0 - 0.5;
        assert!((back[3] - 4.0 / span).abs() <= 1.0 / SCALE_NORMALIZE_16BIT);
    }

    #[test]
    fn normalize_rejects_constant_tensor() {
        let err = encode(&tensor(&[3.0, 3.0, 3.0]), QuantScheme::Norm16).unwrap_err();
        assert!(matches!(err, CodecError::DegenerateRange));
    }

    #[test]
    fn two_sigma_out_of_band_encodes_to_zero() {
        // Tight cluster plus one far outlier: the outlier falls outside
        // median ± 2σ and must encode to 0.
        let input = [1.0, 1.1, 0.9, 1.05, 0.95, 1.0, 1.1, 0.9, 100.0];
        let codes = encode(&tensor(&input), QuantScheme::Norm2Sigma16).unwrap();
        assert_eq!(*codes.last().unwrap(), 0.0);
        // In-band values are non-zero.
        assert!(codes[0] > 0.0);
    }

    #[test]
    fn passthrough_preserves_values() {
        let input = [0.25, -1.5, 3.75];
        let codes = encode(&tensor(&input), QuantScheme::None).unwrap();
        assert_eq!(codes, input.to_vec());
        assert_eq!(decode(&codes, QuantScheme::None), input.to_vec());
    }

    #[test]
    fn decode_tensor_restores_shape() {
        let input = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let codes = encode(&tensor(&input), QuantScheme::Q16).unwrap();
        let t = decode_tensor(&codes, QuantScheme::Q16, vec![2, 3]).unwrap();
        assert_eq!(t.shape(), &[2, 3]);
        assert!(decode_tensor(&codes, QuantScheme::Q16, vec![7]).is_err());
    }
}
