//! 8-bit per-vector affine quantization.
//!
//! Every vector carries its own scale. The encoded layout is:
//!
//! ```text
//! [min: f32 LE][max: f32 LE][code_0: u8][code_1: u8]...[code_{d-1}: u8]
//! ```
//!
//! A component `v` maps to `round(clamp((v - min) / (max - min), 0, 1) * 255)`
//! and decodes back to `min + code / 255 * (max - min)`. A constant vector
//! (`max == min`) encodes every component as the midpoint code.

use crate::vector::types::{VectorDimension, VectorError};

/// Size of the `(min, max)` header in bytes.
pub const HEADER_LEN: usize = 8;

/// Code written for every component of a constant vector.
pub const MIDPOINT_CODE: u8 = 128;

/// A quantized vector: 8-byte scale header followed by one code per dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuantizedVector(Vec<u8>);

impl QuantizedVector {
    /// Quantizes a float vector.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an empty vector or one containing
    /// non-finite components.
    pub fn encode(vector: &[f32]) -> Result<Self, VectorError> {
        if vector.is_empty() {
            return Err(VectorError::InvalidArgument(
                "cannot quantize an empty vector".to_string(),
            ));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(VectorError::InvalidArgument(
                "cannot quantize a vector with non-finite components".to_string(),
            ));
        }

        let (min, max) = vector
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });

        let mut bytes = Vec::with_capacity(HEADER_LEN + vector.len());
        bytes.extend_from_slice(&min.to_le_bytes());
        bytes.extend_from_slice(&max.to_le_bytes());

        let span = max - min;
        if span == 0.0 {
            bytes.resize(HEADER_LEN + vector.len(), MIDPOINT_CODE);
        } else {
            bytes.extend(vector.iter().map(|&v| quantize_component(v, min, span)));
        }

        Ok(Self(bytes))
    }

    /// Wraps raw encoded bytes, validating the layout.
    ///
    /// # Errors
    /// Returns `MalformedQuantized` if the buffer holds no codes after the header.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, VectorError> {
        if bytes.len() <= HEADER_LEN {
            return Err(VectorError::MalformedQuantized(format!(
                "expected more than {HEADER_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Dequantizes back into floats.
    #[must_use]
    pub fn decode(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.len());
        self.decode_into(&mut out);
        out
    }

    /// Dequantizes, appending to `out`. Used by the matrix builders to avoid
    /// one allocation per row.
    pub fn decode_into(&self, out: &mut Vec<f32>) {
        let min = self.min();
        let span = self.max() - min;
        out.extend(
            self.codes()
                .iter()
                .map(|&code| min + (f32::from(code) / 255.0) * span),
        );
    }

    /// Lower bound of the scale.
    #[must_use]
    pub fn min(&self) -> f32 {
        f32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Upper bound of the scale.
    #[must_use]
    pub fn max(&self) -> f32 {
        f32::from_le_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }

    /// The per-dimension codes, without the header.
    #[must_use]
    pub fn codes(&self) -> &[u8] {
        &self.0[HEADER_LEN..]
    }

    /// Number of dimensions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len() - HEADER_LEN
    }

    /// Always false for a constructed vector; present for API symmetry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of dimensions as a validated wrapper.
    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        // both constructors guarantee at least one code
        VectorDimension::new_unchecked(self.len())
    }

    /// Size of the encoded form in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.0.len()
    }

    /// Encoded bytes, header included.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Encoded width of a vector with `dimension` components.
#[must_use]
pub const fn encoded_len(dimension: usize) -> usize {
    HEADER_LEN + dimension
}

fn quantize_component(value: f32, min: f32, span: f32) -> u8 {
    let normalized = ((value - min) / span).clamp(0.0, 1.0);
    (normalized * 255.0).round() as u8
}

/// Quantizes every row of a float matrix.
pub fn encode_matrix(rows: &[Vec<f32>]) -> Result<Vec<QuantizedVector>, VectorError> {
    rows.iter().map(|row| QuantizedVector::encode(row)).collect()
}

/// Dequantizes every row of a quantized matrix.
#[must_use]
pub fn decode_matrix(rows: &[QuantizedVector]) -> Vec<Vec<f32>> {
    rows.iter().map(QuantizedVector::decode).collect()
}
