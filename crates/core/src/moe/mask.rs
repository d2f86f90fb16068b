//! Per-token expert bypass.
//!
//! A mask value of 0 routes the token normally. Any other value `k` keeps
//! the token away from the experts; each of its top-k entries is replaced by
//! the fill vector registered for `k` and then weighted by the gate scores
//! like a regular expert output.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};

use super::error::{MoEError, Result};

/// Token mask with one fill vector per non-zero mask value.
#[derive(Debug, Clone)]
pub struct TokenMask {
    values: Vec<u32>,
    fill: HashMap<u32, Tensor>,
}

impl TokenMask {
    /// Create a mask over a flattened token batch.
    ///
    /// Every non-zero value in `values` must have a fill vector.
    pub fn new(values: Vec<u32>, fill: HashMap<u32, Tensor>) -> Result<Self> {
        if let Some(&missing) = values
            .iter()
            .find(|&&v| v != 0 && !fill.contains_key(&v))
        {
            return Err(MoEError::MissingMaskFill(missing));
        }
        Ok(Self { values, fill })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[u32] {
        &self.values
    }

    /// Number of tokens that bypass the experts.
    pub fn num_masked(&self) -> usize {
        self.values.iter().filter(|&&v| v != 0).count()
    }

    /// Check the mask against a `[num_tokens, d_model]` batch.
    pub fn validate(&self, num_tokens: usize, d_model: usize) -> Result<()> {
        if self.values.len() != num_tokens {
            return Err(MoEError::MaskLengthMismatch {
                expected: num_tokens,
                actual: self.values.len(),
            });
        }
        for fill in self.fill.values() {
            if fill.elem_count() != d_model {
                return Err(MoEError::TokenShapeMismatch {
                    d_model,
                    actual: fill.dims().to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Mask restricted to tokens `start..start + len`.
    pub fn slice(&self, start: usize, len: usize) -> Self {
        Self {
            values: self.values[start..start + len].to_vec(),
            fill: self.fill.clone(),
        }
    }

    /// Mark every entry of a masked token as not dispatched.
    ///
    /// `ids` is laid out `[num_tokens, top_k]`.
    pub fn apply_to_ids(&self, ids: &mut [u32], top_k: usize) {
        for (token_ids, &value) in ids.chunks_mut(top_k.max(1)).zip(&self.values) {
            if value != 0 {
                token_ids.fill(u32::MAX);
            }
        }
    }

    /// Fill rows for the flat `[num_tokens * top_k, d_model]` entry layout.
    ///
    /// Rows of unmasked tokens are zero. Returns `None` when no token is
    /// masked.
    pub fn fill_rows(
        &self,
        top_k: usize,
        d_model: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Option<Tensor>> {
        if self.num_masked() == 0 {
            return Ok(None);
        }

        let mut keys: Vec<u32> = self.fill.keys().copied().filter(|&k| k != 0).collect();
        keys.sort_unstable();

        let mut table = Vec::with_capacity(keys.len() + 1);
        table.push(Tensor::zeros((1, d_model), dtype, device)?);
        let mut slot = HashMap::with_capacity(keys.len());
        for (i, key) in keys.iter().enumerate() {
            let fill = &self.fill[key];
            table.push(
                fill.to_device(device)?
                    .to_dtype(dtype)?
                    .reshape((1, d_model))?,
            );
            slot.insert(*key, i as u32 + 1);
        }
        let table = Tensor::cat(&table, 0)?;

        let rows: Vec<u32> = self
            .values
            .iter()
            .flat_map(|v| {
                let row = slot.get(v).copied().unwrap_or(0);
                std::iter::repeat(row).take(top_k)
            })
            .collect();
        let rows = Tensor::from_vec(rows, self.values.len() * top_k, device)?;
        Ok(Some(table.index_select(&rows, 0)?))
    }
}
