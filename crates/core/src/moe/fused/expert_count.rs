//! Per-expert token counts and the offset table derived from them.
//!
//! A grouped token batch stores expert 0's tokens first, then expert 1's,
//! and so on. The prefix sums of the count vector give every expert's
//! contiguous row range, which is all either expert variant needs to slice
//! the batch.

use super::super::error::{MoEError, Result};

/// One expert's contiguous slice of a grouped token batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpertSegment {
    /// Local expert index.
    pub expert: usize,
    /// First row of the slice.
    pub start: usize,
    /// Number of rows (always > 0 for yielded segments).
    pub len: usize,
}

/// Validated count vector with its prefix-sum offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpertCounts {
    counts: Vec<usize>,
    /// `offsets[i]` is the first row of expert i; `offsets[num_expert]` == N.
    offsets: Vec<usize>,
}

impl ExpertCounts {
    /// Build the offset table, checking the count vector against the
    /// expected expert and token totals.
    pub fn new(counts: &[usize], num_expert: usize, num_tokens: usize) -> Result<Self> {
        if counts.len() != num_expert {
            return Err(MoEError::CountLengthMismatch {
                expected: num_expert,
                actual: counts.len(),
            });
        }

        let mut offsets = Vec::with_capacity(num_expert + 1);
        let mut acc = 0usize;
        offsets.push(acc);
        for &count in counts {
            acc += count;
            offsets.push(acc);
        }

        if acc != num_tokens {
            return Err(MoEError::CountSumMismatch {
                expected: num_tokens,
                actual: acc,
            });
        }

        Ok(Self {
            counts: counts.to_vec(),
            offsets,
        })
    }

    /// Number of experts covered.
    pub fn num_expert(&self) -> usize {
        self.counts.len()
    }

    /// Total number of tokens.
    pub fn total(&self) -> usize {
        self.offsets[self.counts.len()]
    }

    /// Raw count vector.
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// Prefix-sum offsets, one longer than the count vector.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Non-empty expert slices in ascending expert order.
    ///
    /// Zero-count experts are skipped entirely.
    pub fn segments(&self) -> impl Iterator<Item = ExpertSegment> + '_ {
        self.counts
            .iter()
            .enumerate()
            .filter_map(|(expert, &len)| {
                (len > 0).then(|| ExpertSegment {
                    expert,
                    start: self.offsets[expert],
                    len,
                })
            })
    }

    /// Number of experts that received at least one token.
    pub fn active_experts(&self) -> usize {
        self.counts.iter().filter(|&&c| c > 0).count()
    }
}
