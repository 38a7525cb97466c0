//! Jagged batch layout for table-batched lookups
//!
//! A batched lookup kernel does not consume the dense `(B, T, L)` index batch
//! directly. It consumes a flat `indices` vector plus `offsets` that mark where
//! each bag starts:
//!
//! ```text
//! batch[b][t][0..L]  ->  indices[(b*T + t)*L .. (b*T + t)*L + L]
//! offsets            =   [0, L, 2L, ..., B*T*L]      (B*T + 1 entries)
//! ```
//!
//! Bag `i` belongs to table `i % T`, so the (B, T, L) row-major order must be
//! preserved exactly.

use ndarray::{Array3, ArrayBase, Data, Dimension, Ix3};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

use crate::error::{BenchError, Result};

/// Draw a synthetic `(B, T, L)` batch with indices uniform in `[0, E - 1)`
///
/// # Errors
///
/// Returns `Err(BenchError::InvalidArgument)` if `num_embeddings < 2`.
pub fn random_batch<R: Rng + ?Sized>(
    batch_size: usize,
    num_tables: usize,
    bag_size: usize,
    num_embeddings: usize,
    rng: &mut R,
) -> Result<Array3<u32>> {
    let high = index_upper_bound(num_embeddings)?;
    Ok(Array3::random_using(
        (batch_size, num_tables, bag_size),
        Uniform::new(0, high),
        rng,
    ))
}

/// Exclusive upper bound for synthetic indices (`E - 1`)
pub(crate) fn index_upper_bound(num_embeddings: usize) -> Result<u32> {
    if num_embeddings < 2 {
        return Err(BenchError::InvalidArgument(format!(
            "num_embeddings must be >= 2, got {num_embeddings}"
        )));
    }
    u32::try_from(num_embeddings - 1).map_err(|_| {
        BenchError::InvalidArgument(format!(
            "num_embeddings {num_embeddings} does not fit 32-bit indices"
        ))
    })
}

/// Flat `indices + offsets` representation of a batch of bags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JaggedLayout {
    indices: Vec<u32>,
    offsets: Vec<u32>,
}

/// Length and value range of a layout's indices, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSummary {
    /// Number of indices
    pub len: usize,
    /// Smallest index (0 when empty)
    pub min: u32,
    /// Largest index (0 when empty)
    pub max: u32,
}

impl JaggedLayout {
    /// Build the jagged layout of a dense `(B, T, L)` batch
    ///
    /// Accepts any dimensionality so that malformed batches are reported
    /// instead of rejected at compile time.
    ///
    /// # Errors
    ///
    /// - `BenchError::InvalidShape` if the batch is not 3-dimensional
    /// - `BenchError::InvalidArgument` if `B*T*L` overflows 32-bit offsets
    pub fn from_dense<S, D>(batch: &ArrayBase<S, D>) -> Result<Self>
    where
        S: Data<Elem = u32>,
        D: Dimension,
    {
        let batch = batch
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|_| BenchError::InvalidShape(batch.shape().to_vec()))?;
        let (b, t, l) = batch.dim();

        let total = b * t * l;
        let bag_size = u32::try_from(l)
            .ok()
            .filter(|_| u32::try_from(total).is_ok())
            .ok_or_else(|| {
                BenchError::InvalidArgument(format!(
                    "{total} indices do not fit 32-bit offsets"
                ))
            })?;

        // Logical iteration order is row-major regardless of memory layout
        let indices: Vec<u32> = batch.iter().copied().collect();
        let offsets: Vec<u32> = (0..=(b * t) as u32).map(|bag| bag * bag_size).collect();

        Ok(Self { indices, offsets })
    }

    /// Build a layout from raw parts, checking only structural consistency
    ///
    /// # Errors
    ///
    /// Returns `Err(BenchError::InvalidArgument)` if offsets are empty, do not
    /// start at zero, decrease, or do not end at `indices.len()`.
    pub fn from_parts(indices: Vec<u32>, offsets: Vec<u32>) -> Result<Self> {
        let well_formed = offsets.first() == Some(&0)
            && offsets.windows(2).all(|w| w[0] <= w[1])
            && offsets.last().map(|&end| end as usize) == Some(indices.len());
        if !well_formed {
            return Err(BenchError::InvalidArgument(format!(
                "malformed offsets for {} indices",
                indices.len()
            )));
        }
        Ok(Self { indices, offsets })
    }

    /// Flat indices in (B, T, L) order
    #[must_use]
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Bag start positions plus the terminal end position
    #[must_use]
    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    /// Number of bags (B × T)
    #[must_use]
    pub fn num_bags(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Check the uniform-bag invariant: every bag has exactly `bag_size` indices
    ///
    /// # Errors
    ///
    /// Returns `Err(BenchError::InvalidArgument)` naming the first bad bag.
    pub fn validate(&self, bag_size: usize) -> Result<()> {
        if let Some(bag) = self
            .offsets
            .windows(2)
            .position(|w| (w[1] - w[0]) as usize != bag_size)
        {
            return Err(BenchError::InvalidArgument(format!(
                "bag {bag} has length {}, expected {bag_size}",
                self.offsets[bag + 1] - self.offsets[bag]
            )));
        }
        if self.offsets.last().map(|&end| end as usize) != Some(self.indices.len()) {
            return Err(BenchError::InvalidArgument(format!(
                "offsets end does not match {} indices",
                self.indices.len()
            )));
        }
        Ok(())
    }

    /// Length and value range of the indices
    #[must_use]
    pub fn summary(&self) -> IndexSummary {
        IndexSummary {
            len: self.indices.len(),
            min: self.indices.iter().copied().min().unwrap_or(0),
            max: self.indices.iter().copied().max().unwrap_or(0),
        }
    }
}


// ============================================================================
// Property-Based Tests
// ============================================================================

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Lengths and offsets follow the uniform-bag arithmetic progression
        #[test]
        fn prop_layout_lengths_and_offsets(
            b in 1usize..12,
            t in 1usize..6,
            l in 1usize..9,
            seed in any::<u32>(),
        ) {
            let batch = Array3::from_shape_fn((b, t, l), |(i, j, k)| {
                seed.wrapping_add((i * 31 + j * 7 + k) as u32) % 1000
            });
            let layout = JaggedLayout::from_dense(&batch).unwrap();

            prop_assert_eq!(layout.indices().len(), b * t * l);
            prop_assert_eq!(layout.offsets().len(), b * t + 1);
            prop_assert_eq!(layout.offsets()[0], 0);
            for w in layout.offsets().windows(2) {
                prop_assert_eq!((w[1] - w[0]) as usize, l);
            }
            prop_assert!(layout.validate(l).is_ok());
        }

        /// Each contiguous run of L indices is exactly batch[b][t][..]
        #[test]
        fn prop_layout_preserves_row_major_order(
            b in 1usize..8,
            t in 1usize..5,
            l in 1usize..7,
        ) {
            let batch = Array3::from_shape_fn((b, t, l), |(i, j, k)| (i * 10_000 + j * 100 + k) as u32);
            let layout = JaggedLayout::from_dense(&batch).unwrap();

            for bi in 0..b {
                for ti in 0..t {
                    let start = (bi * t + ti) * l;
                    let run = &layout.indices()[start..start + l];
                    let expected: Vec<u32> = batch.slice(ndarray::s![bi, ti, ..]).to_vec();
                    prop_assert_eq!(run, expected.as_slice());
                }
            }
        }

        /// Layout construction is deterministic
        #[test]
        fn prop_layout_deterministic(b in 1usize..6, t in 1usize..6, l in 1usize..6) {
            let batch = Array3::from_shape_fn((b, t, l), |(i, j, k)| (i ^ j ^ k) as u32);
            prop_assert_eq!(
                JaggedLayout::from_dense(&batch).unwrap(),
                JaggedLayout::from_dense(&batch).unwrap()
            );
        }
    }
}
