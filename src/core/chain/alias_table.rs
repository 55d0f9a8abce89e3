// SPDX-License-Identifier: MIT OR Apache-2.0

//! Alias table for O(1) weighted categorical sampling.
//!
//! Built with Vose's method: construction is Θ(n) time and space, and a
//! sample costs exactly two uniform draws regardless of the number of
//! outcomes. The table stores indices into the caller's weight list, so
//! it composes with any outcome representation.

use rand::Rng;

use crate::core::error::{MarkovError, MarkovResult};

/// One cell of the alias table.
///
/// Picking cell `i` uniformly and then branching on a fair draw against
/// `threshold` yields the exact categorical distribution induced by the
/// source weights, up to floating point error bounded by O(n·ε).
#[derive(Debug, Clone, Copy)]
struct AliasCell {
    /// Probability of keeping index `i` itself, in [0, 1]
    threshold: f64,
    /// Index returned when the draw exceeds `threshold`
    alias: usize,
}

/// Precomputed structure for O(1) weighted sampling over integer weights.
///
/// # Invariants
/// - The table length equals the number of source weights
/// - Every cell's threshold lies in [0, 1]
/// - `alias` always names a valid index
#[derive(Debug, Clone)]
pub struct AliasTable {
    cells: Vec<AliasCell>,
}

impl AliasTable {
    /// Build an alias table from positive integer weights.
    ///
    /// # Errors
    /// Returns [`MarkovError::InvalidInput`] when the weight list is
    /// empty or sums to zero.
    pub fn build(weights: &[u64]) -> MarkovResult<Self> {
        let n = weights.len();
        if n == 0 {
            return Err(MarkovError::invalid_input(
                "alias table requires at least one weight",
            ));
        }

        // Sum in f64, the widest float available here; integer weights
        // below 2^53 sum exactly.
        let total: f64 = weights.iter().map(|w| *w as f64).sum();
        if total <= 0.0 {
            return Err(MarkovError::invalid_input(
                "alias table weights must sum to a positive value",
            ));
        }

        let mut cells = vec![
            AliasCell {
                threshold: 1.0,
                alias: 0,
            };
            n
        ];
        for (i, cell) in cells.iter_mut().enumerate() {
            cell.alias = i;
        }

        // Scale each weight so the average lands on 1.
        let mut scaled: Vec<f64> = weights.iter().map(|w| (*w as f64) * n as f64 / total).collect();

        let mut small: Vec<usize> = Vec::with_capacity(n);
        let mut large: Vec<usize> = Vec::with_capacity(n);
        for (i, p) in scaled.iter().enumerate() {
            if *p < 1.0 {
                small.push(i);
            } else {
                large.push(i);
            }
        }

        while let (Some(s), Some(l)) = (small.pop(), large.pop()) {
            cells[s].threshold = scaled[s];
            cells[s].alias = l;
            // Subtract the donated mass before re-bucketing; the
            // subtraction order keeps the residual non-negative for
            // integer inputs.
            scaled[l] = (scaled[l] + scaled[s]) - 1.0;
            if scaled[l] < 1.0 {
                small.push(l);
            } else {
                large.push(l);
            }
        }

        // Whatever remains in either bucket carries probability 1 of
        // itself; residual rounding error lands here.
        for i in large.into_iter().chain(small) {
            cells[i].threshold = 1.0;
            cells[i].alias = i;
        }

        Ok(Self { cells })
    }

    /// Draw one outcome index. Two uniform draws, constant time.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let i = rng.random_range(0..self.cells.len());
        let cell = self.cells[i];
        if rng.random::<f64>() < cell.threshold {
            i
        } else {
            cell.alias
        }
    }

    /// Number of outcomes the table was built over
    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
