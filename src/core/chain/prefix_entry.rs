// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-prefix suffix accumulator with lazily built alias tables.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::chain::alias_table::AliasTable;
use crate::core::error::{MarkovError, MarkovResult};

/// Suffix count past which a token -> index map is maintained next to
/// the flat list. Below it, a linear scan over a short vector beats the
/// hash map on both time and space.
const INDEX_THRESHOLD: usize = 32;

/// One observed suffix and how many times it was seen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuffixEntry {
    pub word: String,
    pub weight: u64,
}

/// Accumulates the suffixes observed after one fixed prefix.
///
/// # Responsibilities
/// - Merge repeated observations of the same suffix into one weighted entry
/// - Serve weighted samples through a lazily rebuilt [`AliasTable`]
/// - Enumerate suffixes in insertion order for persistence
///
/// # Invariants
/// - The suffix list contains no duplicate tokens
/// - `total_weight` equals the sum of all suffix weights at all times
/// - The alias table, when present, was built from the current suffix
///   list; any mutation invalidates it
#[derive(Debug, Clone)]
pub struct PrefixEntry {
    prefix: String,
    suffixes: Vec<SuffixEntry>,
    /// Token -> suffix index, maintained once the list outgrows
    /// `INDEX_THRESHOLD`. Iteration always uses the vector, so snapshot
    /// order stays deterministic.
    index: Option<HashMap<String, usize>>,
    total_weight: u64,
    alias: Option<AliasTable>,
}

impl PrefixEntry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffixes: Vec::new(),
            index: None,
            total_weight: 0,
            alias: None,
        }
    }

    /// Rebuild an entry from persisted suffixes, merging any duplicate
    /// tokens a hand-edited snapshot might carry.
    pub fn from_suffixes(
        prefix: impl Into<String>,
        suffixes: Vec<SuffixEntry>,
    ) -> MarkovResult<Self> {
        let mut entry = Self::new(prefix);
        for suffix in suffixes {
            entry.insert(&suffix.word, suffix.weight)?;
        }
        Ok(entry)
    }

    #[inline]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[inline]
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Number of distinct suffix tokens
    #[inline]
    pub fn len(&self) -> usize {
        self.suffixes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
    }

    /// Record `weight` observations of `word` following this prefix.
    ///
    /// Merges into the existing entry when the token was seen before,
    /// appends otherwise. Either way the alias table is invalidated and
    /// `total_weight` grows by `weight`.
    ///
    /// # Errors
    /// [`MarkovError::InvalidInput`] for an empty token or a zero weight.
    pub fn insert(&mut self, word: &str, weight: u64) -> MarkovResult<()> {
        if word.is_empty() {
            return Err(MarkovError::invalid_input_for(
                "suffix token must not be empty",
                "suffix",
            ));
        }
        if weight == 0 {
            return Err(MarkovError::invalid_input_for(
                "suffix weight must be >= 1",
                "weight",
            ));
        }

        match self.position(word) {
            Some(pos) => self.suffixes[pos].weight += weight,
            None => {
                self.suffixes.push(SuffixEntry {
                    word: word.to_string(),
                    weight,
                });
                let pos = self.suffixes.len() - 1;
                if let Some(index) = self.index.as_mut() {
                    index.insert(word.to_string(), pos);
                } else if self.suffixes.len() > INDEX_THRESHOLD {
                    self.index = Some(
                        self.suffixes
                            .iter()
                            .enumerate()
                            .map(|(i, s)| (s.word.clone(), i))
                            .collect(),
                    );
                }
            }
        }

        self.total_weight += weight;
        self.alias = None;
        Ok(())
    }

    fn position(&self, word: &str) -> Option<usize> {
        match &self.index {
            Some(index) => index.get(word).copied(),
            None => self.suffixes.iter().position(|s| s.word == word),
        }
    }

    /// Whether `sample` would need an alias rebuild first.
    #[inline]
    pub fn needs_alias_build(&self) -> bool {
        self.suffixes.len() > 1 && self.alias.is_none()
    }

    /// Build the alias table from the current suffix list.
    ///
    /// A no-op for entries with fewer than two suffixes; those sample
    /// deterministically without a table.
    pub fn build_alias(&mut self) -> MarkovResult<()> {
        if self.suffixes.len() > 1 {
            let weights: Vec<u64> = self.suffixes.iter().map(|s| s.weight).collect();
            self.alias = Some(AliasTable::build(&weights)?);
        }
        Ok(())
    }

    /// Draw one suffix token proportionally to its weight.
    ///
    /// Entries with zero suffixes return `None`; a single suffix is
    /// returned directly. Multi-suffix entries sample through the alias
    /// table when it is current and fall back to a linear cumulative
    /// draw when it is not, so sampling never blocks on a rebuild.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&str> {
        match self.suffixes.len() {
            0 => None,
            1 => Some(&self.suffixes[0].word),
            _ => {
                if let Some(alias) = &self.alias {
                    return Some(&self.suffixes[alias.sample(rng)].word);
                }
                self.sample_linear(rng)
            }
        }
    }

    /// O(k) cumulative draw over the raw weights.
    fn sample_linear<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&str> {
        if self.total_weight == 0 {
            return None;
        }
        let mut r = rng.random_range(0..self.total_weight);
        for suffix in &self.suffixes {
            if r < suffix.weight {
                return Some(&suffix.word);
            }
            r -= suffix.weight;
        }
        self.suffixes.last().map(|s| s.word.as_str())
    }

    /// Suffixes in insertion order, for persistence and export.
    pub fn enumerate(&self) -> impl Iterator<Item = &SuffixEntry> {
        self.suffixes.iter()
    }

    /// Rough resident size of this entry in bytes.
    pub fn approx_memory_bytes(&self) -> u64 {
        let base = std::mem::size_of::<Self>() as u64 + self.prefix.len() as u64;
        let suffixes: u64 = self
            .suffixes
            .iter()
            .map(|s| (std::mem::size_of::<SuffixEntry>() + s.word.len()) as u64)
            .sum();
        let index = match &self.index {
            Some(index) => index
                .keys()
                .map(|k| (k.len() + std::mem::size_of::<usize>() * 2) as u64)
                .sum(),
            None => 0,
        };
        let alias = if self.alias.is_some() {
            (self.suffixes.len() * std::mem::size_of::<(f64, usize)>()) as u64
        } else {
            0
        };
        base + suffixes + index + alias
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_merges_duplicate_tokens() {
        let mut entry = PrefixEntry::new("a b");
        entry.insert("c", 1).unwrap();
        entry.insert("c", 4).unwrap();
        assert_eq!(entry.len(), 1);
        assert_eq!(entry.total_weight(), 5);
        assert_eq!(entry.enumerate().next().unwrap().weight, 5);
    }

    #[test]
    fn test_total_weight_tracks_sum() {
        let mut entry = PrefixEntry::new("a b");
        entry.insert("c", 2).unwrap();
        entry.insert("d", 3).unwrap();
        entry.insert("c", 1).unwrap();
        let sum: u64 = entry.enumerate().map(|s| s.weight).sum();
        assert_eq!(entry.total_weight(), sum);
        assert_eq!(entry.total_weight(), 6);
    }

    #[test]
    fn test_zero_weight_rejected() {
        let mut entry = PrefixEntry::new("a b");
        assert!(entry.insert("c", 0).is_err());
        assert_eq!(entry.total_weight(), 0);
    }

    #[test]
    fn test_empty_token_rejected() {
        let mut entry = PrefixEntry::new("a b");
        assert!(entry.insert("", 1).is_err());
    }

    #[test]
    fn test_single_suffix_samples_without_alias() {
        let mut entry = PrefixEntry::new("a b");
        entry.insert("c", 3).unwrap();
        let mut rng = rand::rng();
        assert_eq!(entry.sample(&mut rng), Some("c"));
        assert!(!entry.needs_alias_build());
    }

    #[test]
    fn test_mutation_invalidates_alias() {
        let mut entry = PrefixEntry::new("a b");
        entry.insert("c", 1).unwrap();
        entry.insert("d", 1).unwrap();
        assert!(entry.needs_alias_build());
        entry.build_alias().unwrap();
        assert!(!entry.needs_alias_build());
        entry.insert("e", 1).unwrap();
        assert!(entry.needs_alias_build());
    }

    #[test]
    fn test_enumeration_keeps_insertion_order() {
        let mut entry = PrefixEntry::new("a b");
        for word in ["z", "m", "a", "q"] {
            entry.insert(word, 1).unwrap();
        }
        let order: Vec<&str> = entry.enumerate().map(|s| s.word.as_str()).collect();
        assert_eq!(order, vec!["z", "m", "a", "q"]);
    }

    #[test]
    fn test_index_promotion_preserves_merging_and_order() {
        let mut entry = PrefixEntry::new("a b");
        let words: Vec<String> = (0..40).map(|i| format!("w{i}")).collect();
        for word in &words {
            entry.insert(word, 1).unwrap();
        }
        // merge through the indexed path
        entry.insert("w0", 9).unwrap();
        assert_eq!(entry.len(), 40);
        assert_eq!(entry.total_weight(), 49);
        let order: Vec<&str> = entry.enumerate().map(|s| s.word.as_str()).collect();
        let expected: Vec<&str> = words.iter().map(String::as_str).collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn test_sampled_frequency_tracks_weights() {
        let mut entry = PrefixEntry::new("a b");
        entry.insert("c", 1).unwrap();
        entry.insert("d", 3).unwrap();
        entry.build_alias().unwrap();

        let mut rng = rand::rng();
        let draws = 10_000;
        let mut d_hits = 0usize;
        for _ in 0..draws {
            if entry.sample(&mut rng) == Some("d") {
                d_hits += 1;
            }
        }
        let freq = d_hits as f64 / draws as f64;
        assert!(
            (0.72..=0.78).contains(&freq),
            "expected ~0.75, observed {freq}"
        );
    }

    #[test]
    fn test_linear_fallback_matches_distribution() {
        let mut entry = PrefixEntry::new("a b");
        entry.insert("c", 1).unwrap();
        entry.insert("d", 3).unwrap();
        // no alias build: exercises the cumulative fallback

        let mut rng = rand::rng();
        let draws = 10_000;
        let mut d_hits = 0usize;
        for _ in 0..draws {
            if entry.sample(&mut rng) == Some("d") {
                d_hits += 1;
            }
        }
        let freq = d_hits as f64 / draws as f64;
        assert!((0.70..=0.80).contains(&freq), "observed {freq}");
    }
}
