//! Diagonal envelopes: the sparse subset of DP anti-diagonals that a banded
//! pairwise DP will actually touch, plus its derived storage layout.
//!
//! Diagonal `d` of a grid over `x` (length X) and `y` (length Y) is the cell
//! set `{(i, j) : i - j == d}` with `d` in `[-Y, X]`. The storage set keeps
//! `d - 1` and `d + 1` for every active `d` because the DP recurrences look
//! one cell back on neighbouring diagonals.

use crate::kmer::{kmer_valid, make_kmer, KmerIndex};
use crate::seq::{Alphabet, FastSeq};
use crate::Result;
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};

/// Require at least this ratio of length/(k + threshold) before a sparse
/// envelope is attempted.
const MIN_KMERS_FOR_SPARSE_ENVELOPE: usize = 2;

pub const DEFAULT_KMER_LENGTH: usize = 6;
pub const DEFAULT_KMER_THRESHOLD: i32 = 3;
pub const DEFAULT_BAND_SIZE: usize = 64;
pub const DEFAULT_MAX_SIZE: usize = 1 << 30;

/// Envelope construction parameters, mirrored by the CLI flags.
#[derive(Debug, Clone)]
pub struct DiagEnvParams {
    pub sparse: bool,
    pub kmer_len: usize,
    /// Negative means: choose the threshold automatically from `max_size`.
    pub kmer_threshold: i32,
    pub max_size: usize,
    pub band_size: usize,
}

impl Default for DiagEnvParams {
    fn default() -> Self {
        Self {
            sparse: true,
            kmer_len: DEFAULT_KMER_LENGTH,
            kmer_threshold: DEFAULT_KMER_THRESHOLD,
            max_size: DEFAULT_MAX_SIZE,
            band_size: DEFAULT_BAND_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiagonalEnvelope {
    pub x_len: usize,
    pub y_len: usize,
    /// Active diagonals, ascending. Always contains 0.
    pub diagonals: Vec<i32>,
    /// Storage superset of `diagonals` (each active `d` plus `d ± 1`).
    pub storage_diagonals: Vec<i32>,
    /// Position of diagonal `d` in `storage_diagonals`, indexed by `y_len + d`.
    storage_index: Vec<i32>,
    /// Index into `storage_diagonals` of the first diagonal intersecting `j`.
    storage_offset: Vec<i32>,
    pub storage_size: Vec<usize>,
    pub cumul_storage_size: Vec<usize>,
    pub total_storage_size: usize,
}

impl DiagonalEnvelope {
    /// Full envelope: every diagonal active.
    pub fn full(x_len: usize, y_len: usize) -> Self {
        let diagonals: Vec<i32> = (-(y_len as i32)..=x_len as i32).collect();
        Self::from_diagonals(x_len, y_len, diagonals)
    }

    /// Full-or-sparse dispatch per the envelope parameters. `cell_size` is
    /// the number of bytes one DP cell occupies.
    pub fn new(
        x: &FastSeq,
        y: &FastSeq,
        alphabet: &Alphabet,
        params: &DiagEnvParams,
        cell_size: usize,
    ) -> Result<Self> {
        if !params.sparse {
            return Ok(Self::full(x.len(), y.len()));
        }
        let index = KmerIndex::new(y, alphabet, params.kmer_len)?;
        Ok(Self::sparse(
            x,
            y.len(),
            &index,
            alphabet,
            params.band_size,
            params.kmer_threshold,
            cell_size,
            params.max_size,
        ))
    }

    /// Sparse envelope seeded by k-mer matches of `x` against the index of `y`.
    pub fn sparse(
        x: &FastSeq,
        y_len: usize,
        y_index: &KmerIndex,
        alphabet: &Alphabet,
        band_size: usize,
        kmer_threshold: i32,
        cell_size: usize,
        max_size: usize,
    ) -> Self {
        let kmer_len = y_index.kmer_len;
        let x_len = x.len();
        if kmer_threshold >= 0 {
            let min_len = MIN_KMERS_FOR_SPARSE_ENVELOPE * (kmer_len + kmer_threshold as usize);
            if x_len < min_len || y_len < min_len {
                return Self::full(x_len, y_len);
            }
        } else if x_len * y_len * cell_size < max_size {
            debug!(
                "full DP for {} needs {} bytes, inside budget",
                x.name,
                x_len * y_len * cell_size
            );
            return Self::full(x_len, y_len);
        }

        let x_tok = x.unvalidated_tokens(alphabet);
        let mut diag_kmer_count: BTreeMap<i32, u32> = BTreeMap::new();
        if x_len >= kmer_len {
            for i in 0..=x_len - kmer_len {
                let window = &x_tok[i..i + kmer_len];
                if !kmer_valid(window) {
                    continue;
                }
                if let Some(positions) = y_index.positions(make_kmer(window, alphabet.size())) {
                    for &j in positions {
                        *diag_kmer_count.entry(i as i32 - j as i32).or_insert(0) += 1;
                    }
                }
            }
        }
        let mut count_distrib: BTreeMap<u32, BTreeSet<i32>> = BTreeMap::new();
        for (&d, &n) in diag_kmer_count.iter() {
            count_distrib.entry(n).or_default().insert(d);
        }

        let min_diag = -(y_len as i32);
        let max_diag = x_len as i32;
        let mut diags: BTreeSet<i32> = BTreeSet::new();
        let mut storage_diags: BTreeSet<i32> = BTreeSet::new();
        // The zeroth diagonal guarantees at least one complete path.
        diags.insert(0);
        storage_diags.insert(0);

        let half_band = (band_size / 2) as i32;
        let diag_size = x_len.min(y_len) * cell_size;
        let mut threshold = u32::MAX;
        let mut found_threshold = kmer_threshold >= 0;

        for (&count, seed_diags) in count_distrib.iter().rev() {
            if kmer_threshold >= 0 && count < kmer_threshold as u32 {
                break;
            }
            let mut more_diags = diags.clone();
            let mut more_storage = storage_diags.clone();
            for &seed in seed_diags {
                let d_min = min_diag.max(seed - half_band);
                let d_max = max_diag.min(seed + half_band);
                for d in d_min..=d_max {
                    more_diags.insert(d);
                }
                for d in d_min - 1..=d_max + 1 {
                    more_storage.insert(d);
                }
            }
            if kmer_threshold < 0 {
                if more_storage.len() * diag_size >= max_size {
                    break;
                }
                threshold = count;
                found_threshold = true;
            }
            diags = more_diags;
            storage_diags = more_storage;
        }

        if kmer_threshold >= 0 {
            debug!(
                "sparse envelope for {}: threshold {} matches, {} diagonals",
                x.name,
                kmer_threshold,
                diags.len()
            );
        } else if found_threshold {
            debug!(
                "sparse envelope for {}: auto threshold {} matches under {} bytes, {} diagonals",
                x.name,
                threshold,
                max_size,
                diags.len()
            );
        } else {
            warn!(
                "no k-mer threshold fits the {}-byte budget for {}; falling back to the main diagonal",
                max_size, x.name
            );
        }

        Self::from_diagonals(x_len, y_len, diags.into_iter().collect())
    }

    fn from_diagonals(x_len: usize, y_len: usize, diagonals: Vec<i32>) -> Self {
        let mut env = Self {
            x_len,
            y_len,
            diagonals,
            storage_diagonals: Vec::new(),
            storage_index: Vec::new(),
            storage_offset: Vec::new(),
            storage_size: Vec::new(),
            cumul_storage_size: Vec::new(),
            total_storage_size: 0,
        };
        env.init_storage();
        env
    }

    fn init_storage(&mut self) {
        let min_diag = -(self.y_len as i32);
        let max_diag = self.x_len as i32;
        let mut storage: BTreeSet<i32> = BTreeSet::new();
        for &d in &self.diagonals {
            for dd in d - 1..=d + 1 {
                if (min_diag..=max_diag).contains(&dd) {
                    storage.insert(dd);
                }
            }
        }
        self.storage_diagonals = storage.into_iter().collect();
        self.storage_index = vec![-1; self.x_len + self.y_len + 1];
        for (n, &d) in self.storage_diagonals.iter().enumerate() {
            self.storage_index[(self.y_len as i32 + d) as usize] = n as i32;
        }
        self.storage_offset = vec![-1; self.y_len + 1];
        self.storage_size = vec![0; self.y_len + 1];
        self.cumul_storage_size = vec![0; self.y_len + 1];
        self.total_storage_size = 0;
        for j in 0..=self.y_len {
            let (b, e) = self.storage_intersecting(j);
            self.storage_size[j] = e - b;
            self.cumul_storage_size[j] = self.total_storage_size;
            self.total_storage_size += e - b;
            if b != e {
                self.storage_offset[j] = b as i32;
            }
        }
    }

    /// Half-open range of indices into `storage_diagonals` intersecting row `j`.
    fn storage_intersecting(&self, j: usize) -> (usize, usize) {
        let lo = -(j as i32);
        let hi = self.x_len as i32 - j as i32;
        let b = self.storage_diagonals.partition_point(|&d| d < lo);
        let e = self.storage_diagonals.partition_point(|&d| d <= hi);
        (b, e.max(b))
    }

    pub fn min_diagonal(&self) -> i32 {
        -(self.y_len as i32)
    }

    pub fn max_diagonal(&self) -> i32 {
        self.x_len as i32
    }

    /// Does diagonal `d` intersect row `j`?
    pub fn intersects(&self, j: usize, d: i32) -> bool {
        let i = j as i32 + d;
        i >= 0 && i <= self.x_len as i32
    }

    /// Linear storage offset of cell `(i, j)`, if it lies on a storage diagonal.
    pub fn cell(&self, i: usize, j: usize) -> Option<usize> {
        if i > self.x_len || j > self.y_len {
            return None;
        }
        let d = i as i32 - j as i32;
        let n = self.storage_index[(self.y_len as i32 + d) as usize];
        if n < 0 {
            return None;
        }
        let ofs = self.storage_offset[j];
        debug_assert!(ofs >= 0, "row {} has no storage diagonals", j);
        Some(self.cumul_storage_size[j] + (n - ofs) as usize)
    }

    /// `i` values of active diagonals intersecting row `j`, ascending.
    pub fn forward_i(&self, j: usize) -> Vec<usize> {
        self.diagonals
            .iter()
            .filter(|&&d| self.intersects(j, d))
            .map(|&d| (j as i32 + d) as usize)
            .collect()
    }

    /// Same as [`forward_i`](Self::forward_i), descending.
    pub fn reverse_i(&self, j: usize) -> Vec<usize> {
        let mut v = self.forward_i(j);
        v.reverse();
        v
    }

    pub fn is_full(&self) -> bool {
        self.diagonals.len() == self.x_len + self.y_len + 1
    }
}
