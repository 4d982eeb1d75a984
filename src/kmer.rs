//! Per-sequence k-mer position index used to seed sparse DP envelopes.

use crate::seq::{Alphabet, FastSeq, INVALID_TOKEN};
use crate::{Error, Result};
use std::collections::HashMap;

pub const MIN_KMER_LEN: usize = 5;
pub const MAX_KMER_LEN: usize = 32;

pub type Kmer = u64;

/// Maps each k-mer code to the sorted start positions where it occurs with
/// all tokens valid. Windows containing wildcards or out-of-alphabet
/// characters are skipped.
#[derive(Debug, Clone)]
pub struct KmerIndex {
    pub kmer_len: usize,
    pub alphabet_size: usize,
    locations: HashMap<Kmer, Vec<usize>>,
}

/// True when every token in the window is a real alphabet token.
pub fn kmer_valid(window: &[u8]) -> bool {
    window.iter().all(|&t| t != INVALID_TOKEN)
}

/// Base-A code of a window of tokens, high-order first.
pub fn make_kmer(window: &[u8], alphabet_size: usize) -> Kmer {
    window
        .iter()
        .fold(0, |acc, &t| acc * alphabet_size as Kmer + t as Kmer)
}

impl KmerIndex {
    pub fn new(seq: &FastSeq, alphabet: &Alphabet, kmer_len: usize) -> Result<Self> {
        if !(MIN_KMER_LEN..=MAX_KMER_LEN).contains(&kmer_len) {
            return Err(Error::Config(format!(
                "k-mer length {} out of range ({}..={})",
                kmer_len, MIN_KMER_LEN, MAX_KMER_LEN
            )));
        }
        let toks = seq.unvalidated_tokens(alphabet);
        let mut locations: HashMap<Kmer, Vec<usize>> = HashMap::new();
        if toks.len() >= kmer_len {
            for i in 0..=toks.len() - kmer_len {
                let window = &toks[i..i + kmer_len];
                if kmer_valid(window) {
                    locations
                        .entry(make_kmer(window, alphabet.size()))
                        .or_default()
                        .push(i);
                }
            }
        }
        Ok(Self {
            kmer_len,
            alphabet_size: alphabet.size(),
            locations,
        })
    }

    pub fn positions(&self, kmer: Kmer) -> Option<&[usize]> {
        self.locations.get(&kmer).map(|v| v.as_slice())
    }

    pub fn distinct_kmers(&self) -> usize {
        self.locations.len()
    }
}
