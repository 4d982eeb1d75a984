//! Guide alignments: the band they induce on profile-profile DP, a banded
//! pairwise aligner over a diagonal envelope, and progressive construction
//! of a guide when none is supplied.

use crate::alnpath::{self, AlignPath, RowIndex};
use crate::envelope::{DiagEnvParams, DiagonalEnvelope};
use crate::seq::{Alphabet, FastSeq};
use crate::tree::Tree;
use crate::{Error, Result};
use log::debug;
use std::collections::BTreeMap;

/// Band restriction derived from a guide alignment: a profile-pair cell is
/// admissible when the guide columns of the two pivot-row coordinates are
/// within `max_dist` of each other.
#[derive(Debug, Clone)]
pub struct GuideEnvelope {
    pub row_x: RowIndex,
    pub row_y: RowIndex,
    pub max_dist: i32,
    col_of_x: Vec<usize>,
    col_of_y: Vec<usize>,
}

impl GuideEnvelope {
    pub fn new(guide: &AlignPath, row_x: RowIndex, row_y: RowIndex, max_dist: i32) -> Result<Self> {
        Ok(Self {
            row_x,
            row_y,
            max_dist,
            col_of_x: residue_columns(guide, row_x)?,
            col_of_y: residue_columns(guide, row_y)?,
        })
    }

    /// `xc`/`yc` are residue counts of the pivot rows (0..=row length).
    pub fn admits(&self, xc: usize, yc: usize) -> bool {
        let cx = match self.col_of_x.get(xc) {
            Some(&c) => c as i64,
            None => return true,
        };
        let cy = match self.col_of_y.get(yc) {
            Some(&c) => c as i64,
            None => return true,
        };
        (cx - cy).abs() <= self.max_dist as i64
    }
}

/// `out[k]` = 1-based guide column of row's `k`-th residue; `out[0] = 0`.
fn residue_columns(guide: &AlignPath, row: RowIndex) -> Result<Vec<usize>> {
    let bits = guide
        .get(&row)
        .ok_or_else(|| Error::Input(format!("guide alignment lacks row {}", row)))?;
    let mut cols = Vec::with_capacity(alnpath::residues_in_row(bits) + 1);
    cols.push(0);
    for (c, &b) in bits.iter().enumerate() {
        if b {
            cols.push(c + 1);
        }
    }
    Ok(cols)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Mat,
    Del,
    Ins,
}

const MATCH_SCORE: i32 = 1;
const MISMATCH_SCORE: i32 = -1;
const GAP_SCORE: i32 = -2;
const SCORE_FLOOR: i32 = i32::MIN / 2;

/// Global banded alignment of two sequences over a diagonal envelope,
/// returning a two-row alignment path keyed by `row_x`/`row_y`. Falls back
/// to a full envelope when the banded grid cannot reach the final corner.
pub fn quick_align(
    x: &FastSeq,
    y: &FastSeq,
    alphabet: &Alphabet,
    env: &DiagonalEnvelope,
    row_x: RowIndex,
    row_y: RowIndex,
) -> Result<AlignPath> {
    let xt = x.unvalidated_tokens(alphabet);
    let yt = y.unvalidated_tokens(alphabet);
    let (x_len, y_len) = (xt.len(), yt.len());
    let mut score = vec![SCORE_FLOOR; env.total_storage_size];
    let at = |score: &[i32], i: usize, j: usize| -> i32 {
        env.cell(i, j).map_or(SCORE_FLOOR, |c| score[c])
    };
    for j in 0..=y_len {
        for d in env.storage_diagonals.iter().filter(|&&d| env.intersects(j, d)) {
            let i = (j as i32 + d) as usize;
            let cell = env.cell(i, j).expect("storage diagonal intersects j");
            if i == 0 && j == 0 {
                score[cell] = 0;
                continue;
            }
            let mut best = SCORE_FLOOR;
            if i > 0 && j > 0 {
                let m = if xt[i - 1] == yt[j - 1] && xt[i - 1] != crate::seq::INVALID_TOKEN {
                    MATCH_SCORE
                } else {
                    MISMATCH_SCORE
                };
                best = best.max(at(&score, i - 1, j - 1).saturating_add(m));
            }
            if i > 0 {
                best = best.max(at(&score, i - 1, j).saturating_add(GAP_SCORE));
            }
            if j > 0 {
                best = best.max(at(&score, i, j - 1).saturating_add(GAP_SCORE));
            }
            score[cell] = best;
        }
    }
    if env.cell(x_len, y_len).map_or(true, |c| score[c] <= SCORE_FLOOR / 2) {
        if env.is_full() {
            return Err(Error::Input(format!(
                "cannot align {} and {}",
                x.name, y.name
            )));
        }
        debug!(
            "banded alignment of {} and {} missed the corner; retrying full",
            x.name, y.name
        );
        let full = DiagonalEnvelope::full(x_len, y_len);
        return quick_align(x, y, alphabet, &full, row_x, row_y);
    }

    // Traceback, diagonal moves first.
    let mut ops = Vec::new();
    let (mut i, mut j) = (x_len, y_len);
    while i > 0 || j > 0 {
        let here = at(&score, i, j);
        let op = if i > 0 && j > 0 {
            let m = if xt[i - 1] == yt[j - 1] && xt[i - 1] != crate::seq::INVALID_TOKEN {
                MATCH_SCORE
            } else {
                MISMATCH_SCORE
            };
            if at(&score, i - 1, j - 1).saturating_add(m) == here {
                Op::Mat
            } else if at(&score, i - 1, j).saturating_add(GAP_SCORE) == here {
                Op::Del
            } else {
                Op::Ins
            }
        } else if i > 0 {
            Op::Del
        } else {
            Op::Ins
        };
        ops.push(op);
        match op {
            Op::Mat => {
                i -= 1;
                j -= 1;
            }
            Op::Del => i -= 1,
            Op::Ins => j -= 1,
        }
    }
    ops.reverse();

    let mut path = AlignPath::new();
    path.insert(row_x, ops.iter().map(|&o| o != Op::Ins).collect());
    path.insert(row_y, ops.iter().map(|&o| o != Op::Del).collect());
    Ok(path)
}

/// Build a guide alignment progressively: at each internal node, align the
/// closest-leaf representatives of the two subtrees over a k-mer-seeded
/// envelope and merge the resulting pair path with the children's guides.
pub fn build_guide(
    tree: &Tree,
    seqs: &BTreeMap<RowIndex, FastSeq>,
    closest_leaf: &[RowIndex],
    alphabet: &Alphabet,
    params: &DiagEnvParams,
) -> Result<AlignPath> {
    let mut paths: BTreeMap<RowIndex, AlignPath> = BTreeMap::new();
    for node in tree.postorder() {
        if tree.is_leaf(node) {
            let seq = seqs
                .get(&node)
                .ok_or_else(|| Error::Input(format!("no sequence for leaf node {}", node)))?;
            let mut p = AlignPath::new();
            p.insert(node, vec![true; seq.len()]);
            paths.insert(node, p);
        } else {
            let ch = tree.children(node);
            let (l, r) = (ch[0], ch[1]);
            let (rep_l, rep_r) = (closest_leaf[l], closest_leaf[r]);
            let (sx, sy) = (&seqs[&rep_l], &seqs[&rep_r]);
            let env = DiagonalEnvelope::new(sx, sy, alphabet, params, std::mem::size_of::<i32>())?;
            let pair = quick_align(sx, sy, alphabet, &env, rep_l, rep_r)?;
            let merged = alnpath::merge(&[
                paths.remove(&l).expect("child guide"),
                paths.remove(&r).expect("child guide"),
                pair,
            ])?;
            paths.insert(node, merged);
        }
    }
    Ok(paths.remove(&tree.root()).expect("root guide"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::DiagonalEnvelope;

    fn dna(name: &str, s: &str) -> FastSeq {
        FastSeq::new(name, s)
    }

    #[test]
    fn quick_align_identical() {
        let alph = Alphabet::dna();
        let x = dna("x", "ACGTACGT");
        let y = dna("y", "ACGTACGT");
        let env = DiagonalEnvelope::full(x.len(), y.len());
        let path = quick_align(&x, &y, &alph, &env, 0, 1).unwrap();
        assert_eq!(alnpath::columns(&path).unwrap(), 8);
        assert!(path[&0].iter().all(|&b| b));
        assert!(path[&1].iter().all(|&b| b));
    }

    #[test]
    fn quick_align_with_gap() {
        let alph = Alphabet::dna();
        let x = dna("x", "ACGTACGT");
        let y = dna("y", "ACGTCGT");
        let env = DiagonalEnvelope::full(x.len(), y.len());
        let path = quick_align(&x, &y, &alph, &env, 0, 1).unwrap();
        assert_eq!(alnpath::columns(&path).unwrap(), 8);
        assert_eq!(alnpath::residues_in_row(&path[&1]), 7);
    }

    #[test]
    fn guide_envelope_admits_near_diagonal() {
        let mut guide = AlignPath::new();
        guide.insert(0, vec![true, true, false, true]);
        guide.insert(1, vec![true, false, true, true]);
        let env = GuideEnvelope::new(&guide, 0, 1, 1).unwrap();
        assert!(env.admits(0, 0));
        assert!(env.admits(1, 1)); // cols 1 vs 1
        assert!(env.admits(2, 1)); // cols 2 vs 1
        assert!(!env.admits(3, 0)); // cols 4 vs 0
    }

    #[test]
    fn guide_envelope_missing_row_is_an_error() {
        let guide = AlignPath::new();
        assert!(GuideEnvelope::new(&guide, 0, 1, 1).is_err());
    }
}
