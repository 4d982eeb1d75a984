//! Alignment paths: per-row bit sequences over alignment columns.
//!
//! A path maps a row index (a tree node) to a bit vector with one bit per
//! alignment column, true for a residue and false for a gap. Rows absent
//! from a path are implicitly all-gap.

use crate::seq::{is_gap_char, FastSeq, GAP_CHAR, WILDCARD_CHAR};
use crate::{Error, Result};
use std::collections::BTreeMap;

pub type RowIndex = usize;
pub type RowPath = Vec<bool>;
pub type AlignPath = BTreeMap<RowIndex, RowPath>;

/// Number of residue (true) columns in one row.
pub fn residues_in_row(bits: &[bool]) -> usize {
    bits.iter().filter(|&&b| b).count()
}

/// Column count of a path. All present rows must agree.
pub fn columns(path: &AlignPath) -> Result<usize> {
    let mut cols = None;
    for bits in path.values() {
        match cols {
            None => cols = Some(bits.len()),
            Some(c) if c == bits.len() => {}
            Some(c) => {
                return Err(Error::Input(format!(
                    "ragged alignment path: {} vs {} columns",
                    c,
                    bits.len()
                )))
            }
        }
    }
    Ok(cols.unwrap_or(0))
}

/// Union of two paths with disjoint row sets, each row padded with trailing
/// gaps to the larger column count. Fails if any row appears in both.
pub fn union(a: &AlignPath, b: &AlignPath) -> Result<AlignPath> {
    let cols = columns(a)?.max(columns(b)?);
    let mut out = AlignPath::new();
    for (path, other) in &[(a, b), (b, a)] {
        for (&row, bits) in path.iter() {
            if other.contains_key(&row) {
                return Err(Error::Input(format!(
                    "alignment path union: row {} present on both sides",
                    row
                )));
            }
            let mut bits = bits.clone();
            bits.resize(cols, false);
            out.insert(row, bits);
        }
    }
    Ok(out)
}

/// Lengthwise concatenation. Rows absent from an argument contribute that
/// argument's column count of gaps.
pub fn concat(paths: &[&AlignPath]) -> Result<AlignPath> {
    let widths: Vec<usize> = paths
        .iter()
        .map(|p| columns(p))
        .collect::<Result<Vec<_>>>()?;
    let mut out = AlignPath::new();
    for p in paths {
        for &row in p.keys() {
            out.entry(row).or_insert_with(Vec::new);
        }
    }
    for (p, &w) in paths.iter().zip(widths.iter()) {
        for (row, bits) in out.iter_mut() {
            match p.get(row) {
                Some(src) => bits.extend_from_slice(src),
                None => bits.extend(std::iter::repeat(false).take(w)),
            }
        }
    }
    Ok(out)
}

/// Column-synchronised merge. Rows shared between arguments must pass through
/// their residues in the same order; columns holding the same residue event
/// are fused, the rest are interleaved in argument order.
pub fn merge(paths: &[AlignPath]) -> Result<AlignPath> {
    let ncols: Vec<usize> = paths
        .iter()
        .map(|p| columns(p))
        .collect::<Result<Vec<_>>>()?;
    let mut row_owners: BTreeMap<RowIndex, Vec<usize>> = BTreeMap::new();
    for (pi, p) in paths.iter().enumerate() {
        for &row in p.keys() {
            row_owners.entry(row).or_default().push(pi);
        }
    }
    let mut out: AlignPath = row_owners.keys().map(|&r| (r, Vec::new())).collect();
    let mut cursor = vec![0usize; paths.len()];
    loop {
        if cursor
            .iter()
            .zip(ncols.iter())
            .all(|(&c, &n)| c >= n)
        {
            break;
        }
        let fuse = match next_fuse_set(paths, &ncols, &row_owners, &cursor) {
            Some(f) => f,
            None => {
                return Err(Error::Input(
                    "alignment paths are not column-synchronisable".to_string(),
                ))
            }
        };
        for (row, bits) in out.iter_mut() {
            let residue = fuse
                .iter()
                .any(|&p| paths[p].get(row).map_or(false, |b| b[cursor[p]]));
            bits.push(residue);
        }
        for &p in &fuse {
            cursor[p] += 1;
        }
    }
    Ok(out)
}

/// Find the first path whose pending column can be emitted, together with the
/// transitive set of paths whose current columns share a residue with it.
fn next_fuse_set(
    paths: &[AlignPath],
    ncols: &[usize],
    row_owners: &BTreeMap<RowIndex, Vec<usize>>,
    cursor: &[usize],
) -> Option<Vec<usize>> {
    'candidate: for start in 0..paths.len() {
        if cursor[start] >= ncols[start] {
            continue;
        }
        let mut in_fuse = vec![false; paths.len()];
        in_fuse[start] = true;
        let mut stack = vec![start];
        let mut fuse = vec![start];
        while let Some(q) = stack.pop() {
            for (row, bits) in paths[q].iter() {
                if !bits[cursor[q]] {
                    continue;
                }
                for &other in &row_owners[row] {
                    if in_fuse[other] {
                        continue;
                    }
                    // The shared residue must be the other path's next column
                    // too, otherwise emitting now would reorder its residues.
                    if cursor[other] >= ncols[other]
                        || !paths[other].get(row).map_or(false, |b| b[cursor[other]])
                    {
                        continue 'candidate;
                    }
                    in_fuse[other] = true;
                    fuse.push(other);
                    stack.push(other);
                }
            }
        }
        fuse.sort_unstable();
        return Some(fuse);
    }
    None
}

/// A multiple alignment: a path plus the ungapped residues of the rows that
/// have concrete sequences. Rows without residues materialise as wildcards.
#[derive(Debug, Clone)]
pub struct Alignment {
    pub path: AlignPath,
    pub rows: BTreeMap<RowIndex, FastSeq>,
}

impl Alignment {
    pub fn new(path: AlignPath, rows: BTreeMap<RowIndex, FastSeq>) -> Self {
        Self { path, rows }
    }

    /// Parse gapped sequences into a path (rows keyed by input order) plus
    /// their ungapped residues.
    pub fn from_gapped(gapped: &[FastSeq]) -> Result<Self> {
        let mut path = AlignPath::new();
        let mut rows = BTreeMap::new();
        for (i, fs) in gapped.iter().enumerate() {
            let bits: Vec<bool> = fs.seq.chars().map(|c| !is_gap_char(c)).collect();
            let ungapped: String = fs.seq.chars().filter(|&c| !is_gap_char(c)).collect();
            path.insert(i, bits);
            rows.insert(i, FastSeq::new(fs.name.clone(), ungapped));
        }
        columns(&path)?;
        Ok(Self { path, rows })
    }

    /// Materialise the gapped rows, in row-index order.
    pub fn gapped(&self) -> Vec<FastSeq> {
        let mut out = Vec::with_capacity(self.path.len());
        for (&row, bits) in self.path.iter() {
            let (name, residues): (String, Vec<char>) = match self.rows.get(&row) {
                Some(fs) => (fs.name.clone(), fs.seq.chars().collect()),
                None => (
                    format!("node{}", row),
                    vec![WILDCARD_CHAR; residues_in_row(bits)],
                ),
            };
            let mut pos = 0;
            let gapped: String = bits
                .iter()
                .map(|&b| {
                    if b {
                        pos += 1;
                        residues[pos - 1]
                    } else {
                        GAP_CHAR
                    }
                })
                .collect();
            out.push(FastSeq::new(name, gapped));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(rows: &[(usize, &str)]) -> AlignPath {
        rows.iter()
            .map(|&(r, s)| (r, s.chars().map(|c| c == '*').collect()))
            .collect()
    }

    #[test]
    fn concat_counts_add() {
        let a = path(&[(0, "**-"), (1, "*-*")]);
        let b = path(&[(1, "**"), (2, "-*")]);
        let c = concat(&[&a, &b]).unwrap();
        assert_eq!(columns(&c).unwrap(), 5);
        assert_eq!(
            residues_in_row(&c[&1]),
            residues_in_row(&a[&1]) + residues_in_row(&b[&1])
        );
        // row 0 absent from b: padded with gaps
        assert_eq!(c[&0], path(&[(0, "**---")])[&0]);
        assert_eq!(c[&2], path(&[(2, "----*")])[&2]);
    }

    #[test]
    fn union_disjoint_pads() {
        let a = path(&[(0, "**")]);
        let b = path(&[(1, "*")]);
        let u = union(&a, &b).unwrap();
        assert_eq!(columns(&u).unwrap(), 2);
        assert_eq!(u[&1], vec![true, false]);
        assert!(union(&a, &a).is_err());
    }

    #[test]
    fn merge_fuses_shared_residues() {
        // rows 0/1 agree on row 1's two residues; row 0 vs row 2 hang off them
        let a = path(&[(0, "**-*"), (1, "-*-*")]);
        let b = path(&[(1, "**"), (2, "*-")]);
        let m = merge(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(residues_in_row(&m[&1]), 2);
        assert_eq!(residues_in_row(&m[&0]), 3);
        assert_eq!(residues_in_row(&m[&2]), 1);
        // shared-row residues must appear once, fused
        let m2 = merge(&[b, a]).unwrap();
        assert_eq!(residues_in_row(&m2[&1]), 2);
        assert_eq!(columns(&m).unwrap(), columns(&m2).unwrap());
    }

    #[test]
    fn merge_rejects_reordered_rows() {
        // both paths own rows 0 and 1 but pair their residues incompatibly
        let a = path(&[(0, "*-"), (1, "-*")]);
        let b = path(&[(0, "-*"), (1, "*-")]);
        assert!(merge(&[a, b]).is_err());
    }

    #[test]
    fn gapped_round_trip() {
        let rows = vec![FastSeq::new("x", "A-CG"), FastSeq::new("y", "AAC-")];
        let aln = Alignment::from_gapped(&rows).unwrap();
        let back = aln.gapped();
        assert_eq!(back, rows);
    }

    #[test]
    fn gapped_wildcards_for_missing_rows() {
        let mut p = AlignPath::new();
        p.insert(0, vec![true, false, true]);
        let aln = Alignment::new(p, BTreeMap::new());
        assert_eq!(aln.gapped()[0].seq, "*-*");
    }
}
