//! Profiles: directed acyclic state graphs encoding a distribution over
//! ancestral sequences and their alignment to descendants.
//!
//! States and transitions live in arena vectors and refer to each other by
//! index. Transitions are topologically ordered (`src < dest`), so a single
//! forward sweep visits every state after all of its predecessors.

use crate::alnpath::{self, AlignPath, RowIndex};
use crate::logsum::{log_accum_exp, log_inner_product, LOG_ZERO};
use crate::seq::{Alphabet, FastSeq, INVALID_TOKEN, GAP_CHAR, WILDCARD_CHAR};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type StateIndex = usize;
pub type TransIndex = usize;

const WAIT_STATE_SUFFIX: &str = ";";
const READY_STATE_SUFFIX: &str = ".";

/// An edge of the profile graph. `path` records alignment columns emitted on
/// the transition itself, e.g. deletion columns contributed by one side of a
/// pair-HMM move or columns of a collapsed null chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileTransition {
    pub src: StateIndex,
    pub dest: StateIndex,
    pub lp_trans: f64,
    pub path: AlignPath,
}

impl ProfileTransition {
    pub fn new(src: StateIndex, dest: StateIndex, lp_trans: f64) -> Self {
        Self {
            src,
            dest,
            lp_trans,
            path: AlignPath::new(),
        }
    }
}

/// A node of the profile graph. Absorbing states carry a `components x
/// alphabet` log-emission table; null states have an empty table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProfileState {
    pub name: String,
    pub meta: BTreeMap<String, String>,
    pub lp_absorb: Vec<Vec<f64>>,
    pub path: AlignPath,
    pub seq_coords: BTreeMap<RowIndex, usize>,
    pub in_trans: Vec<TransIndex>,
    pub null_out: Vec<TransIndex>,
    pub absorb_out: Vec<TransIndex>,
}

impl ProfileState {
    pub fn new_absorbing(components: usize, alph_size: usize) -> Self {
        Self {
            lp_absorb: vec![vec![LOG_ZERO; alph_size]; components],
            ..Self::default()
        }
    }

    pub fn is_null(&self) -> bool {
        self.lp_absorb.is_empty()
    }

    /// All outgoing transitions lead to absorbing states.
    pub fn is_ready(&self) -> bool {
        self.null_out.is_empty() && !self.absorb_out.is_empty()
    }

    /// All outgoing transitions lead to null states (possibly none at all).
    pub fn is_wait(&self) -> bool {
        self.absorb_out.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub name: String,
    pub meta: BTreeMap<String, String>,
    pub alph_size: usize,
    pub components: usize,
    pub states: Vec<ProfileState>,
    pub trans: Vec<ProfileTransition>,
    /// Concrete residues for rows that have them (leaves). Rows present in
    /// alignment paths but absent here materialise as wildcards.
    pub seqs: BTreeMap<RowIndex, String>,
}

impl Profile {
    /// Leaf profile: a linear chain START -> r1 -> ... -> rn -> END with one
    /// absorbing state per residue and unit-probability transitions.
    pub fn leaf(
        components: usize,
        alphabet: &Alphabet,
        seq: &FastSeq,
        row: RowIndex,
    ) -> Self {
        let n = seq.len();
        let toks = seq.unvalidated_tokens(alphabet);
        let mut states = Vec::with_capacity(n + 2);
        let mut start = ProfileState::default();
        start.name = "START".to_string();
        start.seq_coords.insert(row, 0);
        states.push(start);
        for (pos, (&tok, ch)) in toks.iter().zip(seq.seq.chars()).enumerate() {
            let mut st = ProfileState::new_absorbing(components, alphabet.size());
            st.name = format!("{}{}", ch, pos + 1);
            st.path.insert(row, vec![true]);
            st.seq_coords.insert(row, pos + 1);
            for lpa in st.lp_absorb.iter_mut() {
                if tok == INVALID_TOKEN {
                    // wildcard: absorbs any symbol
                    for v in lpa.iter_mut() {
                        *v = 0.0;
                    }
                } else {
                    lpa[tok as usize] = 0.0;
                }
            }
            states.push(st);
        }
        let mut end = ProfileState::default();
        end.name = "END".to_string();
        end.seq_coords.insert(row, n);
        states.push(end);

        let trans: Vec<ProfileTransition> = (0..=n)
            .map(|pos| ProfileTransition::new(pos, pos + 1, 0.0))
            .collect();
        let mut prof = Self {
            name: seq.name.clone(),
            meta: BTreeMap::new(),
            alph_size: alphabet.size(),
            components,
            states,
            trans,
            seqs: std::iter::once((row, seq.seq.clone())).collect(),
        };
        prof.reindex();
        prof.assert_seq_coords_consistent();
        prof.assert_all_states_wait_or_ready();
        prof
    }

    pub fn size(&self) -> usize {
        self.states.len()
    }

    pub fn start_index(&self) -> StateIndex {
        0
    }

    pub fn end_index(&self) -> StateIndex {
        self.states.len() - 1
    }

    /// Rebuild every state's `in_trans`/`null_out`/`absorb_out` from the
    /// transition arena, in transition-index order.
    pub fn reindex(&mut self) {
        for st in self.states.iter_mut() {
            st.in_trans.clear();
            st.null_out.clear();
            st.absorb_out.clear();
        }
        for ti in 0..self.trans.len() {
            let (src, dest) = (self.trans[ti].src, self.trans[ti].dest);
            if self.states[dest].is_null() {
                self.states[src].null_out.push(ti);
            } else {
                self.states[src].absorb_out.push(ti);
            }
            self.states[dest].in_trans.push(ti);
        }
    }

    /// Push the absorption tables through a branch substitution matrix
    /// (`log_sub[c][a][b] = log P(b at child | a at parent)`), giving the
    /// profile as seen from the parent end of the branch.
    pub fn left_multiply(&self, log_sub: &[Vec<Vec<f64>>]) -> Self {
        let mut prof = self.clone();
        for st in prof.states.iter_mut() {
            if st.is_null() {
                continue;
            }
            for (cpt, lpa) in st.lp_absorb.iter_mut().enumerate() {
                let mixed: Vec<f64> = (0..self.alph_size)
                    .map(|a| log_inner_product(&log_sub[cpt][a], lpa))
                    .collect();
                *lpa = mixed;
            }
        }
        prof
    }

    /// Linear scan of `dest`'s incoming transitions.
    pub fn get_trans(&self, src: StateIndex, dest: StateIndex) -> Option<&ProfileTransition> {
        self.states[dest]
            .in_trans
            .iter()
            .map(|&ti| &self.trans[ti])
            .find(|t| t.src == src)
    }

    /// Characters of the alignment column anchored at state `s`: rows whose
    /// path begins with a residue, using stored residues where available and
    /// the wildcard otherwise.
    pub fn align_column(&self, s: StateIndex) -> BTreeMap<RowIndex, char> {
        let mut col = BTreeMap::new();
        for (&row, bits) in self.states[s].path.iter() {
            if bits.first().copied() != Some(true) {
                continue;
            }
            let ch = match (self.seqs.get(&row), self.states[s].seq_coords.get(&row)) {
                (Some(seq), Some(&coord)) => seq.as_bytes()[coord - 1] as char,
                _ => WILDCARD_CHAR,
            };
            col.insert(row, ch);
        }
        col
    }

    /// Forward sum over the whole profile of transition weights times
    /// absorption weights under the given component mixture and insertion
    /// distribution. Equals the `lp_end` of the DP that built the profile;
    /// used as a consistency check. With `tag`, per-state cumulative values
    /// are recorded in state metadata.
    pub fn calc_sum_path_absorb_probs(
        &mut self,
        log_cpt_weight: &[f64],
        log_ins_prob: &[Vec<f64>],
        tag: Option<&str>,
    ) -> f64 {
        let mut lp_cum = vec![LOG_ZERO; self.states.len()];
        lp_cum[0] = 0.0;
        for pos in 1..self.states.len() {
            let lp_abs = if self.states[pos].is_null() {
                0.0
            } else {
                let mut lp = LOG_ZERO;
                for (cpt, &w) in log_cpt_weight.iter().enumerate() {
                    log_accum_exp(
                        &mut lp,
                        w + log_inner_product(&log_ins_prob[cpt], &self.states[pos].lp_absorb[cpt]),
                    );
                }
                lp
            };
            for &ti in &self.states[pos].in_trans {
                let t = &self.trans[ti];
                debug_assert!(t.src < pos, "transition {} -> {} not toposorted", t.src, pos);
                let inc = lp_cum[t.src] + t.lp_trans + lp_abs;
                log_accum_exp(&mut lp_cum[pos], inc);
            }
            if let Some(tag) = tag {
                self.states[pos]
                    .meta
                    .insert(tag.to_string(), format!("{}", lp_cum[pos]));
            }
        }
        *lp_cum.last().unwrap()
    }

    /// Split every state that is neither Ready nor Wait into a Wait twin
    /// (keeping the null outputs) and a null Ready twin (taking the absorbing
    /// outputs), joined by a unit-probability transition. Idempotent.
    pub fn add_ready_states(&self) -> Self {
        let mixed: Vec<bool> = self
            .states
            .iter()
            .map(|s| !s.is_ready() && !s.is_wait())
            .collect();
        if !mixed.iter().any(|&m| m) {
            return self.clone();
        }
        let mut new_index = vec![0usize; self.states.len()];
        let mut twin_index = vec![None; self.states.len()];
        let mut n = 0;
        for (s, &m) in mixed.iter().enumerate() {
            new_index[s] = n;
            n += 1;
            if m {
                twin_index[s] = Some(n);
                n += 1;
            }
        }

        let mut states = Vec::with_capacity(n);
        let mut trans: Vec<ProfileTransition> = self
            .trans
            .iter()
            .map(|t| {
                let src = if mixed[t.src] && !self.states[t.dest].is_null() {
                    twin_index[t.src].unwrap()
                } else {
                    new_index[t.src]
                };
                ProfileTransition {
                    src,
                    dest: new_index[t.dest],
                    lp_trans: t.lp_trans,
                    path: t.path.clone(),
                }
            })
            .collect();
        for (s, st) in self.states.iter().enumerate() {
            let mut wait = st.clone();
            wait.in_trans.clear();
            wait.null_out.clear();
            wait.absorb_out.clear();
            if mixed[s] {
                wait.name = format!("{}{}", st.name, WAIT_STATE_SUFFIX);
                let mut ready = ProfileState::default();
                ready.name = format!("{}{}", st.name, READY_STATE_SUFFIX);
                ready.meta = st.meta.clone();
                ready.seq_coords = st.seq_coords.clone();
                trans.push(ProfileTransition::new(
                    new_index[s],
                    twin_index[s].unwrap(),
                    0.0,
                ));
                states.push(wait);
                states.push(ready);
            } else {
                states.push(wait);
            }
        }
        let mut prof = Self {
            name: self.name.clone(),
            meta: self.meta.clone(),
            alph_size: self.alph_size,
            components: self.components,
            states,
            trans,
            seqs: self.seqs.clone(),
        };
        prof.reindex();
        prof.assert_seq_coords_consistent();
        prof.assert_all_states_wait_or_ready();
        prof
    }

    pub fn assert_topological(&self) {
        for t in &self.trans {
            assert!(
                t.src < t.dest,
                "profile {}: transition {} -> {} breaks topological order",
                self.name,
                t.src,
                t.dest
            );
        }
    }

    /// Sequence-coordinate consistency: for each transition, the destination
    /// coordinates equal the source coordinates plus the residues of the
    /// transition path and the destination state path.
    pub fn assert_seq_coords_consistent(&self) {
        for t in &self.trans {
            let src = &self.states[t.src].seq_coords;
            let dest = &self.states[t.dest];
            for (&row, &coord) in dest.seq_coords.iter() {
                let mut expect = src.get(&row).copied().unwrap_or(0);
                if let Some(bits) = t.path.get(&row) {
                    expect += alnpath::residues_in_row(bits);
                }
                if let Some(bits) = dest.path.get(&row) {
                    expect += alnpath::residues_in_row(bits);
                }
                assert!(
                    expect == coord,
                    "profile {}: row {} coordinate {} at state {} but {} expected via {} -> {}",
                    self.name,
                    row,
                    coord,
                    t.dest,
                    expect,
                    t.src,
                    t.dest
                );
            }
        }
    }

    pub fn assert_all_states_wait_or_ready(&self) {
        for st in &self.states {
            assert!(
                st.is_ready() || st.is_wait(),
                "state {} has {} null and {} absorbing transitions, so is neither Wait nor Ready",
                st.name,
                st.null_out.len(),
                st.absorb_out.len()
            );
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&ProfileJson::from(self)).expect("profile serialisation")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let parsed: ProfileJson = serde_json::from_str(json)?;
        parsed.into_profile()
    }
}

// -- JSON schema --------------------------------------------------------

fn path_to_json(path: &AlignPath) -> Vec<(RowIndex, String)> {
    path.iter()
        .map(|(&row, bits)| {
            let s: String = bits
                .iter()
                .map(|&b| if b { WILDCARD_CHAR } else { GAP_CHAR })
                .collect();
            (row, s)
        })
        .collect()
}

fn path_from_json(rows: &[(RowIndex, String)]) -> AlignPath {
    rows.iter()
        .map(|(row, s)| (*row, s.chars().map(|c| c != GAP_CHAR).collect()))
        .collect()
}

fn lp_to_json(lp: &[Vec<f64>]) -> Vec<Vec<Option<f64>>> {
    lp.iter()
        .map(|row| {
            row.iter()
                .map(|&v| if v == LOG_ZERO { None } else { Some(v) })
                .collect()
        })
        .collect()
}

fn lp_from_json(lp: &[Vec<Option<f64>>]) -> Vec<Vec<f64>> {
    lp.iter()
        .map(|row| row.iter().map(|v| v.unwrap_or(LOG_ZERO)).collect())
        .collect()
}

#[derive(Serialize, Deserialize)]
struct ProfileJson {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    name: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    meta: BTreeMap<String, String>,
    #[serde(rename = "alphSize")]
    alph_size: usize,
    state: Vec<StateJson>,
}

#[derive(Serialize, Deserialize)]
struct StateJson {
    n: usize,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    name: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    meta: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    path: Option<Vec<(RowIndex, String)>>,
    #[serde(rename = "seqPos", skip_serializing_if = "Option::is_none", default)]
    seq_pos: Option<Vec<(RowIndex, usize)>>,
    #[serde(rename = "lpAbsorb", skip_serializing_if = "Option::is_none", default)]
    lp_absorb: Option<Vec<Vec<Option<f64>>>>,
    trans: Vec<TransJson>,
}

#[derive(Serialize, Deserialize)]
struct TransJson {
    to: usize,
    #[serde(rename = "lpTrans")]
    lp_trans: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    path: Option<Vec<(RowIndex, String)>>,
}

impl From<&Profile> for ProfileJson {
    fn from(p: &Profile) -> Self {
        let state = p
            .states
            .iter()
            .enumerate()
            .map(|(n, st)| {
                let mut out: Vec<TransIndex> = st
                    .null_out
                    .iter()
                    .chain(st.absorb_out.iter())
                    .copied()
                    .collect();
                out.sort_unstable();
                StateJson {
                    n,
                    name: if st.name.is_empty() {
                        None
                    } else {
                        Some(st.name.clone())
                    },
                    meta: st.meta.clone(),
                    path: if st.path.is_empty() {
                        None
                    } else {
                        Some(path_to_json(&st.path))
                    },
                    seq_pos: if st.seq_coords.is_empty() {
                        None
                    } else {
                        Some(st.seq_coords.iter().map(|(&r, &c)| (r, c)).collect())
                    },
                    lp_absorb: if st.is_null() {
                        None
                    } else {
                        Some(lp_to_json(&st.lp_absorb))
                    },
                    trans: out
                        .into_iter()
                        .map(|ti| {
                            let t = &p.trans[ti];
                            TransJson {
                                to: t.dest,
                                lp_trans: t.lp_trans,
                                path: if t.path.is_empty() {
                                    None
                                } else {
                                    Some(path_to_json(&t.path))
                                },
                            }
                        })
                        .collect(),
                }
            })
            .collect();
        ProfileJson {
            name: p.name.clone(),
            meta: p.meta.clone(),
            alph_size: p.alph_size,
            state,
        }
    }
}

impl ProfileJson {
    fn into_profile(self) -> Result<Profile> {
        let mut states = Vec::with_capacity(self.state.len());
        let mut trans = Vec::new();
        for (idx, sj) in self.state.iter().enumerate() {
            if sj.n != idx {
                return Err(Error::Input(format!(
                    "profile JSON: state {} out of order (n = {})",
                    idx, sj.n
                )));
            }
            let mut st = ProfileState::default();
            st.name = sj.name.clone().unwrap_or_default();
            st.meta = sj.meta.clone();
            if let Some(p) = &sj.path {
                st.path = path_from_json(p);
            }
            if let Some(sp) = &sj.seq_pos {
                st.seq_coords = sp.iter().copied().collect();
            }
            if let Some(lp) = &sj.lp_absorb {
                st.lp_absorb = lp_from_json(lp);
            }
            for tj in &sj.trans {
                let mut t = ProfileTransition::new(idx, tj.to, tj.lp_trans);
                if let Some(p) = &tj.path {
                    t.path = path_from_json(p);
                }
                trans.push(t);
            }
            states.push(st);
        }
        let components = states
            .iter()
            .find(|s| !s.is_null())
            .map(|s| s.lp_absorb.len())
            .unwrap_or(1);
        let mut prof = Profile {
            name: self.name,
            meta: self.meta,
            alph_size: self.alph_size,
            components,
            states,
            trans,
            seqs: BTreeMap::new(),
        };
        prof.assert_topological();
        prof.reindex();
        Ok(prof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_ac() -> Profile {
        Profile::leaf(1, &Alphabet::dna(), &FastSeq::new("x", "AC"), 0)
    }

    #[test]
    fn leaf_profile_shape() {
        let p = leaf_ac();
        assert_eq!(p.size(), 4);
        assert_eq!(p.trans.len(), 3);
        p.assert_topological();
        assert!(p.states[0].is_ready());
        assert!(p.states[2].is_wait());
        assert_eq!(p.states[1].seq_coords[&0], 1);
        assert_eq!(p.states[1].lp_absorb[0][0], 0.0);
        assert_eq!(p.states[1].lp_absorb[0][1], LOG_ZERO);
    }

    #[test]
    fn leaf_sum_path_is_uniform_emission() {
        let mut p = Profile::leaf(1, &Alphabet::dna(), &FastSeq::new("x", "ACGTA"), 0);
        let w = vec![0.0];
        let ins = vec![vec![0.25f64.ln(); 4]];
        let lp = p.calc_sum_path_absorb_probs(&w, &ins, None);
        assert!((lp - 5.0 * 0.25f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn align_column_reads_residue() {
        let p = leaf_ac();
        let col = p.align_column(2);
        assert_eq!(col[&0], 'C');
    }

    #[test]
    fn get_trans_scans_incoming() {
        let p = leaf_ac();
        assert!(p.get_trans(0, 1).is_some());
        assert!(p.get_trans(0, 2).is_none());
    }

    #[test]
    fn left_multiply_mixes_symbols() {
        let p = leaf_ac();
        // uniform substitution: every symbol equally likely
        let u = vec![vec![vec![0.25f64.ln(); 4]; 4]];
        let q = p.left_multiply(&u);
        for a in 0..4 {
            assert!((q.states[1].lp_absorb[0][a] - 0.25f64.ln()).abs() < 1e-9);
        }
        // identity substitution leaves the table alone
        let mut ident = vec![vec![vec![LOG_ZERO; 4]; 4]];
        for a in 0..4 {
            ident[0][a][a] = 0.0;
        }
        let q = p.left_multiply(&ident);
        assert_eq!(q.states[1].lp_absorb, p.states[1].lp_absorb);
    }

    #[test]
    fn add_ready_states_splits_mixed() {
        // START -> a1 -> END plus a direct null edge a1 -> END and an
        // absorbing edge a1 -> a2 -> END, making a1 mixed.
        let alph = Alphabet::dna();
        let mut p = Profile::leaf(1, &alph, &FastSeq::new("x", "AC"), 0);
        // a1 (state 1) gains a null transition straight to END; its
        // coordinates no longer match END's, so retarget to a fresh null.
        p.trans.push(ProfileTransition::new(1, 3, (0.5f64).ln()));
        // fix END coords so both routes agree: drop the strict coordinate
        // by clearing row coords on END
        p.states[3].seq_coords.clear();
        p.reindex();
        assert!(!p.states[1].is_ready() && !p.states[1].is_wait());
        let q = p.add_ready_states();
        assert_eq!(q.size(), p.size() + 1);
        q.assert_all_states_wait_or_ready();
        q.assert_topological();
        // idempotent
        let r = q.add_ready_states();
        assert_eq!(r, q);
    }

    #[test]
    fn json_round_trip() {
        let mut p = leaf_ac();
        p.meta.insert("k".to_string(), "v".to_string());
        let json = p.to_json();
        let q = Profile::from_json(&json).unwrap();
        let mut expect = p.clone();
        expect.seqs.clear(); // stored residues are not part of the schema
        assert_eq!(q, expect);
    }
}
