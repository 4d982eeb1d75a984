//! Substitution and indel models, and the product pair HMM over two branches.
//!
//! A `RateModel` is the time-independent description: mixture components,
//! substitution generators, insertion distribution, indel rates and geometric
//! extension probabilities. A `ProbModel` is the model pushed through a
//! branch length. A `PairHmm` packages the two branch `ProbModel`s below one
//! ancestor into the seven-state machine the DP runs on.

use crate::logsum::{log_accum_exp, LOG_ZERO};
use crate::seq::Alphabet;
use serde::{Deserialize, Serialize};

/// Pair-HMM states. `Imm`/`Imd`/`Idm` absorb one ancestral symbol; `Iiw` and
/// `Imi` emit a branch insertion on the left and right child respectively.
/// The double-deletion state is eliminated at construction and never appears
/// in a DP cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HmmState {
    Sss,
    Imm,
    Imd,
    Idm,
    Iiw,
    Imi,
    Eee,
}

/// The emitting states, in DP dependency order.
pub const DP_STATES: [HmmState; 5] = [
    HmmState::Imm,
    HmmState::Imd,
    HmmState::Idm,
    HmmState::Iiw,
    HmmState::Imi,
];

impl HmmState {
    pub fn index(self) -> usize {
        match self {
            HmmState::Sss => 0,
            HmmState::Imm => 1,
            HmmState::Imd => 2,
            HmmState::Idm => 3,
            HmmState::Iiw => 4,
            HmmState::Imi => 5,
            HmmState::Eee => 6,
        }
    }

    /// Does this state advance the left (x) profile?
    pub fn advances_x(self) -> bool {
        matches!(self, HmmState::Imm | HmmState::Imd | HmmState::Iiw)
    }

    /// Does this state advance the right (y) profile?
    pub fn advances_y(self) -> bool {
        matches!(self, HmmState::Imm | HmmState::Idm | HmmState::Imi)
    }

    /// Does this state absorb an ancestral symbol?
    pub fn absorbs(self) -> bool {
        matches!(self, HmmState::Imm | HmmState::Imd | HmmState::Idm)
    }
}

const NSTATES: usize = 7;

/// The time-independent rate model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateModel {
    pub alphabet: String,
    /// Mixture component weights, summing to one.
    pub cpt_weight: Vec<f64>,
    /// Insertion (and root) distribution per component.
    pub ins_prob: Vec<Vec<f64>>,
    /// Substitution generator per component (rows sum to zero).
    pub sub_rate: Vec<Vec<Vec<f64>>>,
    pub ins_rate: f64,
    pub del_rate: f64,
    pub ins_ext: f64,
    pub del_ext: f64,
}

impl RateModel {
    /// Single-component Jukes-Cantor DNA model with a mild indel process.
    pub fn dna_default() -> Self {
        let mut q = vec![vec![1.0 / 3.0; 4]; 4];
        for (a, row) in q.iter_mut().enumerate() {
            row[a] = -1.0;
        }
        Self {
            alphabet: "ACGT".to_string(),
            cpt_weight: vec![1.0],
            ins_prob: vec![vec![0.25; 4]],
            sub_rate: vec![q],
            ins_rate: 0.01,
            del_rate: 0.0105,
            ins_ext: 0.4,
            del_ext: 0.4,
        }
    }

    /// Degenerate model for exact-arithmetic tests: identity substitution,
    /// no indels, and a unit (improper) insertion weight on every symbol so
    /// that a perfectly matching alignment scores log-probability zero.
    pub fn test_identity() -> Self {
        Self {
            alphabet: "ACGT".to_string(),
            cpt_weight: vec![1.0],
            ins_prob: vec![vec![1.0; 4]],
            sub_rate: vec![vec![vec![0.0; 4]; 4]],
            ins_rate: 0.0,
            del_rate: 0.0,
            ins_ext: 0.0,
            del_ext: 0.0,
        }
    }

    /// Same as [`test_identity`](Self::test_identity) but with a small indel
    /// process, for scenarios that need a gap to be representable.
    pub fn test_identity_indel(ins_rate: f64, del_rate: f64) -> Self {
        Self {
            ins_rate,
            del_rate,
            ins_ext: 0.1,
            del_ext: 0.1,
            ..Self::test_identity()
        }
    }

    pub fn components(&self) -> usize {
        self.cpt_weight.len()
    }

    pub fn alphabet(&self) -> Alphabet {
        Alphabet::new(&self.alphabet)
    }

    pub fn alphabet_size(&self) -> usize {
        self.alphabet.len()
    }

    /// `P(t) = exp(Q_c t)` for component `c`.
    pub fn substitution_matrix(&self, cpt: usize, t: f64) -> Vec<Vec<f64>> {
        expm(&self.sub_rate[cpt], t)
    }

    pub fn log_cpt_weight(&self) -> Vec<f64> {
        self.cpt_weight.iter().map(|&w| w.ln()).collect()
    }

    pub fn log_ins_prob(&self) -> Vec<Vec<f64>> {
        self.ins_prob
            .iter()
            .map(|row| row.iter().map(|&p| p.ln()).collect())
            .collect()
    }
}

/// Dense matrix exponential by scaling-and-squaring of the Taylor series.
/// The generators here are tiny (A x A), so this is plenty.
pub fn expm(q: &[Vec<f64>], t: f64) -> Vec<Vec<f64>> {
    let n = q.len();
    let norm: f64 = q
        .iter()
        .map(|row| row.iter().map(|v| (v * t).abs()).sum::<f64>())
        .fold(0.0, f64::max);
    let squarings = if norm > 0.5 {
        (norm / 0.5).log2().ceil() as u32
    } else {
        0
    };
    let scale = t / f64::powi(2.0, squarings as i32);
    // Taylor: I + A + A^2/2! + ...
    let mut term: Vec<Vec<f64>> = identity(n);
    let mut sum = identity(n);
    for k in 1..=24 {
        term = mat_mul(&term, q);
        for row in term.iter_mut() {
            for v in row.iter_mut() {
                *v *= scale / k as f64;
            }
        }
        let mut biggest = 0.0f64;
        for (i, row) in term.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                sum[i][j] += v;
                biggest = biggest.max(v.abs());
            }
        }
        if biggest < 1e-16 {
            break;
        }
    }
    for _ in 0..squarings {
        sum = mat_mul(&sum, &sum);
    }
    sum
}

fn identity(n: usize) -> Vec<Vec<f64>> {
    let mut m = vec![vec![0.0; n]; n];
    for (i, row) in m.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    m
}

fn mat_mul(a: &[Vec<f64>], b: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = a.len();
    let mut out = vec![vec![0.0; n]; n];
    for i in 0..n {
        for k in 0..n {
            let aik = a[i][k];
            if aik == 0.0 {
                continue;
            }
            for j in 0..n {
                out[i][j] += aik * b[k][j];
            }
        }
    }
    out
}

/// The rate model pushed through one branch of length `t`.
#[derive(Debug, Clone)]
pub struct ProbModel {
    pub t: f64,
    /// Probability of opening an insertion before the next ancestral symbol.
    pub ins: f64,
    /// Probability the next ancestral symbol is deleted.
    pub del: f64,
    pub ins_ext: f64,
    pub del_ext: f64,
    /// Substitution matrix per component, probability space.
    pub sub: Vec<Vec<Vec<f64>>>,
    /// Same, log space.
    pub log_sub: Vec<Vec<Vec<f64>>>,
}

impl ProbModel {
    pub fn new(model: &RateModel, t: f64) -> Self {
        let sub: Vec<Vec<Vec<f64>>> = (0..model.components())
            .map(|c| model.substitution_matrix(c, t))
            .collect();
        let log_sub = sub
            .iter()
            .map(|m| {
                m.iter()
                    .map(|row| {
                        row.iter()
                            .map(|&p| if p > 0.0 { p.ln() } else { LOG_ZERO })
                            .collect()
                    })
                    .collect()
            })
            .collect();
        Self {
            t,
            ins: 1.0 - (-model.ins_rate * t).exp(),
            del: 1.0 - (-model.del_rate * t).exp(),
            ins_ext: model.ins_ext,
            del_ext: model.del_ext,
            sub,
            log_sub,
        }
    }
}

/// Last emitting state of one branch transducer, as remembered by the pair
/// state. Insertions on either branch reset deletion memory to `Mat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchRow {
    Mat,
    Del,
    Ins,
}

impl BranchRow {
    fn p_ins(self, m: &ProbModel) -> f64 {
        match self {
            BranchRow::Ins => m.ins_ext,
            _ => m.ins,
        }
    }
    fn p_del_given_no_ins(self, m: &ProbModel) -> f64 {
        match self {
            BranchRow::Del => m.del_ext,
            _ => m.del,
        }
    }
}

/// Continue probability of the geometric ancestral length prior when the
/// rate model cannot supply one (zero rates, or insertion outpacing
/// deletion, which has no finite equilibrium length).
pub const FALLBACK_KAPPA: f64 = 0.999;

/// Continue probability of the ancestral length prior: the equilibrium of
/// the indel process makes ancestor lengths geometric with parameter
/// `ins_rate / del_rate`.
fn ancestor_continue_prob(model: &RateModel) -> f64 {
    if model.ins_rate > 0.0 && model.ins_rate < model.del_rate {
        model.ins_rate / model.del_rate
    } else {
        FALLBACK_KAPPA
    }
}

/// The seven-state product machine over (left branch, right branch) with the
/// canonical left-inserts-before-right-inserts ordering and the unobservable
/// double-deletion state summed out.
#[derive(Debug, Clone)]
pub struct PairHmm {
    pub l: ProbModel,
    pub r: ProbModel,
    /// Log root (= insertion) distribution, per component.
    pub log_root: Vec<Vec<f64>>,
    pub log_cpt_weight: Vec<f64>,
    /// Continue probability of the geometric ancestral length prior.
    pub kappa: f64,
    trans: [[f64; NSTATES]; NSTATES],
}

impl PairHmm {
    pub fn new(model: &RateModel, l: ProbModel, r: ProbModel) -> Self {
        let kappa = ancestor_continue_prob(model);
        let trans = build_trans(&l, &r, kappa);
        Self {
            l,
            r,
            log_root: model.log_ins_prob(),
            log_cpt_weight: model.log_cpt_weight(),
            kappa,
            trans,
        }
    }

    #[inline]
    pub fn log_trans(&self, src: HmmState, dest: HmmState) -> f64 {
        self.trans[src.index()][dest.index()]
    }

    /// Symbol-level emission weight: the joint probability of the child
    /// symbols under an ancestral symbol drawn from the root distribution,
    /// mixed over components. Each state reads only the sides it emits to;
    /// non-emitting states weigh zero (log 1).
    pub fn log_emit(&self, state: HmmState, left_sym: u8, right_sym: u8) -> f64 {
        let a_sz = self.log_root[0].len();
        let (x, y) = (left_sym as usize, right_sym as usize);
        let mut lp = LOG_ZERO;
        for (cpt, &w) in self.log_cpt_weight.iter().enumerate() {
            let mut inner = LOG_ZERO;
            for a in 0..a_sz {
                let term = self.log_root[cpt][a]
                    + match state {
                        HmmState::Imm => self.l.log_sub[cpt][a][x] + self.r.log_sub[cpt][a][y],
                        HmmState::Imd | HmmState::Iiw => self.l.log_sub[cpt][a][x],
                        HmmState::Idm | HmmState::Imi => self.r.log_sub[cpt][a][y],
                        HmmState::Sss | HmmState::Eee => return 0.0,
                    };
                log_accum_exp(&mut inner, term);
            }
            log_accum_exp(&mut lp, w + inner);
        }
        lp
    }

    pub fn components(&self) -> usize {
        self.log_cpt_weight.len()
    }
}

fn rows_of(s: HmmState) -> (BranchRow, BranchRow) {
    use BranchRow::*;
    match s {
        HmmState::Sss | HmmState::Imm => (Mat, Mat),
        HmmState::Imd => (Mat, Del),
        HmmState::Idm => (Del, Mat),
        // Insertion states only remember the inserting side; the other side's
        // deletion memory is reset.
        HmmState::Iiw => (Ins, Mat),
        HmmState::Imi => (Mat, Ins),
        HmmState::Eee => (Mat, Mat),
    }
}

fn build_trans(l: &ProbModel, r: &ProbModel, kappa: f64) -> [[f64; NSTATES]; NSTATES] {
    use HmmState::*;
    // Probability-space table over the 7 visible states plus the hidden
    // double-deletion state, which is then eliminated. Once both branches
    // decline an insertion, the ancestor either emits another symbol (kappa)
    // or ends (1 - kappa), so every source row sums to one.
    let visible = [Sss, Imm, Imd, Idm, Iiw, Imi, Eee];
    let mut p = [[0.0f64; NSTATES]; NSTATES];
    let mut to_idd = [0.0f64; NSTATES]; // src -> Idd
    let mut from_idd = [0.0f64; NSTATES]; // Idd -> dest
    let mut idd_self = 0.0f64;

    // Branch outcome factor for an ancestral step: P(outcome | no insertion).
    let outcome = |row: BranchRow, m: &ProbModel, deleted: bool| -> f64 {
        let pd = row.p_del_given_no_ins(m);
        if deleted {
            pd
        } else {
            1.0 - pd
        }
    };

    let idd_rows = (BranchRow::Del, BranchRow::Del);
    let sources: Vec<(usize, (BranchRow, BranchRow))> = visible
        .iter()
        .filter(|&&s| !matches!(s, Eee))
        .map(|&s| (s.index(), rows_of(s)))
        .chain(std::iter::once((NSTATES, idd_rows)))
        .collect();

    for &(si, (lrow, rrow)) in &sources {
        // Entry factors for each destination. For a source inside an
        // insertion run the run's own extension/decline factor replaces the
        // open/decline factor of that side.
        let (l_open, l_decline) = (lrow.p_ins(l), 1.0 - lrow.p_ins(l));
        let (r_open, r_decline) = (rrow.p_ins(r), 1.0 - rrow.p_ins(r));
        // Left's decline is already paid on entry to Imi, so it does not
        // recur while the right-side run extends or exits.
        let in_right_run = matches!(rrow, BranchRow::Ins);
        let l_decline_once = if in_right_run { 1.0 } else { l_decline };

        let mut set = |dest: usize, pr: f64| {
            if si < NSTATES {
                if dest < NSTATES {
                    p[si][dest] = pr;
                } else {
                    to_idd[si] = pr;
                }
            } else if dest < NSTATES {
                from_idd[dest] = pr;
            } else {
                idd_self = pr;
            }
        };

        if !in_right_run {
            set(Iiw.index(), l_open);
        }
        set(Imi.index(), l_decline_once * r_open);
        let anc = l_decline_once * r_decline * kappa;
        set(
            Imm.index(),
            anc * outcome(lrow, l, false) * outcome(rrow, r, false),
        );
        set(
            Imd.index(),
            anc * outcome(lrow, l, false) * outcome(rrow, r, true),
        );
        set(
            Idm.index(),
            anc * outcome(lrow, l, true) * outcome(rrow, r, false),
        );
        set(NSTATES, anc * outcome(lrow, l, true) * outcome(rrow, r, true));
        set(Eee.index(), l_decline_once * r_decline * (1.0 - kappa));
    }

    // Sum out Idd: src -> Idd -> Idd* -> dest.
    let geom = 1.0 / (1.0 - idd_self);
    let mut out = [[LOG_ZERO; NSTATES]; NSTATES];
    for s in 0..NSTATES {
        for d in 0..NSTATES {
            let pr = p[s][d] + to_idd[s] * geom * from_idd[d];
            out[s][d] = if pr > 0.0 { pr.ln() } else { LOG_ZERO };
        }
    }
    // Nothing leaves the end state, and nothing enters the start state.
    for d in 0..NSTATES {
        out[Eee.index()][d] = LOG_ZERO;
        out[d][Sss.index()] = LOG_ZERO;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expm_zero_is_identity() {
        let q = vec![vec![0.0; 4]; 4];
        let p = expm(&q, 1.0);
        for (i, row) in p.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                assert!((v - if i == j { 1.0 } else { 0.0 }).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn expm_rows_sum_to_one() {
        let model = RateModel::dna_default();
        for &t in &[0.01, 0.3, 1.7] {
            let p = model.substitution_matrix(0, t);
            for row in &p {
                let s: f64 = row.iter().sum();
                assert!((s - 1.0).abs() < 1e-9, "t={} sum={}", t, s);
                assert!(row.iter().all(|&v| v >= -1e-12));
            }
        }
    }

    #[test]
    fn expm_jc_matches_closed_form() {
        let model = RateModel::dna_default();
        let t = 0.5;
        let p = model.substitution_matrix(0, t);
        // JC69: P(same) = 1/4 + 3/4 exp(-4t/3)
        let same = 0.25 + 0.75 * (-4.0 * t / 3.0).exp();
        assert!((p[0][0] - same).abs() < 1e-9);
        assert!((p[1][2] - (1.0 - same) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn identity_model_transitions_follow_the_length_prior() {
        // With zero indel rates the only free choice left is continue/end.
        let model = RateModel::test_identity();
        let l = ProbModel::new(&model, 1.0);
        let r = ProbModel::new(&model, 1.0);
        let hmm = PairHmm::new(&model, l, r);
        let k = FALLBACK_KAPPA;
        assert!((hmm.kappa - k).abs() < 1e-12);
        assert!((hmm.log_trans(HmmState::Sss, HmmState::Imm) - k.ln()).abs() < 1e-12);
        assert!((hmm.log_trans(HmmState::Imm, HmmState::Imm) - k.ln()).abs() < 1e-12);
        assert!((hmm.log_trans(HmmState::Imm, HmmState::Eee) - (1.0 - k).ln()).abs() < 1e-12);
        assert_eq!(hmm.log_trans(HmmState::Imm, HmmState::Iiw), LOG_ZERO);
        assert_eq!(hmm.log_trans(HmmState::Imm, HmmState::Imd), LOG_ZERO);
    }

    #[test]
    fn transition_rows_sum_to_one() {
        use HmmState::*;
        let model = RateModel::dna_default();
        let hmm = PairHmm::new(
            &model,
            ProbModel::new(&model, 0.3),
            ProbModel::new(&model, 0.7),
        );
        assert!((hmm.kappa - model.ins_rate / model.del_rate).abs() < 1e-12);
        for &src in &[Sss, Imm, Imd, Idm, Iiw, Imi] {
            let total: f64 = [Imm, Imd, Idm, Iiw, Imi, Eee]
                .iter()
                .map(|&d| hmm.log_trans(src, d).exp())
                .sum();
            assert!((total - 1.0).abs() < 1e-12, "{:?} row sums to {}", src, total);
        }
    }

    #[test]
    fn indel_model_allows_insertions() {
        let model = RateModel::test_identity_indel(0.05, 0.05);
        let l = ProbModel::new(&model, 1.0);
        let r = ProbModel::new(&model, 1.0);
        let hmm = PairHmm::new(&model, l, r);
        assert!(hmm.log_trans(HmmState::Imm, HmmState::Imi) > LOG_ZERO);
        assert!(hmm.log_trans(HmmState::Imm, HmmState::Iiw) > LOG_ZERO);
        // right-before-left insertion order exists only through an
        // intervening double deletion, so it is heavily suppressed
        assert!(
            hmm.log_trans(HmmState::Imi, HmmState::Iiw)
                < hmm.log_trans(HmmState::Imm, HmmState::Iiw) - 2.0
        );
        // deletion memory: extension differs from opening
        let ext = hmm.log_trans(HmmState::Imd, HmmState::Imd);
        let open = hmm.log_trans(HmmState::Imm, HmmState::Imd);
        assert!((ext - open).abs() > 1e-9);
    }

    #[test]
    fn symbol_emissions_follow_the_substitution_matrix() {
        let model = RateModel::test_identity();
        let hmm = PairHmm::new(
            &model,
            ProbModel::new(&model, 1.0),
            ProbModel::new(&model, 1.0),
        );
        assert!(hmm.log_emit(HmmState::Imm, 2, 2).abs() < 1e-12);
        assert_eq!(hmm.log_emit(HmmState::Imm, 0, 1), LOG_ZERO);
        assert!(hmm.log_emit(HmmState::Imd, 3, 0).abs() < 1e-12);
        assert_eq!(hmm.log_emit(HmmState::Sss, 0, 0), 0.0);

        let model = RateModel::dna_default();
        let hmm = PairHmm::new(
            &model,
            ProbModel::new(&model, 0.4),
            ProbModel::new(&model, 0.4),
        );
        // equal branch lengths make match emission symmetric in the symbols
        let ab = hmm.log_emit(HmmState::Imm, 0, 1);
        let ba = hmm.log_emit(HmmState::Imm, 1, 0);
        assert!((ab - ba).abs() < 1e-12);
        assert!(hmm.log_emit(HmmState::Imm, 0, 0) > ab);
    }

    #[test]
    fn branch_probs_zero_at_zero_rates() {
        let model = RateModel::test_identity();
        let pm = ProbModel::new(&model, 2.0);
        assert_eq!(pm.ins, 0.0);
        assert_eq!(pm.del, 0.0);
        assert!((pm.sub[0][2][2] - 1.0).abs() < 1e-12);
    }
}
