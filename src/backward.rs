//! Backward recurrence paired with a Forward matrix: posterior cell
//! probabilities, posterior-pruned profile construction, and expected event
//! counts for EM.

use crate::counts::{EventCounts, LEFT, RIGHT};
use crate::forward::{
    build_profile, CellCoords, EdgeSet, ForwardMatrix, IncludedCells, ProfilingStrategy,
    COUNT_INDEL_EVENTS, COUNT_SUBST_EVENTS, INCLUDE_BEST_TRACE,
};
use crate::logsum::{log_accum_exp, LOG_ZERO};
use crate::model::HmmState;
use crate::profile::Profile;
use log::debug;
use std::collections::HashMap;

pub struct BackwardMatrix<'a> {
    fwd: &'a ForwardMatrix,
    back: HashMap<CellCoords, f64>,
}

impl<'a> BackwardMatrix<'a> {
    pub fn new(fwd: &'a ForwardMatrix) -> Self {
        let mut back: HashMap<CellCoords, f64> = fwd
            .order
            .iter()
            .map(|&c| (c, fwd.core.end_lp(c)))
            .collect();
        // Reverse sweep: once a cell is processed, its backward value is
        // final, so it can be pushed to every predecessor.
        for dest in fwd.order.iter().rev() {
            let bd = back[dest];
            if bd == LOG_ZERO {
                continue;
            }
            let emit = fwd.core.emit(*dest);
            let mut updates: Vec<(CellCoords, f64)> = Vec::new();
            fwd.core
                .for_each_incoming(&fwd.cells, *dest, &mut |src, mv, _route| {
                    updates.push((src, mv + emit + bd));
                });
            for (src, lp) in updates {
                let slot = back.get_mut(&src).expect("predecessor cell exists");
                log_accum_exp(slot, lp);
            }
        }
        let start = fwd.core.start_cell();
        debug_assert!(
            (back[&start] - fwd.lp_end).abs() < 1e-6 || fwd.lp_end == LOG_ZERO,
            "backward at START ({}) disagrees with lp_end ({})",
            back[&start],
            fwd.lp_end
        );
        Self { fwd, back }
    }

    /// Posterior probability that the joint path passes through `cell`.
    pub fn post_prob(&self, cell: CellCoords) -> f64 {
        match (self.fwd.cells.get(&cell), self.back.get(&cell)) {
            (Some(&f), Some(&b)) => (f + b - self.fwd.lp_end).exp(),
            _ => 0.0,
        }
    }

    /// Profile containing every cell whose posterior reaches `min_prob`,
    /// capped at `state_limit` cells in descending-posterior order (0 means
    /// unlimited), with every DP move between included cells as an edge.
    pub fn post_prob_profile(
        &self,
        min_prob: f64,
        state_limit: usize,
        name: &str,
        strategy: ProfilingStrategy,
    ) -> Profile {
        let core = &self.fwd.core;
        let mut ranked: Vec<(f64, CellCoords)> = self
            .fwd
            .order
            .iter()
            .filter(|&&c| c != core.start_cell())
            .map(|&c| (self.post_prob(c), c))
            .filter(|&(p, _)| p >= min_prob)
            .collect();
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap().then(a.1.cmp(&b.1)));

        let mut included = IncludedCells::capped(if state_limit == 0 {
            0
        } else {
            state_limit + 2 // START and END do not count against the cap
        });
        included.insert(core.start_cell());
        included.insert(core.end_cell());
        let mut edges = EdgeSet::new();
        if strategy & INCLUDE_BEST_TRACE != 0 {
            // The Viterbi path goes in first, so a complete route always
            // survives the cap.
            let best = self.fwd.best_trace();
            self.fwd.add_trace(&best, &mut included, &mut edges);
        }
        for &(_, c) in &ranked {
            included.insert(c);
        }
        for &c in &self.fwd.order {
            if !included.contains(c) || c == core.start_cell() {
                continue;
            }
            core.for_each_incoming(&self.fwd.cells, c, &mut |src, _mv, route| {
                if included.contains(src) {
                    let lp = core.edge_lp(src.state, c, &route);
                    edges.insert(src, c, route, lp);
                }
            });
            core.for_each_end_route(c, &mut |_lp, route| {
                let lp = core.edge_lp(c.state, core.end_cell(), &route);
                edges.insert(c, core.end_cell(), route, lp);
            });
        }
        // START can finish directly when the envelope admits the empty path.
        core.for_each_end_route(core.start_cell(), &mut |_lp, route| {
            let lp = core.edge_lp(HmmState::Sss, core.end_cell(), &route);
            edges.insert(core.start_cell(), core.end_cell(), route, lp);
        });
        debug!(
            "posterior profile {}: {} of {} cells over {}",
            name,
            included.len(),
            self.fwd.order.len(),
            min_prob
        );
        build_profile(core, name, &included, &edges, strategy)
    }

    /// Expected substitution and indel event counts under the posterior.
    pub fn counts(&self, strategy: ProfilingStrategy) -> EventCounts {
        let core = &self.fwd.core;
        let mut counts = EventCounts::new(core.x.components, core.x.alph_size);
        if self.fwd.lp_end == LOG_ZERO {
            return counts;
        }
        if strategy & COUNT_INDEL_EVENTS != 0 {
            for &dest in &self.fwd.order {
                let bd = self.back[&dest];
                if bd == LOG_ZERO {
                    continue;
                }
                let emit = core.emit(dest);
                core.for_each_incoming(&self.fwd.cells, dest, &mut |src, mv, _route| {
                    let p = (self.fwd.cells[&src] + mv + emit + bd - self.fwd.lp_end).exp();
                    match dest.state {
                        HmmState::Iiw => {
                            if src.state == HmmState::Iiw {
                                counts.ins_ext[LEFT] += p;
                            } else {
                                counts.ins_open[LEFT] += p;
                            }
                        }
                        HmmState::Imi => {
                            if src.state == HmmState::Imi {
                                counts.ins_ext[RIGHT] += p;
                            } else {
                                counts.ins_open[RIGHT] += p;
                            }
                        }
                        HmmState::Imd => {
                            counts.mat[LEFT] += p;
                            if src.state == HmmState::Imd {
                                counts.del_ext[RIGHT] += p;
                            } else {
                                counts.del_open[RIGHT] += p;
                            }
                        }
                        HmmState::Idm => {
                            counts.mat[RIGHT] += p;
                            if src.state == HmmState::Idm {
                                counts.del_ext[LEFT] += p;
                            } else {
                                counts.del_open[LEFT] += p;
                            }
                        }
                        HmmState::Imm => {
                            counts.mat[LEFT] += p;
                            counts.mat[RIGHT] += p;
                        }
                        _ => {}
                    }
                });
            }
        }
        if strategy & COUNT_SUBST_EVENTS != 0 {
            for &cell in &self.fwd.order {
                if !cell.state.absorbs() {
                    continue;
                }
                let pc = self.post_prob(cell);
                if pc <= 0.0 {
                    continue;
                }
                self.accumulate_subst(cell, pc, &mut counts);
            }
        }
        counts
    }

    /// Distribute one absorbing cell's posterior mass over (component, root
    /// symbol, child symbol) using the original child absorption tables.
    fn accumulate_subst(&self, cell: CellCoords, pc: f64, counts: &mut EventCounts) {
        let core = &self.fwd.core;
        let a_sz = core.x.alph_size;
        let hmm = &core.hmm;
        let lx = cell.state.advances_x();
        let ly = cell.state.advances_y();
        // joint weight over (cpt, root symbol a, left child b, right child d)
        // factorises; accumulate marginals directly.
        let mut z = 0.0;
        let mut root_acc = vec![vec![0.0; a_sz]; counts.components];
        let mut sub_acc = [
            vec![vec![vec![0.0; a_sz]; a_sz]; counts.components],
            vec![vec![vec![0.0; a_sz]; a_sz]; counts.components],
        ];
        for cpt in 0..counts.components {
            let w = hmm.log_cpt_weight[cpt].exp();
            for a in 0..a_sz {
                let root = hmm.log_root[cpt][a].exp();
                let left = if lx {
                    (0..a_sz)
                        .map(|b| {
                            hmm.l.sub[cpt][a][b] * core.x_abs0(cell.xpos, cpt, b).exp()
                        })
                        .collect::<Vec<f64>>()
                } else {
                    Vec::new()
                };
                let right = if ly {
                    (0..a_sz)
                        .map(|d| {
                            hmm.r.sub[cpt][a][d] * core.y_abs0(cell.ypos, cpt, d).exp()
                        })
                        .collect::<Vec<f64>>()
                } else {
                    Vec::new()
                };
                let left_sum: f64 = if lx { left.iter().sum() } else { 1.0 };
                let right_sum: f64 = if ly { right.iter().sum() } else { 1.0 };
                let joint = w * root * left_sum * right_sum;
                z += joint;
                root_acc[cpt][a] += joint;
                if lx {
                    for b in 0..a_sz {
                        sub_acc[LEFT][cpt][a][b] += w * root * left[b] * right_sum;
                    }
                }
                if ly {
                    for d in 0..a_sz {
                        sub_acc[RIGHT][cpt][a][d] += w * root * left_sum * right[d];
                    }
                }
            }
        }
        if z <= 0.0 {
            return;
        }
        for cpt in 0..counts.components {
            for a in 0..a_sz {
                counts.root_count[cpt][a] += pc * root_acc[cpt][a] / z;
                for b in 0..a_sz {
                    counts.sub_count[LEFT][cpt][a][b] += pc * sub_acc[LEFT][cpt][a][b] / z;
                    counts.sub_count[RIGHT][cpt][a][b] += pc * sub_acc[RIGHT][cpt][a][b] / z;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::COLLAPSE_CHAINS;
    use crate::model::{PairHmm, ProbModel, RateModel};
    use crate::profile::Profile;
    use crate::seq::FastSeq;

    fn pair_forward(model: &RateModel, xs: &str, ys: &str) -> ForwardMatrix {
        let alph = model.alphabet();
        let x = Profile::leaf(model.components(), &alph, &FastSeq::new("x", xs), 0);
        let y = Profile::leaf(model.components(), &alph, &FastSeq::new("y", ys), 1);
        let hmm = PairHmm::new(model, ProbModel::new(model, 1.0), ProbModel::new(model, 1.0));
        ForwardMatrix::new(&x, &y, hmm, 2, None)
    }

    #[test]
    fn posterior_is_one_on_a_forced_path() {
        let model = RateModel::test_identity();
        let fwd = pair_forward(&model, "ACG", "ACG");
        let bwd = BackwardMatrix::new(&fwd);
        for &c in &fwd.order {
            if c.state == HmmState::Imm {
                assert!((bwd.post_prob(c) - 1.0).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn posterior_profile_reproduces_lp_end() {
        let model = RateModel::test_identity_indel(0.05, 0.05);
        let fwd = pair_forward(&model, "ACGT", "ACT");
        let bwd = BackwardMatrix::new(&fwd);
        let mut prof = bwd.post_prob_profile(0.0, 0, "p", COLLAPSE_CHAINS);
        let lp = prof.calc_sum_path_absorb_probs(
            &model.log_cpt_weight(),
            &model.log_ins_prob(),
            None,
        );
        // with no pruning the profile carries every DP path
        assert!((lp - fwd.lp_end).abs() < 1e-6, "{} vs {}", lp, fwd.lp_end);
    }

    #[test]
    fn pruned_posterior_profile_keeps_invariants() {
        let model = RateModel::test_identity_indel(0.1, 0.1);
        let fwd = pair_forward(&model, "ACGTACG", "ACGACG");
        let bwd = BackwardMatrix::new(&fwd);
        let prof = bwd.post_prob_profile(0.3, 0, "p", COLLAPSE_CHAINS);
        prof.assert_topological();
        prof.assert_seq_coords_consistent();
        prof.assert_all_states_wait_or_ready();
    }

    #[test]
    fn match_counts_on_forced_path() {
        let model = RateModel::test_identity();
        let fwd = pair_forward(&model, "ACG", "ACG");
        let bwd = BackwardMatrix::new(&fwd);
        let counts = bwd.counts(COUNT_INDEL_EVENTS | COUNT_SUBST_EVENTS);
        assert!((counts.mat[LEFT] - 3.0).abs() < 1e-9);
        assert!((counts.mat[RIGHT] - 3.0).abs() < 1e-9);
        assert!(counts.total_indel_events().abs() < 1e-9);
        // every absorbed symbol substitutes to itself
        let diag: f64 = (0..4).map(|a| counts.sub_count[LEFT][0][a][a]).sum();
        assert!((diag - 3.0).abs() < 1e-9);
    }
}
