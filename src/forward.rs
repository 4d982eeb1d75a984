//! Pair-HMM Forward matrix over two child profiles, restricted to a guide
//! envelope, with stochastic and best tracebacks and profile construction.
//!
//! DP cells are `(x state, y state, pair-HMM state)` where the profile
//! coordinates rest at absorbing states (or START). Null transitions never
//! get their own cells: each run of null moves is folded into the absorption
//! (or END) that follows it on its own side, via precomputed null closures.
//! This counts every joint path exactly once.

use crate::alnpath::{self, AlignPath, RowIndex};
use crate::guide::GuideEnvelope;
use crate::logsum::{log_accum_exp, log_sum_exp, LOG_ZERO};
use crate::model::{HmmState, PairHmm, DP_STATES};
use crate::profile::{Profile, ProfileState, ProfileTransition, StateIndex, TransIndex};
use log::{debug, trace};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};

/// Bit flags controlling how a DP matrix is compressed into a profile.
pub type ProfilingStrategy = u32;
pub const COLLAPSE_CHAINS: ProfilingStrategy = 1;
pub const KEEP_GAPS_OPEN: ProfilingStrategy = 2;
pub const INCLUDE_BEST_TRACE: ProfilingStrategy = 4;
pub const COUNT_SUBST_EVENTS: ProfilingStrategy = 8;
pub const COUNT_INDEL_EVENTS: ProfilingStrategy = 16;

/// Coordinates of one DP cell. Lexicographic order is topological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellCoords {
    pub xpos: StateIndex,
    pub ypos: StateIndex,
    pub state: HmmState,
}

/// One specific route of a DP move: the null-transition hops preceding the
/// absorbing transition on each side. Sides that do not advance are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct MoveRoute {
    pub x_hops: Vec<TransIndex>,
    pub x_absorb: Option<TransIndex>,
    pub y_hops: Vec<TransIndex>,
    pub y_absorb: Option<TransIndex>,
}

/// A null route within one profile: hops from a resting state to `dest`.
#[derive(Debug, Clone)]
struct NullRoute {
    hops: Vec<TransIndex>,
    dest: StateIndex,
    lp: f64,
}

/// Null-path closure of one profile: for each resting state (START or an
/// absorbing state), every all-null route leaving it, plus reverse and
/// summed lookups.
struct Closure {
    /// Routes from each resting state, in deterministic DFS order.
    routes: Vec<Vec<NullRoute>>,
    /// `rev[u]`: (resting source, route index) pairs reaching `u`.
    rev: Vec<Vec<(StateIndex, usize)>>,
    /// `sum[p][u]`: log-sum over all null routes `p -> u`.
    sum: Vec<BTreeMap<StateIndex, f64>>,
    /// Resting states, ascending.
    resting: Vec<StateIndex>,
}

fn closure(prof: &Profile) -> Closure {
    let n = prof.states.len();
    let resting: Vec<StateIndex> = (0..n)
        .filter(|&s| s == 0 || !prof.states[s].is_null())
        .collect();
    let mut routes = vec![Vec::new(); n];
    for &p in &resting {
        let mut hops = Vec::new();
        collect_null_routes(prof, p, &mut hops, 0.0, &mut routes[p]);
    }
    let mut rev = vec![Vec::new(); n];
    let mut sum = vec![BTreeMap::new(); n];
    for &p in &resting {
        for (ri, route) in routes[p].iter().enumerate() {
            rev[route.dest].push((p, ri));
            let slot = sum[p].entry(route.dest).or_insert(LOG_ZERO);
            *slot = log_sum_exp(*slot, route.lp);
        }
    }
    Closure {
        routes,
        rev,
        sum,
        resting,
    }
}

fn collect_null_routes(
    prof: &Profile,
    u: StateIndex,
    hops: &mut Vec<TransIndex>,
    lp: f64,
    out: &mut Vec<NullRoute>,
) {
    out.push(NullRoute {
        hops: hops.clone(),
        dest: u,
        lp,
    });
    for &ti in &prof.states[u].null_out {
        let t = &prof.trans[ti];
        hops.push(ti);
        collect_null_routes(prof, t.dest, hops, lp + t.lp_trans, out);
        hops.pop();
    }
}

/// Everything the Forward and Backward recurrences share: the two
/// (branch-propagated) child profiles, the pair HMM, closures, emission
/// caches and the guide envelope.
pub(crate) struct DpCore {
    /// Left child profile, absorption tables already pushed through the
    /// left branch substitution matrix.
    pub x: Profile,
    pub y: Profile,
    pub hmm: PairHmm,
    pub parent_row: RowIndex,
    env: Option<GuideEnvelope>,
    x_clos: Closure,
    y_clos: Closure,
    /// Guide coordinate of each profile state (pivot-row residue count).
    x_coord: Vec<Option<usize>>,
    y_coord: Vec<Option<usize>>,
    /// Per-state one-sided emission weight (insertion or single absorption).
    emit_x: Vec<f64>,
    emit_y: Vec<f64>,
    /// Original (pre-branch-multiplication) absorption tables, needed when
    /// distributing posterior mass over child symbols for counts.
    x_abs0: Vec<Vec<Vec<f64>>>,
    y_abs0: Vec<Vec<Vec<f64>>>,
}

impl DpCore {
    fn new(
        x: &Profile,
        y: &Profile,
        hmm: PairHmm,
        parent_row: RowIndex,
        env: Option<GuideEnvelope>,
    ) -> Self {
        x.assert_all_states_wait_or_ready();
        y.assert_all_states_wait_or_ready();
        let xm = x.left_multiply(&hmm.l.log_sub);
        let ym = y.left_multiply(&hmm.r.log_sub);
        let x_clos = closure(&xm);
        let y_clos = closure(&ym);
        let x_coord = pivot_coords(&xm, env.as_ref().map(|e| e.row_x));
        let y_coord = pivot_coords(&ym, env.as_ref().map(|e| e.row_y));
        let emit_x = one_sided_emits(&xm, &hmm);
        let emit_y = one_sided_emits(&ym, &hmm);
        let x_abs0 = x.states.iter().map(|s| s.lp_absorb.clone()).collect();
        let y_abs0 = y.states.iter().map(|s| s.lp_absorb.clone()).collect();
        Self {
            x: xm,
            y: ym,
            hmm,
            parent_row,
            env,
            x_clos,
            y_clos,
            x_coord,
            y_coord,
            emit_x,
            emit_y,
            x_abs0,
            y_abs0,
        }
    }

    /// Original child absorption weight, log space.
    pub(crate) fn x_abs0(&self, state: StateIndex, cpt: usize, sym: usize) -> f64 {
        self.x_abs0[state][cpt][sym]
    }

    pub(crate) fn y_abs0(&self, state: StateIndex, cpt: usize, sym: usize) -> f64 {
        self.y_abs0[state][cpt][sym]
    }

    fn admissible(&self, xpos: StateIndex, ypos: StateIndex) -> bool {
        match (&self.env, self.x_coord[xpos], self.y_coord[ypos]) {
            (Some(env), Some(xc), Some(yc)) => env.admits(xc, yc),
            _ => true,
        }
    }

    /// Emission weight of a cell: component-mixed, root-weighted absorption.
    pub(crate) fn emit(&self, c: CellCoords) -> f64 {
        match c.state {
            HmmState::Imm => {
                let mut lp = LOG_ZERO;
                for (cpt, &w) in self.hmm.log_cpt_weight.iter().enumerate() {
                    let mut inner = LOG_ZERO;
                    for a in 0..self.x.alph_size {
                        log_accum_exp(
                            &mut inner,
                            self.hmm.log_root[cpt][a]
                                + self.x.states[c.xpos].lp_absorb[cpt][a]
                                + self.y.states[c.ypos].lp_absorb[cpt][a],
                        );
                    }
                    log_accum_exp(&mut lp, w + inner);
                }
                lp
            }
            HmmState::Imd | HmmState::Iiw => self.emit_x[c.xpos],
            HmmState::Idm | HmmState::Imi => self.emit_y[c.ypos],
            _ => 0.0,
        }
    }

    /// Enumerate every routed move into `dest`, calling
    /// `f(src, lp_without_emit, route)` for each. Enumeration order is fixed
    /// and part of the reproducibility contract.
    pub(crate) fn for_each_incoming<F: FnMut(CellCoords, f64, MoveRoute)>(
        &self,
        cells: &HashMap<CellCoords, f64>,
        dest: CellCoords,
        f: &mut F,
    ) {
        let sources = [
            HmmState::Sss,
            HmmState::Imm,
            HmmState::Imd,
            HmmState::Idm,
            HmmState::Iiw,
            HmmState::Imi,
        ];
        let adv_x = dest.state.advances_x();
        let adv_y = dest.state.advances_y();
        // Per-side (resting source, route, absorb transition, lp) options.
        let x_opts = self.side_options(&self.x, &self.x_clos, dest.xpos, adv_x);
        let y_opts = self.side_options(&self.y, &self.y_clos, dest.ypos, adv_y);
        for &(xp, ref xhops, xabs, xlp) in &x_opts {
            for &(yp, ref yhops, yabs, ylp) in &y_opts {
                for &s in &sources {
                    let lt = self.hmm.log_trans(s, dest.state);
                    if lt == LOG_ZERO {
                        continue;
                    }
                    let src = CellCoords {
                        xpos: xp,
                        ypos: yp,
                        state: s,
                    };
                    if !cells.contains_key(&src) {
                        continue;
                    }
                    f(
                        src,
                        lt + xlp + ylp,
                        MoveRoute {
                            x_hops: xhops.clone(),
                            x_absorb: xabs,
                            y_hops: yhops.clone(),
                            y_absorb: yabs,
                        },
                    );
                }
            }
        }
    }

    /// Route options for one side of a move: if the side advances, every
    /// (null run + absorbing transition) into `pos`; otherwise the parked
    /// coordinate itself.
    #[allow(clippy::type_complexity)]
    fn side_options(
        &self,
        prof: &Profile,
        clos: &Closure,
        pos: StateIndex,
        advances: bool,
    ) -> Vec<(StateIndex, Vec<TransIndex>, Option<TransIndex>, f64)> {
        if !advances {
            return vec![(pos, Vec::new(), None, 0.0)];
        }
        let mut opts = Vec::new();
        for &ti in &prof.states[pos].in_trans {
            let t = &prof.trans[ti];
            for &(p, ri) in &clos.rev[t.src] {
                let route = &clos.routes[p][ri];
                opts.push((p, route.hops.clone(), Some(ti), route.lp + t.lp_trans));
            }
        }
        opts
    }

    /// Every routed way of finishing from `cell`: null-close both sides to
    /// END and take the Eee transition.
    pub(crate) fn for_each_end_route<F: FnMut(f64, MoveRoute)>(&self, cell: CellCoords, f: &mut F) {
        let lt = self.hmm.log_trans(cell.state, HmmState::Eee);
        if lt == LOG_ZERO {
            return;
        }
        let x_end = self.x.end_index();
        let y_end = self.y.end_index();
        for xr in &self.x_clos.routes[cell.xpos] {
            if xr.dest != x_end {
                continue;
            }
            for yr in &self.y_clos.routes[cell.ypos] {
                if yr.dest != y_end {
                    continue;
                }
                f(
                    lt + xr.lp + yr.lp,
                    MoveRoute {
                        x_hops: xr.hops.clone(),
                        x_absorb: None,
                        y_hops: yr.hops.clone(),
                        y_absorb: None,
                    },
                );
            }
        }
    }

    /// Log-sum version of [`for_each_end_route`](Self::for_each_end_route).
    pub(crate) fn end_lp(&self, cell: CellCoords) -> f64 {
        let lt = self.hmm.log_trans(cell.state, HmmState::Eee);
        if lt == LOG_ZERO {
            return LOG_ZERO;
        }
        let xe = self.x_clos.sum[cell.xpos]
            .get(&self.x.end_index())
            .copied()
            .unwrap_or(LOG_ZERO);
        let ye = self.y_clos.sum[cell.ypos]
            .get(&self.y.end_index())
            .copied()
            .unwrap_or(LOG_ZERO);
        lt + xe + ye
    }

    pub(crate) fn start_cell(&self) -> CellCoords {
        CellCoords {
            xpos: 0,
            ypos: 0,
            state: HmmState::Sss,
        }
    }

    pub(crate) fn end_cell(&self) -> CellCoords {
        CellCoords {
            xpos: self.x.end_index(),
            ypos: self.y.end_index(),
            state: HmmState::Eee,
        }
    }

    /// Alignment-path fragment of the state a cell becomes: the advancing
    /// children's state paths, stacked under the ancestor row when the cell
    /// absorbs an ancestral symbol.
    pub(crate) fn state_path(&self, c: CellCoords) -> AlignPath {
        let mut path = AlignPath::new();
        if c.state.advances_x() {
            path = alnpath::union(&path, &self.x.states[c.xpos].path).expect("disjoint rows");
        }
        if c.state.advances_y() {
            path = alnpath::union(&path, &self.y.states[c.ypos].path).expect("disjoint rows");
        }
        if c.state.absorbs() {
            let cols = alnpath::columns(&path).expect("checked").max(1);
            let mut anc = vec![false; cols];
            anc[0] = true;
            let mut anc_path = AlignPath::new();
            anc_path.insert(self.parent_row, anc);
            path = alnpath::union(&path, &anc_path).expect("ancestor row is fresh");
        }
        path
    }

    /// Sequence coordinates of the state a cell becomes.
    pub(crate) fn state_coords(&self, c: CellCoords) -> BTreeMap<RowIndex, usize> {
        let mut coords = self.x.states[c.xpos].seq_coords.clone();
        for (&row, &coord) in self.y.states[c.ypos].seq_coords.iter() {
            coords.insert(row, coord);
        }
        coords
    }

    /// Alignment-path fragment carried by a move: the hop transition paths
    /// and hopped-through state paths of the x side, then the absorbing
    /// transition path, then the same for the y side.
    pub(crate) fn route_path(&self, route: &MoveRoute) -> AlignPath {
        let mut parts: Vec<AlignPath> = Vec::new();
        for &ti in &route.x_hops {
            let t = &self.x.trans[ti];
            parts.push(t.path.clone());
            parts.push(self.x.states[t.dest].path.clone());
        }
        if let Some(ti) = route.x_absorb {
            parts.push(self.x.trans[ti].path.clone());
        }
        for &ti in &route.y_hops {
            let t = &self.y.trans[ti];
            parts.push(t.path.clone());
            parts.push(self.y.states[t.dest].path.clone());
        }
        if let Some(ti) = route.y_absorb {
            parts.push(self.y.trans[ti].path.clone());
        }
        let refs: Vec<&AlignPath> = parts.iter().collect();
        alnpath::concat(&refs).expect("route paths are rectangular")
    }

    /// Log-probability carried by a move (HMM transition, hops, absorbing
    /// transitions, and the emission when the destination is a null cell,
    /// whose weight must ride on the incoming profile transition).
    pub(crate) fn edge_lp(&self, src_state: HmmState, dest: CellCoords, route: &MoveRoute) -> f64 {
        let mut lp = self.hmm.log_trans(src_state, dest.state);
        for &ti in &route.x_hops {
            lp += self.x.trans[ti].lp_trans;
        }
        if let Some(ti) = route.x_absorb {
            lp += self.x.trans[ti].lp_trans;
        }
        for &ti in &route.y_hops {
            lp += self.y.trans[ti].lp_trans;
        }
        if let Some(ti) = route.y_absorb {
            lp += self.y.trans[ti].lp_trans;
        }
        if matches!(dest.state, HmmState::Iiw | HmmState::Imi) {
            lp += self.emit(dest);
        }
        lp
    }
}

fn pivot_coords(prof: &Profile, row: Option<RowIndex>) -> Vec<Option<usize>> {
    match row {
        Some(row) => prof
            .states
            .iter()
            .map(|s| s.seq_coords.get(&row).copied())
            .collect(),
        None => vec![None; prof.states.len()],
    }
}

fn one_sided_emits(prof: &Profile, hmm: &PairHmm) -> Vec<f64> {
    prof.states
        .iter()
        .map(|st| {
            if st.is_null() {
                LOG_ZERO
            } else {
                let mut lp = LOG_ZERO;
                for (cpt, &w) in hmm.log_cpt_weight.iter().enumerate() {
                    let mut inner = LOG_ZERO;
                    for a in 0..prof.alph_size {
                        log_accum_exp(&mut inner, hmm.log_root[cpt][a] + st.lp_absorb[cpt][a]);
                    }
                    log_accum_exp(&mut lp, w + inner);
                }
                lp
            }
        })
        .collect()
}

pub struct ForwardMatrix {
    pub(crate) core: DpCore,
    pub(crate) cells: HashMap<CellCoords, f64>,
    /// Fill order: ascending (xpos, ypos, state).
    pub(crate) order: Vec<CellCoords>,
    pub lp_end: f64,
}

impl ForwardMatrix {
    /// Run the Forward recurrence. `env` restricts the admissible
    /// (x state, y state) pairs via guide coordinates; cells outside it are
    /// implicitly `-inf`.
    pub fn new(
        x: &Profile,
        y: &Profile,
        hmm: PairHmm,
        parent_row: RowIndex,
        env: Option<GuideEnvelope>,
    ) -> Self {
        let core = DpCore::new(x, y, hmm, parent_row, env);
        let mut cells: HashMap<CellCoords, f64> = HashMap::new();
        let mut order = Vec::new();
        let start = core.start_cell();
        cells.insert(start, 0.0);
        order.push(start);

        let x_rest = core.x_clos.resting.clone();
        let y_rest = core.y_clos.resting.clone();
        for &xi in &x_rest {
            for &yj in &y_rest {
                if !core.admissible(xi, yj) {
                    continue;
                }
                let x_abs = xi != 0;
                let y_abs = yj != 0;
                for &s in &DP_STATES {
                    let ok = match s {
                        HmmState::Imm => x_abs && y_abs,
                        HmmState::Imd | HmmState::Iiw => x_abs,
                        HmmState::Idm | HmmState::Imi => y_abs,
                        _ => false,
                    };
                    if !ok {
                        continue;
                    }
                    let dest = CellCoords {
                        xpos: xi,
                        ypos: yj,
                        state: s,
                    };
                    let mut lp = LOG_ZERO;
                    core.for_each_incoming(&cells, dest, &mut |src, mv, _route| {
                        log_accum_exp(&mut lp, cells[&src] + mv);
                    });
                    if lp > LOG_ZERO {
                        let lp = lp + core.emit(dest);
                        if lp > LOG_ZERO {
                            cells.insert(dest, lp);
                            order.push(dest);
                        }
                    }
                }
            }
        }

        let mut lp_end = LOG_ZERO;
        for c in &order {
            log_accum_exp(&mut lp_end, cells[c] + core.end_lp(*c));
        }
        debug!(
            "forward: {} cells, lp_end = {:.6}",
            order.len(),
            lp_end
        );
        Self {
            core,
            cells,
            order,
            lp_end,
        }
    }

    pub fn cell_count(&self) -> usize {
        self.order.len()
    }

    /// Viterbi-style traceback (maximal contribution at each step).
    pub(crate) fn best_trace(&self) -> Trace {
        self.trace_with(|options| {
            let mut best = 0;
            for (i, opt) in options.iter().enumerate() {
                if opt.0 > options[best].0 {
                    best = i;
                }
            }
            best
        })
    }

    /// Stochastic traceback: each step samples an option with probability
    /// proportional to its contribution.
    fn sample_trace<R: Rng>(&self, rng: &mut R) -> Trace {
        self.trace_with(|options| {
            let total = options
                .iter()
                .fold(LOG_ZERO, |acc, opt| log_sum_exp(acc, opt.0));
            let u: f64 = rng.gen::<f64>();
            let mut cum = 0.0;
            for (i, opt) in options.iter().enumerate() {
                cum += (opt.0 - total).exp();
                if u < cum {
                    return i;
                }
            }
            options.len() - 1
        })
    }

    /// Shared traceback skeleton: walk from END back to START, choosing one
    /// incoming option per step with `pick`.
    fn trace_with<F: FnMut(&[(f64, CellCoords, MoveRoute)]) -> usize>(
        &self,
        mut pick: F,
    ) -> Trace {
        assert!(
            self.lp_end > LOG_ZERO,
            "traceback on a zero-likelihood forward matrix"
        );
        let mut steps = Vec::new();
        // Last step: pick the cell the END move leaves from.
        let mut options: Vec<(f64, CellCoords, MoveRoute)> = Vec::new();
        for &c in &self.order {
            self.core.for_each_end_route(c, &mut |lp, route| {
                options.push((self.cells[&c] + lp, c, route));
            });
        }
        let picked = pick(&options);
        let (_, mut cur, route) = options.swap_remove(picked);
        steps.push(TraceStep {
            src: cur,
            dest: self.core.end_cell(),
            route,
        });
        while cur != self.core.start_cell() {
            let emit = self.core.emit(cur);
            let mut options: Vec<(f64, CellCoords, MoveRoute)> = Vec::new();
            self.core
                .for_each_incoming(&self.cells, cur, &mut |src, mv, route| {
                    options.push((self.cells[&src] + mv + emit, src, route));
                });
            debug_assert!(!options.is_empty(), "stranded traceback at {:?}", cur);
            let picked = pick(&options);
            let (_, src, route) = options.swap_remove(picked);
            steps.push(TraceStep {
                src,
                dest: cur,
                route,
            });
            cur = src;
        }
        steps.reverse();
        Trace { steps }
    }

    /// The Viterbi alignment of the two child profiles, including the
    /// ancestor row.
    pub fn best_align_path(&self) -> AlignPath {
        let trace = self.best_trace();
        let mut parts: Vec<AlignPath> = Vec::new();
        for step in &trace.steps {
            parts.push(self.core.route_path(&step.route));
            if step.dest != self.core.end_cell() {
                parts.push(self.core.state_path(step.dest));
            }
        }
        let refs: Vec<&AlignPath> = parts.iter().collect();
        alnpath::concat(&refs).expect("trace fragments are rectangular")
    }

    /// Profile containing exactly the Viterbi path.
    pub fn best_profile(&self, name: &str, strategy: ProfilingStrategy) -> Profile {
        let trace = self.best_trace();
        let mut included = IncludedCells::unlimited();
        let mut edges = EdgeSet::new();
        self.add_trace(&trace, &mut included, &mut edges);
        build_profile(&self.core, name, &included, &edges, strategy)
    }

    /// Draw `n_samples` stochastic tracebacks and assemble the union of the
    /// visited cells (capped at `state_limit`; 0 means unlimited) into a
    /// profile. With [`INCLUDE_BEST_TRACE`] the Viterbi path is included
    /// first, so a complete path always survives the cap.
    pub fn sample_profile<R: Rng>(
        &self,
        rng: &mut R,
        n_samples: usize,
        state_limit: usize,
        name: &str,
        strategy: ProfilingStrategy,
    ) -> Profile {
        let mut included = IncludedCells::capped(state_limit);
        let mut edges = EdgeSet::new();
        if strategy & INCLUDE_BEST_TRACE != 0 {
            let best = self.best_trace();
            self.add_trace(&best, &mut included, &mut edges);
        }
        for sample in 0..n_samples {
            let trace = self.sample_trace(rng);
            trace!("sample {}: {} steps", sample, trace.steps.len());
            self.add_trace(&trace, &mut included, &mut edges);
        }
        build_profile(&self.core, name, &included, &edges, strategy)
    }

    pub(crate) fn add_trace(&self, trace: &Trace, included: &mut IncludedCells, edges: &mut EdgeSet) {
        for step in &trace.steps {
            included.insert(step.src);
            included.insert(step.dest);
        }
        for step in &trace.steps {
            if included.contains(step.src) && included.contains(step.dest) {
                let lp = self.core.edge_lp(step.src.state, step.dest, &step.route);
                edges.insert(step.src, step.dest, step.route.clone(), lp);
            }
        }
    }
}

pub(crate) struct TraceStep {
    pub src: CellCoords,
    pub dest: CellCoords,
    pub route: MoveRoute,
}

pub(crate) struct Trace {
    pub steps: Vec<TraceStep>,
}

/// Cells chosen for a profile, in first-insertion order, optionally capped.
pub(crate) struct IncludedCells {
    order: Vec<CellCoords>,
    set: std::collections::HashSet<CellCoords>,
    limit: usize,
}

impl IncludedCells {
    pub fn unlimited() -> Self {
        Self::capped(0)
    }
    pub fn capped(limit: usize) -> Self {
        Self {
            order: Vec::new(),
            set: std::collections::HashSet::new(),
            limit,
        }
    }
    pub fn insert(&mut self, c: CellCoords) -> bool {
        if self.set.contains(&c) {
            return true;
        }
        if self.limit > 0 && self.order.len() >= self.limit {
            return false;
        }
        self.set.insert(c);
        self.order.push(c);
        true
    }
    pub fn contains(&self, c: CellCoords) -> bool {
        self.set.contains(&c)
    }
    pub fn len(&self) -> usize {
        self.order.len()
    }
}

/// Deduplicated profile edges keyed by (src, dest, route).
pub(crate) struct EdgeSet {
    map: BTreeMap<(CellCoords, CellCoords, MoveRoute), f64>,
}

impl EdgeSet {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }
    pub fn insert(&mut self, src: CellCoords, dest: CellCoords, route: MoveRoute, lp: f64) {
        self.map.insert((src, dest, route), lp);
    }
}

/// Assemble a profile from a set of DP cells and routed edges. Orphan states
/// are pruned, linear null chains optionally collapsed, and Wait/Ready twins
/// inserted so the result satisfies every profile invariant.
pub(crate) fn build_profile(
    core: &DpCore,
    name: &str,
    included: &IncludedCells,
    edges: &EdgeSet,
    strategy: ProfilingStrategy,
) -> Profile {
    // Interior cells, topologically sorted.
    let mut interior: Vec<CellCoords> = included
        .order
        .iter()
        .copied()
        .filter(|&c| c != core.start_cell() && c != core.end_cell())
        .collect();
    interior.sort_unstable();

    let mut index: HashMap<CellCoords, usize> = HashMap::new();
    index.insert(core.start_cell(), 0);
    for (k, &c) in interior.iter().enumerate() {
        index.insert(c, k + 1);
    }
    index.insert(core.end_cell(), interior.len() + 1);

    let mut states: Vec<BuildState> = Vec::with_capacity(interior.len() + 2);
    states.push(BuildState::start(core));
    for &c in &interior {
        states.push(BuildState::interior(core, c));
    }
    states.push(BuildState::end(core));

    let mut bedges: Vec<BuildEdge> = Vec::new();
    for ((src, dest, route), &lp) in edges.map.iter() {
        let (si, di) = match (index.get(src), index.get(dest)) {
            (Some(&s), Some(&d)) => (s, d),
            _ => continue,
        };
        bedges.push(BuildEdge {
            src: si,
            dest: di,
            lp,
            path: core.route_path(route),
            dead: false,
        });
    }

    prune_orphans(&mut states, &mut bedges);
    if strategy & COLLAPSE_CHAINS != 0 {
        collapse_chains(&mut states, &mut bedges, strategy & KEEP_GAPS_OPEN != 0);
    }

    // Renumber (pruning and collapsing leave holes) and emit the arena.
    let live: Vec<usize> = (0..states.len()).filter(|&s| !states[s].dead).collect();
    let renum: HashMap<usize, usize> = live.iter().enumerate().map(|(k, &s)| (s, k)).collect();
    let mut prof = Profile {
        name: name.to_string(),
        meta: BTreeMap::new(),
        alph_size: core.x.alph_size,
        components: core.x.components,
        states: Vec::with_capacity(live.len()),
        trans: Vec::new(),
        seqs: core
            .x
            .seqs
            .iter()
            .chain(core.y.seqs.iter())
            .map(|(&r, s)| (r, s.clone()))
            .collect(),
    };
    for &s in &live {
        let b = &states[s];
        prof.states.push(ProfileState {
            name: b.name.clone(),
            meta: BTreeMap::new(),
            lp_absorb: b.lp_absorb.clone(),
            path: b.path.clone(),
            seq_coords: b.seq_coords.clone(),
            in_trans: Vec::new(),
            null_out: Vec::new(),
            absorb_out: Vec::new(),
        });
    }
    let mut sorted_edges: Vec<&BuildEdge> = bedges.iter().filter(|e| !e.dead).collect();
    sorted_edges.sort_by_key(|e| (renum[&e.src], renum[&e.dest]));
    for e in sorted_edges {
        prof.trans.push(ProfileTransition {
            src: renum[&e.src],
            dest: renum[&e.dest],
            lp_trans: e.lp,
            path: e.path.clone(),
        });
    }
    prof.reindex();
    let prof = prof.add_ready_states();
    prof.assert_topological();
    prof.assert_seq_coords_consistent();
    prof.assert_all_states_wait_or_ready();
    prof
}

struct BuildState {
    name: String,
    lp_absorb: Vec<Vec<f64>>,
    path: AlignPath,
    seq_coords: BTreeMap<RowIndex, usize>,
    /// Insertion cells are kept out of chain collapsing with KeepGapsOpen.
    is_gap: bool,
    dead: bool,
}

impl BuildState {
    fn start(core: &DpCore) -> Self {
        Self {
            name: "START".to_string(),
            lp_absorb: Vec::new(),
            path: AlignPath::new(),
            seq_coords: core.state_coords(core.start_cell()),
            is_gap: false,
            dead: false,
        }
    }

    fn end(core: &DpCore) -> Self {
        Self {
            name: "END".to_string(),
            lp_absorb: Vec::new(),
            path: AlignPath::new(),
            seq_coords: core.state_coords(core.end_cell()),
            is_gap: false,
            dead: false,
        }
    }

    fn interior(core: &DpCore, c: CellCoords) -> Self {
        let lp_absorb = match c.state {
            HmmState::Imm => {
                let xa = &core.x.states[c.xpos].lp_absorb;
                let ya = &core.y.states[c.ypos].lp_absorb;
                xa.iter()
                    .zip(ya.iter())
                    .map(|(xr, yr)| xr.iter().zip(yr.iter()).map(|(&a, &b)| a + b).collect())
                    .collect()
            }
            HmmState::Imd => core.x.states[c.xpos].lp_absorb.clone(),
            HmmState::Idm => core.y.states[c.ypos].lp_absorb.clone(),
            _ => Vec::new(),
        };
        Self {
            name: format!("{:?}({},{})", c.state, c.xpos, c.ypos),
            lp_absorb,
            path: core.state_path(c),
            seq_coords: core.state_coords(c),
            is_gap: matches!(c.state, HmmState::Iiw | HmmState::Imi),
            dead: false,
        }
    }
}

struct BuildEdge {
    src: usize,
    dest: usize,
    lp: f64,
    path: AlignPath,
    dead: bool,
}

/// Iteratively drop interior states with no incoming or no outgoing edges.
fn prune_orphans(states: &mut [BuildState], edges: &mut Vec<BuildEdge>) {
    let n = states.len();
    loop {
        let mut n_in = vec![0usize; n];
        let mut n_out = vec![0usize; n];
        for e in edges.iter().filter(|e| !e.dead) {
            n_out[e.src] += 1;
            n_in[e.dest] += 1;
        }
        let mut changed = false;
        for s in 1..n - 1 {
            if !states[s].dead && (n_in[s] == 0 || n_out[s] == 0) {
                states[s].dead = true;
                changed = true;
            }
        }
        for e in edges.iter_mut() {
            if !e.dead && (states[e.src].dead || states[e.dest].dead) {
                e.dead = true;
            }
        }
        if !changed {
            return;
        }
    }
}

/// Splice out null states with exactly one incoming and one outgoing edge,
/// concatenating their paths onto the merged edge.
fn collapse_chains(states: &mut [BuildState], edges: &mut Vec<BuildEdge>, keep_gaps_open: bool) {
    loop {
        let n = states.len();
        let mut n_in = vec![0usize; n];
        let mut n_out = vec![0usize; n];
        let mut one_in = vec![usize::MAX; n];
        let mut one_out = vec![usize::MAX; n];
        for (ei, e) in edges.iter().enumerate().filter(|(_, e)| !e.dead) {
            n_out[e.src] += 1;
            n_in[e.dest] += 1;
            one_out[e.src] = ei;
            one_in[e.dest] = ei;
        }
        let mut victim = None;
        for s in 1..n - 1 {
            if states[s].dead || !states[s].lp_absorb.is_empty() {
                continue;
            }
            if keep_gaps_open && states[s].is_gap {
                continue;
            }
            if n_in[s] == 1 && n_out[s] == 1 {
                victim = Some(s);
                break;
            }
        }
        let s = match victim {
            Some(s) => s,
            None => return,
        };
        let (ein, eout) = (one_in[s], one_out[s]);
        let lp = edges[ein].lp + edges[eout].lp;
        let path = alnpath::concat(&[&edges[ein].path, &states[s].path, &edges[eout].path])
            .expect("chain paths are rectangular");
        let (src, dest) = (edges[ein].src, edges[eout].dest);
        edges[ein].dead = true;
        edges[eout].dead = true;
        states[s].dead = true;
        edges.push(BuildEdge {
            src,
            dest,
            lp,
            path,
            dead: false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PairHmm, ProbModel, RateModel};
    use crate::profile::Profile;
    use crate::seq::{Alphabet, FastSeq};
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256StarStar;

    fn pair_forward(model: &RateModel, xs: &str, ys: &str) -> ForwardMatrix {
        let alph = model.alphabet();
        let x = Profile::leaf(model.components(), &alph, &FastSeq::new("x", xs), 0);
        let y = Profile::leaf(model.components(), &alph, &FastSeq::new("y", ys), 1);
        let hmm = PairHmm::new(model, ProbModel::new(model, 1.0), ProbModel::new(model, 1.0));
        ForwardMatrix::new(&x, &y, hmm, 2, None)
    }

    /// Likelihood of a gapless n-column match under the identity model:
    /// only the ancestral length prior is left to pay for.
    fn perfect_match_lp(n: usize) -> f64 {
        let k = crate::model::FALLBACK_KAPPA;
        n as f64 * k.ln() + (1.0 - k).ln()
    }

    #[test]
    fn identical_sequences_align_perfectly() {
        let model = RateModel::test_identity();
        let fwd = pair_forward(&model, "AC", "AC");
        assert!(
            (fwd.lp_end - perfect_match_lp(2)).abs() < 1e-9,
            "lp_end = {}",
            fwd.lp_end
        );
        let path = fwd.best_align_path();
        assert_eq!(alnpath::columns(&path).unwrap(), 2);
        for bits in path.values() {
            assert!(bits.iter().all(|&b| b));
        }
    }

    #[test]
    fn insertion_costs_only_transitions() {
        let model = RateModel::test_identity_indel(0.05, 0.05);
        let fwd = pair_forward(&model, "AC", "AGC");
        assert!(fwd.lp_end > LOG_ZERO);
        let path = fwd.best_align_path();
        assert_eq!(alnpath::columns(&path).unwrap(), 3);
        // the y row has three residues, x and the ancestor keep two
        assert_eq!(alnpath::residues_in_row(&path[&1]), 3);
        assert_eq!(alnpath::residues_in_row(&path[&0]), 2);
    }

    #[test]
    fn empty_sequences_still_terminate() {
        let model = RateModel::test_identity();
        let fwd = pair_forward(&model, "", "");
        assert!((fwd.lp_end - perfect_match_lp(0)).abs() < 1e-9);
    }

    #[test]
    fn best_profile_reproduces_lp_end() {
        let model = RateModel::test_identity();
        let fwd = pair_forward(&model, "ACGT", "ACGT");
        let mut prof = fwd.best_profile("p", COLLAPSE_CHAINS);
        let lp = prof.calc_sum_path_absorb_probs(
            &model.log_cpt_weight(),
            &model.log_ins_prob(),
            None,
        );
        assert!((lp - fwd.lp_end).abs() < 1e-6, "{} vs {}", lp, fwd.lp_end);
    }

    #[test]
    fn sampled_profile_satisfies_invariants() {
        let model = RateModel::test_identity_indel(0.08, 0.08);
        let fwd = pair_forward(&model, "ACGTAC", "ACTAC");
        let mut rng = Xoshiro256StarStar::seed_from_u64(42);
        let prof = fwd.sample_profile(
            &mut rng,
            10,
            0,
            "p",
            COLLAPSE_CHAINS | INCLUDE_BEST_TRACE,
        );
        prof.assert_topological();
        prof.assert_seq_coords_consistent();
        prof.assert_all_states_wait_or_ready();
        assert!(prof.size() >= 4);
    }

    #[test]
    fn sampling_is_deterministic_for_a_seed() {
        let model = RateModel::test_identity_indel(0.08, 0.08);
        let fwd = pair_forward(&model, "ACGTACGT", "ACGACGT");
        let mut rng1 = Xoshiro256StarStar::seed_from_u64(7);
        let mut rng2 = Xoshiro256StarStar::seed_from_u64(7);
        let p1 = fwd.sample_profile(&mut rng1, 5, 0, "p", COLLAPSE_CHAINS);
        let p2 = fwd.sample_profile(&mut rng2, 5, 0, "p", COLLAPSE_CHAINS);
        assert_eq!(p1, p2);
    }

    /// "AC" profile with a parallel null detour A1 -> W -> C2 next to the
    /// direct A1 -> C2 edge, leaving A1 with both null and absorbing outputs.
    fn mixed_profile(alph: &Alphabet) -> Profile {
        let leaf = Profile::leaf(1, alph, &FastSeq::new("x", "AC"), 0);
        let mut states = leaf.states.clone(); // [START, A1, C2, END]
        let mut w = crate::profile::ProfileState::default();
        w.name = "W".to_string();
        w.seq_coords.insert(0, 1);
        states.insert(2, w); // [START, A1, W, C2, END]
        let trans = vec![
            ProfileTransition::new(0, 1, 0.0),
            ProfileTransition::new(1, 3, 0.5f64.ln()),
            ProfileTransition::new(1, 2, 0.5f64.ln()),
            ProfileTransition::new(2, 3, 0.0),
            ProfileTransition::new(3, 4, 0.0),
        ];
        let mut p = Profile {
            name: "mixed".to_string(),
            meta: BTreeMap::new(),
            alph_size: alph.size(),
            components: 1,
            states,
            trans,
            seqs: leaf.seqs.clone(),
        };
        p.reindex();
        p.assert_seq_coords_consistent();
        p
    }

    #[test]
    fn ready_state_split_preserves_lp_end() {
        let model = RateModel::test_identity();
        let alph = model.alphabet();
        let mixed = mixed_profile(&alph);
        assert!(!mixed.states[1].is_ready() && !mixed.states[1].is_wait());
        let split = mixed.add_ready_states();
        assert_eq!(split.size(), mixed.size() + 1);

        // hand-split equivalent: A1 keeps the null outputs (detour plus a
        // unit edge to its Ready twin), the twin takes the absorbing edge
        let mut states = mixed.states.clone();
        let mut twin = crate::profile::ProfileState::default();
        twin.name = "A1.".to_string();
        twin.seq_coords.insert(0, 1);
        states.insert(2, twin); // [START, A1, twin, W, C2, END]
        let trans = vec![
            ProfileTransition::new(0, 1, 0.0),
            ProfileTransition::new(1, 2, 0.0),
            ProfileTransition::new(1, 3, 0.5f64.ln()),
            ProfileTransition::new(2, 4, 0.5f64.ln()),
            ProfileTransition::new(3, 4, 0.0),
            ProfileTransition::new(4, 5, 0.0),
        ];
        let mut hand = Profile {
            name: "hand".to_string(),
            meta: BTreeMap::new(),
            alph_size: alph.size(),
            components: 1,
            states,
            trans,
            seqs: mixed.seqs.clone(),
        };
        hand.reindex();
        hand.assert_all_states_wait_or_ready();

        let y = Profile::leaf(1, &alph, &FastSeq::new("y", "AC"), 1);
        let hmm = || {
            PairHmm::new(
                &model,
                ProbModel::new(&model, 1.0),
                ProbModel::new(&model, 1.0),
            )
        };
        let fwd_split = ForwardMatrix::new(&split, &y, hmm(), 2, None);
        let fwd_hand = ForwardMatrix::new(&hand, &y, hmm(), 2, None);
        // the detour halves and the direct edge halves sum back to one, so
        // only the length prior remains
        assert!(
            (fwd_split.lp_end - perfect_match_lp(2)).abs() < 1e-9,
            "{}",
            fwd_split.lp_end
        );
        assert!((fwd_split.lp_end - fwd_hand.lp_end).abs() < 1e-9);
    }

    #[test]
    fn state_limit_caps_profile_size() {
        let model = RateModel::test_identity_indel(0.1, 0.1);
        let fwd = pair_forward(&model, "ACGTACGTAC", "ACGTCGTAC");
        let mut rng = Xoshiro256StarStar::seed_from_u64(11);
        // the Viterbi trace occupies ~12 cells; leave room for it but not
        // for every sampled detour
        let limit = 14;
        let capped = fwd.sample_profile(&mut rng, 20, limit, "p", INCLUDE_BEST_TRACE);
        // at most `limit` cells survive; Wait/Ready twins at worst double that
        assert!(capped.size() <= 2 * limit, "size = {}", capped.size());
        assert!(capped.size() >= 6);
        capped.assert_all_states_wait_or_ready();
    }
}
