//! Expected event counts accumulated under the pair-HMM posterior.
//!
//! These are the sufficient statistics an EM fitting loop consumes: expected
//! substitution pair counts per mixture component (parent symbol to child
//! symbol, per branch side), expected root symbol usage, and expected indel
//! event counts per branch side.

use serde::{Deserialize, Serialize};

pub const LEFT: usize = 0;
pub const RIGHT: usize = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCounts {
    pub components: usize,
    pub alph_size: usize,
    /// Expected root-symbol usage, per component and symbol.
    pub root_count: Vec<Vec<f64>>,
    /// Expected parent-to-child substitution pairs, per side, component,
    /// parent symbol and child symbol.
    pub sub_count: [Vec<Vec<Vec<f64>>>; 2],
    /// Expected indel events per side.
    pub ins_open: [f64; 2],
    pub ins_ext: [f64; 2],
    pub del_open: [f64; 2],
    pub del_ext: [f64; 2],
    /// Expected transmitted (non-deleted) symbols per side.
    pub mat: [f64; 2],
}

impl EventCounts {
    pub fn new(components: usize, alph_size: usize) -> Self {
        let zero_sub = vec![vec![vec![0.0; alph_size]; alph_size]; components];
        Self {
            components,
            alph_size,
            root_count: vec![vec![0.0; alph_size]; components],
            sub_count: [zero_sub.clone(), zero_sub],
            ins_open: [0.0; 2],
            ins_ext: [0.0; 2],
            del_open: [0.0; 2],
            del_ext: [0.0; 2],
            mat: [0.0; 2],
        }
    }

    /// Pool another node's counts into this one.
    pub fn merge(&mut self, other: &EventCounts) {
        assert_eq!(self.components, other.components);
        assert_eq!(self.alph_size, other.alph_size);
        for (a, b) in self.root_count.iter_mut().zip(other.root_count.iter()) {
            for (x, y) in a.iter_mut().zip(b.iter()) {
                *x += y;
            }
        }
        for side in 0..2 {
            for (cm, co) in self.sub_count[side].iter_mut().zip(other.sub_count[side].iter()) {
                for (rm, ro) in cm.iter_mut().zip(co.iter()) {
                    for (x, y) in rm.iter_mut().zip(ro.iter()) {
                        *x += y;
                    }
                }
            }
            self.ins_open[side] += other.ins_open[side];
            self.ins_ext[side] += other.ins_ext[side];
            self.del_open[side] += other.del_open[side];
            self.del_ext[side] += other.del_ext[side];
            self.mat[side] += other.mat[side];
        }
    }

    /// Total expected indel events (both sides).
    pub fn total_indel_events(&self) -> f64 {
        self.ins_open.iter().sum::<f64>() + self.del_open.iter().sum::<f64>()
    }
}
