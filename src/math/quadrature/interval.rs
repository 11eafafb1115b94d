use std::f64::consts::FRAC_1_SQRT_2;

use nalgebra::DVector;
use serde::{
    Deserialize,
    Serialize
};

use super::clenshawcurtis::{
    padded_distance,
    slots,
    QuadratureRules,
    HINT,
    MAX_DEPTH,
    NSLOTS
};

/// Depth the root interval starts at; children restart at depth 0.
pub const ROOT_DEPTH: usize = 2;

/// One node of the interval arena.
///
/// Samples are stored append-only in the 33-slot layout of the deepest rule,
/// so escalating the rule never discards an evaluation. Every estimate held
/// here is a function of the set of samples received, not of their order.
#[derive(Debug, Clone)]
pub struct Interval {
    a: f64,
    b: f64,
    /// Deepest rule requested so far.
    depth: usize,
    rdepth: usize,
    parent: Option<usize>,
    children: Option<[usize; 2]>,
    fx: [Option<f64>; NSLOTS],
    /// Deepest rule whose samples are all known and processed.
    depth_complete: Option<usize>,
    coefs: Option<DVector<f64>>,
    /// Leading coefficient of the first rule; zero for the root.
    c00: f64,
    igral: f64,
    /// Error from the difference between the two deepest processed rules.
    refine_err: Option<f64>,
    /// Error of the first rule against the parent's interpolant.
    relative_err: Option<f64>,
    relative_done: bool,
    div: bool,
    converged: bool,
}

impl Interval {
    pub fn new_root(a: f64, b: f64) -> Interval {
        Self::new(a, b, ROOT_DEPTH, 1, None)
    }

    pub fn new_child(a: f64, b: f64, rdepth: usize, parent: usize) -> Interval {
        Self::new(a, b, 0, rdepth, Some(parent))
    }

    fn new(a: f64, b: f64, depth: usize, rdepth: usize, parent: Option<usize>) -> Interval {
        Interval {
            a,
            b,
            depth,
            rdepth,
            parent,
            children: None,
            fx: [None; NSLOTS],
            depth_complete: None,
            coefs: None,
            c00: 0.0,
            igral: 0.0,
            refine_err: None,
            relative_err: None,
            relative_done: false,
            div: false,
            converged: false,
        }
    }

    pub fn a(&self) -> f64 {
        self.a
    }

    pub fn b(&self) -> f64 {
        self.b
    }

    pub fn width(&self) -> f64 {
        self.b - self.a
    }

    pub fn midpoint(&self) -> f64 {
        (self.a + self.b) / 2.0
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn rdepth(&self) -> usize {
        self.rdepth
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn children(&self) -> Option<[usize; 2]> {
        self.children
    }

    pub fn depth_complete(&self) -> Option<usize> {
        self.depth_complete
    }

    pub fn coefs(&self) -> Option<&DVector<f64>> {
        self.coefs.as_ref()
    }

    pub fn c00(&self) -> f64 {
        self.c00
    }

    pub fn igral(&self) -> f64 {
        self.igral
    }

    pub fn div(&self) -> bool {
        self.div
    }

    pub fn relative_done(&self) -> bool {
        self.relative_done
    }

    pub fn is_converged(&self) -> bool {
        self.converged
    }

    pub fn mark_converged(&mut self) {
        self.converged = true;
    }

    pub fn first_depth(&self) -> usize {
        if self.parent.is_some() { 0 } else { ROOT_DEPTH }
    }

    pub fn can_refine(&self) -> bool {
        self.depth < MAX_DEPTH
    }

    pub fn refine(&mut self) {
        self.depth += 1;
    }

    pub fn set_children(&mut self, children: [usize; 2]) {
        self.children = Some(children);
    }

    /// Split intervals keep their depth, so this is the rule the children
    /// are compared against.
    pub fn is_final(&self) -> bool {
        self.children.is_some() && self.depth_complete == Some(self.depth)
    }

    /// Has an integral and an error estimate of its own.
    pub fn is_settled(&self) -> bool {
        match self.parent {
            None => self.depth_complete.is_some(),
            Some(_) => self.depth_complete.is_some() && self.own_err().is_some(),
        }
    }

    pub fn own_err(&self) -> Option<f64> {
        self.refine_err
            .or(if self.relative_done { self.relative_err } else { None })
    }

    /// Location of `slot`; the endpoints and the centre are exact so that
    /// neighbours, parents and children share those samples bit for bit.
    pub fn point(&self, slot: usize) -> f64 {
        if slot == 0 {
            self.a
        } else if slot == NSLOTS - 1 {
            self.b
        } else {
            let rules = QuadratureRules::get();
            self.midpoint() + self.width() / 2.0 * rules.xi(slot)
        }
    }

    pub fn points(&self, depth: usize) -> Vec<f64> {
        slots(depth).map(|s| self.point(s)).collect()
    }

    pub fn slot_of(&self, x: f64) -> Option<usize> {
        slots(self.depth).find(|&s| self.point(s) == x)
    }

    pub fn sample(&self, slot: usize) -> Option<f64> {
        self.fx[slot]
    }

    pub fn record(&mut self, slot: usize, y: f64) {
        self.fx[slot] = Some(y);
    }

    pub fn is_depth_sampled(&self, depth: usize) -> bool {
        slots(depth).all(|s| self.fx[s].is_some())
    }

    fn samples(&self, depth: usize) -> Vec<f64> {
        slots(depth).map(|s| self.fx[s].unwrap_or(f64::NAN)).collect()
    }

    /// Processes the rule of `depth` once all its samples are known.
    /// Returns whether the refinement was poor enough to force a split.
    pub fn complete_depth(&mut self, depth: usize) -> bool {
        let rules = QuadratureRules::get();
        let c_new = rules.coefficients(depth, &self.samples(depth));
        self.igral = self.width() * c_new[0] * FRAC_1_SQRT_2;

        let mut force_split = false;
        if depth == self.first_depth() {
            self.c00 = if self.parent.is_some() { c_new[0] } else { 0.0 };
        } else if let Some(c_old) = &self.coefs {
            let c_diff = padded_distance(&c_new, c_old);
            self.refine_err = Some(self.width() * c_diff);
            force_split = c_diff > HINT * c_new.norm();
        }

        self.coefs = Some(c_new);
        self.depth_complete = Some(depth);
        force_split
    }

    /// Compares the first rule with the parent's final interpolant restricted
    /// to this half. Returns whether the leading coefficient more than
    /// doubled, which counts towards divergence.
    pub fn compare_with_parent(&mut self, parent_coefs: &DVector<f64>, parent_c00: f64, left: bool) -> bool {
        if self.relative_done {
            return self.div;
        }
        let rules = QuadratureRules::get();
        let c_old = rules.to_child(parent_coefs, left);

        // 已升階的區間以升階誤差為準
        if self.refine_err.is_none() {
            if let Some(c) = &self.coefs {
                self.relative_err = Some(self.width() * padded_distance(c, &c_old));
            }
        }

        self.div = parent_c00 != 0.0 && self.c00 / parent_c00 > 2.0;
        self.relative_done = true;
        self.div
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// IntervalSnapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Read-only view of an approximating interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalSnapshot {
    pub a: f64,
    pub b: f64,
    pub depth: usize,
    pub depth_complete: Option<usize>,
    pub rdepth: usize,
    pub ndiv: usize,
    pub igral: f64,
    pub err: f64,
    pub converged: bool,
}

fn close(lhs: f64, rhs: f64, atol: f64) -> bool {
    (lhs.is_nan() && rhs.is_nan()) || lhs == rhs || (lhs - rhs).abs() <= atol
}

/// Compares the numerically relevant fields of two snapshots: bounds,
/// completed depth, recursion depth, divergence count, integral and error.
pub fn equal_interval(lhs: &IntervalSnapshot, rhs: &IntervalSnapshot, atol: f64) -> bool {
    lhs.depth_complete.is_some()
        && lhs.depth_complete == rhs.depth_complete
        && lhs.rdepth == rhs.rdepth
        && lhs.ndiv == rhs.ndiv
        && close(lhs.a, rhs.a, atol)
        && close(lhs.b, rhs.b, atol)
        && close(lhs.igral, rhs.igral, atol)
        && close(lhs.err, rhs.err, atol)
}

/// Same as [`equal_interval`] over two partitions, in order of lower bound.
pub fn equal_intervals(lhs: &[IntervalSnapshot], rhs: &[IntervalSnapshot], atol: f64) -> bool {
    if lhs.len() != rhs.len() {
        return false;
    }
    let sorted = |ivals: &[IntervalSnapshot]| {
        let mut ivals = ivals.to_vec();
        ivals.sort_by(|l, r| l.a.total_cmp(&r.a));
        ivals
    };
    sorted(lhs)
        .iter()
        .zip(sorted(rhs).iter())
        .all(|(l, r)| equal_interval(l, r, atol))
}
