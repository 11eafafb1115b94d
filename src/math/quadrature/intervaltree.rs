use std::cell::Cell;
use std::collections::{
    BTreeMap,
    BTreeSet
};

use ordered_float::OrderedFloat;
use serde::{
    Deserialize,
    Serialize
};
use tracing::{
    debug,
    warn
};

use super::clenshawcurtis::{
    slots,
    QuadratureRules,
    MIN_SEP,
    NDIV_MAX
};
use super::interval::{
    Interval,
    IntervalSnapshot
};
use crate::learner::learnererror::LearnerError;

type Key = OrderedFloat<f64>;

const ROOT: usize = 0;

fn default_max_ivals() -> usize {
    1000
}

fn default_max_points() -> usize {
    100_000
}

/// Halvings a finite interval survives before its width underflows.
fn default_max_rdepth() -> usize {
    (f64::MAX_EXP - f64::MIN_EXP) as usize + f64::MANTISSA_DIGITS as usize
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegratorSettings {
    pub bounds: (f64, f64),
    /// Relative tolerance on the integral.
    pub tol: f64,
    /// Active intervals kept; the one with the smallest error is dropped beyond this.
    #[serde(default = "default_max_ivals")]
    pub max_ivals: usize,
    /// Points consumed before an unconverged integral is declared divergent.
    #[serde(default = "default_max_points")]
    pub max_points: usize,
    /// Recursion depth beyond which a split is declared divergent.
    #[serde(default = "default_max_rdepth")]
    pub max_rdepth: usize,
}

impl IntegratorSettings {
    pub fn new(bounds: (f64, f64), tol: f64) -> IntegratorSettings {
        IntegratorSettings {
            bounds,
            tol,
            max_ivals: default_max_ivals(),
            max_points: default_max_points(),
            max_rdepth: default_max_rdepth(),
        }
    }

    pub fn validate(&self) -> Result<(), LearnerError> {
        LearnerError::check_bounds(self.bounds)?;
        LearnerError::check_tolerance(self.tol)
    }
}

/// New points produced by refining or splitting one interval, together
/// with the error of that interval at the time it was chosen.
#[derive(Debug, Clone)]
pub struct Expansion {
    pub points: Vec<f64>,
    pub priority: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// IntervalTree
// ─────────────────────────────────────────────────────────────────────────────
//
// 區間以 arena（Vec<Interval>）存放，父子關係以索引表示；分裂後的父區間
// 仍留在 arena 內，只是離開 active set。
//
// 資料流：
//   expand_next() 選出誤差最大的 active 區間 → 升階或分裂 → 回傳新的取樣點
//   tell(x, y)    把 y 交給所有需要 x 的區間 → 該區間某一階的點湊齊時計算
//
// 所有估計值只由「收到了哪些 (x, y)」決定，與到達順序無關；
// 總和每次都依 a 由小到大重新加總，因此也與完成順序無關。

pub struct IntervalTree {
    settings: IntegratorSettings,
    intervals: Vec<Interval>,
    started: bool,
    active: BTreeSet<usize>,
    priority_split: Vec<usize>,
    data: BTreeMap<Key, f64>,
    x_mapping: BTreeMap<Key, Vec<usize>>,
    unresolved: BTreeSet<Key>,
    removed: BTreeSet<usize>,
    diverged: Option<LearnerError>,
    version: u64,
    totals: Cell<Option<(u64, f64, f64)>>,
}

impl IntervalTree {
    pub fn new(settings: IntegratorSettings) -> Result<IntervalTree, LearnerError> {
        settings.validate()?;
        let (a, b) = settings.bounds;
        Ok(IntervalTree {
            settings,
            intervals: vec![Interval::new_root(a, b)],
            started: false,
            active: BTreeSet::new(),
            priority_split: Vec::new(),
            data: BTreeMap::new(),
            x_mapping: BTreeMap::new(),
            unresolved: BTreeSet::new(),
            removed: BTreeSet::new(),
            diverged: None,
            version: 0,
            totals: Cell::new(None),
        })
    }

    pub fn settings(&self) -> &IntegratorSettings {
        &self.settings
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn npoints(&self) -> usize {
        self.data.len()
    }

    pub fn interval_count(&self) -> usize {
        self.intervals.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_known(&self, x: f64) -> bool {
        self.data.contains_key(&OrderedFloat(x))
    }

    /// Whether some interval asked for `x`.
    pub fn is_requested(&self, x: f64) -> bool {
        self.x_mapping.contains_key(&OrderedFloat(x))
    }

    pub fn value(&self, x: f64) -> Option<f64> {
        self.data.get(&OrderedFloat(x)).copied()
    }

    // ── estimates ────────────────────────────────────────────────────────────

    /// Own error once settled, otherwise half of the parent's.
    pub fn err_of(&self, id: usize) -> f64 {
        let ival = &self.intervals[id];
        match (ival.own_err(), ival.parent()) {
            (Some(err), _) => err,
            (None, Some(parent)) => self.err_of(parent) / 2.0,
            (None, None) => f64::MAX,
        }
    }

    fn ndiv_of(&self, id: usize) -> usize {
        let mut ndiv = 0;
        let mut current = Some(id);
        while let Some(node) = current {
            if self.intervals[node].div() {
                ndiv += 1;
            }
            current = self.intervals[node].parent();
        }
        ndiv
    }

    /// Largest error among the intervals that need `x`.
    pub fn point_priority(&self, x: f64) -> f64 {
        self.x_mapping
            .get(&OrderedFloat(x))
            .map(|ids| ids.iter().map(|&id| self.err_of(id)).fold(0.0, f64::max))
            .unwrap_or(0.0)
    }

    fn snapshot(&self, id: usize) -> IntervalSnapshot {
        let ival = &self.intervals[id];
        IntervalSnapshot {
            a: ival.a(),
            b: ival.b(),
            depth: ival.depth(),
            depth_complete: ival.depth_complete(),
            rdepth: ival.rdepth(),
            ndiv: self.ndiv_of(id),
            igral: ival.igral(),
            err: self.err_of(id),
            converged: ival.is_converged(),
        }
    }

    fn collect_approximating(&self, id: usize, out: &mut Vec<usize>) -> bool {
        let ival = &self.intervals[id];
        if let Some([left, right]) = ival.children() {
            let mark = out.len();
            if self.collect_approximating(left, out) && self.collect_approximating(right, out) {
                return true;
            }
            out.truncate(mark);
        }
        if ival.is_settled() {
            out.push(id);
            true
        } else {
            false
        }
    }

    /// Deepest settled partition of the bounds, ordered by lower bound.
    /// Children replace their parent only once both have an estimate.
    pub fn approximating(&self) -> Vec<usize> {
        let mut out = Vec::new();
        if !self.collect_approximating(ROOT, &mut out) {
            out.clear();
        }
        out
    }

    pub fn approximating_intervals(&self) -> Vec<IntervalSnapshot> {
        self.approximating()
            .into_iter()
            .map(|id| self.snapshot(id))
            .collect()
    }

    fn totals(&self) -> (f64, f64) {
        if let Some((version, igral, err)) = self.totals.get() {
            if version == self.version {
                return (igral, err);
            }
        }
        let ids = self.approximating();
        let igral: f64 = ids.iter().map(|&id| self.intervals[id].igral()).sum();
        let err = if ids.is_empty() {
            f64::INFINITY
        } else {
            let err: f64 = ids.iter().map(|&id| self.err_of(id)).sum();
            if err > f64::MAX { f64::INFINITY } else { err }
        };
        self.totals.set(Some((self.version, igral, err)));
        (igral, err)
    }

    pub fn igral(&self) -> f64 {
        self.totals().0
    }

    pub fn err(&self) -> f64 {
        self.totals().1
    }

    /// Error held by intervals given up at machine resolution or dropped
    /// beyond `max_ivals`; refining elsewhere cannot remove it.
    pub fn err_excess(&self) -> f64 {
        self.approximating()
            .into_iter()
            .filter(|id| self.removed.contains(id))
            .map(|id| self.err_of(id))
            .sum()
    }

    pub fn done(&self) -> bool {
        let (igral, err) = self.totals();
        let target = igral.abs() * self.settings.tol;
        if err == 0.0 || err < target || (self.started && self.active.is_empty()) {
            return true;
        }
        let excess = self.err_excess();
        err - excess < target && target < excess
    }

    /// Remaining error above the requested accuracy.
    pub fn loss(&self) -> f64 {
        let (igral, err) = self.totals();
        (err - igral.abs() * self.settings.tol).max(0.0)
    }

    /// `loss` with each interval's error scaled by the share of its
    /// outstanding points that nobody has claimed. An interval whose
    /// missing points are all in `pending` no longer counts.
    pub fn loss_with_pending(&self, pending: &BTreeSet<OrderedFloat<f64>>) -> f64 {
        let (igral, err) = self.totals();
        let ids = self.approximating();
        if pending.is_empty() || ids.is_empty() {
            return (err - igral.abs() * self.settings.tol).max(0.0);
        }

        let err: f64 = ids
            .iter()
            .map(|&id| {
                let ival = &self.intervals[id];
                let (outstanding, claimed) = self
                    .unresolved
                    .range(OrderedFloat(ival.a())..=OrderedFloat(ival.b()))
                    .fold((0usize, 0usize), |(n, c), key| (n + 1, c + usize::from(pending.contains(key))));
                let unclaimed = if outstanding == 0 {
                    1.0
                } else {
                    (outstanding - claimed) as f64 / outstanding as f64
                };
                self.err_of(id) * unclaimed
            })
            .sum();
        let err = if err > f64::MAX { f64::INFINITY } else { err };
        (err - igral.abs() * self.settings.tol).max(0.0)
    }

    fn divergent(&self) -> LearnerError {
        let (igral, err) = self.totals();
        LearnerError::DivergentIntegral {
            points_consumed: self.data.len(),
            partial_integral: igral,
            partial_error: err,
        }
    }

    fn fail(&mut self) -> LearnerError {
        let error = self.divergent();
        warn!(%error, "integral declared divergent");
        self.diverged = Some(error.clone());
        error
    }

    // ── choosing ─────────────────────────────────────────────────────────────

    fn max_err_active(&self) -> Option<usize> {
        self.active.iter().copied().max_by(|&l, &r| {
            self.err_of(l)
                .total_cmp(&self.err_of(r))
                .then(self.intervals[l].a().total_cmp(&self.intervals[r].a()))
        })
    }

    fn min_err_active(&self) -> Option<usize> {
        self.active.iter().copied().min_by(|&l, &r| {
            self.err_of(l)
                .total_cmp(&self.err_of(r))
                .then(self.intervals[l].a().total_cmp(&self.intervals[r].a()))
        })
    }

    /// Node spacing below the float resolution at the nodes. Near zero the
    /// resolution bottoms out at the smallest normal number.
    fn is_too_small(&self, id: usize) -> bool {
        let points = self.intervals[id].points(self.intervals[id].depth());
        let n = points.len();
        let resolution = |x: f64| (x.abs() * MIN_SEP).max(f64::MIN_POSITIVE);
        points[1] - points[0] < resolution(points[0])
            || points[n - 1] - points[n - 2] < resolution(points[n - 2])
    }

    fn retire(&mut self, id: usize) {
        self.active.remove(&id);
        self.priority_split.retain(|&p| p != id);
    }

    /// Retires `id` without it having converged; its error stays in the
    /// total and counts towards `err_excess`.
    fn remove(&mut self, id: usize) {
        self.retire(id);
        self.removed.insert(id);
        self.version += 1;
    }

    /// Refines or splits the most promising interval and returns the points
    /// it still needs. `None` once no interval can be improved.
    pub fn expand_next(&mut self) -> Result<Option<Expansion>, LearnerError> {
        if let Some(error) = &self.diverged {
            return Err(error.clone());
        }
        if !self.started {
            self.started = true;
            let points = self.add_ival(ROOT)?;
            return Ok(Some(Expansion { points, priority: f64::INFINITY }));
        }

        let (id, force_split) = loop {
            if let Some(id) = self.priority_split.pop() {
                if self.active.contains(&id) && self.intervals[id].children().is_none() {
                    break (id, true);
                }
                continue;
            }
            match self.max_err_active() {
                Some(id) => break (id, false),
                None => return Ok(None),
            }
        };

        let priority = self.err_of(id);
        let points = if self.is_too_small(id) {
            debug!(a = self.intervals[id].a(), b = self.intervals[id].b(), "interval below machine resolution");
            self.remove(id);
            Vec::new()
        } else if force_split || !self.intervals[id].can_refine() {
            self.retire(id);
            let [left, right] = self.split(id)?;
            let mut points = self.add_ival(left)?;
            points.extend(self.add_ival(right)?);
            points
        } else {
            self.intervals[id].refine();
            self.version += 1;
            debug!(a = self.intervals[id].a(), b = self.intervals[id].b(), depth = self.intervals[id].depth(), "refine interval");
            self.add_ival(id)?
        };

        if self.active.len() > self.settings.max_ivals {
            if let Some(smallest) = self.min_err_active() {
                debug!(a = self.intervals[smallest].a(), "dropping interval beyond max_ivals");
                self.remove(smallest);
            }
        }

        Ok(Some(Expansion { points, priority }))
    }

    fn split(&mut self, id: usize) -> Result<[usize; 2], LearnerError> {
        let (a, b, m, rdepth) = {
            let ival = &self.intervals[id];
            (ival.a(), ival.b(), ival.midpoint(), ival.rdepth() + 1)
        };
        if rdepth > self.settings.max_rdepth {
            return Err(self.fail());
        }

        let left = self.intervals.len();
        self.intervals.push(Interval::new_child(a, m, rdepth, id));
        self.intervals.push(Interval::new_child(m, b, rdepth, id));
        self.intervals[id].set_children([left, left + 1]);
        self.version += 1;
        debug!(a, b, rdepth, "split interval");
        Ok([left, left + 1])
    }

    fn add_ival(&mut self, id: usize) -> Result<Vec<f64>, LearnerError> {
        self.active.insert(id);
        let depth = self.intervals[id].depth();
        let mut new_points = Vec::new();

        for slot in slots(depth) {
            let x = self.intervals[id].point(slot);
            let key = OrderedFloat(x);
            let ids = self.x_mapping.entry(key).or_default();
            if !ids.contains(&id) {
                ids.push(id);
            }
            if self.intervals[id].sample(slot).is_some() {
                continue;
            }
            if let Some(&y) = self.data.get(&key) {
                self.feed(id, slot, y)?;
            } else if self.unresolved.insert(key) {
                new_points.push(x);
            }
        }
        Ok(new_points)
    }

    // ── telling ──────────────────────────────────────────────────────────────

    /// Delivers `f(x) = y`. Every estimate is a function of the first value
    /// received for each x: telling the same value again is a no-op and a
    /// different one is rejected with `ConflictingValue`.
    pub fn tell(&mut self, x: f64, y: f64) -> Result<(), LearnerError> {
        if let Some(error) = &self.diverged {
            return Err(error.clone());
        }
        let key = OrderedFloat(x);
        let Some(ids) = self.x_mapping.get(&key) else {
            return Err(LearnerError::UnknownPoint(x));
        };
        let mut ids = ids.clone();

        if let Some(&old) = self.data.get(&key) {
            if old == y || (old.is_nan() && y.is_nan()) {
                return Ok(());
            }
            return Err(LearnerError::ConflictingValue { x, old, new: y });
        }

        self.data.insert(key, y);
        self.unresolved.remove(&key);
        self.version += 1;

        // 父區間先於子區間
        ids.sort_unstable();
        for id in ids {
            if let Some(slot) = self.intervals[id].slot_of(x) {
                if self.intervals[id].sample(slot).is_none() {
                    self.feed(id, slot, y)?;
                }
            }
        }

        if self.data.len() > self.settings.max_points && !self.done() {
            return Err(self.fail());
        }
        Ok(())
    }

    fn feed(&mut self, id: usize, slot: usize, y: f64) -> Result<(), LearnerError> {
        self.intervals[id].record(slot, y);
        self.version += 1;
        self.advance(id)
    }

    /// Processes every rule of `id` whose samples just became complete.
    fn advance(&mut self, id: usize) -> Result<(), LearnerError> {
        let (start, target, first) = {
            let ival = &self.intervals[id];
            let first = ival.first_depth();
            (ival.depth_complete().map_or(first, |d| d + 1), ival.depth(), first)
        };

        for depth in start..=target {
            if !self.intervals[id].is_depth_sampled(depth) {
                break;
            }
            let force_split = self.intervals[id].complete_depth(depth);
            self.version += 1;

            if force_split
                && self.active.contains(&id)
                && self.intervals[id].children().is_none()
                && !self.priority_split.contains(&id)
            {
                self.priority_split.push(id);
            }

            // 子區間的第一階需要父區間的最終係數
            if let Some(parent) = self.intervals[id].parent() {
                if depth == first && self.intervals[parent].is_final() {
                    self.compare_with_parent(id)?;
                }
            }
            if self.intervals[id].is_final() {
                if let Some(children) = self.intervals[id].children() {
                    for child in children {
                        if self.intervals[child].depth_complete().is_some() {
                            self.compare_with_parent(child)?;
                        }
                    }
                }
            }

            self.after_estimate(id);
        }
        Ok(())
    }

    fn compare_with_parent(&mut self, id: usize) -> Result<(), LearnerError> {
        let Some(parent) = self.intervals[id].parent() else {
            return Ok(());
        };
        if self.intervals[id].relative_done() {
            return Ok(());
        }
        let (coefs, parent_c00, left) = {
            let p = &self.intervals[parent];
            (p.coefs().cloned(), p.c00(), self.intervals[id].a() == p.a())
        };
        let Some(coefs) = coefs else {
            return Ok(());
        };

        let div = self.intervals[id].compare_with_parent(&coefs, parent_c00, left);
        self.version += 1;
        self.check_divergence(id, div)?;
        self.after_estimate(id);
        Ok(())
    }

    /// Checks the divergence counter of `id`, and of its whole subtree when
    /// its own count just went up.
    fn check_divergence(&mut self, id: usize, subtree: bool) -> Result<(), LearnerError> {
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            let ndiv = self.ndiv_of(node);
            if ndiv > NDIV_MAX && 2 * ndiv > self.intervals[node].rdepth() {
                return Err(self.fail());
            }
            if subtree {
                if let Some(children) = self.intervals[node].children() {
                    stack.extend(children);
                }
            }
        }
        Ok(())
    }

    /// Retires an active leaf whose error reached machine precision or its
    /// share of the requested tolerance.
    fn after_estimate(&mut self, id: usize) {
        let ival = &self.intervals[id];
        if !self.active.contains(&id) || ival.children().is_some() || !ival.is_settled() {
            return;
        }
        let Some(depth) = ival.depth_complete() else {
            return;
        };

        let err = self.err_of(id);
        let igral = ival.igral();
        let (a, b) = (ival.a(), ival.b());
        let (lower, upper) = self.settings.bounds;
        let share = self.settings.tol * self.igral().abs() * (b - a) / (upper - lower);

        if err < igral.abs() * f64::EPSILON * QuadratureRules::get().v_cond(depth) {
            debug!(a, b, err, "interval at machine precision");
            self.remove(id);
        } else if err <= share {
            debug!(a, b, err, share, "interval converged");
            self.intervals[id].mark_converged();
            self.retire(id);
        }
    }

    #[cfg(test)]
    pub(crate) fn interval(&self, id: usize) -> &Interval {
        &self.intervals[id]
    }
}
