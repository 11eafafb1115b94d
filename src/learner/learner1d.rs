use std::collections::{
    BTreeMap,
    BTreeSet,
    BinaryHeap
};
use std::ops::Bound::{
    Excluded,
    Included,
    Unbounded
};
use std::sync::Arc;

use ordered_float::OrderedFloat;
use serde::{
    Deserialize,
    Serialize
};
use tracing::trace;

use super::learner::Learner;
use super::learnererror::LearnerError;
use super::losscache::LossCache;
use super::lossfunction::{
    LossFunctionType,
    LossScale
};
use crate::math::curve::curve::Curve;
use crate::math::curve::nonparametriccurve::{
    NonparametricCurve,
    Point2D
};

type Key = OrderedFloat<f64>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learner1DSettings {
    pub bounds: (f64, f64),
    #[serde(default)]
    pub loss: LossFunctionType,
}

// ─────────────────────────────────────────────
// GapCandidate
// ─────────────────────────────────────────────

/// Heap entry used while distributing one `ask` batch over the gaps.
/// Ordered by provisional loss, then by width.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct GapCandidate {
    loss: OrderedFloat<f64>,
    width: OrderedFloat<f64>,
    index: usize,
}

struct Gap {
    lhs_x: f64,
    rhs_x: f64,
    loss: f64,
}

// ─────────────────────────────────────────────
// Learner1D
// ─────────────────────────────────────────────

/// Samples a scalar function on an interval, greedily bisecting the gaps
/// with the largest loss.
#[derive(Clone)]
pub struct Learner1D {
    bounds: (f64, f64),
    loss_function: LossFunctionType,
    function: Option<Arc<dyn Fn(f64) -> f64 + Send + Sync>>,
    data: BTreeMap<Key, f64>,
    pending: BTreeSet<Key>,
    /// Loss of every gap between two neighbouring real points.
    losses: BTreeMap<(Key, Key), f64>,
    /// y-range the stored losses were computed with.
    loss_y_range: f64,
    version: u64,
    loss_cache: LossCache<bool>,
}

impl Learner1D {
    pub fn new(bounds: (f64, f64)) -> Result<Learner1D, LearnerError> {
        Self::with_loss(bounds, LossFunctionType::Default)
    }

    pub fn with_loss(
        bounds: (f64, f64),
        loss_function: LossFunctionType,
    ) -> Result<Learner1D, LearnerError> {
        LearnerError::check_bounds(bounds)?;
        Ok(Learner1D {
            bounds,
            loss_function,
            function: None,
            data: BTreeMap::new(),
            pending: BTreeSet::new(),
            losses: BTreeMap::new(),
            loss_y_range: 0.0,
            version: 0,
            loss_cache: LossCache::new(),
        })
    }

    pub fn from_settings(settings: &Learner1DSettings) -> Result<Learner1D, LearnerError> {
        Self::with_loss(settings.bounds, settings.loss)
    }

    /// Attaches the sampled function. It is only stored for the caller's
    /// convenience; the learner never evaluates it.
    pub fn with_function(mut self, function: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Learner1D {
        self.function = Some(Arc::new(function));
        self
    }

    pub fn function(&self) -> Option<&Arc<dyn Fn(f64) -> f64 + Send + Sync>> {
        self.function.as_ref()
    }

    pub fn bounds(&self) -> (f64, f64) {
        self.bounds
    }

    pub fn loss_function(&self) -> LossFunctionType {
        self.loss_function
    }

    pub fn pending_points(&self) -> Vec<f64> {
        self.pending.iter().map(|k| k.0).collect()
    }

    fn check_point(&self, x: f64, y: f64) -> Result<Key, LearnerError> {
        if !x.is_finite() || !y.is_finite() {
            return Err(LearnerError::NonFiniteInput { x, y });
        }
        let (a, b) = self.bounds;
        if x < a || x > b {
            return Err(LearnerError::OutOfBounds { x, bounds: self.bounds });
        }
        Ok(OrderedFloat(x))
    }

    fn observed_y_range(&self) -> f64 {
        let mut values = self.data.values();
        let Some(&first) = values.next() else {
            return 0.0;
        };
        let (min, max) = values.fold((first, first), |(lo, hi), &y| (lo.min(y), hi.max(y)));
        max - min
    }

    fn scale(&self) -> LossScale {
        LossScale::new(self.bounds.1 - self.bounds.0, self.loss_y_range)
    }

    fn gap_loss(&self, lhs: Key, rhs: Key) -> f64 {
        let scale = self.scale();
        self.loss_function.gap_loss(
            &Point2D::new(lhs.0, self.data[&lhs]),
            &Point2D::new(rhs.0, self.data[&rhs]),
            &scale,
        )
    }

    fn recompute_losses(&mut self) {
        let keys: Vec<Key> = self.data.keys().copied().collect();
        self.losses = keys
            .windows(2)
            .map(|w| ((w[0], w[1]), self.gap_loss(w[0], w[1])))
            .collect();
    }

    fn update_neighbour_losses(&mut self, key: Key) {
        let lhs = self.data.range(..key).next_back().map(|(k, _)| *k);
        let rhs = self.data.range((Excluded(key), Unbounded)).next().map(|(k, _)| *k);

        if let (Some(l), Some(r)) = (lhs, rhs) {
            self.losses.remove(&(l, r));
        }
        if let Some(l) = lhs {
            let loss = self.gap_loss(l, key);
            self.losses.insert((l, key), loss);
        }
        if let Some(r) = rhs {
            let loss = self.gap_loss(key, r);
            self.losses.insert((key, r), loss);
        }
    }

    /// Rescales every gap when the y-range moved by more than a factor two,
    /// otherwise only the gaps around `key` are refreshed.
    fn update_losses(&mut self, key: Key) {
        let y_range = self.observed_y_range();
        let stale = if self.loss_y_range == 0.0 {
            y_range > 0.0
        } else {
            y_range > 2.0 * self.loss_y_range || y_range < 0.5 * self.loss_y_range
        };

        if stale {
            trace!(old = self.loss_y_range, new = y_range, "rescaling all gap losses");
            self.loss_y_range = y_range;
            self.recompute_losses();
        } else {
            self.update_neighbour_losses(key);
        }
    }

    /// Loss of the gap `[lhs, rhs]` between neighbouring real or pending
    /// points, interpolated from the real gap enclosing it. Gaps not
    /// enclosed by two real points are infinitely interesting.
    fn interpolated_loss(&self, lhs: f64, rhs: f64) -> f64 {
        let real_lhs = self.data.range(..=OrderedFloat(lhs)).next_back().map(|(k, _)| *k);
        let real_rhs = self
            .data
            .range((Included(OrderedFloat(rhs)), Unbounded))
            .next()
            .map(|(k, _)| *k);

        match (real_lhs, real_rhs) {
            (Some(l), Some(r)) if l < r => match self.losses.get(&(l, r)) {
                Some(loss) => loss * (rhs - lhs) / (r.0 - l.0),
                None => f64::INFINITY,
            },
            _ => f64::INFINITY,
        }
    }

    fn combined_gaps(&self, extra: &[f64]) -> Vec<Gap> {
        let xs: BTreeSet<Key> = self
            .data
            .keys()
            .chain(self.pending.iter())
            .copied()
            .chain(extra.iter().map(|&x| OrderedFloat(x)))
            .collect();
        let xs: Vec<f64> = xs.into_iter().map(|k| k.0).collect();

        xs.windows(2)
            .map(|w| Gap {
                lhs_x: w[0],
                rhs_x: w[1],
                loss: self.interpolated_loss(w[0], w[1]),
            })
            .collect()
    }

    fn max_or_infinite(values: impl Iterator<Item = f64>) -> f64 {
        values
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |m| m.max(v))))
            .unwrap_or(f64::INFINITY)
    }

    fn compute_loss(&self, real: bool) -> f64 {
        if real {
            Self::max_or_infinite(self.losses.values().copied())
        } else {
            Self::max_or_infinite(self.combined_gaps(&[]).iter().map(|g| g.loss))
        }
    }

    fn is_known(&self, key: &Key) -> bool {
        self.data.contains_key(key) || self.pending.contains(key)
    }
}

impl Learner for Learner1D {
    type Point = f64;

    fn ask(&mut self, n: usize) -> Result<(Vec<f64>, Vec<f64>), LearnerError> {
        let mut points = Vec::with_capacity(n);
        let mut improvements = Vec::with_capacity(n);

        // 端點優先
        for bound in [self.bounds.0, self.bounds.1] {
            if points.len() < n && !self.is_known(&OrderedFloat(bound)) {
                points.push(bound);
                improvements.push(f64::INFINITY);
            }
        }

        let remaining = n - points.len();
        if remaining > 0 {
            let gaps = self.combined_gaps(&points);
            let mut pieces = vec![1_usize; gaps.len()];
            let mut heap: BinaryHeap<GapCandidate> = gaps
                .iter()
                .enumerate()
                .map(|(index, gap)| GapCandidate {
                    loss: OrderedFloat(gap.loss),
                    width: OrderedFloat(gap.rhs_x - gap.lhs_x),
                    index,
                })
                .collect();

            // 每次取出目前最大的 gap，假設它多切一刀後重新估計
            for _ in 0..remaining {
                let Some(top) = heap.pop() else {
                    break;
                };
                let gap = &gaps[top.index];
                pieces[top.index] += 1;
                let k = pieces[top.index] as f64;
                heap.push(GapCandidate {
                    loss: OrderedFloat(gap.loss / k),
                    width: OrderedFloat((gap.rhs_x - gap.lhs_x) / k),
                    index: top.index,
                });
            }

            for (gap, &k) in gaps.iter().zip(pieces.iter()) {
                let width = gap.rhs_x - gap.lhs_x;
                for j in 1..k {
                    let x = gap.lhs_x + width * (j as f64) / (k as f64);
                    if !self.is_known(&OrderedFloat(x)) {
                        points.push(x);
                        improvements.push(gap.loss / k as f64);
                    }
                }
            }
        }

        if !points.is_empty() {
            self.pending.extend(points.iter().map(|&x| OrderedFloat(x)));
            self.version += 1;
        }
        Ok((points, improvements))
    }

    fn tell(&mut self, x: f64, y: f64) -> Result<(), LearnerError> {
        let key = self.check_point(x, y)?;
        self.pending.remove(&key);
        self.data.insert(key, y);
        self.update_losses(key);
        self.version += 1;
        Ok(())
    }

    fn tell_pending(&mut self, x: f64) -> Result<(), LearnerError> {
        let key = self.check_point(x, 0.0)?;
        if self.data.contains_key(&key) {
            return Ok(());
        }
        if self.pending.insert(key) {
            self.version += 1;
        }
        Ok(())
    }

    fn forget_pending(&mut self, x: f64) -> Result<(), LearnerError> {
        if self.pending.remove(&OrderedFloat(x)) {
            self.version += 1;
        }
        Ok(())
    }

    fn loss(&self, real: bool) -> f64 {
        self.loss_cache
            .get_or_compute(real, self.version, || self.compute_loss(real))
    }

    fn npoints(&self) -> usize {
        self.data.len()
    }

    fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn version(&self) -> u64 {
        self.version
    }
}

// ─────────────────────────────────────────────
// Trait 實作
// ─────────────────────────────────────────────

impl NonparametricCurve for Learner1D {
    fn points(&self) -> Vec<Point2D> {
        self.data
            .iter()
            .map(|(x, &y)| Point2D::new(x.0, y))
            .collect()
    }

    fn min_x(&self) -> f64 {
        self.data.keys().next().map_or(self.bounds.0, |k| k.0)
    }

    fn max_x(&self) -> f64 {
        self.data.keys().next_back().map_or(self.bounds.1, |k| k.0)
    }
}

impl Learner1D {
    fn segment(&self, x: f64) -> Option<(Point2D, Point2D)> {
        let key = OrderedFloat(x);
        let lhs = self.data.range(..=key).next_back();
        let rhs = self.data.range((Excluded(key), Unbounded)).next();
        match (lhs, rhs) {
            (Some((l, &ly)), Some((r, &ry))) => Some((Point2D::new(l.0, ly), Point2D::new(r.0, ry))),
            (Some((l, &ly)), None) if l.0 == x => {
                let (p, &py) = self.data.range(..key).next_back()?;
                Some((Point2D::new(p.0, py), Point2D::new(l.0, ly)))
            }
            _ => None,
        }
    }
}

/// Piecewise-linear reading of the real samples; NaN outside the sampled range.
impl Curve for Learner1D {
    fn value(&self, x: f64) -> f64 {
        if let Some(&y) = self.data.get(&OrderedFloat(x)) {
            return y;
        }
        self.segment(x)
            .map_or(f64::NAN, |(lhs, rhs)| Point2D::interpolate(&lhs, &rhs, x))
    }

    fn derivative(&self, x: f64) -> f64 {
        self.segment(x)
            .map_or(f64::NAN, |(lhs, rhs)| Point2D::slope(&lhs, &rhs))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn mixed_learner() -> Learner1D {
        let mut learner = Learner1D::new((-1.0, 1.0)).unwrap().with_function(|x| x);
        learner.tell(-1.0, -1.0).unwrap();
        learner.tell(1.0, 1.0).unwrap();
        learner.tell_pending(0.0).unwrap();
        learner
    }

    #[test]
    fn pending_points_discount_the_combined_loss() {
        let learner = mixed_learner();
        assert_abs_diff_eq!(learner.loss(true), 2.0_f64.sqrt(), epsilon = 1e-15);
        assert_abs_diff_eq!(learner.loss(false), 2.0_f64.sqrt() / 2.0, epsilon = 1e-15);
    }

    #[test]
    fn loss_flavours_do_not_depend_on_query_order() {
        let first = mixed_learner();
        let real_then_pending = (first.loss(true), first.loss(false));

        let second = mixed_learner();
        let pending = second.loss(false);
        let real = second.loss(true);

        assert_eq!(real_then_pending, (real, pending));
    }

    #[test]
    fn fresh_learner_asks_bounds_first() {
        let mut learner = Learner1D::new((0.0, 4.0)).unwrap();
        assert_eq!(learner.loss(false), f64::INFINITY);

        let (points, improvements) = learner.ask(3).unwrap();
        assert_eq!(points, vec![0.0, 4.0, 2.0]);
        assert!(improvements.iter().all(|l| l.is_infinite()));
        assert_eq!(learner.pending_count(), 3);
    }

    #[test]
    fn one_batch_spreads_over_a_gap() {
        let mut learner = Learner1D::new((0.0, 1.0)).unwrap();
        learner.tell(0.0, 0.0).unwrap();
        learner.tell(1.0, 1.0).unwrap();

        let (mut points, improvements) = learner.ask(3).unwrap();
        points.sort_by(f64::total_cmp);
        assert_eq!(points, vec![0.25, 0.5, 0.75]);
        let expected = 2.0_f64.sqrt() / 4.0;
        for loss in improvements {
            assert_abs_diff_eq!(loss, expected, epsilon = 1e-15);
        }
    }

    #[test]
    fn repeated_asks_never_repeat_a_pending_point() {
        let mut learner = Learner1D::new((0.0, 1.0)).unwrap();
        let mut seen = BTreeSet::new();
        for _ in 0..20 {
            let (points, _) = learner.ask(1).unwrap();
            assert_eq!(points.len(), 1);
            assert!(seen.insert(OrderedFloat(points[0])));
        }
        assert_eq!(learner.pending_count(), 20);
    }

    #[test]
    fn tell_updates_neighbour_gaps() {
        let mut learner = Learner1D::new((0.0, 2.0)).unwrap();
        for (x, y) in [(0.0, 0.0), (2.0, 2.0), (1.0, 1.0)] {
            learner.tell(x, y).unwrap();
        }
        assert_eq!(learner.losses.len(), 2);
        assert!(learner.losses.contains_key(&(OrderedFloat(0.0), OrderedFloat(1.0))));
        assert!(learner.losses.contains_key(&(OrderedFloat(1.0), OrderedFloat(2.0))));
    }

    #[test]
    fn duplicate_tell_overwrites() {
        let mut learner = Learner1D::new((0.0, 1.0)).unwrap();
        learner.tell(0.0, 0.0).unwrap();
        learner.tell(1.0, 1.0).unwrap();
        learner.tell(1.0, 3.0).unwrap();
        assert_eq!(learner.npoints(), 2);
        assert_eq!(learner.value(1.0), 3.0);
    }

    #[test]
    fn invalid_input_leaves_state_untouched() {
        let mut learner = Learner1D::new((0.0, 1.0)).unwrap();
        let version = learner.version();
        assert!(matches!(learner.tell(2.0, 0.0), Err(LearnerError::OutOfBounds { .. })));
        assert!(matches!(learner.tell(0.5, f64::NAN), Err(LearnerError::NonFiniteInput { .. })));
        assert!(learner.tell_pending(-0.5).is_err());
        assert_eq!(learner.version(), version);
        assert_eq!(learner.npoints(), 0);
        assert!(Learner1D::new((1.0, 0.0)).is_err());
    }

    #[test]
    fn forgetting_a_pending_point_restores_the_loss() {
        let mut learner = mixed_learner();
        learner.forget_pending(0.0).unwrap();
        assert_eq!(learner.loss(false), learner.loss(true));
        assert_eq!(learner.pending_count(), 0);
    }

    #[test]
    fn reads_back_as_a_piecewise_linear_curve() {
        let mut learner = Learner1D::new((0.0, 2.0)).unwrap();
        learner.tell(0.0, 0.0).unwrap();
        learner.tell(1.0, 2.0).unwrap();
        learner.tell(2.0, 0.0).unwrap();

        assert_abs_diff_eq!(learner.value(0.5), 1.0);
        assert_abs_diff_eq!(learner.derivative(0.5), 2.0);
        assert_abs_diff_eq!(learner.derivative(1.5), -2.0);
        assert_abs_diff_eq!(learner.derivative(2.0), -2.0);
        assert_eq!(learner.points().len(), 3);
        assert_eq!((learner.min_x(), learner.max_x()), (0.0, 2.0));
    }
}
