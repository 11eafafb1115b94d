use std::collections::{
    BTreeSet,
    VecDeque
};
use std::sync::Arc;

use ordered_float::OrderedFloat;
use tracing::debug;

use super::learner::Learner;
use super::learnererror::LearnerError;
use super::losscache::LossCache;
use crate::math::quadrature::interval::IntervalSnapshot;
use crate::math::quadrature::intervaltree::{
    IntegratorSettings,
    IntervalTree
};

/// Adaptive quadrature driven through the suggestion protocol.
///
/// Points are proposed in the order the interval tree requests them; the
/// estimate does not depend on the order in which values come back.
pub struct IntegratorLearner {
    tree: IntervalTree,
    /// Requested but not yet handed out, with the error of the requesting interval.
    stack: VecDeque<(f64, f64)>,
    pending: BTreeSet<OrderedFloat<f64>>,
    function: Option<Arc<dyn Fn(f64) -> f64 + Send + Sync>>,
    version: u64,
    loss_cache: LossCache<bool>,
}

impl IntegratorLearner {
    pub fn new(bounds: (f64, f64), tol: f64) -> Result<IntegratorLearner, LearnerError> {
        Self::from_settings(&IntegratorSettings::new(bounds, tol))
    }

    pub fn from_settings(settings: &IntegratorSettings) -> Result<IntegratorLearner, LearnerError> {
        Ok(IntegratorLearner {
            tree: IntervalTree::new(settings.clone())?,
            stack: VecDeque::new(),
            pending: BTreeSet::new(),
            function: None,
            version: 0,
            loss_cache: LossCache::new(),
        })
    }

    pub fn with_function(mut self, function: impl Fn(f64) -> f64 + Send + Sync + 'static) -> IntegratorLearner {
        self.function = Some(Arc::new(function));
        self
    }

    pub fn function(&self) -> Option<&Arc<dyn Fn(f64) -> f64 + Send + Sync>> {
        self.function.as_ref()
    }

    pub fn settings(&self) -> &IntegratorSettings {
        self.tree.settings()
    }

    pub fn bounds(&self) -> (f64, f64) {
        self.tree.settings().bounds
    }

    pub fn tol(&self) -> f64 {
        self.tree.settings().tol
    }

    pub fn igral(&self) -> f64 {
        self.tree.igral()
    }

    pub fn err(&self) -> f64 {
        self.tree.err()
    }

    pub fn done(&self) -> bool {
        self.tree.is_started() && self.tree.done()
    }

    pub fn approximating_intervals(&self) -> Vec<IntervalSnapshot> {
        self.tree.approximating_intervals()
    }

    pub fn pending_points(&self) -> Vec<f64> {
        self.pending.iter().map(|k| k.0).collect()
    }

    /// Hands out up to `n` unclaimed points, refining the tree whenever the
    /// requested ones run out. Fewer than `n` means nothing is left to refine.
    ///
    /// If the integral is declared divergent part way through, the points
    /// already claimed are returned and the error comes back on the next call.
    pub fn choose_points(&mut self, n: usize) -> Result<(Vec<f64>, Vec<f64>), LearnerError> {
        let mut points = Vec::with_capacity(n);
        let mut priorities = Vec::with_capacity(n);

        while points.len() < n {
            if let Some((x, priority)) = self.stack.pop_front() {
                let key = OrderedFloat(x);
                if self.tree.is_known(x) || self.pending.contains(&key) {
                    continue;
                }
                self.pending.insert(key);
                points.push(x);
                priorities.push(priority);
                continue;
            }

            let expansion = match self.tree.expand_next() {
                Ok(expansion) => expansion,
                Err(error) if points.is_empty() => return Err(error),
                Err(error) => {
                    debug!(%error, returned = points.len(), "stopped refining");
                    break;
                }
            };
            match expansion {
                Some(expansion) => {
                    let priority = expansion.priority;
                    self.stack.extend(expansion.points.into_iter().map(|x| (x, priority)));
                }
                None => {
                    debug!(requested = n, returned = points.len(), "no interval left to refine");
                    break;
                }
            }
        }

        if !points.is_empty() {
            self.version += 1;
        }
        Ok((points, priorities))
    }

    pub fn add_point(&mut self, x: f64, y: f64) -> Result<(), LearnerError> {
        if !self.tree.is_requested(x) {
            return Err(LearnerError::UnknownPoint(x));
        }
        let result = self.tree.tell(x, y);
        if !matches!(result, Err(LearnerError::ConflictingValue { .. })) {
            self.pending.remove(&OrderedFloat(x));
            self.stack.retain(|&(p, _)| p != x);
            self.version += 1;
        }
        result
    }

    pub fn add_data(&mut self, xs: &[f64], ys: &[f64]) -> Result<(), LearnerError> {
        self.tell_many(xs, ys)
    }
}

impl Learner for IntegratorLearner {
    type Point = f64;

    fn ask(&mut self, n: usize) -> Result<(Vec<f64>, Vec<f64>), LearnerError> {
        self.choose_points(n)
    }

    fn tell(&mut self, x: f64, y: f64) -> Result<(), LearnerError> {
        self.add_point(x, y)
    }

    fn tell_pending(&mut self, x: f64) -> Result<(), LearnerError> {
        if !self.tree.is_requested(x) {
            return Err(LearnerError::UnknownPoint(x));
        }
        if self.tree.is_known(x) {
            return Ok(());
        }
        self.pending.insert(OrderedFloat(x));
        self.stack.retain(|&(p, _)| p != x);
        self.version += 1;
        Ok(())
    }

    fn forget_pending(&mut self, x: f64) -> Result<(), LearnerError> {
        if self.pending.remove(&OrderedFloat(x)) {
            self.stack.push_front((x, self.tree.point_priority(x)));
            self.version += 1;
        }
        Ok(())
    }

    /// Error left above the requested accuracy. With `real == false` each
    /// interval's error is scaled by the share of its missing points that
    /// are not pending yet.
    fn loss(&self, real: bool) -> f64 {
        self.loss_cache.get_or_compute(real, self.version(), || {
            if real {
                self.tree.loss()
            } else {
                self.tree.loss_with_pending(&self.pending)
            }
        })
    }

    fn npoints(&self) -> usize {
        self.tree.npoints()
    }

    fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn version(&self) -> u64 {
        self.version.wrapping_add(self.tree.version())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::math::quadrature::integrate::integrate;

    /// Feeds one point at a time, in ask order, until `limit` points are told
    /// or the learner is done.
    fn feed(learner: &mut IntegratorLearner, f: impl Fn(f64) -> f64, limit: Option<usize>) {
        while limit.is_none_or(|limit| learner.npoints() < limit) {
            if limit.is_none() && learner.done() {
                break;
            }
            let (xs, _) = learner.ask(1).unwrap();
            let Some(&x) = xs.first() else {
                break;
            };
            learner.tell(x, f(x)).unwrap();
        }
    }

    #[test]
    fn first_batch_is_the_root_rule() {
        let mut learner = IntegratorLearner::new((0.0, 1.0), 1e-6).unwrap();
        let (xs, priorities) = learner.ask(17).unwrap();
        assert_eq!(xs.len(), 17);
        assert!(xs.contains(&0.0) && xs.contains(&1.0) && xs.contains(&0.5));
        assert!(priorities.iter().all(|p| p.is_infinite()));
        assert_eq!(learner.pending_count(), 17);
        assert_eq!(learner.loss(true), f64::INFINITY);
    }

    #[test]
    fn asked_points_are_not_repeated() {
        let mut learner = IntegratorLearner::new((0.0, 1.0), 1e-6).unwrap();
        let (first, _) = learner.ask(10).unwrap();
        let (second, _) = learner.ask(30).unwrap();
        assert!(second.iter().all(|x| !first.contains(x)));
    }

    #[test]
    fn sequential_feed_matches_reference_integration() {
        let settings = IntegratorSettings::new((0.0, 2.0), 1e-8);
        let reference = integrate(|x: f64| 1.0 / (1.0 + x * x), &settings).unwrap();

        let mut learner = IntegratorLearner::from_settings(&settings).unwrap();
        feed(&mut learner, |x| 1.0 / (1.0 + x * x), Some(reference.points_consumed));

        assert_eq!(learner.npoints(), reference.points_consumed);
        assert_eq!(learner.igral(), reference.igral);
        assert_abs_diff_eq!(learner.igral(), 2.0_f64.atan(), epsilon = 1e-8);
    }

    #[test]
    fn forgotten_points_are_offered_again() {
        let mut learner = IntegratorLearner::new((0.0, 1.0), 1e-6).unwrap();
        let (xs, _) = learner.ask(3).unwrap();
        learner.forget_pending(xs[1]).unwrap();
        assert_eq!(learner.pending_count(), 2);
        let (again, _) = learner.ask(1).unwrap();
        assert_eq!(again, vec![xs[1]]);
    }

    #[test]
    fn tell_pending_claims_a_requested_point() {
        let mut learner = IntegratorLearner::new((0.0, 1.0), 1e-6).unwrap();
        let (xs, _) = learner.ask(1).unwrap();
        learner.forget_pending(xs[0]).unwrap();
        learner.tell_pending(xs[0]).unwrap();
        let (next, _) = learner.ask(1).unwrap();
        assert_ne!(next[0], xs[0]);
        assert_eq!(learner.tell_pending(0.123), Err(LearnerError::UnknownPoint(0.123)));
    }

    #[test]
    fn unrequested_values_are_rejected() {
        let mut learner = IntegratorLearner::new((0.0, 1.0), 1e-6).unwrap();
        learner.ask(17).unwrap();
        let version = learner.version();
        assert_eq!(learner.tell(0.3, 1.0), Err(LearnerError::UnknownPoint(0.3)));
        assert_eq!(learner.version(), version);
        assert_eq!(learner.npoints(), 0);
    }

    #[test]
    fn claimed_points_lower_the_pending_loss() {
        let mut learner = IntegratorLearner::new((0.0, 1.0), 1e-10).unwrap();
        let (xs, _) = learner.ask(17).unwrap();
        for &x in &xs {
            learner.tell(x, (5.0 * x).sin()).unwrap();
        }
        let real = learner.loss(true);
        assert_eq!(learner.loss(false), real);

        learner.ask(5).unwrap();
        let partly = learner.loss(false);
        assert!(partly < real);
        assert_eq!(learner.loss(true), real);

        // 升階所需的點全部被領走
        learner.ask(11).unwrap();
        assert!(learner.loss(false) < partly);

        for x in learner.pending_points() {
            learner.forget_pending(x).unwrap();
        }
        assert_eq!(learner.loss(false), learner.loss(true));
    }

    #[test]
    fn divergence_mid_batch_keeps_the_claimed_points() {
        let mut settings = IntegratorSettings::new((0.0, 1.0), 1e-6);
        settings.max_rdepth = 1;
        let mut learner = IntegratorLearner::from_settings(&settings).unwrap();

        let (xs, _) = learner.ask(100).unwrap();
        assert_eq!(xs.len(), 33);
        assert_eq!(learner.pending_count(), 33);
        assert!(learner.ask(1).unwrap_err().is_divergent());
    }

    #[test]
    fn conflicting_value_leaves_the_estimate_untouched() {
        let mut learner = IntegratorLearner::new((0.0, 1.0), 1e-6).unwrap();
        let (xs, _) = learner.ask(17).unwrap();
        for &x in &xs {
            learner.tell(x, x * x).unwrap();
        }
        let before = (learner.igral(), learner.err(), learner.version());

        assert!(matches!(
            learner.tell(xs[3], 7.0),
            Err(LearnerError::ConflictingValue { .. })
        ));
        assert_eq!(learner.version(), before.2);
        learner.tell(xs[3], xs[3] * xs[3]).unwrap();
        assert_eq!((learner.igral(), learner.err()), (before.0, before.1));
        assert_eq!(learner.tree.value(xs[3]), Some(xs[3] * xs[3]));
    }

    #[test]
    fn loss_falls_as_data_arrives() {
        let mut learner = IntegratorLearner::new((0.0, 1.0), 1e-10).unwrap();
        let initial = learner.loss(true);
        feed(&mut learner, f64::exp, None);
        assert!(learner.loss(true) < initial);
        assert_eq!(learner.loss(true), learner.loss(false));
        assert!(learner.done());
        assert_eq!(learner.loss(true), 0.0);
    }
}
