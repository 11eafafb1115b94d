use serde::{
    Deserialize,
    Serialize
};
use tracing::{
    trace,
    warn
};

use super::learner::Learner;
use super::learnererror::LearnerError;
use super::losscache::LossCache;

/// How `BalancingLearner::ask` picks the sampler that receives the next point.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
pub enum BalancingStrategy {
    /// Largest loss including pending points.
    #[default]
    Loss,
    /// Fewest real plus pending points.
    NPoints,
    /// Round robin.
    Cycle,
}

// ─────────────────────────────────────────────────────────────────────────────
// BalancingLearner
// ─────────────────────────────────────────────────────────────────────────────
//
// 每個子 learner 的 loss 以 (index, real) 為 key 快取，並以子 learner 自己的
// version 失效：只有被 tell / ask 過的那個 learner 需要重算。
// ask 失敗(例如積分發散)的 learner 記在 failures，之後不再分配點，
// 也不再參與 loss 的比較。

/// Spreads a sampling budget over several scalar samplers.
///
/// Points are tagged with the index of the sampler they belong to.
pub struct BalancingLearner {
    learners: Vec<Box<dyn Learner<Point = f64>>>,
    strategy: BalancingStrategy,
    cycle: usize,
    version: u64,
    loss_cache: LossCache<(usize, bool)>,
    failures: Vec<Option<LearnerError>>,
}

impl BalancingLearner {
    pub fn new(learners: Vec<Box<dyn Learner<Point = f64>>>) -> Result<BalancingLearner, LearnerError> {
        Self::with_strategy(learners, BalancingStrategy::default())
    }

    pub fn with_strategy(
        learners: Vec<Box<dyn Learner<Point = f64>>>,
        strategy: BalancingStrategy,
    ) -> Result<BalancingLearner, LearnerError> {
        if learners.is_empty() {
            return Err(LearnerError::EmptyLearnerSet);
        }
        let failures = vec![None; learners.len()];
        Ok(BalancingLearner {
            learners,
            strategy,
            cycle: 0,
            version: 0,
            loss_cache: LossCache::new(),
            failures,
        })
    }

    pub fn strategy(&self) -> BalancingStrategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.learners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.learners.is_empty()
    }

    pub fn learner(&self, index: usize) -> Result<&dyn Learner<Point = f64>, LearnerError> {
        self.check_index(index)?;
        Ok(self.learners[index].as_ref())
    }

    /// The error that retired sampler `index`, if any.
    pub fn failure(&self, index: usize) -> Result<Option<&LearnerError>, LearnerError> {
        self.check_index(index)?;
        Ok(self.failures[index].as_ref())
    }

    fn record_failure(&mut self, index: usize, error: LearnerError) {
        warn!(index, %error, "sampler retired");
        self.failures[index] = Some(error);
    }

    fn check_index(&self, index: usize) -> Result<(), LearnerError> {
        if index < self.learners.len() {
            Ok(())
        } else {
            Err(LearnerError::IndexOutOfRange {
                index,
                len: self.learners.len(),
            })
        }
    }

    /// Loss of one sampler, served from the cache while it is unchanged.
    pub fn learner_loss(&self, index: usize, real: bool) -> Result<f64, LearnerError> {
        self.check_index(index)?;
        Ok(self.cached_loss(index, real))
    }

    fn cached_loss(&self, index: usize, real: bool) -> f64 {
        let learner = &self.learners[index];
        self.loss_cache
            .get_or_compute((index, real), learner.version(), || learner.loss(real))
    }

    fn select(&self, allocated: &[usize], exhausted: &[bool]) -> Option<usize> {
        let candidates = (0..self.learners.len()).filter(|&i| !exhausted[i] && self.failures[i].is_none());
        match self.strategy {
            BalancingStrategy::Loss => candidates.max_by(|&l, &r| {
                self.cached_loss(l, false)
                    .total_cmp(&self.cached_loss(r, false))
                    .then(allocated[r].cmp(&allocated[l]))
                    .then(r.cmp(&l))
            }),
            BalancingStrategy::NPoints => candidates.min_by_key(|&i| (allocated[i], i)),
            BalancingStrategy::Cycle => {
                let n = self.learners.len();
                (0..n)
                    .map(|k| (self.cycle + k) % n)
                    .find(|&i| !exhausted[i] && self.failures[i].is_none())
            }
        }
    }
}

impl Learner for BalancingLearner {
    type Point = (usize, f64);

    /// Allocates the points one at a time; each allocation updates the
    /// chosen sampler's pending set before the next choice is made.
    ///
    /// A sampler whose `ask` fails is retired and the batch goes on with
    /// the others. The error is returned only when no point could be
    /// allocated at all.
    fn ask(&mut self, n: usize) -> Result<(Vec<(usize, f64)>, Vec<f64>), LearnerError> {
        let mut allocated: Vec<usize> = self
            .learners
            .iter()
            .map(|l| l.npoints() + l.pending_count())
            .collect();
        let mut exhausted = vec![false; self.learners.len()];
        let mut points = Vec::with_capacity(n);
        let mut improvements = Vec::with_capacity(n);

        while points.len() < n {
            let Some(index) = self.select(&allocated, &exhausted) else {
                break;
            };
            let (xs, losses) = match self.learners[index].ask(1) {
                Ok(asked) => asked,
                Err(error) => {
                    self.record_failure(index, error);
                    continue;
                }
            };
            let Some(&x) = xs.first() else {
                trace!(index, "sampler has no more points");
                exhausted[index] = true;
                continue;
            };
            trace!(index, x, "point allocated");
            points.push((index, x));
            improvements.push(losses[0]);
            allocated[index] += 1;
            self.cycle = (index + 1) % self.learners.len();
        }

        if points.is_empty() {
            if let Some(error) = self.failures.iter().flatten().next() {
                return Err(error.clone());
            }
        } else {
            self.version += 1;
        }
        Ok((points, improvements))
    }

    fn tell(&mut self, point: (usize, f64), value: f64) -> Result<(), LearnerError> {
        let (index, x) = point;
        self.check_index(index)?;
        let told = self.learners[index].tell(x, value);
        if let Err(error) = &told
            && error.is_divergent()
        {
            self.record_failure(index, error.clone());
        }
        told?;
        self.version += 1;
        Ok(())
    }

    fn tell_pending(&mut self, point: (usize, f64)) -> Result<(), LearnerError> {
        let (index, x) = point;
        self.check_index(index)?;
        self.learners[index].tell_pending(x)?;
        self.version += 1;
        Ok(())
    }

    fn forget_pending(&mut self, point: (usize, f64)) -> Result<(), LearnerError> {
        let (index, x) = point;
        self.check_index(index)?;
        self.learners[index].forget_pending(x)?;
        self.version += 1;
        Ok(())
    }

    /// Worst loss over the samplers still in play; infinite once every
    /// sampler has been retired.
    fn loss(&self, real: bool) -> f64 {
        (0..self.learners.len())
            .filter(|&i| self.failures[i].is_none())
            .map(|i| self.cached_loss(i, real))
            .reduce(f64::max)
            .unwrap_or(f64::INFINITY)
    }

    fn npoints(&self) -> usize {
        self.learners.iter().map(|l| l.npoints()).sum()
    }

    fn pending_count(&self) -> usize {
        self.learners.iter().map(|l| l.pending_count()).sum()
    }

    fn version(&self) -> u64 {
        self.learners
            .iter()
            .fold(self.version, |acc, l| acc.wrapping_add(l.version()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learner::integratorlearner::IntegratorLearner;
    use crate::learner::learner1d::Learner1D;

    fn samplers(n: usize) -> Vec<Box<dyn Learner<Point = f64>>> {
        (0..n)
            .map(|_| Box::new(Learner1D::new((-1.0, 1.0)).unwrap()) as Box<dyn Learner<Point = f64>>)
            .collect()
    }

    fn counts(points: &[(usize, f64)], n: usize) -> Vec<usize> {
        let mut counts = vec![0; n];
        for (index, _) in points {
            counts[*index] += 1;
        }
        counts
    }

    #[test]
    fn empty_learner_set_is_rejected() {
        assert!(matches!(
            BalancingLearner::new(Vec::new()),
            Err(LearnerError::EmptyLearnerSet)
        ));
    }

    #[test]
    fn unknown_index_is_rejected() {
        let mut balancer = BalancingLearner::new(samplers(2)).unwrap();
        assert_eq!(
            balancer.tell((2, 0.0), 1.0),
            Err(LearnerError::IndexOutOfRange { index: 2, len: 2 })
        );
        assert!(balancer.learner_loss(5, true).is_err());
    }

    #[test]
    fn npoints_strategy_fills_the_emptiest_sampler() {
        let mut balancer = BalancingLearner::with_strategy(samplers(3), BalancingStrategy::NPoints).unwrap();
        let (points, _) = balancer.ask(9).unwrap();
        assert_eq!(counts(&points, 3), vec![3, 3, 3]);
        assert_eq!(points[0].0, 0);
        assert_eq!(points[1].0, 1);
    }

    #[test]
    fn cycle_strategy_takes_turns() {
        let mut balancer = BalancingLearner::with_strategy(samplers(3), BalancingStrategy::Cycle).unwrap();
        let (points, _) = balancer.ask(4).unwrap();
        let order: Vec<usize> = points.iter().map(|p| p.0).collect();
        assert_eq!(order, vec![0, 1, 2, 0]);
        let (points, _) = balancer.ask(1).unwrap();
        assert_eq!(points[0].0, 1);
    }

    #[test]
    fn tells_are_routed_by_index() {
        let mut balancer = BalancingLearner::new(samplers(2)).unwrap();
        let (points, _) = balancer.ask(4).unwrap();
        for &(index, x) in &points {
            balancer.tell((index, x), x * x).unwrap();
        }
        assert_eq!(balancer.npoints(), 4);
        assert_eq!(balancer.pending_count(), 0);
        assert_eq!(balancer.learner(0).unwrap().npoints(), counts(&points, 2)[0]);
    }

    #[test]
    fn mixes_heterogeneous_samplers() {
        let learners: Vec<Box<dyn Learner<Point = f64>>> = vec![
            Box::new(Learner1D::new((0.0, 1.0)).unwrap()),
            Box::new(IntegratorLearner::new((0.0, 1.0), 1e-6).unwrap()),
        ];
        let mut balancer = BalancingLearner::new(learners).unwrap();
        let (points, _) = balancer.ask(10).unwrap();
        let counts = counts(&points, 2);
        assert!(counts[0] > 0 && counts[1] > 0);
    }
}
