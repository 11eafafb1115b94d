use super::learnererror::LearnerError;

/// Pull-based suggestion protocol shared by every sampler.
///
/// The caller owns execution: it asks for points, evaluates them wherever it
/// likes and tells the results back in any order. Points handed out by `ask`
/// are pending until told (or forgotten), and are never suggested twice.
///
/// `loss(real = true)` only looks at told values, `loss(real = false)` also
/// accounts for pending points. Both are cached against `version()`, which
/// every mutating call increments.
pub trait Learner {
    type Point: Copy;

    /// Suggests up to `n` new points, each paired with its expected loss
    /// improvement, and marks them pending.
    fn ask(&mut self, n: usize) -> Result<(Vec<Self::Point>, Vec<f64>), LearnerError>;

    /// Records `f(point) = value` and clears `point` from the pending set.
    ///
    /// A repeated point is handled per sampler. `Learner1D` overwrites the
    /// earlier value. `IntegratorLearner` keeps the first value: the same
    /// value again is a no-op, a different one fails with
    /// `ConflictingValue` and leaves the estimate unchanged.
    fn tell(&mut self, point: Self::Point, value: f64) -> Result<(), LearnerError>;

    fn tell_many(&mut self, points: &[Self::Point], values: &[f64]) -> Result<(), LearnerError> {
        if points.len() != values.len() {
            return Err(LearnerError::LengthMismatch {
                points: points.len(),
                values: values.len(),
            });
        }
        for (&point, &value) in points.iter().zip(values.iter()) {
            self.tell(point, value)?;
        }
        Ok(())
    }

    fn tell_pending(&mut self, point: Self::Point) -> Result<(), LearnerError>;

    /// Demotes a pending point back to unclaimed, e.g. when its evaluation
    /// was cancelled.
    fn forget_pending(&mut self, point: Self::Point) -> Result<(), LearnerError>;

    fn loss(&self, real: bool) -> f64;

    fn npoints(&self) -> usize;

    fn pending_count(&self) -> usize;

    fn version(&self) -> u64;
}
