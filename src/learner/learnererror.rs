use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LearnerError {
    #[error("invalid bounds ({0}, {1}): lower bound must be finite and strictly below the upper bound")]
    InvalidBounds(f64, f64),

    #[error("invalid tolerance {0}: must be finite and positive")]
    InvalidTolerance(f64),

    #[error("point {x} lies outside the bounds ({}, {})", bounds.0, bounds.1)]
    OutOfBounds { x: f64, bounds: (f64, f64) },

    #[error("non-finite input: x = {x}, y = {y}")]
    NonFiniteInput { x: f64, y: f64 },

    #[error("point {0} does not belong to any interval")]
    UnknownPoint(f64),

    #[error("point {x} was already told with value {old}, refusing {new}")]
    ConflictingValue { x: f64, old: f64, new: f64 },

    #[error("got {points} points but {values} values")]
    LengthMismatch { points: usize, values: usize },

    #[error("learner index {index} out of range for {len} learners")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("a balancing learner needs at least one learner")]
    EmptyLearnerSet,

    #[error(
        "divergent integral after {points_consumed} points \
         (partial integral {partial_integral}, partial error {partial_error})"
    )]
    DivergentIntegral {
        points_consumed: usize,
        partial_integral: f64,
        partial_error: f64,
    },
}

impl LearnerError {
    pub fn check_bounds(bounds: (f64, f64)) -> Result<(), LearnerError> {
        let (a, b) = bounds;
        if a.is_finite() && b.is_finite() && a < b {
            Ok(())
        } else {
            Err(LearnerError::InvalidBounds(a, b))
        }
    }

    pub fn check_tolerance(tol: f64) -> Result<(), LearnerError> {
        if tol.is_finite() && tol > 0.0 {
            Ok(())
        } else {
            Err(LearnerError::InvalidTolerance(tol))
        }
    }

    pub fn is_divergent(&self) -> bool {
        matches!(self, LearnerError::DivergentIntegral { .. })
    }
}
