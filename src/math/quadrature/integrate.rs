use serde::{
    Deserialize,
    Serialize
};
use tracing::debug;

use super::interval::IntervalSnapshot;
use super::intervaltree::{
    IntegratorSettings,
    IntervalTree
};
use crate::learner::learnererror::LearnerError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationResult {
    pub igral: f64,
    pub err: f64,
    pub points_consumed: usize,
    pub intervals: Vec<IntervalSnapshot>,
}

/// Sequential adaptive integration of `f` over `settings.bounds`.
///
/// Evaluates every requested point as soon as an interval asks for it,
/// in the order the intervals ask. Feeding an `IntegratorLearner` one
/// point at a time in ask order reproduces this run exactly.
pub fn integrate<F>(f: F, settings: &IntegratorSettings) -> Result<IntegrationResult, LearnerError>
where
    F: Fn(f64) -> f64,
{
    let mut tree = IntervalTree::new(settings.clone())?;

    while !(tree.is_started() && tree.done()) {
        let Some(expansion) = tree.expand_next()? else {
            break;
        };
        for x in expansion.points {
            tree.tell(x, f(x))?;
        }
    }

    debug!(
        igral = tree.igral(),
        err = tree.err(),
        points = tree.npoints(),
        "integration finished"
    );
    Ok(IntegrationResult {
        igral: tree.igral(),
        err: tree.err(),
        points_consumed: tree.npoints(),
        intervals: tree.approximating_intervals(),
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn integrates_smooth_functions_to_tolerance() {
        let settings = IntegratorSettings::new((0.0, 3.0), 1e-8);
        let result = integrate(f64::cos, &settings).unwrap();
        assert_abs_diff_eq!(result.igral, 3.0_f64.sin(), epsilon = 1e-8);
        assert_eq!(result.intervals.first().unwrap().a, 0.0);
        assert_eq!(result.intervals.last().unwrap().b, 3.0);
    }

    #[test]
    fn endpoint_singularity_is_handled() {
        let settings = IntegratorSettings::new((0.0, 1.0), 1e-6);
        let result = integrate(f64::sqrt, &settings).unwrap();
        assert_abs_diff_eq!(result.igral, 2.0 / 3.0, epsilon = 1e-5);
        assert!(result.intervals.len() > 1);
    }

    #[test]
    fn removable_singularity_does_not_cost_extra_points() {
        let settings = IntegratorSettings::new((-1.0, 1.0), 1e-10);
        let result = integrate(|x: f64| x.sin() / x, &settings).unwrap();
        // Si(1)·2
        assert_abs_diff_eq!(result.igral, 1.892_166_140_734_366, epsilon = 1e-12);
        assert_eq!(result.points_consumed, 33);
    }

    #[test]
    fn non_integrable_function_diverges() {
        let settings = IntegratorSettings::new((0.0, 1.0), 1e-6);
        let error = integrate(|x: f64| x.powi(-2), &settings).unwrap_err();
        assert!(error.is_divergent());
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let settings = IntegratorSettings::new((1.0, 0.0), 1e-6);
        assert_eq!(
            integrate(f64::exp, &settings).unwrap_err(),
            LearnerError::InvalidBounds(1.0, 0.0)
        );
    }
}
