use serde::{
    Deserialize,
    Serialize
};

use crate::math::curve::nonparametriccurve::Point2D;

// ─────────────────────────────────────────────
// LossFunctionType
// ─────────────────────────────────────────────

/// Loss assigned to the gap between two neighbouring samples.
///
/// Both variants work on rescaled coordinates: x is divided by the domain
/// width and y by the observed y-range, so the loss is comparable across
/// functions of different magnitude.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
pub enum LossFunctionType {
    /// Euclidean length of the rescaled segment; favours steep or wide gaps.
    #[default]
    Default,
    /// Rescaled width only; converges to a uniform grid.
    Uniform,
}

/// Rescaling applied to samples before computing a gap loss.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossScale {
    x_scale: f64,
    y_scale: f64,
}

impl LossScale {
    pub fn new(x_scale: f64, y_scale: f64) -> LossScale {
        // 常數函數（y_scale = 0）時不縮放 y
        let y_scale = if y_scale > 0.0 && y_scale.is_finite() { y_scale } else { 1.0 };
        LossScale { x_scale, y_scale }
    }

    pub fn x_scale(&self) -> f64 {
        self.x_scale
    }

    pub fn y_scale(&self) -> f64 {
        self.y_scale
    }
}

impl LossFunctionType {
    pub fn gap_loss(&self, lhs_pt: &Point2D, rhs_pt: &Point2D, scale: &LossScale) -> f64 {
        let dx = (rhs_pt.x() - lhs_pt.x()) / scale.x_scale;
        match self {
            LossFunctionType::Default => {
                let dy = (rhs_pt.y() - lhs_pt.y()) / scale.y_scale;
                dx.hypot(dy)
            }
            LossFunctionType::Uniform => dx,
        }
    }
}
