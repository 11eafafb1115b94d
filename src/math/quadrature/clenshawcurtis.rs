use std::f64::consts::PI;
use std::sync::OnceLock;

use nalgebra::{
    DMatrix,
    DVector
};

// ─────────────────────────────────────────────────────────────────────────────
// Nested Clenshaw-Curtis rules with Legendre coefficients
// ─────────────────────────────────────────────────────────────────────────────
//
// 每個區間在 [-1, 1] 上以 Clenshaw-Curtis 節點取樣：
//
//   xi_k = -cos(k·π / (n-1)),  n ∈ {5, 9, 17, 33}
//
// 節點是巢狀的：depth d 的第 k 個節點就是 depth 3 的第 k·2^(3-d) 個節點，
// 因此升階只需補上新的節點。樣本一律存成 33 格（depth 3 的索引）。
//
// 插值多項式以正規化 Legendre 基底展開：
//
//   p(x) = Σ c_j·φ_j(x),   φ_j = sqrt(j + 1/2)·P_j
//   c = V⁻¹·f,             V_ij = φ_j(xi_i)
//
// 積分只需要 c_0：∫_{-1}^{1} p = sqrt(2)·c_0。
//
// 非有限的樣本（NaN、±inf）不參與擬合：剩下 m 個節點時只解前 m 個
// 係數，較高階的係數為 0。

pub const NS: [usize; 4] = [5, 9, 17, 33];
pub const MAX_DEPTH: usize = 3;
pub const NSLOTS: usize = 33;

/// A refinement whose coefficients move by more than this fraction of
/// their norm forces a split.
pub const HINT: f64 = 0.1;
pub const NDIV_MAX: usize = 20;
pub const MIN_SEP: f64 = 16.0 * f64::EPSILON;

/// Slot stride of depth `depth` inside the 33-slot sample layout.
pub fn stride(depth: usize) -> usize {
    1 << (MAX_DEPTH - depth)
}

/// Slots sampled by the rule of `depth`, in increasing x order.
pub fn slots(depth: usize) -> impl Iterator<Item = usize> {
    (0..NS[depth]).map(move |k| k * stride(depth))
}

pub struct QuadratureRules {
    xi: Vec<f64>,
    v: Vec<DMatrix<f64>>,
    v_inv: Vec<DMatrix<f64>>,
    v_cond: Vec<f64>,
    t_left: DMatrix<f64>,
    t_right: DMatrix<f64>,
}

impl QuadratureRules {
    pub fn get() -> &'static QuadratureRules {
        static RULES: OnceLock<QuadratureRules> = OnceLock::new();
        RULES.get_or_init(QuadratureRules::new)
    }

    fn new() -> QuadratureRules {
        let xi = Self::nodes();

        let vandermondes: Vec<DMatrix<f64>> = (0..=MAX_DEPTH)
            .map(|depth| {
                let x: Vec<f64> = slots(depth).map(|s| xi[s]).collect();
                legendre_vandermonde(&x, NS[depth])
            })
            .collect();

        let v_inv: Vec<DMatrix<f64>> = vandermondes
            .iter()
            .map(|v| {
                v.clone()
                    .try_inverse()
                    .expect("QuadratureRules: Vandermonde 矩陣不可逆")
            })
            .collect();

        let v_cond = vandermondes
            .iter()
            .zip(v_inv.iter())
            .map(|(v, inv)| spectral_norm(v) * spectral_norm(inv))
            .collect();

        // 子區間係數 = T·父區間係數，T 對 33 點精確
        let shifted = |offset: f64| -> DMatrix<f64> {
            let x: Vec<f64> = xi.iter().map(|&x| (x + offset) / 2.0).collect();
            &v_inv[MAX_DEPTH] * legendre_vandermonde(&x, NSLOTS)
        };
        let t_left = shifted(-1.0);
        let t_right = shifted(1.0);

        QuadratureRules {
            xi,
            v: vandermondes,
            v_inv,
            v_cond,
            t_left,
            t_right,
        }
    }

    /// Depth-3 nodes with exact endpoints and centre, and exact symmetry.
    fn nodes() -> Vec<f64> {
        let half = NSLOTS / 2;
        let mut xi = vec![0.0; NSLOTS];
        for k in 0..half {
            let x = -((k as f64) * PI / ((NSLOTS - 1) as f64)).cos();
            xi[k] = x;
            xi[NSLOTS - 1 - k] = -x;
        }
        xi[0] = -1.0;
        xi[NSLOTS - 1] = 1.0;
        xi[half] = 0.0;
        xi
    }

    pub fn xi(&self, slot: usize) -> f64 {
        self.xi[slot]
    }

    pub fn v_inv(&self, depth: usize) -> &DMatrix<f64> {
        &self.v_inv[depth]
    }

    pub fn v_cond(&self, depth: usize) -> f64 {
        self.v_cond[depth]
    }

    /// Legendre coefficients of the rule of `depth` for the given samples.
    /// Nodes with a non-finite sample are left out of the fit, lowering the
    /// degree of the interpolant by one per dropped node.
    pub fn coefficients(&self, depth: usize, fx: &[f64]) -> DVector<f64> {
        let n = fx.len();
        let finite: Vec<usize> = (0..n).filter(|&i| fx[i].is_finite()).collect();
        if finite.len() == n {
            return &self.v_inv[depth] * DVector::from_column_slice(fx);
        }

        let m = finite.len();
        let mut coefs = DVector::<f64>::zeros(n);
        if m == 0 {
            return coefs;
        }
        let v = &self.v[depth];
        let reduced = DMatrix::from_fn(m, m, |i, j| v[(finite[i], j)]);
        let rhs = DVector::from_iterator(m, finite.iter().map(|&i| fx[i]));
        if let Some(solved) = reduced.lu().solve(&rhs) {
            coefs.rows_mut(0, m).copy_from(&solved);
        }
        coefs
    }

    /// Coefficients of a parent interpolant re-expanded on its left or
    /// right half.
    pub fn to_child(&self, parent_coefs: &DVector<f64>, left: bool) -> DVector<f64> {
        let t = if left { &self.t_left } else { &self.t_right };
        t.columns(0, parent_coefs.len()) * parent_coefs
    }
}

/// Rows are nodes, columns are the normalized Legendre polynomials φ_0..φ_{n-1}.
fn legendre_vandermonde(x: &[f64], n: usize) -> DMatrix<f64> {
    let mut v = DMatrix::<f64>::zeros(x.len(), n);
    for (i, &xi) in x.iter().enumerate() {
        let mut p_prev = 1.0;
        let mut p = xi;
        v[(i, 0)] = 1.0;
        if n > 1 {
            v[(i, 1)] = xi;
        }
        for j in 2..n {
            let jf = j as f64;
            let p_next = ((2.0 * jf - 1.0) * xi * p - (jf - 1.0) * p_prev) / jf;
            p_prev = p;
            p = p_next;
            v[(i, j)] = p;
        }
    }
    for j in 0..n {
        let norm = (j as f64 + 0.5).sqrt();
        v.column_mut(j).scale_mut(norm);
    }
    v
}

fn spectral_norm(m: &DMatrix<f64>) -> f64 {
    m.clone().singular_values().max()
}

/// `‖a - b‖₂` with the shorter vector padded with zeros.
pub fn padded_distance(a: &DVector<f64>, b: &DVector<f64>) -> f64 {
    let n = a.len().max(b.len());
    (0..n)
        .map(|i| {
            let d = a.get(i).copied().unwrap_or(0.0) - b.get(i).copied().unwrap_or(0.0);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}
