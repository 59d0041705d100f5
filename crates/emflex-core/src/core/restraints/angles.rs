use nalgebra::Vector3;
use ndarray::{Array2, Array3, ArrayView3};

use super::relu;
use crate::core::model::topology::AngleRow;

const DEG: f64 = 180.0 / std::f64::consts::PI;

fn arms(pos: &ArrayView3<f64>, b: usize, row: &AngleRow) -> (Vector3<f64>, Vector3<f64>) {
    let at = |a: usize| Vector3::new(pos[[b, a, 0]], pos[[b, a, 1]], pos[[b, a, 2]]);
    let j = at(row.j);
    (at(row.i) - j, at(row.k) - j)
}

/// Standardized bond-angle deviations df = (angle° − ideal°) / tol°.
#[derive(Debug, Clone)]
pub struct AngleEval {
    pub df: Array2<f64>,
}

pub fn forward(pos: ArrayView3<f64>, rows: &[AngleRow]) -> AngleEval {
    let batch = pos.dim().0;
    let mut df = Array2::zeros((batch, rows.len()));
    for b in 0..batch {
        for (r, row) in rows.iter().enumerate() {
            let (u, v) = arms(&pos, b, row);
            let theta = u.cross(&v).norm().atan2(u.dot(&v));
            df[[b, r]] = (theta * DEG - row.ideal) / row.tolerance;
        }
    }
    AngleEval { df }
}

impl AngleEval {
    pub fn outlier_mean(&self, nstd: f64) -> f64 {
        if self.df.is_empty() {
            return 0.0;
        }
        self.df.iter().map(|&d| relu(d.abs() - nstd)).sum::<f64>() / self.df.len() as f64
    }

    /// 1 − mean(exp(−alpha·df²)); grows from zero as angles strain.
    pub fn gauss_penalty(&self, alpha: f64) -> f64 {
        if self.df.is_empty() {
            return 0.0;
        }
        1.0 - self.df.iter().map(|&d| (-alpha * d * d).exp()).sum::<f64>() / self.df.len() as f64
    }

    pub fn backward_outlier(
        &self,
        pos: ArrayView3<f64>,
        rows: &[AngleRow],
        nstd: f64,
        weight: f64,
        grad: &mut Array3<f64>,
    ) {
        self.backward_with(pos, rows, grad, |d| {
            if d.abs() > nstd { weight * d.signum() } else { 0.0 }
        });
    }

    pub fn backward_gauss(
        &self,
        pos: ArrayView3<f64>,
        rows: &[AngleRow],
        alpha: f64,
        weight: f64,
        grad: &mut Array3<f64>,
    ) {
        // d(1 − mean(exp(−a·df²)))/ddf = 2a·df·exp(−a·df²) / count
        self.backward_with(pos, rows, grad, |d| {
            weight * 2.0 * alpha * d * (-alpha * d * d).exp()
        });
    }

    fn backward_with<F: Fn(f64) -> f64>(
        &self,
        pos: ArrayView3<f64>,
        rows: &[AngleRow],
        grad: &mut Array3<f64>,
        d_mean: F,
    ) {
        if self.df.is_empty() {
            return;
        }
        let norm = self.df.len() as f64;
        let batch = pos.dim().0;
        for b in 0..batch {
            for (r, row) in rows.iter().enumerate() {
                let coeff = d_mean(self.df[[b, r]]) / norm;
                if coeff == 0.0 {
                    continue;
                }
                let (u, v) = arms(&pos, b, row);
                let (nu, nv) = (u.norm(), v.norm());
                if nu < 1e-12 || nv < 1e-12 {
                    continue;
                }
                let (uh, vh) = (u / nu, v / nv);
                let cos = uh.dot(&vh);
                let sin = uh.cross(&vh).norm();
                if sin < 1e-8 {
                    continue;
                }
                // dθ/dp in radians, then degrees over tolerance
                let scale = coeff * DEG / row.tolerance;
                let di = (cos * uh - vh) / (nu * sin) * scale;
                let dk = (cos * vh - uh) / (nv * sin) * scale;
                for c in 0..3 {
                    grad[[b, row.i, c]] += di[c];
                    grad[[b, row.k, c]] += dk[c];
                    grad[[b, row.j, c]] -= di[c] + dk[c];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn create_test_row() -> AngleRow {
        AngleRow { i: 0, j: 1, k: 2, ideal: 109.5, tolerance: 2.0 }
    }

    fn bent_positions(angle_deg: f64) -> Array3<f64> {
        let mut pos = Array3::zeros((1, 3, 3));
        pos[[0, 0, 0]] = 1.5; // i along +x from the vertex
        let rad = angle_deg / DEG;
        pos[[0, 2, 0]] = 1.5 * rad.cos();
        pos[[0, 2, 1]] = 1.5 * rad.sin();
        pos
    }

    #[test]
    fn deviation_is_measured_in_tolerance_units() {
        let rows = vec![create_test_row()];
        let eval = forward(bent_positions(109.5).view(), &rows);
        assert!(eval.df[[0, 0]].abs() < 1e-9);
        let eval = forward(bent_positions(117.5).view(), &rows);
        assert!((eval.df[[0, 0]] - 4.0).abs() < 1e-9);
        assert_eq!(eval.outlier_mean(4.0), 0.0);
        let eval = forward(bent_positions(120.5).view(), &rows);
        assert!((eval.outlier_mean(4.0) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn backward_matches_finite_differences() {
        let rows = vec![create_test_row()];
        let mut pos = bent_positions(125.0);
        pos[[0, 0, 2]] = 0.4;
        pos[[0, 2, 2]] = -0.2;

        let eval = forward(pos.view(), &rows);
        let mut grad = Array3::zeros((1, 3, 3));
        eval.backward_outlier(pos.view(), &rows, 4.0, 1.3, &mut grad);
        eval.backward_gauss(pos.view(), &rows, 8.0, 0.5, &mut grad);

        let loss = |p: &Array3<f64>| {
            let e = forward(p.view(), &rows);
            1.3 * e.outlier_mean(4.0) + 0.5 * e.gauss_penalty(8.0)
        };
        let eps = 1e-6;
        for atom in 0..3 {
            for c in 0..3 {
                let mut plus = pos.clone();
                plus[[0, atom, c]] += eps;
                let mut minus = pos.clone();
                minus[[0, atom, c]] -= eps;
                let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
                assert!(
                    (grad[[0, atom, c]] - numeric).abs() < 1e-5,
                    "atom {atom} coord {c}: analytic {} vs numeric {numeric}",
                    grad[[0, atom, c]]
                );
            }
        }
    }
}
