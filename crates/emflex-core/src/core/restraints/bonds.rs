use nalgebra::Vector3;
use ndarray::{Array2, Array3, ArrayView3};

use super::relu;
use crate::core::model::topology::BondRow;

fn bond_vector(pos: &ArrayView3<f64>, b: usize, row: &BondRow) -> Vector3<f64> {
    Vector3::new(
        pos[[b, row.j, 0]] - pos[[b, row.i, 0]],
        pos[[b, row.j, 1]] - pos[[b, row.i, 1]],
        pos[[b, row.j, 2]] - pos[[b, row.i, 2]],
    )
}

/// Standardized bond-length deviations df = (len − ideal) / tol, one row
/// per bond per batch frame.
#[derive(Debug, Clone)]
pub struct BondEval {
    pub df: Array2<f64>,
}

pub fn forward(pos: ArrayView3<f64>, rows: &[BondRow]) -> BondEval {
    let batch = pos.dim().0;
    let mut df = Array2::zeros((batch, rows.len()));
    for b in 0..batch {
        for (r, row) in rows.iter().enumerate() {
            let len = bond_vector(&pos, b, row).norm();
            df[[b, r]] = (len - row.ideal) / row.tolerance;
        }
    }
    BondEval { df }
}

impl BondEval {
    /// mean(relu(|df| − nstd)) over every frame and bond.
    pub fn outlier_mean(&self, nstd: f64) -> f64 {
        if self.df.is_empty() {
            return 0.0;
        }
        self.df.iter().map(|&d| relu(d.abs() - nstd)).sum::<f64>() / self.df.len() as f64
    }

    /// mean(exp(−alpha·df²)), the agreement score used inside the log loss.
    pub fn gauss_mean(&self, alpha: f64) -> f64 {
        if self.df.is_empty() {
            return 0.0;
        }
        self.df.iter().map(|&d| (-alpha * d * d).exp()).sum::<f64>() / self.df.len() as f64
    }

    /// Adds `weight · d(outlier_mean)/d(pos)` into `grad`.
    pub fn backward_outlier(
        &self,
        pos: ArrayView3<f64>,
        rows: &[BondRow],
        nstd: f64,
        weight: f64,
        grad: &mut Array3<f64>,
    ) {
        self.backward_with(pos, rows, grad, |d| {
            if d.abs() > nstd { weight * d.signum() } else { 0.0 }
        });
    }

    /// Adds `weight · d(gauss_mean)/d(pos)` into `grad`.
    pub fn backward_gauss(
        &self,
        pos: ArrayView3<f64>,
        rows: &[BondRow],
        alpha: f64,
        weight: f64,
        grad: &mut Array3<f64>,
    ) {
        self.backward_with(pos, rows, grad, |d| {
            weight * (-2.0 * alpha * d) * (-alpha * d * d).exp()
        });
    }

    fn backward_with<F: Fn(f64) -> f64>(
        &self,
        pos: ArrayView3<f64>,
        rows: &[BondRow],
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
                let v = bond_vector(&pos, b, row);
                let len = v.norm();
                if len < 1e-12 {
                    continue;
                }
                let u = v / (len * row.tolerance);
                for c in 0..3 {
                    grad[[b, row.j, c]] += coeff * u[c];
                    grad[[b, row.i, c]] -= coeff * u[c];
                }
            }
        }
    }
}
