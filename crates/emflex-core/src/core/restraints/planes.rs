use ndarray::{Array2, Array3, ArrayView3};

use super::dihedrals::{atom, dihedral, dihedral_grad};
use super::relu;

/// Sines of the improper/peptide dihedrals that should stay planar. The
/// threshold is also a sine, so the comparison is angle against angle.
#[derive(Debug, Clone)]
pub struct PlaneEval {
    pub sines: Array2<f64>,
}

pub fn forward(pos: ArrayView3<f64>, rows: &[[usize; 4]]) -> PlaneEval {
    let batch = pos.dim().0;
    let mut sines = Array2::zeros((batch, rows.len()));
    for b in 0..batch {
        for (r, row) in rows.iter().enumerate() {
            let phi = dihedral(
                atom(&pos, b, row[0]),
                atom(&pos, b, row[1]),
                atom(&pos, b, row[2]),
                atom(&pos, b, row[3]),
            );
            sines[[b, r]] = phi.sin();
        }
    }
    PlaneEval { sines }
}

impl PlaneEval {
    /// mean(relu(|sin φ| − sin_threshold)).
    pub fn flatness_mean(&self, sin_threshold: f64) -> f64 {
        if self.sines.is_empty() {
            return 0.0;
        }
        self.sines
            .iter()
            .map(|&s| relu(s.abs() - sin_threshold))
            .sum::<f64>()
            / self.sines.len() as f64
    }

    pub fn backward(
        &self,
        pos: ArrayView3<f64>,
        rows: &[[usize; 4]],
        sin_threshold: f64,
        weight: f64,
        grad: &mut Array3<f64>,
    ) {
        if self.sines.is_empty() {
            return;
        }
        let norm = self.sines.len() as f64;
        let batch = pos.dim().0;
        for b in 0..batch {
            for (r, row) in rows.iter().enumerate() {
                let s = self.sines[[b, r]];
                if s.abs() <= sin_threshold {
                    continue;
                }
                let (phi, dphi) = dihedral_grad(
                    atom(&pos, b, row[0]),
                    atom(&pos, b, row[1]),
                    atom(&pos, b, row[2]),
                    atom(&pos, b, row[3]),
                );
                // d relu(|sin| − thr)/dφ = sign(sin)·cos
                let coeff = weight * s.signum() * phi.cos() / norm;
                for (a, d) in row.iter().zip(dphi.iter()) {
                    for c in 0..3 {
                        grad[[b, *a, c]] += coeff * d[c];
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn twisted_positions(deg: f64) -> Array3<f64> {
        let rad = deg.to_radians();
        let mut pos = Array3::zeros((1, 4, 3));
        // p0 off-axis, p1-p2 along z, p3 rotated by the twist
        pos[[0, 0, 0]] = 1.0;
        pos[[0, 2, 2]] = 1.0;
        pos[[0, 3, 0]] = rad.cos();
        pos[[0, 3, 1]] = -rad.sin();
        pos[[0, 3, 2]] = 1.0;
        pos
    }

    #[test]
    fn flat_planes_cost_nothing() {
        let rows = vec![[0usize, 1, 2, 3]];
        let eval = forward(twisted_positions(0.0).view(), &rows);
        assert_eq!(eval.flatness_mean(10f64.to_radians().sin()), 0.0);
        // trans-planar geometry is also flat
        let eval = forward(twisted_positions(180.0).view(), &rows);
        assert!(eval.flatness_mean(10f64.to_radians().sin()) < 1e-12);
    }

    #[test]
    fn twist_past_the_threshold_is_penalized() {
        let rows = vec![[0usize, 1, 2, 3]];
        let eval = forward(twisted_positions(20.0).view(), &rows);
        let expected = 20f64.to_radians().sin() - 10f64.to_radians().sin();
        assert!((eval.flatness_mean(10f64.to_radians().sin()) - expected).abs() < 1e-9);
    }

    #[test]
    fn backward_matches_finite_differences() {
        let rows = vec![[0usize, 1, 2, 3]];
        let mut pos = twisted_positions(25.0);
        pos[[0, 0, 1]] = 0.15;
        pos[[0, 1, 0]] = -0.1;
        let thr = 10f64.to_radians().sin();

        let eval = forward(pos.view(), &rows);
        let mut grad = Array3::zeros((1, 4, 3));
        eval.backward(pos.view(), &rows, thr, 2.0, &mut grad);

        let loss = |p: &Array3<f64>| 2.0 * forward(p.view(), &rows).flatness_mean(thr);
        let eps = 1e-6;
        for a in 0..4 {
            for c in 0..3 {
                let mut plus = pos.clone();
                plus[[0, a, c]] += eps;
                let mut minus = pos.clone();
                minus[[0, a, c]] -= eps;
                let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
                assert!(
                    (grad[[0, a, c]] - numeric).abs() < 1e-5,
                    "atom {a} coord {c}: analytic {} vs numeric {numeric}",
                    grad[[0, a, c]]
                );
            }
        }
    }
}
