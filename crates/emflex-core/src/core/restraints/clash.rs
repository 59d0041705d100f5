use ndarray::{Array2, Array3, ArrayView3};

use super::relu;

/// Steric candidate pairs for either the whole model or a moving-domain
/// subset. `neighbors[[r, k]]` is a global atom id; padded slots point the
/// query atom at itself with an infinite allowance so they contribute
/// exactly zero. When `subset` is set, row `r` queries atom `subset[r]`,
/// otherwise row `r` queries atom `r`.
#[derive(Debug, Clone)]
pub struct ClashTable {
    pub neighbors: Array2<usize>,
    pub vdw_sum: Array2<f64>,
    pub allowance: Array2<f64>,
    pub subset: Option<Vec<usize>>,
}

impl ClashTable {
    pub fn n_rows(&self) -> usize {
        self.neighbors.nrows()
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.ncols()
    }

    #[inline]
    pub fn query_atom(&self, row: usize) -> usize {
        match &self.subset {
            Some(s) => s[row],
            None => row,
        }
    }
}

/// Clamped penetration depths, (batch, rows, K).
#[derive(Debug, Clone)]
pub struct ClashEval {
    pub penetration: Array3<f64>,
}

pub fn forward(pos: ArrayView3<f64>, table: &ClashTable, overlap: f64) -> ClashEval {
    let batch = pos.dim().0;
    let (rows, k) = table.neighbors.dim();
    let mut penetration = Array3::zeros((batch, rows, k));
    for b in 0..batch {
        for r in 0..rows {
            let i = table.query_atom(r);
            for s in 0..k {
                let j = table.neighbors[[r, s]];
                let mut d2 = 0.0;
                for c in 0..3 {
                    let dx = pos[[b, i, c]] - pos[[b, j, c]];
                    d2 += dx * dx;
                }
                let pen = table.vdw_sum[[r, s]] - d2.sqrt() - overlap - table.allowance[[r, s]];
                penetration[[b, r, s]] = relu(pen);
            }
        }
    }
    ClashEval { penetration }
}

impl ClashEval {
    /// Σ(pen + bonus·[pen > 0]) over every frame, row, and slot; the caller
    /// applies the /batch/2 normalization and stage scale.
    pub fn sum_with_bonus(&self, bonus: f64) -> f64 {
        self.penetration
            .iter()
            .map(|&p| if p > 0.0 { p + bonus } else { 0.0 })
            .sum()
    }

    /// Contact count Σ[pen > 0], for reporting.
    pub fn n_contacts(&self) -> usize {
        self.penetration.iter().filter(|&&p| p > 0.0).count()
    }

    /// Adds `weight · d(Σ pen)/d(pos)`; the pair-count bonus is flat almost
    /// everywhere and contributes nothing here.
    pub fn backward(
        &self,
        pos: ArrayView3<f64>,
        table: &ClashTable,
        weight: f64,
        grad: &mut Array3<f64>,
    ) {
        let batch = pos.dim().0;
        let (rows, k) = table.neighbors.dim();
        for b in 0..batch {
            for r in 0..rows {
                let i = table.query_atom(r);
                for s in 0..k {
                    if self.penetration[[b, r, s]] <= 0.0 {
                        continue;
                    }
                    let j = table.neighbors[[r, s]];
                    let mut d2 = 0.0;
                    let mut dx = [0.0; 3];
                    for c in 0..3 {
                        dx[c] = pos[[b, i, c]] - pos[[b, j, c]];
                        d2 += dx[c] * dx[c];
                    }
                    let d = d2.sqrt();
                    if d < 1e-9 {
                        continue;
                    }
                    for c in 0..3 {
                        let u = weight * dx[c] / d;
                        grad[[b, i, c]] -= u;
                        grad[[b, j, c]] += u;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3, arr2};

    fn pair_table() -> ClashTable {
        // atom 0 sees atom 1 plus one padded slot
        ClashTable {
            neighbors: arr2(&[[1usize, 0]]),
            vdw_sum: arr2(&[[3.4, 3.4]]),
            allowance: arr2(&[[0.0, f64::INFINITY]]),
            subset: None,
        }
    }

    fn positions(distance: f64) -> Array3<f64> {
        let mut pos = Array3::zeros((1, 2, 3));
        pos[[0, 1, 0]] = distance;
        pos
    }

    #[test]
    fn penetration_engages_only_inside_the_contact_distance() {
        let table = pair_table();
        // contact distance = vdw_sum − overlap = 2.9
        let far = forward(positions(3.0).view(), &table, 0.5);
        assert_eq!(far.sum_with_bonus(0.0), 0.0);
        assert_eq!(far.n_contacts(), 0);

        let near = forward(positions(2.5).view(), &table, 0.5);
        assert!((near.penetration[[0, 0, 0]] - 0.4).abs() < 1e-12);
        let nearer = forward(positions(2.0).view(), &table, 0.5);
        assert!(nearer.penetration[[0, 0, 0]] > near.penetration[[0, 0, 0]]);
    }

    #[test]
    fn padded_slots_contribute_nothing() {
        let table = pair_table();
        let eval = forward(positions(0.1).view(), &table, 0.5);
        assert_eq!(eval.penetration[[0, 0, 1]], 0.0);
        let mut grad = Array3::zeros((1, 2, 3));
        eval.backward(positions(0.1).view(), &table, 1.0, &mut grad);
        assert!(grad[[0, 0, 0]].is_finite());
    }

    #[test]
    fn sign_bonus_counts_pairs_once_each() {
        let table = pair_table();
        let eval = forward(positions(2.5).view(), &table, 0.5);
        let plain = eval.sum_with_bonus(0.0);
        let with_bonus = eval.sum_with_bonus(0.1);
        assert!((with_bonus - plain - 0.1).abs() < 1e-12);
    }

    #[test]
    fn subset_rows_query_their_own_atom() {
        let table = ClashTable {
            neighbors: arr2(&[[0usize]]),
            vdw_sum: arr2(&[[3.0]]),
            allowance: Array2::zeros((1, 1)),
            subset: Some(vec![2]),
        };
        let mut pos = Array3::zeros((1, 3, 3));
        pos[[0, 2, 0]] = 1.0; // atom 2 vs atom 0 at distance 1
        let eval = forward(pos.view(), &table, 0.5);
        assert!((eval.penetration[[0, 0, 0]] - 1.5).abs() < 1e-12);
    }

    #[test]
    fn backward_matches_finite_differences() {
        let table = ClashTable {
            neighbors: arr2(&[[1usize, 2], [0, 2]]),
            vdw_sum: arr2(&[[3.4, 3.2], [3.4, 3.3]]),
            allowance: Array2::zeros((2, 2)),
            subset: None,
        };
        let mut pos = Array3::zeros((1, 3, 3));
        let coords = [[0.0, 0.1, -0.2], [1.9, 0.4, 0.3], [-0.8, 1.4, 0.9]];
        for (i, c) in coords.iter().enumerate() {
            for k in 0..3 {
                pos[[0, i, k]] = c[k];
            }
        }

        let eval = forward(pos.view(), &table, 0.5);
        assert!(eval.n_contacts() > 0);
        let mut grad = Array3::zeros((1, 3, 3));
        eval.backward(pos.view(), &table, 0.7, &mut grad);

        let loss = |p: &Array3<f64>| 0.7 * forward(p.view(), &table, 0.5).sum_with_bonus(0.0);
        let eps = 1e-6;
        for a in 0..3 {
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
