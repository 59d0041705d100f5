use ndarray::{Array2, Array3, ArrayView3};

use super::dihedrals::{atom, dihedral, dihedral_grad};
use super::relu;
use crate::core::model::topology::ChiRow;

const DEG: f64 = 180.0 / std::f64::consts::PI;

/// Baseline probability subtracted before scoring, so common near-rotamer
/// strain is free.
const PROBABILITY_FLOOR: f64 = 0.05;

/// One rotamer of a side chain: mixture weight plus per-chi mean and width
/// in degrees, means in [0, 360).
#[derive(Debug, Clone, PartialEq)]
pub struct RotamerEntry {
    pub weight: f64,
    pub mean: Vec<f64>,
    pub width: Vec<f64>,
}

/// All rotamers of one residue, with `chi_rows` pointing at the residue's
/// chi dihedrals in order (chi1 first).
#[derive(Debug, Clone)]
pub struct ResidueRotamers {
    pub chi_rows: Vec<usize>,
    pub entries: Vec<RotamerEntry>,
}

/// Rotamer outlier scores in [0, 1], one per residue slot; 1 means no
/// rotamer explains the side chain.
#[derive(Debug, Clone)]
pub struct RotamerEval {
    pub scores: Array2<f64>,
}

fn chi_angles(
    pos: &ArrayView3<f64>,
    b: usize,
    chi_table: &[ChiRow],
    slot: &ResidueRotamers,
) -> Vec<f64> {
    slot.chi_rows
        .iter()
        .map(|&row| {
            let a = chi_table[row].atoms;
            let phi = dihedral(
                atom(pos, b, a[0]),
                atom(pos, b, a[1]),
                atom(pos, b, a[2]),
                atom(pos, b, a[3]),
            );
            (phi * DEG).rem_euclid(360.0)
        })
        .collect()
}

fn likelihood(chis: &[f64], entries: &[RotamerEntry]) -> f64 {
    entries
        .iter()
        .map(|e| {
            let expo: f64 = chis
                .iter()
                .zip(e.mean.iter().zip(&e.width))
                .map(|(&chi, (&mu, &sigma))| {
                    let t = (chi - mu) / sigma;
                    t * t
                })
                .sum();
            e.weight * (-expo).exp()
        })
        .sum()
}

pub fn forward(
    pos: ArrayView3<f64>,
    chi_table: &[ChiRow],
    slots: &[ResidueRotamers],
) -> RotamerEval {
    let batch = pos.dim().0;
    let mut scores = Array2::zeros((batch, slots.len()));
    for b in 0..batch {
        for (s, slot) in slots.iter().enumerate() {
            let chis = chi_angles(&pos, b, chi_table, slot);
            let p = relu(likelihood(&chis, &slot.entries) - PROBABILITY_FLOOR);
            scores[[b, s]] = 1.0 - p;
        }
    }
    RotamerEval { scores }
}

impl RotamerEval {
    pub fn mean(&self) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        self.scores.sum() / self.scores.len() as f64
    }

    pub fn tier_mean(&self, threshold: f64) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        self.scores.iter().map(|&s| relu(s - threshold)).sum::<f64>() / self.scores.len() as f64
    }

    pub fn backward(
        &self,
        pos: ArrayView3<f64>,
        chi_table: &[ChiRow],
        slots: &[ResidueRotamers],
        lin_weight: f64,
        tiers: &[(f64, f64)],
        grad: &mut Array3<f64>,
    ) {
        if self.scores.is_empty() {
            return;
        }
        let norm = self.scores.len() as f64;
        let batch = pos.dim().0;
        for b in 0..batch {
            for (s, slot) in slots.iter().enumerate() {
                let score = self.scores[[b, s]];
                let mut coeff = lin_weight;
                for &(threshold, weight) in tiers {
                    if score > threshold {
                        coeff += weight;
                    }
                }
                if coeff == 0.0 {
                    continue;
                }
                coeff /= norm;

                let chis = chi_angles(&pos, b, chi_table, slot);
                if likelihood(&chis, &slot.entries) <= PROBABILITY_FLOOR {
                    continue; // score pinned at 1, flat
                }
                // dscore/dchi_c = −dp/dchi_c
                for (c, &row) in slot.chi_rows.iter().enumerate() {
                    let dp: f64 = slot
                        .entries
                        .iter()
                        .map(|e| {
                            let expo: f64 = chis
                                .iter()
                                .zip(e.mean.iter().zip(&e.width))
                                .map(|(&chi, (&mu, &sigma))| {
                                    let t = (chi - mu) / sigma;
                                    t * t
                                })
                                .sum();
                            let t_c = (chis[c] - e.mean[c]) / e.width[c];
                            e.weight * (-expo).exp() * (-2.0 * t_c / e.width[c])
                        })
                        .sum();
                    let a = chi_table[row].atoms;
                    let (_, g) = dihedral_grad(
                        atom(&pos, b, a[0]),
                        atom(&pos, b, a[1]),
                        atom(&pos, b, a[2]),
                        atom(&pos, b, a[3]),
                    );
                    let d_chi = -coeff * dp * DEG;
                    for k in 0..4 {
                        for ch in 0..3 {
                            grad[[b, a[k], ch]] += d_chi * g[k][ch];
                        }
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

    fn create_test_chain() -> (Array3<f64>, Vec<ChiRow>) {
        let mut pos = Array3::zeros((1, 5, 3));
        let coords = [
            [0.9, -0.2, 0.1],
            [0.1, 0.3, -0.2],
            [-0.1, 0.2, 1.1],
            [0.8, 0.7, 1.4],
            [1.5, -0.3, 1.9],
        ];
        for (i, c) in coords.iter().enumerate() {
            for k in 0..3 {
                pos[[0, i, k]] = c[k];
            }
        }
        let chi = vec![
            ChiRow { atoms: [0, 1, 2, 3], residue: 0, chi: 1 },
            ChiRow { atoms: [1, 2, 3, 4], residue: 0, chi: 2 },
        ];
        (pos, chi)
    }

    fn measured_chis(pos: &Array3<f64>, chi: &[ChiRow], slot: &ResidueRotamers) -> Vec<f64> {
        chi_angles(&pos.view(), 0, chi, slot)
    }

    #[test]
    fn matching_rotamer_scores_near_zero() {
        let (pos, chi) = create_test_chain();
        let mut slot = ResidueRotamers { chi_rows: vec![0, 1], entries: Vec::new() };
        let chis = measured_chis(&pos, &chi, &slot);
        slot.entries.push(RotamerEntry {
            weight: 1.0,
            mean: chis.clone(),
            width: vec![10.0, 10.0],
        });
        let eval = forward(pos.view(), &chi, &[slot]);
        // p = 1 at the mean, minus the floor
        assert!((eval.scores[[0, 0]] - PROBABILITY_FLOOR).abs() < 1e-9);
    }

    #[test]
    fn unexplained_side_chain_scores_one() {
        let (pos, chi) = create_test_chain();
        let slot = ResidueRotamers {
            chi_rows: vec![0, 1],
            entries: vec![RotamerEntry {
                weight: 1.0,
                mean: vec![0.0, 0.0],
                width: vec![1e-3, 1e-3],
            }],
        };
        let eval = forward(pos.view(), &chi, &[slot]);
        assert_eq!(eval.scores[[0, 0]], 1.0);
        assert_eq!(eval.tier_mean(0.99), 0.01);
    }

    #[test]
    fn backward_matches_finite_differences() {
        let (pos, chi) = create_test_chain();
        let mut slot = ResidueRotamers { chi_rows: vec![0, 1], entries: Vec::new() };
        let chis = measured_chis(&pos, &chi, &slot);
        // offset means so the gradient is nonzero but p stays above the floor
        slot.entries.push(RotamerEntry {
            weight: 0.7,
            mean: vec![chis[0] + 8.0, chis[1] - 5.0],
            width: vec![12.0, 12.0],
        });
        slot.entries.push(RotamerEntry {
            weight: 0.3,
            mean: vec![chis[0] - 20.0, chis[1] + 15.0],
            width: vec![15.0, 15.0],
        });
        let slots = vec![slot];

        let eval = forward(pos.view(), &chi, &slots);
        let score = eval.scores[[0, 0]];
        assert!(score > 0.0 && score < 1.0);

        let mut grad = Array3::zeros((1, 5, 3));
        let tiers = [(score - 0.01, 4.0)];
        eval.backward(pos.view(), &chi, &slots, 5.0, &tiers, &mut grad);

        let loss = |p: &Array3<f64>| {
            let e = forward(p.view(), &chi, &slots);
            5.0 * e.mean() + 4.0 * e.tier_mean(tiers[0].0)
        };
        let eps = 1e-6;
        for a in 0..5 {
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
