use ndarray::Array1;

use super::ModelError;

/// Points below this weight count as fixed periphery when anchor patches
/// are seeded.
pub const PERIPHERY_THRESHOLD: f64 = 0.1;

/// Points above this weight form the moving domain for the secondary
/// clash index.
pub const MOBILE_THRESHOLD: f64 = 0.5;

/// Per-point weight in [0, 1] gating the coarse decoder displacements.
/// `None` leaves every point free. Weights cover heavy atoms only;
/// hydrogens inherit their parent's weight where a subset is needed.
#[derive(Debug, Clone, Default)]
pub enum RegionMask {
    #[default]
    None,
    Weights(Vec<f64>),
}

impl RegionMask {
    pub fn from_weights(weights: Vec<f64>, n_atoms: usize) -> Result<Self, ModelError> {
        if weights.len() != n_atoms {
            return Err(ModelError::LengthMismatch {
                table: "mask weights",
                expected: n_atoms,
                found: weights.len(),
            });
        }
        for (index, &value) in weights.iter().enumerate() {
            if !(0.0..=1.0).contains(&value) {
                return Err(ModelError::MaskWeight { index, value });
            }
        }
        Ok(Self::Weights(weights))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// The gate column broadcast over displacement channels, all ones when
    /// no mask is set.
    pub fn gate(&self, n_atoms: usize) -> Array1<f64> {
        match self {
            Self::None => Array1::ones(n_atoms),
            Self::Weights(w) => Array1::from_vec(w.clone()),
        }
    }

    /// Splits points for anchor seeding: (periphery, mobile) index lists,
    /// weight < 0.1 and weight > 0.1 respectively. `None` masks have no
    /// split.
    pub fn seed_split(&self) -> Option<(Vec<usize>, Vec<usize>)> {
        let Self::Weights(w) = self else {
            return None;
        };
        let periphery = w
            .iter()
            .enumerate()
            .filter(|&(_, &v)| v < PERIPHERY_THRESHOLD)
            .map(|(i, _)| i)
            .collect();
        let mobile = w
            .iter()
            .enumerate()
            .filter(|&(_, &v)| v > PERIPHERY_THRESHOLD)
            .map(|(i, _)| i)
            .collect();
        Some((periphery, mobile))
    }

    /// Global indices of the moving domain over the hydrogen-widened model:
    /// heavy atoms with weight > 0.5, plus every hydrogen whose parent
    /// passes the same test. `hydrogen_parents[k]` is the parent heavy atom
    /// of hydrogen slot `n_heavy + k`.
    pub fn moving_subset(&self, hydrogen_parents: &[usize]) -> Option<Vec<usize>> {
        let Self::Weights(w) = self else {
            return None;
        };
        let n_heavy = w.len();
        let mut subset: Vec<usize> = (0..n_heavy).filter(|&i| w[i] > MOBILE_THRESHOLD).collect();
        for (k, &parent) in hydrogen_parents.iter().enumerate() {
            if w[parent] > MOBILE_THRESHOLD {
                subset.push(n_heavy + k);
            }
        }
        Some(subset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_mask_gates_nothing() {
        let mask = RegionMask::None;
        assert!(mask.gate(3).iter().all(|&v| v == 1.0));
        assert!(mask.seed_split().is_none());
        assert!(mask.moving_subset(&[]).is_none());
    }

    #[test]
    fn moving_subset_extends_to_hydrogens_by_parent() {
        let mask = RegionMask::from_weights(vec![0.9, 0.2, 0.7], 3).unwrap();
        // hydrogens 3 and 4 ride atoms 1 and 2
        let subset = mask.moving_subset(&[1, 2]).unwrap();
        assert_eq!(subset, vec![0, 2, 4]);
    }

    #[test]
    fn seed_split_partitions_around_the_periphery_threshold() {
        let mask = RegionMask::from_weights(vec![0.05, 0.5, 0.1, 0.95], 4).unwrap();
        let (periphery, mobile) = mask.seed_split().unwrap();
        assert_eq!(periphery, vec![0]);
        assert_eq!(mobile, vec![1, 3]); // exactly 0.1 lands in neither
    }

    #[test]
    fn out_of_range_weight_is_rejected() {
        let result = RegionMask::from_weights(vec![0.5, 1.2], 2);
        assert!(matches!(
            result,
            Err(ModelError::MaskWeight { index: 1, .. })
        ));
    }
}
