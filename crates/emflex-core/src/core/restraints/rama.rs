use ndarray::{Array2, Array3, ArrayView3};

use super::dihedrals::{atom, dihedral, dihedral_grad};
use super::relu;
use crate::core::model::topology::RamaRow;

const DEG: f64 = 180.0 / std::f64::consts::PI;

/// Backbone conformation class selecting which outlier grid scores a
/// residue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RamaClass {
    General,
    Glycine,
    ProlineCis,
    ProlineTrans,
    IleVal,
    PreProline,
}

impl RamaClass {
    pub const ALL: [RamaClass; 6] = [
        RamaClass::General,
        RamaClass::Glycine,
        RamaClass::ProlineCis,
        RamaClass::ProlineTrans,
        RamaClass::IleVal,
        RamaClass::PreProline,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::General => 0,
            Self::Glycine => 1,
            Self::ProlineCis => 2,
            Self::ProlineTrans => 3,
            Self::IleVal => 4,
            Self::PreProline => 5,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Glycine => "glycine",
            Self::ProlineCis => "pro-cis",
            Self::ProlineTrans => "pro-trans",
            Self::IleVal => "ile-val",
            Self::PreProline => "pre-pro",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.token() == token)
    }
}

/// Square outlier-score grid over (phi, psi) ∈ [−180°, 180°)², scores in
/// [0, 1] with high = outlier. Lookup is wraparound bilinear.
#[derive(Debug, Clone)]
pub struct RamaGrid {
    bins: usize,
    values: Array2<f64>,
}

impl RamaGrid {
    pub fn new(values: Array2<f64>) -> Option<Self> {
        let (rows, cols) = values.dim();
        if rows == 0 || rows != cols {
            return None;
        }
        Some(Self { bins: rows, values })
    }

    fn cell(&self, phi_deg: f64, psi_deg: f64) -> (usize, usize, f64, f64) {
        let w = 360.0 / self.bins as f64;
        let u = (phi_deg + 180.0).rem_euclid(360.0) / w;
        let v = (psi_deg + 180.0).rem_euclid(360.0) / w;
        let (i, j) = (u.floor() as usize % self.bins, v.floor() as usize % self.bins);
        (i, j, u - u.floor(), v - v.floor())
    }

    pub fn score(&self, phi_deg: f64, psi_deg: f64) -> f64 {
        let (i, j, fu, fv) = self.cell(phi_deg, psi_deg);
        let (i1, j1) = ((i + 1) % self.bins, (j + 1) % self.bins);
        self.values[[i, j]] * (1.0 - fu) * (1.0 - fv)
            + self.values[[i1, j]] * fu * (1.0 - fv)
            + self.values[[i1, j1]] * fu * fv
            + self.values[[i, j1]] * (1.0 - fu) * fv
    }

    /// Score plus its derivative with respect to the two angles in degrees.
    pub fn score_grad(&self, phi_deg: f64, psi_deg: f64) -> (f64, f64, f64) {
        let (i, j, fu, fv) = self.cell(phi_deg, psi_deg);
        let (i1, j1) = ((i + 1) % self.bins, (j + 1) % self.bins);
        let (g00, g10, g11, g01) = (
            self.values[[i, j]],
            self.values[[i1, j]],
            self.values[[i1, j1]],
            self.values[[i, j1]],
        );
        let score = g00 * (1.0 - fu) * (1.0 - fv) + g10 * fu * (1.0 - fv) + g11 * fu * fv
            + g01 * (1.0 - fu) * fv;
        let w = 360.0 / self.bins as f64;
        let d_phi = ((1.0 - fv) * (g10 - g00) + fv * (g11 - g01)) / w;
        let d_psi = ((1.0 - fu) * (g01 - g00) + fu * (g11 - g10)) / w;
        (score, d_phi, d_psi)
    }
}

/// One grid per backbone class.
#[derive(Debug, Clone, Default)]
pub struct RamaTables {
    grids: [Option<RamaGrid>; 6],
}

impl RamaTables {
    pub fn insert(&mut self, class: RamaClass, grid: RamaGrid) {
        self.grids[class.index()] = Some(grid);
    }

    pub fn grid(&self, class: RamaClass) -> Option<&RamaGrid> {
        self.grids[class.index()].as_ref()
    }

    /// Classes referenced by the rows but missing a grid.
    pub fn missing_for(&self, rows: &[RamaRow]) -> Vec<RamaClass> {
        let mut missing: Vec<RamaClass> = rows
            .iter()
            .map(|r| r.class)
            .filter(|c| self.grid(*c).is_none())
            .collect();
        missing.sort_by_key(|c| c.index());
        missing.dedup();
        missing
    }
}

/// Per-residue outlier scores from the class grids.
#[derive(Debug, Clone)]
pub struct RamaEval {
    pub scores: Array2<f64>,
}

pub fn forward(pos: ArrayView3<f64>, rows: &[RamaRow], tables: &RamaTables) -> RamaEval {
    let batch = pos.dim().0;
    let mut scores = Array2::zeros((batch, rows.len()));
    for b in 0..batch {
        for (r, row) in rows.iter().enumerate() {
            if let Some(grid) = tables.grid(row.class) {
                let (phi, psi) = angles_deg(&pos, b, row);
                scores[[b, r]] = grid.score(phi, psi);
            }
        }
    }
    RamaEval { scores }
}

fn angles_deg(pos: &ArrayView3<f64>, b: usize, row: &RamaRow) -> (f64, f64) {
    let a = |i: usize| atom(pos, b, row.atoms[i]);
    let phi = dihedral(a(0), a(1), a(2), a(3)) * DEG;
    let psi = dihedral(a(4), a(5), a(6), a(7)) * DEG;
    (phi, psi)
}

impl RamaEval {
    pub fn mean(&self) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        self.scores.sum() / self.scores.len() as f64
    }

    /// mean(relu(score − threshold)) for one outlier tier.
    pub fn tier_mean(&self, threshold: f64) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        self.scores.iter().map(|&s| relu(s - threshold)).sum::<f64>() / self.scores.len() as f64
    }

    /// Accumulates the combined cotangent: `lin_weight` on the plain mean
    /// plus one weight per relu tier.
    pub fn backward(
        &self,
        pos: ArrayView3<f64>,
        rows: &[RamaRow],
        tables: &RamaTables,
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
            for (r, row) in rows.iter().enumerate() {
                let Some(grid) = tables.grid(row.class) else {
                    continue;
                };
                let s = self.scores[[b, r]];
                let mut coeff = lin_weight;
                for &(threshold, weight) in tiers {
                    if s > threshold {
                        coeff += weight;
                    }
                }
                if coeff == 0.0 {
                    continue;
                }
                coeff /= norm;

                let (phi, psi) = angles_deg(&pos, b, row);
                let (_, d_phi, d_psi) = grid.score_grad(phi, psi);
                let a = |i: usize| atom(&pos, b, row.atoms[i]);
                let (_, g_phi) = dihedral_grad(a(0), a(1), a(2), a(3));
                let (_, g_psi) = dihedral_grad(a(4), a(5), a(6), a(7));
                for k in 0..4 {
                    for c in 0..3 {
                        grad[[b, row.atoms[k], c]] += coeff * d_phi * DEG * g_phi[k][c];
                        grad[[b, row.atoms[4 + k], c]] += coeff * d_psi * DEG * g_psi[k][c];
                    }
                }
            }
        }
    }
}
