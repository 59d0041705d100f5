pub mod anchors;
pub mod hydrogens;
pub mod mask;
pub mod points;
pub mod topology;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Table '{table}' references atom index {index}, but the model has {n_atoms} atoms")]
    IndexOutOfRange {
        table: &'static str,
        index: usize,
        n_atoms: usize,
    },

    #[error("Table '{table}' has {found} rows, expected {expected}")]
    LengthMismatch {
        table: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(
        "Working box of {working} px cannot exceed the raw box of {raw} px; \
         requested resolution is finer than the data supports"
    )]
    BoxTooLarge { working: usize, raw: usize },

    #[error("Hydrogens have already been appended to this topology")]
    HydrogensAppended,

    #[error("Mask weight at point {index} is {value}, expected a value in [0, 1]")]
    MaskWeight { index: usize, value: f64 },

    #[error("With a region mask the patch count must exceed 32, got {0}")]
    TooFewPatches(usize),

    #[error("Model is empty")]
    Empty,
}

/// Per-atom record carried alongside the numeric point cloud. The coordinates
/// themselves live in [`points::PointCloud`]; this is the naming needed for
/// residue grouping, atom typing, and snapshot export.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomMeta {
    pub chain: String,
    pub residue_seq: i64,
    pub residue_name: String,
    pub atom_name: String,
    pub element: String,
}

/// The loaded structural model: point cloud in normalized box coordinates,
/// per-atom metadata, and the atom → residue grouping derived from it.
///
/// Residue ordinals follow first appearance in the input table, so atoms of
/// one residue always map to one ordinal regardless of chain naming.
#[derive(Debug, Clone)]
pub struct PointModel {
    pub cloud: points::PointCloud,
    pub meta: Vec<AtomMeta>,
    pub residue_index: Vec<usize>,
    pub n_residues: usize,
}

impl PointModel {
    pub fn new(cloud: points::PointCloud, meta: Vec<AtomMeta>) -> Result<Self, ModelError> {
        if cloud.len() == 0 {
            return Err(ModelError::Empty);
        }
        if cloud.len() != meta.len() {
            return Err(ModelError::LengthMismatch {
                table: "model",
                expected: cloud.len(),
                found: meta.len(),
            });
        }

        let mut residue_index = Vec::with_capacity(meta.len());
        let mut seen: Vec<(String, i64)> = Vec::new();
        for m in &meta {
            let key = (m.chain.clone(), m.residue_seq);
            let ordinal = match seen.iter().position(|k| *k == key) {
                Some(i) => i,
                None => {
                    seen.push(key);
                    seen.len() - 1
                }
            };
            residue_index.push(ordinal);
        }
        let n_residues = seen.len();

        Ok(Self {
            cloud,
            meta,
            residue_index,
            n_residues,
        })
    }

    pub fn n_atoms(&self) -> usize {
        self.cloud.len()
    }

    /// Atoms of each residue, in residue-ordinal order.
    pub fn residue_members(&self) -> Vec<Vec<usize>> {
        let mut members = vec![Vec::new(); self.n_residues];
        for (atom, &res) in self.residue_index.iter().enumerate() {
            members[res].push(atom);
        }
        members
    }
}
