use tracing::debug;

use super::ModelError;
use super::hydrogens::HydrogenSet;
use crate::core::restraints::rama::RamaClass;

/// Atom-type codes used by the clash overlap rules: polar hydrogen 0,
/// carbon 1, nitrogen 2, oxygen 3, sulfur/phosphorus 4, everything else
/// (metals and hydrogen bonded to carbon) 9.
pub const TYPE_POLAR_H: u8 = 0;
pub const TYPE_CARBON: u8 = 1;
pub const TYPE_OXYGEN: u8 = 3;
pub const TYPE_OTHER: u8 = 9;

static ELEMENT_TYPES: phf::Map<&'static str, u8> = phf::phf_map! {
    "H" => 0u8,
    "C" => 1u8,
    "N" => 2u8,
    "O" => 3u8,
    "S" => 4u8,
    "P" => 4u8,
};

/// Residue names treated as nucleotides when anchor patches force all
/// nucleic-acid chains into one shared chain class.
pub static NUCLEOTIDE_RESIDUES: phf::Set<&'static str> = phf::phf_set! {
    "A", "T", "C", "G", "U", "I", "DA", "DT", "DC", "DG", "DU", "DI",
};

pub fn element_type_code(element: &str) -> u8 {
    ELEMENT_TYPES
        .get(element.to_ascii_uppercase().as_str())
        .copied()
        .unwrap_or(TYPE_OTHER)
}

#[derive(Debug, Clone, PartialEq)]
pub struct BondRow {
    pub i: usize,
    pub j: usize,
    pub ideal: f64,
    pub tolerance: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AngleRow {
    pub i: usize,
    pub j: usize,
    pub k: usize,
    pub ideal: f64,
    pub tolerance: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RamaRow {
    /// phi quadruple then psi quadruple.
    pub atoms: [usize; 8],
    pub class: RamaClass,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChiRow {
    pub atoms: [usize; 4],
    /// Residue ordinal the angle belongs to.
    pub residue: usize,
    /// Chi number, 1..=4.
    pub chi: usize,
}

/// Immutable stereochemical topology of the model. Built once from the input
/// tables; the only permitted growth is appending hydrogens, which extends
/// the bond graph, radii, and atom types past the `n_heavy` boundary while
/// the restraint tables keep covering heavy atoms only.
#[derive(Debug, Clone)]
pub struct Topology {
    pub bonds: Vec<BondRow>,
    pub angles: Vec<AngleRow>,
    pub rama: Vec<RamaRow>,
    pub planes: Vec<[usize; 4]>,
    pub peptide_planes: Vec<[usize; 4]>,
    pub chi: Vec<ChiRow>,
    pub vdw_radius: Vec<f64>,
    pub atom_type: Vec<u8>,
    adjacency: Vec<Vec<usize>>,
    n_heavy: usize,
}

impl Topology {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        n_atoms: usize,
        bonds: Vec<BondRow>,
        angles: Vec<AngleRow>,
        rama: Vec<RamaRow>,
        planes: Vec<[usize; 4]>,
        peptide_planes: Vec<[usize; 4]>,
        chi: Vec<ChiRow>,
        vdw_radius: Vec<f64>,
        atom_type: Vec<u8>,
    ) -> Result<Self, ModelError> {
        let check = |table: &'static str, index: usize| -> Result<(), ModelError> {
            if index >= n_atoms {
                Err(ModelError::IndexOutOfRange {
                    table,
                    index,
                    n_atoms,
                })
            } else {
                Ok(())
            }
        };
        for b in &bonds {
            check("bonds", b.i)?;
            check("bonds", b.j)?;
        }
        for a in &angles {
            check("angles", a.i)?;
            check("angles", a.j)?;
            check("angles", a.k)?;
        }
        for r in &rama {
            for &i in &r.atoms {
                check("rama", i)?;
            }
        }
        for p in planes.iter().chain(peptide_planes.iter()) {
            for &i in p {
                check("planes", i)?;
            }
        }
        for c in &chi {
            for &i in &c.atoms {
                check("chi", i)?;
            }
        }
        if vdw_radius.len() != n_atoms {
            return Err(ModelError::LengthMismatch {
                table: "vdw radii",
                expected: n_atoms,
                found: vdw_radius.len(),
            });
        }
        if atom_type.len() != n_atoms {
            return Err(ModelError::LengthMismatch {
                table: "atom types",
                expected: n_atoms,
                found: atom_type.len(),
            });
        }

        let mut adjacency = vec![Vec::new(); n_atoms];
        for b in &bonds {
            adjacency[b.i].push(b.j);
            adjacency[b.j].push(b.i);
        }

        Ok(Self {
            bonds,
            angles,
            rama,
            planes,
            peptide_planes,
            chi,
            vdw_radius,
            atom_type,
            adjacency,
            n_heavy: n_atoms,
        })
    }

    pub fn n_atoms(&self) -> usize {
        self.adjacency.len()
    }

    pub fn n_heavy(&self) -> usize {
        self.n_heavy
    }

    /// Appends the hydrogen set past the heavy-atom boundary: one bond-graph
    /// edge to each parent, the template radius, and the atom type (bonded
    /// to carbon → nonpolar 9, otherwise polar 0). Restraint tables keep
    /// covering heavy atoms only. May be called once.
    pub fn append_hydrogens(&mut self, hydrogens: &HydrogenSet) -> Result<(), ModelError> {
        if self.adjacency.len() != self.n_heavy {
            return Err(ModelError::HydrogensAppended);
        }
        let n_heavy = self.n_heavy;
        for (offset, row) in hydrogens.rows().iter().enumerate() {
            let h_index = n_heavy + offset;
            self.adjacency.push(vec![row.parent]);
            self.adjacency[row.parent].push(h_index);
            self.vdw_radius.push(row.radius);
            let code = if self.atom_type[row.parent] == TYPE_CARBON {
                TYPE_OTHER
            } else {
                TYPE_POLAR_H
            };
            self.atom_type.push(code);
        }
        Ok(())
    }

    /// For each atom, the sorted set of atoms within `max_hops` bonds of
    /// it (itself included); these pairs are never clash candidates.
    /// Sources are processed in fixed-size chunks to keep the transient
    /// frontier memory bounded on hydrogen-bearing models.
    pub fn graph_exclusions(&self, max_hops: usize, chunk: usize) -> Vec<Vec<usize>> {
        let n = self.adjacency.len();
        let mut all = Vec::with_capacity(n);
        let chunk = chunk.max(1);
        for start in (0..n).step_by(chunk) {
            let end = (start + chunk).min(n);
            for source in start..end {
                all.push(self.bfs_within(source, max_hops));
            }
            debug!(done = end, total = n, "bond-graph exclusion chunk");
        }
        all
    }

    fn bfs_within(&self, source: usize, max_hops: usize) -> Vec<usize> {
        let mut found = vec![source];
        let mut frontier = vec![source];
        for _ in 0..max_hops {
            let mut next = Vec::new();
            for &a in &frontier {
                for &b in &self.adjacency[a] {
                    if !found.contains(&b) {
                        found.push(b);
                        next.push(b);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        found.sort_unstable();
        found
    }
}
