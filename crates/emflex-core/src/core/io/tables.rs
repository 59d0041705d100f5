use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use ndarray::{Array2, Array3, ArrayView2};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::core::model::anchors::{self, Anchors};
use crate::core::model::hydrogens::{HydrogenRow, HydrogenSet};
use crate::core::model::mask::RegionMask;
use crate::core::model::points::{GridFrame, PointCloud};
use crate::core::model::topology::{AngleRow, BondRow, ChiRow, RamaRow};
use crate::core::model::{AtomMeta, ModelError, PointModel};
use crate::core::restraints::rama::{RamaClass, RamaGrid, RamaTables};
use crate::core::restraints::rotamers::{ResidueRotamers, RotamerEntry};

#[derive(Debug, Error)]
pub enum TableLoadError {
    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("CSV parsing error for '{path}': {source}")]
    Csv { path: String, source: csv::Error },

    #[error("Malformed table '{path}', data row {row}: {message}")]
    Row {
        path: String,
        row: usize,
        message: String,
    },

    #[error(transparent)]
    Model(#[from] ModelError),
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, TableLoadError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| TableLoadError::Csv {
        path: path_str(path),
        source: e,
    })?;
    let mut rows = Vec::new();
    for result in reader.deserialize::<T>() {
        rows.push(result.map_err(|e| TableLoadError::Csv {
            path: path_str(path),
            source: e,
        })?);
    }
    Ok(rows)
}

#[derive(Debug, Deserialize, Serialize)]
struct ModelRecord {
    chain: String,
    residue_seq: i64,
    residue_name: String,
    atom_name: String,
    element: String,
    x: f64,
    y: f64,
    z: f64,
    amplitude: f64,
}

/// Loads the per-atom model table, converting coordinates from ångströms
/// into the normalized box frame.
pub fn load_model(path: &Path, frame: &GridFrame) -> Result<PointModel, TableLoadError> {
    let records: Vec<ModelRecord> = read_rows(path)?;
    let mut data = Array2::zeros((records.len(), 4));
    let mut meta = Vec::with_capacity(records.len());
    for (i, r) in records.into_iter().enumerate() {
        let b = frame.box_from_physical([r.x, r.y, r.z]);
        for c in 0..3 {
            data[[i, c]] = b[c];
        }
        data[[i, 3]] = r.amplitude;
        meta.push(AtomMeta {
            chain: r.chain,
            residue_seq: r.residue_seq,
            residue_name: r.residue_name,
            atom_name: r.atom_name,
            element: r.element,
        });
    }
    debug!(n_atoms = meta.len(), path = %path.display(), "model table loaded");
    Ok(PointModel::new(PointCloud::new(data)?, meta)?)
}

/// Writes one structural snapshot in the model-table schema. `cloud` holds
/// the decoded (n_atoms, 4) box-frame rows for the model's heavy atoms;
/// when a hydrogen set is given the riding hydrogens are placed and
/// appended with their parent's residue naming.
pub fn write_snapshot(
    path: &Path,
    model: &PointModel,
    frame: &GridFrame,
    cloud: ArrayView2<'_, f64>,
    hydrogens: Option<&HydrogenSet>,
) -> Result<(), TableLoadError> {
    let csv_err = |e| TableLoadError::Csv {
        path: path_str(path),
        source: e,
    };
    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
    let n_heavy = model.n_atoms();
    let mut physical = Array3::zeros((1, n_heavy, 3));
    for i in 0..n_heavy {
        let p = frame.physical_from_box([cloud[[i, 0]], cloud[[i, 1]], cloud[[i, 2]]]);
        for c in 0..3 {
            physical[[0, i, c]] = p[c];
        }
    }
    for (i, meta) in model.meta.iter().enumerate() {
        writer
            .serialize(ModelRecord {
                chain: meta.chain.clone(),
                residue_seq: meta.residue_seq,
                residue_name: meta.residue_name.clone(),
                atom_name: meta.atom_name.clone(),
                element: meta.element.clone(),
                x: physical[[0, i, 0]],
                y: physical[[0, i, 1]],
                z: physical[[0, i, 2]],
                amplitude: cloud[[i, 3]],
            })
            .map_err(csv_err)?;
    }
    if let Some(set) = hydrogens {
        let full = set.place(physical.view());
        for (k, row) in set.rows().iter().enumerate() {
            let parent = &model.meta[row.parent];
            writer
                .serialize(ModelRecord {
                    chain: parent.chain.clone(),
                    residue_seq: parent.residue_seq,
                    residue_name: parent.residue_name.clone(),
                    atom_name: row.name.clone(),
                    element: "H".to_string(),
                    x: full[[0, n_heavy + k, 0]],
                    y: full[[0, n_heavy + k, 1]],
                    z: full[[0, n_heavy + k, 2]],
                    amplitude: 0.0,
                })
                .map_err(csv_err)?;
        }
    }
    writer.flush().map_err(|e| TableLoadError::Io {
        path: path_str(path),
        source: e,
    })
}

#[derive(Debug, Deserialize)]
struct BondRecord {
    i: usize,
    j: usize,
    ideal: f64,
    tolerance: f64,
}

pub fn load_bonds(path: &Path) -> Result<Vec<BondRow>, TableLoadError> {
    Ok(read_rows::<BondRecord>(path)?
        .into_iter()
        .map(|r| BondRow {
            i: r.i,
            j: r.j,
            ideal: r.ideal,
            tolerance: r.tolerance,
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct AngleRecord {
    i: usize,
    j: usize,
    k: usize,
    ideal: f64,
    tolerance: f64,
}

pub fn load_angles(path: &Path) -> Result<Vec<AngleRow>, TableLoadError> {
    Ok(read_rows::<AngleRecord>(path)?
        .into_iter()
        .map(|r| AngleRow {
            i: r.i,
            j: r.j,
            k: r.k,
            ideal: r.ideal,
            tolerance: r.tolerance,
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct RamaRecord {
    phi_a: usize,
    phi_b: usize,
    phi_c: usize,
    phi_d: usize,
    psi_a: usize,
    psi_b: usize,
    psi_c: usize,
    psi_d: usize,
    class: String,
}

pub fn load_rama_rows(path: &Path) -> Result<Vec<RamaRow>, TableLoadError> {
    let records: Vec<RamaRecord> = read_rows(path)?;
    let mut rows = Vec::with_capacity(records.len());
    for (row, r) in records.into_iter().enumerate() {
        let class = RamaClass::parse(&r.class).ok_or_else(|| TableLoadError::Row {
            path: path_str(path),
            row,
            message: format!("unknown backbone class '{}'", r.class),
        })?;
        rows.push(RamaRow {
            atoms: [
                r.phi_a, r.phi_b, r.phi_c, r.phi_d, r.psi_a, r.psi_b, r.psi_c, r.psi_d,
            ],
            class,
        });
    }
    Ok(rows)
}

#[derive(Debug, Deserialize)]
struct PlaneRecord {
    a: usize,
    b: usize,
    c: usize,
    d: usize,
}

/// Loads a quadruple table; used for both ring/side-chain planes and
/// peptide planes.
pub fn load_planes(path: &Path) -> Result<Vec<[usize; 4]>, TableLoadError> {
    Ok(read_rows::<PlaneRecord>(path)?
        .into_iter()
        .map(|r| [r.a, r.b, r.c, r.d])
        .collect())
}

#[derive(Debug, Deserialize)]
struct ChiRecord {
    a: usize,
    b: usize,
    c: usize,
    d: usize,
    residue: usize,
    chi: usize,
}

pub fn load_chi(path: &Path) -> Result<Vec<ChiRow>, TableLoadError> {
    Ok(read_rows::<ChiRecord>(path)?
        .into_iter()
        .map(|r| ChiRow {
            atoms: [r.a, r.b, r.c, r.d],
            residue: r.residue,
            chi: r.chi,
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct VdwRecord {
    radius: f64,
}

/// Per-atom van-der-Waals radii, one row per atom in model order.
pub fn load_vdw(path: &Path) -> Result<Vec<f64>, TableLoadError> {
    Ok(read_rows::<VdwRecord>(path)?
        .into_iter()
        .map(|r| r.radius)
        .collect())
}

#[derive(Debug, Deserialize)]
struct MaskRecord {
    weight: f64,
}

pub fn load_mask(path: &Path, n_atoms: usize) -> Result<RegionMask, TableLoadError> {
    let weights: Vec<f64> = read_rows::<MaskRecord>(path)?
        .into_iter()
        .map(|r| r.weight)
        .collect();
    Ok(RegionMask::from_weights(weights, n_atoms)?)
}

#[derive(Debug, Deserialize)]
struct HydrogenRecord {
    name: String,
    parent: usize,
    ref_a: usize,
    ref_b: usize,
    dx: f64,
    dy: f64,
    dz: f64,
    radius: f64,
}

pub fn load_hydrogens(path: &Path, n_heavy: usize) -> Result<HydrogenSet, TableLoadError> {
    let rows = read_rows::<HydrogenRecord>(path)?
        .into_iter()
        .map(|r| HydrogenRow {
            name: r.name,
            parent: r.parent,
            ref_a: r.ref_a,
            ref_b: r.ref_b,
            offset: [r.dx, r.dy, r.dz],
            radius: r.radius,
        })
        .collect();
    Ok(HydrogenSet::new(rows, n_heavy)?)
}

#[derive(Debug, Deserialize, Serialize)]
struct AnchorRecord {
    x: f64,
    y: f64,
    z: f64,
    chain_class: f64,
}

pub fn save_anchors(path: &Path, anchors: &Anchors) -> Result<(), TableLoadError> {
    let csv_err = |e| TableLoadError::Csv {
        path: path_str(path),
        source: e,
    };
    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
    for row in anchors.centers.outer_iter() {
        writer
            .serialize(AnchorRecord {
                x: row[0],
                y: row[1],
                z: row[2],
                chain_class: row[3],
            })
            .map_err(csv_err)?;
    }
    writer.flush().map_err(|e| TableLoadError::Io {
        path: path_str(path),
        source: e,
    })
}

/// Reloads persisted anchor centers and recomputes the residue-coherent
/// assignment for the current model.
pub fn load_anchors(path: &Path, model: &PointModel) -> Result<Anchors, TableLoadError> {
    let records: Vec<AnchorRecord> = read_rows(path)?;
    if records.is_empty() {
        return Err(TableLoadError::Row {
            path: path_str(path),
            row: 0,
            message: "anchor table is empty".to_string(),
        });
    }
    let mut centers = Array2::zeros((records.len(), 4));
    for (i, r) in records.iter().enumerate() {
        centers[[i, 0]] = r.x;
        centers[[i, 1]] = r.y;
        centers[[i, 2]] = r.z;
        centers[[i, 3]] = r.chain_class;
    }
    let assignment = anchors::assign(model, &centers);
    Ok(Anchors {
        centers,
        assignment,
    })
}

#[derive(Debug, Deserialize)]
struct RamaGridRecord {
    class: String,
    phi_bin: usize,
    psi_bin: usize,
    score: f64,
}

/// Loads the per-class Ramachandran outlier grids from one long-format
/// table. Each class must fill a complete square grid.
pub fn load_rama_tables(path: &Path) -> Result<RamaTables, TableLoadError> {
    let records: Vec<RamaGridRecord> = read_rows(path)?;
    let mut by_class: BTreeMap<String, Vec<(usize, usize, f64)>> = BTreeMap::new();
    for (row, r) in records.into_iter().enumerate() {
        if RamaClass::parse(&r.class).is_none() {
            return Err(TableLoadError::Row {
                path: path_str(path),
                row,
                message: format!("unknown backbone class '{}'", r.class),
            });
        }
        by_class
            .entry(r.class)
            .or_default()
            .push((r.phi_bin, r.psi_bin, r.score));
    }

    let mut tables = RamaTables::default();
    for (token, cells) in by_class {
        let class = RamaClass::parse(&token).unwrap_or(RamaClass::General);
        let bins = cells
            .iter()
            .map(|&(p, s, _)| p.max(s))
            .max()
            .unwrap_or(0)
            + 1;
        if cells.len() != bins * bins {
            return Err(TableLoadError::Row {
                path: path_str(path),
                row: cells.len(),
                message: format!(
                    "class '{token}' has {} cells, expected a full {bins}×{bins} grid",
                    cells.len()
                ),
            });
        }
        let mut values = Array2::zeros((bins, bins));
        for (phi, psi, score) in cells {
            values[[phi, psi]] = score;
        }
        let grid = RamaGrid::new(values).ok_or_else(|| TableLoadError::Row {
            path: path_str(path),
            row: 0,
            message: format!("class '{token}' grid is not square"),
        })?;
        tables.insert(class, grid);
    }
    Ok(tables)
}

#[derive(Debug, Deserialize)]
struct RotamerRecord {
    residue: String,
    rotamer: usize,
    chi: usize,
    mean: f64,
    width: f64,
    weight: f64,
}

/// Rotamer mixtures per residue type, loaded from the long-format library
/// table (one row per rotamer × chi).
#[derive(Debug, Clone, Default)]
pub struct RotamerLibrary {
    entries: HashMap<String, Vec<RotamerEntry>>,
}

impl RotamerLibrary {
    pub fn load(path: &Path) -> Result<Self, TableLoadError> {
        let records: Vec<RotamerRecord> = read_rows(path)?;
        let mut grouped: BTreeMap<(String, usize), (f64, BTreeMap<usize, (f64, f64)>)> =
            BTreeMap::new();
        for r in records {
            let slot = grouped
                .entry((r.residue, r.rotamer))
                .or_insert_with(|| (r.weight, BTreeMap::new()));
            slot.0 = r.weight;
            slot.1.insert(r.chi, (r.mean, r.width));
        }
        let mut entries: HashMap<String, Vec<RotamerEntry>> = HashMap::new();
        for ((residue, _), (weight, chis)) in grouped {
            let mut mean = Vec::with_capacity(chis.len());
            let mut width = Vec::with_capacity(chis.len());
            for (_, (m, w)) in chis {
                mean.push(m);
                width.push(w);
            }
            entries
                .entry(residue)
                .or_default()
                .push(RotamerEntry {
                    weight,
                    mean,
                    width,
                });
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, residue: &str) -> Option<&[RotamerEntry]> {
        self.entries.get(residue).map(Vec::as_slice)
    }

    /// Builds the per-residue rotamer slots for the loaded model: chi rows
    /// grouped by residue ordinal and ordered chi1 first, matched against
    /// the library entries with the same chi count. Residues without a
    /// matching entry simply get no slot.
    pub fn slots(&self, model: &PointModel, chi_table: &[ChiRow]) -> Vec<ResidueRotamers> {
        let mut per_residue: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
        for (row, c) in chi_table.iter().enumerate() {
            per_residue.entry(c.residue).or_default().push((c.chi, row));
        }
        let members = model.residue_members();
        let mut slots = Vec::new();
        for (residue, mut rows) in per_residue {
            rows.sort_unstable();
            let chi_rows: Vec<usize> = rows.iter().map(|&(_, r)| r).collect();
            let Some(&first_atom) = members.get(residue).and_then(|m| m.first()) else {
                continue;
            };
            let name = model.meta[first_atom].residue_name.as_str();
            let Some(library) = self.entries.get(name) else {
                continue;
            };
            let entries: Vec<RotamerEntry> = library
                .iter()
                .filter(|e| e.mean.len() == chi_rows.len())
                .cloned()
                .collect();
            if entries.is_empty() {
                debug!(residue = name, n_chi = chi_rows.len(), "no rotamer entry matches");
                continue;
            }
            slots.push(ResidueRotamers { chi_rows, entries });
        }
        slots
    }
}
