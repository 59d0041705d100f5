//! Clash-index construction. The candidate table is rebuilt from snapshot
//! geometry at fixed training milestones, never per step; between rebuilds
//! the atom positions move but the pair list stays fixed.

use kiddo::{KdTree, SquaredEuclidean};
use ndarray::{Array2, ArrayView2, ArrayView3, Axis};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use super::config::ClashConfig;
use crate::core::model::topology::{TYPE_OXYGEN, TYPE_POLAR_H};
use crate::core::restraints::clash::ClashTable;

/// Extra contact slack for polar-hydrogen / oxygen pairs, the hydrogen-bond
/// geometry the steric term must not punish.
pub const POLAR_H_OXYGEN_ALLOWANCE: f64 = 0.4;

/// One surviving candidate for a query atom: global neighbor id and the
/// gap `distance − vdw_sum` (negative means penetrating).
#[derive(Debug, Clone, Copy)]
struct Candidate {
    neighbor: usize,
    gap: f64,
}

/// Builds [`ClashTable`]s from a geometry snapshot, a bond-graph exclusion
/// list, and per-atom radii and type codes. Borrows everything; the same
/// builder serves every rebuild of a run.
pub struct ClashIndexBuilder<'a> {
    config: &'a ClashConfig,
    exclusions: &'a [Vec<usize>],
    vdw: &'a [f64],
    atom_type: &'a [u8],
}

impl<'a> ClashIndexBuilder<'a> {
    pub fn new(
        config: &'a ClashConfig,
        exclusions: &'a [Vec<usize>],
        vdw: &'a [f64],
        atom_type: &'a [u8],
    ) -> Self {
        Self {
            config,
            exclusions,
            vdw,
            atom_type,
        }
    }

    fn allowance(&self, i: usize, j: usize) -> f64 {
        let (a, b) = (self.atom_type[i], self.atom_type[j]);
        if (a == TYPE_POLAR_H && b == TYPE_OXYGEN) || (a == TYPE_OXYGEN && b == TYPE_POLAR_H) {
            POLAR_H_OXYGEN_ALLOWANCE
        } else {
            0.0
        }
    }

    /// Nearest non-excluded neighbors of each query atom in one frame,
    /// ordered worst gap first, at most `neighbor_count` per query.
    fn frame_candidates(
        &self,
        positions: ArrayView2<'_, f64>,
        queries: &[usize],
        neighbor_count: usize,
    ) -> Vec<Vec<Candidate>> {
        let points: Vec<[f64; 3]> = positions
            .axis_iter(Axis(0))
            .map(|row| [row[0], row[1], row[2]])
            .collect();
        let tree: KdTree<f64, 3> = (&points).into();
        let fetch = (neighbor_count + self.config.pad).min(points.len());

        let per_query = |&i: &usize| -> Vec<Candidate> {
            let found = tree.nearest_n::<SquaredEuclidean>(&points[i], fetch);
            let mut kept: Vec<Candidate> = found
                .iter()
                .filter_map(|nn| {
                    let j = nn.item as usize;
                    if self.exclusions[i].binary_search(&j).is_ok() {
                        return None;
                    }
                    let distance = nn.distance.sqrt();
                    Some(Candidate {
                        neighbor: j,
                        gap: distance - (self.vdw[i] + self.vdw[j]),
                    })
                })
                .collect();
            kept.sort_by(|a, b| a.gap.total_cmp(&b.gap));
            kept.truncate(neighbor_count);
            kept
        };

        #[cfg(not(feature = "parallel"))]
        let iterator = queries.iter();

        #[cfg(feature = "parallel")]
        let iterator = queries.par_iter();

        iterator.map(per_query).collect()
    }

    fn assemble(
        &self,
        candidates: Vec<Vec<Candidate>>,
        queries: Option<&[usize]>,
        query_ids: &[usize],
        neighbor_count: usize,
    ) -> ClashTable {
        let rows = candidates.len();
        let mut neighbors = Array2::from_elem((rows, neighbor_count), 0usize);
        let mut vdw_sum = Array2::zeros((rows, neighbor_count));
        let mut allowance = Array2::zeros((rows, neighbor_count));
        for (r, (&i, kept)) in query_ids.iter().zip(&candidates).enumerate() {
            for s in 0..neighbor_count {
                match kept.get(s) {
                    Some(c) => {
                        neighbors[[r, s]] = c.neighbor;
                        vdw_sum[[r, s]] = self.vdw[i] + self.vdw[c.neighbor];
                        allowance[[r, s]] = self.allowance(i, c.neighbor);
                    }
                    None => {
                        // padded slot: self-pair with infinite allowance
                        neighbors[[r, s]] = i;
                        allowance[[r, s]] = f64::INFINITY;
                    }
                }
            }
        }
        ClashTable {
            neighbors,
            vdw_sum,
            allowance,
            subset: queries.map(<[usize]>::to_vec),
        }
    }

    /// Table from a single geometry frame, (n_atoms, 3) physical
    /// coordinates. `queries` of `None` queries every atom.
    pub fn build(
        &self,
        positions: ArrayView2<'_, f64>,
        queries: Option<&[usize]>,
        neighbor_count: usize,
    ) -> ClashTable {
        let all: Vec<usize>;
        let query_ids: &[usize] = match queries {
            Some(q) => q,
            None => {
                all = (0..positions.nrows()).collect();
                &all
            }
        };
        let candidates = self.frame_candidates(positions, query_ids, neighbor_count);
        self.assemble(candidates, queries, query_ids, neighbor_count)
    }

    /// Table merged over a batch of frames, (batch, n_atoms, 3). Each row
    /// keeps the `neighbor_count` pairs with the worst gap seen in any
    /// frame, so a contact forming anywhere along the trajectory stays
    /// indexed.
    pub fn build_multi(
        &self,
        positions: ArrayView3<'_, f64>,
        queries: Option<&[usize]>,
        neighbor_count: usize,
    ) -> ClashTable {
        let all: Vec<usize>;
        let query_ids: &[usize] = match queries {
            Some(q) => q,
            None => {
                all = (0..positions.dim().1).collect();
                &all
            }
        };

        let mut merged: Vec<Vec<Candidate>> = vec![Vec::new(); query_ids.len()];
        for frame in positions.axis_iter(Axis(0)) {
            let frame_kept = self.frame_candidates(frame, query_ids, neighbor_count);
            for (row, kept) in merged.iter_mut().zip(frame_kept) {
                for c in kept {
                    match row.iter_mut().find(|e| e.neighbor == c.neighbor) {
                        Some(e) => e.gap = e.gap.min(c.gap),
                        None => row.push(c),
                    }
                }
            }
        }
        for row in &mut merged {
            row.sort_by(|a, b| a.gap.total_cmp(&b.gap));
            row.truncate(neighbor_count);
        }
        self.assemble(merged, queries, query_ids, neighbor_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::topology::TYPE_OTHER;
    use crate::core::restraints::clash;
    use ndarray::{Array2, Array3};

    fn line_positions(n: usize, spacing: f64) -> Array2<f64> {
        let mut pos = Array2::zeros((n, 3));
        for i in 0..n {
            pos[[i, 0]] = i as f64 * spacing;
        }
        pos
    }

    fn create_test_builder<'a>(
        config: &'a ClashConfig,
        exclusions: &'a [Vec<usize>],
        vdw: &'a [f64],
        atom_type: &'a [u8],
    ) -> ClashIndexBuilder<'a> {
        ClashIndexBuilder::new(config, exclusions, vdw, atom_type)
    }

    #[test]
    fn excluded_pairs_never_appear() {
        let config = ClashConfig {
            neighbor_count: 2,
            pad: 4,
            ..ClashConfig::default()
        };
        // atom 0 is bonded-adjacent to 1, so only 2 and 3 may appear
        let exclusions = vec![vec![0, 1], vec![0, 1], vec![2], vec![3]];
        let vdw = vec![1.7; 4];
        let types = vec![TYPE_OTHER; 4];
        let builder = create_test_builder(&config, &exclusions, &vdw, &types);

        let table = builder.build(line_positions(4, 1.0).view(), None, 2);
        for s in 0..table.neighbor_count() {
            assert_ne!(table.neighbors[[0, s]], 1);
        }
        // nearest survivor comes first
        assert_eq!(table.neighbors[[0, 0]], 2);
    }

    #[test]
    fn short_rows_are_padded_with_inert_slots() {
        let config = ClashConfig::default();
        let exclusions = vec![vec![0], vec![1]];
        let vdw = vec![1.7; 2];
        let types = vec![TYPE_OTHER; 2];
        let builder = create_test_builder(&config, &exclusions, &vdw, &types);

        let positions = line_positions(2, 0.5);
        let table = builder.build(positions.view(), None, 4);
        assert_eq!(table.neighbor_count(), 4);
        assert_eq!(table.neighbors[[0, 0]], 1);
        // slots past the one real neighbor are self-pairs with an
        // infinite allowance, silent under any overlap
        assert_eq!(table.neighbors[[0, 1]], 0);
        assert!(table.allowance[[0, 1]].is_infinite());
        let batch = positions.clone().insert_axis(ndarray::Axis(0));
        let eval = clash::forward(batch.view(), &table, 0.35);
        assert_eq!(eval.n_contacts(), 2); // only the 0-1 pair, both directions
    }

    #[test]
    fn batch_merge_keeps_the_worst_frame() {
        let config = ClashConfig {
            neighbor_count: 1,
            pad: 4,
            ..ClashConfig::default()
        };
        let exclusions = vec![vec![0], vec![1], vec![2]];
        let vdw = vec![1.7; 3];
        let types = vec![TYPE_OTHER; 3];
        let builder = create_test_builder(&config, &exclusions, &vdw, &types);

        // frame 0: atom 2 close to 0; frame 1: atom 1 closer to 0
        let mut pos = Array3::zeros((2, 3, 3));
        pos[[0, 1, 0]] = 6.0;
        pos[[0, 2, 0]] = 2.0;
        pos[[1, 1, 0]] = 1.0;
        pos[[1, 2, 0]] = 6.0;

        let table = builder.build_multi(pos.view(), None, 1);
        // the frame-1 contact with atom 1 has the smaller gap and wins
        assert_eq!(table.neighbors[[0, 0]], 1);
    }

    #[test]
    fn polar_hydrogen_oxygen_pairs_get_slack() {
        let config = ClashConfig::default();
        let exclusions = vec![vec![0], vec![1], vec![2]];
        let vdw = vec![1.0, 1.5, 1.5];
        let types = vec![TYPE_POLAR_H, TYPE_OXYGEN, TYPE_OTHER];
        let builder = create_test_builder(&config, &exclusions, &vdw, &types);

        let table = builder.build(line_positions(3, 1.0).view(), None, 2);
        let slot_of = |r: usize, j: usize| {
            (0..table.neighbor_count())
                .find(|&s| table.neighbors[[r, s]] == j)
                .unwrap()
        };
        assert_eq!(
            table.allowance[[0, slot_of(0, 1)]],
            POLAR_H_OXYGEN_ALLOWANCE
        );
        assert_eq!(table.allowance[[0, slot_of(0, 2)]], 0.0);
        assert_eq!(
            table.allowance[[1, slot_of(1, 0)]],
            POLAR_H_OXYGEN_ALLOWANCE
        );
        assert_eq!(table.allowance[[2, slot_of(2, 0)]], 0.0);
    }

    #[test]
    fn subset_queries_produce_subset_rows() {
        let config = ClashConfig::default();
        let exclusions = vec![vec![0], vec![1], vec![2], vec![3]];
        let vdw = vec![1.7; 4];
        let types = vec![TYPE_OTHER; 4];
        let builder = create_test_builder(&config, &exclusions, &vdw, &types);

        let moving = vec![1, 3];
        let table = builder.build(line_positions(4, 1.0).view(), Some(&moving), 2);
        assert_eq!(table.n_rows(), 2);
        assert_eq!(table.query_atom(0), 1);
        assert_eq!(table.query_atom(1), 3);
    }
}
