use ndarray::Array2;
use rand::Rng;
use rand::SeedableRng;
use rand::distributions::{Distribution, WeightedIndex};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use super::mask::RegionMask;
use super::topology::NUCLEOTIDE_RESIDUES;
use super::{ModelError, PointModel};

const KMEANS_ITERATIONS: usize = 30;

/// Patches reserved for the fixed periphery when a region mask splits the
/// anchor seeding.
pub const PERIPHERY_PATCHES: usize = 32;

/// Anchor patches for the per-residue decoder: k-means centers over
/// (x, y, z, chain class) and a residue-coherent patch assignment per
/// heavy atom.
#[derive(Debug, Clone)]
pub struct Anchors {
    /// (n_patches, 4) rows of x, y, z, chain class.
    pub centers: Array2<f64>,
    pub assignment: Vec<usize>,
}

impl Anchors {
    pub fn n_patches(&self) -> usize {
        self.centers.nrows()
    }
}

/// Chain class per atom: the chain ordinal by first appearance, except that
/// every nucleotide residue lands in one shared class so paired nucleic-acid
/// strands deform together.
pub fn chain_classes(model: &PointModel) -> Vec<f64> {
    let mut keys: Vec<Option<&str>> = Vec::new();
    let mut classes = Vec::with_capacity(model.n_atoms());
    for meta in &model.meta {
        let key = if NUCLEOTIDE_RESIDUES.contains(meta.residue_name.as_str()) {
            None
        } else {
            Some(meta.chain.as_str())
        };
        let ordinal = match keys.iter().position(|k| *k == key) {
            Some(i) => i,
            None => {
                keys.push(key);
                keys.len() - 1
            }
        };
        classes.push(ordinal as f64);
    }
    classes
}

fn features(model: &PointModel) -> Vec<[f64; 4]> {
    let classes = chain_classes(model);
    let cloud = model.cloud.array();
    (0..model.n_atoms())
        .map(|i| {
            [
                cloud[[i, 0]],
                cloud[[i, 1]],
                cloud[[i, 2]],
                classes[i],
            ]
        })
        .collect()
}

fn dist2(a: &[f64; 4], b: &[f64; 4]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Lloyd's algorithm with k-means++ seeding over the given subset of
/// feature rows. Clusters that lose all members keep their previous
/// center.
fn kmeans(
    feats: &[[f64; 4]],
    subset: &[usize],
    k: usize,
    rng: &mut ChaCha8Rng,
) -> Vec<[f64; 4]> {
    let k = k.min(subset.len());
    if k == 0 {
        return Vec::new();
    }

    let mut centers: Vec<[f64; 4]> = Vec::with_capacity(k);
    centers.push(feats[subset[rng.gen_range(0..subset.len())]]);
    let mut d2: Vec<f64> = subset.iter().map(|&i| dist2(&feats[i], &centers[0])).collect();
    while centers.len() < k {
        let next = match WeightedIndex::new(&d2) {
            Ok(dist) => subset[dist.sample(rng)],
            // every remaining point coincides with a center
            Err(_) => subset[rng.gen_range(0..subset.len())],
        };
        let newest = feats[next];
        centers.push(newest);
        for (slot, &i) in d2.iter_mut().zip(subset) {
            *slot = slot.min(dist2(&feats[i], &newest));
        }
    }

    let mut labels = vec![0usize; subset.len()];
    for _ in 0..KMEANS_ITERATIONS {
        for (slot, &i) in labels.iter_mut().zip(subset) {
            *slot = nearest(&feats[i], &centers);
        }
        let mut sums = vec![[0.0f64; 4]; k];
        let mut counts = vec![0usize; k];
        for (&label, &i) in labels.iter().zip(subset) {
            counts[label] += 1;
            for c in 0..4 {
                sums[label][c] += feats[i][c];
            }
        }
        for (label, center) in centers.iter_mut().enumerate() {
            if counts[label] > 0 {
                for c in 0..4 {
                    center[c] = sums[label][c] / counts[label] as f64;
                }
            }
        }
    }
    centers
}

fn nearest(f: &[f64; 4], centers: &[[f64; 4]]) -> usize {
    let mut best = 0;
    let mut best_d = f64::INFINITY;
    for (i, c) in centers.iter().enumerate() {
        let d = dist2(f, c);
        if d < best_d {
            best_d = d;
            best = i;
        }
    }
    best
}

/// Every atom of a residue adopts the patch most of the residue's atoms
/// were nearest to (lowest patch id on a tie).
fn residue_coherent(model: &PointModel, labels: &mut [usize], n_patches: usize) {
    for members in model.residue_members() {
        let mut votes = vec![0usize; n_patches];
        for &atom in &members {
            votes[labels[atom]] += 1;
        }
        let mut winner = 0;
        for (patch, &count) in votes.iter().enumerate() {
            if count > votes[winner] {
                winner = patch;
            }
        }
        for &atom in &members {
            labels[atom] = winner;
        }
    }
}

/// Residue-coherent patch assignment against a fixed set of centers, used
/// when persisted anchors are reloaded.
pub fn assign(model: &PointModel, centers: &Array2<f64>) -> Vec<usize> {
    let feats = features(model);
    let rows: Vec<[f64; 4]> = centers
        .outer_iter()
        .map(|r| [r[0], r[1], r[2], r[3]])
        .collect();
    let mut assignment: Vec<usize> = feats.iter().map(|f| nearest(f, &rows)).collect();
    residue_coherent(model, &mut assignment, rows.len());
    assignment
}

/// Computes anchor patches for the model. Without a mask all points are
/// clustered into `n_patches` centers; with a mask, 32 centers come from
/// the fixed periphery (weight < 0.1) and the rest from the mobile region
/// (weight > 0.1), stacked in that order. Assignment is residue-coherent.
pub fn compute(
    model: &PointModel,
    mask: &RegionMask,
    n_patches: usize,
    seed: u64,
) -> Result<Anchors, ModelError> {
    let feats = features(model);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let centers = match mask.seed_split() {
        None => {
            let all: Vec<usize> = (0..model.n_atoms()).collect();
            kmeans(&feats, &all, n_patches, &mut rng)
        }
        Some((periphery, mobile)) => {
            if n_patches <= PERIPHERY_PATCHES {
                return Err(ModelError::TooFewPatches(n_patches));
            }
            let mut centers = kmeans(&feats, &periphery, PERIPHERY_PATCHES, &mut rng);
            centers.extend(kmeans(
                &feats,
                &mobile,
                n_patches - PERIPHERY_PATCHES,
                &mut rng,
            ));
            centers
        }
    };
    if centers.is_empty() {
        return Err(ModelError::Empty);
    }
    debug!(n_patches = centers.len(), "anchor centers computed");

    let mut assignment: Vec<usize> = feats.iter().map(|f| nearest(f, &centers)).collect();
    residue_coherent(model, &mut assignment, centers.len());

    let mut flat = Array2::zeros((centers.len(), 4));
    for (row, center) in centers.iter().enumerate() {
        for c in 0..4 {
            flat[[row, c]] = center[c];
        }
    }
    Ok(Anchors {
        centers: flat,
        assignment,
    })
}
