//! Per-batch loss assembly and its hand-written reverse pass. Every term
//! accumulates its cotangent into one shared (batch, n_atoms, 4) box-frame
//! gradient, which the caller feeds to the decoder backward pass.

use ndarray::{Array3, ArrayView3, Axis};
use num_complex::Complex64;

use super::config::LossWeights;
use crate::core::fourier::frc::{self, FrcWindow};
use crate::core::fourier::rings::RingCache;
use crate::core::io::stack::ParticleImage;
use crate::core::model::hydrogens::HydrogenSet;
use crate::core::model::points::GridFrame;
use crate::core::model::topology::Topology;
use crate::core::project::{Orientation, Projector};
use crate::core::restraints::clash::ClashTable;
use crate::core::restraints::rama::RamaTables;
use crate::core::restraints::rotamers::ResidueRotamers;
use crate::core::restraints::{angles, bonds, clash, planes, rama, rotamers};

/// Gaussian sharpness of the bond agreement score. The score sits near 1 on
/// ideal geometry and keeps the log-loss argument positive.
pub const BOND_GAUSS_ALPHA: f64 = 5.0;

/// Gaussian sharpness of the angle strain penalty.
pub const ANGLE_GAUSS_ALPHA: f64 = 8.0;

/// Twist tolerances, as angles; the loss compares sines.
pub const PLANE_TOLERANCE_DEG: f64 = 10.0;
pub const PEPTIDE_TOLERANCE_DEG: f64 = 30.0;

/// Restraint subtotals of one step, for the progress line.
#[derive(Debug, Clone, Default)]
pub struct RestraintReport {
    pub bond: f64,
    pub angle: f64,
    pub rama: f64,
    pub plane: f64,
    pub rotamer: f64,
    pub clash: f64,
    /// Engaged clash pairs per batch frame.
    pub clash_contacts: usize,
}

/// One evaluated training batch: scalar loss, mean FRC over the batch, the
/// report, and the box-frame cotangent of the loss with respect to the
/// decoded cloud.
#[derive(Debug)]
pub struct BatchEval {
    pub loss: f64,
    pub image_score: f64,
    pub report: RestraintReport,
    pub grad: Array3<f64>,
}

/// Immutable per-run inputs the restraint terms read.
pub struct LossContext<'a> {
    pub topology: &'a Topology,
    pub rama_tables: &'a RamaTables,
    pub rotamer_slots: &'a [ResidueRotamers],
    pub hydrogens: &'a HydrogenSet,
    pub frame: GridFrame,
}

/// Stateful loss evaluator. Owns the ring cache; one instance serves a whole
/// run across every stage and window.
pub struct LossAssembly {
    weights: LossWeights,
    rings: RingCache,
    min_px: usize,
}

impl LossAssembly {
    pub fn new(weights: LossWeights, min_px: usize) -> Self {
        Self {
            weights,
            rings: RingCache::new(),
            min_px,
        }
    }

    pub fn weights(&self) -> &LossWeights {
        &self.weights
    }

    /// Mean FRC over the batch. Accumulates `weight · d(−meanFRC)/d(cloud)`
    /// into `grad`; the returned score is unweighted.
    fn image_term(
        &mut self,
        projector: &Projector,
        cloud: ArrayView3<'_, f64>,
        batch: &[&ParticleImage],
        max_px: usize,
        weight: f64,
        grad: &mut Array3<f64>,
    ) -> f64 {
        let orientations: Vec<Orientation> = batch.iter().map(|p| p.orientation).collect();
        let spectra = projector.render(cloud, &orientations);
        let rings = self.rings.get_or_build(projector.size());
        let window = FrcWindow {
            min_px: self.min_px,
            max_px,
        };

        let n = batch.len() as f64;
        let mut cot = Array3::from_elem(spectra.raw_dim(), Complex64::new(0.0, 0.0));
        let mut total = 0.0;
        for (i, particle) in batch.iter().enumerate() {
            let proj = spectra.index_axis(Axis(0), i);
            let (score, sums) = frc::frc_mean(proj, particle.spectrum.view(), &rings, window);
            total += score;
            let g = frc::frc_backward(
                proj,
                particle.spectrum.view(),
                &rings,
                &sums,
                window,
                -weight / n,
            );
            cot.index_axis_mut(Axis(0), i).assign(&g);
        }
        *grad += &projector.backward(cloud, &orientations, cot.view());
        total / n
    }

    /// Morph stage: pure image loss over a band-limited window.
    pub fn morph_batch(
        &mut self,
        projector: &Projector,
        cloud: ArrayView3<'_, f64>,
        batch: &[&ParticleImage],
        max_px: usize,
    ) -> BatchEval {
        let mut grad = Array3::zeros(cloud.raw_dim());
        let score = self.image_term(projector, cloud, batch, max_px, 1.0, &mut grad);
        BatchEval {
            loss: -score,
            image_score: score,
            report: RestraintReport::default(),
            grad,
        }
    }

    /// Cα stage: image loss plus a weakly weighted bond/angle/clash model
    /// term that keeps the backbone from tearing while large motion fits.
    pub fn ca_batch(
        &mut self,
        projector: &Projector,
        ctx: &LossContext<'_>,
        cloud: ArrayView3<'_, f64>,
        batch: &[&ParticleImage],
        clash_table: &ClashTable,
    ) -> BatchEval {
        let w = &self.weights;
        let (w_restraint, w_model, overlap, nstd) =
            (w.ca_restraint_weight, w.ca_model_weight, w.ca_overlap, w.ca_nstd);
        let n = cloud.dim().0 as f64;

        let mut grad = Array3::zeros(cloud.raw_dim());
        let score = self.image_term(
            projector,
            cloud,
            batch,
            projector.size() / 2,
            1.0,
            &mut grad,
        );

        let topo = ctx.topology;
        let pos = ctx.frame.to_physical(cloud);
        let bond_eval = bonds::forward(pos.view(), &topo.bonds);
        let angle_eval = angles::forward(pos.view(), &topo.angles);
        let clash_eval = clash::forward(pos.view(), clash_table, overlap);

        let bond_out = bond_eval.outlier_mean(nstd);
        let angle_out = angle_eval.outlier_mean(nstd);
        let clash_term = clash_eval.sum_with_bonus(0.0) / n / 2.0;
        let model = w_restraint * (bond_out + angle_out) + clash_term;

        let mut grad_phys = Array3::zeros(pos.raw_dim());
        bond_eval.backward_outlier(
            pos.view(),
            &topo.bonds,
            nstd,
            w_model * w_restraint,
            &mut grad_phys,
        );
        angle_eval.backward_outlier(
            pos.view(),
            &topo.angles,
            nstd,
            w_model * w_restraint,
            &mut grad_phys,
        );
        clash_eval.backward(pos.view(), clash_table, w_model / n / 2.0, &mut grad_phys);
        ctx.frame
            .add_physical_gradient(grad_phys.view(), grad.view_mut());

        BatchEval {
            loss: -score + w_model * model,
            image_score: score,
            report: RestraintReport {
                bond: bond_out,
                angle: angle_out,
                clash: clash_term,
                clash_contacts: clash_eval.n_contacts() / cloud.dim().0,
                ..RestraintReport::default()
            },
            grad,
        }
    }

    /// Full stage: optional image term plus the log of the stereochemical
    /// subtotal. The log makes every restraint weight effectively relative
    /// to the current subtotal, so no single term dominates late training.
    #[allow(clippy::too_many_arguments)]
    pub fn full_batch(
        &mut self,
        projector: &Projector,
        ctx: &LossContext<'_>,
        cloud: ArrayView3<'_, f64>,
        batch: Option<&[&ParticleImage]>,
        clash_table: &ClashTable,
        moving_table: Option<&ClashTable>,
    ) -> BatchEval {
        let w = self.weights.clone();
        let n = cloud.dim().0 as f64;
        let mut grad = Array3::zeros(cloud.raw_dim());

        let image_score = match batch {
            Some(particles) if w.image_weight > 0.0 => self.image_term(
                projector,
                cloud,
                particles,
                projector.size() / 2,
                w.image_weight,
                &mut grad,
            ),
            _ => 0.0,
        };

        let topo = ctx.topology;
        let pos = ctx.frame.to_physical(cloud);
        let wide = ctx.hydrogens.place(pos.view());

        let plane_thr = PLANE_TOLERANCE_DEG.to_radians().sin();
        let peptide_thr = PEPTIDE_TOLERANCE_DEG.to_radians().sin();

        let bond_eval = bonds::forward(pos.view(), &topo.bonds);
        let angle_eval = angles::forward(pos.view(), &topo.angles);
        let rama_eval = rama::forward(pos.view(), &topo.rama, ctx.rama_tables);
        let plane_eval = planes::forward(pos.view(), &topo.planes);
        let peptide_eval = planes::forward(pos.view(), &topo.peptide_planes);
        let rot_eval = rotamers::forward(pos.view(), &topo.chi, ctx.rotamer_slots);
        let clash_eval = clash::forward(wide.view(), clash_table, w.full_overlap);
        let moving_eval =
            moving_table.map(|table| clash::forward(wide.view(), table, w.full_overlap));

        let bond_term = bond_eval.gauss_mean(BOND_GAUSS_ALPHA)
            + bond_eval.outlier_mean(w.full_nstd) * w.bond_outlier_weight;
        let angle_term = angle_eval.gauss_penalty(ANGLE_GAUSS_ALPHA)
            + angle_eval.outlier_mean(w.full_nstd) * w.angle_outlier_weight;
        let rama_term = rama_eval.mean() * w.rama_mean_weight
            + rama_eval.tier_mean(w.rama_soft_threshold) * w.rama_soft_weight
            + rama_eval.tier_mean(w.rama_hard_threshold) * w.rama_hard_weight;
        let plane_term = plane_eval.flatness_mean(plane_thr) * w.plane_weight
            + peptide_eval.flatness_mean(peptide_thr) * w.plane_weight;
        let rot_term = rot_eval.mean() * w.rotamer_mean_weight
            + rot_eval.tier_mean(w.rotamer_threshold) * w.rotamer_hard_weight;
        let mut clash_term =
            clash_eval.sum_with_bonus(w.clash_sign_bonus) / n / 2.0 * w.clash_weight;
        let mut clash_contacts = clash_eval.n_contacts();
        if let Some(eval) = &moving_eval {
            clash_term += eval.sum_with_bonus(0.0) / n / 2.0 * w.clash_weight;
            clash_contacts += eval.n_contacts();
        }

        let subtotal = bond_term + angle_term + rama_term + plane_term + rot_term + clash_term;
        let loss = w.image_weight * (-image_score) + subtotal.ln();

        // d ln(subtotal)/d term = 1/subtotal; every restraint cotangent
        // carries that shared scale
        let scale = 1.0 / subtotal;
        let mut grad_phys = Array3::zeros(pos.raw_dim());
        bond_eval.backward_gauss(pos.view(), &topo.bonds, BOND_GAUSS_ALPHA, scale, &mut grad_phys);
        bond_eval.backward_outlier(
            pos.view(),
            &topo.bonds,
            w.full_nstd,
            w.bond_outlier_weight * scale,
            &mut grad_phys,
        );
        angle_eval.backward_gauss(
            pos.view(),
            &topo.angles,
            ANGLE_GAUSS_ALPHA,
            scale,
            &mut grad_phys,
        );
        angle_eval.backward_outlier(
            pos.view(),
            &topo.angles,
            w.full_nstd,
            w.angle_outlier_weight * scale,
            &mut grad_phys,
        );
        rama_eval.backward(
            pos.view(),
            &topo.rama,
            ctx.rama_tables,
            w.rama_mean_weight * scale,
            &[
                (w.rama_soft_threshold, w.rama_soft_weight * scale),
                (w.rama_hard_threshold, w.rama_hard_weight * scale),
            ],
            &mut grad_phys,
        );
        plane_eval.backward(
            pos.view(),
            &topo.planes,
            plane_thr,
            w.plane_weight * scale,
            &mut grad_phys,
        );
        peptide_eval.backward(
            pos.view(),
            &topo.peptide_planes,
            peptide_thr,
            w.plane_weight * scale,
            &mut grad_phys,
        );
        rot_eval.backward(
            pos.view(),
            &topo.chi,
            ctx.rotamer_slots,
            w.rotamer_mean_weight * scale,
            &[(w.rotamer_threshold, w.rotamer_hard_weight * scale)],
            &mut grad_phys,
        );

        let mut grad_wide = Array3::zeros(wide.raw_dim());
        let clash_cot = w.clash_weight * scale / n / 2.0;
        clash_eval.backward(wide.view(), clash_table, clash_cot, &mut grad_wide);
        if let (Some(eval), Some(table)) = (&moving_eval, moving_table) {
            eval.backward(wide.view(), table, clash_cot, &mut grad_wide);
        }
        grad_phys += &ctx.hydrogens.backward(pos.view(), grad_wide.view());
        ctx.frame
            .add_physical_gradient(grad_phys.view(), grad.view_mut());

        BatchEval {
            loss,
            image_score,
            report: RestraintReport {
                bond: bond_term,
                angle: angle_term,
                rama: rama_term,
                plane: plane_term,
                rotamer: rot_term,
                clash: clash_term,
                clash_contacts: clash_contacts / cloud.dim().0,
            },
            grad,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::topology::{BondRow, TYPE_CARBON};
    use crate::core::project::Symmetry;
    use ndarray::{Array2, Array3};

    fn create_test_cloud(batch: usize) -> Array3<f64> {
        let atoms = [
            [0.05, -0.08, 0.02, 1.5],
            [0.12, 0.03, -0.05, 2.0],
            [-0.10, 0.11, 0.08, 1.0],
        ];
        let mut cloud = Array3::zeros((batch, atoms.len(), 4));
        for b in 0..batch {
            for (i, a) in atoms.iter().enumerate() {
                for c in 0..4 {
                    cloud[[b, i, c]] = a[c];
                }
            }
        }
        cloud
    }

    fn create_test_context(topo: &Topology) -> (RamaTables, HydrogenSet, GridFrame) {
        (
            RamaTables::default(),
            HydrogenSet::new(Vec::new(), topo.n_heavy()).unwrap(),
            GridFrame { size: 16, apix: 1.0 },
        )
    }

    fn topology_from_cloud(cloud: &Array3<f64>, frame: &GridFrame) -> Topology {
        // bonds 0-1 and 1-2 at exactly their current physical lengths
        let phys = frame.to_physical(cloud.view());
        let dist = |i: usize, j: usize| {
            (0..3)
                .map(|c| (phys[[0, i, c]] - phys[[0, j, c]]).powi(2))
                .sum::<f64>()
                .sqrt()
        };
        let bond = |i: usize, j: usize| BondRow {
            i,
            j,
            ideal: dist(i, j),
            tolerance: 0.02,
        };
        Topology::new(
            3,
            vec![bond(0, 1), bond(1, 2)],
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            vec![1.7; 3],
            vec![TYPE_CARBON; 3],
        )
        .unwrap()
    }

    fn empty_clash_table() -> ClashTable {
        ClashTable {
            neighbors: Array2::from_elem((0, 1), 0),
            vdw_sum: Array2::zeros((0, 1)),
            allowance: Array2::zeros((0, 1)),
            subset: None,
        }
    }

    fn self_projected_particles(
        projector: &Projector,
        cloud: &Array3<f64>,
    ) -> Vec<ParticleImage> {
        let orientations = vec![
            Orientation { az: 0.2, alt: 0.5, phi: -0.3, tx: 0.0, ty: 0.0 },
            Orientation { az: -1.1, alt: 0.9, phi: 0.4, tx: 0.0, ty: 0.0 },
        ];
        let spectra = projector.render(cloud.view(), &orientations);
        orientations
            .into_iter()
            .enumerate()
            .map(|(i, orientation)| ParticleImage {
                spectrum: spectra.index_axis(Axis(0), i).to_owned(),
                orientation,
            })
            .collect()
    }

    #[test]
    fn self_projection_scores_unity() {
        let projector = Projector::new(16, Symmetry::Cyclic(1));
        let cloud = create_test_cloud(2);
        let particles = self_projected_particles(&projector, &cloud);
        let refs: Vec<&ParticleImage> = particles.iter().collect();

        let mut assembly = LossAssembly::new(LossWeights::default(), 1);
        let eval = assembly.morph_batch(&projector, cloud.view(), &refs, 4);
        assert!((eval.image_score - 1.0).abs() < 1e-9);
        assert!((eval.loss + 1.0).abs() < 1e-9);
        assert_eq!(eval.grad.dim(), (2, 3, 4));
    }

    #[test]
    fn ideal_geometry_full_loss_is_the_log_of_one() {
        let cloud = create_test_cloud(2);
        let frame = GridFrame { size: 16, apix: 1.0 };
        let topo = topology_from_cloud(&cloud, &frame);
        let (rama_tables, hydrogens, frame) = create_test_context(&topo);
        let ctx = LossContext {
            topology: &topo,
            rama_tables: &rama_tables,
            rotamer_slots: &[],
            hydrogens: &hydrogens,
            frame,
        };

        let projector = Projector::new(16, Symmetry::Cyclic(1));
        let mut assembly = LossAssembly::new(LossWeights::default(), 1);
        let eval = assembly.full_batch(
            &projector,
            &ctx,
            cloud.view(),
            None,
            &empty_clash_table(),
            None,
        );
        // subtotal = bond gauss score = 1 on ideal bonds
        assert!(eval.loss.abs() < 1e-9);
        assert_eq!(eval.image_score, 0.0);
        let flat = eval.grad.iter().all(|&g| g.abs() < 1e-9);
        assert!(flat, "ideal geometry should sit at a stationary point");
    }

    #[test]
    fn full_restraint_gradient_matches_finite_differences() {
        let mut cloud = create_test_cloud(1);
        let frame = GridFrame { size: 16, apix: 1.0 };
        let topo = topology_from_cloud(&cloud, &frame);
        // strain both bonds off ideal
        cloud[[0, 1, 0]] += 0.004;
        cloud[[0, 2, 1]] -= 0.006;
        let (rama_tables, hydrogens, frame) = create_test_context(&topo);
        let ctx = LossContext {
            topology: &topo,
            rama_tables: &rama_tables,
            rotamer_slots: &[],
            hydrogens: &hydrogens,
            frame,
        };

        let projector = Projector::new(16, Symmetry::Cyclic(1));
        let mut assembly = LossAssembly::new(LossWeights::default(), 1);
        let table = empty_clash_table();
        let eval = assembly.full_batch(&projector, &ctx, cloud.view(), None, &table, None);
        assert!(eval.loss.is_finite());

        let mut loss_at = |c: &Array3<f64>| {
            assembly
                .full_batch(&projector, &ctx, c.view(), None, &table, None)
                .loss
        };
        let eps = 1e-6;
        for atom in 0..3 {
            for ch in 0..3 {
                let mut plus = cloud.clone();
                plus[[0, atom, ch]] += eps;
                let mut minus = cloud.clone();
                minus[[0, atom, ch]] -= eps;
                let numeric = (loss_at(&plus) - loss_at(&minus)) / (2.0 * eps);
                assert!(
                    (eval.grad[[0, atom, ch]] - numeric).abs() < 1e-4,
                    "atom {atom} channel {ch}: analytic {} vs numeric {numeric}",
                    eval.grad[[0, atom, ch]]
                );
            }
        }
    }

    #[test]
    fn ca_model_term_is_weak_but_present() {
        let cloud = create_test_cloud(2);
        let frame = GridFrame { size: 16, apix: 1.0 };
        let mut topo = topology_from_cloud(&cloud, &frame);
        // stretch one ideal far off so the outlier engages
        topo.bonds[0].ideal += 1.0;
        let (rama_tables, hydrogens, frame) = create_test_context(&topo);
        let ctx = LossContext {
            topology: &topo,
            rama_tables: &rama_tables,
            rotamer_slots: &[],
            hydrogens: &hydrogens,
            frame,
        };

        let projector = Projector::new(16, Symmetry::Cyclic(1));
        let particles = self_projected_particles(&projector, &cloud);
        let refs: Vec<&ParticleImage> = particles.iter().collect();

        let mut assembly = LossAssembly::new(LossWeights::default(), 1);
        let eval = assembly.ca_batch(&projector, &ctx, cloud.view(), &refs, &empty_clash_table());
        assert!(eval.report.bond > 0.0);
        // model weight 1e-6 keeps the restraint term small next to the image
        assert!((eval.loss + eval.image_score).abs() < 1.0);
        assert!(eval.loss + eval.image_score > 0.0);
    }
}
