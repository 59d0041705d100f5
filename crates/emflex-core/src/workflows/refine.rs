//! The staged refinement procedure. Three decoders are trained in strict
//! sequence against the same latent trajectory: anchor-patch morphing at
//! coarse resolution, per-residue correction at full window, then the
//! per-atom decoder under the complete restraint set.

use ndarray::{Array1, Array2, Array3, ArrayView2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{info, instrument};

use super::Session;
use crate::core::io::stack::ParticleImage;
use crate::core::io::tables;
use crate::core::nn::adam::Adam;
use crate::core::nn::decoder::Decoder;
use crate::core::restraints::clash::ClashTable;
use crate::engine::checkpoint;
use crate::engine::clash_index::ClashIndexBuilder;
use crate::engine::config::RefineConfig;
use crate::engine::error::RefineError;
use crate::engine::latent;
use crate::engine::loss::LossAssembly;
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::stage::{
    self, Stage, FULL_REBUILD_STEPS, FULL_STEPS_PER_ROUND, MORPH_LADDER_DIVISORS,
};

/// The three decoders of a run. Construction order is fixed so a seeded
/// run reproduces its initial weights exactly.
pub(crate) struct DecoderSet {
    pub morph: Decoder,
    pub residue: Decoder,
    pub full: Decoder,
}

impl DecoderSet {
    pub(crate) fn build(session: &Session, rng: &mut ChaCha8Rng) -> Self {
        Self {
            morph: Decoder::anchor(
                &session.anchors.assignment,
                session.anchors.n_patches(),
                false,
                rng,
            ),
            residue: Decoder::anchor(
                &session.model.residue_index,
                session.model.n_residues,
                true,
                rng,
            ),
            full: Decoder::full(session.n_heavy(), rng),
        }
    }

    pub(crate) fn decoder(&self, stage: Stage) -> &Decoder {
        match stage {
            Stage::Morph => &self.morph,
            Stage::CarbonAlpha => &self.residue,
            Stage::Full => &self.full,
        }
    }

    pub(crate) fn decoder_mut(&mut self, stage: Stage) -> &mut Decoder {
        match stage {
            Stage::Morph => &mut self.morph,
            Stage::CarbonAlpha => &mut self.residue,
            Stage::Full => &mut self.full,
        }
    }

    /// Composed model at inference: neutral cloud plus the gated coarse
    /// displacements, plus the ungated per-atom term when `through` is the
    /// full stage.
    pub(crate) fn compose(
        &self,
        session: &Session,
        gate: &Array1<f64>,
        latent: ArrayView2<'_, f64>,
        through: Stage,
        rng: &mut ChaCha8Rng,
    ) -> Array3<f64> {
        let mut cloud = session.model.cloud.repeat(latent.nrows());
        let (mut coarse, _) = self.morph.decode(latent, false, rng);
        if through != Stage::Morph {
            let (residue_disp, _) = self.residue.decode(latent, false, rng);
            coarse += &residue_disp;
        }
        add_gated(&mut cloud, gate, &coarse);
        if through == Stage::Full {
            let (full_disp, _) = self.full.decode(latent, false, rng);
            cloud += &full_disp;
        }
        cloud
    }
}

/// Adds a gated displacement to the cloud in place.
fn add_gated(cloud: &mut Array3<f64>, gate: &Array1<f64>, disp: &Array3<f64>) {
    for ((b, n, c), v) in disp.indexed_iter() {
        cloud[[b, n, c]] += gate[n] * v;
    }
}

/// Pulls the cloud cotangent back through the gate.
fn gate_cotangent(gate: &Array1<f64>, grad: &Array3<f64>) -> Array3<f64> {
    let mut out = grad.clone();
    for ((_, n, _), v) in out.indexed_iter_mut() {
        *v *= gate[n];
    }
    out
}

/// Batches one epoch yields, with the size-1 remainder dropped.
fn epoch_batches(n_items: usize, batch_size: usize) -> usize {
    let rem = n_items % batch_size;
    n_items / batch_size + usize::from(rem > 1 || n_items == 1)
}

fn finish_stage(
    session: &Session,
    decoders: &DecoderSet,
    stage: Stage,
    rng: &mut ChaCha8Rng,
) -> Result<(), RefineError> {
    let gate = session.gate();
    let positions: Vec<f64> = session
        .trajectory
        .snapshot_frames()
        .into_iter()
        .map(|f| session.trajectory.frame_position(f))
        .collect();
    let latent = session.trajectory.batch_at(&positions);
    let cloud = decoders.compose(session, &gate, latent.view(), stage, rng);
    // hydrogens only exist once the per-atom decoder has trained
    let hydrogens = (stage == Stage::Full).then_some(&session.hydrogens);
    let dir = &session.config.paths.output_dir;
    for (idx, frame_cloud) in cloud.axis_iter(Axis(0)).enumerate() {
        let path = dir.join(format!("snapshot_{}_{:02}.csv", stage.token(), idx));
        tables::write_snapshot(&path, &session.model, &session.frame, frame_cloud, hydrogens)?;
    }
    checkpoint::save(dir, stage, decoders.decoder(stage).layers())?;
    info!(stage = stage.token(), n_snapshots = positions.len(), "stage finished");
    Ok(())
}

/// Runs the whole refinement: loads the session, trains the stages the
/// schedule budgets, and leaves snapshots and weight checkpoints in the
/// output directory.
#[instrument(skip_all)]
pub fn refine(config: RefineConfig, reporter: &ProgressReporter<'_>) -> Result<(), RefineError> {
    config.validate()?;
    let session = Session::load(config)?;
    let mut rng = ChaCha8Rng::seed_from_u64(session.config.schedule.seed);
    let mut decoders = DecoderSet::build(&session, &mut rng);

    if session.config.schedule.load {
        for stage in Stage::ALL {
            let dir = &session.config.paths.output_dir;
            if checkpoint::exists(dir, stage) {
                checkpoint::load(dir, stage, decoders.decoder_mut(stage).layers_mut())?;
                info!(stage = stage.token(), "checkpoint loaded");
            }
        }
    }

    let mut assembly = LossAssembly::new(
        session.config.weights.clone(),
        session.config.projection.min_px,
    );
    run_morph(&session, &mut decoders, &mut assembly, &mut rng, reporter)?;
    run_carbon_alpha(&session, &mut decoders, &mut assembly, &mut rng, reporter)?;
    run_full(&session, &mut decoders, &mut assembly, &mut rng, reporter)?;
    Ok(())
}

/// Morph stage: the anchor decoder alone, against particles only, climbing
/// the resolution ladder.
fn run_morph(
    session: &Session,
    decoders: &mut DecoderSet,
    assembly: &mut LossAssembly,
    rng: &mut ChaCha8Rng,
    reporter: &ProgressReporter<'_>,
) -> Result<(), RefineError> {
    let schedule = &session.config.schedule;
    if schedule.morph_epochs == 0 {
        info!("morph stage skipped, checkpoint weights kept");
        return Ok(());
    }
    let n_particles = session.particles.len();
    let gate = session.gate();
    let total = (MORPH_LADDER_DIVISORS.len()
        * schedule.morph_epochs
        * epoch_batches(n_particles, schedule.batch_size)) as u64;
    reporter.report(Progress::StageStart {
        stage: Stage::Morph.token(),
        total_iterations: total,
    });

    let mut optimizer = Adam::new(schedule.learn_rate);
    let mut iteration = 0u64;
    for &divisor in &MORPH_LADDER_DIVISORS {
        let max_px = session.frame.size / divisor;
        for _ in 0..schedule.morph_epochs {
            for batch in stage::shuffled_batches(n_particles, schedule.batch_size, rng) {
                let images: Vec<&ParticleImage> =
                    batch.iter().map(|&i| &session.particles[i]).collect();
                let mut latent = session.trajectory.batch_for_particles(&batch, n_particles);
                latent::perturb(&mut latent, schedule.latent_noise, rng);

                let (disp, tape) = decoders.morph.decode(latent.view(), true, rng);
                let mut cloud = session.model.cloud.repeat(batch.len());
                add_gated(&mut cloud, &gate, &disp);

                let eval = assembly.morph_batch(&session.projector, cloud.view(), &images, max_px);
                stage::guard_finite(Stage::Morph, iteration, eval.loss)?;

                let cotangent = gate_cotangent(&gate, &eval.grad);
                let grads = decoders.morph.backward(&tape, cotangent.view());
                optimizer.apply(decoders.morph.layers_mut(), &grads);

                reporter.report(Progress::Iteration {
                    iteration,
                    loss: eval.loss,
                    image_score: eval.image_score,
                    report: eval.report,
                });
                iteration += 1;
            }
        }
    }
    finish_stage(session, decoders, Stage::Morph, rng)?;
    reporter.report(Progress::StageFinish {
        stage: Stage::Morph.token(),
    });
    Ok(())
}

/// Cα stage: the per-residue decoder on top of the frozen morph, with the
/// coarse restraint set. The clash index is built once from the neutral
/// model; residue-level motion stays within its pair list.
fn run_carbon_alpha(
    session: &Session,
    decoders: &mut DecoderSet,
    assembly: &mut LossAssembly,
    rng: &mut ChaCha8Rng,
    reporter: &ProgressReporter<'_>,
) -> Result<(), RefineError> {
    let schedule = &session.config.schedule;
    if schedule.ca_epochs == 0 {
        info!("ca stage skipped, checkpoint weights kept");
        return Ok(());
    }
    let n_particles = session.particles.len();
    let gate = session.gate();
    let ctx = session.loss_context();

    let builder = ClashIndexBuilder::new(
        &session.config.clash,
        &session.exclusions,
        &session.topology.vdw_radius,
        &session.topology.atom_type,
    );
    let neutral = session.frame.to_physical(session.model.cloud.repeat(1).view());
    let clash_table = builder.build(
        neutral.index_axis(Axis(0), 0),
        None,
        session.config.clash.neighbor_count,
    );

    let total = (schedule.ca_epochs * epoch_batches(n_particles, schedule.batch_size)) as u64;
    reporter.report(Progress::StageStart {
        stage: Stage::CarbonAlpha.token(),
        total_iterations: total,
    });

    let mut optimizer = Adam::new(schedule.learn_rate);
    let mut iteration = 0u64;
    for _ in 0..schedule.ca_epochs {
        for batch in stage::shuffled_batches(n_particles, schedule.batch_size, rng) {
            let images: Vec<&ParticleImage> =
                batch.iter().map(|&i| &session.particles[i]).collect();
            let mut latent = session.trajectory.batch_for_particles(&batch, n_particles);
            latent::perturb(&mut latent, schedule.latent_noise, rng);

            let (morph_disp, _) = decoders.morph.decode(latent.view(), false, rng);
            let (residue_disp, tape) = decoders.residue.decode(latent.view(), true, rng);
            let mut cloud = session.model.cloud.repeat(batch.len());
            let coarse = morph_disp + &residue_disp;
            add_gated(&mut cloud, &gate, &coarse);

            let eval = assembly.ca_batch(
                &session.projector,
                &ctx,
                cloud.view(),
                &images,
                &clash_table,
            );
            stage::guard_finite(Stage::CarbonAlpha, iteration, eval.loss)?;

            let cotangent = gate_cotangent(&gate, &eval.grad);
            let grads = decoders.residue.backward(&tape, cotangent.view());
            optimizer.apply(decoders.residue.layers_mut(), &grads);

            reporter.report(Progress::Iteration {
                iteration,
                loss: eval.loss,
                image_score: eval.image_score,
                report: eval.report,
            });
            iteration += 1;
        }
    }
    finish_stage(session, decoders, Stage::CarbonAlpha, rng)?;
    reporter.report(Progress::StageFinish {
        stage: Stage::CarbonAlpha.token(),
    });
    Ok(())
}

/// Rebuilds the clash tables from the current snapshot-frame geometry with
/// hydrogens placed, merging the worst gap over frames.
fn rebuild_clash(
    session: &Session,
    decoders: &DecoderSet,
    builder: &ClashIndexBuilder<'_>,
    gate: &Array1<f64>,
    snapshot_latent: ArrayView2<'_, f64>,
    moving_subset: Option<&Vec<usize>>,
    rng: &mut ChaCha8Rng,
) -> (ClashTable, Option<ClashTable>) {
    let cloud = decoders.compose(session, gate, snapshot_latent, Stage::Full, rng);
    let physical = session.frame.to_physical(cloud.view());
    let wide = session.hydrogens.place(physical.view());
    let table = builder.build_multi(wide.view(), None, session.config.clash.neighbor_count);
    let moving = moving_subset.map(|subset| {
        builder.build_multi(
            wide.view(),
            Some(subset),
            session.config.clash.neighbor_count * session.config.clash.moving_multiplier,
        )
    });
    (table, moving)
}

/// Full stage: the per-atom decoder under the complete restraint set. Runs
/// restraint-only on random latents unless particles are present and the
/// image weight is positive.
fn run_full(
    session: &Session,
    decoders: &mut DecoderSet,
    assembly: &mut LossAssembly,
    rng: &mut ChaCha8Rng,
    reporter: &ProgressReporter<'_>,
) -> Result<(), RefineError> {
    let schedule = &session.config.schedule;
    if schedule.full_rounds == 0 {
        info!("full stage skipped, checkpoint weights kept");
        return Ok(());
    }
    let gate = session.gate();
    let ctx = session.loss_context();
    let parents = session.hydrogen_parents();
    let moving_subset = session.mask.moving_subset(&parents);

    let builder = ClashIndexBuilder::new(
        &session.config.clash,
        &session.exclusions,
        &session.topology.vdw_radius,
        &session.topology.atom_type,
    );
    let snapshot_positions: Vec<f64> = session
        .trajectory
        .snapshot_frames()
        .into_iter()
        .map(|f| session.trajectory.frame_position(f))
        .collect();
    let snapshot_latent = session.trajectory.batch_at(&snapshot_positions);

    let use_particles =
        assembly.weights().image_weight > 0.0 && !session.particles.is_empty();
    let total = FULL_STEPS_PER_ROUND * schedule.full_rounds as u64;
    reporter.report(Progress::StageStart {
        stage: Stage::Full.token(),
        total_iterations: total,
    });

    let (mut clash_table, mut moving_table) = rebuild_clash(
        session,
        decoders,
        &builder,
        &gate,
        snapshot_latent.view(),
        moving_subset.as_ref(),
        rng,
    );
    let mut optimizer = Adam::new(schedule.learn_rate);
    for step in 0..total {
        if step > 0 && FULL_REBUILD_STEPS.contains(&step) {
            (clash_table, moving_table) = rebuild_clash(
                session,
                decoders,
                &builder,
                &gate,
                snapshot_latent.view(),
                moving_subset.as_ref(),
                rng,
            );
            reporter.report(Progress::Message(format!(
                "clash index rebuilt at step {step}"
            )));
        }

        let (latent, batch): (Array2<f64>, Option<Vec<&ParticleImage>>) = if use_particles {
            let k = schedule.batch_size.min(session.particles.len());
            let picked = rand::seq::index::sample(rng, session.particles.len(), k).into_vec();
            let latent = session
                .trajectory
                .batch_for_particles(&picked, session.particles.len());
            let images = picked.iter().map(|&i| &session.particles[i]).collect();
            (latent, Some(images))
        } else {
            let positions = session.trajectory.random_positions(schedule.batch_size, rng);
            (session.trajectory.batch_at(&positions), None)
        };

        let (morph_disp, _) = decoders.morph.decode(latent.view(), false, rng);
        let (residue_disp, _) = decoders.residue.decode(latent.view(), false, rng);
        let (full_disp, tape) = decoders.full.decode(latent.view(), true, rng);
        let mut cloud = session.model.cloud.repeat(latent.nrows());
        let coarse = morph_disp + &residue_disp;
        add_gated(&mut cloud, &gate, &coarse);
        cloud += &full_disp;

        let eval = assembly.full_batch(
            &session.projector,
            &ctx,
            cloud.view(),
            batch.as_deref(),
            &clash_table,
            moving_table.as_ref(),
        );
        stage::guard_finite(Stage::Full, step, eval.loss)?;

        // the per-atom term enters ungated, so its cotangent does too
        let grads = decoders.full.backward(&tape, eval.grad.view());
        optimizer.apply(decoders.full.layers_mut(), &grads);

        reporter.report(Progress::Iteration {
            iteration: step,
            loss: eval.loss,
            image_score: eval.image_score,
            report: eval.report,
        });
    }
    finish_stage(session, decoders, Stage::Full, rng)?;
    reporter.report(Progress::StageFinish {
        stage: Stage::Full.token(),
    });
    Ok(())
}
