//! High-level workflows tying the core math and engine machinery into
//! complete procedures: staged refinement and trajectory export.

pub mod evaluate;
pub mod refine;

use ndarray::Array1;
use tracing::{info, warn};

use crate::core::io::stack::{self, ParticleImage};
use crate::core::io::tables::{self, RotamerLibrary};
use crate::core::model::anchors::{self, Anchors};
use crate::core::model::hydrogens::HydrogenSet;
use crate::core::model::mask::RegionMask;
use crate::core::model::points::GridFrame;
use crate::core::model::topology::{self, Topology};
use crate::core::model::PointModel;
use crate::core::project::Projector;
use crate::core::restraints::rama::RamaTables;
use crate::core::restraints::rotamers::ResidueRotamers;
use crate::engine::config::RefineConfig;
use crate::engine::error::RefineError;
use crate::engine::latent::Trajectory;
use crate::engine::loss::LossContext;

/// Everything a run needs loaded and cross-validated: the model, its
/// topology and restraint references, the particle set, and the derived
/// structures shared by every stage.
pub struct Session {
    pub config: RefineConfig,
    pub frame: GridFrame,
    pub projector: Projector,
    pub model: PointModel,
    pub topology: Topology,
    pub hydrogens: HydrogenSet,
    pub mask: RegionMask,
    pub anchors: Anchors,
    pub rama_tables: RamaTables,
    pub rotamer_slots: Vec<ResidueRotamers>,
    pub exclusions: Vec<Vec<usize>>,
    pub particles: Vec<ParticleImage>,
    pub trajectory: Trajectory,
}

impl Session {
    /// Loads all inputs named by the configuration. Anchors are reloaded
    /// when the anchor table exists, otherwise computed and persisted so a
    /// resumed run keeps the same patch structure.
    pub fn load(config: RefineConfig) -> Result<Self, RefineError> {
        let frame = config.projection.frame()?;
        let symmetry = config.projection.parse_symmetry()?;
        let projector = Projector::new(frame.size, symmetry);
        let paths = &config.paths;

        let model = tables::load_model(&paths.model, &frame)?;
        let n_heavy = model.n_atoms();
        let atom_type: Vec<u8> = model
            .meta
            .iter()
            .map(|m| topology::element_type_code(&m.element))
            .collect();
        let mut topology = Topology::new(
            n_heavy,
            tables::load_bonds(&paths.bonds)?,
            tables::load_angles(&paths.angles)?,
            tables::load_rama_rows(&paths.rama)?,
            tables::load_planes(&paths.planes)?,
            tables::load_planes(&paths.peptide_planes)?,
            tables::load_chi(&paths.chi)?,
            tables::load_vdw(&paths.vdw)?,
            atom_type,
        )?;
        let hydrogens = tables::load_hydrogens(&paths.hydrogens, n_heavy)?;
        topology.append_hydrogens(&hydrogens)?;
        info!(
            n_heavy,
            n_hydrogens = hydrogens.len(),
            n_residues = model.n_residues,
            "model and topology loaded"
        );

        let mask = match &paths.mask {
            Some(path) => tables::load_mask(path, n_heavy)?,
            None => RegionMask::None,
        };

        let anchors = if paths.anchors.is_file() {
            tables::load_anchors(&paths.anchors, &model)?
        } else {
            let anchors = anchors::compute(
                &model,
                &mask,
                config.schedule.n_patches,
                config.schedule.seed,
            )?;
            tables::save_anchors(&paths.anchors, &anchors)?;
            info!(n_patches = anchors.n_patches(), path = %paths.anchors.display(), "anchors computed");
            anchors
        };

        let rama_tables = tables::load_rama_tables(&paths.rama_grids)?;
        for class in rama_tables.missing_for(&topology.rama) {
            warn!(
                class = class.token(),
                "no outlier grid for this backbone class; its residues score zero"
            );
        }

        let library = RotamerLibrary::load(&paths.rotamers)?;
        let rotamer_slots = library.slots(&model, &topology.chi);

        let particles = match (&paths.particles, &paths.orientations) {
            (Some(stack_path), Some(orient_path)) => {
                let images = stack::load_stack(stack_path)?;
                let orientations = stack::load_orientations(orient_path)?;
                stack::prepare_particles(&images, &orientations, frame.size)?
            }
            _ => Vec::new(),
        };
        if !particles.is_empty() {
            info!(n_particles = particles.len(), size = frame.size, "particles prepared");
        }

        let exclusions = topology.graph_exclusions(
            config.clash.max_bond_separation,
            config.clash.bfs_chunk,
        );
        let trajectory = Trajectory::new(config.trajectory.shape, config.trajectory.n_frames);

        Ok(Self {
            config,
            frame,
            projector,
            model,
            topology,
            hydrogens,
            mask,
            anchors,
            rama_tables,
            rotamer_slots,
            exclusions,
            particles,
            trajectory,
        })
    }

    pub fn n_heavy(&self) -> usize {
        self.model.n_atoms()
    }

    /// Displacement gate over heavy atoms, all ones without a mask.
    pub fn gate(&self) -> Array1<f64> {
        self.mask.gate(self.n_heavy())
    }

    /// Parent heavy atom of each hydrogen slot, for moving-domain lookups.
    pub fn hydrogen_parents(&self) -> Vec<usize> {
        self.hydrogens.rows().iter().map(|r| r.parent).collect()
    }

    pub fn loss_context(&self) -> LossContext<'_> {
        LossContext {
            topology: &self.topology,
            rama_tables: &self.rama_tables,
            rotamer_slots: &self.rotamer_slots,
            hydrogens: &self.hydrogens,
            frame: self.frame,
        }
    }
}
