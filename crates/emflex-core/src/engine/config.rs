use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use super::checkpoint;
use super::latent::TrajectoryShape;
use super::stage::Stage;
use crate::core::model::ModelError;
use crate::core::model::points::GridFrame;
use crate::core::project::{Symmetry, SymmetryParseError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Stage '{stage}' has a zero iteration budget but weight loading is off")]
    ZeroBudgetWithoutLoad { stage: &'static str },

    #[error("Stage '{stage}' is skipped but its checkpoint '{path}' does not exist")]
    MissingCheckpoint { stage: &'static str, path: PathBuf },

    #[error("An image weight of {weight} requires a particle stack and orientation table")]
    ParticlesRequired { weight: f64 },

    #[error("Batch size must be at least 2, got {0}")]
    BatchSize(usize),

    #[error("A trajectory needs at least 2 frames, got {0}")]
    TooFewFrames(usize),

    #[error("Invalid {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },

    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("TOML parsing error for '{path}': {source}")]
    Toml {
        path: String,
        source: toml::de::Error,
    },
}

/// Raw data geometry and rendering parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    pub raw_size: usize,
    pub raw_apix: f64,
    /// Target resolution in Å; fixes the working box size.
    pub resolution: f64,
    pub symmetry: String,
    /// Lowest ring of the FRC window, in Fourier pixels.
    pub min_px: usize,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            raw_size: 256,
            raw_apix: 1.0,
            resolution: 8.0,
            symmetry: "c1".to_string(),
            min_px: 4,
        }
    }
}

impl ProjectionConfig {
    pub fn frame(&self) -> Result<GridFrame, ModelError> {
        GridFrame::from_raw(self.raw_size, self.raw_apix, self.resolution)
    }

    pub fn parse_symmetry(&self) -> Result<Symmetry, SymmetryParseError> {
        self.symmetry.parse()
    }
}

/// Per-stage loss weights and thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LossWeights {
    /// Scale on the negative-mean-FRC term in the full stage; 0 disables
    /// the image term and with it the need for particles.
    pub image_weight: f64,
    pub ca_nstd: f64,
    pub ca_restraint_weight: f64,
    pub ca_model_weight: f64,
    pub ca_overlap: f64,
    pub full_nstd: f64,
    pub bond_outlier_weight: f64,
    pub angle_outlier_weight: f64,
    pub rama_mean_weight: f64,
    pub rama_soft_threshold: f64,
    pub rama_soft_weight: f64,
    pub rama_hard_threshold: f64,
    pub rama_hard_weight: f64,
    pub plane_weight: f64,
    pub rotamer_mean_weight: f64,
    pub rotamer_threshold: f64,
    pub rotamer_hard_weight: f64,
    pub full_overlap: f64,
    pub clash_weight: f64,
    pub clash_sign_bonus: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            image_weight: 1.0,
            ca_nstd: 4.0,
            ca_restraint_weight: 1000.0 * 20.0,
            ca_model_weight: 1e-6,
            ca_overlap: 0.5,
            full_nstd: 4.5,
            bond_outlier_weight: 50.0,
            angle_outlier_weight: 1000.0 * 20.0,
            rama_mean_weight: 0.1,
            rama_soft_threshold: 1.0 - 0.022,
            rama_soft_weight: 500.0,
            rama_hard_threshold: 1.0 - 0.001,
            rama_hard_weight: 1e6,
            plane_weight: 1000.0,
            rotamer_mean_weight: 5.0,
            rotamer_threshold: 0.99,
            rotamer_hard_weight: 5000.0,
            full_overlap: 0.35,
            clash_weight: 5.0,
            clash_sign_bonus: 0.1,
        }
    }
}

/// Clash-index construction parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClashConfig {
    /// Candidate slots kept per atom.
    pub neighbor_count: usize,
    /// Extra neighbors fetched before exclusion filtering.
    pub pad: usize,
    /// Bond-graph distance inside which pairs are never clash candidates.
    pub max_bond_separation: usize,
    /// BFS source-chunk size bounding exclusion-set memory.
    pub bfs_chunk: usize,
    /// Neighbor-count multiplier for the moving-domain index.
    pub moving_multiplier: usize,
}

impl Default for ClashConfig {
    fn default() -> Self {
        Self {
            neighbor_count: 128,
            pad: 60,
            max_bond_separation: 3,
            bfs_chunk: 5000,
            moving_multiplier: 3,
        }
    }
}

/// Stage iteration budgets and training hyperparameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageSchedule {
    /// Epochs per morph ladder rung.
    pub morph_epochs: usize,
    /// Cα stage epochs.
    pub ca_epochs: usize,
    /// Full-stage rounds of 5000 steps each.
    pub full_rounds: usize,
    pub batch_size: usize,
    pub learn_rate: f64,
    pub latent_noise: f64,
    /// Load existing stage checkpoints before training.
    pub load: bool,
    pub seed: u64,
    /// Anchor patch count for the morph decoder.
    pub n_patches: usize,
}

impl Default for StageSchedule {
    fn default() -> Self {
        Self {
            morph_epochs: 1,
            ca_epochs: 1,
            full_rounds: 1,
            batch_size: 16,
            learn_rate: 1e-5,
            latent_noise: 0.02,
            load: false,
            seed: 0,
            n_patches: 128,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrajectoryConfig {
    pub shape: TrajectoryShape,
    pub n_frames: usize,
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self {
            shape: TrajectoryShape::Linear,
            n_frames: 8,
        }
    }
}

/// Input table and output locations. The particle stack is optional; the
/// full stage runs restraint-only when the image weight is zero.
#[derive(Debug, Clone, Deserialize)]
pub struct InputPaths {
    pub model: PathBuf,
    pub bonds: PathBuf,
    pub angles: PathBuf,
    pub rama: PathBuf,
    pub rama_grids: PathBuf,
    pub planes: PathBuf,
    pub peptide_planes: PathBuf,
    pub chi: PathBuf,
    pub vdw: PathBuf,
    pub rotamers: PathBuf,
    pub hydrogens: PathBuf,
    pub anchors: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub mask: Option<PathBuf>,
    #[serde(default)]
    pub particles: Option<PathBuf>,
    #[serde(default)]
    pub orientations: Option<PathBuf>,
}

/// The full immutable run configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RefineConfig {
    pub paths: InputPaths,
    #[serde(default)]
    pub projection: ProjectionConfig,
    #[serde(default)]
    pub weights: LossWeights,
    #[serde(default)]
    pub clash: ClashConfig,
    #[serde(default)]
    pub schedule: StageSchedule,
    #[serde(default)]
    pub trajectory: TrajectoryConfig,
}

impl RefineConfig {
    pub fn from_toml(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Toml {
            path: path.to_string_lossy().to_string(),
            source: e,
        })
    }

    pub fn builder() -> RefineConfigBuilder {
        RefineConfigBuilder::default()
    }

    /// The fatal precondition checks, run before any computation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schedule.batch_size < 2 {
            return Err(ConfigError::BatchSize(self.schedule.batch_size));
        }
        if self.trajectory.n_frames < 2 {
            return Err(ConfigError::TooFewFrames(self.trajectory.n_frames));
        }
        self.projection.frame().map_err(|e| ConfigError::Invalid {
            field: "projection",
            message: e.to_string(),
        })?;
        self.projection
            .parse_symmetry()
            .map_err(|e| ConfigError::Invalid {
                field: "symmetry",
                message: e.to_string(),
            })?;
        if self.weights.image_weight > 0.0
            && (self.paths.particles.is_none() || self.paths.orientations.is_none())
        {
            return Err(ConfigError::ParticlesRequired {
                weight: self.weights.image_weight,
            });
        }

        let budgets = [
            (Stage::Morph, self.schedule.morph_epochs),
            (Stage::CarbonAlpha, self.schedule.ca_epochs),
            (Stage::Full, self.schedule.full_rounds),
        ];
        for (stage, budget) in budgets {
            if budget > 0 {
                continue;
            }
            if !self.schedule.load {
                return Err(ConfigError::ZeroBudgetWithoutLoad {
                    stage: stage.token(),
                });
            }
            if !checkpoint::exists(&self.paths.output_dir, stage) {
                return Err(ConfigError::MissingCheckpoint {
                    stage: stage.token(),
                    path: checkpoint::weight_path(&self.paths.output_dir, stage),
                });
            }
        }
        Ok(())
    }
}

/// Programmatic construction mirror of the TOML schema; table paths are
/// required, the parameter records default.
#[derive(Default)]
pub struct RefineConfigBuilder {
    model: Option<PathBuf>,
    bonds: Option<PathBuf>,
    angles: Option<PathBuf>,
    rama: Option<PathBuf>,
    rama_grids: Option<PathBuf>,
    planes: Option<PathBuf>,
    peptide_planes: Option<PathBuf>,
    chi: Option<PathBuf>,
    vdw: Option<PathBuf>,
    rotamers: Option<PathBuf>,
    hydrogens: Option<PathBuf>,
    anchors: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    mask: Option<PathBuf>,
    particles: Option<PathBuf>,
    orientations: Option<PathBuf>,
    projection: Option<ProjectionConfig>,
    weights: Option<LossWeights>,
    clash: Option<ClashConfig>,
    schedule: Option<StageSchedule>,
    trajectory: Option<TrajectoryConfig>,
}

macro_rules! path_setter {
    ($($name:ident),+) => {
        $(pub fn $name(mut self, path: PathBuf) -> Self {
            self.$name = Some(path);
            self
        })+
    };
}

impl RefineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    path_setter!(
        model, bonds, angles, rama, rama_grids, planes, peptide_planes, chi, vdw, rotamers,
        hydrogens, anchors, output_dir, mask, particles, orientations
    );

    pub fn projection(mut self, config: ProjectionConfig) -> Self {
        self.projection = Some(config);
        self
    }

    pub fn weights(mut self, weights: LossWeights) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn clash(mut self, config: ClashConfig) -> Self {
        self.clash = Some(config);
        self
    }

    pub fn schedule(mut self, schedule: StageSchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn trajectory(mut self, trajectory: TrajectoryConfig) -> Self {
        self.trajectory = Some(trajectory);
        self
    }

    pub fn build(self) -> Result<RefineConfig, ConfigError> {
        let paths = InputPaths {
            model: self.model.ok_or(ConfigError::MissingParameter("model"))?,
            bonds: self.bonds.ok_or(ConfigError::MissingParameter("bonds"))?,
            angles: self.angles.ok_or(ConfigError::MissingParameter("angles"))?,
            rama: self.rama.ok_or(ConfigError::MissingParameter("rama"))?,
            rama_grids: self
                .rama_grids
                .ok_or(ConfigError::MissingParameter("rama_grids"))?,
            planes: self.planes.ok_or(ConfigError::MissingParameter("planes"))?,
            peptide_planes: self
                .peptide_planes
                .ok_or(ConfigError::MissingParameter("peptide_planes"))?,
            chi: self.chi.ok_or(ConfigError::MissingParameter("chi"))?,
            vdw: self.vdw.ok_or(ConfigError::MissingParameter("vdw"))?,
            rotamers: self
                .rotamers
                .ok_or(ConfigError::MissingParameter("rotamers"))?,
            hydrogens: self
                .hydrogens
                .ok_or(ConfigError::MissingParameter("hydrogens"))?,
            anchors: self
                .anchors
                .ok_or(ConfigError::MissingParameter("anchors"))?,
            output_dir: self
                .output_dir
                .ok_or(ConfigError::MissingParameter("output_dir"))?,
            mask: self.mask,
            particles: self.particles,
            orientations: self.orientations,
        };
        Ok(RefineConfig {
            paths,
            projection: self.projection.unwrap_or_default(),
            weights: self.weights.unwrap_or_default(),
            clash: self.clash.unwrap_or_default(),
            schedule: self.schedule.unwrap_or_default(),
            trajectory: self.trajectory.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_config(dir: &Path) -> RefineConfig {
        let p = |name: &str| dir.join(name);
        RefineConfig::builder()
            .model(p("model.csv"))
            .bonds(p("bonds.csv"))
            .angles(p("angles.csv"))
            .rama(p("rama.csv"))
            .rama_grids(p("grids.csv"))
            .planes(p("planes.csv"))
            .peptide_planes(p("peptide.csv"))
            .chi(p("chi.csv"))
            .vdw(p("vdw.csv"))
            .rotamers(p("rotamers.csv"))
            .hydrogens(p("hydrogens.csv"))
            .anchors(p("anchors.csv"))
            .output_dir(dir.to_path_buf())
            .particles(p("particles.emfp"))
            .orientations(p("orients.csv"))
            .build()
            .unwrap()
    }

    #[test]
    fn missing_path_is_reported_by_name() {
        let result = RefineConfig::builder().model(PathBuf::from("m.csv")).build();
        assert!(matches!(
            result,
            Err(ConfigError::MissingParameter("bonds"))
        ));
    }

    #[test]
    fn default_config_validates() {
        let dir = tempdir().unwrap();
        let config = create_test_config(dir.path());
        config.validate().unwrap();
    }

    #[test]
    fn image_term_requires_particles() {
        let dir = tempdir().unwrap();
        let mut config = create_test_config(dir.path());
        config.paths.particles = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ParticlesRequired { .. })
        ));
        // weight 0 lifts the requirement
        config.weights.image_weight = 0.0;
        config.validate().unwrap();
    }

    #[test]
    fn zero_budget_stage_needs_its_checkpoint() {
        let dir = tempdir().unwrap();
        let mut config = create_test_config(dir.path());
        config.schedule.morph_epochs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroBudgetWithoutLoad { stage: "morph" })
        ));

        config.schedule.load = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCheckpoint { stage: "morph", .. })
        ));

        std::fs::write(
            crate::engine::checkpoint::weight_path(dir.path(), Stage::Morph),
            b"",
        )
        .unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn toml_round_trip_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("refine.toml");
        std::fs::write(
            &path,
            r#"
[paths]
model = "model.csv"
bonds = "bonds.csv"
angles = "angles.csv"
rama = "rama.csv"
rama_grids = "grids.csv"
planes = "planes.csv"
peptide_planes = "peptide.csv"
chi = "chi.csv"
vdw = "vdw.csv"
rotamers = "rotamers.csv"
hydrogens = "hydrogens.csv"
anchors = "anchors.csv"
output_dir = "out"

[projection]
raw_size = 128
raw_apix = 1.5
resolution = 6.0

[schedule]
batch_size = 8
seed = 42

[trajectory]
shape = "circular"
n_frames = 10
"#,
        )
        .unwrap();
        let config = RefineConfig::from_toml(&path).unwrap();
        assert_eq!(config.projection.raw_size, 128);
        assert_eq!(config.projection.symmetry, "c1");
        assert_eq!(config.schedule.batch_size, 8);
        assert_eq!(config.schedule.seed, 42);
        assert!((config.weights.image_weight - 1.0).abs() < 1e-12);
        assert_eq!(config.trajectory.shape, TrajectoryShape::Circular);
        assert_eq!(config.trajectory.n_frames, 10);
        assert!(config.paths.particles.is_none());
    }
}
