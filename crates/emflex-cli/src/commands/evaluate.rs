use crate::cli::EvaluateArgs;
use crate::error::{CliError, Result};
use crate::progress::CliProgressHandler;
use emflex::engine::config::RefineConfig;
use emflex::engine::progress::ProgressReporter;
use emflex::workflows;
use tracing::info;

pub fn run(args: EvaluateArgs) -> Result<()> {
    info!("Loading run configuration from {:?}", &args.config);
    let mut config = RefineConfig::from_toml(&args.config)?;
    if let Some(n) = args.n_frames {
        if n < 2 {
            return Err(CliError::Argument(format!(
                "at least 2 trajectory frames are required, got {n}"
            )));
        }
        config.trajectory.n_frames = n;
    }

    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    println!("Exporting conformer trajectory...");
    let output_dir = config.paths.output_dir.clone();
    workflows::evaluate::evaluate(config, &reporter)?;

    println!(
        "Trajectory export complete. Frames written to: {}",
        output_dir.display()
    );
    Ok(())
}
