use crate::cli::RefineArgs;
use crate::error::Result;
use crate::progress::CliProgressHandler;
use emflex::engine::config::RefineConfig;
use emflex::engine::progress::ProgressReporter;
use emflex::workflows;
use tracing::info;

pub fn run(args: RefineArgs) -> Result<()> {
    info!("Loading run configuration from {:?}", &args.config);
    let mut config = RefineConfig::from_toml(&args.config)?;
    if let Some(dir) = args.output_dir {
        config.paths.output_dir = dir;
    }
    if let Some(seed) = args.seed {
        config.schedule.seed = seed;
    }
    if args.load {
        config.schedule.load = true;
    }
    std::fs::create_dir_all(&config.paths.output_dir)?;

    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    println!("Starting staged refinement...");
    let output_dir = config.paths.output_dir.clone();
    workflows::refine::refine(config, &reporter)?;

    println!(
        "Refinement complete. Snapshots and checkpoints written to: {}",
        output_dir.display()
    );
    Ok(())
}
