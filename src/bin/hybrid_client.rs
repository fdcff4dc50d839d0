use std::{error::Error, path::PathBuf, sync::atomic::Ordering};

use clap::Parser;
use hybridsim::{
    config::SimulationConfig,
    driver::{Driver, LumpedMassModel},
};
use log::{info, warn};

#[derive(Debug, Parser)]
#[command(version, about = "Run a hybrid simulation against remote sites", long_about = None)]
struct Cli {
    /// Path to the simulation configuration (JSON)
    config: PathBuf,
    /// Override the number of steps from the configuration
    #[arg(long)]
    steps: Option<u64>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = SimulationConfig::from_path(&cli.config)?;
    let model = LumpedMassModel::new(config.model.clone())?;
    let elements = config.connect_elements()?;

    let mut driver = Driver::new(
        model,
        elements,
        config.analysis.dt,
        config.analysis.max_iterations,
    );
    let stop = driver.stop_handle();
    ctrlc::set_handler(move || {
        warn!("interrupt received, stopping after the current step");
        stop.store(true, Ordering::SeqCst);
    })?;

    let report = driver.run(cli.steps.unwrap_or(config.analysis.steps))?;
    info!(
        "{} steps completed, t = {}{}",
        report.steps,
        report.time,
        if report.stopped { " (stopped)" } else { "" }
    );
    for (dof, value) in driver.model().displacement().iter().enumerate() {
        println!("{dof}\t{value}");
    }
    Ok(())
}
