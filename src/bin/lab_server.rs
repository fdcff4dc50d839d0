use std::{error::Error, path::PathBuf};

use clap::Parser;
use hybridsim::config::LabConfig;
use log::info;

#[derive(Debug, Parser)]
#[command(version, about = "Serve experimental sites to remote elements", long_about = None)]
struct Cli {
    /// Path to the lab configuration (JSON)
    config: PathBuf,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = LabConfig::from_path(&cli.config)?;
    let server = config.build_server()?;
    for (site, address) in server.addresses() {
        info!("site '{site}' listening at {address}");
    }

    let mut failed = 0;
    for outcome in server.run() {
        if let Err(e) = outcome.result {
            eprintln!("site '{}' failed: {e}", outcome.site_id);
            failed += 1;
        }
    }
    if failed > 0 {
        return Err(format!("{failed} site(s) failed").into());
    }
    Ok(())
}
