use std::{error::Error, net::SocketAddr};

use clap::Parser;
use hybridsim::echo::EchoServer;

#[derive(Debug, Parser)]
#[command(version, about = "Answer (time, data, flag) requests with data * 2 + flag", long_about = None)]
struct Cli {
    /// Listen for new connections at address
    #[arg(default_value = "127.0.0.1:7200")]
    address: SocketAddr,
    /// Number of connections served concurrently
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let server = EchoServer::bind(cli.address, cli.workers)?;

    server.listen()?;
    Ok(())
}
