use clap::Parser;

mod cli;
mod config;
mod container;
mod error;
mod model;
mod naming;
mod orchestrator;
mod state;
mod storage;

use cli::Cli;

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let exit_code = cli::run(cli.command).await;
    std::process::exit(exit_code);
}
