use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    env_logger::init();
    let cli = runledger_cli::Cli::parse();
    runledger_cli::run_cli(cli)
}
