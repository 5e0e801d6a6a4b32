use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = analysis_ledger_cli::Cli::parse();
    analysis_ledger_cli::run_cli(cli)
}
