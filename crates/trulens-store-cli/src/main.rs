use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = trulens_store_cli::Cli::parse();
    trulens_store_cli::init_tracing();
    trulens_store_cli::run_cli(cli)
}
