use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = metric_window_cli::Cli::parse();
    metric_window_cli::run_cli(cli)
}
