mod classify;
mod cli;
mod commands;

use clap::Parser;
use vision::ClassifyConfig;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    let output = cli.output();
    let config = ClassifyConfig::try_from(cli.args)?;
    classify::run(config, output)
}
