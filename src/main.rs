use clap::Parser;
use orbtrader::cli::{Cli, run};
use orbtrader::logging;

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    run(cli)
}
