use std::process::ExitCode;

use clap::Parser;

use uno_dlq_cli::{Cli, exit_code, run};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    uno_observability::init_with_level(&cli.log_level);

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    match run(cli, stdin.lock(), &mut stdout).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}
