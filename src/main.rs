mod cli;
mod logging;
mod orchestrator;
mod runlog;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use config::ConfigLoader;
use logging::Verbosity;
use model::ExitCode;
use orchestrator::Orchestrator;
use runlog::RunLog;
use tracing::error;

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            // the subscriber may not be installed yet
            eprintln!("dbcollect: {:#}", e);
            error!(error = %format!("{:#}", e), "Setup failed");
            ExitCode::SetupFailed
        }
    };
    std::process::ExitCode::from(code.code() as u8)
}

fn run(cli: &Cli) -> Result<ExitCode> {
    if cli.version {
        println!("{}", cli::version_text());
        return Ok(ExitCode::Success);
    }
    if let Some(shell) = cli.completions {
        Cli::print_completions(shell);
        return Ok(ExitCode::Success);
    }
    if let Some(code) = cli.explain {
        match ExitCode::from_code(code) {
            Some(code) => println!("{}: {}", code.code(), code.describe()),
            None => println!("{}: not a dbcollect exit code", code),
        }
        return Ok(ExitCode::Success);
    }

    let verbosity = Verbosity::from_flags(cli.quiet, cli.debug);

    if cli.cleanup {
        logging::init(verbosity, None)?;
        let removed = orchestrator::cleanup(&cli.tempdir)?;
        if !cli.quiet {
            println!("Removed {} bundle(s) from {}", removed, cli.tempdir.display());
        }
        return Ok(ExitCode::Success);
    }

    let (run_log, log_file) = RunLog::create(&cli.tempdir)?;
    logging::init(verbosity, Some(log_file))?;

    let loader = match &cli.config {
        Some(path) => ConfigLoader::new(path).use_defaults(false),
        None => ConfigLoader::system(),
    };
    let loaded = loader
        .load()
        .with_context(|| format!("Failed to load configuration from {}", loader.path().display()))?;

    let options = cli.options(loaded.timeouts);
    options
        .timeouts
        .validate()
        .context("Invalid timeouts")?;

    let outcome = Orchestrator::new(options, loaded.catalogs).run(&run_log)?;

    if outcome.code.is_success() && !cli.quiet {
        println!("Bundle written to {}", outcome.bundle.display());
    } else if !outcome.code.is_success() {
        eprintln!("dbcollect: {} ({})", outcome.code.describe(), outcome.code.code());
    }
    if cli.debug {
        match run_log.read() {
            Ok(text) => print!("{}", text),
            Err(e) => eprintln!("dbcollect: {:#}", e),
        }
    }

    Ok(outcome.code)
}
