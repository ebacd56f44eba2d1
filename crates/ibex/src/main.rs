//! ibex CLI entry point.

use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use ibex::cli::Cli;

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing
    let default_level = if cli.debug { "ibex=debug" } else { "ibex=info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(default_level.parse()?))
        .init();

    // Execute command; the container's exit code becomes ours.
    let code = cli.execute()?;
    std::process::exit(code);
}
