mod commands;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "diskmorph", about = "Expose forensic disk images through a virtual, optionally-writable envelope")]
pub(crate) struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Assemble the pipeline and expose it at a mountpoint via FUSE
    Mount(commands::mount::Cli),
    /// List the input/morph/output plug-ins discovered in a directory
    Plugins(commands::plugins::Cli),
    /// Generate shell completion scripts
    Completions(commands::completions::Cli),
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Mount(args) => commands::mount::run(args),
        Commands::Plugins(args) => commands::plugins::run(args),
        Commands::Completions(args) => commands::completions::run(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("diskmorph: {e:#}");
            ExitCode::FAILURE
        }
    }
}
