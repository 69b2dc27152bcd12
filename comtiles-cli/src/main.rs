mod convert;
mod dir_source;
mod show;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "comtiles")]
#[command(about = "COMTiles CLI tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a COMTiles archive (`comtiles-convert`, spec.md §6)
    Convert(convert::Args),
    /// Inspect a local or remote archive
    Show(show::Args),
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Example: RUST_LOG=debug comtiles convert ...
    env_logger::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Convert(args) => convert::run(args).await,
        Commands::Show(args) => show::run(args).await,
    };

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}
