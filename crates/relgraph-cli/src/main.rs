//! relgraph CLI
//!
//! Command-line interface for mapping JSON data into a SQLite-backed object
//! graph and inspecting the stored documents

use clap::{Parser, Subcommand};

mod commands;

#[derive(Debug, Parser)]
#[command(name = "relgraph")]
#[command(about = "relgraph - object graph mapping over a document store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Map JSON records onto a mapping and merge them into the database
    Map(commands::map::MapArgs),
    /// Print one stored document
    Show(commands::show::ShowArgs),
    /// List stored documents of a collection
    List(commands::list::ListArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Map(args) => commands::map::execute(args).await,
        Commands::Show(args) => commands::show::execute(args).await,
        Commands::List(args) => commands::list::execute(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
