mod bus;
mod cache;
mod cli;
mod correlator;
mod db;
mod error;
mod fmt;
mod ingest;
mod messages;
mod models;
mod parser;
mod publisher;
mod service;
mod settings;
mod store;
mod tax;
mod worker;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cli::{Cli, Commands};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Init { data_dir } => cli::init::run(data_dir),
        Commands::Upload { file } => cli::upload::run(&file),
        Commands::Calculate { user, income } => cli::tax::calculate(&user, income),
        Commands::Get { user } => cli::tax::get(&user),
        Commands::List { timeout_secs } => cli::tax::list(timeout_secs),
        Commands::Status => cli::status::run(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
