pub mod init;
pub mod status;
pub mod tax;
pub mod upload;

use clap::{Parser, Subcommand};

use crate::error::Result;

#[derive(Parser)]
#[command(name = "tally", about = "Transaction ingestion and progressive tax calculator.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Choose a data directory and initialize the database.
    Init {
        /// Path for Tally data (default: ~/Documents/tally)
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// Ingest a CSV/XLSX file of transactions and compute tax on each one.
    Upload {
        /// Path to CSV or XLSX file to ingest
        file: String,
    },
    /// Calculate and store tax for a user.
    Calculate {
        /// User name the record is stored under
        user: String,
        /// Annual income
        #[arg(allow_negative_numbers = true)]
        income: f64,
    },
    /// Show the stored tax record for a user.
    Get {
        user: String,
    },
    /// Recompute every stored tax record through the workers and list them.
    List {
        /// Seconds to wait for each response (default: from settings)
        #[arg(long = "timeout-secs")]
        timeout_secs: Option<u64>,
    },
    /// Show data directory and record counts.
    Status,
}

/// Multi-threaded runtime for commands that start the worker pool.
pub(crate) fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}
