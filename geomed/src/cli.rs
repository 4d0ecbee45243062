//! Command line interface.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use thiserror::Error;

use crate::config::Config;

/// geomed is a SQL mediator for remote geospatial data services,
/// backed by PostGIS.
#[derive(Parser, Debug)]
#[command(name = "geomed", version)]
pub struct Cli {
    /// Path to the configuration file. Default: "geomed.toml"
    #[arg(short, long, default_value = "geomed.toml", global = true)]
    pub config: PathBuf,
    /// Subcommand.
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the data loader daemon.
    Run,

    /// Rewrite a mediator statement and print the translated SQL.
    Rewrite {
        /// User submitting the statement.
        #[arg(short, long, default_value = "postgres")]
        user: String,

        /// The statement.
        #[arg(short, long)]
        query: String,

        /// The statement runs inside a transaction.
        #[arg(long, default_value = "false")]
        in_transaction: bool,
    },

    /// Materialise one URL. Spawned by the daemon for every load
    /// request.
    Load {
        /// URL to load.
        #[arg(long)]
        url: String,

        /// User that requested the load.
        #[arg(long, default_value = "postgres")]
        user: String,
    },

    /// Create the data status table and view.
    Setup,

    /// Check the configuration file for errors.
    Configcheck,
}

#[derive(Debug, Error)]
pub enum ConfigCheckError {
    #[error("I/O error on `{0}`: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("{0}")]
    Config(#[from] crate::config::Error),
}

/// Confirm that the configuration file is valid.
#[allow(clippy::print_stdout)]
pub fn config_check(path: &Path) -> Result<(), ConfigCheckError> {
    std::fs::metadata(path).map_err(|err| ConfigCheckError::Io(path.to_owned(), err))?;
    Config::load(path)?;

    println!("{}: ok", path.display());

    Ok(())
}
