//! Data loaders.
//!
//! Each loader knows how to materialise one family of remote
//! services into PostGIS. Loaders run in isolated worker processes
//! and open their own database connections; the rewriter's pool
//! never crosses a process boundary.

pub mod chunk;
pub mod error;
pub mod feature_service;
pub mod postgis;
pub mod wcs;
pub mod wfs;
mod xml;

pub use error::Error;
pub use feature_service::FeatureServiceLoader;
pub use wcs::WcsLoader;
pub use wfs::WfsLoader;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::{Client, NoTls};
use tracing::error;

use crate::config::{Config, Database, LoaderKind};

/// Everything a loader needs to run, handed over as an immutable
/// value because workers live in their own processes.
#[derive(Debug, Clone)]
pub struct LoaderContext {
    pub url: String,
    pub table_name: String,
    pub username: String,
    pub config: Arc<Config>,
}

#[async_trait]
pub trait DataLoader: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Can this loader handle the URL? Never errors: network
    /// failures read as "no".
    async fn validate(&self) -> bool;

    /// Materialise the URL. The outcome lands in the status row
    /// either way; the `Err` is for the worker's log.
    async fn load(&self) -> Result<(), Error>;
}

/// Construct a loader of the given kind.
pub fn loader(kind: LoaderKind, context: LoaderContext) -> Box<dyn DataLoader> {
    match kind {
        LoaderKind::Wfs => Box::new(WfsLoader::new(context)),
        LoaderKind::Wcs => Box::new(WcsLoader::new(context)),
        LoaderKind::ArcgisFeatureService => Box::new(FeatureServiceLoader::new(context)),
    }
}

/// Name and description of a loader kind, for the listing statement.
pub fn metadata(kind: LoaderKind) -> (&'static str, &'static str) {
    match kind {
        LoaderKind::Wfs => (WfsLoader::NAME, WfsLoader::DESCRIPTION),
        LoaderKind::Wcs => (WcsLoader::NAME, WcsLoader::DESCRIPTION),
        LoaderKind::ArcgisFeatureService => {
            (FeatureServiceLoader::NAME, FeatureServiceLoader::DESCRIPTION)
        }
    }
}

/// Probe the configured loaders in order and return the first one
/// that accepts the URL.
pub async fn create_loader(context: &LoaderContext) -> Option<Box<dyn DataLoader>> {
    for kind in &context.config.data_loader.loaders {
        let candidate = loader(*kind, context.clone());
        if candidate.validate().await {
            return Some(candidate);
        }
    }

    None
}

/// HTTP client shared by loader implementations. Remote services
/// can be slow; give them time.
pub(crate) fn http_client() -> Result<reqwest::Client, Error> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()?)
}

/// Open a dedicated connection for a worker.
pub async fn connect(database: &Database) -> Result<Client, Error> {
    let mut config = tokio_postgres::Config::new();
    config
        .host(&database.host)
        .port(database.port)
        .dbname(&database.name)
        .user(&database.user)
        .password(&database.password);

    let (client, connection) = config.connect(NoTls).await?;

    tokio::spawn(async move {
        if let Err(err) = connection.await {
            error!("postgres connection error: {}", err);
        }
    });

    Ok(client)
}

/// Record a load failure. Only rows still in `Loading` flip, so a
/// late worker can't clobber a newer state.
pub async fn set_loading_error(database: &Database, url: &str, message: &str) -> Result<(), Error> {
    let client = connect(database).await?;
    client
        .execute(
            "UPDATE md_data_status
                SET status = 'Error', notes = $2, status_updated_time = now()
              WHERE url = $1 AND status = 'Loading'",
            &[&url, &message],
        )
        .await?;

    Ok(())
}

/// Record a completed load.
pub async fn mark_saved(database: &Database, url: &str) -> Result<(), Error> {
    let client = connect(database).await?;
    client
        .execute(
            "UPDATE md_data_status
                SET status = 'Saved', status_updated_time = now()
              WHERE url = $1",
            &[&url],
        )
        .await?;

    Ok(())
}

/// Is the URL currently in `Loading`? Used by the daemon to drop
/// duplicate load requests.
pub async fn loading(database: &Database, url: &str) -> Result<bool, Error> {
    let client = connect(database).await?;
    let row = client
        .query_opt(
            "SELECT 1 FROM md_data_status WHERE url = $1 AND status = 'Loading'",
            &[&url],
        )
        .await?;

    Ok(row.is_some())
}

/// Fail on non-zero exit or an ERROR on stderr, the way the external
/// PostGIS import tools report problems.
pub(crate) fn check_subprocess(program: &str, output: &std::process::Output) -> Result<(), Error> {
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() || stderr.contains("ERROR") {
        return Err(Error::Subprocess(format!(
            "{} failed ({}): {}",
            program,
            output.status,
            stderr.trim()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};

    fn output(code: i32, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(code),
            stdout: vec![],
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_check_subprocess() {
        assert!(check_subprocess("psql", &output(0, "")).is_ok());
        assert!(check_subprocess("psql", &output(0, "NOTICE: table created")).is_ok());
        assert!(check_subprocess("psql", &output(0, "ERROR: permission denied")).is_err());
        assert!(check_subprocess("raster2pgsql", &output(256, "")).is_err());
    }

    #[test]
    fn test_metadata_covers_all_kinds() {
        for kind in [
            LoaderKind::Wfs,
            LoaderKind::Wcs,
            LoaderKind::ArcgisFeatureService,
        ] {
            let (name, description) = metadata(kind);
            assert!(!name.is_empty());
            assert!(!description.is_empty());
        }
    }
}
