//! Configuration.

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;

pub use geomed_config::{Config, Database, DataLoaderSettings, Error, General, LoaderKind};

static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Load configuration.
pub fn config() -> Arc<Config> {
    CONFIG.load().clone()
}

/// Load the configuration file from disk.
pub fn load(path: &Path) -> Result<Arc<Config>, Error> {
    let config = Config::load(path)?;
    Ok(set(config))
}

/// Replace the process-wide configuration.
pub fn set(config: Config) -> Arc<Config> {
    CONFIG.store(Arc::new(config));
    CONFIG.load().clone()
}
