use serde::{Deserialize, Serialize};
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::database::Database;
use super::error::Error;
use super::general::General;
use super::loader::DataLoaderSettings;

/// Configuration, normally read from geomed.toml.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub database: Database,
    #[serde(default)]
    pub data_loader: DataLoaderSettings,
    /// Path this config was loaded from, if any.
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from disk or use defaults.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let mut config: Config = if let Ok(config) = read_to_string(path) {
            let config = match toml::from_str(&config) {
                Ok(config) => config,
                Err(err) => return Err(Error::config(&config, err)),
            };
            info!("loaded \"{}\"", path.display());
            config
        } else {
            warn!(
                "\"{}\" doesn't exist, loading defaults instead",
                path.display()
            );
            Config::default()
        };

        config.path = Some(path.to_owned());
        config.check()?;

        Ok(config)
    }

    /// Reject configurations the mediator can't run with.
    pub fn check(&self) -> Result<(), Error> {
        if self.general.secret_key.is_empty() {
            return Err(Error::NoSecretKey);
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;
    use crate::LoaderKind;

    #[test]
    fn test_load_example() {
        let source = r#"
[general]
secret_key = "not-a-secret"
tmp_load_data_file_loc = "/tmp"

[database]
host = "10.0.0.5"
name = "gis"
user = "mediator"
password = "md"

[data_loader]
loaders = ["wfs", "arcgis_feature_service"]
notify_channel = "md_load"
max_processes = 2
features_per_process = 50
init_features = 100
"#;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(source.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.database.host, "10.0.0.5");
        assert_eq!(config.database.port, 5432); // default
        assert_eq!(
            config.data_loader.loaders,
            vec![LoaderKind::Wfs, LoaderKind::ArcgisFeatureService]
        );
        assert_eq!(config.data_loader.retries_on_error, 3); // default
        assert_eq!(config.data_loader.features_per_process, 50);
    }

    #[test]
    fn test_missing_secret_key() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[general]\n").unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, Error::NoSecretKey));
    }

    #[test]
    fn test_syntax_error_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[general]\nsecret_key = \"x\"\nworkers = \"two\"\n")
            .unwrap();

        let err = Config::load(file.path()).unwrap_err();
        match err {
            Error::Syntax { line, .. } => assert_eq!(line, 3),
            other => panic!("expected syntax error, got {:?}", other),
        }
    }
}
