use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

/// Data loaders compiled into the binary. Configuration picks
/// an ordered subset; the order doubles as probe precedence.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoaderKind {
    Wfs,
    Wcs,
    ArcgisFeatureService,
}

impl FromStr for LoaderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "wfs" => Ok(Self::Wfs),
            "wcs" => Ok(Self::Wcs),
            "arcgis_feature_service" => Ok(Self::ArcgisFeatureService),
            _ => Err(format!("unknown data loader: {}", s)),
        }
    }
}

impl Display for LoaderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wfs => write!(f, "wfs"),
            Self::Wcs => write!(f, "wcs"),
            Self::ArcgisFeatureService => write!(f, "arcgis_feature_service"),
        }
    }
}

/// Tuning knobs for the chunked concurrent loaders.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DataLoaderSettings {
    /// Enabled loaders, in probe order.
    #[serde(default = "DataLoaderSettings::loaders")]
    pub loaders: Vec<LoaderKind>,
    /// Database channel carrying load requests to the daemon.
    #[serde(default = "DataLoaderSettings::notify_channel")]
    pub notify_channel: String,
    /// Maximum number of concurrent fetch workers per load.
    #[serde(default = "DataLoaderSettings::max_processes")]
    pub max_processes: usize,
    /// Features fetched by each worker per page.
    #[serde(default = "DataLoaderSettings::features_per_process")]
    pub features_per_process: usize,
    /// Attempts per page before the load is declared failed.
    #[serde(default = "DataLoaderSettings::retries_on_error")]
    pub retries_on_error: usize,
    /// Size of the initial, table-creating fetch.
    #[serde(default = "DataLoaderSettings::init_features")]
    pub init_features: usize,
}

impl DataLoaderSettings {
    fn loaders() -> Vec<LoaderKind> {
        vec![
            LoaderKind::ArcgisFeatureService,
            LoaderKind::Wcs,
            LoaderKind::Wfs,
        ]
    }

    fn notify_channel() -> String {
        "md_data_load".into()
    }

    fn max_processes() -> usize {
        4
    }

    fn features_per_process() -> usize {
        1000
    }

    fn retries_on_error() -> usize {
        3
    }

    fn init_features() -> usize {
        500
    }
}

impl Default for DataLoaderSettings {
    fn default() -> Self {
        Self {
            loaders: Self::loaders(),
            notify_channel: Self::notify_channel(),
            max_processes: Self::max_processes(),
            features_per_process: Self::features_per_process(),
            retries_on_error: Self::retries_on_error(),
            init_features: Self::init_features(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_loader_kind_from_str() {
        assert_eq!("wfs".parse::<LoaderKind>(), Ok(LoaderKind::Wfs));
        assert_eq!(
            "ArcGIS_Feature_Service".parse::<LoaderKind>(),
            Ok(LoaderKind::ArcgisFeatureService)
        );
        assert!("shapefile".parse::<LoaderKind>().is_err());
    }

    #[test]
    fn test_roundtrip_display() {
        for kind in [LoaderKind::Wfs, LoaderKind::Wcs, LoaderKind::ArcgisFeatureService] {
            assert_eq!(kind.to_string().parse::<LoaderKind>(), Ok(kind));
        }
    }
}
