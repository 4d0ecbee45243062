use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct General {
    /// Secret mixed into table name hashes. Must be identical
    /// on every process that rewrites or loads data.
    #[serde(default)]
    pub secret_key: String,
    /// Directory for temporary data files created during loads.
    #[serde(default = "General::tmp_load_data_file_loc")]
    pub tmp_load_data_file_loc: PathBuf,
    /// Spawn this many Tokio threads.
    #[serde(default = "General::workers")]
    pub workers: usize,
}

impl General {
    fn tmp_load_data_file_loc() -> PathBuf {
        std::env::temp_dir()
    }

    fn workers() -> usize {
        2
    }
}

impl Default for General {
    fn default() -> Self {
        Self {
            secret_key: String::default(),
            tmp_load_data_file_loc: Self::tmp_load_data_file_loc(),
            workers: Self::workers(),
        }
    }
}
