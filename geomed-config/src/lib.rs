// Submodules
pub mod core;
pub mod database;
pub mod error;
pub mod general;
pub mod loader;

pub use core::Config;
pub use database::Database;
pub use error::Error;
pub use general::General;
pub use loader::{DataLoaderSettings, LoaderKind};

#[cfg(test)]
mod test {
    use crate::Config;

    #[test]
    fn test_default_config_serializable() {
        let config = Config::default();
        toml::to_string(&config).unwrap();
    }
}
