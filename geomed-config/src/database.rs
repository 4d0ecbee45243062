use serde::{Deserialize, Serialize};

/// Connection settings for the PostGIS database holding
/// materialised tables and the data status table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Database {
    /// Database host address.
    #[serde(default = "Database::host")]
    pub host: String,
    /// Database port.
    #[serde(default = "Database::port")]
    pub port: u16,
    /// Database name.
    #[serde(default = "Database::name")]
    pub name: String,
    /// Database user.
    #[serde(default = "Database::user")]
    pub user: String,
    /// Database password.
    #[serde(default)]
    pub password: String,
    /// Maximum number of connections in the rewriter's pool.
    #[serde(default = "Database::max_connections")]
    pub max_connections: usize,
}

impl Database {
    fn host() -> String {
        "127.0.0.1".into()
    }

    fn port() -> u16 {
        5432
    }

    fn name() -> String {
        "postgres".into()
    }

    fn user() -> String {
        "postgres".into()
    }

    fn max_connections() -> usize {
        10
    }

    /// Keyword/value connection string understood by libpq-style
    /// consumers, e.g. ogr2ogr's PG: datasource.
    pub fn keywords(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host, self.port, self.name, self.user, self.password
        )
    }
}

impl Default for Database {
    fn default() -> Self {
        Self {
            host: Self::host(),
            port: Self::port(),
            name: Self::name(),
            user: Self::user(),
            password: String::default(),
            max_connections: Self::max_connections(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Database;

    #[test]
    fn test_keywords() {
        let database = Database {
            host: "db.local".into(),
            port: 5433,
            name: "gis".into(),
            user: "md".into(),
            password: "hunter2".into(),
            max_connections: 4,
        };

        assert_eq!(
            database.keywords(),
            "host=db.local port=5433 dbname=gis user=md password=hunter2"
        );
    }
}
