//! Data status store.
//!
//! One row per URL in `md_data_status` tracks whether its data is
//! loading, saved, or failed. All state transitions for a URL go
//! through single UPDATE statements, so the row lock serialises them.

use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use deadpool_postgres::{Pool, PoolConfig, Runtime};
use serde::{Deserialize, Serialize};
use tokio_postgres::{NoTls, Row};

use super::Error;
use crate::config::Config;
use crate::util::escape_identifier;

const SETUP: &str = "
CREATE TABLE IF NOT EXISTS md_data_status (
    url TEXT PRIMARY KEY,
    table_name TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('Loading', 'Saved', 'Error')),
    notes TEXT,
    fetch_requested_user TEXT,
    status_updated_time TIMESTAMPTZ DEFAULT now(),
    last_used_time TIMESTAMPTZ
);

CREATE OR REPLACE VIEW md_v_data_status AS
    SELECT url, table_name, status, notes, status_updated_time
    FROM md_data_status;
";

/// Materialisation state of one URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Loading,
    Saved,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loading => "Loading",
            Self::Saved => "Saved",
            Self::Error => "Error",
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Loading" => Ok(Self::Loading),
            "Saved" => Ok(Self::Saved),
            "Error" => Ok(Self::Error),
            other => Err(Error::UnknownStatus(other.to_string())),
        }
    }
}

/// One row of `md_data_status`.
#[derive(Debug, Clone)]
pub struct StatusRow {
    pub url: String,
    pub table_name: String,
    pub status: Status,
    pub notes: Option<String>,
    pub fetch_requested_user: Option<String>,
    pub status_updated_time: Option<DateTime<Utc>>,
    pub last_used_time: Option<DateTime<Utc>>,
}

impl StatusRow {
    fn from_row(row: &Row) -> Result<Self, Error> {
        Ok(Self {
            url: row.try_get("url")?,
            table_name: row.try_get("table_name")?,
            status: row.try_get::<_, String>("status")?.parse()?,
            notes: row.try_get("notes")?,
            fetch_requested_user: row.try_get("fetch_requested_user")?,
            status_updated_time: row.try_get("status_updated_time")?,
            last_used_time: row.try_get("last_used_time")?,
        })
    }
}

/// Load request sent from the rewriter to the daemon over the
/// notification channel.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoadRequest {
    pub url: String,
    pub username: String,
    pub table_name: String,
}

/// The rewriter's handle on `md_data_status`, backed by a
/// connection pool owned by this process.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
    channel: String,
}

impl Store {
    /// Create the store. Connections open lazily, on first use.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let database = &config.database;
        let mut pool_config = deadpool_postgres::Config::new();
        pool_config.host = Some(database.host.clone());
        pool_config.port = Some(database.port);
        pool_config.dbname = Some(database.name.clone());
        pool_config.user = Some(database.user.clone());
        pool_config.password = Some(database.password.clone());
        pool_config.pool = Some(PoolConfig::new(database.max_connections));

        let pool = pool_config.create_pool(Some(Runtime::Tokio1), NoTls)?;

        Ok(Self {
            pool,
            channel: config.data_loader.notify_channel.clone(),
        })
    }

    /// Create the status table and the user-facing view.
    pub async fn setup(&self) -> Result<(), Error> {
        let client = self.pool.get().await?;
        client.batch_execute(SETUP).await?;
        Ok(())
    }

    /// Fetch the status row for a URL, if one exists.
    pub async fn status(&self, url: &str) -> Result<Option<StatusRow>, Error> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT * FROM md_data_status WHERE url = $1", &[&url])
            .await?;

        row.as_ref().map(StatusRow::from_row).transpose()
    }

    /// Insert a new row in `Loading` and publish the load request in
    /// the same transaction. Idempotent: when another rewriter won
    /// the race, nothing happens, nothing is published, and `false`
    /// comes back.
    pub async fn create_data_status(&self, request: &LoadRequest) -> Result<bool, Error> {
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;

        let inserted = transaction
            .execute(
                "INSERT INTO md_data_status (url, table_name, status, fetch_requested_user, status_updated_time)
                 VALUES ($1, $2, 'Loading', $3, now())
                 ON CONFLICT (url) DO NOTHING",
                &[&request.url, &request.table_name, &request.username],
            )
            .await?;

        if inserted > 0 {
            self.notify(&transaction, request).await?;
        }
        transaction.commit().await?;

        Ok(inserted > 0)
    }

    /// Re-request a failed URL: `Error` goes back to `Loading` and
    /// the load request is published, in one transaction. Guarded by
    /// the current status, so a concurrent re-request enqueues only
    /// one load.
    pub async fn reset_to_loading(&self, request: &LoadRequest) -> Result<bool, Error> {
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;

        let updated = transaction
            .execute(
                "UPDATE md_data_status
                    SET status = 'Loading', notes = NULL, fetch_requested_user = $2, status_updated_time = now()
                  WHERE url = $1 AND status = 'Error'",
                &[&request.url, &request.username],
            )
            .await?;

        if updated > 0 {
            self.notify(&transaction, request).await?;
        }
        transaction.commit().await?;

        Ok(updated > 0)
    }

    /// Tell the daemon to materialise a URL. Committed together with
    /// the status write that triggered it.
    async fn notify(
        &self,
        transaction: &tokio_postgres::Transaction<'_>,
        request: &LoadRequest,
    ) -> Result<(), Error> {
        let payload = serde_json::to_string(request)?;
        transaction
            .execute("SELECT pg_notify($1, $2)", &[&self.channel, &payload])
            .await?;

        Ok(())
    }

    /// All URLs from the list that are not `Saved`, including ones
    /// the mediator has never heard of.
    pub async fn invalid_urls(&self, urls: &[&str]) -> Result<Vec<String>, Error> {
        if urls.is_empty() {
            return Ok(vec![]);
        }

        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT checked_url
                   FROM unnest($1::text[]) AS checked_url
                  WHERE NOT EXISTS (
                        SELECT 1
                          FROM md_data_status
                         WHERE md_data_status.url = checked_url
                           AND md_data_status.status = 'Saved'
                  )",
                &[&urls],
            )
            .await?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    /// Bump `last_used_time` to now for all the URLs.
    pub async fn update_last_used_times(&self, urls: &[&str]) -> Result<(), Error> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE md_data_status SET last_used_time = now() WHERE url = ANY($1)",
                &[&urls],
            )
            .await?;

        Ok(())
    }

    /// Delete the status row and drop the materialised table.
    pub async fn remove_data(&self, url: &str) -> Result<Option<String>, Error> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "DELETE FROM md_data_status WHERE url = $1 RETURNING table_name",
                &[&url],
            )
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let table_name: String = row.get(0);
        client
            .batch_execute(&format!(
                "DROP TABLE IF EXISTS public.\"{}\"",
                escape_identifier(&table_name)
            ))
            .await?;

        Ok(Some(table_name))
    }

}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [Status::Loading, Status::Saved, Status::Error] {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert!("saved".parse::<Status>().is_err());
    }

    #[test]
    fn test_load_request_payload() {
        let request = LoadRequest {
            url: "http://a/FS/4".into(),
            username: "md".into(),
            table_name: "abc123".into(),
        };
        let payload = serde_json::to_string(&request).unwrap();
        let parsed: LoadRequest = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed.url, request.url);
        assert_eq!(parsed.username, request.username);
        assert_eq!(parsed.table_name, request.table_name);
    }
}
