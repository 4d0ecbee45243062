//! ArcGIS Feature Service loader.
//!
//! Pages a FeatureServer layer by object ID ranges. The range size
//! comes from the layer's `maxRecordCount`; ranges are disjoint, so
//! workers never fetch the same feature twice.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info};

use super::chunk::{run_batches, with_retries};
use super::postgis::{parse_features, ColumnType, FeatureTable, WGS84};
use super::{connect, http_client, mark_saved, set_loading_error};
use super::{DataLoader, Error, LoaderContext};
use crate::config::Database;

// Some servers advertise very large maxRecordCount values they
// can't actually serve.
const MAX_RECORDS_PER_REQUEST: usize = 800;

pub struct FeatureServiceLoader {
    context: LoaderContext,
}

struct ChunkShared {
    url: String,
    id_field: String,
    columns: Vec<(String, ColumnType)>,
    table_name: String,
    database: Database,
    retries: usize,
    client: reqwest::Client,
}

impl FeatureServiceLoader {
    pub const NAME: &'static str = "ArcGIS Feature Service Loader";
    pub const DESCRIPTION: &'static str = "Loads vector layers from ArcGIS Feature Services into PostGIS by \
         paginating over object ID ranges.";

    pub fn new(context: LoaderContext) -> Self {
        Self { context }
    }

    async fn run(&self) -> Result<(), Error> {
        let url = &self.context.url;
        let settings = &self.context.config.data_loader;
        let database = &self.context.config.database;
        let client = http_client()?;

        // Layer metadata: record limit, spatial reference, schema.
        let metadata: Value = client
            .get(url)
            .query(&[("f", "json")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        service_error(&metadata)?;

        let max_records = metadata
            .get("maxRecordCount")
            .and_then(Value::as_u64)
            .unwrap_or(1000) as usize;
        let max_records = max_records.min(MAX_RECORDS_PER_REQUEST).max(1);

        let wkid = metadata
            .pointer("/extent/spatialReference/latestWkid")
            .or_else(|| metadata.pointer("/extent/spatialReference/wkid"))
            .and_then(Value::as_i64);
        info!(
            "{}: maxRecordCount {}, native wkid {:?}",
            url, max_records, wkid
        );

        let columns = columns_from_fields(&metadata)?;

        // Every object ID, sorted, so ranges are contiguous.
        let ids: Value = client
            .get(format!("{}/query", url))
            .query(&[("where", "1=1"), ("returnIdsOnly", "true"), ("f", "json")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        service_error(&ids)?;

        let id_field = ids
            .get("objectIdFieldName")
            .and_then(Value::as_str)
            .unwrap_or("OBJECTID")
            .to_string();
        let mut id_list: Vec<i64> = ids
            .get("objectIds")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();
        id_list.sort_unstable();

        if id_list.is_empty() {
            return Err(Error::NoFeatures);
        }
        info!("{}: {} features, paging by {}", url, id_list.len(), id_field);

        // The table exists, empty, before any worker appends.
        // GeoJSON responses are WGS84 regardless of the native wkid.
        let table = FeatureTable::with_columns(columns.clone(), WGS84);
        let db = connect(database).await?;
        table.create(&db, &self.context.table_name).await?;

        // Contiguous ID ranges of at most max_records each.
        let jobs: Vec<(i64, i64)> = id_list
            .chunks(max_records)
            .map(|chunk| (chunk[0], chunk[chunk.len() - 1]))
            .collect();

        let shared = Arc::new(ChunkShared {
            url: url.clone(),
            id_field,
            columns,
            table_name: self.context.table_name.clone(),
            database: database.clone(),
            retries: settings.retries_on_error,
            client,
        });

        run_batches(jobs, settings.max_processes, |(from_id, to_id)| {
            let shared = shared.clone();
            async move { shared.load_chunk(from_id, to_id).await }
        })
        .await
    }
}

impl ChunkShared {
    async fn load_chunk(&self, from_id: i64, to_id: i64) -> Result<(), Error> {
        let what = format!(
            "objectIds [{}, {}] of {} ({} >= {} and {} <= {})",
            from_id, to_id, self.url, self.id_field, from_id, self.id_field, to_id
        );

        let result = with_retries(self.retries, &what, || async {
            let clause = format!(
                "{} >= {} and {} <= {}",
                self.id_field, from_id, self.id_field, to_id
            );
            let page = self
                .client
                .get(format!("{}/query", self.url))
                .query(&[
                    ("where", clause.as_str()),
                    ("outFields", "*"),
                    ("returnGeometry", "true"),
                    ("f", "geojson"),
                ])
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?;

            let features = parse_features(&page)?;
            if features.is_empty() {
                return Ok(());
            }

            let mut table = FeatureTable::with_columns(self.columns.clone(), WGS84);
            table.push_features(&features);

            let db = connect(&self.database).await?;
            table.append(&db, &self.table_name).await
        })
        .await;

        if let Err(err) = result {
            let message = format!("Failed to load {}: {}", what, err);
            error!("{}", message);
            let _ = set_loading_error(&self.database, &self.url, &message).await;
            return Err(Error::Failed(message));
        }

        info!("loaded {}", what);
        Ok(())
    }
}

#[async_trait]
impl DataLoader for FeatureServiceLoader {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        Self::DESCRIPTION
    }

    async fn validate(&self) -> bool {
        if !self.context.url.contains("/FeatureServer") {
            return false;
        }

        // A lightweight probe: can we enumerate object IDs?
        let Ok(client) = http_client() else {
            return false;
        };

        let response = client
            .get(format!("{}/query", self.context.url))
            .query(&[("where", "1=1"), ("returnIdsOnly", "true"), ("f", "json")])
            .send()
            .await;

        match response {
            Ok(response) => match response.json::<Value>().await {
                Ok(body) => body.get("error").is_none(),
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    async fn load(&self) -> Result<(), Error> {
        let url = &self.context.url;
        let database = self.context.config.database.clone();
        info!("fetching data: {}", url);

        match self.run().await {
            Ok(()) => {
                mark_saved(&database, url).await?;
                info!("done with data: {}", url);
                Ok(())
            }
            Err(err) => {
                error!("failed loading {}: {}", url, err);
                let _ = set_loading_error(&database, url, &err.to_string()).await;
                Err(err)
            }
        }
    }
}

/// Esri field types mapped to SQL column types. Integer-typed
/// fields matter: their GeoJSON values arrive float-typed and get
/// coerced on insert.
fn columns_from_fields(metadata: &Value) -> Result<Vec<(String, ColumnType)>, Error> {
    let fields = metadata
        .get("fields")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::InvalidResponse("layer metadata carries no fields".into()))?;

    let mut columns = vec![];
    for field in fields {
        let Some(name) = field.get("name").and_then(Value::as_str) else {
            continue;
        };
        let field_type = field.get("type").and_then(Value::as_str).unwrap_or("");

        let column_type = match field_type {
            "esriFieldTypeOID" | "esriFieldTypeInteger" | "esriFieldTypeSmallInteger" => {
                ColumnType::BigInt
            }
            "esriFieldTypeDouble" | "esriFieldTypeSingle" => ColumnType::Double,
            "esriFieldTypeGeometry" => continue,
            _ => ColumnType::Text,
        };
        columns.push((name.to_string(), column_type));
    }

    Ok(columns)
}

/// ArcGIS reports errors as JSON bodies with HTTP 200.
fn service_error(body: &Value) -> Result<(), Error> {
    if let Some(error) = body.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unspecified service error");
        return Err(Error::InvalidResponse(message.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_columns_from_fields() {
        let metadata = json!({
            "fields": [
                {"name": "OBJECTID", "type": "esriFieldTypeOID"},
                {"name": "ACRES", "type": "esriFieldTypeDouble"},
                {"name": "NAME", "type": "esriFieldTypeString"},
                {"name": "YEAR_", "type": "esriFieldTypeInteger"},
                {"name": "SHAPE", "type": "esriFieldTypeGeometry"},
            ]
        });

        let columns = columns_from_fields(&metadata).unwrap();
        assert_eq!(
            columns,
            vec![
                ("OBJECTID".to_string(), ColumnType::BigInt),
                ("ACRES".to_string(), ColumnType::Double),
                ("NAME".to_string(), ColumnType::Text),
                ("YEAR_".to_string(), ColumnType::BigInt),
            ]
        );
    }

    #[test]
    fn test_service_error() {
        assert!(service_error(&json!({"maxRecordCount": 1000})).is_ok());
        assert!(service_error(&json!({"error": {"code": 499, "message": "Token Required"}}))
            .is_err());
    }

    #[test]
    fn test_id_ranges() {
        // Sparse IDs still partition into contiguous ranges.
        let ids: Vec<i64> = vec![3, 7, 9, 12, 15, 21, 40];
        let ranges: Vec<(i64, i64)> = ids
            .chunks(3)
            .map(|chunk| (chunk[0], chunk[chunk.len() - 1]))
            .collect();

        assert_eq!(ranges, vec![(3, 9), (12, 21), (40, 40)]);
    }
}
