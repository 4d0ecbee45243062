//! Feature tables in PostGIS.
//!
//! A `FeatureTable` is the in-memory form of one page of GeoJSON
//! features, ready to be created or appended as a PostGIS table.
//! Geometry travels as GeoJSON text and is converted server-side
//! with `ST_GeomFromGeoJSON`.

use serde_json::Value;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use super::Error;
use crate::util::escape_identifier;

/// Name of the geometry column in materialised tables.
pub const GEOMETRY_COLUMN: &str = "geometry";

/// GeoJSON is WGS84 unless a service says otherwise.
pub const WGS84: i32 = 4326;

// Keep well under the 65535 bind-parameter limit.
const INSERT_BATCH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    Double,
    Boolean,
    Text,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            Self::BigInt => "BIGINT",
            Self::Double => "DOUBLE PRECISION",
            Self::Boolean => "BOOLEAN",
            Self::Text => "TEXT",
        }
    }

    fn infer(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(Self::Boolean),
            Value::Number(number) if number.is_i64() || number.is_u64() => Some(Self::BigInt),
            Value::Number(_) => Some(Self::Double),
            _ => Some(Self::Text),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct FeatureRow {
    values: Vec<Option<String>>,
    geometry: Option<String>,
}

/// One page of features with a fixed column layout.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    columns: Vec<(String, ColumnType)>,
    srid: i32,
    rows: Vec<FeatureRow>,
}

impl FeatureTable {
    /// An empty table with a known schema.
    pub fn with_columns(columns: Vec<(String, ColumnType)>, srid: i32) -> Self {
        Self {
            columns,
            srid,
            rows: vec![],
        }
    }

    /// Infer the schema from the features: column names from the
    /// first feature, each column typed by its first non-null value.
    pub fn infer(features: &[Value], srid: i32) -> Result<Self, Error> {
        let Some(first) = features.first() else {
            return Err(Error::NoFeatures);
        };

        let mut columns = vec![];
        if let Some(properties) = first.get("properties").and_then(Value::as_object) {
            for name in properties.keys() {
                let column_type = features
                    .iter()
                    .filter_map(|feature| feature.get("properties")?.get(name))
                    .find_map(ColumnType::infer)
                    .unwrap_or(ColumnType::Text);
                columns.push((name.clone(), column_type));
            }
        }

        let mut table = Self::with_columns(columns, srid);
        table.push_features(features);
        Ok(table)
    }

    pub fn columns(&self) -> &[(String, ColumnType)] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Add one page of features. Missing properties become NULL.
    pub fn push_features(&mut self, features: &[Value]) {
        for feature in features {
            let properties = feature.get("properties").and_then(Value::as_object);

            let mut row = FeatureRow::default();
            for (name, column_type) in &self.columns {
                let value = properties.and_then(|properties| properties.get(name));
                row.values.push(render(value, *column_type));
            }
            row.geometry = feature
                .get("geometry")
                .filter(|geometry| !geometry.is_null())
                .map(|geometry| geometry.to_string());

            self.rows.push(row);
        }
    }

    fn create_sql(&self, table: &str) -> String {
        let mut columns: Vec<String> = self
            .columns
            .iter()
            .map(|(name, column_type)| {
                format!("\"{}\" {}", escape_identifier(name), column_type.sql())
            })
            .collect();
        columns.push(format!(
            "\"{}\" geometry(Geometry, {})",
            GEOMETRY_COLUMN, self.srid
        ));

        format!(
            "CREATE TABLE public.\"{}\" ({})",
            escape_identifier(table),
            columns.join(", ")
        )
    }

    /// Drop and recreate the table with this schema, leaving it
    /// empty.
    pub async fn create(&self, client: &Client, table: &str) -> Result<(), Error> {
        client
            .batch_execute(&format!(
                "DROP TABLE IF EXISTS public.\"{}\"",
                escape_identifier(table)
            ))
            .await?;
        client.batch_execute(&self.create_sql(table)).await?;

        Ok(())
    }

    /// Replace semantics: drop, recreate, insert.
    pub async fn replace(&self, client: &Client, table: &str) -> Result<(), Error> {
        self.create(client, table).await?;
        self.append(client, table).await
    }

    /// Append all rows to an existing table.
    pub async fn append(&self, client: &Client, table: &str) -> Result<(), Error> {
        let mut names: Vec<String> = self
            .columns
            .iter()
            .map(|(name, _)| format!("\"{}\"", escape_identifier(name)))
            .collect();
        names.push(format!("\"{}\"", GEOMETRY_COLUMN));
        let names = names.join(", ");

        for batch in self.rows.chunks(INSERT_BATCH) {
            let mut params: Vec<&(dyn ToSql + Sync)> = vec![];
            let mut tuples = Vec::with_capacity(batch.len());

            for row in batch {
                let mut placeholders = Vec::with_capacity(row.values.len() + 1);
                for (value, (_, column_type)) in row.values.iter().zip(&self.columns) {
                    params.push(value);
                    // Values travel as text and are cast server-side.
                    placeholders.push(match column_type {
                        ColumnType::Text => format!("${}::text", params.len()),
                        other => format!("${}::text::{}", params.len(), other.sql()),
                    });
                }
                params.push(&row.geometry);
                placeholders.push(format!(
                    "ST_SetSRID(ST_GeomFromGeoJSON(${}::text), {})",
                    params.len(),
                    self.srid
                ));
                tuples.push(format!("({})", placeholders.join(", ")));
            }

            let sql = format!(
                "INSERT INTO public.\"{}\" ({}) VALUES {}",
                escape_identifier(table),
                names,
                tuples.join(", ")
            );
            client.execute(sql.as_str(), &params).await?;
        }

        Ok(())
    }
}

/// Features array of a GeoJSON FeatureCollection document.
pub fn parse_features(document: &str) -> Result<Vec<Value>, Error> {
    let collection: Value = serde_json::from_str(document)?;

    collection
        .get("features")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| Error::InvalidResponse("response is not a FeatureCollection".into()))
}

fn render(value: Option<&Value>, column_type: ColumnType) -> Option<String> {
    let value = value?;

    match value {
        Value::Null => None,
        Value::Bool(boolean) => Some(boolean.to_string()),
        Value::Number(number) => {
            // Some services type integer fields as floats in JSON.
            if column_type == ColumnType::BigInt && number.as_i64().is_none() {
                if let Some(float) = number.as_f64() {
                    return Some((float as i64).to_string());
                }
            }
            Some(number.to_string())
        }
        Value::String(string) => Some(string.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn features() -> Vec<Value> {
        vec![
            json!({
                "type": "Feature",
                "properties": {"name": "alpha", "population": 120, "area": 1.5},
                "geometry": {"type": "Point", "coordinates": [1.0, 2.0]}
            }),
            json!({
                "type": "Feature",
                "properties": {"name": "beta", "population": null, "area": 2.25},
                "geometry": null
            }),
        ]
    }

    #[test]
    fn test_infer_types() {
        let table = FeatureTable::infer(&features(), WGS84).unwrap();
        // serde_json maps are ordered by key.
        assert_eq!(
            table.columns(),
            &[
                ("area".to_string(), ColumnType::Double),
                ("name".to_string(), ColumnType::Text),
                ("population".to_string(), ColumnType::BigInt),
            ]
        );
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_infer_empty_fails() {
        assert!(matches!(
            FeatureTable::infer(&[], WGS84),
            Err(Error::NoFeatures)
        ));
    }

    #[test]
    fn test_create_sql() {
        let table = FeatureTable::with_columns(
            vec![
                ("id".into(), ColumnType::BigInt),
                ("name".into(), ColumnType::Text),
            ],
            WGS84,
        );
        assert_eq!(
            table.create_sql("abc123"),
            "CREATE TABLE public.\"abc123\" (\"id\" BIGINT, \"name\" TEXT, \
             \"geometry\" geometry(Geometry, 4326))"
        );
    }

    #[test]
    fn test_float_typed_integers_coerced() {
        let features = vec![json!({
            "type": "Feature",
            "properties": {"objectid": 7.0},
            "geometry": null
        })];
        let mut table =
            FeatureTable::with_columns(vec![("objectid".into(), ColumnType::BigInt)], WGS84);
        table.push_features(&features);

        assert_eq!(table.rows[0].values[0], Some("7".to_string()));
    }

    #[test]
    fn test_missing_property_is_null() {
        let mut table = FeatureTable::with_columns(
            vec![
                ("a".into(), ColumnType::Text),
                ("b".into(), ColumnType::Text),
            ],
            WGS84,
        );
        table.push_features(&[json!({"properties": {"a": "present"}, "geometry": null})]);

        assert_eq!(table.rows[0].values[0], Some("present".into()));
        assert_eq!(table.rows[0].values[1], None);
    }

    #[test]
    fn test_parse_features() {
        let document = r#"{"type": "FeatureCollection", "features": [
            {"type": "Feature", "properties": {"a": 1}, "geometry": null}
        ]}"#;
        assert_eq!(parse_features(document).unwrap().len(), 1);

        assert!(parse_features(r#"{"error": {"code": 400}}"#).is_err());
        assert!(parse_features("not json").is_err());
    }

    #[test]
    fn test_geometry_kept_as_geojson() {
        let table = FeatureTable::infer(&features(), WGS84).unwrap();
        let geometry = table.rows[0].geometry.as_ref().unwrap();
        let parsed: Value = serde_json::from_str(geometry).unwrap();
        assert_eq!(parsed["type"], "Point");
        assert!(table.rows[1].geometry.is_none());
    }
}
