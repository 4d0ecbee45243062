//! WFS loader.
//!
//! Pages a WFS layer into PostGIS. The first `init_features` are
//! loaded with replace semantics; the rest is fetched by a bounded
//! pool of workers over disjoint `startIndex` ranges, all sorted by
//! the same key so pages never overlap.

pub mod capabilities;

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, info};
use url::{Position, Url};

use self::capabilities::{choose_sort_key, parse_feature_schema, parse_hits, Capabilities, Vendor};
use super::chunk::{run_batches, with_retries};
use super::postgis::{parse_features, FeatureTable, WGS84};
use super::{check_subprocess, connect, http_client, mark_saved, set_loading_error};
use super::{DataLoader, Error, LoaderContext};
use crate::config::Database;

pub struct WfsLoader {
    context: LoaderContext,
}

/// Output negotiated with the server.
#[derive(Debug, Clone)]
struct FetchPlan {
    version: &'static str,
    format: String,
    json: bool,
}

/// Everything a chunk worker needs, owned, because workers outlive
/// the borrow of the loader.
struct ChunkShared {
    url: String,
    base: String,
    typename: String,
    plan: FetchPlan,
    sort_by: String,
    table_name: String,
    columns: FeatureTable,
    database: Database,
    tmp_dir: std::path::PathBuf,
    retries: usize,
    client: reqwest::Client,
}

impl WfsLoader {
    pub const NAME: &'static str = "WFS Loader";
    pub const DESCRIPTION: &'static str = "Stores publicly accessible WFS data locally through WFS \
         version 1.1.0 or above. Accepts simplified WFS URLs such as \
         https://wfs.foo.com/wfs?typeName=mylayer and supplements the \
         remaining parameters during access.";

    pub fn new(context: LoaderContext) -> Self {
        Self { context }
    }

    /// Base URL without the query string, plus lowercased query
    /// parameters.
    fn split_url(url: &str) -> Result<(String, HashMap<String, String>), Error> {
        let parsed = Url::parse(url)?;
        let base = parsed[..Position::AfterPath].to_string();
        let params = parsed
            .query_pairs()
            .map(|(key, value)| (key.to_lowercase(), value.to_string()))
            .collect();

        Ok((base, params))
    }

    async fn run(&self) -> Result<(), Error> {
        let (base, params) = Self::split_url(&self.context.url)?;
        let typename = params
            .get("typename")
            .ok_or(Error::MissingParameter("typeName"))?
            .clone();

        let settings = &self.context.config.data_loader;
        let database = &self.context.config.database;
        let client = http_client()?;

        // Probe the server.
        let body = client
            .get(&base)
            .query(&[
                ("service", "WFS"),
                ("version", "1.1.0"),
                ("request", "GetCapabilities"),
            ])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let capabilities = Capabilities::parse(&body)?;
        info!("{}: vendor {:?}", base, capabilities.vendor);

        if !capabilities.has_type(&typename) {
            return Err(Error::LayerNotFound(typename));
        }

        // Feature schema decides the paging key.
        let body = client
            .get(&base)
            .query(&[
                ("service", "WFS"),
                ("version", "1.1.0"),
                ("request", "DescribeFeatureType"),
                ("typeName", typename.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let properties = parse_feature_schema(&body)?;
        let sort_by = choose_sort_key(&properties).ok_or_else(|| {
            Error::InvalidResponse(format!("no properties described for {}", typename))
        })?;
        info!("{}: paging {} by \"{}\"", base, typename, sort_by);

        let plan = negotiate_format(&capabilities)?;

        // Total count via a hits request.
        let body = client
            .get(&base)
            .query(&[
                ("service", "WFS"),
                ("version", plan.version),
                ("request", "GetFeature"),
                (typename_param(plan.version), typename.as_str()),
                ("resultType", "hits"),
            ])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let total = parse_hits(&body)? as usize;
        info!("{}: {} features in {}", base, total, typename);

        if total == 0 {
            return Err(Error::NoFeatures);
        }

        // The initial page creates the table.
        let init = settings.init_features.min(total);
        let page = fetch_page(
            &client, &base, &typename, &plan, &sort_by, 0, init,
        )
        .await?;

        let columns = if plan.json {
            let features = parse_features(&page)?;
            let table = FeatureTable::infer(&features, WGS84)?;
            let db = connect(database).await?;
            table.replace(&db, &self.context.table_name).await?;
            FeatureTable::with_columns(table.columns().to_vec(), WGS84)
        } else {
            import_gml(
                &page,
                &self.context.config.general.tmp_load_data_file_loc,
                database,
                &self.context.table_name,
                true,
            )
            .await?;
            FeatureTable::with_columns(vec![], WGS84)
        };
        info!("{}: loaded initial {} features", base, init);

        // Remaining pages, in parallel.
        let mut jobs = vec![];
        let mut start = init;
        while start < total {
            let count = settings.features_per_process.min(total - start);
            jobs.push((start, count));
            start += count;
        }

        let shared = Arc::new(ChunkShared {
            url: self.context.url.clone(),
            base,
            typename,
            plan,
            sort_by,
            table_name: self.context.table_name.clone(),
            columns,
            database: database.clone(),
            tmp_dir: self.context.config.general.tmp_load_data_file_loc.clone(),
            retries: settings.retries_on_error,
            client,
        });

        run_batches(jobs, settings.max_processes, |(start, count)| {
            let shared = shared.clone();
            async move { shared.load_chunk(start, count).await }
        })
        .await
    }
}

impl ChunkShared {
    async fn load_chunk(&self, start: usize, count: usize) -> Result<(), Error> {
        let what = format!("features [{}, {}) from {}", start, start + count, self.url);

        let result = with_retries(self.retries, &what, || async {
            let page = fetch_page(
                &self.client,
                &self.base,
                &self.typename,
                &self.plan,
                &self.sort_by,
                start,
                count,
            )
            .await?;

            if self.plan.json {
                let features = parse_features(&page)?;
                if features.is_empty() {
                    return Ok(());
                }
                let mut table = self.columns.clone();
                table.push_features(&features);
                let db = connect(&self.database).await?;
                table.append(&db, &self.table_name).await
            } else {
                import_gml(&page, &self.tmp_dir, &self.database, &self.table_name, false).await
            }
        })
        .await;

        if let Err(err) = result {
            let message = format!("Failed to load {}: {}", what, err);
            error!("{}", message);
            // Readers learn about the partial table from the status row.
            let _ = set_loading_error(&self.database, &self.url, &message).await;
            return Err(Error::Failed(message));
        }

        info!("loaded {}", what);
        Ok(())
    }
}

#[async_trait]
impl DataLoader for WfsLoader {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        Self::DESCRIPTION
    }

    async fn validate(&self) -> bool {
        let Ok((_, params)) = Self::split_url(&self.context.url) else {
            return false;
        };

        self.context.url.to_lowercase().contains("wfs") && params.contains_key("typename")
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

/// Prefer the shortest JSON format, then any GML; ArcGIS servers
/// only page reliably over WFS 2.0.0 with GeoJSON output.
fn negotiate_format(capabilities: &Capabilities) -> Result<FetchPlan, Error> {
    if capabilities.vendor == Vendor::ArcGis {
        return Ok(FetchPlan {
            version: "2.0.0",
            format: "geojson".into(),
            json: true,
        });
    }

    let json = capabilities
        .output_formats
        .iter()
        .filter(|format| format.to_lowercase().contains("json"))
        .min_by_key(|format| format.len());
    if let Some(format) = json {
        return Ok(FetchPlan {
            version: "1.1.0",
            format: format.clone(),
            json: true,
        });
    }

    let gml = capabilities
        .output_formats
        .iter()
        .find(|format| format.to_lowercase().contains("gml"));
    if let Some(format) = gml {
        return Ok(FetchPlan {
            version: "1.1.0",
            format: format.clone(),
            json: false,
        });
    }

    // Some servers don't advertise formats at all; GML is the
    // protocol default.
    if capabilities.output_formats.is_empty() {
        return Ok(FetchPlan {
            version: "1.1.0",
            format: "text/xml; subtype=gml/3.1.1".into(),
            json: false,
        });
    }

    Err(Error::FormatUnsupported(
        capabilities.output_formats.join(", "),
    ))
}

fn typename_param(version: &str) -> &'static str {
    if version.starts_with("2.") {
        "typeNames"
    } else {
        "typeName"
    }
}

fn count_param(version: &str) -> &'static str {
    if version.starts_with("2.") {
        "count"
    } else {
        "maxFeatures"
    }
}

async fn fetch_page(
    client: &reqwest::Client,
    base: &str,
    typename: &str,
    plan: &FetchPlan,
    sort_by: &str,
    start: usize,
    count: usize,
) -> Result<String, Error> {
    let query = [
        ("service", "WFS".to_string()),
        ("version", plan.version.to_string()),
        ("request", "GetFeature".to_string()),
        (typename_param(plan.version), typename.to_string()),
        ("outputFormat", plan.format.clone()),
        ("sortBy", sort_by.to_string()),
        ("startIndex", start.to_string()),
        (count_param(plan.version), count.to_string()),
    ];

    let response = client
        .get(base)
        .query(&query)
        .send()
        .await?
        .error_for_status()?;

    Ok(response.text().await?)
}

/// Import one GML page with ogr2ogr. The page lives in a scoped temp
/// file that is deleted on every exit path.
async fn import_gml(
    gml: &str,
    tmp_dir: &std::path::Path,
    database: &Database,
    table_name: &str,
    overwrite: bool,
) -> Result<(), Error> {
    let mut file = tempfile::Builder::new()
        .prefix("geomed-wfs-")
        .suffix(".gml")
        .tempfile_in(tmp_dir)?;
    file.write_all(gml.as_bytes())?;
    file.flush()?;

    let output = Command::new("ogr2ogr")
        .arg("-f")
        .arg("PostgreSQL")
        .arg(format!("PG:{}", database.keywords()))
        .arg(file.path())
        .arg("-nln")
        .arg(format!("public.{}", table_name))
        .arg(if overwrite { "-overwrite" } else { "-append" })
        .output()
        .await?;

    check_subprocess("ogr2ogr", &output)
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;

    fn context(url: &str) -> LoaderContext {
        LoaderContext {
            url: url.into(),
            table_name: "abc123".into(),
            username: "md".into(),
            config: Arc::new(Config::default()),
        }
    }

    #[tokio::test]
    async fn test_validate() {
        let loader =
            WfsLoader::new(context("http://example.com/geoserver/wfs?typeName=topp:states"));
        assert!(loader.validate().await);

        let loader = WfsLoader::new(context("http://example.com/geoserver/wfs?request=GetMap"));
        assert!(!loader.validate().await);

        let loader = WfsLoader::new(context("http://example.com/arcgis/FeatureServer/0"));
        assert!(!loader.validate().await);
    }

    #[test]
    fn test_split_url() {
        let (base, params) =
            WfsLoader::split_url("https://example.com/geoserver/wfs?TYPENAME=topp:states&x=1")
                .unwrap();
        assert_eq!(base, "https://example.com/geoserver/wfs");
        assert_eq!(params.get("typename").unwrap(), "topp:states");
    }

    #[test]
    fn test_negotiate_prefers_shortest_json() {
        let capabilities = Capabilities {
            type_names: vec![],
            output_formats: vec![
                "text/xml; subtype=gml/3.1.1".into(),
                "application/json".into(),
                "json".into(),
            ],
            vendor: Vendor::GeoServer,
        };
        let plan = negotiate_format(&capabilities).unwrap();
        assert_eq!(plan.format, "json");
        assert!(plan.json);
        assert_eq!(plan.version, "1.1.0");
    }

    #[test]
    fn test_negotiate_falls_back_to_gml() {
        let capabilities = Capabilities {
            type_names: vec![],
            output_formats: vec!["text/xml; subtype=gml/3.1.1".into(), "SHAPE-ZIP".into()],
            vendor: Vendor::MapServer,
        };
        let plan = negotiate_format(&capabilities).unwrap();
        assert!(!plan.json);
        assert!(plan.format.contains("gml"));
    }

    #[test]
    fn test_negotiate_arcgis_forces_geojson() {
        let capabilities = Capabilities {
            type_names: vec![],
            output_formats: vec!["GML3".into()],
            vendor: Vendor::ArcGis,
        };
        let plan = negotiate_format(&capabilities).unwrap();
        assert_eq!(plan.version, "2.0.0");
        assert_eq!(plan.format, "geojson");
        assert!(plan.json);
    }

    #[test]
    fn test_chunk_layout() {
        // total=250, init=100, per worker=50: three append chunks.
        let total = 250;
        let init = 100;
        let per_worker = 50;

        let mut jobs = vec![];
        let mut start = init;
        while start < total {
            let count = per_worker.min(total - start);
            jobs.push((start, count));
            start += count;
        }

        assert_eq!(jobs, vec![(100, 50), (150, 50), (200, 50)]);
    }
}
