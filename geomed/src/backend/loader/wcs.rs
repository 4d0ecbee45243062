//! WCS loader.
//!
//! Fetches a coverage as GeoTIFF and pipes it into PostGIS through
//! `raster2pgsql | psql`. ArcGIS Image Services are served through
//! their WCS endpoint.

use std::collections::HashMap;
use std::io::Write;
use std::process::Stdio;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::process::Command;
use tracing::{error, info};
use url::{Position, Url};

use super::xml::{local_name, string_attribute, strip_namespace};
use super::{check_subprocess, http_client, mark_saved, set_loading_error};
use super::{DataLoader, Error, LoaderContext};
use crate::config::Database;

pub struct WcsLoader {
    context: LoaderContext,
}

impl WcsLoader {
    pub const NAME: &'static str = "WCS Loader";
    pub const DESCRIPTION: &'static str = "Stores publicly accessible WCS data locally through WCS version \
         2.0.1 or above. Accommodates simplified WCS URLs, such as \
         https://wcs.foo.com?coverageid=mydata, and automatically \
         supplements additional parameters as needed during the access. \
         ArcGIS Image Services are accessed through their WCS endpoint.";

    pub fn new(context: LoaderContext) -> Self {
        Self { context }
    }

    async fn run(&self) -> Result<(), Error> {
        let (base, params) = endpoint(&self.context.url)?;
        let database = &self.context.config.database;
        let client = http_client()?;

        let capabilities = fetch_capabilities(&client, &base).await?;

        let coverage_id = match params.get("coverageid") {
            Some(coverage_id) => coverage_id.clone(),
            // Image services expose exactly one coverage.
            None => capabilities
                .coverage_ids
                .first()
                .cloned()
                .ok_or(Error::MissingParameter("coverageId"))?,
        };

        if !capabilities.has_coverage(&coverage_id) {
            return Err(Error::LayerNotFound(coverage_id));
        }

        // GeoTIFF is the only format raster2pgsql reads here.
        let format = capabilities
            .formats
            .iter()
            .find(|format| format.to_lowercase().contains("tiff"))
            .cloned()
            .ok_or_else(|| Error::FormatUnsupported(capabilities.formats.join(", ")))?;

        let body = client
            .get(&base)
            .query(&[
                ("service", "WCS"),
                ("version", "2.0.1"),
                ("request", "DescribeCoverage"),
                ("coverageId", coverage_id.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let description = CoverageDescription::parse(&body)?;
        info!(
            "{}: coverage {} EPSG:{}, grid {}x{}",
            base,
            coverage_id,
            description.srid,
            description.width(),
            description.height()
        );

        // Download the coverage into a scoped temp file.
        let mut query = vec![
            ("service", "WCS".to_string()),
            ("version", "2.0.1".to_string()),
            ("request", "GetCoverage".to_string()),
            ("coverageId", coverage_id.clone()),
            ("format", format),
        ];
        for subset in description.subsets() {
            query.push(("subset", subset));
        }

        let bytes = client
            .get(&base)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let mut file = tempfile::Builder::new()
            .prefix("geomed-wcs-")
            .suffix(".tif")
            .tempfile_in(&self.context.config.general.tmp_load_data_file_loc)?;
        file.write_all(&bytes)?;
        file.flush()?;
        info!("{}: saved {} bytes of GeoTIFF", base, bytes.len());

        import_raster(
            file.path(),
            description.srid,
            database,
            &self.context.table_name,
        )
        .await
    }
}

#[async_trait]
impl DataLoader for WcsLoader {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        Self::DESCRIPTION
    }

    async fn validate(&self) -> bool {
        let Ok((base, params)) = endpoint(&self.context.url) else {
            return false;
        };

        let coverage_id = params.get("coverageid");
        if coverage_id.is_none() && !self.context.url.contains("ImageServer") {
            return false;
        }

        let Ok(client) = http_client() else {
            return false;
        };

        match fetch_capabilities(&client, &base).await {
            Ok(capabilities) => {
                if !capabilities.has_operation("GetCoverage")
                    || !capabilities.has_operation("DescribeCoverage")
                {
                    return false;
                }
                match coverage_id {
                    Some(coverage_id) => capabilities.has_coverage(coverage_id),
                    None => !capabilities.coverage_ids.is_empty(),
                }
            }
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

/// WCS endpoint and lowercased query parameters. ArcGIS Image
/// Service URLs are redirected to their WCS endpoint.
fn endpoint(url: &str) -> Result<(String, HashMap<String, String>), Error> {
    let parsed = Url::parse(url)?;
    let mut base = parsed[..Position::AfterPath].to_string();

    if base.contains("ImageServer") && !base.contains("WCSServer") {
        base = format!("{}/WCSServer", base.trim_end_matches('/'));
    }

    let params = parsed
        .query_pairs()
        .map(|(key, value)| (key.to_lowercase(), value.to_string()))
        .collect();

    Ok((base, params))
}

/// What a WCS GetCapabilities response tells us.
#[derive(Debug, Clone, Default)]
struct WcsCapabilities {
    operations: Vec<String>,
    coverage_ids: Vec<String>,
    formats: Vec<String>,
}

impl WcsCapabilities {
    fn parse(xml: &str) -> Result<Self, Error> {
        let mut capabilities = Self::default();
        let mut reader = Reader::from_str(xml);
        let mut stack: Vec<String> = vec![];

        loop {
            match reader.read_event()? {
                Event::Start(start) => {
                    let name = local_name(&start);
                    if name == "Operation" {
                        if let Some(operation) = string_attribute(&start, b"name") {
                            capabilities.operations.push(operation);
                        }
                    }
                    stack.push(name);
                }

                Event::Empty(start) => {
                    if local_name(&start) == "Operation" {
                        if let Some(operation) = string_attribute(&start, b"name") {
                            capabilities.operations.push(operation);
                        }
                    }
                }

                Event::End(_) => {
                    stack.pop();
                }

                Event::Text(text) => {
                    let text = text.unescape()?;
                    let value = text.trim();
                    if value.is_empty() {
                        continue;
                    }

                    match stack.last().map(String::as_str) {
                        Some("CoverageId") => capabilities.coverage_ids.push(value.to_string()),
                        Some("formatSupported") => capabilities.formats.push(value.to_string()),
                        _ => (),
                    }
                }

                Event::Eof => break,

                _ => (),
            }
        }

        Ok(capabilities)
    }

    fn has_operation(&self, operation: &str) -> bool {
        self.operations.iter().any(|name| name == operation)
    }

    /// MapServer WCS may drop the namespace from coverage ids.
    fn has_coverage(&self, coverage_id: &str) -> bool {
        let stripped = strip_namespace(coverage_id);

        self.coverage_ids
            .iter()
            .any(|name| name == coverage_id || strip_namespace(name) == stripped)
    }
}

/// The parts of a DescribeCoverage response the GetCoverage request
/// is built from.
#[derive(Debug, Clone)]
struct CoverageDescription {
    srid: i32,
    axis_labels: Vec<String>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    grid_low: Vec<i64>,
    grid_high: Vec<i64>,
}

impl CoverageDescription {
    fn parse(xml: &str) -> Result<Self, Error> {
        let mut reader = Reader::from_str(xml);
        let mut stack: Vec<String> = vec![];

        let mut srid = None;
        let mut axis_labels = vec![];
        let mut lower = vec![];
        let mut upper = vec![];
        let mut grid_low = vec![];
        let mut grid_high = vec![];

        loop {
            match reader.read_event()? {
                Event::Start(start) => {
                    let name = local_name(&start);
                    if name == "Envelope" || name == "EnvelopeWithTimePeriod" {
                        if let Some(srs) = string_attribute(&start, b"srsName") {
                            srid = srid_from_srs(&srs);
                        }
                        if let Some(labels) = string_attribute(&start, b"axisLabels") {
                            axis_labels =
                                labels.split_whitespace().map(str::to_string).collect();
                        }
                    }
                    stack.push(name);
                }

                Event::End(_) => {
                    stack.pop();
                }

                Event::Text(text) => {
                    let text = text.unescape()?;
                    let value = text.trim();
                    if value.is_empty() {
                        continue;
                    }

                    match stack.last().map(String::as_str) {
                        Some("lowerCorner") => lower = parse_numbers(value),
                        Some("upperCorner") => upper = parse_numbers(value),
                        Some("low") if stack.iter().any(|name| name == "GridEnvelope") => {
                            grid_low = parse_numbers(value)
                        }
                        Some("high") if stack.iter().any(|name| name == "GridEnvelope") => {
                            grid_high = parse_numbers(value)
                        }
                        _ => (),
                    }
                }

                Event::Eof => break,

                _ => (),
            }
        }

        let srid =
            srid.ok_or_else(|| Error::InvalidResponse("coverage has no native CRS".into()))?;

        if lower.len() < 2 || upper.len() < 2 || grid_low.len() < 2 || grid_high.len() < 2 {
            return Err(Error::InvalidResponse(
                "coverage description misses envelope or grid limits".into(),
            ));
        }

        Ok(Self {
            srid,
            axis_labels,
            lower,
            upper,
            grid_low: grid_low.iter().map(|low| *low as i64).collect(),
            grid_high: grid_high.iter().map(|high| *high as i64).collect(),
        })
    }

    fn width(&self) -> i64 {
        self.grid_high[0] - self.grid_low[0] + 1
    }

    fn height(&self) -> i64 {
        self.grid_high[1] - self.grid_low[1] + 1
    }

    /// One `subset=axis(min,max)` trim per envelope axis.
    fn subsets(&self) -> Vec<String> {
        self.lower
            .iter()
            .zip(&self.upper)
            .enumerate()
            .map(|(index, (lower, upper))| {
                let axis = self
                    .axis_labels
                    .get(index)
                    .map(String::as_str)
                    .unwrap_or(if index == 0 { "x" } else { "y" });
                format!("{}({},{})", axis, lower, upper)
            })
            .collect()
    }
}

/// Pipe the GeoTIFF into PostGIS: raster2pgsql tiles it, psql runs
/// the generated SQL.
async fn import_raster(
    path: &std::path::Path,
    srid: i32,
    database: &Database,
    table_name: &str,
) -> Result<(), Error> {
    let mut raster2pgsql = Command::new("raster2pgsql")
        .arg("-s")
        .arg(srid.to_string())
        .arg("-M")
        .arg("-C")
        .arg("-I")
        .arg("-F")
        .arg("-t")
        .arg("100x100")
        .arg(path)
        .arg(format!("public.{}", table_name))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = raster2pgsql
        .stdout
        .take()
        .ok_or_else(|| Error::Subprocess("raster2pgsql stdout unavailable".into()))?;

    let psql = Command::new("psql")
        .arg("-q")
        .arg("-h")
        .arg(&database.host)
        .arg("-p")
        .arg(database.port.to_string())
        .arg("-U")
        .arg(&database.user)
        .arg("-d")
        .arg(&database.name)
        .env("PGPASSWORD", &database.password)
        .stdin(TryInto::<Stdio>::try_into(stdout)?)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await?;

    let raster2pgsql = raster2pgsql.wait_with_output().await?;
    check_subprocess("raster2pgsql", &raster2pgsql)?;
    check_subprocess("psql", &psql)
}

async fn fetch_capabilities(
    client: &reqwest::Client,
    base: &str,
) -> Result<WcsCapabilities, Error> {
    let body = client
        .get(base)
        .query(&[
            ("service", "WCS"),
            ("version", "2.0.1"),
            ("request", "GetCapabilities"),
        ])
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;

    WcsCapabilities::parse(&body)
}

fn srid_from_srs(srs: &str) -> Option<i32> {
    // "http://www.opengis.net/def/crs/EPSG/0/4326",
    // "urn:ogc:def:crs:EPSG::4326" or plain "EPSG:4326".
    srs.rsplit(['/', ':'])
        .find(|segment| !segment.is_empty())
        .and_then(|segment| segment.parse().ok())
}

fn parse_numbers(value: &str) -> Vec<f64> {
    value
        .split_whitespace()
        .filter_map(|number| number.parse().ok())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    const CAPABILITIES: &str = r#"<?xml version="1.0"?>
<wcs:Capabilities xmlns:wcs="http://www.opengis.net/wcs/2.0" xmlns:ows="http://www.opengis.net/ows/2.0">
  <ows:OperationsMetadata>
    <ows:Operation name="GetCapabilities"/>
    <ows:Operation name="DescribeCoverage"/>
    <ows:Operation name="GetCoverage"/>
  </ows:OperationsMetadata>
  <wcs:ServiceMetadata>
    <wcs:formatSupported>image/tiff</wcs:formatSupported>
    <wcs:formatSupported>image/png</wcs:formatSupported>
  </wcs:ServiceMetadata>
  <wcs:Contents>
    <wcs:CoverageSummary>
      <wcs:CoverageId>nurc__mosaic</wcs:CoverageId>
    </wcs:CoverageSummary>
  </wcs:Contents>
</wcs:Capabilities>"#;

    const DESCRIPTION: &str = r#"<?xml version="1.0"?>
<wcs:CoverageDescriptions xmlns:wcs="http://www.opengis.net/wcs/2.0" xmlns:gml="http://www.opengis.net/gml/3.2">
  <wcs:CoverageDescription>
    <gml:boundedBy>
      <gml:Envelope srsName="http://www.opengis.net/def/crs/EPSG/0/4326" axisLabels="Lat Long" srsDimension="2">
        <gml:lowerCorner>33.1 -117.4</gml:lowerCorner>
        <gml:upperCorner>34.5 -116.0</gml:upperCorner>
      </gml:Envelope>
    </gml:boundedBy>
    <wcs:CoverageId>nurc__mosaic</wcs:CoverageId>
    <gml:domainSet>
      <gml:RectifiedGrid dimension="2">
        <gml:limits>
          <gml:GridEnvelope>
            <gml:low>0 0</gml:low>
            <gml:high>4999 2499</gml:high>
          </gml:GridEnvelope>
        </gml:limits>
      </gml:RectifiedGrid>
    </gml:domainSet>
  </wcs:CoverageDescription>
</wcs:CoverageDescriptions>"#;

    #[test]
    fn test_parse_capabilities() {
        let capabilities = WcsCapabilities::parse(CAPABILITIES).unwrap();

        assert!(capabilities.has_operation("GetCoverage"));
        assert!(capabilities.has_operation("DescribeCoverage"));
        assert!(!capabilities.has_operation("GetMap"));
        assert!(capabilities.has_coverage("nurc__mosaic"));
        assert_eq!(capabilities.formats, vec!["image/tiff", "image/png"]);
    }

    #[test]
    fn test_parse_description() {
        let description = CoverageDescription::parse(DESCRIPTION).unwrap();

        assert_eq!(description.srid, 4326);
        assert_eq!(description.width(), 5000);
        assert_eq!(description.height(), 2500);
        assert_eq!(
            description.subsets(),
            vec!["Lat(33.1,34.5)", "Long(-117.4,-116)"]
        );
    }

    #[test]
    fn test_srid_from_srs() {
        assert_eq!(
            srid_from_srs("http://www.opengis.net/def/crs/EPSG/0/4326"),
            Some(4326)
        );
        assert_eq!(srid_from_srs("urn:ogc:def:crs:EPSG::3857"), Some(3857));
        assert_eq!(srid_from_srs("EPSG:26911"), Some(26911));
        assert_eq!(srid_from_srs("not-a-crs"), None);
    }

    #[test]
    fn test_endpoint_image_server() {
        let (base, _) = endpoint(
            "https://example.com/arcgis/rest/services/dem/ImageServer?coverageid=1",
        )
        .unwrap();
        assert_eq!(
            base,
            "https://example.com/arcgis/rest/services/dem/ImageServer/WCSServer"
        );

        let (base, params) = endpoint("https://wcs.foo.com/wcs?coverageId=mydata").unwrap();
        assert_eq!(base, "https://wcs.foo.com/wcs");
        assert_eq!(params.get("coverageid").unwrap(), "mydata");
    }
}
