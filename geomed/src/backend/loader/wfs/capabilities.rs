//! WFS capability and schema documents.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::super::xml::{local_name, string_attribute, strip_namespace};
use super::super::Error;

/// Server vendor, detected from the capabilities document. Vendors
/// disagree on paging and output formats, so the loader cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Vendor {
    GeoServer,
    MapServer,
    ArcGis,
    #[default]
    Unknown,
}

impl Vendor {
    pub fn detect(capabilities: &str) -> Self {
        let lower = capabilities.to_lowercase();

        if lower.contains("geoserver") {
            Self::GeoServer
        } else if lower.contains("mapserver") {
            Self::MapServer
        } else if lower.contains("arcgis") || lower.contains("esri") {
            Self::ArcGis
        } else {
            Self::Unknown
        }
    }
}

/// What a GetCapabilities response tells us.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub type_names: Vec<String>,
    pub output_formats: Vec<String>,
    pub vendor: Vendor,
}

impl Capabilities {
    pub fn parse(xml: &str) -> Result<Self, Error> {
        let mut capabilities = Self {
            vendor: Vendor::detect(xml),
            ..Default::default()
        };

        let mut reader = Reader::from_str(xml);
        let mut stack: Vec<String> = vec![];
        let mut operation = String::new();
        let mut parameter = String::new();

        loop {
            match reader.read_event()? {
                Event::Start(start) => {
                    let name = local_name(&start);
                    match name.as_str() {
                        "Operation" => operation = name_attribute(&start).unwrap_or_default(),
                        "Parameter" => parameter = name_attribute(&start).unwrap_or_default(),
                        _ => (),
                    }
                    stack.push(name);
                }

                Event::End(_) => match stack.pop().as_deref() {
                    Some("Operation") => operation.clear(),
                    Some("Parameter") => parameter.clear(),
                    _ => (),
                },

                Event::Text(text) => {
                    let text = text.unescape()?;
                    let value = text.trim();
                    if value.is_empty() {
                        continue;
                    }

                    match stack.last().map(String::as_str) {
                        Some("Name") if stack.iter().any(|name| name == "FeatureType") => {
                            capabilities.type_names.push(value.to_string());
                        }
                        Some("Value")
                            if operation == "GetFeature" && parameter == "outputFormat" =>
                        {
                            capabilities.output_formats.push(value.to_string());
                        }
                        _ => (),
                    }
                }

                Event::Eof => break,

                _ => (),
            }
        }

        Ok(capabilities)
    }

    /// Is the typename served? A namespace-stripped match counts:
    /// MapServer tends to drop prefixes.
    pub fn has_type(&self, typename: &str) -> bool {
        let stripped = strip_namespace(typename);

        self.type_names
            .iter()
            .any(|name| name == typename || strip_namespace(name) == stripped)
    }
}

/// One property from a DescribeFeatureType response.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureProperty {
    pub name: String,
    pub type_name: String,
}

impl FeatureProperty {
    pub fn is_numeric(&self) -> bool {
        let lower = self.type_name.to_lowercase();
        ["int", "long", "short", "double", "float", "decimal"]
            .iter()
            .any(|numeric| lower.contains(numeric))
    }

    pub fn is_string(&self) -> bool {
        self.type_name.to_lowercase().contains("string")
    }
}

/// Pull the feature properties out of the schema (XSD) document.
/// Only elements inside a sequence count; the top-level feature
/// element declaration is not a property.
pub fn parse_feature_schema(xml: &str) -> Result<Vec<FeatureProperty>, Error> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<String> = vec![];
    let mut properties = vec![];

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                let name = local_name(&start);
                if name == "element" && stack.iter().any(|parent| parent == "sequence") {
                    push_property(&start, &mut properties);
                }
                stack.push(name);
            }

            Event::Empty(start) => {
                if local_name(&start) == "element"
                    && stack.iter().any(|parent| parent == "sequence")
                {
                    push_property(&start, &mut properties);
                }
            }

            Event::End(_) => {
                stack.pop();
            }

            Event::Eof => break,

            _ => (),
        }
    }

    Ok(properties)
}

/// Attribute to page on, by priority: a numeric `*id` property, a
/// string `*id` property, the first property.
pub fn choose_sort_key(properties: &[FeatureProperty]) -> Option<String> {
    let id_like = |property: &&FeatureProperty| property.name.to_lowercase().ends_with("id");

    if let Some(property) = properties
        .iter()
        .filter(id_like)
        .find(|property| property.is_numeric())
    {
        return Some(property.name.clone());
    }

    if let Some(property) = properties
        .iter()
        .filter(id_like)
        .find(|property| property.is_string())
    {
        return Some(property.name.clone());
    }

    properties.first().map(|property| property.name.clone())
}

/// Total feature count from a `resultType=hits` response. WFS 1.1.0
/// calls it `numberOfFeatures`, 2.0.0 `numberMatched` (with
/// `numberReturned` as a fallback).
pub fn parse_hits(xml: &str) -> Result<u64, Error> {
    let mut reader = Reader::from_str(xml);

    loop {
        match reader.read_event()? {
            Event::Start(start) | Event::Empty(start) => {
                let count = |key: &[u8]| -> Option<u64> {
                    start
                        .attributes()
                        .flatten()
                        .find(|attribute| attribute.key.local_name().as_ref() == key)
                        .and_then(|attribute| {
                            String::from_utf8_lossy(&attribute.value).parse().ok()
                        })
                };

                // numberMatched can be "unknown"; fall through.
                return count(b"numberOfFeatures")
                    .or_else(|| count(b"numberMatched"))
                    .or_else(|| count(b"numberReturned"))
                    .ok_or_else(|| {
                        Error::InvalidResponse("hits response carries no feature count".into())
                    });
            }

            Event::Eof => {
                return Err(Error::InvalidResponse("empty hits response".into()));
            }

            _ => (),
        }
    }
}

fn push_property(start: &BytesStart, properties: &mut Vec<FeatureProperty>) {
    let name = string_attribute(start, b"name");
    let type_name = string_attribute(start, b"type");

    if let (Some(name), Some(type_name)) = (name, type_name) {
        properties.push(FeatureProperty { name, type_name });
    }
}

fn name_attribute(start: &BytesStart) -> Option<String> {
    string_attribute(start, b"name")
}

#[cfg(test)]
mod test {
    use super::*;

    const CAPABILITIES: &str = r#"<?xml version="1.0"?>
<wfs:WFS_Capabilities xmlns:wfs="http://www.opengis.net/wfs" xmlns:ows="http://www.opengis.net/ows">
  <ows:OperationsMetadata>
    <ows:Operation name="GetFeature">
      <ows:Parameter name="outputFormat">
        <ows:Value>text/xml; subtype=gml/3.1.1</ows:Value>
        <ows:Value>application/json</ows:Value>
        <ows:Value>json</ows:Value>
      </ows:Parameter>
    </ows:Operation>
  </ows:OperationsMetadata>
  <wfs:FeatureTypeList>
    <wfs:FeatureType>
      <wfs:Name>topp:states</wfs:Name>
      <wfs:Title>USA Population</wfs:Title>
    </wfs:FeatureType>
    <wfs:FeatureType>
      <wfs:Name>sf:roads</wfs:Name>
    </wfs:FeatureType>
  </wfs:FeatureTypeList>
  <!-- Powered by GeoServer -->
</wfs:WFS_Capabilities>"#;

    const SCHEMA: &str = r#"<?xml version="1.0"?>
<xsd:schema xmlns:xsd="http://www.w3.org/2001/XMLSchema" xmlns:gml="http://www.opengis.net/gml">
  <xsd:complexType name="statesType">
    <xsd:complexContent>
      <xsd:extension base="gml:AbstractFeatureType">
        <xsd:sequence>
          <xsd:element maxOccurs="1" minOccurs="0" name="the_geom" type="gml:MultiSurfacePropertyType"/>
          <xsd:element maxOccurs="1" minOccurs="0" name="STATE_NAME" type="xsd:string"/>
          <xsd:element maxOccurs="1" minOccurs="0" name="STATE_ID" type="xsd:int"/>
          <xsd:element maxOccurs="1" minOccurs="0" name="SUB_REGION" type="xsd:string"/>
        </xsd:sequence>
      </xsd:extension>
    </xsd:complexContent>
  </xsd:complexType>
  <xsd:element name="states" substitutionGroup="gml:_Feature" type="topp:statesType"/>
</xsd:schema>"#;

    #[test]
    fn test_parse_capabilities() {
        let capabilities = Capabilities::parse(CAPABILITIES).unwrap();

        assert_eq!(capabilities.type_names, vec!["topp:states", "sf:roads"]);
        assert_eq!(
            capabilities.output_formats,
            vec!["text/xml; subtype=gml/3.1.1", "application/json", "json"]
        );
        assert_eq!(capabilities.vendor, Vendor::GeoServer);
    }

    #[test]
    fn test_has_type_namespace_stripped() {
        let capabilities = Capabilities::parse(CAPABILITIES).unwrap();

        assert!(capabilities.has_type("topp:states"));
        assert!(capabilities.has_type("states"));
        assert!(!capabilities.has_type("rivers"));
    }

    #[test]
    fn test_parse_feature_schema() {
        let properties = parse_feature_schema(SCHEMA).unwrap();

        // The top-level element declaration is not a property.
        assert_eq!(properties.len(), 4);
        assert_eq!(properties[0].name, "the_geom");
        assert_eq!(properties[2].name, "STATE_ID");
        assert!(properties[2].is_numeric());
    }

    #[test]
    fn test_sort_key_priority() {
        let properties = parse_feature_schema(SCHEMA).unwrap();
        assert_eq!(choose_sort_key(&properties).unwrap(), "STATE_ID");

        // No numeric id: a string id wins.
        let properties = vec![
            FeatureProperty {
                name: "name".into(),
                type_name: "xsd:string".into(),
            },
            FeatureProperty {
                name: "road_id".into(),
                type_name: "xsd:string".into(),
            },
        ];
        assert_eq!(choose_sort_key(&properties).unwrap(), "road_id");

        // No id at all: the first property.
        let properties = vec![FeatureProperty {
            name: "elevation".into(),
            type_name: "xsd:double".into(),
        }];
        assert_eq!(choose_sort_key(&properties).unwrap(), "elevation");

        assert_eq!(choose_sort_key(&[]), None);
    }

    #[test]
    fn test_parse_hits() {
        let wfs11 = r#"<wfs:FeatureCollection numberOfFeatures="250" timeStamp="2024-01-01T00:00:00"/>"#;
        assert_eq!(parse_hits(wfs11).unwrap(), 250);

        let wfs20 =
            r#"<wfs:FeatureCollection numberMatched="1312" numberReturned="0"></wfs:FeatureCollection>"#;
        assert_eq!(parse_hits(wfs20).unwrap(), 1312);

        assert!(parse_hits(r#"<FeatureCollection/>"#).is_err());
    }

    #[test]
    fn test_vendor_detection() {
        assert_eq!(Vendor::detect("... MapServer WFS ..."), Vendor::MapServer);
        assert_eq!(Vendor::detect("powered by Esri"), Vendor::ArcGis);
        assert_eq!(Vendor::detect("nothing to see"), Vendor::Unknown);
    }
}
