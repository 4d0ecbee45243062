//! Deterministic mapping from URLs to local table names.

use url::Url;

/// A URL the mediator is willing to treat as a remote relation:
/// it parses, and both scheme and host are present.
pub fn is_valid_url(candidate: &str) -> bool {
    match Url::parse(candidate) {
        Ok(url) => !url.scheme().is_empty() && url.has_host(),
        Err(_) => false,
    }
}

/// Hash a URL into a stable, legal SQL identifier.
///
/// The digest covers `url || secret`, so two mediator deployments
/// sharing a secret agree on every table name. SQL identifiers must
/// start with a letter; when the digest doesn't, the first alphabetic
/// hex digit is swapped to the front.
pub fn to_table_name(url: &str, secret: &str) -> String {
    let digest = md5::compute([url.as_bytes(), secret.as_bytes()].concat());
    let mut hash = format!("{:x}", digest).into_bytes();

    if !hash[0].is_ascii_alphabetic() {
        if let Some(position) = hash.iter().position(|c| c.is_ascii_alphabetic()) {
            hash.swap(0, position);
        } else {
            // An all-digit digest. Vanishingly rare, still deterministic.
            hash[0] = b'x';
        }
    }

    // Lowercase hex only.
    String::from_utf8(hash).unwrap()
}

#[cfg(test)]
mod test {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn test_valid_urls() {
        assert!(is_valid_url("http://www.sdsc.edu/ArcGIS/FeatureServer/test/4"));
        assert!(is_valid_url("https://wcs.foo.com?coverageid=mydata"));
        assert!(!is_valid_url("my_table"));
        assert!(!is_valid_url("schema.table"));
        assert!(!is_valid_url("file:///etc/passwd"));
        assert!(!is_valid_url(""));
    }

    #[test]
    fn test_stable_across_calls() {
        let url = "http://example.com/geoserver/wfs?typeName=topp:states";
        assert_eq!(to_table_name(url, SECRET), to_table_name(url, SECRET));
    }

    #[test]
    fn test_secret_changes_name() {
        let url = "http://example.com/geoserver/wfs?typeName=topp:states";
        assert_ne!(to_table_name(url, SECRET), to_table_name(url, "other"));
    }

    #[test]
    fn test_identifier_shape() {
        for url in [
            "http://a/FS/1",
            "http://a/FS/2",
            "http://example.com/arcgis/rest/services/x/FeatureServer/0",
            "https://wcs.foo.com?coverageid=mydata",
        ] {
            let name = to_table_name(url, SECRET);
            assert_eq!(name.len(), 32);
            assert!(name.chars().next().unwrap().is_ascii_alphabetic());
            assert!(name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_swap_preserves_digits() {
        // Whatever the digest, swapping keeps the same multiset of
        // characters.
        let url = "http://a/FS/1";
        let digest = format!("{:x}", md5::compute([url.as_bytes(), SECRET.as_bytes()].concat()));
        let name = to_table_name(url, SECRET);
        let mut expected: Vec<char> = digest.chars().collect();
        let mut actual: Vec<char> = name.chars().collect();
        expected.sort_unstable();
        actual.sort_unstable();
        assert_eq!(expected, actual);
    }
}
