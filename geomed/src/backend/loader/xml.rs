//! Small helpers for reading OGC XML documents.
//!
//! Servers disagree on namespace prefixes, so everything works on
//! local names.

use quick_xml::events::BytesStart;

pub(crate) fn local_name(start: &BytesStart) -> String {
    String::from_utf8_lossy(start.name().local_name().as_ref()).to_string()
}

pub(crate) fn string_attribute(start: &BytesStart, key: &[u8]) -> Option<String> {
    start
        .attributes()
        .flatten()
        .find(|attribute| attribute.key.local_name().as_ref() == key)
        .map(|attribute| String::from_utf8_lossy(&attribute.value).to_string())
}

pub(crate) fn strip_namespace(name: &str) -> &str {
    name.split(':').next_back().unwrap_or(name)
}

#[cfg(test)]
mod test {
    use super::strip_namespace;

    #[test]
    fn test_strip_namespace() {
        assert_eq!(strip_namespace("topp:states"), "states");
        assert_eq!(strip_namespace("states"), "states");
        assert_eq!(strip_namespace(""), "");
    }
}
