//! Mediator built-in statement classifier.
//!
//! Built-ins are matched against the raw statement text, not the AST,
//! so clients can send them without caring about how the rewriter
//! normalizes SQL.

use once_cell::sync::Lazy;
use regex::Regex;

use super::table_name::is_valid_url;

static FETCH_DATA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*SELECT\s+md_fetch_data\s*\(\s*'([^']+)'\s*\)\s*;?\s*$").unwrap()
});

static LIST_DATA_LOADERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*SELECT\s+md_list_data_loaders\s*\(\s*\)\s*;?\s*$").unwrap()
});

static REMOVE_DATA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*SELECT\s+md_remove_data\s*\(\s*'([^']+)'\s*\)\s*;?\s*$").unwrap()
});

static MEDIATOR_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*SELECT\s+md_mediator_error\s*\(\s*'([^']*)'\s*\)\s*;?\s*$").unwrap()
});

/// A recognized mediator built-in.
#[derive(Debug, Clone, PartialEq)]
pub enum MediatorStatement {
    /// `SELECT md_fetch_data('<url>')`
    FetchData { url: String },
    /// `SELECT md_list_data_loaders()`
    ListDataLoaders,
    /// `SELECT md_remove_data('<url>')`
    RemoveData { url: String },
    /// `SELECT md_mediator_error('<message>')`
    MediatorError { message: String },
}

impl MediatorStatement {
    /// Classify a statement. Returns `None` for ordinary SQL,
    /// including `md_fetch_data`/`md_remove_data` calls whose
    /// argument isn't a URL.
    pub fn parse(query: &str) -> Option<Self> {
        if let Some(captures) = FETCH_DATA.captures(query) {
            let url = &captures[1];
            if is_valid_url(url) {
                return Some(Self::FetchData {
                    url: url.to_string(),
                });
            }
            return None;
        }

        if LIST_DATA_LOADERS.is_match(query) {
            return Some(Self::ListDataLoaders);
        }

        if let Some(captures) = REMOVE_DATA.captures(query) {
            let url = &captures[1];
            if is_valid_url(url) {
                return Some(Self::RemoveData {
                    url: url.to_string(),
                });
            }
            return None;
        }

        if let Some(captures) = MEDIATOR_ERROR.captures(query) {
            return Some(Self::MediatorError {
                message: captures[1].to_string(),
            });
        }

        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fetch_data() {
        let statement =
            MediatorStatement::parse("SELECT md_fetch_data('http://a/FS/4')").unwrap();
        assert_eq!(
            statement,
            MediatorStatement::FetchData {
                url: "http://a/FS/4".into()
            }
        );
    }

    #[test]
    fn test_fetch_data_case_and_whitespace() {
        let statement =
            MediatorStatement::parse("  select   MD_FETCH_DATA ( 'http://a/FS/4' ) ; ").unwrap();
        assert_eq!(
            statement,
            MediatorStatement::FetchData {
                url: "http://a/FS/4".into()
            }
        );
    }

    #[test]
    fn test_fetch_data_invalid_url_is_ordinary() {
        assert_eq!(MediatorStatement::parse("SELECT md_fetch_data('not a url')"), None);
    }

    #[test]
    fn test_fetch_data_anchored() {
        // Trailing clauses make it an ordinary statement.
        assert_eq!(
            MediatorStatement::parse("SELECT md_fetch_data('http://a/FS/4') FROM t"),
            None
        );
    }

    #[test]
    fn test_list_data_loaders() {
        assert_eq!(
            MediatorStatement::parse("SELECT md_list_data_loaders()"),
            Some(MediatorStatement::ListDataLoaders)
        );
    }

    #[test]
    fn test_remove_data() {
        assert_eq!(
            MediatorStatement::parse("SELECT md_remove_data('http://a/FS/4');"),
            Some(MediatorStatement::RemoveData {
                url: "http://a/FS/4".into()
            })
        );
    }

    #[test]
    fn test_mediator_error() {
        assert_eq!(
            MediatorStatement::parse("SELECT md_mediator_error('it broke')"),
            Some(MediatorStatement::MediatorError {
                message: "it broke".into()
            })
        );
    }

    #[test]
    fn test_ordinary_statement() {
        assert_eq!(MediatorStatement::parse("SELECT * FROM users"), None);
    }
}
