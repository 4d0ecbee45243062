//! Query parser.

pub mod error;
pub mod statement;
pub mod table_name;
pub mod url_rewrite;

pub use error::Error;
pub use statement::MediatorStatement;
pub use table_name::{is_valid_url, to_table_name};
pub use url_rewrite::{rewrite_urls, RewrittenQuery, UrlMapping};
