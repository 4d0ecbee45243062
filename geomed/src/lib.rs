//! geomed is a SQL mediator sitting between clients and a
//! PostGIS-backed database. Statements may reference remote
//! geospatial services (WFS, WCS, ArcGIS) by URL; the mediator
//! rewrites them over stable local tables and materialises the
//! remote data before queries are answered.

pub mod backend;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod frontend;
pub mod logger;
pub mod util;

pub use frontend::rewrite_query;
