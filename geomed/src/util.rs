//! What's a project without a util module.

/// Escape PostgreSQL identifiers by doubling any embedded quotes.
pub fn escape_identifier(s: &str) -> String {
    s.replace("\"", "\"\"")
}

/// Escape PostgreSQL string literals by doubling any embedded
/// single quotes.
pub fn escape_literal(s: &str) -> String {
    s.replace("'", "''")
}
