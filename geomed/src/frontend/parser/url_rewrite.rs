//! URL replacement over the statement AST.
//!
//! Every relation reference whose name is a URL is swapped for the
//! deterministic local table name, and the substitutions are collected
//! so the rewriter can check materialisation status afterwards.

use pg_query::protobuf::{ColumnRef, RangeVar, SelectStmt};
use pg_query::{Node, NodeEnum};

use super::error::Error;
use super::table_name::{is_valid_url, to_table_name};

/// URL → table name substitutions collected from one statement.
/// Insertion-ordered; a URL referenced twice is recorded once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UrlMapping {
    entries: Vec<(String, String)>,
}

impl UrlMapping {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Referenced URLs, in order of first appearance.
    pub fn urls(&self) -> Vec<&str> {
        self.entries.iter().map(|(url, _)| url.as_str()).collect()
    }

    pub fn table_name(&self, url: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == url)
            .map(|(_, table)| table.as_str())
    }

    fn insert(&mut self, url: &str, table: String) -> String {
        if let Some(existing) = self.table_name(url) {
            return existing.to_string();
        }
        self.entries.push((url.to_string(), table.clone()));
        table
    }
}

/// A statement with its URL relations replaced.
#[derive(Debug, Clone)]
pub struct RewrittenQuery {
    /// Canonical SQL over local tables.
    pub sql: String,
    /// What was replaced.
    pub mapping: UrlMapping,
}

/// Parse a statement and substitute URL relation references.
pub fn rewrite_urls(query: &str, secret: &str) -> Result<RewrittenQuery, Error> {
    let mut ast = pg_query::parse(query)?;

    let mut rewriter = UrlRewriter {
        secret,
        mapping: UrlMapping::default(),
    };

    for stmt in &mut ast.protobuf.stmts {
        if let Some(node) = &mut stmt.stmt {
            rewriter.node(node);
        }
    }

    let sql = ast.deparse()?;

    Ok(RewrittenQuery {
        sql,
        mapping: rewriter.mapping,
    })
}

struct UrlRewriter<'a> {
    secret: &'a str,
    mapping: UrlMapping,
}

impl UrlRewriter<'_> {
    fn range_var(&mut self, range_var: &mut RangeVar) {
        if is_valid_url(&range_var.relname) {
            let table = to_table_name(&range_var.relname, self.secret);
            range_var.relname = self.mapping.insert(&range_var.relname, table);
        }
    }

    /// Column references qualified by a URL, e.g.
    /// `SELECT "http://…".name FROM "http://…"`.
    fn column_ref(&mut self, column_ref: &mut ColumnRef) {
        for field in &mut column_ref.fields {
            if let Some(NodeEnum::String(qualifier)) = &mut field.node {
                if let Some(table) = self.mapping.table_name(&qualifier.sval) {
                    qualifier.sval = table.to_string();
                }
            }
        }
    }

    /// FROM clauses and set-operation arms come first so that by the
    /// time a qualified column reference is visited, its URL is
    /// already in the mapping.
    fn select(&mut self, stmt: &mut SelectStmt) {
        for from in &mut stmt.from_clause {
            self.node(from);
        }
        if let Some(larg) = &mut stmt.larg {
            self.select(larg);
        }
        if let Some(rarg) = &mut stmt.rarg {
            self.select(rarg);
        }
        for cte in stmt.with_clause.iter_mut().flat_map(|with| &mut with.ctes) {
            self.node(cte);
        }
        for target in &mut stmt.target_list {
            self.node(target);
        }
        if let Some(where_clause) = &mut stmt.where_clause {
            self.node(where_clause);
        }
        for group in &mut stmt.group_clause {
            self.node(group);
        }
        if let Some(having) = &mut stmt.having_clause {
            self.node(having);
        }
        for sort in &mut stmt.sort_clause {
            self.node(sort);
        }
        if let Some(limit) = &mut stmt.limit_count {
            self.node(limit);
        }
        if let Some(offset) = &mut stmt.limit_offset {
            self.node(offset);
        }
        for values in &mut stmt.values_lists {
            self.node(values);
        }
    }

    fn node(&mut self, node: &mut Node) {
        let Some(inner) = &mut node.node else {
            return;
        };

        match inner {
            NodeEnum::RangeVar(range_var) => self.range_var(range_var),

            NodeEnum::ColumnRef(column_ref) => self.column_ref(column_ref),

            NodeEnum::SelectStmt(stmt) => self.select(stmt),

            NodeEnum::InsertStmt(stmt) => {
                if let Some(relation) = &mut stmt.relation {
                    self.range_var(relation);
                }
                if let Some(select) = &mut stmt.select_stmt {
                    self.node(select);
                }
                for returning in &mut stmt.returning_list {
                    self.node(returning);
                }
                for cte in stmt.with_clause.iter_mut().flat_map(|with| &mut with.ctes) {
                    self.node(cte);
                }
            }

            NodeEnum::UpdateStmt(stmt) => {
                if let Some(relation) = &mut stmt.relation {
                    self.range_var(relation);
                }
                for from in &mut stmt.from_clause {
                    self.node(from);
                }
                for target in &mut stmt.target_list {
                    self.node(target);
                }
                if let Some(where_clause) = &mut stmt.where_clause {
                    self.node(where_clause);
                }
                for returning in &mut stmt.returning_list {
                    self.node(returning);
                }
                for cte in stmt.with_clause.iter_mut().flat_map(|with| &mut with.ctes) {
                    self.node(cte);
                }
            }

            NodeEnum::DeleteStmt(stmt) => {
                if let Some(relation) = &mut stmt.relation {
                    self.range_var(relation);
                }
                for using in &mut stmt.using_clause {
                    self.node(using);
                }
                if let Some(where_clause) = &mut stmt.where_clause {
                    self.node(where_clause);
                }
                for returning in &mut stmt.returning_list {
                    self.node(returning);
                }
                for cte in stmt.with_clause.iter_mut().flat_map(|with| &mut with.ctes) {
                    self.node(cte);
                }
            }

            NodeEnum::JoinExpr(join) => {
                if let Some(larg) = &mut join.larg {
                    self.node(larg);
                }
                if let Some(rarg) = &mut join.rarg {
                    self.node(rarg);
                }
                if let Some(quals) = &mut join.quals {
                    self.node(quals);
                }
            }

            NodeEnum::RangeSubselect(range) => {
                if let Some(subquery) = &mut range.subquery {
                    self.node(subquery);
                }
            }

            NodeEnum::CommonTableExpr(cte) => {
                if let Some(query) = &mut cte.ctequery {
                    self.node(query);
                }
            }

            NodeEnum::SubLink(sub) => {
                if let Some(testexpr) = &mut sub.testexpr {
                    self.node(testexpr);
                }
                if let Some(subselect) = &mut sub.subselect {
                    self.node(subselect);
                }
            }

            NodeEnum::ResTarget(target) => {
                if let Some(val) = &mut target.val {
                    self.node(val);
                }
            }

            NodeEnum::AExpr(expr) => {
                if let Some(lexpr) = &mut expr.lexpr {
                    self.node(lexpr);
                }
                if let Some(rexpr) = &mut expr.rexpr {
                    self.node(rexpr);
                }
            }

            NodeEnum::BoolExpr(expr) => {
                for arg in &mut expr.args {
                    self.node(arg);
                }
            }

            NodeEnum::FuncCall(func) => {
                for arg in &mut func.args {
                    self.node(arg);
                }
            }

            NodeEnum::TypeCast(cast) => {
                if let Some(arg) = &mut cast.arg {
                    self.node(arg);
                }
            }

            NodeEnum::CaseExpr(case) => {
                if let Some(arg) = &mut case.arg {
                    self.node(arg);
                }
                for when in &mut case.args {
                    self.node(when);
                }
                if let Some(defresult) = &mut case.defresult {
                    self.node(defresult);
                }
            }

            NodeEnum::CaseWhen(when) => {
                if let Some(expr) = &mut when.expr {
                    self.node(expr);
                }
                if let Some(result) = &mut when.result {
                    self.node(result);
                }
            }

            NodeEnum::CoalesceExpr(coalesce) => {
                for arg in &mut coalesce.args {
                    self.node(arg);
                }
            }

            NodeEnum::RowExpr(row) => {
                for arg in &mut row.args {
                    self.node(arg);
                }
            }

            NodeEnum::NullTest(test) => {
                if let Some(arg) = &mut test.arg {
                    self.node(arg);
                }
            }

            NodeEnum::SortBy(sort) => {
                if let Some(node) = &mut sort.node {
                    self.node(node);
                }
            }

            NodeEnum::List(list) => {
                for item in &mut list.items {
                    self.node(item);
                }
            }

            _ => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SECRET: &str = "test-secret";

    fn table(url: &str) -> String {
        to_table_name(url, SECRET)
    }

    #[test]
    fn test_union_of_urls() {
        let sql = r#"
            SELECT * FROM "http://www.sdsc.edu/ArcGIS/FeatureServer/test/1"
            UNION
            SELECT * FROM "http://www.sdsc.edu/ArcGIS/FeatureServer/test/2"
        "#;
        let rewritten = rewrite_urls(sql, SECRET).unwrap();

        assert_eq!(rewritten.mapping.len(), 2);
        assert_eq!(
            rewritten.sql,
            format!(
                "SELECT * FROM {} UNION SELECT * FROM {}",
                table("http://www.sdsc.edu/ArcGIS/FeatureServer/test/1"),
                table("http://www.sdsc.edu/ArcGIS/FeatureServer/test/2"),
            )
        );
    }

    #[test]
    fn test_plain_tables_untouched() {
        let rewritten = rewrite_urls("SELECT id, name FROM users WHERE id = 1", SECRET).unwrap();
        assert!(rewritten.mapping.is_empty());
        assert_eq!(rewritten.sql, "SELECT id, name FROM users WHERE id = 1");
    }

    #[test]
    fn test_column_qualified_reference() {
        let url = "http://a/FS/1";
        let sql = format!(r#"SELECT "{}".name FROM "{}" WHERE "{}".id > 5"#, url, url, url);
        let rewritten = rewrite_urls(&sql, SECRET).unwrap();

        assert_eq!(rewritten.mapping.urls(), vec![url]);
        let hashed = table(url);
        assert_eq!(
            rewritten.sql,
            format!(
                "SELECT {}.name FROM {} WHERE {}.id > 5",
                hashed, hashed, hashed
            )
        );
    }

    #[test]
    fn test_join_and_subquery() {
        let sql = r#"
            SELECT a.x FROM "http://a/FS/1" a
            JOIN (SELECT * FROM "http://a/FS/2") b ON a.id = b.id
        "#;
        let rewritten = rewrite_urls(sql, SECRET).unwrap();
        assert_eq!(
            rewritten.mapping.urls(),
            vec!["http://a/FS/1", "http://a/FS/2"]
        );
        assert!(rewritten.sql.contains(&table("http://a/FS/1")));
        assert!(rewritten.sql.contains(&table("http://a/FS/2")));
    }

    #[test]
    fn test_cte_rewritten() {
        let sql = r#"WITH src AS (SELECT * FROM "http://a/FS/1") SELECT count(*) FROM src"#;
        let rewritten = rewrite_urls(sql, SECRET).unwrap();
        assert_eq!(rewritten.mapping.urls(), vec!["http://a/FS/1"]);
        // The CTE name itself is not a URL and stays.
        assert!(rewritten.sql.contains("WITH src AS"));
    }

    #[test]
    fn test_duplicate_url_recorded_once() {
        let sql = r#"SELECT * FROM "http://a/FS/1" UNION ALL SELECT * FROM "http://a/FS/1""#;
        let rewritten = rewrite_urls(sql, SECRET).unwrap();
        assert_eq!(rewritten.mapping.len(), 1);
    }

    #[test]
    fn test_round_trip() {
        let sql = r#"SELECT * FROM "http://a/FS/1" WHERE x IN (SELECT y FROM "http://a/FS/2")"#;
        let first = rewrite_urls(sql, SECRET).unwrap();

        // Canonical output reparses to the same canonical output.
        let reparsed = pg_query::parse(&first.sql).unwrap();
        assert_eq!(reparsed.deparse().unwrap(), first.sql);
    }

    #[test]
    fn test_idempotent() {
        let sql = r#"SELECT * FROM "http://a/FS/1""#;
        let first = rewrite_urls(sql, SECRET).unwrap();
        let second = rewrite_urls(&first.sql, SECRET).unwrap();

        // Hashes are not URLs, so a second pass changes nothing.
        assert!(second.mapping.is_empty());
        assert_eq!(second.sql, first.sql);
    }

    #[test]
    fn test_parse_error() {
        assert!(rewrite_urls("SELEC broken", SECRET).is_err());
    }
}
