//! Query rewriter and materialisation controller.
//!
//! The proxy calls [`rewrite_query`] for every client statement.
//! Whatever comes back is executed against PostGIS verbatim, so all
//! policy failures are encoded as `md_mediator_error` statements;
//! only unparseable SQL raises.

use tracing::info;

use super::parser::{self, MediatorStatement, RewrittenQuery};
use super::Error;
use crate::backend::{self, loader, LoadRequest, Status};
use crate::config::{config, LoaderKind};
use crate::util::escape_literal;

/// Rewrite one statement.
///
/// URL relation references are replaced with local table names,
/// mediator built-ins are executed, and ordinary statements are
/// gated on every referenced URL being `Saved`.
pub async fn rewrite_query(
    user: &str,
    query: &str,
    _in_transaction: bool,
) -> Result<String, Error> {
    let config = config();
    let rewritten = parser::rewrite_urls(query, &config.general.secret_key)?;

    match MediatorStatement::parse(query) {
        Some(MediatorStatement::FetchData { url }) => fetch_data(user, &url).await,
        Some(MediatorStatement::ListDataLoaders) => {
            Ok(list_data_loaders(&config.data_loader.loaders))
        }
        Some(MediatorStatement::RemoveData { url }) => remove_data(&url).await,
        // Passthrough sentinel: downstream raises it.
        Some(MediatorStatement::MediatorError { .. }) => Ok(rewritten.sql),
        None => ordinary_statement(rewritten).await,
    }
}

/// `SELECT md_fetch_data('<url>')`: make sure a materialisation
/// exists or is on its way, then point the client at the status row.
async fn fetch_data(user: &str, url: &str) -> Result<String, Error> {
    let config = config();
    let store = backend::store()?;
    let response = data_status_sql(url);

    let existing = store.status(url).await?;
    match existing.as_ref().map(|row| row.status) {
        // Already there or on its way: nothing to enqueue.
        Some(Status::Saved) | Some(Status::Loading) => return Ok(response),
        Some(Status::Error) | None => (),
    }

    let table_name = parser::to_table_name(url, &config.general.secret_key);
    let context = loader::LoaderContext {
        url: url.to_string(),
        table_name: table_name.clone(),
        username: user.to_string(),
        config: config.clone(),
    };

    if loader::create_loader(&context).await.is_none() {
        return Ok(mediator_error(&format!(
            "No data loader was found for {}",
            url
        )));
    }

    // A re-requested failure goes back to Loading; a new URL gets a
    // fresh row. Both writes are guarded and publish the load
    // request in their own transaction, so a racing rewriter wins at
    // most once and only the winner enqueues.
    let request = LoadRequest {
        url: url.to_string(),
        username: user.to_string(),
        table_name,
    };
    let won = match existing {
        Some(_) => store.reset_to_loading(&request).await?,
        None => store.create_data_status(&request).await?,
    };

    if won {
        info!("data load enqueued for {}", url);
    }

    Ok(response)
}

/// `SELECT md_remove_data('<url>')`: drop the status row and the
/// materialised table. Does not wait for in-flight loaders; their
/// guarded status writes find no row and their appends fail inside
/// the worker.
async fn remove_data(url: &str) -> Result<String, Error> {
    let store = backend::store()?;

    match store.remove_data(url).await? {
        Some(table_name) => info!("removed data for {} (table \"{}\")", url, table_name),
        None => info!("no data status for {}", url),
    }

    Ok(data_status_sql(url))
}

/// Anything that isn't a mediator built-in: the translation is
/// returned only when every referenced URL is `Saved`.
async fn ordinary_statement(rewritten: RewrittenQuery) -> Result<String, Error> {
    if rewritten.mapping.is_empty() {
        return Ok(rewritten.sql);
    }

    let store = backend::store()?;
    let urls = rewritten.mapping.urls();

    let invalid = store.invalid_urls(&urls).await?;
    if !invalid.is_empty() {
        return Ok(mediator_error(&format!(
            "The following URLs are not ready to query: {}",
            invalid.join(", ")
        )));
    }

    store.update_last_used_times(&urls).await?;

    Ok(rewritten.sql)
}

/// `SELECT md_list_data_loaders()` as a VALUES-backed SELECT; an
/// empty but type-correct relation when nothing is registered.
fn list_data_loaders(loaders: &[LoaderKind]) -> String {
    if loaders.is_empty() {
        return "SELECT * FROM (VALUES (NULL::text, NULL::text)) \
                AS md_data_loaders(name, description) WHERE false"
            .to_string();
    }

    let values = loaders
        .iter()
        .map(|kind| {
            let (name, description) = loader::metadata(*kind);
            format!(
                "('{}', '{}')",
                escape_literal(name),
                escape_literal(description)
            )
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "SELECT * FROM (VALUES {}) AS md_data_loaders(name, description)",
        values
    )
}

fn data_status_sql(url: &str) -> String {
    format!(
        "SELECT * FROM md_v_data_status WHERE url='{}'",
        escape_literal(url)
    )
}

fn mediator_error(message: &str) -> String {
    format!("SELECT md_mediator_error('{}');", escape_literal(message))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::LoaderKind;

    #[test]
    fn test_list_data_loaders_sql() {
        let sql = list_data_loaders(&[LoaderKind::Wfs, LoaderKind::ArcgisFeatureService]);

        assert!(sql.starts_with("SELECT * FROM (VALUES ('WFS Loader', "));
        assert!(sql.contains("('ArcGIS Feature Service Loader', "));
        assert!(sql.ends_with("AS md_data_loaders(name, description)"));
    }

    #[test]
    fn test_list_data_loaders_empty() {
        let sql = list_data_loaders(&[]);
        assert!(sql.contains("NULL::text"));
        assert!(sql.ends_with("WHERE false"));
    }

    #[test]
    fn test_mediator_error_escapes_quotes() {
        let sql = mediator_error("it's broken");
        assert_eq!(sql, "SELECT md_mediator_error('it''s broken');");
    }

    #[test]
    fn test_data_status_sql() {
        assert_eq!(
            data_status_sql("http://a/FS/4"),
            "SELECT * FROM md_v_data_status WHERE url='http://a/FS/4'"
        );
    }
}
