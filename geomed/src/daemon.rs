//! Data loader daemon.
//!
//! Listens for load requests published by the rewriter and runs
//! each one in an isolated worker process. A crashing loader takes
//! down its own process, never the daemon.

use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::sleep;
use tracing::{error, info};

use crate::backend::{loader, Error, Listener, LoadRequest};
use crate::config::Config;
use crate::frontend::parser::to_table_name;
use crate::util::escape_identifier;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Run the daemon until the process is killed. Lost database
/// connections are re-established.
pub async fn run(config: Arc<Config>) -> Result<(), Error> {
    loop {
        if let Err(err) = serve(&config).await {
            error!("daemon error: {}", err);
        }

        sleep(RECONNECT_DELAY).await;
        info!("reconnecting");
    }
}

async fn serve(config: &Arc<Config>) -> Result<(), Error> {
    let mut listener =
        Listener::connect(&config.database, &config.data_loader.notify_channel).await?;

    while let Some(notification) = listener.recv().await {
        let request: LoadRequest = match serde_json::from_str(notification.payload()) {
            Ok(request) => request,
            Err(err) => {
                error!("malformed load request: {}", err);
                continue;
            }
        };

        info!("load requested for {} by {}", request.url, request.username);

        let config = config.clone();
        tokio::spawn(async move {
            let url = request.url.clone();
            if let Err(err) = dispatch(request, config).await {
                error!("worker dispatch failed for {}: {}", url, err);
            }
        });
    }

    Err(Error::ListenerClosed)
}

/// Run one load request in a worker process.
async fn dispatch(request: LoadRequest, config: Arc<Config>) -> Result<(), Error> {
    // Delivery is at-least-once; only rows still in Loading get
    // a worker.
    if !loader::loading(&config.database, &request.url).await? {
        info!("skipping {}: not in Loading", request.url);
        return Ok(());
    }

    let exe = std::env::current_exe()?;
    let mut command = Command::new(exe);
    command
        .arg("load")
        .arg("--url")
        .arg(&request.url)
        .arg("--user")
        .arg(&request.username);
    if let Some(path) = &config.path {
        command.arg("--config").arg(path);
    }

    // The worker contains its own failures; a non-zero exit means
    // it died before recording anything.
    let output = command.output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(
            "worker for {} exited abnormally: {}",
            request.url,
            stderr.trim()
        );

        loader::set_loading_error(
            &config.database,
            &request.url,
            &format!("worker exited abnormally: {}", stderr.trim()),
        )
        .await?;

        // Best-effort cleanup of the half-written table.
        let client = loader::connect(&config.database).await?;
        client
            .batch_execute(&format!(
                "DROP TABLE IF EXISTS public.\"{}\"",
                escape_identifier(&request.table_name)
            ))
            .await?;
    }

    Ok(())
}

/// Entry point of the isolated worker process spawned for one load
/// request.
pub async fn load_worker(config: Arc<Config>, url: &str, username: &str) -> Result<(), Error> {
    let table_name = to_table_name(url, &config.general.secret_key);
    let context = loader::LoaderContext {
        url: url.to_string(),
        table_name,
        username: username.to_string(),
        config: config.clone(),
    };

    let Some(data_loader) = loader::create_loader(&context).await else {
        let message = format!("No data loader was found for {}", url);
        error!("{}", message);
        loader::set_loading_error(&config.database, url, &message).await?;
        return Ok(());
    };

    info!("loading {} with {}", url, data_loader.name());

    // load() records Saved or Error itself; the Err here is already
    // contained and only logged.
    if let Err(err) = data_loader.load().await {
        error!("data load failed for {}: {}", url, err);
    }

    Ok(())
}
