//! geomed entrypoint.

use clap::Parser;
use tracing::info;

use geomed::cli::{self, Cli, Commands};
use geomed::{backend, config, daemon, frontend, logger};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logger::setup();

    if let Commands::Configcheck = cli.command {
        cli::config_check(&cli.config)?;
        return Ok(());
    }

    let config = config::load(&cli.config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.general.workers.max(1))
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Run => daemon::run(config).await?,

            Commands::Rewrite {
                user,
                query,
                in_transaction,
            } => {
                let sql = frontend::rewrite_query(&user, &query, in_transaction).await?;
                #[allow(clippy::print_stdout)]
                {
                    println!("{}", sql);
                }
            }

            Commands::Load { url, user } => daemon::load_worker(config, &url, &user).await?,

            Commands::Setup => {
                backend::store()?.setup().await?;
                info!("data status table and view created");
            }

            Commands::Configcheck => (), // handled before the runtime starts
        }

        Ok(())
    })
}
