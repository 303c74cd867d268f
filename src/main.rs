mod cli;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cxx_indexer=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Index { project, watch } => {
            let config = cli.config.clone();
            // The watch loop blocks on filesystem events.
            tokio::task::spawn_blocking(move || {
                cli::index_workspace(&config, project.as_deref(), watch)
            })
            .await??;
        }
        Commands::Search {
            pattern,
            project,
            direction,
            prefix,
            exact,
            global,
            limit,
        } => {
            cli::search(
                &cli.config,
                &pattern,
                project.as_deref(),
                &direction,
                prefix,
                exact,
                global,
                limit,
            )?;
        }
        Commands::Refs {
            name,
            kind,
            project,
            direction,
        } => {
            cli::refs(
                &cli.config,
                &name,
                kind.as_deref(),
                project.as_deref(),
                &direction,
            )?;
        }
        Commands::Stats => {
            cli::show_stats(&cli.config)?;
        }
        Commands::Export {
            project,
            file,
            portable,
        } => {
            cli::export(&cli.config, &project, &file, portable)?;
        }
        Commands::Import { project, file } => {
            cli::import(&cli.config, &project, &file)?;
        }
    }

    Ok(())
}
