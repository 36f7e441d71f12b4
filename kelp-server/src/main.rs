use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kelp_server::config::KelpConfig;
use kelp_server::routes;
use kelp_server::service::SearchService;

/// Local semantic code search over a Git repository.
#[derive(Debug, Parser)]
#[command(name = "kelp-server", version)]
struct Args {
    /// Repository to index and serve.
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Listen port; overrides the configured `server.port`.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let repo = args.repo.canonicalize()?;
    let config = KelpConfig::load(&repo);
    let port = args.port.unwrap_or(config.server.port);

    let service = Arc::new(SearchService::start(repo.clone(), &config).await?);
    let app = routes::router(service);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    tracing::info!("listening on 127.0.0.1:{port}, serving {}", repo.display());
    axum::serve(listener, app).await?;
    Ok(())
}
