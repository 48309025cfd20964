//! # Rescore
//!
//! Recomputes time-decayed scores for posts and comments and retires
//! documents older than the configured inactivity age. Meant to run from a
//! scheduler; every run is idempotent.

use std::sync::Arc;

use anyhow::{Context, Result};
use configs::{LogFormat, LogSettings, Settings};
use domains::{CollectionName, SystemClock};
use secrecy::ExposeSecret;
use services::ScoreRefresher;
use storage_adapters::PgStore;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

fn setup_logging(settings: &LogSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .context("invalid log filter")?;

    match settings.format {
        LogFormat::Json => {
            let subscriber = fmt::Subscriber::builder()
                .with_env_filter(filter)
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber).context("failed to set subscriber")?;
        }
        LogFormat::Plain => {
            let subscriber = fmt::Subscriber::builder()
                .with_env_filter(filter)
                .with_target(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber).context("failed to set subscriber")?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("failed to load settings")?;
    setup_logging(&settings.logging)?;

    let clock = Arc::new(SystemClock);
    let store = PgStore::connect(
        settings.database.url.expose_secret(),
        settings.database.max_connections,
        clock.clone(),
    )
    .await
    .context("failed to connect to database")?;
    store.apply_schema().await?;

    let engine = settings.voting.to_engine_config().context("invalid voting settings")?;
    let refresher = ScoreRefresher::new(Arc::new(store), clock, engine.inactive_after());

    for collection in [CollectionName::Posts, CollectionName::Comments] {
        let summary = refresher
            .refresh(collection)
            .await
            .with_context(|| format!("failed to refresh {collection} scores"))?;
        info!(%collection, updated = summary.updated, deactivated = summary.deactivated, "rescore finished");
    }
    Ok(())
}
