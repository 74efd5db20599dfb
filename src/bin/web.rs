//! Frontend process entry point.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dikto::dikto_core::janitor;
use dikto::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dikto=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;
    settings.validate_frontend()?;
    tracing::info!(
        "starting frontend (root {}, online={})",
        settings.root.display(),
        settings.online
    );

    janitor::spawn(&settings.root);
    dikto::server::run(settings).await
}
