//! Worker process entry point. Exits non-zero when the speech pipeline or
//! its diarization credential are not configured.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dikto::{CommandPipeline, Ffmpeg, Settings, Worker};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dikto=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;
    let speech = CommandPipeline::from_settings(&settings)?;
    let worker = Worker::new(settings, Ffmpeg, speech);
    worker.run()
}
