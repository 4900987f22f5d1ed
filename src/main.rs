mod config;
mod models;
mod scrapers;

use anyhow::Result;
use config::Settings;
use scrapers::{ChromeSession, Pipeline, StdinSignal};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("Rental Scout - vacation rental extractor");

    let settings = Settings::from_env();
    let regions = config::load_regions(
        std::path::Path::new("regions.json"),
        settings.force_tomorrow,
    )?;

    tokio::fs::create_dir_all(&settings.data_dir).await?;

    // The browser session lives exactly as long as the pipeline run.
    let session = ChromeSession::launch(&settings)?;
    let data_dir = settings.data_dir.clone();
    let pipeline = Pipeline::new(session, StdinSignal, settings);
    let result = pipeline.run(&regions);

    // Save the full run, then one file per record.
    let run_file = data_dir.join(format!(
        "run_{}.json",
        result.started_at.format("%Y%m%d_%H%M%S")
    ));
    let json = serde_json::to_string_pretty(&result)?;
    tokio::fs::write(&run_file, json).await?;
    info!(
        records = result.records.len(),
        failures = result.failures.len(),
        output = %run_file.display(),
        "Saved run results"
    );

    let records_dir = data_dir.join("records");
    tokio::fs::create_dir_all(&records_dir).await?;
    for record in &result.records {
        let record_file = records_dir.join(format!("{}.json", record.id));
        let record_json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&record_file, record_json).await?;
    }
    info!(
        total = result.records.len(),
        "Saved individual record files"
    );

    Ok(())
}
