mod aggregate;
mod config;
mod constants;
mod detect;
mod frames;
mod logging;
mod pipeline;
mod routes;
mod services;

#[cfg(test)]
mod testing;

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::Semaphore;

use config::Config;
use frames::{FfmpegDecoder, SamplingPlan};
use pipeline::Pipeline;
use services::runs::{RunRegistry, run_retention_sweeper};

pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub runs: Arc<RunRegistry>,
    /// Bounds how many runs decode and detect at the same time
    pub run_slots: Semaphore,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let config = Config::from_env();

    let detector = detect::load_detector(&config.model).context("Failed to load detector")?;
    log::info!("[server] Detector ready ({})", detector.name());

    let pipeline = Pipeline::new(
        Arc::new(FfmpegDecoder::new(&config.sampling)),
        detector,
        SamplingPlan::from(&config.sampling),
        config.public_base_url.clone(),
    );

    let runs = Arc::new(
        RunRegistry::init(
            config.runs_dir(),
            config.max_retained_runs,
            config.run_retention,
        )
        .await
        .with_context(|| format!("Failed to prepare {:?}", config.runs_dir()))?,
    );

    // Evict completed runs that outlive the retention window
    tokio::spawn(run_retention_sweeper(
        runs.clone(),
        config.retention_sweep_interval,
    ));

    let state = Arc::new(AppState {
        pipeline: Arc::new(pipeline),
        runs,
        run_slots: Semaphore::new(config.max_concurrent_runs.max(1)),
    });

    let app = routes::build_router(state, config.max_upload_bytes);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    log::info!("[server] Listening on http://{}", addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
