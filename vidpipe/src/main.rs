use std::path::PathBuf;

use anyhow::Context;
use tracing::{error, info, warn};

use vidpipe::config::PipelineConfig;
use vidpipe::hardware::CapabilityCache;
use vidpipe::logging::init_logging;
use vidpipe::pipeline::{ChannelSink, PipelineOrchestrator, PipelineRequest, RunEvent, RunStatus};
use vidpipe::utils::http_client::install_rustls_provider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    install_rustls_provider();

    let config_path = std::env::var("VIDPIPE_CONFIG").ok().map(PathBuf::from);
    let config =
        PipelineConfig::load(config_path.as_deref()).context("failed to load configuration")?;
    let _logging = init_logging(&config.logging).context("failed to initialize logging")?;

    let caps = CapabilityCache::global(&config.tools).get().await;
    if caps.accelerators.is_empty() {
        info!("Hardware acceleration unavailable, encoding in software");
    } else {
        for acc in &caps.accelerators {
            info!(vendor = %acc.vendor, name = %acc.name, "Hardware encoder available");
        }
    }

    let Some(job_path) = std::env::args().nth(1).map(PathBuf::from) else {
        info!("No job file given, nothing to do");
        return Ok(());
    };
    let raw = std::fs::read_to_string(&job_path)
        .with_context(|| format!("failed to read job file {}", job_path.display()))?;
    let request = PipelineRequest::from_json(&raw, &config).context("invalid job file")?;

    let (sink, mut events) = ChannelSink::channel(256);
    let orchestrator = PipelineOrchestrator::from_config(&config)?.with_sink(std::sync::Arc::new(sink));

    let reporter = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RunEvent::Status { run_id, status, .. } => info!(%run_id, %status, "Run status"),
                RunEvent::Progress { run_id, stage, percent, .. } => {
                    info!(%run_id, %stage, percent = format!("{:.1}", percent), "Progress")
                }
                RunEvent::Error { run_id, message, .. } => error!(%run_id, %message, "Run error"),
            }
        }
    });

    let run_id = orchestrator.submit(request)?;
    let report = tokio::select! {
        report = orchestrator.wait(&run_id) => report?,
        _ = tokio::signal::ctrl_c() => {
            warn!(%run_id, "Interrupted, cancelling run");
            orchestrator.shutdown();
            orchestrator.wait(&run_id).await?
        }
    };
    drop(orchestrator);
    reporter.abort();

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.status != RunStatus::Completed {
        anyhow::bail!("run {} finished as {}", report.run_id, report.status);
    }
    Ok(())
}
