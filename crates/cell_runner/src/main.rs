mod config;
mod store;

use crate::config::Config;
use crate::store::{read_cell_list, FileCellSink, FileCellSource};
use anyhow::Context;
use clap::Parser;
use nearest_vertex::{CpuResolver, EngineConfig, NearestVertexEngine, Resolver, Sequencer};
use std::sync::atomic::Ordering;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Initialization ---
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
    let config = Config::parse();
    tracing::info!(config = ?config, "Cell runner starting with configuration");

    let engine_config = config.engine_config()?;
    let cell_ids = read_cell_list(&config.cell_list_path())?;
    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("creating output directory {}", config.output_dir.display()))?;
    tracing::info!(cells = cell_ids.len(), "Cell list loaded");

    // Device setup blocks on the adapter; keep it off the async workers.
    let cpu_reference = config.cpu_reference;
    let resolver = tokio::task::spawn_blocking(move || build_resolver(cpu_reference, engine_config))
        .await??;

    // --- 2. Run cells on a blocking thread ---
    let mut sequencer = Sequencer::new(resolver, config.on_failure.into());
    let cancel = sequencer.cancel_handle();
    let mut source = FileCellSource::new(&config.data_dir);
    let mut sink = FileCellSink::new(&config.data_dir, &config.output_dir);
    let mut run = tokio::task::spawn_blocking(move || {
        sequencer.run(cell_ids, &mut source, &mut sink)
    });

    // --- 3. Wait for completion or a shutdown signal ---
    let finished = tokio::select! {
        res = &mut run => Some(res),
        _ = shutdown_signal() => None,
    };
    let outcome = match finished {
        Some(res) => res,
        None => {
            tracing::info!("Shutdown signal received. Finishing the current cell...");
            cancel.store(true, Ordering::Relaxed);
            run.await
        }
    };

    let report = outcome
        .context("cell sequencer task panicked")?
        .context("cell processing halted")?;

    for failure in &report.failed {
        tracing::error!(cell = failure.cell_id(), error = ?failure, "Cell was skipped");
    }
    tracing::info!(
        completed = report.completed.len(),
        failed = report.failed.len(),
        cancelled = report.cancelled,
        "Cell runner finished"
    );

    if !report.failed.is_empty() {
        anyhow::bail!("{} cell(s) failed", report.failed.len());
    }
    Ok(())
}

fn build_resolver(
    cpu_reference: bool,
    engine_config: EngineConfig,
) -> anyhow::Result<Box<dyn Resolver + Send>> {
    if cpu_reference {
        tracing::warn!("Resolving on the CPU reference path");
        return Ok(Box::new(CpuResolver::new(
            engine_config.dims,
            engine_config.termination,
        )));
    }
    let engine = NearestVertexEngine::new(engine_config)
        .context("failed to initialise the nearest-vertex engine")?;
    Ok(Box::new(engine))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use nearest_vertex::{GridDims, Termination};

    #[test]
    fn cpu_reference_flag_builds_a_working_resolver() {
        let engine_config = EngineConfig {
            dims: GridDims::new(4, 4).unwrap(),
            termination: Termination::ExplicitLength,
            ..EngineConfig::default()
        };
        let resolver = build_resolver(true, engine_config).unwrap();

        let contacts = [Vec3::new(1.0, 0.0, 0.0)];
        let vertices = [
            Vec3::new(5.0, 5.0, 5.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(10.0, 10.0, 10.0),
        ];
        let indices = resolver.resolve(&contacts, &vertices).unwrap();
        assert_eq!(indices.as_slice(), &[2]);
    }
}
