use std::sync::Arc;

use axum::Router;
use envconfig::Envconfig;
use eyre::{bail, Result};
use tokio_util::sync::CancellationToken;

use beacon_common::group::TaskGroup;
use beacon_common::manager::BeaconManager;
use beacon_common::metrics::setup_metrics_recorder;
use beacon_common::oci::build_runtime;
use beacon_common::registry::{build_registry, Registry};
use beacond::config::Config;
use beacond::handlers::{self, AppState};

async fn listen(app: Router, bind: String, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let registry: Arc<dyn Registry> = Arc::from(build_registry(
        config.registry,
        &config.registry_url,
        config.request_timeout.0,
    )?);

    let runtime = build_runtime(config.oci_runtime);
    match runtime.check_exists().await {
        Ok(true) => {}
        Ok(false) => bail!("{} is not available", config.oci_runtime),
        Err(error) => bail!("failed to check for {}: {}", config.oci_runtime, error),
    }

    let recorder_handle = if config.export_prometheus {
        Some(setup_metrics_recorder()?)
    } else {
        None
    };

    let mut group = TaskGroup::new(config.group_grace());

    let manager = Arc::new(BeaconManager::new(
        runtime,
        registry,
        config.manager_settings(),
        &group.token(),
    ));

    let state = AppState {
        manager: manager.clone(),
        poll_interval: config.poll_interval.0,
        stop_timeout: config.stop_probe_timeout.0,
    };
    let app = handlers::app(state, recorder_handle);
    let bind = config.bind();

    tracing::info!(
        %bind,
        runtime = %config.oci_runtime,
        registry = %config.registry_url,
        clean_on_exit = config.clean_on_exit,
        "starting beacond"
    );

    group.spawn("reconciler", move |_| async move {
        manager.run().await;
        Ok(())
    });
    group.spawn("listener", move |token| listen(app, bind, token));
    group.spawn("signals", |token| async move {
        tokio::select! {
            _ = token.cancelled() => {}
            signal = shutdown_signal() => {
                signal?;
                tracing::info!("Shutting down gracefully...");
            }
        }
        Ok::<_, eyre::Report>(())
    });

    group.wait().await
}
