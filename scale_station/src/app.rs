use crate::camera::Camera;
use crate::config::Config;
use crate::detector::{Detector, GrpcDetector};
use crate::handoff::{HandoffNotifier, SystemBrowser};
use crate::pipeline::{AcquisitionPipeline, PipelineRunner};
use crate::scale::SerialScale;
use crate::server::HttpServer;
use crate::state::{Command, Snapshot};
use crate::telemetry::Metrics;

use parking_lot::Mutex;
use std::{collections::VecDeque, error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};
use url::Url;

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let detector: Arc<dyn Detector> = match GrpcDetector::new(&config.detector).await {
        Ok(detector) => Arc::new(detector),
        Err(e) => {
            tracing::error!("Failed to initialize detector client: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let base_url = Url::parse(&config.handoff.base_url)
        .map_err(|e| format!("invalid handoff base_url: {}", e))?;
    let notifier = HandoffNotifier::new(base_url, Box::new(SystemBrowser));

    let pipeline = AcquisitionPipeline::new(
        Box::new(Camera::new(&config.camera)),
        detector,
        Box::new(SerialScale::new()),
        notifier,
        config.detector.confidence_threshold,
    );

    let snapshot = Arc::new(Mutex::new(Snapshot::startup()));
    let commands = Arc::new(Mutex::new(VecDeque::new()));
    seed_commands(&commands, &config);

    let metrics = Arc::new(Metrics::new());

    let server = HttpServer::new(
        snapshot.clone(),
        commands.clone(),
        metrics.clone(),
        &config,
    )
    .await?;

    let (shutdown_tx, _) = broadcast::channel(1);

    let runner = PipelineRunner::new(pipeline, snapshot, commands, metrics, &config.camera);
    let runner_handle = runner.spawn(shutdown_tx.subscribe());

    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    let _ = runner_handle.await;
    let _ = server_handle.await;

    Ok(())
}

/// Configured scale port and autostart become the first commands the
/// worker sees, as if the operator had clicked them.
fn seed_commands(
    commands: &Arc<Mutex<VecDeque<Command>>>,
    config: &Config,
) {
    let mut queue = commands.lock();
    if let Some(port) = &config.scale.port {
        queue.push_back(Command::ConnectScale {
            port: port.clone(),
            baud: config.scale.baud,
        });
    }
    if config.camera.autostart {
        queue.push_back(Command::Start {
            camera_index: None,
            confidence_threshold: None,
        });
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
