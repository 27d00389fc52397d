#[macro_use]
extern crate tracing;

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use nublado_controller::alerts::AlertSink;
use nublado_controller::background::BackgroundTaskManager;
use nublado_controller::builder::fileserver::FileserverBuilder;
use nublado_controller::builder::lab::LabBuilder;
use nublado_controller::builder::prepuller::PrepullerBuilder;
use nublado_controller::config::Config;
use nublado_controller::constants::{CONFIGURATION_PATH, DOCKER_CREDENTIALS_PATH};
use nublado_controller::gafaelfawr::GafaelfawrClient;
use nublado_controller::http::{AppState, build_router};
use nublado_controller::kubernetes::fileserver::FileserverStorage;
use nublado_controller::kubernetes::lab::LabStorage;
use nublado_controller::kubernetes::metadata::MetadataStorage;
use nublado_controller::kubernetes::node::NodeStorage;
use nublado_controller::kubernetes::pod::PodStorage;
use nublado_controller::models::docker::DockerCredentialStore;
use nublado_controller::registry::DockerRegistryClient;
use nublado_controller::registry::source::DockerImageSource;
use nublado_controller::services::fileserver::FileserverManager;
use nublado_controller::services::form::FormService;
use nublado_controller::services::image::ImageService;
use nublado_controller::services::lab::LabManager;
use nublado_controller::services::prepuller::Prepuller;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::var("NUBLADO_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(CONFIGURATION_PATH));
    let config = Config::from_file(&config_path)?;

    let filter = match &config.log_level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().json().with_env_filter(filter).init();
    info!(config = %config_path.display(), "Starting lab controller");

    let http_client = reqwest::Client::builder().build()?;
    let slack_webhook = config
        .slack_webhook
        .clone()
        .or_else(|| std::env::var("NUBLADO_SLACK_WEBHOOK").ok());
    let alerts = AlertSink::new(slack_webhook, http_client.clone());
    let kube_client = kube::Client::try_default().await?;
    let metadata = Arc::new(MetadataStorage::new(&config.metadata_path));

    // Registry credentials are optional; without them only anonymous
    // registries work.
    let credentials_path = config
        .images
        .source
        .credentials_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DOCKER_CREDENTIALS_PATH));
    let credentials = if credentials_path.exists() {
        DockerCredentialStore::from_path(&credentials_path)?
    } else {
        warn!(path = %credentials_path.display(), "No Docker credentials found");
        DockerCredentialStore::default()
    };

    let registry = DockerRegistryClient::new(http_client.clone(), credentials);
    let source = DockerImageSource::new(config.images.clone(), registry);
    let image_service = Arc::new(ImageService::new(
        config.images.clone(),
        config.lab.node_selector.clone(),
        config.lab.tolerations.clone(),
        Box::new(source),
        NodeStorage::new(kube_client.clone()),
    ));

    let prepuller = Arc::new(Prepuller::new(
        Arc::clone(&image_service),
        PrepullerBuilder::new(config.lab.pull_secret.clone()),
        Arc::clone(&metadata),
        Arc::new(PodStorage::new(kube_client.clone())),
        alerts.clone(),
    ));

    let lab_manager = Arc::new(LabManager::new(
        config.lab.clone(),
        LabBuilder::new(config.lab.clone(), &config.base_url),
        Arc::new(LabStorage::new(kube_client.clone())),
        Arc::clone(&metadata),
        Arc::clone(&image_service),
        alerts.clone(),
    ));

    let fileserver_manager = if config.fileserver.enabled {
        let builder = FileserverBuilder::new(
            config.fileserver.clone(),
            &config.base_url,
            config.lab.volumes.clone(),
        );
        let storage = Arc::new(FileserverStorage::new(kube_client));
        Some(Arc::new(FileserverManager::new(
            config.fileserver.clone(),
            builder,
            storage,
            alerts.clone(),
        )?))
    } else {
        None
    };

    let background = BackgroundTaskManager::new(
        Arc::clone(&image_service),
        prepuller,
        Arc::clone(&lab_manager),
        fileserver_manager.clone(),
        alerts,
        config.images.refresh_interval(),
        config.lab.reconcile_interval(),
        config.fileserver.reconcile_interval(),
    );
    background.start().await?;

    let state = Arc::new(AppState {
        lab_manager,
        image_service,
        fileserver_manager,
        form: FormService::new(config.lab.sizes.clone(), &config.base_url)?,
        gafaelfawr: GafaelfawrClient::new(http_client, &config.base_url),
        base_url: config.base_url.clone(),
        path_prefix: config.path_prefix.clone(),
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    info!("Listening on 0.0.0.0:8080");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    background.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("cannot install ctrl-c handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("cannot install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
