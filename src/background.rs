use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::alerts::AlertSink;
use crate::errors::Result;
use crate::services::fileserver::FileserverManager;
use crate::services::image::ImageService;
use crate::services::lab::LabManager;
use crate::services::prepuller::Prepuller;

/// Manage the controller's background tasks.
///
/// While the controller runs it refreshes image data, prepulls images,
/// reconciles lab and file server state, and reaps spawn monitors. This
/// class owns the schedules; the work lives on the service objects. Some of
/// the work runs once in the foreground first so internal state is valid
/// before the controller serves requests.
pub struct BackgroundTaskManager {
    image_service: Arc<ImageService>,
    prepuller: Arc<Prepuller>,
    lab_manager: Arc<LabManager>,
    fileserver_manager: Option<Arc<FileserverManager>>,
    alerts: AlertSink,
    image_refresh_interval: Duration,
    lab_reconcile_interval: Duration,
    fileserver_reconcile_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTaskManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        image_service: Arc<ImageService>,
        prepuller: Arc<Prepuller>,
        lab_manager: Arc<LabManager>,
        fileserver_manager: Option<Arc<FileserverManager>>,
        alerts: AlertSink,
        image_refresh_interval: Duration,
        lab_reconcile_interval: Duration,
        fileserver_reconcile_interval: Duration,
    ) -> Self {
        BackgroundTaskManager {
            image_service,
            prepuller,
            lab_manager,
            fileserver_manager,
            alerts,
            image_refresh_interval,
            lab_reconcile_interval,
            fileserver_reconcile_interval,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start all background tasks.
    ///
    /// The state-building work runs in the foreground first, so a failure
    /// here aborts startup rather than leaving the controller serving
    /// requests from empty state.
    pub async fn start(&self) -> Result<()> {
        info!("Populating internal state");
        let warm_up = async {
            if let Some(fileserver) = &self.fileserver_manager {
                fileserver.validate_namespace().await?;
            }
            Ok::<(), crate::errors::ControllerError>(())
        };
        let (images, labs, fileservers) = tokio::join!(
            self.image_service.refresh(),
            self.lab_manager.reconcile(),
            async {
                warm_up.await?;
                match &self.fileserver_manager {
                    Some(fileserver) => fileserver.reconcile().await,
                    None => Ok(()),
                }
            },
        );
        images?;
        labs?;
        fileservers?;

        info!("Starting background tasks");
        let mut tasks = self.tasks.lock().expect("task list lock poisoned");

        let image_service = Arc::clone(&self.image_service);
        tasks.push(tokio::spawn(run_loop(
            move || {
                let image_service = Arc::clone(&image_service);
                async move { image_service.refresh().await }
            },
            self.image_refresh_interval,
            "refreshing image data",
            self.alerts.clone(),
        )));

        let image_service = Arc::clone(&self.image_service);
        let prepuller = Arc::clone(&self.prepuller);
        let alerts = self.alerts.clone();
        let pause = self.image_refresh_interval;
        tasks.push(tokio::spawn(async move {
            // The prepuller runs on the image service's refresh signal
            // instead of an interval, so it starts as soon as the image
            // list may have changed.
            loop {
                image_service.prepuller_wait().await;
                if let Err(error) = prepuller.prepull_images().await {
                    error!(error = %error, "Uncaught exception prepulling images");
                    alerts.post_uncaught("prepulling images", &error).await;
                    warn!("Pausing failed prepuller for {}s", pause.as_secs());
                    tokio::time::sleep(pause).await;
                }
            }
        }));

        let lab_manager = Arc::clone(&self.lab_manager);
        tasks.push(tokio::spawn(run_loop(
            move || {
                let lab_manager = Arc::clone(&lab_manager);
                async move { lab_manager.reconcile().await }
            },
            self.lab_reconcile_interval,
            "reconciling lab state",
            self.alerts.clone(),
        )));

        let lab_manager = Arc::clone(&self.lab_manager);
        tasks.push(tokio::spawn(async move { lab_manager.reap_spawners().await }));

        if let Some(fileserver) = &self.fileserver_manager {
            let manager = Arc::clone(fileserver);
            tasks.push(tokio::spawn(run_loop(
                move || {
                    let manager = Arc::clone(&manager);
                    async move { manager.reconcile().await }
                },
                self.fileserver_reconcile_interval,
                "reconciling file server state",
                self.alerts.clone(),
            )));

            let manager = Arc::clone(fileserver);
            tasks.push(tokio::spawn(async move { manager.watch_servers().await }));
        }

        Ok(())
    }

    /// Stop the background tasks and cancel per-user monitors.
    pub async fn stop(&self) {
        info!("Stopping background tasks");
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("task list lock poisoned");
            tasks.drain(..).collect()
        };
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        info!("Stopping monitor tasks");
        self.lab_manager.stop().await;
    }
}

/// Wrap a service call in a periodic scheduling loop.
///
/// A failing iteration is logged and reported, then the loop continues
/// after the usual delay so whatever broke has time to recover. If an
/// iteration overruns the interval, the operator is warned that the loop is
/// running continuously.
async fn run_loop<F, Fut>(call: F, interval: Duration, description: &'static str, alerts: AlertSink)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        let start = Instant::now();
        if let Err(error) = call().await {
            error!(error = %error, "Uncaught exception {description}");
            alerts.post_uncaught(description, &error).await;
        }
        let delay = interval.saturating_sub(start.elapsed());
        if delay < Duration::from_secs(1) {
            warn!("{description} is running continuously");
        } else {
            tokio::time::sleep(delay).await;
        }
    }
}
