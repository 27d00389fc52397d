use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::{Stream, StreamExt};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use strum_macros::Display;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::alerts::AlertSink;
use crate::builder::lab::LabBuilder;
use crate::config::LabConfig;
use crate::constants::KUBERNETES_REQUEST_TIMEOUT;
use crate::errors::{ControllerError, Result};
use crate::events::EventQueue;
use crate::gafaelfawr::GafaelfawrUser;
use crate::kubernetes::lab::LabStorage;
use crate::kubernetes::metadata::MetadataStorage;
use crate::models::docker::DockerReference;
use crate::models::lab::{
    Event, ImageSelector, LabSpecification, LabState, LabStatus,
};
use crate::models::rspimage::RspImage;
use crate::timeout::Timeout;
use super::image::ImageService;

/// Operations that can be in flight on a user's lab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum LabOperation {
    Spawn,
    Delete,
}

/// A lab operation being monitored by a background task.
struct RunningOperation {
    operation: LabOperation,
    handle: JoinHandle<()>,
    /// Cancelled when the operation finishes, so any number of waiters can
    /// observe completion.
    complete: CancellationToken,
}

/// All internal state for one user's lab.
///
/// The operation slot is the per-user monitor: at most one spawn or delete
/// may occupy it, and every mutation of the slot happens under its lock.
struct UserLab {
    username: String,
    slot: tokio::sync::Mutex<Option<RunningOperation>>,
    state: Mutex<Option<LabState>>,
    events: EventQueue,
}

impl UserLab {
    fn new(username: &str) -> Arc<Self> {
        Arc::new(UserLab {
            username: username.to_string(),
            slot: tokio::sync::Mutex::new(None),
            state: Mutex::new(None),
            events: EventQueue::new(),
        })
    }

    fn state_snapshot(&self) -> Option<LabState> {
        self.state.lock().expect("lab state lock poisoned").clone()
    }

    fn set_status(&self, status: LabStatus) {
        let mut state = self.state.lock().expect("lab state lock poisoned");
        if let Some(state) = state.as_mut() {
            state.status = status;
        }
    }
}

/// Everything the spawn and delete coroutines need, shared with the manager.
struct LabContext {
    config: LabConfig,
    builder: LabBuilder,
    storage: Arc<LabStorage>,
    metadata: Arc<MetadataStorage>,
    alerts: AlertSink,
    /// Signaled whenever a spawn monitor finishes, waking the reaper.
    spawner_done: Notify,
}

/// Manage user labs.
///
/// Keeps the process-local map from usernames to lab state, monitors, and
/// event queues, and owns the spawn/delete state machine for each user.
pub struct LabManager {
    ctx: Arc<LabContext>,
    image_service: Arc<ImageService>,
    labs: Mutex<HashMap<String, Arc<UserLab>>>,
}

impl LabManager {
    pub fn new(
        config: LabConfig,
        builder: LabBuilder,
        storage: Arc<LabStorage>,
        metadata: Arc<MetadataStorage>,
        image_service: Arc<ImageService>,
        alerts: AlertSink,
    ) -> Self {
        LabManager {
            ctx: Arc::new(LabContext {
                config,
                builder,
                storage,
                metadata,
                alerts,
                spawner_done: Notify::new(),
            }),
            image_service,
            labs: Mutex::new(HashMap::new()),
        }
    }

    /// Start spawning a lab for a user.
    ///
    /// Returns as soon as the spawn has been handed to the user's monitor;
    /// progress is reported through the user's event stream.
    pub async fn create_lab(&self, user: &GafaelfawrUser, spec: &LabSpecification) -> Result<()> {
        spec.validate_env()?;
        let username = &user.info.username;
        let lab = self.ensure_lab(username);

        // Determine the image to use for the lab.
        let image = match spec.options.image_selector()? {
            ImageSelector::Reference(reference) => {
                let reference = DockerReference::from_str(&reference)?;
                self.image_service.image_for_reference(&reference).await?
            }
            ImageSelector::Class(class) => self.image_service.image_for_class(class)?,
            ImageSelector::Tag(tag) => self.image_service.image_for_tag_name(&tag).await?,
        };

        // Determine the resources, rejecting the spawn if the user's quota
        // does not cover the requested size.
        let size = self.ctx.config.get_size_definition(spec.options.size)?;
        if let Some(quota) = user.info.quota.as_ref().and_then(|q| q.notebook) {
            if quota.memory_bytes() < size.memory_bytes()? || quota.cpu < size.cpu {
                return Err(ControllerError::InsufficientQuota);
            }
        }
        let resources = size.to_lab_resources()?;

        // If a lab exists but is no longer running, delete it first as part
        // of the spawn.
        let current = self.get_lab_state(username).await?;
        let delete_first = current.map(|state| !state.is_running()).unwrap_or(false);

        // The conflict and existence checks must be atomic with starting
        // the operation, so they happen under the slot lock.
        let mut slot = lab.slot.lock().await;
        if let Some(running) = slot.as_ref() {
            warn!(user = username.as_str(), operation = %running.operation, "Operation in progress");
            return Err(ControllerError::OperationConflict {
                username: username.clone(),
                operation: running.operation.to_string(),
            });
        }
        if lab.state_snapshot().is_some() && !delete_first {
            warn!(user = username.as_str(), "Lab already exists");
            return Err(ControllerError::LabExists(username.clone()));
        }

        lab.events.clear();
        let state =
            LabState::from_request(&user.info, spec, resources, image.reference_with_digest());
        *lab.state.lock().expect("lab state lock poisoned") = Some(state);

        let timeout = Timeout::new("lab spawn", self.ctx.config.spawn_timeout(), Some(username));
        let coroutine = spawn_lab(
            Arc::clone(&self.ctx),
            Arc::clone(&lab),
            user.clone(),
            spec.clone(),
            image,
            delete_first,
            timeout.clone(),
        );
        *slot = Some(start_operation(
            Arc::clone(&self.ctx),
            Arc::clone(&lab),
            LabOperation::Spawn,
            coroutine,
            timeout,
        ));
        Ok(())
    }

    /// Delete the lab environment for a user.
    ///
    /// May be called multiple times concurrently; every caller waits for
    /// the same underlying operation and sees the same outcome. A delete
    /// submitted while a spawn is in progress aborts the spawn first.
    pub async fn delete_lab(&self, username: &str) -> Result<()> {
        let lab = self.get_lab(username)?;
        if lab.state_snapshot().is_none() {
            return Err(ControllerError::UnknownUser(username.to_string()));
        }

        let mut slot = lab.slot.lock().await;
        match slot.as_ref().map(|op| op.operation) {
            Some(LabOperation::Delete) => {
                // Join the deletion already in progress.
                let complete = slot.as_ref().expect("slot occupied").complete.clone();
                drop(slot);
                complete.cancelled().await;
                self.finalize(&lab).await;
            }
            other => {
                if other == Some(LabOperation::Spawn) {
                    let operation = slot.take().expect("slot occupied");
                    cancel_operation(&lab, operation).await;
                }

                // A delete may have finished while we were cancelling and
                // removed the lab state out from under us.
                if lab.state_snapshot().is_none() {
                    return Err(ControllerError::UnknownUser(username.to_string()));
                }

                lab.events.clear();
                {
                    let mut state = lab.state.lock().expect("lab state lock poisoned");
                    if let Some(state) = state.as_mut() {
                        state.status = LabStatus::Terminating;
                        state.internal_url = None;
                    }
                }
                let timeout =
                    Timeout::new("lab delete", self.ctx.config.spawn_timeout(), Some(username));
                let coroutine =
                    delete_lab_objects(Arc::clone(&self.ctx), Arc::clone(&lab), 25, 100, timeout.clone());
                let operation = start_operation(
                    Arc::clone(&self.ctx),
                    Arc::clone(&lab),
                    LabOperation::Delete,
                    coroutine,
                    timeout,
                );
                let complete = operation.complete.clone();
                *slot = Some(operation);
                drop(slot);
                complete.cancelled().await;
                self.finalize(&lab).await;
            }
        }

        match lab.state_snapshot() {
            Some(state) if state.status == LabStatus::Terminated => {
                *lab.state.lock().expect("lab state lock poisoned") = None;
                Ok(())
            }
            // Another waiter already collected the terminated state.
            None => Ok(()),
            Some(_) => Err(ControllerError::LabDeletionFailed(username.to_string())),
        }
    }

    /// Stream of events for a user's current or most recent operation.
    pub fn events_for_user(&self, username: &str) -> Result<impl Stream<Item = Event> + Send + 'static + use<>> {
        let lab = self.get_lab(username)?;
        Ok(lab.events.stream())
    }

    /// Get lab state for a user, verified against the lab pod's phase.
    ///
    /// JupyterHub polls this to track whether the lab still exists, so we
    /// check the pod each time rather than waiting for reconciliation: labs
    /// are killed behind our back by evictions and the OOM killer.
    pub async fn get_lab_state(&self, username: &str) -> Result<Option<LabState>> {
        let lab = {
            let labs = self.labs.lock().expect("lab map lock poisoned");
            match labs.get(username) {
                Some(lab) => Arc::clone(lab),
                None => return Ok(None),
            }
        };
        let Some(state) = lab.state_snapshot() else {
            return Ok(None);
        };

        let names = self.ctx.builder.build_object_names(username);
        let timeout = Timeout::new("read pod phase", KUBERNETES_REQUEST_TIMEOUT, Some(username));
        let phase = match self.ctx.storage.read_pod_phase(&names, &timeout).await {
            Ok(phase) => phase,
            Err(error) => {
                error!(
                    user = username,
                    name = names.pod.as_str(),
                    namespace = names.namespace.as_str(),
                    error = %error,
                    "Cannot get pod phase"
                );
                self.ctx.alerts.post_error(&error, Some(username)).await;

                // Optimistically return the in-memory state: reconciliation
                // runs continuously, and telling JupyterHub to go ahead and
                // send the user to the lab is the more useful failure mode.
                return Ok(Some(state));
            }
        };

        let status = match phase {
            None => LabStatus::Failed,
            Some(phase) if state.status == LabStatus::Running => LabStatus::from_phase(phase),
            _ => state.status,
        };
        if status != state.status {
            lab.set_status(status);
        }
        let mut state = state;
        state.status = status;
        Ok(Some(state))
    }

    /// Usernames with labs, optionally restricted to running labs.
    pub fn list_lab_users(&self, only_running: bool) -> Vec<String> {
        let labs = self.labs.lock().expect("lab map lock poisoned");
        let mut users: Vec<String> = labs
            .iter()
            .filter(|(_, lab)| match lab.state_snapshot() {
                Some(state) => !only_running || state.status == LabStatus::Running,
                None => false,
            })
            .map(|(username, _)| username.clone())
            .collect();
        users.sort();
        users
    }

    /// Reconcile the in-memory lab map against Kubernetes.
    ///
    /// Run at startup to rebuild state and then periodically, since labs
    /// can be destroyed by node upgrades and operators.
    pub async fn reconcile(&self) -> Result<()> {
        info!("Reconciling user lab state with Kubernetes");
        let known_users: HashSet<String> = {
            let labs = self.labs.lock().expect("lab map lock poisoned");
            labs.keys().cloned().collect()
        };

        let observed = self.gather_current_state().await?;

        // If the set of users changed while we were scanning Kubernetes,
        // another request arrived mid-pass. Play it safe and skip this
        // cycle; the next one will catch up.
        {
            let labs = self.labs.lock().expect("lab map lock poisoned");
            let current: HashSet<String> = labs.keys().cloned().collect();
            if current != known_users {
                info!("Known users changed during reconciliation, skipping");
                return Ok(());
            }
        }

        let mut to_monitor = self.reconcile_known_users(&observed).await;

        // Create records for users only seen in Kubernetes, the normal case
        // after a controller restart.
        for (username, state) in &observed {
            if known_users.contains(username) {
                continue;
            }
            info!(user = username.as_str(), "Creating record for user from Kubernetes");
            let lab = self.ensure_lab(username);
            *lab.state.lock().expect("lab state lock poisoned") = Some(state.clone());
            if state.status == LabStatus::Pending {
                to_monitor.insert(username.clone());
            }
        }

        let mut to_monitor: Vec<String> = to_monitor.into_iter().collect();
        to_monitor.sort();
        for username in to_monitor {
            self.monitor_pending_spawn(&username).await;
        }

        self.delete_completed_labs().await;
        Ok(())
    }

    /// Wait for spawner monitor tasks to complete and finalize them.
    ///
    /// Spawns are not awaited by their initiating request the way deletes
    /// are, so something has to join those tasks and catch panics. Every
    /// spawn monitor signals an event on completion, which triggers a
    /// reaper pass without busy-waiting.
    pub async fn reap_spawners(&self) {
        loop {
            self.ctx.spawner_done.notified().await;
            let labs: Vec<Arc<UserLab>> = {
                let labs = self.labs.lock().expect("lab map lock poisoned");
                labs.values().cloned().collect()
            };
            for lab in labs {
                self.finalize(&lab).await;
            }
        }
    }

    /// Cancel all in-flight operations, for process shutdown.
    pub async fn stop(&self) {
        let labs: Vec<Arc<UserLab>> = {
            let mut labs = self.labs.lock().expect("lab map lock poisoned");
            labs.drain().map(|(_, lab)| lab).collect()
        };
        for lab in labs {
            let mut slot = lab.slot.lock().await;
            if let Some(operation) = slot.take() {
                cancel_operation(&lab, operation).await;
            }
        }
    }

    fn ensure_lab(&self, username: &str) -> Arc<UserLab> {
        let mut labs = self.labs.lock().expect("lab map lock poisoned");
        Arc::clone(labs.entry(username.to_string()).or_insert_with(|| UserLab::new(username)))
    }

    fn get_lab(&self, username: &str) -> Result<Arc<UserLab>> {
        let labs = self.labs.lock().expect("lab map lock poisoned");
        labs.get(username)
            .cloned()
            .ok_or_else(|| ControllerError::UnknownUser(username.to_string()))
    }

    /// Collect a finished operation from a lab's slot, if any.
    ///
    /// An operation is collectable once it has signaled completion; the
    /// monitor task may still be in its last few instructions, which the
    /// join absorbs.
    async fn finalize(&self, lab: &Arc<UserLab>) {
        let mut slot = lab.slot.lock().await;
        let finished = slot
            .as_ref()
            .map(|op| op.complete.is_cancelled() || op.handle.is_finished())
            .unwrap_or(false);
        if !finished {
            return;
        }
        let operation = slot.take().expect("slot occupied");
        if let Err(error) = operation.handle.await {
            if error.is_panic() {
                error!(user = lab.username.as_str(), "Uncaught panic in monitor task");
                lab.set_status(LabStatus::Failed);
            }
        }
    }

    /// Gather lab state from extant Kubernetes namespaces, deleting
    /// malformed namespaces nobody is operating on.
    async fn gather_current_state(&self) -> Result<HashMap<String, LabState>> {
        let prefix = self.ctx.builder.namespace_prefix();
        let timeout = || Timeout::new("reconcile labs", KUBERNETES_REQUEST_TIMEOUT, None);

        let namespaces = self.ctx.storage.list_namespaces(&prefix, &timeout()).await?;
        let mut observed = HashMap::new();
        for namespace in namespaces {
            let username = namespace[prefix.len()..].to_string();
            let names = self.ctx.builder.build_object_names(&username);
            let objects = self.ctx.storage.read_lab_objects(&names, &timeout()).await?;
            let state = self.ctx.builder.recreate_lab_state(&username, objects.as_ref());

            match state {
                Some(state) => {
                    observed.insert(username, state);
                }
                None => {
                    // Only delete malformed namespaces with no operation in
                    // progress; check immediately before deleting since the
                    // reads above yielded control.
                    let in_progress = match self.labs.lock().expect("lab map lock poisoned").get(&username) {
                        Some(lab) => lab.slot.try_lock().map(|slot| slot.is_some()).unwrap_or(true),
                        None => false,
                    };
                    if !in_progress {
                        warn!(user = username.as_str(), namespace = namespace.as_str(), "Deleting incomplete namespace");
                        let delete_timeout =
                            Timeout::new("delete namespace", self.ctx.config.spawn_timeout(), None);
                        self.ctx.storage.delete_namespace(&namespace, &delete_timeout).await?;
                    }
                }
            }
        }
        Ok(observed)
    }

    /// First reconciliation pass: correct recorded state for known users.
    async fn reconcile_known_users(&self, observed: &HashMap<String, LabState>) -> HashSet<String> {
        let labs: Vec<Arc<UserLab>> = {
            let labs = self.labs.lock().expect("lab map lock poisoned");
            labs.values().cloned().collect()
        };
        let mut to_monitor = HashSet::new();
        for lab in labs {
            let in_progress = lab.slot.try_lock().map(|slot| slot.is_some()).unwrap_or(true);
            if in_progress {
                continue;
            }
            let Some(state) = lab.state_snapshot() else { continue };
            if state.status == LabStatus::Failed {
                continue;
            }
            match observed.get(&lab.username) {
                None => {
                    warn!(user = lab.username.as_str(), "Expected user not found in Kubernetes");
                    lab.set_status(LabStatus::Failed);
                }
                Some(observed_state) if observed_state.status != state.status => {
                    warn!(
                        user = lab.username.as_str(),
                        expected = %state.status,
                        observed = %observed_state.status,
                        "Observed status does not match expected status"
                    );
                    lab.set_status(observed_state.status);

                    // A pod unexpectedly in pending state needs a monitor
                    // to wait for it and handle timeouts.
                    if observed_state.status == LabStatus::Pending {
                        to_monitor.insert(lab.username.clone());
                    }
                }
                Some(_) => (),
            }
        }
        to_monitor
    }

    /// Start watching an in-progress spawn we did not start ourselves, such
    /// as after a controller restart.
    async fn monitor_pending_spawn(&self, username: &str) {
        let Ok(lab) = self.get_lab(username) else { return };
        let mut slot = lab.slot.lock().await;

        // If we raced with a real operation, it has richer context; let it
        // win silently.
        if slot.is_some() || lab.state_snapshot().is_none() {
            return;
        }
        lab.events.clear();
        let msg = format!("Monitoring in-progress lab creation for {username}");
        lab.events.put(Event::info(msg, 1));
        let timeout = Timeout::new("lab spawn", self.ctx.config.spawn_timeout(), Some(username));
        let coroutine = watch_lab_spawn(Arc::clone(&self.ctx), Arc::clone(&lab), timeout.clone());
        *slot = Some(start_operation(
            Arc::clone(&self.ctx),
            Arc::clone(&lab),
            LabOperation::Spawn,
            coroutine,
            timeout,
        ));
    }

    /// Clean up all labs that have stopped running, as long as the user has
    /// not already started a new operation.
    async fn delete_completed_labs(&self) {
        let usernames: Vec<String> = {
            let labs = self.labs.lock().expect("lab map lock poisoned");
            labs.keys().cloned().collect()
        };
        for username in usernames {
            let Ok(lab) = self.get_lab(&username) else { continue };
            let has_operation = lab.slot.try_lock().map(|slot| slot.is_some()).unwrap_or(true);
            let stopped =
                lab.state_snapshot().map(|state| !state.is_running()).unwrap_or(false);
            if stopped && !has_operation {
                if let Err(error) = self.delete_lab(&username).await {
                    if !matches!(error, ControllerError::UnknownUser(_)) {
                        warn!(user = username.as_str(), error = %error, "Cleanup of stopped lab failed");
                    }
                }
            }
        }
    }
}

/// Start a monitored operation on a user's lab.
///
/// The monitor task enforces the operation timeout, translates failures
/// into terminal events and a failed status, closes the event stream, and
/// signals completion.
fn start_operation(
    ctx: Arc<LabContext>,
    lab: Arc<UserLab>,
    operation: LabOperation,
    coroutine: impl std::future::Future<Output = Result<()>> + Send + 'static,
    timeout: Timeout,
) -> RunningOperation {
    let complete = CancellationToken::new();
    let monitor_complete = complete.clone();
    let handle = tokio::spawn(async move {
        let result = timeout.enforce(coroutine).await;
        match result {
            Ok(()) => (),
            Err(ControllerError::Timeout(error)) => {
                let msg = format!(
                    "Lab {operation} timed out after {}s",
                    error.failed_at.signed_duration_since(error.started_at).num_seconds()
                );
                error!(user = lab.username.as_str(), "{msg}");
                ctx.alerts.post_error(&error.clone().into(), Some(&lab.username)).await;
                lab.events.put(Event::failed(msg));
                lab.set_status(LabStatus::Failed);
            }
            Err(error) => {
                error!(user = lab.username.as_str(), error = %error, "Lab {operation} failed");
                ctx.alerts.post_error(&error, Some(&lab.username)).await;
                lab.events.put(Event::error(error.to_string()));
                lab.events.put(Event::failed(format!("Lab {operation} failed")));
                lab.set_status(LabStatus::Failed);
            }
        }
        lab.events.close();
        monitor_complete.cancel();
        if operation == LabOperation::Spawn {
            ctx.spawner_done.notify_one();
        }
    });
    RunningOperation { operation, handle, complete }
}

/// Abort an in-flight operation, pushing a failure into its event stream.
///
/// Whatever Kubernetes state the operation leaves behind is detected and
/// cleaned up by reconciliation.
async fn cancel_operation(lab: &Arc<UserLab>, operation: RunningOperation) {
    if !operation.handle.is_finished() {
        lab.events.put(Event::failed("Operation aborted"));
    }
    operation.handle.abort();
    match operation.handle.await {
        Ok(()) => (),
        Err(error) if error.is_cancelled() => (),
        Err(_) => error!(user = lab.username.as_str(), "Uncaught panic in monitor task"),
    }
    lab.events.close();
    operation.complete.cancel();
}

/// Progress advance rule for spawn events: move a third of the way closer
/// to 75% each time, since we never know how many startup events to expect.
fn next_progress(progress: u8) -> u8 {
    progress + (75 - progress) / 3
}

/// The spawn coroutine: create everything a lab needs and wait for the pod
/// to start, reporting progress along the way.
async fn spawn_lab(
    ctx: Arc<LabContext>,
    lab: Arc<UserLab>,
    user: GafaelfawrUser,
    spec: LabSpecification,
    image: RspImage,
    delete_first: bool,
    timeout: Timeout,
) -> Result<()> {
    let username = user.info.username.clone();
    lab.events.put(Event::info(format!("Starting lab creation for {username}"), 1));

    if delete_first {
        info!(user = username.as_str(), "Deleting existing failed lab");
        let msg = format!("Deleting existing failed lab for {username}");
        lab.events.put(Event::info(msg, 2));
        delete_lab_objects(Arc::clone(&ctx), Arc::clone(&lab), 5, 20, timeout.clone()).await?;
        info!(user = username.as_str(), "Lab deleted");
    }

    info!(user = username.as_str(), "Retrieving secret data");
    let secret_data = gather_secret_data(&ctx, &user, &timeout).await?;
    let mut pull_secret = None;
    if let Some(name) = &ctx.config.pull_secret {
        let namespace = ctx.metadata.namespace();
        pull_secret = Some(ctx.storage.read_secret(name, namespace, &timeout).await?);
    }

    let objects =
        ctx.builder.build_lab(&user.info, &spec, &image, secret_data, pull_secret.as_ref())?;
    let internal_url = ctx.builder.build_internal_url(
        &username,
        &spec.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    );
    info!(user = username.as_str(), "Creating new lab");
    ctx.storage.create(&objects, &timeout).await?;
    lab.events.put(Event::info("Created Kubernetes objects for user lab", 30));
    {
        let mut state = lab.state.lock().expect("lab state lock poisoned");
        if let Some(state) = state.as_mut() {
            state.internal_url = internal_url;
        }
    }

    watch_lab_spawn(ctx, lab, timeout).await
}

/// Wait for a lab pod to start while streaming its Kubernetes events into
/// the user's event queue.
///
/// Normally the tail of `spawn_lab`, but also run on its own when
/// reconciliation finds a lab mid-spawn.
async fn watch_lab_spawn(ctx: Arc<LabContext>, lab: Arc<UserLab>, timeout: Timeout) -> Result<()> {
    let username = lab.username.clone();
    let names = ctx.builder.build_object_names(&username);

    // Event watching is best-effort: progress reporting should never be
    // able to break a spawn.
    let events = lab.events.clone();
    let stream = ctx.storage.watch_pod_events(&names, &timeout);
    let watcher = tokio::spawn(async move {
        let mut progress = 35;
        let mut stream = std::pin::pin!(stream);
        while let Some(message) = stream.next().await {
            debug!(progress, message = message.as_str(), "Spawning event");
            events.put(Event::info(message, progress));
            progress = next_progress(progress);
        }
    });

    let result = ctx.storage.wait_for_pod_start(&names, &timeout).await;
    watcher.abort();
    let _ = watcher.await;
    result?;

    lab.set_status(LabStatus::Running);
    info!(user = username.as_str(), "Lab created");
    lab.events.put(Event::complete(format!("Lab Kubernetes pod started for {username}")));
    Ok(())
}

/// The delete coroutine: stop the pod, then remove the namespace and wait
/// for it to go away.
async fn delete_lab_objects(
    ctx: Arc<LabContext>,
    lab: Arc<UserLab>,
    start_progress: u8,
    end_progress: u8,
    timeout: Timeout,
) -> Result<()> {
    let username = lab.username.clone();
    let names = ctx.builder.build_object_names(&username);

    let mut progress = start_progress;
    lab.events.put(Event::info("Shutting down Kubernetes pod", progress));
    ctx.storage.delete_pod(&names, &timeout).await?;

    progress += (end_progress - start_progress) / 2;
    lab.events.put(Event::info("Deleting user namespace", progress));
    ctx.storage.delete_namespace(&names.namespace, &timeout).await?;

    info!(user = username.as_str(), "Lab deleted");
    lab.events.put(Event::info(format!("Lab for {username} deleted"), end_progress));
    lab.set_status(LabStatus::Terminated);
    Ok(())
}

/// Assemble the data for the user's lab secret from the configured source
/// secrets, plus the user's own token under the reserved `token` key.
async fn gather_secret_data(
    ctx: &LabContext,
    user: &GafaelfawrUser,
    timeout: &Timeout,
) -> Result<BTreeMap<String, ByteString>> {
    let namespace = ctx.metadata.namespace();
    let names: HashSet<&String> = ctx.config.secrets.iter().map(|s| &s.secret_name).collect();
    let mut secrets: HashMap<&String, Secret> = HashMap::new();
    for name in names {
        secrets.insert(name, ctx.storage.read_secret(name, namespace, timeout).await?);
    }

    let mut data = BTreeMap::new();
    for spec in &ctx.config.secrets {
        let secret = secrets.get(&spec.secret_name).expect("secret read above");
        let value = secret
            .data
            .as_ref()
            .and_then(|data| data.get(&spec.secret_key))
            .ok_or_else(|| ControllerError::MissingSecret {
                name: spec.secret_name.clone(),
                namespace: namespace.to_string(),
                key: Some(spec.secret_key.clone()),
            })?;
        // Duplicate keys are rejected at configuration parse time.
        data.insert(spec.secret_key.clone(), value.clone());
    }
    data.insert("token".to_string(), ByteString(user.token.clone().into_bytes()));
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    use crate::models::lab::{
        EventType, LabOptions, LabResources, LabSize, ResourceQuantity, UserInfo,
    };

    fn test_context() -> Arc<LabContext> {
        let yaml = r#"
baseUrl: "https://data.example.org"
lab:
  sizes:
    - size: medium
      cpu: 2.0
      memory: 4GiB
images:
  source:
    registry: lighthouse.ceres
    repository: library/sketchbook
fileserver:
  enabled: false
"#;
        let config = crate::config::Config::from_yaml(yaml).unwrap();
        let kube_config = kube::Config::new("http://127.0.0.1:8080".parse().unwrap());
        let client = kube::Client::try_from(kube_config).unwrap();
        Arc::new(LabContext {
            config: config.lab.clone(),
            builder: LabBuilder::new(config.lab.clone(), &config.base_url),
            storage: Arc::new(LabStorage::new(client)),
            metadata: Arc::new(MetadataStorage::new("/nonexistent")),
            alerts: AlertSink::disabled(),
            spawner_done: Notify::new(),
        })
    }

    fn test_lab() -> Arc<UserLab> {
        let lab = UserLab::new("rachel");
        let state = LabState {
            user: UserInfo {
                username: "rachel".to_string(),
                name: None,
                uid: 1101,
                gid: 1101,
                groups: Vec::new(),
                quota: None,
            },
            options: LabOptions {
                image: "lighthouse.ceres/library/sketchbook:w_2077_43@sha256:1234".to_string(),
                size: LabSize::Medium,
                enable_debug: false,
                reset_user_env: false,
            },
            status: LabStatus::Pending,
            internal_url: None,
            resources: LabResources {
                limits: ResourceQuantity { cpu: 2.0, memory: 4 << 30 },
                requests: ResourceQuantity { cpu: 0.5, memory: 1 << 30 },
            },
            quota: None,
        };
        *lab.state.lock().unwrap() = Some(state);
        lab
    }

    #[tokio::test]
    async fn test_monitor_success_closes_stream() {
        let ctx = test_context();
        let lab = test_lab();
        let events = lab.events.clone();
        events.put(Event::info("starting", 1));
        let timeout = Timeout::new("lab spawn", Duration::from_secs(5), Some("rachel"));
        let lab_events = Arc::clone(&lab);
        let operation = start_operation(
            ctx,
            Arc::clone(&lab),
            LabOperation::Spawn,
            async move {
                lab_events.events.put(Event::complete("done"));
                Ok(())
            },
            timeout,
        );
        operation.complete.cancelled().await;
        let seen: Vec<Event> = events.stream().collect().await;
        assert_eq!(seen.last().unwrap().event_type, EventType::Complete);
    }

    #[tokio::test]
    async fn test_monitor_failure_emits_error_and_failed() {
        let ctx = test_context();
        let lab = test_lab();
        let events = lab.events.clone();
        let timeout = Timeout::new("lab spawn", Duration::from_secs(5), Some("rachel"));
        let operation = start_operation(
            ctx,
            Arc::clone(&lab),
            LabOperation::Spawn,
            async { Err(ControllerError::UnknownDockerImage("w_2077_43".to_string())) },
            timeout,
        );
        operation.complete.cancelled().await;

        let seen: Vec<Event> = events.stream().collect().await;
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].event_type, EventType::Error);
        assert_eq!(seen[1].event_type, EventType::Failed);
        assert_eq!(seen[1].message, "Lab spawn failed");
        assert_eq!(lab.state_snapshot().unwrap().status, LabStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_timeout() {
        let ctx = test_context();
        let lab = test_lab();
        let events = lab.events.clone();
        let timeout = Timeout::new("lab spawn", Duration::from_millis(50), Some("rachel"));
        let operation = start_operation(
            ctx,
            Arc::clone(&lab),
            LabOperation::Spawn,
            async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            },
            timeout,
        );
        operation.complete.cancelled().await;

        let seen: Vec<Event> = events.stream().collect().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event_type, EventType::Failed);
        assert!(seen[0].message.contains("timed out"));
        assert_eq!(lab.state_snapshot().unwrap().status, LabStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_operation() {
        let ctx = test_context();
        let lab = test_lab();
        let events = lab.events.clone();
        let timeout = Timeout::new("lab spawn", Duration::from_secs(3600), Some("rachel"));
        let operation = start_operation(
            ctx,
            Arc::clone(&lab),
            LabOperation::Spawn,
            async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            },
            timeout,
        );
        assert!(!operation.handle.is_finished());
        cancel_operation(&lab, operation).await;

        let seen: Vec<Event> = events.stream().collect().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event_type, EventType::Failed);
        assert_eq!(seen[0].message, "Operation aborted");
    }

    #[test]
    fn test_next_progress() {
        // Same advance rule as kubespawner: one third of the remaining
        // distance to 75% per event.
        let mut progress = 35;
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(progress);
            progress = next_progress(progress);
        }
        assert_eq!(seen, [35, 48, 57, 63, 67, 69]);
        assert!(seen.iter().all(|p| *p <= 75));
    }

    #[test]
    fn test_operation_display() {
        assert_eq!(LabOperation::Spawn.to_string(), "spawn");
        assert_eq!(LabOperation::Delete.to_string(), "delete");
    }
}
