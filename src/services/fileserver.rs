use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;

use crate::alerts::AlertSink;
use crate::builder::fileserver::FileserverBuilder;
use crate::config::FileserverConfig;
use crate::constants::KUBERNETES_REQUEST_TIMEOUT;
use crate::errors::{ControllerError, Result};
use crate::kubernetes::fileserver::FileserverStorage;
use crate::models::kubernetes::PodPhase;
use crate::models::lab::UserInfo;
use crate::timeout::Timeout;

#[derive(Default)]
struct UserFileserver {
    running: bool,
}

/// State of one user's file server, with a lock serializing operations.
struct FileserverEntry {
    state: Mutex<UserFileserver>,
    lock: tokio::sync::Mutex<()>,
}

impl FileserverEntry {
    fn new(running: bool) -> Arc<Self> {
        Arc::new(FileserverEntry {
            state: Mutex::new(UserFileserver { running }),
            lock: tokio::sync::Mutex::new(()),
        })
    }

    fn running(&self) -> bool {
        self.state.lock().expect("file server state lock poisoned").running
    }

    fn set_running(&self, running: bool) {
        self.state.lock().expect("file server state lock poisoned").running = running;
    }
}

/// Manage user file servers.
///
/// Unlike labs, file servers are not normally explicitly shut down: each
/// one has an internal idle timeout and exits on its own. A background
/// watch notices exited servers and reaps their objects.
pub struct FileserverManager {
    config: FileserverConfig,
    builder: FileserverBuilder,
    storage: Arc<FileserverStorage>,
    alerts: AlertSink,
    servers: Mutex<HashMap<String, Arc<FileserverEntry>>>,
}

impl FileserverManager {
    pub fn new(
        config: FileserverConfig,
        builder: FileserverBuilder,
        storage: Arc<FileserverStorage>,
        alerts: AlertSink,
    ) -> Result<Self> {
        if !config.enabled {
            return Err(ControllerError::NotConfigured);
        }
        Ok(FileserverManager {
            config,
            builder,
            storage,
            alerts,
            servers: Mutex::new(HashMap::new()),
        })
    }

    /// Ensure a file server exists for the given user.
    ///
    /// Called whenever the user hits the file-server ingress: if a server
    /// is already running this does nothing. On failure or timeout, any
    /// remnants are cleaned up before the error propagates.
    pub async fn create(&self, user: &UserInfo) -> Result<()> {
        let username = &user.username;
        info!(user = username.as_str(), "File server requested");
        let entry = self.ensure_entry(username, false);
        let _guard = entry.lock.lock().await;
        if entry.running() {
            return Ok(());
        }

        let timeout =
            Timeout::new("file server creation", self.config.creation_timeout(), Some(username));
        let objects = self.builder.build(user)?;
        info!(user = username.as_str(), "Creating new file server");
        let result = timeout
            .enforce(self.storage.create(&self.config.namespace, &objects, &timeout))
            .await;
        match result {
            Ok(()) => {
                entry.set_running(true);
                Ok(())
            }
            Err(error) => {
                error!(user = username.as_str(), error = %error, "File server creation failed");
                if !matches!(error, ControllerError::Timeout(_)) {
                    self.alerts.post_error(&error, Some(username)).await;
                }
                info!(user = username.as_str(), "Cleaning up orphaned file server objects");
                self.delete_file_server(username).await?;
                Err(error)
            }
        }
    }

    /// Delete the file server for a user.
    pub async fn delete(&self, username: &str) -> Result<()> {
        let entry = {
            let servers = self.servers.lock().expect("file server map lock poisoned");
            servers
                .get(username)
                .cloned()
                .ok_or_else(|| ControllerError::UnknownUser(username.to_string()))?
        };
        let _guard = entry.lock.lock().await;
        if !entry.running() {
            return Err(ControllerError::UnknownUser(username.to_string()));
        }
        self.delete_file_server(username).await?;
        entry.set_running(false);
        Ok(())
    }

    /// Users with running file servers.
    pub fn list(&self) -> Vec<String> {
        let servers = self.servers.lock().expect("file server map lock poisoned");
        let mut users: Vec<String> = servers
            .iter()
            .filter(|(_, entry)| entry.running())
            .map(|(username, _)| username.clone())
            .collect();
        users.sort();
        users
    }

    pub fn running(&self, username: &str) -> bool {
        let servers = self.servers.lock().expect("file server map lock poisoned");
        servers.get(username).map(|entry| entry.running()).unwrap_or(false)
    }

    /// Verify the file server namespace exists; run once before the
    /// background tasks start so a misconfigured deployment fails fast.
    pub async fn validate_namespace(&self) -> Result<()> {
        let timeout = Timeout::new("read namespace", KUBERNETES_REQUEST_TIMEOUT, None);
        if !self.storage.namespace_exists(&self.config.namespace, &timeout).await? {
            return Err(ControllerError::MissingObject {
                kind: "Namespace".to_string(),
                name: self.config.namespace.clone(),
            });
        }
        Ok(())
    }

    /// Reconcile the in-memory map against the file server objects found in
    /// Kubernetes.
    pub async fn reconcile(&self) -> Result<()> {
        debug!("Reconciling file server state");
        let timeout = Timeout::new("reconcile file servers", KUBERNETES_REQUEST_TIMEOUT, None);
        let observed =
            self.storage.read_fileserver_state(&self.config.namespace, &timeout).await?;
        let mapped: Vec<String> = {
            let servers = self.servers.lock().expect("file server map lock poisoned");
            servers.keys().cloned().collect()
        };

        // Anything found in Kubernetes that is not fully running gets its
        // objects deleted.
        let mut valid_users = Vec::new();
        for (username, state) in &observed {
            let valid = self.builder.is_valid(username, state);
            self.ensure_entry(username, valid);
            if valid {
                valid_users.push(username.clone());
            } else {
                info!(user = username.as_str(), "File server present but not running, deleting");
                let name = self.builder.build_name(username);
                let timeout = Timeout::new(
                    "delete file server",
                    self.config.delete_timeout(),
                    Some(username),
                );
                self.storage.delete(&name, &self.config.namespace, username, &timeout).await?;
            }
        }

        // Users we thought were running but whose objects are gone may
        // still have stragglers; run a full delete to be sure.
        for username in mapped {
            if valid_users.contains(&username) || observed.contains_key(&username) {
                continue;
            }
            if !self.running(&username) {
                continue;
            }
            warn!(user = username.as_str(), "Removing broken file server for user");
            if let Err(error) = self.delete(&username).await {
                warn!(user = username.as_str(), error = %error, "Cleanup of file server failed");
            }
        }
        debug!("File server reconciliation complete");
        Ok(())
    }

    /// Watch for exited file server pods and reap them.
    ///
    /// Runs forever. A pod reaching Succeeded or Failed means its idle
    /// timeout expired (or it crashed); either way its objects get deleted.
    /// Watch errors are reported and the watch restarts after a pause.
    pub async fn watch_servers(&self) {
        loop {
            let mut stream = std::pin::pin!(self.storage.watch_pods(&self.config.namespace));
            while let Some(change) = stream.next().await {
                match change {
                    Ok(change) => {
                        if !matches!(change.phase, PodPhase::Succeeded | PodPhase::Failed) {
                            continue;
                        }
                        let Some(username) = self.builder.username_for_pod(&change.pod) else {
                            continue;
                        };
                        info!(
                            user = username.as_str(),
                            phase = %change.phase,
                            "File server exited, cleaning up"
                        );
                        match self.delete(&username).await {
                            Ok(()) | Err(ControllerError::UnknownUser(_)) => (),
                            Err(error) => {
                                error!(user = username.as_str(), error = %error, "Error deleting file server");
                                self.alerts.post_error(&error, Some(&username)).await;
                            }
                        }
                    }
                    Err(error) => {
                        error!(error = %error, "Error watching file server pod phase");
                        self.alerts.post_error(&error, None).await;
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        break;
                    }
                }
            }
        }
    }

    async fn delete_file_server(&self, username: &str) -> Result<()> {
        let name = self.builder.build_name(username);
        let timeout =
            Timeout::new("file server deletion", self.config.delete_timeout(), Some(username));
        let result = self
            .storage
            .delete(&name, &self.config.namespace, username, &timeout)
            .await;
        if let Err(error) = &result {
            error!(user = username, error = %error, "Error deleting file server");
            if !matches!(error, ControllerError::Timeout(_)) {
                self.alerts.post_error(error, Some(username)).await;
            }
        }
        result
    }

    fn ensure_entry(&self, username: &str, running: bool) -> Arc<FileserverEntry> {
        let mut servers = self.servers.lock().expect("file server map lock poisoned");
        Arc::clone(
            servers
                .entry(username.to_string())
                .or_insert_with(|| FileserverEntry::new(running)),
        )
    }
}
