//! Filesystem materialization of deployed functions
//!
//! The database is the record of truth; the functions directory is a cache
//! the edge runtime hot-reloads from. The function store never touches the
//! disk itself. It hands a [`SyncTask`] to a background worker through a
//! [`SyncHandle`] and moves on. Every failure in here is logged and
//! swallowed.

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::functions::FunctionFile;

#[derive(Debug)]
pub enum SyncTask {
    Materialize { name: String, files: Vec<FunctionFile> },
    Remove { name: String },
    /// Acknowledged once every task queued before it has been applied
    Flush(oneshot::Sender<()>),
}

/// Sending side of the sync worker. Cheap to clone; a disabled handle drops
/// every task.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    tx: Option<mpsc::UnboundedSender<SyncTask>>,
}

impl SyncHandle {
    /// Handle for installs without a functions directory
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn materialize(&self, name: &str, files: Vec<FunctionFile>) {
        self.submit(SyncTask::Materialize {
            name: name.to_string(),
            files,
        });
    }

    pub fn remove(&self, name: &str) {
        self.submit(SyncTask::Remove { name: name.to_string() });
    }

    /// Wait until all previously submitted tasks are applied
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.submit(SyncTask::Flush(ack_tx)) {
            let _ = ack_rx.await;
        }
    }

    fn submit(&self, task: SyncTask) -> bool {
        let Some(tx) = &self.tx else {
            debug!("Filesystem sync disabled, dropping task");
            return false;
        };
        if tx.send(task).is_err() {
            warn!("Filesystem sync worker has stopped, task dropped");
            return false;
        }
        true
    }
}

#[derive(Serialize)]
struct ReloadNotice<'a> {
    function: &'a str,
    action: &'a str,
}

/// Writes function sources under `root/<function name>/`
pub struct FilesystemSync {
    root: PathBuf,
    reload_url: Option<String>,
    client: reqwest::Client,
}

impl FilesystemSync {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            reload_url: None,
            client: reqwest::Client::new(),
        }
    }

    /// Notify `url` after each applied task
    pub fn with_reload_url(mut self, url: Option<String>) -> Self {
        self.reload_url = url;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start the worker. It runs until every [`SyncHandle`] is dropped.
    pub fn spawn(self) -> (SyncHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(self.run(rx));
        (SyncHandle { tx: Some(tx) }, worker)
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<SyncTask>) {
        info!(root = %self.root.display(), "Filesystem sync worker started");
        while let Some(task) = rx.recv().await {
            match task {
                SyncTask::Materialize { name, files } => {
                    self.materialize(&name, &files).await;
                    self.signal_reload(&name, "materialize").await;
                }
                SyncTask::Remove { name } => {
                    self.remove(&name).await;
                    self.signal_reload(&name, "remove").await;
                }
                SyncTask::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        debug!("Filesystem sync worker stopped");
    }

    /// Write every file into the function directory, overwriting same-named files
    pub async fn materialize(&self, name: &str, files: &[FunctionFile]) {
        match self.try_materialize(name, files).await {
            Ok(()) => info!(function = name, files = files.len(), "Function materialized"),
            Err(e) => warn!(function = name, error = %e, "Failed to materialize function"),
        }
    }

    /// Delete the function directory recursively
    pub async fn remove(&self, name: &str) {
        let dir = self.root.join(name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => info!(function = name, "Function directory removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(function = name, "Function directory already absent")
            }
            Err(e) => warn!(function = name, error = %e, "Failed to remove function directory"),
        }
    }

    async fn try_materialize(&self, name: &str, files: &[FunctionFile]) -> io::Result<()> {
        let dir = self.root.join(name);
        tokio::fs::create_dir_all(&dir).await?;

        for file in files {
            let path = dir.join(&file.name);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, file.content.as_bytes()).await?;
        }
        Ok(())
    }

    async fn signal_reload(&self, name: &str, action: &str) {
        let Some(url) = &self.reload_url else {
            return;
        };

        let result = self
            .client
            .post(url)
            .json(&ReloadNotice { function: name, action })
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => debug!(function = name, "Runtime reload signalled"),
            Ok(resp) => warn!(function = name, status = %resp.status(), "Runtime rejected reload signal"),
            Err(e) => warn!(function = name, error = %e.without_url(), "Failed to signal runtime reload"),
        }
    }
}
