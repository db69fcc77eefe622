//! Groups file watcher for hot re-publish.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::group::GroupsFile;
use crate::config::loader::load_groups_file;

/// Monitors a groups file and emits every version that loads cleanly.
pub struct GroupsFileWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<GroupsFile>,
}

impl GroupsFileWatcher {
    /// Returns the watcher and a receiver for parsed updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<GroupsFile>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx;
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    tracing::info!(path = ?path, "Groups file change detected, reloading");
                    match load_groups_file(&path) {
                        Ok(groups) => {
                            let _ = tx.send(groups);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to reload groups file, keeping published groups");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Groups file watcher started");
        Ok(watcher)
    }
}
