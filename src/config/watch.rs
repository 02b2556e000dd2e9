//! Hot reload of the config document.
//!
//! The containing directory is watched (editors replace files rather than
//! write in place, so watching the file itself misses renames); any
//! create/modify/remove event on the exact path triggers a reload. A reload
//! that fails to parse keeps the previous config.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{ConfigStore, load};
use crate::logging;

/// Keeps the watcher alive; dropping it without [`stop`](Self::stop) leaks
/// the reload task.
pub struct ConfigWatcherHandle {
    _watcher: RecommendedWatcher,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ConfigWatcherHandle {
    pub async fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.task.await;
    }
}

/// Watch `path` and swap the store on every relevant change. `on_reload`
/// runs after the swap so it observes the new config.
pub fn spawn<F>(path: PathBuf, store: Arc<ConfigStore>, on_reload: F) -> Result<ConfigWatcherHandle>
where
    F: Fn() + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::channel::<()>(8);
    let watched_path = path.clone();
    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| {
            let Ok(event) = result else {
                return;
            };
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                return;
            }
            if event.paths.iter().any(|p| p == &watched_path) {
                let _ = tx.try_send(());
            }
        },
        notify::Config::default(),
    )
    .context("failed to create config watcher")?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch config directory {}", dir.display()))?;

    let (stop_tx, mut stop_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                event = rx.recv() => {
                    if event.is_none() {
                        break;
                    }
                    match load(&path) {
                        Ok(cfg) => {
                            logging::apply_level(&cfg.log_level);
                            store.set(cfg);
                            info!("Reloaded config from {}", path.display());
                            on_reload();
                        }
                        Err(err) => {
                            // Keep the previous config.
                            warn!("Failed to reload config from {}: {err:?}", path.display());
                        }
                    }
                }
            }
        }
        debug!("Config watcher stopped");
    });

    Ok(ConfigWatcherHandle {
        _watcher: watcher,
        stop: stop_tx,
        task,
    })
}
