use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use tokio::signal;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::sync::mpsc;

use kubefs::cli::{self, Cli};
use kubefs::config::{self, ConfigStore};
use kubefs::fs::tree::{self, CLUSTERWIDE, Tree};
use kubefs::fs::{KubeFs, mount};
use kubefs::watch::supervisor::Supervisor;
use kubefs::{cluster, logging};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path =
        cli::resolve_config_path(&cli.config).context("failed to resolve config path")?;
    let cfg = config::load(&config_path).context("failed to load config")?;
    logging::init(&cfg.log_level);

    let store = Arc::new(ConfigStore::new(cfg));
    let client = cluster::connect().await?;

    let tree = Arc::new(Tree::new());
    tree.ensure_namespace(CLUSTERWIDE, true);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let projector = tokio::spawn(tree::run_projector(tree.clone(), store.clone(), events_rx));

    let supervisor = Arc::new(Supervisor::new(client.clone(), store.clone(), events_tx));
    let supervisor_task = tokio::spawn(supervisor.clone().run());

    let config_watcher = {
        let store = store.clone();
        let tree = tree.clone();
        let supervisor = supervisor.clone();
        config::watch::spawn(config_path.clone(), store.clone(), move || {
            tree.prune(&store.get());
            supervisor.poke();
        })
    };
    let config_watcher = match config_watcher {
        Ok(handle) => Some(handle),
        Err(err) => {
            error!("Failed to start config watcher: {err:?}");
            None
        }
    };

    let fs = KubeFs::new(client, store, tree);
    let mut mount_handle = mount::mount_kubefs(fs, &cli.mountpoint)
        .await
        .with_context(|| format!("failed to mount on {}", cli.mountpoint.display()))?;
    info!("Mounted on {}", cli.mountpoint.display());

    let mut sigterm =
        unix_signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let handle = &mut mount_handle;
    let unmount_needed = tokio::select! {
        res = handle => {
            res.context("filesystem session ended")?;
            false
        }
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, unmounting");
            true
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, unmounting");
            true
        }
    };

    if let Some(watcher) = config_watcher {
        watcher.stop().await;
    }
    supervisor.begin_shutdown();
    let _ = supervisor_task.await;
    let _ = projector.await;

    if unmount_needed {
        mount_handle.unmount().await.context("unmount failed")?;
    }
    info!("Unmounted");
    Ok(())
}
