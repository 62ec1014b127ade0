//! Reload triggers (config file watcher, SIGHUP) and the reload step itself

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::Result;
use crate::logging::LogHandle;
use crate::proxy::ProxyServer;

const DEBOUNCE: Duration = Duration::from_millis(200);

/// Re-read `path` and apply it to the logger and the server.
///
/// A file that fails to parse leaves the running configuration untouched.
pub fn reload_config(
    path: &Path,
    server: &mut ProxyServer,
    logging: Option<&LogHandle>,
) -> Result<()> {
    let config = match Config::from_file(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Config reload failed: invalid config file");
            return Err(e);
        }
    };

    if let Some(logging) = logging {
        if let Err(e) = logging.apply(&config.logging) {
            tracing::error!(error = %e, "Failed to apply logging settings");
        }
    }

    server.apply_config(&config)?;
    tracing::info!(path = %path.display(), "Config reloaded");
    Ok(())
}

/// Spawn a background thread that watches a config file for changes and sends
/// reload triggers with 200ms debouncing.
pub fn spawn_file_watcher(config_path: PathBuf, reload_tx: mpsc::Sender<()>) {
    std::thread::spawn(move || {
        use notify::{EventKind, RecursiveMode, Watcher};

        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher = match notify::recommended_watcher(tx) {
            Ok(w) => w,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create config file watcher");
                return;
            }
        };

        // Watch the parent directory to catch write-to-tmp + rename saves
        let watch_dir = match config_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
            tracing::error!(
                error = %e,
                path = %watch_dir.display(),
                "Failed to watch config directory"
            );
            return;
        }

        tracing::debug!(path = %config_path.display(), "Watching config file for changes");

        let config_filename = config_path.file_name().map(|f| f.to_owned());

        loop {
            match rx.recv() {
                Ok(Ok(event)) => {
                    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        continue;
                    }

                    let is_our_file = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == config_filename.as_deref());
                    if !is_our_file {
                        continue;
                    }

                    while rx.recv_timeout(DEBOUNCE).is_ok() {}

                    tracing::debug!("Config file change detected, triggering reload");
                    if reload_tx.blocking_send(()).is_err() {
                        break; // server shut down
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Config file watcher error");
                }
                Err(_) => break,
            }
        }
    });
}

/// Spawn a SIGHUP handler that triggers config reloads.
#[cfg(unix)]
pub fn spawn_sighup_handler(reload_tx: mpsc::Sender<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGHUP handler");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            tracing::info!("Received SIGHUP, triggering config reload");
            if reload_tx.send(()).await.is_err() {
                break;
            }
        }
    });
}
