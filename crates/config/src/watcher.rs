use crate::schema::Config;
use arc_swap::ArcSwap;
use std::{path::PathBuf, sync::Arc, sync::mpsc};
use vkgate_types::GateError;

/// Live configuration shared by the router and the reconcile loop.
///
/// Readers hold an `Arc<ArcSwap<Config>>` and pick up a new snapshot on their
/// next load; a file that fails to parse or validate never replaces the
/// running configuration.
pub struct ConfigWatcher {
    current: Arc<ArcSwap<Config>>,
    /// `None` when running on defaults and `VKGATE_*` variables only.
    path: Option<PathBuf>,
}

impl ConfigWatcher {
    /// Loads and validates the initial configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Config`] if the file cannot be parsed or a value
    /// fails [`Config::validate`].
    pub fn new(path: Option<PathBuf>) -> Result<Self, GateError> {
        let config = Self::read(path.as_ref())?;
        Ok(Self {
            current: Arc::new(ArcSwap::from_pointee(config)),
            path,
        })
    }

    fn read(path: Option<&PathBuf>) -> Result<Config, GateError> {
        let config = Config::load(path.map(PathBuf::as_path))
            .map_err(|e| GateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn load(&self) -> arc_swap::Guard<Arc<Config>> {
        self.current.load()
    }

    /// Handle for the router and provisioner.
    #[must_use]
    pub fn arc(&self) -> Arc<ArcSwap<Config>> {
        Arc::clone(&self.current)
    }

    /// Re-reads the file and swaps it in if it is valid.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Config`] and keeps the running configuration when
    /// the file is unreadable or invalid.
    pub fn reload(&self) -> Result<(), GateError> {
        let next = Arc::new(Self::read(self.path.as_ref())?);
        let prev = self.current.swap(Arc::clone(&next));
        tracing::info!(
            batch_limit = next.provisioner.batch_limit,
            interval_secs = next.provisioner.interval_secs,
            tiers_changed = prev.router.tiers != next.router.tiers,
            "configuration reloaded"
        );
        Ok(())
    }

    /// Reloads on every change to the file until the process exits.
    ///
    /// Editors often emit several events per save; a burst is applied once.
    /// Without a file there is nothing to watch.
    pub fn watch(self: Arc<Self>) {
        use notify::{RecursiveMode, Watcher as _};
        let Some(path) = self.path.clone() else {
            return;
        };

        tokio::task::spawn_blocking(move || {
            let (tx, rx) = mpsc::channel();
            let mut watcher =
                match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                    if res.is_ok() {
                        let _ = tx.send(());
                    }
                }) {
                    Ok(w) => w,
                    Err(e) => {
                        tracing::error!(error = %e, "config watcher unavailable; hot reload off");
                        return;
                    }
                };
            if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
                tracing::error!(path = %path.display(), error = %e, "cannot watch config file");
                return;
            }

            while rx.recv().is_ok() {
                while rx.try_recv().is_ok() {}
                if let Err(e) = self.reload() {
                    tracing::warn!(error = %e, "keeping previous configuration");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watcher_on(dir: &tempfile::TempDir, yaml: &str) -> (ConfigWatcher, PathBuf) {
        let path = dir.path().join("vkgate.yaml");
        std::fs::write(&path, yaml).unwrap();
        (ConfigWatcher::new(Some(path.clone())).unwrap(), path)
    }

    #[test]
    fn test_initial_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, _) = watcher_on(&dir, "provisioner:\n  batch_limit: 11\n");
        assert_eq!(watcher.load().provisioner.batch_limit, 11);
    }

    #[test]
    fn test_initial_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vkgate.yaml");
        std::fs::write(&path, "provisioner:\n  stale_claim_secs: 5\n").unwrap();
        assert!(matches!(
            ConfigWatcher::new(Some(path)),
            Err(GateError::Config(_))
        ));
    }

    #[test]
    fn test_reload_reaches_shared_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, path) = watcher_on(&dir, "provisioner:\n  interval_secs: 30\n");
        let shared = watcher.arc();

        std::fs::write(&path, "provisioner:\n  interval_secs: 5\n").unwrap();
        watcher.reload().unwrap();
        assert_eq!(shared.load().provisioner.interval_secs, 5);
    }

    #[test]
    fn test_invalid_reload_keeps_running_config() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, path) = watcher_on(&dir, "provisioner:\n  batch_limit: 20\n");

        std::fs::write(&path, "provisioner:\n  batch_limit: 0\n").unwrap();
        assert!(watcher.reload().is_err());
        std::fs::write(&path, "provisioner: [not, a, map]\n").unwrap();
        assert!(watcher.reload().is_err());
        assert_eq!(watcher.load().provisioner.batch_limit, 20);
    }

    #[test]
    fn test_without_file_uses_defaults() {
        let watcher = ConfigWatcher::new(None).unwrap();
        assert_eq!(watcher.load().provisioner.stale_claim_secs, 300);
        Arc::new(watcher).watch();
    }
}
