//! Configuration hot reload
//!
//! Polls the config file's modification time. A changed file that still
//! validates yields its rule sets; anything else keeps the running ones.

use crate::commands::config;
use dpishift_core::config::{EngineConfig, RuleSet};
use std::path::PathBuf;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Watches one configuration file
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    modified: Option<SystemTime>,
    engine: EngineConfig,
}

impl ConfigWatcher {
    /// Start watching `path`. `engine` is the running engine configuration;
    /// changes to it cannot be applied live and are only reported.
    pub fn new(path: PathBuf, engine: EngineConfig) -> Self {
        let modified = modified(&path);
        Self {
            path,
            modified,
            engine,
        }
    }

    /// The rule sets of the file if it changed since the last poll
    pub fn poll(&mut self) -> Option<Vec<RuleSet>> {
        let Some(current) = modified(&self.path) else {
            debug!(path = %self.path.display(), "config file unreadable, keeping rule sets");
            return None;
        };
        if self.modified == Some(current) {
            return None;
        }
        self.modified = Some(current);

        match config::load(&self.path) {
            Ok(config) => {
                if config.engine != self.engine {
                    warn!("[engine] settings changed; restart to apply them");
                }
                Some(config.sets)
            }
            Err(e) => {
                warn!(error = format!("{e:#}"), "ignoring invalid configuration");
                None
            }
        }
    }
}

fn modified(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    /// Rewrite `path` with a distinct, later modification time
    fn rewrite(path: &std::path::Path, content: &str, bump: u64) {
        std::fs::write(path, content).unwrap();
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(bump))
            .unwrap();
    }

    const ONE_SET: &str = "[[sets]]\nid = \"a\"\n[sets.targets]\nsni_domains = [\"example.com\"]\n";

    #[test]
    fn test_unchanged_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dpishift.toml");
        rewrite(&path, ONE_SET, 0);

        let mut watcher = ConfigWatcher::new(path, EngineConfig::default());
        assert!(watcher.poll().is_none());
        assert!(watcher.poll().is_none());
    }

    #[test]
    fn test_changed_file_yields_sets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dpishift.toml");
        rewrite(&path, "", 0);
        let mut watcher = ConfigWatcher::new(path.clone(), EngineConfig::default());

        rewrite(&path, ONE_SET, 10);
        let sets = watcher.poll().unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].id, "a");
        assert!(watcher.poll().is_none());
    }

    #[test]
    fn test_invalid_file_keeps_running_sets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dpishift.toml");
        rewrite(&path, ONE_SET, 0);
        let mut watcher = ConfigWatcher::new(path.clone(), EngineConfig::default());

        rewrite(&path, "[[sets]]\nid = \"a\"\n[sets.targets]\nip = [\"10.0.0.0/33\"]\n", 10);
        assert!(watcher.poll().is_none());
        // Not retried until the file changes again
        assert!(watcher.poll().is_none());

        rewrite(&path, ONE_SET, 20);
        assert!(watcher.poll().is_some());
    }

    #[test]
    fn test_missing_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dpishift.toml");
        rewrite(&path, ONE_SET, 0);
        let mut watcher = ConfigWatcher::new(path.clone(), EngineConfig::default());

        std::fs::remove_file(&path).unwrap();
        assert!(watcher.poll().is_none());
    }
}
