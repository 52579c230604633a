//! Utilities shared across the substrate: retry/backoff policy, the module
//! manifest, the session registry file and system configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::meta::AvailableModule;
use crate::{Error, Result};

/// Growth curve for bounded retry loops (arena attach, queue waits).
///
/// Replaces hand-rolled busy-wait loops: callers iterate over `delays()` and
/// give up when the iterator is exhausted.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            factor: 2.0,
            max_delay: Duration::from_secs(1),
            max_retries: 10,
        }
    }
}

impl BackoffPolicy {
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut current = self.initial;
        (0..self.max_retries).map(move |_| {
            let d = current;
            let next = current.as_secs_f64() * self.factor;
            current = Duration::from_secs_f64(next).min(self.max_delay);
            d
        })
    }
}

/// Parse a module manifest: one module per line, `name category description`.
///
/// Hubs scan this at startup to learn which module binaries they can spawn.
/// Malformed lines are skipped with a warning.
pub fn scan_manifest(path: &Path, hub: i32) -> Result<HashMap<String, AvailableModule>> {
    let text = std::fs::read_to_string(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut modules = HashMap::new();

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.splitn(3, char::is_whitespace);
        let (name, category) = match (fields.next(), fields.next()) {
            (Some(n), Some(c)) => (n, c),
            _ => {
                tracing::warn!(
                    "manifest {}: skipping malformed line {}",
                    path.display(),
                    lineno + 1
                );
                continue;
            }
        };
        let description = fields.next().unwrap_or("").trim().to_string();
        modules.insert(
            name.to_string(),
            AvailableModule {
                hub,
                name: name.to_string(),
                path: dir.join(name).to_string_lossy().into_owned(),
                category: category.to_string(),
                description,
            },
        );
    }

    tracing::debug!("scanned {} modules from {}", modules.len(), path.display());
    Ok(modules)
}

fn sessions_file() -> PathBuf {
    std::env::temp_dir().join("parvis_sessions")
}

/// Record a live session id so crashed sessions can be cleaned up later.
pub fn register_session(name: &str) -> Result<()> {
    let mut sessions = list_sessions()?;
    if !sessions.iter().any(|s| s == name) {
        sessions.push(name.to_string());
        std::fs::write(sessions_file(), sessions.join("\n"))?;
    }
    Ok(())
}

/// Remove a session id from the registry once its arenas are gone.
pub fn unregister_session(name: &str) -> Result<()> {
    let sessions: Vec<String> = list_sessions()?
        .into_iter()
        .filter(|s| s != name)
        .collect();
    std::fs::write(sessions_file(), sessions.join("\n"))?;
    Ok(())
}

/// Enumerate live session ids. Missing registry means no sessions.
pub fn list_sessions() -> Result<Vec<String>> {
    match std::fs::read_to_string(sessions_file()) {
        Ok(text) => Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Process-wide tunables, loadable from a small TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Initial size of a session arena segment.
    pub arena_segment_size: usize,
    /// Capacity of per-module message queues before senders block.
    pub queue_capacity: usize,
    /// How long the barrier coordinator waits before declaring a
    /// participant lost.
    pub barrier_timeout_ms: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            arena_segment_size: 64 * 1024 * 1024,
            queue_capacity: 256,
            barrier_timeout_ms: 30_000,
        }
    }
}

impl SystemConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            factor: 10.0,
            max_delay: Duration::from_secs(2),
            max_retries: 4,
        };
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(delays.len(), 4);
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_secs(1));
        assert_eq!(delays[2], Duration::from_secs(2));
        assert_eq!(delays[3], Duration::from_secs(2));
    }

    #[test]
    fn manifest_scan_skips_malformed_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "IsoSurface map extract an isosurface").unwrap();
        writeln!(file, "broken").unwrap();
        writeln!(file, "ReadFoam read OpenFOAM reader").unwrap();
        file.flush().unwrap();

        let modules = scan_manifest(file.path(), 1).unwrap();
        assert_eq!(modules.len(), 2);
        let iso = &modules["IsoSurface"];
        assert_eq!(iso.category, "map");
        assert_eq!(iso.description, "extract an isosurface");
        assert_eq!(iso.hub, 1);
        assert!(iso.path.ends_with("IsoSurface"));
    }

    #[test]
    fn config_roundtrip() {
        let config = SystemConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: SystemConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.queue_capacity, config.queue_capacity);
    }
}
