//! Session configuration.

use std::path::Path;

use miette::Result;
use serde::{Deserialize, Serialize};

use larder_scheduler::ReconcileConfig;
use larder_sync::SyncConfig;

/// Default number of recipes per feed page.
pub const DEFAULT_FEED_PAGE_SIZE: u32 = 20;

/// Everything a session needs to know about timing and sizing.
///
/// Engine settings sit at the top level, reconciliation under `reconcile`:
///
/// ```json
/// {
///   "coalesce_window_ms": 250,
///   "staleness": { "recipe_secs": 60 },
///   "reconcile": { "stagger_ms": 300, "window_size": 12 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LarderConfig {
    #[serde(flatten)]
    pub sync: SyncConfig,
    pub reconcile: ReconcileConfig,
    pub feed_page_size: u32,
}

impl Default for LarderConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            reconcile: ReconcileConfig::default(),
            feed_page_size: DEFAULT_FEED_PAGE_SIZE,
        }
    }
}

impl LarderConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| miette::miette!("invalid config: {}", e))
    }

    /// Load a JSON config file.
    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| miette::miette!("failed to read config {}: {}", path.display(), e))?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(LarderConfig::from_json("{}").unwrap(), LarderConfig::default());
    }

    #[test]
    fn test_nested_sections() {
        let config = LarderConfig::from_json(
            r#"{
                "coalesce_window_ms": 100,
                "realtime": { "max_backoff_secs": 10 },
                "reconcile": { "window_size": 6 },
                "feed_page_size": 50
            }"#,
        )
        .unwrap();
        assert_eq!(config.sync.coalesce_window(), Duration::from_millis(100));
        assert_eq!(config.sync.realtime.max_backoff(), Duration::from_secs(10));
        assert_eq!(config.reconcile.window_size, 6);
        assert_eq!(config.reconcile.stagger_ms, 300);
        assert_eq!(config.feed_page_size, 50);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(LarderConfig::from_json(r#"{ "feed_page_size": "many" }"#).is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("larder.json");
        std::fs::write(&path, r#"{ "gc_grace_secs": 5 }"#).unwrap();

        let config = LarderConfig::load(&path).await.unwrap();
        assert_eq!(config.sync.gc_grace(), Duration::from_secs(5));

        assert!(LarderConfig::load(&dir.path().join("missing.json")).await.is_err());
    }
}
