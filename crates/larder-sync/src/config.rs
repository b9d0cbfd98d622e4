//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::EntityKind;

/// Configuration for the sync engine.
///
/// All fields have defaults, so a partial JSON document is enough:
///
/// ```json
/// { "coalesce_window_ms": 400, "staleness": { "recipe_secs": 90 } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Freshness bounds per entity kind.
    pub staleness: StalenessPolicy,

    /// How long the first toggle of a burst waits for further toggles
    /// before issuing the remote call.
    pub coalesce_window_ms: u64,

    /// Extra time past `stale_after` an unreferenced snapshot is kept
    /// before garbage collection evicts it.
    pub gc_grace_secs: u64,

    /// Realtime change feed settings.
    pub realtime: RealtimeConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            staleness: StalenessPolicy::default(),
            coalesce_window_ms: 250,
            gc_grace_secs: 300,
            realtime: RealtimeConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn gc_grace(&self) -> Duration {
        Duration::from_secs(self.gc_grace_secs)
    }
}

/// How long a snapshot stays fresh, by kind and by whether the viewer owns it.
///
/// Owned entities go stale sooner: the viewer is the one most likely to
/// notice a wrong counter on their own recipe or profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StalenessPolicy {
    pub recipe_secs: u64,
    pub recipe_owned_secs: u64,
    pub profile_secs: u64,
    pub profile_owned_secs: u64,
    pub follow_edge_secs: u64,
    pub pantry_item_secs: u64,
    pub comment_thread_secs: u64,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self {
            recipe_secs: 60,
            recipe_owned_secs: 15,
            profile_secs: 120,
            profile_owned_secs: 30,
            follow_edge_secs: 300,
            pantry_item_secs: 30,
            comment_thread_secs: 30,
        }
    }
}

impl StalenessPolicy {
    /// Staleness bound for an entity of `kind`.
    pub fn stale_after(&self, kind: EntityKind, owned: bool) -> Duration {
        let secs = match (kind, owned) {
            (EntityKind::Recipe, true) => self.recipe_owned_secs,
            (EntityKind::Recipe, false) => self.recipe_secs,
            (EntityKind::Profile, true) => self.profile_owned_secs,
            (EntityKind::Profile, false) => self.profile_secs,
            (EntityKind::FollowEdge, _) => self.follow_edge_secs,
            (EntityKind::PantryItem, _) => self.pantry_item_secs,
            (EntityKind::CommentThread, _) => self.comment_thread_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Realtime bridge connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// First reconnect delay.
    pub initial_backoff_ms: u64,
    /// Reconnect delay cap.
    pub max_backoff_secs: u64,
    /// Drop the connection when nothing (not even a heartbeat) arrives for this long.
    pub read_timeout_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_secs: 60,
            read_timeout_secs: 90,
        }
    }
}

impl RealtimeConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{ "coalesce_window_ms": 400, "staleness": { "recipe_secs": 90 } }"#)
                .unwrap();
        assert_eq!(config.coalesce_window(), Duration::from_millis(400));
        assert_eq!(config.staleness.recipe_secs, 90);
        assert_eq!(config.staleness.profile_secs, 120);
        assert_eq!(config.realtime, RealtimeConfig::default());
    }

    #[test]
    fn test_owned_entities_stale_sooner() {
        let policy = StalenessPolicy::default();
        assert!(
            policy.stale_after(EntityKind::Recipe, true) < policy.stale_after(EntityKind::Recipe, false)
        );
        assert_eq!(
            policy.stale_after(EntityKind::FollowEdge, true),
            policy.stale_after(EntityKind::FollowEdge, false)
        );
    }
}
