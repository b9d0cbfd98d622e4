//! Scheduler types.

use std::fmt;
use std::ops::Range;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use larder_sync::EntityValue;

/// Reconciliation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Delay between consecutive refreshes of one pass.
    pub stagger_ms: u64,
    /// Number of items around the focus position that count as visible.
    pub window_size: usize,
    /// Refresh period while a view has focus.
    pub period_secs: u64,
    /// Also refresh visible snapshots that are past their staleness bound.
    pub refresh_stale: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            stagger_ms: 300,
            window_size: 12,
            period_secs: 30,
            refresh_stale: true,
        }
    }
}

impl ReconcileConfig {
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

/// What started a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    FocusGained,
    VisibleSetChanged,
    Periodic,
    /// The realtime channel came back after a drop.
    Reconnect,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::FocusGained => "focus_gained",
            Trigger::VisibleSetChanged => "visible_set_changed",
            Trigger::Periodic => "periodic",
            Trigger::Reconnect => "reconnect",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides whether a cached value likely needs a correction fetch.
pub trait CorrectionPredicate: Send + Sync {
    fn needs_correction(&self, value: &EntityValue) -> bool;
}

impl<F> CorrectionPredicate for F
where
    F: Fn(&EntityValue) -> bool + Send + Sync,
{
    fn needs_correction(&self, value: &EntityValue) -> bool {
        self(value)
    }
}

/// Treats a counter of exactly zero as under-reported.
///
/// Aggregate feed queries drop counter columns and the backend fills them
/// with zero, so a zero is more often missing data than a real count.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroCounterPredicate;

impl CorrectionPredicate for ZeroCounterPredicate {
    fn needs_correction(&self, value: &EntityValue) -> bool {
        match value {
            EntityValue::Recipe(r) => r.like_count == 0 || r.save_count == 0 || r.comment_count == 0,
            EntityValue::Profile(p) => p.follower_count == 0,
            EntityValue::CommentThread(t) => t.comment_count == 0,
            EntityValue::FollowEdge(_) | EntityValue::PantryItem(_) => false,
        }
    }
}

/// Index range of the `size` items around `focus` in a list of `len`.
///
/// The window is centred on `focus` and shifted inward at either end of the
/// list, so it always covers `min(size, len)` items.
pub fn visible_window(len: usize, focus: usize, size: usize) -> Range<usize> {
    let focus = focus.min(len.saturating_sub(1));
    let start = focus.saturating_sub(size / 2);
    let end = (start + size).min(len);
    let start = end.saturating_sub(size);
    start..end
}

#[cfg(test)]
mod tests {
    use super::*;
    use larder_sync::testing;
    use proptest::prelude::*;

    #[test]
    fn test_zero_counter_predicate() {
        let predicate = ZeroCounterPredicate;

        let mut value = testing::recipe("r1", "chef", 0);
        assert!(predicate.needs_correction(&value));

        if let EntityValue::Recipe(r) = &mut value {
            r.like_count = 3;
            r.save_count = 1;
            r.comment_count = 2;
        }
        assert!(!predicate.needs_correction(&value));

        assert!(predicate.needs_correction(&testing::profile("p1", 0, 5)));
        assert!(!predicate.needs_correction(&testing::profile("p1", 2, 0)));
    }

    #[test]
    fn test_closure_predicate() {
        let only_recipes = |v: &EntityValue| v.as_recipe().is_some();
        assert!(only_recipes.needs_correction(&testing::recipe("r1", "chef", 9)));
        assert!(!only_recipes.needs_correction(&testing::profile("p1", 0, 0)));
    }

    #[test]
    fn test_window_edges() {
        assert_eq!(visible_window(30, 0, 12), 0..12);
        assert_eq!(visible_window(30, 15, 12), 9..21);
        assert_eq!(visible_window(30, 29, 12), 18..30);
        assert_eq!(visible_window(5, 2, 12), 0..5);
        assert_eq!(visible_window(0, 0, 12), 0..0);
        // Focus past the end clamps to the last item
        assert_eq!(visible_window(20, 100, 4), 16..20);
    }

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: ReconcileConfig = serde_json::from_str(r#"{ "stagger_ms": 50 }"#).unwrap();
        assert_eq!(config.stagger(), Duration::from_millis(50));
        assert_eq!(config.window_size, 12);
        assert_eq!(config.period(), Duration::from_secs(30));
    }

    proptest! {
        #[test]
        fn prop_window_is_bounded(len in 0usize..200, focus in 0usize..250, size in 0usize..40) {
            let window = visible_window(len, focus, size);
            prop_assert!(window.start <= window.end);
            prop_assert!(window.end <= len);
            prop_assert_eq!(window.len(), size.min(len));
        }

        #[test]
        fn prop_window_contains_focus(len in 1usize..200, focus in 0usize..200, size in 1usize..40) {
            let focus = focus % len;
            let window = visible_window(len, focus, size);
            prop_assert!(window.contains(&focus));
        }
    }
}
