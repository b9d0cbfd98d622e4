//! View consistency mapper.
//!
//! Tracks which cache keys each mounted view renders, so a change to one
//! logical entity can fan out to every copy currently on screen.

use std::collections::HashMap;
use std::fmt;

use dashmap::DashMap;
use tracing::trace;

use crate::{CacheKey, EntityRef};

/// Identifier of one mounted view instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(String);

impl ViewId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ViewId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One cache key rendered by one view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewRegistration {
    pub cache_key: CacheKey,
    pub subscriber_id: ViewId,
}

/// Registry of mounted views and the keys they render.
#[derive(Default)]
pub struct ViewConsistencyMapper {
    /// Keys per view, in render order.
    views: DashMap<ViewId, Vec<CacheKey>>,
    /// Reverse index: entity -> rendering keys with their registration counts.
    renderers: DashMap<EntityRef, HashMap<CacheKey, usize>>,
}

impl ViewConsistencyMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a view with its keys in render order.
    ///
    /// Mounting an id that is already mounted replaces its keys.
    pub fn mount(&self, view: ViewId, keys: Vec<CacheKey>) {
        self.unmount(&view);
        for key in &keys {
            self.index(key);
        }
        trace!(view = %view, keys = keys.len(), "mapper: view mounted");
        self.views.insert(view, keys);
    }

    /// Add keys to the end of a mounted view (pagination). Keys the view
    /// already renders are skipped. Returns false if the view is not mounted.
    pub fn append(&self, view: &ViewId, keys: Vec<CacheKey>) -> bool {
        let Some(mut existing) = self.views.get_mut(view) else {
            return false;
        };
        for key in keys {
            if existing.contains(&key) {
                continue;
            }
            self.index(&key);
            existing.push(key);
        }
        true
    }

    /// Remove a view. Returns the keys it rendered.
    pub fn unmount(&self, view: &ViewId) -> Vec<CacheKey> {
        let Some((_, keys)) = self.views.remove(view) else {
            return Vec::new();
        };
        for key in &keys {
            self.unindex(key);
        }
        trace!(view = %view, keys = keys.len(), "mapper: view unmounted");
        keys
    }

    fn index(&self, key: &CacheKey) {
        *self
            .renderers
            .entry(key.entity())
            .or_default()
            .entry(key.clone())
            .or_insert(0) += 1;
    }

    fn unindex(&self, key: &CacheKey) {
        let entity = key.entity();
        let now_empty = match self.renderers.get_mut(&entity) {
            Some(mut keys) => {
                if let Some(count) = keys.get_mut(key) {
                    *count -= 1;
                    if *count == 0 {
                        keys.remove(key);
                    }
                }
                keys.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.renderers.remove_if(&entity, |_, keys| keys.is_empty());
        }
    }

    /// Every cache key currently rendering `entity`, sorted.
    pub fn keys_for(&self, entity: &EntityRef) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .renderers
            .get(entity)
            .map(|keys| keys.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn is_mounted(&self, view: &ViewId) -> bool {
        self.views.contains_key(view)
    }

    /// Whether any mounted view renders `key`.
    pub fn is_referenced(&self, key: &CacheKey) -> bool {
        self.renderers
            .get(&key.entity())
            .map(|keys| keys.contains_key(key))
            .unwrap_or(false)
    }

    /// Keys of one view in render order.
    pub fn view_keys(&self, view: &ViewId) -> Vec<CacheKey> {
        self.views.get(view).map(|keys| keys.clone()).unwrap_or_default()
    }

    /// Every key rendered by any view, sorted and deduplicated.
    pub fn visible_keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .renderers
            .iter()
            .flat_map(|r| r.value().keys().cloned().collect::<Vec<_>>())
            .collect();
        keys.sort();
        keys
    }

    /// Mounted view ids, sorted.
    pub fn view_ids(&self) -> Vec<ViewId> {
        let mut ids: Vec<ViewId> = self.views.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    /// All registrations of one view.
    pub fn registrations(&self, view: &ViewId) -> Vec<ViewRegistration> {
        self.view_keys(view)
            .into_iter()
            .map(|cache_key| ViewRegistration {
                cache_key,
                subscriber_id: view.clone(),
            })
            .collect()
    }

    pub fn clear(&self) {
        self.views.clear();
        self.renderers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntityKind, ViewContext};

    fn feed_key(id: &str) -> CacheKey {
        CacheKey::recipe(id).in_context(ViewContext::Feed)
    }

    fn detail_key(id: &str) -> CacheKey {
        CacheKey::recipe(id).in_context(ViewContext::Detail)
    }

    #[test]
    fn test_keys_for_spans_views() {
        let mapper = ViewConsistencyMapper::new();
        mapper.mount("feed".into(), vec![feed_key("r1"), feed_key("r2")]);
        mapper.mount("detail".into(), vec![detail_key("r1")]);

        let keys = mapper.keys_for(&EntityRef::new(EntityKind::Recipe, "r1"));
        assert_eq!(keys, vec![feed_key("r1"), detail_key("r1")]);
    }

    #[test]
    fn test_shared_key_counted_per_view() {
        let mapper = ViewConsistencyMapper::new();
        mapper.mount("a".into(), vec![feed_key("r1")]);
        mapper.mount("b".into(), vec![feed_key("r1")]);

        mapper.unmount(&"a".into());
        assert!(mapper.is_referenced(&feed_key("r1")));

        mapper.unmount(&"b".into());
        assert!(!mapper.is_referenced(&feed_key("r1")));
        assert!(mapper.keys_for(&EntityRef::new(EntityKind::Recipe, "r1")).is_empty());
    }

    #[test]
    fn test_append_keeps_order_and_skips_duplicates() {
        let mapper = ViewConsistencyMapper::new();
        let view = ViewId::from("feed");
        mapper.mount(view.clone(), vec![feed_key("r1")]);
        assert!(mapper.append(&view, vec![feed_key("r2"), feed_key("r1"), feed_key("r3")]));

        assert_eq!(mapper.view_keys(&view), vec![feed_key("r1"), feed_key("r2"), feed_key("r3")]);
        assert!(!mapper.append(&"missing".into(), vec![feed_key("r4")]));
    }

    #[test]
    fn test_remount_replaces_keys() {
        let mapper = ViewConsistencyMapper::new();
        let view = ViewId::from("feed");
        mapper.mount(view.clone(), vec![feed_key("r1")]);
        mapper.mount(view.clone(), vec![feed_key("r2")]);

        assert!(!mapper.is_referenced(&feed_key("r1")));
        assert_eq!(mapper.visible_keys(), vec![feed_key("r2")]);
    }

    #[test]
    fn test_unmount_returns_keys() {
        let mapper = ViewConsistencyMapper::new();
        let view = ViewId::from("feed");
        mapper.mount(view.clone(), vec![feed_key("r1"), feed_key("r2")]);

        assert_eq!(mapper.unmount(&view), vec![feed_key("r1"), feed_key("r2")]);
        assert!(!mapper.is_mounted(&view));
        assert!(mapper.unmount(&view).is_empty());
    }

    #[test]
    fn test_registrations() {
        let mapper = ViewConsistencyMapper::new();
        let view = ViewId::from("detail");
        mapper.mount(view.clone(), vec![detail_key("r1")]);
        assert_eq!(
            mapper.registrations(&view),
            vec![ViewRegistration {
                cache_key: detail_key("r1"),
                subscriber_id: view,
            }]
        );
    }
}
