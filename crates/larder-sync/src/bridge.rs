//! Realtime bridge: backend change feed to entity store.
//!
//! Subscribes once per session to the change feed over a WebSocket. Each
//! change event is translated into update or invalidate instructions for
//! every cached copy of the entity and written through to the store as an
//! authoritative write, so it always overrides optimistic values.
//!
//! On disconnect the bridge reconnects with exponential backoff. After a
//! reconnect, events may have been missed, so the reconnect callback is
//! invoked with the subscribed kinds to trigger a one-time reconciliation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

use crate::wire;
use crate::{
    CacheKey, ChangeEvent, EntityId, EntityKind, EntityStore, EntityValue, RealtimeConfig, SyncError,
    ViewConsistencyMapper,
};

/// Connection state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Not connected and not trying to.
    Disconnected = 0,
    /// Connecting or waiting to reconnect.
    Connecting = 1,
    /// Receiving events.
    Live = 2,
}

impl From<u8> for ConnectionState {
    fn from(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Live,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// What one change event does to one cached copy.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeInstruction {
    /// Replace the copy with the merged value.
    Update { key: CacheKey, value: EntityValue },
    /// The change could not be merged; mark the copy stale.
    Invalidate { key: CacheKey },
}

/// Invoked after a reconnect with the subscribed kinds.
pub type ReconnectCallback = Arc<dyn Fn(&[EntityKind]) + Send + Sync>;

/// Message envelope on the change feed.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FeedMessage {
    Change(WireChange),
    Heartbeat,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct WireChange {
    kind: String,
    entity_id: Value,
    #[serde(default)]
    changed_fields: Map<String, Value>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Parse one change-feed frame. Heartbeats, unknown message types and
/// unknown entity kinds yield `None`.
pub fn parse_event(text: &str) -> Result<Option<ChangeEvent>, SyncError> {
    let change = match serde_json::from_str::<FeedMessage>(text)? {
        FeedMessage::Change(change) => change,
        FeedMessage::Heartbeat => {
            trace!("heartbeat");
            return Ok(None);
        }
        FeedMessage::Unknown => {
            trace!("ignoring unknown change feed message");
            return Ok(None);
        }
    };

    let Some(kind) = EntityKind::parse(&change.kind) else {
        trace!(kind = %change.kind, "ignoring change for unmanaged kind");
        return Ok(None);
    };
    let entity_id = match &change.entity_id {
        Value::String(s) if !s.is_empty() => EntityId::new(s.clone()),
        Value::Number(n) => EntityId::new(n.to_string()),
        other => {
            return Err(SyncError::InvalidResponse(format!("change with entity_id {}", other)));
        }
    };

    Ok(Some(ChangeEvent {
        kind,
        entity_id,
        changed_fields: change.changed_fields,
        timestamp: change.timestamp.unwrap_or_else(Utc::now),
    }))
}

/// Change feed subscriber writing through to the entity store.
pub struct RealtimeBridge {
    store: Arc<EntityStore>,
    mapper: Arc<ViewConsistencyMapper>,
    /// Change feed URL (without query params).
    url: String,
    kinds: Vec<EntityKind>,
    config: RealtimeConfig,
    reconnect_callback: Option<ReconnectCallback>,
    state: AtomicU8,
}

impl RealtimeBridge {
    /// Create a bridge subscribed to every entity kind.
    pub fn new(url: impl Into<String>, store: Arc<EntityStore>, mapper: Arc<ViewConsistencyMapper>) -> Self {
        Self {
            store,
            mapper,
            url: url.into(),
            kinds: EntityKind::ALL.to_vec(),
            config: RealtimeConfig::default(),
            reconnect_callback: None,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
        }
    }

    /// Restrict the subscription to `kinds`.
    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = EntityKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn with_config(mut self, config: RealtimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the callback run after every reconnect.
    pub fn with_reconnect_callback(mut self, callback: ReconnectCallback) -> Self {
        self.reconnect_callback = Some(callback);
        self
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Build the full WebSocket URL with query parameters.
    fn build_url(&self) -> String {
        let kinds: Vec<&str> = self.kinds.iter().map(EntityKind::as_str).collect();
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}kinds={}", self.url, sep, kinds.join(","))
    }

    // =========================================================================
    // Translation
    // =========================================================================

    /// Resolve a change event to instructions for every cached copy.
    pub fn translate(&self, event: &ChangeEvent) -> Vec<BridgeInstruction> {
        let entity = event.entity();
        let mut keys = self.store.keys_for_entity(&entity);
        for key in self.mapper.keys_for(&entity) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        let now = self.store.clock().now();
        keys.into_iter()
            .filter_map(|key| {
                let current = self.store.get(&key)?;
                if event.changed_fields.is_empty() {
                    return Some(BridgeInstruction::Invalidate { key });
                }
                match wire::merge_changes(&current.value, &event.changed_fields, now) {
                    Ok(merged) => Some(BridgeInstruction::Update {
                        value: current.value.adopt_shared(&merged),
                        key,
                    }),
                    Err(e) => {
                        debug!(key = %key, error = %e, "change not mergeable, invalidating");
                        Some(BridgeInstruction::Invalidate { key })
                    }
                }
            })
            .collect()
    }

    /// Apply instructions to the store. Returns how many keys changed.
    pub fn apply(&self, instructions: Vec<BridgeInstruction>) -> usize {
        let mut applied = 0;
        for instruction in instructions {
            match instruction {
                BridgeInstruction::Update { key, value } => {
                    if self.store.write_authoritative(key, value).is_applied() {
                        applied += 1;
                    }
                }
                BridgeInstruction::Invalidate { key } => {
                    if self.store.invalidate(&key) {
                        applied += 1;
                    }
                }
            }
        }
        applied
    }

    /// Translate and apply one event.
    pub fn apply_event(&self, event: &ChangeEvent) -> usize {
        let applied = self.apply(self.translate(event));
        trace!(entity = %event.entity(), applied, "change event applied");
        applied
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect and start receiving events.
    ///
    /// Runs in a reconnection loop with exponential backoff until shutdown.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), SyncError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.initial_backoff(),
            max_interval: self.config.max_backoff(),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut connected_before = false;

        loop {
            if *shutdown_rx.borrow() {
                info!("realtime bridge shutting down");
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }

            self.set_state(ConnectionState::Connecting);
            let url = self.build_url();
            info!(url = %url, "connecting to change feed");

            match self
                .connect_and_process(&url, &mut shutdown_rx, &mut backoff, &mut connected_before)
                .await
            {
                Ok(()) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "change feed connection error, reconnecting");
                    self.set_state(ConnectionState::Connecting);

                    let wait = backoff.next_backoff().unwrap_or(self.config.max_backoff());
                    warn!(wait_ms = wait.as_millis() as u64, "waiting before reconnect");
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                self.set_state(ConnectionState::Disconnected);
                                return Ok(());
                            }
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// Connect and process messages until error or shutdown.
    async fn connect_and_process(
        &self,
        url: &str,
        shutdown_rx: &mut watch::Receiver<bool>,
        backoff: &mut ExponentialBackoff,
        connected_before: &mut bool,
    ) -> Result<(), SyncError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| SyncError::WebSocket(format!("connection failed: {}", e)))?;
        let (_, mut read) = ws_stream.split();

        backoff.reset();
        self.set_state(ConnectionState::Live);
        info!("change feed connected");

        if *connected_before {
            self.on_reconnect();
        }
        *connected_before = true;

        let read_timeout = self.config.read_timeout();
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("realtime bridge received shutdown signal");
                        return Ok(());
                    }
                }

                result = tokio::time::timeout(read_timeout, read.next()) => {
                    match result {
                        Ok(Some(Ok(Message::Text(text)))) => {
                            if let Err(e) = self.handle_message(&text) {
                                warn!(error = %e, "failed to handle change feed message");
                            }
                        }
                        Ok(Some(Ok(Message::Ping(_)))) => {
                            // tungstenite auto-responds to pings
                            trace!("received ping");
                        }
                        Ok(Some(Ok(Message::Close(_)))) => {
                            info!("change feed closed by server");
                            return Err(SyncError::WebSocket("connection closed".to_string()));
                        }
                        Ok(Some(Ok(_))) => {}
                        Ok(Some(Err(e))) => {
                            return Err(SyncError::WebSocket(format!("read error: {}", e)));
                        }
                        Ok(None) => {
                            return Err(SyncError::WebSocket("stream ended".to_string()));
                        }
                        Err(_) => {
                            warn!("change feed read timeout after {}s", read_timeout.as_secs());
                            return Err(SyncError::WebSocket("read timeout".to_string()));
                        }
                    }
                }
            }
        }
    }

    fn handle_message(&self, text: &str) -> Result<(), SyncError> {
        if let Some(event) = parse_event(text)? {
            self.apply_event(&event);
        }
        Ok(())
    }

    fn on_reconnect(&self) {
        match &self.reconnect_callback {
            Some(callback) => {
                info!(kinds = ?self.kinds, "change feed reconnected, requesting reconciliation");
                callback(&self.kinds);
            }
            None => debug!("change feed reconnected"),
        }
    }
}
