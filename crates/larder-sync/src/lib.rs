//! Client-side sync engine for Larder.
//!
//! This crate keeps denormalized copies of recipes, profiles, follow edges,
//! pantry items and comment threads consistent across independently fetched
//! views while the user mutates them optimistically and the backend pushes
//! change notifications.
//!
//! ## Features
//!
//! - **Store**: keyed, subscribable snapshot table with version-based write ordering
//! - **Gateway**: thin RPC boundary to the backend, normalizing response shapes once
//! - **Mapper**: view registrations and logical-entity to cache-key fan-out
//! - **Coordinator**: optimistic toggles with coalescing and rollback
//! - **Guard**: at-most-once side effects per (actor, entity)
//! - **Bridge**: realtime change feed subscription with reconnection backoff

pub mod bridge;
pub mod clock;
pub mod config;
pub mod coordinator;
mod error;
pub mod gateway;
pub mod guard;
pub mod mapper;
pub mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
mod types;
pub mod wire;

pub use bridge::{BridgeInstruction, ConnectionState, RealtimeBridge, ReconnectCallback};
pub use clock::{Clock, TokioClock};
pub use config::{RealtimeConfig, StalenessPolicy, SyncConfig};
pub use coordinator::{DispatchOutcome, MutationCoordinator};
pub use error::{ALREADY_RECORDED, SyncError, UNIQUE_VIOLATION};
pub use gateway::{HttpGateway, RemoteGateway};
pub use guard::{DedupRecord, DuplicateActionGuard, OnceOutcome};
pub use mapper::{ViewConsistencyMapper, ViewId, ViewRegistration};
pub use store::{EntityStore, SnapshotCallback, StoreUpdate, Subscription, WriteOrigin, WriteOutcome};
pub use types::*;
