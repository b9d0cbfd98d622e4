//! Background reconciliation for Larder.
//!
//! This crate provides a scheduler that:
//! - Tracks a bounded window of visible entities per mounted view
//! - Issues staggered, low-priority refreshes for entities whose counters look wrong
//! - Refreshes periodically while a view has focus
//! - Cancels every pending refresh of a view when it unmounts

mod scheduler;
mod types;

pub use scheduler::ReconciliationScheduler;
pub use types::{CorrectionPredicate, ReconcileConfig, Trigger, ZeroCounterPredicate, visible_window};
