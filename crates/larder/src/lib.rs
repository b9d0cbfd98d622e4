//! Larder client engine.
//!
//! Ties the sync engine and the reconciliation scheduler into one
//! [`Session`] per signed-in user, and hosts the headless `larder` driver.

pub mod config;
pub mod session;

pub use config::{DEFAULT_FEED_PAGE_SIZE, LarderConfig};
pub use session::Session;
