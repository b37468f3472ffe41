//! SQLite persistence for substrate tenant partitions.
//!
//! One database file per tenant. Each tick is committed as a single
//! transaction holding the partition state and the batch it emitted.

pub mod error;
pub mod json_bridge;
pub mod schema;
pub mod store;
pub mod tenant;

pub use error::{Result, StoreError};
pub use store::{Store, StoreStats};
pub use tenant::{TenantDirectory, validate_tenant};
