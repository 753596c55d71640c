//! Types library for the live inventory view
//!
//! This library provides the core type definitions shared by the live view
//! services: the snapshot documents deposited by the upstream counter, the
//! caller session and its role, and the error taxonomy.
//!
//! # Modules
//! - `ids`: Identifiers (SnapshotId, UserId, HandleId)
//! - `snapshot`: Snapshot documents, ordering keys, and category counts
//! - `session`: Roles, capabilities, identities, profiles, and sessions
//! - `errors`: Error taxonomy

// Public modules
pub mod ids;
pub mod snapshot;
pub mod session;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::snapshot::*;
    pub use crate::session::*;
    pub use crate::errors::*;
}
