//! quics - metadata and version-history engine for a directory sync server
//!
//! This library keeps track of registered clients, the shared root
//! directories they join, the latest state of every synced file and an
//! append-only history of every observed change, all persisted in sled.

pub mod config;
pub mod content;
pub mod engine;
pub mod error;
pub mod index;
pub mod registry;
pub mod retry;
pub mod server;
pub mod store;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::engine::Engine;
    pub use crate::error::{Error, Result};
    pub use crate::index::{Decision, Observation, Scope, VersionStamp};
    pub use crate::server::{Server, ServerState, Transport};
}
