//! Client and root directory registries
//!
//! Clients are identified by UUID; roots by their canonical path. Membership
//! is stored on both sides and every change to it touches both records in
//! one transaction.

mod client;
mod directory;
mod password;

pub use client::{Client, ClientRegistry};
pub use directory::{CascadeReport, DirectoryRegistry, RootDirectory};
pub use password::{generate_password, SecretHasher};

pub(crate) use directory::purge_root;
