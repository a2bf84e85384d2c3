// owehost - Filesystem-authoritative tenant state for shared hosting nodes
//
// Licensed under the GNU General Public License v3.0

//! owehost keeps every tenant of a shared-hosting node as a directory of JSON
//! descriptors and reconciles that state into OS resources: POSIX users,
//! cgroups, quotas, nginx vhosts, PHP-FPM pools and TLS material. A recovery
//! pipeline reads the tree back to regenerate service configuration or to
//! resynchronise an external index.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Configuration subsystem
pub mod config;

/// Error taxonomy
pub mod error;

/// Descriptor types
pub mod model;

/// Descriptor and name validators
pub mod validation;

/// Layout, atomic I/O, locks and the typed state store
pub mod store;

/// Append-only event log, alerts and retention
pub mod events;

/// External tools, POSIX users, cgroups, quotas and TLS material
pub mod host;

/// nginx and PHP-FPM config rendering
pub mod render;

/// Desired-state reconciler
pub mod applier;

/// Filesystem scanner and integrity checks
pub mod scanner;

/// External index reconciliation
pub mod rebuild;

/// Service config regeneration
pub mod generator;

/// Service interface
pub mod service;

// Re-export common types
pub use applier::{Applier, ApplyResult};
pub use config::HostConfig;
pub use error::{CoreError, ErrorKind, Result};
pub use service::Service;
