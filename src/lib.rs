//! efs-attach - backup, restore and re-attachment of EFS storage for
//! blockchain node sets on Kubernetes
//!
//! The engine drives two independently consistent systems, the provider's
//! snapshot/restore service and the cluster's volume-binding control plane,
//! through multi-step workflows that tolerate partial failure.
//!
//! # Modules
//!
//! - [`attach`] - Attach orchestrator state machine and restore-then-attach
//! - [`resolver`] - Finds the file system bound to a namespace
//! - [`backup`] - On-demand snapshot jobs
//! - [`restore`] - Restore jobs and throughput normalization
//! - [`rebind`] - Delete-and-recreate of volume/claim pairs
//! - [`mount_targets`] - Mount target replication and validation
//! - [`verify`] - Inspection pods checking the data on a file system
//! - [`reaper`] - Retention of recovery points, file systems and vaults
//! - [`aws`] - Provider records and the `aws` CLI client
//! - [`cluster`] - Cluster seam and its kube-rs implementation
//! - [`naming`] - File-system ids, ownership and generated names
//! - [`poll`] - Bounded, cancellable polling
//! - [`exec`] - External command runner
//! - [`config`] - Engine configuration
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod attach;
pub mod aws;
pub mod backup;
pub mod cluster;
pub mod config;
pub mod error;
pub mod exec;
pub mod mount_targets;
pub mod naming;
pub mod poll;
pub mod reaper;
pub mod rebind;
pub mod resolver;
pub mod restore;
pub mod telemetry;
pub mod verify;

#[cfg(test)]
mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
