//! Snapshot service and file-system service seams
//!
//! The workflows never talk to the provider directly. They go through
//! [`BackupService`] and [`FileSystemService`], which [`cli::AwsCli`]
//! implements on top of the `aws` command line. Every call is treated as
//! non-transactional: callers re-read state instead of trusting a response.

pub mod arn;
pub mod cli;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::Error;

pub use cli::AwsCli;

/// Resource type passed to restore jobs for network file systems
pub const EFS_RESOURCE_TYPE: &str = "EFS";

/// Lifecycle state of a usable file system
pub const LIFECYCLE_AVAILABLE: &str = "available";

/// Provider markers of the throughput-mode change cooldown
const THROUGHPUT_COOLDOWN_MARKERS: &[&str] = &[
    "TooManyRequests",
    "ThroughputModeChangeNotAllowed",
    "wait 24 hours",
];

/// Provider markers of a mount target already present in a subnet
const ALREADY_EXISTS_MARKERS: &[&str] = &["MountTargetConflict", "already exists"];

/// True when a throughput change was refused only because the provider
/// limits how often the mode may change. The change can be retried later.
pub fn is_throughput_cooldown(err: &Error) -> bool {
    err.provider_output()
        .is_some_and(|out| THROUGHPUT_COOLDOWN_MARKERS.iter().any(|m| out.contains(m)))
}

/// True when a create call failed because the resource is already there
pub fn is_already_exists(err: &Error) -> bool {
    err.provider_output()
        .is_some_and(|out| ALREADY_EXISTS_MARKERS.iter().any(|m| out.contains(m)))
}

/// Backup or restore job state
///
/// `Completed`, `Failed` and `Aborted` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Accepted, not started
    Created,
    /// In progress
    Running,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
    /// Cancelled on the provider side
    Aborted,
}

impl JobState {
    /// Map a provider state string.
    ///
    /// `PENDING` is treated as `Created`, `ABORTING` as `Running` (not yet
    /// settled), and `EXPIRED`/`PARTIAL` as `Failed`: for a single file
    /// system a partial backup is not a usable recovery point.
    pub fn from_provider(state: &str) -> Result<Self, Error> {
        match state.to_ascii_uppercase().as_str() {
            "CREATED" | "PENDING" => Ok(Self::Created),
            "RUNNING" | "ABORTING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" | "EXPIRED" | "PARTIAL" => Ok(Self::Failed),
            "ABORTED" => Ok(Self::Aborted),
            other => Err(Error::validation(format!("unknown job state '{}'", other))),
        }
    }

    /// True for states a job never leaves
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// Whether an observation of `next` may follow an observation of `self`.
    ///
    /// Jobs only move forward: `Created -> Running -> terminal`, and a
    /// terminal state is never revisited or left.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match self {
            Self::Created => true,
            Self::Running => next != Self::Created,
            terminal => *terminal == next,
        }
    }

    /// Provider spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An on-demand snapshot job
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupJob {
    /// Provider job id
    pub id: String,
    /// ARN of the file system being backed up
    pub resource_arn: String,
    /// Vault receiving the recovery point
    pub vault_name: String,
    /// Current state
    pub state: JobState,
    /// Provider status message, if any
    pub status_message: Option<String>,
}

/// A restore job
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoreJob {
    /// Provider job id
    pub id: String,
    /// Recovery point being restored
    pub source_recovery_point_arn: String,
    /// Current state
    pub state: JobState,
    /// Provider status message, if any
    pub status_message: Option<String>,
    /// ARN of the resource created by the restore, set on completion
    pub created_resource_arn: Option<String>,
}

/// Common view of backup and restore jobs for polling
pub trait JobRecord {
    /// Provider job id
    fn job_id(&self) -> &str;
    /// Current state
    fn state(&self) -> JobState;
    /// Provider status message
    fn status_message(&self) -> Option<&str>;
}

impl JobRecord for BackupJob {
    fn job_id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> JobState {
        self.state
    }

    fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }
}

impl JobRecord for RestoreJob {
    fn job_id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> JobState {
        self.state
    }

    fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }
}

/// A point-in-time backup artifact
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryPoint {
    /// Recovery point ARN
    pub arn: String,
    /// Vault the point lives in
    pub vault_name: String,
    /// ARN of the backed-up resource, when the provider reports it
    pub resource_arn: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Provider status (COMPLETED, PARTIAL, DELETING, EXPIRED)
    pub status: String,
    /// When the retention policy will remove it
    pub expiry_at: Option<DateTime<Utc>>,
}

/// A named container of recovery points
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupVault {
    /// Vault name
    pub name: String,
    /// Vault ARN
    pub arn: String,
    /// Number of recovery points the provider reports
    pub recovery_points: u64,
}

/// File-system I/O provisioning mode
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ThroughputMode {
    /// Scales with demand
    Elastic,
    /// Credit-based burst
    Bursting,
    /// Fixed provisioned throughput
    Provisioned,
    /// A mode this crate does not know about
    Other(String),
}

impl ThroughputMode {
    /// Parse the provider spelling
    pub fn parse(mode: &str) -> Self {
        match mode {
            "elastic" => Self::Elastic,
            "bursting" => Self::Bursting,
            "provisioned" => Self::Provisioned,
            other => Self::Other(other.to_string()),
        }
    }

    /// Provider spelling
    pub fn as_str(&self) -> &str {
        match self {
            Self::Elastic => "elastic",
            Self::Bursting => "bursting",
            Self::Provisioned => "provisioned",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for ThroughputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A network file system
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileSystem {
    /// File-system id (`fs-...`)
    pub id: String,
    /// Value of the Name tag
    pub name: Option<String>,
    /// Lifecycle state (`available`, `creating`, `deleting`, ...)
    pub lifecycle_state: String,
    /// Throughput mode
    pub throughput_mode: ThroughputMode,
    /// Creation time
    pub created_at: Option<DateTime<Utc>>,
    /// Number of mount targets
    pub mount_targets: u32,
}

/// A network mount point for a file system in one subnet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountTarget {
    /// Mount target id
    pub id: String,
    /// Owning file system
    pub file_system_id: String,
    /// Subnet the mount target lives in
    pub subnet_id: String,
    /// Availability zone name
    pub availability_zone: Option<String>,
    /// Lifecycle state
    pub lifecycle_state: String,
}

/// A VPC subnet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subnet {
    /// Subnet id
    pub id: String,
    /// Subnet state (`available`, `pending`)
    pub state: String,
    /// Availability zone
    pub availability_zone: Option<String>,
}

/// Parameters for an on-demand snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartBackupRequest {
    /// Destination vault
    pub vault_name: String,
    /// File-system ARN
    pub resource_arn: String,
    /// Role the snapshot service assumes
    pub iam_role_arn: String,
    /// Client token making retries of the same request idempotent
    pub idempotency_token: String,
}

/// Parameters for a restore into a new file system
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartRestoreRequest {
    /// Recovery point to restore
    pub recovery_point_arn: String,
    /// Role the snapshot service assumes
    pub iam_role_arn: String,
    /// Restore metadata (creation token, new-file-system flag, ...)
    pub metadata: BTreeMap<String, String>,
    /// Client token making retries of the same request idempotent
    pub idempotency_token: String,
    /// Resource type (`EFS`)
    pub resource_type: String,
}

/// Snapshot/restore job service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackupService: Send + Sync {
    /// Account id of the active credentials
    async fn account_id(&self) -> Result<String, Error>;

    /// ARN of the named IAM role
    async fn role_arn(&self, role_name: &str) -> Result<String, Error>;

    /// All vaults visible to the credentials
    async fn list_vaults(&self) -> Result<Vec<BackupVault>, Error>;

    /// Look up one recovery point in a vault
    async fn describe_recovery_point(
        &self,
        vault_name: &str,
        recovery_point_arn: &str,
    ) -> Result<RecoveryPoint, Error>;

    /// Recovery points of one resource across all vaults
    async fn list_recovery_points_by_resource(
        &self,
        resource_arn: &str,
    ) -> Result<Vec<RecoveryPoint>, Error>;

    /// Recovery points stored in one vault
    async fn list_recovery_points_by_vault(
        &self,
        vault_name: &str,
    ) -> Result<Vec<RecoveryPoint>, Error>;

    /// Delete a recovery point
    async fn delete_recovery_point(
        &self,
        vault_name: &str,
        recovery_point_arn: &str,
    ) -> Result<(), Error>;

    /// Delete an empty vault
    async fn delete_vault(&self, vault_name: &str) -> Result<(), Error>;

    /// Submit an on-demand snapshot, returning the job id
    async fn start_backup_job(&self, request: &StartBackupRequest) -> Result<String, Error>;

    /// Current state of a snapshot job
    async fn describe_backup_job(&self, job_id: &str) -> Result<BackupJob, Error>;

    /// Metadata the provider needs to restore a recovery point
    async fn restore_metadata(
        &self,
        vault_name: &str,
        recovery_point_arn: &str,
    ) -> Result<BTreeMap<String, String>, Error>;

    /// Submit a restore, returning the job id
    async fn start_restore_job(&self, request: &StartRestoreRequest) -> Result<String, Error>;

    /// Current state of a restore job
    async fn describe_restore_job(&self, job_id: &str) -> Result<RestoreJob, Error>;
}

/// Network file-system service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FileSystemService: Send + Sync {
    /// All file systems in the region
    async fn list_file_systems(&self) -> Result<Vec<FileSystem>, Error>;

    /// One file system
    async fn describe_file_system(&self, file_system_id: &str) -> Result<FileSystem, Error>;

    /// Mount targets of a file system
    async fn list_mount_targets(&self, file_system_id: &str) -> Result<Vec<MountTarget>, Error>;

    /// Security groups attached to a mount target
    async fn mount_target_security_groups(
        &self,
        mount_target_id: &str,
    ) -> Result<Vec<String>, Error>;

    /// Create a mount target in a subnet
    async fn create_mount_target(
        &self,
        file_system_id: &str,
        subnet_id: &str,
        security_groups: &[String],
    ) -> Result<(), Error>;

    /// Delete a mount target
    async fn delete_mount_target(&self, mount_target_id: &str) -> Result<(), Error>;

    /// Delete a file system with no mount targets
    async fn delete_file_system(&self, file_system_id: &str) -> Result<(), Error>;

    /// Look up subnets by id
    async fn describe_subnets(&self, subnet_ids: &[String]) -> Result<Vec<Subnet>, Error>;

    /// Change a file system's throughput mode
    async fn update_throughput_mode(
        &self,
        file_system_id: &str,
        mode: &ThroughputMode,
    ) -> Result<(), Error>;
}
