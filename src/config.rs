//! Engine configuration
//!
//! Every knob the workflows read lives here with its default. The binary
//! fills these from flags and environment variables; library callers build
//! them directly.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::poll::PollPolicy;
use crate::Error;

/// Environment variable overriding the backup helper script location
pub const BACKUP_HELPER_SCRIPT_ENV: &str = "BACKUP_HELPER_SCRIPT_URL";

/// Placeholder location of the backup helper script.
///
/// No public copy of the script exists, so this points at a reserved
/// `.invalid` host. Deployments set [`BACKUP_HELPER_SCRIPT_ENV`] to wherever
/// they host the script; exported backups otherwise name this placeholder.
pub const DEFAULT_BACKUP_HELPER_SCRIPT_URL: &str =
    "https://helper-script.invalid/backup-helper.sh";

/// Role the snapshot service assumes when none is configured
pub const DEFAULT_BACKUP_ROLE: &str = "AWSBackupDefaultServiceRole";

/// Default image for inspection pods
pub const DEFAULT_VERIFY_IMAGE: &str = "busybox:1.36";

/// Whether to export volume and claim definitions before rebinding
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackupConfigPolicy {
    /// Always export
    #[default]
    Always,
    /// Ask the operator
    AskFirst,
    /// Never export
    Skip,
}

impl FromStr for BackupConfigPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "ask" | "ask-first" => Ok(Self::AskFirst),
            "skip" | "never" => Ok(Self::Skip),
            other => Err(Error::validation(format!(
                "unknown backup config policy '{}' (expected always, ask-first or skip)",
                other
            ))),
        }
    }
}

impl fmt::Display for BackupConfigPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Always => "always",
            Self::AskFirst => "ask-first",
            Self::Skip => "skip",
        })
    }
}

/// Retention reaper settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetentionSettings {
    /// Recovery points older than this are deleted
    pub window: chrono::Duration,
    /// File systems younger than this are never deleted
    pub file_system_grace: chrono::Duration,
    /// Report candidates without deleting
    pub dry_run: bool,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            window: chrono::Duration::days(7),
            file_system_grace: chrono::Duration::hours(1),
            dry_run: false,
        }
    }
}

/// Data verification settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationSettings {
    /// Inspection pod image
    pub image: String,
    /// Where the claim is mounted in the pod
    pub mount_path: String,
    /// Data directory, looked for directly under the mount or one level down
    pub data_subdir: String,
    /// Files that must exist in the data directory
    pub markers: Vec<String>,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            image: DEFAULT_VERIFY_IMAGE.to_string(),
            mount_path: "/data".to_string(),
            data_subdir: "geth".to_string(),
            markers: vec!["chaindata".to_string()],
        }
    }
}

/// Poll budgets for every wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    /// Snapshot jobs
    pub backup_job: PollPolicy,
    /// Restore jobs
    pub restore_job: PollPolicy,
    /// Claim binding
    pub claim_bind: PollPolicy,
    /// Provider-side and control-plane deletions
    pub propagation: PollPolicy,
    /// Inspection pods
    pub verification: PollPolicy,
    /// Consumer rollouts
    pub rollout: PollPolicy,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            backup_job: PollPolicy::backup_job(),
            restore_job: PollPolicy::restore_job(),
            claim_bind: PollPolicy::claim_bind(),
            propagation: PollPolicy::propagation(),
            verification: PollPolicy::verification(),
            rollout: PollPolicy::rollout(),
        }
    }
}

/// Everything the workflows need besides their collaborators
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Provider region
    pub region: String,
    /// IAM role name for backup and restore jobs
    pub backup_role: String,
    /// Vault for post-attach snapshots; looked up by namespace when unset
    pub snapshot_vault: Option<String>,
    /// Wait for the post-attach snapshot instead of monitoring it in the
    /// background
    pub wait_for_snapshot: bool,
    /// Configuration export policy
    pub backup_config: BackupConfigPolicy,
    /// Where configuration exports are written
    pub backup_dir: PathBuf,
    /// Helper script location stamped into exports
    pub helper_script_url: String,
    /// Retention reaper settings
    pub retention: RetentionSettings,
    /// Data verification settings
    pub verification: VerificationSettings,
    /// Poll budgets
    pub polls: PollSettings,
}

impl EngineConfig {
    /// Defaults for `region`, with the helper script location taken from
    /// the environment
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            backup_role: DEFAULT_BACKUP_ROLE.to_string(),
            snapshot_vault: None,
            wait_for_snapshot: false,
            backup_config: BackupConfigPolicy::default(),
            backup_dir: PathBuf::from("backups"),
            helper_script_url: helper_script_url(),
            retention: RetentionSettings::default(),
            verification: VerificationSettings::default(),
            polls: PollSettings::default(),
        }
    }
}

/// Helper script location: the environment override when set and non-empty,
/// otherwise the published default
pub fn helper_script_url() -> String {
    helper_script_url_from(env::var(BACKUP_HELPER_SCRIPT_ENV).ok())
}

fn helper_script_url_from(value: Option<String>) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_BACKUP_HELPER_SCRIPT_URL.to_string())
}
