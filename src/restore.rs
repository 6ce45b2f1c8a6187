//! Restore jobs
//!
//! A restore always produces a new file system. The controller finds the vault
//! holding the recovery point, submits the job with a fresh creation token,
//! waits for it, extracts the new file-system id and moves the new file system
//! to elastic throughput.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aws::arn::{file_system_id_from_arn, parse_recovery_point_arn};
use crate::aws::{
    is_throughput_cooldown, BackupService, FileSystemService, RestoreJob, StartRestoreRequest,
    ThroughputMode, EFS_RESOURCE_TYPE,
};
use crate::poll::{poll_job, PollPolicy};
use crate::Error;

/// Restore metadata key requesting a new file system
const META_NEW_FILE_SYSTEM: &str = "newFileSystem";
/// Restore metadata key carrying the creation token
const META_CREATION_TOKEN: &str = "CreationToken";
/// Restore metadata key naming the source file system
const META_FILE_SYSTEM_ID: &str = "file-system-id";

/// What happened to the restored file system's throughput mode
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ThroughputOutcome {
    /// Nothing to do
    AlreadyElastic,
    /// Changed to elastic
    Updated {
        /// Mode before the change
        from: ThroughputMode,
    },
    /// The provider refused the change for now; retry later
    Deferred {
        /// Provider output explaining the refusal
        reason: String,
    },
}

/// Result of a full restore
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoreOutcome {
    /// Final job record
    pub job: RestoreJob,
    /// New file system, `None` when the restore produced nothing attachable
    pub file_system_id: Option<String>,
    /// Throughput normalization, when a file system was produced
    pub throughput: Option<ThroughputOutcome>,
    /// Non-fatal problems
    pub warnings: Vec<String>,
}

/// Starts and monitors restore jobs
#[derive(Clone)]
pub struct RestoreJobController {
    backups: Arc<dyn BackupService>,
    file_systems: Arc<dyn FileSystemService>,
}

impl RestoreJobController {
    /// Create a controller
    pub fn new(
        backups: Arc<dyn BackupService>,
        file_systems: Arc<dyn FileSystemService>,
    ) -> Self {
        Self {
            backups,
            file_systems,
        }
    }

    /// Find the vault holding a recovery point by probing every vault
    pub async fn locate_vault(&self, recovery_point_arn: &str) -> Result<String, Error> {
        for vault in self.backups.list_vaults().await? {
            match self
                .backups
                .describe_recovery_point(&vault.name, recovery_point_arn)
                .await
            {
                Ok(point) => return Ok(point.vault_name),
                Err(e) if e.is_not_found() => {
                    debug!(vault = %vault.name, "recovery point not in vault");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::not_found(format!(
            "vault holding recovery point {}",
            recovery_point_arn
        )))
    }

    /// Submit a restore of `recovery_point_arn` into a new file system.
    ///
    /// The ARN must be a recovery point in `region`, and some vault must hold
    /// it, before anything is submitted.
    pub async fn start_restore(
        &self,
        region: &str,
        recovery_point_arn: &str,
        iam_role_arn: &str,
    ) -> Result<String, Error> {
        let arn = parse_recovery_point_arn(recovery_point_arn)?;
        if arn.region != region {
            return Err(Error::validation(format!(
                "recovery point is in region {} but restore targets {}",
                arn.region, region
            )));
        }

        let vault = self.locate_vault(recovery_point_arn).await?;
        let provided = self
            .backups
            .restore_metadata(&vault, recovery_point_arn)
            .await?;

        let request = StartRestoreRequest {
            recovery_point_arn: recovery_point_arn.to_string(),
            iam_role_arn: iam_role_arn.to_string(),
            metadata: new_file_system_metadata(provided),
            idempotency_token: Uuid::new_v4().to_string(),
            resource_type: EFS_RESOURCE_TYPE.to_string(),
        };

        let job_id = self
            .backups
            .start_restore_job(&request)
            .await
            .map_err(|e| match e {
                Error::ExternalCommand { output, .. } => Error::job_start(output),
                other => other,
            })?;
        info!(
            vault = %vault,
            job_id = %job_id,
            recovery_point = recovery_point_arn,
            "started restore job"
        );
        Ok(job_id)
    }

    /// Poll a restore job to a terminal state
    pub async fn await_completion(
        &self,
        job_id: &str,
        policy: &PollPolicy,
        cancel: &CancellationToken,
    ) -> Result<RestoreJob, Error> {
        let backups = self.backups.as_ref();
        poll_job("restore", job_id, policy, cancel, || {
            backups.describe_restore_job(job_id)
        })
        .await
    }

    /// Move a file system to elastic throughput.
    ///
    /// A cooldown refusal is reported as [`ThroughputOutcome::Deferred`];
    /// any other failure propagates.
    pub async fn normalize_throughput(&self, fs_id: &str) -> Result<ThroughputOutcome, Error> {
        let file_system = self.file_systems.describe_file_system(fs_id).await?;
        if file_system.throughput_mode == ThroughputMode::Elastic {
            debug!(fs_id, "throughput already elastic");
            return Ok(ThroughputOutcome::AlreadyElastic);
        }

        match self
            .file_systems
            .update_throughput_mode(fs_id, &ThroughputMode::Elastic)
            .await
        {
            Ok(()) => {
                info!(fs_id, from = %file_system.throughput_mode, "throughput set to elastic");
                Ok(ThroughputOutcome::Updated {
                    from: file_system.throughput_mode,
                })
            }
            Err(e) if is_throughput_cooldown(&e) => {
                let reason = e.provider_output().unwrap_or_default().to_string();
                warn!(fs_id, %reason, "throughput change deferred by provider");
                Ok(ThroughputOutcome::Deferred { reason })
            }
            Err(e) => Err(e),
        }
    }

    /// Start, await and post-process a restore.
    ///
    /// A result that is not a file system yields `file_system_id: None`.
    /// Throughput problems become warnings.
    pub async fn restore(
        &self,
        region: &str,
        recovery_point_arn: &str,
        iam_role_arn: &str,
        policy: &PollPolicy,
        cancel: &CancellationToken,
    ) -> Result<RestoreOutcome, Error> {
        let job_id = self
            .start_restore(region, recovery_point_arn, iam_role_arn)
            .await?;
        let job = self.await_completion(&job_id, policy, cancel).await?;

        let file_system_id = job
            .created_resource_arn
            .as_deref()
            .and_then(file_system_id_from_arn);

        let mut warnings = Vec::new();
        let throughput = match file_system_id.as_deref() {
            Some(fs_id) => match self.normalize_throughput(fs_id).await {
                Ok(outcome) => {
                    if let ThroughputOutcome::Deferred { reason } = &outcome {
                        warnings.push(format!("throughput change deferred: {}", reason));
                    }
                    Some(outcome)
                }
                Err(e) => {
                    warn!(fs_id, error = %e, "throughput normalization failed");
                    warnings.push(format!("throughput normalization failed: {}", e));
                    None
                }
            },
            None => {
                info!(
                    job_id = %job.id,
                    result = ?job.created_resource_arn,
                    "restore produced nothing to attach"
                );
                None
            }
        };

        Ok(RestoreOutcome {
            job,
            file_system_id,
            throughput,
            warnings,
        })
    }
}

/// Rewrite provider restore metadata to target a brand-new file system
fn new_file_system_metadata(mut metadata: BTreeMap<String, String>) -> BTreeMap<String, String> {
    metadata.remove(META_FILE_SYSTEM_ID);
    metadata.insert(META_NEW_FILE_SYSTEM.to_string(), "true".to_string());
    metadata.insert(META_CREATION_TOKEN.to_string(), Uuid::new_v4().to_string());
    metadata
}
