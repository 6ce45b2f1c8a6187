//! On-demand snapshot jobs
//!
//! The controller submits snapshot jobs into an existing vault and polls them
//! to a terminal state. It never creates vaults.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aws::arn::file_system_arn;
use crate::aws::{BackupJob, BackupService, StartBackupRequest};
use crate::naming::{is_file_system_id, OwnershipMatcher};
use crate::poll::{poll_job, PollPolicy};
use crate::Error;

/// Starts and monitors snapshot jobs
#[derive(Clone)]
pub struct BackupJobController {
    backups: Arc<dyn BackupService>,
    role_name: String,
}

impl BackupJobController {
    /// Create a controller whose jobs assume `role_name`
    pub fn new(backups: Arc<dyn BackupService>, role_name: impl Into<String>) -> Self {
        Self {
            backups,
            role_name: role_name.into(),
        }
    }

    /// First vault whose name the namespace owns
    pub async fn find_vault(
        &self,
        namespace: &str,
        ownership: &dyn OwnershipMatcher,
    ) -> Result<String, Error> {
        self.backups
            .list_vaults()
            .await?
            .into_iter()
            .find(|v| ownership.owns(namespace, &v.name))
            .map(|v| v.name)
            .ok_or_else(|| Error::job_start(format!("no backup vault for namespace {}", namespace)))
    }

    /// Submit a snapshot of `fs_id` into `vault_name` and return the job id.
    ///
    /// Fails with [`Error::JobStart`] when the vault is not listed.
    pub async fn start_snapshot(
        &self,
        region: &str,
        account_id: &str,
        fs_id: &str,
        vault_name: &str,
    ) -> Result<String, Error> {
        if !is_file_system_id(fs_id) {
            return Err(Error::validation(format!("invalid file system id '{}'", fs_id)));
        }

        let vaults = self.backups.list_vaults().await?;
        if !vaults.iter().any(|v| v.name == vault_name) {
            return Err(Error::job_start(format!(
                "backup vault '{}' does not exist",
                vault_name
            )));
        }

        let iam_role_arn = self.backups.role_arn(&self.role_name).await?;
        let request = StartBackupRequest {
            vault_name: vault_name.to_string(),
            resource_arn: file_system_arn(region, account_id, fs_id),
            iam_role_arn,
            idempotency_token: Uuid::new_v4().to_string(),
        };

        let job_id = self
            .backups
            .start_backup_job(&request)
            .await
            .map_err(|e| match e {
                Error::ExternalCommand { output, .. } => Error::job_start(output),
                other => other,
            })?;
        info!(fs_id, vault = vault_name, job_id = %job_id, "started snapshot job");
        Ok(job_id)
    }

    /// Poll a snapshot job until it reaches a terminal state.
    ///
    /// `Failed`/`Aborted` become [`Error::JobFailed`] with the job's message.
    /// Running out of attempts is [`Error::Timeout`]; the job may still finish.
    pub async fn await_completion(
        &self,
        job_id: &str,
        policy: &PollPolicy,
        cancel: &CancellationToken,
    ) -> Result<BackupJob, Error> {
        await_backup_job(self.backups.as_ref(), job_id, policy, cancel).await
    }

    /// Watch a job in the background. The outcome is only logged.
    pub fn spawn_completion_monitor(
        &self,
        job_id: String,
        policy: PollPolicy,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let backups = Arc::clone(&self.backups);
        tokio::spawn(async move {
            match await_backup_job(backups.as_ref(), &job_id, &policy, &cancel).await {
                Ok(job) => {
                    info!(job_id = %job.id, vault = %job.vault_name, "snapshot job completed")
                }
                Err(e) if e.is_timeout() => {
                    warn!(
                        job_id = %job_id,
                        error = %e,
                        "snapshot job still running after monitor budget"
                    )
                }
                Err(e) if e.is_cancelled() => {
                    debug!(job_id = %job_id, "snapshot monitor cancelled")
                }
                Err(e) => error!(job_id = %job_id, error = %e, "snapshot job failed"),
            }
        })
    }
}

async fn await_backup_job(
    backups: &dyn BackupService,
    job_id: &str,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> Result<BackupJob, Error> {
    poll_job("backup", job_id, policy, cancel, || backups.describe_backup_job(job_id)).await
}
