//! Retention reaper
//!
//! Three independent passes over a namespace's provider resources:
//!
//! 1. recovery points of the bound file system older than the retention window
//! 2. namespace-owned file systems that are no longer bound
//! 3. namespace-owned vaults, emptied first
//!
//! A failing pass is recorded and the next one still runs. Ownership comes
//! only from names (see [`crate::naming::OwnershipMatcher`]), so every pass
//! also refuses to touch anything the cluster or the bound file system still
//! uses.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aws::arn::file_system_arn;
use crate::aws::{
    BackupService, FileSystem, FileSystemService, RecoveryPoint, LIFECYCLE_AVAILABLE,
};
use crate::cluster::ClusterApi;
use crate::config::RetentionSettings;
use crate::naming::OwnershipMatcher;
use crate::poll::{poll_until, PollPolicy};
use crate::resolver::StorageResolver;
use crate::Error;

/// Outcome of one pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Deleted (or, in dry-run, would be deleted)
    pub deleted: Vec<String>,
    /// Owned by the namespace but kept, with the reason
    pub protected: Vec<String>,
    /// Per-item failures
    pub failures: Vec<String>,
    /// Set when the pass could not run at all
    pub aborted: Option<String>,
}

impl PassReport {
    fn aborted(reason: impl Into<String>) -> Self {
        Self {
            aborted: Some(reason.into()),
            ..Default::default()
        }
    }

    /// True when nothing went wrong
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.aborted.is_none()
    }
}

/// Outcome of a full reap
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// File system the namespace is bound to, if resolved
    pub bound_file_system: Option<String>,
    /// Whether deletions were only reported
    pub dry_run: bool,
    /// Pass 1
    pub recovery_points: PassReport,
    /// Pass 2
    pub file_systems: PassReport,
    /// Pass 3
    pub vaults: PassReport,
}

impl ReapReport {
    /// True when all three passes ran without failures
    pub fn is_clean(&self) -> bool {
        self.recovery_points.is_clean() && self.file_systems.is_clean() && self.vaults.is_clean()
    }
}

/// Recovery points created strictly before `now - window`
pub fn expired_recovery_points<'a>(
    points: &'a [RecoveryPoint],
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> Vec<&'a RecoveryPoint> {
    let cutoff = now - window;
    points.iter().filter(|p| p.created_at < cutoff).collect()
}

/// Removes expired and orphaned provider resources for a namespace
pub struct RetentionReaper {
    backups: Arc<dyn BackupService>,
    file_systems: Arc<dyn FileSystemService>,
    cluster: Arc<dyn ClusterApi>,
    ownership: Arc<dyn OwnershipMatcher>,
    settings: RetentionSettings,
    propagation: PollPolicy,
}

impl RetentionReaper {
    /// Create a reaper
    pub fn new(
        backups: Arc<dyn BackupService>,
        file_systems: Arc<dyn FileSystemService>,
        cluster: Arc<dyn ClusterApi>,
        ownership: Arc<dyn OwnershipMatcher>,
        settings: RetentionSettings,
        propagation: PollPolicy,
    ) -> Self {
        Self {
            backups,
            file_systems,
            cluster,
            ownership,
            settings,
            propagation,
        }
    }

    /// Run all three passes.
    ///
    /// Only storage tied to the namespace counts as bound. When none is found,
    /// passes 1 and 3 are skipped: without it there is no way to tell which
    /// vault must survive.
    pub async fn reap(
        &self,
        region: &str,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> ReapReport {
        let mut report = ReapReport {
            dry_run: self.settings.dry_run,
            ..Default::default()
        };

        let resolver =
            StorageResolver::with_ownership(Arc::clone(&self.cluster), Arc::clone(&self.ownership));
        let bound = match resolver.resolve_owned(namespace).await {
            Ok(fs_id) => Some(fs_id),
            Err(e) => {
                warn!(namespace, error = %e, "could not resolve bound file system");
                None
            }
        };
        report.bound_file_system = bound.clone();

        let bound_arn = match (&bound, self.backups.account_id().await) {
            (Some(fs_id), Ok(account)) => Ok(file_system_arn(region, &account, fs_id)),
            (None, _) => Err("no bound file system".to_string()),
            (_, Err(e)) => Err(format!("account lookup failed: {}", e)),
        };

        report.recovery_points = match &bound_arn {
            Ok(arn) => self
                .reap_recovery_points(arn)
                .await
                .unwrap_or_else(|e| PassReport::aborted(e.to_string())),
            Err(reason) => PassReport::aborted(reason.clone()),
        };

        report.file_systems = self
            .reap_file_systems(namespace, bound.as_deref(), cancel)
            .await
            .unwrap_or_else(|e| PassReport::aborted(e.to_string()));

        report.vaults = match &bound_arn {
            Ok(arn) => self
                .reap_vaults(namespace, arn, cancel)
                .await
                .unwrap_or_else(|e| PassReport::aborted(e.to_string())),
            Err(reason) => PassReport::aborted(reason.clone()),
        };

        info!(
            namespace,
            dry_run = self.settings.dry_run,
            recovery_points = report.recovery_points.deleted.len(),
            file_systems = report.file_systems.deleted.len(),
            vaults = report.vaults.deleted.len(),
            "retention pass finished"
        );
        report
    }

    async fn reap_recovery_points(&self, bound_arn: &str) -> Result<PassReport, Error> {
        let mut report = PassReport::default();
        let points = self
            .backups
            .list_recovery_points_by_resource(bound_arn)
            .await?;

        for point in expired_recovery_points(&points, Utc::now(), self.settings.window) {
            if self.settings.dry_run {
                report.deleted.push(point.arn.clone());
                continue;
            }
            match self
                .backups
                .delete_recovery_point(&point.vault_name, &point.arn)
                .await
            {
                Ok(()) => {
                    info!(
                        recovery_point = %point.arn,
                        created_at = %point.created_at,
                        "deleted expired recovery point"
                    );
                    report.deleted.push(point.arn.clone());
                }
                Err(e) => report.failures.push(format!("{}: {}", point.arn, e)),
            }
        }
        Ok(report)
    }

    async fn reap_file_systems(
        &self,
        namespace: &str,
        bound: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<PassReport, Error> {
        let mut report = PassReport::default();

        let referenced: BTreeSet<String> = self
            .cluster
            .list_volumes()
            .await?
            .iter()
            .filter_map(|v| v.file_system_id().map(str::to_string))
            .collect();
        let grace_cutoff = Utc::now() - self.settings.file_system_grace;

        for fs in self.file_systems.list_file_systems().await? {
            let name = fs.name.as_deref().unwrap_or_default();
            if !self.ownership.owns(namespace, name) {
                continue;
            }
            if let Some(reason) = file_system_protection(&fs, bound, &referenced, grace_cutoff) {
                debug!(fs_id = %fs.id, reason = %reason, "keeping file system");
                report.protected.push(format!("{}: {}", fs.id, reason));
                continue;
            }
            if self.settings.dry_run {
                report.deleted.push(fs.id.clone());
                continue;
            }
            match self.delete_file_system(&fs.id, cancel).await {
                Ok(()) => report.deleted.push(fs.id.clone()),
                Err(e) => {
                    warn!(fs_id = %fs.id, error = %e, "could not delete file system");
                    report.failures.push(format!("{}: {}", fs.id, e));
                }
            }
        }
        Ok(report)
    }

    /// Delete mount targets, wait for them to disappear, then the file system
    async fn delete_file_system(
        &self,
        fs_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        for mount_target in self.file_systems.list_mount_targets(fs_id).await? {
            self.file_systems
                .delete_mount_target(&mount_target.id)
                .await?;
        }

        let file_systems = self.file_systems.as_ref();
        poll_until(
            &format!("mount targets of {} to be deleted", fs_id),
            &self.propagation,
            cancel,
            |_| async move {
                let remaining = file_systems.list_mount_targets(fs_id).await?;
                Ok(remaining.is_empty().then_some(()))
            },
        )
        .await?;

        self.file_systems.delete_file_system(fs_id).await?;
        info!(fs_id, "deleted unused file system");
        Ok(())
    }

    async fn reap_vaults(
        &self,
        namespace: &str,
        bound_arn: &str,
        cancel: &CancellationToken,
    ) -> Result<PassReport, Error> {
        let mut report = PassReport::default();

        for vault in self.backups.list_vaults().await? {
            if !self.ownership.owns(namespace, &vault.name) {
                continue;
            }
            let points = self
                .backups
                .list_recovery_points_by_vault(&vault.name)
                .await?;
            if points
                .iter()
                .any(|p| p.resource_arn.as_deref() == Some(bound_arn))
            {
                report.protected.push(format!(
                    "{}: holds recovery points of the bound file system",
                    vault.name
                ));
                continue;
            }
            if self.settings.dry_run {
                report.deleted.push(vault.name.clone());
                continue;
            }
            match self.empty_and_delete_vault(&vault.name, &points, cancel).await {
                Ok(()) => report.deleted.push(vault.name.clone()),
                Err(e) => {
                    warn!(vault = %vault.name, error = %e, "could not delete vault");
                    report.failures.push(format!("{}: {}", vault.name, e));
                }
            }
        }
        Ok(report)
    }

    async fn empty_and_delete_vault(
        &self,
        vault_name: &str,
        points: &[RecoveryPoint],
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        for point in points {
            self.backups
                .delete_recovery_point(vault_name, &point.arn)
                .await?;
        }

        let backups = self.backups.as_ref();
        poll_until(
            &format!("vault {} to empty", vault_name),
            &self.propagation,
            cancel,
            |_| async move {
                let remaining = backups.list_recovery_points_by_vault(vault_name).await?;
                Ok(remaining.is_empty().then_some(()))
            },
        )
        .await?;

        self.backups.delete_vault(vault_name).await?;
        info!(vault = vault_name, "deleted vault");
        Ok(())
    }
}

/// Why an owned file system must be kept, if it must
fn file_system_protection(
    fs: &FileSystem,
    bound: Option<&str>,
    referenced: &BTreeSet<String>,
    grace_cutoff: DateTime<Utc>,
) -> Option<String> {
    if bound == Some(fs.id.as_str()) {
        return Some("bound to the namespace".to_string());
    }
    if referenced.contains(&fs.id) {
        return Some("referenced by a cluster volume".to_string());
    }
    if fs.lifecycle_state != LIFECYCLE_AVAILABLE {
        return Some(format!("lifecycle state {}", fs.lifecycle_state));
    }
    if fs.created_at.is_some_and(|created| created > grace_cutoff) {
        return Some("inside the grace window".to_string());
    }
    None
}
