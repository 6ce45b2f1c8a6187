//! Mount target replication and validation
//!
//! A restored file system starts without network mount points. Replication
//! copies them subnet by subnet from the file system being replaced; the
//! validator then reports every problem it can find in one error.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::aws::{is_already_exists, FileSystemService};
use crate::Error;

/// Subnet state in which mount targets are reachable
const SUBNET_AVAILABLE: &str = "available";

/// Per-subnet result of a replication
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicationReport {
    /// Subnets that received a new mount target
    pub created: Vec<String>,
    /// Subnets that already had one
    pub existing: Vec<String>,
    /// `subnet: reason` for each subnet that could not be copied
    pub failed: Vec<String>,
}

impl ReplicationReport {
    /// True when every subnet ended up with a mount target
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Copies and checks mount targets
pub struct MountTargetReplicator {
    file_systems: Arc<dyn FileSystemService>,
}

impl MountTargetReplicator {
    /// Create a replicator
    pub fn new(file_systems: Arc<dyn FileSystemService>) -> Self {
        Self { file_systems }
    }

    /// Copy every mount target of `source_fs` (subnet plus security groups)
    /// onto `target_fs`. A subnet that already has one is left alone. Only a
    /// failure to read the source aborts the copy.
    pub async fn replicate(
        &self,
        source_fs: &str,
        target_fs: &str,
    ) -> Result<ReplicationReport, Error> {
        let mut report = ReplicationReport::default();
        let source_targets = self.file_systems.list_mount_targets(source_fs).await?;
        let present: BTreeSet<String> = self
            .file_systems
            .list_mount_targets(target_fs)
            .await?
            .into_iter()
            .map(|mt| mt.subnet_id)
            .collect();

        for mount_target in source_targets {
            let subnet = mount_target.subnet_id;
            if present.contains(&subnet) {
                debug!(target_fs, subnet = %subnet, "mount target already present");
                report.existing.push(subnet);
                continue;
            }

            let groups = match self
                .file_systems
                .mount_target_security_groups(&mount_target.id)
                .await
            {
                Ok(groups) => groups,
                Err(e) => {
                    warn!(
                        mount_target = %mount_target.id,
                        error = %e,
                        "could not read security groups"
                    );
                    report.failed.push(format!("{}: {}", subnet, e));
                    continue;
                }
            };

            match self
                .file_systems
                .create_mount_target(target_fs, &subnet, &groups)
                .await
            {
                Ok(()) => {
                    info!(target_fs, subnet = %subnet, groups = ?groups, "created mount target");
                    report.created.push(subnet);
                }
                Err(e) if is_already_exists(&e) => {
                    debug!(target_fs, subnet = %subnet, "mount target appeared concurrently");
                    report.existing.push(subnet);
                }
                Err(e) => {
                    warn!(
                        target_fs,
                        subnet = %subnet,
                        error = %e,
                        "mount target replication failed"
                    );
                    report.failed.push(format!("{}: {}", subnet, e));
                }
            }
        }

        Ok(report)
    }

    /// Check that `fs_id` is mountable: at least one mount target, every
    /// subnet available, and every mount target guarded by a security group.
    /// All violations are collected into one [`Error::Validation`].
    pub async fn validate(&self, fs_id: &str) -> Result<(), Error> {
        let targets = self.file_systems.list_mount_targets(fs_id).await?;
        if targets.is_empty() {
            return Err(Error::validation(format!(
                "{} has no mount targets",
                fs_id
            )));
        }

        let mut issues = Vec::new();

        let subnet_ids: Vec<String> = targets
            .iter()
            .map(|mt| mt.subnet_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let subnets = self.file_systems.describe_subnets(&subnet_ids).await?;
        for subnet_id in &subnet_ids {
            match subnets.iter().find(|s| &s.id == subnet_id) {
                Some(subnet) if subnet.state == SUBNET_AVAILABLE => {}
                Some(subnet) => issues.push(format!(
                    "subnet {} is {}, not {}",
                    subnet.id, subnet.state, SUBNET_AVAILABLE
                )),
                None => issues.push(format!("subnet {} not found", subnet_id)),
            }
        }

        for target in &targets {
            match self
                .file_systems
                .mount_target_security_groups(&target.id)
                .await
            {
                Ok(groups) if groups.is_empty() => issues.push(format!(
                    "mount target {} in {} has no security groups",
                    target.id, target.subnet_id
                )),
                Ok(_) => {}
                Err(e) => issues.push(format!(
                    "security groups of mount target {} unreadable: {}",
                    target.id, e
                )),
            }
        }

        if issues.is_empty() {
            info!(fs_id, mount_targets = targets.len(), "mount targets valid");
            Ok(())
        } else {
            Err(Error::validation(format!(
                "{} mount target issue(s) on {}: {}",
                issues.len(),
                fs_id,
                issues.join("; ")
            )))
        }
    }
}
