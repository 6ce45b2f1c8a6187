//! Volume rebind engine
//!
//! A volume's backing file system cannot change in place, so moving a claim
//! to another file system means retiring the old binding and creating a new
//! one. Names are kept so workloads find their storage under the same claim
//! and ordinal.
//!
//! Per claim, strictly in order:
//!
//! 1. terminate pods mounting the claim
//! 2. delete the claim, then the volume (the control plane keeps a volume
//!    while a bound claim references it)
//! 3. recreate the volume with the new backing id
//! 4. recreate the claim bound to it and wait for `Bound`
//!
//! Claims are processed one at a time. A failing claim is reported and the
//! rest still run.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::manifest::{
    claim_spec_from, volume_spec_from, DEFAULT_ACCESS_MODE, DEFAULT_CAPACITY,
};
use crate::cluster::{ClaimInfo, ClusterApi, VolumeInfo, DEFAULT_STORAGE_CLASS};
use crate::naming::is_file_system_id;
use crate::poll::{poll_until, PollPolicy};
use crate::Error;

/// What happened to one claim
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Volume and claim were recreated against the target
    Recreated {
        /// Volume name (unchanged)
        volume: String,
    },
    /// The claim was already bound to the target; nothing was touched
    AlreadyBound {
        /// Volume name
        volume: String,
    },
    /// The claim could not be moved
    Failed {
        /// Why
        reason: String,
    },
}

impl ClaimOutcome {
    /// True for both success variants
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// Per-claim results of a rebind
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RebindReport {
    /// File system the claims were moved to
    pub target_file_system: String,
    /// `(claim, outcome)` in request order
    pub claims: Vec<(String, ClaimOutcome)>,
}

impl RebindReport {
    /// Claims now bound to the target
    pub fn succeeded(&self) -> usize {
        self.claims.iter().filter(|(_, o)| o.is_success()).count()
    }

    /// Claims attempted
    pub fn total(&self) -> usize {
        self.claims.len()
    }

    /// `claim: reason` per failed claim
    pub fn failures(&self) -> Vec<String> {
        self.claims
            .iter()
            .filter_map(|(claim, outcome)| match outcome {
                ClaimOutcome::Failed { reason } => Some(format!("{}: {}", claim, reason)),
                _ => None,
            })
            .collect()
    }

    /// Human summary, e.g. `recreated 2/3 claims`
    pub fn summary(&self) -> String {
        format!("recreated {}/{} claims", self.succeeded(), self.total())
    }

    /// Partial failure describing the failed claims, if any failed
    pub fn partial_failure(&self) -> Option<Error> {
        let failures = self.failures();
        (!failures.is_empty()).then(|| Error::PartialFailure {
            succeeded: self.succeeded(),
            total: self.total(),
            failures,
        })
    }
}

/// Moves claims onto another file system by delete and recreate
pub struct VolumeRebindEngine {
    cluster: Arc<dyn ClusterApi>,
    bind: PollPolicy,
    propagation: PollPolicy,
}

impl VolumeRebindEngine {
    /// Create an engine waiting `bind` for claims to bind and `propagation`
    /// for deletions to finish
    pub fn new(cluster: Arc<dyn ClusterApi>, bind: PollPolicy, propagation: PollPolicy) -> Self {
        Self {
            cluster,
            bind,
            propagation,
        }
    }

    /// Rebind `claim_names` in `namespace` to `target_fs`.
    ///
    /// Succeeds when at least one claim ends up bound to the target; the
    /// report lists every claim's outcome. When none does, the error is a
    /// [`Error::PartialFailure`] with zero successes. Cancellation stops the
    /// whole run.
    pub async fn rebind(
        &self,
        namespace: &str,
        target_fs: &str,
        claim_names: &[String],
        cancel: &CancellationToken,
    ) -> Result<RebindReport, Error> {
        if !is_file_system_id(target_fs) {
            return Err(Error::validation(format!(
                "invalid target file system id '{}'",
                target_fs
            )));
        }
        if claim_names.is_empty() {
            return Err(Error::validation("no claims to rebind"));
        }

        let mut report = RebindReport {
            target_file_system: target_fs.to_string(),
            claims: Vec::with_capacity(claim_names.len()),
        };

        for claim in claim_names {
            if cancel.is_cancelled() {
                return Err(Error::cancelled(format!("rebind of {}/{}", namespace, claim)));
            }
            let outcome = match self.rebind_claim(namespace, target_fs, claim, cancel).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(namespace, claim = %claim, error = %e, "claim rebind failed");
                    ClaimOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            report.claims.push((claim.clone(), outcome));
        }

        info!(namespace, fs_id = target_fs, "{}", report.summary());
        if report.succeeded() == 0 {
            return Err(Error::PartialFailure {
                succeeded: 0,
                total: report.total(),
                failures: report.failures(),
            });
        }
        Ok(report)
    }

    async fn rebind_claim(
        &self,
        namespace: &str,
        target_fs: &str,
        claim_name: &str,
        cancel: &CancellationToken,
    ) -> Result<ClaimOutcome, Error> {
        let claim = self.cluster.get_claim(namespace, claim_name).await?;
        let (volume_name, template) = self
            .locate_volume(namespace, claim_name, claim.as_ref())
            .await?;

        if let (Some(claim), Some(volume)) = (&claim, &template) {
            if claim.is_bound() && volume.file_system_id() == Some(target_fs) {
                debug!(
                    namespace,
                    claim = claim_name,
                    volume = %volume_name,
                    "already bound to target"
                );
                return Ok(ClaimOutcome::AlreadyBound {
                    volume: volume_name,
                });
            }
        }

        for pod in self.cluster.pods_using_claim(namespace, claim_name).await? {
            info!(namespace, pod = %pod, claim = claim_name, "terminating consumer pod");
            self.cluster.delete_pod(namespace, &pod).await?;
        }

        self.cluster.delete_claim(namespace, claim_name).await?;
        self.cluster.delete_volume(&volume_name).await?;
        self.wait_deleted(namespace, claim_name, &volume_name, cancel)
            .await?;

        let template = template.unwrap_or_else(|| fallback_template(&volume_name, claim.as_ref()));
        let volume_spec = volume_spec_from(&template, target_fs, (namespace, claim_name));
        self.cluster.create_volume(&volume_spec).await?;

        let claim_info = claim.unwrap_or_else(|| ClaimInfo {
            namespace: namespace.to_string(),
            name: claim_name.to_string(),
            volume_name: None,
            phase: None,
            storage: None,
            storage_class: None,
            access_modes: Vec::new(),
        });
        self.cluster
            .create_claim(&claim_spec_from(&claim_info, &volume_spec))
            .await?;

        let cluster = self.cluster.as_ref();
        let expected = volume_spec.name.as_str();
        poll_until(
            &format!("claim {}/{} to bind", namespace, claim_name),
            &self.bind,
            cancel,
            |_| async move {
                let bound = cluster
                    .get_claim(namespace, claim_name)
                    .await?
                    .is_some_and(|c| c.is_bound() && c.volume_name.as_deref() == Some(expected));
                Ok(bound.then_some(()))
            },
        )
        .await?;

        info!(
            namespace,
            claim = claim_name,
            volume = %volume_spec.name,
            fs_id = target_fs,
            "claim rebound"
        );
        Ok(ClaimOutcome::Recreated {
            volume: volume_spec.name,
        })
    }

    /// Name of the volume behind a claim, and the volume if it still exists.
    ///
    /// A claim deleted by an interrupted earlier run is found again through
    /// the volume's claim reference.
    async fn locate_volume(
        &self,
        namespace: &str,
        claim_name: &str,
        claim: Option<&ClaimInfo>,
    ) -> Result<(String, Option<VolumeInfo>), Error> {
        if let Some(volume_name) = claim.and_then(|c| c.volume_name.clone()) {
            let volume = self.cluster.get_volume(&volume_name).await?;
            return Ok((volume_name, volume));
        }

        self.cluster
            .list_volumes()
            .await?
            .into_iter()
            .find(|v| {
                v.claim_namespace.as_deref() == Some(namespace)
                    && v.claim_name.as_deref() == Some(claim_name)
            })
            .map(|v| (v.name.clone(), Some(v)))
            .ok_or_else(|| {
                Error::not_found(format!("volume for claim {}/{}", namespace, claim_name))
            })
    }

    async fn wait_deleted(
        &self,
        namespace: &str,
        claim_name: &str,
        volume_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let cluster = self.cluster.as_ref();
        poll_until(
            &format!("claim {}/{} and volume {} to be deleted", namespace, claim_name, volume_name),
            &self.propagation,
            cancel,
            |_| async move {
                let claim_gone = cluster.get_claim(namespace, claim_name).await?.is_none();
                let volume_gone = cluster.get_volume(volume_name).await?.is_none();
                Ok((claim_gone && volume_gone).then_some(()))
            },
        )
        .await
    }
}

/// Volume template when the old volume is already gone
fn fallback_template(volume_name: &str, claim: Option<&ClaimInfo>) -> VolumeInfo {
    VolumeInfo {
        name: volume_name.to_string(),
        driver: None,
        volume_handle: None,
        claim_namespace: None,
        claim_name: None,
        capacity: Some(
            claim
                .and_then(|c| c.storage.clone())
                .unwrap_or_else(|| DEFAULT_CAPACITY.to_string()),
        ),
        storage_class: Some(
            claim
                .and_then(|c| c.storage_class.clone())
                .unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_string()),
        ),
        access_modes: claim
            .map(|c| c.access_modes.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_ACCESS_MODE.to_string()]),
        reclaim_policy: None,
        phase: None,
    }
}
