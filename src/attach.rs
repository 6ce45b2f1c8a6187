//! Attach orchestrator
//!
//! Sequences the storage workflows for one namespace as a strictly linear
//! state machine:
//!
//! ```text
//! Init -> ReplicateMountTargets -> ValidateMountTargets -> VerifyData
//!      -> BackupConfig -> Rebind -> RestartConsumers -> SnapshotNew -> Done
//! ```
//!
//! Every state declares a [`StepPolicy`]. A best-effort step that fails adds a
//! warning and the machine moves on; a required step that fails moves the
//! machine to `Failed` and the error propagates. Cancellation always
//! propagates.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
#[cfg(test)]
use mockall::automock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aws::{BackupService, FileSystemService};
use crate::backup::BackupJobController;
use crate::cluster::manifest::{claim_spec_from, render_manifests, volume_spec_from};
use crate::cluster::ClusterApi;
use crate::config::{
    BackupConfigPolicy, EngineConfig, BACKUP_HELPER_SCRIPT_ENV, DEFAULT_BACKUP_HELPER_SCRIPT_URL,
};
use crate::mount_targets::MountTargetReplicator;
use crate::naming::{is_file_system_id, match_consumers, NamespacePrefix, OwnershipMatcher};
use crate::poll::poll_until;
use crate::rebind::{RebindReport, VolumeRebindEngine};
use crate::resolver::StorageResolver;
use crate::restore::{RestoreJobController, RestoreOutcome};
use crate::verify::{DataVerifier, VerificationReport};
use crate::Error;

/// Orchestrator states, in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttachState {
    /// Validate the request and resolve the current file system
    Init,
    /// Copy mount targets from the current file system to the target
    ReplicateMountTargets,
    /// Check the target's mount targets
    ValidateMountTargets,
    /// Inspect the target's data
    VerifyData,
    /// Export the namespace's volume and claim definitions
    BackupConfig,
    /// Move claims to the target
    Rebind,
    /// Roll consumers one at a time
    RestartConsumers,
    /// Snapshot the newly attached file system
    SnapshotNew,
    /// Finished
    Done,
    /// A required step failed
    Failed,
}

/// What a failing step does to the run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepPolicy {
    /// Log, record a warning, continue
    BestEffort,
    /// Stop the run and propagate the error
    Required,
}

impl AttachState {
    /// Happy-path order
    pub const SEQUENCE: [AttachState; 9] = [
        Self::Init,
        Self::ReplicateMountTargets,
        Self::ValidateMountTargets,
        Self::VerifyData,
        Self::BackupConfig,
        Self::Rebind,
        Self::RestartConsumers,
        Self::SnapshotNew,
        Self::Done,
    ];

    /// Error policy of the step run in this state
    pub const fn policy(&self) -> StepPolicy {
        match self {
            Self::ReplicateMountTargets
            | Self::ValidateMountTargets
            | Self::VerifyData
            | Self::SnapshotNew => StepPolicy::BestEffort,
            Self::Init
            | Self::BackupConfig
            | Self::Rebind
            | Self::RestartConsumers
            | Self::Done
            | Self::Failed => StepPolicy::Required,
        }
    }

    /// State that follows on success; `None` for terminal states
    pub fn next(&self) -> Option<AttachState> {
        let at = Self::SEQUENCE.iter().position(|s| s == self)?;
        Self::SEQUENCE.get(at + 1).copied()
    }
}

impl fmt::Display for AttachState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "Init"),
            Self::ReplicateMountTargets => write!(f, "ReplicateMountTargets"),
            Self::ValidateMountTargets => write!(f, "ValidateMountTargets"),
            Self::VerifyData => write!(f, "VerifyData"),
            Self::BackupConfig => write!(f, "BackupConfig"),
            Self::Rebind => write!(f, "Rebind"),
            Self::RestartConsumers => write!(f, "RestartConsumers"),
            Self::SnapshotNew => write!(f, "SnapshotNew"),
            Self::Done => write!(f, "Done"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// What to attach where
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttachRequest {
    /// Provider region
    pub region: String,
    /// Namespace whose storage is changed
    pub namespace: String,
    /// File system to attach
    pub target_file_system_id: Option<String>,
    /// Claims to move to the target
    pub target_claim_names: Vec<String>,
    /// Workloads to restart, matched by substring against deployed names
    pub target_consumer_names: Vec<String>,
}

impl AttachRequest {
    /// Reject requests that would do nothing or cannot be carried out
    pub fn validate(&self) -> Result<(), Error> {
        if self.namespace.is_empty() {
            return Err(Error::validation("namespace is required"));
        }
        if self.region.is_empty() {
            return Err(Error::validation("region is required"));
        }
        if self.target_file_system_id.is_none()
            && self.target_claim_names.is_empty()
            && self.target_consumer_names.is_empty()
        {
            return Err(Error::validation(
                "nothing to do: supply a target file system, claim names or consumer names",
            ));
        }
        match &self.target_file_system_id {
            Some(fs_id) if !is_file_system_id(fs_id) => Err(Error::validation(format!(
                "invalid target file system id '{}'",
                fs_id
            ))),
            None if !self.target_claim_names.is_empty() => Err(Error::validation(
                "claim names require a target file system",
            )),
            _ => Ok(()),
        }
    }
}

/// Asks the operator a yes/no question
#[cfg_attr(test, automock)]
pub trait Confirm: Send + Sync {
    /// True to proceed
    fn confirm(&self, prompt: &str) -> bool;
}

/// Result of an attach run that reached `Done`
#[derive(Debug, Default)]
pub struct AttachOutcome {
    /// States entered, in order
    pub transitions: Vec<AttachState>,
    /// File system bound before the run, when one was resolved
    pub source_file_system: Option<String>,
    /// Non-fatal problems
    pub warnings: Vec<String>,
    /// Data verification report, when verification passed
    pub verification: Option<VerificationReport>,
    /// Exported configuration
    pub backup_file: Option<PathBuf>,
    /// Per-claim rebind results
    pub rebind: Option<RebindReport>,
    /// Workloads restarted, in order
    pub restarted: Vec<String>,
    /// Post-attach snapshot job
    pub snapshot_job_id: Option<String>,
    /// Background watcher of the snapshot job when the run did not wait for
    /// it. It stops when its poll budget runs out or the run is cancelled, and
    /// only runs while the runtime does, so callers about to exit await it.
    pub snapshot_monitor: Option<JoinHandle<()>>,
}

impl AttachOutcome {
    /// Last state entered
    pub fn state(&self) -> Option<AttachState> {
        self.transitions.last().copied()
    }
}

/// Result of a restore followed by an attach
#[derive(Debug)]
pub struct RestoreAttachOutcome {
    /// Restore job and throughput normalization
    pub restore: RestoreOutcome,
    /// Attach run; `None` when the restore produced nothing to attach
    pub attach: Option<AttachOutcome>,
}

/// Drives attach and restore-then-attach runs
pub struct AttachOrchestrator {
    config: EngineConfig,
    cluster: Arc<dyn ClusterApi>,
    backups: Arc<dyn BackupService>,
    file_systems: Arc<dyn FileSystemService>,
    ownership: Arc<dyn OwnershipMatcher>,
    confirm: Option<Arc<dyn Confirm>>,
}

impl AttachOrchestrator {
    /// Create an orchestrator using namespace-prefix ownership and no
    /// operator prompt
    pub fn new(
        config: EngineConfig,
        cluster: Arc<dyn ClusterApi>,
        backups: Arc<dyn BackupService>,
        file_systems: Arc<dyn FileSystemService>,
    ) -> Self {
        Self {
            config,
            cluster,
            backups,
            file_systems,
            ownership: Arc::new(NamespacePrefix),
            confirm: None,
        }
    }

    /// Replace the ownership rule
    pub fn with_ownership(mut self, ownership: Arc<dyn OwnershipMatcher>) -> Self {
        self.ownership = ownership;
        self
    }

    /// Operator prompt for [`BackupConfigPolicy::AskFirst`]
    pub fn with_confirm(mut self, confirm: Arc<dyn Confirm>) -> Self {
        self.confirm = Some(confirm);
        self
    }

    /// Run the state machine to `Done`.
    ///
    /// Returns the error of the first required step that fails.
    pub async fn attach(
        &self,
        request: &AttachRequest,
        cancel: &CancellationToken,
    ) -> Result<AttachOutcome, Error> {
        let mut run = Run {
            namespace: &request.namespace,
            outcome: AttachOutcome::default(),
        };
        let target = request.target_file_system_id.as_deref();

        run.enter(AttachState::Init);
        let init = async {
            request.validate()?;
            match target {
                Some(_) => self.resolve_source(&request.namespace).await.map(Some),
                None => Ok(None),
            }
        }
        .await;
        run.outcome.source_file_system = run.settle(AttachState::Init, init)?.flatten();
        let source = run.outcome.source_file_system.clone();

        run.advance(AttachState::ReplicateMountTargets, cancel)?;
        if let (Some(source), Some(target)) = (source.as_deref(), target) {
            if source == target {
                debug!(fs_id = target, "target is already the bound file system");
            } else {
                let result = MountTargetReplicator::new(Arc::clone(&self.file_systems))
                    .replicate(source, target)
                    .await;
                if let Some(report) = run.settle(AttachState::ReplicateMountTargets, result)? {
                    for failure in report.failed {
                        run.warn(AttachState::ReplicateMountTargets, failure);
                    }
                }
            }
        }

        run.advance(AttachState::ValidateMountTargets, cancel)?;
        if let Some(target) = target {
            let result = MountTargetReplicator::new(Arc::clone(&self.file_systems))
                .validate(target)
                .await;
            run.settle(AttachState::ValidateMountTargets, result)?;
        }

        run.advance(AttachState::VerifyData, cancel)?;
        if let Some(target) = target {
            let result = self.verify(&request.namespace, target, cancel).await;
            if let Some(report) = run.settle(AttachState::VerifyData, result)? {
                if !report.passed {
                    run.warn(
                        AttachState::VerifyData,
                        "verification did not report PASS".to_string(),
                    );
                }
                run.outcome.verification = Some(report);
            }
        }

        run.advance(AttachState::BackupConfig, cancel)?;
        let result = self.backup_config(&request.namespace).await;
        run.outcome.backup_file = run.settle(AttachState::BackupConfig, result)?.flatten();

        run.advance(AttachState::Rebind, cancel)?;
        match target {
            Some(target) if !request.target_claim_names.is_empty() => {
                let result = VolumeRebindEngine::new(
                    Arc::clone(&self.cluster),
                    self.config.polls.claim_bind,
                    self.config.polls.propagation,
                )
                .rebind(&request.namespace, target, &request.target_claim_names, cancel)
                .await;
                if let Some(report) = run.settle(AttachState::Rebind, result)? {
                    if let Some(partial) = report.partial_failure() {
                        run.warn(AttachState::Rebind, partial.to_string());
                    }
                    run.outcome.rebind = Some(report);
                }
            }
            _ => debug!(namespace = %request.namespace, "no claims to rebind"),
        }

        run.advance(AttachState::RestartConsumers, cancel)?;
        let result = self
            .restart_consumers(&request.namespace, &request.target_consumer_names, cancel)
            .await;
        if let Some((restarted, unmatched)) = run.settle(AttachState::RestartConsumers, result)? {
            for name in unmatched {
                run.warn(
                    AttachState::RestartConsumers,
                    format!("no deployed workload matches consumer '{}'", name),
                );
            }
            run.outcome.restarted = restarted;
        }

        run.advance(AttachState::SnapshotNew, cancel)?;
        if let Some(target) = target {
            let result = self.snapshot(request, target, cancel).await;
            if let Some((job_id, monitor)) = run.settle(AttachState::SnapshotNew, result)? {
                run.outcome.snapshot_job_id = Some(job_id);
                run.outcome.snapshot_monitor = monitor;
            }
        }

        run.advance(AttachState::Done, cancel)?;
        info!(
            namespace = %request.namespace,
            warnings = run.outcome.warnings.len(),
            "attach finished"
        );
        Ok(run.outcome)
    }

    /// Restore a recovery point into a new file system and attach it.
    ///
    /// The request's `target_file_system_id` is ignored and replaced by the
    /// restored file system. A restore that yields no file system ends the run
    /// without attaching.
    pub async fn restore_and_attach(
        &self,
        request: &AttachRequest,
        recovery_point_arn: &str,
        cancel: &CancellationToken,
    ) -> Result<RestoreAttachOutcome, Error> {
        let role_arn = self.backups.role_arn(&self.config.backup_role).await?;
        let restore = RestoreJobController::new(
            Arc::clone(&self.backups),
            Arc::clone(&self.file_systems),
        )
        .restore(
            &request.region,
            recovery_point_arn,
            &role_arn,
            &self.config.polls.restore_job,
            cancel,
        )
        .await?;

        let Some(fs_id) = restore.file_system_id.clone() else {
            info!(
                namespace = %request.namespace,
                recovery_point = recovery_point_arn,
                "nothing to attach"
            );
            return Ok(RestoreAttachOutcome {
                restore,
                attach: None,
            });
        };

        let request = AttachRequest {
            target_file_system_id: Some(fs_id),
            ..request.clone()
        };
        let mut attach = self.attach(&request, cancel).await?;
        let mut warnings = restore.warnings.clone();
        warnings.append(&mut attach.warnings);
        attach.warnings = warnings;
        Ok(RestoreAttachOutcome {
            restore,
            attach: Some(attach),
        })
    }

    async fn resolve_source(&self, namespace: &str) -> Result<String, Error> {
        StorageResolver::with_ownership(Arc::clone(&self.cluster), Arc::clone(&self.ownership))
            .resolve(namespace)
            .await
    }

    fn verifier(&self) -> DataVerifier {
        DataVerifier::new(
            Arc::clone(&self.cluster),
            self.config.verification.clone(),
            self.config.polls.verification,
            self.config.polls.claim_bind,
        )
    }

    /// Inspect through a claim already bound to the target when there is one,
    /// otherwise through a scratch pair
    async fn verify(
        &self,
        namespace: &str,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<VerificationReport, Error> {
        let bound = StorageResolver::with_ownership(
            Arc::clone(&self.cluster),
            Arc::clone(&self.ownership),
        )
        .bound_claims(namespace)
        .await?;
        let verifier = self.verifier();
        match bound.iter().find(|b| b.file_system_id() == Some(target)) {
            Some(b) => verifier.verify_claim(namespace, &b.claim.name, cancel).await,
            None => verifier.verify_file_system(namespace, target, cancel).await,
        }
    }

    /// Write the namespace's file-system volumes and claims to a timestamped
    /// YAML file. `None` when the policy or the operator declines, or there
    /// is nothing to export.
    async fn backup_config(&self, namespace: &str) -> Result<Option<PathBuf>, Error> {
        match self.config.backup_config {
            BackupConfigPolicy::Skip => {
                debug!(namespace, "configuration backup skipped by policy");
                return Ok(None);
            }
            BackupConfigPolicy::AskFirst => {
                let prompt = format!(
                    "Back up volume and claim definitions of {} to {}?",
                    namespace,
                    self.config.backup_dir.display()
                );
                let approved = self.confirm.as_ref().is_some_and(|c| c.confirm(&prompt));
                if !approved {
                    info!(namespace, "configuration backup declined");
                    return Ok(None);
                }
            }
            BackupConfigPolicy::Always => {}
        }

        let bound = StorageResolver::with_ownership(
            Arc::clone(&self.cluster),
            Arc::clone(&self.ownership),
        )
        .bound_claims(namespace)
        .await?;

        let mut volumes = Vec::new();
        let mut claims = Vec::new();
        for b in &bound {
            let Some(fs_id) = b.file_system_id() else {
                continue;
            };
            let volume = volume_spec_from(&b.volume, fs_id, (namespace, &b.claim.name));
            claims.push(claim_spec_from(&b.claim, &volume));
            volumes.push(volume);
        }
        if volumes.is_empty() {
            info!(namespace, "no file-system volumes to back up");
            return Ok(None);
        }

        if self.config.helper_script_url == DEFAULT_BACKUP_HELPER_SCRIPT_URL {
            warn!(
                namespace,
                env = BACKUP_HELPER_SCRIPT_ENV,
                "backup names the placeholder helper script location"
            );
        }
        let now = Utc::now();
        let body = render_manifests(&volumes, &claims)?;
        let contents = format!(
            "# Volume and claim definitions of namespace {}\n# Taken {}\n# Restore helper: {}\n{}",
            namespace,
            now.to_rfc3339(),
            self.config.helper_script_url,
            body
        );

        tokio::fs::create_dir_all(&self.config.backup_dir).await?;
        let path = self.config.backup_dir.join(format!(
            "{}-volumes-{}.yaml",
            namespace,
            now.format("%Y%m%dT%H%M%SZ")
        ));
        tokio::fs::write(&path, contents).await?;
        info!(
            namespace,
            path = %path.display(),
            volumes = volumes.len(),
            "configuration backed up"
        );
        Ok(Some(path))
    }

    /// Restart every workload matching a requested consumer, one at a time,
    /// each reaching steady state before the next starts. Returns the
    /// restarted names and the requested names that matched nothing.
    async fn restart_consumers(
        &self,
        namespace: &str,
        requested: &[String],
        cancel: &CancellationToken,
    ) -> Result<(Vec<String>, Vec<String>), Error> {
        if requested.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let workloads = self.cluster.list_workloads(namespace).await?;
        let deployed: Vec<String> = workloads.iter().map(|w| w.name.clone()).collect();

        let mut seen = BTreeSet::new();
        let mut ordered = Vec::new();
        let mut unmatched = Vec::new();
        for name in requested {
            let matches = match_consumers(name, &deployed);
            if matches.is_empty() {
                unmatched.push(name.clone());
            }
            for m in matches {
                if seen.insert(m.to_string()) {
                    ordered.push(m.to_string());
                }
            }
        }

        let mut restarted = Vec::with_capacity(ordered.len());
        for name in ordered {
            let Some(workload) = workloads.iter().find(|w| w.name == name) else {
                continue;
            };
            self.cluster.restart_workload(namespace, workload).await?;
            info!(namespace, workload = %name, kind = ?workload.kind, "restarted consumer");

            let cluster = self.cluster.as_ref();
            poll_until(
                &format!("rollout of {}/{}", namespace, name),
                &self.config.polls.rollout,
                cancel,
                |_| async move {
                    Ok(cluster
                        .workload_ready(namespace, workload)
                        .await?
                        .then_some(()))
                },
            )
            .await?;
            debug!(namespace, workload = %name, "consumer ready");
            restarted.push(name);
        }
        Ok((restarted, unmatched))
    }

    /// Start a snapshot of the newly attached file system. Waits for it when
    /// configured to, otherwise hands back a background monitor.
    async fn snapshot(
        &self,
        request: &AttachRequest,
        fs_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, Option<JoinHandle<()>>), Error> {
        let controller =
            BackupJobController::new(Arc::clone(&self.backups), self.config.backup_role.clone());
        let vault = match &self.config.snapshot_vault {
            Some(vault) => vault.clone(),
            None => {
                controller
                    .find_vault(&request.namespace, self.ownership.as_ref())
                    .await?
            }
        };
        let account_id = self.backups.account_id().await?;
        let job_id = controller
            .start_snapshot(&request.region, &account_id, fs_id, &vault)
            .await?;

        if self.config.wait_for_snapshot {
            controller
                .await_completion(&job_id, &self.config.polls.backup_job, cancel)
                .await?;
            return Ok((job_id, None));
        }
        let monitor = controller.spawn_completion_monitor(
            job_id.clone(),
            self.config.polls.backup_job,
            cancel.child_token(),
        );
        Ok((job_id, Some(monitor)))
    }
}

/// Bookkeeping for one attach run
struct Run<'a> {
    namespace: &'a str,
    outcome: AttachOutcome,
}

impl Run<'_> {
    fn enter(&mut self, state: AttachState) {
        info!(namespace = self.namespace, %state, "entering step");
        self.outcome.transitions.push(state);
    }

    /// Enter the next state unless the run was cancelled
    fn advance(&mut self, state: AttachState, cancel: &CancellationToken) -> Result<(), Error> {
        if cancel.is_cancelled() {
            self.outcome.transitions.push(AttachState::Failed);
            return Err(Error::cancelled(format!("attach of {} before {}", self.namespace, state)));
        }
        self.enter(state);
        Ok(())
    }

    fn warn(&mut self, state: AttachState, message: String) {
        warn!(namespace = self.namespace, %state, %message, "step warning");
        self.outcome.warnings.push(format!("{}: {}", state, message));
    }

    /// Apply the state's policy to a step result
    fn settle<T>(
        &mut self,
        state: AttachState,
        result: Result<T, Error>,
    ) -> Result<Option<T>, Error> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_cancelled() => {
                self.outcome.transitions.push(AttachState::Failed);
                Err(e)
            }
            Err(e) => match state.policy() {
                StepPolicy::BestEffort => {
                    self.warn(state, e.to_string());
                    Ok(None)
                }
                StepPolicy::Required => {
                    error!(namespace = self.namespace, %state, error = %e, "required step failed");
                    self.outcome.transitions.push(AttachState::Failed);
                    Err(e)
                }
            },
        }
    }
}
