//! In-memory cluster and provider for driving multi-step workflows in tests
//!
//! Both fakes record every mutating call in an event log so tests can assert
//! on ordering, not just on final state.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::aws::{
    BackupJob, BackupService, BackupVault, FileSystem, FileSystemService, JobState, MountTarget,
    RecoveryPoint, RestoreJob, StartBackupRequest, StartRestoreRequest, Subnet, ThroughputMode,
};
use crate::cluster::{
    ClaimInfo, ClaimSpec, ClusterApi, InspectionPodSpec, PodPhase, VolumeInfo, VolumeSpec,
    WorkloadKind, WorkloadRef, EFS_CSI_DRIVER, PHASE_BOUND, RECLAIM_RETAIN,
};
use crate::Error;

pub const ACCOUNT_ID: &str = "123456789012";
pub const REGION: &str = "us-east-1";

// =============================================================================
// Cluster
// =============================================================================

#[derive(Clone, Debug)]
pub struct FakePod {
    pub claims: Vec<String>,
    pub phase: PodPhase,
    pub logs: String,
}

#[derive(Default)]
pub struct ClusterState {
    pub claims: BTreeMap<(String, String), ClaimInfo>,
    pub volumes: BTreeMap<String, VolumeInfo>,
    pub pods: BTreeMap<(String, String), FakePod>,
    pub workloads: BTreeMap<String, Vec<WorkloadRef>>,
    pub events: Vec<String>,
    /// Claims created against an existing volume bind immediately
    pub bind_claims: bool,
    pub fail_create_volume: BTreeSet<String>,
    pub unready_workloads: BTreeSet<String>,
    pub failing_restarts: BTreeSet<String>,
    /// Phase and log every inspection pod ends in
    pub inspection_outcome: Option<(PodPhase, String)>,
    /// Log fetches fail
    pub unreadable_logs: bool,
}

pub struct FakeCluster {
    pub state: Mutex<ClusterState>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClusterState {
                bind_claims: true,
                ..Default::default()
            }),
        }
    }

    /// A claim bound to a retained CSI volume backed by `handle`
    pub fn with_bound_pair(self, namespace: &str, claim: &str, volume: &str, handle: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state
                .volumes
                .insert(volume.to_string(), volume_info(volume, handle, Some((namespace, claim))));
            state.claims.insert(
                (namespace.to_string(), claim.to_string()),
                ClaimInfo {
                    namespace: namespace.to_string(),
                    name: claim.to_string(),
                    volume_name: Some(volume.to_string()),
                    phase: Some(PHASE_BOUND.to_string()),
                    storage: Some("100Gi".to_string()),
                    storage_class: Some("efs-sc".to_string()),
                    access_modes: vec!["ReadWriteMany".to_string()],
                },
            );
        }
        self
    }

    /// A volume with no claim in any watched namespace
    pub fn with_volume(self, volume: &str, handle: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .volumes
            .insert(volume.to_string(), volume_info(volume, handle, None));
        self
    }

    pub fn with_pod(self, namespace: &str, pod: &str, claim: &str) -> Self {
        self.state.lock().unwrap().pods.insert(
            (namespace.to_string(), pod.to_string()),
            FakePod {
                claims: vec![claim.to_string()],
                phase: PodPhase::Running,
                logs: String::new(),
            },
        );
        self
    }

    pub fn with_workload(self, namespace: &str, kind: WorkloadKind, name: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .workloads
            .entry(namespace.to_string())
            .or_default()
            .push(WorkloadRef {
                kind,
                name: name.to_string(),
            });
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn claim(&self, namespace: &str, name: &str) -> Option<ClaimInfo> {
        self.state
            .lock()
            .unwrap()
            .claims
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn volume(&self, name: &str) -> Option<VolumeInfo> {
        self.state.lock().unwrap().volumes.get(name).cloned()
    }

    pub fn set<F: FnOnce(&mut ClusterState)>(&self, f: F) {
        f(&mut self.state.lock().unwrap());
    }
}

pub fn volume_info(name: &str, handle: &str, claim: Option<(&str, &str)>) -> VolumeInfo {
    VolumeInfo {
        name: name.to_string(),
        driver: Some(EFS_CSI_DRIVER.to_string()),
        volume_handle: Some(handle.to_string()),
        claim_namespace: claim.map(|c| c.0.to_string()),
        claim_name: claim.map(|c| c.1.to_string()),
        capacity: Some("100Gi".to_string()),
        storage_class: Some("efs-sc".to_string()),
        access_modes: vec!["ReadWriteMany".to_string()],
        reclaim_policy: Some(RECLAIM_RETAIN.to_string()),
        phase: Some(if claim.is_some() { "Bound" } else { "Available" }.to_string()),
    }
}

fn conflict(what: String) -> Error {
    Error::ExternalCommand {
        command: "create".to_string(),
        exit_code: Some(409),
        output: format!("{} already exists", what),
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_claims(&self, namespace: &str) -> Result<Vec<ClaimInfo>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .claims
            .values()
            .filter(|c| c.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimInfo>, Error> {
        Ok(self.claim(namespace, name))
    }

    async fn get_volume(&self, name: &str) -> Result<Option<VolumeInfo>, Error> {
        Ok(self.volume(name))
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>, Error> {
        Ok(self.state.lock().unwrap().volumes.values().cloned().collect())
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("delete_claim {}/{}", namespace, name));
        state
            .claims
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let still_claimed = state
            .claims
            .values()
            .any(|c| c.volume_name.as_deref() == Some(name));
        if still_claimed {
            return Err(Error::ExternalCommand {
                command: format!("delete volume {}", name),
                exit_code: Some(1),
                output: "volume is still bound to a claim".to_string(),
            });
        }
        state.events.push(format!("delete_volume {}", name));
        state.volumes.remove(name);
        Ok(())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create_volume.contains(&spec.name) {
            return Err(Error::ExternalCommand {
                command: format!("create volume {}", spec.name),
                exit_code: Some(1),
                output: "admission webhook denied the request".to_string(),
            });
        }
        if state.volumes.contains_key(&spec.name) {
            return Err(conflict(format!("volume {}", spec.name)));
        }
        state
            .events
            .push(format!("create_volume {} {}", spec.name, spec.file_system_id));
        let claim = spec.claim_ref.as_ref().map(|(ns, n)| (ns.as_str(), n.as_str()));
        let mut info = volume_info(&spec.name, &spec.file_system_id, claim);
        info.phase = Some("Available".to_string());
        info.reclaim_policy = Some(RECLAIM_RETAIN.to_string());
        state.volumes.insert(spec.name.clone(), info);
        Ok(())
    }

    async fn create_claim(&self, spec: &ClaimSpec) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let key = (spec.namespace.clone(), spec.name.clone());
        if state.claims.contains_key(&key) {
            return Err(conflict(format!("claim {}/{}", spec.namespace, spec.name)));
        }
        state.events.push(format!(
            "create_claim {}/{} {}",
            spec.namespace, spec.name, spec.volume_name
        ));
        let bound = state.bind_claims && state.volumes.contains_key(&spec.volume_name);
        if bound {
            if let Some(volume) = state.volumes.get_mut(&spec.volume_name) {
                volume.phase = Some(PHASE_BOUND.to_string());
            }
        }
        state.claims.insert(
            key,
            ClaimInfo {
                namespace: spec.namespace.clone(),
                name: spec.name.clone(),
                volume_name: Some(spec.volume_name.clone()),
                phase: Some(if bound { PHASE_BOUND } else { "Pending" }.to_string()),
                storage: Some(spec.storage.clone()),
                storage_class: Some(spec.storage_class.clone()),
                access_modes: spec.access_modes.clone(),
            },
        );
        Ok(())
    }

    async fn pods_using_claim(&self, namespace: &str, claim: &str) -> Result<Vec<String>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), pod)| ns == namespace && pod.claims.iter().any(|c| c == claim))
            .map(|((_, name), _)| name.clone())
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("delete_pod {}/{}", namespace, name));
        state.pods.remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn list_workloads(&self, namespace: &str) -> Result<Vec<WorkloadRef>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .workloads
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    async fn restart_workload(
        &self,
        namespace: &str,
        workload: &WorkloadRef,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.failing_restarts.contains(&workload.name) {
            return Err(Error::not_found(format!("workload {}", workload.name)));
        }
        state
            .events
            .push(format!("restart {}/{}", namespace, workload.name));
        Ok(())
    }

    async fn workload_ready(&self, namespace: &str, workload: &WorkloadRef) -> Result<bool, Error> {
        let mut state = self.state.lock().unwrap();
        state
            .events
            .push(format!("ready? {}/{}", namespace, workload.name));
        Ok(!state.unready_workloads.contains(&workload.name))
    }

    async fn create_inspection_pod(&self, spec: &InspectionPodSpec) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!(
            "create_pod {}/{} {}",
            spec.namespace, spec.name, spec.claim_name
        ));
        let (phase, logs) = state
            .inspection_outcome
            .clone()
            .unwrap_or((PodPhase::Succeeded, "VERIFY_RESULT=PASS\n".to_string()));
        state.pods.insert(
            (spec.namespace.clone(), spec.name.clone()),
            FakePod {
                claims: vec![spec.claim_name.clone()],
                phase,
                logs,
            },
        );
        Ok(())
    }

    async fn pod_phase(&self, namespace: &str, name: &str) -> Result<Option<PodPhase>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .map(|p| p.phase.clone()))
    }

    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String, Error> {
        let state = self.state.lock().unwrap();
        if state.unreadable_logs {
            return Err(Error::ExternalCommand {
                command: format!("logs {}/{}", namespace, name),
                exit_code: None,
                output: "container log unavailable".to_string(),
            });
        }
        state
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .map(|p| p.logs.clone())
            .ok_or_else(|| Error::not_found(format!("pod {}/{}", namespace, name)))
    }
}

// =============================================================================
// Provider
// =============================================================================

#[derive(Default)]
pub struct AwsState {
    pub roles: BTreeSet<String>,
    pub vaults: BTreeMap<String, BackupVault>,
    pub recovery_points: Vec<RecoveryPoint>,
    /// States reported by successive describe calls; the last one repeats
    pub backup_states: VecDeque<JobState>,
    pub restore_states: VecDeque<JobState>,
    pub restore_result_arn: Option<String>,
    pub job_message: Option<String>,
    pub file_systems: BTreeMap<String, FileSystem>,
    pub mount_targets: Vec<MountTarget>,
    pub security_groups: BTreeMap<String, Vec<String>>,
    pub subnets: BTreeMap<String, Subnet>,
    pub throughput_error: Option<String>,
    /// Every mount target creation is refused
    pub refuse_mount_targets: bool,
    pub failing_deletes: BTreeSet<String>,
    /// Mount targets whose security groups cannot be read
    pub unreadable_security_groups: BTreeSet<String>,
    pub started_backups: Vec<StartBackupRequest>,
    pub started_restores: Vec<StartRestoreRequest>,
    pub events: Vec<String>,
}

pub struct FakeAws {
    pub state: Mutex<AwsState>,
}

impl Default for FakeAws {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeAws {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AwsState {
                roles: BTreeSet::from(["AWSBackupDefaultServiceRole".to_string()]),
                ..Default::default()
            }),
        }
    }

    pub fn with_vault(self, name: &str) -> Self {
        self.state.lock().unwrap().vaults.insert(
            name.to_string(),
            BackupVault {
                name: name.to_string(),
                arn: format!("arn:aws:backup:{}:{}:backup-vault:{}", REGION, ACCOUNT_ID, name),
                recovery_points: 0,
            },
        );
        self
    }

    /// A completed recovery point of `fs_id` created `age_days` ago
    pub fn with_recovery_point(self, vault: &str, id: &str, fs_id: &str, age_days: i64) -> Self {
        let created_at = Utc::now() - ChronoDuration::days(age_days);
        self.with_recovery_point_at(vault, id, fs_id, created_at)
    }

    pub fn with_recovery_point_at(
        self,
        vault: &str,
        id: &str,
        fs_id: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.recovery_points.push(RecoveryPoint {
                arn: recovery_point_arn(id),
                vault_name: vault.to_string(),
                resource_arn: Some(crate::aws::arn::file_system_arn(REGION, ACCOUNT_ID, fs_id)),
                created_at,
                status: "COMPLETED".to_string(),
                expiry_at: None,
            });
            if let Some(v) = state.vaults.get_mut(vault) {
                v.recovery_points += 1;
            }
        }
        self
    }

    pub fn with_file_system(self, id: &str, name: &str, mode: ThroughputMode) -> Self {
        self.state.lock().unwrap().file_systems.insert(
            id.to_string(),
            FileSystem {
                id: id.to_string(),
                name: Some(name.to_string()),
                lifecycle_state: "available".to_string(),
                throughput_mode: mode,
                created_at: None,
                mount_targets: 0,
            },
        );
        self
    }

    pub fn with_subnet(self, id: &str, state: &str) -> Self {
        self.state.lock().unwrap().subnets.insert(
            id.to_string(),
            Subnet {
                id: id.to_string(),
                state: state.to_string(),
                availability_zone: Some("us-east-1a".to_string()),
            },
        );
        self
    }

    pub fn with_mount_target(
        self,
        fs_id: &str,
        mt_id: &str,
        subnet: &str,
        groups: &[&str],
    ) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.mount_targets.push(MountTarget {
                id: mt_id.to_string(),
                file_system_id: fs_id.to_string(),
                subnet_id: subnet.to_string(),
                availability_zone: Some("us-east-1a".to_string()),
                lifecycle_state: "available".to_string(),
            });
            state.security_groups.insert(
                mt_id.to_string(),
                groups.iter().map(|g| g.to_string()).collect(),
            );
            if let Some(fs) = state.file_systems.get_mut(fs_id) {
                fs.mount_targets += 1;
            }
        }
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn set<F: FnOnce(&mut AwsState)>(&self, f: F) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn recovery_point_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .recovery_points
            .iter()
            .map(|rp| rp.arn.rsplit(':').next().unwrap_or_default().to_string())
            .collect()
    }
}

pub fn recovery_point_arn(id: &str) -> String {
    format!("arn:aws:backup:{}:{}:recovery-point:{}", REGION, ACCOUNT_ID, id)
}

fn next_state(states: &mut VecDeque<JobState>) -> JobState {
    if states.len() > 1 {
        states.pop_front().unwrap_or(JobState::Running)
    } else {
        states.front().copied().unwrap_or(JobState::Running)
    }
}

fn provider_error(command: &str, output: &str) -> Error {
    Error::ExternalCommand {
        command: command.to_string(),
        exit_code: Some(254),
        output: output.to_string(),
    }
}

#[async_trait]
impl BackupService for FakeAws {
    async fn account_id(&self) -> Result<String, Error> {
        Ok(ACCOUNT_ID.to_string())
    }

    async fn role_arn(&self, role_name: &str) -> Result<String, Error> {
        let state = self.state.lock().unwrap();
        if state.roles.contains(role_name) {
            Ok(format!("arn:aws:iam::{}:role/{}", ACCOUNT_ID, role_name))
        } else {
            Err(Error::not_found(format!("role {}", role_name)))
        }
    }

    async fn list_vaults(&self) -> Result<Vec<BackupVault>, Error> {
        Ok(self.state.lock().unwrap().vaults.values().cloned().collect())
    }

    async fn describe_recovery_point(
        &self,
        vault_name: &str,
        recovery_point_arn: &str,
    ) -> Result<RecoveryPoint, Error> {
        let state = self.state.lock().unwrap();
        state
            .recovery_points
            .iter()
            .find(|rp| rp.vault_name == vault_name && rp.arn == recovery_point_arn)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("recovery point {}", recovery_point_arn)))
    }

    async fn list_recovery_points_by_resource(
        &self,
        resource_arn: &str,
    ) -> Result<Vec<RecoveryPoint>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .recovery_points
            .iter()
            .filter(|rp| rp.resource_arn.as_deref() == Some(resource_arn))
            .cloned()
            .collect())
    }

    async fn list_recovery_points_by_vault(
        &self,
        vault_name: &str,
    ) -> Result<Vec<RecoveryPoint>, Error> {
        let state = self.state.lock().unwrap();
        if !state.vaults.contains_key(vault_name) {
            return Err(Error::not_found(format!("vault {}", vault_name)));
        }
        Ok(state
            .recovery_points
            .iter()
            .filter(|rp| rp.vault_name == vault_name)
            .cloned()
            .collect())
    }

    async fn delete_recovery_point(
        &self,
        vault_name: &str,
        recovery_point_arn: &str,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.failing_deletes.contains(recovery_point_arn) {
            return Err(provider_error(
                "aws backup delete-recovery-point",
                "InvalidRequestException",
            ));
        }
        state
            .events
            .push(format!("delete_recovery_point {} {}", vault_name, recovery_point_arn));
        state
            .recovery_points
            .retain(|rp| !(rp.vault_name == vault_name && rp.arn == recovery_point_arn));
        if let Some(v) = state.vaults.get_mut(vault_name) {
            v.recovery_points = v.recovery_points.saturating_sub(1);
        }
        Ok(())
    }

    async fn delete_vault(&self, vault_name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.recovery_points.iter().any(|rp| rp.vault_name == vault_name) {
            return Err(provider_error(
                "aws backup delete-backup-vault",
                "InvalidRequestException: Backup vault cannot be deleted because it contains recovery points",
            ));
        }
        state.events.push(format!("delete_vault {}", vault_name));
        state.vaults.remove(vault_name);
        Ok(())
    }

    async fn start_backup_job(&self, request: &StartBackupRequest) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("start_backup {}", request.resource_arn));
        state.started_backups.push(request.clone());
        Ok(format!("backup-job-{}", state.started_backups.len()))
    }

    async fn describe_backup_job(&self, job_id: &str) -> Result<BackupJob, Error> {
        let mut state = self.state.lock().unwrap();
        let job_state = next_state(&mut state.backup_states);
        let request = state.started_backups.last().cloned();
        Ok(BackupJob {
            id: job_id.to_string(),
            resource_arn: request.as_ref().map(|r| r.resource_arn.clone()).unwrap_or_default(),
            vault_name: request.map(|r| r.vault_name).unwrap_or_default(),
            state: job_state,
            status_message: state.job_message.clone(),
        })
    }

    async fn restore_metadata(
        &self,
        _vault_name: &str,
        _recovery_point_arn: &str,
    ) -> Result<BTreeMap<String, String>, Error> {
        Ok(BTreeMap::from([
            ("file-system-id".to_string(), "fs-aaaa".to_string()),
            ("Encrypted".to_string(), "true".to_string()),
            ("PerformanceMode".to_string(), "generalPurpose".to_string()),
        ]))
    }

    async fn start_restore_job(&self, request: &StartRestoreRequest) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        state
            .events
            .push(format!("start_restore {}", request.recovery_point_arn));
        state.started_restores.push(request.clone());
        Ok(format!("restore-job-{}", state.started_restores.len()))
    }

    async fn describe_restore_job(&self, job_id: &str) -> Result<RestoreJob, Error> {
        let mut state = self.state.lock().unwrap();
        let job_state = next_state(&mut state.restore_states);
        let source = state
            .started_restores
            .last()
            .map(|r| r.recovery_point_arn.clone())
            .unwrap_or_default();
        Ok(RestoreJob {
            id: job_id.to_string(),
            source_recovery_point_arn: source,
            state: job_state,
            status_message: state.job_message.clone(),
            created_resource_arn: (job_state == JobState::Completed)
                .then(|| state.restore_result_arn.clone())
                .flatten(),
        })
    }
}

#[async_trait]
impl FileSystemService for FakeAws {
    async fn list_file_systems(&self) -> Result<Vec<FileSystem>, Error> {
        Ok(self.state.lock().unwrap().file_systems.values().cloned().collect())
    }

    async fn describe_file_system(&self, file_system_id: &str) -> Result<FileSystem, Error> {
        self.state
            .lock()
            .unwrap()
            .file_systems
            .get(file_system_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("file system {}", file_system_id)))
    }

    async fn list_mount_targets(&self, file_system_id: &str) -> Result<Vec<MountTarget>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .mount_targets
            .iter()
            .filter(|mt| mt.file_system_id == file_system_id)
            .cloned()
            .collect())
    }

    async fn mount_target_security_groups(
        &self,
        mount_target_id: &str,
    ) -> Result<Vec<String>, Error> {
        let state = self.state.lock().unwrap();
        if state.unreadable_security_groups.contains(mount_target_id) {
            return Err(provider_error(
                "efs describe-mount-target-security-groups",
                "An error occurred (MountTargetNotFound)",
            ));
        }
        Ok(state
            .security_groups
            .get(mount_target_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_mount_target(
        &self,
        file_system_id: &str,
        subnet_id: &str,
        security_groups: &[String],
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_mount_targets {
            return Err(provider_error(
                "aws efs create-mount-target",
                "An error occurred (SecurityGroupNotFound): security group does not exist",
            ));
        }
        let exists = state
            .mount_targets
            .iter()
            .any(|mt| mt.file_system_id == file_system_id && mt.subnet_id == subnet_id);
        if exists {
            return Err(provider_error(
                "aws efs create-mount-target",
                "An error occurred (MountTargetConflict): mount target already exists in this AZ",
            ));
        }
        state
            .events
            .push(format!("create_mount_target {} {}", file_system_id, subnet_id));
        let id = format!("fsmt-{}", state.mount_targets.len() + 1);
        state.mount_targets.push(MountTarget {
            id: id.clone(),
            file_system_id: file_system_id.to_string(),
            subnet_id: subnet_id.to_string(),
            availability_zone: None,
            lifecycle_state: "available".to_string(),
        });
        state.security_groups.insert(id, security_groups.to_vec());
        if let Some(fs) = state.file_systems.get_mut(file_system_id) {
            fs.mount_targets += 1;
        }
        Ok(())
    }

    async fn delete_mount_target(&self, mount_target_id: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state
            .events
            .push(format!("delete_mount_target {}", mount_target_id));
        let owner = state
            .mount_targets
            .iter()
            .find(|mt| mt.id == mount_target_id)
            .map(|mt| mt.file_system_id.clone());
        state.mount_targets.retain(|mt| mt.id != mount_target_id);
        if let Some(fs) = owner.and_then(|id| state.file_systems.get_mut(&id)) {
            fs.mount_targets = fs.mount_targets.saturating_sub(1);
        }
        Ok(())
    }

    async fn delete_file_system(&self, file_system_id: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state
            .mount_targets
            .iter()
            .any(|mt| mt.file_system_id == file_system_id)
        {
            return Err(provider_error(
                "aws efs delete-file-system",
                "FileSystemInUse: file system has mount targets",
            ));
        }
        state
            .events
            .push(format!("delete_file_system {}", file_system_id));
        state.file_systems.remove(file_system_id);
        Ok(())
    }

    async fn describe_subnets(&self, subnet_ids: &[String]) -> Result<Vec<Subnet>, Error> {
        let state = self.state.lock().unwrap();
        Ok(subnet_ids
            .iter()
            .filter_map(|id| state.subnets.get(id).cloned())
            .collect())
    }

    async fn update_throughput_mode(
        &self,
        file_system_id: &str,
        mode: &ThroughputMode,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(output) = state.throughput_error.clone() {
            return Err(provider_error("aws efs update-file-system", &output));
        }
        state
            .events
            .push(format!("update_throughput {} {}", file_system_id, mode));
        if let Some(fs) = state.file_systems.get_mut(file_system_id) {
            fs.throughput_mode = mode.clone();
        }
        Ok(())
    }
}
