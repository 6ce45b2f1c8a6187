//! Cluster volume-binding control plane seam
//!
//! [`ClusterApi`] is the narrow set of operations the workflows need from the
//! cluster: claims and volumes, the pods and workloads consuming them, and
//! short-lived inspection pods. [`client::KubeCluster`] implements it with
//! kube-rs.

pub mod client;
pub mod manifest;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::Error;

pub use client::KubeCluster;

/// CSI driver for network file systems
pub const EFS_CSI_DRIVER: &str = "efs.csi.aws.com";

/// Storage class used for statically provisioned file-system volumes
pub const DEFAULT_STORAGE_CLASS: &str = "efs-sc";

/// Reclaim policy every managed volume carries
pub const RECLAIM_RETAIN: &str = "Retain";

/// Claim phase once bound to its volume
pub const PHASE_BOUND: &str = "Bound";

/// A namespaced claim as observed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimInfo {
    /// Claim namespace
    pub namespace: String,
    /// Claim name
    pub name: String,
    /// Volume the claim is bound (or pre-bound) to
    pub volume_name: Option<String>,
    /// Phase (`Pending`, `Bound`, `Lost`)
    pub phase: Option<String>,
    /// Requested storage
    pub storage: Option<String>,
    /// Storage class
    pub storage_class: Option<String>,
    /// Access modes
    pub access_modes: Vec<String>,
}

impl ClaimInfo {
    /// True when the control plane reports the claim bound
    pub fn is_bound(&self) -> bool {
        self.phase.as_deref() == Some(PHASE_BOUND)
    }
}

/// A cluster-scoped volume as observed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeInfo {
    /// Volume name
    pub name: String,
    /// CSI driver, when CSI-backed
    pub driver: Option<String>,
    /// CSI volume handle
    pub volume_handle: Option<String>,
    /// Namespace of the claim reference
    pub claim_namespace: Option<String>,
    /// Name of the claim reference
    pub claim_name: Option<String>,
    /// Capacity
    pub capacity: Option<String>,
    /// Storage class
    pub storage_class: Option<String>,
    /// Access modes
    pub access_modes: Vec<String>,
    /// Reclaim policy
    pub reclaim_policy: Option<String>,
    /// Phase (`Available`, `Bound`, `Released`)
    pub phase: Option<String>,
}

impl VolumeInfo {
    /// File-system id behind the volume, if the handle is one
    pub fn file_system_id(&self) -> Option<&str> {
        self.volume_handle
            .as_deref()
            .and_then(crate::naming::file_system_id_from_handle)
    }
}

/// Desired state of a file-system volume
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Volume name (kept stable across rebinds)
    pub name: String,
    /// Backing file-system id
    pub file_system_id: String,
    /// Capacity (informational for network file systems)
    pub capacity: String,
    /// Storage class
    pub storage_class: String,
    /// Access modes
    pub access_modes: Vec<String>,
    /// Claim the volume is reserved for, as `(namespace, name)`
    pub claim_ref: Option<(String, String)>,
}

/// Desired state of a claim explicitly bound to a volume
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimSpec {
    /// Claim namespace
    pub namespace: String,
    /// Claim name (kept stable across rebinds)
    pub name: String,
    /// Volume the claim binds to
    pub volume_name: String,
    /// Requested storage
    pub storage: String,
    /// Storage class
    pub storage_class: String,
    /// Access modes
    pub access_modes: Vec<String>,
}

/// Workload controller kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 StatefulSet
    StatefulSet,
}

/// A deployed workload that may consume claims
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkloadRef {
    /// Controller kind
    pub kind: WorkloadKind,
    /// Deployed name
    pub name: String,
}

/// Short-lived pod mounting a claim and running a script
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InspectionPodSpec {
    /// Pod name
    pub name: String,
    /// Pod namespace
    pub namespace: String,
    /// Claim to mount
    pub claim_name: String,
    /// Container image
    pub image: String,
    /// Where the claim is mounted
    pub mount_path: String,
    /// Shell script run with `sh -c`
    pub script: String,
}

/// Pod phase as reported by the control plane
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodPhase {
    /// Not yet scheduled or pulling
    Pending,
    /// Containers running
    Running,
    /// All containers exited zero
    Succeeded,
    /// A container exited non-zero
    Failed,
    /// Anything else
    Unknown,
}

impl PodPhase {
    /// Parse the control-plane spelling
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// True once the pod will not change phase again
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Control-plane operations the workflows depend on
///
/// Delete operations succeed when the object is already gone.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Claims in a namespace
    async fn list_claims(&self, namespace: &str) -> Result<Vec<ClaimInfo>, Error>;

    /// One claim, `None` when absent
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimInfo>, Error>;

    /// One volume, `None` when absent
    async fn get_volume(&self, name: &str) -> Result<Option<VolumeInfo>, Error>;

    /// All volumes in the cluster
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>, Error>;

    /// Delete a claim without waiting for finalizers
    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Delete a volume without waiting for finalizers
    async fn delete_volume(&self, name: &str) -> Result<(), Error>;

    /// Create a volume
    async fn create_volume(&self, spec: &VolumeSpec) -> Result<(), Error>;

    /// Create a claim
    async fn create_claim(&self, spec: &ClaimSpec) -> Result<(), Error>;

    /// Names of pods in the namespace mounting the claim
    async fn pods_using_claim(&self, namespace: &str, claim: &str) -> Result<Vec<String>, Error>;

    /// Delete a pod
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Deployments and StatefulSets in a namespace
    async fn list_workloads(&self, namespace: &str) -> Result<Vec<WorkloadRef>, Error>;

    /// Trigger a rolling restart
    async fn restart_workload(&self, namespace: &str, workload: &WorkloadRef)
        -> Result<(), Error>;

    /// True once the latest rollout is fully updated and ready
    async fn workload_ready(&self, namespace: &str, workload: &WorkloadRef)
        -> Result<bool, Error>;

    /// Create an inspection pod
    async fn create_inspection_pod(&self, spec: &InspectionPodSpec) -> Result<(), Error>;

    /// Phase of a pod, `None` when absent
    async fn pod_phase(&self, namespace: &str, name: &str) -> Result<Option<PodPhase>, Error>;

    /// Full log of a pod's first container
    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String, Error>;
}
