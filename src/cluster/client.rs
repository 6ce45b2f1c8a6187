//! kube-rs implementation of [`ClusterApi`]

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, info};

use super::manifest::{build_claim, build_inspection_pod, build_volume};
use super::{
    ClaimInfo, ClaimSpec, ClusterApi, InspectionPodSpec, PodPhase, VolumeInfo, VolumeSpec,
    WorkloadKind, WorkloadRef,
};
use crate::Error;

/// Field manager recorded on patches
const FIELD_MANAGER: &str = "efs-attach";

/// Annotation whose change makes a controller roll its pods
const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Cluster access through the Kubernetes API
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client from the ambient kubeconfig or in-cluster service account
    pub async fn try_default() -> Result<Self, Error> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Treat a 404 on delete as success
fn tolerate_missing<T>(result: Result<T, kube::Error>) -> Result<(), Error> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn claim_info(pvc: &PersistentVolumeClaim, namespace: &str) -> ClaimInfo {
    let spec = pvc.spec.as_ref();
    ClaimInfo {
        namespace: pvc
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| namespace.to_string()),
        name: pvc.metadata.name.clone().unwrap_or_default(),
        volume_name: spec.and_then(|s| s.volume_name.clone()),
        phase: pvc.status.as_ref().and_then(|s| s.phase.clone()),
        storage: spec
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
            .map(|q| q.0.clone()),
        storage_class: spec.and_then(|s| s.storage_class_name.clone()),
        access_modes: spec
            .and_then(|s| s.access_modes.clone())
            .unwrap_or_default(),
    }
}

fn volume_info(pv: &PersistentVolume) -> VolumeInfo {
    let spec = pv.spec.as_ref();
    let csi = spec.and_then(|s| s.csi.as_ref());
    let claim_ref = spec.and_then(|s| s.claim_ref.as_ref());
    VolumeInfo {
        name: pv.metadata.name.clone().unwrap_or_default(),
        driver: csi.map(|c| c.driver.clone()),
        volume_handle: csi.map(|c| c.volume_handle.clone()),
        claim_namespace: claim_ref.and_then(|r| r.namespace.clone()),
        claim_name: claim_ref.and_then(|r| r.name.clone()),
        capacity: spec
            .and_then(|s| s.capacity.as_ref())
            .and_then(|c| c.get("storage"))
            .map(|q| q.0.clone()),
        storage_class: spec.and_then(|s| s.storage_class_name.clone()),
        access_modes: spec
            .and_then(|s| s.access_modes.clone())
            .unwrap_or_default(),
        reclaim_policy: spec.and_then(|s| s.persistent_volume_reclaim_policy.clone()),
        phase: pv.status.as_ref().and_then(|s| s.phase.clone()),
    }
}

fn pod_mounts_claim(pod: &Pod, claim: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .is_some_and(|volumes| {
            volumes.iter().any(|v| {
                v.persistent_volume_claim
                    .as_ref()
                    .is_some_and(|c| c.claim_name == claim)
            })
        })
}

fn deployment_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let generation = deployment.metadata.generation.unwrap_or(0);
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    status.observed_generation.unwrap_or(0) >= generation
        && status.updated_replicas.unwrap_or(0) == desired
        && status.available_replicas.unwrap_or(0) == desired
        && status.replicas.unwrap_or(0) == desired
}

fn stateful_set_ready(set: &StatefulSet) -> bool {
    let desired = set.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let generation = set.metadata.generation.unwrap_or(0);
    let Some(status) = set.status.as_ref() else {
        return false;
    };
    let revision_settled = match (&status.current_revision, &status.update_revision) {
        (Some(current), Some(update)) => current == update,
        _ => true,
    };
    status.observed_generation.unwrap_or(0) >= generation
        && status.updated_replicas.unwrap_or(0) == desired
        && status.ready_replicas.unwrap_or(0) == desired
        && revision_settled
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_claims(&self, namespace: &str) -> Result<Vec<ClaimInfo>, Error> {
        let list = self.claims(namespace).list(&ListParams::default()).await?;
        Ok(list.items.iter().map(|c| claim_info(c, namespace)).collect())
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimInfo>, Error> {
        let claim = self.claims(namespace).get_opt(name).await?;
        Ok(claim.as_ref().map(|c| claim_info(c, namespace)))
    }

    async fn get_volume(&self, name: &str) -> Result<Option<VolumeInfo>, Error> {
        let volume = self.volumes().get_opt(name).await?;
        Ok(volume.as_ref().map(volume_info))
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>, Error> {
        let list = self.volumes().list(&ListParams::default()).await?;
        Ok(list.items.iter().map(volume_info).collect())
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<(), Error> {
        debug!(namespace, claim = name, "deleting claim");
        tolerate_missing(
            self.claims(namespace)
                .delete(name, &DeleteParams::background())
                .await,
        )
    }

    async fn delete_volume(&self, name: &str) -> Result<(), Error> {
        debug!(volume = name, "deleting volume");
        tolerate_missing(self.volumes().delete(name, &DeleteParams::background()).await)
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<(), Error> {
        info!(volume = %spec.name, file_system = %spec.file_system_id, "creating volume");
        self.volumes()
            .create(&PostParams::default(), &build_volume(spec))
            .await?;
        Ok(())
    }

    async fn create_claim(&self, spec: &ClaimSpec) -> Result<(), Error> {
        info!(
            namespace = %spec.namespace,
            claim = %spec.name,
            volume = %spec.volume_name,
            "creating claim"
        );
        self.claims(&spec.namespace)
            .create(&PostParams::default(), &build_claim(spec))
            .await?;
        Ok(())
    }

    async fn pods_using_claim(&self, namespace: &str, claim: &str) -> Result<Vec<String>, Error> {
        let pods = self.pods(namespace).list(&ListParams::default()).await?;
        Ok(pods
            .items
            .iter()
            .filter(|p| pod_mounts_claim(p, claim))
            .filter_map(|p| p.metadata.name.clone())
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        debug!(namespace, pod = name, "deleting pod");
        tolerate_missing(
            self.pods(namespace)
                .delete(name, &DeleteParams::default())
                .await,
        )
    }

    async fn list_workloads(&self, namespace: &str) -> Result<Vec<WorkloadRef>, Error> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let sets: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);

        let mut workloads: Vec<WorkloadRef> = deployments
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .filter_map(|d| d.metadata.name)
            .map(|name| WorkloadRef {
                kind: WorkloadKind::Deployment,
                name,
            })
            .collect();
        workloads.extend(
            sets.list(&ListParams::default())
                .await?
                .items
                .into_iter()
                .filter_map(|s| s.metadata.name)
                .map(|name| WorkloadRef {
                    kind: WorkloadKind::StatefulSet,
                    name,
                }),
        );
        Ok(workloads)
    }

    async fn restart_workload(
        &self,
        namespace: &str,
        workload: &WorkloadRef,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": {
                            RESTARTED_AT_ANNOTATION: chrono::Utc::now().to_rfc3339()
                        }
                    }
                }
            }
        });
        let params = PatchParams::apply(FIELD_MANAGER);

        info!(namespace, workload = %workload.name, kind = ?workload.kind, "restarting workload");
        match workload.kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                api.patch(&workload.name, &params, &Patch::Merge(&patch))
                    .await?;
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                api.patch(&workload.name, &params, &Patch::Merge(&patch))
                    .await?;
            }
        }
        Ok(())
    }

    async fn workload_ready(&self, namespace: &str, workload: &WorkloadRef) -> Result<bool, Error> {
        match workload.kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                Ok(api
                    .get_opt(&workload.name)
                    .await?
                    .as_ref()
                    .is_some_and(deployment_ready))
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                Ok(api
                    .get_opt(&workload.name)
                    .await?
                    .as_ref()
                    .is_some_and(stateful_set_ready))
            }
        }
    }

    async fn create_inspection_pod(&self, spec: &InspectionPodSpec) -> Result<(), Error> {
        debug!(
            namespace = %spec.namespace,
            pod = %spec.name,
            claim = %spec.claim_name,
            "creating inspection pod"
        );
        self.pods(&spec.namespace)
            .create(&PostParams::default(), &build_inspection_pod(spec))
            .await?;
        Ok(())
    }

    async fn pod_phase(&self, namespace: &str, name: &str) -> Result<Option<PodPhase>, Error> {
        let pod = self.pods(namespace).get_opt(name).await?;
        Ok(pod.map(|p| {
            p.status
                .and_then(|s| s.phase)
                .map(|phase| PodPhase::parse(&phase))
                .unwrap_or(PodPhase::Pending)
        }))
    }

    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String, Error> {
        Ok(self
            .pods(namespace)
            .logs(name, &LogParams::default())
            .await?)
    }
}
