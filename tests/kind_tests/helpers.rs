//! Shared fixtures for cluster tests

use k8s_openapi::api::core::v1::{Namespace, PersistentVolume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;

use efs_attach::cluster::{ClaimSpec, VolumeSpec, DEFAULT_STORAGE_CLASS};

/// Client for the current kubeconfig context, panicking with a hint when no
/// cluster is reachable
pub async fn ensure_test_cluster() -> Client {
    let client = Client::try_default()
        .await
        .expect("no cluster reachable; start one with `kind create cluster`");
    client
        .apiserver_version()
        .await
        .expect("cluster API server did not answer");
    client
}

/// Create a throwaway namespace
pub async fn create_namespace(client: &Client, name: &str) {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    namespaces
        .create(&PostParams::default(), &namespace)
        .await
        .expect("failed to create test namespace");
}

/// Remove the namespace and the cluster-scoped volumes a test created
pub async fn cleanup(client: &Client, namespace: &str, volumes: &[&str]) {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let _ = namespaces.delete(namespace, &DeleteParams::default()).await;
    let pvs: Api<PersistentVolume> = Api::all(client.clone());
    for volume in volumes {
        let _ = pvs.delete(volume, &DeleteParams::default()).await;
    }
}

/// Unique suffix so reruns never collide with terminating objects
pub fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, &uuid::Uuid::new_v4().simple().to_string()[..6])
}

pub fn volume_spec(name: &str, fs_id: &str, namespace: &str, claim: &str) -> VolumeSpec {
    VolumeSpec {
        name: name.to_string(),
        file_system_id: fs_id.to_string(),
        capacity: "1Gi".to_string(),
        storage_class: DEFAULT_STORAGE_CLASS.to_string(),
        access_modes: vec!["ReadWriteMany".to_string()],
        claim_ref: Some((namespace.to_string(), claim.to_string())),
    }
}

pub fn claim_spec(namespace: &str, name: &str, volume: &str) -> ClaimSpec {
    ClaimSpec {
        namespace: namespace.to_string(),
        name: name.to_string(),
        volume_name: volume.to_string(),
        storage: "1Gi".to_string(),
        storage_class: DEFAULT_STORAGE_CLASS.to_string(),
        access_modes: vec!["ReadWriteMany".to_string()],
    }
}
