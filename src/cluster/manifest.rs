//! Volume, claim and inspection-pod object builders
//!
//! The same builders feed both object creation and the YAML written by the
//! configuration backup, so a backup can be re-applied verbatim.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, Container, ObjectReference, PersistentVolume,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
    PersistentVolumeSpec, Pod, PodSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::{
    ClaimInfo, ClaimSpec, InspectionPodSpec, VolumeInfo, VolumeSpec, DEFAULT_STORAGE_CLASS,
    EFS_CSI_DRIVER, RECLAIM_RETAIN,
};
use crate::Error;

/// Label applied to everything this crate creates
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`]
pub const MANAGED_BY: &str = "efs-attach";

/// Capacity used when the original volume reports none
pub const DEFAULT_CAPACITY: &str = "100Gi";

/// Access mode used when the original volume reports none
pub const DEFAULT_ACCESS_MODE: &str = "ReadWriteMany";

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string())])
}

/// Build a retained, CSI-backed volume for a file system
pub fn build_volume(spec: &VolumeSpec) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(spec.capacity.clone()),
            )])),
            access_modes: Some(spec.access_modes.clone()),
            persistent_volume_reclaim_policy: Some(RECLAIM_RETAIN.to_string()),
            storage_class_name: Some(spec.storage_class.clone()),
            csi: Some(CSIPersistentVolumeSource {
                driver: EFS_CSI_DRIVER.to_string(),
                volume_handle: spec.file_system_id.clone(),
                ..Default::default()
            }),
            claim_ref: spec.claim_ref.as_ref().map(|(ns, name)| ObjectReference {
                namespace: Some(ns.clone()),
                name: Some(name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

/// Build a claim explicitly bound to one volume
pub fn build_claim(spec: &ClaimSpec) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(spec.access_modes.clone()),
            storage_class_name: Some(spec.storage_class.clone()),
            volume_name: Some(spec.volume_name.clone()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(spec.storage.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

/// Build a never-restarting pod that mounts a claim and runs a script
pub fn build_inspection_pod(spec: &InspectionPodSpec) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "inspect".to_string(),
                image: Some(spec.image.clone()),
                command: Some(vec!["sh".to_string(), "-c".to_string(), spec.script.clone()]),
                volume_mounts: Some(vec![VolumeMount {
                    name: "data".to_string(),
                    mount_path: spec.mount_path.clone(),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "data".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: spec.claim_name.clone(),
                    read_only: Some(true),
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Volume spec that recreates `template` against another file system
pub fn volume_spec_from(
    template: &VolumeInfo,
    file_system_id: &str,
    claim: (&str, &str),
) -> VolumeSpec {
    VolumeSpec {
        name: template.name.clone(),
        file_system_id: file_system_id.to_string(),
        capacity: template
            .capacity
            .clone()
            .unwrap_or_else(|| DEFAULT_CAPACITY.to_string()),
        storage_class: template
            .storage_class
            .clone()
            .unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_string()),
        access_modes: non_empty_or_default(&template.access_modes),
        claim_ref: Some((claim.0.to_string(), claim.1.to_string())),
    }
}

/// Claim spec that recreates `claim` bound to `volume`
pub fn claim_spec_from(claim: &ClaimInfo, volume: &VolumeSpec) -> ClaimSpec {
    ClaimSpec {
        namespace: claim.namespace.clone(),
        name: claim.name.clone(),
        volume_name: volume.name.clone(),
        storage: claim
            .storage
            .clone()
            .unwrap_or_else(|| volume.capacity.clone()),
        storage_class: claim
            .storage_class
            .clone()
            .unwrap_or_else(|| volume.storage_class.clone()),
        access_modes: if claim.access_modes.is_empty() {
            volume.access_modes.clone()
        } else {
            claim.access_modes.clone()
        },
    }
}

fn non_empty_or_default(modes: &[String]) -> Vec<String> {
    if modes.is_empty() {
        vec![DEFAULT_ACCESS_MODE.to_string()]
    } else {
        modes.to_vec()
    }
}

/// Render volumes then claims as a multi-document YAML stream
pub fn render_manifests(volumes: &[VolumeSpec], claims: &[ClaimSpec]) -> Result<String, Error> {
    let mut docs = Vec::with_capacity(volumes.len() + claims.len());

    for volume in volumes {
        docs.push(to_yaml_document(&build_volume(volume), "v1", "PersistentVolume")?);
    }
    for claim in claims {
        docs.push(to_yaml_document(
            &build_claim(claim),
            "v1",
            "PersistentVolumeClaim",
        )?);
    }

    Ok(docs.join("---\n"))
}

fn to_yaml_document<T: serde::Serialize>(
    object: &T,
    api_version: &str,
    kind: &str,
) -> Result<String, Error> {
    let mut value = serde_json::to_value(object)
        .map_err(|e| Error::serialization(format!("failed to serialize {}: {}", kind, e)))?;
    if let Some(map) = value.as_object_mut() {
        map.insert("apiVersion".to_string(), api_version.into());
        map.insert("kind".to_string(), kind.into());
    }
    serde_yaml::to_string(&value)
        .map_err(|e| Error::serialization(format!("failed to render {}: {}", kind, e)))
}
