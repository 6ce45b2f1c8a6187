//! Storage identity resolution
//!
//! Finds the file system currently backing a namespace's volumes. Claims are
//! namespaced and volumes are not, so a namespace with no claims yet can still
//! be resolved from the cluster-wide volume list.

use std::cmp::Reverse;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cluster::{ClaimInfo, ClusterApi, VolumeInfo};
use crate::naming::{GeneratedName, NamespacePrefix, OwnershipMatcher};
use crate::Error;

/// A claim together with the volume it is bound to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundClaim {
    /// The claim
    pub claim: ClaimInfo,
    /// The volume named by the claim
    pub volume: VolumeInfo,
}

impl BoundClaim {
    /// File system behind the binding, if any
    pub fn file_system_id(&self) -> Option<&str> {
        self.volume.file_system_id()
    }
}

/// Resolves the file system bound to a namespace
pub struct StorageResolver {
    cluster: Arc<dyn ClusterApi>,
    ownership: Arc<dyn OwnershipMatcher>,
}

impl StorageResolver {
    /// Resolver using namespace-prefix ownership
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self::with_ownership(cluster, Arc::new(NamespacePrefix))
    }

    /// Resolver with a custom ownership rule
    pub fn with_ownership(
        cluster: Arc<dyn ClusterApi>,
        ownership: Arc<dyn OwnershipMatcher>,
    ) -> Self {
        Self { cluster, ownership }
    }

    /// Claims in `namespace` whose volume exists, in listing order
    pub async fn bound_claims(&self, namespace: &str) -> Result<Vec<BoundClaim>, Error> {
        let mut bound = Vec::new();
        for claim in self.cluster.list_claims(namespace).await? {
            let Some(volume_name) = claim.volume_name.as_deref() else {
                debug!(namespace, claim = %claim.name, "claim has no volume yet");
                continue;
            };
            match self.cluster.get_volume(volume_name).await? {
                Some(volume) => bound.push(BoundClaim { claim, volume }),
                None => debug!(namespace, volume = volume_name, "claim points at missing volume"),
            }
        }
        Ok(bound)
    }

    /// File-system id currently bound to `namespace`.
    ///
    /// Tries [`Self::resolve_owned`] first. When nothing in the cluster is tied
    /// to the namespace, any volume with a well-formed file-system handle is
    /// accepted. Returns [`Error::NotFound`] when no volume anywhere carries one.
    pub async fn resolve(&self, namespace: &str) -> Result<String, Error> {
        match self.resolve_owned(namespace).await {
            Err(e) if e.is_not_found() => {}
            other => return other,
        }

        let volumes = self.cluster.list_volumes().await?;
        let any = volumes
            .iter()
            .find_map(|v| v.file_system_id().map(|id| (v, id)));
        match any {
            Some((volume, fs_id)) => {
                warn!(
                    namespace,
                    fs_id,
                    volume = %volume.name,
                    "resolved file system from an unrelated volume"
                );
                Ok(fs_id.to_string())
            }
            None => Err(not_bound(namespace)),
        }
    }

    /// File-system id bound to `namespace`, considering only storage tied to it.
    ///
    /// Namespaced claims are checked first. Failing that, cluster volumes are
    /// scanned for ones whose claim reference, generated chain name or owned
    /// name ties them to the namespace; among several, the newest generated
    /// name wins. Volumes of other namespaces are never returned, so callers
    /// that delete provider resources resolve through this method.
    pub async fn resolve_owned(&self, namespace: &str) -> Result<String, Error> {
        for bound in self.bound_claims(namespace).await? {
            if let Some(fs_id) = bound.file_system_id() {
                info!(
                    namespace,
                    fs_id,
                    claim = %bound.claim.name,
                    "resolved file system from claim"
                );
                return Ok(fs_id.to_string());
            }
        }

        debug!(namespace, "no namespaced claim resolved, scanning cluster volumes");
        let volumes = self.cluster.list_volumes().await?;
        let tied = volumes
            .iter()
            .filter(|v| self.is_tied_to(namespace, v))
            .filter_map(|v| v.file_system_id().map(|id| (v, id)))
            .min_by_key(|(v, _)| Reverse(GeneratedName::parse(&v.name).map(|g| g.timestamp)));

        match tied {
            Some((volume, fs_id)) => {
                info!(
                    namespace,
                    fs_id,
                    volume = %volume.name,
                    "resolved file system from cluster volume"
                );
                Ok(fs_id.to_string())
            }
            None => Err(not_bound(namespace)),
        }
    }

    fn is_tied_to(&self, namespace: &str, volume: &VolumeInfo) -> bool {
        if let Some(claim_namespace) = volume.claim_namespace.as_deref() {
            return claim_namespace == namespace;
        }
        GeneratedName::parse(&volume.name).is_some_and(|g| g.chain == namespace)
            || self.ownership.owns(namespace, &volume.name)
    }
}

fn not_bound(namespace: &str) -> Error {
    Error::not_found(format!("file system bound to namespace {}", namespace))
}
