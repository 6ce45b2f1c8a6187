//! Stories about moving a namespace's claims to another file system on a
//! live control plane

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use efs_attach::cluster::{ClusterApi, KubeCluster};
use efs_attach::poll::{poll_until, PollPolicy};
use efs_attach::rebind::{ClaimOutcome, VolumeRebindEngine};
use efs_attach::resolver::StorageResolver;

use super::helpers::{
    claim_spec, cleanup, create_namespace, ensure_test_cluster, unique, volume_spec,
};

fn bind_policy() -> PollPolicy {
    PollPolicy::new(Duration::from_secs(1), 60)
}

async fn wait_bound(cluster: &KubeCluster, namespace: &str, claim: &str) {
    poll_until("claim to bind", &bind_policy(), &CancellationToken::new(), |_| async move {
        Ok(cluster
            .get_claim(namespace, claim)
            .await?
            .is_some_and(|c| c.is_bound())
            .then_some(()))
    })
    .await
    .expect("claim never bound");
}

/// Story: an operator points op-geth at a restored file system
///
/// The volume and claim keep their names, the volume's handle changes, and
/// the resolver reports the new file system afterwards.
#[tokio::test]
#[ignore]
async fn story_rebind_recreates_pair_under_the_same_names() {
    let client = ensure_test_cluster().await;
    let namespace = unique("chain1");
    let volume = format!("{}-1700000000-stack-op-geth", namespace);
    create_namespace(&client, &namespace).await;

    let cluster = KubeCluster::new(client.clone());
    cluster
        .create_volume(&volume_spec(&volume, "fs-aaaa", &namespace, "op-geth"))
        .await
        .unwrap();
    cluster
        .create_claim(&claim_spec(&namespace, "op-geth", &volume))
        .await
        .unwrap();
    wait_bound(&cluster, &namespace, "op-geth").await;

    let cluster: Arc<dyn ClusterApi> = Arc::new(cluster);
    let resolver = StorageResolver::new(Arc::clone(&cluster));
    assert_eq!(resolver.resolve(&namespace).await.unwrap(), "fs-aaaa");

    let engine = VolumeRebindEngine::new(
        Arc::clone(&cluster),
        bind_policy(),
        PollPolicy::new(Duration::from_secs(1), 60),
    );
    let report = engine
        .rebind(
            &namespace,
            "fs-bbbb",
            &["op-geth".to_string()],
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 1);
    assert_eq!(
        report.claims[0].1,
        ClaimOutcome::Recreated {
            volume: volume.clone()
        }
    );
    let recreated = cluster.get_volume(&volume).await.unwrap().unwrap();
    assert_eq!(recreated.file_system_id(), Some("fs-bbbb"));
    assert_eq!(recreated.reclaim_policy.as_deref(), Some("Retain"));
    assert_eq!(resolver.resolve(&namespace).await.unwrap(), "fs-bbbb");

    // Running it again changes nothing
    let again = engine
        .rebind(
            &namespace,
            "fs-bbbb",
            &["op-geth".to_string()],
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(matches!(again.claims[0].1, ClaimOutcome::AlreadyBound { .. }));

    cleanup(&client, &namespace, &[&volume]).await;
}

/// Story: deletes of objects that are already gone are not errors
#[tokio::test]
#[ignore]
async fn story_deleting_missing_objects_succeeds() {
    let client = ensure_test_cluster().await;
    let namespace = unique("chain2");
    create_namespace(&client, &namespace).await;

    let cluster = KubeCluster::new(client.clone());
    cluster.delete_claim(&namespace, "never-existed").await.unwrap();
    cluster.delete_volume(&unique("never-existed")).await.unwrap();
    cluster.delete_pod(&namespace, "never-existed").await.unwrap();
    assert!(cluster.get_claim(&namespace, "never-existed").await.unwrap().is_none());

    cleanup(&client, &namespace, &[]).await;
}
