//! Data integrity verification
//!
//! Runs a short-lived pod that mounts a claim and inspects the data directory
//! with an embedded shell script. The script prints `KEY=VALUE` lines that
//! [`parse_report`] turns into a [`VerificationReport`].
//!
//! Verification is diagnostic. Callers treat any error from here as a warning.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::manifest::{DEFAULT_ACCESS_MODE, DEFAULT_CAPACITY};
use crate::cluster::{
    ClaimSpec, ClusterApi, InspectionPodSpec, PodPhase, VolumeSpec, DEFAULT_STORAGE_CLASS,
};
use crate::config::VerificationSettings;
use crate::poll::{poll_until, PollPolicy};
use crate::Error;

const RESULT_KEY: &str = "VERIFY_RESULT";
const REASON_KEY: &str = "VERIFY_REASON";
const DATA_DIR_KEY: &str = "DATA_DIR";
const FILE_COUNT_KEY: &str = "FILE_COUNT";
const MISSING_MARKER_KEY: &str = "MISSING_MARKER";

/// Longest object name the control plane accepts for pods
const MAX_POD_NAME: usize = 63;

/// Parsed output of an inspection run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerificationReport {
    /// Script printed `VERIFY_RESULT=PASS`
    pub passed: bool,
    /// Data directory the script settled on
    pub data_dir: Option<String>,
    /// Number of regular files under the data directory
    pub file_count: Option<u64>,
    /// Markers that were not found
    pub missing_markers: Vec<String>,
    /// Failure reason printed by the script
    pub reason: Option<String>,
    /// Full pod log
    pub log: String,
}

/// Parse `KEY=VALUE` lines printed by the inspection script
pub fn parse_report(log: &str) -> VerificationReport {
    let mut report = VerificationReport {
        log: log.to_string(),
        ..Default::default()
    };
    for line in log.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        match key {
            RESULT_KEY => report.passed = value == "PASS",
            REASON_KEY => report.reason = Some(value.to_string()),
            DATA_DIR_KEY => report.data_dir = Some(value.to_string()),
            FILE_COUNT_KEY => report.file_count = value.trim().parse().ok(),
            MISSING_MARKER_KEY => report.missing_markers.push(value.to_string()),
            _ => {}
        }
    }
    report
}

fn is_safe_path_component(s: &str) -> bool {
    !s.is_empty()
        && !s.contains("..")
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'))
}

/// Build the inspection script.
///
/// The data directory is `<mount>/<subdir>` or, for layouts keyed by workload
/// identity, `<mount>/*/<subdir>`. Missing markers or an empty directory exit
/// non-zero so the pod ends `Failed`.
pub fn build_script(settings: &VerificationSettings) -> Result<String, Error> {
    for value in std::iter::once(&settings.mount_path)
        .chain(std::iter::once(&settings.data_subdir))
        .chain(settings.markers.iter())
    {
        if !is_safe_path_component(value) {
            return Err(Error::validation(format!(
                "unsafe path in verification settings: '{}'",
                value
            )));
        }
    }

    let markers = settings.markers.join(" ");
    Ok(format!(
        r#"set -eu
ROOT="{root}"
SUBDIR="{subdir}"
DIR=""
if [ -d "$ROOT/$SUBDIR" ]; then
  DIR="$ROOT/$SUBDIR"
else
  DIR=$(find "$ROOT" -mindepth 2 -maxdepth 2 -type d -name "$SUBDIR" 2>/dev/null | head -n 1)
fi
if [ -z "$DIR" ]; then
  echo "{reason}=data directory $SUBDIR not found under $ROOT"
  echo "{result}=FAIL"
  exit 1
fi
echo "{data_dir}=$DIR"
for m in {markers}; do
  if [ ! -e "$DIR/$m" ]; then
    echo "{missing}=$m"
    echo "{result}=FAIL"
    exit 1
  fi
done
COUNT=$(find "$DIR" -type f 2>/dev/null | wc -l | tr -d ' ')
echo "{count}=$COUNT"
if [ "$COUNT" -eq 0 ]; then
  echo "{reason}=data directory is empty"
  echo "{result}=FAIL"
  exit 1
fi
echo "{result}=PASS"
"#,
        root = settings.mount_path,
        subdir = settings.data_subdir,
        markers = markers,
        reason = REASON_KEY,
        result = RESULT_KEY,
        data_dir = DATA_DIR_KEY,
        missing = MISSING_MARKER_KEY,
        count = FILE_COUNT_KEY,
    ))
}

/// Unique, length-limited inspection pod name for a claim
fn inspection_pod_name(claim: &str) -> String {
    let suffix = &Uuid::new_v4().simple().to_string()[..8];
    let prefix: String = format!("verify-{}", claim)
        .chars()
        .take(MAX_POD_NAME - suffix.len() - 1)
        .collect();
    format!("{}-{}", prefix.trim_end_matches('-'), suffix)
}

/// Name of the scratch volume and claim used to inspect an unattached file
/// system
pub fn scratch_name(namespace: &str, fs_id: &str) -> String {
    format!("{}-verify-{}", namespace, fs_id)
}

/// Runs inspection pods
pub struct DataVerifier {
    cluster: Arc<dyn ClusterApi>,
    settings: VerificationSettings,
    phase: PollPolicy,
    bind: PollPolicy,
}

impl DataVerifier {
    /// Create a verifier polling pod phase with `phase` and scratch claim
    /// binding with `bind`
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        settings: VerificationSettings,
        phase: PollPolicy,
        bind: PollPolicy,
    ) -> Self {
        Self {
            cluster,
            settings,
            phase,
            bind,
        }
    }

    /// Inspect the data behind an existing claim.
    ///
    /// `Ok` only when the pod succeeds; its log is the report. A failed pod,
    /// a missing pod or an exhausted budget is an error. The pod is deleted
    /// either way.
    pub async fn verify_claim(
        &self,
        namespace: &str,
        claim: &str,
        cancel: &CancellationToken,
    ) -> Result<VerificationReport, Error> {
        let spec = InspectionPodSpec {
            name: inspection_pod_name(claim),
            namespace: namespace.to_string(),
            claim_name: claim.to_string(),
            image: self.settings.image.clone(),
            mount_path: self.settings.mount_path.clone(),
            script: build_script(&self.settings)?,
        };
        self.cluster.create_inspection_pod(&spec).await?;

        let result = self.await_report(namespace, &spec.name, cancel).await;

        if let Err(e) = self.cluster.delete_pod(namespace, &spec.name).await {
            warn!(namespace, pod = %spec.name, error = %e, "could not delete inspection pod");
        }
        result
    }

    async fn await_report(
        &self,
        namespace: &str,
        pod: &str,
        cancel: &CancellationToken,
    ) -> Result<VerificationReport, Error> {
        let cluster = self.cluster.as_ref();
        let phase = poll_until(
            &format!("inspection pod {}/{}", namespace, pod),
            &self.phase,
            cancel,
            |_| async move {
                let phase = cluster.pod_phase(namespace, pod).await?;
                debug!(namespace, pod, phase = ?phase, "inspection pod phase");
                Ok(phase.filter(PodPhase::is_finished))
            },
        )
        .await?;

        let log = match self.cluster.pod_logs(namespace, pod).await {
            Ok(log) => log,
            Err(e) => {
                warn!(
                    namespace,
                    pod,
                    phase = ?phase,
                    error = %e,
                    "could not read inspection pod log"
                );
                return Err(Error::validation(format!(
                    "data verification failed: log of {} unreadable: {}",
                    pod, e
                )));
            }
        };
        let report = parse_report(&log);
        match phase {
            PodPhase::Succeeded => {
                info!(
                    namespace,
                    pod,
                    passed = report.passed,
                    files = ?report.file_count,
                    data_dir = ?report.data_dir,
                    "data verification finished"
                );
                Ok(report)
            }
            _ => {
                let why = report
                    .reason
                    .clone()
                    .or_else(|| {
                        (!report.missing_markers.is_empty())
                            .then(|| format!("missing {}", report.missing_markers.join(", ")))
                    })
                    .unwrap_or_else(|| "inspection pod failed".to_string());
                Err(Error::validation(format!("data verification failed: {}", why)))
            }
        }
    }

    /// Inspect a file system that no claim points at yet.
    ///
    /// A scratch volume and claim named by [`scratch_name`] are created for
    /// the duration of the check and removed afterwards.
    pub async fn verify_file_system(
        &self,
        namespace: &str,
        fs_id: &str,
        cancel: &CancellationToken,
    ) -> Result<VerificationReport, Error> {
        let name = scratch_name(namespace, fs_id);
        let volume = VolumeSpec {
            name: name.clone(),
            file_system_id: fs_id.to_string(),
            capacity: DEFAULT_CAPACITY.to_string(),
            storage_class: DEFAULT_STORAGE_CLASS.to_string(),
            access_modes: vec![DEFAULT_ACCESS_MODE.to_string()],
            claim_ref: Some((namespace.to_string(), name.clone())),
        };
        let claim = ClaimSpec {
            namespace: namespace.to_string(),
            name: name.clone(),
            volume_name: name.clone(),
            storage: volume.capacity.clone(),
            storage_class: volume.storage_class.clone(),
            access_modes: volume.access_modes.clone(),
        };

        let result = self.verify_scratch(&volume, &claim, cancel).await;

        if let Err(e) = self.cluster.delete_claim(namespace, &name).await {
            warn!(namespace, claim = %name, error = %e, "could not delete scratch claim");
        }
        if let Err(e) = self.cluster.delete_volume(&name).await {
            warn!(volume = %name, error = %e, "could not delete scratch volume");
        }
        result
    }

    async fn verify_scratch(
        &self,
        volume: &VolumeSpec,
        claim: &ClaimSpec,
        cancel: &CancellationToken,
    ) -> Result<VerificationReport, Error> {
        self.cluster.create_volume(volume).await?;
        self.cluster.create_claim(claim).await?;

        let cluster = self.cluster.as_ref();
        let (namespace, name) = (claim.namespace.as_str(), claim.name.as_str());
        poll_until(
            &format!("scratch claim {}/{} to bind", namespace, name),
            &self.bind,
            cancel,
            |_| async move {
                let bound = cluster
                    .get_claim(namespace, name)
                    .await?
                    .is_some_and(|c| c.is_bound());
                Ok(bound.then_some(()))
            },
        )
        .await?;

        self.verify_claim(namespace, name, cancel).await
    }
}
