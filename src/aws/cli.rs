//! `aws` command-line implementation of the provider seams

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::{
    BackupJob, BackupService, BackupVault, FileSystem, FileSystemService, JobState, MountTarget,
    RecoveryPoint, RestoreJob, StartBackupRequest, StartRestoreRequest, Subnet, ThroughputMode,
};
use crate::exec::{command_line, CommandRunner, RealCommandRunner};
use crate::Error;

/// Provider error codes that mean the addressed resource does not exist
const NOT_FOUND_CODES: &[&str] = &[
    "ResourceNotFoundException",
    "FileSystemNotFound",
    "MountTargetNotFound",
    "NoSuchEntity",
    "InvalidSubnetID.NotFound",
];

/// Drives the provider through the `aws` CLI with JSON output
#[derive(Debug, Clone)]
pub struct AwsCli<R: CommandRunner = RealCommandRunner> {
    runner: R,
    region: String,
}

impl AwsCli<RealCommandRunner> {
    /// Create a client for `region` using the real command runner
    pub fn new(region: impl Into<String>) -> Self {
        Self::with_runner(region, RealCommandRunner)
    }
}

impl<R: CommandRunner> AwsCli<R> {
    /// Create a client with a custom command runner
    pub fn with_runner(region: impl Into<String>, runner: R) -> Self {
        Self {
            runner,
            region: region.into(),
        }
    }

    /// Region every call is pinned to
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Run `aws <service> <operation> <args> --region <r> --output json`
    async fn call(&self, service: &str, operation: &str, args: &[&str]) -> Result<String, Error> {
        let mut full: Vec<String> = vec![service.to_string(), operation.to_string()];
        full.extend(args.iter().map(|a| a.to_string()));
        full.extend([
            "--region".to_string(),
            self.region.clone(),
            "--output".to_string(),
            "json".to_string(),
        ]);

        let output = self.runner.run("aws", &full).await?;
        if output.success {
            return Ok(output.stdout);
        }

        let combined = output.combined();
        if NOT_FOUND_CODES.iter().any(|code| combined.contains(code)) {
            debug!(service, operation, output = %combined, "Resource not found");
            return Err(Error::not_found(format!(
                "{} {}: {}",
                service, operation, combined
            )));
        }
        Err(Error::ExternalCommand {
            command: command_line("aws", &full),
            exit_code: output.exit_code,
            output: combined,
        })
    }

    /// Like [`Self::call`], decoding the JSON body
    async fn call_json<T: DeserializeOwned>(
        &self,
        service: &str,
        operation: &str,
        args: &[&str],
    ) -> Result<T, Error> {
        let body = self.call(service, operation, args).await?;
        serde_json::from_str(&body).map_err(|e| {
            Error::serialization(format!(
                "failed to decode {} {} response: {}",
                service, operation, e
            ))
        })
    }
}

// =============================================================================
// Response shapes
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentity {
    account: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetRoleResponse {
    role: RoleBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleBody {
    arn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListVaultsResponse {
    #[serde(default)]
    backup_vault_list: Vec<VaultBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VaultBody {
    backup_vault_name: String,
    #[serde(default)]
    backup_vault_arn: String,
    #[serde(default)]
    number_of_recovery_points: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListRecoveryPointsResponse {
    #[serde(default)]
    recovery_points: Vec<RecoveryPointBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RecoveryPointBody {
    recovery_point_arn: String,
    #[serde(default)]
    backup_vault_name: Option<String>,
    #[serde(default)]
    resource_arn: Option<String>,
    creation_date: DateTime<Utc>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    calculated_lifecycle: Option<LifecycleBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LifecycleBody {
    #[serde(default)]
    delete_at: Option<DateTime<Utc>>,
}

impl RecoveryPointBody {
    fn into_recovery_point(self, vault: Option<&str>, resource: Option<&str>) -> RecoveryPoint {
        RecoveryPoint {
            arn: self.recovery_point_arn,
            vault_name: self
                .backup_vault_name
                .or_else(|| vault.map(str::to_string))
                .unwrap_or_default(),
            resource_arn: self.resource_arn.or_else(|| resource.map(str::to_string)),
            created_at: self.creation_date,
            status: self.status,
            expiry_at: self.calculated_lifecycle.and_then(|l| l.delete_at),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StartBackupResponse {
    backup_job_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BackupJobBody {
    backup_job_id: String,
    #[serde(default)]
    resource_arn: String,
    #[serde(default)]
    backup_vault_name: String,
    state: String,
    #[serde(default)]
    status_message: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RestoreMetadataResponse {
    #[serde(default)]
    restore_metadata: BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StartRestoreResponse {
    restore_job_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RestoreJobBody {
    restore_job_id: String,
    #[serde(default)]
    recovery_point_arn: String,
    status: String,
    #[serde(default)]
    status_message: Option<String>,
    #[serde(default)]
    created_resource_arn: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeFileSystemsResponse {
    #[serde(default)]
    file_systems: Vec<FileSystemBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FileSystemBody {
    file_system_id: String,
    #[serde(default)]
    name: Option<String>,
    life_cycle_state: String,
    #[serde(default)]
    throughput_mode: Option<String>,
    #[serde(default)]
    creation_time: Option<DateTime<Utc>>,
    #[serde(default)]
    number_of_mount_targets: u32,
}

impl From<FileSystemBody> for FileSystem {
    fn from(body: FileSystemBody) -> Self {
        Self {
            id: body.file_system_id,
            name: body.name,
            lifecycle_state: body.life_cycle_state,
            throughput_mode: ThroughputMode::parse(
                body.throughput_mode.as_deref().unwrap_or("bursting"),
            ),
            created_at: body.creation_time,
            mount_targets: body.number_of_mount_targets,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeMountTargetsResponse {
    #[serde(default)]
    mount_targets: Vec<MountTargetBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MountTargetBody {
    mount_target_id: String,
    file_system_id: String,
    subnet_id: String,
    #[serde(default)]
    availability_zone_name: Option<String>,
    life_cycle_state: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecurityGroupsResponse {
    #[serde(default)]
    security_groups: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSubnetsResponse {
    #[serde(default)]
    subnets: Vec<SubnetBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SubnetBody {
    subnet_id: String,
    state: String,
    #[serde(default)]
    availability_zone: Option<String>,
}

// =============================================================================
// BackupService
// =============================================================================

#[async_trait]
impl<R: CommandRunner> BackupService for AwsCli<R> {
    async fn account_id(&self) -> Result<String, Error> {
        let identity: CallerIdentity = self.call_json("sts", "get-caller-identity", &[]).await?;
        Ok(identity.account)
    }

    async fn role_arn(&self, role_name: &str) -> Result<String, Error> {
        let role: GetRoleResponse = self
            .call_json("iam", "get-role", &["--role-name", role_name])
            .await?;
        Ok(role.role.arn)
    }

    async fn list_vaults(&self) -> Result<Vec<BackupVault>, Error> {
        let resp: ListVaultsResponse = self.call_json("backup", "list-backup-vaults", &[]).await?;
        Ok(resp
            .backup_vault_list
            .into_iter()
            .map(|v| BackupVault {
                name: v.backup_vault_name,
                arn: v.backup_vault_arn,
                recovery_points: v.number_of_recovery_points,
            })
            .collect())
    }

    async fn describe_recovery_point(
        &self,
        vault_name: &str,
        recovery_point_arn: &str,
    ) -> Result<RecoveryPoint, Error> {
        let body: RecoveryPointBody = self
            .call_json(
                "backup",
                "describe-recovery-point",
                &[
                    "--backup-vault-name",
                    vault_name,
                    "--recovery-point-arn",
                    recovery_point_arn,
                ],
            )
            .await?;
        Ok(body.into_recovery_point(Some(vault_name), None))
    }

    async fn list_recovery_points_by_resource(
        &self,
        resource_arn: &str,
    ) -> Result<Vec<RecoveryPoint>, Error> {
        let resp: ListRecoveryPointsResponse = self
            .call_json(
                "backup",
                "list-recovery-points-by-resource",
                &["--resource-arn", resource_arn],
            )
            .await?;
        Ok(resp
            .recovery_points
            .into_iter()
            .map(|p| p.into_recovery_point(None, Some(resource_arn)))
            .collect())
    }

    async fn list_recovery_points_by_vault(
        &self,
        vault_name: &str,
    ) -> Result<Vec<RecoveryPoint>, Error> {
        let resp: ListRecoveryPointsResponse = self
            .call_json(
                "backup",
                "list-recovery-points-by-backup-vault",
                &["--backup-vault-name", vault_name],
            )
            .await?;
        Ok(resp
            .recovery_points
            .into_iter()
            .map(|p| p.into_recovery_point(Some(vault_name), None))
            .collect())
    }

    async fn delete_recovery_point(
        &self,
        vault_name: &str,
        recovery_point_arn: &str,
    ) -> Result<(), Error> {
        self.call(
            "backup",
            "delete-recovery-point",
            &[
                "--backup-vault-name",
                vault_name,
                "--recovery-point-arn",
                recovery_point_arn,
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_vault(&self, vault_name: &str) -> Result<(), Error> {
        self.call(
            "backup",
            "delete-backup-vault",
            &["--backup-vault-name", vault_name],
        )
        .await?;
        Ok(())
    }

    async fn start_backup_job(&self, request: &StartBackupRequest) -> Result<String, Error> {
        let resp: StartBackupResponse = self
            .call_json(
                "backup",
                "start-backup-job",
                &[
                    "--backup-vault-name",
                    &request.vault_name,
                    "--resource-arn",
                    &request.resource_arn,
                    "--iam-role-arn",
                    &request.iam_role_arn,
                    "--idempotency-token",
                    &request.idempotency_token,
                ],
            )
            .await?;
        Ok(resp.backup_job_id)
    }

    async fn describe_backup_job(&self, job_id: &str) -> Result<BackupJob, Error> {
        let body: BackupJobBody = self
            .call_json("backup", "describe-backup-job", &["--backup-job-id", job_id])
            .await?;
        Ok(BackupJob {
            id: body.backup_job_id,
            resource_arn: body.resource_arn,
            vault_name: body.backup_vault_name,
            state: JobState::from_provider(&body.state)?,
            status_message: body.status_message,
        })
    }

    async fn restore_metadata(
        &self,
        vault_name: &str,
        recovery_point_arn: &str,
    ) -> Result<BTreeMap<String, String>, Error> {
        let resp: RestoreMetadataResponse = self
            .call_json(
                "backup",
                "get-recovery-point-restore-metadata",
                &[
                    "--backup-vault-name",
                    vault_name,
                    "--recovery-point-arn",
                    recovery_point_arn,
                ],
            )
            .await?;
        Ok(resp.restore_metadata)
    }

    async fn start_restore_job(&self, request: &StartRestoreRequest) -> Result<String, Error> {
        let metadata = serde_json::to_string(&request.metadata)
            .map_err(|e| Error::serialization(format!("restore metadata: {}", e)))?;
        let resp: StartRestoreResponse = self
            .call_json(
                "backup",
                "start-restore-job",
                &[
                    "--recovery-point-arn",
                    &request.recovery_point_arn,
                    "--iam-role-arn",
                    &request.iam_role_arn,
                    "--metadata",
                    &metadata,
                    "--idempotency-token",
                    &request.idempotency_token,
                    "--resource-type",
                    &request.resource_type,
                ],
            )
            .await?;
        Ok(resp.restore_job_id)
    }

    async fn describe_restore_job(&self, job_id: &str) -> Result<RestoreJob, Error> {
        let body: RestoreJobBody = self
            .call_json(
                "backup",
                "describe-restore-job",
                &["--restore-job-id", job_id],
            )
            .await?;
        Ok(RestoreJob {
            id: body.restore_job_id,
            source_recovery_point_arn: body.recovery_point_arn,
            state: JobState::from_provider(&body.status)?,
            status_message: body.status_message,
            created_resource_arn: body.created_resource_arn.filter(|a| !a.is_empty()),
        })
    }
}

// =============================================================================
// FileSystemService
// =============================================================================

#[async_trait]
impl<R: CommandRunner> FileSystemService for AwsCli<R> {
    async fn list_file_systems(&self) -> Result<Vec<FileSystem>, Error> {
        let resp: DescribeFileSystemsResponse =
            self.call_json("efs", "describe-file-systems", &[]).await?;
        Ok(resp.file_systems.into_iter().map(FileSystem::from).collect())
    }

    async fn describe_file_system(&self, file_system_id: &str) -> Result<FileSystem, Error> {
        let resp: DescribeFileSystemsResponse = self
            .call_json(
                "efs",
                "describe-file-systems",
                &["--file-system-id", file_system_id],
            )
            .await?;
        resp.file_systems
            .into_iter()
            .next()
            .map(FileSystem::from)
            .ok_or_else(|| Error::not_found(format!("file system {}", file_system_id)))
    }

    async fn list_mount_targets(&self, file_system_id: &str) -> Result<Vec<MountTarget>, Error> {
        let resp: DescribeMountTargetsResponse = self
            .call_json(
                "efs",
                "describe-mount-targets",
                &["--file-system-id", file_system_id],
            )
            .await?;
        Ok(resp
            .mount_targets
            .into_iter()
            .map(|m| MountTarget {
                id: m.mount_target_id,
                file_system_id: m.file_system_id,
                subnet_id: m.subnet_id,
                availability_zone: m.availability_zone_name,
                lifecycle_state: m.life_cycle_state,
            })
            .collect())
    }

    async fn mount_target_security_groups(
        &self,
        mount_target_id: &str,
    ) -> Result<Vec<String>, Error> {
        let resp: SecurityGroupsResponse = self
            .call_json(
                "efs",
                "describe-mount-target-security-groups",
                &["--mount-target-id", mount_target_id],
            )
            .await?;
        Ok(resp.security_groups)
    }

    async fn create_mount_target(
        &self,
        file_system_id: &str,
        subnet_id: &str,
        security_groups: &[String],
    ) -> Result<(), Error> {
        let mut args = vec![
            "--file-system-id",
            file_system_id,
            "--subnet-id",
            subnet_id,
        ];
        if !security_groups.is_empty() {
            args.push("--security-groups");
            args.extend(security_groups.iter().map(String::as_str));
        }
        self.call("efs", "create-mount-target", &args).await?;
        Ok(())
    }

    async fn delete_mount_target(&self, mount_target_id: &str) -> Result<(), Error> {
        self.call(
            "efs",
            "delete-mount-target",
            &["--mount-target-id", mount_target_id],
        )
        .await?;
        Ok(())
    }

    async fn delete_file_system(&self, file_system_id: &str) -> Result<(), Error> {
        self.call(
            "efs",
            "delete-file-system",
            &["--file-system-id", file_system_id],
        )
        .await?;
        Ok(())
    }

    async fn describe_subnets(&self, subnet_ids: &[String]) -> Result<Vec<Subnet>, Error> {
        if subnet_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["--subnet-ids"];
        args.extend(subnet_ids.iter().map(String::as_str));
        let resp: DescribeSubnetsResponse = self.call_json("ec2", "describe-subnets", &args).await?;
        Ok(resp
            .subnets
            .into_iter()
            .map(|s| Subnet {
                id: s.subnet_id,
                state: s.state,
                availability_zone: s.availability_zone,
            })
            .collect())
    }

    async fn update_throughput_mode(
        &self,
        file_system_id: &str,
        mode: &ThroughputMode,
    ) -> Result<(), Error> {
        self.call(
            "efs",
            "update-file-system",
            &[
                "--file-system-id",
                file_system_id,
                "--throughput-mode",
                mode.as_str(),
            ],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandOutput, MockCommandRunner};

    fn cli_returning(stdout: &'static str) -> AwsCli<MockCommandRunner> {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(move |_, _| Ok(CommandOutput::ok(stdout)));
        AwsCli::with_runner("us-east-1", runner)
    }

    #[tokio::test]
    async fn every_call_is_pinned_to_region_and_json_output() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|program, args| {
                program == "aws"
                    && args[0] == "sts"
                    && args[1] == "get-caller-identity"
                    && args.ends_with(&[
                        "--region".to_string(),
                        "eu-west-1".to_string(),
                        "--output".to_string(),
                        "json".to_string(),
                    ])
            })
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok(r#"{"Account":"123456789012"}"#)));

        let cli = AwsCli::with_runner("eu-west-1", runner);
        assert_eq!(cli.account_id().await.unwrap(), "123456789012");
    }

    #[tokio::test]
    async fn decodes_backup_job_with_provider_state() {
        let cli = cli_returning(
            r#"{
                "BackupJobId": "job-1",
                "ResourceArn": "arn:aws:elasticfilesystem:us-east-1:1:file-system/fs-aaaa",
                "BackupVaultName": "chain1-vault",
                "State": "RUNNING",
                "PercentDone": "10.0"
            }"#,
        );
        let job = cli.describe_backup_job("job-1").await.unwrap();
        assert_eq!(job.id, "job-1");
        assert_eq!(job.vault_name, "chain1-vault");
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.status_message, None);
    }

    #[tokio::test]
    async fn decodes_completed_restore_job_result_arn() {
        let cli = cli_returning(
            r#"{
                "RestoreJobId": "restore-1",
                "RecoveryPointArn": "arn:aws:backup:us-east-1:1:recovery-point:abc",
                "Status": "COMPLETED",
                "CreatedResourceArn": "arn:aws:elasticfilesystem:us-east-1:1:file-system/fs-bbbb"
            }"#,
        );
        let job = cli.describe_restore_job("restore-1").await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(
            job.created_resource_arn.as_deref(),
            Some("arn:aws:elasticfilesystem:us-east-1:1:file-system/fs-bbbb")
        );
    }

    #[tokio::test]
    async fn recovery_points_by_resource_inherit_the_resource_arn() {
        let cli = cli_returning(
            r#"{"RecoveryPoints": [{
                "RecoveryPointArn": "arn:aws:backup:us-east-1:1:recovery-point:a",
                "BackupVaultName": "chain1-vault",
                "CreationDate": "2026-10-01T12:00:00.123000+00:00",
                "Status": "COMPLETED"
            }]}"#,
        );
        let points = cli
            .list_recovery_points_by_resource("arn:fs")
            .await
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].vault_name, "chain1-vault");
        assert_eq!(points[0].resource_arn.as_deref(), Some("arn:fs"));
        assert_eq!(points[0].expiry_at, None);
    }

    #[tokio::test]
    async fn file_systems_default_to_bursting_throughput() {
        let cli = cli_returning(
            r#"{"FileSystems": [{
                "FileSystemId": "fs-aaaa",
                "Name": "chain1-1700000000-stack-op-geth",
                "LifeCycleState": "available",
                "CreationTime": "2026-10-01T12:00:00+00:00",
                "NumberOfMountTargets": 2
            }]}"#,
        );
        let fs = cli.describe_file_system("fs-aaaa").await.unwrap();
        assert_eq!(fs.throughput_mode, ThroughputMode::Bursting);
        assert_eq!(fs.mount_targets, 2);
        assert_eq!(fs.name.as_deref(), Some("chain1-1700000000-stack-op-geth"));
    }

    #[tokio::test]
    async fn missing_resources_map_to_not_found() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, _| {
            Ok(CommandOutput::failed(
                254,
                "An error occurred (FileSystemNotFound) when calling the DeleteFileSystem operation",
            ))
        });
        let cli = AwsCli::with_runner("us-east-1", runner);
        assert!(cli.delete_file_system("fs-aaaa").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn other_failures_keep_the_command_output() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, _| {
            Ok(CommandOutput::failed(
                254,
                "An error occurred (AccessDeniedException)",
            ))
        });
        let cli = AwsCli::with_runner("us-east-1", runner);
        let err = cli.list_vaults().await.unwrap_err();
        assert_eq!(
            err.provider_output(),
            Some("An error occurred (AccessDeniedException)")
        );
        assert!(err.to_string().contains("aws backup list-backup-vaults"));
    }

    #[tokio::test]
    async fn create_mount_target_passes_every_security_group() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|_, args| {
                let sg = args.iter().position(|a| a == "--security-groups").unwrap();
                args[sg + 1] == "sg-1" && args[sg + 2] == "sg-2"
            })
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("{}")));
        let cli = AwsCli::with_runner("us-east-1", runner);
        cli.create_mount_target("fs-bbbb", "subnet-1", &["sg-1".to_string(), "sg-2".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn describing_no_subnets_skips_the_call() {
        let runner = MockCommandRunner::new();
        let cli = AwsCli::with_runner("us-east-1", runner);
        assert!(cli.describe_subnets(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_body_is_a_serialization_error() {
        let cli = cli_returning("not json");
        assert!(matches!(
            cli.list_vaults().await.unwrap_err(),
            Error::Serialization(_)
        ));
    }
}
