//! efs-attach - back up, restore and re-attach chain storage

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use efs_attach::attach::{AttachOrchestrator, AttachOutcome, AttachRequest, Confirm};
use efs_attach::aws::{AwsCli, BackupService, FileSystemService};
use efs_attach::backup::BackupJobController;
use efs_attach::cluster::{ClusterApi, KubeCluster};
use efs_attach::config::{BackupConfigPolicy, EngineConfig, RetentionSettings};
use efs_attach::naming::{NamespacePrefix, OwnershipMatcher};
use efs_attach::reaper::{PassReport, RetentionReaper};
use efs_attach::resolver::StorageResolver;
use efs_attach::telemetry::init_tracing;

/// Back up, restore and re-attach EFS storage for blockchain node sets
#[derive(Parser, Debug)]
#[command(name = "efs-attach", version, about, long_about = None)]
struct Cli {
    /// Provider region
    #[arg(long, global = true, env = "AWS_REGION", default_value = "us-east-1")]
    region: String,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "EFS_ATTACH_LOG_JSON")]
    json_logs: bool,

    /// IAM role assumed by backup and restore jobs
    #[arg(long, global = true, env = "EFS_ATTACH_BACKUP_ROLE")]
    backup_role: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the file system bound to a namespace
    Resolve {
        /// Namespace to inspect
        #[arg(short, long, env = "NAMESPACE")]
        namespace: String,
    },

    /// Start a snapshot of a namespace's file system
    Backup(BackupArgs),

    /// Restore a recovery point into a new file system and attach it
    Restore(RestoreArgs),

    /// Attach an existing file system and/or restart consumers
    Attach(AttachArgs),

    /// Delete expired recovery points, unused file systems and vaults
    Reap(ReapArgs),
}

#[derive(Args, Debug)]
struct BackupArgs {
    /// Namespace whose storage is snapshotted
    #[arg(short, long, env = "NAMESPACE")]
    namespace: String,

    /// File system to snapshot; resolved from the namespace when omitted
    #[arg(long)]
    fs_id: Option<String>,

    /// Vault to store the snapshot in; looked up by namespace when omitted
    #[arg(long, env = "EFS_ATTACH_VAULT")]
    vault: Option<String>,

    /// Wait for the job to finish
    #[arg(long)]
    wait: bool,
}

/// Options shared by `restore` and `attach`
#[derive(Args, Debug)]
struct AttachOptions {
    /// Namespace whose storage is changed
    #[arg(short, long, env = "NAMESPACE")]
    namespace: String,

    /// Claims to move to the new file system
    #[arg(long = "claim", value_delimiter = ',')]
    claims: Vec<String>,

    /// Workloads to restart afterwards (substring of the deployed name)
    #[arg(long = "consumer", value_delimiter = ',')]
    consumers: Vec<String>,

    /// Export volume and claim definitions first: always, ask-first or skip
    #[arg(long, env = "EFS_ATTACH_BACKUP_CONFIG", default_value = "always")]
    backup_config: BackupConfigPolicy,

    /// Directory for exported definitions
    #[arg(long, env = "EFS_ATTACH_BACKUP_DIR", default_value = "backups")]
    backup_dir: PathBuf,

    /// Vault for the post-attach snapshot
    #[arg(long, env = "EFS_ATTACH_VAULT")]
    vault: Option<String>,

    /// Wait for the post-attach snapshot instead of leaving it running
    #[arg(long)]
    wait_for_snapshot: bool,
}

#[derive(Args, Debug)]
struct RestoreArgs {
    /// Recovery point to restore
    #[arg(long)]
    recovery_point_arn: String,

    #[command(flatten)]
    attach: AttachOptions,
}

#[derive(Args, Debug)]
struct AttachArgs {
    /// File system to attach
    #[arg(long)]
    fs_id: Option<String>,

    #[command(flatten)]
    attach: AttachOptions,
}

#[derive(Args, Debug)]
struct ReapArgs {
    /// Namespace whose artifacts are reaped
    #[arg(short, long, env = "NAMESPACE")]
    namespace: String,

    /// Recovery points older than this many days are deleted
    #[arg(long, default_value_t = 7)]
    retention_days: i64,

    /// Report what would be deleted without deleting
    #[arg(long)]
    dry_run: bool,
}

/// Prompts on the terminal
struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        print!("{} [y/N] ", prompt);
        if io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }
}

/// Collaborators shared by every subcommand
struct Services {
    config: EngineConfig,
    cluster: Arc<dyn ClusterApi>,
    backups: Arc<dyn BackupService>,
    file_systems: Arc<dyn FileSystemService>,
}

impl Services {
    async fn connect(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = EngineConfig::new(&cli.region);
        if let Some(role) = &cli.backup_role {
            config.backup_role = role.clone();
        }
        let cluster = KubeCluster::try_default()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to cluster: {}", e))?;
        let aws = Arc::new(AwsCli::new(&cli.region));
        Ok(Self {
            config,
            cluster: Arc::new(cluster),
            backups: aws.clone(),
            file_systems: aws,
        })
    }

    fn orchestrator(&self, options: &AttachOptions) -> AttachOrchestrator {
        let mut config = self.config.clone();
        config.backup_config = options.backup_config;
        config.backup_dir = options.backup_dir.clone();
        config.snapshot_vault = options.vault.clone();
        config.wait_for_snapshot = options.wait_for_snapshot;
        AttachOrchestrator::new(
            config,
            Arc::clone(&self.cluster),
            Arc::clone(&self.backups),
            Arc::clone(&self.file_systems),
        )
        .with_confirm(Arc::new(StdinConfirm))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    let services = Services::connect(&cli).await?;

    match &cli.command {
        Commands::Resolve { namespace } => {
            let fs_id = StorageResolver::new(Arc::clone(&services.cluster))
                .resolve(namespace)
                .await?;
            println!("{fs_id}");
        }
        Commands::Backup(args) => run_backup(&services, args, &cancel).await?,
        Commands::Restore(args) => {
            let request = attach_request(&cli.region, None, &args.attach);
            let outcome = services
                .orchestrator(&args.attach)
                .restore_and_attach(&request, &args.recovery_point_arn, &cancel)
                .await?;
            println!("restore job: {}", outcome.restore.job.id);
            match outcome.attach {
                Some(attach) => finish_attach(attach).await,
                None => {
                    for warning in &outcome.restore.warnings {
                        println!("warning: {warning}");
                    }
                    println!("restore produced no file system, nothing to attach");
                }
            }
        }
        Commands::Attach(args) => {
            let request = attach_request(&cli.region, args.fs_id.clone(), &args.attach);
            let outcome = services
                .orchestrator(&args.attach)
                .attach(&request, &cancel)
                .await?;
            finish_attach(outcome).await;
        }
        Commands::Reap(args) => run_reap(&services, args, &cancel).await?,
    }

    Ok(())
}

fn attach_request(region: &str, fs_id: Option<String>, options: &AttachOptions) -> AttachRequest {
    AttachRequest {
        region: region.to_string(),
        namespace: options.namespace.clone(),
        target_file_system_id: fs_id,
        target_claim_names: options.claims.clone(),
        target_consumer_names: options.consumers.clone(),
    }
}

async fn run_backup(
    services: &Services,
    args: &BackupArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let fs_id = match &args.fs_id {
        Some(fs_id) => fs_id.clone(),
        None => {
            StorageResolver::new(Arc::clone(&services.cluster))
                .resolve(&args.namespace)
                .await?
        }
    };

    let controller = BackupJobController::new(
        Arc::clone(&services.backups),
        services.config.backup_role.clone(),
    );
    let vault = match &args.vault {
        Some(vault) => vault.clone(),
        None => controller.find_vault(&args.namespace, &NamespacePrefix).await?,
    };
    let account_id = services.backups.account_id().await?;
    let job_id = controller
        .start_snapshot(&services.config.region, &account_id, &fs_id, &vault)
        .await?;
    println!("snapshot job: {job_id}");

    if args.wait {
        let job = controller
            .await_completion(&job_id, &services.config.polls.backup_job, cancel)
            .await?;
        println!("snapshot job {} {}", job.id, job.state.as_str());
    }
    Ok(())
}

async fn run_reap(
    services: &Services,
    args: &ReapArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    if args.retention_days < 1 {
        anyhow::bail!("--retention-days must be at least 1");
    }
    let settings = RetentionSettings {
        window: chrono::Duration::days(args.retention_days),
        dry_run: args.dry_run,
        ..services.config.retention.clone()
    };
    let ownership: Arc<dyn OwnershipMatcher> = Arc::new(NamespacePrefix);
    let report = RetentionReaper::new(
        Arc::clone(&services.backups),
        Arc::clone(&services.file_systems),
        Arc::clone(&services.cluster),
        ownership,
        settings,
        services.config.polls.propagation,
    )
    .reap(&services.config.region, &args.namespace, cancel)
    .await;

    match &report.bound_file_system {
        Some(fs_id) => println!("bound file system: {fs_id}"),
        None => println!("bound file system: unresolved"),
    }
    let verb = if report.dry_run { "would delete" } else { "deleted" };
    print_pass("recovery points", verb, &report.recovery_points);
    print_pass("file systems", verb, &report.file_systems);
    print_pass("vaults", verb, &report.vaults);

    if !report.is_clean() {
        anyhow::bail!("reap finished with failures");
    }
    info!(namespace = %args.namespace, "reap finished");
    Ok(())
}

fn print_pass(name: &str, verb: &str, pass: &PassReport) {
    if let Some(reason) = &pass.aborted {
        println!("{name}: skipped ({reason})");
        return;
    }
    println!("{name}: {verb} {}", pass.deleted.len());
    for item in &pass.deleted {
        println!("  - {item}");
    }
    for item in &pass.protected {
        println!("  kept {item}");
    }
    for failure in &pass.failures {
        println!("  failed {failure}");
    }
}

/// Print the outcome, then keep the runtime alive until the snapshot monitor
/// has seen the job finish or used up its budget
async fn finish_attach(mut outcome: AttachOutcome) {
    print_attach(&outcome);
    if let Some(monitor) = outcome.snapshot_monitor.take() {
        println!("waiting for the snapshot job (Ctrl-C to stop watching)");
        if let Err(e) = monitor.await {
            warn!(error = %e, "snapshot monitor did not finish");
        }
    }
}

fn print_attach(outcome: &AttachOutcome) {
    if let Some(source) = &outcome.source_file_system {
        println!("previous file system: {source}");
    }
    if let Some(path) = &outcome.backup_file {
        println!("definitions backed up to {}", path.display());
    }
    if let Some(rebind) = &outcome.rebind {
        println!("{} onto {}", rebind.summary(), rebind.target_file_system);
    }
    for name in &outcome.restarted {
        println!("restarted {name}");
    }
    if let Some(job_id) = &outcome.snapshot_job_id {
        println!("snapshot job: {job_id}");
    }
    for warning in &outcome.warnings {
        println!("warning: {warning}");
    }
}
