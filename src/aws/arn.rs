//! ARN parsing and formatting

use crate::naming::is_file_system_id;
use crate::Error;

/// The fields of an ARN this crate cares about
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Arn<'a> {
    /// Partition (`aws`, `aws-cn`, ...)
    pub partition: &'a str,
    /// Service (`backup`, `elasticfilesystem`, ...)
    pub service: &'a str,
    /// Region
    pub region: &'a str,
    /// Account id
    pub account: &'a str,
    /// Everything after the account
    pub resource: &'a str,
}

/// Split an ARN into its fields
pub fn parse(arn: &str) -> Result<Arn<'_>, Error> {
    let mut parts = arn.splitn(6, ':');
    let (prefix, partition, service, region, account, resource) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    );
    match (prefix, partition, service, region, account, resource) {
        (Some("arn"), Some(partition), Some(service), Some(region), Some(account), Some(resource))
            if !partition.is_empty() && !service.is_empty() && !resource.is_empty() =>
        {
            Ok(Arn {
                partition,
                service,
                region,
                account,
                resource,
            })
        }
        _ => Err(Error::validation(format!("malformed ARN '{}'", arn))),
    }
}

/// ARN of a file system
pub fn file_system_arn(region: &str, account_id: &str, file_system_id: &str) -> String {
    format!(
        "arn:aws:elasticfilesystem:{}:{}:file-system/{}",
        region, account_id, file_system_id
    )
}

/// Extract the file-system id from a file-system ARN.
///
/// Returns `None` for well-formed ARNs of any other resource type; a restore
/// that produced something other than a file system has nothing to attach.
pub fn file_system_id_from_arn(arn: &str) -> Option<String> {
    let parsed = parse(arn).ok()?;
    if parsed.service != "elasticfilesystem" {
        return None;
    }
    let id = parsed.resource.strip_prefix("file-system/")?;
    is_file_system_id(id).then(|| id.to_string())
}

/// Validate a recovery-point ARN.
///
/// Backup-service recovery points look like
/// `arn:aws:backup:<region>:<account>:recovery-point:<id>`.
pub fn parse_recovery_point_arn(arn: &str) -> Result<Arn<'_>, Error> {
    let parsed = parse(arn)?;
    let valid = match parsed.service {
        "backup" => parsed
            .resource
            .strip_prefix("recovery-point:")
            .is_some_and(|id| !id.is_empty()),
        _ => false,
    };
    if !valid {
        return Err(Error::validation(format!(
            "'{}' is not a recovery point ARN",
            arn
        )));
    }
    Ok(parsed)
}
