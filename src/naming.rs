//! Naming conventions and ownership inference
//!
//! Provider resources carry no authoritative owner tag, so ownership is
//! inferred from names. All of that inference lives behind
//! [`OwnershipMatcher`] so a tag-based scheme can replace it without touching
//! the reaper or resolver.

use std::fmt;

/// Prefix shared by all network file-system ids
pub const FILE_SYSTEM_ID_PREFIX: &str = "fs-";

/// True when `id` is a complete file-system id (`fs-` followed by one or more
/// lowercase hex digits)
pub fn is_file_system_id(id: &str) -> bool {
    match id.strip_prefix(FILE_SYSTEM_ID_PREFIX) {
        Some(rest) => {
            !rest.is_empty()
                && rest
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        }
        None => false,
    }
}

/// Extract a file-system id from a CSI volume handle.
///
/// Handles take the forms `fs-id`, `fs-id::fsap-id` and `fs-id:/sub/path`;
/// only the first segment is considered. Malformed ids yield `None`.
pub fn file_system_id_from_handle(handle: &str) -> Option<&str> {
    let head = handle.split(':').next().unwrap_or_default().trim();
    is_file_system_id(head).then_some(head)
}

/// Decides whether a provider resource name belongs to a namespace
pub trait OwnershipMatcher: Send + Sync {
    /// True when `name` belongs to `namespace`
    fn owns(&self, namespace: &str, name: &str) -> bool;
}

/// Exact-prefix-plus-separator ownership.
///
/// `chain1` owns `chain1` and `chain1-vault`, but not `chain10-vault` and not
/// `prod-chain1-vault`. Plain substring containment would accept both.
#[derive(Debug, Default, Clone, Copy)]
pub struct NamespacePrefix;

impl OwnershipMatcher for NamespacePrefix {
    fn owns(&self, namespace: &str, name: &str) -> bool {
        if namespace.is_empty() {
            return false;
        }
        match name.strip_prefix(namespace) {
            Some("") => true,
            Some(rest) => rest.starts_with('-'),
            None => false,
        }
    }
}

/// A generated volume name: `{chain}-{timestamp}-{product}-{component}`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedName {
    /// Chain / namespace identifier
    pub chain: String,
    /// Unix timestamp embedded at generation time
    pub timestamp: u64,
    /// Product / release name
    pub product: String,
    /// Component name, may itself contain dashes (e.g. `op-geth`)
    pub component: String,
}

impl GeneratedName {
    /// Parse a generated name. The chain is everything before the first
    /// all-digit segment; the product is the segment after it; the rest is
    /// the component.
    pub fn parse(name: &str) -> Option<Self> {
        let parts: Vec<&str> = name.split('-').collect();
        let ts_idx = parts
            .iter()
            .position(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))?;
        if ts_idx == 0 || parts.len() < ts_idx + 3 {
            return None;
        }
        let timestamp = parts[ts_idx].parse().ok()?;
        let component = parts[ts_idx + 2..].join("-");
        if component.is_empty() || parts[ts_idx + 1].is_empty() {
            return None;
        }
        Some(Self {
            chain: parts[..ts_idx].join("-"),
            timestamp,
            product: parts[ts_idx + 1].to_string(),
            component,
        })
    }
}

impl fmt::Display for GeneratedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.chain, self.timestamp, self.product, self.component
        )
    }
}

/// Deployed workload names that contain the requested consumer name.
///
/// Generated names embed a timestamp that callers cannot predict, so
/// consumers are located by substring match against what is actually running.
pub fn match_consumers<'a>(requested: &str, deployed: &'a [String]) -> Vec<&'a str> {
    if requested.is_empty() {
        return Vec::new();
    }
    deployed
        .iter()
        .filter(|name| name.contains(requested))
        .map(String::as_str)
        .collect()
}
