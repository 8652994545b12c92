//! Instance probing and configuration checks.
//!
//! A probe gathers facts and the group view of one instance and classifies
//! configuration problems as fatal (the instance cannot be managed) or
//! advisory (reported as a warning).

use std::fmt;
use std::sync::Arc;

use clusteradm_meta::{InstanceAddress, Version};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AdminError, Result};
use crate::retry::RetryExecutor;
use crate::rpc::{GroupMemberState, GroupView, InstanceAdmin, InstanceFacts};

/// Oldest server release with group replication support.
pub const MIN_SERVER_VERSION: Version = Version::new(5, 7, 17);

const MIN_PAGE_SIZE: u64 = 8192;
const NON_TRANSACTIONAL_ENGINES: [&str; 5] = ["MyISAM", "BLACKHOLE", "FEDERATED", "ARCHIVE", "MEMORY"];

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    /// Blocks management of the instance
    Fatal,
    /// Reported but not blocking
    Advisory,
}

/// A setting that differs from what group replication expects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigIssue {
    pub variable: String,
    pub current: String,
    pub required: String,
    pub severity: IssueSeverity,
}

impl ConfigIssue {
    fn fatal(variable: &str, current: impl Into<String>, required: impl Into<String>) -> Self {
        Self {
            variable: variable.to_string(),
            current: current.into(),
            required: required.into(),
            severity: IssueSeverity::Fatal,
        }
    }

    fn advisory(variable: &str, current: impl Into<String>, required: impl Into<String>) -> Self {
        Self {
            variable: variable.to_string(),
            current: current.into(),
            required: required.into(),
            severity: IssueSeverity::Advisory,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == IssueSeverity::Fatal
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is '{}' but must be {}",
            self.variable, self.current, self.required
        )
    }
}

/// Everything a probe learned about one instance.
#[derive(Clone, Debug)]
pub struct ProbeReport {
    pub facts: InstanceFacts,
    pub view: Option<GroupView>,
    pub issues: Vec<ConfigIssue>,
}

impl ProbeReport {
    pub fn address(&self) -> &InstanceAddress {
        &self.facts.address
    }

    /// True when the instance is not running group replication.
    pub fn is_standalone(&self) -> bool {
        self.view.is_none()
    }

    /// State of the instance itself in its group view.
    pub fn member_state(&self) -> Option<GroupMemberState> {
        self.view
            .as_ref()
            .and_then(|v| v.member(&self.facts.server_uuid))
            .map(|m| m.state)
    }

    pub fn fatal_issues(&self) -> impl Iterator<Item = &ConfigIssue> {
        self.issues.iter().filter(|i| i.is_fatal())
    }

    /// Fails with `Configuration` on fatal issues, otherwise returns the
    /// advisory issues as warnings.
    pub fn ensure_admissible(&self) -> Result<Vec<String>> {
        let fatal: Vec<ConfigIssue> = self.fatal_issues().cloned().collect();
        if !fatal.is_empty() {
            return Err(AdminError::Configuration {
                address: self.facts.address.to_string(),
                issues: fatal,
            });
        }
        Ok(self
            .issues
            .iter()
            .filter(|i| !i.is_fatal())
            .map(|i| format!("{}: {}", self.facts.address, i))
            .collect())
    }
}

/// Classifies the configuration of an instance.
pub fn check_configuration(facts: &InstanceFacts) -> Vec<ConfigIssue> {
    let mut issues = Vec::new();
    let var = |name: &str| facts.variable(name).unwrap_or("").to_string();
    let is_on = |name: &str| {
        let v = var(name);
        v.eq_ignore_ascii_case("ON") || v == "1"
    };

    if facts.server_id == 0 {
        issues.push(ConfigIssue::fatal("server_id", "0", "a non-zero unique value"));
    }
    if !is_on("gtid_mode") {
        issues.push(ConfigIssue::fatal("gtid_mode", var("gtid_mode"), "ON"));
    }
    if !is_on("enforce_gtid_consistency") {
        issues.push(ConfigIssue::fatal(
            "enforce_gtid_consistency",
            var("enforce_gtid_consistency"),
            "ON",
        ));
    }
    if !is_on("log_bin") {
        issues.push(ConfigIssue::fatal("log_bin", var("log_bin"), "ON"));
    }
    let page_size = var("innodb_page_size");
    if page_size.parse::<u64>().map(|p| p < MIN_PAGE_SIZE).unwrap_or(true) {
        issues.push(ConfigIssue::fatal(
            "innodb_page_size",
            page_size,
            format!("at least {}", MIN_PAGE_SIZE),
        ));
    }
    if InstanceAddress::new(facts.reported_host(), facts.address.port()).is_loopback() {
        issues.push(ConfigIssue::fatal(
            "report_host",
            facts.reported_host(),
            "a non-loopback host reachable by other members",
        ));
    }
    if facts.version < MIN_SERVER_VERSION {
        issues.push(ConfigIssue::fatal(
            "version",
            facts.version.to_string(),
            format!("at least {}", MIN_SERVER_VERSION),
        ));
    }

    let bind = var("bind_address");
    if matches!(bind.as_str(), "127.0.0.1" | "::1" | "localhost") {
        issues.push(ConfigIssue::advisory(
            "bind_address",
            bind,
            "an address reachable by other members",
        ));
    }
    let disabled = var("disabled_storage_engines");
    let missing: Vec<&str> = NON_TRANSACTIONAL_ENGINES
        .iter()
        .copied()
        .filter(|engine| {
            !disabled
                .split(',')
                .any(|d| d.trim().eq_ignore_ascii_case(engine))
        })
        .collect();
    if !missing.is_empty() {
        issues.push(ConfigIssue::advisory(
            "disabled_storage_engines",
            disabled,
            format!("a list including {}", missing.join(",")),
        ));
    }
    if facts.version.major == 5 && !var("binlog_checksum").eq_ignore_ascii_case("NONE") {
        issues.push(ConfigIssue::advisory(
            "binlog_checksum",
            var("binlog_checksum"),
            "NONE",
        ));
    }
    issues
}

/// Gathers facts from instances through the admin RPC surface.
#[derive(Clone)]
pub struct InstanceProbe {
    admin: Arc<dyn InstanceAdmin>,
    retry: RetryExecutor,
}

impl InstanceProbe {
    pub fn new(admin: Arc<dyn InstanceAdmin>, retry: RetryExecutor) -> Self {
        Self { admin, retry }
    }

    pub async fn facts(&self, address: &InstanceAddress) -> Result<InstanceFacts> {
        let admin = &self.admin;
        self.retry
            .run("fetch facts", move || admin.fetch_facts(address))
            .await
    }

    pub async fn view(&self, address: &InstanceAddress) -> Result<Option<GroupView>> {
        let admin = &self.admin;
        self.retry
            .run("group view", move || admin.group_view(address))
            .await
    }

    /// Facts, group view and configuration issues of one instance.
    pub async fn probe(&self, address: &InstanceAddress) -> Result<ProbeReport> {
        let facts = self.facts(address).await?;
        let view = self.view(address).await?;
        let issues = check_configuration(&facts);
        debug!(
            address = %address,
            server_id = facts.server_id,
            version = %facts.version,
            issues = issues.len(),
            "probed instance"
        );
        Ok(ProbeReport {
            facts,
            view,
            issues,
        })
    }

    /// Probes several instances concurrently.
    pub async fn probe_many(
        &self,
        addresses: &[InstanceAddress],
    ) -> Vec<(InstanceAddress, Result<ProbeReport>)> {
        let results = join_all(addresses.iter().map(|a| self.probe(a))).await;
        addresses
            .iter()
            .cloned()
            .zip(results)
            .inspect(|(address, r)| {
                if let Err(e) = r {
                    warn!(address = %address, error = %e, "probe failed");
                }
            })
            .collect()
    }
}
