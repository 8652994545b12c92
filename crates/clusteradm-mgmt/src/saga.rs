//! Step-by-step execution with a compensation log.
//!
//! Each mutating step records how to undo itself. On failure or
//! cancellation the log is unwound in reverse and any compensation that
//! fails is attached to the original error as a degraded cleanup.

use std::sync::Arc;

use clusteradm_meta::{InstanceAddress, MetadataStore};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AdminError, Result};
use crate::retry::RetryExecutor;
use crate::rpc::{ChannelSpec, InstanceAdmin, JoinRequest};

/// Undo action for a completed step.
#[derive(Clone)]
pub enum Compensation {
    LeaveGroup {
        address: InstanceAddress,
    },
    /// Puts a member that left back into its group through `request.seed`
    RejoinGroup {
        address: InstanceAddress,
        request: JoinRequest,
    },
    DropAccount {
        address: InstanceAddress,
        user: String,
    },
    StopChannel {
        address: InstanceAddress,
        channel: String,
    },
    StartChannel {
        address: InstanceAddress,
        spec: ChannelSpec,
    },
    SetSuperReadOnly {
        address: InstanceAddress,
        enabled: bool,
    },
    SetGroupFenced {
        address: InstanceAddress,
        fenced: bool,
    },
    DropSchema {
        store: MetadataStore,
    },
}

impl Compensation {
    fn describe(&self) -> String {
        match self {
            Compensation::LeaveGroup { address } => format!("leave group on {}", address),
            Compensation::RejoinGroup { address, request } => {
                format!("rejoin {} through {}", address, request.seed)
            }
            Compensation::DropAccount { address, user } => {
                format!("drop account {} on {}", user, address)
            }
            Compensation::StopChannel { address, channel } => {
                format!("stop channel '{}' on {}", channel, address)
            }
            Compensation::StartChannel { address, spec } => {
                format!("restart channel '{}' from {} on {}", spec.name, spec.source, address)
            }
            Compensation::SetSuperReadOnly { address, enabled } => {
                format!("set super_read_only={} on {}", enabled, address)
            }
            Compensation::SetGroupFenced { address, fenced } => {
                format!("set fenced={} on the group of {}", fenced, address)
            }
            Compensation::DropSchema { .. } => "drop metadata schema".to_string(),
        }
    }

    async fn run(&self, admin: &Arc<dyn InstanceAdmin>, retry: &RetryExecutor) -> Result<()> {
        match self {
            Compensation::LeaveGroup { address } => {
                retry.run("leave group", move || admin.leave_group(address)).await
            }
            Compensation::RejoinGroup { address, request } => {
                retry
                    .run("join group", move || admin.join_group(address, request))
                    .await
            }
            Compensation::DropAccount { address, user } => {
                retry
                    .run("drop account", move || admin.drop_account(address, user))
                    .await
            }
            Compensation::StopChannel { address, channel } => {
                retry
                    .run("stop channel", move || admin.stop_channel(address, channel))
                    .await
            }
            Compensation::StartChannel { address, spec } => {
                retry
                    .run("start channel", move || admin.start_channel(address, spec))
                    .await
            }
            Compensation::SetSuperReadOnly { address, enabled } => {
                let enabled = *enabled;
                retry
                    .run("set super_read_only", move || {
                        admin.set_super_read_only(address, enabled)
                    })
                    .await
            }
            Compensation::SetGroupFenced { address, fenced } => {
                let fenced = *fenced;
                retry
                    .run("fence group", move || admin.set_group_fenced(address, fenced))
                    .await
            }
            Compensation::DropSchema { store } => {
                store.drop_schema()?;
                Ok(())
            }
        }
    }
}

/// Structured result of a successful operation.
#[derive(Clone, Debug, Default, Serialize)]
pub struct OperationReport {
    pub operation: String,
    pub target: String,
    /// Completed steps in order
    pub steps: Vec<String>,
    /// Advisory findings and best-effort cleanups that did not succeed
    pub warnings: Vec<String>,
    /// True when the goal was met but part of the work was skipped
    pub degraded: bool,
    /// Set by forced failovers that may have discarded transactions
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub data_loss_possible: bool,
}

/// A running operation and its compensation log.
pub struct Saga {
    operation: &'static str,
    target: String,
    admin: Arc<dyn InstanceAdmin>,
    retry: RetryExecutor,
    cancel: CancellationToken,
    steps: Vec<String>,
    log: Vec<Compensation>,
    warnings: Vec<String>,
    degraded: bool,
    data_loss_possible: bool,
}

impl Saga {
    pub fn new(
        operation: &'static str,
        target: impl Into<String>,
        admin: Arc<dyn InstanceAdmin>,
        retry: RetryExecutor,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            operation,
            target: target.into(),
            admin,
            retry,
            cancel,
            steps: Vec::new(),
            log: Vec::new(),
            warnings: Vec::new(),
            degraded: false,
            data_loss_possible: false,
        }
    }

    /// Fails with `Cancelled` if the session was cancelled, then logs the step.
    pub fn checkpoint(&mut self, step: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AdminError::Cancelled(self.operation.to_string()));
        }
        self.note(step);
        Ok(())
    }

    /// Logs a step that runs to completion even after cancellation.
    pub fn note(&mut self, step: &str) {
        debug!(operation = self.operation, target = %self.target, step, "saga step");
        self.steps.push(step.to_string());
    }

    /// Registers the undo action of the step that just completed.
    pub fn record(&mut self, compensation: Compensation) {
        self.log.push(compensation);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(operation = self.operation, target = %self.target, "{}", message);
        self.warnings.push(message);
    }

    pub fn warn_all(&mut self, messages: impl IntoIterator<Item = String>) {
        for message in messages {
            self.warn(message);
        }
    }

    /// Marks the outcome as degraded success.
    pub fn degrade(&mut self, message: impl Into<String>) {
        self.degraded = true;
        self.warn(message);
    }

    /// Flags that transactions may have been lost.
    pub fn data_loss(&mut self, message: impl Into<String>) {
        self.data_loss_possible = true;
        self.warn(message);
    }

    /// Forgets the compensation log once the remaining steps can no longer
    /// be undone, e.g. after the last member of a group left it.
    pub fn settle(&mut self) {
        if !self.log.is_empty() {
            debug!(operation = self.operation, compensations = self.log.len(), "saga settled");
        }
        self.log.clear();
    }

    /// Number of pending compensations.
    pub fn pending(&self) -> usize {
        self.log.len()
    }

    /// Drops the compensation log and produces the report.
    pub fn commit(self) -> OperationReport {
        info!(
            operation = self.operation,
            target = %self.target,
            steps = self.steps.len(),
            warnings = self.warnings.len(),
            degraded = self.degraded,
            "operation complete"
        );
        OperationReport {
            operation: self.operation.to_string(),
            target: self.target,
            steps: self.steps,
            warnings: self.warnings,
            degraded: self.degraded,
            data_loss_possible: self.data_loss_possible,
        }
    }

    /// Unwinds every recorded compensation in reverse order and returns the
    /// error to surface.
    pub async fn abort(self, error: AdminError) -> AdminError {
        warn!(
            operation = self.operation,
            target = %self.target,
            error = %error,
            compensations = self.log.len(),
            "operation failed, rolling back"
        );
        let mut failures = Vec::new();
        for compensation in self.log.iter().rev() {
            match compensation.run(&self.admin, &self.retry).await {
                Ok(()) => debug!(action = %compensation.describe(), "compensated"),
                Err(e) => {
                    warn!(action = %compensation.describe(), error = %e, "compensation failed");
                    failures.push(format!("{}: {}", compensation.describe(), e));
                }
            }
        }
        error.with_cleanup_failures(failures)
    }
}
