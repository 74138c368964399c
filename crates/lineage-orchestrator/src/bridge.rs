//! Suspend/resume bridge.
//!
//! Instead of blocking in [`CompletionWaiter::await_all`], an execution can
//! ask the remote service to resume it once its children are terminal. The
//! bridge registers the wait condition, leaves a [`SuspensionRecord`] in the
//! execution state and hands control back to the host. When the resume event
//! fires, the host rebuilds the execution from its persisted state and calls
//! [`SuspendBridge::resume`].

use std::sync::Arc;
use std::time::Duration;

use lineage_client::{ProcessService, WaitCondition};
use tracing::info;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::retry::RetryPolicy;
use crate::state::{ExecutionState, RESUME_EVENT, SuspensionRecord};
use crate::task::TaskOutcome;
use crate::waiter::{AggregateResult, CompletionWaiter};

const WAIT_REASON: &str = "Waiting for a child process to end";

/// Whether an execution is parked on a suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// No suspension recorded.
    Active,
    /// A suspension record is pending.
    Suspended,
}

impl BridgeState {
    pub fn of(state: &ExecutionState) -> Self {
        if state.pending_suspension().is_some() {
            Self::Suspended
        } else {
            Self::Active
        }
    }
}

#[derive(Clone)]
pub struct SuspendBridge {
    service: Arc<dyn ProcessService>,
    waiter: CompletionWaiter,
    retry: RetryPolicy,
}

impl SuspendBridge {
    pub fn new(service: Arc<dyn ProcessService>, waiter: CompletionWaiter) -> Self {
        let retry = waiter.policy().retry;
        Self {
            service,
            waiter,
            retry,
        }
    }

    /// Park `parent_id` until every process in `ids` is terminal.
    pub async fn suspend(
        &self,
        parent_id: Uuid,
        ids: &[Uuid],
        state: &mut ExecutionState,
    ) -> Result<TaskOutcome> {
        if BridgeState::of(state) == BridgeState::Suspended {
            return Err(OrchestratorError::invalid(
                "execution is already suspended",
            ));
        }
        if ids.is_empty() {
            return Err(OrchestratorError::invalid("nothing to wait for"));
        }

        let condition = WaitCondition::process_completion(ids.to_vec(), RESUME_EVENT, WAIT_REASON);
        self.retry
            .run("setWaitCondition", || {
                self.service.set_wait_condition(parent_id, &condition)
            })
            .await
            .map_err(|e| OrchestratorError::remote("setWaitCondition", e))?;

        state.suspension = Some(SuspensionRecord::new(ids.to_vec()));
        info!(
            parent_id = %parent_id,
            count = ids.len(),
            resume_event = RESUME_EVENT,
            "Suspending until child processes complete"
        );

        Ok(TaskOutcome::Suspended {
            resume_event: RESUME_EVENT.to_string(),
        })
    }

    /// Consume the pending suspension and collect the terminal statuses of its
    /// wait set. The record is only cleared once the wait succeeded, so a
    /// failed resume can be retried.
    pub async fn resume(
        &self,
        state: &mut ExecutionState,
        timeout: Option<Duration>,
    ) -> Result<AggregateResult> {
        let Some(record) = state.pending_suspension() else {
            return Err(OrchestratorError::invalid(
                "no pending suspension to resume",
            ));
        };

        info!(count = record.wait_set.len(), "Resuming after suspension");
        let result = self.waiter.await_all(&record.wait_set, timeout).await?;
        state.suspension = None;
        Ok(result)
    }
}
