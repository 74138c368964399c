//! Completion waiter.
//!
//! Polls a set of processes until every one of them is terminal. Each
//! identifier gets its own polling task in a [`JoinSet`]; results are merged
//! once, when the last task finishes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use lineage_client::{ProcessEntry, ProcessService, ProcessStatus};
use lineage_core::config::WaitSettings;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregate::extract_error;
use crate::error::{OrchestratorError, Result};
use crate::launcher::ProcessHandle;
use crate::retry::RetryPolicy;

/// How statuses are polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Retry budget of each status query.
    pub retry: RetryPolicy,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl PollPolicy {
    pub fn from_settings(wait: &WaitSettings) -> Self {
        Self {
            interval: wait.poll_interval(),
            retry: RetryPolicy::from_settings(wait),
        }
    }
}

/// Identifiers awaited together, with an optional absolute deadline.
#[derive(Debug, Clone)]
pub struct WaitSet {
    ids: Vec<Uuid>,
    started: Instant,
    deadline: Option<Instant>,
}

impl WaitSet {
    /// Begin waiting now. Duplicate identifiers are collapsed.
    pub fn new(ids: &[Uuid], timeout: Option<Duration>) -> Self {
        let mut unique = Vec::with_capacity(ids.len());
        for id in ids {
            if !unique.contains(id) {
                unique.push(*id);
            }
        }
        let started = Instant::now();
        Self {
            ids: unique,
            started,
            deadline: timeout.map(|t| started + t),
        }
    }

    pub fn ids(&self) -> &[Uuid] {
        &self.ids
    }

    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Terminal snapshot of one awaited child.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildResult {
    pub entry: ProcessEntry,
    /// Error detail from `meta.out.lastError`; empty when absent.
    pub error: String,
}

impl ChildResult {
    pub fn new(entry: ProcessEntry) -> Self {
        let error = extract_error(&entry);
        Self { entry, error }
    }

    pub const fn status(&self) -> ProcessStatus {
        self.entry.status
    }

    pub const fn handle(&self) -> ProcessHandle {
        ProcessHandle {
            id: self.entry.instance_id,
            status: self.entry.status,
        }
    }
}

/// Terminal results keyed (and therefore ordered) by identifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateResult {
    children: BTreeMap<Uuid, ChildResult>,
}

impl AggregateResult {
    pub fn insert(&mut self, entry: ProcessEntry) {
        self.children.insert(entry.instance_id, ChildResult::new(entry));
    }

    pub fn get(&self, id: &Uuid) -> Option<&ChildResult> {
        self.children.get(id)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &ChildResult)> {
        self.children.iter()
    }

    /// Children that reached a failure terminal, in identifier order.
    pub fn failures(&self) -> impl Iterator<Item = &ChildResult> {
        self.children.values().filter(|c| c.status().is_failure())
    }

    /// Children that finished successfully, in identifier order.
    pub fn successes(&self) -> impl Iterator<Item = &ChildResult> {
        self.children
            .values()
            .filter(|c| c.status() == ProcessStatus::Finished)
    }
}

impl FromIterator<ProcessEntry> for AggregateResult {
    fn from_iter<I: IntoIterator<Item = ProcessEntry>>(iter: I) -> Self {
        let mut result = Self::default();
        for entry in iter {
            result.insert(entry);
        }
        result
    }
}

/// Waits for processes to reach a terminal status.
#[derive(Clone)]
pub struct CompletionWaiter {
    service: Arc<dyn ProcessService>,
    policy: PollPolicy,
}

impl CompletionWaiter {
    pub fn new(service: Arc<dyn ProcessService>, policy: PollPolicy) -> Self {
        Self { service, policy }
    }

    pub const fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Wait until every identifier is terminal.
    ///
    /// Fails with [`OrchestratorError::WaitTimeout`] as soon as any identifier
    /// is still non-terminal at the deadline; the remaining polls are aborted.
    pub async fn await_all(
        &self,
        ids: &[Uuid],
        timeout: Option<Duration>,
    ) -> Result<AggregateResult> {
        let wait_set = WaitSet::new(ids, timeout);
        info!(
            count = wait_set.ids().len(),
            timeout_ms = timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            "Waiting for processes"
        );

        let mut tasks = JoinSet::new();
        for &id in wait_set.ids() {
            tasks.spawn(poll_until_terminal(
                Arc::clone(&self.service),
                self.policy,
                id,
                wait_set.started,
                wait_set.deadline(),
            ));
        }

        let mut result = AggregateResult::default();
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => {
                    tasks.abort_all();
                    return Err(OrchestratorError::invalid(format!(
                        "polling task cancelled: {e}"
                    )));
                }
            };
            match outcome {
                Ok(entry) => result.insert(entry),
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        debug!(count = result.len(), "All processes terminal");
        Ok(result)
    }

    /// Wait for a single process.
    pub async fn await_one(&self, id: Uuid, timeout: Option<Duration>) -> Result<ProcessEntry> {
        let wait_set = WaitSet::new(&[id], timeout);
        poll_until_terminal(
            Arc::clone(&self.service),
            self.policy,
            id,
            wait_set.started,
            wait_set.deadline(),
        )
        .await
    }
}

async fn poll_until_terminal(
    service: Arc<dyn ProcessService>,
    policy: PollPolicy,
    id: Uuid,
    started: Instant,
    deadline: Option<Instant>,
) -> Result<ProcessEntry> {
    loop {
        let entry = match policy
            .retry
            .run_until("getStatus", deadline, || service.get_status(id))
            .await
        {
            Ok(entry) => entry,
            Err(e) if deadline.is_some_and(|d| Instant::now() >= d) => {
                warn!(instance_id = %id, error = %e, "Status unavailable at deadline");
                return Err(timed_out(id, started));
            }
            Err(e) => return Err(OrchestratorError::remote("getStatus", e)),
        };

        if entry.status.is_terminal() {
            info!(instance_id = %id, status = %entry.status, "Process is terminal");
            return Ok(entry);
        }

        let mut sleep_for = policy.interval;
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                debug!(instance_id = %id, status = %entry.status, "Still running at deadline");
                return Err(timed_out(id, started));
            }
            sleep_for = sleep_for.min(deadline - now);
        }

        debug!(instance_id = %id, status = %entry.status, "Process not terminal yet");
        tokio::time::sleep(sleep_for).await;
    }
}

fn timed_out(id: Uuid, started: Instant) -> OrchestratorError {
    let elapsed = started.elapsed();
    warn!(
        instance_id = %id,
        elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        "Timed out waiting for process"
    );
    OrchestratorError::WaitTimeout { id, elapsed }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::testing::FakeProcessService;

    fn waiter(fake: &Arc<FakeProcessService>) -> CompletionWaiter {
        CompletionWaiter::new(
            Arc::clone(fake) as Arc<dyn ProcessService>,
            PollPolicy {
                interval: Duration::from_millis(500),
                retry: RetryPolicy {
                    max_attempts: 3,
                    delay: Duration::from_millis(100),
                },
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn all_finished_before_deadline() {
        let fake = Arc::new(FakeProcessService::new());
        let a = fake.add_scripted(ProcessStatus::Finished, Duration::from_secs(1));
        let b = fake.add_scripted(ProcessStatus::Finished, Duration::from_secs(3));

        let result = waiter(&fake)
            .await_all(&[a, b], Some(Duration::from_secs(10)))
            .await
            .unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result.failures().count(), 0);
        assert_eq!(result.successes().count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn one_stuck_member_times_out_the_whole_wait() {
        let fake = Arc::new(FakeProcessService::new());
        let done = fake.add_process(ProcessStatus::Finished);
        let stuck = fake.add_process(ProcessStatus::Running);

        let err = waiter(&fake)
            .await_all(&[done, stuck], Some(Duration::from_secs(2)))
            .await
            .unwrap_err();

        match err {
            OrchestratorError::WaitTimeout { id, elapsed } => {
                assert_eq!(id, stuck);
                assert_eq!(elapsed, Duration::from_secs(2));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poll_never_sleeps_past_deadline() {
        let fake = Arc::new(FakeProcessService::new());
        let stuck = fake.add_process(ProcessStatus::Suspended);
        let started = Instant::now();

        let err = waiter(&fake)
            .await_one(stuck, Some(Duration::from_millis(1200)))
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::WaitTimeout { .. }));
        assert_eq!(started.elapsed(), Duration::from_millis(1200));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_terminals_are_recorded_not_raised() {
        let fake = Arc::new(FakeProcessService::new());
        let failed = fake.add_process(ProcessStatus::Failed);
        fake.set_error(failed, "boom");
        let cancelled = fake.add_process(ProcessStatus::Cancelled);

        let result = waiter(&fake)
            .await_all(&[failed, cancelled], None)
            .await
            .unwrap();

        assert_eq!(result.failures().count(), 2);
        assert_eq!(result.get(&failed).unwrap().error, "boom");
        assert_eq!(result.get(&cancelled).unwrap().error, "");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_status_errors_are_retried() {
        let fake = Arc::new(FakeProcessService::new());
        let a = fake.add_process(ProcessStatus::Finished);
        fake.fail_status_calls(a, 2);

        let result = waiter(&fake).await_all(&[a], None).await.unwrap();
        assert_eq!(result.get(&a).unwrap().status(), ProcessStatus::Finished);
        assert_eq!(fake.status_calls(a), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_are_remote_call_failures() {
        let fake = Arc::new(FakeProcessService::new());
        let a = fake.add_process(ProcessStatus::Finished);
        fake.fail_status_calls(a, 3);

        let err = waiter(&fake).await_all(&[a], None).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::RemoteCallFailed {
                operation: "getStatus",
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_status_queries_do_not_overshoot_deadline() {
        let fake = Arc::new(FakeProcessService::new());
        let stuck = fake.add_process(ProcessStatus::Running);
        fake.fail_status_calls(stuck, 10);
        let waiter = CompletionWaiter::new(
            Arc::clone(&fake) as Arc<dyn ProcessService>,
            PollPolicy {
                interval: Duration::from_millis(500),
                retry: RetryPolicy {
                    max_attempts: 3,
                    delay: Duration::from_secs(1),
                },
            },
        );
        let started = Instant::now();

        let err = waiter
            .await_one(stuck, Some(Duration::from_millis(1200)))
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::WaitTimeout { id, .. } if id == stuck));
        assert_eq!(started.elapsed(), Duration::from_millis(1200));
        assert_eq!(fake.status_calls(stuck), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_ids_are_polled_once() {
        let fake = Arc::new(FakeProcessService::new());
        let a = fake.add_process(ProcessStatus::Finished);

        let result = waiter(&fake).await_all(&[a, a], None).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(fake.status_calls(a), 1);
    }

    #[test]
    fn aggregate_is_ordered_by_id() {
        let mut ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let result: AggregateResult = ids
            .iter()
            .map(|&id| ProcessEntry {
                instance_id: id,
                status: ProcessStatus::Finished,
                parent_instance_id: None,
                tags: None,
                meta: None,
            })
            .collect();
        ids.sort();
        let keys: Vec<Uuid> = result.iter().map(|(id, _)| *id).collect();
        assert_eq!(keys, ids);
    }
}
