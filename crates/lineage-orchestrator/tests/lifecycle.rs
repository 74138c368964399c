#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end child process lifecycles through [`ChildProcessTask`], against
//! the in-memory process service with paused time.

use std::sync::Arc;
use std::time::Duration;

use lineage_client::{ProcessService, ProcessStatus};
use lineage_core::Settings;
use lineage_orchestrator::testing::FakeProcessService;
use lineage_orchestrator::{
    ChildProcessTask, Execution, ExecutionState, FixedConnector, OrchestratorError,
    ResultAggregator, TaskOutcome, TaskOutput,
};
use serde_json::{Map, Value, json};
use uuid::Uuid;

fn map(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        _ => Map::new(),
    }
}

/// Task wired to `fake` with default settings.
fn task(fake: &Arc<FakeProcessService>) -> ChildProcessTask {
    let connector = FixedConnector::new(Arc::clone(fake) as Arc<dyn ProcessService>);
    ChildProcessTask::new(Arc::new(connector), &Settings::default())
}

fn completed(outcome: TaskOutcome) -> TaskOutput {
    match outcome {
        TaskOutcome::Completed(output) => output,
        TaskOutcome::Suspended { resume_event } => {
            panic!("unexpected suspension on {resume_event}")
        }
    }
}

/// Execution with a `flow.zip` payload in its work directory.
fn execution_with_payload() -> (Execution, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("flow.zip"), b"PK\x03\x04flow").unwrap();
    (Execution::new(Uuid::new_v4(), dir.path()), dir)
}

// =========================================================================
// Synchronous start
// =========================================================================

#[tokio::test(start_paused = true)]
async fn sync_start_of_finishing_child() {
    let fake = Arc::new(FakeProcessService::new());
    fake.on_launch(ProcessStatus::Finished, Duration::from_secs(12));
    let (mut execution, _dir) = execution_with_payload();

    let output = completed(
        task(&fake)
            .execute(
                "start",
                &map(json!({"payload": "flow.zip", "sync": true, "instances": 1})),
                &mut execution,
            )
            .await
            .unwrap(),
    );

    assert_eq!(output.handles.len(), 1);
    let id = output.handles[0].id;
    assert_eq!(execution.state.jobs, vec![id]);

    let results = output.results.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results.failures().count(), 0);
    assert_eq!(results.get(&id).unwrap().status(), ProcessStatus::Finished);
    assert_eq!(execution.state.job_out, Some(Map::new()));

    let submitted = fake.submitted();
    assert_eq!(submitted[0].parent_instance_id, Some(execution.instance_id));
    assert_eq!(submitted[0].archive.as_deref(), Some(&b"PK\x03\x04flow"[..]));
}

#[tokio::test(start_paused = true)]
async fn sync_start_publishes_child_output() {
    let fake = Arc::new(FakeProcessService::new());
    fake.on_launch_output(&json!({"greeting": "hello"}));
    let (mut execution, _dir) = execution_with_payload();

    task(&fake)
        .execute(
            "start",
            &map(json!({"payload": "flow.zip", "sync": true, "outVars": ["greeting"]})),
            &mut execution,
        )
        .await
        .unwrap();

    let job_out = execution.state.job_out.unwrap();
    assert_eq!(job_out.get("greeting"), Some(&json!("hello")));
    assert_eq!(fake.submitted()[0].request.out_expressions, vec!["greeting"]);
}

#[tokio::test(start_paused = true)]
async fn sync_start_of_failing_child_raises_aggregate_failure() {
    let fake = Arc::new(FakeProcessService::new());
    fake.on_launch(ProcessStatus::Failed, Duration::from_secs(3));
    fake.on_launch_error("boom");
    let (mut execution, _dir) = execution_with_payload();

    let err = task(&fake)
        .execute(
            "start",
            &map(json!({"payload": "flow.zip", "sync": true})),
            &mut execution,
        )
        .await
        .unwrap_err();

    let id = execution.state.jobs[0];
    match err {
        OrchestratorError::AggregateFailure { message, failed } => {
            assert_eq!(failed, vec![id]);
            assert_eq!(message, format!("Child process {id} FAILED (error: boom)"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn sync_start_with_ignore_failures_completes() {
    let fake = Arc::new(FakeProcessService::new());
    fake.on_launch(ProcessStatus::Cancelled, Duration::ZERO);
    let (mut execution, _dir) = execution_with_payload();

    let output = completed(
        task(&fake)
            .execute(
                "start",
                &map(json!({"payload": "flow.zip", "sync": true, "ignoreFailures": true})),
                &mut execution,
            )
            .await
            .unwrap(),
    );
    assert_eq!(output.results.unwrap().failures().count(), 1);
    assert_eq!(execution.state.job_out, Some(Map::new()));
}

#[tokio::test(start_paused = true)]
async fn sync_start_times_out_locally() {
    let fake = Arc::new(FakeProcessService::new());
    fake.on_launch(ProcessStatus::Finished, Duration::from_secs(3600));
    let (mut execution, _dir) = execution_with_payload();

    let err = task(&fake)
        .execute(
            "start",
            &map(json!({"payload": "flow.zip", "sync": true, "timeout": 7000})),
            &mut execution,
        )
        .await
        .unwrap_err();

    match err {
        OrchestratorError::WaitTimeout { id, elapsed } => {
            assert_eq!(id, execution.state.jobs[0]);
            assert_eq!(elapsed, Duration::from_millis(7000));
        }
        other => panic!("unexpected error: {other}"),
    }
}

// =========================================================================
// Suspend and resume
// =========================================================================

#[tokio::test(start_paused = true)]
async fn suspended_start_resumes_from_persisted_state() {
    let fake = Arc::new(FakeProcessService::new());
    fake.on_launch(ProcessStatus::Finished, Duration::from_secs(30));
    fake.on_launch_output(&json!({"answer": 42}));
    let (mut execution, _dir) = execution_with_payload();
    let params = map(json!({
        "payload": "flow.zip",
        "sync": true,
        "suspend": true,
        "outVars": ["answer"]
    }));

    let outcome = task(&fake)
        .execute("start", &params, &mut execution)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        TaskOutcome::Suspended {
            resume_event: "lineageTask".into()
        }
    );
    let child = execution.state.jobs[0];
    let conditions = fake.wait_conditions();
    assert_eq!(conditions.len(), 1);
    assert_eq!(conditions[0].0, execution.instance_id);
    assert_eq!(conditions[0].1.processes, vec![child]);

    // The host tears the execution down and later rebuilds it from storage.
    let persisted = serde_json::to_string(&execution.state).unwrap();
    tokio::time::advance(Duration::from_secs(31)).await;

    let mut restored = Execution::new(execution.instance_id, execution.work_dir.clone());
    restored.state = serde_json::from_str::<ExecutionState>(&persisted).unwrap();

    let output = completed(
        task(&fake)
            .execute("start", &params, &mut restored)
            .await
            .unwrap(),
    );

    assert!(restored.state.suspension.is_none());
    assert_eq!(restored.state.jobs, vec![child]);
    assert_eq!(
        restored.state.job_out.unwrap().get("answer"),
        Some(&json!(42))
    );
    assert_eq!(fake.launched().len(), 1, "resume must not launch again");

    let direct = task(&fake)
        .wait_for_completion(&[child], None)
        .await
        .unwrap();
    assert_eq!(output.results.unwrap(), direct);
}

#[tokio::test(start_paused = true)]
async fn resume_of_failed_child_raises() {
    let fake = Arc::new(FakeProcessService::new());
    fake.on_launch(ProcessStatus::Running, Duration::ZERO);
    let (mut execution, _dir) = execution_with_payload();
    let params = map(json!({"payload": "flow.zip", "sync": true, "suspend": true}));

    task(&fake)
        .execute("start", &params, &mut execution)
        .await
        .unwrap();
    let child = execution.state.jobs[0];
    fake.set_error(child, "disk full");
    fake.set_status(child, ProcessStatus::Failed);

    let err = task(&fake)
        .execute("start", &params, &mut execution)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("Child process {child} FAILED (error: disk full)")
    );
    assert!(execution.state.suspension.is_none());
}

// =========================================================================
// Fork, wait and aggregate
// =========================================================================

#[tokio::test(start_paused = true)]
async fn forks_then_wait_with_ignored_failure() {
    let fake = Arc::new(FakeProcessService::new());
    let task = task(&fake);
    let mut execution = Execution::new(Uuid::new_v4(), ".");

    let output = completed(
        task.execute(
            "fork",
            &map(json!({"entryPoint": "child", "instances": 2})),
            &mut execution,
        )
        .await
        .unwrap(),
    );
    assert_eq!(output.handles.len(), 2);
    let (ok, bad) = (execution.state.jobs[0], execution.state.jobs[1]);
    fake.set_output(ok, &json!({"n": 1}));
    fake.set_output(bad, &json!({"n": 2}));
    fake.set_status(bad, ProcessStatus::Failed);

    let results = task
        .wait_for_completion(&execution.state.jobs, Some(Duration::from_secs(60)))
        .await
        .unwrap();
    assert_eq!(results.len(), 2);

    let aggregator = ResultAggregator::new(Arc::clone(&fake) as Arc<dyn ProcessService>);
    let outputs = aggregator.aggregate(&results, true, true).await.unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[&ok].get("n"), Some(&json!(1)));

    let err = aggregator.aggregate(&results, false, true).await.unwrap_err();
    let OrchestratorError::AggregateFailure { message, .. } = err else {
        panic!("expected AggregateFailure");
    };
    assert_eq!(message.lines().count(), 1);
    assert!(message.contains(&bad.to_string()));
    assert!(message.contains("FAILED"));
}

#[tokio::test(start_paused = true)]
async fn wait_times_out_when_any_member_is_stuck() {
    let fake = Arc::new(FakeProcessService::new());
    let a = fake.add_scripted(ProcessStatus::Finished, Duration::from_secs(1));
    let b = fake.add_process(ProcessStatus::Suspended);

    let err = task(&fake)
        .wait_for_completion(&[a, b], Some(Duration::from_secs(20)))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::WaitTimeout { id, .. } if id == b));
}

// =========================================================================
// Kill
// =========================================================================

#[tokio::test(start_paused = true)]
async fn sync_kill_tolerates_unconfirmed_process() {
    let fake = Arc::new(FakeProcessService::new());
    let a = fake.add_process(ProcessStatus::Running);
    let b = fake.add_process(ProcessStatus::Running);
    fake.kill_delay(a, Some(Duration::from_secs(2)));
    fake.kill_delay(b, None);
    let mut execution = Execution::new(Uuid::new_v4(), ".");
    let started = tokio::time::Instant::now();

    let output = completed(
        task(&fake)
            .execute(
                "kill",
                &map(json!({"instanceId": [a.to_string(), b.to_string()], "sync": true})),
                &mut execution,
            )
            .await
            .unwrap(),
    );

    assert_eq!(fake.killed(), vec![a, b]);
    assert_eq!(output.kills.len(), 2);
    assert_eq!(output.kills[0].status, Some(ProcessStatus::Cancelled));
    assert!(!output.kills[0].wait_timed_out);
    assert!(output.kills[1].wait_timed_out);
    assert!(started.elapsed() <= Duration::from_secs(15));
}

#[tokio::test(start_paused = true)]
async fn single_kill_by_string_id() {
    let fake = Arc::new(FakeProcessService::new());
    let a = fake.add_process(ProcessStatus::Running);
    let mut execution = Execution::new(Uuid::new_v4(), ".");

    let output = completed(
        task(&fake)
            .execute("KILL", &map(json!({"instanceId": a.to_string()})), &mut execution)
            .await
            .unwrap(),
    );
    assert_eq!(output.kills.len(), 1);
    assert_eq!(
        fake.get_status(a).await.unwrap().status,
        ProcessStatus::Cancelled
    );
}
