//! CLI subcommands.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use lineage_orchestrator::aggregate::failure_line;
use lineage_orchestrator::{BridgeState, ChildProcessTask, Execution, TaskOutcome, TaskOutput};
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use crate::host::{self, HostRecord};

/// Task parameter sources.
#[derive(Debug, Clone, Default, Args)]
pub struct ParamArgs {
    /// JSON file holding the task parameters
    #[arg(long)]
    pub params: Option<PathBuf>,

    /// A single parameter as key=value (value parsed as JSON when possible)
    #[arg(short = 'p', long = "param")]
    pub param: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a task action (start, start-external, fork, kill)
    Run {
        action: String,
        #[command(flatten)]
        params: ParamArgs,
    },
    /// Resume a parked execution after its resume event fired
    Resume {
        /// Action that parked the execution
        #[arg(long, default_value = "start")]
        action: String,
        #[command(flatten)]
        params: ParamArgs,
    },
    /// Wait for processes to finish
    Wait {
        ids: Vec<Uuid>,
        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// List the child processes of a process
    List {
        parent: Uuid,
        /// Only children carrying all of these tags (comma-separated)
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },
}

/// Everything a command needs besides its arguments.
pub struct Host {
    pub task: ChildProcessTask,
    pub state_path: PathBuf,
    pub instance_id: Option<Uuid>,
    pub work_dir: PathBuf,
    pub org: Option<String>,
}

/// Execute a subcommand, writing results to `out`.
pub async fn run(host: &Host, command: Command, out: &mut impl Write) -> Result<()> {
    match command {
        Command::Run { action, params } => run_action(host, &action, &params, false, out).await,
        Command::Resume { action, params } => run_action(host, &action, &params, true, out).await,
        Command::Wait { ids, timeout_ms } => {
            if ids.is_empty() {
                bail!("nothing to wait for");
            }
            let results = host
                .task
                .wait_for_completion(&ids, timeout_ms.map(Duration::from_millis))
                .await?;
            writeln!(out, "{:<36}  {:<10}  ERROR", "ID", "STATUS")?;
            for (id, child) in results.iter() {
                writeln!(out, "{:<36}  {:<10}  {}", id, child.status(), child.error)?;
            }
            Ok(())
        }
        Command::List { parent, tags } => {
            let children = host.task.list_subprocesses(parent, &tags).await?;
            if children.is_empty() {
                writeln!(out, "No child processes found.")?;
                return Ok(());
            }
            writeln!(out, "{:<36}  {:<10}  TAGS", "ID", "STATUS")?;
            for child in &children {
                writeln!(
                    out,
                    "{:<36}  {:<10}  {}",
                    child.instance_id,
                    child.status,
                    child.tags.as_deref().unwrap_or_default().join(",")
                )?;
            }
            writeln!(out, "\n{} child process(es)", children.len())?;
            Ok(())
        }
    }
}

async fn run_action(
    host: &Host,
    action: &str,
    params: &ParamArgs,
    resuming: bool,
    out: &mut impl Write,
) -> Result<()> {
    let mut record = host::load_record(&host.state_path)?;
    if resuming && BridgeState::of(&record.state) == BridgeState::Active {
        bail!(
            "execution in {} is not parked, nothing to resume",
            host.state_path.display()
        );
    }

    let instance_id = host
        .instance_id
        .or(record.instance_id)
        .context("no execution identifier: pass --instance-id or set LINEAGE_INSTANCE_ID")?;
    let params = host::load_params(params.params.as_deref(), &params.param)?;

    let mut execution = Execution::new(instance_id, host.work_dir.clone());
    execution.org = host.org.clone().or_else(|| record.org.clone());
    execution.state = std::mem::take(&mut record.state);

    let result = host.task.execute(action, &params, &mut execution).await;

    // Whatever happened, the execution's variables reflect what was done.
    record.instance_id = Some(instance_id);
    record.org = execution.org.clone();
    record.state = execution.state;
    record.parked_on = match &result {
        Ok(TaskOutcome::Suspended { resume_event }) => Some(resume_event.clone()),
        _ => None,
    };
    host::save_record(&host.state_path, &record)?;

    let report = match result? {
        TaskOutcome::Suspended { resume_event } => {
            info!(instance_id = %instance_id, resume_event = %resume_event, "Execution parked");
            json!({"status": "SUSPENDED", "resumeEvent": resume_event})
        }
        TaskOutcome::Completed(output) => completed_report(&output, &record),
    };
    writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
    Ok(())
}

fn completed_report(output: &TaskOutput, record: &HostRecord) -> Value {
    let results: Vec<Value> = output
        .results
        .iter()
        .flat_map(|r| r.iter())
        .map(|(id, child)| {
            json!({
                "instanceId": id,
                "status": child.status(),
                "error": (!child.error.is_empty()).then(|| child.error.clone()),
            })
        })
        .collect();
    let ignored: Vec<String> = output
        .results
        .iter()
        .flat_map(|r| r.failures())
        .map(failure_line)
        .collect();
    let kills: Vec<Value> = output
        .kills
        .iter()
        .map(|k| {
            json!({
                "instanceId": k.id,
                "status": k.status,
                "waitTimedOut": k.wait_timed_out,
                "waitError": k.wait_error,
            })
        })
        .collect();

    json!({
        "status": "COMPLETED",
        "jobs": record.state.jobs,
        "jobOut": record.state.job_out,
        "results": results,
        "ignoredFailures": ignored,
        "kills": kills,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use lineage_client::{ProcessService, ProcessStatus};
    use lineage_core::Settings;
    use lineage_orchestrator::FixedConnector;
    use lineage_orchestrator::testing::FakeProcessService;

    fn test_host(fake: &Arc<FakeProcessService>, dir: &tempfile::TempDir) -> Host {
        let connector = FixedConnector::new(Arc::clone(fake) as Arc<dyn ProcessService>);
        Host {
            task: ChildProcessTask::new(Arc::new(connector), &Settings::default()),
            state_path: dir.path().join("state.json"),
            instance_id: Some(Uuid::new_v4()),
            work_dir: dir.path().to_path_buf(),
            org: None,
        }
    }

    fn params(pairs: &[&str]) -> ParamArgs {
        ParamArgs {
            params: None,
            param: pairs.iter().map(ToString::to_string).collect(),
        }
    }

    async fn output_of(host: &Host, command: Command) -> Result<Value> {
        let mut out = Vec::new();
        run(host, command, &mut out).await?;
        Ok(serde_json::from_slice(&out)?)
    }

    #[tokio::test(start_paused = true)]
    async fn run_start_sync_reports_and_persists() {
        let fake = Arc::new(FakeProcessService::new());
        let dir = tempfile::tempdir().unwrap();
        let host = test_host(&fake, &dir);

        let report = output_of(
            &host,
            Command::Run {
                action: "start".into(),
                params: params(&["project=flows", "sync=true"]),
            },
        )
        .await
        .unwrap();

        assert_eq!(report["status"], json!("COMPLETED"));
        let child = fake.launched()[0];
        assert_eq!(report["jobs"], json!([child]));
        assert_eq!(report["results"][0]["status"], json!("FINISHED"));

        let record = host::load_record(&host.state_path).unwrap();
        assert_eq!(record.state.jobs, vec![child]);
        assert_eq!(record.instance_id, host.instance_id);
        assert!(record.parked_on.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn suspend_then_resume_across_invocations() {
        let fake = Arc::new(FakeProcessService::new());
        fake.on_launch(ProcessStatus::Finished, Duration::from_secs(60));
        let dir = tempfile::tempdir().unwrap();
        let host = test_host(&fake, &dir);
        let args = ["project=flows", "sync=true", "suspend=true"];

        let report = output_of(
            &host,
            Command::Run {
                action: "start".into(),
                params: params(&args),
            },
        )
        .await
        .unwrap();
        assert_eq!(report["status"], json!("SUSPENDED"));
        let record = host::load_record(&host.state_path).unwrap();
        assert_eq!(record.parked_on.as_deref(), Some("lineageTask"));

        tokio::time::advance(Duration::from_secs(61)).await;

        let report = output_of(
            &host,
            Command::Resume {
                action: "start".into(),
                params: params(&args),
            },
        )
        .await
        .unwrap();
        assert_eq!(report["status"], json!("COMPLETED"));
        assert_eq!(fake.launched().len(), 1);

        let record = host::load_record(&host.state_path).unwrap();
        assert!(record.parked_on.is_none());
        assert!(record.state.suspension.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_without_parked_execution_fails() {
        let fake = Arc::new(FakeProcessService::new());
        let dir = tempfile::tempdir().unwrap();
        let host = test_host(&fake, &dir);

        let err = output_of(
            &host,
            Command::Resume {
                action: "start".into(),
                params: params(&["project=flows"]),
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("not parked"));
        assert!(fake.submitted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_action_still_persists_state() {
        let fake = Arc::new(FakeProcessService::new());
        fake.on_launch(ProcessStatus::Failed, Duration::ZERO);
        let dir = tempfile::tempdir().unwrap();
        let host = test_host(&fake, &dir);

        let err = output_of(
            &host,
            Command::Run {
                action: "start".into(),
                params: params(&["project=flows", "sync=true"]),
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("FAILED"));

        let record = host::load_record(&host.state_path).unwrap();
        assert_eq!(record.state.jobs, fake.launched());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_instance_id_is_reported() {
        let fake = Arc::new(FakeProcessService::new());
        let dir = tempfile::tempdir().unwrap();
        let mut host = test_host(&fake, &dir);
        host.instance_id = None;

        let err = output_of(
            &host,
            Command::Run {
                action: "start".into(),
                params: params(&["project=flows"]),
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("--instance-id"));
    }

    #[tokio::test(start_paused = true)]
    async fn list_prints_one_row_per_child() {
        let fake = Arc::new(FakeProcessService::new());
        let dir = tempfile::tempdir().unwrap();
        let host = test_host(&fake, &dir);
        let parent = Uuid::new_v4();
        let a = fake.add_process(ProcessStatus::Running);
        fake.set_parent(a, parent, &["nightly"]);

        let mut out = Vec::new();
        run(&host, Command::List { parent, tags: vec![] }, &mut out)
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(&a.to_string()));
        assert!(text.contains("RUNNING"));
        assert!(text.contains("nightly"));
        assert!(text.contains("1 child process(es)"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_prints_statuses() {
        let fake = Arc::new(FakeProcessService::new());
        let dir = tempfile::tempdir().unwrap();
        let host = test_host(&fake, &dir);
        let a = fake.add_process(ProcessStatus::Failed);
        fake.set_error(a, "boom");

        let mut out = Vec::new();
        run(
            &host,
            Command::Wait {
                ids: vec![a],
                timeout_ms: Some(1000),
            },
            &mut out,
        )
        .await
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("FAILED"));
        assert!(text.contains("boom"));
    }
}
