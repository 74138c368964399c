//! Lineage Orchestrator
//!
//! Client-side lifecycle management of child processes on a remote process
//! service:
//! - [`JobConfigBuilder`]: layered, validated job configuration
//! - [`ProcessLauncher`]: start, start-child and fork submissions
//! - [`CompletionWaiter`]: concurrent polling with an optional deadline
//! - [`SuspendBridge`]: durable suspension instead of a blocking wait
//! - [`KillCoordinator`]: cancellation with a bounded confirmation wait
//! - [`ResultAggregator`]: failure classification and output variables
//! - [`ChildProcessTask`]: the single entry point hosts invoke

pub mod aggregate;
pub mod bridge;
pub mod connector;
pub mod error;
pub mod job;
pub mod kill;
pub mod launcher;
pub mod payload;
pub mod request;
pub mod retry;
pub mod state;
pub mod task;
pub mod waiter;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use aggregate::ResultAggregator;
pub use bridge::{BridgeState, SuspendBridge};
pub use connector::{Connector, FixedConnector, RestConnector};
pub use error::{OrchestratorError, Result};
pub use job::{JobConfig, JobConfigBuilder, Purpose};
pub use kill::{KillCoordinator, KillOutcome};
pub use launcher::{ProcessHandle, ProcessLauncher};
pub use payload::{PayloadPackager, ZipPackager};
pub use retry::RetryPolicy;
pub use state::{Execution, ExecutionState, SuspensionRecord};
pub use task::{Action, ChildProcessTask, TaskOutcome, TaskOutput};
pub use waiter::{AggregateResult, ChildResult, CompletionWaiter, PollPolicy, WaitSet};
