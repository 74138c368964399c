//! The remote process service seam.

use async_trait::async_trait;
use uuid::Uuid;

use crate::client::ClientError;
use crate::types::{
    ProcessEntry, ProcessRequest, StartProcessResponse, SubmitRequest, WaitCondition,
};

/// Operations the orchestrator consumes from the remote process service.
///
/// The service owns the canonical process state; every call here is a
/// single remote round-trip with no retry. Callers decide what to retry.
#[async_trait]
pub trait ProcessService: Send + Sync {
    /// Start a new process.
    async fn submit(&self, request: SubmitRequest) -> Result<StartProcessResponse, ClientError>;

    /// Start a process that continues from `parent`'s current state.
    async fn fork(
        &self,
        parent: Uuid,
        request: &ProcessRequest,
        sync: bool,
    ) -> Result<StartProcessResponse, ClientError>;

    async fn get_status(&self, id: Uuid) -> Result<ProcessEntry, ClientError>;

    /// List the children of `id`, optionally filtered by tags.
    async fn list_children(
        &self,
        id: Uuid,
        tags: &[String],
    ) -> Result<Vec<ProcessEntry>, ClientError>;

    async fn kill(&self, id: Uuid) -> Result<(), ClientError>;

    async fn set_wait_condition(
        &self,
        id: Uuid,
        condition: &WaitCondition,
    ) -> Result<(), ClientError>;

    /// Download an attachment of `id`. Returns `None` when the process has
    /// no attachment with that name.
    async fn download_output_artifact(
        &self,
        id: Uuid,
        name: &str,
    ) -> Result<Option<Vec<u8>>, ClientError>;
}
