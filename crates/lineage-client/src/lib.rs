//! Remote process service client.
//!
//! Provides the [`ProcessService`] seam the orchestrator talks to, the wire
//! types it exchanges, and a reqwest-based REST implementation.

mod client;
mod service;
pub mod types;


pub use client::{ClientError, RestConfig, RestProcessService};
pub use service::ProcessService;
pub use types::{
    ProcessEntry, ProcessRequest, ProcessStatus, StartProcessResponse, SubmitRequest,
    WaitCondition,
};
