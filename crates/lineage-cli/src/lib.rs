//! Lineage CLI
//!
//! A reference host for child process tasks: runs task actions on behalf of
//! an execution whose state lives in a JSON file, parks it on suspension and
//! resumes it later.

pub mod commands;
pub mod host;
