//! Translation of a [`JobConfig`] into process service wire requests.

use lineage_client::{ProcessRequest, SubmitRequest};

use crate::job::JobConfig;

/// Build the start/fork request body.
pub fn to_process_request(cfg: &JobConfig) -> ProcessRequest {
    ProcessRequest {
        entry_point: cfg.entry_point.clone(),
        active_profiles: cfg.active_profiles.clone(),
        tags: cfg.tags.clone(),
        arguments: cfg.arguments.clone(),
        exclusive_exec: cfg.exclusive_exec,
        disable_on_cancel: cfg.disable_on_cancel,
        disable_on_failure: cfg.disable_on_failure,
        out_expressions: cfg.out_vars.clone().unwrap_or_default(),
    }
}

/// Build the multipart submit request for a new process. The parent comes
/// from [`JobConfig::parent_instance_id`].
///
/// `fallback_org` is used when the configuration names no organization
/// (typically the organization of the calling execution).
pub fn to_submit_request(
    cfg: &JobConfig,
    archive: Option<Vec<u8>>,
    fallback_org: Option<&str>,
) -> SubmitRequest {
    let target = &cfg.target;
    SubmitRequest {
        request: to_process_request(cfg),
        archive,
        org: target
            .org
            .clone()
            .or_else(|| fallback_org.map(String::from)),
        project: target.project.clone(),
        repo: target.repo.clone(),
        repo_branch_or_tag: target.repo_branch_or_tag.clone(),
        repo_commit_id: target.repo_commit_id.clone(),
        start_at: cfg.start_at.clone(),
        parent_instance_id: cfg.parent_instance_id,
    }
}
