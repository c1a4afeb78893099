use serde::Serialize;

use super::request::JobId;
use crate::engine::pipeline::SubmittedJob;

/// Body returned once a job has been handed to the batch tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderAccepted {
    pub render_job_id: JobId,
    pub blend: String,
    pub batch_job: String,
    pub status: &'static str,
}

impl RenderAccepted {
    pub fn from_submitted(job: &SubmittedJob) -> Self {
        Self {
            render_job_id: job.job_id.clone(),
            blend: job.scene_uri.clone(),
            batch_job: job.batch_job.clone(),
            status: "submitted",
        }
    }
}
