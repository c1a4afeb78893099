//! Error types for the scene-preparation pipeline.
//!
//! Hard failures are [`PipelineError`] values and abort the job. Soft
//! failures ([`SoftFailure`]) are recorded on the build report and the job
//! carries on. Cleanup failures are only logged.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::api::request::JobId;

/// A failure that aborts the remaining pipeline steps.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network or storage failure while retrieving an asset.
    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// Local filesystem failure while writing the configuration artifact.
    #[error("failed to write configuration {path}: {source}")]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configured engine executable does not exist.
    #[error("rendering engine not found at {0}")]
    EngineMissing(PathBuf),

    /// An engine invocation exited unsuccessfully.
    #[error("engine exited with {} running {script} (log: {log}){}", exit_label(.code), tail_label(.output_tail))]
    EngineExit {
        script: PathBuf,
        code: Option<i32>,
        log: PathBuf,
        output_tail: Vec<String>,
    },

    /// The base invocation exited 0 without writing the scene file.
    #[error("engine reported success but produced no scene file at {expected} (workspace {workspace}, config {config})")]
    MissingOutput {
        expected: PathBuf,
        workspace: PathBuf,
        config: PathBuf,
    },

    /// Filesystem failure on the workspace or the job log.
    #[error("{context}: {source}")]
    Workspace {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("upload of {path} failed: {reason}")]
    Upload { path: PathBuf, reason: String },

    #[error("batch submission failed: {0}")]
    Submit(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {}", c),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

fn tail_label(tail: &[String]) -> String {
    match tail.last() {
        Some(line) => format!("; last output: {}", line),
        None => String::new(),
    }
}

impl PipelineError {
    pub(crate) fn workspace(context: impl Into<String>, source: io::Error) -> Self {
        PipelineError::Workspace {
            context: context.into(),
            source,
        }
    }
}

/// A non-fatal problem the pipeline worked around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoftFailure {
    /// The shared tool bundle could not be fetched; the bundled fallback was used.
    ToolsDegraded { reason: String },
    /// The extension script was unavailable; the extension pass was skipped.
    ExtensionFetch { reason: String },
}

/// Pipeline position, used to report where a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Initializing,
    Fetching,
    Configuring,
    BaseRender,
    MirrorPass,
    ExtensionPass,
    UserMirrorPass,
    Uploading,
    Submitting,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Initializing => "initializing",
            Stage::Fetching => "fetching",
            Stage::Configuring => "configuring",
            Stage::BaseRender => "base render",
            Stage::MirrorPass => "mirror pass",
            Stage::ExtensionPass => "extension pass",
            Stage::UserMirrorPass => "user-mirror pass",
            Stage::Uploading => "uploading",
            Stage::Submitting => "submitting",
        };
        f.write_str(name)
    }
}

/// A hard failure with the job and stage it happened in.
#[derive(Debug, Error)]
#[error("job {job_id} failed at {stage}: {error}")]
pub struct JobError {
    pub job_id: JobId,
    pub stage: Stage,
    #[source]
    pub error: PipelineError,
}

impl JobError {
    pub fn new(job_id: JobId, stage: Stage, error: PipelineError) -> Self {
        Self {
            job_id,
            stage,
            error,
        }
    }
}
