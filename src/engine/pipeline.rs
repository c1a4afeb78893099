// Pipeline orchestrator: drives one render job from request to batch submission.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use super::compiler;
use super::error::{JobError, PipelineError, SoftFailure, Stage};
use super::fetcher::{AssetFetcher, FetchRequest, SceneAssets};
use super::invoker::{EngineLog, Invocation, SceneEngine};
use super::tools::{PassScript, ToolProvisioner, ToolResolution, ToolVariant};
use super::workspace::{WorkspaceManager, WorkspacePaths};
use crate::api::request::{JobId, RenderPreset, RenderRequest};
use crate::config::ServiceConfig;
use crate::source::traits::AssetSource;
use crate::submit::batch::BatchSubmitter;
use crate::submit::notify::{JobNotification, Notifier};
use crate::submit::storage::ObjectStore;

const EXTENSION_SCRIPT_NAME: &str = "ApplyDesignExtensionSceneScript.py";

/// Engine runs a job may perform, in the order they happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Base,
    Mirror,
    Extension,
    UserMirror,
}

/// Result of scene preparation, before hand-off.
#[derive(Debug, Clone)]
pub struct SceneBuild {
    pub scene_file: PathBuf,
    pub config_file: PathBuf,
    pub log_file: PathBuf,
    pub tools_degraded: bool,
    pub passes: Vec<Pass>,
    pub soft_failures: Vec<SoftFailure>,
}

/// A job that reached the batch tier.
#[derive(Debug, Clone)]
pub struct SubmittedJob {
    pub job_id: JobId,
    pub scene_uri: String,
    pub batch_job: String,
    pub build: SceneBuild,
}

/// External systems the orchestrator talks to.
pub struct Collaborators {
    pub source: Arc<dyn AssetSource>,
    pub engine: Arc<dyn SceneEngine>,
    pub store: Arc<dyn ObjectStore>,
    pub batch: Arc<dyn BatchSubmitter>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct Orchestrator {
    config: Arc<ServiceConfig>,
    workspaces: WorkspaceManager,
    fetcher: AssetFetcher,
    tools: ToolProvisioner,
    engine: Arc<dyn SceneEngine>,
    store: Arc<dyn ObjectStore>,
    batch: Arc<dyn BatchSubmitter>,
    notifier: Arc<dyn Notifier>,
}

fn at(job_id: &JobId, stage: Stage) -> impl FnOnce(PipelineError) -> JobError {
    let job_id = job_id.clone();
    move |error| JobError::new(job_id, stage, error)
}

impl Orchestrator {
    pub fn new(config: Arc<ServiceConfig>, collaborators: Collaborators) -> Self {
        Self {
            workspaces: WorkspaceManager::new(&config.work_root),
            fetcher: AssetFetcher::new(collaborators.source, config.max_concurrent_fetches),
            tools: ToolProvisioner::from_config(&config),
            engine: collaborators.engine,
            store: collaborators.store,
            batch: collaborators.batch,
            notifier: collaborators.notifier,
            config,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Per-job engine log location.
    pub fn log_path(&self, job_id: &JobId) -> PathBuf {
        self.config
            .log_dir
            .join(format!("{}.log", job_id.path_component()))
    }

    /// Run a validated request end to end. The job workspace is removed on
    /// every exit path, including failures and cancellation.
    pub async fn run(&self, request: &RenderRequest) -> Result<SubmittedJob, JobError> {
        let job_id = &request.job_id;
        let t0 = Instant::now();
        info!(
            "job {} accepted objects={} mirror_in_scene={} is360={} preset={}",
            job_id,
            request.scene_objects.len(),
            request.mirror_in_scene,
            request.is360,
            request
                .rendering_preset
                .as_ref()
                .map(|p| p.name.as_str())
                .unwrap_or("-")
        );

        let guard = self.workspaces.acquire(job_id).map_err(|e| {
            JobError::new(
                job_id.clone(),
                Stage::Initializing,
                PipelineError::workspace("preparing workspace", e),
            )
        })?;
        let result = self.run_in_workspace(request, &guard.paths()).await;
        guard.release();

        match &result {
            Ok(job) => info!(
                "job {} submitted as {} in {} ms",
                job_id,
                job.batch_job,
                t0.elapsed().as_millis()
            ),
            Err(e) => error!("{}", e),
        }
        result
    }

    async fn run_in_workspace(
        &self,
        request: &RenderRequest,
        paths: &WorkspacePaths,
    ) -> Result<SubmittedJob, JobError> {
        let job_id = &request.job_id;

        let log_path = self.log_path(job_id);
        let log = EngineLog::create(&log_path).await.map_err(|e| {
            at(job_id, Stage::Initializing)(PipelineError::workspace(
                format!("creating engine log {}", log_path.display()),
                e,
            ))
        })?;
        self.engine
            .check_available()
            .await
            .map_err(at(job_id, Stage::Initializing))?;

        let build = self.build_scene(request, paths, &log).await?;

        info!("job {} uploading {}", job_id, build.scene_file.display());
        let key = format!("renders/{id}/{id}.blend", id = job_id.path_component());
        let scene_uri = self
            .store
            .upload(&build.scene_file, &key)
            .await
            .map_err(|e| {
                at(job_id, Stage::Uploading)(PipelineError::Upload {
                    path: build.scene_file.clone(),
                    reason: format!("{:#}", e),
                })
            })?;

        let batch_job = self
            .batch
            .submit(job_id, &scene_uri, request.webhook.as_deref())
            .await
            .map_err(|e| at(job_id, Stage::Submitting)(PipelineError::Submit(format!("{:#}", e))))?;

        if let Some(url) = &request.webhook {
            self.spawn_notification(
                url.clone(),
                JobNotification {
                    render_job_id: job_id.clone(),
                    status: "submitted",
                    blend: scene_uri.clone(),
                    batch_job: batch_job.clone(),
                },
            );
        }

        Ok(SubmittedJob {
            job_id: job_id.clone(),
            scene_uri,
            batch_job,
            build,
        })
    }

    /// Fetch, configure and run every engine pass the request calls for.
    /// Returns once the produced scene file is final.
    pub async fn build_scene(
        &self,
        request: &RenderRequest,
        paths: &WorkspacePaths,
        log: &EngineLog,
    ) -> Result<SceneBuild, JobError> {
        let job_id = &request.job_id;
        let mut soft_failures = Vec::new();
        let mut passes = Vec::new();

        // Fetching: scene assets are mandatory, the tool bundle may degrade.
        let assets = SceneAssets::plan(request, paths);
        info!(
            "job {} fetching {} scene assets",
            job_id,
            assets.requests.len()
        );
        let variant = ToolVariant::for_request(request.is360);
        // Tool provisioning never fails, so a scene asset failure ends the
        // race at once and drops the tool fetches still in flight.
        let ((), tools) = tokio::try_join!(
            self.fetcher.fetch_all(assets.requests.clone()),
            async {
                Ok::<_, PipelineError>(self
                    .tools
                    .provision(&self.fetcher, variant, &paths.scene_dir)
                    .await)
            },
        )
        .map_err(at(job_id, Stage::Fetching))?;
        if let ToolResolution::Degraded { reason, .. } = &tools {
            warn!("job {} running with degraded tools: {}", job_id, reason);
            soft_failures.push(SoftFailure::ToolsDegraded {
                reason: reason.clone(),
            });
        }

        // Configuring
        let config_file =
            compiler::compile(request, &assets, paths).map_err(at(job_id, Stage::Configuring))?;

        // Base render
        let scene_file = paths.scene_output(job_id);
        let bundle = tools.bundle();
        info!("job {} base render", job_id);
        self.engine
            .invoke(
                &Invocation::base(&bundle.scene_file, &bundle.scene_script, &config_file),
                log,
            )
            .await
            .map_err(at(job_id, Stage::BaseRender))?;
        if !scene_file.is_file() {
            return Err(at(job_id, Stage::BaseRender)(PipelineError::MissingOutput {
                expected: scene_file,
                workspace: paths.root.clone(),
                config: config_file,
            }));
        }
        passes.push(Pass::Base);

        if request.mirror_in_scene {
            self.run_bundle_pass(PassScript::Mirror, &tools, &scene_file, paths, log)
                .await
                .map_err(at(job_id, Stage::MirrorPass))?;
            passes.push(Pass::Mirror);
        }

        if let Some(preset) = request.extension_preset() {
            match self.fetch_extension(preset, &paths.scene_dir).await {
                Ok(script) => {
                    info!("job {} extension pass preset={}", job_id, preset.name);
                    self.engine
                        .invoke(&Invocation::pass(&scene_file, &script), log)
                        .await
                        .map_err(at(job_id, Stage::ExtensionPass))?;
                    passes.push(Pass::Extension);
                }
                Err(reason) => {
                    warn!(
                        "job {} skipping extension pass preset={}: {}",
                        job_id, preset.name, reason
                    );
                    soft_failures.push(SoftFailure::ExtensionFetch { reason });
                }
            }
        }

        if request.wants_user_mirror_pass() {
            self.run_bundle_pass(PassScript::UserMirror, &tools, &scene_file, paths, log)
                .await
                .map_err(at(job_id, Stage::UserMirrorPass))?;
            passes.push(Pass::UserMirror);
        }

        info!("job {} produced {} passes={:?}", job_id, scene_file.display(), passes);
        Ok(SceneBuild {
            scene_file,
            config_file,
            log_file: log.path().to_path_buf(),
            tools_degraded: tools.is_degraded(),
            passes,
            soft_failures,
        })
    }

    async fn run_bundle_pass(
        &self,
        pass: PassScript,
        tools: &ToolResolution,
        scene_file: &Path,
        paths: &WorkspacePaths,
        log: &EngineLog,
    ) -> Result<(), PipelineError> {
        let script = self
            .tools
            .pass_script(&self.fetcher, tools, pass, &paths.scene_dir)
            .await?;
        info!("{:?} pass script={}", pass, script.display());
        self.engine
            .invoke(&Invocation::pass(scene_file, &script), log)
            .await
    }

    /// Fetch the preset's extension script. Any failure means "no extension".
    async fn fetch_extension(&self, preset: &RenderPreset, dir: &Path) -> Result<PathBuf, String> {
        let url = preset
            .script_download_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| "preset has no script download url".to_string())?;
        let dest = dir.join(EXTENSION_SCRIPT_NAME);
        self.fetcher
            .fetch_one(&FetchRequest::text(url, &dest))
            .await
            .map_err(|e| e.to_string())?;
        Ok(dest)
    }

    /// Deliver a notification on a detached task. Its outcome never reaches
    /// the job.
    fn spawn_notification(&self, url: String, notification: JobNotification) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&url, &notification).await {
                warn!(
                    "webhook notification failed job={} url={}: {:#}",
                    notification.render_job_id, url, e
                );
            }
        });
    }
}
