// Shared engine tool bundle: base/mirror scripts and the default scene template.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::PipelineError;
use super::fetcher::{AssetFetcher, FetchRequest};
use crate::config::{DegradedPassScripts, FallbackBundle, ServiceConfig, ToolUrls};

const SCENE_SCRIPT_NAME: &str = "ApplyDesignSceneScript.py";
const MIRROR_SCRIPT_NAME: &str = "ApplyDesignSceneMirrorScript.py";
const USER_MIRROR_SCRIPT_NAME: &str = "ApplyDesignUserMirrorScript.py";
const DEFAULT_SCENE_NAME: &str = "Default.blend";

/// Which base scene/script pair a job needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolVariant {
    Standard,
    Panorama,
}

impl ToolVariant {
    pub fn for_request(is360: bool) -> Self {
        if is360 {
            ToolVariant::Panorama
        } else {
            ToolVariant::Standard
        }
    }

    fn dir_name(self) -> &'static str {
        match self {
            ToolVariant::Standard => "standard",
            ToolVariant::Panorama => "360",
        }
    }
}

/// Post-processing passes that run a script from the shared bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassScript {
    Mirror,
    UserMirror,
}

impl PassScript {
    fn file_name(self) -> &'static str {
        match self {
            PassScript::Mirror => MIRROR_SCRIPT_NAME,
            PassScript::UserMirror => USER_MIRROR_SCRIPT_NAME,
        }
    }
}

/// Local paths of the four shared tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolBundle {
    pub scene_file: PathBuf,
    pub scene_script: PathBuf,
    pub mirror_script: PathBuf,
    pub user_mirror_script: PathBuf,
}

impl ToolBundle {
    fn in_dir(dir: &Path) -> Self {
        Self {
            scene_file: dir.join(DEFAULT_SCENE_NAME),
            scene_script: dir.join(SCENE_SCRIPT_NAME),
            mirror_script: dir.join(MIRROR_SCRIPT_NAME),
            user_mirror_script: dir.join(USER_MIRROR_SCRIPT_NAME),
        }
    }

    pub fn pass_script(&self, pass: PassScript) -> &Path {
        match pass {
            PassScript::Mirror => &self.mirror_script,
            PassScript::UserMirror => &self.user_mirror_script,
        }
    }

    fn is_complete(&self) -> bool {
        [
            &self.scene_file,
            &self.scene_script,
            &self.mirror_script,
            &self.user_mirror_script,
        ]
        .iter()
        .all(|p| p.is_file())
    }
}

impl From<&FallbackBundle> for ToolBundle {
    fn from(fallback: &FallbackBundle) -> Self {
        Self {
            scene_file: fallback.scene_file.clone(),
            scene_script: fallback.scene_script.clone(),
            mirror_script: fallback.mirror_script.clone(),
            user_mirror_script: fallback.user_mirror_script.clone(),
        }
    }
}

/// Outcome of provisioning the tool bundle for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolResolution {
    Fetched(ToolBundle),
    /// The remote bundle was unavailable; the deployment's bundled copy is used.
    Degraded { bundle: ToolBundle, reason: String },
}

impl ToolResolution {
    pub fn bundle(&self) -> &ToolBundle {
        match self {
            ToolResolution::Fetched(bundle) => bundle,
            ToolResolution::Degraded { bundle, .. } => bundle,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, ToolResolution::Degraded { .. })
    }
}

pub struct ToolProvisioner {
    urls: ToolUrls,
    fallback: FallbackBundle,
    cache_dir: Option<PathBuf>,
    degraded_pass_scripts: DegradedPassScripts,
    standard_lock: Mutex<()>,
    panorama_lock: Mutex<()>,
}

impl ToolProvisioner {
    pub fn new(
        urls: ToolUrls,
        fallback: FallbackBundle,
        cache_dir: Option<PathBuf>,
        degraded_pass_scripts: DegradedPassScripts,
    ) -> Self {
        Self {
            urls,
            fallback,
            cache_dir,
            degraded_pass_scripts,
            standard_lock: Mutex::new(()),
            panorama_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(
            config.tools.clone(),
            config.fallback.clone(),
            config.tools_cache_dir.clone(),
            config.degraded_pass_scripts,
        )
    }

    pub fn fallback_bundle(&self) -> ToolBundle {
        ToolBundle::from(&self.fallback)
    }

    fn requests(&self, variant: ToolVariant, bundle: &ToolBundle) -> Vec<FetchRequest> {
        let (script_url, scene_url) = match variant {
            ToolVariant::Standard => (&self.urls.scene_script, &self.urls.scene_file),
            ToolVariant::Panorama => (&self.urls.scene_script_360, &self.urls.scene_file_360),
        };
        vec![
            FetchRequest::text(script_url, &bundle.scene_script),
            FetchRequest::text(&self.urls.mirror_script, &bundle.mirror_script),
            FetchRequest::text(&self.urls.user_mirror_script, &bundle.user_mirror_script),
            FetchRequest::binary(scene_url, &bundle.scene_file),
        ]
    }

    /// Make the tool bundle for `variant` available locally.
    ///
    /// With a deployment cache the bundle is fetched once and reused by later
    /// jobs; otherwise it is fetched into `job_dir`. A failed fetch never fails
    /// the job: it resolves to the bundled fallback instead.
    pub async fn provision(
        &self,
        fetcher: &AssetFetcher,
        variant: ToolVariant,
        job_dir: &Path,
    ) -> ToolResolution {
        let result = match &self.cache_dir {
            Some(cache_dir) => {
                let lock = match variant {
                    ToolVariant::Standard => &self.standard_lock,
                    ToolVariant::Panorama => &self.panorama_lock,
                };
                let _guard = lock.lock().await;
                let bundle = ToolBundle::in_dir(&cache_dir.join(variant.dir_name()));
                if bundle.is_complete() {
                    debug!("tool bundle cache hit variant={}", variant.dir_name());
                    Ok(bundle)
                } else {
                    info!("populating tool bundle cache variant={}", variant.dir_name());
                    fetcher
                        .fetch_all(self.requests(variant, &bundle))
                        .await
                        .map(|()| bundle)
                }
            }
            None => {
                let bundle = ToolBundle::in_dir(job_dir);
                fetcher
                    .fetch_all(self.requests(variant, &bundle))
                    .await
                    .map(|()| bundle)
            }
        };

        match result {
            Ok(bundle) => ToolResolution::Fetched(bundle),
            Err(e) => {
                warn!("tool bundle fetch failed, using bundled fallback: {}", e);
                ToolResolution::Degraded {
                    bundle: self.fallback_bundle(),
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Script for a post-processing pass.
    ///
    /// A fetched bundle always supplies its own script. A degraded bundle
    /// either uses the deployment's local copy or fetches this one script
    /// into `job_dir`, depending on configuration; a failed refetch is fatal.
    pub async fn pass_script(
        &self,
        fetcher: &AssetFetcher,
        resolution: &ToolResolution,
        pass: PassScript,
        job_dir: &Path,
    ) -> Result<PathBuf, PipelineError> {
        let bundle = match resolution {
            ToolResolution::Fetched(bundle) => return Ok(bundle.pass_script(pass).to_path_buf()),
            ToolResolution::Degraded { bundle, .. } => bundle,
        };
        match self.degraded_pass_scripts {
            DegradedPassScripts::Local => Ok(bundle.pass_script(pass).to_path_buf()),
            DegradedPassScripts::Refetch => {
                let url = match pass {
                    PassScript::Mirror => &self.urls.mirror_script,
                    PassScript::UserMirror => &self.urls.user_mirror_script,
                };
                let dest = job_dir.join(pass.file_name());
                fetcher.fetch_one(&FetchRequest::text(url, &dest)).await?;
                Ok(dest)
            }
        }
    }
}
