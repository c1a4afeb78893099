use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// Subdirectory of a job workspace holding scene assets and per-job tools.
pub const SCENE_DIR: &str = "scene";

/// Subdirectory of a job workspace holding per-object model files.
pub const MODELS_DIR: &str = "models";

/// Subdirectory of a job workspace holding the produced scene file.
pub const OUTPUT_DIR: &str = "output";

/// Subdirectory of a job workspace holding the generated configuration.
pub const CONFIG_DIR: &str = "config";

/// File name of the generated configuration artifact.
pub const CONFIG_FILE_NAME: &str = "config.json";

// Scene-graph anchors the engine scripts look up by name.
pub const FRAME_OBJECT_NAME: &str = "ApplyDesignGroup";
pub const SCENE_MATERIAL_NAME: &str = "Scene_Material";
pub const AREA_LIGHT_OBJECT_NAME: &str = "Area Light Source";
pub const POINT_LIGHT_OBJECT_NAME: &str = "Point Light Source";
pub const AMBIENT_LIGHT_OBJECT_NAME: &str = "Ambient Light";
pub const AREA_LIGHT_MATERIAL_NAME: &str = "Plane_Emission_Mat";

/// Prefix for environment overrides, e.g. `RENDER_BUCKET`.
pub const ENV_PREFIX: &str = "RENDER_";

/// Which scripts the mirror and user-mirror passes use when the shared tool
/// bundle could not be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedPassScripts {
    /// Use the scripts bundled next to the fallback scene.
    Local,
    /// Fetch the specific pass script again when the pass runs.
    Refetch,
}

impl std::str::FromStr for DegradedPassScripts {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "refetch" => Ok(Self::Refetch),
            other => Err(anyhow!("unknown degraded pass script policy: {}", other)),
        }
    }
}

/// Remote locations of the shared engine tool bundle.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolUrls {
    pub scene_script: String,
    pub scene_script_360: String,
    pub scene_file: String,
    pub scene_file_360: String,
    pub mirror_script: String,
    pub user_mirror_script: String,
}

impl Default for ToolUrls {
    fn default() -> Self {
        let base = "https://applydesign.blob.core.windows.net/blender-function-tools/Blender35";
        Self {
            scene_script: format!("{}/SceneScript.py", base),
            scene_script_360: format!("{}/SceneScript360.py", base),
            scene_file: format!("{}/Base.blend", base),
            scene_file_360: format!("{}/Base360.blend", base),
            mirror_script: format!("{}/SceneMirrorScript.py", base),
            user_mirror_script: format!("{}/UserMirrorScript.py", base),
        }
    }
}

/// Tool bundle shipped with the engine deployment, used when the remote bundle
/// is unavailable.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackBundle {
    pub scene_file: PathBuf,
    pub scene_script: PathBuf,
    pub mirror_script: PathBuf,
    pub user_mirror_script: PathBuf,
}

impl Default for FallbackBundle {
    fn default() -> Self {
        let dir = Path::new("/local/scripts");
        Self {
            scene_file: dir.join("default.blend"),
            scene_script: dir.join("ApplyDesignSceneScript.py"),
            mirror_script: dir.join("ApplyDesignSceneMirrorScript.py"),
            user_mirror_script: dir.join("ApplyDesignUserMirrorScript.py"),
        }
    }
}

/// Sizing and image of the batch render task.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub endpoint: String,
    pub image_uri: String,
    pub machine_type: String,
    pub cpu_milli: u64,
    pub memory_mib: u64,
    pub max_run_seconds: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://batch.googleapis.com/v1".to_string(),
            image_uri: "docker.io/linuxserver/blender:3.5.0".to_string(),
            machine_type: "n2-standard-96".to_string(),
            cpu_milli: 96_000,
            memory_mib: 384 * 1024,
            max_run_seconds: 3600,
        }
    }
}

/// Process-wide configuration, built once at startup and shared read-only.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// Root under which job workspaces are created.
    pub work_root: PathBuf,
    /// Directory holding one engine log per job.
    pub log_dir: PathBuf,
    /// Path of the rendering engine executable.
    pub engine_executable: PathBuf,
    pub tools: ToolUrls,
    pub fallback: FallbackBundle,
    /// When set, fetched tool bundles are kept here and reused across jobs.
    pub tools_cache_dir: Option<PathBuf>,
    pub degraded_pass_scripts: DegradedPassScripts,
    /// Maximum number of downloads in flight for one fetch group.
    pub max_concurrent_fetches: u32,
    pub project_id: String,
    pub region: String,
    /// Bucket receiving produced scene files and batch outputs.
    pub bucket: String,
    /// Local mount of `bucket`; uploads copy into it instead of using the API.
    pub storage_mount: Option<PathBuf>,
    /// OAuth bearer token for the storage and batch APIs.
    pub access_token: Option<String>,
    pub batch: BatchConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let work_root = std::env::temp_dir().join("render-jobs");
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            log_dir: work_root.join("logs"),
            work_root,
            engine_executable: PathBuf::from("/usr/local/bin/blender"),
            tools: ToolUrls::default(),
            fallback: FallbackBundle::default(),
            tools_cache_dir: None,
            degraded_pass_scripts: DegradedPassScripts::Local,
            max_concurrent_fetches: 16,
            project_id: "applydesign".to_string(),
            region: "us-central1".to_string(),
            bucket: "applydesign-results".to_string(),
            storage_mount: None,
            access_token: None,
            batch: BatchConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from an optional JSON file, then apply `RENDER_*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())?;
        Ok(config)
    }

    /// Apply overrides from a key lookup. Keys are upper-case field names
    /// without the `RENDER_` prefix.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set_string = |target: &mut String, key: &str| {
            if let Some(v) = lookup(key) {
                *target = v;
            }
        };
        set_string(&mut self.bind_addr, "BIND_ADDR");
        set_string(&mut self.project_id, "PROJECT_ID");
        set_string(&mut self.region, "REGION");
        set_string(&mut self.bucket, "BUCKET");
        set_string(&mut self.tools.scene_script, "URL_SCENE_SCRIPT");
        set_string(&mut self.tools.scene_script_360, "URL_360_SCENE_SCRIPT");
        set_string(&mut self.tools.scene_file, "URL_SCENE_FILE");
        set_string(&mut self.tools.scene_file_360, "URL_360_SCENE_FILE");
        set_string(&mut self.tools.mirror_script, "URL_MIRROR_SCRIPT");
        set_string(&mut self.tools.user_mirror_script, "URL_USER_MIRROR_SCRIPT");

        if let Some(v) = lookup("WORK_ROOT") {
            self.work_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ENGINE_EXECUTABLE") {
            self.engine_executable = PathBuf::from(v);
        }
        if let Some(v) = lookup("TOOLS_CACHE_DIR") {
            self.tools_cache_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("STORAGE_MOUNT") {
            self.storage_mount = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("ACCESS_TOKEN") {
            self.access_token = Some(v);
        }
        if let Some(v) = lookup("DEGRADED_PASS_SCRIPTS") {
            self.degraded_pass_scripts = v.parse()?;
        }
        if let Some(v) = lookup("MAX_CONCURRENT_FETCHES") {
            self.max_concurrent_fetches = v
                .parse()
                .map_err(|e| anyhow!("invalid MAX_CONCURRENT_FETCHES {:?}: {}", v, e))?;
        }
        Ok(())
    }
}
