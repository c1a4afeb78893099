// Shared fakes for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use render_job_engine::api::request::{JobId, RenderRequest};
use render_job_engine::config::{FallbackBundle, ServiceConfig, ToolUrls};
use render_job_engine::engine::error::PipelineError;
use render_job_engine::engine::invoker::{EngineLog, Invocation, SceneEngine};
use render_job_engine::engine::pipeline::{Collaborators, Orchestrator};
use render_job_engine::source::traits::AssetSource;
use render_job_engine::submit::batch::BatchSubmitter;
use render_job_engine::submit::notify::{JobNotification, Notifier};
use render_job_engine::submit::storage::ObjectStore;

pub const TOOLS_HOST: &str = "http://tools.test";
pub const ASSETS_HOST: &str = "http://assets.test";

/// Serves assets from memory; unknown URLs fail like an HTTP 404.
#[derive(Default)]
pub struct MemorySource {
    assets: Mutex<HashMap<String, Bytes>>,
    delays: Mutex<HashMap<String, Duration>>,
    requested: Mutex<Vec<String>>,
}

impl MemorySource {
    pub fn insert(&self, url: &str, body: &[u8]) {
        self.assets
            .lock()
            .insert(url.to_string(), Bytes::copy_from_slice(body));
    }

    pub fn remove(&self, url: &str) {
        self.assets.lock().remove(url);
    }

    /// Hold responses for `url` back by `delay`.
    pub fn delay(&self, url: &str, delay: Duration) {
        self.delays.lock().insert(url.to_string(), delay);
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requested.lock().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl AssetSource for MemorySource {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        self.requested.lock().push(url.to_string());
        let delay = self.delays.lock().get(url).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.assets
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("HTTP 404"))
    }
}

/// Records invocations. The base run writes the scene file named in the
/// configuration artifact, the way the real base script does.
#[derive(Default)]
pub struct RecordingEngine {
    invocations: Mutex<Vec<Invocation>>,
    skip_output: Mutex<bool>,
    failing_script: Mutex<Option<String>>,
}

impl RecordingEngine {
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }

    /// Base runs exit 0 without writing the scene file.
    pub fn skip_output(&self) {
        *self.skip_output.lock() = true;
    }

    /// Runs whose script file name contains `needle` exit with code 1.
    pub fn fail_script(&self, needle: &str) {
        *self.failing_script.lock() = Some(needle.to_string());
    }

    pub fn script_names(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(|i| {
                i.script
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect()
    }
}

#[async_trait]
impl SceneEngine for RecordingEngine {
    async fn check_available(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn invoke(&self, invocation: &Invocation, log: &EngineLog) -> Result<(), PipelineError> {
        self.invocations.lock().push(invocation.clone());
        log.append(&format!("running {}", invocation.script.display()))
            .await
            .unwrap();

        let failing = self.failing_script.lock().clone();
        if let Some(needle) = failing {
            if invocation.script.to_string_lossy().contains(&needle) {
                log.append("Error: script failed").await.unwrap();
                return Err(PipelineError::EngineExit {
                    script: invocation.script.clone(),
                    code: Some(1),
                    log: log.path().to_path_buf(),
                    output_tail: log.tail(5),
                });
            }
        }

        if let Some(config) = &invocation.config {
            let skip = *self.skip_output.lock();
            if !skip {
                let raw = std::fs::read_to_string(config).unwrap();
                let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
                let out = doc["SceneSaveLocation"].as_str().unwrap();
                std::fs::write(out, b"blend").unwrap();
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingStore {
    uploads: Mutex<Vec<(String, Vec<u8>)>>,
    fail: Mutex<bool>,
}

impl RecordingStore {
    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.uploads.lock().clone()
    }

    pub fn fail(&self) {
        *self.fail.lock() = true;
    }
}

#[async_trait]
impl ObjectStore for RecordingStore {
    async fn upload(&self, local: &Path, key: &str) -> Result<String> {
        if *self.fail.lock() {
            return Err(anyhow!("bucket unavailable"));
        }
        let body = std::fs::read(local)?;
        self.uploads.lock().push((key.to_string(), body));
        Ok(format!("gs://test-bucket/{}", key))
    }
}

#[derive(Default)]
pub struct RecordingBatch {
    submissions: Mutex<Vec<(JobId, String, Option<String>)>>,
}

impl RecordingBatch {
    pub fn submissions(&self) -> Vec<(JobId, String, Option<String>)> {
        self.submissions.lock().clone()
    }
}

#[async_trait]
impl BatchSubmitter for RecordingBatch {
    async fn submit(
        &self,
        job_id: &JobId,
        scene_uri: &str,
        webhook: Option<&str>,
    ) -> Result<String> {
        self.submissions.lock().push((
            job_id.clone(),
            scene_uri.to_string(),
            webhook.map(str::to_string),
        ));
        Ok(format!("batch/render-{}", job_id))
    }
}

pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<(String, JobNotification)>,
    fail: bool,
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, url: &str, notification: &JobNotification) -> Result<()> {
        let _ = self.tx.send((url.to_string(), notification.clone()));
        if self.fail {
            Err(anyhow!("webhook unreachable"))
        } else {
            Ok(())
        }
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub config: Arc<ServiceConfig>,
    pub source: Arc<MemorySource>,
    pub engine: Arc<RecordingEngine>,
    pub store: Arc<RecordingStore>,
    pub batch: Arc<RecordingBatch>,
    pub notifications: mpsc::UnboundedReceiver<(String, JobNotification)>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn tool_urls() -> ToolUrls {
    ToolUrls {
        scene_script: format!("{}/SceneScript.py", TOOLS_HOST),
        scene_script_360: format!("{}/SceneScript360.py", TOOLS_HOST),
        scene_file: format!("{}/Base.blend", TOOLS_HOST),
        scene_file_360: format!("{}/Base360.blend", TOOLS_HOST),
        mirror_script: format!("{}/SceneMirrorScript.py", TOOLS_HOST),
        user_mirror_script: format!("{}/UserMirrorScript.py", TOOLS_HOST),
    }
}

pub fn fallback_bundle(root: &Path) -> FallbackBundle {
    let dir = root.join("fallback");
    FallbackBundle {
        scene_file: dir.join("default.blend"),
        scene_script: dir.join("ApplyDesignSceneScript.py"),
        mirror_script: dir.join("ApplyDesignSceneMirrorScript.py"),
        user_mirror_script: dir.join("ApplyDesignUserMirrorScript.py"),
    }
}

pub fn harness() -> Harness {
    harness_with(|_| {}, false)
}

pub fn harness_with(customize: impl FnOnce(&mut ServiceConfig), failing_notifier: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ServiceConfig {
        work_root: dir.path().join("work"),
        log_dir: dir.path().join("logs"),
        tools: tool_urls(),
        fallback: fallback_bundle(dir.path()),
        ..ServiceConfig::default()
    };
    customize(&mut config);
    let config = Arc::new(config);

    let source = Arc::new(MemorySource::default());
    let tools = tool_urls();
    for url in [
        &tools.scene_script,
        &tools.scene_script_360,
        &tools.mirror_script,
        &tools.user_mirror_script,
    ] {
        source.insert(url, b"import bpy\n");
    }
    source.insert(&tools.scene_file, b"BLENDER-base");
    source.insert(&tools.scene_file_360, b"BLENDER-base360");

    let engine = Arc::new(RecordingEngine::default());
    let store = Arc::new(RecordingStore::default());
    let batch = Arc::new(RecordingBatch::default());
    let (tx, notifications) = mpsc::unbounded_channel();

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&config),
        Collaborators {
            source: source.clone(),
            engine: engine.clone(),
            store: store.clone(),
            batch: batch.clone(),
            notifier: Arc::new(ChannelNotifier {
                tx,
                fail: failing_notifier,
            }),
        },
    ));

    Harness {
        dir,
        config,
        source,
        engine,
        store,
        batch,
        notifications,
        orchestrator,
    }
}

impl Harness {
    /// Make every asset `request` refers to available.
    pub fn seed(&self, request: &RenderRequest) {
        self.source.insert(&request.scene_gltf_uri, b"{\"asset\":{}}");
        self.source.insert(&request.space_image_uri, b"\xff\xd8jpeg");
        for obj in &request.scene_objects {
            self.source.insert(&obj.model_blender_uri, b"BLENDER-model");
        }
    }

    pub fn workspace_root(&self, job_id: &JobId) -> PathBuf {
        self.orchestrator.workspaces().paths(job_id).root
    }
}

/// A request with `objects` scene objects and every flag off.
pub fn request_json(job_id: u64, objects: usize) -> serde_json::Value {
    let scene_objects: Vec<serde_json::Value> = (0..objects)
        .map(|i| {
            serde_json::json!({
                "Name": format!("Object{}", i),
                "ModelBlenderUri": format!("{}/models/{}.blend", ASSETS_HOST, i),
                "PositionX": i as f64, "PositionY": 0.5, "PositionZ": -1.25,
                "RotationX": 0.0, "RotationY": 90.0, "RotationZ": 0.0,
                "QuaternionX": 0.0, "QuaternionY": 0.7071067811865476,
                "QuaternionZ": 0.0, "QuaternionW": 0.7071067811865476
            })
        })
        .collect();
    serde_json::json!({
        "RenderJobID": job_id,
        "SpaceImageID": 900 + job_id,
        "SceneObjects": scene_objects,
        "SceneGLTFUri": format!("{}/scenes/{}.gltf", ASSETS_HOST, job_id),
        "SpaceImageUri": format!("{}/images/{}.jpg?token=abc", ASSETS_HOST, job_id),
    })
}

pub fn request(job_id: u64, objects: usize) -> RenderRequest {
    serde_json::from_value(request_json(job_id, objects)).unwrap()
}
