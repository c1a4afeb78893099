// Concurrent asset fetcher: downloads a group of remote assets into a job workspace.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use reqwest::Url;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::error::PipelineError;
use super::workspace::WorkspacePaths;
use crate::api::request::RenderRequest;
use crate::source::traits::AssetSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Binary,
    /// The body must be valid UTF-8.
    Text,
}

/// One remote asset and where it lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub dest: PathBuf,
    pub mode: FetchMode,
}

impl FetchRequest {
    pub fn binary(url: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dest: dest.into(),
            mode: FetchMode::Binary,
        }
    }

    pub fn text(url: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dest: dest.into(),
            mode: FetchMode::Text,
        }
    }
}

/// Local paths of a job's scene assets, plus the requests that fill them.
#[derive(Debug, Clone)]
pub struct SceneAssets {
    pub scene_gltf: PathBuf,
    pub scene_image: PathBuf,
    /// One path per scene object, in request order.
    pub models: Vec<PathBuf>,
    pub requests: Vec<FetchRequest>,
}

impl SceneAssets {
    pub fn plan(request: &RenderRequest, paths: &WorkspacePaths) -> Self {
        let space_id = request.space_id();
        let scene_gltf = paths.scene_dir.join(format!("scene{}.gltf", space_id));
        let scene_image = paths.scene_dir.join(format!(
            "scene{}{}",
            space_id,
            url_extension(&request.space_image_uri)
        ));

        let mut requests = Vec::with_capacity(request.scene_objects.len() + 2);
        requests.push(FetchRequest::binary(&request.scene_gltf_uri, &scene_gltf));
        requests.push(FetchRequest::binary(&request.space_image_uri, &scene_image));

        let mut models = Vec::with_capacity(request.scene_objects.len());
        for (index, obj) in request.scene_objects.iter().enumerate() {
            let dest = model_destination(&paths.models_dir, index, &obj.name);
            requests.push(FetchRequest::binary(&obj.model_blender_uri, &dest));
            models.push(dest);
        }

        Self {
            scene_gltf,
            scene_image,
            models,
            requests,
        }
    }
}

/// Destination of the `index`-th scene object's model. The index keeps paths
/// unique when objects share a name or a source URI.
pub fn model_destination(models_dir: &Path, index: usize, name: &str) -> PathBuf {
    models_dir.join(format!("{:03}_{}.blend", index, sanitize_file_stem(name)))
}

fn sanitize_file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Extension of the URL's path including the dot, or empty. Query strings and
/// fragments are ignored.
fn url_extension(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            let file = u.path_segments()?.last()?.to_string();
            let (_, ext) = file.rsplit_once('.')?;
            (!ext.is_empty()).then(|| format!(".{}", ext))
        })
        .unwrap_or_default()
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name: OsString = dest.file_name().map(OsString::from).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

pub struct AssetFetcher {
    source: Arc<dyn AssetSource>,
    semaphore: Arc<Semaphore>,
}

impl AssetFetcher {
    pub fn new(source: Arc<dyn AssetSource>, max_concurrency: u32) -> Self {
        Self {
            source,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1) as usize)),
        }
    }

    /// Fetch a single asset.
    pub async fn fetch_one(&self, request: &FetchRequest) -> Result<u64, PipelineError> {
        fetch_to(self.source.as_ref(), request).await
    }

    /// Fetch every request concurrently and wait for all of them.
    ///
    /// The first failure cancels the rest of the group and is returned. Files
    /// fetched before the failure stay in place; partial writes never do.
    pub async fn fetch_all(&self, requests: Vec<FetchRequest>) -> Result<(), PipelineError> {
        if requests.is_empty() {
            return Ok(());
        }
        let t0 = Instant::now();
        let count = requests.len();
        let part_files: Vec<PathBuf> = requests.iter().map(|r| part_path(&r.dest)).collect();

        let mut set = JoinSet::new();
        for request in requests {
            let source = Arc::clone(&self.source);
            let semaphore = Arc::clone(&self.semaphore);
            set.spawn(async move {
                let _permit =
                    semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| PipelineError::Fetch {
                            url: request.url.clone(),
                            reason: e.to_string(),
                        })?;
                fetch_to(source.as_ref(), &request).await
            });
        }

        let mut total_bytes = 0u64;
        while let Some(joined) = set.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(PipelineError::Fetch {
                    url: "<fetch task>".to_string(),
                    reason: e.to_string(),
                })
            });
            match result {
                Ok(bytes) => total_bytes += bytes,
                Err(e) => {
                    set.abort_all();
                    while set.join_next().await.is_some() {}
                    for part in &part_files {
                        let _ = fs::remove_file(part).await;
                    }
                    warn!("fetch group aborted after failure: {}", e);
                    return Err(e);
                }
            }
        }

        info!(
            "fetched {} assets ({} bytes) in {} ms",
            count,
            total_bytes,
            t0.elapsed().as_millis()
        );
        Ok(())
    }
}

async fn fetch_to(source: &dyn AssetSource, request: &FetchRequest) -> Result<u64, PipelineError> {
    let fail = |reason: String| PipelineError::Fetch {
        url: request.url.clone(),
        reason,
    };

    let body = source
        .fetch(&request.url)
        .await
        .map_err(|e| fail(format!("{:#}", e)))?;
    if request.mode == FetchMode::Text {
        std::str::from_utf8(&body)
            .map_err(|e| fail(format!("body is not valid UTF-8: {}", e)))?;
    }

    if let Some(parent) = request.dest.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| fail(format!("creating {}: {}", parent.display(), e)))?;
    }
    let part = part_path(&request.dest);
    fs::write(&part, &body)
        .await
        .map_err(|e| fail(format!("writing {}: {}", part.display(), e)))?;
    fs::rename(&part, &request.dest)
        .await
        .map_err(|e| fail(format!("renaming into {}: {}", request.dest.display(), e)))?;

    debug!(
        "fetched {} -> {} ({} bytes)",
        request.url,
        request.dest.display(),
        body.len()
    );
    Ok(body.len() as u64)
}
