use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::api::request::JobId;
use crate::config::{BatchConfig, ServiceConfig};

const INPUT_MOUNT: &str = "/mnt/stateful_partition/in";
const OUTPUT_MOUNT: &str = "/mnt/stateful_partition/out";

/// Hands a produced scene to the batch compute tier.
#[async_trait]
pub trait BatchSubmitter: Send + Sync {
    /// Submit a render of `scene_uri` and return the batch job's name.
    async fn submit(&self, job_id: &JobId, scene_uri: &str, webhook: Option<&str>)
        -> Result<String>;
}

/// Split `gs://bucket/object` into its parts.
pub fn parse_gs_uri(uri: &str) -> Result<(&str, &str)> {
    let rest = uri
        .strip_prefix("gs://")
        .ok_or_else(|| anyhow!("not a gs:// uri: {}", uri))?;
    match rest.split_once('/') {
        Some((bucket, object)) if !bucket.is_empty() && !object.is_empty() => Ok((bucket, object)),
        _ => Err(anyhow!("gs uri has no object path: {}", uri)),
    }
}

/// Lower-case `[a-z0-9-]` form of a job id, usable in batch job ids and labels.
fn label_value(job_id: &JobId) -> String {
    let mut out: String = job_id
        .to_string()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    out.truncate(40);
    out
}

/// Batch job id: `render-<id>-<6 hex>`.
pub fn batch_job_id(job_id: &JobId) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("render-{}-{}", label_value(job_id), &suffix[..6])
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// The bash script the batch task runs.
pub fn render_script(job_id: &JobId, scene_object: &str, out_prefix: &str, webhook: Option<&str>) -> String {
    let id = job_id.path_component();
    let mut script = format!(
        "set -euo pipefail\n\
         cp \"{input}/{object}\" scene.blend\n\
         blender -b scene.blend -E CYCLES -f 1\n\
         OUT_DIR={output}/renders/{id}\n\
         mkdir -p \"$OUT_DIR\"\n\
         cp Furniture_* Light_* Shadow_* scene.blend \"$OUT_DIR/\"\n",
        input = INPUT_MOUNT,
        object = scene_object,
        output = OUTPUT_MOUNT,
        id = id,
    );
    if let Some(hook) = webhook {
        let body = json!({
            "scene_id": job_id.to_string(),
            "status": "done",
            "gcs_prefix": out_prefix,
        });
        script.push_str(
            "apt-get -qq update && apt-get -y install --no-install-recommends curl >/dev/null\n",
        );
        script.push_str(&format!(
            "curl -s -X POST -H 'Content-Type: application/json' -d {} {}\n",
            shell_quote(&body.to_string()),
            shell_quote(hook)
        ));
    }
    script
}

/// Batch API job description for rendering `scene_uri`.
pub fn job_description(
    batch: &BatchConfig,
    output_bucket: &str,
    job_id: &JobId,
    scene_uri: &str,
    webhook: Option<&str>,
) -> Result<Value> {
    let (scene_bucket, scene_object) = parse_gs_uri(scene_uri)?;
    let out_prefix = format!("gs://{}/renders/{}/", output_bucket, job_id.path_component());
    let script = render_script(job_id, scene_object, &out_prefix, webhook);

    Ok(json!({
        "taskGroups": [{
            "taskSpec": {
                "runnables": [{
                    "container": {
                        "imageUri": batch.image_uri,
                        "entrypoint": "/bin/bash",
                        "commands": ["-c", script],
                    }
                }],
                "volumes": [
                    { "gcs": { "remotePath": scene_bucket }, "mountPath": INPUT_MOUNT },
                    { "gcs": { "remotePath": output_bucket }, "mountPath": OUTPUT_MOUNT },
                ],
                "computeResource": {
                    "cpuMilli": batch.cpu_milli,
                    "memoryMib": batch.memory_mib,
                },
                "maxRunDuration": format!("{}s", batch.max_run_seconds),
            },
            "taskCount": 1,
        }],
        "allocationPolicy": {
            "instances": [{ "policy": { "machineType": batch.machine_type } }],
        },
        "logsPolicy": {
            "destination": "CLOUD_LOGGING",
        },
        "labels": { "scene": label_value(job_id) },
    }))
}

/// Submits jobs to the Google Cloud Batch REST API.
pub struct GoogleBatchSubmitter {
    client: Client,
    project_id: String,
    region: String,
    bucket: String,
    access_token: Option<String>,
    batch: BatchConfig,
}

impl GoogleBatchSubmitter {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            client: Client::new(),
            project_id: config.project_id.clone(),
            region: config.region.clone(),
            bucket: config.bucket.clone(),
            access_token: config.access_token.clone(),
            batch: config.batch.clone(),
        }
    }
}

#[async_trait]
impl BatchSubmitter for GoogleBatchSubmitter {
    async fn submit(
        &self,
        job_id: &JobId,
        scene_uri: &str,
        webhook: Option<&str>,
    ) -> Result<String> {
        let batch_id = batch_job_id(job_id);
        let body = job_description(&self.batch, &self.bucket, job_id, scene_uri, webhook)?;
        let url = format!(
            "{}/projects/{}/locations/{}/jobs",
            self.batch.endpoint.trim_end_matches('/'),
            self.project_id,
            self.region
        );

        let mut req = self
            .client
            .post(&url)
            .query(&[("job_id", batch_id.as_str())])
            .json(&body);
        if let Some(token) = &self.access_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(anyhow!("batch create HTTP {}: {}", status.as_u16(), detail));
        }

        let created: Value = resp.json().await.unwrap_or(Value::Null);
        let name = created
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!(
                    "projects/{}/locations/{}/jobs/{}",
                    self.project_id, self.region, batch_id
                )
            });
        info!("batch job submitted job={} name={}", job_id, name);
        Ok(name)
    }
}
