// Render request schema: the typed payload accepted at the HTTP boundary.

use std::fmt;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Job identifier as sent by clients: either a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobId {
    Number(u64),
    Text(String),
}

impl JobId {
    /// Encode the identifier as a single path component.
    ///
    /// ASCII alphanumerics, `-` and `_` are kept; every other byte becomes
    /// `%XX`. A text id made only of digits also has its first digit escaped,
    /// so `"5"` encodes to `%35` while the number `5` stays `5`. Numbers are
    /// the only ids that encode to bare digits, which keeps the mapping
    /// injective across both variants: distinct identifiers never share a
    /// directory. The result can never contain a separator or `..`.
    pub fn path_component(&self) -> String {
        let raw = match self {
            JobId::Number(n) => return n.to_string(),
            JobId::Text(s) => s,
        };
        let all_digits = !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit());
        let mut out = String::with_capacity(raw.len() + 2);
        for (i, b) in raw.bytes().enumerate() {
            let keep = b.is_ascii_alphanumeric() || b == b'-' || b == b'_';
            if keep && !(all_digits && i == 0) {
                out.push(b as char);
            } else {
                out.push_str(&format!("%{:02X}", b));
            }
        }
        out
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobId::Number(n) => write!(f, "{}", n),
            JobId::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        JobId::Number(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        JobId::Text(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    #[serde(rename = "X", alias = "x")]
    pub x: f64,
    #[serde(rename = "Y", alias = "y")]
    pub y: f64,
    #[serde(rename = "Z", alias = "z")]
    pub z: f64,
}

fn one() -> f64 {
    1.0
}

/// One placed, transformed asset within the scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SceneObject {
    pub name: String,
    pub model_blender_uri: String,
    #[serde(default)]
    pub inner_path: Option<String>,
    #[serde(default)]
    pub object_name: Option<String>,
    #[serde(default)]
    pub camera_object_name: Option<String>,

    pub position_x: f64,
    pub position_y: f64,
    pub position_z: f64,

    pub rotation_x: f64,
    pub rotation_y: f64,
    pub rotation_z: f64,

    pub quaternion_x: f64,
    pub quaternion_y: f64,
    pub quaternion_z: f64,
    pub quaternion_w: f64,

    /// Legacy uniform scale, kept alongside the per-axis values.
    #[serde(default = "one")]
    pub scale: f64,
    #[serde(default = "one")]
    pub scale_x: f64,
    #[serde(default = "one")]
    pub scale_y: f64,
    #[serde(default = "one")]
    pub scale_z: f64,

    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub is_floor: bool,
    #[serde(default)]
    pub is_curtain: bool,
    #[serde(default)]
    pub is_mirror: bool,

    #[serde(default)]
    pub show_lights: bool,
    #[serde(default)]
    pub lights_color: Option<String>,
    #[serde(default)]
    pub lights_power: Option<f64>,
    #[serde(default)]
    pub light_radius: Option<f64>,
    #[serde(default)]
    pub light_sources_positions: Option<Vec<Vector3>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderPreset {
    #[serde(rename = "RenderPresetName")]
    pub name: String,
    #[serde(rename = "IsExtension", default)]
    pub is_extension: bool,
    #[serde(rename = "ScriptDownloadURL", default)]
    pub script_download_url: Option<String>,
}

fn default_res_x() -> f64 {
    1920.0
}

fn default_res_y() -> f64 {
    1080.0
}

fn default_samples() -> u32 {
    256
}

fn default_output_format() -> String {
    "PNG".to_string()
}

fn default_camera() -> String {
    "Prod".to_string()
}

/// A render request. Immutable once it has passed [`RenderRequest::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    #[serde(rename = "RenderJobID")]
    pub job_id: JobId,
    /// Used to name the scene geometry and reference image; falls back to the
    /// job id.
    #[serde(rename = "SpaceImageID", default)]
    pub space_image_id: Option<u64>,
    #[serde(rename = "SceneObjects")]
    pub scene_objects: Vec<SceneObject>,
    #[serde(rename = "SceneGLTFUri")]
    pub scene_gltf_uri: String,
    #[serde(rename = "SpaceImageUri")]
    pub space_image_uri: String,
    #[serde(rename = "SceneScale", default = "one")]
    pub scene_scale: f64,
    #[serde(rename = "ResX", default = "default_res_x")]
    pub res_x: f64,
    #[serde(rename = "ResY", default = "default_res_y")]
    pub res_y: f64,
    #[serde(rename = "Samples", default = "default_samples")]
    pub samples: u32,
    #[serde(rename = "OutputFormat", default = "default_output_format")]
    pub output_format: String,
    #[serde(rename = "SceneMatName", default)]
    pub scene_mat_name: Option<String>,
    #[serde(rename = "SceneObjectName", default)]
    pub scene_object_name: Option<String>,
    #[serde(rename = "CameraObjectName", default = "default_camera")]
    pub camera_object_name: String,
    #[serde(rename = "MirrorInScene", default)]
    pub mirror_in_scene: bool,
    #[serde(rename = "Is360", default)]
    pub is360: bool,
    #[serde(rename = "RenderingPreset", default)]
    pub rendering_preset: Option<RenderPreset>,
    #[serde(default)]
    pub webhook: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("{field}: not an absolute http(s) url: {value:?}")]
    InvalidUrl { field: String, value: String },
    #[error("{0} must not be empty")]
    Empty(String),
    #[error("{field} out of range: {value}")]
    OutOfRange { field: String, value: String },
}

fn check_url(field: impl Into<String>, value: &str) -> Result<(), ValidationError> {
    let valid = Url::parse(value)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
        .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidUrl {
            field: field.into(),
            value: value.to_string(),
        })
    }
}

impl RenderRequest {
    /// Check the payload once at the boundary. The pipeline assumes a request
    /// that passed this check.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let JobId::Text(s) = &self.job_id {
            if s.trim().is_empty() {
                return Err(ValidationError::Empty("RenderJobID".to_string()));
            }
        }
        check_url("SceneGLTFUri", &self.scene_gltf_uri)?;
        check_url("SpaceImageUri", &self.space_image_uri)?;

        for (i, obj) in self.scene_objects.iter().enumerate() {
            if obj.name.trim().is_empty() {
                return Err(ValidationError::Empty(format!("SceneObjects[{}].Name", i)));
            }
            check_url(
                format!("SceneObjects[{}].ModelBlenderUri", i),
                &obj.model_blender_uri,
            )?;
        }

        if self.samples == 0 {
            return Err(ValidationError::OutOfRange {
                field: "Samples".to_string(),
                value: self.samples.to_string(),
            });
        }
        for (field, value) in [("ResX", self.res_x), ("ResY", self.res_y)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ValidationError::OutOfRange {
                    field: field.to_string(),
                    value: value.to_string(),
                });
            }
        }

        if let Some(url) = self
            .rendering_preset
            .as_ref()
            .and_then(|p| p.script_download_url.as_deref())
        {
            check_url("RenderingPreset.ScriptDownloadURL", url)?;
        }
        if let Some(hook) = &self.webhook {
            check_url("webhook", hook)?;
        }
        Ok(())
    }

    /// Identifier used to name the scene geometry and reference image.
    pub fn space_id(&self) -> String {
        match self.space_image_id {
            Some(id) => id.to_string(),
            None => self.job_id.path_component(),
        }
    }

    pub fn has_object_mirrors(&self) -> bool {
        self.scene_objects.iter().any(|o| o.is_mirror)
    }

    /// Whether the user-mirror pass applies. Scene-level mirroring and 360
    /// scenes exclude it.
    pub fn wants_user_mirror_pass(&self) -> bool {
        self.has_object_mirrors() && !self.mirror_in_scene && !self.is360
    }

    /// The preset, if it asks for an extension pass.
    pub fn extension_preset(&self) -> Option<&RenderPreset> {
        self.rendering_preset.as_ref().filter(|p| p.is_extension)
    }
}
