// Configuration compiler: request plus local paths into the engine's JSON config.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use super::error::PipelineError;
use super::fetcher::SceneAssets;
use super::workspace::WorkspacePaths;
use crate::api::request::{RenderRequest, SceneObject, Vector3};
use crate::config::{
    AMBIENT_LIGHT_OBJECT_NAME, AREA_LIGHT_MATERIAL_NAME, AREA_LIGHT_OBJECT_NAME,
    FRAME_OBJECT_NAME, POINT_LIGHT_OBJECT_NAME, SCENE_MATERIAL_NAME,
};

/// One scene object as the engine script reads it. Optional values serialize
/// as `null`; no key is ever skipped.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModelEntry<'a> {
    pub model_blender_path: String,
    pub name: &'a str,
    pub inner_path: Option<&'a str>,
    pub object_name: Option<&'a str>,
    pub camera_object_name: Option<&'a str>,
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
    pub scale: f64,
    pub scale_x: f64,
    pub scale_y: f64,
    pub scale_z: f64,
    pub groups: &'a [String],
    pub is_curtain: bool,
    pub is_floor: bool,
    pub is_mirror: bool,
    pub show_lights: bool,
    pub lights_color: Option<&'a str>,
    pub lights_power: Option<f64>,
    pub light_radius: Option<f64>,
    pub light_sources_positions: &'a [Vector3],
}

impl<'a> ModelEntry<'a> {
    fn new(obj: &'a SceneObject, model_path: &Path) -> Self {
        Self {
            model_blender_path: model_path.display().to_string(),
            name: &obj.name,
            inner_path: obj.inner_path.as_deref(),
            object_name: obj.object_name.as_deref(),
            camera_object_name: obj.camera_object_name.as_deref(),
            position_x: obj.position_x,
            position_y: obj.position_y,
            position_z: obj.position_z,
            rotation_x: obj.rotation_x,
            rotation_y: obj.rotation_y,
            rotation_z: obj.rotation_z,
            quaternion_x: obj.quaternion_x,
            quaternion_y: obj.quaternion_y,
            quaternion_z: obj.quaternion_z,
            quaternion_w: obj.quaternion_w,
            scale: obj.scale,
            scale_x: obj.scale_x,
            scale_y: obj.scale_y,
            scale_z: obj.scale_z,
            groups: &obj.groups,
            is_curtain: obj.is_curtain,
            is_floor: obj.is_floor,
            is_mirror: obj.is_mirror,
            show_lights: obj.show_lights,
            lights_color: obj.lights_color.as_deref(),
            lights_power: obj.lights_power,
            light_radius: obj.light_radius,
            light_sources_positions: obj.light_sources_positions.as_deref().unwrap_or(&[]),
        }
    }
}

/// The full configuration document consumed by the base scene script.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SceneConfig<'a> {
    #[serde(rename = "SceneGLTFPath")]
    pub scene_gltf_path: String,
    pub scene_image_path: String,
    pub samples: u32,
    pub output_format: &'a str,
    pub res_x: f64,
    pub res_y: f64,
    pub scene_scale: f64,
    pub scene_models: Vec<ModelEntry<'a>>,
    pub scene_object_name: Option<&'a str>,
    pub camera_object_name: &'a str,
    pub scene_save_location: String,
    pub mirror_in_scene: bool,
    #[serde(rename = "Is360")]
    pub is360: bool,
    pub frame_object_name: &'static str,
    pub scene_mat_name: &'static str,
    pub area_light_object_name: &'static str,
    pub point_light_object_name: &'static str,
    pub ambient_light_object_name: &'static str,
    pub area_light_mat_name: &'static str,
}

impl<'a> SceneConfig<'a> {
    /// Build the document. `assets.models` must hold one path per scene
    /// object, in request order.
    pub fn build(request: &'a RenderRequest, assets: &SceneAssets, scene_output: &Path) -> Self {
        debug_assert_eq!(request.scene_objects.len(), assets.models.len());
        let scene_models = request
            .scene_objects
            .iter()
            .zip(&assets.models)
            .map(|(obj, path)| ModelEntry::new(obj, path))
            .collect();

        Self {
            scene_gltf_path: assets.scene_gltf.display().to_string(),
            scene_image_path: assets.scene_image.display().to_string(),
            samples: request.samples,
            output_format: &request.output_format,
            res_x: request.res_x,
            res_y: request.res_y,
            scene_scale: request.scene_scale,
            scene_models,
            scene_object_name: request.scene_object_name.as_deref(),
            camera_object_name: &request.camera_object_name,
            scene_save_location: scene_output.display().to_string(),
            mirror_in_scene: request.mirror_in_scene,
            is360: request.is360,
            frame_object_name: FRAME_OBJECT_NAME,
            scene_mat_name: SCENE_MATERIAL_NAME,
            area_light_object_name: AREA_LIGHT_OBJECT_NAME,
            point_light_object_name: POINT_LIGHT_OBJECT_NAME,
            ambient_light_object_name: AMBIENT_LIGHT_OBJECT_NAME,
            area_light_mat_name: AREA_LIGHT_MATERIAL_NAME,
        }
    }
}

/// Write the configuration artifact for `request` into the workspace and
/// return its path. Regenerating overwrites the previous file.
pub fn compile(
    request: &RenderRequest,
    assets: &SceneAssets,
    paths: &WorkspacePaths,
) -> Result<PathBuf, PipelineError> {
    let path = paths.config_file();
    let scene_output = paths.scene_output(&request.job_id);
    let config = SceneConfig::build(request, assets, &scene_output);

    let body = serde_json::to_vec_pretty(&config).map_err(|e| PipelineError::ConfigWrite {
        path: path.clone(),
        source: e.into(),
    })?;
    write_config(&path, &body)?;

    debug!(
        "config written job={} models={} path={}",
        request.job_id,
        config.scene_models.len(),
        path.display()
    );
    Ok(path)
}

fn write_config(path: &Path, body: &[u8]) -> Result<(), PipelineError> {
    let to_err = |source| PipelineError::ConfigWrite {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(to_err)?;
    }
    std::fs::write(path, body).map_err(to_err)
}
