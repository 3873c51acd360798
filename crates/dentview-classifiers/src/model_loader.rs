//! Device selection and model file helpers shared by both classifier variants

#[cfg(feature = "ml-models")]
use crate::config::BackboneConfig;
use dentview_core::{Error, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(feature = "ml-models")]
use candle_core::Device;
#[cfg(feature = "ml-models")]
use hf_hub::{api::sync::Api, Repo, RepoType};

/// Device type for inference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    /// CPU inference (always available)
    Cpu,
    /// CUDA GPU inference (if available)
    Cuda(usize), // GPU index
    /// Metal (Apple Silicon)
    Metal(usize),
}

/// Create Candle device from device type
#[cfg(feature = "ml-models")]
pub fn create_device(device_type: DeviceType) -> Result<Device> {
    match device_type {
        DeviceType::Cpu => Ok(Device::Cpu),
        DeviceType::Cuda(idx) => Device::new_cuda(idx)
            .map_err(|e| Error::classifier(format!("Failed to create CUDA device: {}", e))),
        DeviceType::Metal(idx) => Device::new_metal(idx)
            .map_err(|e| Error::classifier(format!("Failed to create Metal device: {}", e))),
    }
}

/// Locate the pretrained backbone weights, downloading them if needed
///
/// Hub downloads land in the standard Hugging Face cache and are reused on
/// later calls.
#[cfg(feature = "ml-models")]
pub fn resolve_backbone_weights(config: &BackboneConfig) -> Result<PathBuf> {
    if let Some(path) = &config.local_path {
        require_model_file(path)?;
        return Ok(path.clone());
    }

    tracing::info!(
        "Fetching backbone weights {} from {}",
        config.filename,
        config.repo_id
    );
    let api = Api::new()
        .map_err(|e| Error::config(format!("Failed to initialize HF API: {}", e)))?;
    let repo = api.repo(Repo::with_revision(
        config.repo_id.clone(),
        RepoType::Model,
        config.revision.clone().unwrap_or_else(|| "main".to_string()),
    ));
    repo.get(&config.filename)
        .map_err(|e| Error::config(format!("Failed to download backbone from HF: {}", e)))
}

/// Fail with [`Error::WeightsMissing`] when a model file does not exist
pub fn require_model_file(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::WeightsMissing(path.to_path_buf()))
    }
}

/// Path of the metadata sidecar stored next to a weights file
pub fn metadata_sidecar(weights_path: &Path) -> PathBuf {
    let mut name = weights_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".meta.json");
    weights_path.with_file_name(name)
}

/// Write a file by staging it next to the target and renaming over it
///
/// Readers never observe a half-written model file.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut tmp_name = path
        .file_name()
        .ok_or_else(|| Error::config(format!("Invalid model path: {}", path.display())))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;

    Ok(())
}
