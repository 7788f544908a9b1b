//! On-disk cache for remote models

use crate::error::VisionError;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const MAX_MODEL_SIZE: u64 = 2_000_000_000; // 2GB
const MIN_MODEL_SIZE: usize = 1024;
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(3600);

/// Downloads models once and keeps them under a cache directory.
#[derive(Debug, Clone)]
pub struct ModelCache {
    dir: PathBuf,
}

impl Default for ModelCache {
    fn default() -> Self {
        let dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("sushi-eye")
            .join("models");
        Self { dir }
    }
}

impl ModelCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cache location for `url`. Named by the URL's SHA-256 so distinct URLs
    /// never collide and no part of the URL reaches the filesystem.
    pub fn path_for(&self, url: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(url.as_bytes()));
        let ext = url
            .rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or("onnx");
        self.dir.join(format!("{}.{}", &digest[..32], ext))
    }

    /// Return the cached copy of `url`, downloading it first if needed.
    pub async fn fetch(&self, url: &str) -> Result<PathBuf, VisionError> {
        validate_url(url)?;
        let path = self.path_for(url);
        if path.exists() {
            info!("Model {} already cached at {:?}", url, path);
            return Ok(path);
        }

        fs::create_dir_all(&self.dir)?;
        info!("Downloading model from {}", url);

        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| VisionError::ModelLoad(format!("http client: {}", e)))?;
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| VisionError::ModelLoad(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(VisionError::ModelLoad(format!(
                "Failed to download model: HTTP {}",
                response.status()
            )));
        }
        if let Some(len) = response.content_length() {
            if len > MAX_MODEL_SIZE {
                return Err(VisionError::ModelLoad(format!(
                    "Model too large: {} bytes (max {} bytes)",
                    len, MAX_MODEL_SIZE
                )));
            }
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| VisionError::ModelLoad(format!("{}: {}", url, e)))?;
        self.store(&path, &bytes)?;
        info!("Model saved to {:?} ({} bytes)", path, bytes.len());
        Ok(path)
    }

    /// Write `bytes` to `path` via a temp file and rename.
    fn store(&self, path: &Path, bytes: &[u8]) -> Result<(), VisionError> {
        if bytes.len() as u64 > MAX_MODEL_SIZE {
            return Err(VisionError::ModelLoad(format!(
                "Downloaded model too large: {} bytes",
                bytes.len()
            )));
        }
        if bytes.len() < MIN_MODEL_SIZE {
            return Err(VisionError::ModelLoad(
                "Downloaded file too small, likely corrupted".to_string(),
            ));
        }
        let temp = path.with_extension("tmp");
        fs::write(&temp, bytes)?;
        if let Err(e) = fs::rename(&temp, path) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        Ok(())
    }
}

fn validate_url(url: &str) -> Result<(), VisionError> {
    if url.is_empty() || url.len() > 2048 {
        return Err(VisionError::ModelLoad("Invalid model URL".to_string()));
    }
    if !url.starts_with("https://") {
        return Err(VisionError::ModelLoad(
            "Only HTTPS URLs are allowed for model downloads".to_string(),
        ));
    }
    Ok(())
}
