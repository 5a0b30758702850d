use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::{GatewayError, GatewayResult};

/// Extension of every completed artifact.
pub const ARTIFACT_EXTENSION: &str = "mp4";
/// Extension of every stored thumbnail.
pub const THUMBNAIL_EXTENSION: &str = "jpg";

/// On-disk layout of the gateway
#[derive(Serialize, Clone, Debug)]
pub struct PathConfig {
    pub root: PathBuf,

    /// Completed downloads, `<title>.mp4`
    pub artifact_dir: PathBuf,
    /// Thumbnails, `<title>.jpg`
    pub image_dir: PathBuf,

    pub logs: LogPaths,
}

#[derive(Serialize, Clone, Debug)]
pub struct LogPaths {
    pub dir: PathBuf,
    pub gateway_logs: PathBuf,
    pub gateway_errors: PathBuf,
}

impl PathConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let log_dir = root.join("logs");

        Self {
            artifact_dir: root.join("downloads"),
            image_dir: root.join("public").join("img"),
            logs: LogPaths {
                gateway_logs: log_dir.join("gateway.log"),
                gateway_errors: log_dir.join("gateway.err.log"),
                dir: log_dir,
            },
            root,
        }
    }

    /// Ensure all necessary directories exist
    pub fn ensure_directories_exist(&self) -> GatewayResult<()> {
        for dir in [&self.artifact_dir, &self.image_dir, &self.logs.dir] {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|e| GatewayError::filesystem(dir, e))?;
            }
        }
        Ok(())
    }

    /// Where the completed artifact for a sanitized title lives
    pub fn artifact_path(&self, title: &str) -> PathBuf {
        self.artifact_dir
            .join(format!("{}.{}", title, ARTIFACT_EXTENSION))
    }

    /// Where the thumbnail for a sanitized title lives
    pub fn thumbnail_path(&self, title: &str) -> PathBuf {
        self.image_dir
            .join(format!("{}.{}", title, THUMBNAIL_EXTENSION))
    }

    /// Session-private scratch file; invisible to the library listing.
    pub fn part_path(&self, title: &str, session: u64) -> PathBuf {
        self.artifact_dir.join(format!(".{}.{}.part", title, session))
    }

    /// Scratch file for one thumbnail fetch; hidden from static serving.
    pub fn thumbnail_part_path(&self, title: &str, fetch: u64) -> PathBuf {
        self.image_dir.join(format!(".{}.{}.part", title, fetch))
    }

    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize path config: {}", e))
    }
}

/// True when `candidate` sits directly inside `dir`.
pub fn is_within(dir: &Path, candidate: &Path) -> bool {
    candidate.parent().map(|p| p == dir).unwrap_or(false)
}
