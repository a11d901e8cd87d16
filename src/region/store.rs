//! 区域边界文件 (每个摄像头一个JSON, 编辑时整体覆盖)
//!
//! ```json
//! { "cameraId": "cam1", "boundary": [{"x": 10, "y": 20}, ...],
//!   "trackingMode": "InteriorOnly", "frameSize": {"width": 1280, "height": 720},
//!   "timestamp": "2024-01-01T00:00:00Z" }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{FrameSize, RegionBoundary, TrackingMode};
use crate::detection::Point;
use crate::error::{PipelineError, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundaryFile {
    pub camera_id: String,
    pub boundary: Vec<Point>,
    pub tracking_mode: TrackingMode,
    pub frame_size: FrameSize,
    pub timestamp: DateTime<Utc>,
}

impl From<BoundaryFile> for RegionBoundary {
    fn from(file: BoundaryFile) -> Self {
        RegionBoundary::new(
            file.camera_id,
            file.boundary,
            file.frame_size,
            file.tracking_mode,
        )
    }
}

impl From<&RegionBoundary> for BoundaryFile {
    fn from(boundary: &RegionBoundary) -> Self {
        Self {
            camera_id: boundary.camera_id.clone(),
            boundary: boundary.polygon.clone(),
            tracking_mode: boundary.tracking_mode,
            frame_size: boundary.reference_size,
            timestamp: Utc::now(),
        }
    }
}

/// 读取单个边界文件
pub fn load_boundary_file(path: impl AsRef<Path>) -> Result<RegionBoundary> {
    let path = path.as_ref();
    let malformed = |reason: String| PipelineError::MalformedBoundary {
        path: path.to_path_buf(),
        reason,
    };

    let json = fs::read_to_string(path).map_err(|e| malformed(e.to_string()))?;
    let file: BoundaryFile = serde_json::from_str(&json).map_err(|e| malformed(e.to_string()))?;
    if file.frame_size.width == 0 || file.frame_size.height == 0 {
        return Err(malformed("frameSize must be non-zero".into()));
    }
    if file
        .boundary
        .iter()
        .any(|p| !p.x.is_finite() || !p.y.is_finite())
    {
        return Err(malformed("boundary contains non-finite coordinates".into()));
    }
    Ok(file.into())
}

/// 边界文件目录: `<dir>/<camera_id>.json`
#[derive(Clone, Debug)]
pub struct BoundaryStore {
    dir: PathBuf,
}

impl BoundaryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, camera_id: &str) -> PathBuf {
        let file_name: String = camera_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }

    /// 文件不存在 → Ok(None); 文件损坏 → MalformedBoundary
    pub fn load(&self, camera_id: &str) -> Result<Option<RegionBoundary>> {
        let path = self.path_for(camera_id);
        if !path.exists() {
            debug!(camera_id, "no boundary file");
            return Ok(None);
        }
        load_boundary_file(&path).map(Some)
    }

    /// 整体覆盖写入
    pub fn save(&self, boundary: &RegionBoundary) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&boundary.camera_id);
        let json = serde_json::to_string_pretty(&BoundaryFile::from(boundary))
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        fs::write(&path, json)?;
        info!(camera_id = %boundary.camera_id, points = boundary.polygon.len(), "💾 区域边界已保存");
        Ok(path)
    }

    pub fn remove(&self, camera_id: &str) -> Result<()> {
        let path = self.path_for(camera_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
