/// 推理引擎接口 (Inference Engine Collaborator)
///
/// 神经网络推理对流水线是黑盒: `infer(frame) -> detections[]`。
/// - `EngineFactory`: 为每个摄像头创建独立的引擎实例
/// - `EnginePool`:    有界引擎池, 单一初始化锁
/// - `OrtEngine`:     ONNX Runtime YOLOv8 实现 (feature = "onnx")
///
/// ## 核心流程
/// ```text
/// acquire_engine(camera) → Loading → initialize(model, gpu) → Ready | Error
///                 ↓
///         handle.infer(frame) (每摄像头串行, 不持有全局锁)
///                 ↓
/// release_engine(camera) → Unloaded
/// ```
pub mod pool;

#[cfg(feature = "onnx")]
pub mod ort;

#[cfg(test)]
pub(crate) mod testing;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::info;

use crate::config::AnalyticsConfig;
use crate::detection::{Detection, Frame};

pub use pool::{EngineHandle, EnginePool, EngineStats};

/// 模型状态 (供外部状态显示)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ModelStatus {
    Loading,
    Ready,
    Error,
    Unloaded,
}

/// 推理引擎
///
/// 同一实例永远不会被并发调用 (池为每个摄像头串行化)
pub trait InferenceEngine: Send {
    /// 加载模型, 返回是否加载成功
    fn initialize(&mut self, model_path: Option<&Path>, use_gpu: bool) -> Result<bool>;

    /// 单帧推理, 坐标为输入帧像素坐标
    fn infer(
        &mut self,
        frame: &Frame,
        confidence_threshold: f32,
        iou_threshold: f32,
    ) -> Result<Vec<Detection>>;

    fn is_loaded(&self) -> bool;

    /// 执行后端描述 (如 "CPU", "CUDA")
    fn execution_provider(&self) -> &str;
}

/// 引擎工厂
pub trait EngineFactory: Send + Sync {
    fn create(&self, camera_id: &str) -> Result<Box<dyn InferenceEngine>>;
}

impl<F> EngineFactory for F
where
    F: Fn(&str) -> Result<Box<dyn InferenceEngine>> + Send + Sync,
{
    fn create(&self, camera_id: &str) -> Result<Box<dyn InferenceEngine>> {
        self(camera_id)
    }
}

/// 引擎加载参数
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EngineOptions {
    pub model_path: Option<PathBuf>,
    pub use_gpu: bool,
}

impl EngineOptions {
    pub fn from_config(config: &AnalyticsConfig) -> Self {
        Self {
            model_path: config.model_path.clone(),
            use_gpu: config.use_gpu,
        }
    }
}

/// 加载前检查模型文件 (存在/非空/.onnx), 返回文件大小(字节)
pub fn check_model_file(path: &Path) -> Result<u64> {
    if !path.exists() {
        bail!("model file not found: {}", path.display());
    }
    let size = fs::metadata(path)
        .with_context(|| format!("cannot stat model file {}", path.display()))?
        .len();
    if size == 0 {
        bail!("model file is empty: {}", path.display());
    }
    let is_onnx = path
        .extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case("onnx"));
    if !is_onnx {
        bail!("unsupported model format (expected .onnx): {}", path.display());
    }
    info!(
        path = %path.display(),
        size_mb = format_args!("{:.2}", size as f64 / (1024.0 * 1024.0)),
        "📦 模型文件检查通过"
    );
    Ok(size)
}

/// 非极大值抑制 (类别无关, 按置信度降序保留)
pub fn non_max_suppression(detections: &mut Vec<Detection>, iou_threshold: f32) {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept = 0;
    for index in 0..detections.len() {
        let suppressed = (0..kept)
            .any(|prev| detections[prev].bbox.iou(&detections[index].bbox) > iou_threshold);
        if !suppressed {
            detections.swap(kept, index);
            kept += 1;
        }
    }
    detections.truncate(kept);
}
