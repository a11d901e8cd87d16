//! 分析流水线错误类型
//! Error taxonomy of the analytics pipeline
//!
//! 所有逐帧错误都在 `CameraPipeline::process_frame` 内部被捕获,
//! 只以 `FrameResult::error` 标记的形式向外暴露。

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// 引擎加载失败 (模型文件/运行时错误), 下一帧会重试
    #[error("engine init failed for camera {camera_id}: {message}")]
    EngineInit { camera_id: String, message: String },

    /// 引擎池已满
    #[error("engine pool exhausted ({max_engines} engines in use)")]
    PoolExhausted { max_engines: usize },

    /// 单帧推理失败 (瞬时错误)
    #[error("inference failed: {0}")]
    Inference(String),

    /// 运动检测失败, 按"有运动"处理
    #[error("motion test failed: {0}")]
    MotionTest(String),

    /// 区域边界文件损坏, 视为没有边界
    #[error("malformed boundary file {}: {reason}", path.display())]
    MalformedBoundary { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown camera: {0}")]
    UnknownCamera(String),

    #[error("analytics service is stopped")]
    ServiceStopped,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
