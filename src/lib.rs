// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 分析参数配置 (热更新)
pub mod detection; // 检测数据与目标追踪
pub mod engine; // 推理引擎接口与引擎池
pub mod error; // 错误类型
pub mod events; // 对外事件
pub mod pipeline; // 摄像头流水线与多摄像头服务
pub mod region; // 区域边界与内外过滤
pub mod scheduler; // 自适应调度 (运动门控)
pub mod telemetry; // 性能统计

pub use crate::config::{AnalyticsConfig, SettingsStore};
pub use crate::detection::{
    BBox, Detection, Frame, ObjectTracker, Point, RegionLocation, TrackedPerson,
};
pub use crate::engine::{
    EngineFactory, EngineHandle, EngineOptions, EnginePool, InferenceEngine, ModelStatus,
};
pub use crate::error::{PipelineError, Result};
pub use crate::events::{EventSink, PipelineEvent};
pub use crate::pipeline::{AnalyticsService, CameraPipeline, FrameResult, PipelineContext};
pub use crate::region::{RegionBoundary, RegionFilter, TrackingMode};
pub use crate::scheduler::{AdaptiveScheduler, ProcessingLevel};
pub use crate::telemetry::{CameraPerformance, PerformanceReport, TelemetryAggregator};

#[cfg(feature = "onnx")]
pub use crate::engine::ort::OrtEngine;
