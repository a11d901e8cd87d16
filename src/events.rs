//! 对外事件 (流水线 → 外部应用)
//! Outbound events of the analytics pipeline
//!
//! 检测/跟踪/模型状态事件使用阻塞发送, 不允许丢失;
//! 性能报告使用 `try_send`, 通道满时直接丢弃。

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;
use tracing::debug;

use crate::detection::{Detection, TrackedPerson};
use crate::engine::ModelStatus;
use crate::scheduler::ProcessingLevel;
use crate::telemetry::PerformanceReport;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    ObjectDetected {
        camera_id: String,
        detections: Vec<Detection>,
        processing_time_ms: f64,
    },
    ModelStatusChanged {
        camera_id: String,
        status: ModelStatus,
        message: String,
    },
    TrackingUpdated {
        camera_id: String,
        tracked_persons: Vec<TrackedPerson>,
        detections: Vec<Detection>,
    },
    LevelChanged {
        camera_id: String,
        from: ProcessingLevel,
        to: ProcessingLevel,
    },
    PerformanceReport(PerformanceReport),
}

impl PipelineEvent {
    pub fn camera_id(&self) -> Option<&str> {
        match self {
            PipelineEvent::ObjectDetected { camera_id, .. }
            | PipelineEvent::ModelStatusChanged { camera_id, .. }
            | PipelineEvent::TrackingUpdated { camera_id, .. }
            | PipelineEvent::LevelChanged { camera_id, .. } => Some(camera_id),
            PipelineEvent::PerformanceReport(_) => None,
        }
    }
}

/// 事件发送端, 可克隆给每个摄像头流水线
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<PipelineEvent>>,
}

impl EventSink {
    /// 有界事件通道
    pub fn bounded(capacity: usize) -> (Self, Receiver<PipelineEvent>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    pub fn unbounded() -> (Self, Receiver<PipelineEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    /// 丢弃所有事件
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// 可靠发送 (通道满时阻塞)
    pub fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                debug!("event receiver dropped");
            }
        }
    }

    /// 尽力发送, 返回是否成功
    pub fn emit_lossy(&self, event: PipelineEvent) -> bool {
        match &self.tx {
            Some(tx) => match tx.try_send(event) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!("event channel full, event dropped");
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
            None => false,
        }
    }
}
