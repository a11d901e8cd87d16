/// 摄像头分析流水线 (Camera Analytics Pipeline)
///
/// 每个摄像头一个实例, 互不共享可变状态 (引擎池除外):
/// ```text
/// frame → AdaptiveScheduler (运动测试 → 级别决策)
///       → [可选] EnginePool 推理
///       → RegionFilter (内/外分类, 过滤)
///       → ObjectTracker (关联/预测)
///       → FrameResult + 事件 + 统计
/// ```
///
/// - `worker`:  每摄像头一个线程, 有界丢旧帧队列
/// - `service`: camera_id → worker 映射, 生命周期管理
pub mod service;
pub mod worker;

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{AnalyticsConfig, SettingsStore};
use crate::detection::{Detection, Frame, ObjectTracker, TrackedPerson, TrackerParams};
use crate::engine::{EngineHandle, EngineOptions, EnginePool};
use crate::error::Result;
use crate::events::{EventSink, PipelineEvent};
use crate::region::{BoundaryStore, FrameSize, RegionBoundary, RegionFilter};
use crate::scheduler::{AdaptiveScheduler, LevelChange, ProcessingLevel};
use crate::telemetry::TelemetryAggregator;

pub use service::AnalyticsService;
pub use worker::{CameraCommand, CameraWorker};

/// 单帧处理结果
#[derive(Clone, Debug, Serialize)]
pub struct FrameResult {
    pub camera_id: String,
    pub frame_id: u64,
    pub level: ProcessingLevel,
    pub motion: bool,
    pub ran_inference: bool,
    pub detections: Vec<Detection>,
    pub tracked_persons: Vec<TrackedPerson>,
    /// 本帧捕获的错误 (不会中断流水线)
    pub error: Option<String>,
    pub processing_time_ms: f64,
}

/// 流水线共享依赖
#[derive(Clone)]
pub struct PipelineContext {
    pub settings: SettingsStore,
    pub pool: Arc<EnginePool>,
    pub telemetry: Arc<TelemetryAggregator>,
    pub events: EventSink,
}

pub struct CameraPipeline {
    camera_id: String,
    ctx: PipelineContext,
    scheduler: AdaptiveScheduler,
    tracker: ObjectTracker,
    region: RegionFilter,
    engine: Option<(EngineHandle, EngineOptions)>,
}

impl CameraPipeline {
    /// 创建流水线, 配置了边界目录时加载该摄像头的边界文件
    pub fn new(camera_id: impl Into<String>, ctx: PipelineContext) -> Self {
        let camera_id = camera_id.into();
        let config = ctx.settings.snapshot();
        let boundary = load_boundary(&camera_id, &config);

        info!(camera_id = %camera_id, has_boundary = boundary.is_some(), "📷 摄像头流水线已创建");
        Self {
            scheduler: AdaptiveScheduler::new(camera_id.clone()),
            tracker: ObjectTracker::new(TrackerParams::from_config(&config)),
            region: RegionFilter::new(boundary),
            engine: None,
            camera_id,
            ctx,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn level(&self) -> ProcessingLevel {
        self.scheduler.level()
    }

    pub fn scheduler(&self) -> &AdaptiveScheduler {
        &self.scheduler
    }

    pub fn tracker(&self) -> &ObjectTracker {
        &self.tracker
    }

    pub fn region_filter(&self) -> &RegionFilter {
        &self.region
    }

    /// 整体替换区域边界
    pub fn set_boundary(&mut self, boundary: Option<RegionBoundary>) {
        info!(
            camera_id = %self.camera_id,
            points = boundary.as_ref().map_or(0, |b| b.polygon.len()),
            "🗺️ 区域边界已更新"
        );
        self.region.set_boundary(boundary);
    }

    pub fn reset_tracker(&mut self) {
        self.tracker.reset();
        debug!(camera_id = %self.camera_id, "tracker reset");
    }

    /// 处理一帧, 任何错误都记录在 `FrameResult.error` 中
    pub fn process_frame(&mut self, frame: Frame) -> FrameResult {
        let start = Instant::now();
        let config = self.ctx.settings.snapshot();
        let now = frame.captured_at;
        let frame_size = FrameSize::new(frame.width(), frame.height());

        self.tracker.set_params(TrackerParams::from_config(&config));
        self.ctx.pool.set_max_engines(config.max_concurrent_engines);
        self.ctx.telemetry.record_frame(&self.camera_id, now);

        // 1. 调度决策
        let decision = self.scheduler.decide(&frame, &config);
        if decision.motion {
            self.ctx.telemetry.record_motion(&self.camera_id, now);
        }
        if let Some(change) = decision.level_change {
            self.emit_level_change(change);
        }
        let mut motion = decision.motion;
        let mut error = decision.motion_error.clone();

        // 2. 推理 / 复用
        let mut ran_inference = false;
        let mut tracked_persons = Vec::new();
        let detections = if decision.run_inference {
            match self.run_inference(&frame, &config) {
                Ok((raw, elapsed_ms)) => {
                    ran_inference = true;
                    self.ctx
                        .telemetry
                        .record_inference(&self.camera_id, now, elapsed_ms);
                    if let Some(change) = self.scheduler.record_inference(&raw, now, &config) {
                        self.emit_level_change(change);
                    }

                    // 3. 区域过滤 → 跟踪
                    let mut filtered = if config.region_filter_enabled {
                        self.region.filter_detections(raw, frame_size)
                    } else {
                        raw
                    };
                    if config.tracking_enabled {
                        tracked_persons = self.tracker.update(&mut filtered, now);
                    }
                    self.scheduler.cache_detections(filtered.clone(), now);

                    self.ctx.events.emit(PipelineEvent::ObjectDetected {
                        camera_id: self.camera_id.clone(),
                        detections: filtered.clone(),
                        processing_time_ms: elapsed_ms,
                    });
                    if config.tracking_enabled {
                        self.ctx.events.emit(PipelineEvent::TrackingUpdated {
                            camera_id: self.camera_id.clone(),
                            tracked_persons: tracked_persons.clone(),
                            detections: filtered.clone(),
                        });
                    }
                    filtered
                }
                Err(e) => {
                    warn!(
                        camera_id = %self.camera_id,
                        frame_id = frame.frame_id,
                        error = %e,
                        "⚠️ 推理失败, 按有运动处理"
                    );
                    if !motion {
                        motion = true;
                        self.ctx.telemetry.record_motion(&self.camera_id, now);
                    }
                    if let Some(change) = self.scheduler.record_failed_inference(now, &config) {
                        self.emit_level_change(change);
                    }
                    if config.tracking_enabled {
                        tracked_persons = self.tracker.tracked_persons();
                    }
                    error = Some(e.to_string());
                    Vec::new()
                }
            }
        } else {
            if config.tracking_enabled {
                tracked_persons = self.tracker.tracked_persons();
            }
            self.scheduler.reusable_detections(now, &config)
        };
        // 运动测试失败: 本帧结果为空检测 + 错误标记
        let detections = if decision.motion_error.is_some() {
            Vec::new()
        } else {
            detections
        };

        let processing_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        debug!(
            camera_id = %self.camera_id,
            frame_id = frame.frame_id,
            level = decision.level.as_str(),
            motion,
            inference = ran_inference,
            detections = detections.len(),
            elapsed_ms = format_args!("{:.2}", processing_time_ms),
            "frame processed"
        );

        FrameResult {
            camera_id: self.camera_id.clone(),
            frame_id: frame.frame_id,
            level: self.scheduler.level(),
            motion,
            ran_inference,
            detections,
            tracked_persons,
            error,
            processing_time_ms,
        }
    }

    fn run_inference(
        &mut self,
        frame: &Frame,
        config: &AnalyticsConfig,
    ) -> Result<(Vec<Detection>, f64)> {
        let handle = self.ensure_engine(config)?;
        let start = Instant::now();
        let detections =
            handle.infer(frame, config.confidence_threshold, config.nms_iou_threshold)?;
        Ok((detections, start.elapsed().as_secs_f64() * 1000.0))
    }

    /// 获取引擎; 模型配置变化时重新加载
    fn ensure_engine(&mut self, config: &AnalyticsConfig) -> Result<EngineHandle> {
        let options = EngineOptions::from_config(config);
        if let Some((handle, loaded_with)) = &self.engine {
            if *loaded_with == options && !handle.is_released() {
                return Ok(handle.clone());
            }
            if *loaded_with != options {
                info!(camera_id = %self.camera_id, "🔄 模型配置变更, 重新加载引擎");
                self.ctx.pool.release_engine(&self.camera_id);
            }
        }
        self.engine = None;

        let handle = self.ctx.pool.acquire_engine(&self.camera_id, &options)?;
        self.engine = Some((handle.clone(), options));
        Ok(handle)
    }

    fn emit_level_change(&self, change: LevelChange) {
        self.ctx.events.emit(PipelineEvent::LevelChanged {
            camera_id: self.camera_id.clone(),
            from: change.from,
            to: change.to,
        });
    }
}

impl Drop for CameraPipeline {
    fn drop(&mut self) {
        self.engine = None;
        self.ctx.pool.release_engine(&self.camera_id);
        self.ctx.telemetry.remove_camera(&self.camera_id);
        self.scheduler.reset();
        debug!(camera_id = %self.camera_id, "pipeline resources released");
    }
}

fn load_boundary(camera_id: &str, config: &AnalyticsConfig) -> Option<RegionBoundary> {
    let dir = config.boundary_dir.as_ref()?;
    match BoundaryStore::new(dir).load(camera_id) {
        Ok(boundary) => boundary,
        Err(e) => {
            warn!(camera_id, error = %e, "⚠️ 边界文件无效, 按无边界处理");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BBox, Point, RegionLocation};
    use crate::engine::testing::{scripted, SharedScript};
    use crate::region::TrackingMode;
    use crossbeam_channel::Receiver;
    use image::{Rgb, RgbImage};
    use std::time::Duration;

    fn setup(config: AnalyticsConfig) -> (CameraPipeline, SharedScript, Receiver<PipelineEvent>) {
        let (script, factory) = scripted();
        let (events, rx) = EventSink::unbounded();
        let ctx = PipelineContext {
            settings: SettingsStore::new(config),
            pool: Arc::new(EnginePool::new(factory, 4, events.clone())),
            telemetry: Arc::new(TelemetryAggregator::new()),
            events,
        };
        (CameraPipeline::new("cam", ctx), script, rx)
    }

    fn frame(id: u64, at: Instant) -> Frame {
        Frame::new(RgbImage::from_pixel(640, 480, Rgb([50, 50, 50])), id, at)
    }

    fn person_at(x: f32) -> Detection {
        Detection::person(BBox::new(x, 100.0, 50.0, 120.0), 0.9)
    }

    #[test]
    fn test_first_frame_runs_inference_and_tracks() {
        let (mut pipeline, script, rx) = setup(AnalyticsConfig::default());
        script.lock().detections = vec![person_at(100.0)];

        let result = pipeline.process_frame(frame(0, Instant::now()));
        assert!(result.ran_inference);
        assert!(!result.motion);
        assert!(result.error.is_none());
        assert_eq!(result.detections.len(), 1);
        assert_eq!(result.detections[0].location, RegionLocation::Unknown);
        assert_eq!(result.detections[0].tracking_id, Some(1));
        assert_eq!(result.tracked_persons.len(), 1);

        let kinds: Vec<&'static str> = rx
            .try_iter()
            .map(|e| match e {
                PipelineEvent::ModelStatusChanged { .. } => "status",
                PipelineEvent::ObjectDetected { .. } => "detected",
                PipelineEvent::TrackingUpdated { .. } => "tracking",
                PipelineEvent::LevelChanged { .. } => "level",
                PipelineEvent::PerformanceReport(_) => "report",
            })
            .collect();
        assert_eq!(kinds, vec!["status", "status", "detected", "tracking"]);
    }

    #[test]
    fn test_skipped_inference_reuses_detections() {
        let (mut pipeline, script, _rx) = setup(AnalyticsConfig::default());
        script.lock().detections = vec![person_at(100.0)];
        let t0 = Instant::now();
        pipeline.process_frame(frame(0, t0));

        let result = pipeline.process_frame(frame(1, t0 + Duration::from_millis(100)));
        assert!(!result.ran_inference);
        assert_eq!(result.detections.len(), 1);
        assert_eq!(result.tracked_persons.len(), 1);
        assert_eq!(script.lock().infer_calls, 1);

        // 有人: 500ms 后复查
        let result = pipeline.process_frame(frame(2, t0 + Duration::from_millis(600)));
        assert!(result.ran_inference);
        assert_eq!(result.tracked_persons[0].track_id, 1);
    }

    #[test]
    fn test_inference_failure_keeps_tracks() {
        let (mut pipeline, script, _rx) = setup(AnalyticsConfig::default());
        script.lock().detections = vec![person_at(100.0)];
        let t0 = Instant::now();
        pipeline.process_frame(frame(0, t0));

        script.lock().fail_infer = true;
        let result = pipeline.process_frame(frame(1, t0 + Duration::from_secs(4)));
        assert!(result.error.is_some());
        assert!(result.detections.is_empty());
        assert_eq!(result.tracked_persons.len(), 1);
        assert_eq!(result.tracked_persons[0].frames_since_update, 0);
    }

    fn statuses(rx: &Receiver<PipelineEvent>) -> Vec<crate::engine::ModelStatus> {
        rx.try_iter()
            .filter_map(|e| match e {
                PipelineEvent::ModelStatusChanged { status, .. } => Some(status),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_inference_failure_counts_as_motion() {
        let (mut pipeline, script, rx) = setup(AnalyticsConfig::default());
        let t0 = Instant::now();
        for i in 0..5u64 {
            let result = pipeline.process_frame(frame(i, t0 + Duration::from_millis(100 * i)));
            assert!(!result.motion);
        }
        assert_eq!(pipeline.scheduler().state().consecutive_no_motion, 5);
        let _ = rx.try_iter().count();

        script.lock().fail_infer = true;
        let result = pipeline.process_frame(frame(5, t0 + Duration::from_secs(4)));
        assert!(!result.ran_inference);
        assert!(result.error.is_some());
        assert!(result.motion);
        assert!(result.detections.is_empty());
        assert_eq!(pipeline.scheduler().state().consecutive_no_motion, 0);
        assert_eq!(result.level, ProcessingLevel::ObjectDetection);
        assert!(rx.try_iter().any(|e| matches!(
            e,
            PipelineEvent::LevelChanged {
                to: ProcessingLevel::ObjectDetection,
                ..
            }
        )));
    }

    #[test]
    fn test_motion_failure_returns_empty_detections() {
        let (mut pipeline, script, rx) = setup(AnalyticsConfig::default());
        script.lock().detections = vec![person_at(100.0)];

        let result = pipeline.process_frame(Frame::new(RgbImage::new(0, 0), 0, Instant::now()));
        assert!(result.motion);
        assert!(result.ran_inference);
        assert!(result.error.is_some());
        assert!(result.detections.is_empty());
        // 推理结果仍然送出
        assert_eq!(result.tracked_persons.len(), 1);
        assert!(rx.try_iter().any(|e| matches!(
            e,
            PipelineEvent::ObjectDetected { ref detections, .. } if detections.len() == 1
        )));
    }

    #[test]
    fn test_settings_hot_reload_between_frames() {
        let (mut pipeline, script, _rx) = setup(AnalyticsConfig::default());
        script.lock().detections = vec![person_at(100.0)];
        let t0 = Instant::now();
        pipeline.process_frame(frame(0, t0));
        assert_eq!(pipeline.tracker().params(), TrackerParams::default());

        pipeline.ctx.settings.update(|c| {
            c.iou_threshold = 0.5;
            c.max_disappear_frames = 5;
            c.object_detection_enabled = false;
        });
        let result = pipeline.process_frame(frame(1, t0 + Duration::from_secs(4)));

        let params = pipeline.tracker().params();
        assert_eq!(params.iou_threshold, 0.5);
        assert_eq!(params.max_disappear_frames, 5);
        assert!(!result.ran_inference);
        assert_eq!(script.lock().infer_calls, 1);
    }

    #[test]
    fn test_model_options_change_reloads_engine() {
        let (mut pipeline, script, rx) = setup(AnalyticsConfig::default());
        let pool = pipeline.ctx.pool.clone();
        let t0 = Instant::now();
        pipeline.process_frame(frame(0, t0));
        assert_eq!(script.lock().init_calls, 1);
        let _ = rx.try_iter().count();

        pipeline.ctx.settings.update(|c| c.use_gpu = true);
        let result = pipeline.process_frame(frame(1, t0 + Duration::from_secs(4)));
        assert!(result.ran_inference);
        assert_eq!(script.lock().init_calls, 2);
        assert_eq!(script.lock().dropped, 1);
        assert_eq!(pool.len(), 1);
        assert_eq!(
            statuses(&rx),
            vec![
                crate::engine::ModelStatus::Unloaded,
                crate::engine::ModelStatus::Loading,
                crate::engine::ModelStatus::Ready,
            ]
        );
    }

    #[test]
    fn test_engine_init_failure_retries_next_frame() {
        let (mut pipeline, script, _rx) = setup(AnalyticsConfig::default());
        script.lock().fail_init = true;
        let t0 = Instant::now();

        let result = pipeline.process_frame(frame(0, t0));
        assert!(result.error.is_some());
        assert!(!result.ran_inference);

        script.lock().fail_init = false;
        let result = pipeline.process_frame(frame(1, t0 + Duration::from_secs(4)));
        assert!(result.error.is_none());
        assert!(result.ran_inference);
        assert_eq!(script.lock().init_calls, 2);
    }

    #[test]
    fn test_region_filter_drops_exterior() {
        let (mut pipeline, script, _rx) = setup(AnalyticsConfig::default());
        pipeline.set_boundary(Some(RegionBoundary::new(
            "cam",
            vec![
                Point::new(0.0, 0.0),
                Point::new(320.0, 0.0),
                Point::new(320.0, 480.0),
                Point::new(0.0, 480.0),
            ],
            FrameSize::new(640, 480),
            TrackingMode::InteriorOnly,
        )));
        script.lock().detections = vec![person_at(100.0), person_at(500.0)];

        let result = pipeline.process_frame(frame(0, Instant::now()));
        assert_eq!(result.detections.len(), 1);
        assert_eq!(result.detections[0].location, RegionLocation::Interior);
        assert_eq!(result.tracked_persons.len(), 1);
    }

    #[test]
    fn test_disabled_features() {
        let config = AnalyticsConfig {
            tracking_enabled: false,
            region_filter_enabled: false,
            ..AnalyticsConfig::default()
        };
        let (mut pipeline, script, _rx) = setup(config);
        script.lock().detections = vec![person_at(100.0)];
        let result = pipeline.process_frame(frame(0, Instant::now()));
        assert!(result.ran_inference);
        assert_eq!(result.detections.len(), 1);
        assert!(result.tracked_persons.is_empty());
        assert_eq!(result.detections[0].tracking_id, None);
    }

    #[test]
    fn test_drop_releases_engine() {
        let (mut pipeline, script, _rx) = setup(AnalyticsConfig::default());
        let pool = pipeline.ctx.pool.clone();
        pipeline.process_frame(frame(0, Instant::now()));
        assert_eq!(pool.len(), 1);

        drop(pipeline);
        assert!(pool.is_empty());
        assert_eq!(script.lock().dropped, 1);
    }
}
