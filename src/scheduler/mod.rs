/// 自适应调度器 (Adaptive Scheduler)
/// Motion-gated processing-level state machine, one instance per camera
///
/// ## 处理级别
/// ```text
/// None < MotionOnly < ObjectDetection < FullAnalysis
///          (初始)
/// ```
///
/// ## 每帧流程
/// 1. 运动测试 (背景差分)
/// 2. 级别迁移 (受稳定间隔约束)
/// 3. 决定本帧是否推理 (运动 / 有人复查 / 级别 / 3秒安全检查)
/// 4. 推理结果回写: lastAIProcessAt, hasPersons, 有人 → FullAnalysis
/// 5. 不推理时复用 5 秒内的上次检测结果
pub mod motion;

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::AnalyticsConfig;
use crate::detection::{Detection, Frame};

pub use motion::{MotionDetector, MotionResult};

/// 处理级别 (按计算开销排序)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ProcessingLevel {
    None,
    #[default]
    MotionOnly,
    ObjectDetection,
    FullAnalysis,
}

impl ProcessingLevel {
    /// 低一级
    pub fn lower(self) -> Self {
        match self {
            ProcessingLevel::FullAnalysis => ProcessingLevel::ObjectDetection,
            ProcessingLevel::ObjectDetection => ProcessingLevel::MotionOnly,
            ProcessingLevel::MotionOnly | ProcessingLevel::None => ProcessingLevel::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingLevel::None => "None",
            ProcessingLevel::MotionOnly => "MotionOnly",
            ProcessingLevel::ObjectDetection => "ObjectDetection",
            ProcessingLevel::FullAnalysis => "FullAnalysis",
        }
    }
}

/// 摄像头处理状态 (仅由该摄像头的流水线修改)
pub struct CameraProcessingState {
    pub camera_id: String,
    pub current_level: ProcessingLevel,
    pub last_level_change_at: Option<Instant>,
    pub background: MotionDetector,
    pub consecutive_no_motion: u32,
    pub last_motion_at: Option<Instant>,
    pub last_ai_process_at: Option<Instant>,
    pub has_persons: bool,
    pub last_detections: Vec<Detection>,
    pub last_detections_at: Option<Instant>,
}

impl CameraProcessingState {
    pub fn new(camera_id: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            current_level: ProcessingLevel::default(),
            last_level_change_at: None,
            background: MotionDetector::new(),
            consecutive_no_motion: 0,
            last_motion_at: None,
            last_ai_process_at: None,
            has_persons: false,
            last_detections: Vec::new(),
            last_detections_at: None,
        }
    }
}

/// 级别变化
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelChange {
    pub from: ProcessingLevel,
    pub to: ProcessingLevel,
}

/// 单帧调度决策
#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerDecision {
    pub motion: bool,
    pub level: ProcessingLevel,
    pub run_inference: bool,
    pub level_change: Option<LevelChange>,
    /// 运动测试失败信息 (失败时按有运动处理)
    pub motion_error: Option<String>,
}

pub struct AdaptiveScheduler {
    state: CameraProcessingState,
}

impl AdaptiveScheduler {
    pub fn new(camera_id: impl Into<String>) -> Self {
        Self {
            state: CameraProcessingState::new(camera_id),
        }
    }

    pub fn state(&self) -> &CameraProcessingState {
        &self.state
    }

    pub fn level(&self) -> ProcessingLevel {
        self.state.current_level
    }

    /// 运动测试 + 级别迁移 + 推理决策, "现在" 取帧采集时间
    pub fn decide(&mut self, frame: &Frame, config: &AnalyticsConfig) -> SchedulerDecision {
        let now = frame.captured_at;
        if self.state.last_level_change_at.is_none() {
            self.state.last_level_change_at = Some(now);
        }

        let (motion, motion_error) = if config.motion_detection_enabled {
            match self.state.background.detect(&frame.image, config) {
                Ok(result) => (result.has_motion, None),
                Err(e) => {
                    warn!(camera_id = %self.state.camera_id, error = %e, "⚠️ 运动测试失败, 按有运动处理");
                    (true, Some(e.to_string()))
                }
            }
        } else {
            (true, None)
        };

        let level_change = self.apply_motion(motion, now, config);
        let run_inference =
            config.object_detection_enabled && self.should_run_inference(motion, now, config);

        SchedulerDecision {
            motion,
            level: self.state.current_level,
            run_inference,
            level_change,
            motion_error,
        }
    }

    /// 根据运动结果更新计数与级别
    pub fn apply_motion(
        &mut self,
        motion: bool,
        now: Instant,
        config: &AnalyticsConfig,
    ) -> Option<LevelChange> {
        let level = self.state.current_level;
        if motion {
            self.state.consecutive_no_motion = 0;
            self.state.last_motion_at = Some(now);
            if level < ProcessingLevel::ObjectDetection && self.is_stabilized(now, config) {
                return self.transition(ProcessingLevel::ObjectDetection, now);
            }
            return None;
        }

        self.state.consecutive_no_motion = self.state.consecutive_no_motion.saturating_add(1);
        let quiet = self.state.consecutive_no_motion > 2 * config.max_consecutive_no_motion;
        if quiet && !self.state.has_persons && self.is_stabilized(now, config) {
            // 降级下限: ObjectDetection
            let target = level.lower().max(ProcessingLevel::ObjectDetection);
            if target != level {
                return self.transition(target, now);
            }
        }
        None
    }

    /// 是否在本帧调用推理 (任一条件满足即可)
    pub fn should_run_inference(
        &self,
        motion: bool,
        now: Instant,
        config: &AnalyticsConfig,
    ) -> bool {
        let since_last = self
            .state
            .last_ai_process_at
            .map(|t| now.saturating_duration_since(t));
        let elapsed = |interval: Duration| since_last.map_or(true, |d| d >= interval);

        if motion && elapsed(config.min_ai_interval()) {
            return true;
        }
        if self.state.has_persons && elapsed(config.person_recheck_interval()) {
            return true;
        }
        if self.state.current_level >= ProcessingLevel::ObjectDetection {
            return true;
        }
        if elapsed(config.periodic_check_interval()) {
            debug!(camera_id = %self.state.camera_id, "⏰ 安全检查: 强制推理");
            return true;
        }
        false
    }

    /// 推理完成: 更新时间戳与有人状态, 有人时升级到 FullAnalysis
    pub fn record_inference(
        &mut self,
        detections: &[Detection],
        now: Instant,
        config: &AnalyticsConfig,
    ) -> Option<LevelChange> {
        self.state.last_ai_process_at = Some(now);
        self.state.has_persons = detections.iter().any(Detection::is_person);

        if self.state.has_persons
            && self.state.current_level < ProcessingLevel::FullAnalysis
            && self.is_stabilized(now, config)
        {
            return self.transition(ProcessingLevel::FullAnalysis, now);
        }
        None
    }

    /// 推理失败: 按有运动处理 (重置无运动计数, 可能升级), 并推进推理时间戳
    pub fn record_failed_inference(
        &mut self,
        now: Instant,
        config: &AnalyticsConfig,
    ) -> Option<LevelChange> {
        self.state.last_ai_process_at = Some(now);
        self.apply_motion(true, now, config)
    }

    /// 缓存(过滤后的)检测结果, 供跳过推理的帧复用
    pub fn cache_detections(&mut self, detections: Vec<Detection>, now: Instant) {
        self.state.last_detections = detections;
        self.state.last_detections_at = Some(now);
    }

    /// 复用上次检测结果 (超过复用时限返回空)
    pub fn reusable_detections(&self, now: Instant, config: &AnalyticsConfig) -> Vec<Detection> {
        match self.state.last_detections_at {
            Some(at) if now.saturating_duration_since(at) < config.detection_reuse() => {
                self.state.last_detections.clone()
            }
            _ => Vec::new(),
        }
    }

    /// 释放背景模型并清空缓存
    pub fn reset(&mut self) {
        self.state.background.reset();
        self.state.consecutive_no_motion = 0;
        self.state.has_persons = false;
        self.state.last_detections.clear();
        self.state.last_detections_at = None;
    }

    fn is_stabilized(&self, now: Instant, config: &AnalyticsConfig) -> bool {
        self.state
            .last_level_change_at
            .map_or(true, |t| now.saturating_duration_since(t) >= config.stabilization_interval())
    }

    fn transition(&mut self, to: ProcessingLevel, now: Instant) -> Option<LevelChange> {
        let from = self.state.current_level;
        if from == to {
            return None;
        }
        self.state.current_level = to;
        self.state.last_level_change_at = Some(now);
        info!(
            camera_id = %self.state.camera_id,
            from = from.as_str(),
            to = to.as_str(),
            "🔀 处理级别变更"
        );
        Some(LevelChange { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;
    use image::{Rgb, RgbImage};

    fn still_frame(id: u64, at: Instant) -> Frame {
        Frame::new(RgbImage::from_pixel(64, 48, Rgb([30, 30, 30])), id, at)
    }

    fn person() -> Detection {
        Detection::person(BBox::new(10.0, 10.0, 20.0, 40.0), 0.8)
    }

    #[test]
    fn test_level_ordering() {
        assert!(ProcessingLevel::None < ProcessingLevel::MotionOnly);
        assert!(ProcessingLevel::ObjectDetection < ProcessingLevel::FullAnalysis);
        assert_eq!(ProcessingLevel::default(), ProcessingLevel::MotionOnly);
        assert_eq!(ProcessingLevel::MotionOnly.lower(), ProcessingLevel::None);
    }

    #[test]
    fn test_quiet_camera_settles_at_object_detection() {
        let config = AnalyticsConfig {
            max_consecutive_no_motion: 3,
            ..AnalyticsConfig::default()
        };
        let mut scheduler = AdaptiveScheduler::new("cam");
        let start = Instant::now();

        let mut reached = false;
        for i in 0..100u64 {
            let frame = still_frame(i, start + Duration::from_millis(100 * i));
            let decision = scheduler.decide(&frame, &config);
            assert!(!decision.motion);
            if reached {
                assert_eq!(decision.level, ProcessingLevel::ObjectDetection);
            }
            reached |= decision.level == ProcessingLevel::ObjectDetection;
        }
        assert!(reached);
        assert_eq!(scheduler.level(), ProcessingLevel::ObjectDetection);
        assert!(scheduler.state().consecutive_no_motion > 6);
    }

    #[test]
    fn test_full_analysis_drops_to_floor() {
        let config = AnalyticsConfig {
            max_consecutive_no_motion: 3,
            ..AnalyticsConfig::default()
        };
        let mut scheduler = AdaptiveScheduler::new("cam");
        let start = Instant::now();
        scheduler.decide(&still_frame(0, start), &config);

        let t1 = start + Duration::from_secs(3);
        assert!(scheduler.record_inference(&[person()], t1, &config).is_some());
        assert_eq!(scheduler.level(), ProcessingLevel::FullAnalysis);

        // 有人时不降级
        for i in 1..=20u64 {
            scheduler.apply_motion(false, t1 + Duration::from_millis(200 * i), &config);
        }
        assert_eq!(scheduler.level(), ProcessingLevel::FullAnalysis);

        let t2 = t1 + Duration::from_secs(5);
        scheduler.record_inference(&[], t2, &config);
        let mut seen = Vec::new();
        for i in 1..=50u64 {
            scheduler.apply_motion(false, t2 + Duration::from_millis(100 * i), &config);
            seen.push(scheduler.level());
        }
        assert!(seen.iter().all(|l| *l >= ProcessingLevel::ObjectDetection));
        assert_eq!(scheduler.level(), ProcessingLevel::ObjectDetection);
    }

    #[test]
    fn test_safety_check_forces_inference() {
        let config = AnalyticsConfig::default();
        let mut scheduler = AdaptiveScheduler::new("cam");
        let t0 = Instant::now();
        scheduler.record_inference(&[], t0, &config);
        assert_eq!(scheduler.level(), ProcessingLevel::MotionOnly);

        assert!(!scheduler.should_run_inference(false, t0 + Duration::from_secs(1), &config));
        assert!(scheduler.should_run_inference(false, t0 + Duration::from_millis(3500), &config));
    }

    #[test]
    fn test_first_decision_runs_inference() {
        let config = AnalyticsConfig::default();
        let mut scheduler = AdaptiveScheduler::new("cam");
        let decision = scheduler.decide(&still_frame(0, Instant::now()), &config);
        assert!(!decision.motion);
        assert!(decision.run_inference);
    }

    #[test]
    fn test_motion_escalates_after_stabilization() {
        let config = AnalyticsConfig::default();
        let mut scheduler = AdaptiveScheduler::new("cam");
        let t0 = Instant::now();
        scheduler.decide(&still_frame(0, t0), &config);

        assert!(scheduler
            .apply_motion(true, t0 + Duration::from_millis(500), &config)
            .is_none());
        assert_eq!(scheduler.level(), ProcessingLevel::MotionOnly);

        let change = scheduler
            .apply_motion(true, t0 + Duration::from_millis(2500), &config)
            .unwrap();
        assert_eq!(change.from, ProcessingLevel::MotionOnly);
        assert_eq!(change.to, ProcessingLevel::ObjectDetection);
        assert_eq!(scheduler.state().consecutive_no_motion, 0);
    }

    #[test]
    fn test_person_recheck_and_min_interval() {
        let config = AnalyticsConfig::default();
        let mut scheduler = AdaptiveScheduler::new("cam");
        let t0 = Instant::now();
        // 稳定间隔内: 有人但不升级
        scheduler.decide(&still_frame(0, t0), &config);
        assert!(scheduler.record_inference(&[person()], t0, &config).is_none());

        assert!(!scheduler.should_run_inference(false, t0 + Duration::from_millis(300), &config));
        assert!(scheduler.should_run_inference(false, t0 + Duration::from_millis(600), &config));

        scheduler.record_inference(&[], t0, &config);
        assert!(!scheduler.should_run_inference(true, t0 + Duration::from_millis(600), &config));
        assert!(scheduler.should_run_inference(true, t0 + Duration::from_millis(1000), &config));
    }

    #[test]
    fn test_object_detection_disabled_never_infers() {
        let config = AnalyticsConfig {
            object_detection_enabled: false,
            ..AnalyticsConfig::default()
        };
        let mut scheduler = AdaptiveScheduler::new("cam");
        let decision = scheduler.decide(&still_frame(0, Instant::now()), &config);
        assert!(!decision.run_inference);
    }

    #[test]
    fn test_motion_failure_counts_as_motion() {
        let config = AnalyticsConfig::default();
        let mut scheduler = AdaptiveScheduler::new("cam");
        let frame = Frame::new(RgbImage::new(0, 0), 0, Instant::now());
        let decision = scheduler.decide(&frame, &config);
        assert!(decision.motion);
        assert!(decision.motion_error.is_some());
        assert!(decision.run_inference);
    }

    #[test]
    fn test_failed_inference_counts_as_motion() {
        let config = AnalyticsConfig::default();
        let mut scheduler = AdaptiveScheduler::new("cam");
        let t0 = Instant::now();
        for i in 0..5u64 {
            scheduler.decide(&still_frame(i, t0 + Duration::from_millis(100 * i)), &config);
        }
        assert_eq!(scheduler.state().consecutive_no_motion, 5);

        let t1 = t0 + Duration::from_secs(4);
        let change = scheduler.record_failed_inference(t1, &config).unwrap();
        assert_eq!(change.to, ProcessingLevel::ObjectDetection);
        assert_eq!(scheduler.state().consecutive_no_motion, 0);
        assert_eq!(scheduler.state().last_ai_process_at, Some(t1));
        assert_eq!(scheduler.state().last_motion_at, Some(t1));
    }

    #[test]
    fn test_detection_reuse_window() {
        let config = AnalyticsConfig::default();
        let mut scheduler = AdaptiveScheduler::new("cam");
        let t0 = Instant::now();
        scheduler.cache_detections(vec![person()], t0);

        assert_eq!(
            scheduler
                .reusable_detections(t0 + Duration::from_secs(4), &config)
                .len(),
            1
        );
        assert!(scheduler
            .reusable_detections(t0 + Duration::from_secs(6), &config)
            .is_empty());
    }
}
