//! 分析配置 - 通过JSON文件调整参数, 运行时可热更新

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PipelineError, Result};

/// 默认配置文件名
pub const CONFIG_FILE_NAME: &str = "analytics.json";

/// 分析参数配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    // === 功能开关 ===
    pub motion_detection_enabled: bool,
    pub object_detection_enabled: bool,
    pub tracking_enabled: bool,
    pub region_filter_enabled: bool,

    // === 跟踪参数 ===
    pub iou_threshold: f32,        // 轨迹匹配IOU阈值
    pub max_disappear_frames: u32, // 最大丢失帧数
    pub track_history_length: usize, // 轨迹历史长度

    // === 运动检测参数 ===
    pub motion_threshold: u32,        // 运动像素数阈值
    pub pixel_diff_threshold: u8,     // 单像素差分阈值
    pub background_learning_rate: f32, // 背景学习率
    pub blur_sigma: f32,              // 高斯模糊sigma (<=0 关闭)
    pub motion_analysis_width: u32,   // 运动分析缩放宽度 (0 = 原尺寸)

    // === 调度参数 ===
    pub max_consecutive_no_motion: u32,
    pub stabilization_interval_ms: u64,
    pub min_ai_interval_ms: u64,
    pub person_recheck_interval_ms: u64,
    pub periodic_check_interval_ms: u64, // 安全检查上限
    pub detection_reuse_ms: u64,

    // === 推理参数 ===
    pub confidence_threshold: f32,
    pub nms_iou_threshold: f32,
    pub max_concurrent_engines: usize,
    pub model_path: Option<PathBuf>,
    pub use_gpu: bool,

    // === 队列与上报 ===
    pub frame_stale_ms: u64,
    pub frame_queue_depth: usize,
    pub report_interval_ms: u64,
    pub boundary_dir: Option<PathBuf>,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            motion_detection_enabled: true,
            object_detection_enabled: true,
            tracking_enabled: true,
            region_filter_enabled: true,

            iou_threshold: 0.3,
            max_disappear_frames: 30,
            track_history_length: 50,

            motion_threshold: 500,
            pixel_diff_threshold: 25,
            background_learning_rate: 0.01,
            blur_sigma: 2.0,
            motion_analysis_width: 320,

            max_consecutive_no_motion: 10,
            stabilization_interval_ms: 2000,
            min_ai_interval_ms: 1000,
            person_recheck_interval_ms: 500,
            periodic_check_interval_ms: 3000,
            detection_reuse_ms: 5000,

            confidence_threshold: 0.25,
            nms_iou_threshold: 0.45,
            max_concurrent_engines: 4,
            model_path: None,
            use_gpu: false,

            frame_stale_ms: 200,
            frame_queue_depth: 2,
            report_interval_ms: 1000,
            boundary_dir: None,
        }
    }
}

impl AnalyticsConfig {
    /// 从JSON文件加载配置
    ///
    /// 文件不存在时写出默认配置; 解析失败时使用默认值
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str::<Self>(&json) {
                Ok(config) => {
                    info!(path = %path.display(), "✅ 配置已加载");
                    config.validated()
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "⚠️ 配置文件解析失败, 使用默认值");
                    Self::default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "📝 配置文件不存在, 创建默认配置");
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    warn!(error = %e, "❌ 保存默认配置失败");
                }
                config
            }
        }
    }

    /// 严格加载 (热更新使用: 失败时保留旧配置)
    pub fn try_load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config.validated())
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)?;
        info!(path = %path.display(), "💾 配置已保存");
        Ok(())
    }

    /// 修正越界参数
    pub fn validated(mut self) -> Self {
        self.iou_threshold = self.iou_threshold.clamp(0.0, 1.0);
        self.confidence_threshold = self.confidence_threshold.clamp(0.0, 1.0);
        self.nms_iou_threshold = self.nms_iou_threshold.clamp(0.0, 1.0);
        self.background_learning_rate = self.background_learning_rate.clamp(0.0, 1.0);
        self.track_history_length = self.track_history_length.max(1);
        self.max_concurrent_engines = self.max_concurrent_engines.max(1);
        self.frame_queue_depth = self.frame_queue_depth.max(1);
        self.report_interval_ms = self.report_interval_ms.max(100);
        if !self.blur_sigma.is_finite() || self.blur_sigma < 0.0 {
            self.blur_sigma = 0.0;
        }
        self
    }

    pub fn stabilization_interval(&self) -> Duration {
        Duration::from_millis(self.stabilization_interval_ms)
    }

    pub fn min_ai_interval(&self) -> Duration {
        Duration::from_millis(self.min_ai_interval_ms)
    }

    pub fn person_recheck_interval(&self) -> Duration {
        Duration::from_millis(self.person_recheck_interval_ms)
    }

    pub fn periodic_check_interval(&self) -> Duration {
        Duration::from_millis(self.periodic_check_interval_ms)
    }

    pub fn detection_reuse(&self) -> Duration {
        Duration::from_millis(self.detection_reuse_ms)
    }

    pub fn frame_stale(&self) -> Duration {
        Duration::from_millis(self.frame_stale_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    /// 打印当前配置
    pub fn log_summary(&self) {
        info!(
            motion = self.motion_detection_enabled,
            detection = self.object_detection_enabled,
            tracking = self.tracking_enabled,
            region = self.region_filter_enabled,
            max_engines = self.max_concurrent_engines,
            motion_threshold = self.motion_threshold,
            iou = self.iou_threshold,
            "🎛️ 当前分析配置"
        );
    }
}

/// 默认配置路径: <config_dir>/sentinel/analytics.json
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sentinel")
        .join(CONFIG_FILE_NAME)
}

/// 可热更新的配置存储
///
/// 每个摄像头每帧取一次快照, 修改从下一帧生效
#[derive(Clone)]
pub struct SettingsStore {
    inner: Arc<RwLock<AnalyticsConfig>>,
    generation: Arc<AtomicU64>,
}

impl SettingsStore {
    pub fn new(config: AnalyticsConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config.validated())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn snapshot(&self) -> AnalyticsConfig {
        self.inner.read().clone()
    }

    /// 配置版本号, 每次修改+1
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut AnalyticsConfig),
    {
        let mut guard = self.inner.write();
        f(&mut *guard);
        let validated = guard.clone().validated();
        *guard = validated;
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn replace(&self, config: AnalyticsConfig) {
        self.update(|c| *c = config);
    }

    /// 从文件重新加载; 失败时保留当前配置
    pub fn reload_from(&self, path: impl AsRef<Path>) -> Result<()> {
        let config = AnalyticsConfig::try_load(path)?;
        self.replace(config);
        info!(generation = self.generation(), "🔄 配置已热更新");
        Ok(())
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(AnalyticsConfig::default())
    }
}
