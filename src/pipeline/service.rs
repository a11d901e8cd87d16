//! 多摄像头分析服务
//!
//! camera_id → CameraWorker 映射。摄像头在首帧到达时惰性创建,
//! 移除时在其线程内释放引擎与背景模型。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::info;

use super::{CameraCommand, CameraWorker, FrameResult, PipelineContext};
use crate::config::SettingsStore;
use crate::detection::Frame;
use crate::engine::{EngineFactory, EnginePool};
use crate::error::{PipelineError, Result};
use crate::events::EventSink;
use crate::region::{BoundaryStore, RegionBoundary};
use crate::telemetry::{spawn_reporter, PerformanceReport, Reporter, TelemetryAggregator};

pub struct AnalyticsService {
    ctx: PipelineContext,
    workers: RwLock<HashMap<String, CameraWorker>>,
    results: Option<Sender<FrameResult>>,
    reporter: Mutex<Option<Reporter>>,
    stopped: AtomicBool,
}

impl AnalyticsService {
    pub fn new(
        settings: SettingsStore,
        factory: Arc<dyn EngineFactory>,
        events: EventSink,
    ) -> Result<Self> {
        let config = settings.snapshot();
        let pool = Arc::new(EnginePool::new(
            factory,
            config.max_concurrent_engines,
            events.clone(),
        ));
        let telemetry = Arc::new(TelemetryAggregator::new());
        let reporter = spawn_reporter(telemetry.clone(), events.clone(), config.report_interval())?;

        info!(max_engines = config.max_concurrent_engines, "🚀 分析服务已启动");
        Ok(Self {
            ctx: PipelineContext {
                settings,
                pool,
                telemetry,
                events,
            },
            workers: RwLock::new(HashMap::new()),
            results: None,
            reporter: Mutex::new(Some(reporter)),
            stopped: AtomicBool::new(false),
        })
    }

    /// 订阅逐帧结果 (只对之后创建的摄像头生效, 通道满时丢弃)
    pub fn frame_results(&mut self, capacity: usize) -> Receiver<FrameResult> {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        self.results = Some(tx);
        rx
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.ctx.settings
    }

    pub fn pool(&self) -> &Arc<EnginePool> {
        &self.ctx.pool
    }

    pub fn performance(&self) -> PerformanceReport {
        self.ctx.telemetry.snapshot()
    }

    pub fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            Err(PipelineError::ServiceStopped)
        } else {
            Ok(())
        }
    }

    /// 添加摄像头 (已存在时无操作)
    pub fn add_camera(&self, camera_id: &str) -> Result<()> {
        self.ensure_running()?;
        let mut workers = self.workers.write();
        if !workers.contains_key(camera_id) {
            let worker = CameraWorker::spawn(camera_id, self.ctx.clone(), self.results.clone())?;
            workers.insert(camera_id.to_string(), worker);
        }
        Ok(())
    }

    /// 提交帧, 未知摄像头自动创建; 返回被挤掉的旧帧数
    pub fn submit_frame(&self, camera_id: &str, frame: Frame) -> Result<u64> {
        self.ensure_running()?;
        if let Some(worker) = self.workers.read().get(camera_id) {
            return worker.submit(frame);
        }
        self.add_camera(camera_id)?;
        match self.workers.read().get(camera_id) {
            Some(worker) => worker.submit(frame),
            None => Err(PipelineError::UnknownCamera(camera_id.to_string())),
        }
    }

    /// 移除摄像头并等待其线程退出
    pub fn remove_camera(&self, camera_id: &str) -> bool {
        let worker = self.workers.write().remove(camera_id);
        match worker {
            Some(worker) => {
                worker.shutdown();
                info!(camera_id, "📷 摄像头已移除");
                true
            }
            None => false,
        }
    }

    /// 替换区域边界; 配置了边界目录时整体覆盖写入
    pub fn set_boundary(&self, camera_id: &str, boundary: Option<RegionBoundary>) -> Result<()> {
        let config = self.ctx.settings.snapshot();
        let persisted = match &config.boundary_dir {
            Some(dir) => {
                let store = BoundaryStore::new(dir);
                match &boundary {
                    Some(b) => {
                        store.save(b)?;
                    }
                    None => store.remove(camera_id)?,
                }
                true
            }
            None => false,
        };

        match self.workers.read().get(camera_id) {
            Some(worker) => worker.send_command(CameraCommand::SetBoundary(boundary)),
            None if persisted => Ok(()),
            None => Err(PipelineError::UnknownCamera(camera_id.to_string())),
        }
    }

    pub fn reset_tracker(&self, camera_id: &str) -> Result<()> {
        match self.workers.read().get(camera_id) {
            Some(worker) => worker.send_command(CameraCommand::ResetTracker),
            None => Err(PipelineError::UnknownCamera(camera_id.to_string())),
        }
    }

    /// 停止全部摄像头与上报线程, 释放所有引擎
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(reporter) = self.reporter.lock().take() {
            reporter.stop();
        }
        let workers: Vec<CameraWorker> = self.workers.write().drain().map(|(_, w)| w).collect();
        let count = workers.len();
        for worker in workers {
            worker.shutdown();
        }
        self.ctx.pool.shutdown();
        info!(cameras = count, "🛑 分析服务已停止");
    }
}

impl Drop for AnalyticsService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
