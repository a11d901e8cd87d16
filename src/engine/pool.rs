//! 有界推理引擎池
//!
//! - 每个摄像头至多一个引擎, 同一摄像头的并发 acquire 共享同一次初始化
//! - 全局初始化锁: 同一时刻只构建一个引擎
//! - 推理只锁定该摄像头自己的引擎

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::bail;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{check_model_file, EngineFactory, EngineOptions, InferenceEngine, ModelStatus};
use crate::detection::{Detection, Frame};
use crate::error::{PipelineError, Result};
use crate::events::{EventSink, PipelineEvent};

/// 单个引擎的推理统计
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EngineStats {
    pub frames_processed: u64,
    pub total_inference_ms: f64,
    pub last_inference_ms: f64,
}

impl EngineStats {
    pub fn average_inference_ms(&self) -> f64 {
        if self.frames_processed == 0 {
            0.0
        } else {
            self.total_inference_ms / self.frames_processed as f64
        }
    }
}

/// 已就绪引擎的句柄 (可克隆, 释放后推理返回错误)
#[derive(Clone)]
pub struct EngineHandle {
    camera_id: Arc<str>,
    provider: Arc<str>,
    engine: Arc<Mutex<Option<Box<dyn InferenceEngine>>>>,
    stats: Arc<Mutex<EngineStats>>,
}

impl EngineHandle {
    fn new(camera_id: &str, engine: Box<dyn InferenceEngine>) -> Self {
        Self {
            camera_id: Arc::from(camera_id),
            provider: Arc::from(engine.execution_provider()),
            engine: Arc::new(Mutex::new(Some(engine))),
            stats: Arc::new(Mutex::new(EngineStats::default())),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn execution_provider(&self) -> &str {
        &self.provider
    }

    pub fn is_released(&self) -> bool {
        self.engine.lock().is_none()
    }

    pub fn stats(&self) -> EngineStats {
        *self.stats.lock()
    }

    /// 推理并记录耗时
    pub fn infer(
        &self,
        frame: &Frame,
        confidence_threshold: f32,
        iou_threshold: f32,
    ) -> Result<Vec<Detection>> {
        let mut guard = self.engine.lock();
        let engine = guard
            .as_mut()
            .ok_or_else(|| PipelineError::Inference("engine released".into()))?;

        let start = Instant::now();
        let result = engine.infer(frame, confidence_threshold, iou_threshold);
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        drop(guard);

        let mut stats = self.stats.lock();
        stats.frames_processed += 1;
        stats.total_inference_ms += elapsed_ms;
        stats.last_inference_ms = elapsed_ms;
        drop(stats);

        result.map_err(|e| PipelineError::Inference(format!("{:#}", e)))
    }

    fn dispose(&self) -> bool {
        self.engine.lock().take().is_some()
    }
}

#[derive(Default)]
struct EngineSlot {
    cell: OnceCell<EngineHandle>,
}

pub struct EnginePool {
    factory: Arc<dyn EngineFactory>,
    slots: Mutex<HashMap<String, Arc<EngineSlot>>>,
    init_lock: Mutex<()>,
    max_engines: AtomicUsize,
    events: EventSink,
}

impl EnginePool {
    pub fn new(factory: Arc<dyn EngineFactory>, max_engines: usize, events: EventSink) -> Self {
        Self {
            factory,
            slots: Mutex::new(HashMap::new()),
            init_lock: Mutex::new(()),
            max_engines: AtomicUsize::new(max_engines.max(1)),
            events,
        }
    }

    pub fn max_engines(&self) -> usize {
        self.max_engines.load(Ordering::Relaxed)
    }

    /// 容量变更只影响之后的分配, 已有引擎保留
    pub fn set_max_engines(&self, max_engines: usize) {
        self.max_engines.store(max_engines.max(1), Ordering::Relaxed);
    }

    /// 获取(必要时初始化)摄像头的引擎
    pub fn acquire_engine(&self, camera_id: &str, options: &EngineOptions) -> Result<EngineHandle> {
        let slot = {
            let mut slots = self.slots.lock();
            match slots.get(camera_id) {
                Some(slot) => slot.clone(),
                None => {
                    let max_engines = self.max_engines();
                    if slots.len() >= max_engines {
                        warn!(camera_id, max_engines, "⚠️ 引擎池已满");
                        return Err(PipelineError::PoolExhausted { max_engines });
                    }
                    let slot = Arc::new(EngineSlot::default());
                    slots.insert(camera_id.to_string(), slot.clone());
                    slot
                }
            }
        };

        if let Some(handle) = slot.cell.get() {
            return Ok(handle.clone());
        }

        let result = slot
            .cell
            .get_or_try_init(|| self.initialize_engine(camera_id, options))
            .map(Clone::clone);

        if result.is_err() {
            // 最后一个失败的调用者移除槽位, 释放容量
            let mut slots = self.slots.lock();
            let owned_by_map = slots
                .get(camera_id)
                .map_or(false, |current| Arc::ptr_eq(current, &slot));
            if owned_by_map && slot.cell.get().is_none() && Arc::strong_count(&slot) == 2 {
                slots.remove(camera_id);
            }
        }
        result
    }

    fn initialize_engine(&self, camera_id: &str, options: &EngineOptions) -> Result<EngineHandle> {
        self.emit_status(camera_id, ModelStatus::Loading, "loading model".into());

        let start = Instant::now();
        let built = {
            let _init = self.init_lock.lock();
            self.build_engine(camera_id, options)
        };
        match built {
            Ok(handle) => {
                let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                info!(
                    camera_id,
                    provider = handle.execution_provider(),
                    elapsed_ms = format_args!("{:.1}", elapsed_ms),
                    "✅ 推理引擎就绪"
                );
                self.emit_status(
                    camera_id,
                    ModelStatus::Ready,
                    format!("ready on {}", handle.execution_provider()),
                );
                Ok(handle)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(camera_id, error = %message, "❌ 推理引擎初始化失败");
                self.emit_status(camera_id, ModelStatus::Error, message.clone());
                Err(PipelineError::EngineInit {
                    camera_id: camera_id.to_string(),
                    message,
                })
            }
        }
    }

    fn build_engine(
        &self,
        camera_id: &str,
        options: &EngineOptions,
    ) -> anyhow::Result<EngineHandle> {
        if let Some(path) = &options.model_path {
            check_model_file(path)?;
        }
        let mut engine = self.factory.create(camera_id)?;
        let loaded = engine.initialize(options.model_path.as_deref(), options.use_gpu)?;
        if !loaded || !engine.is_loaded() {
            bail!("engine reported model not loaded");
        }
        Ok(EngineHandle::new(camera_id, engine))
    }

    /// 释放摄像头引擎, 返回是否存在
    pub fn release_engine(&self, camera_id: &str) -> bool {
        let slot = self.slots.lock().remove(camera_id);
        let Some(slot) = slot else {
            return false;
        };
        if let Some(handle) = slot.cell.get() {
            if handle.dispose() {
                info!(camera_id, "🗑️ 推理引擎已释放");
                self.emit_status(camera_id, ModelStatus::Unloaded, "engine released".into());
            }
        }
        true
    }

    pub fn stats(&self, camera_id: &str) -> Option<EngineStats> {
        let slots = self.slots.lock();
        slots
            .get(camera_id)
            .and_then(|slot| slot.cell.get())
            .map(EngineHandle::stats)
    }

    /// 已分配(含初始化中)的引擎数
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 释放全部引擎
    pub fn shutdown(&self) {
        for camera_id in self.camera_ids() {
            self.release_engine(&camera_id);
        }
    }

    /// 状态事件不阻塞引擎初始化, 通道满时丢弃
    fn emit_status(&self, camera_id: &str, status: ModelStatus, message: String) {
        let delivered = self.events.emit_lossy(PipelineEvent::ModelStatusChanged {
            camera_id: camera_id.to_string(),
            status,
            message,
        });
        if !delivered {
            debug!(camera_id, status = ?status, "model status event dropped");
        }
    }
}
