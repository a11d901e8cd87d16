//! 摄像头工作线程
//!
//! - 帧队列有界 (frame_queue_depth), 满时丢弃最旧帧, 提交永不阻塞
//! - 出队时丢弃超过 frame_stale_ms 的过期帧
//! - 控制通道与帧队列通过 `select!` 复用, 控制命令先于其后提交的帧生效

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{select, Receiver, Sender, TryRecvError, TrySendError};
use tracing::{debug, info};

use super::{CameraPipeline, FrameResult, PipelineContext};
use crate::detection::Frame;
use crate::error::{PipelineError, Result};
use crate::region::RegionBoundary;
use crate::telemetry::TelemetryAggregator;

/// 摄像头控制命令
#[derive(Clone, Debug)]
pub enum CameraCommand {
    SetBoundary(Option<RegionBoundary>),
    ResetTracker,
    Shutdown,
}

pub struct CameraWorker {
    camera_id: String,
    frame_tx: Sender<Frame>,
    // 生产端持有一个接收端, 用于丢弃最旧帧
    frame_rx: Receiver<Frame>,
    control_tx: Sender<CameraCommand>,
    telemetry: Arc<TelemetryAggregator>,
    handle: Option<JoinHandle<()>>,
}

impl CameraWorker {
    pub fn spawn(
        camera_id: impl Into<String>,
        ctx: PipelineContext,
        results: Option<Sender<FrameResult>>,
    ) -> Result<Self> {
        let camera_id = camera_id.into();
        let depth = ctx.settings.snapshot().frame_queue_depth.max(1);
        let (frame_tx, frame_rx) = crossbeam_channel::bounded::<Frame>(depth);
        let (control_tx, control_rx) = crossbeam_channel::unbounded::<CameraCommand>();
        let telemetry = ctx.telemetry.clone();

        let thread_rx = frame_rx.clone();
        let thread_id = camera_id.clone();
        let handle = std::thread::Builder::new()
            .name(format!("camera-{}", camera_id))
            .spawn(move || {
                let pipeline = CameraPipeline::new(thread_id, ctx);
                run_worker(pipeline, thread_rx, control_rx, results);
            })?;

        info!(camera_id = %camera_id, queue_depth = depth, "🧵 摄像头线程已启动");
        Ok(Self {
            camera_id,
            frame_tx,
            frame_rx,
            control_tx,
            telemetry,
            handle: Some(handle),
        })
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// 提交帧 (不阻塞), 返回被挤掉的旧帧数
    pub fn submit(&self, frame: Frame) -> Result<u64> {
        if !self.is_running() {
            return Err(PipelineError::ServiceStopped);
        }
        let dropped = push_drop_oldest(&self.frame_tx, &self.frame_rx, frame)?;
        if dropped > 0 {
            self.telemetry.record_dropped(&self.camera_id, dropped);
            debug!(camera_id = %self.camera_id, dropped, "frame queue full, oldest dropped");
        }
        Ok(dropped)
    }

    pub fn send_command(&self, command: CameraCommand) -> Result<()> {
        self.control_tx
            .send(command)
            .map_err(|_| PipelineError::ServiceStopped)
    }

    /// 停止线程并等待退出 (流水线在线程内释放资源)
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.control_tx.send(CameraCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            info!(camera_id = %self.camera_id, "🛑 摄像头线程已停止");
        }
    }
}

impl Drop for CameraWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 有界队列写入, 满时丢弃最旧帧
fn push_drop_oldest(tx: &Sender<Frame>, rx: &Receiver<Frame>, frame: Frame) -> Result<u64> {
    let mut frame = frame;
    let mut dropped = 0;
    loop {
        match tx.try_send(frame) {
            Ok(()) => return Ok(dropped),
            Err(TrySendError::Full(rejected)) => {
                if rx.try_recv().is_ok() {
                    dropped += 1;
                }
                frame = rejected;
            }
            Err(TrySendError::Disconnected(_)) => return Err(PipelineError::ServiceStopped),
        }
    }
}

/// 处理命令, 返回是否继续运行
fn handle_command(pipeline: &mut CameraPipeline, command: CameraCommand) -> bool {
    match command {
        CameraCommand::SetBoundary(boundary) => pipeline.set_boundary(boundary),
        CameraCommand::ResetTracker => pipeline.reset_tracker(),
        CameraCommand::Shutdown => return false,
    }
    true
}

/// 处理已排队的命令, 返回是否继续运行
fn drain_commands(pipeline: &mut CameraPipeline, control_rx: &Receiver<CameraCommand>) -> bool {
    loop {
        match control_rx.try_recv() {
            Ok(command) => {
                if !handle_command(pipeline, command) {
                    return false;
                }
            }
            Err(TryRecvError::Empty) => return true,
            Err(TryRecvError::Disconnected) => return false,
        }
    }
}

fn run_worker(
    mut pipeline: CameraPipeline,
    frame_rx: Receiver<Frame>,
    control_rx: Receiver<CameraCommand>,
    results: Option<Sender<FrameResult>>,
) {
    loop {
        select! {
            recv(control_rx) -> command => match command {
                Ok(command) => {
                    if !handle_command(&mut pipeline, command) {
                        break;
                    }
                }
                Err(_) => break,
            },
            recv(frame_rx) -> frame => {
                let Ok(frame) = frame else { break };
                if !drain_commands(&mut pipeline, &control_rx) {
                    break;
                }

                let stale_after = pipeline.ctx.settings.snapshot().frame_stale();
                let age = frame.age(Instant::now());
                if age > stale_after {
                    pipeline.ctx.telemetry.record_dropped(pipeline.camera_id(), 1);
                    debug!(
                        camera_id = %pipeline.camera_id(),
                        frame_id = frame.frame_id,
                        age_ms = age.as_millis() as u64,
                        "stale frame dropped"
                    );
                    continue;
                }

                let result = pipeline.process_frame(frame);
                if let Some(tx) = &results {
                    if let Err(TrySendError::Full(_)) = tx.try_send(result) {
                        debug!(camera_id = %pipeline.camera_id(), "result channel full");
                    }
                }
            }
        }
    }
    debug!(camera_id = %pipeline.camera_id(), "camera worker exiting");
}
