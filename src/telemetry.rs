//! 性能统计 (Telemetry Aggregator)
//!
//! 每个摄像头维护 1s / 10s 滑动窗口:
//! 帧时间戳、运动事件时间戳、推理耗时样本 (最近100个)。
//! 写入只持有该摄像头自己的短临界区。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{select, tick, Receiver};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info};

use crate::events::{EventSink, PipelineEvent};

const SHORT_WINDOW: Duration = Duration::from_secs(1);
const LONG_WINDOW: Duration = Duration::from_secs(10);
const MAX_INFERENCE_SAMPLES: usize = 100;

/// 单摄像头性能快照
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CameraPerformance {
    pub camera_id: String,
    pub fps_1s: f64,
    pub fps_10s: f64,
    /// 10秒窗口内每秒运动事件数
    pub motion_rate: f64,
    pub avg_inference_ms: f64,
    /// 推理次数 / 帧数 (10秒窗口)
    pub ai_efficiency: f64,
    pub total_frames: u64,
    pub total_inferences: u64,
    pub frames_dropped: u64,
}

/// 性能报告
#[derive(Clone, Debug, Default, Serialize)]
pub struct PerformanceReport {
    pub generated_at: Option<DateTime<Utc>>,
    pub cameras: Vec<CameraPerformance>,
}

impl PerformanceReport {
    pub fn camera(&self, camera_id: &str) -> Option<&CameraPerformance> {
        self.cameras.iter().find(|c| c.camera_id == camera_id)
    }
}

#[derive(Default)]
struct CameraMetrics {
    frames: VecDeque<Instant>,
    motions: VecDeque<Instant>,
    inferences: VecDeque<Instant>,
    inference_ms: VecDeque<f64>,
    total_frames: u64,
    total_inferences: u64,
    frames_dropped: u64,
}

impl CameraMetrics {
    fn prune(&mut self, now: Instant) {
        for window in [&mut self.frames, &mut self.motions, &mut self.inferences] {
            while let Some(&front) = window.front() {
                if now.saturating_duration_since(front) > LONG_WINDOW {
                    window.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    fn snapshot(&self, camera_id: &str, now: Instant) -> CameraPerformance {
        let within = |window: &VecDeque<Instant>, span: Duration| {
            window
                .iter()
                .filter(|t| now.saturating_duration_since(**t) <= span)
                .count()
        };
        let frames_10s = within(&self.frames, LONG_WINDOW);
        let inferences_10s = within(&self.inferences, LONG_WINDOW);

        let avg_inference_ms = if self.inference_ms.is_empty() {
            0.0
        } else {
            self.inference_ms.iter().sum::<f64>() / self.inference_ms.len() as f64
        };

        CameraPerformance {
            camera_id: camera_id.to_string(),
            fps_1s: within(&self.frames, SHORT_WINDOW) as f64 / SHORT_WINDOW.as_secs_f64(),
            fps_10s: frames_10s as f64 / LONG_WINDOW.as_secs_f64(),
            motion_rate: within(&self.motions, LONG_WINDOW) as f64 / LONG_WINDOW.as_secs_f64(),
            avg_inference_ms,
            ai_efficiency: if frames_10s == 0 {
                0.0
            } else {
                inferences_10s as f64 / frames_10s as f64
            },
            total_frames: self.total_frames,
            total_inferences: self.total_inferences,
            frames_dropped: self.frames_dropped,
        }
    }
}

#[derive(Default)]
pub struct TelemetryAggregator {
    cameras: RwLock<HashMap<String, Arc<Mutex<CameraMetrics>>>>,
}

impl TelemetryAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn metrics(&self, camera_id: &str) -> Arc<Mutex<CameraMetrics>> {
        if let Some(metrics) = self.cameras.read().get(camera_id) {
            return metrics.clone();
        }
        self.cameras
            .write()
            .entry(camera_id.to_string())
            .or_default()
            .clone()
    }

    pub fn record_frame(&self, camera_id: &str, at: Instant) {
        let metrics = self.metrics(camera_id);
        let mut m = metrics.lock();
        m.frames.push_back(at);
        m.total_frames += 1;
        m.prune(at);
    }

    pub fn record_motion(&self, camera_id: &str, at: Instant) {
        let metrics = self.metrics(camera_id);
        let mut m = metrics.lock();
        m.motions.push_back(at);
        m.prune(at);
    }

    pub fn record_inference(&self, camera_id: &str, at: Instant, elapsed_ms: f64) {
        let metrics = self.metrics(camera_id);
        let mut m = metrics.lock();
        m.inferences.push_back(at);
        m.inference_ms.push_back(elapsed_ms);
        if m.inference_ms.len() > MAX_INFERENCE_SAMPLES {
            m.inference_ms.pop_front();
        }
        m.total_inferences += 1;
        m.prune(at);
    }

    pub fn record_dropped(&self, camera_id: &str, count: u64) {
        self.metrics(camera_id).lock().frames_dropped += count;
    }

    pub fn remove_camera(&self, camera_id: &str) {
        self.cameras.write().remove(camera_id);
    }

    pub fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cameras.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 只读快照 (按摄像头id排序)
    pub fn snapshot_at(&self, now: Instant) -> PerformanceReport {
        let entries: Vec<(String, Arc<Mutex<CameraMetrics>>)> = self
            .cameras
            .read()
            .iter()
            .map(|(id, m)| (id.clone(), m.clone()))
            .collect();

        let mut cameras: Vec<CameraPerformance> = entries
            .iter()
            .map(|(id, metrics)| metrics.lock().snapshot(id, now))
            .collect();
        cameras.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));

        PerformanceReport {
            generated_at: Some(Utc::now()),
            cameras,
        }
    }

    pub fn snapshot(&self) -> PerformanceReport {
        self.snapshot_at(Instant::now())
    }
}

/// 周期性上报线程
pub struct Reporter {
    stop_tx: crossbeam_channel::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Reporter {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 每 `interval` 生成一次报告: 日志 + 非阻塞事件
pub fn spawn_reporter(
    telemetry: Arc<TelemetryAggregator>,
    events: EventSink,
    interval: Duration,
) -> std::io::Result<Reporter> {
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    let handle = std::thread::Builder::new()
        .name("telemetry-reporter".into())
        .spawn(move || run_reporter(telemetry, events, interval, stop_rx))?;
    Ok(Reporter {
        stop_tx,
        handle: Some(handle),
    })
}

fn run_reporter(
    telemetry: Arc<TelemetryAggregator>,
    events: EventSink,
    interval: Duration,
    stop_rx: Receiver<()>,
) {
    let ticker = tick(interval.max(Duration::from_millis(10)));
    loop {
        select! {
            recv(ticker) -> _ => {
                let report = telemetry.snapshot();
                for cam in &report.cameras {
                    info!(
                        camera_id = %cam.camera_id,
                        fps = format_args!("{:.1}", cam.fps_1s),
                        fps_10s = format_args!("{:.1}", cam.fps_10s),
                        motion_rate = format_args!("{:.2}", cam.motion_rate),
                        infer_ms = format_args!("{:.1}", cam.avg_inference_ms),
                        ai_efficiency = format_args!("{:.2}", cam.ai_efficiency),
                        dropped = cam.frames_dropped,
                        "📊 性能统计"
                    );
                }
                if !events.emit_lossy(PipelineEvent::PerformanceReport(report)) {
                    debug!("performance report not delivered");
                }
            }
            recv(stop_rx) -> _ => break,
        }
    }
    debug!("telemetry reporter stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sliding_windows() {
        let telemetry = TelemetryAggregator::new();
        let start = Instant::now();
        // 10秒内 100 帧 (10fps), 每 10 帧一次推理
        for i in 0..100u64 {
            let at = start + Duration::from_millis(100 * i);
            telemetry.record_frame("cam", at);
            if i % 10 == 0 {
                telemetry.record_inference("cam", at, 20.0);
                telemetry.record_motion("cam", at);
            }
        }
        let now = start + Duration::from_millis(9900);
        let report = telemetry.snapshot_at(now);
        let cam = report.camera("cam").unwrap();
        assert_eq!(cam.total_frames, 100);
        assert!((cam.fps_10s - 10.0).abs() < 1e-9);
        assert!((cam.fps_1s - 11.0).abs() < 1e-9);
        assert!((cam.ai_efficiency - 0.1).abs() < 1e-9);
        assert!((cam.avg_inference_ms - 20.0).abs() < 1e-9);
        assert!((cam.motion_rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_inference_samples_capped() {
        let telemetry = TelemetryAggregator::new();
        let now = Instant::now();
        for i in 0..150 {
            // 前 50 个样本 1000ms, 之后 10ms
            let ms = if i < 50 { 1000.0 } else { 10.0 };
            telemetry.record_inference("cam", now, ms);
        }
        let cam = telemetry.snapshot_at(now).cameras.remove(0);
        assert!((cam.avg_inference_ms - 10.0).abs() < 1e-9);
        assert_eq!(cam.total_inferences, 150);
    }

    #[test]
    fn test_remove_camera_and_dropped() {
        let telemetry = TelemetryAggregator::new();
        telemetry.record_dropped("a", 3);
        telemetry.record_frame("b", Instant::now());
        assert_eq!(telemetry.camera_ids(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(telemetry.snapshot().camera("a").unwrap().frames_dropped, 3);

        telemetry.remove_camera("a");
        assert!(telemetry.snapshot().camera("a").is_none());
    }

    #[test]
    fn test_reporter_emits_reports() {
        let telemetry = Arc::new(TelemetryAggregator::new());
        telemetry.record_frame("cam", Instant::now());
        let (events, rx) = EventSink::bounded(4);
        let reporter = spawn_reporter(telemetry, events, Duration::from_millis(20)).unwrap();

        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        reporter.stop();
        match event {
            PipelineEvent::PerformanceReport(report) => {
                assert_eq!(report.cameras.len(), 1);
                assert!(report.generated_at.is_some());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
