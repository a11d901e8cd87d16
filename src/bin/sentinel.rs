/// 数字卫兵 (Digital Sentinel)
///
/// 多摄像头自适应分析 - 图片序列回放
///
/// 系统架构:
/// 1. 回放线程: 每个摄像头一个, 按帧率读取图片目录并提交帧
/// 2. 摄像头线程: 调度 → 推理 → 区域过滤 → 追踪 (每摄像头独立)
/// 3. 事件线程: 打印检测/追踪/状态事件 (JSON 行)
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::Receiver;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sentinel_vision::config::{default_config_path, AnalyticsConfig, SettingsStore};
use sentinel_vision::{
    AnalyticsService, EngineFactory, EventSink, Frame, InferenceEngine, PipelineEvent,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// 数字卫兵参数
#[derive(Parser, Debug)]
#[command(author, version, about = "数字卫兵 - 多摄像头自适应分析", long_about = None)]
struct Args {
    /// 配置文件 (默认: 用户配置目录/sentinel/analytics.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 摄像头: <id>=<图片目录>, 可重复
    #[arg(long = "camera", value_parser = parse_camera, required = true)]
    cameras: Vec<(String, PathBuf)>,

    /// 回放帧率
    #[arg(long, default_value_t = 10.0)]
    fps: f64,

    /// ONNX 检测模型 (覆盖配置文件)
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// 使用 GPU (CUDA)
    #[arg(long, default_value_t = false)]
    gpu: bool,
}

fn parse_camera(s: &str) -> std::result::Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((id, dir)) if !id.is_empty() && !dir.is_empty() => {
            Ok((id.to_string(), PathBuf::from(dir)))
        }
        _ => Err(format!("expected <id>=<folder>, got '{}'", s)),
    }
}

#[cfg(feature = "onnx")]
fn engine_factory() -> Arc<dyn EngineFactory> {
    use sentinel_vision::OrtEngine;
    Arc::new(|_camera_id: &str| -> Result<Box<dyn InferenceEngine>> {
        Ok(Box::new(OrtEngine::new()))
    })
}

#[cfg(not(feature = "onnx"))]
fn engine_factory() -> Arc<dyn EngineFactory> {
    Arc::new(|_camera_id: &str| -> Result<Box<dyn InferenceEngine>> {
        bail!("built without the `onnx` feature")
    })
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read camera folder {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .map_or(false, |e| {
                    IMAGE_EXTENSIONS
                        .iter()
                        .any(|ext| e.eq_ignore_ascii_case(ext))
                })
        })
        .collect();
    files.sort();
    if files.is_empty() {
        bail!("no images found in {}", dir.display());
    }
    Ok(files)
}

/// 按帧率回放一个摄像头的图片序列
fn replay_camera(service: &AnalyticsService, camera_id: &str, files: &[PathBuf], fps: f64) {
    let interval = Duration::from_secs_f64(1.0 / fps.max(0.1));
    let mut dropped = 0u64;
    for (index, path) in files.iter().enumerate() {
        let started = Instant::now();
        let image = match image::open(path) {
            Ok(image) => image.to_rgb8(),
            Err(e) => {
                warn!(camera_id, path = %path.display(), error = %e, "⚠️ 图片读取失败, 跳过");
                continue;
            }
        };

        let frame = Frame::new(image, index as u64, Instant::now());
        match service.submit_frame(camera_id, frame) {
            Ok(n) => dropped += n,
            Err(e) => {
                warn!(camera_id, error = %e, "⚠️ 提交帧失败, 停止回放");
                break;
            }
        }

        if let Some(rest) = interval.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }
    info!(camera_id, frames = files.len(), dropped, "✅ 回放完成");
}

/// 打印事件 (性能报告已由上报线程记录日志)
fn print_events(rx: Receiver<PipelineEvent>) {
    for event in rx {
        if matches!(event, PipelineEvent::PerformanceReport(_)) {
            continue;
        }
        match serde_json::to_string(&event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "event serialization failed"),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // ========== 配置 ==========
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = AnalyticsConfig::load(&config_path).validated();
    if let Some(model) = &args.model {
        config.model_path = Some(model.clone());
    }
    config.use_gpu |= args.gpu;
    if cfg!(not(feature = "onnx")) && config.object_detection_enabled {
        warn!("⚠️ 未启用 onnx 功能, 关闭目标检测 (仅运动门控)");
        config.object_detection_enabled = false;
    }
    config.log_summary();

    let mut inputs = Vec::new();
    for (camera_id, dir) in &args.cameras {
        let files = list_images(dir)?;
        info!(camera_id = %camera_id, folder = %dir.display(), frames = files.len(), "📹 摄像头输入");
        inputs.push((camera_id.clone(), files));
    }

    // ========== 服务 ==========
    let (events, events_rx) = EventSink::bounded(1024);
    let printer = std::thread::Builder::new()
        .name("event-printer".into())
        .spawn(move || print_events(events_rx))
        .context("failed to spawn event printer")?;

    let service = AnalyticsService::new(SettingsStore::new(config), engine_factory(), events)
        .context("failed to start analytics service")?;
    for (camera_id, _) in &inputs {
        service
            .add_camera(camera_id)
            .with_context(|| format!("failed to start camera {}", camera_id))?;
    }

    // ========== 回放 ==========
    let fps = args.fps;
    std::thread::scope(|scope| {
        for (camera_id, files) in &inputs {
            let service = &service;
            scope.spawn(move || replay_camera(service, camera_id, files, fps));
        }
    });

    let report = service.performance();
    for cam in &report.cameras {
        info!(
            camera_id = %cam.camera_id,
            frames = cam.total_frames,
            inferences = cam.total_inferences,
            dropped = cam.frames_dropped,
            "📊 最终统计"
        );
    }

    service.shutdown();
    drop(service);
    if printer.join().is_err() {
        warn!("event printer panicked");
    }
    info!("👋 数字卫兵已退出");
    Ok(())
}
