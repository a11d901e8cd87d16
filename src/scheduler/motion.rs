//! 背景差分运动检测
//!
//! 灰度 → 缩放 → 高斯模糊 → 与滑动平均背景做差并阈值化 → 形态学闭运算 → 计数

use image::{imageops, GrayImage, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::close;

use crate::config::AnalyticsConfig;
use crate::error::{PipelineError, Result};

/// 单帧运动测试结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MotionResult {
    pub changed_pixels: u32,
    pub has_motion: bool,
}

impl MotionResult {
    const NONE: MotionResult = MotionResult {
        changed_pixels: 0,
        has_motion: false,
    };
}

/// 灰度滑动平均背景
struct Background {
    width: u32,
    height: u32,
    pixels: Vec<f32>,
}

impl Background {
    fn from_gray(gray: &GrayImage) -> Self {
        Self {
            width: gray.width(),
            height: gray.height(),
            pixels: gray.as_raw().iter().map(|&v| v as f32).collect(),
        }
    }
}

#[derive(Default)]
pub struct MotionDetector {
    background: Option<Background>,
}

impl MotionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_background(&self) -> bool {
        self.background.is_some()
    }

    /// 丢弃背景模型, 下一帧重新初始化
    pub fn reset(&mut self) {
        self.background = None;
    }

    pub fn detect(&mut self, image: &RgbImage, config: &AnalyticsConfig) -> Result<MotionResult> {
        if image.width() == 0 || image.height() == 0 {
            return Err(PipelineError::MotionTest("empty frame".into()));
        }

        let gray = self.prepare(image, config);

        // 首帧或分辨率变化: 初始化背景, 视为无运动
        let same_size = self
            .background
            .as_ref()
            .map_or(false, |bg| bg.width == gray.width() && bg.height == gray.height());
        if !same_size {
            self.background = Some(Background::from_gray(&gray));
            return Ok(MotionResult::NONE);
        }
        let Some(background) = self.background.as_mut() else {
            return Ok(MotionResult::NONE);
        };

        let threshold = config.pixel_diff_threshold as f32;
        let alpha = config.background_learning_rate.clamp(0.0, 1.0);
        let mut mask = GrayImage::new(gray.width(), gray.height());
        for ((value, bg), out) in gray
            .as_raw()
            .iter()
            .zip(background.pixels.iter_mut())
            .zip(mask.iter_mut())
        {
            let value = *value as f32;
            if (value - *bg).abs() > threshold {
                *out = 255;
            }
            *bg += alpha * (value - *bg);
        }

        let closed = close(&mask, Norm::LInf, 1);
        let changed_pixels = closed.pixels().filter(|p| p.0[0] > 0).count() as u32;

        Ok(MotionResult {
            changed_pixels,
            has_motion: changed_pixels > config.motion_threshold,
        })
    }

    fn prepare(&self, image: &RgbImage, config: &AnalyticsConfig) -> GrayImage {
        let mut gray: GrayImage = imageops::grayscale(image);

        let target_width = config.motion_analysis_width;
        if target_width > 0 && gray.width() > target_width {
            let target_height =
                ((gray.height() as u64 * target_width as u64) / gray.width() as u64).max(1) as u32;
            gray = imageops::resize(
                &gray,
                target_width,
                target_height,
                imageops::FilterType::Triangle,
            );
        }

        if config.blur_sigma > 0.0 {
            gaussian_blur_f32(&gray, config.blur_sigma)
        } else {
            gray
        }
    }
}
