//! ONNX Runtime YOLOv8 检测引擎
//!
//! 包含: 模型加载、预处理(letterbox)、推理、后处理(解码 + NMS)

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use image::{imageops, RgbImage};
use ndarray::{s, Array, Axis, IxDyn};
use ort::{CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider, Session};
use tracing::{info, warn};

use super::{non_max_suppression, InferenceEngine};
use crate::detection::{BBox, Detection, Frame, COCO_CLASSES};

const CXYWH_OFFSET: usize = 4;
const DEFAULT_INPUT_SIZE: u32 = 640;
/// letterbox 填充灰度
const PAD_VALUE: f32 = 144.0 / 255.0;

/// YOLOv8 ONNX 引擎 (输出 `[1, 4 + nc, anchors]`)
pub struct OrtEngine {
    session: Option<Session>,
    width: u32,
    height: u32,
    provider: String,
}

impl Default for OrtEngine {
    fn default() -> Self {
        Self {
            session: None,
            width: DEFAULT_INPUT_SIZE,
            height: DEFAULT_INPUT_SIZE,
            provider: "CPU".to_string(),
        }
    }
}

impl OrtEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn scale_wh(&self, w0: f32, h0: f32) -> (f32, f32, f32) {
        let r = (self.width as f32 / w0).min(self.height as f32 / h0);
        (r, (w0 * r).round(), (h0 * r).round())
    }

    fn preprocess(&self, image: &RgbImage) -> Array<f32, IxDyn> {
        let mut ys = Array::from_elem(
            (1, 3, self.height as usize, self.width as usize),
            PAD_VALUE,
        )
        .into_dyn();

        let (_, w_new, h_new) = self.scale_wh(image.width() as f32, image.height() as f32);
        let resized = imageops::resize(
            image,
            (w_new as u32).max(1),
            (h_new as u32).max(1),
            imageops::FilterType::Triangle,
        );
        for (x, y, rgb) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            let [r, g, b] = rgb.0;
            ys[[0, 0, y, x]] = r as f32 / 255.0;
            ys[[0, 1, y, x]] = g as f32 / 255.0;
            ys[[0, 2, y, x]] = b as f32 / 255.0;
        }
        ys
    }

    fn postprocess(
        &self,
        preds: ndarray::ArrayViewD<'_, f32>,
        width_original: f32,
        height_original: f32,
        confidence_threshold: f32,
        iou_threshold: f32,
    ) -> Result<Vec<Detection>> {
        let shape = preds.shape();
        if shape.len() != 3 || shape[1] <= CXYWH_OFFSET {
            bail!("unexpected output shape {:?}", shape);
        }
        let nc = shape[1] - CXYWH_OFFSET;
        let (ratio, _, _) = self.scale_wh(width_original, height_original);

        let anchors = preds.index_axis(Axis(0), 0);
        let mut detections = Vec::new();
        for pred in anchors.axis_iter(Axis(1)) {
            let bbox = pred.slice(s![0..CXYWH_OFFSET]);
            let clss = pred.slice(s![CXYWH_OFFSET..CXYWH_OFFSET + nc]);

            let Some((id, &confidence)) = clss
                .iter()
                .enumerate()
                .reduce(|max, x| if x.1 > max.1 { x } else { max })
            else {
                continue;
            };
            if confidence < confidence_threshold {
                continue;
            }

            let cx = bbox[0] / ratio;
            let cy = bbox[1] / ratio;
            let w = bbox[2] / ratio;
            let h = bbox[3] / ratio;
            let x = (cx - w / 2.0).clamp(0.0, width_original);
            let y = (cy - h / 2.0).clamp(0.0, height_original);
            detections.push(Detection::from_class_id(
                id as u32,
                confidence,
                BBox::new(x, y, w.min(width_original - x), h.min(height_original - y)),
            ));
        }

        non_max_suppression(&mut detections, iou_threshold);
        Ok(detections)
    }
}

impl InferenceEngine for OrtEngine {
    fn initialize(&mut self, model_path: Option<&Path>, use_gpu: bool) -> Result<bool> {
        let model_path = model_path.ok_or_else(|| anyhow!("no model path configured"))?;

        let cuda = CUDAExecutionProvider::default();
        let cuda_available = use_gpu && cuda.is_available().unwrap_or(false);
        if use_gpu && !cuda_available {
            warn!("⚠️ CUDA 不可用, 回退到 CPU");
        }

        let builder = Session::builder()?;
        let builder = if cuda_available {
            builder.with_execution_providers([cuda.build()])?
        } else {
            builder.with_execution_providers([CPUExecutionProvider::default().build()])?
        };
        let session = builder
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load model {}", model_path.display()))?;

        // 输入尺寸: [batch, 3, height, width], 动态维度取默认值
        if let Some(input) = session.inputs.first() {
            if let ort::ValueType::Tensor { dimensions, .. } = &input.input_type {
                if dimensions.len() == 4 {
                    if dimensions[2] > 0 {
                        self.height = dimensions[2] as u32;
                    }
                    if dimensions[3] > 0 {
                        self.width = dimensions[3] as u32;
                    }
                }
            }
        }

        self.provider = if cuda_available { "CUDA" } else { "CPU" }.to_string();
        info!(
            model = %model_path.display(),
            provider = %self.provider,
            input = %format!("{}x{}", self.width, self.height),
            classes = COCO_CLASSES.len(),
            "🚀 ONNX 模型加载完成"
        );
        self.session = Some(session);
        Ok(true)
    }

    fn infer(
        &mut self,
        frame: &Frame,
        confidence_threshold: f32,
        iou_threshold: f32,
    ) -> Result<Vec<Detection>> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| anyhow!("model not loaded"))?;

        let input = self.preprocess(&frame.image);
        let outputs = session.run(ort::inputs![input.view()]?)?;
        let preds = outputs[0].try_extract_tensor::<f32>()?;

        self.postprocess(
            preds,
            frame.width() as f32,
            frame.height() as f32,
            confidence_threshold,
            iou_threshold,
        )
    }

    fn is_loaded(&self) -> bool {
        self.session.is_some()
    }

    fn execution_provider(&self) -> &str {
        &self.provider
    }
}
