/// 检测系统数据结构定义
/// Data structures for the detection system
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use phf::phf_map;
use serde::{Deserialize, Serialize};

// ========== 公共常量 ==========

/// 行人类别标签 (COCO class 0)
pub const PERSON_LABEL: &str = "person";

/// COCO 80类标签表
pub static COCO_CLASSES: phf::Map<u32, &'static str> = phf_map! {
    0u32 => "person", 1u32 => "bicycle", 2u32 => "car", 3u32 => "motorcycle",
    4u32 => "airplane", 5u32 => "bus", 6u32 => "train", 7u32 => "truck",
    8u32 => "boat", 9u32 => "traffic light", 10u32 => "fire hydrant",
    11u32 => "stop sign", 12u32 => "parking meter", 13u32 => "bench",
    14u32 => "bird", 15u32 => "cat", 16u32 => "dog", 17u32 => "horse",
    18u32 => "sheep", 19u32 => "cow", 20u32 => "elephant", 21u32 => "bear",
    22u32 => "zebra", 23u32 => "giraffe", 24u32 => "backpack", 25u32 => "umbrella",
    26u32 => "handbag", 27u32 => "tie", 28u32 => "suitcase", 29u32 => "frisbee",
    30u32 => "skis", 31u32 => "snowboard", 32u32 => "sports ball", 33u32 => "kite",
    34u32 => "baseball bat", 35u32 => "baseball glove", 36u32 => "skateboard",
    37u32 => "surfboard", 38u32 => "tennis racket", 39u32 => "bottle",
    40u32 => "wine glass", 41u32 => "cup", 42u32 => "fork", 43u32 => "knife",
    44u32 => "spoon", 45u32 => "bowl", 46u32 => "banana", 47u32 => "apple",
    48u32 => "sandwich", 49u32 => "orange", 50u32 => "broccoli", 51u32 => "carrot",
    52u32 => "hot dog", 53u32 => "pizza", 54u32 => "donut", 55u32 => "cake",
    56u32 => "chair", 57u32 => "couch", 58u32 => "potted plant", 59u32 => "bed",
    60u32 => "dining table", 61u32 => "toilet", 62u32 => "tv", 63u32 => "laptop",
    64u32 => "mouse", 65u32 => "remote", 66u32 => "keyboard", 67u32 => "cell phone",
    68u32 => "microwave", 69u32 => "oven", 70u32 => "toaster", 71u32 => "sink",
    72u32 => "refrigerator", 73u32 => "book", 74u32 => "clock", 75u32 => "vase",
    76u32 => "scissors", 77u32 => "teddy bear", 78u32 => "hair drier",
    79u32 => "toothbrush",
};

/// 类别ID → 标签 (未知类别返回 "unknown")
pub fn class_label(class_id: u32) -> &'static str {
    COCO_CLASSES.get(&class_id).copied().unwrap_or("unknown")
}

// ========== 帧 ==========

/// 视频帧 (采集 → 流水线)
///
/// 像素数据用Arc共享, 一次处理调用期间由流水线持有, 处理完即释放
#[derive(Clone)]
pub struct Frame {
    pub image: Arc<RgbImage>,
    pub frame_id: u64,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, frame_id: u64, captured_at: Instant) -> Self {
        Self {
            image: Arc::new(image),
            frame_id,
            captured_at,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// 帧龄 (相对 `now`)
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.captured_at)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("frame_id", &self.frame_id)
            .field("size", &format_args!("{}x{}", self.width(), self.height()))
            .finish()
    }
}

// ========== 几何 ==========

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// 检测框 (左上角 + 宽高, 像素坐标)
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_xyxy(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    pub fn x2(&self) -> f32 {
        self.x + self.width
    }

    pub fn y2(&self) -> f32 {
        self.y + self.height
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// 平移 (尺寸不变)
    pub fn translated(&self, dx: f32, dy: f32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        super::tracker::compute_iou(self, other)
    }
}

// ========== 检测结果 ==========

/// 区域归属
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionLocation {
    Interior,
    Exterior,
    #[default]
    Unknown,
}

/// 单个检测目标 (推理引擎产出)
///
/// 下游只会附加 `tracking_id` 和 `location`, 其余字段不变
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: u32,
    pub class_label: String,
    pub confidence: f32,
    pub bbox: BBox,
    pub tracking_id: Option<u64>,
    pub location: RegionLocation,
}

impl Detection {
    pub fn new(class_id: u32, class_label: impl Into<String>, confidence: f32, bbox: BBox) -> Self {
        Self {
            class_id,
            class_label: class_label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
            tracking_id: None,
            location: RegionLocation::Unknown,
        }
    }

    /// 按COCO类别ID构造
    pub fn from_class_id(class_id: u32, confidence: f32, bbox: BBox) -> Self {
        Self::new(class_id, class_label(class_id), confidence, bbox)
    }

    pub fn person(bbox: BBox, confidence: f32) -> Self {
        Self::from_class_id(0, confidence, bbox)
    }

    pub fn center(&self) -> Point {
        self.bbox.center()
    }

    pub fn is_person(&self) -> bool {
        self.class_label.eq_ignore_ascii_case(PERSON_LABEL)
    }
}
