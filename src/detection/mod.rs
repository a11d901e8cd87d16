/// 检测数据与目标追踪 (Detection & Tracking)
///
/// - types:   帧、检测框、检测结果、COCO类别表
/// - tracker: SORT风格的IOU贪心匹配 + 线性运动预测
pub mod tracker;
pub mod types;

pub use tracker::{compute_iou, ObjectTracker, Track, TrackedPerson, TrackerParams};
pub use types::{
    class_label, BBox, Detection, Frame, Point, RegionLocation, COCO_CLASSES, PERSON_LABEL,
};
