/// 区域过滤系统 (Region Membership Filter)
///
/// 操作员在参考分辨率下绘制多边形区域, 检测框中心按当前帧分辨率缩放到
/// 参考坐标后做射线法判定 (只缩放查询点, 不缩放边界)。
/// - 少于3个顶点 → 视为无边界, 所有行人归为 Unknown 且不过滤
/// - 非行人检测不参与判定, 始终保留
/// - 恰好落在边上或顶点上的点判为 Interior
pub mod store;

use serde::{Deserialize, Serialize};

use crate::detection::{Detection, Point, RegionLocation};

pub use store::{load_boundary_file, BoundaryFile, BoundaryStore};

/// 边上判定容差 (参考坐标像素)
const EDGE_EPSILON: f64 = 1e-4;

/// 跟踪模式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackingMode {
    #[default]
    Both,
    InteriorOnly,
    ExteriorOnly,
    InteriorAlert,
}

impl TrackingMode {
    /// 该模式下是否保留此区域归属
    pub fn keeps(&self, location: RegionLocation) -> bool {
        match self {
            TrackingMode::Both => true,
            TrackingMode::InteriorOnly | TrackingMode::InteriorAlert => {
                location == RegionLocation::Interior
            }
            TrackingMode::ExteriorOnly => location == RegionLocation::Exterior,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// 区域边界 (编辑时整体替换, 两次编辑之间不可变)
#[derive(Clone, Debug, PartialEq)]
pub struct RegionBoundary {
    pub camera_id: String,
    pub polygon: Vec<Point>,
    pub reference_size: FrameSize,
    pub tracking_mode: TrackingMode,
}

impl RegionBoundary {
    pub fn new(
        camera_id: impl Into<String>,
        polygon: Vec<Point>,
        reference_size: FrameSize,
        tracking_mode: TrackingMode,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            polygon,
            reference_size,
            tracking_mode,
        }
    }

    /// 至少3个顶点才是有效边界
    pub fn is_valid(&self) -> bool {
        self.polygon.len() >= 3
    }

    /// 当前帧坐标 → 参考坐标
    pub fn to_reference(&self, point: Point, current: FrameSize) -> Point {
        let sx = if current.width > 0 {
            self.reference_size.width as f32 / current.width as f32
        } else {
            1.0
        };
        let sy = if current.height > 0 {
            self.reference_size.height as f32 / current.height as f32
        } else {
            1.0
        };
        Point::new(point.x * sx, point.y * sy)
    }

    /// 判定点 (当前帧坐标) 的区域归属
    pub fn classify_point(&self, point: Point, current: FrameSize) -> RegionLocation {
        if !self.is_valid() {
            return RegionLocation::Unknown;
        }
        let p = self.to_reference(point, current);
        if point_in_polygon(p, &self.polygon) {
            RegionLocation::Interior
        } else {
            RegionLocation::Exterior
        }
    }
}

/// 射线法点在多边形内判定, 边/顶点上的点返回 true
pub fn point_in_polygon(point: Point, polygon: &[Point]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }

    let (px, py) = (point.x as f64, point.y as f64);
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (polygon[i].x as f64, polygon[i].y as f64);
        let (xj, yj) = (polygon[j].x as f64, polygon[j].y as f64);

        if on_segment(px, py, xi, yi, xj, yj) {
            return true;
        }

        if (yi > py) != (yj > py) && px < (xj - xi) * (py - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn on_segment(px: f64, py: f64, ax: f64, ay: f64, bx: f64, by: f64) -> bool {
    let (dx, dy) = (bx - ax, by - ay);
    let len = (dx * dx + dy * dy).sqrt();
    if len < EDGE_EPSILON {
        return (px - ax).abs() <= EDGE_EPSILON && (py - ay).abs() <= EDGE_EPSILON;
    }
    let cross = dx * (py - ay) - dy * (px - ax);
    if cross.abs() > EDGE_EPSILON * len {
        return false;
    }
    px >= ax.min(bx) - EDGE_EPSILON
        && px <= ax.max(bx) + EDGE_EPSILON
        && py >= ay.min(by) - EDGE_EPSILON
        && py <= ay.max(by) + EDGE_EPSILON
}

/// 单摄像头区域过滤器 (只持有边界的内存副本)
#[derive(Clone, Debug, Default)]
pub struct RegionFilter {
    boundary: Option<RegionBoundary>,
}

impl RegionFilter {
    pub fn new(boundary: Option<RegionBoundary>) -> Self {
        Self { boundary }
    }

    pub fn set_boundary(&mut self, boundary: Option<RegionBoundary>) {
        self.boundary = boundary;
    }

    pub fn boundary(&self) -> Option<&RegionBoundary> {
        self.boundary.as_ref()
    }

    pub fn tracking_mode(&self) -> TrackingMode {
        self.boundary
            .as_ref()
            .map(|b| b.tracking_mode)
            .unwrap_or_default()
    }

    /// 判定单个检测 (非行人返回 Unknown)
    pub fn classify(&self, detection: &Detection, current: FrameSize) -> RegionLocation {
        if !detection.is_person() {
            return RegionLocation::Unknown;
        }
        match &self.boundary {
            Some(boundary) => boundary.classify_point(detection.center(), current),
            None => RegionLocation::Unknown,
        }
    }

    /// 写入区域归属, 并按跟踪模式保留/丢弃
    pub fn filter_detections(
        &self,
        detections: Vec<Detection>,
        current: FrameSize,
    ) -> Vec<Detection> {
        let boundary = match &self.boundary {
            Some(b) if b.is_valid() => b,
            _ => {
                return detections
                    .into_iter()
                    .map(|mut d| {
                        d.location = RegionLocation::Unknown;
                        d
                    })
                    .collect();
            }
        };

        detections
            .into_iter()
            .filter_map(|mut d| {
                if !d.is_person() {
                    return Some(d);
                }
                d.location = boundary.classify_point(d.center(), current);
                boundary.tracking_mode.keeps(d.location).then_some(d)
            })
            .collect()
    }
}
