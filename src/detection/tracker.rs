//! 多目标跟踪 (SORT风格)
//! SORT-style multi-object tracker
//!
//! 每帧流程:
//! 1. 只保留行人检测框
//! 2. 按轨迹ID升序贪心IOU匹配 (与轨迹的*预测框*比较)
//! 3. 匹配成功 → 更新位置/历史/预测
//! 4. 未匹配检测 → 新建轨迹 (ID单调递增, 永不复用)
//! 5. 未匹配轨迹 → 沿预测框滑行, 超过 `max_disappear_frames` 后删除

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use super::types::{BBox, Detection, Point, RegionLocation};
use crate::config::AnalyticsConfig;

/// 跟踪参数
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerParams {
    /// 匹配所需的最小IOU (严格大于)
    pub iou_threshold: f32,
    /// 连续丢失超过该帧数后删除轨迹
    pub max_disappear_frames: u32,
    /// 历史中心点最大长度
    pub history_length: usize,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            max_disappear_frames: 30,
            history_length: 50,
        }
    }
}

impl TrackerParams {
    pub fn from_config(config: &AnalyticsConfig) -> Self {
        Self {
            iou_threshold: config.iou_threshold,
            max_disappear_frames: config.max_disappear_frames,
            history_length: config.track_history_length.max(1),
        }
    }
}

/// 单条轨迹, 只属于一个摄像头的跟踪器
#[derive(Clone, Debug)]
pub struct Track {
    pub id: u64,
    pub current_box: BBox,
    pub predicted_box: BBox,
    pub last_confidence: f32,
    pub position_history: VecDeque<Point>,
    pub frames_since_update: u32,
    pub created_at: Instant,
    pub is_active: bool,
    /// 最近一次匹配检测的区域归属
    pub location: RegionLocation,
}

impl Track {
    fn new(id: u64, detection: &Detection, created_at: Instant, history_length: usize) -> Self {
        let mut position_history = VecDeque::with_capacity(history_length);
        position_history.push_back(detection.center());

        Self {
            id,
            current_box: detection.bbox,
            predicted_box: detection.bbox,
            last_confidence: detection.confidence,
            position_history,
            frames_since_update: 0,
            created_at,
            is_active: true,
            location: detection.location,
        }
    }

    fn update(&mut self, detection: &Detection, history_length: usize) {
        self.current_box = detection.bbox;
        self.last_confidence = detection.confidence;
        self.location = detection.location;
        self.frames_since_update = 0;

        self.position_history.push_back(detection.center());
        while self.position_history.len() > history_length {
            self.position_history.pop_front();
        }

        self.predict();
    }

    /// 未匹配: 计数+1, 未过期则沿预测框滑行
    fn coast(&mut self, max_disappear_frames: u32) {
        self.frames_since_update += 1;
        if self.frames_since_update > max_disappear_frames {
            self.is_active = false;
            return;
        }
        self.current_box = self.predicted_box;
        self.predict();
    }

    /// 两点线性速度 (历史不足两点时为0)
    pub fn velocity(&self) -> (f32, f32) {
        let n = self.position_history.len();
        if n < 2 {
            return (0.0, 0.0);
        }
        let last = self.position_history[n - 1];
        let prev = self.position_history[n - 2];
        (last.x - prev.x, last.y - prev.y)
    }

    fn predict(&mut self) {
        let (vx, vy) = self.velocity();
        self.predicted_box = self.current_box.translated(vx, vy);
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

/// 跟踪输出 (每条活跃轨迹一个)
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackedPerson {
    pub track_id: u64,
    pub bbox: BBox,
    pub predicted_bbox: BBox,
    pub confidence: f32,
    pub trajectory: Vec<Point>,
    pub frames_since_update: u32,
    /// 本帧没有匹配到检测, 仅靠预测
    pub is_coasting: bool,
    pub location: RegionLocation,
}

impl From<&Track> for TrackedPerson {
    fn from(track: &Track) -> Self {
        Self {
            track_id: track.id,
            bbox: track.current_box,
            predicted_bbox: track.predicted_box,
            confidence: track.last_confidence,
            trajectory: track.position_history.iter().copied().collect(),
            frames_since_update: track.frames_since_update,
            is_coasting: track.frames_since_update > 0,
            location: track.location,
        }
    }
}

/// 单摄像头跟踪器
pub struct ObjectTracker {
    /// 活跃轨迹, 始终按ID升序
    tracks: Vec<Track>,
    next_id: u64,
    params: TrackerParams,
}

impl ObjectTracker {
    pub fn new(params: TrackerParams) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            params,
        }
    }

    /// 热更新参数 (已有轨迹保留)
    pub fn set_params(&mut self, params: TrackerParams) {
        self.params = params;
    }

    pub fn params(&self) -> TrackerParams {
        self.params
    }

    /// 更新跟踪
    ///
    /// 匹配或新建轨迹的行人检测会被写入 `tracking_id`。
    /// 非行人检测原样保留。
    pub fn update(&mut self, detections: &mut [Detection], now: Instant) -> Vec<TrackedPerson> {
        let params = self.params;

        // 1. 行人检测 (保持输入顺序)
        let person_indices: Vec<usize> = detections
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_person())
            .map(|(idx, _)| idx)
            .collect();

        // 2. 贪心匹配: 轨迹按ID顺序, 先到先得
        let mut used_det = vec![false; person_indices.len()];
        let mut matched_track = vec![false; self.tracks.len()];

        for (track_idx, track) in self.tracks.iter_mut().enumerate() {
            let mut best: Option<(usize, f32)> = None;
            for (local_idx, &det_idx) in person_indices.iter().enumerate() {
                if used_det[local_idx] {
                    continue;
                }
                let iou = compute_iou(&track.predicted_box, &detections[det_idx].bbox);
                if iou > params.iou_threshold && best.map_or(true, |(_, b)| iou > b) {
                    best = Some((local_idx, iou));
                }
            }

            // 3. 匹配成功
            if let Some((local_idx, iou)) = best {
                let det_idx = person_indices[local_idx];
                used_det[local_idx] = true;
                matched_track[track_idx] = true;
                track.update(&detections[det_idx], params.history_length);
                detections[det_idx].tracking_id = Some(track.id);
                debug!(track_id = track.id, iou, "track matched");
            }
        }

        // 5. 未匹配轨迹 → 滑行或失活
        for (track, matched) in self.tracks.iter_mut().zip(&matched_track) {
            if !matched {
                track.coast(params.max_disappear_frames);
            }
        }

        // 4. 未匹配检测 → 新轨迹
        for (local_idx, &det_idx) in person_indices.iter().enumerate() {
            if used_det[local_idx] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            let track = Track::new(id, &detections[det_idx], now, params.history_length);
            detections[det_idx].tracking_id = Some(id);
            debug!(track_id = id, "track created");
            self.tracks.push(track);
        }

        // 6. 删除失活轨迹
        self.tracks.retain(|t| {
            if !t.is_active {
                debug!(track_id = t.id, "track removed");
            }
            t.is_active
        });

        self.tracked_persons()
    }

    /// 当前活跃轨迹快照 (不推进状态)
    pub fn tracked_persons(&self) -> Vec<TrackedPerson> {
        self.tracks.iter().map(TrackedPerson::from).collect()
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// 清除所有轨迹, ID计数不回退
    pub fn reset(&mut self) {
        self.tracks.clear();
    }
}

impl Default for ObjectTracker {
    fn default() -> Self {
        Self::new(TrackerParams::default())
    }
}

// ========== 工具函数 ==========

/// 计算两个边界框的IOU (Intersection over Union)
pub fn compute_iou(bbox1: &BBox, bbox2: &BBox) -> f32 {
    let x1 = bbox1.x.max(bbox2.x);
    let y1 = bbox1.y.max(bbox2.y);
    let x2 = bbox1.x2().min(bbox2.x2());
    let y2 = bbox1.y2().min(bbox2.y2());

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let union = bbox1.area() + bbox2.area() - intersection;

    if union <= 0.0 {
        return 0.0;
    }

    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(x: f32, y: f32) -> Detection {
        Detection::person(BBox::new(x, y, 40.0, 80.0), 0.9)
    }

    #[test]
    fn test_iou_properties() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 5.0, 10.0, 10.0);
        let far = BBox::new(100.0, 100.0, 10.0, 10.0);

        assert!((compute_iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(compute_iou(&a, &far), 0.0);
        assert_eq!(compute_iou(&a, &b), compute_iou(&b, &a));
        assert!((compute_iou(&a, &b) - 25.0 / 175.0).abs() < 1e-6);

        // 边相接不算重叠
        let touching = BBox::new(10.0, 0.0, 10.0, 10.0);
        assert_eq!(compute_iou(&a, &touching), 0.0);
    }

    #[test]
    fn test_same_box_keeps_id() {
        let mut tracker = ObjectTracker::default();
        let now = Instant::now();

        let mut dets = vec![person(100.0, 100.0)];
        let out = tracker.update(&mut dets, now);
        assert_eq!(out.len(), 1);
        let id = out[0].track_id;
        assert_eq!(dets[0].tracking_id, Some(id));

        for i in 1..=5 {
            let mut dets = vec![person(100.0, 100.0)];
            let out = tracker.update(&mut dets, now + Duration::from_millis(100 * i));
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].track_id, id);
            assert_eq!(out[0].frames_since_update, 0);
            assert!(!out[0].is_coasting);
            assert_eq!(dets[0].tracking_id, Some(id));
        }
    }

    #[test]
    fn test_track_expires_after_max_disappear() {
        let params = TrackerParams {
            max_disappear_frames: 5,
            ..Default::default()
        };
        let mut tracker = ObjectTracker::new(params);
        let now = Instant::now();
        tracker.update(&mut [person(100.0, 100.0)], now);

        for _ in 0..5 {
            let out = tracker.update(&mut [], now);
            assert_eq!(out.len(), 1);
            assert!(out[0].is_coasting);
        }
        // 第 max+1 帧仍未匹配 → 删除
        let out = tracker.update(&mut [], now);
        assert!(out.is_empty());
        assert_eq!(tracker.track_count(), 0);
    }

    #[test]
    fn test_match_before_expiry_retains_track() {
        let params = TrackerParams {
            max_disappear_frames: 5,
            ..Default::default()
        };
        let mut tracker = ObjectTracker::new(params);
        let now = Instant::now();
        let id = tracker.update(&mut [person(100.0, 100.0)], now)[0].track_id;

        for _ in 0..5 {
            tracker.update(&mut [], now);
        }
        let out = tracker.update(&mut [person(100.0, 100.0)], now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].track_id, id);
        assert_eq!(out[0].frames_since_update, 0);
    }

    #[test]
    fn test_linear_prediction_and_coasting() {
        let mut tracker = ObjectTracker::default();
        let now = Instant::now();

        tracker.update(&mut [person(100.0, 100.0)], now);
        let out = tracker.update(&mut [person(110.0, 100.0)], now);
        assert_eq!(out[0].predicted_bbox.x, 120.0);

        let out = tracker.update(&mut [person(120.0, 100.0)], now);
        assert_eq!(out[0].bbox.x, 120.0);
        assert_eq!(out[0].predicted_bbox.x, 130.0);

        // 遮挡: 沿速度继续滑行
        let out = tracker.update(&mut [], now);
        assert_eq!(out[0].bbox.x, 130.0);
        assert_eq!(out[0].predicted_bbox.x, 140.0);
        assert_eq!(out[0].frames_since_update, 1);

        // 重新出现在预测位置附近, ID不变
        let id = out[0].track_id;
        let out = tracker.update(&mut [person(141.0, 100.0)], now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].track_id, id);
    }

    #[test]
    fn test_single_point_prediction_is_current_box() {
        let mut tracker = ObjectTracker::default();
        let out = tracker.update(&mut [person(50.0, 60.0)], Instant::now());
        assert_eq!(out[0].predicted_bbox, out[0].bbox);
    }

    #[test]
    fn test_greedy_first_track_wins() {
        let mut tracker = ObjectTracker::default();
        let now = Instant::now();

        let out = tracker.update(&mut [person(100.0, 100.0), person(100.0, 100.0)], now);
        assert_eq!(out.len(), 2);
        let (first, second) = (out[0].track_id, out[1].track_id);
        assert!(first < second);

        let mut dets = vec![person(100.0, 100.0)];
        let out = tracker.update(&mut dets, now);
        assert_eq!(dets[0].tracking_id, Some(first));
        let second_out = out.iter().find(|p| p.track_id == second).unwrap();
        assert!(second_out.is_coasting);
    }

    #[test]
    fn test_assignment_is_deterministic() {
        let frames: Vec<Vec<Detection>> = (0..10)
            .map(|i| {
                let dx = i as f32 * 5.0;
                vec![
                    person(100.0 + dx, 100.0),
                    person(120.0 + dx, 100.0),
                    person(400.0 - dx, 300.0),
                ]
            })
            .collect();

        let run = || {
            let mut tracker = ObjectTracker::default();
            let now = Instant::now();
            frames
                .iter()
                .map(|f| {
                    let mut dets = f.clone();
                    tracker.update(&mut dets, now);
                    dets.iter().map(|d| d.tracking_id).collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn test_non_person_ignored() {
        let mut tracker = ObjectTracker::default();
        let mut dets = vec![
            Detection::from_class_id(2, 0.9, BBox::new(0.0, 0.0, 50.0, 50.0)),
            person(200.0, 200.0),
        ];
        let out = tracker.update(&mut dets, Instant::now());
        assert_eq!(out.len(), 1);
        assert!(dets[0].tracking_id.is_none());
        assert!(dets[1].tracking_id.is_some());
    }

    #[test]
    fn test_ids_never_reused() {
        let params = TrackerParams {
            max_disappear_frames: 0,
            ..Default::default()
        };
        let mut tracker = ObjectTracker::new(params);
        let now = Instant::now();

        let a = tracker.update(&mut [person(0.0, 0.0)], now)[0].track_id;
        assert!(tracker.update(&mut [], now).is_empty());
        let b = tracker.update(&mut [person(0.0, 0.0)], now)[0].track_id;
        tracker.reset();
        let c = tracker.update(&mut [person(0.0, 0.0)], now)[0].track_id;

        assert!(a < b && b < c);
    }

    #[test]
    fn test_history_is_bounded() {
        let params = TrackerParams {
            history_length: 3,
            ..Default::default()
        };
        let mut tracker = ObjectTracker::new(params);
        let now = Instant::now();
        for i in 0..10 {
            tracker.update(&mut [person(100.0 + i as f32, 100.0)], now);
        }
        let track = &tracker.tracks()[0];
        assert_eq!(track.position_history.len(), 3);
        assert_eq!(track.position_history.back().unwrap().x, 129.0);
    }
}
