use std::collections::BTreeMap;

use super::object::{BoundingBox, ClassLabel, Detection};

const VELOCITY_SMOOTHING: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct Track {
    pub track_id: u64,
    pub class_label: ClassLabel,
    pub last_box: BoundingBox,
    pub confidence: f32,
    pub last_seen_frame_index: u64,
    /// Frames since the track was created.
    pub age: u64,
    missed: u32,
    velocity: (f32, f32),
}

impl Track {
    /// Frames elapsed since the last observation, counting the current one.
    fn steps(&self) -> f32 {
        (self.missed + 1) as f32
    }

    /// Constant-velocity position for the current frame.
    fn predicted_box(&self) -> BoundingBox {
        let steps = self.steps();
        self.last_box
            .translated(self.velocity.0 * steps, self.velocity.1 * steps)
    }

    fn observe(&mut self, detection: &Detection, frame_index: u64) {
        let steps = self.steps();
        let (old_cx, old_cy) = self.last_box.center();
        let (new_cx, new_cy) = detection.bbox.center();
        let (dx, dy) = ((new_cx - old_cx) / steps, (new_cy - old_cy) / steps);
        self.velocity = (
            VELOCITY_SMOOTHING * self.velocity.0 + (1.0 - VELOCITY_SMOOTHING) * dx,
            VELOCITY_SMOOTHING * self.velocity.1 + (1.0 - VELOCITY_SMOOTHING) * dy,
        );
        self.last_box = detection.bbox;
        self.confidence = detection.confidence;
        self.last_seen_frame_index = frame_index;
        self.missed = 0;
    }
}

/// A track matched or spawned in the current frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedObject {
    pub track_id: u64,
    pub class_label: ClassLabel,
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Greedy IoU tracker. Association never crosses class boundaries.
pub struct Tracker {
    tracks: BTreeMap<u64, Track>,
    next_id: u64,
    frame_index: u64,
    iou_threshold: f32,
    max_missed: u32,
}

impl Tracker {
    pub fn new(iou_threshold: f32, max_missed: u32) -> Self {
        Self {
            tracks: BTreeMap::new(),
            next_id: 1,
            frame_index: 0,
            iou_threshold,
            max_missed,
        }
    }

    pub fn live_tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn update(&mut self, detections: &[Detection]) -> Vec<TrackedObject> {
        self.frame_index += 1;
        let frame_index = self.frame_index;

        for track in self.tracks.values_mut() {
            track.age += 1;
        }

        let matches = self.associate(detections);
        let mut matched_det = vec![false; detections.len()];
        let mut visible = Vec::with_capacity(detections.len());

        for &(det_idx, track_id) in &matches {
            matched_det[det_idx] = true;
            if let Some(track) = self.tracks.get_mut(&track_id) {
                track.observe(&detections[det_idx], frame_index);
                visible.push(TrackedObject {
                    track_id,
                    class_label: track.class_label,
                    bbox: track.last_box,
                    confidence: track.confidence,
                });
            }
        }

        let max_missed = self.max_missed;
        self.tracks.retain(|id, track| {
            if track.last_seen_frame_index == frame_index {
                return true;
            }
            track.missed += 1;
            if track.missed > max_missed {
                tracing::trace!(track = id, class = track.class_label.as_str(), "track evicted");
                return false;
            }
            true
        });

        for (i, det) in detections.iter().enumerate() {
            if matched_det[i] {
                continue;
            }
            let track_id = self.next_id;
            self.next_id += 1;
            self.tracks.insert(
                track_id,
                Track {
                    track_id,
                    class_label: det.class_label,
                    last_box: det.bbox,
                    confidence: det.confidence,
                    last_seen_frame_index: frame_index,
                    age: 0,
                    missed: 0,
                    velocity: (0.0, 0.0),
                },
            );
            visible.push(TrackedObject {
                track_id,
                class_label: det.class_label,
                bbox: det.bbox,
                confidence: det.confidence,
            });
        }

        visible
    }

    /// Repeatedly takes the best remaining (detection, track) pair of the same
    /// class until no pair clears the IoU threshold.
    fn associate(&self, detections: &[Detection]) -> Vec<(usize, u64)> {
        let mut candidates: Vec<(f32, usize, u64)> = Vec::new();
        for (i, det) in detections.iter().enumerate() {
            for (id, track) in &self.tracks {
                if track.class_label != det.class_label {
                    continue;
                }
                let iou = det.bbox.iou(&track.predicted_box());
                if iou >= self.iou_threshold && iou > 0.0 {
                    candidates.push((iou, i, *id));
                }
            }
        }

        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut used_det = vec![false; detections.len()];
        let mut used_track = std::collections::HashSet::new();
        let mut matches = Vec::new();
        for (_, det_idx, track_id) in candidates {
            if used_det[det_idx] || used_track.contains(&track_id) {
                continue;
            }
            used_det[det_idx] = true;
            used_track.insert(track_id);
            matches.push((det_idx, track_id));
        }
        matches
    }
}
