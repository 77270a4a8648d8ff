//! Local per-pipeline tracker (spec §4.4). Assigns `local_track_id` via
//! greedy IoU matching between detections and existing tracks. The
//! association algorithm is intentionally left open by the spec; this one
//! is a tentative/confirmed/lost state machine, adapted from the teacher's
//! `ByteTracker`.

use std::collections::HashMap;
use vision_common::types::{BBox, Detection, LocalTrack};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackState {
    Tentative,
    Confirmed,
    Lost,
}

#[derive(Debug, Clone)]
struct InternalTrack {
    id: u64,
    bbox: BBox,
    class_id: u32,
    confidence: f32,
    hits: u32,
    age: u32,
    state: TrackState,
    reid: Option<Vec<f32>>,
    last_seen: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub min_hits: u32,
    pub max_idle_age: u32,
    pub iou_threshold: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_hits: 3,
            max_idle_age: 30,
            iou_threshold: 0.3,
        }
    }
}

/// One tracker instance per pipeline; ids it hands out are monotonically
/// increasing for the life of the tracker and never reused, so
/// re-emergence of a previously retired object always gets a fresh id
/// (spec §4.4 invariant iii).
pub struct Tracker {
    pipeline_id: String,
    config: TrackerConfig,
    tracks: Vec<InternalTrack>,
    next_id: u64,
}

impl Tracker {
    pub fn new(pipeline_id: impl Into<String>, config: TrackerConfig) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    /// Advance the tracker by one frame. Returns the confirmed tracks that
    /// were updated this frame, in no particular order.
    pub fn update(&mut self, detections: Vec<Detection>, now: chrono::DateTime<chrono::Utc>) -> Vec<LocalTrack> {
        for track in &mut self.tracks {
            track.age += 1;
        }

        let assignment = greedy_match(&detections, &self.tracks, self.config.iou_threshold);
        let mut matched_det = vec![false; detections.len()];

        for (det_idx, track_idx) in &assignment {
            matched_det[*det_idx] = true;
            let det = &detections[*det_idx];
            let track = &mut self.tracks[*track_idx];
            track.bbox = det.bbox;
            track.class_id = det.class_id;
            track.confidence = det.confidence;
            track.reid = det.reid.clone();
            track.age = 0;
            track.hits += 1;
            track.last_seen = now;
            if track.state == TrackState::Tentative && track.hits >= self.config.min_hits {
                track.state = TrackState::Confirmed;
            }
        }

        for (idx, det) in detections.iter().enumerate() {
            if matched_det[idx] {
                continue;
            }
            self.tracks.push(InternalTrack {
                id: self.next_id,
                bbox: det.bbox,
                class_id: det.class_id,
                confidence: det.confidence,
                hits: 1,
                age: 0,
                state: TrackState::Tentative,
                reid: det.reid.clone(),
                last_seen: now,
            });
            self.next_id += 1;
        }

        for track in &mut self.tracks {
            if track.age > self.config.max_idle_age {
                track.state = TrackState::Lost;
            }
        }
        self.tracks.retain(|t| t.state != TrackState::Lost);

        self.tracks
            .iter()
            .filter(|t| t.state == TrackState::Confirmed && t.age == 0)
            .map(|t| LocalTrack {
                pipeline_id: self.pipeline_id.clone(),
                local_track_id: t.id,
                bbox: t.bbox,
                class_id: t.class_id,
                confidence: t.confidence,
                last_seen: t.last_seen,
                reid: t.reid.clone(),
            })
            .collect()
    }

    pub fn active_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.state == TrackState::Confirmed).count()
    }

    /// Ids of every track still live (tentative or confirmed) after the
    /// most recent `update`, for callers that need to retire per-object
    /// bookkeeping (e.g. the Behavior Analyzer) in step with the tracker.
    pub fn active_track_ids(&self) -> std::collections::HashSet<u64> {
        self.tracks.iter().map(|t| t.id).collect()
    }
}

/// Greedy best-IoU-first assignment between detections and existing
/// tracks, mirroring the teacher's "simplified Hungarian" approach.
fn greedy_match(detections: &[Detection], tracks: &[InternalTrack], iou_threshold: f32) -> Vec<(usize, usize)> {
    if detections.is_empty() || tracks.is_empty() {
        return Vec::new();
    }

    let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
    for (di, det) in detections.iter().enumerate() {
        for (ti, track) in tracks.iter().enumerate() {
            let iou = det.bbox.iou(&track.bbox);
            if iou > iou_threshold {
                pairs.push((iou, di, ti));
            }
        }
    }
    pairs.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut used_dets = vec![false; detections.len()];
    let mut used_tracks = vec![false; tracks.len()];
    let mut assignment = Vec::new();
    for (_, di, ti) in pairs {
        if used_dets[di] || used_tracks[ti] {
            continue;
        }
        used_dets[di] = true;
        used_tracks[ti] = true;
        assignment.push((di, ti));
    }
    assignment
}

/// Registry of per-pipeline trackers, owned by a single `VideoPipeline`
/// (never shared across pipelines — tracker state is pipeline-local).
#[derive(Default)]
pub struct TrackerRegistry {
    by_pipeline: HashMap<String, Tracker>,
}

impl TrackerRegistry {
    pub fn get_or_create(&mut self, pipeline_id: &str, config: TrackerConfig) -> &mut Tracker {
        self.by_pipeline
            .entry(pipeline_id.to_string())
            .or_insert_with(|| Tracker::new(pipeline_id, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn det(x: f32, class_id: u32) -> Detection {
        Detection {
            class_id,
            confidence: 0.9,
            bbox: BBox::new(x, 0.0, 10.0, 10.0),
            reid: None,
        }
    }

    #[test]
    fn ids_are_monotonically_increasing_and_confirmed_after_min_hits() {
        let mut tracker = Tracker::new("cam-1", TrackerConfig { min_hits: 2, max_idle_age: 5, iou_threshold: 0.3 });
        let now = Utc::now();
        let first = tracker.update(vec![det(0.0, 0)], now);
        assert!(first.is_empty()); // tentative, not yet confirmed
        let second = tracker.update(vec![det(0.5, 0)], now);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].local_track_id, 1);
    }

    #[test]
    fn retired_track_reemerging_gets_a_new_id() {
        let mut tracker = Tracker::new("cam-1", TrackerConfig { min_hits: 1, max_idle_age: 1, iou_threshold: 0.3 });
        let now = Utc::now();
        let confirmed = tracker.update(vec![det(0.0, 0)], now);
        assert_eq!(confirmed[0].local_track_id, 1);

        // two empty frames exceed max_idle_age=1, retiring the track.
        tracker.update(vec![], now);
        tracker.update(vec![], now);

        let reemerged = tracker.update(vec![det(0.0, 0)], now);
        assert_eq!(reemerged[0].local_track_id, 2);
    }

    #[test]
    fn greedy_match_prefers_highest_iou() {
        let tracks = vec![
            InternalTrack {
                id: 1,
                bbox: BBox::new(0.0, 0.0, 10.0, 10.0),
                class_id: 0,
                confidence: 0.9,
                hits: 1,
                age: 0,
                state: TrackState::Confirmed,
                reid: None,
                last_seen: Utc::now(),
            },
            InternalTrack {
                id: 2,
                bbox: BBox::new(100.0, 100.0, 10.0, 10.0),
                class_id: 0,
                confidence: 0.9,
                hits: 1,
                age: 0,
                state: TrackState::Confirmed,
                reid: None,
                last_seen: Utc::now(),
            },
        ];
        let detections = vec![det(1.0, 0)];
        let assignment = greedy_match(&detections, &tracks, 0.1);
        assert_eq!(assignment, vec![(0, 0)]);
    }
}
