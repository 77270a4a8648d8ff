//! Behavior/ROI Analyzer: intrusion and loitering rule evaluation over a
//! per-source set of named polygon ROIs, generalized from the teacher's
//! fixed entrance/checkout `Zone`/`ZoneCounter` pair into a runtime-
//! configurable, time-windowed ROI set.

use std::collections::HashMap;

use chrono::{DateTime, Timelike, Utc};
use vision_common::roi_geom::contains_point;
use vision_common::types::{Roi, RoiRule};

/// One behavior violation raised by the analyzer for a single object
/// against a single ROI.
#[derive(Debug, Clone)]
pub struct BehaviorEvent {
    pub roi_id: String,
    pub source_id: String,
    pub object_id: u64,
    pub rule: RoiRule,
    pub triggered_at: DateTime<Utc>,
}

struct DwellState {
    entered_at: DateTime<Utc>,
    last_alerted: Option<DateTime<Utc>>,
}

/// Per-source ROI evaluator. One instance per `VideoPipeline`.
pub struct BehaviorAnalyzer {
    rois: Vec<Roi>,
    /// `(roi_id, object_id) -> was the object inside on the previous frame`
    presence: HashMap<(String, u64), bool>,
    /// `(roi_id, object_id) -> dwell bookkeeping`, only populated for
    /// loitering rules.
    dwell: HashMap<(String, u64), DwellState>,
    /// cooldown so a standing violation does not re-fire every frame.
    cooldown: chrono::Duration,
    last_fired: HashMap<(String, u64), DateTime<Utc>>,
}

impl BehaviorAnalyzer {
    pub fn new(rois: Vec<Roi>, cooldown: chrono::Duration) -> Self {
        Self {
            rois,
            presence: HashMap::new(),
            dwell: HashMap::new(),
            cooldown,
            last_fired: HashMap::new(),
        }
    }

    pub fn set_rois(&mut self, rois: Vec<Roi>) {
        self.rois = rois;
    }

    /// Evaluate one object's center point against every enabled, currently
    /// time-windowed ROI for this source. Returns events for rules that
    /// fired and are not within their per-`(roi, object)` cooldown window.
    pub fn evaluate(&mut self, source_id: &str, object_id: u64, center: (f32, f32), now: DateTime<Utc>) -> Vec<BehaviorEvent> {
        let minute_of_day = (now.time().hour() * 60 + now.time().minute()) as u16;
        let mut events = Vec::new();

        for roi in &self.rois {
            if roi.source_id != source_id || !roi.enabled {
                continue;
            }
            if !time_window_active(roi, minute_of_day) {
                continue;
            }

            let key = (roi.id.clone(), object_id);
            let inside = contains_point(&roi.polygon, center.0, center.1);
            let was_inside = self.presence.get(&key).copied().unwrap_or(false);
            self.presence.insert(key.clone(), inside);

            match roi.rule {
                RoiRule::Intrusion => {
                    if inside && !was_inside && self.past_cooldown(&key, now) {
                        self.last_fired.insert(key.clone(), now);
                        events.push(BehaviorEvent {
                            roi_id: roi.id.clone(),
                            source_id: source_id.to_string(),
                            object_id,
                            rule: roi.rule,
                            triggered_at: now,
                        });
                    }
                }
                RoiRule::Loitering { dwell_seconds } => {
                    if inside {
                        let state = self.dwell.entry(key.clone()).or_insert(DwellState {
                            entered_at: now,
                            last_alerted: None,
                        });
                        let dwell_elapsed = now - state.entered_at;
                        if dwell_elapsed.num_seconds() >= dwell_seconds as i64 && self.past_cooldown(&key, now) {
                            state.last_alerted = Some(now);
                            self.last_fired.insert(key.clone(), now);
                            events.push(BehaviorEvent {
                                roi_id: roi.id.clone(),
                                source_id: source_id.to_string(),
                                object_id,
                                rule: roi.rule,
                                triggered_at: now,
                            });
                        }
                    } else {
                        self.dwell.remove(&key);
                    }
                }
            }
        }

        events
    }

    /// Drop bookkeeping for objects no longer tracked, e.g. after the
    /// local tracker retires them.
    pub fn retain_objects(&mut self, active_object_ids: &std::collections::HashSet<u64>) {
        self.presence.retain(|(_, obj), _| active_object_ids.contains(obj));
        self.dwell.retain(|(_, obj), _| active_object_ids.contains(obj));
        self.last_fired.retain(|(_, obj), _| active_object_ids.contains(obj));
    }

    fn past_cooldown(&self, key: &(String, u64), now: DateTime<Utc>) -> bool {
        match self.last_fired.get(key) {
            Some(last) => now - *last >= self.cooldown,
            None => true,
        }
    }
}

fn time_window_active(roi: &Roi, minute_of_day: u16) -> bool {
    match (roi.start_minute, roi.end_minute) {
        (Some(start), Some(end)) if start <= end => (start..=end).contains(&minute_of_day),
        // window wraps past midnight, e.g. 22:00-06:00.
        (Some(start), Some(end)) => minute_of_day >= start || minute_of_day <= end,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn square_roi(id: &str, rule: RoiRule) -> Roi {
        Roi {
            id: id.to_string(),
            source_id: "cam-1".into(),
            name: id.to_string(),
            polygon: vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)],
            enabled: true,
            rule,
            start_minute: None,
            end_minute: None,
        }
    }

    #[test]
    fn intrusion_fires_once_on_entry_then_respects_cooldown() {
        let mut analyzer = BehaviorAnalyzer::new(vec![square_roi("roi-1", RoiRule::Intrusion)], Duration::seconds(60));
        let t0 = Utc::now();
        let outside = analyzer.evaluate("cam-1", 1, (-5.0, -5.0), t0);
        assert!(outside.is_empty());

        let entered = analyzer.evaluate("cam-1", 1, (5.0, 5.0), t0);
        assert_eq!(entered.len(), 1);

        // staying inside should not refire immediately.
        let still_inside = analyzer.evaluate("cam-1", 1, (5.0, 5.0), t0 + Duration::seconds(1));
        assert!(still_inside.is_empty());
    }

    #[test]
    fn loitering_fires_after_dwell_threshold() {
        let mut analyzer = BehaviorAnalyzer::new(
            vec![square_roi("roi-1", RoiRule::Loitering { dwell_seconds: 10 })],
            Duration::seconds(60),
        );
        let t0 = Utc::now();
        let early = analyzer.evaluate("cam-1", 1, (5.0, 5.0), t0);
        assert!(early.is_empty());

        let late = analyzer.evaluate("cam-1", 1, (5.0, 5.0), t0 + Duration::seconds(11));
        assert_eq!(late.len(), 1);
    }

    #[test]
    fn leaving_the_roi_resets_dwell_tracking() {
        let mut analyzer = BehaviorAnalyzer::new(
            vec![square_roi("roi-1", RoiRule::Loitering { dwell_seconds: 10 })],
            Duration::seconds(60),
        );
        let t0 = Utc::now();
        analyzer.evaluate("cam-1", 1, (5.0, 5.0), t0);
        analyzer.evaluate("cam-1", 1, (-5.0, -5.0), t0 + Duration::seconds(5));
        let after_reentry = analyzer.evaluate("cam-1", 1, (5.0, 5.0), t0 + Duration::seconds(12));
        assert!(after_reentry.is_empty()); // only 7s dwell since re-entry
    }
}
