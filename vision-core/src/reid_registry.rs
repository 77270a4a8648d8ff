//! Cross-Camera ReID Registry (spec §4.5). Hierarchy level 2 — may be
//! acquired while holding the Port Allocator's lock (level 1) but never
//! while holding Task Manager (level 3) or above.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use vision_common::reid::{cosine_similarity, ema_blend};
use vision_common::types::{BBox, GlobalTrack, ReidVector};

use crate::locking::{self, LockLevel};

const EMA_ALPHA: f32 = 0.3;

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub cross_camera_matching_enabled: bool,
    pub similarity_threshold: f32,
    pub max_track_age: Duration,
    pub cleanup_trigger_ratio: f32,
    pub capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cross_camera_matching_enabled: true,
            similarity_threshold: 0.7,
            max_track_age: Duration::seconds(30),
            cleanup_trigger_ratio: 0.8,
            capacity: 10_000,
        }
    }
}

struct Inner {
    tracks: HashMap<u64, GlobalTrack>,
    index: HashMap<(String, u64), u64>,
    next_id: u64,
    cross_camera_matches: u64,
}

pub struct CrossCameraRegistry {
    config: RegistryConfig,
    inner: std::sync::Mutex<Inner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    UpdatedExisting,
    MatchedCrossCamera,
    CreatedNew,
}

impl CrossCameraRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            inner: std::sync::Mutex::new(Inner {
                tracks: HashMap::new(),
                index: HashMap::new(),
                next_id: 1,
                cross_camera_matches: 0,
            }),
        }
    }

    /// Report a local track's observation. Implements the three-step
    /// matching algorithm exactly: existing index hit, then cross-camera
    /// similarity match, then new global track.
    #[allow(clippy::too_many_arguments)]
    pub fn report(
        &self,
        source_id: &str,
        local_id: u64,
        features: ReidVector,
        bbox: BBox,
        class_id: u32,
        confidence: f32,
        now: DateTime<Utc>,
    ) -> (u64, ReportOutcome) {
        let _guard = locking::enter(LockLevel::CrossCameraRegistry);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let key = (source_id.to_string(), local_id);
        if let Some(&global_id) = inner.index.get(&key) {
            if let Some(track) = inner.tracks.get_mut(&global_id) {
                ema_blend(&mut track.canonical_reid, &features, EMA_ALPHA);
                track.bbox = bbox;
                track.confidence = confidence;
                track.last_seen = now;
                return (global_id, ReportOutcome::UpdatedExisting);
            }
        }

        if self.config.cross_camera_matching_enabled {
            let mut best: Option<(u64, f32)> = None;
            for (&global_id, track) in inner.tracks.iter() {
                if !track.active {
                    continue;
                }
                if track.members.contains_key(source_id) {
                    continue;
                }
                let age = now - track.last_seen;
                if age > self.config.max_track_age {
                    continue;
                }
                let sim = cosine_similarity(&track.canonical_reid, &features);
                if sim >= self.config.similarity_threshold {
                    if best.map(|(_, best_sim)| sim > best_sim).unwrap_or(true) {
                        best = Some((global_id, sim));
                    }
                }
            }

            if let Some((global_id, _)) = best {
                if let Some(track) = inner.tracks.get_mut(&global_id) {
                    track.members.insert(source_id.to_string(), local_id);
                    ema_blend(&mut track.canonical_reid, &features, EMA_ALPHA);
                    track.bbox = bbox;
                    track.confidence = confidence;
                    track.last_seen = now;
                }
                inner.index.insert(key, global_id);
                inner.cross_camera_matches += 1;
                self.maybe_cleanup(&mut inner, now);
                return (global_id, ReportOutcome::MatchedCrossCamera);
            }
        }

        let global_id = inner.next_id;
        inner.next_id += 1;
        let mut members = std::collections::BTreeMap::new();
        members.insert(source_id.to_string(), local_id);
        inner.tracks.insert(
            global_id,
            GlobalTrack {
                global_id,
                members,
                canonical_reid: features,
                bbox,
                class_id,
                confidence,
                first_seen: now,
                last_seen: now,
                active: true,
            },
        );
        inner.index.insert(key, global_id);
        self.maybe_cleanup(&mut inner, now);
        (global_id, ReportOutcome::CreatedNew)
    }

    /// Remove expired global tracks. Called opportunistically on `report`
    /// once the registry crosses `cleanup_trigger_ratio` of capacity, and
    /// unconditionally by the Task Manager's 1 Hz tick.
    pub fn expire(&self, now: DateTime<Utc>) -> usize {
        let _guard = locking::enter(LockLevel::CrossCameraRegistry);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.do_expire(&mut inner, now)
    }

    fn maybe_cleanup(&self, inner: &mut Inner, now: DateTime<Utc>) {
        let trigger = (self.config.capacity as f32 * self.config.cleanup_trigger_ratio) as usize;
        if inner.tracks.len() > trigger {
            self.do_expire(inner, now);
        }
    }

    fn do_expire(&self, inner: &mut Inner, now: DateTime<Utc>) -> usize {
        let expired: Vec<u64> = inner
            .tracks
            .iter()
            .filter(|(_, t)| now - t.last_seen > self.config.max_track_age)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            inner.tracks.remove(id);
        }
        inner.index.retain(|_, global_id| !expired.contains(global_id));
        expired.len()
    }

    pub fn cross_camera_matches(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).cross_camera_matches
    }

    pub fn track_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).tracks.len()
    }

    pub fn get(&self, global_id: u64) -> Option<GlobalTrack> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).tracks.get(&global_id).cloned()
    }

    /// Look up the global id currently assigned to a `(source_id, local_id)`
    /// pair, without recording a new observation.
    pub fn global_id_for(&self, source_id: &str, local_id: u64) -> Option<u64> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.index.get(&(source_id.to_string(), local_id)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox() -> BBox {
        BBox::new(0.0, 0.0, 10.0, 10.0)
    }

    #[test]
    fn same_source_and_local_id_updates_existing_track() {
        let registry = CrossCameraRegistry::new(RegistryConfig::default());
        let now = Utc::now();
        let (id1, outcome1) = registry.report("cam-1", 1, vec![1.0, 0.0], bbox(), 0, 0.9, now);
        assert_eq!(outcome1, ReportOutcome::CreatedNew);
        let (id2, outcome2) = registry.report("cam-1", 1, vec![1.0, 0.0], bbox(), 0, 0.95, now);
        assert_eq!(id1, id2);
        assert_eq!(outcome2, ReportOutcome::UpdatedExisting);
    }

    #[test]
    fn similar_features_from_a_different_camera_cross_match() {
        let registry = CrossCameraRegistry::new(RegistryConfig::default());
        let now = Utc::now();
        let (id1, _) = registry.report("cam-1", 1, vec![1.0, 0.0], bbox(), 0, 0.9, now);
        let (id2, outcome) = registry.report("cam-2", 9, vec![0.99, 0.01], bbox(), 0, 0.9, now);
        assert_eq!(id1, id2);
        assert_eq!(outcome, ReportOutcome::MatchedCrossCamera);
        assert_eq!(registry.cross_camera_matches(), 1);
    }

    #[test]
    fn dissimilar_features_create_a_new_global_track() {
        let registry = CrossCameraRegistry::new(RegistryConfig::default());
        let now = Utc::now();
        let (id1, _) = registry.report("cam-1", 1, vec![1.0, 0.0], bbox(), 0, 0.9, now);
        let (id2, outcome) = registry.report("cam-2", 9, vec![0.0, 1.0], bbox(), 0, 0.9, now);
        assert_ne!(id1, id2);
        assert_eq!(outcome, ReportOutcome::CreatedNew);
    }

    #[test]
    fn expired_tracks_are_removed() {
        let registry = CrossCameraRegistry::new(RegistryConfig {
            max_track_age: Duration::seconds(10),
            ..RegistryConfig::default()
        });
        let t0 = Utc::now();
        registry.report("cam-1", 1, vec![1.0, 0.0], bbox(), 0, 0.9, t0);
        assert_eq!(registry.track_count(), 1);
        let later = t0 + Duration::seconds(20);
        let removed = registry.expire(later);
        assert_eq!(removed, 1);
        assert_eq!(registry.track_count(), 0);
    }
}
