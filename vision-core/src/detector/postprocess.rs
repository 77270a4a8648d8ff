//! Postprocessing (spec §4.3): decode raw model outputs into detections,
//! apply confidence threshold, apply NMS, rescale boxes out of letterbox
//! space, apply the runtime category filter.

use crate::category_filter::CategoryFilter;
use crate::detector::preprocess::LetterboxTransform;
use vision_common::types::{BBox, Detection};

/// One raw candidate decoded straight out of the model's output tensor,
/// still in letterbox-space pixel coordinates.
#[derive(Debug, Clone, Copy)]
pub struct RawCandidate {
    pub class_id: u32,
    pub confidence: f32,
    /// center-x, center-y, width, height, all in letterbox pixel space.
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

#[derive(Debug, Clone, Copy)]
pub enum NmsMode {
    ClassAgnostic,
    PerClass,
}

#[derive(Debug, Clone, Copy)]
pub struct PostprocessConfig {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub nms_mode: NmsMode,
    pub max_detections: usize,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            iou_threshold: 0.45,
            nms_mode: NmsMode::PerClass,
            max_detections: 300,
        }
    }
}

fn to_bbox(c: &RawCandidate) -> BBox {
    BBox::new(c.cx - c.w / 2.0, c.cy - c.h / 2.0, c.w, c.h)
}

/// Greedy NMS: sort by confidence descending, keep a box only if its IoU
/// against every already-kept (same-class, if per-class) box is below the
/// threshold.
fn non_max_suppression(mut candidates: Vec<RawCandidate>, config: &PostprocessConfig) -> Vec<RawCandidate> {
    candidates.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));

    let mut kept: Vec<RawCandidate> = Vec::new();
    for candidate in candidates {
        let box_a = to_bbox(&candidate);
        let suppressed = kept.iter().any(|k| {
            let same_class = matches!(config.nms_mode, NmsMode::ClassAgnostic) || k.class_id == candidate.class_id;
            same_class && box_a.iou(&to_bbox(k)) > config.iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
            if kept.len() >= config.max_detections {
                break;
            }
        }
    }
    kept
}

/// Full postprocessing pipeline: threshold, NMS, rescale out of letterbox
/// space, category filter. Returns detections in original-frame pixel
/// coordinates.
pub fn postprocess(
    raw: Vec<RawCandidate>,
    transform: &LetterboxTransform,
    config: &PostprocessConfig,
    category_filter: &CategoryFilter,
) -> Vec<Detection> {
    let thresholded: Vec<RawCandidate> = raw
        .into_iter()
        .filter(|c| c.confidence >= config.confidence_threshold)
        .filter(|c| category_filter.is_enabled(c.class_id))
        .collect();

    let kept = non_max_suppression(thresholded, config);

    kept.into_iter()
        .map(|c| {
            let (x, y, w, h) = transform.unletterbox(c.cx - c.w / 2.0, c.cy - c.h / 2.0, c.w, c.h);
            Detection {
                class_id: c.class_id,
                confidence: c.confidence,
                bbox: BBox::new(
                    x.max(0.0),
                    y.max(0.0),
                    w.min(transform.src_width as f32),
                    h.min(transform.src_height as f32),
                ),
                reid: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_transform() -> LetterboxTransform {
        LetterboxTransform {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
            src_width: 640,
            src_height: 480,
        }
    }

    #[test]
    fn confidence_threshold_filters_low_scores() {
        let candidates = vec![RawCandidate {
            class_id: 0,
            confidence: 0.1,
            cx: 100.0,
            cy: 100.0,
            w: 20.0,
            h: 20.0,
        }];
        let config = PostprocessConfig::default();
        let filter = CategoryFilter::allow_all();
        let out = postprocess(candidates, &identity_transform(), &config, &filter);
        assert!(out.is_empty());
    }

    #[test]
    fn nms_removes_heavily_overlapping_duplicate() {
        let candidates = vec![
            RawCandidate {
                class_id: 0,
                confidence: 0.9,
                cx: 100.0,
                cy: 100.0,
                w: 40.0,
                h: 40.0,
            },
            RawCandidate {
                class_id: 0,
                confidence: 0.8,
                cx: 102.0,
                cy: 101.0,
                w: 40.0,
                h: 40.0,
            },
        ];
        let config = PostprocessConfig::default();
        let filter = CategoryFilter::allow_all();
        let out = postprocess(candidates, &identity_transform(), &config, &filter);
        assert_eq!(out.len(), 1);
        assert!((out[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn category_filter_excludes_disabled_class() {
        let candidates = vec![RawCandidate {
            class_id: 5,
            confidence: 0.9,
            cx: 100.0,
            cy: 100.0,
            w: 20.0,
            h: 20.0,
        }];
        let config = PostprocessConfig::default();
        let filter = CategoryFilter::new([0]);
        let out = postprocess(candidates, &identity_transform(), &config, &filter);
        assert!(out.is_empty());
    }
}
