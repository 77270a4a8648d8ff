//! Inference contexts (spec §4.3). Each detector worker owns exactly one
//! context for its lifetime; contexts are never shared across threads —
//! accelerator sessions in this codebase are not `Sync` in the way a naive
//! `Arc<Mutex<Session>>` would suggest, and serializing access through a
//! mutex defeats the point of a worker pool.

use ndarray::Array4;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use vision_common::{Result, VisionError};

use crate::detector::postprocess::RawCandidate;

/// Output tensor shape convention: `[1, num_candidates, 4 + 1 + num_classes]`
/// (center-x, center-y, width, height, objectness, per-class scores), the
/// common YOLO-family export layout.
pub trait InferenceContext: Send {
    /// Run one forward pass and decode raw candidates. Does not apply
    /// confidence thresholding or NMS — see `detector::postprocess`.
    fn infer(&mut self, input: &Array4<f32>) -> Result<Vec<RawCandidate>>;

    /// Human-readable identity for logging/quarantine messages.
    fn name(&self) -> &str;
}

/// Which accelerator backend to request from onnxruntime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Cpu,
    Cuda,
}

pub struct OrtInferenceContext {
    session: Session,
    name: String,
    num_classes: usize,
}

impl OrtInferenceContext {
    pub fn load(model_path: &str, provider: ExecutionProvider, num_classes: usize) -> Result<Self> {
        let session = match provider {
            ExecutionProvider::Cpu => SessionBuilderExt::cpu(),
            ExecutionProvider::Cuda => SessionBuilderExt::cuda(),
        }
        .map_err(|e| VisionError::Fatal(format!("failed to configure execution provider: {e}")))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| VisionError::Fatal(format!("failed to set optimization level: {e}")))?
        .commit_from_file(model_path)
        .map_err(|e| VisionError::Fatal(format!("failed to load model {model_path}: {e}")))?;

        Ok(Self {
            session,
            name: model_path.to_string(),
            num_classes,
        })
    }
}

/// Thin indirection so `OrtInferenceContext::load` reads the same regardless
/// of which execution provider was requested, mirroring the CPU/CUDA branch
/// in the teacher's CLI entry point.
struct SessionBuilderExt;

impl SessionBuilderExt {
    fn cpu() -> ort::Result<ort::session::builder::SessionBuilder> {
        use ort::execution_providers::CPUExecutionProvider;
        ort::session::builder::SessionBuilder::new()?.with_execution_providers([CPUExecutionProvider::default().build()])
    }

    fn cuda() -> ort::Result<ort::session::builder::SessionBuilder> {
        use ort::execution_providers::CUDAExecutionProvider;
        ort::session::builder::SessionBuilder::new()?.with_execution_providers([CUDAExecutionProvider::default().build()])
    }
}

impl InferenceContext for OrtInferenceContext {
    fn infer(&mut self, input: &Array4<f32>) -> Result<Vec<RawCandidate>> {
        let input_value = ort::value::Value::from_array(input.clone())
            .map_err(|e| VisionError::Inference(format!("failed to build input tensor: {e}")))?;

        let input_name = self
            .session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| VisionError::Inference("model exposes no inputs".into()))?;

        let outputs = self
            .session
            .run(ort::inputs![input_name => input_value])
            .map_err(|e| VisionError::Inference(format!("onnxruntime run failed: {e}")))?;

        let output_name = self
            .session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| VisionError::Inference("model exposes no outputs".into()))?;

        let (shape, data) = outputs[output_name.as_str()]
            .try_extract_raw_tensor::<f32>()
            .map_err(|e| VisionError::Inference(format!("failed to extract output tensor: {e}")))?;

        decode_yolo_output(shape, data, self.num_classes)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Decodes a `[1, num_candidates, 4 + 1 + num_classes]` YOLO-style output
/// tensor into raw candidates, folding objectness into each class score.
fn decode_yolo_output(shape: &[i64], data: &[f32], num_classes: usize) -> Result<Vec<RawCandidate>> {
    if shape.len() != 3 {
        return Err(VisionError::Inference(format!("unexpected output rank: {shape:?}")));
    }
    let num_candidates = shape[1] as usize;
    let stride = shape[2] as usize;
    if stride != 4 + 1 + num_classes {
        return Err(VisionError::Inference(format!(
            "output stride {stride} does not match 4 + 1 + {num_classes} classes"
        )));
    }

    let mut candidates = Vec::with_capacity(num_candidates);
    for i in 0..num_candidates {
        let base = i * stride;
        let row = &data[base..base + stride];
        let (cx, cy, w, h, objectness) = (row[0], row[1], row[2], row[3], row[4]);
        let (best_class, best_score) = row[5..]
            .iter()
            .enumerate()
            .fold((0usize, 0.0f32), |(bi, bs), (i, &s)| if s > bs { (i, s) } else { (bi, bs) });

        candidates.push(RawCandidate {
            class_id: best_class as u32,
            confidence: objectness * best_score,
            cx,
            cy,
            w,
            h,
        });
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_picks_highest_scoring_class() {
        // one candidate, 2 classes: objectness 0.9, class scores [0.1, 0.8]
        let row = [10.0, 10.0, 20.0, 20.0, 0.9, 0.1, 0.8];
        let shape = [1, 1, 7];
        let out = decode_yolo_output(&shape, &row, 2).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_id, 1);
        assert!((out[0].confidence - 0.72).abs() < 1e-5);
    }

    #[test]
    fn decode_rejects_mismatched_stride() {
        let row = [0.0; 6];
        let shape = [1, 1, 6];
        assert!(decode_yolo_output(&shape, &row, 2).is_err());
    }
}
