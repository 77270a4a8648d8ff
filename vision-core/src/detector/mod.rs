//! Detector Pool (spec §4.3): parallel, accelerator-backed inference with
//! per-worker context affinity, bounded queueing, and category filtering.

pub mod context;
pub mod pool;
pub mod postprocess;
pub mod preprocess;

pub use context::{ExecutionProvider, InferenceContext, OrtInferenceContext};
pub use pool::{ContextFactory, DetectTask, DetectorPool, DetectorPoolConfig};
pub use postprocess::{NmsMode, PostprocessConfig, RawCandidate};
pub use preprocess::{ChannelOrder, LetterboxTransform, TensorElementKind};
