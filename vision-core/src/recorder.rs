//! Recorder: pre-/post-event circular buffer plus event-triggered MP4
//! export, generalized from `video_clip.rs`'s `VideoBuffer`/
//! `VideoClipExtractor` (fixed entrance-zone clip requests) into a
//! per-pipeline ring keyed purely by timestamp, driven by any Event rather
//! than POS-specific triggers.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use tracing::{error, info, warn};
use uuid::Uuid;

const MAX_CLIP_DURATION_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct FrameData {
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Fixed-duration ring of recent frames. Overflow overwrites the oldest
/// slot (spec §4.2 backpressure policy: "overwrites the oldest slot in
/// Recorder's pre-event ring").
pub struct PreEventRing {
    frames: Mutex<VecDeque<FrameData>>,
    max_duration: Duration,
    source_id: String,
}

impl PreEventRing {
    pub fn new(source_id: impl Into<String>, buffer_duration_secs: i64) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            max_duration: Duration::seconds(buffer_duration_secs),
            source_id: source_id.into(),
        }
    }

    pub fn push(&self, frame: FrameData) {
        let mut frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        frames.push_back(frame);
        let cutoff = Utc::now() - self.max_duration;
        while let Some(front) = frames.front() {
            if front.timestamp < cutoff {
                frames.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn extract(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<FrameData> {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|f| f.timestamp >= start && f.timestamp <= end)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Recording {
    pub id: Uuid,
    pub source_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub file_path: PathBuf,
    pub size_bytes: u64,
}

/// Owns one pre-event ring per source and performs the actual post-event
/// recording: a fixed window before the triggering event plus whatever
/// live frames arrive up to `duration_after_secs`.
pub struct Recorder {
    ring: Arc<PreEventRing>,
    output_dir: PathBuf,
}

impl Recorder {
    pub fn new(source_id: impl Into<String>, output_dir: PathBuf, pre_event_seconds: i64) -> Self {
        Self {
            ring: Arc::new(PreEventRing::new(source_id, pre_event_seconds)),
            output_dir,
        }
    }

    pub fn ring(&self) -> Arc<PreEventRing> {
        Arc::clone(&self.ring)
    }

    pub fn push_frame(&self, frame: FrameData) {
        self.ring.push(frame);
    }

    /// Export a window `[event_time - before, event_time + after]` to MP4.
    /// `post_event_frames` carries any frames captured after the event
    /// that arrived through the live pipeline rather than the ring (the
    /// ring only guarantees *pre*-event coverage).
    pub fn export_clip(
        &self,
        event_id: Uuid,
        event_time: DateTime<Utc>,
        before_secs: i64,
        after_secs: i64,
        post_event_frames: Vec<FrameData>,
    ) -> anyhow::Result<Recording> {
        let start_time = event_time - Duration::seconds(before_secs);
        let end_time = event_time + Duration::seconds(after_secs);
        let total_duration = (end_time - start_time).num_seconds();
        if total_duration > MAX_CLIP_DURATION_SECS {
            warn!(total_duration, "clip duration exceeds maximum, truncating source frame set only");
        }

        let mut frames = self.ring.extract(start_time, event_time);
        frames.extend(post_event_frames.into_iter().filter(|f| f.timestamp <= end_time));
        frames.sort_by_key(|f| f.timestamp);

        if frames.is_empty() {
            anyhow::bail!("no frames found in requested time range for event {event_id}");
        }

        let clip_path = self.clip_path(event_id, event_time)?;
        let size_bytes = encode_clip(&frames, &clip_path)?;

        Ok(Recording {
            id: event_id,
            source_id: self.ring.source_id.clone(),
            start_time,
            end_time,
            file_path: clip_path,
            size_bytes,
        })
    }

    fn clip_path(&self, event_id: Uuid, event_time: DateTime<Utc>) -> anyhow::Result<PathBuf> {
        let date_dir = event_time.format("%Y%m%d").to_string();
        let clip_dir = self.output_dir.join(&self.ring.source_id).join(date_dir);
        std::fs::create_dir_all(&clip_dir)?;
        let filename = format!("{}_{}.mp4", event_time.format("%H%M%S"), &event_id.to_string()[..8]);
        Ok(clip_dir.join(filename))
    }
}

/// Mux a sequence of raw RGB frames into an MP4 via a GStreamer
/// `appsrc ! videoconvert ! x264enc ! mp4mux ! filesink` pipeline.
fn encode_clip(frames: &[FrameData], path: &Path) -> anyhow::Result<u64> {
    let first = &frames[0];
    let (width, height, fps) = (first.width, first.height, 30u32);

    let pipeline_str = format!(
        "appsrc name=src is-live=true format=time caps=video/x-raw,format=RGB,width={width},height={height},framerate={fps}/1 ! \
         videoconvert ! x264enc speed-preset=ultrafast tune=zerolatency ! mp4mux ! filesink location={}",
        path.to_str().ok_or_else(|| anyhow::anyhow!("clip path is not valid UTF-8"))?
    );

    let pipeline = gst::parse::launch(&pipeline_str)?;
    let pipeline = pipeline
        .dynamic_cast::<gst::Pipeline>()
        .map_err(|_| anyhow::anyhow!("parsed launch string did not yield a Pipeline"))?;
    let appsrc = pipeline
        .by_name("src")
        .ok_or_else(|| anyhow::anyhow!("appsrc element not found"))?
        .dynamic_cast::<gst_app::AppSrc>()
        .map_err(|_| anyhow::anyhow!("named element is not an AppSrc"))?;

    pipeline.set_state(gst::State::Playing)?;

    for (i, frame) in frames.iter().enumerate() {
        let mut buffer = gst::Buffer::from_mut_slice(frame.data.clone());
        let buffer_ref = buffer.get_mut().expect("freshly created buffer is uniquely owned");
        let pts = gst::ClockTime::from_nseconds((i as u64 * 1_000_000_000) / fps as u64);
        buffer_ref.set_pts(Some(pts));
        buffer_ref.set_duration(Some(gst::ClockTime::from_nseconds(1_000_000_000 / fps as u64)));
        appsrc.push_buffer(buffer)?;
    }
    appsrc.end_of_stream()?;

    let bus = pipeline.bus().ok_or_else(|| anyhow::anyhow!("pipeline has no bus"))?;
    for msg in bus.iter_timed(gst::ClockTime::from_seconds(10)) {
        match msg.view() {
            gst::MessageView::Eos(..) => break,
            gst::MessageView::Error(err) => {
                error!(error = %err.error(), "clip encoding failed");
                pipeline.set_state(gst::State::Null)?;
                anyhow::bail!("failed to encode clip: {}", err.error());
            }
            _ => {}
        }
    }
    pipeline.set_state(gst::State::Null)?;

    let metadata = std::fs::metadata(path)?;
    info!(path = %path.display(), bytes = metadata.len(), "clip written");
    Ok(metadata.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_drops_frames_older_than_window() {
        let ring = PreEventRing::new("cam-1", 1);
        let now = Utc::now();
        ring.push(FrameData { timestamp: now - Duration::seconds(10), data: vec![], width: 1, height: 1 });
        ring.push(FrameData { timestamp: now, data: vec![], width: 1, height: 1 });
        let extracted = ring.extract(now - Duration::seconds(20), now);
        assert_eq!(extracted.len(), 1);
    }

    #[test]
    fn export_clip_fails_gracefully_with_no_frames_in_range() {
        let recorder = Recorder::new("cam-1", std::env::temp_dir(), 5);
        let now = Utc::now();
        let result = recorder.export_clip(Uuid::new_v4(), now - Duration::seconds(1000), 1, 1, vec![]);
        assert!(result.is_err());
    }
}
