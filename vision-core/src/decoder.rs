//! Decoder: opens a stream source and emits timestamped frames, with
//! reconnect-on-loss exponential backoff (spec §4.2). Grounded in
//! `main_phase6.rs`'s `create_rtsp_pipeline`/`create_test_pipeline` +
//! appsink-callback pull loop, generalized to a blocking iterator over
//! `FrameRecord`s instead of a one-shot tokio callback closure, since the
//! pipeline worker thread (not an async task) owns decode.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use tracing::{error, info, warn};
use vision_common::types::FrameRecord;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const BACKOFF_FACTOR: u32 = 2;
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub source_id: String,
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub max_queue_size: u32,
    pub rtsp_latency_ms: u32,
}

/// Backoff state for reconnect attempts, reset on any successfully
/// delivered frame.
pub struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { current: INITIAL_BACKOFF }
    }
}

impl Backoff {
    pub fn next(&mut self) -> Duration {
        let wait = self.current;
        self.current = (self.current * BACKOFF_FACTOR).min(MAX_BACKOFF);
        wait
    }

    pub fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
    }
}

fn build_pipeline(config: &DecoderConfig) -> anyhow::Result<gst::Pipeline> {
    let pipeline_str = if config.url == "test://" {
        format!(
            "videotestsrc pattern=ball is-live=true ! \
             video/x-raw,width=1280,height=720,framerate=30/1 ! \
             videoconvert ! videoscale ! \
             video/x-raw,format=RGB,width={},height={} ! \
             appsink name=sink max-buffers={} drop=true sync=false",
            config.width, config.height, config.max_queue_size
        )
    } else {
        if !config.url.starts_with("rtsp://") && !config.url.starts_with("rtsps://") {
            anyhow::bail!("unsupported stream URL scheme: {}", config.url);
        }
        format!(
            "rtspsrc location=\"{}\" latency={} drop-on-latency=true buffer-mode=1 ! \
             rtph264depay ! h264parse ! avdec_h264 ! \
             videoconvert ! videoscale ! \
             video/x-raw,format=RGB,width={},height={} ! \
             appsink name=sink max-buffers={} drop=true sync=false",
            config.url, config.rtsp_latency_ms, config.width, config.height, config.max_queue_size
        )
    };

    gst::parse::launch(&pipeline_str)?
        .downcast::<gst::Pipeline>()
        .map_err(|_| anyhow::anyhow!("parsed launch string did not yield a Pipeline"))
}

/// Drives one source's GStreamer pipeline, handing decoded frames to
/// `on_frame` until `stop()` is called or the stream fails permanently.
pub struct Decoder {
    config: DecoderConfig,
    stop_flag: Arc<AtomicBool>,
    sequence: u64,
}

pub enum DecoderOutcome {
    Stopped,
    /// Failed to reopen the stream after exhausting backoff; caller
    /// transitions the owning pipeline to Stopped (spec §4.2 fatal case).
    ExhaustedRetries,
}

impl Decoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            config,
            stop_flag: Arc::new(AtomicBool::new(false)),
            sequence: 0,
        }
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_flag)
    }

    /// Blocking run loop. `on_frame` returns `false` to request an early
    /// stop (used by graceful shutdown paths that want to stop between
    /// frames rather than poll the atomic separately). `on_retry` is called
    /// with the attempt number whenever the pipeline reconnects after a
    /// transient failure, letting the caller reflect the Degraded state
    /// transition (spec §4.2) without this module knowing about pipeline
    /// state at all.
    pub fn run(&mut self, mut on_frame: impl FnMut(FrameRecord) -> bool, mut on_retry: impl FnMut(u32), max_retries: u32) -> DecoderOutcome {
        let mut backoff = Backoff::default();
        let mut attempt = 0u32;

        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                return DecoderOutcome::Stopped;
            }

            let seq_before = self.sequence;
            match self.run_once(&mut on_frame) {
                Ok(()) => return DecoderOutcome::Stopped,
                Err(e) => {
                    if self.sequence > seq_before {
                        // delivered at least one frame since the last
                        // reconnect; the stream recovered, so the next
                        // failure starts backoff from scratch again.
                        backoff.reset();
                        attempt = 0;
                    }
                    attempt += 1;
                    warn!(source_id = %self.config.source_id, attempt, error = %e, "decoder pipeline failed, reconnecting");
                    if attempt > max_retries {
                        error!(source_id = %self.config.source_id, "exhausted reconnect attempts");
                        return DecoderOutcome::ExhaustedRetries;
                    }
                    on_retry(attempt);
                    let wait = backoff.next();
                    std::thread::sleep(wait);
                }
            }
        }
    }

    /// Runs the pipeline until EOS, error, or `stop_flag`. Returns `Ok`
    /// only on a clean EOS or explicit stop; anything else is a transient
    /// error the caller retries with backoff.
    fn run_once(&mut self, on_frame: &mut impl FnMut(FrameRecord) -> bool) -> anyhow::Result<()> {
        let pipeline = build_pipeline(&self.config)?;
        let appsink = pipeline
            .by_name("sink")
            .and_then(|e| e.dynamic_cast::<gst_app::AppSink>().ok())
            .ok_or_else(|| anyhow::anyhow!("appsink element not found"))?;

        pipeline.set_state(gst::State::Playing)?;
        info!(source_id = %self.config.source_id, "decoder pipeline playing");

        let result = self.pull_loop(&pipeline, &appsink, on_frame);
        let _ = pipeline.set_state(gst::State::Null);
        result
    }

    fn pull_loop(&mut self, pipeline: &gst::Pipeline, appsink: &gst_app::AppSink, on_frame: &mut impl FnMut(FrameRecord) -> bool) -> anyhow::Result<()> {
        let bus = pipeline.bus().ok_or_else(|| anyhow::anyhow!("pipeline has no bus"))?;

        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                return Ok(());
            }

            if let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(0)) {
                match msg.view() {
                    gst::MessageView::Eos(..) => return Ok(()),
                    gst::MessageView::Error(err) => anyhow::bail!("pipeline error: {}", err.error()),
                    _ => {}
                }
            }

            match appsink.try_pull_sample(gst::ClockTime::from_mseconds(200)) {
                Some(sample) => {
                    let Some(buffer) = sample.buffer() else { continue };
                    let Ok(map) = buffer.map_readable() else { continue };
                    self.sequence += 1;
                    let frame = FrameRecord {
                        source_id: self.config.source_id.clone(),
                        capture_ts: Utc::now(),
                        sequence_number: self.sequence,
                        width: self.config.width,
                        height: self.config.height,
                        data: Arc::new(map.as_slice().to_vec()),
                    };
                    if !on_frame(frame) {
                        return Ok(());
                    }
                }
                None => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.next(), Duration::from_millis(500));
        assert_eq!(backoff.next(), Duration::from_millis(1000));
        assert_eq!(backoff.next(), Duration::from_millis(2000));
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(500));
    }

    #[test]
    fn backoff_caps_at_30_seconds() {
        let mut backoff = Backoff::default();
        for _ in 0..20 {
            backoff.next();
        }
        assert_eq!(backoff.next(), MAX_BACKOFF);
    }

    #[test]
    fn rejects_unsupported_url_scheme() {
        let config = DecoderConfig {
            source_id: "cam-1".into(),
            url: "http://example.com/stream".into(),
            width: 640,
            height: 480,
            max_queue_size: 4,
            rtsp_latency_ms: 100,
        };
        assert!(build_pipeline(&config).is_err());
    }
}
