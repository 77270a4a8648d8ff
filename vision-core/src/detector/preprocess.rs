//! Preprocessing pipeline (spec §4.3), applied in order: letterbox resize
//! preserving aspect ratio, color conversion to the model's expected
//! channel order, normalization dependent on tensor element type, and a
//! contiguous copy into the input tensor.

use image::{DynamicImage, Rgb, RgbImage};
use ndarray::Array4;

/// Parameters recording exactly how a source frame was letterboxed, needed
/// to rescale detections back out of letterbox space (spec §4.3
/// postprocessing: "rescale boxes from letterbox space to original frame
/// coordinates").
#[derive(Debug, Clone, Copy)]
pub struct LetterboxTransform {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub src_width: u32,
    pub src_height: u32,
}

impl LetterboxTransform {
    /// Map a bounding box from letterbox-space pixel coordinates back to
    /// the original frame's coordinate system.
    pub fn unletterbox(&self, x: f32, y: f32, w: f32, h: f32) -> (f32, f32, f32, f32) {
        let ux = (x - self.pad_x) / self.scale;
        let uy = (y - self.pad_y) / self.scale;
        let uw = w / self.scale;
        let uh = h / self.scale;
        (ux, uy, uw, uh)
    }
}

/// Aspect-ratio-preserving resize with padding to `(target_w, target_h)`.
/// Returns the letterboxed RGB image plus the transform needed to invert
/// box coordinates later.
pub fn letterbox(image: &DynamicImage, target_w: u32, target_h: u32) -> (RgbImage, LetterboxTransform) {
    let (src_w, src_h) = (image.width(), image.height());
    let scale = (target_w as f32 / src_w as f32).min(target_h as f32 / src_h as f32);
    let new_w = ((src_w as f32) * scale).round().max(1.0) as u32;
    let new_h = ((src_h as f32) * scale).round().max(1.0) as u32;

    let resized = image.resize_exact(new_w, new_h, image::imageops::FilterType::Triangle);
    let pad_x = ((target_w - new_w) / 2) as f32;
    let pad_y = ((target_h - new_h) / 2) as f32;

    let mut canvas = RgbImage::from_pixel(target_w, target_h, Rgb([114, 114, 114]));
    image::imageops::overlay(&mut canvas, &resized.to_rgb8(), pad_x as i64, pad_y as i64);

    (
        canvas,
        LetterboxTransform {
            scale,
            pad_x,
            pad_y,
            src_width: src_w,
            src_height: src_h,
        },
    )
}

/// Element type a model's input tensor expects — drives the normalization
/// step (spec §4.3: "quantized uint8 passes through; float variants divide
/// by 255").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorElementKind {
    QuantizedU8,
    Float32,
}

/// Channel order a model expects its input in. Source frames are always
/// decoded as RGB in this crate (spec §4.2 decoder output); BGR models need
/// the channel swap applied here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Writes a letterboxed RGB image into an NCHW float tensor, applying the
/// channel-order and normalization steps. Quantized uint8 models should
/// instead consume the `RgbImage` bytes directly (no float tensor needed);
/// this function covers the float-tensor path used by most ONNX detectors
/// in this codebase.
pub fn to_input_tensor(
    image: &RgbImage,
    channel_order: ChannelOrder,
    element_kind: TensorElementKind,
) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let mut array = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

    let scale = match element_kind {
        TensorElementKind::Float32 => 1.0 / 255.0,
        TensorElementKind::QuantizedU8 => 1.0,
    };

    for y in 0..height {
        for x in 0..width {
            let pixel = image.get_pixel(x, y).0;
            let (r, g, b) = (pixel[0] as f32, pixel[1] as f32, pixel[2] as f32);
            let (c0, c1, c2) = match channel_order {
                ChannelOrder::Rgb => (r, g, b),
                ChannelOrder::Bgr => (b, g, r),
            };
            array[[0, 0, y as usize, x as usize]] = c0 * scale;
            array[[0, 1, y as usize, x as usize]] = c1 * scale;
            array[[0, 2, y as usize, x as usize]] = c2 * scale;
        }
    }

    array
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn letterbox_preserves_aspect_and_pads() {
        let src = DynamicImage::ImageRgb8(RgbImage::new(640, 480));
        let (canvas, transform) = letterbox(&src, 416, 416);
        assert_eq!(canvas.width(), 416);
        assert_eq!(canvas.height(), 416);
        assert!(transform.pad_y > 0.0);
        assert!((transform.pad_x).abs() < 1.0);
    }

    #[test]
    fn unletterbox_round_trips_a_box() {
        let src = DynamicImage::ImageRgb8(RgbImage::new(640, 480));
        let (_, transform) = letterbox(&src, 416, 416);
        // a box placed at the exact top-left padded origin should map back
        // close to frame-space (0, 0).
        let (x, y, _, _) = transform.unletterbox(transform.pad_x, transform.pad_y, 10.0, 10.0);
        assert!(x.abs() < 1.0);
        assert!(y.abs() < 1.0);
    }
}
