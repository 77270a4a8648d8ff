//! ReID Feature Extractor. The spec fixes the interface (extract a
//! unit-normalized embedding from a crop) but leaves the model format
//! open (Non-goal: no concrete accelerator-backed re-identification
//! network is mandated). `PixelStatsExtractor` is the one concrete
//! implementation this crate ships: a deterministic perceptual-hash-style
//! descriptor over color and spatial-gradient statistics, grounded in the
//! averaging approach `onnx_attributes::AttributeDetector` already uses
//! for its fallback color path, extended into a fixed-dimension vector
//! rather than a color-name bucket so it can exercise the Tracker/
//! Registry's cosine-similarity and EMA-blend contracts without a real
//! accelerator.

use image::{DynamicImage, GenericImageView};
use vision_common::reid::normalize;
use vision_common::types::BBox;

pub trait ReidExtractor: Send + Sync {
    fn extract(&self, image: &DynamicImage, bbox: &BBox) -> Vec<f32>;
    fn dimension(&self) -> usize;
}

/// Divides the crop into a `GRID x GRID` cell layout and records each
/// cell's mean R/G/B plus horizontal/vertical gradient magnitude,
/// producing a `GRID * GRID * 5`-dimensional unit-normalized vector.
pub struct PixelStatsExtractor {
    grid: u32,
}

const DEFAULT_GRID: u32 = 4;

impl PixelStatsExtractor {
    pub fn new() -> Self {
        Self { grid: DEFAULT_GRID }
    }
}

impl Default for PixelStatsExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ReidExtractor for PixelStatsExtractor {
    fn extract(&self, image: &DynamicImage, bbox: &BBox) -> Vec<f32> {
        let (img_w, img_h) = image.dimensions();
        let x1 = bbox.x.max(0.0).min(img_w as f32) as u32;
        let y1 = bbox.y.max(0.0).min(img_h as f32) as u32;
        let x2 = (bbox.x + bbox.width).max(0.0).min(img_w as f32) as u32;
        let y2 = (bbox.y + bbox.height).max(0.0).min(img_h as f32) as u32;

        if x2 <= x1 || y2 <= y1 {
            return vec![0.0; self.dimension()];
        }

        let cell_w = ((x2 - x1) / self.grid).max(1);
        let cell_h = ((y2 - y1) / self.grid).max(1);

        let mut features = Vec::with_capacity(self.dimension());
        for row in 0..self.grid {
            for col in 0..self.grid {
                let cx1 = (x1 + col * cell_w).min(x2.saturating_sub(1));
                let cy1 = (y1 + row * cell_h).min(y2.saturating_sub(1));
                let cx2 = (cx1 + cell_w).min(x2);
                let cy2 = (cy1 + cell_h).min(y2);
                features.extend(cell_stats(image, cx1, cy1, cx2, cy2));
            }
        }

        normalize(&mut features);
        features
    }

    fn dimension(&self) -> usize {
        (self.grid * self.grid * 5) as usize
    }
}

/// Mean R/G/B over the cell plus mean horizontal and vertical luminance
/// gradient magnitude, all scaled to roughly `[0, 1]`.
fn cell_stats(image: &DynamicImage, x1: u32, y1: u32, x2: u32, y2: u32) -> [f32; 5] {
    if x2 <= x1 || y2 <= y1 {
        return [0.0; 5];
    }

    let (mut r_sum, mut g_sum, mut b_sum) = (0f32, 0f32, 0f32);
    let (mut grad_x_sum, mut grad_y_sum) = (0f32, 0f32);
    let mut count = 0f32;

    for y in y1..y2 {
        for x in x1..x2 {
            let pixel = image.get_pixel(x, y);
            r_sum += pixel[0] as f32;
            g_sum += pixel[1] as f32;
            b_sum += pixel[2] as f32;

            let luma = 0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32;
            if x + 1 < x2 {
                let next = image.get_pixel(x + 1, y);
                let next_luma = 0.299 * next[0] as f32 + 0.587 * next[1] as f32 + 0.114 * next[2] as f32;
                grad_x_sum += (next_luma - luma).abs();
            }
            if y + 1 < y2 {
                let next = image.get_pixel(x, y + 1);
                let next_luma = 0.299 * next[0] as f32 + 0.587 * next[1] as f32 + 0.114 * next[2] as f32;
                grad_y_sum += (next_luma - luma).abs();
            }
            count += 1.0;
        }
    }

    if count == 0.0 {
        return [0.0; 5];
    }

    [
        r_sum / count / 255.0,
        g_sum / count / 255.0,
        b_sum / count / 255.0,
        grad_x_sum / count / 255.0,
        grad_y_sum / count / 255.0,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn identical_crops_produce_identical_vectors() {
        let mut img = RgbImage::new(40, 40);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = Rgb([(x * 5) as u8, (y * 5) as u8, 128]);
        }
        let image = DynamicImage::ImageRgb8(img);
        let extractor = PixelStatsExtractor::new();
        let bbox = BBox::new(0.0, 0.0, 40.0, 40.0);

        let a = extractor.extract(&image, &bbox);
        let b = extractor.extract(&image, &bbox);
        assert_eq!(a, b);
        assert_eq!(a.len(), extractor.dimension());
    }

    #[test]
    fn distinct_colored_crops_produce_different_vectors() {
        let mut red = RgbImage::new(20, 20);
        for pixel in red.pixels_mut() {
            *pixel = Rgb([220, 10, 10]);
        }
        let mut blue = RgbImage::new(20, 20);
        for pixel in blue.pixels_mut() {
            *pixel = Rgb([10, 10, 220]);
        }

        let extractor = PixelStatsExtractor::new();
        let bbox = BBox::new(0.0, 0.0, 20.0, 20.0);
        let a = extractor.extract(&DynamicImage::ImageRgb8(red), &bbox);
        let b = extractor.extract(&DynamicImage::ImageRgb8(blue), &bbox);
        assert_ne!(a, b);
    }

    #[test]
    fn out_of_bounds_bbox_returns_zero_vector_without_panicking() {
        let img = RgbImage::new(10, 10);
        let extractor = PixelStatsExtractor::new();
        let bbox = BBox::new(500.0, 500.0, 20.0, 20.0);
        let features = extractor.extract(&DynamicImage::ImageRgb8(img), &bbox);
        assert_eq!(features, vec![0.0; extractor.dimension()]);
    }
}
