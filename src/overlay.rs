//! Detection overlay rendering.
//!
//! Draws the per-cycle detection overlay into an image buffer: a fixed
//! low-opacity dark wash over the frame, one rectangle outline per detection
//! with stroke width scaled by confidence, and a label tag strip above each
//! rectangle's top edge. The annotated frame is written to a preview path so
//! a host surface can display it. Purely cosmetic; holds no state between
//! cycles.

use image::{Rgb, RgbImage};
use tracing::warn;

use crate::camera::Frame;
use crate::config::OverlayConfig;
use crate::detector::Detection;

/// Wash opacity applied to the frame before boxes are drawn.
const WASH_ALPHA: f32 = 0.2;
/// Tag strip geometry: per-character width and strip height, pixels.
const TAG_CHAR_WIDTH: u32 = 7;
const TAG_HEIGHT: u32 = 12;

const BOX_COLOR: Rgb<u8> = Rgb([64, 220, 128]);
const TAG_COLOR: Rgb<u8> = Rgb([24, 96, 56]);

pub struct OverlayRenderer {
    draw_confidence: f32,
    enabled: bool,
    preview_path: String,
}

impl OverlayRenderer {
    pub fn new(draw_confidence: f32, config: &OverlayConfig) -> Self {
        Self {
            draw_confidence,
            enabled: config.enabled,
            preview_path: config.preview_path.clone(),
        }
    }

    /// Stroke width for a detection outline.
    pub fn stroke_width(confidence: f32) -> u32 {
        (confidence * 4.0).max(2.0).round() as u32
    }

    /// Text placed on a detection's tag strip.
    pub fn tag_text(detection: &Detection) -> String {
        format!(
            "{} {:.0}%",
            detection.label,
            detection.confidence * 100.0
        )
    }

    /// Render the overlay for one cycle and persist the preview frame.
    /// Returns the annotated image.
    pub fn render(&self, frame: &Frame, detections: &[Detection]) -> RgbImage {
        let mut canvas = frame.image.clone();
        wash(&mut canvas);

        for detection in detections {
            if detection.confidence < self.draw_confidence {
                continue;
            }
            self.draw_detection(&mut canvas, detection);
        }

        if self.enabled {
            if let Err(e) = canvas.save(&self.preview_path) {
                warn!("Failed to write preview frame: {e}");
            }
        }

        canvas
    }

    fn draw_detection(&self, canvas: &mut RgbImage, detection: &Detection) {
        let (cw, ch) = canvas.dimensions();
        let x = (detection.region.x.max(0.0) as u32).min(cw.saturating_sub(1));
        let y = (detection.region.y.max(0.0) as u32).min(ch.saturating_sub(1));
        let w = (detection.region.width.max(0.0) as u32).min(cw - x);
        let h = (detection.region.height.max(0.0) as u32).min(ch - y);
        if w == 0 || h == 0 {
            return;
        }

        let stroke = Self::stroke_width(detection.confidence);
        draw_rect_outline(canvas, x, y, w, h, stroke, BOX_COLOR);

        // Tag strip sits above the top edge, clamped into the frame
        let tag_w = (Self::tag_text(detection).len() as u32 * TAG_CHAR_WIDTH).min(cw - x);
        let tag_y = y.saturating_sub(TAG_HEIGHT);
        fill_rect(canvas, x, tag_y, tag_w, TAG_HEIGHT, TAG_COLOR);
    }
}

/// Darken every pixel toward black by the fixed wash opacity.
fn wash(canvas: &mut RgbImage) {
    let keep = 1.0 - WASH_ALPHA;
    for pixel in canvas.pixels_mut() {
        for c in pixel.0.iter_mut() {
            *c = (*c as f32 * keep) as u8;
        }
    }
}

fn fill_rect(canvas: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>) {
    let (cw, ch) = canvas.dimensions();
    for py in y..(y + h).min(ch) {
        for px in x..(x + w).min(cw) {
            canvas.put_pixel(px, py, color);
        }
    }
}

fn draw_rect_outline(
    canvas: &mut RgbImage,
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    stroke: u32,
    color: Rgb<u8>,
) {
    // Top and bottom edges
    fill_rect(canvas, x, y, w, stroke.min(h), color);
    fill_rect(canvas, x, (y + h).saturating_sub(stroke), w, stroke.min(h), color);
    // Left and right edges
    fill_rect(canvas, x, y, stroke.min(w), h, color);
    fill_rect(canvas, (x + w).saturating_sub(stroke), y, stroke.min(w), h, color);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::Region;

    fn frame(w: u32, h: u32) -> Frame {
        Frame {
            image: RgbImage::from_pixel(w, h, Rgb([100, 100, 100])),
        }
    }

    fn det(confidence: f32, x: f32, y: f32, w: f32, h: f32) -> Detection {
        Detection {
            label: "cat".into(),
            confidence,
            region: Region {
                x,
                y,
                width: w,
                height: h,
            },
        }
    }

    fn renderer() -> OverlayRenderer {
        OverlayRenderer::new(
            0.50,
            &OverlayConfig {
                enabled: false,
                preview_path: String::new(),
            },
        )
    }

    #[test]
    fn stroke_width_has_floor_of_two() {
        assert_eq!(OverlayRenderer::stroke_width(0.5), 2);
        assert_eq!(OverlayRenderer::stroke_width(0.1), 2);
        assert_eq!(OverlayRenderer::stroke_width(1.0), 4);
    }

    #[test]
    fn tag_text_includes_percentage() {
        let d = det(0.87, 0.0, 0.0, 10.0, 10.0);
        assert_eq!(OverlayRenderer::tag_text(&d), "cat 87%");
    }

    #[test]
    fn wash_darkens_frame() {
        let f = frame(8, 8);
        let out = renderer().render(&f, &[]);
        assert_eq!(out.dimensions(), (8, 8));
        assert!(out.get_pixel(4, 4).0[0] < 100);
    }

    #[test]
    fn detections_below_draw_threshold_are_skipped() {
        let f = frame(64, 64);
        let washed = renderer().render(&f, &[]);
        let with_faint = renderer().render(&f, &[det(0.4, 10.0, 20.0, 30.0, 30.0)]);
        assert_eq!(washed.as_raw(), with_faint.as_raw());
    }

    #[test]
    fn confident_detection_draws_an_outline() {
        let f = frame(64, 64);
        let out = renderer().render(&f, &[det(0.9, 10.0, 20.0, 30.0, 30.0)]);
        assert_eq!(*out.get_pixel(10, 20), BOX_COLOR);
        // Interior stays washed
        assert_ne!(*out.get_pixel(25, 35), BOX_COLOR);
    }

    #[test]
    fn out_of_frame_regions_never_panic() {
        let f = frame(32, 32);
        let out = renderer().render(&f, &[det(0.9, -10.0, -10.0, 500.0, 500.0)]);
        assert_eq!(out.dimensions(), (32, 32));
    }
}
