use geo::Coord;
use image::{imageops::FilterType, DynamicImage};
use ndarray::Array3;
use tracing::instrument;

use crate::{Quad, TextLine};

/// Channel layout a graph was trained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelOrder {
    Rgb,
    /// The recognizer was trained on crops straight out of an OpenCV decode.
    Bgr,
}

/// Raw 0-255 pixels as an HWC tensor, which is what both TensorFlow-exported
/// graphs expect.
#[instrument(level = "trace", skip(image))]
pub(crate) fn to_hwc_tensor(image: &DynamicImage, order: ChannelOrder) -> Array3<f32> {
    let image = image.to_rgb8();
    Array3::<f32>::from_shape_fn(
        (image.height() as usize, image.width() as usize, 3),
        |(y, x, ch)| {
            let ch = match order {
                ChannelOrder::Rgb => ch,
                ChannelOrder::Bgr => 2 - ch,
            };
            image.get_pixel(x as u32, y as u32).0[ch] as f32
        },
    )
}

/// Mapping between the original image and the working image fed to the
/// detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale {
    /// `target_width / original width`
    pub ratio_w: f32,
    /// `target_height / original height`
    pub ratio_h: f32,
    pub target_width: u32,
    pub target_height: u32,
}

impl Scale {
    pub fn compute(width: u32, height: u32, max_side_len: u32, stride: u32) -> Self {
        let stride = stride.max(1);
        let longer = width.max(height);
        let ratio = if longer > max_side_len {
            max_side_len as f64 / longer as f64
        } else {
            1.0
        };
        let scaled_width = (width as f64 * ratio) as u32;
        let scaled_height = (height as f64 * ratio) as u32;

        let target_width = (scaled_width / stride * stride).max(stride);
        let target_height = (scaled_height / stride * stride).max(stride);
        if target_width != scaled_width || target_height != scaled_height {
            log::debug!(
                "Flooring working size (w: {scaled_width}, h: {scaled_height}) to a multiple of {stride}: (w: {target_width}, h: {target_height})."
            );
        }

        Self {
            ratio_w: target_width as f32 / width.max(1) as f32,
            ratio_h: target_height as f32 / height.max(1) as f32,
            target_width,
            target_height,
        }
    }

    /// Maps a working-image point back into original image coordinates.
    pub fn restore(&self, point: Coord<f32>) -> Coord<f32> {
        Coord {
            x: point.x / self.ratio_w,
            y: point.y / self.ratio_h,
        }
    }
}

#[instrument(level = "debug", skip(image))]
pub fn resize_for_detection(
    image: &DynamicImage,
    max_side_len: u32,
    stride: u32,
) -> (DynamicImage, Scale) {
    let scale = Scale::compute(image.width(), image.height(), max_side_len, stride);
    log::debug!(
        "Resizing from (w: {}, h: {}) to (w: {}, h: {}).",
        image.width(),
        image.height(),
        scale.target_width,
        scale.target_height
    );
    let resized = if (image.width(), image.height()) == (scale.target_width, scale.target_height)
    {
        image.clone()
    } else {
        image.resize_exact(scale.target_width, scale.target_height, FilterType::Triangle)
    };
    (resized, scale)
}

/// Twice the signed area. Positive means clockwise on screen (y pointing
/// down).
pub fn signed_area(points: &Quad) -> f32 {
    points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| a.x * b.y - b.x * a.y)
        .sum::<f32>()
}

/// Puts the corners in clockwise screen order starting from the
/// lexicographically smallest `(x, y)` corner. Zero-area input is returned
/// untouched.
pub fn canonicalize_polygon(points: Quad) -> Quad {
    let area = signed_area(&points);
    if area == 0.0 {
        return points;
    }
    let mut points = points;
    if area < 0.0 {
        points.reverse();
    }
    let first = (0..4)
        .min_by(|&a, &b| {
            points[a]
                .x
                .total_cmp(&points[b].x)
                .then(points[a].y.total_cmp(&points[b].y))
        })
        .unwrap_or(0);
    points.rotate_left(first);
    points
}

fn distance(a: Coord<f32>, b: Coord<f32>) -> f32 {
    (a.x - b.x).hypot(a.y - b.y)
}

/// True when any two adjacent corners are closer than `min_side` pixels.
pub fn is_degenerate(points: &Quad, min_side: f32) -> bool {
    (0..4).any(|i| distance(points[i], points[(i + 1) % 4]) < min_side)
}

/// Axis-aligned pixel rectangle inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    pub fn crop(&self, image: &DynamicImage) -> DynamicImage {
        log::trace!("Slicing subimage to {self:?}");
        image.crop_imm(self.x, self.y, self.width, self.height)
    }
}

/// Bounding rectangle of a line grown by one pixel on each side and clamped
/// to the image. `None` when the line has no extent or lies outside.
pub fn crop_rect(line: &TextLine, width: u32, height: u32) -> Option<CropRect> {
    let points = line.points();
    let (min_x, max_x) = points
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), p| {
            (lo.min(p.x), hi.max(p.x))
        });
    let (min_y, max_y) = points
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), p| {
            (lo.min(p.y), hi.max(p.y))
        });
    if !(max_x > min_x && max_y > min_y) {
        return None;
    }

    let left = (min_x.floor() as i64 - 1).clamp(0, width as i64);
    let top = (min_y.floor() as i64 - 1).clamp(0, height as i64);
    let right = (max_x.ceil() as i64 + 1).clamp(0, width as i64);
    let bottom = (max_y.ceil() as i64 + 1).clamp(0, height as i64);
    if left >= right || top >= bottom {
        return None;
    }
    Some(CropRect {
        x: left as u32,
        y: top as u32,
        width: (right - left) as u32,
        height: (bottom - top) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn quad(points: [(f32, f32); 4]) -> Quad {
        points.map(|(x, y)| Coord { x, y })
    }

    #[test]
    fn tensor_channel_order() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 2, image::Rgb([10, 20, 30])));

        let rgb = to_hwc_tensor(&image, ChannelOrder::Rgb);
        assert_eq!(rgb.dim(), (2, 3, 3));
        assert_eq!(rgb.slice(ndarray::s![1, 2, ..]).to_vec(), vec![10.0, 20.0, 30.0]);

        let bgr = to_hwc_tensor(&image, ChannelOrder::Bgr);
        assert_eq!(bgr.dim(), (2, 3, 3));
        for pixel in bgr.rows() {
            assert_eq!(pixel.to_vec(), vec![30.0, 20.0, 10.0]);
        }
    }

    #[test]
    fn scale_keeps_small_multiples_untouched() {
        let scale = Scale::compute(640, 320, 2400, 32);
        assert_eq!((scale.target_width, scale.target_height), (640, 320));
        assert_eq!((scale.ratio_w, scale.ratio_h), (1.0, 1.0));
        let point = Coord { x: 12.5, y: 99.0 };
        assert_eq!(scale.restore(point), point);
    }

    #[test]
    fn scale_floors_to_stride() {
        let scale = Scale::compute(800, 600, 2400, 32);
        assert_eq!((scale.target_width, scale.target_height), (800, 576));
        assert_eq!(scale.ratio_w, 1.0);
        assert!((scale.ratio_h - 0.96).abs() < 1e-6);
    }

    #[test]
    fn scale_limits_longer_side() {
        let scale = Scale::compute(4800, 1200, 2400, 32);
        assert_eq!((scale.target_width, scale.target_height), (2400, 576));
        assert!(scale.target_width <= 2400);
    }

    #[test]
    fn scale_never_drops_below_one_stride() {
        let scale = Scale::compute(10, 3000, 2400, 32);
        assert_eq!(scale.target_width, 32);
        assert_eq!(scale.target_height, 2400);
    }

    #[test]
    fn resize_produces_working_image() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(100, 70));
        let (resized, scale) = resize_for_detection(&image, 2400, 32);
        assert_eq!((resized.width(), resized.height()), (96, 64));
        assert_eq!((scale.target_width, scale.target_height), (96, 64));
    }

    #[test]
    fn canonicalize_reverses_counter_clockwise_input() {
        // tl, bl, br, tr is counter-clockwise on screen
        let points = quad([(0.0, 0.0), (0.0, 5.0), (10.0, 5.0), (10.0, 0.0)]);
        let sorted = canonicalize_polygon(points);
        assert_eq!(
            sorted,
            quad([(0.0, 0.0), (10.0, 0.0), (10.0, 5.0), (0.0, 5.0)])
        );
        assert!(signed_area(&sorted) > 0.0);
    }

    #[test]
    fn canonicalize_rotates_to_smallest_corner() {
        let points = quad([(10.0, 5.0), (0.0, 5.0), (0.0, 0.0), (10.0, 0.0)]);
        let sorted = canonicalize_polygon(points);
        assert_eq!(sorted[0], Coord { x: 0.0, y: 0.0 });
        assert_eq!(sorted[1], Coord { x: 10.0, y: 0.0 });
    }

    #[test]
    fn canonicalize_is_stable() {
        let inputs = [
            quad([(3.0, 9.0), (1.0, 2.0), (12.0, 0.0), (14.0, 7.0)]),
            quad([(14.0, 7.0), (12.0, 0.0), (1.0, 2.0), (3.0, 9.0)]),
            quad([(5.0, 0.0), (10.0, 5.0), (5.0, 10.0), (0.0, 5.0)]),
        ];
        for points in inputs {
            let once = canonicalize_polygon(points);
            assert_eq!(canonicalize_polygon(once), once);
            let smallest = once
                .iter()
                .min_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)))
                .copied();
            assert_eq!(Some(once[0]), smallest);
        }
    }

    #[test]
    fn canonicalize_leaves_collinear_points() {
        let points = quad([(4.0, 0.0), (3.0, 0.0), (2.0, 0.0), (1.0, 0.0)]);
        assert_eq!(canonicalize_polygon(points), points);
    }

    #[test]
    fn degenerate_detects_short_edges() {
        let thin = quad([(0.0, 0.0), (100.0, 0.0), (100.0, 3.0), (0.0, 3.0)]);
        let fine = quad([(0.0, 0.0), (100.0, 0.0), (100.0, 20.0), (0.0, 20.0)]);
        assert!(is_degenerate(&thin, 5.0));
        assert!(!is_degenerate(&fine, 5.0));
    }

    #[test]
    fn crop_rect_adds_margin_and_clamps() {
        let line = TextLine::new(
            quad([(0.0, 10.0), (50.5, 10.0), (50.5, 30.0), (0.0, 30.0)]),
            1.0,
        );
        let rect = crop_rect(&line, 50, 100).unwrap();
        assert_eq!(
            rect,
            CropRect {
                x: 0,
                y: 9,
                width: 50,
                height: 22
            }
        );
    }

    #[test]
    fn crop_rect_rejects_collapsed_and_outside_boxes() {
        let point = TextLine::new(quad([(5.0, 5.0); 4]), 1.0);
        assert_eq!(crop_rect(&point, 100, 100), None);

        let outside = TextLine::new(
            quad([(200.0, 200.0), (220.0, 200.0), (220.0, 210.0), (200.0, 210.0)]),
            1.0,
        );
        assert_eq!(crop_rect(&outside, 100, 100), None);
    }
}
