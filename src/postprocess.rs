use std::time::Instant;

use geo::Coord;
use ndarray::{s, Array2, Array3, ArrayView1};
use tracing::instrument;

use crate::{
    error::{ExtractError, Result},
    nms::{merge_locality_aware, suppress_overlapping},
    util::{canonicalize_polygon, is_degenerate, Scale},
    DetectionOptions, Quad, ScoredQuad, TextLine, TimingBreakdown,
};

/// Number of channels in the geometry map: top, right, bottom, left, angle.
pub const GEOMETRY_CHANNELS: usize = 5;

/// Dense detector output for one working image.
#[derive(Debug, Clone)]
pub struct RawMaps {
    score: Array2<f32>,
    geometry: Array3<f32>,
}

impl RawMaps {
    /// `score` is `(h, w)`, `geometry` is `(h, w, 5)`.
    pub fn new(score: Array2<f32>, geometry: Array3<f32>) -> Result<Self> {
        let (h, w) = score.dim();
        let (gh, gw, channels) = geometry.dim();
        if (gh, gw) != (h, w) || channels != GEOMETRY_CHANNELS {
            return Err(ExtractError::UnexpectedOutput(format!(
                "score map is {h}x{w} but geometry map is {gh}x{gw}x{channels}"
            )));
        }
        Ok(Self { score, geometry })
    }
}

/// Rebuilds the quad a single score-map cell votes for. `origin` is the
/// cell position in working-image pixels, `geometry` its five channels.
pub fn restore_quad(origin: Coord<f32>, geometry: ArrayView1<f32>) -> Quad {
    let (top, right, bottom, left, angle) = (
        geometry[0],
        geometry[1],
        geometry[2],
        geometry[3],
        geometry[4],
    );
    let height = top + bottom;
    let width = left + right;

    // Corners in the unrotated frame, measured from the bottom-left corner
    // (bottom-right for negative angles), followed by the cell itself.
    let rotated: [Coord<f32>; 5] = if angle >= 0.0 {
        let (sin, cos) = angle.sin_cos();
        [
            Coord { x: 0.0, y: -height },
            Coord {
                x: width,
                y: -height,
            },
            Coord { x: width, y: 0.0 },
            Coord { x: 0.0, y: 0.0 },
            Coord {
                x: left,
                y: -bottom,
            },
        ]
        .map(|p| Coord {
            x: cos * p.x + sin * p.y,
            y: -sin * p.x + cos * p.y,
        })
    } else {
        let (sin, cos) = (-angle).sin_cos();
        [
            Coord {
                x: -width,
                y: -height,
            },
            Coord { x: 0.0, y: -height },
            Coord { x: 0.0, y: 0.0 },
            Coord { x: -width, y: 0.0 },
            Coord {
                x: -right,
                y: -bottom,
            },
        ]
        .map(|p| Coord {
            x: cos * p.x - sin * p.y,
            y: sin * p.x + cos * p.y,
        })
    };

    let offset = origin - rotated[4];
    [
        rotated[0] + offset,
        rotated[1] + offset,
        rotated[2] + offset,
        rotated[3] + offset,
    ]
}

/// One candidate per cell scoring above `score_threshold`, in row-major
/// order.
#[instrument(level = "debug", skip(maps))]
pub fn restore_geometry(
    maps: &RawMaps,
    score_threshold: f32,
    map_stride: u32,
) -> Vec<ScoredQuad> {
    let stride = map_stride as f32;
    maps.score
        .indexed_iter()
        .filter(|(_, score)| **score > score_threshold)
        .map(|((y, x), score)| {
            let origin = Coord {
                x: x as f32 * stride,
                y: y as f32 * stride,
            };
            let geometry = maps.geometry.slice(s![y, x, ..]);
            ScoredQuad {
                points: restore_quad(origin, geometry),
                score: *score,
            }
        })
        .collect()
}

/// Turns detector maps into scored quads in original image coordinates,
/// ordered as suppression emits them. Each quad carries the mean score of
/// the cells merged into it.
#[instrument(level = "debug", skip(maps, options))]
pub fn detect(
    maps: &RawMaps,
    scale: Scale,
    options: &DetectionOptions,
) -> (Vec<ScoredQuad>, TimingBreakdown) {
    let mut timing = TimingBreakdown::default();

    let start = Instant::now();
    let candidates = restore_geometry(maps, options.score_map_threshold, options.map_stride);
    log::debug!("{} cells above the score threshold", candidates.len());
    let merged = merge_locality_aware(candidates, options.merge_threshold);
    timing.restore = start.elapsed();
    if merged.is_empty() {
        return (Vec::new(), timing);
    }

    let start = Instant::now();
    let kept = suppress_overlapping(merged, options.nms_threshold);
    timing.nms = start.elapsed();

    let boxes = kept
        .into_iter()
        .filter(|it| it.mean_score() > options.box_threshold)
        .map(|it| ScoredQuad {
            points: it.points.map(|p| scale.restore(p)),
            score: it.mean_score(),
        })
        .collect();
    (boxes, timing)
}

/// Canonicalizes corners and drops boxes with an edge shorter than
/// `min_side`.
pub fn to_text_lines(quads: &[ScoredQuad], min_side: f32) -> Vec<TextLine> {
    quads
        .iter()
        .filter_map(|quad| {
            let points = canonicalize_polygon(quad.points);
            if is_degenerate(&points, min_side) {
                log::trace!("Dropping degenerate box {points:?}");
                return None;
            }
            Some(TextLine::new(points, quad.score))
        })
        .collect()
}

/// Builds maps with a single voting cell, handy for exercising the pipeline.
#[cfg(test)]
pub(crate) fn single_cell_maps(
    (h, w): (usize, usize),
    (row, col): (usize, usize),
    score: f32,
    geometry: [f32; GEOMETRY_CHANNELS],
) -> RawMaps {
    let mut score_map = Array2::<f32>::zeros((h, w));
    let mut geometry_map = Array3::<f32>::zeros((h, w, GEOMETRY_CHANNELS));
    score_map[[row, col]] = score;
    for (ch, value) in geometry.into_iter().enumerate() {
        geometry_map[[row, col, ch]] = value;
    }
    RawMaps::new(score_map, geometry_map).expect("consistent shapes")
}
