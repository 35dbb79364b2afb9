use std::cmp::Reverse;

use float_ord::FloatOrd;
use geo::{Area, Coord, LineString, Polygon};
use geo_clipper::Clipper;
use tracing::instrument;

use crate::{Quad, ScoredQuad};

/// Clipper works on integers; coordinates are scaled by this before clipping.
const CLIPPER_FACTOR: f64 = 1024.0;

fn to_polygon(points: &Quad) -> Polygon<f64> {
    let ring = points
        .iter()
        .map(|p| Coord {
            x: p.x as f64,
            y: p.y as f64,
        })
        .collect::<Vec<_>>();
    Polygon::new(LineString::new(ring), vec![])
}

/// Intersection over union of two arbitrary quadrilaterals.
pub fn polygon_iou(a: &Quad, b: &Quad) -> f32 {
    let a = to_polygon(a);
    let b = to_polygon(b);
    let area_a = a.unsigned_area();
    let area_b = b.unsigned_area();
    if area_a <= 0.0 || area_b <= 0.0 {
        return 0.0;
    }
    let inter = a.intersection(&b, CLIPPER_FACTOR).unsigned_area();
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        (inter / union) as f32
    }
}

/// A quad suppression can rank.
pub trait Ranked {
    fn quad(&self) -> &Quad;
    fn rank(&self) -> f32;
}

impl Ranked for ScoredQuad {
    fn quad(&self) -> &Quad {
        &self.points
    }

    fn rank(&self) -> f32 {
        self.score
    }
}

/// A group of cell votes folded into one quad. Ranked by the summed score,
/// so a line backed by many cells outranks a lone confident one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergedQuad {
    pub points: Quad,
    pub score_sum: f32,
    pub members: u32,
}

impl MergedQuad {
    pub fn mean_score(&self) -> f32 {
        self.score_sum / self.members.max(1) as f32
    }
}

impl Ranked for MergedQuad {
    fn quad(&self) -> &Quad {
        &self.points
    }

    fn rank(&self) -> f32 {
        self.score_sum
    }
}

/// Greedy non-maximum suppression over rotated quads. Survivors come out in
/// descending rank order; equal ranks keep their input order.
#[instrument(level = "debug", skip(boxes), fields(candidates = boxes.len()))]
pub fn suppress_overlapping<T: Ranked + Clone>(
    mut boxes: Vec<T>,
    overlap_threshold: f32,
) -> Vec<T> {
    boxes.sort_by_key(|it| Reverse(FloatOrd(it.rank())));

    let mut suppressed = vec![false; boxes.len()];
    let mut keep = Vec::new();
    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(boxes[i].clone());
        for j in (i + 1)..boxes.len() {
            if !suppressed[j] && polygon_iou(boxes[i].quad(), boxes[j].quad()) > overlap_threshold
            {
                suppressed[j] = true;
            }
        }
    }
    log::trace!("NMS kept {} of {} boxes", keep.len(), boxes.len());
    keep
}

/// Running score-weighted average of overlapping quads.
struct QuadMerger {
    weighted: [Coord<f64>; 4],
    weight: f64,
    count: u32,
}

impl QuadMerger {
    fn new(quad: ScoredQuad) -> Self {
        let mut merger = Self {
            weighted: [Coord::zero(); 4],
            weight: 0.0,
            count: 0,
        };
        merger.accumulate(&quad.points, quad.score);
        merger
    }

    fn accumulate(&mut self, points: &Quad, score: f32) {
        let score = score as f64;
        for (acc, p) in self.weighted.iter_mut().zip(points) {
            acc.x += p.x as f64 * score;
            acc.y += p.y as f64 * score;
        }
        self.weight += score;
        self.count += 1;
    }

    fn add(&mut self, quad: ScoredQuad) {
        let aligned = align_vertices(&self.points(), &quad.points);
        self.accumulate(&aligned, quad.score);
    }

    fn points(&self) -> Quad {
        let inv = 1.0 / self.weight.max(1e-8);
        self.weighted.map(|c| Coord {
            x: (c.x * inv) as f32,
            y: (c.y * inv) as f32,
        })
    }

    fn finish(self) -> MergedQuad {
        MergedQuad {
            points: self.points(),
            score_sum: self.weight as f32,
            members: self.count,
        }
    }
}

/// Rotates `points` so its vertices pair up with `reference` at the smallest
/// total squared distance.
fn align_vertices(reference: &Quad, points: &Quad) -> Quad {
    let cost = |shift: usize| -> f32 {
        (0..4)
            .map(|i| {
                let p = points[(i + shift) % 4];
                let r = reference[i];
                (p.x - r.x).powi(2) + (p.y - r.y).powi(2)
            })
            .sum()
    };
    let best = (0..4).min_by_key(|&shift| FloatOrd(cost(shift))).unwrap_or(0);
    let mut aligned = *points;
    aligned.rotate_left(best);
    aligned
}

/// Folds each candidate into its predecessor's group while they overlap.
/// Candidates are expected in scan order, so neighbours in the score map are
/// adjacent here and most of the work happens before the quadratic NMS.
#[instrument(level = "debug", skip(candidates), fields(candidates = candidates.len()))]
pub fn merge_locality_aware(candidates: Vec<ScoredQuad>, iou_threshold: f32) -> Vec<MergedQuad> {
    let mut merged = Vec::new();
    let mut current: Option<QuadMerger> = None;
    for candidate in candidates {
        match current.as_mut() {
            Some(group) if polygon_iou(&group.points(), &candidate.points) > iou_threshold => {
                group.add(candidate);
            }
            _ => {
                if let Some(group) = current.replace(QuadMerger::new(candidate)) {
                    merged.push(group.finish());
                }
            }
        }
    }
    merged.extend(current.map(QuadMerger::finish));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: f32, y: f32, w: f32, h: f32, score: f32) -> ScoredQuad {
        ScoredQuad {
            points: [
                Coord { x, y },
                Coord { x: x + w, y },
                Coord { x: x + w, y: y + h },
                Coord { x, y: y + h },
            ],
            score,
        }
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = rect(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = rect(20.0, 20.0, 10.0, 10.0, 1.0);
        assert!((polygon_iou(&a.points, &a.points) - 1.0).abs() < 1e-4);
        assert_eq!(polygon_iou(&a.points, &b.points), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = rect(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = rect(5.0, 0.0, 10.0, 10.0, 1.0);
        // 50 / 150
        assert!((polygon_iou(&a.points, &b.points) - 1.0 / 3.0).abs() < 1e-3);
    }

    #[test]
    fn iou_uses_true_polygon_overlap() {
        // A diamond inscribed in a square covers half of it. Axis-aligned
        // boxes would report a full overlap.
        let square = rect(0.0, 0.0, 10.0, 10.0, 1.0).points;
        let diamond = [
            Coord { x: 5.0, y: 0.0 },
            Coord { x: 10.0, y: 5.0 },
            Coord { x: 5.0, y: 10.0 },
            Coord { x: 0.0, y: 5.0 },
        ];
        assert!((polygon_iou(&square, &diamond) - 0.5).abs() < 1e-3);
    }

    #[test]
    fn iou_of_degenerate_quad_is_zero() {
        let a = rect(0.0, 0.0, 10.0, 10.0, 1.0);
        let point = [Coord { x: 1.0, y: 1.0 }; 4];
        assert_eq!(polygon_iou(&a.points, &point), 0.0);
    }

    #[test]
    fn nms_keeps_best_of_each_cluster() {
        let boxes = vec![
            rect(0.0, 0.0, 10.0, 10.0, 0.7),
            rect(1.0, 0.0, 10.0, 10.0, 0.9),
            rect(50.0, 50.0, 10.0, 10.0, 0.8),
            rect(51.0, 50.0, 10.0, 10.0, 0.6),
        ];
        let kept = suppress_overlapping(boxes, 0.3);
        let scores = kept.iter().map(|it| it.score).collect::<Vec<_>>();
        assert_eq!(scores, vec![0.9, 0.8]);
    }

    #[test]
    fn nms_survivors_and_discards_respect_threshold() {
        let threshold = 0.2;
        let boxes = (0..12)
            .map(|i| {
                let i = i as f32;
                rect(i * 4.0, (i * 7.0) % 13.0, 12.0, 8.0, 1.0 - i * 0.05)
            })
            .collect::<Vec<_>>();
        let kept = suppress_overlapping(boxes.clone(), threshold);

        for (i, a) in kept.iter().enumerate() {
            for b in &kept[i + 1..] {
                assert!(polygon_iou(&a.points, &b.points) <= threshold);
            }
        }
        for dropped in boxes.iter().filter(|it| !kept.contains(it)) {
            assert!(kept.iter().any(|k| {
                k.score >= dropped.score && polygon_iou(&k.points, &dropped.points) > threshold
            }));
        }
    }

    #[test]
    fn nms_of_nothing_is_empty() {
        assert!(suppress_overlapping(Vec::<ScoredQuad>::new(), 0.2).is_empty());
    }

    #[test]
    fn merge_averages_adjacent_overlapping_quads() {
        let candidates = vec![
            rect(0.0, 0.0, 100.0, 20.0, 1.0),
            rect(2.0, 0.0, 100.0, 20.0, 1.0),
            rect(500.0, 0.0, 100.0, 20.0, 0.5),
        ];
        let merged = merge_locality_aware(candidates, 0.2);
        assert_eq!(merged.len(), 2);
        assert!((merged[0].points[0].x - 1.0).abs() < 1e-4);
        assert_eq!(merged[0].members, 2);
        assert!((merged[0].score_sum - 2.0).abs() < 1e-6);
        assert!((merged[0].mean_score() - 1.0).abs() < 1e-6);
        let lone = rect(500.0, 0.0, 100.0, 20.0, 0.5);
        assert_eq!(
            merged[1],
            MergedQuad {
                points: lone.points,
                score_sum: 0.5,
                members: 1,
            }
        );
    }

    #[test]
    fn merge_weights_by_score_and_aligns_vertices() {
        let a = rect(0.0, 0.0, 100.0, 20.0, 0.9);
        let mut b = rect(4.0, 0.0, 100.0, 20.0, 0.3);
        b.points.rotate_left(2);
        let merged = merge_locality_aware(vec![a, b], 0.2);
        assert_eq!(merged.len(), 1);
        // (0 * 0.9 + 4 * 0.3) / 1.2
        assert!((merged[0].points[0].x - 1.0).abs() < 1e-4);
        assert!((merged[0].points[0].y - 0.0).abs() < 1e-4);
        assert!((merged[0].score_sum - 1.2).abs() < 1e-6);
        assert!((merged[0].mean_score() - 0.6).abs() < 1e-6);
    }

    #[test]
    fn well_supported_group_outranks_a_lone_stronger_cell() {
        let line = (0..10)
            .map(|_| rect(8.0, 12.0, 40.0, 16.0, 0.85))
            .collect::<Vec<_>>();
        let mut groups = merge_locality_aware(line, 0.2);
        groups.extend(merge_locality_aware(
            vec![rect(10.0, 16.0, 30.0, 20.0, 0.9)],
            0.2,
        ));
        assert_eq!(groups.len(), 2);

        let kept = suppress_overlapping(groups, 0.2);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].members, 10);
        assert!((kept[0].mean_score() - 0.85).abs() < 1e-5);
        assert!((kept[0].points[0].x - 8.0).abs() < 1e-3);
        assert!((kept[0].points[2].y - 28.0).abs() < 1e-3);
    }
}
