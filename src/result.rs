use std::time::Duration;

use geo::Coord;
use serde::{Deserialize, Serialize};

/// Four corners of a text box.
pub type Quad = [Coord<f32>; 4];

/// A quadrilateral with the confidence it was detected with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredQuad {
    pub points: Quad,
    pub score: f32,
}

/// One detected line of text, as written to the output JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLine {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub x3: f32,
    pub y3: f32,
    pub score: f32,
    #[serde(default)]
    pub text: String,
}

impl TextLine {
    pub fn new(points: Quad, score: f32) -> Self {
        let [p0, p1, p2, p3] = points;
        Self {
            x0: p0.x,
            y0: p0.y,
            x1: p1.x,
            y1: p1.y,
            x2: p2.x,
            y2: p2.y,
            x3: p3.x,
            y3: p3.y,
            score,
            text: String::new(),
        }
    }

    pub fn points(&self) -> Quad {
        [
            Coord {
                x: self.x0,
                y: self.y0,
            },
            Coord {
                x: self.x1,
                y: self.y1,
            },
            Coord {
                x: self.x2,
                y: self.y2,
            },
            Coord {
                x: self.x3,
                y: self.y3,
            },
        ]
    }
}

/// Per-stage latency of one detection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimingBreakdown {
    pub net: Duration,
    pub restore: Duration,
    pub nms: Duration,
    pub overall: Duration,
}

impl TimingBreakdown {
    /// Combines the stages measured separately by two callers.
    pub fn merge(self, other: Self) -> Self {
        Self {
            net: self.net + other.net,
            restore: self.restore + other.restore,
            nms: self.nms + other.nms,
            overall: self.overall + other.overall,
        }
    }

    pub fn net_ms(&self) -> f64 {
        self.net.as_secs_f64() * 1000.0
    }

    pub fn restore_ms(&self) -> f64 {
        self.restore.as_secs_f64() * 1000.0
    }

    pub fn nms_ms(&self) -> f64 {
        self.nms.as_secs_f64() * 1000.0
    }

    pub fn overall_ms(&self) -> f64 {
        self.overall.as_secs_f64() * 1000.0
    }
}

/// Output of [`Extractor::detect`](crate::Extractor::detect) for one image.
#[derive(Debug, Clone)]
pub struct Detection {
    pub lines: Vec<TextLine>,
    pub timing: TimingBreakdown,
    /// Original (width, height).
    pub image_size: (u32, u32),
    /// Size the detector actually saw.
    pub working_size: (u32, u32),
}
