//! Two-stage text extraction: an EAST detector finds rotated text boxes and a
//! CRNN recognizer reads each of them.
//!
//! ```no_run
//! use east_crnn::ExtractorBuilder;
//!
//! let extractor = ExtractorBuilder::new()
//!     .east_checkpoint("model/east")
//!     .crnn_checkpoint("model/crnn")
//!     .build()?;
//! let summary = extractor.extract_dir("scans".as_ref())?;
//! println!("{summary}");
//! # Ok::<(), east_crnn::ExtractError>(())
//! ```

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use image::DynamicImage;
use tracing::instrument;

pub mod charset;
mod config;
mod crnn_net;
mod east_net;
mod error;
pub mod extract;
pub mod nms;
pub mod postprocess;
pub mod registry;
mod result;
mod session;
pub mod util;

pub use config::*;
pub use crnn_net::{CrnnNet, CHARSET_FILE};
pub use east_net::EastNet;
pub use error::{ExtractError, Result};
pub use extract::{ExtractionSummary, ImageReport, LatencyStats, IMAGE_EXTENSIONS};
pub use postprocess::RawMaps;
pub use result::*;
pub use session::MODEL_FILE;

pub use ort as runtime;

/// Produces dense score and geometry maps for a working-size image.
pub trait TextDetector {
    fn infer(&self, image: &DynamicImage) -> Result<RawMaps>;
}

/// Reads the text in one cropped region.
pub trait TextRecognizer {
    fn infer(&self, image: &DynamicImage) -> Result<String>;
}

pub type SharedDetector = Arc<dyn TextDetector + Send + Sync>;
pub type SharedRecognizer = Arc<dyn TextRecognizer + Send + Sync>;

pub struct ExtractorBuilder {
    threads: usize,
    east_path: Option<PathBuf>,
    crnn_path: Option<PathBuf>,
    detection: DetectionOptions,
    recognition: RecognitionOptions,
    execution_providers: Vec<ExecutionProvider>,
}

impl ExtractorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ExtractConfig) -> Self {
        Self::new()
            .threads(config.threads)
            .east_checkpoint(&config.east_checkpoint_dir)
            .crnn_checkpoint(&config.crnn_checkpoint_dir)
            .detection_options(config.detection)
            .recognition_options(config.recognition)
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn east_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.east_path = Some(path.into());
        self
    }

    pub fn crnn_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.crnn_path = Some(path.into());
        self
    }

    pub fn detection_options(mut self, options: DetectionOptions) -> Self {
        self.detection = options;
        self
    }

    pub fn recognition_options(mut self, options: RecognitionOptions) -> Self {
        self.recognition = options;
        self
    }

    pub fn with_execution_providers(
        mut self,
        providers: impl IntoIterator<Item = ExecutionProvider>,
    ) -> Self {
        self.execution_providers = providers.into_iter().collect();
        self
    }

    /// Loads both models through the process-wide cache.
    #[instrument(skip(self))]
    pub fn build(self) -> Result<Extractor> {
        let defaults = ExtractConfig::default();
        let east_path = self.east_path.unwrap_or(defaults.east_checkpoint_dir);
        let crnn_path = self.crnn_path.unwrap_or(defaults.crnn_checkpoint_dir);

        let detector: SharedDetector =
            registry::east_model(&east_path, self.threads, &self.execution_providers)?;
        let recognizer: SharedRecognizer = registry::crnn_model(
            &crnn_path,
            self.recognition,
            self.threads,
            &self.execution_providers,
        )?;
        Ok(Extractor::new(detector, recognizer, self.detection))
    }
}

impl Default for ExtractorBuilder {
    fn default() -> Self {
        Self {
            threads: 4,
            east_path: None,
            crnn_path: None,
            detection: DetectionOptions::default(),
            recognition: RecognitionOptions::default(),
            execution_providers: DEFAULT_PROVIDERS.to_vec(),
        }
    }
}

/// Runs detection and recognition over images. Cheap to clone; the models
/// are shared.
#[derive(Clone)]
pub struct Extractor {
    detector: SharedDetector,
    recognizer: SharedRecognizer,
    options: DetectionOptions,
}

impl Extractor {
    pub fn new(
        detector: SharedDetector,
        recognizer: SharedRecognizer,
        options: DetectionOptions,
    ) -> Self {
        Self {
            detector,
            recognizer,
            options,
        }
    }

    /// Finds the text lines of `image`, in original image coordinates.
    #[instrument(skip(self, image))]
    pub fn detect(&self, image: &DynamicImage) -> Result<Detection> {
        let start = Instant::now();
        let (working, scale) = util::resize_for_detection(
            image,
            self.options.max_side_len,
            self.options.resize_stride,
        );

        let net_start = Instant::now();
        let maps = self.detector.infer(&working)?;
        let net = TimingBreakdown {
            net: net_start.elapsed(),
            ..Default::default()
        };

        let (boxes, post) = postprocess::detect(&maps, scale, &self.options);
        let lines = postprocess::to_text_lines(&boxes, self.options.min_side);
        let mut timing = net.merge(post);
        timing.overall = start.elapsed();
        log::info!(
            "net {:.0}ms, restore {:.0}ms, nms {:.0}ms",
            timing.net_ms(),
            timing.restore_ms(),
            timing.nms_ms()
        );

        Ok(Detection {
            lines,
            timing,
            image_size: (image.width(), image.height()),
            working_size: (scale.target_width, scale.target_height),
        })
    }

    /// Fills in `text` for every line that has a usable crop. Lines without
    /// one keep an empty text. Returns the time spent in the recognizer.
    #[instrument(skip(self, image, lines), fields(lines = lines.len()))]
    pub fn recognize(&self, image: &DynamicImage, lines: &mut [TextLine]) -> Result<Duration> {
        let mut elapsed = Duration::ZERO;
        for line in lines.iter_mut() {
            let Some(rect) = util::crop_rect(line, image.width(), image.height()) else {
                log::debug!("Skipping recognition of empty region {:?}", line.points());
                continue;
            };
            let crop = rect.crop(image);
            let start = Instant::now();
            line.text = self.recognizer.infer(&crop)?;
            elapsed += start.elapsed();
        }
        Ok(elapsed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Default,
    #[cfg(feature = "coreml")]
    CoreML,
    #[cfg(feature = "cuda")]
    Cuda,
    #[cfg(feature = "directml")]
    DirectML,
}

const DEFAULT_PROVIDERS: &[ExecutionProvider] = &[
    #[cfg(feature = "coreml")]
    ExecutionProvider::CoreML,
    #[cfg(feature = "directml")]
    ExecutionProvider::DirectML,
    #[cfg(feature = "cuda")]
    ExecutionProvider::Cuda,
    ExecutionProvider::Default,
];
