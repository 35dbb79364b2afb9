//! Directory walking and per-image output files.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use image::{DynamicImage, ImageReader};
use tracing::instrument;

use crate::{
    error::{ExtractError, Result},
    Extractor, TextLine,
};

/// Extensions (without the dot, case-sensitive) treated as images.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tiff", "tif", "bmp"];

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext))
}

/// Where the records for `image_path` are written.
pub fn output_path(image_path: &Path) -> PathBuf {
    image_path.with_extension("json")
}

/// Every image below `dir`, in a stable order.
pub fn collect_images(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    walk(dir, &mut found)?;
    Ok(found)
}

fn walk(dir: &Path, found: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            if let Err(err) = walk(&path, found) {
                log::warn!("Skipping unreadable directory {path:?}: {err}");
            }
        } else if is_image(&path) {
            found.push(path);
        }
    }
    Ok(())
}

fn decode(path: &Path) -> Result<DynamicImage> {
    let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    Ok(DynamicImage::ImageRgb8(image.into_rgb8()))
}

/// Running totals over one directory walk.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyStats {
    pub images: usize,
    pub detection: Duration,
    pub recognition: Duration,
}

/// Mean per-image latency of each stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AverageLatency {
    pub detection: Duration,
    pub recognition: Duration,
}

impl AverageLatency {
    pub fn total(&self) -> Duration {
        self.detection + self.recognition
    }
}

impl LatencyStats {
    pub fn record(&mut self, detection: Duration, recognition: Duration) {
        self.images += 1;
        self.detection += detection;
        self.recognition += recognition;
    }

    /// `None` until at least one image has been recorded.
    pub fn average(&self) -> Option<AverageLatency> {
        let images = u32::try_from(self.images).ok().filter(|n| *n > 0)?;
        Some(AverageLatency {
            detection: self.detection / images,
            recognition: self.recognition / images,
        })
    }
}

/// What happened to one image that produced an output file.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageReport {
    pub output: PathBuf,
    pub lines: usize,
    pub detection: Duration,
    pub recognition: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionSummary {
    pub stats: LatencyStats,
    /// Files with an image extension that could not be decoded.
    pub skipped: usize,
    /// Images that decoded but failed in a later step.
    pub failed: usize,
}

impl fmt::Display for ExtractionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stats.average() {
            Some(average) => write!(
                f,
                "Done! Took {:.2}s on average (EAST: {:.2}s, CRNN: {:.2}s) over {} images.",
                average.total().as_secs_f64(),
                average.detection.as_secs_f64(),
                average.recognition.as_secs_f64(),
                self.stats.images
            )?,
            None => write!(f, "Done! No images were processed.")?,
        }
        if self.skipped > 0 || self.failed > 0 {
            write!(f, " ({} skipped, {} failed)", self.skipped, self.failed)?;
        }
        Ok(())
    }
}

impl Extractor {
    /// Detects and reads all text lines of one decoded image. Returns the
    /// records plus the time spent detecting and recognizing.
    #[instrument(skip(self, image))]
    pub fn extract_image(
        &self,
        image: &DynamicImage,
    ) -> Result<(Vec<TextLine>, Duration, Duration)> {
        let start = Instant::now();
        let detection = self.detect(image)?;
        let detection_time = start.elapsed();
        log::debug!("Detection timing: {:?}", detection.timing);

        let mut lines = detection.lines;
        let recognition_time = self.recognize(image, &mut lines)?;
        Ok((lines, detection_time, recognition_time))
    }

    /// Processes one file and writes its JSON next to it. `Ok(None)` means the
    /// file could not be decoded and was skipped.
    #[instrument(skip(self))]
    pub fn process_file(&self, path: &Path) -> Result<Option<ImageReport>> {
        let image = match decode(path) {
            Ok(image) => image,
            Err(err) => {
                log::warn!("Skipping {path:?}, can't decode it: {err}");
                return Ok(None);
            }
        };

        let (lines, detection, recognition) = self.extract_image(&image)?;
        let output = output_path(path);
        fs::write(&output, serde_json::to_string(&lines)?)?;
        log::info!("Wrote {} lines to {output:?}", lines.len());

        Ok(Some(ImageReport {
            output,
            lines: lines.len(),
            detection,
            recognition,
        }))
    }

    /// Walks `dir` recursively and writes one JSON file per image. Only a
    /// missing or unreadable `dir` is an error; per-file problems are logged
    /// and counted.
    #[instrument(skip(self))]
    pub fn extract_dir(&self, dir: &Path) -> Result<ExtractionSummary> {
        if !dir.exists() {
            return Err(ExtractError::MissingDirectory(dir.to_path_buf()));
        }
        let images = collect_images(dir)?;
        log::info!("Found {} images in {dir:?}", images.len());

        let mut summary = ExtractionSummary::default();
        for path in images {
            match self.process_file(&path) {
                Ok(Some(report)) => summary.stats.record(report.detection, report.recognition),
                Ok(None) => summary.skipped += 1,
                Err(err) => {
                    log::error!("Failed to extract {path:?}: {err}");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_allow_list_is_exact() {
        for name in ["a.jpg", "a.jpeg", "dir/a.png", "a.tiff", "a.tif", "a.bmp"] {
            assert!(is_image(Path::new(name)), "{name}");
        }
        for name in ["a.JPG", "a.json", "abmp", "a.xbmp", ".png", "a"] {
            assert!(!is_image(Path::new(name)), "{name}");
        }
    }

    #[test]
    fn output_sits_next_to_the_image() {
        assert_eq!(
            output_path(Path::new("scans/page.1.png")),
            PathBuf::from("scans/page.1.json")
        );
    }

    #[test]
    fn walk_is_recursive_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b/nested")).unwrap();
        for name in ["z.png", "a.jpg", "notes.txt", "b/nested/c.bmp", "b/d.tif"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let found = collect_images(dir.path()).unwrap();
        let relative = found
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect::<Vec<_>>();
        assert_eq!(
            relative,
            ["a.jpg", "b/d.tif", "b/nested/c.bmp", "z.png"]
                .map(PathBuf::from)
                .to_vec()
        );
    }

    #[test]
    fn average_is_guarded_for_zero_images() {
        let stats = LatencyStats::default();
        assert_eq!(stats.average(), None);
        assert_eq!(
            ExtractionSummary::default().to_string(),
            "Done! No images were processed."
        );
    }

    #[test]
    fn average_divides_totals() {
        let mut stats = LatencyStats::default();
        stats.record(Duration::from_millis(300), Duration::from_millis(100));
        stats.record(Duration::from_millis(100), Duration::from_millis(300));
        let average = stats.average().unwrap();
        assert_eq!(average.detection, Duration::from_millis(200));
        assert_eq!(average.recognition, Duration::from_millis(200));

        let summary = ExtractionSummary {
            stats,
            skipped: 1,
            failed: 0,
        };
        assert_eq!(
            summary.to_string(),
            "Done! Took 0.40s on average (EAST: 0.20s, CRNN: 0.20s) over 2 images. (1 skipped, 0 failed)"
        );
    }
}
