use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ExtractError, Result};

/// Environment variable naming an optional JSON configuration file.
pub const CONFIG_ENV: &str = "EAST_CRNN_CONFIG";
pub const EAST_CHECKPOINT_ENV: &str = "EAST_CHECKPOINT_DIR";
pub const CRNN_CHECKPOINT_ENV: &str = "CRNN_CHECKPOINT_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct DetectionOptions {
    /// Longest side of the working image.
    pub max_side_len: u32,
    /// Working dimensions are floored to a multiple of this.
    pub resize_stride: u32,
    /// Working-image pixels per score-map cell.
    pub map_stride: u32,
    pub score_map_threshold: f32,
    /// IoU above which neighbouring candidates are averaged together.
    pub merge_threshold: f32,
    pub nms_threshold: f32,
    /// Minimum mean score of a box after suppression.
    pub box_threshold: f32,
    /// Shortest allowed box edge, in original image pixels.
    pub min_side: f32,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            max_side_len: 2400,
            resize_stride: 32,
            map_stride: 4,
            score_map_threshold: 0.8,
            merge_threshold: 0.2,
            nms_threshold: 0.2,
            box_threshold: 0.1,
            min_side: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RecognitionOptions {
    pub input_width: u32,
    pub input_height: u32,
}

impl Default for RecognitionOptions {
    fn default() -> Self {
        Self {
            input_width: 100,
            input_height: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub east_checkpoint_dir: PathBuf,
    pub crnn_checkpoint_dir: PathBuf,
    pub threads: usize,
    pub detection: DetectionOptions,
    pub recognition: RecognitionOptions,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            east_checkpoint_dir: "model/east".into(),
            crnn_checkpoint_dir: "model/crnn".into(),
            threads: 4,
            detection: DetectionOptions::default(),
            recognition: RecognitionOptions::default(),
        }
    }
}

impl ExtractConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, overlaid with the file named by [`CONFIG_ENV`] and the
    /// checkpoint directory variables.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => {
                log::debug!("Loading configuration from {path:?}");
                Self::from_file(Path::new(&path))?
            }
            None => Self::default(),
        };
        if let Some(dir) = std::env::var_os(EAST_CHECKPOINT_ENV) {
            config.east_checkpoint_dir = dir.into();
        }
        if let Some(dir) = std::env::var_os(CRNN_CHECKPOINT_ENV) {
            config.crnn_checkpoint_dir = dir.into();
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let detection = &self.detection;
        if detection.max_side_len == 0 || detection.resize_stride == 0 || detection.map_stride == 0
        {
            return Err(ExtractError::Config(
                "max_side_len, resize_stride and map_stride must be positive".to_string(),
            ));
        }
        if detection.max_side_len < detection.resize_stride {
            return Err(ExtractError::Config(format!(
                "max_side_len {} is smaller than resize_stride {}",
                detection.max_side_len, detection.resize_stride
            )));
        }
        if self.recognition.input_width == 0 || self.recognition.input_height == 0 {
            return Err(ExtractError::Config(
                "recognition input size must be positive".to_string(),
            ));
        }
        if self.threads == 0 {
            return Err(ExtractError::Config("threads must be positive".to_string()));
        }
        Ok(())
    }
}
