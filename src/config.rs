//! Configuration management for scene-narrator-rs.
//!
//! Loads config from YAML files in standard locations. Defaults carry the
//! tuned thresholds and cadences; a missing or malformed file degrades to
//! those defaults rather than failing startup.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Device path, e.g. /dev/video0. A stub:// path selects the synthetic
    /// source used for demos and tests.
    pub device: String,
    pub width: u32,
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            width: 640,
            height: 480,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Path to an SSD-style ONNX model. Empty means search the working
    /// directory and ~/.cache/scene-narrator for ssd-mobilenet.onnx.
    pub model_path: String,
    /// Path to the label table, one label per line.
    pub labels_path: String,
    /// Square input size the model expects.
    pub input_size: u32,
    /// Detections below this score are discarded by the adapter itself.
    pub min_confidence: f32,
    pub max_detections: usize,
    /// Minimum confidence for a detection to be narrated.
    pub speech_confidence: f32,
    /// Minimum confidence for a detection to be drawn on the overlay.
    /// Lower than the speech threshold: visual feedback is more permissive.
    pub overlay_confidence: f32,
    /// Seconds between automatic cycle starts.
    pub interval: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            labels_path: String::new(),
            input_size: 300,
            min_confidence: 0.25,
            max_detections: 100,
            speech_confidence: 0.55,
            overlay_confidence: 0.50,
            interval: 1.4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    /// External OCR command. Must accept `<image> stdout -l <lang> --psm <n>`.
    pub command: String,
    pub language: String,
    pub psm: u32,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            command: "tesseract".into(),
            language: "eng".into(),
            psm: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NarrationConfig {
    pub enabled: bool,
    pub voice: String,
    pub rate: f32,
    /// Milliseconds between a narration decision and the speak call, so the
    /// audio subsystem is never invoked synchronously inside a cycle.
    pub defer_ms: u64,
    pub model_path: String,
    pub voices_path: String,
    pub tokenizer_path: String,
}

impl Default for NarrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            voice: "af_heart".into(),
            rate: 1.0,
            defer_ms: 100,
            model_path: String::new(),
            voices_path: String::new(),
            tokenizer_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub enabled: bool,
    /// Where the annotated preview frame is written each scene cycle.
    pub preview_path: String,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            preview_path: "/tmp/scene-narrator-preview.png".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub notifications: bool,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            notifications: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    pub ocr: OcrConfig,
    pub narration: NarrationConfig,
    pub overlay: OverlayConfig,
    pub feedback: FeedbackConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/scene-narrator/config.yaml
    /// 3. /etc/scene-narrator/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/scene-narrator/config.yaml")),
                Some(PathBuf::from("/etc/scene-narrator/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match serde_yml::from_str(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_documented_constants() {
        let config = Config::default();
        assert_eq!(config.detection.speech_confidence, 0.55);
        assert_eq!(config.detection.overlay_confidence, 0.50);
        assert_eq!(config.detection.interval, 1.4);
        assert_eq!(config.narration.defer_ms, 100);
    }

    #[test]
    fn partial_yaml_fills_missing_sections() {
        let yaml = "camera:\n  device: stub://bench\n";
        let config: Config = serde_yml::from_str(yaml).unwrap();
        assert_eq!(config.camera.device, "stub://bench");
        assert_eq!(config.camera.width, 640);
        assert_eq!(config.ocr.command, "tesseract");
    }

    #[test]
    fn load_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "detection:\n  interval: 2.0\n").unwrap();
        let config = Config::load(Some(&path));
        assert_eq!(config.detection.interval, 2.0);
    }

    #[test]
    fn malformed_yaml_degrades_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "detection: [not, a, mapping\n").unwrap();
        let config = Config::load(Some(&path));
        assert_eq!(config.detection.interval, 1.4);
    }
}
