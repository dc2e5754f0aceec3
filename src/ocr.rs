//! Text recognition via the Tesseract CLI.
//!
//! Writes the frame to a temporary PNG, runs the external engine, and
//! returns its stdout. The engine binary is configurable; a missing binary
//! surfaces as `OcrError::EngineMissing` so the loop can tell the user once.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::debug;

use crate::camera::Frame;
use crate::config::OcrConfig;
use crate::error::OcrError;

/// Adapter boundary for the OCR engine.
#[async_trait]
pub trait TextRecognitionAdapter: Send + Sync {
    async fn recognize(&self, frame: &Frame) -> Result<String, OcrError>;
}

pub struct TesseractOcr {
    config: OcrConfig,
    seq: AtomicU64,
}

impl TesseractOcr {
    pub fn new(config: OcrConfig) -> Self {
        Self {
            config,
            seq: AtomicU64::new(0),
        }
    }

    fn scratch_path(&self) -> PathBuf {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "scene-narrator-ocr-{}-{seq}.png",
            std::process::id()
        ))
    }
}

#[async_trait]
impl TextRecognitionAdapter for TesseractOcr {
    async fn recognize(&self, frame: &Frame) -> Result<String, OcrError> {
        let path = self.scratch_path();
        frame
            .image
            .save(&path)
            .map_err(|e| OcrError::Failed(format!("write still frame: {e}")))?;

        let output = tokio::process::Command::new(&self.config.command)
            .arg(&path)
            .arg("stdout")
            .args(["-l", &self.config.language])
            .args(["--psm", &self.config.psm.to_string()])
            .output()
            .await;

        let _ = std::fs::remove_file(&path);

        let output = output.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                OcrError::EngineMissing(self.config.command.clone())
            } else {
                OcrError::Failed(e.to_string())
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OcrError::Failed(format!(
                "{} exited with {}: {}",
                self.config.command,
                output.status,
                stderr.trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        debug!("OCR produced {} chars", text.len());
        Ok(text)
    }
}
