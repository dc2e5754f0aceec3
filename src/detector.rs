//! Object detection over an SSD-style ONNX model.
//!
//! Loads the model once at startup (slow, runs on the blocking pool), then
//! decodes boxes/scores/classes per frame into `Detection` values in frame
//! pixel coordinates.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use image::imageops::FilterType;
use ndarray::Array4;
use ort::value::Tensor;
use tracing::{debug, info};

use crate::camera::Frame;
use crate::config::DetectionConfig;
use crate::error::ModelError;

/// Axis-aligned region in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A labeled, scored region found in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub region: Region,
}

/// Adapter boundary for the detection model.
#[async_trait]
pub trait DetectionAdapter: Send + Sync {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, ModelError>;
}

/// SSD-style ONNX detector. Expects a model taking a `[1, H, W, 3]` u8 image
/// tensor and producing `detection_boxes` (normalized ymin/xmin/ymax/xmax),
/// `detection_scores`, and `detection_classes` outputs.
pub struct OnnxDetector {
    // ort 2.0 Session::run needs &mut
    session: Mutex<ort::session::Session>,
    input_name: String,
    labels: Vec<String>,
    input_size: u32,
    min_confidence: f32,
    max_detections: usize,
}

impl OnnxDetector {
    /// Load the ONNX model and label table. Blocking; call in spawn_blocking.
    pub fn load(config: &DetectionConfig) -> Result<Self, ModelError> {
        let model_path = find_model(&config.model_path)?;

        info!("Loading detection model from {}", model_path.display());
        let t0 = Instant::now();

        let session = ort::session::Session::builder()
            .map_err(|e| ModelError::Load(format!("session builder: {e}")))?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            .map_err(|e| ModelError::Load(format!("optimization level: {e}")))?
            .with_intra_threads(4)
            .map_err(|e| ModelError::Load(format!("thread count: {e}")))?
            .commit_from_file(&model_path)
            .map_err(|e| ModelError::Load(format!("{}: {e}", model_path.display())))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| ModelError::Load("model has no inputs".into()))?;

        let labels = load_labels(&config.labels_path)?;

        let load_ms = t0.elapsed().as_millis();
        info!("Detection model loaded in {load_ms}ms ({} labels)", labels.len());

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            labels,
            input_size: config.input_size,
            min_confidence: config.min_confidence,
            max_detections: config.max_detections,
        })
    }
}

#[async_trait]
impl DetectionAdapter for OnnxDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, ModelError> {
        let t0 = Instant::now();
        let size = self.input_size;

        let resized =
            image::imageops::resize(&frame.image, size, size, FilterType::Triangle);

        let mut input = Array4::<u8>::zeros((1, size as usize, size as usize, 3));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                input[[0, y as usize, x as usize, c]] = pixel.0[c];
            }
        }
        let tensor = Tensor::from_array(input)
            .map_err(|e| ModelError::Inference(format!("input tensor: {e}")))?;

        let mut session = self.session.lock().unwrap();
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        let mut boxes: Option<Vec<f32>> = None;
        let mut scores: Option<Vec<f32>> = None;
        let mut classes: Option<Vec<f32>> = None;
        for (name, value) in outputs.iter() {
            let Ok((_shape, data)) = value.try_extract_tensor::<f32>() else {
                continue;
            };
            if name.contains("boxes") {
                boxes = Some(data.to_vec());
            } else if name.contains("scores") {
                scores = Some(data.to_vec());
            } else if name.contains("classes") {
                classes = Some(data.to_vec());
            }
        }

        let (Some(boxes), Some(scores), Some(classes)) = (boxes, scores, classes) else {
            return Err(ModelError::Inference(
                "model outputs missing detection_boxes/scores/classes".into(),
            ));
        };

        let mut detections = decode(
            &self.labels,
            self.min_confidence,
            frame.width() as f32,
            frame.height() as f32,
            &boxes,
            &scores,
            &classes,
        );
        detections.truncate(self.max_detections);

        debug!(
            "Detected {} objects in {:.0}ms",
            detections.len(),
            t0.elapsed().as_secs_f64() * 1000.0
        );
        Ok(detections)
    }
}

/// Decode SSD outputs into pixel-space detections. Boxes are normalized
/// ymin/xmin/ymax/xmax; class ids are 1-based (COCO export convention).
fn decode(
    labels: &[String],
    min_confidence: f32,
    frame_w: f32,
    frame_h: f32,
    boxes: &[f32],
    scores: &[f32],
    classes: &[f32],
) -> Vec<Detection> {
    let mut detections = Vec::new();
    for (i, &score) in scores.iter().enumerate() {
        if score < min_confidence || i * 4 + 3 >= boxes.len() {
            continue;
        }

        let ymin = boxes[i * 4].clamp(0.0, 1.0);
        let xmin = boxes[i * 4 + 1].clamp(0.0, 1.0);
        let ymax = boxes[i * 4 + 2].clamp(0.0, 1.0);
        let xmax = boxes[i * 4 + 3].clamp(0.0, 1.0);

        let class = (classes.get(i).copied().unwrap_or(0.0) as usize).saturating_sub(1);
        let label = labels
            .get(class)
            .cloned()
            .unwrap_or_else(|| format!("object {class}"));

        detections.push(Detection {
            label,
            confidence: score,
            region: Region {
                x: xmin * frame_w,
                y: ymin * frame_h,
                width: (xmax - xmin).max(0.0) * frame_w,
                height: (ymax - ymin).max(0.0) * frame_h,
            },
        });
    }
    detections
}

/// Find the ONNX model file.
fn find_model(configured: &str) -> Result<PathBuf, ModelError> {
    if !configured.is_empty() {
        let path = PathBuf::from(configured);
        if path.exists() {
            return Ok(path);
        }
        return Err(ModelError::Load(format!("{configured} does not exist")));
    }

    let filenames = ["ssd-mobilenet.onnx", "ssd_mobilenet_v2.onnx"];
    let search_dirs: Vec<PathBuf> = [
        std::env::current_dir().ok(),
        dirs::home_dir().map(|h| h.join(".cache/scene-narrator")),
    ]
    .into_iter()
    .flatten()
    .collect();

    for dir in &search_dirs {
        for filename in &filenames {
            let path = dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    Err(ModelError::Load(format!(
        "no detection model found; set detection.model_path (searched {search_dirs:?})"
    )))
}

/// Load the label table, one label per line.
fn load_labels(configured: &str) -> Result<Vec<String>, ModelError> {
    let path = if configured.is_empty() {
        let fallback = PathBuf::from("coco-labels.txt");
        if !fallback.exists() {
            info!("No label table found, class ids will be reported numerically");
            return Ok(Vec::new());
        }
        fallback
    } else {
        PathBuf::from(configured)
    };

    let contents = std::fs::read_to_string(&path)
        .map_err(|e| ModelError::Load(format!("{}: {e}", path.display())))?;
    Ok(contents
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}
