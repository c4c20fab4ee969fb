use image::DynamicImage;
use ndarray::{Array2, Array4};
use ort::session::{Session, SessionInputValue, SessionOutputs};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

/// Normalization statistics the backbone was trained with (ImageNet).
const CHANNEL_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const CHANNEL_STD: [f32; 3] = [0.229, 0.224, 0.225];

const INPUT_SIZE: (u32, u32) = (224, 224);

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("decode: {0}")]
    Decode(String),
    #[error("inference: {0}")]
    Inference(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Real,
    Ai,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Real => "real",
            Label::Ai => "ai",
        }
    }
}

/// Classifier output: predicted class and its softmax probability.
#[derive(Debug, Clone, Copy)]
pub struct Verdict {
    pub label: Label,
    pub confidence: f32,
}

/// Seam for the moderation pipeline; the production implementation is the
/// ONNX model pair, tests substitute their own.
pub trait ImageClassifier: Send + Sync {
    fn classify(&self, bytes: &[u8]) -> Result<Verdict, ClassifyError>;
}

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub model_dir: PathBuf,
    pub backbone_url: Option<String>,
    pub head_url: Option<String>,
    pub device: String,
}

impl ModelConfig {
    pub fn from_env() -> Self {
        Self {
            model_dir: std::env::var("MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("models")),
            backbone_url: std::env::var("MODEL_BACKBONE_URL").ok(),
            head_url: std::env::var("MODEL_HEAD_URL").ok(),
            device: std::env::var("MODEL_DEVICE").unwrap_or_else(|_| "cpu".into()),
        }
    }

    fn backbone_path(&self) -> PathBuf {
        self.model_dir.join("backbone.onnx")
    }

    fn head_path(&self) -> PathBuf {
        self.model_dir.join("head.onnx")
    }
}

// ---------------- one-time model initialization ----------------

/// Once-cell wrapper with an observable load counter. Concurrent first
/// callers are serialized; the loader runs at most once per successful init.
pub struct LoadOnce<T> {
    cell: tokio::sync::OnceCell<Arc<T>>,
    loads: AtomicUsize,
}

impl<T> LoadOnce<T> {
    pub const fn new() -> Self {
        Self {
            cell: tokio::sync::OnceCell::const_new(),
            loads: AtomicUsize::new(0),
        }
    }

    pub async fn get_or_try_init<F, Fut>(&self, load: F) -> anyhow::Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<Arc<T>>>,
    {
        let value = self
            .cell
            .get_or_try_init(|| async {
                self.loads.fetch_add(1, Ordering::SeqCst);
                load().await
            })
            .await?;
        Ok(value.clone())
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

static MODEL: LoadOnce<DetectorModel> = LoadOnce::new();

/// Process-wide detector instance. The first call loads (and if necessary
/// fetches) the weights; every later call returns the same instance.
pub async fn get_model(cfg: &ModelConfig) -> anyhow::Result<Arc<DetectorModel>> {
    let cfg = cfg.clone();
    MODEL
        .get_or_try_init(|| async move {
            let backbone = ensure_weights(&cfg.backbone_path(), cfg.backbone_url.as_deref()).await?;
            let head = ensure_weights(&cfg.head_path(), cfg.head_url.as_deref()).await?;
            info!(device = %cfg.device, "loading authenticity detector");
            let model =
                tokio::task::spawn_blocking(move || DetectorModel::load(&backbone, &head))
                    .await??;
            metrics::increment_counter!("detector_model_loads_total");
            Ok(Arc::new(model))
        })
        .await
}

pub fn model_load_count() -> usize {
    MODEL.load_count()
}

/// Resolve a weight file: local cache wins, otherwise fetch once and persist.
async fn ensure_weights(path: &Path, url: Option<&str>) -> anyhow::Result<PathBuf> {
    if path.exists() {
        info!(path = %path.display(), "using cached model weights");
        return Ok(path.to_path_buf());
    }
    let url = url.ok_or_else(|| {
        anyhow::anyhow!(
            "model weights missing at {} and no download URL configured",
            path.display()
        )
    })?;
    info!(%url, path = %path.display(), "fetching model weights (first run)");
    let response = reqwest::get(url).await?.error_for_status()?;
    let bytes = response.bytes().await?;
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(path, &bytes).await?;
    info!(path = %path.display(), size = bytes.len(), "persisted model weights");
    Ok(path.to_path_buf())
}

// ---------------- detector ----------------

struct Sessions {
    backbone: Session,
    head: Session,
}

/// Frozen backbone + fine-tuned classification head, both ONNX sessions.
/// Inference-only; deterministic for fixed weights.
pub struct DetectorModel {
    sessions: Mutex<Sessions>,
}

impl DetectorModel {
    pub fn load(backbone_path: &Path, head_path: &Path) -> anyhow::Result<Self> {
        let backbone = Session::builder()
            .map_err(|e| anyhow::anyhow!("onnx session builder: {e}"))?
            .commit_from_file(backbone_path)
            .map_err(|e| anyhow::anyhow!("load backbone {}: {e}", backbone_path.display()))?;
        let head = Session::builder()
            .map_err(|e| anyhow::anyhow!("onnx session builder: {e}"))?
            .commit_from_file(head_path)
            .map_err(|e| anyhow::anyhow!("load head {}: {e}", head_path.display()))?;
        Ok(Self {
            sessions: Mutex::new(Sessions { backbone, head }),
        })
    }

    fn run_sessions(&self, input: Array4<f32>) -> Result<Vec<f32>, ClassifyError> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|e| ClassifyError::Inference(format!("session lock: {e}")))?;

        let embedding = {
            let value = ort::value::Value::from_array(input)
                .map_err(|e| ClassifyError::Inference(e.to_string()))?;
            let inputs: Vec<(Cow<'_, str>, SessionInputValue<'_>)> =
                vec![(Cow::Borrowed("input"), SessionInputValue::from(value))];
            let outputs: SessionOutputs = sessions
                .backbone
                .run(inputs)
                .map_err(|e| ClassifyError::Inference(e.to_string()))?;
            let output = outputs
                .get("output")
                .ok_or_else(|| ClassifyError::Inference("backbone output missing".into()))?;
            let (_, data) = output
                .try_extract_tensor::<f32>()
                .map_err(|e| ClassifyError::Inference(e.to_string()))?;
            data.to_vec()
        };

        let embedding_len = embedding.len();
        let embedding = Array2::from_shape_vec((1, embedding_len), embedding)
            .map_err(|e| ClassifyError::Inference(e.to_string()))?;
        let value = ort::value::Value::from_array(embedding)
            .map_err(|e| ClassifyError::Inference(e.to_string()))?;
        let inputs: Vec<(Cow<'_, str>, SessionInputValue<'_>)> =
            vec![(Cow::Borrowed("input"), SessionInputValue::from(value))];
        let outputs: SessionOutputs = sessions
            .head
            .run(inputs)
            .map_err(|e| ClassifyError::Inference(e.to_string()))?;
        let output = outputs
            .get("output")
            .ok_or_else(|| ClassifyError::Inference("head output missing".into()))?;
        let (_, logits) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifyError::Inference(e.to_string()))?;
        if logits.len() < 2 {
            return Err(ClassifyError::Inference(format!(
                "head produced {} logits, expected 2",
                logits.len()
            )));
        }
        Ok(logits.to_vec())
    }
}

impl ImageClassifier for DetectorModel {
    fn classify(&self, bytes: &[u8]) -> Result<Verdict, ClassifyError> {
        let img = image::load_from_memory(bytes).map_err(|e| {
            warn!("image decode failed: {e}");
            ClassifyError::Decode(e.to_string())
        })?;
        let input = preprocess(&img);
        let logits = self.run_sessions(input)?;
        let probs = softmax(&logits[..2]);
        // Class order fixed by training: 0 = real, 1 = ai.
        let (label, confidence) = if probs[1] > probs[0] {
            (Label::Ai, probs[1])
        } else {
            (Label::Real, probs[0])
        };
        Ok(Verdict { label, confidence })
    }
}

/// Decode → RGB → exact resize to the model input → [0,1] → channel
/// normalization, NCHW layout.
fn preprocess(img: &DynamicImage) -> Array4<f32> {
    let img = img.resize_exact(
        INPUT_SIZE.0,
        INPUT_SIZE.1,
        image::imageops::FilterType::Lanczos3,
    );
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for y in 0..height {
        for x in 0..width {
            let pixel = rgb.get_pixel(x, y);
            for c in 0..3 {
                let scaled = pixel[c] as f32 / 255.0;
                tensor[[0, c, y as usize, x as usize]] =
                    (scaled - CHANNEL_MEAN[c]) / CHANNEL_STD[c];
            }
        }
    }
    tensor
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}
