use crate::error::ClassifierError;
use async_trait::async_trait;
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// One label with the classifier's confidence in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    /// In [0, 1].
    pub confidence: f64,
}

impl Classification {
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// An external image classifier addressed by a function or model identifier.
/// Treated as unreliable: every caller has a deterministic fallback.
#[async_trait]
pub trait VisualClassifier: Send + Sync {
    async fn classify(&self, image: &RgbImage, function_id: &str) -> Result<Classification, ClassifierError>;
}
