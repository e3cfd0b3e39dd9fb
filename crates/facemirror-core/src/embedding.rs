//! Feature extractors used by the embedding matcher.
//!
//! These are pixel-statistics embedders: they stand in for a neural face
//! model behind the same [`Embedder`] seam, so the gallery index, the
//! distance metrics, and the decision layer run end to end without one.

use crate::types::Embedding;
use image::imageops::FilterType;
use image::DynamicImage;
use thiserror::Error;

// --- Named constants ---
/// Minimum luma standard deviation (0-255 scale) for an image to count as
/// containing a face. Flat frames (lens cap, blank wall) fall below it.
const MIN_LUMA_STDDEV: f32 = 2.0;
const HISTOGRAM_BINS: usize = 32;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("no detectable face")]
    NoFaceDetected,
    #[error("embedding failed: {0}")]
    Failed(String),
}

/// Turns a decoded image into an embedding for one model.
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;

    fn embed(&self, image: &DynamicImage) -> Result<Embedding, EmbedError>;
}

/// Reject images with no usable contrast.
fn check_contrast(luma: &image::GrayImage) -> Result<(), EmbedError> {
    let n = (luma.width() * luma.height()) as f32;
    if n == 0.0 {
        return Err(EmbedError::NoFaceDetected);
    }
    let mean = luma.pixels().map(|p| f32::from(p.0[0])).sum::<f32>() / n;
    let var = luma
        .pixels()
        .map(|p| (f32::from(p.0[0]) - mean).powi(2))
        .sum::<f32>()
        / n;
    if var.sqrt() < MIN_LUMA_STDDEV {
        return Err(EmbedError::NoFaceDetected);
    }
    Ok(())
}

/// Downscaled, zero-mean, unit-length luma grid (`side` x `side`).
pub struct GrayscaleEmbedder {
    model_id: String,
    side: u32,
}

impl GrayscaleEmbedder {
    pub fn new(side: u32) -> Self {
        let side = side.max(2);
        Self {
            model_id: format!("gray-{side}"),
            side,
        }
    }
}

impl Embedder for GrayscaleEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed(&self, image: &DynamicImage) -> Result<Embedding, EmbedError> {
        let luma = image.to_luma8();
        check_contrast(&luma)?;

        let small = image::imageops::resize(&luma, self.side, self.side, FilterType::Triangle);
        let raw: Vec<f32> = small.pixels().map(|p| f32::from(p.0[0]) / 255.0).collect();
        let mean = raw.iter().sum::<f32>() / raw.len() as f32;
        let centered = Embedding {
            values: raw.iter().map(|v| v - mean).collect(),
            model_version: Some(self.model_id.clone()),
        };
        Ok(centered.l2_normalized())
    }
}

/// Normalized luma histogram. Insensitive to pose, sensitive to exposure.
pub struct HistogramEmbedder {
    model_id: String,
}

impl HistogramEmbedder {
    pub fn new() -> Self {
        Self {
            model_id: format!("histogram-{HISTOGRAM_BINS}"),
        }
    }
}

impl Default for HistogramEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl Embedder for HistogramEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed(&self, image: &DynamicImage) -> Result<Embedding, EmbedError> {
        let luma = image.to_luma8();
        check_contrast(&luma)?;

        let mut bins = vec![0f32; HISTOGRAM_BINS];
        for p in luma.pixels() {
            let idx = usize::from(p.0[0]) * HISTOGRAM_BINS / 256;
            bins[idx] += 1.0;
        }
        let total = (luma.width() * luma.height()) as f32;
        Ok(Embedding {
            values: bins.into_iter().map(|c| c / total).collect(),
            model_version: Some(self.model_id.clone()),
        })
    }
}

/// The embedders shipped with the crate, in default configuration order.
pub fn builtin_embedders() -> Vec<Box<dyn Embedder>> {
    vec![
        Box::new(GrayscaleEmbedder::new(32)),
        Box::new(GrayscaleEmbedder::new(16)),
        Box::new(HistogramEmbedder::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn gradient(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(w, h, |x, _| Luma([(x * 255 / w) as u8])))
    }

    #[test]
    fn test_grayscale_embedding_is_unit_length() {
        let e = GrayscaleEmbedder::new(16).embed(&gradient(64, 64)).unwrap();
        assert_eq!(e.values.len(), 256);
        let norm: f32 = e.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert_eq!(e.model_version.as_deref(), Some("gray-16"));
    }

    #[test]
    fn test_tiny_side_is_clamped_in_model_id() {
        let embedder = GrayscaleEmbedder::new(1);
        assert_eq!(embedder.model_id(), "gray-2");
        let e = embedder.embed(&gradient(8, 8)).unwrap();
        assert_eq!(e.values.len(), 4);
        assert_eq!(e.model_version.as_deref(), Some("gray-2"));
    }

    #[test]
    fn test_flat_image_has_no_face() {
        let flat = DynamicImage::ImageLuma8(GrayImage::from_pixel(32, 32, Luma([128])));
        assert!(matches!(
            GrayscaleEmbedder::new(16).embed(&flat),
            Err(EmbedError::NoFaceDetected)
        ));
        assert!(matches!(
            HistogramEmbedder::new().embed(&flat),
            Err(EmbedError::NoFaceDetected)
        ));
    }

    #[test]
    fn test_histogram_sums_to_one() {
        let e = HistogramEmbedder::new().embed(&gradient(40, 10)).unwrap();
        assert_eq!(e.values.len(), HISTOGRAM_BINS);
        let sum: f32 = e.values.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_builtin_model_ids() {
        let ids: Vec<String> = builtin_embedders()
            .iter()
            .map(|e| e.model_id().to_string())
            .collect();
        assert_eq!(ids, vec!["gray-32", "gray-16", "histogram-32"]);
    }
}
