use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// One object reported by a blob store listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    /// `/`-separated key, conventionally `<identity>/<filename>`.
    pub key: String,
    pub size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl RemoteObject {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: None,
            last_modified: None,
        }
    }

    /// Keys ending in `/` are empty "folder" markers, never materialized.
    pub fn is_folder_placeholder(&self) -> bool {
        is_folder_placeholder(&self.key)
    }
}

pub fn is_folder_placeholder(key: &str) -> bool {
    key.ends_with('/')
}

/// Feature vector produced by an [`Embedder`](crate::Embedder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "gray-32").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Copy of this embedding scaled to unit length. Zero vectors are returned unchanged.
    pub fn l2_normalized(&self) -> Embedding {
        let norm = self.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            self.values.iter().map(|v| v / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }
}

/// Dissimilarity function between two embeddings. Smaller = more similar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
    EuclideanL2,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::EuclideanL2 => "euclidean_l2",
        }
    }

    pub fn distance(&self, a: &Embedding, b: &Embedding) -> f64 {
        match self {
            DistanceMetric::Cosine => 1.0 - f64::from(a.similarity(b)),
            DistanceMetric::Euclidean => f64::from(a.euclidean_distance(b)),
            DistanceMetric::EuclideanL2 => {
                f64::from(a.l2_normalized().euclidean_distance(&b.l2_normalized()))
            }
        }
    }

    /// Human-facing confidence percentage for a distance.
    ///
    /// `(1 - distance) * 100` only holds for cosine distance; the euclidean
    /// metrics are unbounded (or bounded by 2) and get no confidence at all.
    /// Anti-correlated cosine pairs (distance > 1) clamp to 0.
    pub fn confidence(&self, distance: f64) -> Option<f64> {
        match self {
            DistanceMetric::Cosine => {
                let pct = ((1.0 - distance) * 100.0).clamp(0.0, 100.0);
                Some((pct * 100.0).round() / 100.0)
            }
            DistanceMetric::Euclidean | DistanceMetric::EuclideanL2 => None,
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "euclidean" => Ok(DistanceMetric::Euclidean),
            "euclidean_l2" | "euclidean-l2" => Ok(DistanceMetric::EuclideanL2),
            other => Err(format!("unknown distance metric: {other}")),
        }
    }
}

/// Model, metric, and acceptance threshold for one matching pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,
    pub metric: DistanceMetric,
    /// A candidate is accepted when `distance <= threshold`.
    pub threshold: f64,
}

impl ModelConfig {
    pub fn new(model_id: impl Into<String>, metric: DistanceMetric, threshold: f64) -> Self {
        Self {
            model_id: model_id.into(),
            metric,
            threshold,
        }
    }

    pub fn accepts(&self, distance: f64) -> bool {
        distance <= self.threshold
    }
}

/// One gallery image ranked by a matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    /// Path of the gallery image, under the gallery root.
    pub identity_path: PathBuf,
    pub distance: f64,
}

/// Distinguishes abnormal outcomes from a plain "not recognized".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Probe unreadable, or no detectable face in it.
    DecodeError,
    /// Remote store unreachable and the request could not proceed.
    StoreError,
    /// Request rejected before any I/O.
    ValidationError,
    /// Unexpected matcher or filesystem failure.
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::DecodeError => "decode_error",
            ErrorKind::StoreError => "store_error",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::InternalError => "internal_error",
        };
        f.write_str(s)
    }
}

/// Terminal outcome of one classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatchResult {
    Recognized {
        name: String,
        /// Percentage, present only for metrics bounded to [0, 1].
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
        distance: f64,
    },
    Unrecognized {
        #[serde(rename = "message")]
        reason: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl MatchResult {
    pub fn unrecognized(reason: impl Into<String>) -> Self {
        MatchResult::Unrecognized {
            reason: reason.into(),
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        MatchResult::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            MatchResult::Recognized { .. } => "recognized",
            MatchResult::Unrecognized { .. } => "unrecognized",
            MatchResult::Error { .. } => "error",
        }
    }

    pub fn is_recognized(&self) -> bool {
        matches!(self, MatchResult::Recognized { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            MatchResult::Error { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding { values: values.to_vec(), model_version: None }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(emb(&[0.0, 0.0]).similarity(&emb(&[1.0, 0.0])), 0.0);
    }

    #[test]
    fn test_metric_distances() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[0.0, 2.0]);
        assert!((DistanceMetric::Cosine.distance(&a, &b) - 1.0).abs() < 1e-6);
        assert!((DistanceMetric::Euclidean.distance(&a, &b) - 5f64.sqrt()).abs() < 1e-5);
        assert!((DistanceMetric::EuclideanL2.distance(&a, &b) - 2f64.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_confidence_only_for_cosine() {
        assert_eq!(DistanceMetric::Cosine.confidence(0.4), Some(60.0));
        assert_eq!(DistanceMetric::Cosine.confidence(1.5), Some(0.0));
        assert_eq!(DistanceMetric::Euclidean.confidence(0.4), None);
        assert_eq!(DistanceMetric::EuclideanL2.confidence(0.4), None);
    }

    #[test]
    fn test_metric_parse() {
        assert_eq!("Cosine".parse::<DistanceMetric>(), Ok(DistanceMetric::Cosine));
        assert_eq!("euclidean-l2".parse::<DistanceMetric>(), Ok(DistanceMetric::EuclideanL2));
        assert!("manhattan".parse::<DistanceMetric>().is_err());
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let config = ModelConfig::new("gray-32", DistanceMetric::Cosine, 0.6);
        assert!(config.accepts(0.6));
        assert!(!config.accepts(0.6 + 1e-9));
    }

    #[test]
    fn test_match_result_wire_shape() {
        let recognized = MatchResult::Recognized {
            name: "carol".into(),
            confidence: Some(60.0),
            distance: 0.4,
        };
        let v = serde_json::to_value(&recognized).unwrap();
        assert_eq!(v["status"], "recognized");
        assert_eq!(v["name"], "carol");
        assert_eq!(v["confidence"], 60.0);

        let v = serde_json::to_value(MatchResult::unrecognized("nope")).unwrap();
        assert_eq!(v["status"], "unrecognized");
        assert_eq!(v["message"], "nope");

        let v = serde_json::to_value(MatchResult::error(ErrorKind::DecodeError, "bad")).unwrap();
        assert_eq!(v["status"], "error");
        assert_eq!(v["kind"], "decode_error");
    }

    #[test]
    fn test_folder_placeholder() {
        assert!(RemoteObject::new("alice/").is_folder_placeholder());
        assert!(!RemoteObject::new("alice/img1.jpg").is_folder_placeholder());
    }
}
