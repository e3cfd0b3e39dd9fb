//! Runs the match engine once per configured model.

use crate::engine::MatchEngine;
use crate::types::{ErrorKind, MatchResult, ModelConfig};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;

/// Per-model results, in configured model order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelComparison {
    entries: Vec<(String, MatchResult)>,
}

impl ModelComparison {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, model_id: &str) -> Option<&MatchResult> {
        self.entries
            .iter()
            .find(|(id, _)| id == model_id)
            .map(|(_, r)| r)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MatchResult)> {
        self.entries.iter().map(|(id, r)| (id.as_str(), r))
    }
}

/// Serializes as a JSON object keyed by model id, preserving order.
impl Serialize for ModelComparison {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (id, result) in &self.entries {
            map.serialize_entry(id, result)?;
        }
        map.end()
    }
}

pub struct ModelComparator<'a> {
    engine: &'a MatchEngine,
}

impl<'a> ModelComparator<'a> {
    pub fn new(engine: &'a MatchEngine) -> Self {
        Self { engine }
    }

    /// Classify `probe` with every model in `configs`.
    ///
    /// A model whose pass fails (error result or panic) gets an `Error`
    /// entry; the remaining models still run.
    pub fn compare_all(
        &self,
        probe: &Path,
        mirror_root: &Path,
        configs: &[ModelConfig],
    ) -> ModelComparison {
        let mut entries = Vec::with_capacity(configs.len());
        for config in configs {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                self.engine.classify(probe, mirror_root, config)
            }));
            let result = match outcome {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "matcher panicked".to_string());
                    tracing::error!(model = %config.model_id, %message, "model pass panicked");
                    MatchResult::error(ErrorKind::InternalError, message)
                }
            };
            tracing::debug!(model = %config.model_id, status = result.status(), "model pass done");
            entries.push((config.model_id.clone(), result));
        }
        ModelComparison { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{Matcher, MatcherError};
    use crate::types::{DistanceMetric, MatchCandidate};
    use std::path::PathBuf;
    use std::sync::Arc;

    /// Model "boom" panics, "broken" errors, everything else matches alice.
    struct PerModel;

    impl Matcher for PerModel {
        fn find(
            &self,
            _probe: &Path,
            gallery: &Path,
            model_id: &str,
            _metric: DistanceMetric,
        ) -> Result<Vec<MatchCandidate>, MatcherError> {
            match model_id {
                "boom" => panic!("model exploded"),
                "broken" => Err(MatcherError::Index("corrupt index".into())),
                _ => Ok(vec![MatchCandidate {
                    identity_path: gallery.join("alice").join("a.jpg"),
                    distance: 0.1,
                }]),
            }
        }
    }

    fn configs(ids: &[&str]) -> Vec<ModelConfig> {
        ids.iter()
            .map(|id| ModelConfig::new(*id, DistanceMetric::Cosine, 0.5))
            .collect()
    }

    #[test]
    fn test_failing_model_is_isolated() {
        let engine = MatchEngine::new(Arc::new(PerModel));
        let comparison = ModelComparator::new(&engine).compare_all(
            Path::new("/p.jpg"),
            &PathBuf::from("/m"),
            &configs(&["first", "broken", "third"]),
        );

        assert_eq!(comparison.len(), 3);
        assert!(comparison.get("first").unwrap().is_recognized());
        assert_eq!(
            comparison.get("broken").unwrap().error_kind(),
            Some(ErrorKind::InternalError)
        );
        assert!(comparison.get("third").unwrap().is_recognized());
    }

    #[test]
    fn test_panicking_model_is_isolated() {
        let engine = MatchEngine::new(Arc::new(PerModel));
        let comparison = ModelComparator::new(&engine).compare_all(
            Path::new("/p.jpg"),
            Path::new("/m"),
            &configs(&["first", "boom", "third"]),
        );

        assert_eq!(comparison.len(), 3);
        match comparison.get("boom").unwrap() {
            MatchResult::Error { kind, message } => {
                assert_eq!(*kind, ErrorKind::InternalError);
                assert!(message.contains("model exploded"));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(comparison.get("third").unwrap().is_recognized());
    }

    #[test]
    fn test_serializes_in_configured_order() {
        let engine = MatchEngine::new(Arc::new(PerModel));
        let comparison = ModelComparator::new(&engine).compare_all(
            Path::new("/p.jpg"),
            Path::new("/m"),
            &configs(&["zeta", "alpha", "broken"]),
        );
        let json = serde_json::to_string(&comparison).unwrap();
        let zeta = json.find("\"zeta\"").unwrap();
        let alpha = json.find("\"alpha\"").unwrap();
        let broken = json.find("\"broken\"").unwrap();
        assert!(zeta < alpha && alpha < broken);
    }
}
