use crate::matcher::Matcher;
use crate::types::{ErrorKind, MatchCandidate, MatchResult, ModelConfig};
use std::path::{Component, Path};
use std::sync::Arc;

pub const NO_CANDIDATES: &str = "no matching face in gallery";
pub const ABOVE_THRESHOLD: &str = "best candidate above threshold";

/// One matching pass: matcher call, best-candidate selection, threshold
/// policy, identity labelling, and confidence.
#[derive(Clone)]
pub struct MatchEngine {
    matcher: Arc<dyn Matcher>,
}

impl MatchEngine {
    pub fn new(matcher: Arc<dyn Matcher>) -> Self {
        Self { matcher }
    }

    /// Classify a probe image against the gallery under `mirror_root`.
    ///
    /// Never fails: matcher errors come back as [`MatchResult::Error`], with
    /// probe problems (unreadable image, no face) tagged as decode errors.
    pub fn classify(&self, probe: &Path, mirror_root: &Path, config: &ModelConfig) -> MatchResult {
        let candidates =
            match self
                .matcher
                .find(probe, mirror_root, &config.model_id, config.metric)
            {
                Ok(c) => c,
                Err(e) if e.is_probe_failure() => {
                    tracing::info!(model = %config.model_id, error = %e, "probe rejected");
                    return MatchResult::error(ErrorKind::DecodeError, e.to_string());
                }
                Err(e) => {
                    tracing::error!(model = %config.model_id, error = %e, "matcher failed");
                    return MatchResult::error(ErrorKind::InternalError, e.to_string());
                }
            };

        let Some(best) = best_candidate(&candidates) else {
            tracing::debug!(model = %config.model_id, "no candidates");
            return MatchResult::unrecognized(NO_CANDIDATES);
        };

        if !config.accepts(best.distance) {
            tracing::info!(
                model = %config.model_id,
                distance = best.distance,
                threshold = config.threshold,
                "best candidate above threshold"
            );
            return MatchResult::unrecognized(ABOVE_THRESHOLD);
        }

        let Some(name) = identity_label(&best.identity_path, mirror_root) else {
            return MatchResult::error(
                ErrorKind::InternalError,
                format!(
                    "cannot derive identity from {}",
                    best.identity_path.display()
                ),
            );
        };

        let confidence = config.metric.confidence(best.distance);
        tracing::info!(
            model = %config.model_id,
            name = %name,
            distance = best.distance,
            confidence = ?confidence,
            "face recognized"
        );
        MatchResult::Recognized {
            name,
            confidence,
            distance: best.distance,
        }
    }
}

/// Smallest finite distance; ties go to the first-listed candidate.
pub fn best_candidate(candidates: &[MatchCandidate]) -> Option<&MatchCandidate> {
    let mut best: Option<&MatchCandidate> = None;
    for candidate in candidates {
        if !candidate.distance.is_finite() {
            tracing::warn!(path = %candidate.identity_path.display(), "ignoring non-finite distance");
            continue;
        }
        match best {
            Some(b) if candidate.distance >= b.distance => {}
            _ => best = Some(candidate),
        }
    }
    best
}

/// Identity label for a gallery path.
///
/// `root/alice/img1.jpg` -> `alice` (nested layout); `root/bob.jpg` -> `bob`
/// (flat layout). Deeper nesting uses the immediate parent directory.
pub fn identity_label(identity_path: &Path, mirror_root: &Path) -> Option<String> {
    let nested = match identity_path.strip_prefix(mirror_root) {
        Ok(rel) => {
            rel.components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .count()
                > 1
        }
        // Not under the root as given: fall back to comparing the parent.
        Err(_) => identity_path
            .parent()
            .is_some_and(|p| !p.as_os_str().is_empty() && p != mirror_root),
    };

    let label = if nested {
        identity_path.parent()?.file_name()?
    } else {
        identity_path.file_stem()?
    };
    Some(label.to_string_lossy().into_owned())
}
