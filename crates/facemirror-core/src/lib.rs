//! facemirror-core: gallery mirror synchronization and match decisions.
//!
//! Keeps a local mirror of a remote gallery consistent with its blob store,
//! and turns matcher distance scores into accept/reject decisions, either for
//! a single model or across several models at once.

pub mod comparator;
pub mod embedding;
pub mod engine;
pub mod matcher;
pub mod mirror;
pub mod store;
pub mod sync;
pub mod types;

pub use comparator::{ModelComparator, ModelComparison};
pub use embedding::{Embedder, GrayscaleEmbedder, HistogramEmbedder};
pub use engine::MatchEngine;
pub use matcher::{EmbeddingMatcher, Matcher, MatcherError};
pub use mirror::{Mirror, MirrorError};
pub use store::{BlobStore, FsBlobStore, MemoryBlobStore, StoreError};
pub use sync::{SyncError, SyncPlan, SyncReport, Synchronizer};
pub use types::{
    DistanceMetric, Embedding, ErrorKind, MatchCandidate, MatchResult, ModelConfig, RemoteObject,
};
