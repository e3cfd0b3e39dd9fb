use facemirror_core::{MatchEngine, MatchResult, ModelComparator, ModelComparison, ModelConfig};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Classify {
        probe: PathBuf,
        mirror_root: PathBuf,
        config: ModelConfig,
        reply: oneshot::Sender<MatchResult>,
    },
    Compare {
        probe: PathBuf,
        mirror_root: PathBuf,
        configs: Vec<ModelConfig>,
        reply: oneshot::Sender<ModelComparison>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Single-model classification of a probe already written to disk.
    pub async fn classify(
        &self,
        probe: PathBuf,
        mirror_root: PathBuf,
        config: ModelConfig,
    ) -> Result<MatchResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Classify {
                probe,
                mirror_root,
                config,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Run every model in `configs` against the probe.
    pub async fn compare(
        &self,
        probe: PathBuf,
        mirror_root: PathBuf,
        configs: Vec<ModelConfig>,
    ) -> Result<ModelComparison, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Compare {
                probe,
                mirror_root,
                configs,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the match engine on a dedicated OS thread.
///
/// Matching is CPU-bound (decoding, index builds), so it stays off the async
/// runtime. Requests are served in arrival order.
pub fn spawn_engine(engine: MatchEngine) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("facemirror-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Classify {
                        probe,
                        mirror_root,
                        config,
                        reply,
                    } => {
                        let comparison = ModelComparator::new(&engine).compare_all(
                            &probe,
                            &mirror_root,
                            std::slice::from_ref(&config),
                        );
                        // The comparator shields the thread from matcher panics.
                        let result = comparison.get(&config.model_id).cloned().unwrap_or_else(|| {
                            MatchResult::error(
                                facemirror_core::ErrorKind::InternalError,
                                "model produced no result",
                            )
                        });
                        let _ = reply.send(result);
                    }
                    EngineRequest::Compare {
                        probe,
                        mirror_root,
                        configs,
                        reply,
                    } => {
                        let comparison =
                            ModelComparator::new(&engine).compare_all(&probe, &mirror_root, &configs);
                        let _ = reply.send(comparison);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}
