use atlas_core::backend::{Encoder, EncoderError};
use atlas_core::Signature;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),
    #[error("image could not be decoded: {0}")]
    InvalidImage(String),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Detect {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<Signature>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Request face signatures for one image. An empty result means no face.
    pub async fn detect(&self, image: Vec<u8>) -> Result<Vec<Signature>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Detect {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the encoder on a dedicated OS thread.
///
/// The encoder is owned by that thread for its whole life; requests are
/// processed one at a time in arrival order.
pub fn spawn_engine<E>(mut encoder: E) -> Result<EngineHandle, EngineError>
where
    E: Encoder + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("atlas-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Detect { image, reply } => {
                        let result = run_detect(&mut encoder, &image);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

/// Reject undecodable uploads, then hand the raw bytes to the encoder.
fn run_detect<E: Encoder>(encoder: &mut E, bytes: &[u8]) -> Result<Vec<Signature>, EngineError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|e| EngineError::InvalidImage(e.to_string()))?;
    tracing::debug!(
        width = decoded.width(),
        height = decoded.height(),
        bytes = bytes.len(),
        "detect: image decoded"
    );

    let signatures = encoder.detect(bytes)?;
    tracing::debug!(faces = signatures.len(), "detect: encoder finished");
    Ok(signatures)
}
