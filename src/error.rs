use thiserror::Error;

/// Errors surfaced by fetch/compute operations that go through the cache.
///
/// These are cached alongside results: a `Failed` cache entry stores one of
/// these and replays it to every caller until the failure TTL elapses or the
/// key is invalidated.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FetchError {
    #[error("no lyrics found for track")]
    NotFound,
    #[error("compute failed: {0}")]
    ComputeFailed(String),
    #[error("computation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors from sampling the external player position.
///
/// Never fatal: the broadcaster logs these and skips the cycle.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("position source unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the sync channel layer (bind, accept, handshake).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),
}

impl FetchError {
    /// Human-readable placeholder used when a per-line artifact (translation
    /// or phonetics) could not be produced. Rendered inline instead of
    /// aborting the whole response.
    pub fn placeholder(&self) -> String {
        match self {
            FetchError::NotFound => "Not available".to_string(),
            FetchError::ComputeFailed(_) => "Translation error".to_string(),
            FetchError::Timeout(_) => "Translation timed out".to_string(),
        }
    }
}
