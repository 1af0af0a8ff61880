use crate::error::SourceError;
use crate::http;
use crate::types::{PlaybackSnapshot, TrackInfo};
use log::debug;
use serde::Deserialize;
use std::future::Future;

/// Abstracts the external player. Polled by the broadcaster on its own
/// schedule; `Ok(None)` means nothing is playing right now.
pub trait PositionSource: Send + Sync + 'static {
    fn sample(
        &self,
    ) -> impl Future<Output = Result<Option<PlaybackSnapshot>, SourceError>> + Send;
}

#[derive(Debug, Deserialize)]
struct PlayerStateBody {
    track_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    artist: Option<String>,
    #[serde(default)]
    album: Option<String>,
    progress_ms: f64,
    is_playing: bool,
    #[serde(default)]
    duration_ms: Option<f64>,
}

/// Position source backed by a player account API that reports the current
/// track and progress as JSON.
pub struct HttpPositionSource {
    endpoint: String,
}

impl HttpPositionSource {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    async fn fetch_state(&self) -> Result<Option<PlayerStateBody>, SourceError> {
        let response = http::client()
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        // 204 means the player is idle.
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SourceError::Unavailable(format!(
                "player API returned {}",
                response.status()
            )));
        }

        let body: PlayerStateBody = response
            .json()
            .await
            .map_err(|e| SourceError::Unavailable(format!("bad player payload: {}", e)))?;
        Ok(Some(body))
    }

    /// Full metadata for the currently playing track, for lyric lookup.
    pub async fn current_track(&self) -> Result<Option<TrackInfo>, SourceError> {
        let Some(body) = self.fetch_state().await? else {
            return Ok(None);
        };
        let (Some(id), Some(title), Some(artist)) = (body.track_id, body.title, body.artist)
        else {
            debug!("Player state carries no track metadata");
            return Ok(None);
        };
        Ok(Some(TrackInfo {
            id,
            title,
            artist,
            album: body.album,
            duration: body.duration_ms.map(|ms| ms / 1000.0),
        }))
    }
}

impl PositionSource for HttpPositionSource {
    async fn sample(&self) -> Result<Option<PlaybackSnapshot>, SourceError> {
        let Some(body) = self.fetch_state().await? else {
            return Ok(None);
        };
        let Some(track_id) = body.track_id else {
            return Ok(None);
        };
        Ok(Some(PlaybackSnapshot::new(
            track_id,
            body.progress_ms / 1000.0,
            body.is_playing,
        )))
    }
}
