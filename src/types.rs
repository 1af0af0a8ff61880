use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::time::Instant;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TrackInfo {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration: Option<f64>,
}

/// One line of synchronized lyrics. `translations` maps an ISO 639-1 code to
/// the translated text; `phonetics` holds an IPA transcription when requested.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LyricLine {
    pub time: f64, // time in seconds
    pub text: String,
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phonetics: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub translations: HashMap<String, String>,
}

impl LyricLine {
    pub fn new(time: f64, text: impl Into<String>) -> Self {
        Self {
            time,
            text: text.into(),
            duration: None,
            phonetics: None,
            translations: HashMap::new(),
        }
    }
}

/// A single immutable reading of external playback state. Produced by a
/// `PositionSource`, consumed by the broadcaster. Never mutated; a fresh
/// sample is always a fresh value.
#[derive(Debug, Clone)]
pub struct PlaybackSnapshot {
    pub track_id: String,
    pub position_seconds: f64,
    pub is_playing: bool,
    pub sampled_at: Instant,
}

impl PlaybackSnapshot {
    pub fn new(track_id: impl Into<String>, position_seconds: f64, is_playing: bool) -> Self {
        Self {
            track_id: track_id.into(),
            position_seconds: position_seconds.max(0.0),
            is_playing,
            sampled_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_clamps_negative_position() {
        let snap = PlaybackSnapshot::new("abc", -0.5, true);
        assert_eq!(snap.position_seconds, 0.0);
    }

    #[test]
    fn lyric_line_serializes_without_empty_optionals() {
        let line = LyricLine::new(12.5, "hello");
        let json = serde_json::to_value(&line).unwrap();
        assert!(json.get("phonetics").is_none());
        assert!(json.get("translations").is_none());
    }
}
