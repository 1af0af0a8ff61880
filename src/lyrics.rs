use crate::error::FetchError;
use crate::http;
use crate::track_cleaning::{clean_track_name, remove_artist_from_track};
use crate::types::LyricLine;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;

const LRCLIB_SEARCH: &str = "https://lrclib.net/api/search";

/// Fetch time-synchronized lyrics for a track from lrclib, trying several
/// search strategies before giving up.
pub async fn fetch_lyrics(track_name: &str, artist_name: &str) -> Result<Vec<LyricLine>, FetchError> {
    info!("Fetching lyrics for: {} by {}", track_name, artist_name);

    enum SearchStrategy {
        Exact(String, String), // track_name, artist_name
        Wildcard(String),      // q parameter
    }

    let cleaned_track = clean_track_name(track_name);
    let track_without_artist = remove_artist_from_track(track_name, artist_name);
    let cleaned_without_artist = clean_track_name(&track_without_artist);

    let strategies = vec![
        // Wildcard searches are often most effective; start from the raw title.
        SearchStrategy::Wildcard(format!("{} {}", track_name, artist_name)),
        SearchStrategy::Wildcard(track_name.to_string()),
        SearchStrategy::Wildcard(format!("{} {}", cleaned_track, artist_name)),
        SearchStrategy::Wildcard(cleaned_track.clone()),
        SearchStrategy::Exact(track_name.to_string(), artist_name.to_string()),
        SearchStrategy::Exact(track_without_artist, artist_name.to_string()),
        SearchStrategy::Exact(cleaned_track, artist_name.to_string()),
        SearchStrategy::Exact(cleaned_without_artist, artist_name.to_string()),
    ];

    for strategy in strategies {
        let result = match &strategy {
            SearchStrategy::Exact(track, artist) => {
                if track.trim().is_empty() {
                    continue;
                }
                debug!("Trying exact strategy: '{}' by '{}'", track, artist);
                search_exact(track, artist).await
            }
            SearchStrategy::Wildcard(query) => {
                if query.trim().is_empty() {
                    continue;
                }
                debug!("Trying wildcard strategy: '{}'", query);
                search_wildcard(query).await
            }
        };
        if let Ok(lyrics) = result {
            if !lyrics.is_empty() {
                return Ok(lyrics);
            }
        }
    }

    warn!(
        "No lyrics found after trying all strategies for '{}' by '{}'",
        track_name, artist_name
    );
    Err(FetchError::NotFound)
}

async fn search_exact(track_name: &str, artist_name: &str) -> Result<Vec<LyricLine>, FetchError> {
    let mut url = format!(
        "{}?track_name={}",
        LRCLIB_SEARCH,
        urlencoding::encode(track_name)
    );
    if !artist_name.trim().is_empty() {
        url.push_str(&format!(
            "&artist_name={}",
            urlencoding::encode(artist_name)
        ));
    }
    search(&url).await
}

async fn search_wildcard(query: &str) -> Result<Vec<LyricLine>, FetchError> {
    let url = format!("{}?q={}", LRCLIB_SEARCH, urlencoding::encode(query));
    search(&url).await
}

async fn search(url: &str) -> Result<Vec<LyricLine>, FetchError> {
    debug!("Request URL: {}", url);

    let response = http::client()
        .get(url)
        .send()
        .await
        .map_err(|e| FetchError::ComputeFailed(format!("request failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(FetchError::ComputeFailed(format!(
            "HTTP error: {}",
            response.status()
        )));
    }

    let results: Vec<serde_json::Value> = response
        .json()
        .await
        .map_err(|e| FetchError::ComputeFailed(format!("JSON parse error: {}", e)))?;

    debug!("Found {} search results", results.len());
    if results.is_empty() {
        return Err(FetchError::NotFound);
    }

    // Prefer the first result carrying synced lyrics, then any plain lyrics.
    let synced = results.iter().find_map(|item| {
        item.get("syncedLyrics")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
    });
    if let Some(lrc) = synced {
        info!("Found synced lyrics, parsing LRC format");
        let lyrics = parse_lrc(lrc);
        if !lyrics.is_empty() {
            return Ok(lyrics);
        }
    }

    let plain = results.iter().find_map(|item| {
        item.get("plainLyrics")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
    });
    if let Some(text) = plain {
        info!("Found plain lyrics, converting to unsynced format");
        return Ok(convert_plain_lyrics_to_lines(text));
    }

    Err(FetchError::NotFound)
}

static LRC_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[(\d{1,2}):(\d{2})(?:\.(\d{1,3}))?\](.*)$").expect("regex"));
static ENHANCED_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<(\d{1,2}):(\d{2}(?:\.\d{1,3})?)>([^<]+)").expect("regex"));

/// Parse LRC content, dispatching on the enhanced word-level timestamp
/// format (`<mm:ss.xx>word`) when present.
pub fn parse_lrc(lrc_content: &str) -> Vec<LyricLine> {
    if lrc_content.contains('<') {
        let lyrics = parse_enhanced_lrc(lrc_content);
        if !lyrics.is_empty() {
            return lyrics;
        }
    }
    parse_regular_lrc(lrc_content)
}

fn parse_regular_lrc(lrc_content: &str) -> Vec<LyricLine> {
    let mut lyrics = Vec::new();

    for line in lrc_content.lines() {
        if let Some(caps) = LRC_LINE.captures(line) {
            let minutes: f64 = caps[1].parse().unwrap_or(0.0);
            let seconds: f64 = caps[2].parse().unwrap_or(0.0);
            let fraction: f64 = caps
                .get(3)
                .map(|m| format!("0.{}", m.as_str()).parse().unwrap_or(0.0))
                .unwrap_or(0.0);
            let text = caps[4].trim().to_string();

            if !text.is_empty() {
                lyrics.push(LyricLine::new(minutes * 60.0 + seconds + fraction, text));
            }
        }
    }

    finalize(lyrics)
}

/// Enhanced LRC carries one timestamp per word; the line time is the first
/// word's timestamp and the words are joined back into one line of text.
fn parse_enhanced_lrc(lrc_content: &str) -> Vec<LyricLine> {
    let mut lyrics = Vec::new();

    for line in lrc_content.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let mut line_time = None;
        let mut words = Vec::new();
        for caps in ENHANCED_WORD.captures_iter(line) {
            let minutes: f64 = caps[1].parse().unwrap_or(0.0);
            let seconds: f64 = caps[2].parse().unwrap_or(0.0);
            if line_time.is_none() {
                line_time = Some(minutes * 60.0 + seconds);
            }
            let word = caps[3].trim();
            if !word.is_empty() {
                words.push(word.to_string());
            }
        }

        if let Some(time) = line_time {
            if !words.is_empty() {
                lyrics.push(LyricLine::new(time, words.join(" ")));
            }
        }
    }

    finalize(lyrics)
}

/// Plain lyrics have no timing; assign a placeholder cadence of five seconds
/// per line so the highlight still advances.
pub fn convert_plain_lyrics_to_lines(plain_lyrics: &str) -> Vec<LyricLine> {
    let mut lyrics = Vec::new();
    for (index, text) in plain_lyrics
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .enumerate()
    {
        let mut lyric = LyricLine::new((index as f64) * 5.0, text);
        lyric.duration = Some(5.0);
        lyrics.push(lyric);
    }
    lyrics
}

// Sort ascending by time (highlighting depends on this) and derive per-line
// durations from the following line.
fn finalize(mut lyrics: Vec<LyricLine>) -> Vec<LyricLine> {
    lyrics.sort_by(|a, b| a.time.total_cmp(&b.time));

    for i in 0..lyrics.len().saturating_sub(1) {
        lyrics[i].duration = Some(lyrics[i + 1].time - lyrics[i].time);
    }
    if let Some(last) = lyrics.last_mut() {
        last.duration = Some(3.0);
    }

    lyrics
}
