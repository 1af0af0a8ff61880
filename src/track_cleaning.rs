use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

static JP_QUOTES: Lazy<Regex> = Lazy::new(|| Regex::new(r"「([^」]+)」").expect("regex"));
static JP_CORNER: Lazy<Regex> = Lazy::new(|| Regex::new(r"『([^』]+)』").expect("regex"));
static JP_LENS: Lazy<Regex> = Lazy::new(|| Regex::new(r"【.*?】").expect("regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("regex"));

static CLEANUP_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Player/site suffixes
        r"\s*-\s*YouTube\s*Music\s*$",
        r"\s*-\s*YouTube\s*$",
        // Video/audio decorations in any bracket style
        r"\s*\(.*?(?i:official|music|lyric).*?(?i:video|audio).*?\)",
        r"\s*【.*?(?i:official|music|lyric).*?(?i:video|audio).*?】",
        r"\s*\[.*?(?i:official|music|lyric).*?(?i:video|audio).*?\]",
        r"\s*\(.*?(?i:mv).*?\)",
        r"\s*【.*?(?i:mv).*?】",
        r"\s*\[.*?(?i:mv).*?\]",
        r"\s*\((?i:visualizer|video|audio)\)",
        // Featuring credits
        r"\s*\((?i:feat|ft|featuring)\.?\s+[^)]*\)",
        r"\s+(?i:feat|ft)\.?\s+[^()]*$",
        // Producer credits and quality tags
        r"\s*\(prod\.\s*[^)]*\)",
        r"\s*\[.*?(?i:4k|hd|remaster).*?\]",
        // Subtitle/translation indicators
        r"\s*\([^)]*(?i:中文|chinese|english\s+sub|eng\s+sub|subtitle|lyrics?)[^)]*\)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("regex"))
    .collect()
});

static SEPARATORS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^([^-]+?)\s+[-–—]\s+(.+)$", // Artist - Track (spaced dash only, hyphenated names stay whole)
        r"^([^·]+)\s*[·]\s*(.+)$",   // Artist · Track
        r"^([^×]+)\s*[×]\s*(.+)$",   // Artist × Track
    ]
    .iter()
    .map(|p| Regex::new(p).expect("regex"))
    .collect()
});

/// Strip platform noise (video tags, featuring credits, channel suffixes)
/// from a raw track title so lyric search has a fighting chance.
pub fn clean_track_name(track_name: &str) -> String {
    let mut cleaned = track_name.to_string();
    debug!("Cleaning track name: '{}'", track_name);

    // Titles wrapped in Japanese quotes are usually the exact song name.
    for re in [&*JP_QUOTES, &*JP_CORNER] {
        if let Some(caps) = re.captures(&cleaned) {
            let extracted = caps[1].trim();
            if extracted.len() > 2 {
                debug!("Extracted quoted title: '{}'", extracted);
                return extracted.to_string();
            }
        }
    }

    for re in CLEANUP_PATTERNS.iter() {
        let candidate = re.replace_all(&cleaned, "").trim().to_string();
        if candidate.len() > 1 {
            cleaned = candidate;
        }
    }

    // "Track / Artist": the track name usually sits before the slash.
    if cleaned.contains(" / ") && !cleaned.to_lowercase().contains("feat") {
        if let Some(first) = cleaned.split(" / ").next() {
            let first = first.trim();
            if first.len() > 2 {
                cleaned = first.to_string();
            }
        }
    }

    // "Artist - Track": the track name usually sits after the dash. Guard
    // against splitting hyphenated names by requiring a plausible artist part.
    for re in SEPARATORS.iter() {
        if let Some(caps) = re.captures(&cleaned) {
            let artist = caps[1].trim().to_string();
            let track = caps[2].trim().to_string();
            if !track.is_empty()
                && !artist.is_empty()
                && (artist.len() as f64) < (track.len() as f64) * 3.0
                && !track.to_lowercase().contains("youtube")
                && track != artist
            {
                debug!("Extracted track name after separator: '{}'", track);
                cleaned = track;
                break;
            }
        }
    }

    let candidate = JP_LENS.replace_all(&cleaned, "").trim().to_string();
    if candidate.len() > 1 {
        cleaned = candidate;
    }

    for (open, close) in [('"', '"'), ('\'', '\''), ('「', '」')] {
        if cleaned.starts_with(open) && cleaned.ends_with(close) && cleaned.chars().count() > 2 {
            cleaned = cleaned
                .trim_start_matches(open)
                .trim_end_matches(close)
                .to_string();
        }
    }

    cleaned = WHITESPACE.replace_all(&cleaned, " ").trim().to_string();
    debug!("Cleaned result: '{}'", cleaned);
    cleaned
}

/// Strip a leading/trailing artist name from a track title, for titles that
/// embed the artist around a dash.
pub fn remove_artist_from_track(track_name: &str, artist_name: &str) -> String {
    if artist_name.trim().is_empty() {
        return track_name.to_string();
    }

    let escaped = regex::escape(artist_name);
    let mut result = track_name.to_string();

    for pattern in [
        format!(r"(?i)^{}\s*[-–—]\s*", escaped),
        format!(r"(?i)\s*[-–—]\s*{}\s*$", escaped),
    ] {
        if let Ok(re) = Regex::new(&pattern) {
            let candidate = re.replace_all(&result, "").trim().to_string();
            if candidate.len() < result.len() && !candidate.is_empty() {
                debug!("Removed artist '{}', result: '{}'", artist_name, candidate);
                result = candidate;
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_youtube_suffix_and_separator() {
        let cleaned = clean_track_name("Aimer - 残響散歌 - YouTube Music");
        assert_eq!(cleaned, "残響散歌");
    }

    #[test]
    fn extracts_japanese_quoted_title() {
        let cleaned = clean_track_name("【MV】「私じゃなかったんだね。」(Official Video)");
        assert_eq!(cleaned, "私じゃなかったんだね。");
    }

    #[test]
    fn removes_featuring_credit() {
        let cleaned = clean_track_name("Levitating (feat. DaBaby)");
        assert_eq!(cleaned, "Levitating");
    }

    #[test]
    fn keeps_hyphenated_artist_names_whole() {
        // Unspaced hyphen is part of the name, not a separator.
        let cleaned = clean_track_name("Anne-Marie");
        assert_eq!(cleaned, "Anne-Marie");
    }

    #[test]
    fn removes_leading_artist() {
        let result = remove_artist_from_track("Dua Lipa - Levitating", "Dua Lipa");
        assert_eq!(result, "Levitating");
    }

    #[test]
    fn keeps_track_when_artist_absent() {
        let result = remove_artist_from_track("Levitating", "Dua Lipa");
        assert_eq!(result, "Levitating");
    }
}
