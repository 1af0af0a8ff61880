use crate::error::FetchError;
use crate::http;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;

/// A translation target: ISO 639-1 code plus the human-readable name the
/// model is prompted with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageSpec {
    pub code: String,
    pub name: String,
}

impl LanguageSpec {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
        }
    }
}

/// The large-language-model collaborator that produces translations,
/// phonetic transcriptions, and language detection. Implementations may fail
/// per call; callers render placeholders instead of propagating into the
/// whole response.
pub trait TranslationEngine: Send + Sync + 'static {
    /// Translate lyric lines into one target language, preserving exact
    /// one-to-one line correspondence.
    fn translate_lines(
        &self,
        title: &str,
        artist: &str,
        lines: &[String],
        target: &LanguageSpec,
        source_languages: &[String],
    ) -> impl Future<Output = Result<Vec<String>, FetchError>> + Send;

    /// Translate a single short text (a song title).
    fn translate_text(
        &self,
        text: &str,
        target: &LanguageSpec,
    ) -> impl Future<Output = Result<String, FetchError>> + Send;

    /// IPA transcription per line; instrumental lines come back empty.
    fn phonetics(
        &self,
        title: &str,
        artist: &str,
        lines: &[String],
        source_languages: &[String],
    ) -> impl Future<Output = Result<Vec<String>, FetchError>> + Send;

    /// Primary language names of the song, e.g. `["English", "Spanish"]`.
    fn detect_languages(
        &self,
        title: &str,
        artist: &str,
        lines: &[String],
    ) -> impl Future<Output = Result<Vec<String>, FetchError>> + Send;
}

const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "models/gemini-2.5-flash";

/// Gemini REST client. Every request demands a structured JSON response and
/// validates the line count the model returns; a model that merges or drops
/// lines is treated as a failed computation.
pub struct GeminiEngine {
    api_key: String,
    model: String,
}

impl GeminiEngine {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    async fn generate(&self, system_instruction: &str, content: &str) -> Result<String, FetchError> {
        let url = format!("{}/{}:generateContent", GEMINI_BASE, self.model);
        let body = json!({
            "system_instruction": { "parts": [{ "text": system_instruction }] },
            "contents": [{ "parts": [{ "text": content }] }],
            "generationConfig": { "responseMimeType": "application/json" },
        });

        let response = http::client()
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| FetchError::ComputeFailed(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(FetchError::ComputeFailed(format!(
                "model API returned {}",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct GenerateResponse {
            candidates: Vec<Candidate>,
        }
        #[derive(Deserialize)]
        struct Candidate {
            content: Content,
        }
        #[derive(Deserialize)]
        struct Content {
            parts: Vec<Part>,
        }
        #[derive(Deserialize)]
        struct Part {
            text: String,
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| FetchError::ComputeFailed(format!("malformed model response: {}", e)))?;

        parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| FetchError::ComputeFailed("model returned no candidates".to_string()))
    }
}

fn source_language_clause(source_languages: &[String]) -> String {
    if source_languages.is_empty() || source_languages.iter().any(|l| l == "Detection Failed") {
        String::new()
    } else {
        format!(" from {}", source_languages.join(", "))
    }
}

/// Parse a `{"<field>": ["...", ...]}` payload and enforce the exact line
/// count the prompt demanded.
fn parse_lines_payload(text: &str, field: &str, expected: usize) -> Result<Vec<String>, FetchError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| FetchError::ComputeFailed(format!("model returned invalid JSON: {}", e)))?;
    let lines: Vec<String> = value
        .get(field)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .map(|v| v.as_str().unwrap_or_default().to_string())
                .collect()
        })
        .ok_or_else(|| {
            FetchError::ComputeFailed(format!("model response missing '{}' field", field))
        })?;

    if lines.len() != expected {
        return Err(FetchError::ComputeFailed(format!(
            "model returned {} lines, expected {}",
            lines.len(),
            expected
        )));
    }
    Ok(lines)
}

impl TranslationEngine for GeminiEngine {
    async fn translate_lines(
        &self,
        title: &str,
        artist: &str,
        lines: &[String],
        target: &LanguageSpec,
        source_languages: &[String],
    ) -> Result<Vec<String>, FetchError> {
        let system_instruction = format!(
            "You are a translation expert. Translate the user's text{} to {}. \
             The user's text consists of the lyrics of '{}' by '{}', separated by newlines. \
             There are exactly {} lines of input. \
             Your response must be a JSON object with a 'translations' list containing exactly {} \
             translated strings, one for each line of input text, in the same order. \
             Do not merge, split, or omit any lines.",
            source_language_clause(source_languages),
            target.name,
            title,
            artist,
            lines.len(),
            lines.len(),
        );

        debug!("Translating {} lines to {}", lines.len(), target.name);
        let text = self.generate(&system_instruction, &lines.join("\n")).await?;
        parse_lines_payload(&text, "translations", lines.len())
    }

    async fn translate_text(
        &self,
        text: &str,
        target: &LanguageSpec,
    ) -> Result<String, FetchError> {
        let system_instruction = format!(
            "You are a translation expert. Translate the user's text to {}. \
             The user's text is a song title. Your response must be a JSON object \
             with a 'translation' field containing the single translated string.",
            target.name,
        );

        let response = self.generate(&system_instruction, text).await?;
        let value: serde_json::Value = serde_json::from_str(&response)
            .map_err(|e| FetchError::ComputeFailed(format!("model returned invalid JSON: {}", e)))?;
        value
            .get("translation")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                FetchError::ComputeFailed("model response missing 'translation' field".to_string())
            })
    }

    async fn phonetics(
        &self,
        title: &str,
        artist: &str,
        lines: &[String],
        source_languages: &[String],
    ) -> Result<Vec<String>, FetchError> {
        let lang_info = if source_language_clause(source_languages).is_empty() {
            String::new()
        } else {
            format!("The lyrics are in {}. ", source_languages.join(", "))
        };
        let system_instruction = format!(
            "You are a linguistic expert specializing in phonetics. Provide the International \
             Phonetic Alphabet (IPA) transcription for each line of the lyrics of '{}' by '{}'. \
             {}There are exactly {} lines of input. Your response must be a JSON object with a \
             'phonetics' list containing exactly {} strings, one IPA transcription per input line. \
             If a line is purely instrumental, return an empty string for that line.",
            title,
            artist,
            lang_info,
            lines.len(),
            lines.len(),
        );

        debug!("Requesting phonetics for {} lines", lines.len());
        let text = self.generate(&system_instruction, &lines.join("\n")).await?;
        parse_lines_payload(&text, "phonetics", lines.len())
    }

    async fn detect_languages(
        &self,
        title: &str,
        artist: &str,
        lines: &[String],
    ) -> Result<Vec<String>, FetchError> {
        let system_instruction = format!(
            "You are a language detection expert. Identify the primary language(s) of the song \
             '{}' by '{}'. The user's text consists of lines of song lyrics; songs are sometimes \
             in multiple languages. Your response must be a JSON object with a 'languages' field \
             containing a list of detected language names (e.g., ['English', 'Spanish']).",
            title, artist,
        );

        // A sample of the lyrics is enough for detection.
        let sample: Vec<String> = lines.iter().take(10).cloned().collect();
        let text = self.generate(&system_instruction, &sample.join("\n")).await?;

        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| FetchError::ComputeFailed(format!("model returned invalid JSON: {}", e)))?;
        let languages: Vec<String> = value
            .get("languages")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();

        if languages.is_empty() {
            warn!("Language detection returned nothing for '{}'", title);
            return Err(FetchError::ComputeFailed(
                "language detection returned no languages".to_string(),
            ));
        }
        Ok(languages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_with_exact_count_parses() {
        let text = r#"{"translations":["uno","dos","tres"]}"#;
        let lines = parse_lines_payload(text, "translations", 3).unwrap();
        assert_eq!(lines, vec!["uno", "dos", "tres"]);
    }

    #[test]
    fn payload_with_wrong_count_is_rejected() {
        let text = r#"{"translations":["uno","dos"]}"#;
        let err = parse_lines_payload(text, "translations", 3).unwrap_err();
        assert!(matches!(err, FetchError::ComputeFailed(_)));
    }

    #[test]
    fn payload_missing_field_is_rejected() {
        let text = r#"{"other":[]}"#;
        let err = parse_lines_payload(text, "phonetics", 0).unwrap_err();
        assert!(matches!(err, FetchError::ComputeFailed(_)));
    }

    #[test]
    fn source_clause_skips_failed_detection() {
        assert_eq!(source_language_clause(&[]), "");
        assert_eq!(
            source_language_clause(&["Detection Failed".to_string()]),
            ""
        );
        assert_eq!(
            source_language_clause(&["Japanese".to_string(), "English".to_string()]),
            " from Japanese, English"
        );
    }
}
