use crate::cache::{CacheConfig, FetchCache};
use crate::error::FetchError;
use crate::lyrics;
use crate::translate::{LanguageSpec, TranslationEngine};
use crate::types::{LyricLine, TrackInfo};
use futures_util::future::join_all;
use log::{info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// What is being fetched or computed for a song. Translation capabilities
/// embed the sorted target-language set: different sets are different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Capability {
    Lyrics,
    Phonetics,
    Languages,
    Translations(Vec<String>),
    TitleTranslations(Vec<String>),
}

/// Composite cache key: song identity plus requested capability.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    title: String,
    artist: String,
    capability: Capability,
}

impl CacheKey {
    pub fn new(track: &TrackInfo, capability: Capability) -> Self {
        Self {
            title: track.title.trim().to_lowercase(),
            artist: track.artist.trim().to_lowercase(),
            capability,
        }
    }
}

fn sorted_codes(languages: &[LanguageSpec]) -> Vec<String> {
    let mut codes: Vec<String> = languages.iter().map(|l| l.code.clone()).collect();
    codes.sort();
    codes
}

/// Everything a cache entry can hold. One table serves all capabilities so
/// invalidation and eviction have a single surface.
#[derive(Debug, Clone)]
pub enum Artifact {
    Lyrics(Vec<LyricLine>),
    Phonetics(Vec<String>),
    Languages(Vec<String>),
    Translations(HashMap<String, Vec<String>>),
    TitleTranslations(HashMap<String, String>),
}

/// Fetches song lyric lines for the pipeline. Implemented by the lrclib
/// client in production and by fixtures in tests.
pub trait LyricsProvider: Send + Sync + 'static {
    fn fetch(
        &self,
        title: &str,
        artist: &str,
    ) -> impl Future<Output = Result<Vec<LyricLine>, FetchError>> + Send;
}

/// Production provider backed by the lrclib search strategies.
pub struct LrclibProvider;

impl LyricsProvider for LrclibProvider {
    async fn fetch(&self, title: &str, artist: &str) -> Result<Vec<LyricLine>, FetchError> {
        lyrics::fetch_lyrics(title, artist).await
    }
}

/// High-level song pipeline: lyrics lookup, language detection, translation,
/// and phonetics, all deduplicated through one [`FetchCache`]. A given
/// (song, capability) pair is fetched or computed at most once, no matter
/// how many concurrent callers ask for it.
pub struct SongService<P, E> {
    cache: FetchCache<CacheKey, Artifact>,
    provider: Arc<P>,
    engine: Arc<E>,
}

impl<P: LyricsProvider, E: TranslationEngine> SongService<P, E> {
    pub fn new(provider: P, engine: E, cache_config: CacheConfig) -> Self {
        Self {
            cache: FetchCache::new(cache_config),
            provider: Arc::new(provider),
            engine: Arc::new(engine),
        }
    }

    /// Synchronized lyrics for a track, fetched at most once.
    pub async fn lyrics(&self, track: &TrackInfo) -> Result<Vec<LyricLine>, FetchError> {
        let key = CacheKey::new(track, Capability::Lyrics);
        let provider = Arc::clone(&self.provider);
        let title = track.title.clone();
        let artist = track.artist.clone();

        let artifact = self
            .cache
            .get_or_compute(key, move || async move {
                provider.fetch(&title, &artist).await.map(Artifact::Lyrics)
            })
            .await?;
        match &*artifact {
            Artifact::Lyrics(lines) => Ok(lines.clone()),
            _ => Err(FetchError::ComputeFailed("cache artifact mismatch".into())),
        }
    }

    /// Detected source language names for a track's lyrics.
    pub async fn languages(&self, track: &TrackInfo) -> Result<Vec<String>, FetchError> {
        let lines = self.lyrics(track).await?;
        let key = CacheKey::new(track, Capability::Languages);
        let engine = Arc::clone(&self.engine);
        let title = track.title.clone();
        let artist = track.artist.clone();
        let originals: Vec<String> = lines.iter().map(|l| l.text.clone()).collect();

        let artifact = self
            .cache
            .get_or_compute(key, move || async move {
                engine
                    .detect_languages(&title, &artist, &originals)
                    .await
                    .map(Artifact::Languages)
            })
            .await?;
        match &*artifact {
            Artifact::Languages(languages) => Ok(languages.clone()),
            _ => Err(FetchError::ComputeFailed("cache artifact mismatch".into())),
        }
    }

    /// Lyrics with translations into every requested language merged in.
    /// Languages whose translation failed carry a per-line placeholder; the
    /// computation only counts as failed when every language failed.
    pub async fn translated_lyrics(
        &self,
        track: &TrackInfo,
        targets: &[LanguageSpec],
    ) -> Result<Vec<LyricLine>, FetchError> {
        let mut lines = self.lyrics(track).await?;
        if targets.is_empty() {
            return Ok(lines);
        }
        let source_languages = self.languages(track).await.unwrap_or_default();

        let key = CacheKey::new(track, Capability::Translations(sorted_codes(targets)));
        let engine = Arc::clone(&self.engine);
        let title = track.title.clone();
        let artist = track.artist.clone();
        let originals: Vec<String> = lines.iter().map(|l| l.text.clone()).collect();
        let targets = targets.to_vec();

        let artifact = self
            .cache
            .get_or_compute(key, move || async move {
                let line_count = originals.len();
                let tasks = targets.iter().map(|target| {
                    let engine = Arc::clone(&engine);
                    let title = title.clone();
                    let artist = artist.clone();
                    let originals = originals.clone();
                    let source_languages = source_languages.clone();
                    let target = target.clone();
                    async move {
                        let result = engine
                            .translate_lines(&title, &artist, &originals, &target, &source_languages)
                            .await;
                        (target, result)
                    }
                });

                let mut set = HashMap::new();
                let mut failures = 0usize;
                for (target, result) in join_all(tasks).await {
                    match result {
                        Ok(translated) => {
                            set.insert(target.code, translated);
                        }
                        Err(e) => {
                            warn!("Translation to {} failed: {}", target.name, e);
                            failures += 1;
                            set.insert(target.code, vec![e.placeholder(); line_count]);
                        }
                    }
                }

                if failures == targets.len() {
                    Err(FetchError::ComputeFailed(
                        "all requested translations failed".to_string(),
                    ))
                } else {
                    Ok(Artifact::Translations(set))
                }
            })
            .await?;

        let Artifact::Translations(set) = &*artifact else {
            return Err(FetchError::ComputeFailed("cache artifact mismatch".into()));
        };
        for (code, translated) in set {
            for (line, text) in lines.iter_mut().zip(translated) {
                line.translations.insert(code.clone(), text.clone());
            }
        }
        Ok(lines)
    }

    /// Lyrics with IPA phonetics per line. An engine failure renders a
    /// placeholder on every line rather than failing the response; the
    /// failure itself stays cached (and retryable) under the phonetics key.
    pub async fn phonetic_lyrics(&self, track: &TrackInfo) -> Result<Vec<LyricLine>, FetchError> {
        let mut lines = self.lyrics(track).await?;
        let source_languages = self.languages(track).await.unwrap_or_default();

        let key = CacheKey::new(track, Capability::Phonetics);
        let engine = Arc::clone(&self.engine);
        let title = track.title.clone();
        let artist = track.artist.clone();
        let originals: Vec<String> = lines.iter().map(|l| l.text.clone()).collect();

        let outcome = self
            .cache
            .get_or_compute(key, move || async move {
                engine
                    .phonetics(&title, &artist, &originals, &source_languages)
                    .await
                    .map(Artifact::Phonetics)
            })
            .await;

        match outcome {
            Ok(artifact) => {
                let Artifact::Phonetics(phonetics) = &*artifact else {
                    return Err(FetchError::ComputeFailed("cache artifact mismatch".into()));
                };
                for (line, ipa) in lines.iter_mut().zip(phonetics) {
                    if !ipa.is_empty() {
                        line.phonetics = Some(ipa.clone());
                    }
                }
                Ok(lines)
            }
            Err(e) => {
                warn!("Phonetics generation failed: {}", e);
                for line in &mut lines {
                    line.phonetics = Some(e.placeholder());
                }
                Ok(lines)
            }
        }
    }

    /// Title translations per requested language; failed languages carry a
    /// placeholder.
    pub async fn translated_titles(
        &self,
        track: &TrackInfo,
        targets: &[LanguageSpec],
    ) -> Result<HashMap<String, String>, FetchError> {
        if targets.is_empty() {
            return Ok(HashMap::new());
        }
        let key = CacheKey::new(track, Capability::TitleTranslations(sorted_codes(targets)));
        let engine = Arc::clone(&self.engine);
        let title = track.title.clone();
        let targets = targets.to_vec();

        let artifact = self
            .cache
            .get_or_compute(key, move || async move {
                let tasks = targets.iter().map(|target| {
                    let engine = Arc::clone(&engine);
                    let title = title.clone();
                    let target = target.clone();
                    async move { (target.clone(), engine.translate_text(&title, &target).await) }
                });

                let mut titles = HashMap::new();
                for (target, result) in join_all(tasks).await {
                    match result {
                        Ok(translated) => titles.insert(target.code, translated),
                        Err(e) => {
                            warn!("Title translation to {} failed: {}", target.name, e);
                            titles.insert(target.code, e.placeholder())
                        }
                    };
                }
                Ok(Artifact::TitleTranslations(titles))
            })
            .await?;

        match &*artifact {
            Artifact::TitleTranslations(titles) => Ok(titles.clone()),
            _ => Err(FetchError::ComputeFailed("cache artifact mismatch".into())),
        }
    }

    /// Administrative: force the next request for this key to refetch.
    pub async fn invalidate(&self, key: &CacheKey) -> bool {
        self.cache.invalidate(key).await
    }

    /// Warm the cache for a track that just started playing; errors are
    /// logged, never propagated.
    pub async fn prefetch(&self, track: &TrackInfo) {
        match self.lyrics(track).await {
            Ok(lines) => info!(
                "Prefetched {} lyric lines for '{}' by '{}'",
                lines.len(),
                track.title,
                track.artist
            ),
            Err(FetchError::NotFound) => {
                info!("No lyrics for '{}' by '{}'", track.title, track.artist)
            }
            Err(e) => warn!("Lyric prefetch failed for '{}': {}", track.title, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct StaticProvider {
        fetches: AtomicUsize,
    }

    impl StaticProvider {
        fn new() -> Self {
            Self {
                fetches: AtomicUsize::new(0),
            }
        }
    }

    impl LyricsProvider for Arc<StaticProvider> {
        async fn fetch(&self, _title: &str, _artist: &str) -> Result<Vec<LyricLine>, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                LyricLine::new(0.0, "first"),
                LyricLine::new(10.0, "second"),
            ])
        }
    }

    // Engine whose Spanish works and whose French always fails.
    struct FlakyEngine {
        calls: AtomicUsize,
    }

    impl FlakyEngine {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TranslationEngine for Arc<FlakyEngine> {
        async fn translate_lines(
            &self,
            _title: &str,
            _artist: &str,
            lines: &[String],
            target: &LanguageSpec,
            _source_languages: &[String],
        ) -> Result<Vec<String>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if target.code == "fr" {
                return Err(FetchError::ComputeFailed("model unavailable".into()));
            }
            Ok(lines.iter().map(|l| format!("{} ({})", l, target.code)).collect())
        }

        async fn translate_text(
            &self,
            text: &str,
            target: &LanguageSpec,
        ) -> Result<String, FetchError> {
            Ok(format!("{} ({})", text, target.code))
        }

        async fn phonetics(
            &self,
            _title: &str,
            _artist: &str,
            lines: &[String],
            _source_languages: &[String],
        ) -> Result<Vec<String>, FetchError> {
            Ok(vec!["ipa".to_string(); lines.len()])
        }

        async fn detect_languages(
            &self,
            _title: &str,
            _artist: &str,
            _lines: &[String],
        ) -> Result<Vec<String>, FetchError> {
            Ok(vec!["English".to_string()])
        }
    }

    fn track() -> TrackInfo {
        TrackInfo {
            id: "abc".to_string(),
            title: "Song".to_string(),
            artist: "Artist".to_string(),
            album: None,
            duration: Some(180.0),
        }
    }

    fn service(
        provider: Arc<StaticProvider>,
        engine: Arc<FlakyEngine>,
    ) -> SongService<Arc<StaticProvider>, Arc<FlakyEngine>> {
        SongService::new(
            provider,
            engine,
            CacheConfig {
                capacity: 32,
                failure_ttl: Duration::from_secs(30),
                compute_timeout: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test]
    async fn concurrent_lyric_requests_fetch_once() {
        let provider = Arc::new(StaticProvider::new());
        let svc = Arc::new(service(Arc::clone(&provider), Arc::new(FlakyEngine::new())));

        let a = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.lyrics(&track()).await })
        };
        let b = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.lyrics(&track()).await })
        };

        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a, b);
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_language_renders_placeholders() {
        let svc = service(Arc::new(StaticProvider::new()), Arc::new(FlakyEngine::new()));
        let targets = vec![
            LanguageSpec::new("es", "Spanish"),
            LanguageSpec::new("fr", "French"),
        ];

        let lines = svc.translated_lyrics(&track(), &targets).await.unwrap();
        assert_eq!(lines[0].translations["es"], "first (es)");
        assert_eq!(lines[0].translations["fr"], "Translation error");
        assert_eq!(lines[1].translations["es"], "second (es)");
    }

    #[tokio::test]
    async fn translation_sets_are_cached_per_language_set() {
        let engine = Arc::new(FlakyEngine::new());
        let svc = service(Arc::new(StaticProvider::new()), Arc::clone(&engine));
        let spanish = vec![LanguageSpec::new("es", "Spanish")];

        let _ = svc.translated_lyrics(&track(), &spanish).await.unwrap();
        let _ = svc.translated_lyrics(&track(), &spanish).await.unwrap();
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);

        // A different language set is a different key, so it computes anew.
        let both = vec![
            LanguageSpec::new("es", "Spanish"),
            LanguageSpec::new("de", "German"),
        ];
        let _ = svc.translated_lyrics(&track(), &both).await.unwrap();
        assert_eq!(engine.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn phonetics_merge_into_lines() {
        let svc = service(Arc::new(StaticProvider::new()), Arc::new(FlakyEngine::new()));
        let lines = svc.phonetic_lyrics(&track()).await.unwrap();
        assert_eq!(lines[0].phonetics.as_deref(), Some("ipa"));
    }

    #[tokio::test]
    async fn invalidation_forces_refetch() {
        let provider = Arc::new(StaticProvider::new());
        let svc = service(Arc::clone(&provider), Arc::new(FlakyEngine::new()));

        let _ = svc.lyrics(&track()).await.unwrap();
        let _ = svc.lyrics(&track()).await.unwrap();
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);

        let key = CacheKey::new(&track(), Capability::Lyrics);
        assert!(svc.invalidate(&key).await);
        let _ = svc.lyrics(&track()).await.unwrap();
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn translated_titles_cover_all_targets() {
        let svc = service(Arc::new(StaticProvider::new()), Arc::new(FlakyEngine::new()));
        let targets = vec![
            LanguageSpec::new("es", "Spanish"),
            LanguageSpec::new("de", "German"),
        ];
        let titles = svc.translated_titles(&track(), &targets).await.unwrap();
        assert_eq!(titles["es"], "Song (es)");
        assert_eq!(titles["de"], "Song (de)");
    }
}
