//! Time-synchronized, translated song lyrics for a live media player.
//!
//! The server half polls an external player for playback position and pushes
//! state changes to every connected client over a persistent WebSocket with
//! heartbeat-based liveness detection. The client half extrapolates position
//! between updates so the lyric highlight moves smoothly. A deduplicating
//! cache makes sure lyrics, translations, and phonetics are fetched or
//! computed at most once per (song, capability) key.

mod http;

pub mod cache;
pub mod config;
pub mod error;
pub mod lyrics;
pub mod protocol;
pub mod renderer;
pub mod songs;
pub mod source;
pub mod sync;
pub mod track_cleaning;
pub mod translate;
pub mod types;

pub use cache::{CacheConfig, FetchCache};
pub use config::Config;
pub use error::{FetchError, SourceError, SyncError};
pub use protocol::{ClientMessage, ServerMessage, PROTOCOL_VERSION};
pub use renderer::{ClientConfig, LyricsRenderer, SyncClient};
pub use songs::{CacheKey, Capability, LrclibProvider, SongService};
pub use source::{HttpPositionSource, PositionSource};
pub use sync::{BroadcastConfig, SyncBroadcaster};
pub use translate::{GeminiEngine, LanguageSpec, TranslationEngine};
pub use types::{LyricLine, PlaybackSnapshot, TrackInfo};
