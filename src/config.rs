use crate::cache::CacheConfig;
use crate::sync::BroadcastConfig;
use log::debug;
use std::time::Duration;

const DEFAULT_PORT_RANGE: (u16, u16) = (8000, 8010);

/// Process configuration, read from environment variables (a `.env` file is
/// loaded by the binary before this runs).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    /// Fixed port when `LYRISYNC_PORT` is set; otherwise the first free port
    /// in `port_range` is used.
    pub port: Option<u16>,
    pub port_range: (u16, u16),
    pub player_api_url: String,
    pub gemini_api_key: Option<String>,
    pub gemini_model: Option<String>,
    pub broadcast: BroadcastConfig,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: None,
            port_range: DEFAULT_PORT_RANGE,
            player_api_url: "http://127.0.0.1:9090/player/state".to_string(),
            gemini_api_key: None,
            gemini_model: None,
            broadcast: BroadcastConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_var(name)?.parse::<u64>().ok().map(Duration::from_secs)
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Some(host) = env_var("LYRISYNC_HOST") {
            config.host = host;
        }
        config.port = env_var("LYRISYNC_PORT").and_then(|p| p.parse().ok());
        if let Some(url) = env_var("PLAYER_API_URL") {
            config.player_api_url = url;
        }
        config.gemini_api_key = env_var("GEMINI_API_KEY");
        config.gemini_model = env_var("GEMINI_MODEL");
        if let Some(interval) = env_secs("LYRISYNC_SAMPLE_INTERVAL_SECS") {
            config.broadcast.sample_interval = interval;
        }
        if let Some(ttl) = env_secs("LYRISYNC_FAILURE_TTL_SECS") {
            config.cache.failure_ttl = ttl;
        }
        config
    }

    /// The port to bind: the configured one, or the first free port in the
    /// scan range.
    pub fn resolve_port(&self) -> Option<u16> {
        if let Some(port) = self.port {
            return Some(port);
        }
        let (start, end) = self.port_range;
        for port in start..end {
            if std::net::TcpListener::bind((self.host.as_str(), port)).is_ok() {
                return Some(port);
            }
            debug!("Port {} is in use, trying next port", port);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_scan_the_reference_port_range() {
        let config = Config::default();
        assert_eq!(config.port_range, (8000, 8010));
        assert!(config.port.is_none());
    }

    #[test]
    fn fixed_port_wins_over_scanning() {
        let config = Config {
            port: Some(1234),
            ..Config::default()
        };
        assert_eq!(config.resolve_port(), Some(1234));
    }

    #[test]
    fn scanning_finds_a_free_port() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            ..Config::default()
        };
        // At least one port in a 10-port range should be free on a test box.
        assert!(config.resolve_port().is_some());
    }
}
