use crate::protocol::{ClientMessage, ServerMessage};
use crate::types::LyricLine;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, sleep, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

/// The client's view of server playback truth. Overwritten wholesale on every
/// received snapshot; partial updates would desynchronize the position from
/// its clock anchor.
#[derive(Debug, Clone, Copy)]
pub struct ClientSyncState {
    pub last_server_position: f64,
    pub is_playing: bool,
    pub last_sync_instant: Instant,
}

/// Client-side predictive renderer: extrapolates playback position between
/// authoritative snapshots and picks the lyric line to highlight.
#[derive(Debug, Default)]
pub struct LyricsRenderer {
    state: Option<ClientSyncState>,
    lines: Vec<LyricLine>,
    active: Option<usize>,
}

impl LyricsRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the lyric sheet to highlight against. Lines are kept sorted
    /// ascending by time; the highlight scan depends on it.
    pub fn set_lines(&mut self, mut lines: Vec<LyricLine>) {
        lines.sort_by(|a, b| a.time.total_cmp(&b.time));
        self.lines = lines;
        self.active = None;
    }

    pub fn lines(&self) -> &[LyricLine] {
        &self.lines
    }

    /// Apply an authoritative snapshot, re-anchoring extrapolation at `now`.
    /// All three fields are replaced together.
    pub fn apply_snapshot(&mut self, position: f64, is_playing: bool, now: Instant) {
        self.state = Some(ClientSyncState {
            last_server_position: position,
            is_playing,
            last_sync_instant: now,
        });
    }

    pub fn sync_state(&self) -> Option<ClientSyncState> {
        self.state
    }

    /// Extrapolated position: server position plus monotonic elapsed time
    /// while playing, frozen while paused. `None` before the first snapshot.
    pub fn displayed_position(&self, now: Instant) -> Option<f64> {
        let state = self.state?;
        if state.is_playing {
            let elapsed = now
                .saturating_duration_since(state.last_sync_instant)
                .as_secs_f64();
            Some(state.last_server_position + elapsed)
        } else {
            Some(state.last_server_position)
        }
    }

    /// Index of the last line whose time is at or before the displayed
    /// position. `None` when the position precedes the first line (clock
    /// skew) or no snapshot has arrived yet.
    pub fn active_line(&self, now: Instant) -> Option<usize> {
        let position = self.displayed_position(now)?;
        if position < 0.0 {
            return None;
        }
        let count = self.lines.partition_point(|line| line.time <= position);
        count.checked_sub(1)
    }

    /// One render frame: recompute the highlight, returning `Some` with the
    /// new active index when it moved (the previous mark is cleared).
    pub fn tick(&mut self, now: Instant) -> Option<Option<usize>> {
        let active = self.active_line(now);
        if active != self.active {
            self.active = active;
            Some(active)
        } else {
            None
        }
    }

    pub fn current_highlight(&self) -> Option<usize> {
        self.active
    }
}

/// Configuration for the sync client task.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    /// Cadence of client keepalive pings.
    pub ping_interval: Duration,
    /// Delay before a reconnect attempt after a dropped channel.
    pub reconnect_delay: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ping_interval: Duration::from_secs(25),
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

/// Owns the client end of the sync channel: applies playback snapshots to
/// the shared renderer, answers probes with pings, and reconnects after
/// drops while retaining the last known snapshot (no jump back to zero).
pub struct SyncClient {
    config: ClientConfig,
    renderer: Arc<Mutex<LyricsRenderer>>,
    cancel: CancellationToken,
}

impl SyncClient {
    pub fn new(config: ClientConfig, renderer: Arc<Mutex<LyricsRenderer>>) -> Self {
        Self {
            config,
            renderer,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until cancelled. Each connection failure logs, waits, and retries;
    /// renderer state survives across connections.
    pub async fn run(&self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.run_connection().await {
                Ok(()) => break, // cancelled from inside
                Err(e) => {
                    warn!("Sync channel lost: {}; reconnecting", e);
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(self.config.reconnect_delay) => {}
            }
        }
        info!("Sync client stopped");
    }

    async fn run_connection(&self) -> Result<(), tungstenite::Error> {
        let (ws, _) = connect_async(&self.config.url).await?;
        info!("Connected to {}", self.config.url);
        let (mut sender, mut receiver) = ws.split();

        let mut ping_ticker = interval(self.config.ping_interval);
        let mut ping_token: u64 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Explicit close on teardown so the server can reap the
                    // session immediately.
                    let _ = sender.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = ping_ticker.tick() => {
                    ping_token = ping_token.wrapping_add(1);
                    let ping = ClientMessage::Ping { token: ping_token };
                    let text = serde_json::to_string(&ping).unwrap_or_default();
                    sender.send(Message::Text(text)).await?;
                }
                frame = receiver.next() => {
                    let message = match frame {
                        Some(frame) => frame?,
                        None => return Err(tungstenite::Error::ConnectionClosed),
                    };
                    match message {
                        Message::Text(text) => self.handle_server_message(&text).await,
                        Message::Close(_) => return Err(tungstenite::Error::ConnectionClosed),
                        _ => {}
                    }
                }
            }
        }
    }

    async fn handle_server_message(&self, text: &str) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(ServerMessage::Playback {
                position,
                is_playing,
                ..
            }) => {
                let mut renderer = self.renderer.lock().await;
                renderer.apply_snapshot(position, is_playing, Instant::now());
            }
            Ok(ServerMessage::Hello { session_id, version }) => {
                info!("Session {} open (protocol v{})", session_id, version);
            }
            Ok(ServerMessage::Probe { .. }) => {
                // Inbound traffic alone satisfies the server's liveness
                // check; the regular ping cadence is the acknowledgement.
                debug!("Received liveness probe");
            }
            Err(_) => {
                debug!("Ignoring unrecognized server message: {}", text);
            }
        }
    }
}

/// Drive the renderer on a frame cadence until the token fires, invoking
/// `on_highlight` whenever the active line changes.
pub async fn run_render_loop<F>(
    renderer: Arc<Mutex<LyricsRenderer>>,
    frame_interval: Duration,
    cancel: CancellationToken,
    mut on_highlight: F,
) where
    F: FnMut(Option<usize>),
{
    let mut frames = interval(frame_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = frames.tick() => {
                let mut renderer = renderer.lock().await;
                if let Some(active) = renderer.tick(Instant::now()) {
                    on_highlight(active);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet() -> Vec<LyricLine> {
        vec![
            LyricLine::new(0.0, "intro"),
            LyricLine::new(10.0, "verse"),
            LyricLine::new(20.0, "chorus"),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn displayed_position_equals_snapshot_at_zero_elapsed() {
        let mut renderer = LyricsRenderer::new();
        let now = Instant::now();
        renderer.apply_snapshot(42.0, true, now);
        assert_eq!(renderer.displayed_position(now), Some(42.0));
    }

    #[tokio::test(start_paused = true)]
    async fn position_increases_while_playing() {
        let mut renderer = LyricsRenderer::new();
        renderer.apply_snapshot(42.0, true, Instant::now());

        tokio::time::advance(Duration::from_secs(3)).await;
        let displayed = renderer.displayed_position(Instant::now()).unwrap();
        assert!((displayed - 45.0).abs() < 0.05, "displayed={}", displayed);

        tokio::time::advance(Duration::from_secs(1)).await;
        let later = renderer.displayed_position(Instant::now()).unwrap();
        assert!(later > displayed);
    }

    #[tokio::test(start_paused = true)]
    async fn position_freezes_while_paused() {
        let mut renderer = LyricsRenderer::new();
        renderer.apply_snapshot(42.0, false, Instant::now());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(renderer.displayed_position(Instant::now()), Some(42.0));
    }

    #[tokio::test(start_paused = true)]
    async fn highlight_picks_last_line_at_or_before_position() {
        let mut renderer = LyricsRenderer::new();
        renderer.set_lines(sheet());

        renderer.apply_snapshot(15.0, false, Instant::now());
        assert_eq!(renderer.active_line(Instant::now()), Some(1));

        renderer.apply_snapshot(0.0, false, Instant::now());
        assert_eq!(renderer.active_line(Instant::now()), Some(0));

        renderer.apply_snapshot(-1.0, false, Instant::now());
        assert_eq!(renderer.active_line(Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_reports_only_highlight_changes() {
        let mut renderer = LyricsRenderer::new();
        renderer.set_lines(sheet());
        renderer.apply_snapshot(9.0, true, Instant::now());

        assert_eq!(renderer.tick(Instant::now()), Some(Some(0)));
        assert_eq!(renderer.tick(Instant::now()), None);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(renderer.tick(Instant::now()), Some(Some(1)));
        assert_eq!(renderer.current_highlight(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_retains_last_snapshot_and_resumes() {
        let mut renderer = LyricsRenderer::new();
        renderer.apply_snapshot(42.0, true, Instant::now());

        // Channel drops; three seconds pass before reconnect completes. The
        // retained snapshot keeps extrapolating instead of resetting to zero.
        tokio::time::advance(Duration::from_secs(3)).await;
        let displayed = renderer.displayed_position(Instant::now()).unwrap();
        assert!((displayed - 45.0).abs() < 0.05, "displayed={}", displayed);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_overwrites_all_fields_together() {
        let mut renderer = LyricsRenderer::new();
        renderer.apply_snapshot(42.0, true, Instant::now());
        tokio::time::advance(Duration::from_secs(5)).await;

        // Server says 40.0 paused: displayed must follow server truth, not
        // keep extrapolating from the stale anchor.
        renderer.apply_snapshot(40.0, false, Instant::now());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(renderer.displayed_position(Instant::now()), Some(40.0));
    }

    #[tokio::test(start_paused = true)]
    async fn render_loop_emits_highlight_changes_until_cancelled() {
        let renderer = Arc::new(Mutex::new(LyricsRenderer::new()));
        {
            let mut guard = renderer.lock().await;
            guard.set_lines(sheet());
            guard.apply_snapshot(9.5, true, Instant::now());
        }

        let cancel = CancellationToken::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_in_loop = Arc::clone(&seen);
        let loop_task = tokio::spawn(run_render_loop(
            Arc::clone(&renderer),
            Duration::from_millis(16),
            cancel.clone(),
            move |active| seen_in_loop.lock().unwrap().push(active),
        ));

        // Let the first frame run before advancing time.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        cancel.cancel();
        loop_task.await.unwrap();

        // Crossed from line 0 into line 1 at t=10; each change reported once.
        assert_eq!(*seen.lock().unwrap(), vec![Some(0), Some(1)]);
    }

    #[tokio::test]
    async fn client_applies_playback_messages_from_the_channel() {
        use tokio::net::TcpListener;
        use tokio_tungstenite::accept_async;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Minimal server: accept one session, push one playback message.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let message = ServerMessage::Playback {
                track_id: "abc".to_string(),
                position: 12.5,
                is_playing: true,
            };
            ws.send(Message::Text(message.to_json().unwrap()))
                .await
                .unwrap();
            // Keep the connection open until the client is done.
            let _ = ws.next().await;
        });

        let renderer = Arc::new(Mutex::new(LyricsRenderer::new()));
        let client = SyncClient::new(
            ClientConfig::new(format!("ws://{}", addr)),
            Arc::clone(&renderer),
        );
        let cancel = client.cancel_token();
        let task = tokio::spawn(async move { client.run().await });

        // Wait for the snapshot to land.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            {
                let renderer = renderer.lock().await;
                if let Some(state) = renderer.sync_state() {
                    assert_eq!(state.last_server_position, 12.5);
                    assert!(state.is_playing);
                    break;
                }
            }
            assert!(Instant::now() < deadline, "snapshot never applied");
            sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        let _ = task.await;
    }
}
