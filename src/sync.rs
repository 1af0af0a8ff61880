use crate::error::SyncError;
use crate::protocol::{ClientMessage, ServerMessage, PROTOCOL_VERSION};
use crate::source::PositionSource;
use crate::types::PlaybackSnapshot;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, sleep, Instant};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Timing and thresholds for the broadcaster.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Cadence of PositionSource polling.
    pub sample_interval: Duration,
    /// How often a liveness probe is pushed to each session.
    pub heartbeat_interval: Duration,
    /// Inbound silence beyond this closes the session. Slightly more than
    /// one probe interval so a single ack keeps the session alive.
    pub heartbeat_timeout: Duration,
    /// Position drift (seconds, beyond expected progression) that triggers a
    /// broadcast even when track and play state are unchanged.
    pub drift_threshold: f64,
    /// Bound on the graceful drain during shutdown.
    pub shutdown_grace: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(35),
            drift_threshold: 1.5,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

type SessionRegistry = Arc<Mutex<HashMap<Uuid, mpsc::UnboundedSender<Message>>>>;
type TrackCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Server-side position synchronizer. Samples the player on a fixed cadence,
/// pushes state changes to every open session, and reaps half-open
/// connections through heartbeats.
pub struct SyncBroadcaster<S> {
    config: BroadcastConfig,
    source: Arc<S>,
    sessions: SessionRegistry,
    shutdown: CancellationToken,
    track_callback: Option<TrackCallback>,
}

impl<S: PositionSource> SyncBroadcaster<S> {
    pub fn new(config: BroadcastConfig, source: S) -> Self {
        Self {
            config,
            source: Arc::new(source),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            track_callback: None,
        }
    }

    /// Register a callback invoked with the new track id whenever sampling
    /// observes a track change.
    pub fn set_track_callback<F>(&mut self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.track_callback = Some(Arc::new(callback));
    }

    /// Token that stops the accept loop, the sampling loop, and every open
    /// session when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Bind `addr` and run until the shutdown token fires. Sessions are
    /// drained with close notifications before returning.
    pub async fn run(&self, addr: &str) -> Result<(), SyncError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| SyncError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        info!("Sync channel listening on: {}", addr);
        self.run_with_listener(listener).await;
        Ok(())
    }

    /// Same as [`run`](Self::run) with a pre-bound listener (used by tests to
    /// bind port 0).
    pub async fn run_with_listener(&self, listener: TcpListener) {
        let sampler = self.spawn_sampling_loop();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    let sessions = Arc::clone(&self.sessions);
                    let config = self.config.clone();
                    let shutdown = self.shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_session(stream, peer, sessions, config, shutdown).await {
                            debug!("Session from {} ended with error: {}", peer, e);
                        }
                    });
                }
            }
        }

        sampler.abort();
        self.drain_sessions().await;
    }

    // Independent timer-driven loop: poll the source, compare against the
    // last broadcast value, push only real changes.
    fn spawn_sampling_loop(&self) -> tokio::task::JoinHandle<()> {
        let source = Arc::clone(&self.source);
        let sessions = Arc::clone(&self.sessions);
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();
        let track_callback = self.track_callback.clone();

        tokio::spawn(async move {
            let mut ticker = interval(config.sample_interval);
            let mut last_broadcast: Option<PlaybackSnapshot> = None;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let snapshot = match source.sample().await {
                    Ok(Some(snapshot)) => snapshot,
                    Ok(None) => continue,
                    Err(e) => {
                        // Not fatal; skip this cycle and retry next tick.
                        debug!("Position sample unavailable: {}", e);
                        continue;
                    }
                };

                if !should_broadcast(last_broadcast.as_ref(), &snapshot, config.drift_threshold) {
                    continue;
                }

                if let Some(callback) = &track_callback {
                    let track_changed = last_broadcast
                        .as_ref()
                        .map(|last| last.track_id != snapshot.track_id)
                        .unwrap_or(true);
                    if track_changed {
                        callback(&snapshot.track_id);
                    }
                }

                let message = ServerMessage::Playback {
                    track_id: snapshot.track_id.clone(),
                    position: snapshot.position_seconds,
                    is_playing: snapshot.is_playing,
                };
                broadcast(&sessions, &message).await;
                last_broadcast = Some(snapshot);
            }
        })
    }

    // Graceful drain: every session gets a Close frame, then a bounded grace
    // period for in-flight sends before the registry is dropped.
    async fn drain_sessions(&self) {
        let mut sessions = self.sessions.lock().await;
        if sessions.is_empty() {
            return;
        }
        info!("Draining {} session(s)", sessions.len());
        for (id, sender) in sessions.iter() {
            if sender.send(Message::Close(None)).is_err() {
                debug!("Session {} already gone during drain", id);
            }
        }
        sessions.clear();
        drop(sessions);
        sleep(self.config.shutdown_grace).await;
    }
}

/// A new sample warrants a broadcast when the track changed, the play flag
/// flipped, or the position drifted beyond the expected progression.
fn should_broadcast(
    last: Option<&PlaybackSnapshot>,
    next: &PlaybackSnapshot,
    drift_threshold: f64,
) -> bool {
    let Some(last) = last else {
        return true;
    };
    if last.track_id != next.track_id || last.is_playing != next.is_playing {
        return true;
    }
    let elapsed = next
        .sampled_at
        .saturating_duration_since(last.sampled_at)
        .as_secs_f64();
    let expected = if last.is_playing {
        last.position_seconds + elapsed
    } else {
        last.position_seconds
    };
    (next.position_seconds - expected).abs() > drift_threshold
}

// Best-effort fan-out: a dead channel unregisters only that session, never
// the broadcaster.
async fn broadcast(sessions: &SessionRegistry, message: &ServerMessage) {
    let text = match message.to_json() {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode broadcast message: {}", e);
            return;
        }
    };

    let mut sessions = sessions.lock().await;
    if sessions.is_empty() {
        return;
    }

    let mut dead = Vec::new();
    for (id, sender) in sessions.iter() {
        if sender.send(Message::Text(text.clone())).is_err() {
            dead.push(*id);
        }
    }
    for id in dead {
        sessions.remove(&id);
        warn!("Removed dead session {}", id);
    }
    debug!("Broadcast to {} session(s): {}", sessions.len(), text);
}

async fn handle_session(
    raw_stream: TcpStream,
    peer: SocketAddr,
    sessions: SessionRegistry,
    config: BroadcastConfig,
    shutdown: CancellationToken,
) -> Result<(), SyncError> {
    let ws_stream = accept_async(raw_stream).await?;
    let session_id = Uuid::new_v4();
    info!("New session {} from {}", session_id, peer);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let hello = ServerMessage::Hello {
        session_id: session_id.to_string(),
        version: PROTOCOL_VERSION,
    };
    if let Ok(text) = hello.to_json() {
        let _ = ws_sender.send(Message::Text(text)).await;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    {
        let mut registry = sessions.lock().await;
        registry.insert(session_id, tx);
        info!(
            "Session {} registered. Total sessions: {}",
            session_id,
            registry.len()
        );
    }

    // Forward queued outbound messages onto the socket; a Close frame also
    // terminates the forwarder.
    let forwarder = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_sender.send(message).await.is_err() {
                break;
            }
            if closing {
                let _ = ws_sender.flush().await;
                break;
            }
        }
    });

    // Heartbeat state: probe on a fixed cadence, and require some inbound
    // frame before the liveness deadline.
    let mut probe_ticker = interval(config.heartbeat_interval);
    probe_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    probe_ticker.reset(); // first tick should wait a full interval
    let deadline = sleep(config.heartbeat_timeout);
    tokio::pin!(deadline);
    let mut probe_token: u64 = 0;

    let close_reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break "server shutdown",
            _ = &mut deadline => {
                warn!("Session {} heartbeat timeout", session_id);
                break "heartbeat timeout";
            }
            _ = probe_ticker.tick() => {
                probe_token = probe_token.wrapping_add(1);
                let probe = ServerMessage::Probe { token: probe_token };
                let send_failed = {
                    let registry = sessions.lock().await;
                    match registry.get(&session_id) {
                        Some(sender) => sender
                            .send(Message::Text(probe.to_json().unwrap_or_default()))
                            .is_err(),
                        None => true,
                    }
                };
                if send_failed {
                    break "outbound channel closed";
                }
            }
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(message)) => {
                        // Any inbound traffic counts as liveness.
                        deadline.as_mut().reset(Instant::now() + config.heartbeat_timeout);
                        match message {
                            Message::Text(text) => {
                                match serde_json::from_str::<ClientMessage>(&text) {
                                    Ok(ClientMessage::Ping { token }) => {
                                        debug!("Session {} ping token {}", session_id, token);
                                    }
                                    Err(_) => {
                                        // Unknown shapes are ignored for forward compatibility.
                                        debug!("Session {} sent unrecognized message: {}", session_id, text);
                                    }
                                }
                            }
                            Message::Close(_) => break "client closed",
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        debug!("Session {} socket error: {}", session_id, e);
                        break "socket error";
                    }
                    None => break "connection lost",
                }
            }
        }
    };

    // Idempotent close: the session is removed exactly once; a second pass
    // (e.g. broadcast discovering the dead channel) finds nothing.
    let removed = {
        let mut registry = sessions.lock().await;
        registry.remove(&session_id)
    };
    if let Some(sender) = removed {
        info!("Session {} closed ({})", session_id, close_reason);
        // Explicit close notification, then a bounded wait for the forwarder
        // to flush it.
        let _ = sender.send(Message::Close(None));
    }
    let _ = tokio::time::timeout(config.shutdown_grace, forwarder).await;
    Ok(())
}
