use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use telegrid_core::{ClientFrame, ServerFrame, StreamKey};

use crate::handlers::HandlerRegistry;
use crate::reconnect::{ReconnectPolicy, ReconnectState};
use crate::LINK_SCOPE;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle of the managed link. `Disconnected` is terminal until the
/// caller asks for a reconnect; `desired_subscriptions` survive it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub url: String,
    /// Cadence of outbound pings.
    pub ping_interval: Duration,
    /// How stale the last pong may be before the link is declared dead.
    pub pong_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

enum Command {
    Subscribe(Vec<StreamKey>),
    Unsubscribe(Vec<StreamKey>),
    Reconnect,
    Shutdown,
}

enum LinkOutcome {
    Lost,
    Shutdown,
}

/// Caller-facing handle: subscription intent, state observation, manual
/// reconnect after terminal failure.
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<SessionState>,
    desired: Arc<RwLock<HashSet<StreamKey>>>,
}

impl ClientHandle {
    /// Add keys to the declarative subscription set. Applied immediately on
    /// a live link and re-applied after every reconnect.
    pub async fn subscribe(&self, keys: Vec<StreamKey>) {
        self.desired.write().extend(keys.iter().cloned());
        let _ = self.commands.send(Command::Subscribe(keys)).await;
    }

    pub async fn unsubscribe(&self, keys: Vec<StreamKey>) {
        {
            let mut desired = self.desired.write();
            for key in &keys {
                desired.remove(key);
            }
        }
        let _ = self.commands.send(Command::Unsubscribe(keys)).await;
    }

    /// Restart the connect loop after terminal failure (or force a fresh
    /// link). Subscription intent is untouched.
    pub async fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Wait until the session reaches the given state.
    pub async fn wait_for(&mut self, target: SessionState) {
        loop {
            if *self.state_rx.borrow_and_update() == target {
                return;
            }
            if self.state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn desired_subscriptions(&self) -> HashSet<StreamKey> {
        self.desired.read().clone()
    }
}

/// The session manager itself. All of its logic runs on one task;
/// suspension happens only at socket reads/writes and timers.
pub struct ClientSession {
    config: ClientConfig,
    handlers: Arc<HandlerRegistry>,
    desired: Arc<RwLock<HashSet<StreamKey>>>,
}

impl ClientSession {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            handlers: Arc::new(HandlerRegistry::new()),
            desired: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Register handlers before (or after) spawning.
    pub fn handlers(&self) -> Arc<HandlerRegistry> {
        self.handlers.clone()
    }

    pub fn spawn(self) -> (ClientHandle, tokio::task::JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let handle = ClientHandle {
            commands: commands_tx,
            state_rx,
            desired: self.desired.clone(),
        };
        let task = tokio::spawn(self.run(commands_rx, state_tx));
        (handle, task)
    }

    async fn run(self, mut commands: mpsc::Receiver<Command>, state_tx: watch::Sender<SessionState>) {
        let mut reconnect = ReconnectState::new();

        'outer: loop {
            let _ = state_tx.send(SessionState::Connecting);
            match connect_async(self.config.url.as_str()).await {
                Ok((ws, _)) => {
                    reconnect.reset();
                    info!(url = %self.config.url, "link established");
                    let _ = state_tx.send(SessionState::Connected);
                    match self.drive(ws, &mut commands).await {
                        LinkOutcome::Shutdown => break 'outer,
                        LinkOutcome::Lost => {
                            let _ = state_tx.send(SessionState::Reconnecting);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "connect failed");
                    let _ = state_tx.send(SessionState::Reconnecting);
                }
            }

            match reconnect.record_failure(&self.config.reconnect) {
                Some(delay) => {
                    debug!(
                        delay_ms = delay.as_millis() as u64,
                        attempt = reconnect.attempt(),
                        "backing off before reconnect"
                    );
                    let sleep = tokio::time::sleep(delay);
                    tokio::pin!(sleep);
                    loop {
                        tokio::select! {
                            () = &mut sleep => break,
                            command = commands.recv() => match command {
                                Some(Command::Shutdown) | None => break 'outer,
                                Some(Command::Reconnect) => break, // skip the rest of the wait
                                Some(_) => {} // intent already recorded in `desired`
                            }
                        }
                    }
                }
                None => {
                    warn!(url = %self.config.url, "reconnect attempts exhausted");
                    self.handlers.dispatch(&ServerFrame::Status {
                        stream_key: StreamKey::from_raw(LINK_SCOPE),
                        status: "disconnected".into(),
                    });
                    let _ = state_tx.send(SessionState::Disconnected);

                    // Park until the caller intervenes; intent is preserved
                    // so a manual reconnect resumes exactly where we left off.
                    loop {
                        match commands.recv().await {
                            Some(Command::Reconnect) => {
                                reconnect.reset();
                                continue 'outer;
                            }
                            Some(Command::Shutdown) | None => break 'outer,
                            Some(_) => {}
                        }
                    }
                }
            }
        }

        let _ = state_tx.send(SessionState::Disconnected);
    }

    /// Pump one live link until it drops or the caller shuts down.
    async fn drive(&self, ws: WsStream, commands: &mut mpsc::Receiver<Command>) -> LinkOutcome {
        let (mut ws_tx, mut ws_rx) = ws.split();

        // Declarative resubscription: the desired set is the source of
        // truth, not whatever the previous link had acknowledged.
        let desired: Vec<StreamKey> = self.desired.read().iter().cloned().collect();
        if !desired.is_empty() {
            debug!(count = desired.len(), "re-applying subscription intent");
            if send_frame(&mut ws_tx, &ClientFrame::Subscribe { stream_keys: desired })
                .await
                .is_err()
            {
                return LinkOutcome::Lost;
            }
        }

        let mut ping_timer = tokio::time::interval(self.config.ping_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping_timer.tick().await; // consume the immediate first tick
        let mut last_pong = Instant::now();

        loop {
            tokio::select! {
                message = ws_rx.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => {
                                if matches!(frame, ServerFrame::Pong { .. }) {
                                    last_pong = Instant::now();
                                }
                                self.handlers.dispatch(&frame);
                            }
                            Err(e) => warn!(error = %e, "undecodable server frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return LinkOutcome::Lost,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "socket error");
                        return LinkOutcome::Lost;
                    }
                },
                _ = ping_timer.tick() => {
                    if last_pong.elapsed() > self.config.pong_timeout {
                        warn!("pong overdue, dropping link");
                        return LinkOutcome::Lost;
                    }
                    let ping = ClientFrame::Ping { timestamp: Utc::now() };
                    if send_frame(&mut ws_tx, &ping).await.is_err() {
                        return LinkOutcome::Lost;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Subscribe(keys)) => {
                        let _ = send_frame(&mut ws_tx, &ClientFrame::Subscribe { stream_keys: keys }).await;
                    }
                    Some(Command::Unsubscribe(keys)) => {
                        let _ = send_frame(&mut ws_tx, &ClientFrame::Unsubscribe { stream_keys: keys }).await;
                    }
                    Some(Command::Reconnect) => return LinkOutcome::Lost,
                    Some(Command::Shutdown) | None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return LinkOutcome::Shutdown;
                    }
                }
            }
        }
    }
}

async fn send_frame(
    ws_tx: &mut SplitSink<WsStream, Message>,
    frame: &ClientFrame,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let json = serde_json::to_string(frame).unwrap_or_default();
    ws_tx.send(Message::Text(json.into())).await
}
