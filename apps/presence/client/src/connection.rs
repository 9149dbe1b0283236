//! Single long-lived presence socket with an observable lifecycle.
//!
//! The monitor owns at most one [`Link`] at a time. Transport failures never
//! surface as errors to senders; they show up as phase changes and in
//! [`HealthMonitor::is_healthy`]. When a link drops without a manual
//! [`HealthMonitor::disconnect`], a background loop reconnects with backoff
//! until the attempt cap, after which the monitor waits for
//! [`HealthMonitor::resume`] or an explicit [`HealthMonitor::connect`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use tripteller_presence_core::{now_millis, ClientEvent, Ping, ServerEvent};

use crate::backoff::BackoffPolicy;

const DEFAULT_LINK_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    /// The link dropped on its own and the backoff loop is working on it.
    Reconnecting,
}

/// One open transport: text frames out, decoded server events in.
pub struct Link {
    outbound: mpsc::Sender<String>,
    inbound: mpsc::Receiver<ServerEvent>,
    open: Arc<AtomicBool>,
}

/// Far end of an in-memory [`Link`].
pub struct LinkPeer {
    pub outbound: mpsc::Receiver<String>,
    pub inbound: mpsc::Sender<ServerEvent>,
    open: Arc<AtomicBool>,
}

impl Link {
    pub fn new(
        outbound: mpsc::Sender<String>,
        inbound: mpsc::Receiver<ServerEvent>,
        open: Arc<AtomicBool>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            open,
        }
    }

    pub fn channel(buffer: usize) -> (Link, LinkPeer) {
        let (out_tx, out_rx) = mpsc::channel(buffer);
        let (in_tx, in_rx) = mpsc::channel(buffer);
        let open = Arc::new(AtomicBool::new(true));
        (
            Link::new(out_tx, in_rx, open.clone()),
            LinkPeer {
                outbound: out_rx,
                inbound: in_tx,
                open,
            },
        )
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.outbound.is_closed()
    }
}

impl LinkPeer {
    /// Marks the transport as no longer open without tearing it down.
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }

    /// Next outbound frame, decoded.
    pub async fn recv_event(&mut self) -> Option<ClientEvent> {
        while let Some(text) = self.outbound.recv().await {
            match serde_json::from_str(&text) {
                Ok(event) => return Some(event),
                Err(err) => warn!(error = %err, "peer received undecodable frame"),
            }
        }
        None
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connect timed out after {0:?}")]
    TimedOut(Duration),
    #[error("connect cancelled by disconnect")]
    Cancelled,
    #[error("reconnect already in progress")]
    ReconnectInProgress,
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Link, ConnectError>;
}

/// Opens the presence socket over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    token: Option<String>,
    buffer: usize,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            buffer: DEFAULT_LINK_BUFFER,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn endpoint(&self) -> String {
        match &self.token {
            Some(token) => {
                let separator = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}token={}", self.url, separator, token)
            }
            None => self.url.clone(),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link, ConnectError> {
        let (stream, _) = connect_async(self.endpoint()).await?;
        let (mut ws_tx, mut ws_rx) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.buffer);
        let (in_tx, in_rx) = mpsc::channel::<ServerEvent>(self.buffer);
        let open = Arc::new(AtomicBool::new(true));

        let writer_open = open.clone();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            writer_open.store(false, Ordering::Release);
            let _ = ws_tx.close().await;
        });

        let reader_open = open.clone();
        tokio::spawn(async move {
            while let Some(message) = ws_rx.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if in_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(error = %err, "ignoring undecodable server frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(error = %err, "websocket read failed");
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::Release);
        });

        Ok(Link::new(out_tx, in_rx, open))
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// `is_healthy` requires a connect or heartbeat reply within this window.
    pub freshness_window: Duration,
    pub max_latency: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(30),
            freshness_window: Duration::from_secs(5 * 60),
            max_latency: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    phase_tx: watch::Sender<Phase>,
    events: broadcast::Sender<ServerEvent>,
}

struct MonitorState {
    phase: Phase,
    attempt_count: u32,
    last_connected_at: Option<Instant>,
    last_pong_at: Option<Instant>,
    latency: Option<Duration>,
    connection_id: Option<String>,
    outbound: Option<mpsc::Sender<String>>,
    open: Option<Arc<AtomicBool>>,
    generation: u64,
    manual_disconnect: bool,
    needs_intervention: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl MonitorState {
    fn release_link(&mut self) {
        self.outbound = None;
        self.open = None;
        self.connection_id = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl HealthMonitor {
    pub fn new(connector: impl Connector, config: MonitorConfig) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Disconnected);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                connector: Arc::new(connector),
                config,
                state: Mutex::new(MonitorState {
                    phase: Phase::Disconnected,
                    attempt_count: 0,
                    last_connected_at: None,
                    last_pong_at: None,
                    latency: None,
                    connection_id: None,
                    outbound: None,
                    open: None,
                    generation: 0,
                    manual_disconnect: false,
                    needs_intervention: false,
                    tasks: Vec::new(),
                }),
                phase_tx,
                events,
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }

    pub fn phase_changes(&self) -> watch::Receiver<Phase> {
        self.inner.phase_tx.subscribe()
    }

    /// Every server event received on any link, in arrival order.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    pub fn attempt_count(&self) -> u32 {
        self.inner.state.lock().attempt_count
    }

    pub fn connection_id(&self) -> Option<String> {
        self.inner.state.lock().connection_id.clone()
    }

    pub fn latency(&self) -> Option<Duration> {
        self.inner.state.lock().latency
    }

    pub fn needs_intervention(&self) -> bool {
        self.inner.state.lock().needs_intervention
    }

    /// Opens the link. A no-op while already connecting or connected; fails
    /// while the background reconnect loop owns the link.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        {
            let mut state = self.inner.state.lock();
            match state.phase {
                Phase::Disconnected => {}
                Phase::Reconnecting => return Err(ConnectError::ReconnectInProgress),
                Phase::Connecting | Phase::Connected => return Ok(()),
            }
            state.manual_disconnect = false;
            state.needs_intervention = false;
            self.set_phase(&mut state, Phase::Connecting);
        }
        self.attempt().await
    }

    /// Foreground/online trigger: clears an exhausted retry budget and connects
    /// again unless the caller disconnected on purpose.
    pub async fn resume(&self) -> Result<(), ConnectError> {
        {
            let mut state = self.inner.state.lock();
            if state.manual_disconnect || state.phase != Phase::Disconnected {
                return Ok(());
            }
            state.attempt_count = 0;
        }
        self.connect().await
    }

    pub fn disconnect(&self) {
        let mut state = self.inner.state.lock();
        state.manual_disconnect = true;
        state.generation += 1;
        state.release_link();
        if state.phase != Phase::Disconnected {
            info!("presence link closed by caller");
        }
        self.set_phase(&mut state, Phase::Disconnected);
    }

    /// Sends one event if the link is up. Returns `false` instead of failing;
    /// callers treat that as "try later".
    pub fn safe_send(&self, event: &ClientEvent) -> bool {
        let outbound = {
            let state = self.inner.state.lock();
            if state.phase != Phase::Connected {
                debug!(event = event.name(), phase = ?state.phase, "send skipped; not connected");
                return false;
            }
            let open = state
                .open
                .as_ref()
                .is_some_and(|open| open.load(Ordering::Acquire));
            match (&state.outbound, open) {
                (Some(outbound), true) => outbound.clone(),
                _ => {
                    debug!(event = event.name(), "send skipped; transport not open");
                    return false;
                }
            }
        };

        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = event.name(), error = %err, "failed to encode event");
                return false;
            }
        };
        match outbound.try_send(text) {
            Ok(()) => true,
            Err(err) => {
                warn!(event = event.name(), error = %err, "send failed; try later");
                false
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        let state = self.inner.state.lock();
        if state.phase != Phase::Connected {
            return false;
        }
        if !state
            .open
            .as_ref()
            .is_some_and(|open| open.load(Ordering::Acquire))
        {
            return false;
        }
        let freshest = match (state.last_connected_at, state.last_pong_at) {
            (Some(connected), Some(pong)) => connected.max(pong),
            (Some(connected), None) => connected,
            (None, Some(pong)) => pong,
            (None, None) => return false,
        };
        if freshest.elapsed() >= self.inner.config.freshness_window {
            return false;
        }
        state
            .latency
            .map_or(true, |latency| latency < self.inner.config.max_latency)
    }

    fn set_phase(&self, state: &mut MonitorState, phase: Phase) {
        state.phase = phase;
        self.inner.phase_tx.send_replace(phase);
    }

    async fn attempt(&self) -> Result<(), ConnectError> {
        let connect_timeout = self.inner.config.connect_timeout;
        let outcome = match timeout(connect_timeout, self.inner.connector.connect()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::TimedOut(connect_timeout)),
        };

        match outcome {
            Ok(link) => self.install(link),
            Err(err) => {
                let mut state = self.inner.state.lock();
                state.attempt_count += 1;
                if state.phase == Phase::Connecting {
                    self.set_phase(&mut state, Phase::Disconnected);
                }
                warn!(attempt = state.attempt_count, error = %err, "presence connect failed");
                Err(err)
            }
        }
    }

    fn install(&self, link: Link) -> Result<(), ConnectError> {
        let mut state = self.inner.state.lock();
        if state.manual_disconnect
            || !matches!(state.phase, Phase::Connecting | Phase::Reconnecting)
        {
            return Err(ConnectError::Cancelled);
        }

        state.generation += 1;
        let generation = state.generation;
        let Link {
            outbound,
            inbound,
            open,
        } = link;

        state.attempt_count = 0;
        state.needs_intervention = false;
        state.last_connected_at = Some(Instant::now());
        state.latency = None;
        state.outbound = Some(outbound);
        state.open = Some(open);
        state.tasks.push(tokio::spawn(self.clone().pump(inbound, generation)));
        state.tasks.push(tokio::spawn(self.clone().heartbeat()));
        self.set_phase(&mut state, Phase::Connected);
        info!("presence link established");
        Ok(())
    }

    async fn pump(self, mut inbound: mpsc::Receiver<ServerEvent>, generation: u64) {
        while let Some(event) = inbound.recv().await {
            self.observe(&event);
            let _ = self.inner.events.send(event);
        }
        self.on_link_lost(generation);
    }

    fn observe(&self, event: &ServerEvent) {
        let mut state = self.inner.state.lock();
        match event {
            ServerEvent::Connected(connected) => {
                state.connection_id = Some(connected.connection_id.clone());
            }
            ServerEvent::Pong(pong) => {
                let round_trip = (now_millis() - pong.sent_at).max(0) as u64;
                state.latency = Some(Duration::from_millis(round_trip));
                state.last_pong_at = Some(Instant::now());
            }
            _ => {}
        }
    }

    async fn heartbeat(self) {
        let period = self.inner.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            self.safe_send(&ClientEvent::Ping(Ping {
                sent_at: now_millis(),
            }));
        }
    }

    fn on_link_lost(&self, generation: u64) {
        let mut state = self.inner.state.lock();
        if state.generation != generation {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = state.tasks.drain(..).collect();
        state.outbound = None;
        state.open = None;
        state.connection_id = None;
        warn!("presence link lost");
        if state.manual_disconnect {
            self.set_phase(&mut state, Phase::Disconnected);
        } else {
            self.set_phase(&mut state, Phase::Reconnecting);
            tokio::spawn(self.clone().reconnect_loop());
        }
        drop(state);
        // includes the pump that called us, which is already finishing
        for task in tasks {
            task.abort();
        }
    }

    async fn reconnect_loop(self) {
        let policy = self.inner.config.backoff;
        loop {
            let attempt = {
                let mut state = self.inner.state.lock();
                if state.manual_disconnect || state.phase != Phase::Reconnecting {
                    return;
                }
                if policy.exhausted(state.attempt_count) {
                    state.needs_intervention = true;
                    self.set_phase(&mut state, Phase::Disconnected);
                    warn!(
                        attempts = state.attempt_count,
                        "reconnect budget exhausted; waiting for resume"
                    );
                    return;
                }
                state.attempt_count
            };

            let delay = policy.delay_for(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            sleep(delay).await;

            if self.inner.state.lock().phase != Phase::Reconnecting {
                return;
            }
            if self.attempt().await.is_ok() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tripteller_presence_core::{Connected, Pong};

    /// Hands out queued links; an empty queue fails the attempt.
    #[derive(Clone, Default)]
    struct ScriptedConnector {
        links: Arc<Mutex<VecDeque<Link>>>,
        calls: Arc<Mutex<u32>>,
    }

    impl ScriptedConnector {
        fn push(&self) -> LinkPeer {
            let (link, peer) = Link::channel(16);
            self.links.lock().push_back(link);
            peer
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self) -> Result<Link, ConnectError> {
            *self.calls.lock() += 1;
            self.links
                .lock()
                .pop_front()
                .ok_or_else(|| ConnectError::Unavailable("no link scripted".into()))
        }
    }

    fn config(max_attempts: u32) -> MonitorConfig {
        MonitorConfig {
            backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), max_attempts),
            ..MonitorConfig::default()
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn connect_is_idempotent() {
        let connector = ScriptedConnector::default();
        let _peer = connector.push();
        let monitor = HealthMonitor::new(connector.clone(), config(3));

        monitor.connect().await.unwrap();
        monitor.connect().await.unwrap();
        assert_eq!(monitor.phase(), Phase::Connected);
        assert_eq!(connector.calls(), 1);
        assert!(monitor.is_healthy());
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn failed_connect_counts_attempt() {
        let connector = ScriptedConnector::default();
        let monitor = HealthMonitor::new(connector, config(3));
        assert!(monitor.connect().await.is_err());
        assert_eq!(monitor.phase(), Phase::Disconnected);
        assert_eq!(monitor.attempt_count(), 1);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn safe_send_reports_failure_when_down() {
        let connector = ScriptedConnector::default();
        let mut peer = connector.push();
        let monitor = HealthMonitor::new(connector, config(3));
        let ping = ClientEvent::Ping(Ping { sent_at: 1 });

        assert!(!monitor.safe_send(&ping));
        monitor.connect().await.unwrap();
        assert!(monitor.safe_send(&ping));
        assert_eq!(peer.recv_event().await, Some(ping.clone()));

        peer.set_open(false);
        assert!(!monitor.safe_send(&ping));
        assert!(!monitor.is_healthy());
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn disconnect_is_idempotent_and_clears_identity() {
        let connector = ScriptedConnector::default();
        let peer = connector.push();
        let monitor = HealthMonitor::new(connector, config(3));
        monitor.connect().await.unwrap();
        peer.inbound
            .send(ServerEvent::Connected(Connected {
                connection_id: "c-1".into(),
                server_time: 0,
            }))
            .await
            .unwrap();
        settle().await;
        assert_eq!(monitor.connection_id().as_deref(), Some("c-1"));

        monitor.disconnect();
        monitor.disconnect();
        assert_eq!(monitor.phase(), Phase::Disconnected);
        assert!(monitor.connection_id().is_none());
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn health_expires_without_heartbeat_replies() {
        let connector = ScriptedConnector::default();
        let peer = connector.push();
        let monitor = HealthMonitor::new(connector, config(3));
        monitor.connect().await.unwrap();
        assert!(monitor.is_healthy());

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        peer.inbound
            .send(ServerEvent::Pong(Pong {
                sent_at: now_millis(),
                server_time: 0,
            }))
            .await
            .unwrap();
        settle().await;
        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        assert!(monitor.is_healthy(), "pong refreshed the window");

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        assert!(!monitor.is_healthy());
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn heartbeat_sends_pings() {
        let connector = ScriptedConnector::default();
        let mut peer = connector.push();
        let monitor = HealthMonitor::new(connector, config(3));
        monitor.connect().await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(matches!(peer.recv_event().await, Some(ClientEvent::Ping(_))));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn dropped_link_reconnects_and_resets_attempts() {
        let connector = ScriptedConnector::default();
        let peer = connector.push();
        let monitor = HealthMonitor::new(connector.clone(), config(5));
        let mut phases = monitor.phase_changes();
        monitor.connect().await.unwrap();

        let _second = connector.push();
        drop(peer);
        phases
            .wait_for(|phase| *phase == Phase::Reconnecting)
            .await
            .unwrap();
        phases
            .wait_for(|phase| *phase == Phase::Connected)
            .await
            .unwrap();
        assert_eq!(connector.calls(), 2);
        assert_eq!(monitor.attempt_count(), 0);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn connect_during_reconnect_reports_it() {
        let connector = ScriptedConnector::default();
        let peer = connector.push();
        let monitor = HealthMonitor::new(connector.clone(), config(5));
        let mut phases = monitor.phase_changes();
        monitor.connect().await.unwrap();

        drop(peer);
        phases
            .wait_for(|phase| *phase == Phase::Reconnecting)
            .await
            .unwrap();
        assert!(matches!(
            monitor.connect().await,
            Err(ConnectError::ReconnectInProgress)
        ));
        assert_eq!(connector.calls(), 1);
        assert!(!monitor.is_healthy());

        let _second = connector.push();
        phases
            .wait_for(|phase| *phase == Phase::Connected)
            .await
            .unwrap();
        monitor.connect().await.unwrap();
        assert_eq!(connector.calls(), 2);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn exhausted_retries_need_intervention_until_resume() {
        let connector = ScriptedConnector::default();
        let peer = connector.push();
        let monitor = HealthMonitor::new(connector.clone(), config(3));
        monitor.connect().await.unwrap();

        drop(peer);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(monitor.phase(), Phase::Disconnected);
        assert!(monitor.needs_intervention());
        assert_eq!(connector.calls(), 1 + 3);

        let _peer = connector.push();
        monitor.resume().await.unwrap();
        assert_eq!(monitor.phase(), Phase::Connected);
        assert!(!monitor.needs_intervention());
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn manual_disconnect_suppresses_reconnect() {
        let connector = ScriptedConnector::default();
        let _peer = connector.push();
        let monitor = HealthMonitor::new(connector.clone(), config(3));
        monitor.connect().await.unwrap();
        monitor.disconnect();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.calls(), 1);
        assert!(!monitor.needs_intervention());
        monitor.resume().await.unwrap();
        assert_eq!(monitor.phase(), Phase::Disconnected);
    }

    #[tokio::test]
    async fn server_events_are_republished() {
        let connector = ScriptedConnector::default();
        let peer = connector.push();
        let monitor = HealthMonitor::new(connector, config(3));
        let mut events = monitor.subscribe();
        monitor.connect().await.unwrap();

        peer.inbound
            .send(ServerEvent::Pong(Pong {
                sent_at: now_millis(),
                server_time: 0,
            }))
            .await
            .unwrap();
        assert!(matches!(events.recv().await, Ok(ServerEvent::Pong(_))));
        assert!(monitor.latency().is_some());
    }
}
