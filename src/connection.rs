use crate::error::{ConnectionError, SendError};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Deserialize, Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    /// Use `wss` instead of `ws`
    #[serde(default)]
    pub secure: bool,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_map_request_interval_ms")]
    pub map_request_interval_ms: u64,
}

fn default_port() -> u16 {
    8000
}

fn default_path() -> String {
    String::from("/ws")
}

fn default_reconnect_delay_ms() -> u64 {
    2000
}

fn default_map_request_interval_ms() -> u64 {
    500
}

impl ConnectionConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_owned(),
            port,
            path: default_path(),
            secure: false,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            map_request_interval_ms: default_map_request_interval_ms(),
        }
    }

    pub fn endpoint(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        if self.path.starts_with('/') {
            format!("{}://{}:{}{}", scheme, self.host, self.port, self.path)
        } else {
            format!("{}://{}:{}/{}", scheme, self.host, self.port, self.path)
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn map_request_interval(&self) -> Duration {
        Duration::from_millis(self.map_request_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Binary(Bytes),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Bytes),
}

impl OutboundFrame {
    fn into_message(self) -> Message {
        match self {
            OutboundFrame::Text(text) => Message::Text(text),
            OutboundFrame::Binary(data) => Message::Binary(data.to_vec()),
        }
    }
}

/// Raw events from link tasks and the reconnect timer.
///
/// Every event is stamped with the generation of the connection attempt it
/// belongs to so that leftovers from a superseded link are dropped.
#[derive(Debug)]
pub enum LinkEvent {
    Opened {
        generation: u64,
    },
    Inbound {
        generation: u64,
        frame: InboundFrame,
    },
    Closed {
        generation: u64,
        reason: ConnectionError,
    },
    ReconnectDue {
        generation: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionNotification {
    StateChanged {
        state: ConnectionState,
        generation: u64,
    },
    Message(InboundFrame),
}

/// Everything a link task needs to drive one connection attempt.
pub struct Link {
    pub endpoint: String,
    pub generation: u64,
    pub outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    pub events: mpsc::UnboundedSender<LinkEvent>,
    pub cancel: CancellationToken,
}

pub trait Dialer: Send + Sync {
    fn dial(&self, link: Link) -> Option<JoinHandle<()>>;
}

/// Dials the robot over a websocket on a spawned task.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketDialer;

impl Dialer for WebSocketDialer {
    fn dial(&self, link: Link) -> Option<JoinHandle<()>> {
        Some(tokio::spawn(run_websocket_link(link)))
    }
}

async fn run_websocket_link(link: Link) {
    let Link {
        endpoint,
        generation,
        mut outbound,
        events,
        cancel,
    } = link;

    debug!(%endpoint, generation, "dialing");
    let connect_result = tokio::select! {
        _ = cancel.cancelled() => return,
        result = connect_async(endpoint.as_str()) => result,
    };
    let stream = match connect_result {
        Ok((stream, _response)) => stream,
        Err(err) => {
            let reason = ConnectionError::Open {
                endpoint,
                reason: err.to_string(),
            };
            _ = events.send(LinkEvent::Closed { generation, reason });
            return;
        }
    };
    if events.send(LinkEvent::Opened { generation }).is_err() {
        return;
    }

    let (mut sink, mut source) = stream.split();
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // whatever was queued before the close still goes out
                while let Ok(frame) = outbound.try_recv() {
                    if sink.send(frame.into_message()).await.is_err() {
                        return;
                    }
                }
                _ = sink.send(Message::Close(None)).await;
                return;
            }
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(err) = sink.send(frame.into_message()).await {
                        break ConnectionError::Transport(err.to_string());
                    }
                }
                None => {
                    _ = sink.send(Message::Close(None)).await;
                    return;
                }
            },
            message = source.next() => {
                let frame = match message {
                    Some(Ok(Message::Binary(data))) => InboundFrame::Binary(Bytes::from(data)),
                    Some(Ok(Message::Text(text))) => InboundFrame::Text(text),
                    Some(Ok(Message::Close(_))) | None => break ConnectionError::Closed,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => break ConnectionError::Transport(err.to_string()),
                };
                if events.send(LinkEvent::Inbound { generation, frame }).is_err() {
                    return;
                }
            }
        }
    };
    _ = events.send(LinkEvent::Closed { generation, reason });
}

/// Owns the connection state machine and the reconnection policy.
///
/// All mutation happens through `open`, `close` and `handle` which the
/// owning task calls in event order. Link tasks only ever report back
/// through the `LinkEvent` channel.
pub struct ConnectionManager {
    config: ConnectionConfig,
    dialer: Arc<dyn Dialer>,
    events: mpsc::UnboundedSender<LinkEvent>,
    state: ConnectionState,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<OutboundFrame>>,
    link_cancel: Option<CancellationToken>,
    link_task: Option<JoinHandle<()>>,
    reconnect_pending: Option<u64>,
    auto_reconnect: bool,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        dialer: Arc<dyn Dialer>,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            config,
            dialer,
            events,
            state: ConnectionState::Disconnected,
            generation: 0,
            outbound: None,
            link_cancel: None,
            link_task: None,
            reconnect_pending: None,
            auto_reconnect: false,
        };
        (manager, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending.is_some()
    }

    pub fn open(&mut self) -> Option<ConnectionNotification> {
        self.auto_reconnect = true;
        self.reconnect_pending = None;
        if self.state != ConnectionState::Disconnected {
            return None;
        }
        self.generation += 1;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let endpoint = self.config.endpoint();
        info!(%endpoint, generation = self.generation, "opening connection");
        self.link_task = self.dialer.dial(Link {
            endpoint,
            generation: self.generation,
            outbound: outbound_rx,
            events: self.events.clone(),
            cancel: cancel.clone(),
        });
        self.outbound = Some(outbound_tx);
        self.link_cancel = Some(cancel);
        self.transition(ConnectionState::Connecting)
    }

    /// Tears the link down and stays down until the next `open`.
    pub fn close(&mut self) -> Option<ConnectionNotification> {
        self.auto_reconnect = false;
        self.reconnect_pending = None;
        self.teardown();
        if self.state == ConnectionState::Disconnected {
            return None;
        }
        info!(generation = self.generation, "closing connection");
        self.transition(ConnectionState::Disconnected)
    }

    /// Closes and gives the link task a moment to flush queued frames.
    pub async fn shutdown(&mut self, grace: Duration) -> Option<ConnectionNotification> {
        let link_task = self.link_task.take();
        let notification = self.close();
        if let Some(link_task) = link_task {
            if tokio::time::timeout(grace, link_task).await.is_err() {
                warn!("link task did not finish in time");
            }
        }
        notification
    }

    pub fn send(&self, frame: OutboundFrame) -> Result<(), SendError> {
        if self.state != ConnectionState::Connected {
            return Err(SendError::NotConnected);
        }
        let outbound = self.outbound.as_ref().ok_or(SendError::LinkGone)?;
        outbound.send(frame).map_err(|_| SendError::LinkGone)
    }

    pub fn handle(&mut self, event: LinkEvent) -> Option<ConnectionNotification> {
        match event {
            LinkEvent::Opened { generation } => {
                if generation != self.generation || self.state != ConnectionState::Connecting {
                    debug!(generation, "ignoring stale open");
                    return None;
                }
                info!(generation, "connected");
                self.transition(ConnectionState::Connected)
            }
            LinkEvent::Inbound { generation, frame } => {
                if generation != self.generation || self.state != ConnectionState::Connected {
                    trace!(generation, "dropping stale inbound frame");
                    return None;
                }
                Some(ConnectionNotification::Message(frame))
            }
            LinkEvent::Closed { generation, reason } => {
                if generation != self.generation || self.state == ConnectionState::Disconnected {
                    debug!(generation, "ignoring stale close");
                    return None;
                }
                warn!(generation, %reason, "connection lost");
                self.teardown();
                let notification = self.transition(ConnectionState::Disconnected);
                self.schedule_reconnect();
                notification
            }
            LinkEvent::ReconnectDue { generation } => {
                if self.reconnect_pending != Some(generation)
                    || !self.auto_reconnect
                    || self.state != ConnectionState::Disconnected
                {
                    return None;
                }
                self.reconnect_pending = None;
                self.open()
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if !self.auto_reconnect || self.reconnect_pending.is_some() {
            return;
        }
        let generation = self.generation;
        let delay = self.config.reconnect_delay();
        self.reconnect_pending = Some(generation);
        debug!(?delay, generation, "reconnect scheduled");
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            _ = events.send(LinkEvent::ReconnectDue { generation });
        });
    }

    fn teardown(&mut self) {
        if let Some(cancel) = self.link_cancel.take() {
            cancel.cancel();
        }
        self.outbound = None;
    }

    fn transition(&mut self, state: ConnectionState) -> Option<ConnectionNotification> {
        if self.state == state {
            return None;
        }
        self.state = state;
        Some(ConnectionNotification::StateChanged {
            state,
            generation: self.generation,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::{timeout, Instant};

    #[derive(Default, Clone)]
    pub(crate) struct RecordingDialer {
        pub(crate) links: Arc<Mutex<Vec<Link>>>,
    }

    impl RecordingDialer {
        pub(crate) fn dial_count(&self) -> usize {
            self.links.lock().unwrap().len()
        }

        pub(crate) fn take_outbound(&self, index: usize) -> Vec<OutboundFrame> {
            let mut links = self.links.lock().unwrap();
            let mut frames = vec![];
            while let Ok(frame) = links[index].outbound.try_recv() {
                frames.push(frame);
            }
            frames
        }
    }

    impl Dialer for RecordingDialer {
        fn dial(&self, link: Link) -> Option<JoinHandle<()>> {
            self.links.lock().unwrap().push(link);
            None
        }
    }

    fn manager() -> (
        ConnectionManager,
        mpsc::UnboundedReceiver<LinkEvent>,
        RecordingDialer,
    ) {
        let dialer = RecordingDialer::default();
        let (manager, rx) =
            ConnectionManager::new(ConnectionConfig::new("robot", 8000), Arc::new(dialer.clone()));
        (manager, rx, dialer)
    }

    fn state_change(state: ConnectionState, generation: u64) -> Option<ConnectionNotification> {
        Some(ConnectionNotification::StateChanged { state, generation })
    }

    #[test]
    fn endpoint_scheme_follows_security() {
        let mut config = ConnectionConfig::new("robot.local", 8000);
        assert_eq!(config.endpoint(), "ws://robot.local:8000/ws");
        config.secure = true;
        config.path = String::from("control");
        assert_eq!(config.endpoint(), "wss://robot.local:8000/control");
    }

    #[tokio::test]
    async fn open_then_connected() {
        let (mut manager, _rx, dialer) = manager();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            manager.open(),
            state_change(ConnectionState::Connecting, 1)
        );
        assert_eq!(dialer.dial_count(), 1);
        assert_eq!(manager.send(OutboundFrame::Text("x".into())), Err(SendError::NotConnected));

        assert_eq!(
            manager.handle(LinkEvent::Opened { generation: 1 }),
            state_change(ConnectionState::Connected, 1)
        );
        manager.send(OutboundFrame::Text("hello".into())).unwrap();
        assert_eq!(
            dialer.take_outbound(0),
            vec![OutboundFrame::Text("hello".into())]
        );
    }

    #[tokio::test]
    async fn open_twice_dials_once() {
        let (mut manager, _rx, dialer) = manager();
        manager.open();
        assert_eq!(manager.open(), None);
        assert_eq!(dialer.dial_count(), 1);
    }

    #[tokio::test]
    async fn inbound_frames_pass_through_in_order() {
        let (mut manager, _rx, _dialer) = manager();
        manager.open();
        manager.handle(LinkEvent::Opened { generation: 1 });
        for value in 0..3_u8 {
            let frame = InboundFrame::Binary(Bytes::from(vec![value]));
            assert_eq!(
                manager.handle(LinkEvent::Inbound {
                    generation: 1,
                    frame: frame.clone()
                }),
                Some(ConnectionNotification::Message(frame))
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn close_schedules_one_reconnect_after_delay() {
        let (mut manager, mut rx, dialer) = manager();
        manager.open();
        manager.handle(LinkEvent::Opened { generation: 1 });

        let closed_at = Instant::now();
        assert_eq!(
            manager.handle(LinkEvent::Closed {
                generation: 1,
                reason: ConnectionError::Closed
            }),
            state_change(ConnectionState::Disconnected, 1)
        );
        assert!(manager.reconnect_pending());
        assert_eq!(
            manager.handle(LinkEvent::Closed {
                generation: 1,
                reason: ConnectionError::Closed
            }),
            None
        );

        let event = rx.recv().await.unwrap();
        assert!(closed_at.elapsed() >= Duration::from_millis(2000));
        assert!(matches!(event, LinkEvent::ReconnectDue { generation: 1 }));
        assert!(timeout(Duration::from_secs(10), rx.recv()).await.is_err());

        assert_eq!(
            manager.handle(event),
            state_change(ConnectionState::Connecting, 2)
        );
        assert_eq!(dialer.dial_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_retries_indefinitely() {
        let (mut manager, mut rx, dialer) = manager();
        manager.open();
        for attempt in 1..=5 {
            manager.handle(LinkEvent::Closed {
                generation: attempt,
                reason: ConnectionError::Open {
                    endpoint: String::from("ws://robot:8000/ws"),
                    reason: String::from("refused"),
                },
            });
            let due = rx.recv().await.unwrap();
            assert_eq!(
                manager.handle(due),
                state_change(ConnectionState::Connecting, attempt + 1)
            );
        }
        assert_eq!(dialer.dial_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_is_ignored() {
        let (mut manager, mut rx, _dialer) = manager();
        manager.open();
        manager.handle(LinkEvent::Opened { generation: 1 });
        manager.handle(LinkEvent::Closed {
            generation: 1,
            reason: ConnectionError::Closed,
        });
        let due = rx.recv().await.unwrap();
        manager.handle(due);
        assert_eq!(manager.generation(), 2);

        assert_eq!(manager.handle(LinkEvent::Opened { generation: 1 }), None);
        assert_eq!(manager.state(), ConnectionState::Connecting);
        manager.handle(LinkEvent::Opened { generation: 2 });
        assert_eq!(
            manager.handle(LinkEvent::Inbound {
                generation: 1,
                frame: InboundFrame::Text(String::from("old"))
            }),
            None
        );
        assert_eq!(
            manager.handle(LinkEvent::Closed {
                generation: 1,
                reason: ConnectionError::Closed
            }),
            None
        );
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_close_does_not_reconnect() {
        let (mut manager, mut rx, dialer) = manager();
        manager.open();
        manager.handle(LinkEvent::Opened { generation: 1 });
        assert_eq!(
            manager.close(),
            state_change(ConnectionState::Disconnected, 1)
        );
        assert!(dialer.links.lock().unwrap()[0].cancel.is_cancelled());
        assert_eq!(manager.send(OutboundFrame::Text("x".into())), Err(SendError::NotConnected));
        assert!(timeout(Duration::from_secs(10), rx.recv()).await.is_err());
        assert_eq!(dialer.dial_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_reconnect() {
        let (mut manager, mut rx, dialer) = manager();
        manager.open();
        manager.handle(LinkEvent::Closed {
            generation: 1,
            reason: ConnectionError::Closed,
        });
        manager.close();
        let due = rx.recv().await.unwrap();
        assert_eq!(manager.handle(due), None);
        assert_eq!(dialer.dial_count(), 1);
    }
}
