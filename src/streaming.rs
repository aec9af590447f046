use crate::config::ReconnectConfig;
use crate::exits::ExitEventAggregator;
use crate::frame_queue::FrameQueue;
use crate::prediction::process_response;
use crate::state::VideoState;
use crate::telemetry::Metrics;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, watch},
    time::sleep,
};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Error, Debug)]
pub enum StreamingError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Transport lifecycle. Owned and mutated exclusively by the channel task;
/// everyone else observes it through a watch receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCommand {
    /// Cancels any pending scheduled retry and reconnects immediately.
    ReconnectNow,
    /// Closes the connection and suppresses automatic reconnects until
    /// the next ReconnectNow.
    Disconnect,
}

/// Exponential reconnect backoff: delay = base * growth^min(attempts, cap),
/// clamped to the maximum. Reset on a successful connect.
pub(crate) struct Backoff {
    config: ReconnectConfig,
    attempts: u32,
}

impl Backoff {
    pub(crate) fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let exponent = self.attempts.min(self.config.attempt_cap);
        let millis =
            self.config.base_delay_ms as f64 * self.config.growth_factor.powi(exponent as i32);
        let millis = (millis as u64).min(self.config.max_delay_ms);
        self.attempts = self.attempts.saturating_add(1);
        Duration::from_millis(millis)
    }

    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Decodes an inbound message to the JSON payload. Text frames parse
/// directly; binary frames are decoded as UTF-8 first. Control frames are
/// not responses and yield None without being an error.
fn decode_message(message: &Message) -> Result<Option<serde_json::Value>, String> {
    let text: &str = match message {
        Message::Text(text) => text.as_str(),
        Message::Binary(data) => {
            return match std::str::from_utf8(data.as_ref()) {
                Ok(text) => serde_json::from_str(text)
                    .map(Some)
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
        }
        _ => return Ok(None),
    };
    serde_json::from_str(text).map(Some).map_err(|e| e.to_string())
}

enum SessionEnd {
    /// Connection closed or errored; reconnect with backoff.
    Lost,
    /// Manual disconnect; stay down until ReconnectNow.
    ManualDisconnect,
    /// Manual reconnect requested from inside a live session.
    ManualReconnect,
    Shutdown,
}

/// Observer side of the channel, handed to the HTTP surface.
#[derive(Clone)]
pub struct ChannelHandle {
    pub command_tx: mpsc::Sender<ChannelCommand>,
    pub state_rx: watch::Receiver<ConnectionState>,
    pub last_rtt_ms_rx: watch::Receiver<Option<u64>>,
}

/// Owns the one connection to the inference service. Pulls frames from the
/// queue under a single-in-flight discipline, measures round-trip latency
/// and pushes parsed responses onward.
pub struct StreamingChannel {
    url: String,
    queue: Arc<FrameQueue>,
    video_state: Arc<VideoState>,
    exits: Arc<ExitEventAggregator>,
    metrics: Arc<Metrics>,
    reconnect: ReconnectConfig,
    command_rx: mpsc::Receiver<ChannelCommand>,
    state_tx: watch::Sender<ConnectionState>,
    last_rtt_ms_tx: watch::Sender<Option<u64>>,
}

impl StreamingChannel {
    pub fn new(
        url: String,
        reconnect: ReconnectConfig,
        queue: Arc<FrameQueue>,
        video_state: Arc<VideoState>,
        exits: Arc<ExitEventAggregator>,
        metrics: Arc<Metrics>,
    ) -> (Self, ChannelHandle) {
        let (command_tx, command_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (last_rtt_ms_tx, last_rtt_ms_rx) = watch::channel(None);

        let handle = ChannelHandle {
            command_tx,
            state_rx,
            last_rtt_ms_rx,
        };
        let channel = Self {
            url,
            queue,
            video_state,
            exits,
            metrics,
            reconnect,
            command_rx,
            state_tx,
            last_rtt_ms_tx,
        };
        (channel, handle)
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut backoff = Backoff::new(self.reconnect.clone());

        loop {
            self.set_state(ConnectionState::Connecting);
            tracing::info!(url = %self.url, "connecting to inference service");

            let end = tokio::select! {
                connected = connect_async(self.url.as_str()) => match connected {
                    Ok((ws, _)) => {
                        backoff.reset();
                        self.metrics.record_reconnect();
                        self.set_state(ConnectionState::Connected);
                        tracing::info!("inference channel connected");
                        self.run_session(ws, &mut shutdown_rx).await
                    }
                    Err(e) => {
                        tracing::warn!("connect failed: {}", e);
                        SessionEnd::Lost
                    }
                },
                _ = shutdown_rx.recv() => SessionEnd::Shutdown,
            };

            self.set_state(ConnectionState::Disconnected);
            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::ManualReconnect => {
                    backoff.reset();
                    continue;
                }
                SessionEnd::ManualDisconnect => {
                    match self.wait_for_reconnect_command(&mut shutdown_rx).await {
                        SessionEnd::Shutdown => break,
                        _ => {
                            backoff.reset();
                            continue;
                        }
                    }
                }
                SessionEnd::Lost => {
                    let delay = backoff.next_delay();
                    tracing::info!(delay_ms = delay.as_millis() as u64, "scheduling reconnect");
                    match self.wait_backoff(delay, &mut shutdown_rx).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::ManualDisconnect => {
                            match self.wait_for_reconnect_command(&mut shutdown_rx).await {
                                SessionEnd::Shutdown => break,
                                _ => backoff.reset(),
                            }
                        }
                        SessionEnd::ManualReconnect => backoff.reset(),
                        SessionEnd::Lost => {}
                    }
                }
            }
        }
        tracing::info!("streaming channel stopped");
    }

    async fn run_session(
        &mut self,
        ws: WsStream,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        let mut in_flight: Option<Instant> = None;

        // A send is attempted immediately on entering Connected.
        if self.try_send(&mut sink, &mut in_flight).await.is_err() {
            return SessionEnd::Lost;
        }

        loop {
            tokio::select! {
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::warn!("inference channel closed");
                            return SessionEnd::Lost;
                        }
                        Some(Ok(message)) => {
                            if !self.handle_message(&message, &mut in_flight) {
                                continue;
                            }
                            // The next send is attempted right after every
                            // response, valid or malformed, so throughput
                            // follows the server's actual processing rate.
                            if self.try_send(&mut sink, &mut in_flight).await.is_err() {
                                return SessionEnd::Lost;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!("inference channel error: {}", e);
                            return SessionEnd::Lost;
                        }
                    }
                }
                _ = self.queue.frame_available(), if in_flight.is_none() => {
                    if self.try_send(&mut sink, &mut in_flight).await.is_err() {
                        return SessionEnd::Lost;
                    }
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(ChannelCommand::Disconnect) => {
                            let _ = sink.send(Message::Close(None)).await;
                            return SessionEnd::ManualDisconnect;
                        }
                        Some(ChannelCommand::ReconnectNow) => {
                            let _ = sink.send(Message::Close(None)).await;
                            return SessionEnd::ManualReconnect;
                        }
                        None => return SessionEnd::Shutdown,
                    }
                }
                _ = shutdown_rx.recv() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    /// Sends the oldest queued frame when nothing is outstanding. The raw
    /// JPEG bytes go out as one binary message, no envelope.
    async fn try_send(
        &self,
        sink: &mut futures::stream::SplitSink<WsStream, Message>,
        in_flight: &mut Option<Instant>,
    ) -> Result<(), StreamingError> {
        if in_flight.is_some() {
            return Ok(());
        }
        let Some(frame) = self.queue.pop() else {
            return Ok(());
        };
        self.metrics.record_queue_depth(self.queue.len() as u64);

        match sink.send(Message::Binary(frame.payload.clone())).await {
            Ok(()) => {
                *in_flight = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                // Connection-level failure clears the pending mark so the
                // channel cannot stall. The unsent frame goes back to the
                // head of the queue for the next connection attempt,
                // subject to drop-oldest if capture filled it meanwhile.
                tracing::warn!("frame send failed: {}", e);
                *in_flight = None;
                self.queue.restore_front(frame);
                Err(StreamingError::WebSocket(e))
            }
        }
    }

    /// Returns true when the message counted as a response (and a next
    /// send should be attempted). Control frames return false.
    fn handle_message(&self, message: &Message, in_flight: &mut Option<Instant>) -> bool {
        let decoded = match decode_message(message) {
            Ok(Some(payload)) => Some(payload),
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!("undecodable response treated as empty: {}", e);
                None
            }
        };

        if let Some(sent_at) = in_flight.take() {
            let rtt_ms = sent_at.elapsed().as_millis() as u64;
            self.metrics.record_round_trip(rtt_ms);
            let _ = self.last_rtt_ms_tx.send(Some(rtt_ms));
        }

        if let Some(payload) = decoded {
            let response = process_response(&payload);
            if !response.exit_ids.is_empty() {
                self.exits.record_push(&response.exit_ids);
            }
            self.video_state.set_predictions(response.predictions);
        }
        true
    }

    async fn wait_backoff(
        &mut self,
        delay: Duration,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        tokio::select! {
            _ = sleep(delay) => SessionEnd::Lost,
            command = self.command_rx.recv() => match command {
                Some(ChannelCommand::ReconnectNow) => SessionEnd::ManualReconnect,
                Some(ChannelCommand::Disconnect) => SessionEnd::ManualDisconnect,
                None => SessionEnd::Shutdown,
            },
            _ = shutdown_rx.recv() => SessionEnd::Shutdown,
        }
    }

    async fn wait_for_reconnect_command(
        &mut self,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(ChannelCommand::ReconnectNow) => return SessionEnd::ManualReconnect,
                    Some(ChannelCommand::Disconnect) => continue,
                    None => return SessionEnd::Shutdown,
                },
                _ = shutdown_rx.recv() => return SessionEnd::Shutdown,
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
        self.metrics.record_connection_state(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconnect_config() -> ReconnectConfig {
        ReconnectConfig {
            base_delay_ms: 500,
            growth_factor: 2.0,
            max_delay_ms: 30_000,
            attempt_cap: 6,
        }
    }

    #[test]
    fn test_backoff_monotone_and_clamped() {
        let mut backoff = Backoff::new(reconnect_config());
        let mut previous = Duration::ZERO;
        for _ in 0..12 {
            let delay = backoff.next_delay();
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(30_000));
            previous = delay;
        }
        // With cap 6 and growth 2, the plateau is 500 * 2^6 = 32s, clamped.
        assert_eq!(previous, Duration::from_millis(30_000));
    }

    #[test]
    fn test_backoff_first_delay_is_base() {
        let mut backoff = Backoff::new(reconnect_config());
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_resets_to_base() {
        let mut backoff = Backoff::new(reconnect_config());
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_decode_text_message() {
        let message = Message::Text(r#"{"exit_ids": [], "predictions": {}}"#.into());
        let payload = decode_message(&message).unwrap().unwrap();
        assert!(payload.get("predictions").is_some());
    }

    #[test]
    fn test_decode_binary_framed_json() {
        let message = Message::Binary(br#"{"exit_ids": ["Alice"]}"#.to_vec().into());
        let payload = decode_message(&message).unwrap().unwrap();
        assert_eq!(payload["exit_ids"][0], "Alice");
    }

    #[test]
    fn test_decode_garbage_is_an_error_not_a_panic() {
        let message = Message::Text("not json".into());
        assert!(decode_message(&message).is_err());
        let message = Message::Binary(vec![0xff, 0xfe].into());
        assert!(decode_message(&message).is_err());
    }

    #[test]
    fn test_control_frames_are_not_responses() {
        let message = Message::Ping(vec![].into());
        assert!(decode_message(&message).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_at_most_one_send_outstanding() {
        use crate::config::ExitHistoryConfig;
        use crate::exits::ExitEventAggregator;
        use crate::frame_queue::{FrameQueue, QueuedFrame};
        use crate::state::VideoState;
        use crate::telemetry::Metrics;
        use tokio_tungstenite::accept_async;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Two frames queued up front: only the first may go out until the
        // service has answered it.
        let queue = FrameQueue::new(4);
        queue.push(QueuedFrame::new(bytes::Bytes::from_static(&[1])));
        queue.push(QueuedFrame::new(bytes::Bytes::from_static(&[2])));

        let (channel, handle) = StreamingChannel::new(
            format!("ws://{}", addr),
            reconnect_config(),
            queue.clone(),
            Arc::new(VideoState::default()),
            ExitEventAggregator::new(ExitHistoryConfig::default()),
            Arc::new(Metrics::new()),
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        let client = tokio::spawn(channel.run(shutdown_tx.subscribe()));

        let (socket, _) = listener.accept().await.unwrap();
        let mut server = accept_async(socket).await.unwrap();

        let first = server.next().await.unwrap().unwrap();
        assert_eq!(first.into_data().as_ref(), [1u8].as_slice());

        // The second frame must not arrive while a response is pending,
        // for any interleaving of queue pushes.
        queue.push(QueuedFrame::new(bytes::Bytes::from_static(&[3])));
        let quiet = tokio::time::timeout(Duration::from_millis(200), server.next()).await;
        assert!(quiet.is_err(), "a second send went out while one was outstanding");

        server
            .send(Message::Text(r#"{"exit_ids": [], "predictions": {}}"#.into()))
            .await
            .unwrap();

        let second = tokio::time::timeout(Duration::from_secs(2), server.next())
            .await
            .expect("no send followed the response")
            .unwrap()
            .unwrap();
        assert_eq!(second.into_data().as_ref(), [2u8].as_slice());

        let _ = shutdown_tx.send(());
        let _ = client.await;
        drop(handle);
    }
}
