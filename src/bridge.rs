//! The bridge loop: owns the SUB socket, reassembles and decodes messages,
//! dispatches events to the configured sink, and recycles the socket when
//! the publisher's heartbeats stop arriving.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, warn};
use zeromq::{Socket, SocketRecv, SubSocket, ZmqMessage};

use crate::protocol::{self, Event};
use crate::sink::EventSink;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("zmq transport error: {0}")]
    Transport(#[from] zeromq::ZmqError),
}

/// Loop timing knobs. Production uses the defaults; tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct BridgeTimings {
    /// Bounded wait for socket readability per loop iteration.
    pub poll: Duration,
    /// Silence longer than this recycles the socket.
    pub heartbeat_timeout: Duration,
    /// Pause between closing the stale socket and reopening it.
    pub reconnect_pause: Duration,
}

impl Default for BridgeTimings {
    fn default() -> Self {
        Self {
            poll: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_millis(6000),
            reconnect_pause: Duration::from_millis(500),
        }
    }
}

pub struct Bridge {
    endpoint: String,
    sink: Arc<dyn EventSink>,
    timings: BridgeTimings,
    /// Origin for the monotonic timestamps handed to the sink.
    started: Instant,
    last_heartbeat: Instant,
    reconnects: u64,
}

impl Bridge {
    pub fn new(endpoint: &str, sink: Arc<dyn EventSink>) -> Self {
        let now = Instant::now();
        Self {
            endpoint: endpoint.to_string(),
            sink,
            timings: BridgeTimings::default(),
            started: now,
            last_heartbeat: now,
            reconnects: 0,
        }
    }

    pub fn with_timings(mut self, timings: BridgeTimings) -> Self {
        self.timings = timings;
        self
    }

    /// How many times the socket was recycled after heartbeat silence.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects
    }

    /// Main entry point. Runs receive sessions until shutdown is signalled,
    /// retrying with backoff when a session dies on a transport error.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Duration::from_secs(5);
        let max_backoff = Duration::from_secs(60);

        loop {
            match self.run_session(&mut shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    error!("Bridge session error: {}. Reconnecting in {:?}", e, backoff);
                    tokio::select! {
                        _ = time::sleep(backoff) => {}
                        _ = shutdown.changed() => break,
                    }
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
        }
        info!("Bridge loop stopped");
    }

    /// One socket session: open, poll, dispatch, recycle on silence.
    ///
    /// The socket is owned by this stack frame, so it is torn down on every
    /// exit path, shutdown and transport errors included. Returns `Ok(())`
    /// only when shutdown was requested.
    async fn run_session(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), BridgeError> {
        if *shutdown.borrow() {
            return Ok(());
        }

        let mut socket = self.open_socket().await?;
        self.last_heartbeat = Instant::now();

        loop {
            let polled = tokio::select! {
                _ = shutdown.changed() => {
                    debug!("Shutdown requested, closing subscription socket");
                    return Ok(());
                }
                polled = time::timeout(self.timings.poll, socket.recv()) => polled,
            };

            match polled {
                Ok(Ok(message)) => self.handle_message(message).await,
                Ok(Err(e)) => return Err(e.into()),
                // Poll timeout: nothing arrived, check heartbeat staleness.
                Err(_) => {
                    if self.last_heartbeat.elapsed() > self.timings.heartbeat_timeout {
                        warn!(
                            "No heartbeat for {:?}, recycling subscription socket",
                            self.timings.heartbeat_timeout
                        );
                        drop(socket);
                        time::sleep(self.timings.reconnect_pause).await;
                        socket = self.open_socket().await?;
                        self.last_heartbeat = Instant::now();
                        self.reconnects += 1;
                    }
                }
            }
        }
    }

    async fn open_socket(&self) -> Result<SubSocket, BridgeError> {
        let mut socket = SubSocket::new();
        socket.connect(&self.endpoint).await?;
        // Empty filter: receive everything the publisher sends.
        socket.subscribe("").await?;
        debug!("Subscribed to {}", self.endpoint);
        Ok(socket)
    }

    /// Decode one logical message and perform its effect. Malformed input
    /// and sink failures are logged and dropped; nothing here may take the
    /// loop down.
    async fn handle_message(&mut self, message: ZmqMessage) {
        let frames = message.into_vec();
        let wire = match protocol::read_message(&frames) {
            Ok(wire) => wire,
            Err(e) => {
                debug!("Dropping message: {}", e);
                return;
            }
        };

        let event = match protocol::decode_event(&wire) {
            Ok(event) => event,
            Err(e) => {
                debug!("Dropping message {:#010x}: {}", wire.message_id, e);
                return;
            }
        };

        match event {
            Event::Heartbeat => {
                debug!("Heartbeat");
                self.last_heartbeat = Instant::now();
            }
            Event::Unknown { message_id } => {
                debug!("Unknown message id {:#010x}, dropping", message_id);
            }
            event => {
                let timestamp = self.started.elapsed().as_secs_f64();
                if let Err(e) = self.sink.handle(&event, timestamp).await {
                    warn!("Sink failed, dropping event: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use zeromq::{PubSocket, SocketSend};

    use crate::ha::HaError;
    use crate::protocol::{encode_message, KeyEvent, HEARTBEAT_ID, KEY_EVENT_ID};

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<Event>>,
        /// Number of upcoming `handle` calls that should fail.
        failures: AtomicUsize,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn handle(&self, event: &Event, _timestamp: f64) -> Result<(), HaError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(HaError::Rejected {
                    status: 400,
                    body: "Bad Request".to_string(),
                });
            }
            self.events.lock().unwrap().push(*event);
            Ok(())
        }
    }

    fn key_frame(source_id: i32, key_code: i32, is_release: i32) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&source_id.to_le_bytes());
        payload.extend_from_slice(&key_code.to_le_bytes());
        payload.extend_from_slice(&is_release.to_le_bytes());
        encode_message(KEY_EVENT_ID, &payload)
    }

    fn test_bridge(endpoint: &str) -> (Bridge, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (Bridge::new(endpoint, sink.clone()), sink)
    }

    #[tokio::test]
    async fn heartbeat_updates_timestamp_and_never_reaches_sink() {
        let (mut bridge, sink) = test_bridge("tcp://127.0.0.1:1");
        bridge.last_heartbeat = Instant::now()
            .checked_sub(Duration::from_secs(60))
            .unwrap();

        bridge
            .handle_message(ZmqMessage::from(encode_message(HEARTBEAT_ID, &[])))
            .await;

        assert!(bridge.last_heartbeat.elapsed() < Duration::from_secs(1));
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped_without_effect() {
        let (mut bridge, sink) = test_bridge("tcp://127.0.0.1:1");

        // First frame below header size.
        bridge
            .handle_message(ZmqMessage::from(vec![0x6d, 0x4d]))
            .await;
        // Key event with a truncated payload.
        bridge
            .handle_message(ZmqMessage::from(encode_message(KEY_EVENT_ID, &[1, 2, 3])))
            .await;

        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sink_error_is_swallowed_and_later_events_still_flow() {
        let (mut bridge, sink) = test_bridge("tcp://127.0.0.1:1");
        sink.failures.store(1, Ordering::SeqCst);

        bridge
            .handle_message(ZmqMessage::from(key_frame(9, 0x13, 0)))
            .await;
        bridge
            .handle_message(ZmqMessage::from(key_frame(9, 0x13, 1)))
            .await;

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            Event::Key(KeyEvent {
                source_id: 9,
                key_code: 0x13,
                is_release: true,
            })
        );
    }

    #[tokio::test]
    async fn delivers_published_events_to_the_sink() {
        let mut publisher = PubSocket::new();
        let endpoint = publisher
            .bind("tcp://127.0.0.1:0")
            .await
            .unwrap()
            .to_string();

        let (mut bridge, sink) = test_bridge(&endpoint);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            bridge.run(shutdown_rx).await;
            bridge
        });

        // Resend until the subscription handshake has completed.
        let frame = key_frame(9, 0x13, 1);
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            publisher
                .send(ZmqMessage::from(frame.clone()))
                .await
                .unwrap();
            if !sink.events.lock().unwrap().is_empty() {
                break;
            }
            assert!(Instant::now() < deadline, "no event delivered in time");
            time::sleep(Duration::from_millis(50)).await;
        }

        shutdown_tx.send(true).unwrap();
        let bridge = handle.await.unwrap();
        assert_eq!(bridge.reconnect_count(), 0);
        assert!(matches!(
            sink.events.lock().unwrap()[0],
            Event::Key(KeyEvent {
                source_id: 9,
                key_code: 0x13,
                is_release: true,
            })
        ));
    }

    #[tokio::test]
    async fn heartbeat_silence_recycles_the_socket_once_per_breach() {
        let mut publisher = PubSocket::new();
        let endpoint = publisher
            .bind("tcp://127.0.0.1:0")
            .await
            .unwrap()
            .to_string();

        let sink = Arc::new(RecordingSink::default());
        let mut bridge = Bridge::new(&endpoint, sink.clone()).with_timings(BridgeTimings {
            poll: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(600),
            reconnect_pause: Duration::from_millis(100),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            bridge.run(shutdown_rx).await;
            bridge
        });

        // Stay silent long enough for exactly one staleness breach, then
        // keep the recycled socket fed with heartbeats.
        time::sleep(Duration::from_millis(1000)).await;
        for _ in 0..20 {
            publisher
                .send(ZmqMessage::from(encode_message(HEARTBEAT_ID, &[])))
                .await
                .unwrap();
            time::sleep(Duration::from_millis(50)).await;
        }

        // The recycled socket must still deliver events. Keep heartbeats
        // flowing alongside so no further staleness breach can occur.
        let frame = key_frame(9, 0x13, 0);
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            publisher
                .send(ZmqMessage::from(encode_message(HEARTBEAT_ID, &[])))
                .await
                .unwrap();
            publisher
                .send(ZmqMessage::from(frame.clone()))
                .await
                .unwrap();
            if !sink.events.lock().unwrap().is_empty() {
                break;
            }
            assert!(Instant::now() < deadline, "no event after reconnect");
            time::sleep(Duration::from_millis(50)).await;
        }

        shutdown_tx.send(true).unwrap();
        let bridge = handle.await.unwrap();
        assert_eq!(bridge.reconnect_count(), 1);
        // Heartbeats were consumed by the loop, only the key event came through.
        assert!(matches!(
            sink.events.lock().unwrap()[0],
            Event::Key(KeyEvent { is_release: false, .. })
        ));
    }
}
