//! Per-device connection loop.
//!
//! Each configured device gets one loop, which:
//! - Clears the device's flags and reports them before every dial
//! - Dials with a bounded timeout, sleeping a fixed delay after failures
//! - Sends the subscribe command once per connection
//! - Decodes every inbound line and reports each recognised notification
//!
//! A clean close and a read error are treated the same: the loop goes
//! straight back to the dial step. A socket that stays open but never sends
//! anything keeps its loop parked on the read without affecting others.
//!
//! A line longer than [`MAX_LINE_LEN`] ends the session as a failure.
//!
//! Default timings:
//! - Connect timeout: 5s
//! - Retry delay after a failed dial: 10s

use std::borrow::Cow;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use vtally_proto::{decode_line, encode_subscribe};

use crate::aggregator::FleetAggregator;
use crate::instance::{Endpoint, InstanceState};
use crate::supervisor::shutdown_requested;

/// Default dial timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default pause after a failed dial.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Longest accepted inbound line, terminator included.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Dial timing for a connection loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub retry_delay: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Why a connected session ended.
#[derive(Debug)]
enum SessionEnd {
    Closed,
    Failed(io::Error),
    Shutdown,
}

/// Owns one device's socket lifecycle and its [`InstanceState`].
pub struct ConnectionLoop {
    endpoint: Endpoint,
    aggregator: Arc<FleetAggregator>,
    settings: ConnectionSettings,
    state: InstanceState,
}

impl ConnectionLoop {
    pub fn new(
        endpoint: Endpoint,
        aggregator: Arc<FleetAggregator>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            endpoint,
            aggregator,
            settings,
            state: InstanceState::default(),
        }
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            endpoint = %self.endpoint,
            connect_timeout_ms = self.settings.connect_timeout.as_millis() as u64,
            retry_delay_ms = self.settings.retry_delay.as_millis() as u64,
            "Starting connection loop"
        );

        loop {
            self.state.reset();
            self.aggregator
                .on_instance_changed(&self.endpoint, self.state)
                .await;

            let connected = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                result = self.connect() => result,
            };

            let stream = match connected {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(
                        endpoint = %self.endpoint,
                        error = %e,
                        retry_in_ms = self.settings.retry_delay.as_millis() as u64,
                        "Failed to connect to instance"
                    );
                    tokio::select! {
                        _ = shutdown_requested(&mut shutdown) => break,
                        _ = tokio::time::sleep(self.settings.retry_delay) => continue,
                    }
                }
            };

            info!(endpoint = %self.endpoint, "Connected to instance");

            match self.session(stream, &mut shutdown).await {
                SessionEnd::Closed => {
                    info!(endpoint = %self.endpoint, "Instance disconnected");
                }
                SessionEnd::Failed(e) => {
                    warn!(
                        endpoint = %self.endpoint,
                        error = %e,
                        "Instance connection failed"
                    );
                }
                SessionEnd::Shutdown => break,
            }
        }

        info!(endpoint = %self.endpoint, "Connection loop stopped");
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        let addr = (self.endpoint.host(), self.endpoint.port());
        match timeout(self.settings.connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }

    /// Subscribe, then feed every inbound line through the codec.
    async fn session(
        &mut self,
        mut stream: TcpStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        if let Err(e) = stream.write_all(&encode_subscribe()).await {
            return SessionEnd::Failed(e);
        }
        debug!(endpoint = %self.endpoint, "Subscribed to activators");

        let mut reader = BufReader::new(stream);
        let mut buf = Vec::with_capacity(256);

        loop {
            buf.clear();
            let mut limited = (&mut reader).take(MAX_LINE_LEN as u64);
            let read = tokio::select! {
                _ = shutdown_requested(shutdown) => return SessionEnd::Shutdown,
                read = limited.read_until(b'\n', &mut buf) => read,
            };

            match read {
                Ok(0) => return SessionEnd::Closed,
                Ok(n) if n == MAX_LINE_LEN && buf.last() != Some(&b'\n') => {
                    return SessionEnd::Failed(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("line exceeds {MAX_LINE_LEN} bytes"),
                    ));
                }
                Ok(_) => {
                    let line = line_text(&buf);
                    self.handle_line(&line).await;
                }
                Err(e) => return SessionEnd::Failed(e),
            }
        }
    }

    async fn handle_line(&mut self, line: &str) {
        let Some(update) = decode_line(line) else {
            return;
        };

        if self.state.apply(update) {
            info!(
                endpoint = %self.endpoint,
                activator = %update.activator,
                value = update.active,
                instance_active = self.state.is_active(),
                "Instance activity changed"
            );
        } else {
            debug!(
                endpoint = %self.endpoint,
                activator = %update.activator,
                value = update.active,
                "Activator update"
            );
        }

        self.aggregator
            .on_instance_changed(&self.endpoint, self.state)
            .await;
    }
}

/// Raw line bytes as text, without the line terminator.
fn line_text(raw: &[u8]) -> Cow<'_, str> {
    match String::from_utf8_lossy(raw) {
        Cow::Borrowed(text) => Cow::Borrowed(text.trim_end_matches(['\r', '\n'])),
        Cow::Owned(text) => Cow::Owned(text.trim_end_matches(['\r', '\n']).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Activity;
    use crate::bus::{MemoryPublisher, PublishTarget};
    use tokio::net::{TcpListener, TcpSocket};

    fn loop_for(endpoint: Endpoint) -> (Arc<MemoryPublisher>, Arc<FleetAggregator>, ConnectionLoop) {
        loop_with(endpoint, ConnectionSettings::default())
    }

    fn loop_with(
        endpoint: Endpoint,
        settings: ConnectionSettings,
    ) -> (Arc<MemoryPublisher>, Arc<FleetAggregator>, ConnectionLoop) {
        let publisher = Arc::new(MemoryPublisher::new());
        let aggregator = Arc::new(FleetAggregator::new(
            publisher.clone(),
            PublishTarget::new("tally"),
        ));
        let connection = ConnectionLoop::new(endpoint, Arc::clone(&aggregator), settings);
        (publisher, aggregator, connection)
    }

    #[test]
    fn test_line_text_strips_terminators() {
        assert_eq!(line_text(b"ACTS OK Recording 1\r\n"), "ACTS OK Recording 1");
        assert_eq!(line_text(b"ACTS OK Recording 1\n"), "ACTS OK Recording 1");
        assert_eq!(line_text(b"partial"), "partial");
        assert_eq!(line_text(b"\xffACTS OK External 1\r\n"), "\u{fffd}ACTS OK External 1");
    }

    #[test]
    fn test_default_settings() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.connect_timeout, Duration::from_secs(5));
        assert_eq!(settings.retry_delay, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_handle_line_reports_every_decoded_line() {
        let endpoint = Endpoint::new("vmix", 8099);
        let (publisher, aggregator, mut connection) = loop_for(endpoint);

        connection.handle_line("VERSION OK 27.0.0.49").await;
        assert!(publisher.is_empty());
        assert_eq!(aggregator.instance_count().await, 0);

        connection.handle_line("ACTS OK Recording 1").await;
        assert_eq!(publisher.payloads(), vec!["ON"]);

        connection.handle_line("ACTS OK Recording 1").await;
        connection.handle_line("ACTS OK Streaming 0").await;
        assert_eq!(publisher.len(), 1);

        connection.handle_line("ACTS OK Recording 0").await;
        assert_eq!(publisher.payloads(), vec!["ON", "OFF"]);
        assert_eq!(aggregator.current().await, Activity::Off);
    }

    #[tokio::test]
    async fn test_connect_refused_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (_publisher, _aggregator, connection) = loop_for(Endpoint::new("127.0.0.1", port));
        assert!(connection.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_times_out_when_backlog_is_full() {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();

        // Never accepted: once the queue is full further SYNs are dropped.
        let mut held = Vec::new();
        for _ in 0..8 {
            if let Ok(Ok(stream)) = timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
                held.push(stream);
            }
        }

        let settings = ConnectionSettings {
            connect_timeout: Duration::from_millis(200),
            retry_delay: Duration::from_millis(50),
        };
        let (_publisher, _aggregator, connection) =
            loop_with(Endpoint::new("127.0.0.1", addr.port()), settings);

        let started = tokio::time::Instant::now();
        let err = connection.connect().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() >= settings.connect_timeout);
        drop(listener);
    }

    #[tokio::test]
    async fn test_connect_succeeds_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (_publisher, _aggregator, connection) = loop_for(Endpoint::new("127.0.0.1", port));
        let stream = connection.connect().await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }
}
