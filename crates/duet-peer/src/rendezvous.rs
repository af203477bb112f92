//! Rendezvous client
//!
//! Keeps a WebSocket control connection to the signal server open for as
//! long as the session still needs it. The connection runs in its own task
//! and talks to its owner through a [`SignalLink`]:
//! - [`SignalCommand`]s go out (control messages, handshake done, close)
//! - [`SignalEvent`]s come back (open, message, closed)
//!
//! An unexpected close is followed by a reconnect after
//! [`RendezvousConfig::reconnect_delay`], with no attempt limit, until the
//! owner reports [`SignalCommand::Connected`] or closes the link.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use duet_core::RendezvousConfig;
use duet_signal::ControlMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Rendezvous errors
#[derive(Debug, thiserror::Error)]
pub enum RendezvousError {
    /// Signal server URL did not parse
    #[error("invalid signal server url: {0}")]
    InvalidUrl(String),

    /// Failed to connect to signal server
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connect attempt timed out
    #[error("timeout connecting to signal server")]
    Timeout,

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// Owner to connection task
#[derive(Clone, Debug, PartialEq)]
pub enum SignalCommand {
    /// Send a control message if the connection is open
    Send(ControlMessage),
    /// Handshake complete; do not reconnect after the next drop
    Connected,
    /// Close the connection and stop
    Close,
}

/// Connection task to owner
#[derive(Clone, Debug, PartialEq)]
pub enum SignalEvent {
    /// Control connection (re)opened
    Open,
    /// Control message from the service
    Message(ControlMessage),
    /// Connection dropped or could not be opened
    Closed,
}

/// Both directions of a control connection
pub struct SignalLink {
    pub commands: mpsc::UnboundedSender<SignalCommand>,
    pub events: mpsc::UnboundedReceiver<SignalEvent>,
}

impl SignalLink {
    /// An in-memory link and the far ends of both channels
    pub fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<SignalCommand>,
        mpsc::UnboundedSender<SignalEvent>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                commands: cmd_tx,
                events: event_rx,
            },
            cmd_rx,
            event_tx,
        )
    }
}

/// How a single connection ended
enum Exit {
    /// Owner asked to stop, or went away
    Stopped,
    /// Connection dropped underneath us
    Dropped,
}

/// Rendezvous client for the control connection
pub struct RendezvousClient {
    config: RendezvousConfig,
}

impl RendezvousClient {
    pub fn new(config: RendezvousConfig) -> Self {
        Self { config }
    }

    /// Start the connection task
    pub fn spawn(self) -> (SignalLink, JoinHandle<()>) {
        let (link, commands, events) = SignalLink::pair();
        let handle = tokio::spawn(self.run(commands, events));
        (link, handle)
    }

    async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<SignalCommand>,
        events: mpsc::UnboundedSender<SignalEvent>,
    ) {
        let mut reconnect_count: u32 = 0;
        let mut handed_off = false;

        loop {
            match connect_ws(&self.config).await {
                Ok(ws) => {
                    info!("Connected to signal server {}", self.config.url);
                    reconnect_count = 0;
                    if events.send(SignalEvent::Open).is_err() {
                        return;
                    }
                    match run_connection(ws, &mut commands, &events, &mut handed_off).await {
                        Exit::Stopped => return,
                        Exit::Dropped => {
                            info!("Signal server connection dropped");
                            let _ = events.send(SignalEvent::Closed);
                        }
                    }
                }
                Err(e) => {
                    warn!("Signal server unavailable: {}", e);
                    if events.send(SignalEvent::Closed).is_err() {
                        return;
                    }
                }
            }

            if handed_off {
                debug!("Handshake complete, not reconnecting");
                return;
            }

            let delay = self.config.reconnect_delay(reconnect_count);
            reconnect_count += 1;
            debug!("Reconnecting in {:?} (attempt {})", delay, reconnect_count);

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    cmd = commands.recv() => match cmd {
                        Some(SignalCommand::Send(msg)) => {
                            debug!("Dropping {} while disconnected", msg.kind());
                        }
                        Some(SignalCommand::Connected) => return,
                        Some(SignalCommand::Close) | None => return,
                    },
                }
            }
        }
    }
}

/// Pump one open connection until it drops or the owner stops it
async fn run_connection(
    ws: WsStream,
    commands: &mut mpsc::UnboundedReceiver<SignalCommand>,
    events: &mpsc::UnboundedSender<SignalEvent>,
    handed_off: &mut bool,
) -> Exit {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(SignalCommand::Send(msg)) => {
                    let json = match msg.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Failed to encode {}: {}", msg.kind(), e);
                            continue;
                        }
                    };
                    debug!("-> {}", msg.kind());
                    if let Err(e) = sink.send(Message::Text(json)).await {
                        debug!("Signal send failed: {}", e);
                        return Exit::Dropped;
                    }
                }
                Some(SignalCommand::Connected) => *handed_off = true,
                Some(SignalCommand::Close) | None => {
                    // Best effort, we are leaving either way
                    let _ = sink.send(Message::Close(None)).await;
                    return Exit::Stopped;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match ControlMessage::from_json(&text) {
                    Ok(msg) => {
                        debug!("<- {}", msg.kind());
                        if events.send(SignalEvent::Message(msg)).is_err() {
                            return Exit::Stopped;
                        }
                    }
                    Err(e) => warn!("Ignoring malformed control message: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => return Exit::Dropped,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Signal connection error: {}", e);
                    return Exit::Dropped;
                }
            },
        }
    }
}

/// Connect to the WebSocket signal server
async fn connect_ws(config: &RendezvousConfig) -> Result<WsStream, RendezvousError> {
    let url = Url::parse(&config.url).map_err(|e| RendezvousError::InvalidUrl(e.to_string()))?;
    debug!("Connecting to signal server: {}", url);

    match timeout(config.connect_timeout(), connect_async(url.as_str())).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(WsError::Io(e))) => Err(RendezvousError::ConnectionFailed(e.to_string())),
        Ok(Err(e)) => Err(RendezvousError::WebSocket(e.to_string())),
        Err(_) => Err(RendezvousError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn fast_config(addr: SocketAddr) -> RendezvousConfig {
        RendezvousConfig {
            url: format!("ws://{}", addr),
            reconnect_base_ms: 20,
            reconnect_step_ms: 10,
            reconnect_max_ms: 40,
            ..Default::default()
        }
    }

    async fn next_event(link: &mut SignalLink) -> Option<SignalEvent> {
        timeout(Duration::from_secs(5), link.events.recv())
            .await
            .expect("event in time")
    }

    async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return text,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let config = RendezvousConfig {
            url: "not a url".into(),
            ..Default::default()
        };
        assert!(matches!(
            connect_ws(&config).await,
            Err(RendezvousError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_errors_are_classified() {
        // Nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(matches!(
            connect_ws(&fast_config(addr)).await,
            Err(RendezvousError::ConnectionFailed(_))
        ));

        // Listening, but not a WebSocket endpoint
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            stream
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
        });
        assert!(matches!(
            connect_ws(&fast_config(addr)).await,
            Err(RendezvousError::WebSocket(_))
        ));
    }

    #[tokio::test]
    async fn test_reconnects_after_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // First connection: read one message, then drop it
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let first = next_text(&mut ws).await;
            drop(ws);

            // Second connection: answer with not_found
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let reply = ControlMessage::NotFound { name: "x".into() };
            ws.send(Message::Text(reply.to_json().unwrap())).await.unwrap();
            let _ = ws.next().await;
            first
        });

        let (mut link, _task) = RendezvousClient::new(fast_config(addr)).spawn();
        assert_eq!(next_event(&mut link).await, Some(SignalEvent::Open));

        link.commands
            .send(SignalCommand::Send(ControlMessage::Join { name: "x".into() }))
            .unwrap();
        assert_eq!(next_event(&mut link).await, Some(SignalEvent::Closed));
        assert_eq!(next_event(&mut link).await, Some(SignalEvent::Open));
        assert_eq!(
            next_event(&mut link).await,
            Some(SignalEvent::Message(ControlMessage::NotFound { name: "x".into() }))
        );

        link.commands.send(SignalCommand::Close).unwrap();
        let first = server.await.unwrap();
        assert_eq!(
            ControlMessage::from_json(&first).unwrap(),
            ControlMessage::Join { name: "x".into() }
        );
    }

    #[tokio::test]
    async fn test_no_reconnect_after_handoff() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            // Wait for the client's first frame, then hang up
            let _ = next_text(&mut ws).await;
            drop(ws);
            // A second accept would mean a reconnect
            let second = timeout(Duration::from_millis(500), listener.accept()).await;
            assert!(second.is_err());
        });

        let (mut link, task) = RendezvousClient::new(fast_config(addr)).spawn();
        assert_eq!(next_event(&mut link).await, Some(SignalEvent::Open));

        link.commands.send(SignalCommand::Connected).unwrap();
        link.commands
            .send(SignalCommand::Send(ControlMessage::Join { name: "x".into() }))
            .unwrap();

        assert_eq!(next_event(&mut link).await, Some(SignalEvent::Closed));
        assert_eq!(next_event(&mut link).await, None);
        task.await.unwrap();
    }
}
