//! WebSocket rendezvous server
//!
//! Each accepted connection gets its own task that parses control messages
//! and forwards them to a single coordinator task. The coordinator owns the
//! [`Registry`] and is the only writer of room state; outbound messages are
//! handed back to connection tasks through per-connection channels.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use duet_core::{SignalConfig, MAX_CONTROL_MESSAGE_SIZE};

use crate::messages::{ControlMessage, ErrorCode};
use crate::registry::{Outbound, Registry};
use crate::ConnId;

/// Delivery to a connection task
#[derive(Debug)]
enum Outgoing {
    Message(ControlMessage),
    Close,
}

/// Connection task to coordinator
#[derive(Debug)]
enum ServerEvent {
    Message(ConnId, ControlMessage),
    Disconnected(ConnId),
}

/// Signal server state
#[derive(Clone)]
pub struct SignalServer {
    config: SignalConfig,
    /// Outbound channel per live connection
    connections: Arc<DashMap<ConnId, mpsc::UnboundedSender<Outgoing>>>,
    /// Live room count, published by the coordinator
    rooms: Arc<AtomicUsize>,
    next_conn_id: Arc<AtomicU64>,
}

impl SignalServer {
    pub fn new(config: SignalConfig) -> Self {
        Self {
            config,
            connections: Arc::new(DashMap::new()),
            rooms: Arc::new(AtomicUsize::new(0)),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Bind and serve
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signal server listening on {}", addr);
        self.serve_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_coordinator(
            Registry::new(self.config.clone()),
            event_rx,
            self.connections.clone(),
            self.rooms.clone(),
        ));

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            let events = event_tx.clone();
            let connections = self.connections.clone();
            let room_count = self.room_count();

            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, peer_addr, conn_id, events, connections, room_count)
                        .await
                {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }

    /// Get room count (for monitoring)
    pub fn room_count(&self) -> usize {
        self.rooms.load(Ordering::Relaxed)
    }

    /// Get live control connection count (for monitoring)
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for SignalServer {
    fn default() -> Self {
        Self::new(SignalConfig::default())
    }
}

/// Single writer of room state
async fn run_coordinator(
    mut registry: Registry,
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
    connections: Arc<DashMap<ConnId, mpsc::UnboundedSender<Outgoing>>>,
    room_gauge: Arc<AtomicUsize>,
) {
    loop {
        let deadline = registry.next_deadline();

        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => Some(event),
                None => break,
            },
            _ = sleep_until(deadline) => None,
        };

        let now = now();
        let mut out = match event {
            Some(ServerEvent::Message(conn, msg)) => registry.handle(conn, msg, now),
            Some(ServerEvent::Disconnected(conn)) => registry.disconnect(conn),
            None => Vec::new(),
        };
        out.extend(registry.expire(now));

        deliver(&connections, out);
        room_gauge.store(registry.room_count(), Ordering::Relaxed);
    }

    debug!("Coordinator stopped");
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

fn deliver(
    connections: &DashMap<ConnId, mpsc::UnboundedSender<Outgoing>>,
    out: Vec<Outbound>,
) {
    for outbound in out {
        let (conn, outgoing) = match outbound {
            Outbound::Send(conn, msg) => (conn, Outgoing::Message(msg)),
            Outbound::Close(conn) => (conn, Outgoing::Close),
        };
        match connections.get(&conn) {
            Some(tx) => {
                // Receiver gone means the connection is already tearing down
                let _ = tx.send(outgoing);
            }
            None => debug!("Dropping delivery to closed conn {}", conn),
        }
    }
}

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    conn_id: ConnId,
    events: mpsc::UnboundedSender<ServerEvent>,
    connections: Arc<DashMap<ConnId, mpsc::UnboundedSender<Outgoing>>>,
    room_count: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Peek at the first bytes to detect HTTP vs WebSocket
    let mut peek_buf = [0u8; 4];
    stream.peek(&mut peek_buf).await?;

    let ws_stream = if &peek_buf == b"GET " && !is_websocket_upgrade(&stream).await? {
        return handle_http_request(&mut stream, room_count, connections.len()).await;
    } else {
        accept_async(stream).await?
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel();
    connections.insert(conn_id, tx);
    debug!("New connection from {} as conn {}", peer_addr, conn_id);

    loop {
        tokio::select! {
            inbound = ws_receiver.next() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_sender.send(Message::Pong(data)).await;
                        continue;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("WebSocket error on conn {}: {:?}", conn_id, e);
                        break;
                    }
                };

                match parse_control(&text) {
                    Ok(msg) => {
                        if events.send(ServerEvent::Message(conn_id, msg)).is_err() {
                            break;
                        }
                    }
                    Err(code) => {
                        warn!("Rejected control message from conn {}: {}", conn_id, code.as_str());
                        if send_control(&mut ws_sender, &ControlMessage::error(code)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            outgoing = rx.recv() => match outgoing {
                Some(Outgoing::Message(msg)) => {
                    if send_control(&mut ws_sender, &msg).await.is_err() {
                        break;
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    connections.remove(&conn_id);
    let _ = events.send(ServerEvent::Disconnected(conn_id));
    debug!("Connection closed: conn {}", conn_id);
    Ok(())
}

fn parse_control(text: &str) -> Result<ControlMessage, ErrorCode> {
    if text.len() > MAX_CONTROL_MESSAGE_SIZE {
        return Err(ErrorCode::InvalidMessage);
    }
    ControlMessage::from_json(text).map_err(|_| ErrorCode::InvalidMessage)
}

async fn send_control<S>(sink: &mut S, msg: &ControlMessage) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let json = msg.to_json().map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

/// Whether a pending HTTP request asks for a WebSocket upgrade
async fn is_websocket_upgrade(stream: &TcpStream) -> Result<bool, std::io::Error> {
    let mut buf = vec![0u8; 2048];
    let n = stream.peek(&mut buf).await?;
    let head = String::from_utf8_lossy(&buf[..n]).to_ascii_lowercase();
    Ok(head.contains("upgrade: websocket"))
}

/// Handle an HTTP request (for health checks)
async fn handle_http_request(
    stream: &mut TcpStream,
    room_count: usize,
    connection_count: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let (status, body) = match path {
        "/health" | "/stats" => (
            "200 OK",
            format!(
                r#"{{"status":"healthy","rooms":{},"connections":{}}}"#,
                room_count, connection_count
            ),
        ),
        _ => ("404 Not Found", r#"{"error":"not found"}"#.to_string()),
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = SignalServer::default();
        tokio::spawn(async move { server.serve_listener(listener).await });
        addr
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        ws
    }

    async fn send(ws: &mut Client, msg: &ControlMessage) {
        ws.send(Message::Text(msg.to_json().unwrap())).await.unwrap();
    }

    async fn recv(ws: &mut Client) -> ControlMessage {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return ControlMessage::from_json(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[test]
    fn test_server_creation() {
        let server = SignalServer::default();
        assert_eq!(server.room_count(), 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_parse_control_limits() {
        assert_eq!(parse_control("{}"), Err(ErrorCode::InvalidMessage));
        let huge = format!(
            r#"{{"type":"join","name":"{}"}}"#,
            "x".repeat(MAX_CONTROL_MESSAGE_SIZE)
        );
        assert_eq!(parse_control(&huge), Err(ErrorCode::InvalidMessage));
        assert!(parse_control(r#"{"type":"join","name":"x"}"#).is_ok());
    }

    #[tokio::test]
    async fn test_create_join_answer_over_websocket() {
        let addr = start().await;
        let mut creator = connect(addr).await;
        let mut joiner = connect(addr).await;

        send(
            &mut creator,
            &ControlMessage::Create {
                name: "blue".into(),
                sdp: "offer".into(),
            },
        )
        .await;
        assert_eq!(
            recv(&mut creator).await,
            ControlMessage::Created {
                name: "blue".into(),
                multi: false
            }
        );

        send(&mut joiner, &ControlMessage::Join { name: "blue".into() }).await;
        assert_eq!(
            recv(&mut joiner).await,
            ControlMessage::Offer {
                name: "blue".into(),
                sdp: "offer".into(),
                peer_id: None
            }
        );

        send(
            &mut joiner,
            &ControlMessage::Answer {
                name: "blue".into(),
                sdp: "answer".into(),
                peer_id: None,
            },
        )
        .await;
        assert_eq!(recv(&mut joiner).await, ControlMessage::Ack);
        assert_eq!(
            recv(&mut creator).await,
            ControlMessage::Answer {
                name: "blue".into(),
                sdp: "answer".into(),
                peer_id: None
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_message_gets_error_and_connection_survives() {
        let addr = start().await;
        let mut client = connect(addr).await;

        client
            .send(Message::Text(r#"{"type":"warp"}"#.into()))
            .await
            .unwrap();
        assert_eq!(
            recv(&mut client).await,
            ControlMessage::error(ErrorCode::InvalidMessage)
        );

        send(
            &mut client,
            &ControlMessage::Create {
                name: "still-alive".into(),
                sdp: "s".into(),
            },
        )
        .await;
        assert!(matches!(
            recv(&mut client).await,
            ControlMessage::Created { .. }
        ));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let addr = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains(r#""status":"healthy""#));
    }
}
