//! Wire transport: newline-delimited JSON over TCP, plus an in-process
//! mesh with the same contract for tests.
//!
//! The core only requires a message-passing channel: every inbound frame
//! becomes a [`NodeEvent::Message`] carrying the reply sink of the
//! connection it arrived on. Outbound peer links are persistent and
//! lazily established; a failed push is retried a few times with backoff
//! before the error surfaces to the caller. Malformed frames are dropped
//! silently; a connection that errors is torn down.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{NodeError, Result};
use crate::message::Envelope;

/// Per-push delivery attempts and the pause between them.
const SEND_RETRIES: u32 = 3;
const SEND_BACKOFF: Duration = Duration::from_millis(100);

// ============================================================================
// EVENTS & REPLY SINKS
// ============================================================================

/// One unit of work for the node event loop.
#[derive(Debug)]
pub enum NodeEvent {
    Message {
        envelope: Envelope,
        /// Write half of the connection the envelope arrived on; `None`
        /// when the transport cannot carry replies.
        reply: Option<ReplySink>,
    },
    Terminate,
}

/// Handle to a connection's outgoing frames (or an in-process mailbox).
/// `send` reports failure so dead observers can be reaped lazily.
#[derive(Debug, Clone)]
pub struct ReplySink {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ReplySink {
    pub fn new(tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { tx }
    }

    pub fn send(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).is_ok()
    }
}

// ============================================================================
// OUTBOUND
// ============================================================================

/// How envelopes leave this node.
#[derive(Clone)]
pub enum Outbound {
    Tcp(TcpMesh),
    Local(LocalOutbound),
}

impl Outbound {
    /// Deliver one envelope to a peer URL. An error means the peer is
    /// unreachable right now (after retries); the caller decides whether
    /// to requeue.
    pub async fn send(&self, url: &str, envelope: Envelope) -> Result<()> {
        match self {
            Outbound::Tcp(mesh) => mesh.send(url, envelope).await,
            Outbound::Local(local) => local.send(url, envelope),
        }
    }
}

// ============================================================================
// TCP MESH (outbound peer links)
// ============================================================================

#[derive(Clone)]
pub struct TcpMesh {
    node_tx: mpsc::UnboundedSender<NodeEvent>,
    links: Arc<DashMap<String, mpsc::UnboundedSender<Envelope>>>,
}

impl TcpMesh {
    pub fn new(node_tx: mpsc::UnboundedSender<NodeEvent>) -> Self {
        Self {
            node_tx,
            links: Arc::new(DashMap::new()),
        }
    }

    pub async fn send(&self, url: &str, envelope: Envelope) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_send(url, envelope.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= SEND_RETRIES => return Err(e),
                Err(e) => {
                    debug!(url, attempt, error = %e, "send failed, backing off");
                    tokio::time::sleep(SEND_BACKOFF).await;
                }
            }
        }
    }

    async fn try_send(&self, url: &str, envelope: Envelope) -> Result<()> {
        if let Some(link) = self.links.get(url) {
            if link.send(envelope).is_ok() {
                return Ok(());
            }
            // Link task died; drop it and reconnect below with the next
            // attempt's clone of the envelope.
            drop(link);
            self.links.remove(url);
            return Err(NodeError::Transport(format!("link to {} closed", url)));
        }

        let stream = TcpStream::connect(peer_addr(url)?)
            .await
            .map_err(|e| NodeError::Transport(format!("connect {}: {}", url, e)))?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_link(
            stream,
            rx,
            tx.clone(),
            self.node_tx.clone(),
            url.to_string(),
            self.links.clone(),
        ));
        tx.send(envelope)
            .map_err(|_| NodeError::Transport(format!("link to {} closed", url)))?;
        self.links.insert(url.to_string(), tx);
        Ok(())
    }
}

/// Drive one outbound peer link: drain queued envelopes onto the socket
/// and feed whatever the peer sends back (acks, data pushes) into the
/// node loop.
async fn run_link(
    stream: TcpStream,
    mut outgoing: mpsc::UnboundedReceiver<Envelope>,
    link_tx: mpsc::UnboundedSender<Envelope>,
    node_tx: mpsc::UnboundedSender<NodeEvent>,
    url: String,
    links: Arc<DashMap<String, mpsc::UnboundedSender<Envelope>>>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outgoing.recv().await {
            let mut line = envelope.to_line();
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match Envelope::parse(&line) {
            Ok(envelope) => {
                let event = NodeEvent::Message {
                    envelope,
                    reply: Some(ReplySink::new(link_tx.clone())),
                };
                if node_tx.send(event).is_err() {
                    break;
                }
            }
            Err(_) => debug!(url, "malformed frame from peer dropped"),
        }
    }

    writer.abort();
    links.remove(&url);
    debug!(url, "peer link closed");
}

fn peer_addr(url: &str) -> Result<&str> {
    let addr = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    if addr.is_empty() {
        return Err(NodeError::Transport(format!("unusable peer url \"{}\"", url)));
    }
    Ok(addr)
}

// ============================================================================
// TCP SERVER (inbound connections)
// ============================================================================

pub struct TcpServer {
    accept_task: JoinHandle<()>,
    pub local_addr: std::net::SocketAddr,
}

impl TcpServer {
    pub async fn bind(addr: &str, node_tx: mpsc::UnboundedSender<NodeEvent>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NodeError::Transport(format!("bind {}: {}", addr, e)))?;
        let local_addr = listener.local_addr().map_err(NodeError::transport)?;
        info!(%local_addr, "listening");
        let accept_task = tokio::spawn(accept_loop(listener, node_tx));
        Ok(Self {
            accept_task,
            local_addr,
        })
    }

    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, node_tx: mpsc::UnboundedSender<NodeEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                debug!(%remote, "connection accepted");
                tokio::spawn(serve_connection(stream, node_tx.clone()));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

/// Serve one inbound connection until it closes or errors. Each frame is
/// handed to the node loop with this connection's write half as the reply
/// sink, which is also how observers are registered.
async fn serve_connection(stream: TcpStream, node_tx: mpsc::UnboundedSender<NodeEvent>) {
    let (read_half, mut write_half) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Envelope>();

    let writer = tokio::spawn(async move {
        while let Some(envelope) = reply_rx.recv().await {
            let mut line = envelope.to_line();
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match Envelope::parse(&line) {
            Ok(envelope) => {
                let event = NodeEvent::Message {
                    envelope,
                    reply: Some(ReplySink::new(reply_tx.clone())),
                };
                if node_tx.send(event).is_err() {
                    break;
                }
            }
            Err(_) => debug!("malformed client frame dropped"),
        }
    }

    writer.abort();
}

// ============================================================================
// LOCAL MESH (in-process transport for tests)
// ============================================================================

/// Routes envelopes between in-process nodes registered by URL. Same
/// contract as TCP: targets receive a reply sink that feeds responses back
/// into the sender's own event loop.
#[derive(Clone, Default)]
pub struct LocalMesh {
    nodes: Arc<DashMap<String, mpsc::UnboundedSender<NodeEvent>>>,
}

impl LocalMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, url: &str, node_tx: mpsc::UnboundedSender<NodeEvent>) {
        self.nodes.insert(url.to_string(), node_tx);
    }

    /// Bind the mesh to one member: replies addressed to it are pumped
    /// into its own mailbox as ordinary inbound messages.
    pub fn bind(&self, node_tx: mpsc::UnboundedSender<NodeEvent>) -> LocalOutbound {
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Envelope>();
        tokio::spawn(async move {
            while let Some(envelope) = reply_rx.recv().await {
                let event = NodeEvent::Message {
                    envelope,
                    reply: None,
                };
                if node_tx.send(event).is_err() {
                    break;
                }
            }
        });
        LocalOutbound {
            mesh: self.clone(),
            reply: ReplySink::new(reply_tx),
        }
    }
}

#[derive(Clone)]
pub struct LocalOutbound {
    mesh: LocalMesh,
    reply: ReplySink,
}

impl LocalOutbound {
    pub fn send(&self, url: &str, envelope: Envelope) -> Result<()> {
        let Some(target) = self.mesh.nodes.get(url) else {
            return Err(NodeError::Transport(format!("no node registered at {}", url)));
        };
        target
            .send(NodeEvent::Message {
                envelope,
                reply: Some(self.reply.clone()),
            })
            .map_err(|_| NodeError::Transport(format!("node at {} is gone", url)))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_peer_addr_strips_scheme() {
        assert_eq!(peer_addr("tcp://127.0.0.1:7001").unwrap(), "127.0.0.1:7001");
        assert_eq!(peer_addr("127.0.0.1:7001").unwrap(), "127.0.0.1:7001");
        assert!(peer_addr("tcp://").is_err());
    }

    #[tokio::test]
    async fn test_local_mesh_round_trip() {
        let mesh = LocalMesh::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        mesh.register("local://a", a_tx.clone());
        mesh.register("local://b", b_tx);

        let a_out = mesh.bind(a_tx);
        a_out
            .send("local://b", Envelope::command("getNodes", json!(null)))
            .unwrap();

        // B receives the command with a reply sink pointing back at A.
        let Some(NodeEvent::Message { envelope, reply }) = b_rx.recv().await else {
            panic!("expected message at b");
        };
        assert!(matches!(envelope, Envelope::Command { .. }));
        assert!(reply.unwrap().send(Envelope::data("nodes", json!([]))));

        // A sees the reply as an ordinary inbound push.
        let Some(NodeEvent::Message { envelope, reply }) = a_rx.recv().await else {
            panic!("expected reply at a");
        };
        assert!(matches!(envelope, Envelope::Data { ref data_name, .. } if data_name == "nodes"));
        assert!(reply.is_none());

        assert!(a_out
            .send("local://missing", Envelope::bare_command("getNodes"))
            .is_err());
    }

    #[tokio::test]
    async fn test_tcp_server_speaks_json_lines() {
        let (node_tx, mut node_rx) = mpsc::unbounded_channel();
        let server = TcpServer::bind("127.0.0.1:0", node_tx).await.unwrap();

        let mut client = TcpStream::connect(server.local_addr).await.unwrap();
        client
            .write_all(b"{\"command\":\"getNodes\"}\nnot json\n")
            .await
            .unwrap();

        // The well-formed frame arrives; the malformed one is dropped.
        let Some(NodeEvent::Message { envelope, reply }) = node_rx.recv().await else {
            panic!("expected inbound message");
        };
        assert_eq!(envelope, Envelope::bare_command("getNodes"));

        // Replies travel back over the same socket.
        assert!(reply.unwrap().send(Envelope::data("nodes", json!([]))));
        let mut lines = BufReader::new(client).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert!(line.contains("\"dataName\":\"nodes\""));

        assert!(node_rx.try_recv().is_err());
        server.shutdown();
    }
}
