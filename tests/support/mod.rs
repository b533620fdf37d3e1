//! Shared helpers for the integration suites: a protocol-aware mock peer
//! for exercising the upstream client, and glue for spinning up a real
//! host on a random port.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use sideboard::{Config, Server, build_router};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message as WsFrame;

// ---------------------------------------------------------------------------
// Mock peer
// ---------------------------------------------------------------------------

/// How the mock peer treats inbound frames.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PeerMode {
    /// Record frames and reply to every `callback` request with pong data.
    Responsive,
    /// Record frames and never reply to anything.
    Silent,
}

/// A minimal remote host for upstream-client tests.  Binds port 0, records
/// every inbound frame, and (in responsive mode) acks one-shot calls so
/// the keepalive poll succeeds.
pub struct MockPeer {
    addr: SocketAddr,
    mode: PeerMode,
    frames: Arc<Mutex<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
    drop_all: Arc<tokio::sync::Notify>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockPeer {
    pub async fn start(mode: PeerMode) -> MockPeer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("mock peer binds");
        let addr = listener.local_addr().expect("local addr after bind");
        let frames: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let drop_all = Arc::new(tokio::sync::Notify::new());

        let task = {
            let frames = Arc::clone(&frames);
            let connections = Arc::clone(&connections);
            let drop_all = Arc::clone(&drop_all);
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _peer)) = listener.accept().await else { break };
                    connections.fetch_add(1, Ordering::SeqCst);
                    let frames = Arc::clone(&frames);
                    let drop_all = Arc::clone(&drop_all);
                    tokio::spawn(async move {
                        let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                            return;
                        };
                        let (mut write, mut read) = ws.split();
                        loop {
                            let frame = tokio::select! {
                                () = drop_all.notified() => break,
                                frame = read.next() => frame,
                            };
                            let text = match frame {
                                Some(Ok(WsFrame::Text(text))) => text,
                                Some(Ok(WsFrame::Ping(data))) => {
                                    let _ = write.send(WsFrame::Pong(data)).await;
                                    continue;
                                }
                                Some(Ok(WsFrame::Close(_))) | None | Some(Err(_)) => break,
                                Some(Ok(_)) => continue,
                            };
                            let Ok(value) = serde_json::from_str::<Value>(&text) else { continue };
                            frames.lock().expect("frames lock").push(value.clone());

                            if mode == PeerMode::Responsive {
                                if let Some(callback) = value.get("callback").and_then(Value::as_str)
                                {
                                    let reply = json!({"callback": callback, "data": "pong"});
                                    let _ = write
                                        .send(WsFrame::Text(reply.to_string().into()))
                                        .await;
                                }
                            }
                        }
                    });
                }
            })
        };

        MockPeer { addr, mode, frames, connections, drop_all, _task: task }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/wsrpc", self.addr)
    }

    /// Snapshot of every frame received so far.
    pub fn frames(&self) -> Vec<Value> {
        self.frames.lock().expect("frames lock").clone()
    }

    /// Frames whose `method` matches.
    pub fn frames_with_method(&self, method: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|f| f.get("method").and_then(Value::as_str) == Some(method))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Force-close every open connection; the listener stays up so clients
    /// can reconnect.
    pub fn drop_connections(&self) {
        self.drop_all.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Real-host glue
// ---------------------------------------------------------------------------

/// Serve a host on a random loopback port.  Returns the bound address;
/// the serve task runs until the test's runtime shuts down.
pub async fn spawn_host(server: Arc<Server>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("host binds");
    let addr = listener.local_addr().expect("local addr after bind");
    let app = build_router(server);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// A default config with auth disabled and short upstream timings, the
/// shape most integration tests want.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.ws.auth_required = false;
    config.ws.call_timeout = Duration::from_secs(1);
    config.ws.poll_interval = Duration::from_millis(300);
    config.ws.reconnect_interval = Duration::from_secs(2);
    config
}

/// Receive the next frame from a session's outbound channel, bounded by a
/// timeout, parsed as JSON.
pub async fn next_frame(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>,
    wait: Duration,
) -> Option<Value> {
    match tokio::time::timeout(wait, rx.recv()).await {
        Ok(Some(text)) => Some(serde_json::from_str(&text).expect("outbound frames are json")),
        _ => None,
    }
}
