//! Outbound persistent WebSocket client to a peer host.
//!
//! Used both by plugin code (`registry.get_websocket(..)`) and by the
//! passthrough mechanism that mirrors a local subscription onto a remote
//! one.  A background checker (1 Hz) reconnects with exponential back-off
//! and keeps the link warm by polling `sideboard.poll`; a reader task
//! routes every inbound frame to the pending-callback map by `client` or
//! `callback` id.
//!
//! Subscriptions survive reconnects: the stored records are re-sent after
//! every successful reconnect, regenerating params through `paramback`
//! when one was provided.

use crate::config::{TlsMaterial, WsOptions};
use crate::lifecycle::{DEFAULT_PRIORITY, Lifecycle, Stopped};
use futures_util::{SinkExt, StreamExt};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sb_protocol::canonical_json;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message as WsFrame;
use tracing::{debug, error, warn};

const POLL_METHOD: &str = "sideboard.poll";

// ---------------------------------------------------------------------------
// Callback specs
// ---------------------------------------------------------------------------

pub type DataCallback = Arc<dyn Fn(Value) + Send + Sync>;
pub type ParamsFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// What to do with a subscription's pushes.  Built from a plain closure
/// for the common case; `errback`, `paramback`, and an explicit client id
/// are optional.
pub struct SubscribeSpec {
    callback: DataCallback,
    errback: Option<DataCallback>,
    paramback: Option<ParamsFn>,
    client: Option<String>,
}

impl SubscribeSpec {
    pub fn new(callback: impl Fn(Value) + Send + Sync + 'static) -> Self {
        SubscribeSpec { callback: Arc::new(callback), errback: None, paramback: None, client: None }
    }

    /// Called with the remote error payload instead of logging it.
    pub fn errback(mut self, errback: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.errback = Some(Arc::new(errback));
        self
    }

    /// Regenerate params on every (re)fire; useful for time-based params.
    pub fn paramback(mut self, paramback: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.paramback = Some(Arc::new(paramback));
        self
    }

    /// Pin the client id instead of generating one.
    pub fn client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }
}

struct CallbackEntry {
    /// Present for standing subscriptions, absent for one-shot calls.
    client: Option<String>,
    method: Option<String>,
    params: Option<Value>,
    paramback: Option<ParamsFn>,
    callback: DataCallback,
    errback: DataCallback,
}

// ---------------------------------------------------------------------------
// Connection plumbing
// ---------------------------------------------------------------------------

struct Conn {
    tx: mpsc::UnboundedSender<WsFrame>,
    alive: Arc<AtomicBool>,
}

impl Conn {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

struct CheckerState {
    reconnect_attempts: u32,
    last_reconnect_attempt: Option<Instant>,
    last_poll: Option<Instant>,
}

// ---------------------------------------------------------------------------
// UpstreamClient
// ---------------------------------------------------------------------------

pub struct UpstreamClient {
    url: String,
    tls: TlsMaterial,
    options: WsOptions,
    stopped: Stopped,
    counter: AtomicU64,
    callbacks: Mutex<HashMap<String, CallbackEntry>>,
    conn: Mutex<Option<Conn>>,
    checker: Mutex<CheckerState>,
    fallback: Mutex<DataCallback>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl UpstreamClient {
    pub fn new(
        url: impl Into<String>,
        tls: TlsMaterial,
        options: WsOptions,
        stopped: Stopped,
    ) -> Arc<Self> {
        let url = url.into();
        let log_url = url.clone();
        let fallback: DataCallback = Arc::new(move |message: Value| {
            error!(url = %log_url, %message, "no callback registered for message, ignored");
        });
        Arc::new(UpstreamClient {
            url,
            tls,
            options,
            stopped,
            counter: AtomicU64::new(0),
            callbacks: Mutex::new(HashMap::new()),
            conn: Mutex::new(None),
            checker: Mutex::new(CheckerState {
                reconnect_attempts: 0,
                last_reconnect_attempt: None,
                last_poll: None,
            }),
            fallback: Mutex::new(fallback),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Handler for inbound frames that match no outstanding call or
    /// subscription.
    pub fn set_fallback(&self, fallback: impl Fn(Value) + Send + Sync + 'static) {
        *self.fallback.lock().expect("fallback lock") = Arc::new(fallback);
    }

    pub fn connected(&self) -> bool {
        self.conn.lock().expect("conn lock").as_ref().is_some_and(Conn::is_alive)
    }

    /// Start the background checker (idempotent) and optionally wait up to
    /// `max_wait` for the first connection to come up.
    pub async fn connect(self: &Arc<Self>, max_wait: Duration) {
        if !self.started.swap(true, Ordering::SeqCst) {
            let client = Arc::clone(self);
            tokio::spawn(async move { client.run_checker().await });
        }
        let deadline = Instant::now() + max_wait;
        while !self.connected() && Instant::now() < deadline && !self.stopped.is_set() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if !max_wait.is_zero() && !self.connected() {
            warn!(url = %self.url, "websocket not connected after {:?}", max_wait);
        }
    }

    /// Drop the connection and stop reconnecting.  Safe to call more than
    /// once.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.drop_connection();
    }

    fn drop_connection(&self) {
        if let Some(conn) = self.conn.lock().expect("conn lock").take() {
            conn.alive.store(false, Ordering::SeqCst);
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Outstanding call and subscription records.  Diagnostic; a completed
    /// or timed-out call must not leave an entry behind.
    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.lock().expect("callbacks lock").len()
    }

    // -----------------------------------------------------------------------
    // Calls and subscriptions
    // -----------------------------------------------------------------------

    /// Synchronous RPC: send, then wait for the reply bounded by
    /// `ws.call_timeout`.  The pending entry is removed on every exit path.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        let callback_id = self.next_id("callback");
        let (tx, rx) = oneshot::channel::<Result<Value, Value>>();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let on_data = {
            let slot = Arc::clone(&slot);
            Arc::new(move |data| {
                if let Some(tx) = slot.lock().expect("call slot lock").take() {
                    let _ = tx.send(Ok(data));
                }
            })
        };
        let on_error = {
            let slot = Arc::clone(&slot);
            Arc::new(move |err| {
                if let Some(tx) = slot.lock().expect("call slot lock").take() {
                    let _ = tx.send(Err(err));
                }
            })
        };
        self.callbacks.lock().expect("callbacks lock").insert(
            callback_id.clone(),
            CallbackEntry {
                client: None,
                method: None,
                params: None,
                paramback: None,
                callback: on_data,
                errback: on_error,
            },
        );

        let frame = request_frame(method, &params, None, Some(&callback_id));
        if let Err(e) = self.send_frame(&frame) {
            self.callbacks.lock().expect("callbacks lock").remove(&callback_id);
            return Err(e);
        }

        let timeout = self.options.call_timeout;
        let result = tokio::select! {
            _ = self.stopped.wait() => Err(UpstreamError::Stopped),
            outcome = tokio::time::timeout(timeout, rx) => match outcome {
                Err(_) => Err(UpstreamError::Timeout(timeout)),
                Ok(Err(_)) => Err(UpstreamError::Disconnected),
                Ok(Ok(Ok(data))) => Ok(data),
                Ok(Ok(Err(error))) => Err(UpstreamError::Remote(render_error(&error))),
            },
        };
        self.callbacks.lock().expect("callbacks lock").remove(&callback_id);
        result
    }

    /// Standing subscription.  Returns the client id identifying it.  An
    /// initial send failure is non-fatal: the reconnect path re-fires every
    /// stored subscription.
    pub fn subscribe(&self, spec: SubscribeSpec, method: &str, params: Value) -> String {
        let client = spec.client.unwrap_or_else(|| self.next_id("client"));
        let sent_params = spec.paramback.as_ref().map_or(params, |paramback| paramback());
        let errback = spec.errback.unwrap_or_else(|| {
            let method = method.to_owned();
            Arc::new(move |error| {
                error!(method = %method, error = %render_error(&error), "subscription returned an error");
            })
        });

        self.callbacks.lock().expect("callbacks lock").insert(
            client.clone(),
            CallbackEntry {
                client: Some(client.clone()),
                method: Some(method.to_owned()),
                params: Some(sent_params.clone()),
                paramback: spec.paramback,
                callback: spec.callback,
                errback,
            },
        );

        let frame = request_frame(method, &sent_params, Some(&client), None);
        if self.send_frame(&frame).is_err() {
            warn!(method = %method, url = %self.url, "initial subscription failed, will retry on reconnect");
        }
        client
    }

    /// Cancel a subscription; best-effort notification to the remote.
    pub fn unsubscribe(&self, client: &str) {
        self.callbacks.lock().expect("callbacks lock").remove(client);
        let frame = json!({"action": "unsubscribe", "client": client});
        let _ = self.send_frame(&frame);
    }

    fn refire_subscriptions(&self) {
        let frames: Vec<Value> = {
            let callbacks = self.callbacks.lock().expect("callbacks lock");
            callbacks
                .values()
                .filter_map(|entry| {
                    let client = entry.client.as_ref()?;
                    let method = entry.method.as_ref()?;
                    let params = entry
                        .paramback
                        .as_ref()
                        .map_or_else(|| entry.params.clone().unwrap_or(Value::Null), |f| f());
                    Some(request_frame(method, &params, Some(client), None))
                })
                .collect()
        };
        for frame in frames {
            if self.send_frame(&frame).is_err() {
                // Connection dropped again; the next reconnect re-fires.
                break;
            }
        }
    }

    fn send_frame(&self, frame: &Value) -> Result<(), UpstreamError> {
        let conn = self.conn.lock().expect("conn lock");
        match conn.as_ref() {
            Some(conn) if conn.is_alive() => {
                conn.tx
                    .send(WsFrame::Text(canonical_json(frame).into()))
                    .map_err(|_| UpstreamError::Disconnected)
            }
            _ => Err(UpstreamError::NotConnected(self.url.clone())),
        }
    }

    // -----------------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------------

    /// Route one inbound frame by `client` or `callback` id.  Frames that
    /// match no outstanding entry go to the fallback handler.
    fn dispatch(&self, message: Value) {
        let id = message
            .get("client")
            .and_then(Value::as_str)
            .or_else(|| message.get("callback").and_then(Value::as_str))
            .map(ToOwned::to_owned);

        let routed = id.and_then(|id| {
            let callbacks = self.callbacks.lock().expect("callbacks lock");
            callbacks.get(&id).map(|entry| (Arc::clone(&entry.callback), Arc::clone(&entry.errback)))
        });

        match routed {
            Some((callback, errback)) => {
                if let Some(error) = message.get("error") {
                    errback(error.clone());
                } else {
                    callback(message.get("data").cloned().unwrap_or(Value::Null));
                }
            }
            None => {
                let fallback = Arc::clone(&*self.fallback.lock().expect("fallback lock"));
                fallback(message);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Checker
    // -----------------------------------------------------------------------

    async fn run_checker(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.stopped.wait() => break,
                _ = ticker.tick() => {}
            }
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            if self.should_reconnect() {
                self.reconnect().await;
            }
            if self.should_poll() {
                self.poll().await;
            }
        }
        self.drop_connection();
    }

    fn should_reconnect(&self) -> bool {
        if self.connected() {
            return false;
        }
        let state = self.checker.lock().expect("checker lock");
        let backoff = self
            .options
            .reconnect_interval
            .min(Duration::from_secs(1u64 << state.reconnect_attempts.min(30)));
        match state.last_reconnect_attempt {
            None => true,
            Some(last) => state.reconnect_attempts == 0 || last.elapsed() >= backoff,
        }
    }

    fn should_poll(&self) -> bool {
        if !self.connected() {
            return false;
        }
        let state = self.checker.lock().expect("checker lock");
        state.last_poll.is_none_or(|last| last.elapsed() >= self.options.poll_interval)
    }

    async fn reconnect(self: &Arc<Self>) {
        let result = self.open_connection().await;
        let mut state = self.checker.lock().expect("checker lock");
        match result {
            Ok(conn) => {
                *self.conn.lock().expect("conn lock") = Some(conn);
                state.reconnect_attempts = 0;
                // The handshake itself proves liveness; the first keepalive
                // poll is due one full interval later.
                state.last_poll = Some(Instant::now());
                drop(state);
                debug!(url = %self.url, "connected");
                self.refire_subscriptions();
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "failed to connect");
                state.last_reconnect_attempt = Some(Instant::now());
                state.reconnect_attempts += 1;
            }
        }
    }

    async fn poll(self: &Arc<Self>) {
        match self.call(POLL_METHOD, Value::Null).await {
            Ok(_) => {
                self.checker.lock().expect("checker lock").last_poll = Some(Instant::now());
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "no poll response, closing connection to force a reconnect");
                self.drop_connection();
            }
        }
    }

    async fn open_connection(self: &Arc<Self>) -> Result<Conn, UpstreamError> {
        let connector = build_connector(&self.tls)?;
        let (stream, _response) = tokio_tungstenite::connect_async_tls_with_config(
            self.url.as_str(),
            None,
            false,
            connector,
        )
        .await
        .map_err(|e| UpstreamError::Connect(e.to_string()))?;

        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsFrame>();
        let alive = Arc::new(AtomicBool::new(true));

        let writer_alive = Arc::clone(&alive);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            writer_alive.store(false, Ordering::SeqCst);
        });

        let reader_alive = Arc::clone(&alive);
        let reader_tx = tx.clone();
        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = client.stopped.wait() => break,
                    frame = source.next() => frame,
                };
                match frame {
                    Some(Ok(WsFrame::Text(text))) => match serde_json::from_str::<Value>(&text) {
                        Ok(message) => client.dispatch(message),
                        Err(e) => debug!(error = %e, "failed to parse incoming message"),
                    },
                    Some(Ok(WsFrame::Ping(data))) => {
                        let _ = reader_tx.send(WsFrame::Pong(data));
                    }
                    Some(Ok(WsFrame::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket read error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            reader_alive.store(false, Ordering::SeqCst);
        });

        Ok(Conn { tx, alive })
    }
}

// ---------------------------------------------------------------------------
// Frame/TLS helpers
// ---------------------------------------------------------------------------

fn request_frame(
    method: &str,
    params: &Value,
    client: Option<&str>,
    callback: Option<&str>,
) -> Value {
    let mut frame = Map::new();
    frame.insert("method".to_owned(), Value::String(method.to_owned()));
    if !params.is_null() {
        frame.insert("params".to_owned(), params.clone());
    }
    if let Some(client) = client {
        frame.insert("client".to_owned(), Value::String(client.to_owned()));
    }
    if let Some(callback) = callback {
        frame.insert("callback".to_owned(), Value::String(callback.to_owned()));
    }
    Value::Object(frame)
}

fn render_error(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        other => canonical_json(other),
    }
}

fn build_connector(
    tls: &TlsMaterial,
) -> Result<Option<tokio_tungstenite::Connector>, UpstreamError> {
    if tls.ca.is_none() && tls.client_cert.is_none() {
        return Ok(None);
    }

    let mut roots = rustls::RootCertStore::empty();
    if let Some(ca) = &tls.ca {
        for cert in CertificateDer::pem_file_iter(ca)
            .map_err(|e| UpstreamError::Tls(format!("reading ca '{ca}': {e}")))?
        {
            let cert = cert.map_err(|e| UpstreamError::Tls(format!("parsing ca '{ca}': {e}")))?;
            roots.add(cert).map_err(|e| UpstreamError::Tls(e.to_string()))?;
        }
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    let config = match (&tls.client_cert, &tls.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(cert_path)
                .map_err(|e| UpstreamError::Tls(format!("reading client cert '{cert_path}': {e}")))?
                .collect::<Result<_, _>>()
                .map_err(|e| UpstreamError::Tls(e.to_string()))?;
            let key = PrivateKeyDer::from_pem_file(key_path)
                .map_err(|e| UpstreamError::Tls(format!("reading client key '{key_path}': {e}")))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| UpstreamError::Tls(e.to_string()))?
        }
        _ => builder.with_no_client_auth(),
    };
    Ok(Some(tokio_tungstenite::Connector::Rustls(Arc::new(config))))
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("not connected to {0}")]
    NotConnected(String),
    #[error("connection error: {0}")]
    Connect(String),
    #[error("invalid TLS material: {0}")]
    Tls(String),
    #[error("websocket disconnected")]
    Disconnected,
    #[error("no response received within {0:?}")]
    Timeout(Duration),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("host is shutting down")]
    Stopped,
}

// ---------------------------------------------------------------------------
// Standing subscriptions
// ---------------------------------------------------------------------------

/// A standing upstream subscription tied to the host lifecycle: subscribes
/// on startup, unsubscribes on shutdown, and always holds the latest
/// result.
pub struct Subscription {
    ws: Arc<UpstreamClient>,
    method: String,
    params: Value,
    client_id: Mutex<Option<String>>,
    result: Mutex<Option<Value>>,
    callback: DataCallback,
}

impl Subscription {
    /// Create the subscription and hook it into the lifecycle registries.
    pub fn new(
        lifecycle: &Lifecycle,
        ws: Arc<UpstreamClient>,
        method: impl Into<String>,
        params: Value,
        callback: impl Fn(Value) + Send + Sync + 'static,
    ) -> Arc<Self> {
        let subscription = Arc::new(Subscription {
            ws,
            method: method.into(),
            params,
            client_id: Mutex::new(None),
            result: Mutex::new(None),
            callback: Arc::new(callback),
        });

        let on_start = Arc::clone(&subscription);
        lifecycle.on_startup(DEFAULT_PRIORITY, move || on_start.subscribe_now());
        let on_stop = Arc::clone(&subscription);
        lifecycle.on_shutdown(DEFAULT_PRIORITY, move || on_stop.unsubscribe_now());
        subscription
    }

    /// The latest value pushed by the remote method, if any yet.
    pub fn result(&self) -> Option<Value> {
        self.result.lock().expect("result lock").clone()
    }

    /// Re-fire the method once and feed the callback, for methods that by
    /// design do not push on every change.
    pub async fn refresh(&self) -> Result<(), UpstreamError> {
        let data = self.ws.call(&self.method, self.params.clone()).await?;
        self.accept(data);
        Ok(())
    }

    fn subscribe_now(self: &Arc<Self>) {
        let receiver = Arc::clone(self);
        let spec = SubscribeSpec::new(move |data| receiver.accept(data));
        let client = self.ws.subscribe(spec, &self.method, self.params.clone());
        *self.client_id.lock().expect("client id lock") = Some(client);
    }

    fn unsubscribe_now(&self) {
        if let Some(client) = self.client_id.lock().expect("client id lock").take() {
            self.ws.unsubscribe(&client);
        }
    }

    fn accept(&self, data: Value) {
        *self.result.lock().expect("result lock") = Some(data.clone());
        (self.callback)(data);
    }
}
