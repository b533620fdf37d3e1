//! WebSocket session state machine.
//!
//! One `Session` exists per connected socket.  The session core is
//! transport-agnostic: inbound text enters through [`SessionHandle::receive`]
//! and outbound frames leave through an unbounded channel that the HTTP
//! glue pumps into the real socket.  A single consumer on that channel is
//! what makes frame writes atomic.
//!
//! Per-socket state:
//! - `client_locks` serialize message handling per client id across the
//!   responder pool (different clients run concurrently).
//! - `cached_queries` hold everything needed to re-invoke a subscribed
//!   method when one of its channels is notified.
//! - `cached_fingerprints` hold the digest of the last payload sent per
//!   `(client, callback)`, so unchanged results never produce a frame.
//! - `passthroughs` track subscriptions proxied to an upstream host.

use crate::context::Context;
use crate::registry::{Method, Resolved};
use crate::server::Server;
use crate::upstream::{SubscribeSpec, UpstreamClient};
use sb_protocol::{Frame, Message, Params, fingerprint};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Cached subscription state
// ---------------------------------------------------------------------------

/// Everything needed to re-run a subscribed call: the resolved method, the
/// original params, and the client-data snapshot taken at subscribe time.
struct CachedQuery {
    method: Arc<Method>,
    params: Params,
    client_data: Map<String, Value>,
}

/// A local subscription mirrored onto an upstream host.  Releasing the
/// source client releases the upstream subscription.
struct Passthrough {
    upstream: Arc<UpstreamClient>,
    dst_client: String,
}

impl Passthrough {
    fn unsubscribe(&self) {
        self.upstream.unsubscribe(&self.dst_client);
    }
}

#[derive(Default)]
struct SessionState {
    client_locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    cached_queries: HashMap<String, HashMap<Option<String>, CachedQuery>>,
    cached_fingerprints: HashMap<String, HashMap<Option<String>, [u8; 16]>>,
    passthroughs: HashMap<String, Arc<Passthrough>>,
}

struct SessionInner {
    id: Uuid,
    user: Option<String>,
    server: Weak<Server>,
    outbound: mpsc::UnboundedSender<String>,
    closing: AtomicBool,
    state: Mutex<SessionState>,
}

/// Cloneable handle to one socket's session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl SessionHandle {
    /// Open a session bound to a server.  The returned receiver yields the
    /// canonical wire text of every outbound frame, in send order.
    pub fn open(
        server: &Arc<Server>,
        user: Option<String>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                user,
                server: Arc::downgrade(server),
                outbound,
                closing: AtomicBool::new(false),
                state: Mutex::new(SessionState::default()),
            }),
        };
        (handle, rx)
    }

    /// A session attached to no server and no transport; outbound frames
    /// are dropped.  Only useful as a channel-bus participant in tests.
    pub fn detached() -> SessionHandle {
        let (outbound, _rx) = mpsc::unbounded_channel();
        SessionHandle {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                user: None,
                server: Weak::new(),
                outbound,
                closing: AtomicBool::new(false),
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn user(&self) -> Option<&str> {
        self.inner.user.as_deref()
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    fn server(&self) -> Option<Arc<Server>> {
        self.inner.server.upgrade()
    }

    // -----------------------------------------------------------------------
    // Inbound path
    // -----------------------------------------------------------------------

    /// Parse one inbound text frame.  Anything that is not a JSON object
    /// produces an immediate error frame; valid objects go to the
    /// responder pool (serialization is per client, not per socket).
    pub fn receive(&self, text: &str) {
        let message = match serde_json::from_str::<Value>(text) {
            Ok(value @ Value::Object(_)) => serde_json::from_value::<Message>(value),
            _ => {
                let description = format!("incoming websocket message was not a json object: {text}");
                error!("{description}");
                self.send(Frame::error(description));
                return;
            }
        };
        match message {
            Ok(message) => {
                debug!(socket = %self.id(), "received {message:?}");
                if let Some(server) = self.server() {
                    server.responder.submit((self.clone(), message));
                }
            }
            Err(e) => {
                let description = format!("incoming websocket message was malformed: {e}");
                error!("{description}");
                self.send(Frame::error(description));
            }
        }
    }

    /// Handle one parsed message.  Runs on a responder worker, under the
    /// client's lock when the message carries a client id.
    pub async fn handle_message(&self, message: Message) {
        let Some(server) = self.server() else { return };
        let client = message.client.clone();
        let callback = message.callback.clone();

        let _guards = match &client {
            Some(client) => self.lock_clients(std::slice::from_ref(client)).await,
            None => Vec::new(),
        };

        match message.action.as_deref() {
            Some("unsubscribe") => {
                if let Some(client) = &client {
                    self.unsubscribe(client);
                }
            }
            Some(action) => warn!(action = %action, "unknown action"),
            None => {}
        }

        let Some(qualified) = message.method.clone() else { return };
        let params = Params::from_value(message.params.clone());
        let ctx = Context {
            user: self.inner.user.clone(),
            client: client.clone(),
            callback: callback.clone(),
            websocket: Some(self.clone()),
            message: Some(message),
            ..Context::default()
        };

        match server.registry.resolve(&qualified) {
            Err(e) => {
                error!(method = %qualified, error = %e, "websocket dispatch error");
                self.send(Frame::error(e.to_string()).client(client).callback(callback));
            }
            Ok(Resolved::Local(method)) => {
                match server.invoke(&method, params.clone(), ctx.clone()).await {
                    Ok(result) => {
                        self.update_triggers(&client, &callback, &method, params, &ctx, Some(&result));
                    }
                    Err(e) => {
                        error!(method = %qualified, error = %e.message, "websocket dispatch error");
                        // The cached query is still stored so the next
                        // notification re-runs the method.
                        self.update_triggers(&client, &callback, &method, params, &ctx, None);
                        self.send(
                            Frame::error(e.render(server.config.debug))
                                .client(client)
                                .callback(callback),
                        );
                    }
                }
            }
            Ok(Resolved::Remote(upstream)) => {
                if let Some(src_client) = &client {
                    // Subscription request for a proxied service: mirror it
                    // upstream and forward pushes as they arrive.
                    self.passthrough_subscribe(&upstream, src_client, &qualified, &params);
                } else {
                    match upstream.call(&qualified, params.to_value()).await {
                        Ok(data) => {
                            if callback.is_some() {
                                self.send(Frame::data(data).callback(callback));
                            }
                        }
                        Err(e) => {
                            error!(method = %qualified, error = %e, "upstream call failed");
                            self.send(Frame::error(e.to_string()).callback(callback));
                        }
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Trigger-update protocol
    // -----------------------------------------------------------------------

    /// Called after every method call, successful or not.  Registers the
    /// cached query for subscribed methods, sends the reply frame, and
    /// registers channel interest last — a subscription only becomes
    /// visible to fan-out once its initial reply is already on the wire,
    /// so no trigger push can precede it.
    ///
    /// A request carrying a client but no callback gets its reply as a
    /// `trigger: "subscribe"` frame: the initial subscription reply IS the
    /// first data push.
    fn update_triggers(
        &self,
        client: &Option<String>,
        callback: &Option<String>,
        method: &Arc<Method>,
        params: Params,
        ctx: &Context,
        result: Option<&Value>,
    ) {
        let subscribed_client =
            if method.subscribes.is_empty() { None } else { client.as_ref() };
        if let Some(client) = subscribed_client {
            let mut state = self.inner.state.lock().expect("session state lock");
            state.cached_queries.entry(client.clone()).or_default().insert(
                callback.clone(),
                CachedQuery {
                    method: Arc::clone(method),
                    params,
                    client_data: ctx.client_data_snapshot(),
                },
            );
        }

        match (client, callback, result) {
            (Some(client), None, Some(result)) => {
                self.send(
                    Frame::data(result.clone()).client(Some(client.clone())).trigger("subscribe"),
                );
            }
            (_, Some(_), Some(result)) => {
                self.send(Frame::data(result.clone()).client(client.clone()).callback(callback.clone()));
            }
            _ => {}
        }

        if let Some(client) = subscribed_client {
            if let Some(server) = self.server() {
                server.bus.update_subscriptions(self, client, callback.as_deref(), &method.subscribes);
            }
        }
    }

    /// Re-run a cached query and push the result.  Called by the
    /// broadcaster when a notification lands on a subscribed channel.  A
    /// missing cached query is a silent no-op (the client unsubscribed
    /// while the notification was in flight).
    pub async fn trigger(&self, client: &str, callback: Option<&str>, label: Option<&str>) {
        let Some(server) = self.server() else { return };
        let cached = {
            let state = self.inner.state.lock().expect("session state lock");
            state
                .cached_queries
                .get(client)
                .and_then(|queries| queries.get(&callback.map(ToOwned::to_owned)))
                .map(|cq| (Arc::clone(&cq.method), cq.params.clone(), cq.client_data.clone()))
        };
        let Some((method, params, client_data)) = cached else {
            debug!(client = %client, "trigger for a client with no cached query");
            return;
        };

        let ctx = Context {
            user: self.inner.user.clone(),
            websocket: Some(self.clone()),
            trigger: label.map(ToOwned::to_owned),
            ..Context::with_client_data(client_data)
        };
        match server.invoke(&method, params, ctx).await {
            Ok(data) => {
                self.send(Frame {
                    data: Some(data),
                    error: None,
                    client: Some(client.to_owned()),
                    callback: callback.map(ToOwned::to_owned),
                    trigger: label.map(ToOwned::to_owned),
                });
            }
            Err(e) => {
                // The subscription stays active; the peer just sees stale
                // data until the method succeeds again.
                warn!(method = %method.name, error = %e.message, "ignoring unexpected trigger error");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Outbound path
    // -----------------------------------------------------------------------

    /// Send a frame, deduplicating subscription payloads by fingerprint.
    ///
    /// A frame carrying both `data` and `client` is suppressed when its
    /// payload fingerprint equals the one from the previous send for the
    /// same `(client, callback)`; a first-time send is never suppressed.
    pub fn send(&self, frame: Frame) {
        if self.is_closing() {
            debug!("ignoring send on an already closed websocket");
            return;
        }
        // Fingerprint check and enqueue happen under one lock so that the
        // dedup cache always agrees with what was actually written.
        let mut state = self.inner.state.lock().expect("session state lock");
        if let (Some(data), Some(client)) = (frame.payload(), &frame.client) {
            let digest = fingerprint(data);
            let slot = state.cached_fingerprints.entry(client.clone()).or_default();
            let prior = slot.insert(frame.callback.clone(), digest);
            if prior == Some(digest) {
                return;
            }
        }
        let text = frame.encode();
        debug!(socket = %self.id(), frame = %text, "sending");
        if self.inner.outbound.send(text).is_err() {
            debug!("outbound channel closed, dropping frame");
        }
    }

    // -----------------------------------------------------------------------
    // Subscription teardown
    // -----------------------------------------------------------------------

    /// Drop a client's subscriptions: locks, cached queries, fingerprints,
    /// channel interests, and any passthrough proxy.
    pub fn unsubscribe(&self, client: &str) {
        let passthrough = {
            let mut state = self.inner.state.lock().expect("session state lock");
            state.client_locks.remove(client);
            state.cached_queries.remove(client);
            state.cached_fingerprints.remove(client);
            state.passthroughs.remove(client)
        };
        if let Some(server) = self.server() {
            server.bus.remove_client(self.id(), client);
        }
        if let Some(passthrough) = passthrough {
            passthrough.unsubscribe();
        }
    }

    /// Tear down the whole session: channel bus first, then local state,
    /// then upstream unsubscribes for passthrough proxies.
    pub fn close(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(socket = %self.id(), "closing websocket session");
        if let Some(server) = self.server() {
            server.bus.purge_socket(self.id());
        }
        let passthroughs: Vec<Arc<Passthrough>> = {
            let mut state = self.inner.state.lock().expect("session state lock");
            state.client_locks.clear();
            state.cached_queries.clear();
            state.cached_fingerprints.clear();
            state.passthroughs.drain().map(|(_, passthrough)| passthrough).collect()
        };
        for passthrough in passthroughs {
            passthrough.unsubscribe();
        }
    }

    // -----------------------------------------------------------------------
    // Per-client locking
    // -----------------------------------------------------------------------

    /// Acquire the locks for a set of client ids in sorted order (dropping
    /// the returned guards releases them).  Sorted acquisition is what
    /// makes multi-client locking deadlock-free.
    pub async fn lock_clients(&self, clients: &[String]) -> Vec<tokio::sync::OwnedMutexGuard<()>> {
        let mut ordered = clients.to_vec();
        ordered.sort();
        ordered.dedup();

        let locks: Vec<Arc<tokio::sync::Mutex<()>>> = {
            let mut state = self.inner.state.lock().expect("session state lock");
            ordered
                .iter()
                .map(|client| Arc::clone(state.client_locks.entry(client.clone()).or_default()))
                .collect()
        };
        let mut guards = Vec::with_capacity(locks.len());
        for lock in locks {
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    // -----------------------------------------------------------------------
    // Passthrough subscriptions
    // -----------------------------------------------------------------------

    /// Mirror a local subscription onto an upstream host.  A repeated
    /// request for a client that already has a passthrough re-subscribes
    /// under the same destination id, which retargets the method without
    /// leaking the old upstream entry.
    fn passthrough_subscribe(
        &self,
        upstream: &Arc<UpstreamClient>,
        src_client: &str,
        method: &str,
        params: &Params,
    ) {
        let existing_dst = {
            let state = self.inner.state.lock().expect("session state lock");
            state.passthroughs.get(src_client).map(|p| p.dst_client.clone())
        };

        let weak = Arc::downgrade(&self.inner);
        let data_client = src_client.to_owned();
        let on_data = move |data: Value| {
            if let Some(inner) = weak.upgrade() {
                SessionHandle { inner }
                    .send(Frame::data(data).client(Some(data_client.clone())));
            }
        };
        let weak = Arc::downgrade(&self.inner);
        let error_client = src_client.to_owned();
        let on_error = move |error: Value| {
            if let Some(inner) = weak.upgrade() {
                SessionHandle { inner }.send(Frame {
                    error: Some(error),
                    client: Some(error_client.clone()),
                    ..Frame::default()
                });
            }
        };

        let mut spec = SubscribeSpec::new(on_data).errback(on_error);
        if let Some(dst) = &existing_dst {
            spec = spec.client(dst.clone());
        }
        let dst_client = upstream.subscribe(spec, method, params.to_value());

        let mut state = self.inner.state.lock().expect("session state lock");
        state.passthroughs.insert(
            src_client.to_owned(),
            Arc::new(Passthrough { upstream: Arc::clone(upstream), dst_client }),
        );
    }

    // -----------------------------------------------------------------------
    // Invariant helpers (used by tests and the broadcaster)
    // -----------------------------------------------------------------------

    /// Whether a cached query exists for `(client, callback)`.
    pub fn has_cached_query(&self, client: &str, callback: Option<&str>) -> bool {
        let state = self.inner.state.lock().expect("session state lock");
        state
            .cached_queries
            .get(client)
            .is_some_and(|queries| queries.contains_key(&callback.map(ToOwned::to_owned)))
    }

    /// Clients with any cached subscription state.
    pub fn subscribed_clients(&self) -> Vec<String> {
        let state = self.inner.state.lock().expect("session state lock");
        let mut clients: Vec<String> = state.cached_queries.keys().cloned().collect();
        clients.sort();
        clients
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("user", &self.inner.user)
            .finish()
    }
}
