//! The host value owning every shared component: config, registry,
//! channel bus, lifecycle, and the three worker queues (responder,
//! broadcaster, local broadcaster).  Nothing here is a process-wide
//! global; components reach each other through this value, which makes a
//! complete host constructible per test.

use crate::channels::{ChannelBus, LocalCallback, normalize_channels};
use crate::config::Config;
use crate::context::Context;
use crate::http::{AuthError, Authenticator};
use crate::jsonrpc::JsonRpcProxy;
use crate::lifecycle::Lifecycle;
use crate::registry::{Method, MethodResult, Registry, ServiceModule};
use crate::scheduler::DelayedCaller;
use crate::session::SessionHandle;
use crate::upstream::{UpstreamClient, UpstreamError};
use sb_protocol::Message;
use serde_json::Value;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// One channel fan-out event, queued on both broadcast queues.
#[derive(Debug, Clone)]
pub struct Notification {
    pub channels: Vec<String>,
    /// Informational label included in pushed frames.
    pub trigger: String,
    /// Subscriptions held by this client are skipped.
    pub originating_client: Option<String>,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct Server {
    pub config: Config,
    pub registry: Registry,
    pub bus: ChannelBus,
    pub lifecycle: Lifecycle,
    pub(crate) responder: DelayedCaller<(SessionHandle, Message)>,
    broadcaster: DelayedCaller<Notification>,
    local_broadcaster: DelayedCaller<Notification>,
    authenticator: RwLock<Arc<dyn Authenticator>>,
}

impl Server {
    /// Build a host and spawn its worker queues.  Must be called from
    /// within a tokio runtime.  The built-in `sideboard` service (with its
    /// `poll` keepalive target) is registered here; remote services come
    /// from [`Server::register_remote_services`].
    pub fn new(config: Config) -> Arc<Self> {
        let lifecycle = Lifecycle::new();
        let stopped = lifecycle.stopped.clone();

        let registry = Registry::new();
        let mut core = ServiceModule::new();
        core.register_method("poll", |_params, ctx| {
            debug!(user = ?ctx.user, "sideboard.poll");
            Ok(Value::Null)
        })
        .expect("core service builds once");
        registry.register("sideboard", core, false).expect("sideboard name is free at startup");

        Arc::new_cyclic(|weak: &Weak<Server>| {
            let responder = DelayedCaller::start(
                "responder",
                config.ws.thread_pool,
                stopped.clone(),
                Arc::new(|(session, message): (SessionHandle, Message)| {
                    Box::pin(async move { session.handle_message(message).await })
                }),
            );
            let broadcaster = DelayedCaller::start("broadcaster", 1, stopped.clone(), {
                let weak = weak.clone();
                Arc::new(move |notification: Notification| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        if let Some(server) = weak.upgrade() {
                            server.broadcast(notification).await;
                        }
                    })
                })
            });
            let local_broadcaster = DelayedCaller::start("local-broadcaster", 1, stopped.clone(), {
                let weak = weak.clone();
                Arc::new(move |notification: Notification| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        if let Some(server) = weak.upgrade() {
                            server.local_broadcast(&notification);
                        }
                    })
                })
            });

            Server {
                config,
                registry,
                bus: ChannelBus::new(),
                lifecycle,
                responder,
                broadcaster,
                local_broadcaster,
                authenticator: RwLock::new(Arc::new(NoAuthenticator)),
            }
        })
    }

    /// Register the remote services declared in `[rpc_services]`: a
    /// websocket-backed proxy (unless `jsonrpc_only`) plus the synchronous
    /// jsonrpc-namespace proxy, both using the resolved mTLS material.
    pub fn register_remote_services(self: &Arc<Self>) -> Result<(), UpstreamError> {
        for (name, service) in &self.config.rpc_services {
            let tls = self.config.tls_for(service);
            let secure = tls.ca.is_some();
            let http_scheme = if secure { "https" } else { "http" };
            let ws_scheme = if secure { "wss" } else { "ws" };

            let jsonrpc = Arc::new(JsonRpcProxy::new(
                format!("{http_scheme}://{}/jsonrpc", service.host),
                name,
                &tls,
            )?);
            let websocket = if service.jsonrpc_only {
                None
            } else {
                let client = UpstreamClient::new(
                    format!("{ws_scheme}://{}/wsrpc", service.host),
                    tls,
                    self.config.ws.clone(),
                    self.lifecycle.stopped.clone(),
                );
                let connecting = Arc::clone(&client);
                tokio::spawn(async move { connecting.connect(Duration::ZERO).await });
                Some(client)
            };
            self.registry.register_remote(name, websocket, jsonrpc);
        }
        Ok(())
    }

    /// Open a websocket session on this host.
    pub fn open_session(
        self: &Arc<Self>,
        user: Option<String>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<String>) {
        SessionHandle::open(self, user)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Invoke a resolved method and, when it declares notify channels,
    /// post them to the broadcast queues on return — success or failure.
    pub async fn invoke(
        self: &Arc<Self>,
        method: &Arc<Method>,
        params: sb_protocol::Params,
        ctx: Context,
    ) -> MethodResult {
        let originating = ctx.originating_client.clone().or_else(|| ctx.client_id());
        let result = method.invoke(params, ctx).await;
        if let Some(spec) = &method.notifies {
            self.notify(spec.channels.clone(), &method.name, spec.delay, originating);
        }
        result
    }

    /// Manually trigger all subscriptions on the given channels.
    pub fn notify<I, S>(
        &self,
        channels: I,
        trigger: &str,
        delay: Duration,
        originating_client: Option<String>,
    ) where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let channels = normalize_channels(channels);
        if channels.is_empty() {
            return;
        }
        let notification = Notification {
            channels,
            trigger: trigger.to_owned(),
            originating_client,
        };
        self.broadcaster.submit_after(notification.clone(), delay);
        self.local_broadcaster.submit_after(notification, delay);
    }

    /// Register an in-process callback fired on the local broadcaster
    /// whenever one of `channels` is notified.
    pub fn subscribe_local<I, S>(&self, channels: I, callback: LocalCallback) -> u64
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.bus.subscribe_local(channels, callback)
    }

    /// Remote fan-out: re-fire every interested subscription except those
    /// held by the originating client.  Runs on the broadcaster worker;
    /// per-triple failures are logged inside the trigger path and never
    /// stop the remaining triples.
    async fn broadcast(&self, notification: Notification) {
        for interest in self.bus.interests(&notification.channels) {
            if notification.originating_client.as_deref() == Some(interest.client.as_str()) {
                continue;
            }
            interest
                .session
                .trigger(
                    &interest.client,
                    interest.callback.as_deref(),
                    Some(&notification.trigger),
                )
                .await;
        }
    }

    /// In-process fan-out: run each registered local callback under a
    /// fresh context carrying the trigger label and originating client.
    fn local_broadcast(&self, notification: &Notification) {
        for callback in self.bus.local_callbacks(&notification.channels) {
            let ctx = Context {
                trigger: Some(notification.trigger.clone()),
                originating_client: notification.originating_client.clone(),
                ..Context::default()
            };
            if let Err(e) = callback(&ctx) {
                error!(error = %e, "unexpected error on local broadcast callback");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle + auth
    // -----------------------------------------------------------------------

    pub fn startup(&self) {
        self.lifecycle.run_startup();
    }

    pub fn shutdown(&self) {
        self.lifecycle.run_shutdown();
    }

    pub fn set_authenticator(&self, authenticator: impl Authenticator + 'static) {
        *self.authenticator.write().expect("authenticator lock") = Arc::new(authenticator);
    }

    pub fn authenticate(&self, headers: &axum::http::HeaderMap) -> Result<String, AuthError> {
        let authenticator = Arc::clone(&*self.authenticator.read().expect("authenticator lock"));
        authenticator.authenticate(headers)
    }
}

/// Default authenticator: rejects everything.  Hosts that require
/// authenticated `/ws` sessions must install a real one.
struct NoAuthenticator;

impl Authenticator for NoAuthenticator {
    fn authenticate(&self, _headers: &axum::http::HeaderMap) -> Result<String, AuthError> {
        Err(AuthError::new("no authenticator configured"))
    }
}
