//! Service registry and method dispatch.
//!
//! A service is a named set of callables.  Local services are built as
//! [`ServiceModule`]s — sync or async closures registered by name, each
//! optionally carrying subscribe/notify channel metadata.  Remote services
//! resolve to the upstream websocket client that proxies them.
//!
//! Names are unique; re-registration fails unless `override` is set.
//! Methods whose names begin with `_`, and methods outside a module's
//! allow-list, are never callable remotely.

use crate::context::Context;
use crate::jsonrpc::JsonRpcProxy;
use crate::upstream::UpstreamClient;
use futures_util::future::BoxFuture;
use sb_protocol::{Params, ParamsError};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Handler errors
// ---------------------------------------------------------------------------

/// Error raised by user method code.  `detail` carries the expanded error
/// chain and is only surfaced to peers when the host runs in debug mode.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub detail: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError { message: message.into(), detail: None }
    }

    pub fn with_detail(message: impl Into<String>, detail: impl Into<String>) -> Self {
        HandlerError { message: message.into(), detail: Some(detail.into()) }
    }

    /// The peer-visible rendering: the full detail in debug mode, the bare
    /// message otherwise.
    pub fn render(&self, debug: bool) -> String {
        match (&self.detail, debug) {
            (Some(detail), true) => format!("{}\n{}", self.message, detail),
            _ => self.message.clone(),
        }
    }
}

impl From<ParamsError> for HandlerError {
    fn from(e: ParamsError) -> Self {
        HandlerError::new(e.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::new(e.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::new(message)
    }
}

pub type MethodResult = Result<Value, HandlerError>;

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

type SyncMethod = Arc<dyn Fn(Params, &Context) -> MethodResult + Send + Sync>;
type AsyncMethod = Arc<dyn Fn(Params, Context) -> BoxFuture<'static, MethodResult> + Send + Sync>;

/// Callback wrapper that can be either sync or async.
#[derive(Clone)]
enum MethodKind {
    Sync(SyncMethod),
    Async(AsyncMethod),
}

/// Channels a method notifies on return, plus the fan-out delay.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifySpec {
    pub channels: Vec<String>,
    pub delay: Duration,
}

/// One registered callable with its channel metadata.
pub struct Method {
    pub name: String,
    kind: MethodKind,
    /// Channels whose notifications re-fire subscriptions to this method.
    pub subscribes: Vec<String>,
    /// Channels notified whenever this method returns.
    pub notifies: Option<NotifySpec>,
}

impl Method {
    pub async fn invoke(&self, params: Params, ctx: Context) -> MethodResult {
        match &self.kind {
            MethodKind::Sync(callback) => callback(params, &ctx),
            MethodKind::Async(callback) => callback(params, ctx).await,
        }
    }
}

/// Fluent metadata attachment for a just-registered method.
pub struct MethodBuilder<'a> {
    method: &'a mut Method,
}

impl MethodBuilder<'_> {
    /// Mark the method as a subscription source on the given channels.
    pub fn subscribes<I, S>(self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.method.subscribes = crate::channels::normalize_channels(channels);
        self
    }

    /// Notify the given channels whenever the method returns.
    pub fn notifies<I, S>(self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.notifies_delayed(channels, Duration::ZERO)
    }

    /// Notify the given channels after a fan-out delay.
    pub fn notifies_delayed<I, S>(self, channels: I, delay: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.method.notifies =
            Some(NotifySpec { channels: crate::channels::normalize_channels(channels), delay });
        self
    }
}

// ---------------------------------------------------------------------------
// Service modules
// ---------------------------------------------------------------------------

/// A buildable set of named methods, registered as one service.
#[derive(Default)]
pub struct ServiceModule {
    methods: HashMap<String, Method>,
    allow: Option<HashSet<String>>,
}

impl ServiceModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous method.
    pub fn register_method(
        &mut self,
        name: &str,
        callback: impl Fn(Params, &Context) -> MethodResult + Send + Sync + 'static,
    ) -> Result<MethodBuilder<'_>, RegistryError> {
        self.insert(name, MethodKind::Sync(Arc::new(callback)))
    }

    /// Register an asynchronous method.
    pub fn register_async_method<F, Fut>(
        &mut self,
        name: &str,
        callback: F,
    ) -> Result<MethodBuilder<'_>, RegistryError>
    where
        F: Fn(Params, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        let callback: AsyncMethod =
            Arc::new(move |params, ctx| Box::pin(callback(params, ctx)));
        self.insert(name, MethodKind::Async(callback))
    }

    /// Restrict which methods are callable remotely.
    pub fn restrict<I, S>(&mut self, allow: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allow = Some(allow.into_iter().map(|s| s.as_ref().to_owned()).collect());
        self
    }

    fn insert(&mut self, name: &str, kind: MethodKind) -> Result<MethodBuilder<'_>, RegistryError> {
        if self.methods.contains_key(name) {
            return Err(RegistryError::DuplicateMethod(name.to_owned()));
        }
        let method =
            Method { name: name.to_owned(), kind, subscribes: Vec::new(), notifies: None };
        let slot = self.methods.entry(name.to_owned()).or_insert(method);
        Ok(MethodBuilder { method: slot })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct LocalService {
    methods: HashMap<String, Arc<Method>>,
    allow: Option<HashSet<String>>,
}

enum RegisteredService {
    Local(LocalService),
    Remote(Arc<UpstreamClient>),
}

/// What a qualified method name resolves to.
#[derive(Clone)]
pub enum Resolved {
    Local(Arc<Method>),
    Remote(Arc<UpstreamClient>),
}

/// Shared name -> service map.  The registry handle itself is the live
/// view: names registered after a handle was obtained are visible through
/// it.
#[derive(Default)]
pub struct Registry {
    services: RwLock<HashMap<String, RegisteredService>>,
    jsonrpc: RwLock<HashMap<String, Arc<JsonRpcProxy>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local service under `name`.
    pub fn register(
        &self,
        name: &str,
        module: ServiceModule,
        override_existing: bool,
    ) -> Result<(), RegistryError> {
        let mut services = self.services.write().expect("registry lock");
        if !override_existing && services.contains_key(name) {
            return Err(RegistryError::DuplicateService(name.to_owned()));
        }
        let methods = module
            .methods
            .into_iter()
            .map(|(method_name, method)| (method_name, Arc::new(method)))
            .collect();
        services.insert(
            name.to_owned(),
            RegisteredService::Local(LocalService { methods, allow: module.allow }),
        );
        Ok(())
    }

    /// Register a remote service: a websocket-backed proxy plus the
    /// synchronous jsonrpc proxy available under the jsonrpc namespace.
    pub fn register_remote(
        &self,
        name: &str,
        websocket: Option<Arc<UpstreamClient>>,
        jsonrpc: Arc<JsonRpcProxy>,
    ) {
        if let Some(websocket) = websocket {
            self.services
                .write()
                .expect("registry lock")
                .insert(name.to_owned(), RegisteredService::Remote(websocket));
        }
        self.jsonrpc.write().expect("jsonrpc registry lock").insert(name.to_owned(), jsonrpc);
    }

    /// Resolve a `service.method` string.
    pub fn resolve(&self, qualified: &str) -> Result<Resolved, ResolveError> {
        let mut parts = qualified.split('.');
        let (service_name, method_name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(service), Some(method), None) if !service.is_empty() && !method.is_empty() => {
                (service, method)
            }
            _ => return Err(ResolveError::InvalidMethod(qualified.to_owned())),
        };

        let services = self.services.read().expect("registry lock");
        let service = services
            .get(service_name)
            .ok_or_else(|| ResolveError::UnknownService(service_name.to_owned()))?;
        match service {
            RegisteredService::Remote(client) => Ok(Resolved::Remote(Arc::clone(client))),
            RegisteredService::Local(local) => {
                if method_name.starts_with('_')
                    || local.allow.as_ref().is_some_and(|allow| !allow.contains(method_name))
                {
                    return Err(ResolveError::Forbidden(qualified.to_owned()));
                }
                local
                    .methods
                    .get(method_name)
                    .map(|method| Resolved::Local(Arc::clone(method)))
                    .ok_or_else(|| ResolveError::UnknownMethod(qualified.to_owned()))
            }
        }
    }

    /// Currently registered service names.  Reflects registrations made
    /// after this call returns on the next call — the registry handle is
    /// the live view.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.services.read().expect("registry lock").keys().cloned().collect();
        names.sort();
        names
    }

    /// The jsonrpc-namespace proxy for a remote service, if one exists.
    pub fn jsonrpc_proxy(&self, name: &str) -> Option<Arc<JsonRpcProxy>> {
        self.jsonrpc.read().expect("jsonrpc registry lock").get(name).cloned()
    }

    /// The upstream websocket behind a remote service, if the named
    /// service is remote.
    pub fn get_websocket(&self, name: &str) -> Option<Arc<UpstreamClient>> {
        match self.services.read().expect("registry lock").get(name) {
            Some(RegisteredService::Remote(client)) => Some(Arc::clone(client)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{0} has already been registered")]
    DuplicateService(String),
    #[error("method {0} has already been registered")]
    DuplicateMethod(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("invalid method {0}")]
    InvalidMethod(String),
    #[error("no service {0}")]
    UnknownService(String),
    #[error("no method {0}")]
    UnknownMethod(String),
    #[error("unable to call non-whitelisted method {0}")]
    Forbidden(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_module() -> ServiceModule {
        let mut module = ServiceModule::new();
        module
            .register_method("greet", |params, _ctx| {
                let name: String = params.one()?;
                Ok(json!(format!("Hello {name}!")))
            })
            .expect("greet registers");
        module
            .register_method("_private", |_params, _ctx| Ok(json!(null)))
            .expect("_private registers");
        module
    }

    #[tokio::test]
    async fn resolve_and_invoke_a_sync_method() {
        let registry = Registry::new();
        registry.register("testservice", sample_module(), false).expect("registers");

        let Resolved::Local(method) = registry.resolve("testservice.greet").expect("resolves")
        else {
            panic!("expected a local method");
        };
        let result = method
            .invoke(Params::from_value(Some(json!(["World"]))), Context::default())
            .await
            .expect("greet succeeds");
        assert_eq!(result, json!("Hello World!"));
    }

    #[tokio::test]
    async fn async_methods_invoke_through_the_same_path() {
        let registry = Registry::new();
        let mut module = ServiceModule::new();
        module
            .register_async_method("delayed", |params, _ctx| async move {
                let value: i64 = params.one()?;
                Ok(json!(value * 2))
            })
            .expect("delayed registers");
        registry.register("svc", module, false).expect("registers");

        let Resolved::Local(method) = registry.resolve("svc.delayed").expect("resolves") else {
            panic!("expected a local method");
        };
        let result = method
            .invoke(Params::from_value(Some(json!([21]))), Context::default())
            .await
            .expect("delayed succeeds");
        assert_eq!(result, json!(42));
    }

    #[test]
    fn duplicate_registration_fails_unless_overridden() {
        let registry = Registry::new();
        registry.register("svc", sample_module(), false).expect("first registration");
        assert_eq!(
            registry.register("svc", sample_module(), false),
            Err(RegistryError::DuplicateService("svc".to_owned()))
        );
        registry.register("svc", sample_module(), true).expect("override succeeds");
    }

    #[test]
    fn duplicate_method_names_are_rejected() {
        let mut module = ServiceModule::new();
        module.register_method("fn", |_p, _c| Ok(json!(null))).expect("first");
        assert!(matches!(
            module.register_method("fn", |_p, _c| Ok(json!(null))),
            Err(RegistryError::DuplicateMethod(_))
        ));
    }

    #[test]
    fn resolve_rejects_bad_shapes_and_unknown_names() {
        let registry = Registry::new();
        registry.register("svc", sample_module(), false).expect("registers");

        assert!(matches!(registry.resolve("no_dot"), Err(ResolveError::InvalidMethod(_))));
        assert!(matches!(registry.resolve("too.many.dots"), Err(ResolveError::InvalidMethod(_))));
        assert!(matches!(registry.resolve("unknown.fn"), Err(ResolveError::UnknownService(_))));
        assert!(matches!(registry.resolve("svc.missing"), Err(ResolveError::UnknownMethod(_))));
    }

    #[test]
    fn underscore_and_non_whitelisted_methods_are_forbidden() {
        let registry = Registry::new();
        registry.register("svc", sample_module(), false).expect("registers");
        assert!(matches!(registry.resolve("svc._private"), Err(ResolveError::Forbidden(_))));

        let mut module = ServiceModule::new();
        module.register_method("hidden", |_p, _c| Ok(json!(null))).expect("hidden registers");
        module.register_method("greet", |_p, _c| Ok(json!("hi"))).expect("greet registers");
        module.restrict(["greet"]);
        registry.register("locked", module, false).expect("registers");

        assert!(matches!(registry.resolve("locked.hidden"), Err(ResolveError::Forbidden(_))));
        assert!(registry.resolve("locked.greet").is_ok());
    }

    #[test]
    fn service_names_reflect_later_registrations() {
        let registry = Arc::new(Registry::new());
        let view = Arc::clone(&registry);
        assert!(view.service_names().is_empty());

        registry.register("late", sample_module(), false).expect("registers");
        assert_eq!(view.service_names(), vec!["late"]);
    }

    #[test]
    fn subscribe_and_notify_metadata_attach_to_methods() {
        let mut module = ServiceModule::new();
        module
            .register_method("watched", |_p, _c| Ok(json!([])))
            .expect("registers")
            .subscribes(["names", "names", "  padded  "])
            .notifies_delayed(["other"], Duration::from_secs(2));

        let registry = Registry::new();
        registry.register("svc", module, false).expect("registers");
        let Resolved::Local(method) = registry.resolve("svc.watched").expect("resolves") else {
            panic!("expected a local method");
        };
        assert_eq!(method.subscribes, vec!["names", "padded"]);
        let notifies = method.notifies.as_ref().expect("notify spec present");
        assert_eq!(notifies.channels, vec!["other"]);
        assert_eq!(notifies.delay, Duration::from_secs(2));
    }
}
