//! Sideboard: a multi-tenant RPC host.
//!
//! Independently-deployed service modules register behind two symmetric
//! transports — a request/response JSON-RPC endpoint and a long-lived
//! bidirectional WebSocket endpoint.  The WebSocket transport carries a
//! subscription engine: any registered method can be invoked as a standing
//! subscription, and the host re-invokes it and pushes fresh results
//! whenever a channel the method reads from is notified, deduplicating
//! unchanged payloads by fingerprint.

pub mod channels;
pub mod config;
pub mod context;
pub mod http;
pub mod jsonrpc;
pub mod lifecycle;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod upstream;

pub use channels::{ChannelBus, normalize_channels};
pub use config::{Config, ConfigError, load_config};
pub use context::Context;
pub use http::{AuthError, Authenticator, BearerAuthenticator, build_router};
pub use jsonrpc::JsonRpcProxy;
pub use lifecycle::{Lifecycle, Stopped};
pub use registry::{HandlerError, Registry, ResolveError, ServiceModule};
pub use server::Server;
pub use session::SessionHandle;
pub use upstream::{SubscribeSpec, Subscription, UpstreamClient, UpstreamError};

pub use sb_protocol::{Frame, Message, Params, Serializer, canonical_json, fingerprint};
