//! The channel bus: which subscriptions care about which channels.
//!
//! Two registries live here.  The remote registry maps channel name ->
//! socket -> client id -> set of callback ids and is what notification
//! fan-out enumerates.  The local registry holds in-process callbacks that
//! fire on the local broadcaster whenever their channels are notified.
//!
//! All interest updates funnel through [`ChannelBus::update_subscriptions`],
//! which removes the callback from every channel before adding it to the
//! new ones — when a method's channel list changes between invocations the
//! interest migrates without leaking stale entries.

use crate::context::Context;
use crate::registry::HandlerError;
use crate::session::SessionHandle;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Channel normalization
// ---------------------------------------------------------------------------

/// Normalize a channel list: trim, drop blanks, collapse duplicates.
/// The result is sorted, which keeps fan-out enumeration deterministic.
pub fn normalize_channels<I, S>(channels: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut set = BTreeSet::new();
    for channel in channels {
        let trimmed = channel.as_ref().trim();
        if !trimmed.is_empty() {
            set.insert(trimmed.to_owned());
        }
    }
    set.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Interest triples
// ---------------------------------------------------------------------------

/// One subscription's presence on a channel, as seen by fan-out.
#[derive(Clone)]
pub struct Interest {
    pub session: SessionHandle,
    pub client: String,
    pub callback: Option<String>,
}

type ClientInterests = HashMap<String, HashSet<Option<String>>>;

#[derive(Default)]
struct RemoteRegistry {
    /// channel -> socket -> client -> callback ids.
    channels: HashMap<String, HashMap<Uuid, ClientInterests>>,
    /// Socket id -> live session handle, for fan-out dispatch.
    sessions: HashMap<Uuid, SessionHandle>,
}

pub type LocalCallback =
    std::sync::Arc<dyn Fn(&Context) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Default)]
struct LocalRegistry {
    /// channel -> registration id + callback.
    channels: HashMap<String, Vec<(u64, LocalCallback)>>,
}

// ---------------------------------------------------------------------------
// ChannelBus
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ChannelBus {
    remote: Mutex<RemoteRegistry>,
    local: Mutex<LocalRegistry>,
    local_counter: AtomicU64,
}

impl ChannelBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a `(client, callback)` subscription to exactly `channels`:
    /// remove it from every channel it currently appears on, then add it to
    /// each of the new ones.  Runs under one bus lock so readers never see
    /// a half-migrated interest set.
    pub fn update_subscriptions(
        &self,
        session: &SessionHandle,
        client: &str,
        callback: Option<&str>,
        channels: &[String],
    ) {
        let socket = session.id();
        let mut registry = self.remote.lock().expect("channel bus lock");

        registry.channels.retain(|_, sockets| {
            if let Some(clients) = sockets.get_mut(&socket) {
                if let Some(callbacks) = clients.get_mut(client) {
                    callbacks.remove(&callback.map(ToOwned::to_owned));
                    if callbacks.is_empty() {
                        clients.remove(client);
                    }
                }
                if clients.is_empty() {
                    sockets.remove(&socket);
                }
            }
            !sockets.is_empty()
        });

        if !channels.is_empty() {
            registry.sessions.entry(socket).or_insert_with(|| session.clone());
        }
        for channel in channels {
            registry
                .channels
                .entry(channel.clone())
                .or_default()
                .entry(socket)
                .or_default()
                .entry(client.to_owned())
                .or_default()
                .insert(callback.map(ToOwned::to_owned));
        }
    }

    /// Drop every interest a client holds on a socket, on every channel.
    pub fn remove_client(&self, socket: Uuid, client: &str) {
        let mut registry = self.remote.lock().expect("channel bus lock");
        registry.channels.retain(|_, sockets| {
            if let Some(clients) = sockets.get_mut(&socket) {
                clients.remove(client);
                if clients.is_empty() {
                    sockets.remove(&socket);
                }
            }
            !sockets.is_empty()
        });
    }

    /// Drop every interest referencing a socket; called on session close.
    pub fn purge_socket(&self, socket: Uuid) {
        let mut registry = self.remote.lock().expect("channel bus lock");
        registry.sessions.remove(&socket);
        registry.channels.retain(|_, sockets| {
            sockets.remove(&socket);
            !sockets.is_empty()
        });
    }

    /// All distinct interest triples across the named channels.
    pub fn interests(&self, channels: &[String]) -> Vec<Interest> {
        let registry = self.remote.lock().expect("channel bus lock");
        let mut triples: BTreeSet<(Uuid, String, Option<String>)> = BTreeSet::new();
        for channel in channels {
            let Some(sockets) = registry.channels.get(channel) else { continue };
            for (socket, clients) in sockets {
                for (client, callbacks) in clients {
                    for callback in callbacks {
                        triples.insert((*socket, client.clone(), callback.clone()));
                    }
                }
            }
        }
        triples
            .into_iter()
            .filter_map(|(socket, client, callback)| {
                registry
                    .sessions
                    .get(&socket)
                    .map(|session| Interest { session: session.clone(), client, callback })
            })
            .collect()
    }

    /// Channels on which a socket currently has any interest.  Used by
    /// invariant checks and tests.
    pub fn channels_for_socket(&self, socket: Uuid) -> Vec<String> {
        let registry = self.remote.lock().expect("channel bus lock");
        let mut channels: Vec<String> = registry
            .channels
            .iter()
            .filter(|(_, sockets)| sockets.contains_key(&socket))
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort();
        channels
    }

    /// Whether `(socket, client, callback)` is registered on any channel.
    pub fn has_interest(&self, socket: Uuid, client: &str, callback: Option<&str>) -> bool {
        let registry = self.remote.lock().expect("channel bus lock");
        registry.channels.values().any(|sockets| {
            sockets.get(&socket).is_some_and(|clients| {
                clients
                    .get(client)
                    .is_some_and(|callbacks| callbacks.contains(&callback.map(ToOwned::to_owned)))
            })
        })
    }

    // -----------------------------------------------------------------------
    // Local callbacks
    // -----------------------------------------------------------------------

    /// Register an in-process callback fired whenever any of `channels` is
    /// notified.  Returns a registration id.
    pub fn subscribe_local<I, S>(&self, channels: I, callback: LocalCallback) -> u64
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let id = self.local_counter.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.local.lock().expect("local registry lock");
        for channel in normalize_channels(channels) {
            registry.channels.entry(channel).or_default().push((id, callback.clone()));
        }
        id
    }

    /// The distinct local callbacks registered across the named channels.
    /// A callback registered on several of them fires once.
    pub fn local_callbacks(&self, channels: &[String]) -> Vec<LocalCallback> {
        let registry = self.local.lock().expect("local registry lock");
        let mut seen = HashSet::new();
        let mut callbacks = Vec::new();
        for channel in channels {
            let Some(entries) = registry.channels.get(channel) else { continue };
            for (id, callback) in entries {
                if seen.insert(*id) {
                    callbacks.push(callback.clone());
                }
            }
        }
        callbacks
    }
}
