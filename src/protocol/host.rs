//! # Host
//!
//! Owner of every live connection and named channel.
//!
//! The host keeps two registries: connections by id and channels by name.
//! Connections hold only a weak reference back to it, so dropping the last
//! `Host` clone does not keep drivers alive artificially, and a connection
//! that outlives its host simply detaches with nothing to clean up.
//!
//! The host is itself a [`Broadcaster`] over all connected sockets.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::broadcast::Broadcaster;
use crate::protocol::channel::Channel;
use crate::protocol::connection::{Connection, ConnectionHandle, ConnectionId};
use crate::protocol::message::{Message, Mode};
use crate::transport::upgrade::UpgradeRequest;
use crate::utils::sync::{read, write};

/// Host-wide notifications.
#[derive(Debug, Clone)]
pub enum HostEvent {
    Connected(ConnectionId),
    Disconnected(ConnectionId),
    Broadcast(Message),
    ChannelCreated(String),
    ChannelClosed(String),
}

pub(crate) struct HostShared {
    config: EngineConfig,
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    channels: RwLock<HashMap<String, Channel>>,
    events: broadcast::Sender<HostEvent>,
    live_drivers: AtomicUsize,
    drained: Notify,
}

impl HostShared {
    /// Drop `conn` from the registry and from every channel it belongs to.
    pub(crate) fn detach(&self, conn: &ConnectionHandle) {
        let removed = {
            let mut connections = write(&self.connections);
            match connections.get(&conn.id()) {
                Some(known) if known.ptr_eq(conn) => connections.remove(&conn.id()).is_some(),
                _ => false,
            }
        };

        for name in conn.channels() {
            let channel = read(&self.channels).get(&name).cloned();
            match channel {
                Some(channel) => {
                    channel.unbind(conn);
                }
                None => {
                    conn.leave_channel(&name);
                }
            }
        }

        if removed {
            debug!(conn_id = conn.id(), "Connection detached");
            let _ = self.events.send(HostEvent::Disconnected(conn.id()));
        }
    }

    /// Forget `channel`, unless the name already points at a newer one.
    pub(crate) fn remove_channel(&self, channel: &Channel) {
        let removed = {
            let mut channels = write(&self.channels);
            match channels.get(channel.name()) {
                Some(current) if current.ptr_eq(channel) => channels.remove(channel.name()).is_some(),
                _ => false,
            }
        };
        if removed {
            let _ = self.events.send(HostEvent::ChannelClosed(channel.name().to_string()));
        }
    }

    pub(crate) fn driver_finished(&self) {
        if self.live_drivers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// Cloneable handle to the connection and channel registries.
#[derive(Clone)]
pub struct Host {
    shared: Arc<HostShared>,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("connections", &self.len())
            .field("channels", &read(&self.shared.channels).len())
            .finish()
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Host {
    pub fn new(config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(config.channel.event_capacity.max(1));
        Self {
            shared: Arc::new(HostShared {
                config,
                connections: RwLock::new(HashMap::new()),
                channels: RwLock::new(HashMap::new()),
                events,
                live_drivers: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Attach an upgraded transport and start driving it.
    ///
    /// Fails with `ConnectionLimit` when `server.max_connections` sockets are
    /// already registered. Must be called within a tokio runtime.
    #[instrument(skip_all, fields(path = %request.path))]
    pub fn accept<T>(&self, io: T, request: UpgradeRequest) -> Result<Connection>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let limit = self.shared.config.server.max_connections;
        let (connection, handle) = {
            // Count and insert under one guard so concurrent accepts cannot overshoot.
            let mut connections = write(&self.shared.connections);
            if connections.len() >= limit {
                drop(connections);
                warn!(limit, "Connection limit reached, rejecting upgrade");
                return Err(ProtocolError::ConnectionLimit(limit));
            }

            self.shared.live_drivers.fetch_add(1, Ordering::SeqCst);
            let connection = Connection::spawn(
                io,
                request,
                &self.shared.config.connection,
                Arc::downgrade(&self.shared),
            );
            let handle = connection.handle().clone();
            connections.insert(handle.id(), handle.clone());
            (connection, handle)
        };

        // The driver may already have torn down before the insert above.
        if handle.is_closing() {
            self.shared.detach(&handle);
        } else {
            let _ = self.shared.events.send(HostEvent::Connected(handle.id()));
        }
        Ok(connection)
    }

    /// Existing channel for `name`, or a new empty one.
    pub fn channel(&self, name: &str) -> Channel {
        self.channel_with(name, |_| false)
    }

    /// Existing channel for `name`; when it has to be created, every
    /// connected socket matching `filter` is bound to it.
    pub fn channel_with<F>(&self, name: &str, filter: F) -> Channel
    where
        F: Fn(&ConnectionHandle) -> bool,
    {
        if let Some(channel) = read(&self.shared.channels).get(name) {
            return channel.clone();
        }

        let channel = {
            let mut channels = write(&self.shared.channels);
            if let Some(existing) = channels.get(name) {
                return existing.clone();
            }
            let channel = Channel::new(name, Arc::downgrade(&self.shared), &self.shared.config);
            channels.insert(name.to_string(), channel.clone());
            channel
        };

        info!(channel = name, "Channel created");
        let _ = self.shared.events.send(HostEvent::ChannelCreated(name.to_string()));

        let candidates: Vec<ConnectionHandle> = read(&self.shared.connections).values().cloned().collect();
        for conn in candidates.iter().filter(|c| filter(c)) {
            channel.bind(conn);
        }
        channel
    }

    /// Channel for `name` if it exists; never creates one.
    pub fn get_channel(&self, name: &str) -> Option<Channel> {
        read(&self.shared.channels).get(name).cloned()
    }

    pub fn channel_names(&self) -> Vec<String> {
        read(&self.shared.channels).keys().cloned().collect()
    }

    /// Close and forget the named channel. Returns false if it did not exist.
    pub fn close_channel(&self, name: &str) -> bool {
        match self.get_channel(name) {
            Some(channel) => {
                channel.close();
                true
            }
            None => false,
        }
    }

    pub fn connection(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        read(&self.shared.connections).get(&id).cloned()
    }

    pub fn connections(&self) -> Vec<ConnectionHandle> {
        read(&self.shared.connections).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        read(&self.shared.connections).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drivers still running, including connections that are mid-close.
    pub fn live_drivers(&self) -> usize {
        self.shared.live_drivers.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.shared.events.subscribe()
    }

    /// Close every registered connection with the same status.
    pub fn close_all(&self, code: u16, reason: &str) {
        let connections = self.connections();
        info!(count = connections.len(), code, "Closing all connections");
        for conn in connections {
            conn.close(Some(code), reason);
        }
    }

    /// Wait until every driver has finished. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let drained = self.shared.drained.notified();
            if self.live_drivers() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                return self.live_drivers() == 0;
            }
        }
    }
}

impl Broadcaster for Host {
    fn members(&self) -> Vec<ConnectionHandle> {
        self.connections()
    }

    fn mode(&self) -> Mode {
        self.shared.config.connection.mode
    }

    fn max_frame_payload(&self) -> usize {
        self.shared.config.connection.max_frame_payload
    }

    fn notify_broadcast(&self, message: &Message) {
        let _ = self.shared.events.send(HostEvent::Broadcast(message.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_is_created_lazily_once() {
        let host = Host::default();
        assert!(host.get_channel("room").is_none());

        let first = host.channel("room");
        let second = host.channel("room");
        assert!(first.ptr_eq(&second));
        assert_eq!(host.channel_names(), vec!["room".to_string()]);
    }

    #[test]
    fn closed_channel_leaves_registry() {
        let host = Host::default();
        let mut events = host.subscribe();
        let room = host.channel("room");

        assert!(host.close_channel("room"));
        assert!(room.is_closed());
        assert!(host.get_channel("room").is_none());
        assert!(!host.close_channel("room"));

        assert!(matches!(events.try_recv(), Ok(HostEvent::ChannelCreated(n)) if n == "room"));
        assert!(matches!(events.try_recv(), Ok(HostEvent::ChannelClosed(n)) if n == "room"));
    }

    #[test]
    fn recreated_channel_is_a_new_instance() {
        let host = Host::default();
        let old = host.channel("room");
        old.close();
        let new = host.channel("room");
        assert!(!old.ptr_eq(&new));
        assert!(!new.is_closed());
    }

    #[tokio::test]
    async fn wait_idle_without_connections_returns_immediately() {
        let host = Host::default();
        assert!(host.wait_idle(Duration::from_millis(10)).await);
    }
}
