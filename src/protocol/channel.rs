//! # Channels
//!
//! Named groups of connections, created lazily by the [`Host`](super::host::Host).
//!
//! Membership is a two-sided edge: the channel holds the connection's handle
//! and the connection holds the channel's name. Both sides change together
//! under the channel's member lock (channel lock first, connection lock
//! second), and a connection that has started closing can no longer join.
//!
//! A channel configured with `close_when_empty` closes itself as soon as the
//! last member leaves, removing itself from the host registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::protocol::broadcast::Broadcaster;
use crate::protocol::connection::{ConnectionHandle, ConnectionId};
use crate::protocol::host::HostShared;
use crate::protocol::message::{Message, Mode};
use crate::utils::sync::{read, write};

/// Membership and lifecycle notifications of a channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Bind(ConnectionId),
    Unbind(ConnectionId),
    /// One per broadcast, carrying the message before any filtering.
    Broadcast(Message),
    Close,
}

struct ChannelInner {
    name: String,
    mode: Mode,
    max_frame_payload: usize,
    close_when_empty: bool,
    host: Weak<HostShared>,
    members: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    closed: AtomicBool,
    events: broadcast::Sender<ChannelEvent>,
}

/// Cloneable handle to a named channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("members", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(name: &str, host: Weak<HostShared>, config: &EngineConfig) -> Self {
        let (events, _) = broadcast::channel(config.channel.event_capacity.max(1));
        Self {
            inner: Arc::new(ChannelInner {
                name: name.to_string(),
                mode: config.connection.mode,
                max_frame_payload: config.connection.max_frame_payload,
                close_when_empty: config.channel.close_when_empty,
                host,
                members: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        read(&self.inner.members).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        read(&self.inner.members).contains_key(&id)
    }

    pub fn member_ids(&self) -> Vec<ConnectionId> {
        read(&self.inner.members).keys().copied().collect()
    }

    /// Receive this channel's notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Add the membership edge. Returns false if it already existed, if
    /// either the channel or the connection is closing, or if the connection
    /// was not attached through this channel's host.
    pub fn bind(&self, conn: &ConnectionHandle) -> bool {
        if !conn.attached_to(&self.inner.host) {
            debug!(channel = %self.inner.name, conn_id = conn.id(), "Refusing connection from another host");
            return false;
        }
        {
            let mut members = write(&self.inner.members);
            if self.is_closed() || members.contains_key(&conn.id()) {
                return false;
            }
            if !conn.join_channel(&self.inner.name) {
                return false;
            }
            members.insert(conn.id(), conn.clone());
        }

        debug!(channel = %self.inner.name, conn_id = conn.id(), "Connection bound");
        self.emit(ChannelEvent::Bind(conn.id()));
        true
    }

    /// Remove the membership edge. Returns false if there was none.
    pub fn unbind(&self, conn: &ConnectionHandle) -> bool {
        let now_empty = {
            let mut members = write(&self.inner.members);
            match members.get(&conn.id()) {
                Some(member) if member.ptr_eq(conn) => {}
                _ => return false,
            }
            members.remove(&conn.id());
            conn.leave_channel(&self.inner.name);
            members.is_empty()
        };

        debug!(channel = %self.inner.name, conn_id = conn.id(), "Connection unbound");
        self.emit(ChannelEvent::Unbind(conn.id()));

        if now_empty && self.inner.close_when_empty {
            self.close();
        }
        true
    }

    /// Unbind every member, leave the host registry, then emit `Close`. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let members = std::mem::take(&mut *write(&self.inner.members));
        for (id, conn) in &members {
            conn.leave_channel(&self.inner.name);
            self.emit(ChannelEvent::Unbind(*id));
        }

        if let Some(host) = self.inner.host.upgrade() {
            host.remove_channel(self);
        }

        info!(channel = %self.inner.name, members = members.len(), "Channel closed");
        self.emit(ChannelEvent::Close);
    }

    pub(crate) fn ptr_eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn emit(&self, event: ChannelEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

impl Broadcaster for Channel {
    fn members(&self) -> Vec<ConnectionHandle> {
        read(&self.inner.members).values().cloned().collect()
    }

    fn mode(&self) -> Mode {
        self.inner.mode
    }

    fn max_frame_payload(&self) -> usize {
        self.inner.max_frame_payload
    }

    fn notify_broadcast(&self, message: &Message) {
        self.emit(ChannelEvent::Broadcast(message.clone()));
    }
}
