//! # Broadcast
//!
//! Fan-out of one message to a group of connections.
//!
//! The message is formatted and chunked once into a [`PreparedMessage`]; every
//! recipient queues the same shared frames. Delivery never waits: a member
//! whose outbound queue is full or closed misses this message, which is
//! logged and counted, and the rest of the group still gets it.
//!
//! The member set is snapshotted before iterating, so connections binding or
//! closing mid-broadcast neither block it nor see a half-formed list.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::frame::Frame;
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::{ConnectionHandle, ConnectionId};
use crate::protocol::message::{Message, Mode};
use crate::utils::metrics::global_metrics;

/// A message formatted for one mode and split into frames, ready to share.
#[derive(Debug, Clone)]
pub struct PreparedMessage {
    message: Message,
    frames: Arc<[Frame]>,
}

impl PreparedMessage {
    pub fn new(message: Message, mode: Mode, max_frame_payload: usize) -> Result<Self> {
        let frames = message.to_frames(mode, max_frame_payload)?.into();
        Ok(Self { message, frames })
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Members selected by the filter.
    pub recipients: usize,
    /// Members whose queue accepted the message.
    pub delivered: usize,
    /// Members that missed it.
    pub dropped: usize,
}

/// A group of connections that can be written to as one.
pub trait Broadcaster {
    /// Snapshot of the current members.
    fn members(&self) -> Vec<ConnectionHandle>;

    /// Mode used to format broadcast messages.
    fn mode(&self) -> Mode;

    fn max_frame_payload(&self) -> usize;

    /// Raised exactly once per broadcast, after delivery.
    fn notify_broadcast(&self, message: &Message);

    fn broadcast(&self, message: impl Into<Message>) -> Result<BroadcastReport>
    where
        Self: Sized,
    {
        self.broadcast_filtered(message, |_| true)
    }

    /// Send to the members `filter` selects.
    fn broadcast_filtered<F>(&self, message: impl Into<Message>, filter: F) -> Result<BroadcastReport>
    where
        Self: Sized,
        F: Fn(&ConnectionHandle) -> bool,
    {
        let prepared = PreparedMessage::new(message.into(), self.mode(), self.max_frame_payload())?;
        let report = deliver(&self.members(), &prepared, filter);
        self.notify_broadcast(prepared.message());
        Ok(report)
    }

    /// Send to every member except `sender`.
    fn broadcast_except(&self, message: impl Into<Message>, sender: ConnectionId) -> Result<BroadcastReport>
    where
        Self: Sized,
    {
        self.broadcast_filtered(message, |conn| conn.id() != sender)
    }
}

/// Queue `prepared` on every selected member that is not closing.
pub fn deliver<F>(members: &[ConnectionHandle], prepared: &PreparedMessage, filter: F) -> BroadcastReport
where
    F: Fn(&ConnectionHandle) -> bool,
{
    let mut report = BroadcastReport::default();
    for conn in members {
        if conn.is_closing() || !filter(conn) {
            continue;
        }
        report.recipients += 1;
        match conn.enqueue(prepared.frames.clone()) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                report.dropped += 1;
                let err = ProtocolError::ApplicationError(e.to_string());
                warn!(conn_id = conn.id(), error = %err, "Broadcast message dropped for member");
            }
        }
    }

    global_metrics().broadcast(report.dropped as u64);
    debug!(
        recipients = report.recipients,
        delivered = report.delivered,
        dropped = report.dropped,
        "Broadcast fanned out"
    );
    report
}
