//! # Connection
//!
//! One upgraded transport, driven by a dedicated task.
//!
//! The driver owns the socket and the frame assembler. It multiplexes four
//! sources in a single `select!` loop: queued outbound messages, control
//! requests (close, ping), inbound frames and the heartbeat timer. Only the
//! driver writes, and it empties the outbound queue before acting on a control
//! request, so writes to one connection leave in submission order, close frame
//! included. Nothing orders writes across connections.
//!
//! The application talks to a connection through a cloneable
//! [`ConnectionHandle`] and receives its notifications as
//! [`ConnectionEvent`]s on the [`Connection`] returned at attach time.
//!
//! Closing is synchronous with respect to channel membership: the connection
//! is unbound from every channel before the close frame is flushed, so a
//! later broadcast never selects it.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

use crate::config::ConnectionConfig;
use crate::core::assembler::Incoming;
use crate::core::close::{parse_close_payload, CloseCode};
use crate::core::codec::WebSocketCodec;
use crate::core::frame::{Frame, OpCode};
use crate::error::{ProtocolError, Result};
use crate::protocol::host::HostShared;
use crate::protocol::message::{Message, Mode};
use crate::transport::upgrade::UpgradeRequest;
use crate::utils::metrics::global_metrics;
use crate::utils::sync::lock;
use crate::utils::timeout::with_timeout;

pub type ConnectionId = u64;

/// Frames of one logical message, shared between broadcast recipients.
pub(crate) type Batch = Arc<[Frame]>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Notifications raised by a connection, in the order they happened.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A complete message from the peer.
    Message(Message),
    /// Something went wrong. Fatal errors are followed by `Close`.
    Error(ProtocolError),
    /// The connection is gone. Always the last event.
    Close { code: Option<u16>, reason: String },
}

#[derive(Debug)]
enum Control {
    Close { code: Option<u16>, reason: String },
    Ping(Bytes),
}

struct Shared {
    id: ConnectionId,
    mode: Mode,
    max_frame_payload: usize,
    pong_timeout: Duration,
    request: UpgradeRequest,
    outbound: mpsc::Sender<Batch>,
    control: mpsc::UnboundedSender<Control>,
    closing: AtomicBool,
    close_status: Mutex<Option<u16>>,
    channels: Mutex<HashSet<String>>,
    pong_waiters: Mutex<Vec<oneshot::Sender<Bytes>>>,
    host: Weak<HostShared>,
}

/// Cloneable reference to a live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("mode", &self.shared.mode)
            .field("closing", &self.is_closing())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn mode(&self) -> Mode {
        self.shared.mode
    }

    /// The upgrade request this connection was created from.
    pub fn request(&self) -> &UpgradeRequest {
        &self.shared.request
    }

    /// Whether `close` has started; a closing connection accepts no writes.
    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
    }

    /// Status code from the peer's close frame, once one arrived.
    pub fn close_status(&self) -> Option<u16> {
        *lock(&self.shared.close_status)
    }

    /// Names of the channels this connection is bound to.
    pub fn channels(&self) -> Vec<String> {
        lock(&self.shared.channels).iter().cloned().collect()
    }

    pub fn in_channel(&self, name: &str) -> bool {
        lock(&self.shared.channels).contains(name)
    }

    /// Queue a message, waiting while the outbound queue is full.
    pub async fn send(&self, message: impl Into<Message>) -> Result<()> {
        let batch = self.prepare(&message.into())?;
        if self.is_closing() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.shared
            .outbound
            .send(batch)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Queue a message without waiting; fails with `Backpressure` when full.
    pub fn try_send(&self, message: impl Into<Message>) -> Result<()> {
        let batch = self.prepare(&message.into())?;
        self.enqueue(batch)
    }

    /// Send a ping and wait for the next pong. Returns the round-trip time.
    pub async fn ping(&self) -> Result<Duration> {
        if self.is_closing() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pong_waiters).push(tx);

        let started = Instant::now();
        self.shared
            .control
            .send(Control::Ping(Bytes::new()))
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        with_timeout(rx, self.shared.pong_timeout)
            .await?
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        Ok(started.elapsed())
    }

    /// Close the connection. Idempotent.
    ///
    /// Membership in every channel is dropped before this returns; the close
    /// frame is flushed by the driver afterwards.
    #[instrument(skip_all, fields(conn_id = self.shared.id))]
    pub fn close(&self, code: Option<u16>, reason: &str) {
        if !self.begin_close() {
            return;
        }
        let code = match code {
            Some(code) if !CloseCode::is_valid(code) => {
                warn!(code, "Close status not sendable, using 1000");
                Some(CloseCode::NORMAL)
            }
            other => other,
        };
        debug!(?code, reason, "Close requested");
        let _ = self.shared.control.send(Control::Close {
            code,
            reason: reason.to_string(),
        });
    }

    /// Mark the connection closing and detach it. Returns false if it already was.
    pub(crate) fn begin_close(&self) -> bool {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return false;
        }
        match self.shared.host.upgrade() {
            Some(host) => host.detach(self),
            None => lock(&self.shared.channels).clear(),
        }
        true
    }

    pub(crate) fn enqueue(&self, batch: Batch) -> Result<()> {
        if self.is_closing() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.shared.outbound.try_send(batch).map_err(|e| match e {
            TrySendError::Full(_) => ProtocolError::Backpressure,
            TrySendError::Closed(_) => ProtocolError::ConnectionClosed,
        })
    }

    /// Connection side of a channel edge. Refused once closing has begun.
    pub(crate) fn join_channel(&self, name: &str) -> bool {
        let mut channels = lock(&self.shared.channels);
        if self.is_closing() {
            return false;
        }
        channels.insert(name.to_string());
        true
    }

    pub(crate) fn leave_channel(&self, name: &str) -> bool {
        lock(&self.shared.channels).remove(name)
    }

    fn prepare(&self, message: &Message) -> Result<Batch> {
        Ok(message
            .to_frames(self.shared.mode, self.shared.max_frame_payload)?
            .into())
    }

    fn set_close_status(&self, code: Option<u16>) {
        *lock(&self.shared.close_status) = code;
    }

    fn resolve_pongs(&self, payload: &Bytes) {
        for waiter in lock(&self.shared.pong_waiters).drain(..) {
            let _ = waiter.send(payload.clone());
        }
    }

    fn drop_pong_waiters(&self) {
        lock(&self.shared.pong_waiters).clear();
    }

    /// Whether this connection was attached through the host behind `host`.
    pub(crate) fn attached_to(&self, host: &Weak<HostShared>) -> bool {
        Weak::ptr_eq(&self.shared.host, host)
    }

    pub(crate) fn ptr_eq(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Handle with no driver; the receiver sees every queued batch.
    #[cfg(test)]
    pub(crate) fn detached(mode: Mode, queue: usize) -> (Self, mpsc::Receiver<Batch>) {
        let (outbound, rx) = mpsc::channel(queue);
        let (control, _) = mpsc::unbounded_channel();
        let handle = Self {
            shared: Arc::new(Shared {
                id: next_connection_id(),
                mode,
                max_frame_payload: crate::config::MAX_FRAME_PAYLOAD,
                pong_timeout: Duration::from_secs(1),
                request: UpgradeRequest::default(),
                outbound,
                control,
                closing: AtomicBool::new(false),
                close_status: Mutex::new(None),
                channels: Mutex::new(HashSet::new()),
                pong_waiters: Mutex::new(Vec::new()),
                host: Weak::new(),
            }),
        };
        (handle, rx)
    }
}

/// An attached connection: its handle plus its notification stream.
#[derive(Debug)]
pub struct Connection {
    handle: ConnectionHandle,
    events: mpsc::Receiver<ConnectionEvent>,
}

impl Connection {
    /// Drive `io` as a connection that belongs to no host.
    ///
    /// Must be called within a tokio runtime.
    pub fn standalone<T>(io: T, request: UpgradeRequest, config: &ConnectionConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(io, request, config, Weak::new())
    }

    pub(crate) fn spawn<T>(
        io: T,
        request: UpgradeRequest,
        config: &ConnectionConfig,
        host: Weak<HostShared>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = next_connection_id();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));

        info!(conn_id = id, path = %request.path, mode = ?config.mode, role = ?config.role, "Connection attached");

        let handle = ConnectionHandle {
            shared: Arc::new(Shared {
                id,
                mode: config.mode,
                max_frame_payload: config.max_frame_payload,
                pong_timeout: config.pong_timeout,
                request,
                outbound: outbound_tx,
                control: control_tx,
                closing: AtomicBool::new(false),
                close_status: Mutex::new(None),
                channels: Mutex::new(HashSet::new()),
                pong_waiters: Mutex::new(Vec::new()),
                host: host.clone(),
            }),
        };

        let driver = Driver {
            framed: Framed::new(io, WebSocketCodec::new(config.role, config.max_message_size)),
            handle: handle.clone(),
            outbound: outbound_rx,
            control: control_rx,
            events: events_tx,
            heartbeat_interval: config.heartbeat_interval,
            idle_timeout: config.idle_timeout,
            close_timeout: config.close_timeout,
            last_activity: Instant::now(),
            close_sent: false,
            host,
        };
        global_metrics().connection_established();
        tokio::spawn(driver.run());

        Self {
            handle,
            events: events_rx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Next notification; `None` once the driver is gone and all were read.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (ConnectionHandle, mpsc::Receiver<ConnectionEvent>) {
        (self.handle, self.events)
    }

    /// Notifications as a `Stream`.
    pub fn into_stream(self) -> (ConnectionHandle, ReceiverStream<ConnectionEvent>) {
        (self.handle, ReceiverStream::new(self.events))
    }
}

enum Outcome {
    Closed { code: Option<u16>, reason: String },
    Failed(ProtocolError),
}

struct Driver<T> {
    framed: Framed<T, WebSocketCodec>,
    handle: ConnectionHandle,
    outbound: mpsc::Receiver<Batch>,
    control: mpsc::UnboundedReceiver<Control>,
    events: mpsc::Sender<ConnectionEvent>,
    heartbeat_interval: Duration,
    idle_timeout: Duration,
    close_timeout: Duration,
    last_activity: Instant,
    close_sent: bool,
    host: Weak<HostShared>,
}

impl<T> Driver<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) {
        let period = self.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;

                Some(batch) = self.outbound.recv() => {
                    if let Err(e) = self.write_batch(&batch).await {
                        break Outcome::Failed(e);
                    }
                }
                Some(control) = self.control.recv() => {
                    // Writes accepted before the request go out first.
                    if let Err(e) = self.drain_outbound().await {
                        break Outcome::Failed(e);
                    }
                    let step = match control {
                        Control::Close { code, reason } => Some(self.close_gracefully(code, reason).await),
                        Control::Ping(payload) => self.write(Frame::ping(payload)).await.err().map(Outcome::Failed),
                    };
                    if let Some(outcome) = step {
                        break outcome;
                    }
                }
                inbound = self.framed.next() => {
                    let step = match inbound {
                        Some(Ok(incoming)) => self.dispatch(incoming).await,
                        Some(Err(e)) => Some(Outcome::Failed(e)),
                        None => Some(Outcome::Failed(ProtocolError::TransportError(
                            "peer closed the transport without a close frame".to_string(),
                        ))),
                    };
                    if let Some(outcome) = step {
                        break outcome;
                    }
                }
                _ = heartbeat.tick() => {
                    if self.last_activity.elapsed() >= self.idle_timeout {
                        break Outcome::Failed(ProtocolError::Timeout);
                    }
                    if let Err(e) = self.write(Frame::ping(Bytes::new())).await {
                        break Outcome::Failed(e);
                    }
                }
            }
        };

        self.teardown(outcome).await;
    }

    async fn dispatch(&mut self, incoming: Incoming) -> Option<Outcome> {
        self.last_activity = Instant::now();
        let conn_id = self.handle.id();

        let frame = match incoming {
            Incoming::Control(frame) => frame,
            data => {
                let size = match &data {
                    Incoming::Text(text) => text.len(),
                    Incoming::Binary(bytes) => bytes.len(),
                    Incoming::Control(frame) => frame.payload.len(),
                };
                global_metrics().frame_received(size as u64);

                match Message::parse(data, self.handle.mode()) {
                    Ok(Some(message)) => {
                        let _ = self.events.send(ConnectionEvent::Message(message)).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(conn_id, error = %e, "Dropping malformed message");
                        let _ = self.events.send(ConnectionEvent::Error(e)).await;
                    }
                }
                return None;
            }
        };

        global_metrics().frame_received(frame.len());
        match frame.opcode {
            OpCode::Ping => self.write(Frame::pong(frame.payload)).await.err().map(Outcome::Failed),
            OpCode::Pong => {
                self.handle.resolve_pongs(&frame.payload);
                None
            }
            OpCode::Close => Some(self.on_peer_close(&frame.payload).await),
            _ => None,
        }
    }

    async fn on_peer_close(&mut self, payload: &[u8]) -> Outcome {
        let close = match parse_close_payload(payload) {
            Ok(close) => close,
            Err(e) => return Outcome::Failed(e),
        };
        let code = close.as_ref().map(|c| c.code);
        let reason = close.map(|c| c.reason).unwrap_or_default();
        debug!(conn_id = self.handle.id(), ?code, "Peer sent close");

        self.handle.set_close_status(code);
        self.handle.begin_close();
        if !self.close_sent {
            let echo = code.unwrap_or(CloseCode::NORMAL);
            if let Err(e) = self.send_close(Some(echo), "").await {
                debug!(conn_id = self.handle.id(), error = %e, "Close reply not flushed");
            }
        }
        Outcome::Closed { code, reason }
    }

    async fn close_gracefully(&mut self, code: Option<u16>, reason: String) -> Outcome {
        if let Err(e) = self.send_close(code, &reason).await {
            return Outcome::Failed(e);
        }
        let limit = self.close_timeout;
        if with_timeout(self.await_close_reply(), limit).await.is_err() {
            debug!(conn_id = self.handle.id(), "Peer did not answer close in time");
        }
        Outcome::Closed { code, reason }
    }

    async fn await_close_reply(&mut self) {
        while let Some(Ok(incoming)) = self.framed.next().await {
            if let Incoming::Control(frame) = incoming {
                if frame.opcode == OpCode::Close {
                    if let Ok(Some(close)) = parse_close_payload(&frame.payload) {
                        self.handle.set_close_status(Some(close.code));
                    }
                    return;
                }
            }
        }
    }

    async fn send_close(&mut self, code: Option<u16>, reason: &str) -> Result<()> {
        if self.close_sent {
            return Ok(());
        }
        self.close_sent = true;
        self.write(Frame::close(code, reason)).await
    }

    async fn write(&mut self, frame: Frame) -> Result<()> {
        let size = frame.encoded_len() as u64;
        self.framed.send(frame).await?;
        global_metrics().frame_sent(size);
        Ok(())
    }

    async fn drain_outbound(&mut self) -> Result<()> {
        while let Ok(batch) = self.outbound.try_recv() {
            self.write_batch(&batch).await?;
        }
        Ok(())
    }

    async fn write_batch(&mut self, batch: &[Frame]) -> Result<()> {
        for frame in batch {
            let size = frame.encoded_len() as u64;
            self.framed.feed(frame.clone()).await?;
            global_metrics().frame_sent(size);
        }
        SinkExt::<Frame>::flush(&mut self.framed).await
    }

    async fn teardown(mut self, outcome: Outcome) {
        let conn_id = self.handle.id();
        // Unbind before anything else goes out.
        self.handle.begin_close();

        let (code, reason) = match outcome {
            Outcome::Closed { code, reason } => {
                info!(conn_id, ?code, "Connection closed");
                (code, reason)
            }
            Outcome::Failed(err) => {
                let code = err.close_code();
                let reason = err.close_reason().to_string();
                match code {
                    Some(code) => {
                        global_metrics().protocol_error();
                        warn!(conn_id, code, error = %err, "Closing connection after error");
                        if let Err(e) = self.send_close(Some(code), &reason).await {
                            debug!(conn_id, error = %e, "Close frame not flushed");
                        }
                    }
                    None => {
                        global_metrics().transport_error();
                        warn!(conn_id, error = %err, "Transport failed");
                    }
                }
                let _ = self.events.send(ConnectionEvent::Error(err)).await;
                (Some(code.unwrap_or(CloseCode::ABNORMAL)), reason)
            }
        };

        self.handle.drop_pong_waiters();
        let _ = self.events.send(ConnectionEvent::Close { code, reason }).await;
        if let Err(e) = SinkExt::<Frame>::close(&mut self.framed).await {
            debug!(conn_id, error = %e, "Transport shutdown failed");
        }

        global_metrics().connection_closed();
        if let Some(host) = self.host.upgrade() {
            host.driver_finished();
        }
    }
}
