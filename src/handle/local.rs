//! In-process handle: an event source with a pluggable send.

use super::{
    ChannelHandle, MessageEvents, RawMessage, SendCallback, Transport, DISCONNECT_EVENT,
    MESSAGE_EVENT,
};
use crate::error::TransportError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

/// A plain event source, optionally augmented with a send capability.
///
/// Without a transport the handle is an event source with no channel, which
/// an [`EventChannel`](crate::EventChannel) rejects. With [`LocalHandle::pair`]
/// two handles are wired to each other inside the same process.
pub struct LocalHandle {
    events: Arc<MessageEvents>,
    transport: Option<Arc<dyn Transport>>,
    // Stops the delivery task of a paired handle when it is dropped.
    _delivery: Option<DropGuard>,
}

impl LocalHandle {
    /// Event source only, no channel.
    pub fn new() -> Self {
        Self {
            events: Arc::new(MessageEvents::new()),
            transport: None,
            _delivery: None,
        }
    }

    /// Event source whose sends go through `send`.
    pub fn with_send<F>(send: F) -> Self
    where
        F: Fn(RawMessage, SendCallback) + Send + Sync + 'static,
    {
        Self::with_transport(Arc::new(FnTransport(send)))
    }

    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            events: Arc::new(MessageEvents::new()),
            transport: Some(transport),
            _delivery: None,
        }
    }

    /// Two handles connected to each other.
    ///
    /// Messages sent on one are delivered, in order, to the other's
    /// `"message"` listeners from a background task. When one side is dropped
    /// the other observes `"disconnect"`. Must be called within a tokio runtime.
    pub fn pair() -> (LocalHandle, LocalHandle) {
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let (right_tx, right_rx) = mpsc::unbounded_channel();

        let mut left = Self::with_transport(Arc::new(PeerTransport { peer: right_tx }));
        let mut right = Self::with_transport(Arc::new(PeerTransport { peer: left_tx }));

        left._delivery = Some(Self::spawn_delivery(left.events.clone(), left_rx));
        right._delivery = Some(Self::spawn_delivery(right.events.clone(), right_rx));

        (left, right)
    }

    /// Publish `message` to this handle's `"message"` listeners as if it had
    /// arrived from the peer. Returns true if anyone was listening.
    pub fn deliver(&self, message: RawMessage) -> bool {
        self.events.emit(MESSAGE_EVENT, &message)
    }

    fn spawn_delivery(
        events: Arc<MessageEvents>,
        mut inbound: mpsc::UnboundedReceiver<RawMessage>,
    ) -> DropGuard {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => {
                        log::debug!("Local handle dropped, stopping delivery");
                        return;
                    }
                    message = inbound.recv() => {
                        match message {
                            Some(message) => {
                                events.emit(MESSAGE_EVENT, &message);
                            }
                            None => break,
                        }
                    }
                }
            }
            log::debug!("Local peer dropped, channel disconnected");
            events.emit(DISCONNECT_EVENT, &RawMessage::Null);
        });

        token.drop_guard()
    }
}

impl Default for LocalHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelHandle for LocalHandle {
    fn events(&self) -> Option<&MessageEvents> {
        Some(&self.events)
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.clone()
    }
}

struct FnTransport<F>(F);

impl<F> Transport for FnTransport<F>
where
    F: Fn(RawMessage, SendCallback) + Send + Sync,
{
    fn send(&self, message: RawMessage, done: SendCallback) {
        (self.0)(message, done)
    }
}

struct PeerTransport {
    peer: mpsc::UnboundedSender<RawMessage>,
}

impl Transport for PeerTransport {
    fn send(&self, message: RawMessage, done: SendCallback) {
        match self.peer.send(message) {
            Ok(()) => done(Ok(())),
            Err(_) => done(Err(TransportError::ChannelClosed)),
        }
    }
}
