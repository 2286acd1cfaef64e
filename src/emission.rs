//! Completion handle for a single outbound event.

use crate::error::{IpcError, TransportError};
use crate::handle::{RawMessage, Transport};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Resolves once the transport has reported the outcome of one send.
///
/// The message is already handed to the transport when the `Emission` is
/// created; awaiting only observes the outcome. Dropping it does not cancel
/// the send.
#[must_use = "an Emission reports transmission failures only when awaited"]
#[derive(Debug)]
pub struct Emission {
    outcome: oneshot::Receiver<Result<(), IpcError>>,
}

impl Emission {
    /// Hand `message` to `transport` and return the pending outcome.
    pub(crate) fn transmit(transport: &dyn Transport, message: RawMessage) -> Self {
        let (tx, rx) = oneshot::channel();
        transport.send(
            message,
            Box::new(move |outcome| {
                // The receiver may already be gone; nobody is waiting then.
                let _ = tx.send(outcome.map_err(IpcError::from));
            }),
        );
        Self { outcome: rx }
    }

    /// An emission that already failed before reaching the transport.
    pub(crate) fn failed(error: IpcError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self { outcome: rx }
    }
}

impl Future for Emission {
    type Output = Result<(), IpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.outcome).poll(cx).map(|received| match received {
            Ok(outcome) => outcome,
            Err(_) => Err(IpcError::Transport(TransportError::Abandoned)),
        })
    }
}
