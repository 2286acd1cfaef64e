//! Channel handles: the raw endpoints an [`EventChannel`](crate::EventChannel) sits on.
//!
//! A handle has two capabilities, each optional:
//!
//! - an event source that publishes every inbound raw message under
//!   [`MESSAGE_EVENT`],
//! - a [`Transport`] that sends one raw message and reports the outcome
//!   through a completion callback.
//!
//! - [`ProcessHandle`]: newline-delimited JSON over process pipes
//! - [`LocalHandle`]: in-process event source with a pluggable send

pub mod local;
pub mod process;

pub use local::LocalHandle;
pub use process::ProcessHandle;

use crate::emitter::EventEmitter;
use crate::error::TransportError;
use std::sync::Arc;

/// Structured record as carried by the raw channel.
pub type RawMessage = serde_json::Value;

/// Event source of a handle, keyed by event name.
pub type MessageEvents = EventEmitter<RawMessage>;

/// Completion callback for [`Transport::send`].
pub type SendCallback = Box<dyn FnOnce(Result<(), TransportError>) + Send + 'static>;

/// Inbound raw messages are published under this name.
pub const MESSAGE_EVENT: &str = "message";

/// Published once when the channel to the peer closes.
pub const DISCONNECT_EVENT: &str = "disconnect";

/// Sending half of a channel.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Hand `message` to the channel. `done` must be called exactly once with
    /// the outcome; it may be called before `send` returns.
    fn send(&self, message: RawMessage, done: SendCallback);
}

/// Anything an event channel can be built on.
pub trait ChannelHandle: Send + Sync {
    /// Local event source, or `None` if the object cannot publish events.
    fn events(&self) -> Option<&MessageEvents>;

    /// Send capability, or `None` if no channel to the peer is open.
    fn transport(&self) -> Option<Arc<dyn Transport>>;

    /// Begin publishing inbound messages. Called once listeners are in place;
    /// handles that publish from the start need not override it.
    fn start(&self) {}
}
