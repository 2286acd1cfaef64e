//! Typed events over a raw inter-process message channel.
//!
//! An [`EventChannel`] wraps one [`ChannelHandle`] (the pipes to a child
//! process, the pipes to the parent, or an in-process [`LocalHandle`]) and
//! exposes publish/subscribe semantics over it. Every event travels as an
//! [`Envelope`] tagged with [`IPC_EVENT_SIGNATURE`], so other traffic on the
//! same channel passes through untouched.

pub mod channel;
pub mod codec;
pub mod config;
pub mod emission;
pub mod emitter;
pub mod envelope;
pub mod error;
pub mod handle;
pub mod value;

// 公開API
pub use channel::EventChannel;
pub use config::HandleConfig;
pub use emission::Emission;
pub use emitter::{EventEmitter, ListenerId};
pub use envelope::{Envelope, IPC_EVENT_SIGNATURE};
pub use error::{CodecError, IpcError, IpcResult, TransportError};
pub use handle::{
    ChannelHandle, LocalHandle, MessageEvents, ProcessHandle, RawMessage, SendCallback, Transport,
    DISCONNECT_EVENT, MESSAGE_EVENT,
};
pub use value::Value;
