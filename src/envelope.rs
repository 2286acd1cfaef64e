//! Wire envelope shared with the remote endpoint.

use crate::codec;
use crate::error::CodecError;
use crate::handle::RawMessage;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Signature identifying messages that belong to this protocol.
pub const IPC_EVENT_SIGNATURE: &str = "heXeo-ipc";

/// One event as it travels over the raw channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub magic: String,
    #[serde(rename = "eventName")]
    pub event_name: String,
    /// Enhanced JSON text of the argument list
    pub data: String,
}

/// Result of inspecting a raw message.
#[derive(Debug, PartialEq)]
pub enum Inspection {
    /// Carries our signature and a well-formed body.
    Event(Envelope),
    /// Traffic of some other protocol sharing the channel.
    Foreign,
    /// Carries our signature but the body is unusable.
    Malformed(&'static str),
}

impl Envelope {
    /// Wrap an argument list for `event_name`.
    pub fn new(event_name: impl Into<String>, args: &[Value]) -> Self {
        Self {
            magic: IPC_EVENT_SIGNATURE.to_string(),
            event_name: event_name.into(),
            data: codec::stringify(args),
        }
    }

    /// Decode the argument list carried in `data`.
    pub fn args(&self) -> Result<Vec<Value>, CodecError> {
        codec::parse(&self.data)
    }

    /// Convert to the structured record handed to the transport.
    pub fn into_message(self) -> RawMessage {
        let mut record = serde_json::Map::new();
        record.insert("magic".to_string(), RawMessage::String(self.magic));
        record.insert("eventName".to_string(), RawMessage::String(self.event_name));
        record.insert("data".to_string(), RawMessage::String(self.data));
        RawMessage::Object(record)
    }

    /// Classify a raw message received from the channel.
    pub fn inspect(message: &RawMessage) -> Inspection {
        let record = match message.as_object() {
            Some(record) => record,
            None => return Inspection::Foreign,
        };
        if record.get("magic").and_then(RawMessage::as_str) != Some(IPC_EVENT_SIGNATURE) {
            return Inspection::Foreign;
        }

        match Envelope::deserialize(message) {
            Ok(envelope) => Inspection::Event(envelope),
            Err(e) => {
                log::debug!("Envelope body rejected: {}", e);
                Inspection::Malformed("eventName or data is missing or not a string")
            }
        }
    }
}
