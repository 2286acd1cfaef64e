//! Configuration for pipe-backed handles.

/// Default upper bound for a single inbound line (16 MiB)
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Settings applied to a [`ProcessHandle`](crate::ProcessHandle).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleConfig {
    /// Inbound lines longer than this are dropped with a warning.
    pub max_message_bytes: usize,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl HandleConfig {
    pub fn with_max_message_bytes(mut self, max_message_bytes: usize) -> Self {
        self.max_message_bytes = max_message_bytes;
        self
    }
}
