//! Named events over a raw process channel.
//!
//! An [`EventChannel`] binds one local endpoint to one remote endpoint through
//! a pre-existing [`ChannelHandle`]. Outbound events are wrapped in an
//! [`Envelope`] and handed to the handle's transport; inbound raw messages are
//! checked for the envelope signature and dispatched to local listeners.
//!
//! ```rust,no_run
//! use hexeo_ipc::{args, EventChannel, ProcessHandle};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), hexeo_ipc::IpcError> {
//! let channel = EventChannel::new(Arc::new(ProcessHandle::stdio()))?;
//! channel.on("ping", |args| log::info!("ping with {} arguments", args.len()));
//! channel.emit("ready", args!["worker-1"]).await?;
//! # Ok(())
//! # }
//! ```

use crate::emission::Emission;
use crate::emitter::{EventEmitter, ListenerId};
use crate::envelope::{Envelope, Inspection};
use crate::error::{IpcError, IpcResult};
use crate::handle::{ChannelHandle, Transport, MESSAGE_EVENT};
use crate::value::Value;
use serde::Serialize;
use std::sync::Arc;

/// Listener registry keyed by event name, receiving decoded argument lists.
type Listeners = EventEmitter<[Value]>;

/// Event emitter whose `emit` crosses the process boundary.
pub struct EventChannel {
    handle: Arc<dyn ChannelHandle>,
    transport: Arc<dyn Transport>,
    listeners: Arc<Listeners>,
}

impl EventChannel {
    /// Validate `handle` and register for its raw messages.
    ///
    /// Fails with [`IpcError::InvalidProcessObject`] if the handle has no event
    /// source and with [`IpcError::IpcChannelNotFound`] if it has one but
    /// cannot send. The error details name the rejected handle type. Every
    /// channel built on the same handle registers its own raw listener and
    /// dispatches independently.
    pub fn new<H: ChannelHandle + 'static>(handle: Arc<H>) -> IpcResult<Self> {
        let handle_type = std::any::type_name::<H>();
        let handle: Arc<dyn ChannelHandle> = handle;

        let events = handle.events().ok_or_else(|| {
            IpcError::invalid_process_object(format!("{} has no event source", handle_type))
        })?;
        let transport = handle.transport().ok_or_else(|| {
            IpcError::ipc_channel_not_found(format!("{} has no open channel", handle_type))
        })?;

        let listeners = Arc::new(Listeners::new());
        let registry = listeners.clone();
        events.on(MESSAGE_EVENT, move |message| {
            Self::on_raw_message(&registry, message)
        });
        log::debug!("EventChannel attached to handle");

        Ok(Self {
            handle,
            transport,
            listeners,
        })
    }

    /// Send `event_name` with `args` to the remote endpoint.
    ///
    /// The envelope is handed to the transport before this returns, so
    /// successive calls reach the channel in call order. The returned
    /// [`Emission`] settles once with the transport's outcome.
    pub fn emit(&self, event_name: &str, args: Vec<Value>) -> Emission {
        log::trace!("Emitting '{}' with {} arguments", event_name, args.len());
        let envelope = Envelope::new(event_name, &args);
        Emission::transmit(self.transport.as_ref(), envelope.into_message())
    }

    /// Send `event_name` with a single serializable argument.
    ///
    /// Serialization failures are reported through the returned [`Emission`].
    pub fn emit_serialized<T: Serialize + ?Sized>(&self, event_name: &str, payload: &T) -> Emission {
        match Value::from_serialize(payload) {
            Ok(value) => self.emit(event_name, vec![value]),
            Err(e) => {
                log::warn!("Failed to serialize payload for '{}': {}", event_name, e);
                Emission::failed(IpcError::Codec(e))
            }
        }
    }

    /// Subscribe to events of `event_name` coming from the remote endpoint.
    ///
    /// The first subscription starts the handle's inbound stream, so nothing
    /// the peer sent before it is lost.
    pub fn on<F>(&self, event_name: &str, listener: F) -> ListenerId
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let id = self.listeners.on(event_name, listener);
        self.handle.start();
        id
    }

    /// Subscribe to the next event of `event_name` only.
    pub fn once<F>(&self, event_name: &str, listener: F) -> ListenerId
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let id = self.listeners.once(event_name, listener);
        self.handle.start();
        id
    }

    pub fn off(&self, event_name: &str, id: ListenerId) -> bool {
        self.listeners.off(event_name, id)
    }

    pub fn remove_all_listeners(&self, event_name: Option<&str>) {
        self.listeners.remove_all_listeners(event_name)
    }

    pub fn listener_count(&self, event_name: &str) -> usize {
        self.listeners.listener_count(event_name)
    }

    pub fn event_names(&self) -> Vec<String> {
        self.listeners.event_names()
    }

    /// Invoke local listeners of `event_name` without sending anything.
    pub fn dispatch(&self, event_name: &str, args: &[Value]) -> bool {
        self.listeners.emit(event_name, args)
    }

    /// The handle this channel is bound to
    pub fn handle(&self) -> &Arc<dyn ChannelHandle> {
        &self.handle
    }

    fn on_raw_message(listeners: &Listeners, message: &serde_json::Value) {
        let envelope = match Envelope::inspect(message) {
            Inspection::Event(envelope) => envelope,
            Inspection::Foreign => {
                log::trace!("Ignoring message without event signature");
                return;
            }
            Inspection::Malformed(reason) => {
                log::warn!("Dropping malformed event envelope: {}", reason);
                return;
            }
        };

        match envelope.args() {
            Ok(args) => {
                log::trace!("Received '{}' with {} arguments", envelope.event_name, args.len());
                listeners.emit(&envelope.event_name, &args);
            }
            Err(e) => log::warn!(
                "Dropping event '{}' with undecodable data: {}",
                envelope.event_name,
                e
            ),
        }
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("events", &self.listeners.event_names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::envelope::IPC_EVENT_SIGNATURE;
    use crate::error::TransportError;
    use crate::handle::{LocalHandle, MessageEvents, MockTransport};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Object that publishes nothing and cannot send.
    struct Inert;

    impl ChannelHandle for Inert {
        fn events(&self) -> Option<&MessageEvents> {
            None
        }

        fn transport(&self) -> Option<Arc<dyn Transport>> {
            None
        }
    }

    fn acknowledging() -> Arc<LocalHandle> {
        Arc::new(LocalHandle::with_send(|_, done| done(Ok(()))))
    }

    fn record(channel: &EventChannel, event: &str) -> Arc<Mutex<Vec<Vec<Value>>>> {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_clone = calls.clone();
        channel.on(event, move |args| calls_clone.lock().unwrap().push(args.to_vec()));
        calls
    }

    #[test]
    fn test_rejects_handle_without_events() {
        let err = EventChannel::new(Arc::new(Inert)).unwrap_err();
        assert!(matches!(err, IpcError::InvalidProcessObject { .. }));
        assert_eq!(err.reason(), "invalid_process_object");
        assert!(err.details().is_some_and(|details| details.ends_with("Inert has no event source")));
    }

    #[test]
    fn test_rejects_handle_without_channel() {
        let err = EventChannel::new(Arc::new(LocalHandle::new())).unwrap_err();
        assert!(matches!(err, IpcError::IpcChannelNotFound { .. }));
        assert_eq!(err.reason(), "ipc_channel_not_found");
        assert!(err.details().is_some_and(|details| details.contains("LocalHandle")));
    }

    /// Counts how often the channel asks it to start publishing.
    struct Deferred {
        events: MessageEvents,
        starts: AtomicUsize,
    }

    impl ChannelHandle for Deferred {
        fn events(&self) -> Option<&MessageEvents> {
            Some(&self.events)
        }

        fn transport(&self) -> Option<Arc<dyn Transport>> {
            Some(Arc::new(MockTransport::new()))
        }

        fn start(&self) {
            // 開始時点でリスナーが登録済みであること
            assert_eq!(self.events.listener_count(MESSAGE_EVENT), 1);
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_subscribing_starts_the_handle() {
        let handle = Arc::new(Deferred {
            events: MessageEvents::new(),
            starts: AtomicUsize::new(0),
        });
        let channel = EventChannel::new(handle.clone()).unwrap();
        assert_eq!(handle.starts.load(Ordering::SeqCst), 0);

        channel.on("ready", |_| {});
        channel.once("ready", |_| {});
        assert_eq!(handle.starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_registers_one_raw_listener_per_channel() {
        let handle = acknowledging();
        let _first = EventChannel::new(handle.clone()).unwrap();
        let _second = EventChannel::new(handle.clone()).unwrap();

        assert_eq!(handle.events().unwrap().listener_count(MESSAGE_EVENT), 2);
    }

    #[tokio::test]
    async fn test_emit_sends_envelope() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|message, _| {
                *message
                    == json!({
                        "magic": IPC_EVENT_SIGNATURE,
                        "eventName": "testEvent",
                        "data": "[{\"foo\":\"bar\"}]"
                    })
            })
            .times(1)
            .returning(|_, done| done(Ok(())));
        let handle = Arc::new(LocalHandle::with_transport(Arc::new(transport)));
        let channel = EventChannel::new(handle).unwrap();

        let result = channel
            .emit("testEvent", vec![Value::from(json!({"foo": "bar"}))])
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_emit_resolves_on_acknowledgement() {
        let channel = EventChannel::new(acknowledging()).unwrap();
        assert!(channel.emit("ping", args![]).await.is_ok());
    }

    #[tokio::test]
    async fn test_emit_rejects_on_send_error() {
        let handle = Arc::new(LocalHandle::with_send(|_, done| {
            done(Err(TransportError::rejected("oups")))
        }));
        let channel = EventChannel::new(handle).unwrap();

        let err = channel.emit("testEvent", args![]).await.unwrap_err();
        assert_eq!(err.to_string(), "transmission failed: oups");
    }

    #[tokio::test]
    async fn test_emit_preserves_call_order() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent_clone = sent.clone();
        let handle = Arc::new(LocalHandle::with_send(move |message, done| {
            sent_clone.lock().unwrap().push(message["eventName"].clone());
            done(Ok(()));
        }));
        let channel = EventChannel::new(handle).unwrap();

        let first = channel.emit("one", args![]);
        let second = channel.emit("two", args![]);
        let third = channel.emit("three", args![]);
        assert!(third.await.is_ok());
        assert!(first.await.is_ok());
        assert!(second.await.is_ok());

        assert_eq!(*sent.lock().unwrap(), vec![json!("one"), json!("two"), json!("three")]);
    }

    #[tokio::test]
    async fn test_emit_serialized_sends_single_argument() {
        #[derive(Serialize)]
        struct Progress {
            done: u32,
            total: u32,
        }

        let sent = Arc::new(Mutex::new(None));
        let sent_clone = sent.clone();
        let handle = Arc::new(LocalHandle::with_send(move |message, done| {
            *sent_clone.lock().unwrap() = message["data"].as_str().map(str::to_string);
            done(Ok(()));
        }));
        let channel = EventChannel::new(handle).unwrap();

        channel
            .emit_serialized("progress", &Progress { done: 3, total: 10 })
            .await
            .unwrap();
        assert_eq!(
            sent.lock().unwrap().as_deref(),
            Some(r#"[{"done":3,"total":10}]"#)
        );
    }

    #[test]
    fn test_inbound_event_dispatches_decoded_arguments() {
        let handle = acknowledging();
        let channel = EventChannel::new(handle.clone()).unwrap();
        let calls = record(&channel, "testEvent");

        handle.deliver(json!({
            "magic": IPC_EVENT_SIGNATURE,
            "eventName": "testEvent",
            "data": "[{\"foo\":\"bar\"}]"
        }));

        assert_eq!(
            *calls.lock().unwrap(),
            vec![vec![Value::from(json!({"foo": "bar"}))]]
        );
    }

    #[test]
    fn test_foreign_and_malformed_messages_are_ignored() {
        let handle = acknowledging();
        let channel = EventChannel::new(handle.clone()).unwrap();
        let calls = record(&channel, "testEvent");

        handle.deliver(json!({"eventName": "testEvent", "data": "[]"}));
        handle.deliver(json!({"magic": "nope", "eventName": "testEvent", "data": "[]"}));
        handle.deliver(json!("testEvent"));
        handle.deliver(json!({"magic": IPC_EVENT_SIGNATURE, "eventName": "testEvent"}));
        handle.deliver(json!({
            "magic": IPC_EVENT_SIGNATURE,
            "eventName": "testEvent",
            "data": "{\"not\":\"a list\"}"
        }));

        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_every_channel_on_a_handle_dispatches() {
        let handle = acknowledging();
        let first = EventChannel::new(handle.clone()).unwrap();
        let second = EventChannel::new(handle.clone()).unwrap();
        let first_calls = record(&first, "tick");
        let second_calls = record(&second, "tick");

        handle.deliver(Envelope::new("tick", &args![1]).into_message());

        assert_eq!(first_calls.lock().unwrap().len(), 1);
        assert_eq!(second_calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_listener_management() {
        let channel = EventChannel::new(acknowledging()).unwrap();
        let calls = Arc::new(Mutex::new(0));
        let calls_clone = calls.clone();

        let id = channel.on("tick", move |_| *calls_clone.lock().unwrap() += 1);
        channel.once("tick", |_| {});
        assert_eq!(channel.listener_count("tick"), 2);

        assert!(channel.dispatch("tick", &args![]));
        assert_eq!(channel.listener_count("tick"), 1);

        assert!(channel.off("tick", id));
        assert!(!channel.dispatch("tick", &args![]));
        assert_eq!(*calls.lock().unwrap(), 1);

        channel.on("a", |_| {});
        channel.on("b", |_| {});
        assert_eq!(channel.event_names(), vec!["a", "b"]);
        channel.remove_all_listeners(None);
        assert!(channel.event_names().is_empty());
    }
}
