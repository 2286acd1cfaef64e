//! Pipe-backed handle speaking newline-delimited JSON.
//!
//! Each raw message is one JSON value on its own line. A reader task turns
//! inbound lines into `"message"` events; a writer task drains the outbound
//! queue in order and acknowledges each message once it has been flushed.
//!
//! The reader task is held back until [`ProcessHandle::start`] is called, so
//! messages that arrive before the first listener attaches stay in the pipe
//! instead of being dispatched to nobody.

use super::{
    ChannelHandle, MessageEvents, RawMessage, SendCallback, Transport, DISCONNECT_EVENT,
    MESSAGE_EVENT,
};
use crate::config::HandleConfig;
use crate::error::TransportError;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type ReadTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// One endpoint of a process-to-process channel.
pub struct ProcessHandle {
    link: Arc<Link>,
    transport: Option<Arc<dyn Transport>>,
    // 最初のリスナーが付くまで読み取りを保留
    pending_reader: Mutex<Option<(Handle, ReadTask)>>,
}

/// State shared between the handle and its I/O tasks.
struct Link {
    events: MessageEvents,
    connected: AtomicBool,
    shutdown: CancellationToken,
}

impl Link {
    fn new(connected: bool) -> Self {
        Self {
            events: MessageEvents::new(),
            connected: AtomicBool::new(connected),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop both I/O loops; publishes `"disconnect"` only on the first call.
    fn close(&self) {
        self.shutdown.cancel();
        if self.connected.swap(false, Ordering::AcqRel) {
            log::debug!("Process channel disconnected");
            self.events.emit(DISCONNECT_EVENT, &RawMessage::Null);
        }
    }
}

struct Outgoing {
    message: RawMessage,
    done: SendCallback,
}

/// One framed read from the pipe.
#[derive(Debug, PartialEq)]
enum Frame {
    /// A complete line (or the unterminated tail before EOF) is in the buffer.
    Line,
    /// A line longer than the limit was skipped; carries its length.
    Oversized(usize),
    Eof,
}

impl ProcessHandle {
    /// Use the piped stdin/stdout of a spawned child.
    ///
    /// A child spawned without both pipes gives a handle that has events but
    /// no channel; any pipe that was present is left on the child.
    pub fn from_child(child: &mut Child) -> Self {
        Self::from_child_with_config(child, HandleConfig::default())
    }

    pub fn from_child_with_config(child: &mut Child, config: HandleConfig) -> Self {
        match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => Self::from_io_with_config(stdout, stdin, config),
            (stdin, stdout) => {
                log::debug!("Child process has no stdio pipes, no IPC channel available");
                child.stdin = stdin;
                child.stdout = stdout;
                Self::without_channel()
            }
        }
    }

    /// Use this process's own stdin/stdout, i.e. the channel to the parent.
    pub fn stdio() -> Self {
        Self::stdio_with_config(HandleConfig::default())
    }

    pub fn stdio_with_config(config: HandleConfig) -> Self {
        Self::from_io_with_config(tokio::io::stdin(), tokio::io::stdout(), config)
    }

    /// Build a handle over an arbitrary pipe pair. Must be called within a
    /// tokio runtime. The writer starts at once, the reader on [`start`].
    ///
    /// [`start`]: ProcessHandle::start
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::from_io_with_config(reader, writer, HandleConfig::default())
    }

    pub fn from_io_with_config<R, W>(reader: R, writer: W, config: HandleConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let link = Arc::new(Link::new(true));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let runtime = Handle::current();
        let read_task: ReadTask = Box::pin(Self::read_loop(
            reader,
            link.clone(),
            config.max_message_bytes,
        ));
        runtime.spawn(Self::write_loop(writer, outbound_rx, link.clone()));

        let transport = PipeTransport {
            outbound: outbound_tx,
            link: link.clone(),
        };

        Self {
            link,
            transport: Some(Arc::new(transport)),
            pending_reader: Mutex::new(Some((runtime, read_task))),
        }
    }

    /// An event source with no channel behind it.
    pub fn without_channel() -> Self {
        Self {
            link: Arc::new(Link::new(false)),
            transport: None,
            pending_reader: Mutex::new(None),
        }
    }

    /// Start dispatching inbound lines as `"message"` events.
    ///
    /// Register listeners first. Calling this again is a no-op.
    /// [`EventChannel`](crate::EventChannel) calls it when its first listener
    /// is added.
    pub fn start(&self) {
        let pending = self
            .pending_reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some((runtime, read_task)) = pending {
            log::debug!("Starting process channel read loop");
            runtime.spawn(read_task);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::Acquire)
    }

    /// Close the channel. Queued messages fail with `ChannelClosed`.
    pub fn disconnect(&self) {
        log::info!("Manual disconnect requested for ProcessHandle");
        self.link.close();
    }

    async fn read_loop<R>(reader: R, link: Arc<Link>, max_message_bytes: usize)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();

        loop {
            let frame = tokio::select! {
                _ = link.shutdown.cancelled() => break,
                frame = Self::next_line(&mut reader, &mut line, max_message_bytes) => frame,
            };

            match frame {
                Ok(Frame::Eof) => {
                    log::debug!("Channel EOF reached, terminating read loop");
                    break;
                }
                Ok(Frame::Oversized(length)) => {
                    log::warn!(
                        "Dropping inbound message of {} bytes (limit {})",
                        length,
                        max_message_bytes
                    );
                    continue;
                }
                Ok(Frame::Line) => {}
                Err(e) => {
                    log::error!("Channel read error: {}", e);
                    break;
                }
            }

            // 空行はスキップ
            let text = line.trim_ascii();
            if text.is_empty() {
                continue;
            }

            match serde_json::from_slice::<RawMessage>(text) {
                Ok(message) => {
                    link.events.emit(MESSAGE_EVENT, &message);
                }
                Err(e) => log::warn!("Skipping inbound line that is not JSON: {}", e),
            }
        }

        link.close();
    }

    /// 改行までを1メッセージとして読み取る
    ///
    /// At most `max` bytes are ever kept in `line`. The rest of a longer line
    /// is consumed from the reader and discarded.
    async fn next_line<R>(reader: &mut R, line: &mut Vec<u8>, max: usize) -> io::Result<Frame>
    where
        R: AsyncBufRead + Unpin,
    {
        line.clear();
        let mut oversized: Option<usize> = None;

        loop {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(match oversized {
                    Some(length) => Frame::Oversized(length),
                    None if line.is_empty() => Frame::Eof,
                    None => Frame::Line,
                });
            }

            let (used, complete) = match available.iter().position(|&b| b == b'\n') {
                Some(end) => (end + 1, true),
                None => (available.len(), false),
            };

            match oversized {
                Some(length) => oversized = Some(length + used),
                None if line.len() + used > max => {
                    oversized = Some(line.len() + used);
                    line.clear();
                    line.shrink_to_fit();
                }
                None => line.extend_from_slice(&available[..used]),
            }
            reader.consume(used);

            if complete {
                return Ok(oversized.map_or(Frame::Line, Frame::Oversized));
            }
        }
    }

    async fn write_loop<W>(
        mut writer: W,
        mut outbound: mpsc::UnboundedReceiver<Outgoing>,
        link: Arc<Link>,
    ) where
        W: AsyncWrite + Unpin,
    {
        loop {
            // 切断済みならキューに残ったメッセージは送らない
            let outgoing = tokio::select! {
                biased;
                _ = link.shutdown.cancelled() => break,
                outgoing = outbound.recv() => match outgoing {
                    Some(outgoing) => outgoing,
                    None => break,
                },
            };

            let result = Self::write_message(&mut writer, &outgoing.message).await;
            let broken = matches!(result, Err(TransportError::Io(_)));
            (outgoing.done)(result);

            if broken {
                log::error!("Channel write failed, closing channel");
                link.close();
                break;
            }
        }

        // Anything still queued can no longer be delivered.
        outbound.close();
        while let Ok(outgoing) = outbound.try_recv() {
            (outgoing.done)(Err(TransportError::ChannelClosed));
        }
        log::debug!("Channel write loop terminated");
    }

    async fn write_message<W>(writer: &mut W, message: &RawMessage) -> Result<(), TransportError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl ChannelHandle for ProcessHandle {
    fn events(&self) -> Option<&MessageEvents> {
        Some(&self.link.events)
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.clone()
    }

    fn start(&self) {
        ProcessHandle::start(self)
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        log::debug!("ProcessHandle dropped, stopping I/O tasks");
        self.link.shutdown.cancel();
    }
}

struct PipeTransport {
    outbound: mpsc::UnboundedSender<Outgoing>,
    link: Arc<Link>,
}

impl Transport for PipeTransport {
    fn send(&self, message: RawMessage, done: SendCallback) {
        if !self.link.connected.load(Ordering::Acquire) {
            return done(Err(TransportError::ChannelClosed));
        }
        if let Err(mpsc::error::SendError(outgoing)) =
            self.outbound.send(Outgoing { message, done })
        {
            (outgoing.done)(Err(TransportError::ChannelClosed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::sync::oneshot;
    use tokio::time::{timeout, Duration};

    /// Handle on one end of an in-memory pipe, raw stream on the other.
    fn piped(config: HandleConfig) -> (ProcessHandle, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(ours);
        (ProcessHandle::from_io_with_config(reader, writer, config), theirs)
    }

    /// メッセージを受信キューへ転送し、読み取りを開始する
    fn collect_messages(handle: &ProcessHandle) -> mpsc::UnboundedReceiver<RawMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        handle.events().unwrap().on(MESSAGE_EVENT, move |message| {
            let _ = tx.send(message.clone());
        });
        handle.start();
        rx
    }

    fn send(handle: &ProcessHandle, message: RawMessage) -> oneshot::Receiver<Result<(), TransportError>> {
        let (tx, rx) = oneshot::channel();
        handle.transport().unwrap().send(
            message,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx
    }

    #[tokio::test]
    async fn test_inbound_lines_become_message_events() {
        let (handle, mut peer) = piped(HandleConfig::default());
        let mut messages = collect_messages(&handle);

        peer.write_all(b"{\"a\":1}\nnot json\n\n[1,2]\r\n").await.unwrap();

        let first = timeout(Duration::from_secs(1), messages.recv()).await.unwrap();
        let second = timeout(Duration::from_secs(1), messages.recv()).await.unwrap();
        assert_eq!(first, Some(json!({"a": 1})));
        assert_eq!(second, Some(json!([1, 2])));
    }

    #[tokio::test]
    async fn test_outbound_messages_are_written_as_lines() {
        let (handle, peer) = piped(HandleConfig::default());

        let first = send(&handle, json!({"magic": "heXeo-ipc", "text": "two\nlines"}));
        let second = send(&handle, json!(2));
        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());

        let mut lines = BufReader::new(peer).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(
            serde_json::from_str::<RawMessage>(&line).unwrap(),
            json!({"magic": "heXeo-ipc", "text": "two\nlines"})
        );
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "2");
    }

    #[tokio::test]
    async fn test_oversized_lines_are_dropped() {
        let (handle, mut peer) = piped(HandleConfig::default().with_max_message_bytes(16));
        let mut messages = collect_messages(&handle);

        let long = format!("\"{}\"\n", "x".repeat(64));
        peer.write_all(long.as_bytes()).await.unwrap();
        peer.write_all(b"\"short\"\n").await.unwrap();

        let received = timeout(Duration::from_secs(1), messages.recv()).await.unwrap();
        assert_eq!(received, Some(json!("short")));
    }

    #[tokio::test]
    async fn test_peer_close_disconnects_once() {
        let (handle, peer) = piped(HandleConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.events().unwrap().on(DISCONNECT_EVENT, move |_| {
            let _ = tx.send(());
        });
        handle.start();

        drop(peer);

        timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(!handle.is_connected());

        handle.disconnect();
        assert!(rx.try_recv().is_err());

        let outcome = send(&handle, json!("late")).await.unwrap();
        assert!(matches!(outcome, Err(TransportError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_manual_disconnect_rejects_sends() {
        let (handle, _peer) = piped(HandleConfig::default());
        assert!(handle.is_connected());

        handle.disconnect();

        assert!(!handle.is_connected());
        let outcome = send(&handle, json!("after")).await.unwrap();
        assert!(matches!(outcome, Err(TransportError::ChannelClosed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lines_wait_in_pipe_until_started() {
        let (handle, mut peer) = piped(HandleConfig::default());
        peer.write_all(b"\"early\"\n").await.unwrap();

        // 読み取りタスクが動いていれば、ここで取りこぼしが起きる
        std::thread::sleep(Duration::from_millis(50));

        let mut messages = collect_messages(&handle);
        let received = timeout(Duration::from_secs(1), messages.recv()).await.unwrap();
        assert_eq!(received, Some(json!("early")));

        // 2回目の start は何もしない
        handle.start();
        peer.write_all(b"\"later\"\n").await.unwrap();
        let received = timeout(Duration::from_secs(1), messages.recv()).await.unwrap();
        assert_eq!(received, Some(json!("later")));
        assert!(messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_fails_messages_still_queued() {
        for _ in 0..50 {
            let (handle, _peer) = piped(HandleConfig::default());

            let outcome = send(&handle, json!(1));
            handle.disconnect();

            assert!(matches!(
                outcome.await.unwrap(),
                Err(TransportError::ChannelClosed)
            ));
        }
    }

    #[tokio::test]
    async fn test_unterminated_oversized_input_is_not_buffered() {
        let flood = vec![b'x'; 1024 * 1024];
        let mut reader = BufReader::new(&flood[..]);
        let mut line = Vec::new();

        let frame = ProcessHandle::next_line(&mut reader, &mut line, 16).await.unwrap();

        assert_eq!(frame, Frame::Oversized(flood.len()));
        assert!(line.is_empty());
        assert!(line.capacity() <= 16);
        assert_eq!(
            ProcessHandle::next_line(&mut reader, &mut line, 16).await.unwrap(),
            Frame::Eof
        );
    }

    #[tokio::test]
    async fn test_oversized_line_is_skipped_up_to_newline() {
        let input = format!("{}\n\"ok\"\n", "y".repeat(100));
        let mut reader = BufReader::with_capacity(8, input.as_bytes());
        let mut line = Vec::new();

        assert_eq!(
            ProcessHandle::next_line(&mut reader, &mut line, 16).await.unwrap(),
            Frame::Oversized(101)
        );
        assert_eq!(
            ProcessHandle::next_line(&mut reader, &mut line, 16).await.unwrap(),
            Frame::Line
        );
        assert_eq!(line, b"\"ok\"\n");
    }

    #[tokio::test]
    async fn test_peer_close_with_unterminated_oversized_line() {
        let (handle, mut peer) = piped(HandleConfig::default().with_max_message_bytes(16));
        let (tx, mut disconnected) = mpsc::unbounded_channel();
        handle.events().unwrap().on(DISCONNECT_EVENT, move |_| {
            let _ = tx.send(());
        });
        let mut messages = collect_messages(&handle);

        peer.write_all(&[b'z'; 4096]).await.unwrap();
        drop(peer);

        timeout(Duration::from_secs(1), disconnected.recv()).await.unwrap();
        assert!(messages.try_recv().is_err());
        assert!(!handle.is_connected());
    }

    #[test]
    fn test_without_channel_has_no_transport() {
        let handle = ProcessHandle::without_channel();
        assert!(handle.events().is_some());
        assert!(handle.transport().is_none());
        assert!(!handle.is_connected());
    }
}
