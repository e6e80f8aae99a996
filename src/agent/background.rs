use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::agent::sender::{LinkCommand, WriteErrorSlot};
use crate::agent::ui::AgentUi;
use crate::errors::{MonkeyError, MonkeyResult};
use crate::invoker::UiInvoker;
use crate::protocol::{Packet, PacketBuffer};
use crate::transport::{ConnectionState, LinkWriter, SharedConnectionState, TcpLink};

/// Called when the control channel breaks mid-session.
pub type FatalHook = Arc<dyn Fn(&MonkeyError) + Send + Sync>;

/// Default reaction to a broken control channel: the agent can no longer be
/// trusted to report its own state, so the whole process goes down.
pub fn abort_process() -> FatalHook {
    Arc::new(|err: &MonkeyError| {
        tracing::error!(error = %err, "communication error with controller, aborting");
        std::process::abort();
    })
}

/// Everything the agent thread owns. Built on the UI thread, then moved.
pub(crate) struct AgentThread {
    pub address: String,
    pub read_chunk_bytes: usize,
    pub shutdown_grace: Duration,
    pub invoker: UiInvoker<AgentUi>,
    pub commands: mpsc::UnboundedReceiver<LinkCommand>,
    pub write_error: WriteErrorSlot,
    pub ready: Arc<AtomicBool>,
    pub state: SharedConnectionState,
    pub on_fatal: FatalHook,
    /// Set once the owner has queued its final Shutdown command. Also
    /// interrupts writes stuck on a controller that stopped reading.
    pub shutdown: watch::Receiver<bool>,
}

impl AgentThread {
    pub fn run(self) -> MonkeyResult<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.serve())
    }

    async fn serve(mut self) -> MonkeyResult<()> {
        self.state.set(ConnectionState::Connecting);
        let link = match TcpLink::connect(&self.address).await {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(error = %e, "can not connect to controller");
                self.state.set(ConnectionState::Failed);
                return Err(e);
            }
        };
        self.state.set(ConnectionState::Connected);
        self.ready.store(true, Ordering::Release);

        let (mut reader, mut writer) = link.into_split();
        let mut buffer = PacketBuffer::new();
        let mut chunk = vec![0u8; self.read_chunk_bytes.max(1)];
        let mut shutdown = self.shutdown.clone();
        let mut abandoned = false;
        let mut drain_deadline = None;

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                read = reader.read_available(&mut chunk) => {
                    let n = match read {
                        Ok(0) => {
                            return self.fail(MonkeyError::Connection(
                                "controller closed the connection".into(),
                            ))
                        }
                        Ok(n) => n,
                        Err(e) => return self.fail(e),
                    };
                    buffer.extend(&chunk[..n]);
                    for packet in buffer.drain_packets() {
                        if let Err(e) = self.dispatch(packet) {
                            return self.fail(e);
                        }
                    }
                }
                command = self.commands.recv() => {
                    let Some(first) = command else { break };
                    let batch = self.next_batch(first);
                    let write = self.apply_batch(&mut writer, batch);
                    tokio::pin!(write);
                    let stop = tokio::select! {
                        biased;
                        stop = &mut write => stop,
                        _ = shutdown_requested(&mut shutdown) => {
                            let deadline = Instant::now() + self.shutdown_grace;
                            drain_deadline = Some(deadline);
                            if tokio::time::timeout_at(deadline, &mut write).await.is_err() {
                                abandoned = true;
                            }
                            true
                        }
                    };
                    if stop {
                        break;
                    }
                }
            }
        }

        if abandoned {
            // A packet may be half written; nothing after it can be parsed.
            tracing::warn!("controller stopped reading, outstanding packets dropped");
        } else {
            let mut rest = Vec::new();
            while let Ok(command) = self.commands.try_recv() {
                rest.push(command);
            }
            rest.push(LinkCommand::Shutdown);
            let drain = async {
                self.apply_batch(&mut writer, rest).await;
                writer.flush().await
            };
            let deadline = drain_deadline.unwrap_or_else(|| Instant::now() + self.shutdown_grace);
            match tokio::time::timeout_at(deadline, drain).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.write_failed(&e),
                Err(_) => tracing::warn!("final flush timed out, outstanding packets dropped"),
            }
        }
        self.commands.close();
        self.state.set(ConnectionState::Disconnected);
        tracing::info!("agent thread stopped");
        Ok(())
    }

    fn next_batch(&mut self, first: LinkCommand) -> Vec<LinkCommand> {
        let mut batch = vec![first];
        while let Ok(more) = self.commands.try_recv() {
            batch.push(more);
        }
        batch
    }

    /// Writes a batch of queued commands and flushes once. Returns `true`
    /// when the batch asked the thread to stop.
    async fn apply_batch<W>(&self, writer: &mut LinkWriter<W>, batch: Vec<LinkCommand>) -> bool
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let mut stop = false;
        let mut dropped = 0usize;
        for command in batch {
            match command {
                LinkCommand::Send(_) if stop => dropped += 1,
                LinkCommand::Send(bytes) => {
                    if let Err(e) = writer.send(&bytes).await {
                        self.write_failed(&e);
                    }
                }
                LinkCommand::Flush => {}
                LinkCommand::Shutdown => stop = true,
            }
        }
        if dropped > 0 {
            tracing::debug!(dropped, "packets queued after shutdown were dropped");
        }
        if !stop {
            if let Err(e) = writer.flush().await {
                self.write_failed(&e);
            }
        }
        stop
    }

    fn dispatch(&self, packet: Packet) -> MonkeyResult<()> {
        match packet {
            Packet::RunScript(script) => {
                tracing::info!(script = %script.name(), statements = script.statements().len(), "run script requested");
                self.invoker
                    .post_async(move |ui: &AgentUi| ui.schedule_script(script));
                Ok(())
            }
            Packet::ProtocolViolation(raw) => Err(MonkeyError::Protocol(format!(
                "problem with controller protocol: {raw}"
            ))),
            other => Err(MonkeyError::Protocol(format!(
                "unexpected {} packet from controller",
                other.kind()
            ))),
        }
    }

    fn write_failed(&self, err: &MonkeyError) {
        tracing::error!(error = %err, "can not send data to controller");
        self.write_error.record(err);
    }

    fn fail(&self, err: MonkeyError) -> MonkeyResult<()> {
        self.state.set(ConnectionState::Failed);
        tracing::error!(error = %err, "fatal communication error");
        (self.on_fatal)(&err);
        Err(err)
    }
}

/// Resolves once shutdown was requested or the owner is gone.
async fn shutdown_requested(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode;
    use crate::script::Script;
    use crate::transport::TransportLink;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct Harness {
        thread: AgentThread,
        commands: mpsc::UnboundedSender<LinkCommand>,
        shutdown: watch::Sender<bool>,
        fatal: Arc<Mutex<Option<String>>>,
        write_error: WriteErrorSlot,
        state: SharedConnectionState,
        invoker: UiInvoker<AgentUi>,
    }

    fn harness(address: String) -> Harness {
        let (commands, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let fatal = Arc::new(Mutex::new(None));
        let write_error = WriteErrorSlot::default();
        let state = SharedConnectionState::default();
        let invoker = UiInvoker::new();
        let seen = fatal.clone();
        let thread = AgentThread {
            address,
            read_chunk_bytes: 64,
            shutdown_grace: Duration::from_millis(100),
            invoker: invoker.clone(),
            commands: rx,
            write_error: write_error.clone(),
            ready: Arc::new(AtomicBool::new(false)),
            state: state.clone(),
            on_fatal: Arc::new(move |err: &MonkeyError| {
                *seen.lock().unwrap() = Some(err.to_string());
            }),
            shutdown: shutdown_rx,
        };
        Harness {
            thread,
            commands,
            shutdown,
            fatal,
            write_error,
            state,
            invoker,
        }
    }

    fn log_bytes(line: &str) -> Vec<u8> {
        encode(&Packet::ScriptLog(line.into())).unwrap()
    }

    fn parse_all(bytes: &[u8]) -> Vec<Packet> {
        let mut buffer = PacketBuffer::new();
        buffer.extend(bytes);
        buffer.drain_packets()
    }

    #[test]
    fn only_run_script_is_accepted_from_the_controller() {
        let h = harness(String::new());
        let receiver = h.invoker.register_receiver().unwrap();

        h.thread
            .dispatch(Packet::RunScript(Script::new("a.ui", "click(a)")))
            .unwrap();
        assert_eq!(receiver.pending(), 1);

        let err = h.thread.dispatch(Packet::ScriptEnd).unwrap_err();
        assert!(matches!(err, MonkeyError::Protocol(_)));
        assert!(err.to_string().contains("scriptEnd"), "{err}");

        let err = h
            .thread
            .dispatch(Packet::ProtocolViolation("{\"cmd\":\"nope\"}".into()))
            .unwrap_err();
        assert!(err.to_string().contains("nope"), "{err}");
    }

    #[tokio::test]
    async fn sends_queued_after_shutdown_are_dropped() {
        let h = harness(String::new());
        let (local, mut remote) = tokio::io::duplex(1024);
        let (reader, mut writer) = TransportLink::from_stream(local).into_split();

        let batch = vec![
            LinkCommand::Send(log_bytes("kept")),
            LinkCommand::Shutdown,
            LinkCommand::Send(log_bytes("lost")),
        ];
        assert!(h.thread.apply_batch(&mut writer, batch).await);
        writer.flush().await.unwrap();
        drop((reader, writer));

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(parse_all(&received), vec![Packet::ScriptLog("kept".into())]);
    }

    #[tokio::test]
    async fn write_failure_is_recorded_but_not_fatal() {
        let h = harness(String::new());
        let (local, remote) = tokio::io::duplex(64);
        drop(remote);
        let (_reader, mut writer) = TransportLink::from_stream(local).into_split();

        let stop = h
            .thread
            .apply_batch(&mut writer, vec![LinkCommand::Send(log_bytes("x"))])
            .await;
        assert!(!stop);
        assert!(h.write_error.get().is_some());
        assert_ne!(h.state.get(), ConnectionState::Failed);
        assert!(h.fatal.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn unexpected_packet_from_controller_ends_the_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let h = harness(listener.local_addr().unwrap().to_string());

        let controller = async {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"{\"cmd\":\"scriptEnd\"}\n").await.unwrap();
            socket
        };
        let (result, _socket) = tokio::join!(h.thread.serve(), controller);

        assert!(matches!(result, Err(MonkeyError::Protocol(_))));
        assert!(h.fatal.lock().unwrap().as_deref().unwrap_or_default().contains("scriptEnd"));
        assert_eq!(h.state.get(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn shutdown_drains_what_was_queued_before_it() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let h = harness(listener.local_addr().unwrap().to_string());
        h.commands.send(LinkCommand::Send(log_bytes("last words"))).unwrap();
        h.commands.send(LinkCommand::Shutdown).unwrap();
        h.commands.send(LinkCommand::Send(log_bytes("too late"))).unwrap();
        h.shutdown.send_replace(true);

        let controller = async {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            received
        };
        let (result, received) = tokio::join!(h.thread.serve(), controller);

        result.unwrap();
        assert_eq!(parse_all(&received), vec![Packet::ScriptLog("last words".into())]);
        assert_eq!(h.state.get(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn stalled_controller_cannot_hold_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let h = harness(listener.local_addr().unwrap().to_string());
        let line = "x".repeat(1 << 20);
        for _ in 0..64 {
            h.commands.send(LinkCommand::Send(log_bytes(&line))).unwrap();
        }
        let shutdown = h.shutdown;

        let controller = async {
            // Accept and never read.
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown.send_replace(true);
            socket
        };
        let stopped = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(h.thread.serve(), controller)
        })
        .await;

        let (result, _socket) = stopped.expect("agent thread stayed blocked on a stalled controller");
        result.unwrap();
        assert_eq!(h.state.get(), ConnectionState::Disconnected);
    }
}
