use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::agent::background::{abort_process, AgentThread, FatalHook};
use crate::agent::sender::{LinkCommand, PacketSender};
use crate::agent::ui::AgentUi;
use crate::capability::UiCapability;
use crate::config::{AgentConfig, TimingConfig};
use crate::errors::{MonkeyError, MonkeyResult};
use crate::invoker::UiInvoker;
use crate::protocol::Packet;
use crate::transport::{ConnectionState, SharedConnectionState};

pub const AGENT_THREAD_NAME: &str = "uimonkey-agent";

/// The agent embedded in the target application.
///
/// Created on the UI thread, which must then call
/// [`process_events`](Self::process_events) or
/// [`wait_events`](Self::wait_events) from its run loop. Dropping it shuts the
/// agent thread down.
pub struct AgentCore {
    ui: AgentUi,
    invoker: UiInvoker<AgentUi>,
    state: SharedConnectionState,
    timing: TimingConfig,
    shutdown: watch::Sender<bool>,
    thread: Option<JoinHandle<MonkeyResult<()>>>,
}

impl AgentCore {
    /// Connects to the controller and starts serving. Blocks until the agent
    /// thread is connected or has given up; there is no built-in timeout.
    pub fn start(config: AgentConfig, capability: Box<dyn UiCapability>) -> MonkeyResult<Self> {
        Self::start_with_fatal_hook(config, capability, abort_process())
    }

    /// Like [`start`](Self::start), with a custom reaction to mid-session
    /// communication failures instead of aborting the process.
    pub fn start_with_fatal_hook(
        config: AgentConfig,
        capability: Box<dyn UiCapability>,
        on_fatal: FatalHook,
    ) -> MonkeyResult<Self> {
        let invoker = UiInvoker::<AgentUi>::new();
        let receiver = invoker.register_receiver()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = PacketSender::new(tx);
        let ready = Arc::new(AtomicBool::new(false));
        let state = SharedConnectionState::default();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let agent_thread = AgentThread {
            address: config.controller.address.clone(),
            read_chunk_bytes: config.controller.read_chunk_bytes,
            shutdown_grace: config.timing.shutdown_grace(),
            invoker: invoker.clone(),
            commands: rx,
            write_error: sender.error_slot(),
            ready: ready.clone(),
            state: state.clone(),
            on_fatal,
            shutdown: shutdown_rx,
        };
        let handle = thread::Builder::new()
            .name(AGENT_THREAD_NAME.to_string())
            .spawn(move || agent_thread.run())?;

        while !handle.is_finished() && !ready.load(Ordering::Acquire) {
            std::hint::spin_loop();
            thread::yield_now();
        }
        if !ready.load(Ordering::Acquire) {
            return Err(match handle.join() {
                Ok(Err(e)) => e,
                Ok(Ok(())) => MonkeyError::Connection("agent thread exited before connecting".into()),
                Err(_) => MonkeyError::Agent("agent thread panicked during startup".into()),
            });
        }
        tracing::info!(address = %config.controller.address, "agent started");

        Ok(Self {
            ui: AgentUi::new(receiver, capability, sender, config.timing.clone()),
            invoker,
            state,
            timing: config.timing,
            shutdown,
            thread: Some(handle),
        })
    }

    /// Runs work posted to the UI thread and forwards observed user events.
    /// Returns without waiting when there is nothing to do.
    pub fn process_events(&self, max_time: Duration) -> usize {
        self.ui.process_events(max_time)
    }

    /// Waits up to `max_time` for posted work, then processes it.
    pub fn wait_events(&self, max_time: Duration) -> usize {
        self.ui.wait_events(max_time)
    }

    pub fn ui(&self) -> &AgentUi {
        &self.ui
    }

    /// Handle for running code on the UI thread from elsewhere.
    pub fn invoker(&self) -> UiInvoker<AgentUi> {
        self.invoker.clone()
    }

    pub fn sender(&self) -> PacketSender {
        self.ui.sender().clone()
    }

    pub fn send_packet(&self, packet: &Packet) -> MonkeyResult<()> {
        self.ui.sender().send(packet)
    }

    /// Reports a user action already translated to script form.
    pub fn send_user_event(&self, statement: impl Into<String>) -> MonkeyResult<()> {
        self.ui.sender().send_user_event(statement)
    }

    pub fn send_log(&self, line: impl Into<String>) -> MonkeyResult<()> {
        self.ui.sender().send_log(line)
    }

    pub fn current_line(&self) -> Option<usize> {
        self.ui.current_line()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Flushes outstanding packets and stops the agent thread.
    ///
    /// Blocks for at most about twice `shutdown_grace`: one grace period of
    /// UI processing, then one for the agent thread to drain its queue.
    /// Whatever a stalled controller has not accepted by then is dropped.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        if handle.is_finished() {
            tracing::warn!("agent thread is already finished");
            log_join(handle);
            return;
        }

        if let Err(e) = self.ui.sender().command(LinkCommand::Flush) {
            tracing::debug!(error = %e, "flush request not delivered");
        }
        self.ui.process_events(self.timing.shutdown_grace());
        if let Err(e) = self.ui.sender().command(LinkCommand::Shutdown) {
            tracing::debug!(error = %e, "shutdown request not delivered");
        }
        self.shutdown.send_replace(true);
        log_join(handle);
    }
}

fn log_join(handle: JoinHandle<MonkeyResult<()>>) {
    match handle.join() {
        Ok(Ok(())) => tracing::debug!("agent thread joined"),
        Ok(Err(e)) => tracing::warn!(error = %e, "agent thread ended with error"),
        Err(_) => tracing::error!("agent thread panicked"),
    }
}

impl Drop for AgentCore {
    fn drop(&mut self) {
        self.stop();
    }
}
