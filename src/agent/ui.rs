use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::agent::sender::PacketSender;
use crate::capability::{EffectResult, UiCapability};
use crate::config::TimingConfig;
use crate::errors::{MonkeyError, MonkeyResult};
use crate::invoker::UiReceiver;
use crate::protocol::Packet;
use crate::script::{EnginePhase, RunReport, Script, ScriptContext, ScriptEngine, ScriptEnv};

/// Agent state owned by the UI thread. Work posted through the agent's
/// invoker runs with a reference to it.
pub struct AgentUi {
    receiver: UiReceiver<AgentUi>,
    capability: RefCell<Box<dyn UiCapability>>,
    engine: ScriptEngine,
    scripts: RefCell<VecDeque<Script>>,
    last_report: RefCell<Option<RunReport>>,
    sender: PacketSender,
    timing: TimingConfig,
}

impl AgentUi {
    pub(crate) fn new(
        receiver: UiReceiver<AgentUi>,
        capability: Box<dyn UiCapability>,
        sender: PacketSender,
        timing: TimingConfig,
    ) -> Self {
        Self {
            receiver,
            capability: RefCell::new(capability),
            engine: ScriptEngine::new(),
            scripts: RefCell::new(VecDeque::new()),
            last_report: RefCell::new(None),
            sender,
            timing,
        }
    }

    /// Runs posted work, then forwards observed user events.
    pub fn process_events(&self, max_time: Duration) -> usize {
        let ran = self.receiver.process_events(self, max_time);
        self.forward_observed_events();
        ran
    }

    /// Like [`process_events`](Self::process_events) but waits up to
    /// `max_time` for work when the queue is empty.
    pub fn wait_events(&self, max_time: Duration) -> usize {
        let ran = self.receiver.wait_events(self, max_time);
        self.forward_observed_events();
        ran
    }

    /// Synchronous invoke for code already on the UI thread; keeps pumping
    /// while it waits.
    pub fn run_sync<F, R>(&self, f: F, timeout: Option<Duration>) -> Option<R>
    where
        F: FnOnce(&AgentUi) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.receiver.run_sync(self, f, timeout)
    }

    /// Gives `f` the toolkit adapter, unless it is in use further up the stack.
    pub fn with_capability<R>(&self, f: impl FnOnce(&mut dyn UiCapability) -> R) -> MonkeyResult<R> {
        let mut capability = self
            .capability
            .try_borrow_mut()
            .map_err(|_| MonkeyError::Agent("UI capability is busy".into()))?;
        Ok(f(&mut **capability))
    }

    pub fn sender(&self) -> &PacketSender {
        &self.sender
    }

    pub fn current_line(&self) -> Option<usize> {
        self.engine.current_line()
    }

    pub fn engine_phase(&self) -> EnginePhase {
        self.engine.phase()
    }

    pub fn last_report(&self) -> Option<RunReport> {
        self.last_report.borrow().clone()
    }

    pub fn queued_scripts(&self) -> usize {
        self.scripts.borrow().len()
    }

    /// Queues `script` and, unless a run is already active further up the
    /// stack, runs everything queued. Runs never nest.
    pub(crate) fn schedule_script(&self, script: Script) {
        self.scripts.borrow_mut().push_back(script);
        if self.engine.is_running() {
            tracing::debug!(queued = self.queued_scripts(), "script queued behind active run");
            return;
        }
        loop {
            let next = self.scripts.borrow_mut().pop_front();
            let Some(script) = next else { break };
            let report = self.engine.run(&script, self);
            *self.last_report.borrow_mut() = Some(report);
        }
    }

    fn forward_observed_events(&self) {
        let Ok(mut capability) = self.capability.try_borrow_mut() else {
            return;
        };
        while let Some(statement) = capability.observe_event() {
            tracing::debug!(%statement, "user event observed");
            if let Err(e) = self.sender.send_user_event(statement) {
                tracing::warn!(error = %e, "dropping observed user event");
            }
        }
    }

    fn pump_native(&self, max_time: Duration) {
        if let Ok(mut capability) = self.capability.try_borrow_mut() {
            capability.process_native_events(max_time);
        }
    }

    /// Keeps the UI loop turning for `window` so that everything the script
    /// synthesized has been delivered and observed. Stops early at
    /// `deadline`; returns whether the whole window was pumped.
    fn settle_pump(&self, window: Duration, slice: Duration, deadline: Instant) -> bool {
        let started = Instant::now();
        while started.elapsed() < window {
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(elapsed = ?started.elapsed(), "settle phase cut short");
                return false;
            }
            let slice = slice.min(deadline - now);
            self.pump_native(slice);
            self.receiver.wait_events(self, slice);
            self.forward_observed_events();
        }
        tracing::debug!(elapsed = ?started.elapsed(), "settle phase done");
        true
    }

    fn send_or_warn(&self, packet: Packet) {
        let kind = packet.kind();
        if let Err(e) = self.sender.send(&packet) {
            tracing::error!(error = %e, %kind, "cannot send packet to controller");
        }
    }
}

impl ScriptEnv for AgentUi {
    fn synthesize(&self, statement: &str, ctx: &mut ScriptContext<'_>) -> EffectResult {
        match self.capability.try_borrow_mut() {
            Ok(mut capability) => capability.synthesize_event(statement, ctx),
            Err(_) => Err("UI capability is busy".to_string()),
        }
    }

    fn log(&self, line: &str) {
        self.send_or_warn(Packet::ScriptLog(line.to_string()));
    }

    /// `settle_timeout` bounds the whole phase: waiting for the settle work
    /// to start and the pumping itself.
    fn settle(&self) -> bool {
        let window = self.timing.settle_window();
        let slice = self.timing.settle_slice();
        let timeout = self.timing.settle_timeout();
        let deadline = Instant::now() + timeout;
        self.receiver
            .run_sync(
                self,
                move |ui: &AgentUi| ui.settle_pump(window, slice, deadline),
                Some(timeout),
            )
            .unwrap_or(false)
    }

    fn report_error(&self, message: &str) {
        tracing::warn!(error = %message, "script returned error");
        self.send_or_warn(Packet::ScriptError(message.to_string()));
    }

    fn report_end(&self) {
        self.send_or_warn(Packet::ScriptEnd);
    }
}
