use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};

use uuid::Uuid;

use crate::capability::EffectResult;
use crate::script::Script;

/// What the engine needs from the agent while a script runs.
pub trait ScriptEnv {
    /// Replays a single statement.
    fn synthesize(&self, statement: &str, ctx: &mut ScriptContext<'_>) -> EffectResult;
    /// Forwards a diagnostic line to the controller.
    fn log(&self, line: &str);
    /// Pumps the UI loop until synthesized events have been delivered.
    /// Returns `false` when the settle work did not complete in time.
    fn settle(&self) -> bool;
    fn report_error(&self, message: &str);
    fn report_end(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed(String),
}

/// Snapshot handed back once a run reached its terminal state.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub script_name: String,
    pub outcome: RunOutcome,
    pub current_line: usize,
    pub log: Vec<String>,
}

/// Per-run mutable state; lives only for the duration of [`ScriptEngine::run`].
#[derive(Debug)]
struct ExecutionState {
    run_id: Uuid,
    current_line: usize,
    error: String,
    log: Vec<String>,
}

impl ExecutionState {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            current_line: 0,
            error: String::new(),
            log: Vec::new(),
        }
    }
}

/// Handle given to the UI capability for the statement being replayed.
pub struct ScriptContext<'a> {
    script_name: &'a str,
    state: &'a mut ExecutionState,
    env: &'a dyn ScriptEnv,
}

impl ScriptContext<'_> {
    pub fn script_name(&self) -> &str {
        self.script_name
    }

    pub fn run_id(&self) -> Uuid {
        self.state.run_id
    }

    pub fn current_line(&self) -> usize {
        self.state.current_line
    }

    /// Marks progress through the script; returns the current line.
    pub fn check_point(&self) -> usize {
        tracing::debug!(line = self.state.current_line, "script check point");
        self.state.current_line
    }

    /// Sends `message` to the controller's log and keeps it in the run report.
    pub fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.env.log(&message);
        self.state.log.push(message);
    }
}

/// Replays scripts statement by statement. Must be driven from the UI thread.
#[derive(Debug)]
pub struct ScriptEngine {
    phase: Cell<EnginePhase>,
    current_line: Cell<Option<usize>>,
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEngine {
    pub fn new() -> Self {
        Self {
            phase: Cell::new(EnginePhase::Idle),
            current_line: Cell::new(None),
        }
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase.get()
    }

    pub fn is_running(&self) -> bool {
        self.phase.get() == EnginePhase::Running
    }

    /// Line of the statement running now, or where the last run stopped.
    pub fn current_line(&self) -> Option<usize> {
        self.current_line.get()
    }

    pub fn run(&self, script: &Script, env: &dyn ScriptEnv) -> RunReport {
        let mut state = ExecutionState::new();
        let span = tracing::info_span!("script_run", run_id = %state.run_id, script = %script.name());
        let _enter = span.enter();

        self.phase.set(EnginePhase::Running);
        self.current_line.set(None);
        tracing::info!(statements = script.statements().len(), "script started");

        for statement in script.statements() {
            state.current_line = statement.line;
            self.current_line.set(Some(statement.line));
            tracing::debug!(line = statement.line, statement = %statement.text, "executing statement");

            let mut ctx = ScriptContext {
                script_name: script.name(),
                state: &mut state,
                env,
            };
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                env.synthesize(&statement.text, &mut ctx)
            }));
            let failure = match result {
                Ok(Ok(())) => continue,
                Ok(Err(message)) if message.is_empty() => {
                    format!("statement at line {} failed", statement.line)
                }
                Ok(Err(message)) => message,
                Err(payload) => format!(
                    "statement at line {} panicked: {}",
                    statement.line,
                    panic_message(payload.as_ref())
                ),
            };
            tracing::warn!(line = statement.line, error = %failure, "statement failed");
            state.error = failure;
            break;
        }

        let outcome = if state.error.is_empty() {
            if !env.settle() {
                tracing::warn!("settle phase did not finish in time");
            }
            RunOutcome::Succeeded
        } else {
            env.report_error(&state.error);
            RunOutcome::Failed(state.error.clone())
        };
        env.report_end();

        self.phase.set(match outcome {
            RunOutcome::Succeeded => EnginePhase::Succeeded,
            RunOutcome::Failed(_) => EnginePhase::Failed,
        });
        let succeeded = outcome == RunOutcome::Succeeded;
        tracing::info!(line = state.current_line, succeeded, "script finished");

        RunReport {
            run_id: state.run_id,
            script_name: script.name().to_string(),
            outcome,
            current_line: state.current_line,
            log: state.log,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Sent {
        Log(String),
        Error(String),
        End,
        Settled,
    }

    /// Records everything the engine asks of the agent. Statements listed in
    /// `failures` fail with the given message; `panics` panics.
    #[derive(Default)]
    struct RecordingEnv {
        executed: RefCell<Vec<String>>,
        sent: RefCell<Vec<Sent>>,
        failures: Vec<(&'static str, &'static str)>,
    }

    impl ScriptEnv for RecordingEnv {
        fn synthesize(&self, statement: &str, ctx: &mut ScriptContext<'_>) -> EffectResult {
            self.executed.borrow_mut().push(statement.to_string());
            if statement == "panics" {
                panic!("widget vanished");
            }
            if let Some(rest) = statement.strip_prefix("log:") {
                ctx.log(rest.to_string());
            }
            match self.failures.iter().find(|(s, _)| *s == statement) {
                Some((_, msg)) => Err(msg.to_string()),
                None => Ok(()),
            }
        }

        fn log(&self, line: &str) {
            self.sent.borrow_mut().push(Sent::Log(line.to_string()));
        }

        fn settle(&self) -> bool {
            self.sent.borrow_mut().push(Sent::Settled);
            true
        }

        fn report_error(&self, message: &str) {
            self.sent.borrow_mut().push(Sent::Error(message.to_string()));
        }

        fn report_end(&self) {
            self.sent.borrow_mut().push(Sent::End);
        }
    }

    #[test]
    fn failing_assertion_stops_the_script() {
        let env = RecordingEnv {
            failures: vec![("assertTextEquals(lbl1,'hi')", "mismatch: got 'bye'")],
            ..Default::default()
        };
        let engine = ScriptEngine::new();
        let script = Script::from_statements(
            "scenario",
            ["click(btn1)", "assertTextEquals(lbl1,'hi')", "click(btn2)"],
        );

        let report = engine.run(&script, &env);

        assert_eq!(report.outcome, RunOutcome::Failed("mismatch: got 'bye'".into()));
        assert_eq!(report.current_line, 2);
        assert_eq!(engine.current_line(), Some(2));
        assert_eq!(engine.phase(), EnginePhase::Failed);
        assert_eq!(
            *env.executed.borrow(),
            vec!["click(btn1)", "assertTextEquals(lbl1,'hi')"]
        );
        assert_eq!(
            *env.sent.borrow(),
            vec![Sent::Error("mismatch: got 'bye'".into()), Sent::End]
        );
    }

    #[test]
    fn success_settles_then_ends() {
        let env = RecordingEnv::default();
        let engine = ScriptEngine::new();
        let script = Script::new("ok", "click(a)\nlog:clicked a\n\nclick(b)");

        let report = engine.run(&script, &env);

        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.current_line, 4);
        assert_eq!(report.log, vec!["clicked a".to_string()]);
        assert_eq!(
            *env.sent.borrow(),
            vec![Sent::Log("clicked a".into()), Sent::Settled, Sent::End]
        );
        assert_eq!(engine.phase(), EnginePhase::Succeeded);
    }

    #[test]
    fn panicking_statement_is_a_failure() {
        let env = RecordingEnv::default();
        let engine = ScriptEngine::new();
        let report = engine.run(&Script::from_statements("p", ["click(a)", "panics", "click(b)"]), &env);

        match report.outcome {
            RunOutcome::Failed(msg) => assert!(msg.contains("widget vanished"), "{msg}"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(env.executed.borrow().len(), 2);
        assert_eq!(env.sent.borrow().last(), Some(&Sent::End));
    }

    #[test]
    fn empty_failure_message_still_fails() {
        let env = RecordingEnv {
            failures: vec![("click(x)", "")],
            ..Default::default()
        };
        let report = ScriptEngine::new().run(&Script::new("e", "click(x)"), &env);
        assert_eq!(report.outcome, RunOutcome::Failed("statement at line 1 failed".into()));
    }

    #[test]
    fn exactly_one_end_per_run() {
        let env = RecordingEnv {
            failures: vec![("bad", "boom")],
            ..Default::default()
        };
        let engine = ScriptEngine::new();
        for body in ["good", "bad", "", "good\nbad\ngood"] {
            env.sent.borrow_mut().clear();
            engine.run(&Script::new("r", body), &env);
            let ends = env.sent.borrow().iter().filter(|s| **s == Sent::End).count();
            assert_eq!(ends, 1, "body {body:?}");
            assert_eq!(env.sent.borrow().last(), Some(&Sent::End));
        }
    }
}
