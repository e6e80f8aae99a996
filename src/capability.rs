use std::time::Duration;

use crate::script::ScriptContext;

/// Outcome of replaying one statement; `Err` carries the message reported
/// to the controller verbatim.
pub type EffectResult = Result<(), String>;

/// Toolkit adapter the agent drives on the UI thread.
///
/// Implementations translate native UI events to script statements and back.
/// They live on the UI thread only, so no `Send` bound.
pub trait UiCapability {
    /// Next user action observed since the last call, in script form.
    fn observe_event(&mut self) -> Option<String>;

    /// Replays one statement against the live widget tree.
    fn synthesize_event(&mut self, statement: &str, ctx: &mut ScriptContext<'_>) -> EffectResult;

    /// Lets the toolkit deliver its own pending events for up to `max_time`.
    fn process_native_events(&mut self, _max_time: Duration) {}
}
