mod background;
mod core;
mod sender;
mod ui;

pub use self::background::{abort_process, FatalHook};
pub use self::core::{AgentCore, AGENT_THREAD_NAME};
pub use self::sender::PacketSender;
pub use self::ui::AgentUi;
