pub mod agent;
pub mod capability;
pub mod config;
pub mod controller;
pub mod errors;
pub mod invoker;
pub mod protocol;
pub mod script;
pub mod transport;

pub use agent::{abort_process, AgentCore, AgentUi, FatalHook, PacketSender};
pub use capability::{EffectResult, UiCapability};
pub use config::{load_config, AgentConfig};
pub use errors::{MonkeyError, MonkeyResult};
pub use invoker::{UiInvoker, UiReceiver};
pub use protocol::Packet;
pub use script::{Script, ScriptContext};

/// Installs the fmt subscriber, filtered by `RUST_LOG` (default `info`).
/// Does nothing if the host application already installed one.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
