use serde::{Deserialize, Serialize};

use crate::errors::{MonkeyError, MonkeyResult};
use crate::script::Script;

/// One discrete protocol message exchanged between agent and controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Controller asks the agent to replay a script.
    RunScript(Script),
    /// A user action observed in the target, in script form.
    UserEvent(String),
    ScriptError(String),
    /// Sent exactly once after every run, whatever its outcome.
    ScriptEnd,
    ScriptLog(String),
    /// A complete object that could not be understood; carries the raw text.
    /// Only ever produced by the parser.
    ProtocolViolation(String),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::RunScript(_) => PacketKind::RunScript,
            Packet::UserEvent(_) => PacketKind::UserEvent,
            Packet::ScriptError(_) => PacketKind::ScriptError,
            Packet::ScriptEnd => PacketKind::ScriptEnd,
            Packet::ScriptLog(_) => PacketKind::ScriptLog,
            Packet::ProtocolViolation(_) => PacketKind::ProtocolViolation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    RunScript,
    UserEvent,
    ScriptError,
    ScriptEnd,
    ScriptLog,
    ProtocolViolation,
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PacketKind::RunScript => "runScript",
            PacketKind::UserEvent => "newUserAppEvent",
            PacketKind::ScriptError => "scriptError",
            PacketKind::ScriptEnd => "scriptEnd",
            PacketKind::ScriptLog => "scriptLog",
            PacketKind::ProtocolViolation => "protocolViolation",
        };
        f.write_str(name)
    }
}

/// On-the-wire shape of a packet: a JSON object tagged by `cmd`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub(crate) enum WireMessage {
    RunScript {
        script: String,
        #[serde(default, rename = "scriptFileName")]
        script_file_name: String,
    },
    NewUserAppEvent {
        data: String,
    },
    ScriptError {
        data: String,
    },
    ScriptEnd,
    ScriptLog {
        data: String,
    },
}

impl From<WireMessage> for Packet {
    fn from(msg: WireMessage) -> Self {
        match msg {
            WireMessage::RunScript {
                script,
                script_file_name,
            } => Packet::RunScript(Script::new(script_file_name, script)),
            WireMessage::NewUserAppEvent { data } => Packet::UserEvent(data),
            WireMessage::ScriptError { data } => Packet::ScriptError(data),
            WireMessage::ScriptEnd => Packet::ScriptEnd,
            WireMessage::ScriptLog { data } => Packet::ScriptLog(data),
        }
    }
}

impl TryFrom<&Packet> for WireMessage {
    type Error = MonkeyError;

    fn try_from(packet: &Packet) -> MonkeyResult<Self> {
        Ok(match packet {
            Packet::RunScript(script) => WireMessage::RunScript {
                script: script.body().to_string(),
                script_file_name: script.name().to_string(),
            },
            Packet::UserEvent(data) => WireMessage::NewUserAppEvent { data: data.clone() },
            Packet::ScriptError(data) => WireMessage::ScriptError { data: data.clone() },
            Packet::ScriptEnd => WireMessage::ScriptEnd,
            Packet::ScriptLog(data) => WireMessage::ScriptLog { data: data.clone() },
            Packet::ProtocolViolation(raw) => {
                return Err(MonkeyError::Protocol(format!(
                    "refusing to encode a protocol violation: {raw}"
                )))
            }
        })
    }
}

/// Serializes a packet to its wire bytes, newline-terminated.
pub fn encode(packet: &Packet) -> MonkeyResult<Vec<u8>> {
    let wire = WireMessage::try_from(packet)?;
    let mut bytes = serde_json::to_vec(&wire)?;
    bytes.push(b'\n');
    Ok(bytes)
}
