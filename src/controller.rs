//! Controller end of the agent protocol.
//!
//! The controller listens, the agent inside the target application connects.
//! A session sends run-script requests and collects what the agent reports.

use std::collections::VecDeque;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::errors::{MonkeyError, MonkeyResult};
use crate::protocol::{Packet, PacketBuffer};
use crate::script::Script;
use crate::transport::{LinkReader, LinkWriter, TcpLink};

const READ_CHUNK_BYTES: usize = 4096;

pub struct ControllerListener {
    listener: TcpListener,
}

impl ControllerListener {
    pub async fn bind(address: impl ToSocketAddrs) -> MonkeyResult<Self> {
        let listener = TcpListener::bind(address).await?;
        tracing::info!(address = %listener.local_addr()?, "controller listening");
        Ok(Self { listener })
    }

    /// Address to hand to the agent, e.g. through `UIMONKEY_CONTROLLER_ADDR`.
    pub fn local_addr(&self) -> MonkeyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Waits for the next agent to connect.
    pub async fn accept(&self) -> MonkeyResult<ControllerSession> {
        let (stream, peer) = self.listener.accept().await?;
        tracing::info!(%peer, "agent connected");
        ControllerSession::from_tcp(stream, peer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEventKind {
    /// A recorded user action, already in script form.
    UserEvent(String),
    Log(String),
    Error(String),
    ScriptEnd,
}

#[derive(Debug, Clone)]
pub struct ControllerEvent {
    pub kind: ControllerEventKind,
    pub received_at: DateTime<Utc>,
}

/// Everything the agent reported for one script run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptTranscript {
    pub user_events: Vec<String>,
    pub logs: Vec<String>,
    pub error: Option<String>,
}

impl ScriptTranscript {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

pub struct ControllerSession {
    peer: SocketAddr,
    reader: LinkReader<OwnedReadHalf>,
    writer: LinkWriter<OwnedWriteHalf>,
    buffer: PacketBuffer,
    pending: VecDeque<Packet>,
    chunk: Vec<u8>,
}

impl ControllerSession {
    fn from_tcp(stream: TcpStream, peer: SocketAddr) -> MonkeyResult<Self> {
        let (reader, writer) = TcpLink::from_tcp(stream)?.into_split();
        Ok(Self {
            peer,
            reader,
            writer,
            buffer: PacketBuffer::new(),
            pending: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK_BYTES],
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn run_script(&mut self, name: &str, body: &str) -> MonkeyResult<()> {
        let script = Script::new(name, body);
        tracing::info!(script = name, statements = script.statements().len(), "sending script");
        self.writer.send_packet(&Packet::RunScript(script)).await
    }

    /// Next report from the agent; `None` once the agent hung up.
    pub async fn next_event(&mut self) -> MonkeyResult<Option<ControllerEvent>> {
        loop {
            if let Some(packet) = self.pending.pop_front() {
                return to_event(packet).map(Some);
            }
            let n = self.reader.read_available(&mut self.chunk).await?;
            if n == 0 {
                if self.buffer.pending_len() > 0 {
                    tracing::warn!(bytes = self.buffer.pending_len(), "agent left a partial packet");
                }
                tracing::info!(peer = %self.peer, "agent disconnected");
                return Ok(None);
            }
            self.buffer.extend(&self.chunk[..n]);
            self.pending.extend(self.buffer.drain_packets());
        }
    }

    /// Collects reports until the agent ends the current script.
    pub async fn wait_script_end(&mut self) -> MonkeyResult<ScriptTranscript> {
        let mut transcript = ScriptTranscript::default();
        while let Some(event) = self.next_event().await? {
            match event.kind {
                ControllerEventKind::UserEvent(statement) => transcript.user_events.push(statement),
                ControllerEventKind::Log(line) => transcript.logs.push(line),
                ControllerEventKind::Error(message) => transcript.error = Some(message),
                ControllerEventKind::ScriptEnd => return Ok(transcript),
            }
        }
        Err(MonkeyError::Connection(
            "agent disconnected before the script ended".into(),
        ))
    }
}

fn to_event(packet: Packet) -> MonkeyResult<ControllerEvent> {
    let kind = match packet {
        Packet::UserEvent(statement) => ControllerEventKind::UserEvent(statement),
        Packet::ScriptLog(line) => ControllerEventKind::Log(line),
        Packet::ScriptError(message) => ControllerEventKind::Error(message),
        Packet::ScriptEnd => ControllerEventKind::ScriptEnd,
        Packet::ProtocolViolation(raw) => {
            return Err(MonkeyError::Protocol(format!(
                "problem with monkey<->controller protocol: {raw}"
            )))
        }
        Packet::RunScript(script) => {
            return Err(MonkeyError::Protocol(format!(
                "problem with monkey<->controller protocol: agent sent script '{}'",
                script.name()
            )))
        }
    };
    Ok(ControllerEvent {
        kind,
        received_at: Utc::now(),
    })
}
